//! Postgres storage sink
//!
//! Single rows go out as one statement each. A bulk insert runs one or more
//! multi-row `INSERT ... VALUES` statements, chunked below the bind
//! parameter limit, inside a single transaction that commits once.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};
use types::book::BookRow;
use types::errors::StorageError;

use crate::config::StorageConfig;
use crate::sink::{Row, StorageSink, Table, EPISODE_MARKERS, TRADES};
use crate::symbols::{SymbolDetails, SymbolStore};

/// Postgres limit on bind parameters in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

const APPLICATION_NAME: &str = "BITFINEX";

pub struct PgSink {
    pool: PgPool,
    schema: String,
    trade_sql: String,
    marker_sql: String,
    symbol_sql: String,
}

impl PgSink {
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        let options: PgConnectOptions = config
            .database_url
            .parse()
            .map_err(|e: sqlx::Error| unavailable(&e))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options.application_name(APPLICATION_NAME))
            .await
            .map_err(|e| unavailable(&e))?;

        info!(
            schema = %config.schema,
            max_connections = config.max_connections,
            "Connected to Postgres"
        );
        Ok(Self::with_pool(pool, &config.schema))
    }

    /// Wrap an existing pool. `schema` must be a plain identifier.
    pub fn with_pool(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            trade_sql: insert_sql(schema, &TRADES),
            marker_sql: insert_sql(schema, &EPISODE_MARKERS),
            symbol_sql: format!("select {schema}.update_symbol_details($1, $2, $3, $4, $5, $6, $7, $8)"),
        }
    }
}

#[async_trait]
impl StorageSink for PgSink {
    async fn insert_row(&self, row: &Row) -> Result<(), StorageError> {
        let result = match row {
            Row::Trade(trade) => {
                sqlx::query(&self.trade_sql)
                    .bind(trade.trade_id.get())
                    .bind(trade.quantity)
                    .bind(trade.price)
                    .bind(trade.receive_timestamp)
                    .bind(trade.exchange_timestamp)
                    .bind(trade.pair_id.get())
                    .bind(trade.channel_id.get())
                    .execute(&self.pool)
                    .await
            }
            Row::EpisodeMarker(marker) => {
                sqlx::query(&self.marker_sql)
                    .bind(marker.episode_timestamp)
                    .bind(marker.pair_id.get())
                    .bind(marker.channel_id.get())
                    .execute(&self.pool)
                    .await
            }
        };

        result.map(|_| ()).map_err(|e| match classify(&e) {
            Some(err) => err,
            None => StorageError::Insert {
                table: row.table().name.to_string(),
                reason: e.to_string(),
            },
        })
    }

    async fn bulk_insert(&self, table: &Table, rows: &[BookRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let bulk_error = |e: sqlx::Error| {
            classify(&e).unwrap_or_else(|| StorageError::BulkInsert {
                table: table.name.to_string(),
                rows: rows.len(),
                reason: e.to_string(),
            })
        };

        let chunk_rows = MAX_BIND_PARAMS / table.columns.len();
        let mut tx = self.pool.begin().await.map_err(&bulk_error)?;

        for chunk in rows.chunks(chunk_rows) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "insert into {}.{} ({}) ",
                self.schema,
                table.name,
                table.columns.join(", ")
            ));
            builder.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.episode_timestamp)
                    .push_bind(row.order_id.get())
                    .push_bind(row.price)
                    .push_bind(row.amount)
                    .push_bind(row.pair_id.get())
                    .push_bind(row.receive_timestamp)
                    .push_bind(row.channel_id.get())
                    .push_bind(row.exchange_timestamp);
            });
            builder.build().execute(&mut *tx).await.map_err(&bulk_error)?;
        }

        tx.commit().await.map_err(&bulk_error)?;
        debug!(table = table.name, rows = rows.len(), "Bulk insert committed");
        Ok(())
    }
}

#[async_trait]
impl SymbolStore for PgSink {
    async fn update_symbol_details(&self, details: &SymbolDetails) -> Result<bool, StorageError> {
        let changed: Option<bool> = sqlx::query_scalar(&self.symbol_sql)
            .bind(&details.pair)
            .bind(details.price_precision)
            .bind(details.initial_margin)
            .bind(details.minimum_margin)
            .bind(details.maximum_order_size)
            .bind(details.minimum_order_size)
            .bind(&details.expiration)
            .bind(details.margin)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                classify(&e).unwrap_or_else(|| StorageError::Insert {
                    table: "symbol_details".to_string(),
                    reason: e.to_string(),
                })
            })?;
        Ok(changed.unwrap_or(false))
    }
}

fn insert_sql(schema: &str, table: &Table) -> String {
    let placeholders: Vec<String> = (1..=table.columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "insert into {schema}.{} ({}) values ({})",
        table.name,
        table.columns.join(", "),
        placeholders.join(", ")
    )
}

fn unavailable(e: &sqlx::Error) -> StorageError {
    StorageError::Unavailable {
        reason: e.to_string(),
    }
}

/// Connection-level failures, as opposed to a rejected statement.
fn classify(e: &sqlx::Error) -> Option<StorageError> {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => Some(unavailable(e)),
        _ => None,
    }
}
