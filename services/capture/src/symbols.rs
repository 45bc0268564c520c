//! Periodic instrument metadata refresh
//!
//! Polls the exchange's symbol details endpoint and hands every entry to a
//! [`SymbolStore`]. Runs as its own task: failures are logged and the next
//! tick tries again, nothing here reaches the feed's error path.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use types::errors::StorageError;
use types::numeric::decimal_from_value;

use crate::config::SymbolRefreshConfig;

/// Trading rules of one pair as published by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SymbolDetails {
    pub pair: String,
    pub price_precision: i32,
    #[serde(deserialize_with = "exact_decimal")]
    pub initial_margin: Decimal,
    #[serde(deserialize_with = "exact_decimal")]
    pub minimum_margin: Decimal,
    #[serde(deserialize_with = "exact_decimal")]
    pub maximum_order_size: Decimal,
    #[serde(deserialize_with = "exact_decimal")]
    pub minimum_order_size: Decimal,
    pub expiration: String,
    pub margin: bool,
}

fn exact_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    decimal_from_value(&value).map_err(serde::de::Error::custom)
}

#[async_trait]
pub trait SymbolStore: Send + Sync {
    /// Store the details; returns true when anything changed.
    async fn update_symbol_details(&self, details: &SymbolDetails) -> Result<bool, StorageError>;
}

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Symbol details request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outcome of one refresh round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub fetched: usize,
    pub updated: usize,
    pub failed: usize,
}

pub async fn fetch_symbol_details(client: &Client, url: &str) -> Result<Vec<SymbolDetails>, RefreshError> {
    let details = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<SymbolDetails>>()
        .await?;
    Ok(details)
}

/// Fetch once and store every entry; a failed store is logged and skipped.
pub async fn refresh_once(
    client: &Client,
    url: &str,
    store: &dyn SymbolStore,
) -> Result<RefreshReport, RefreshError> {
    let details = fetch_symbol_details(client, url).await?;
    let mut report = RefreshReport {
        fetched: details.len(),
        ..RefreshReport::default()
    };

    for entry in &details {
        match store.update_symbol_details(entry).await {
            Ok(true) => {
                report.updated += 1;
                info!(pair = %entry.pair, details = ?entry, "Updated symbol details");
            }
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                error!(pair = %entry.pair, error = %e, "Failed to store symbol details");
            }
        }
    }

    Ok(report)
}

/// Refresh every `config.interval` until shutdown is signalled.
pub async fn run_refresh(
    config: SymbolRefreshConfig,
    store: Arc<dyn SymbolStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(url = %config.url, interval_secs = config.interval.as_secs(), "Symbol refresh started");

    let client = Client::new();
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                match refresh_once(&client, &config.url, store.as_ref()).await {
                    Ok(report) => debug!(
                        fetched = report.fetched,
                        updated = report.updated,
                        failed = report.failed,
                        "Symbol refresh done"
                    ),
                    Err(e) => error!(error = %e, "Symbol refresh failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Symbol refresh stopped");
}
