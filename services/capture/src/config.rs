//! Service configuration
//!
//! Every setting has a default and can be overridden by an environment
//! variable. Loading goes through a lookup function so tests never touch
//! the process environment.

use std::str::FromStr;
use std::time::Duration;

use types::book::DeletionSentinel;
use types::errors::ConfigError;
use types::ids::PairId;

use crate::book::BookSettings;
use crate::buffer::{FlushPolicy, DEFAULT_FLUSH_THRESHOLD};

/// Exchange feed connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub url: String,
    /// Pair without the trading prefix, e.g. `BTCUSD`.
    pub pair: String,
    pub book_precision: String,
    pub book_length: u32,
    pub reconnect_delay: Duration,
    /// A connection with no frame for this long is considered dead.
    pub stale_after: Duration,
}

impl FeedConfig {
    /// Symbol used in subscribe requests.
    pub fn symbol(&self) -> String {
        format!("t{}", self.pair)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://api-pub.bitfinex.com/ws/2".to_string(),
            pair: "BTCUSD".to_string(),
            book_precision: "R0".to_string(),
            book_length: 100,
            reconnect_delay: Duration::from_secs(5),
            stale_after: Duration::from_secs(20),
        }
    }
}

/// Postgres connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_url: String,
    /// Schema holding the capture tables.
    pub schema: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/obanalytics".to_string(),
            schema: "bitfinex".to_string(),
            max_connections: 4,
        }
    }
}

/// Instrument metadata polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRefreshConfig {
    pub url: String,
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for SymbolRefreshConfig {
    fn default() -> Self {
        Self {
            url: "https://api.bitfinex.com/v1/symbols_details".to_string(),
            interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub feed: FeedConfig,
    pub pair_id: PairId,
    pub book: BookSettings,
    pub storage: StorageConfig,
    pub symbols: SymbolRefreshConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let feed = FeedConfig::default();
        let book = BookSettings {
            sentinel: sentinel_for_precision(&feed.book_precision),
            ..BookSettings::default()
        };
        Self {
            feed,
            pair_id: PairId::new(1),
            book,
            storage: StorageConfig::default(),
            symbols: SymbolRefreshConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; absent keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        let feed = FeedConfig {
            url: text("CAPTURE_WS_URL", defaults.feed.url),
            pair: text("CAPTURE_PAIR", defaults.feed.pair),
            book_precision: text("CAPTURE_BOOK_PRECISION", defaults.feed.book_precision),
            book_length: parsed(&lookup, "CAPTURE_BOOK_LENGTH", defaults.feed.book_length)?,
            reconnect_delay: seconds(&lookup, "CAPTURE_RECONNECT_DELAY_SECS", defaults.feed.reconnect_delay)?,
            stale_after: seconds(&lookup, "CAPTURE_STALE_AFTER_SECS", defaults.feed.stale_after)?,
        };

        let book = BookSettings {
            flush: FlushPolicy::new(parsed(&lookup, "CAPTURE_FLUSH_THRESHOLD", DEFAULT_FLUSH_THRESHOLD)?),
            sentinel: match lookup("CAPTURE_DELETION_SENTINEL") {
                Some(value) => parse_sentinel("CAPTURE_DELETION_SENTINEL", &value, &feed.book_precision)?,
                None => sentinel_for_precision(&feed.book_precision),
            },
        };

        let storage = StorageConfig {
            database_url: text("DATABASE_URL", defaults.storage.database_url),
            schema: validate_identifier("CAPTURE_DB_SCHEMA", text("CAPTURE_DB_SCHEMA", defaults.storage.schema))?,
            max_connections: parsed(&lookup, "CAPTURE_DB_MAX_CONNECTIONS", defaults.storage.max_connections)?,
        };

        let symbols = SymbolRefreshConfig {
            url: text("CAPTURE_SYMBOLS_URL", defaults.symbols.url),
            interval: seconds(&lookup, "CAPTURE_SYMBOLS_INTERVAL_SECS", defaults.symbols.interval)?,
            enabled: match lookup("CAPTURE_SYMBOLS_ENABLED") {
                Some(value) => parse_flag("CAPTURE_SYMBOLS_ENABLED", &value)?,
                None => defaults.symbols.enabled,
            },
        };

        Ok(Self {
            feed,
            pair_id: PairId::new(parsed(&lookup, "CAPTURE_PAIR_ID", defaults.pair_id.get())?),
            book,
            storage,
            symbols,
        })
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| invalid(key, &value)),
        None => Ok(default),
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default.as_secs()).map(Duration::from_secs)
}

/// Raw books (`R0`) delete an order by sending it with price zero; the
/// amount keeps its side.
pub fn sentinel_for_precision(precision: &str) -> DeletionSentinel {
    if precision.trim().eq_ignore_ascii_case("R0") {
        DeletionSentinel::ZeroPrice
    } else {
        DeletionSentinel::default()
    }
}

fn parse_sentinel(key: &str, value: &str, precision: &str) -> Result<DeletionSentinel, ConfigError> {
    let sentinel = match value.trim().to_ascii_lowercase().as_str() {
        "amount" => DeletionSentinel::ZeroAmount,
        "price" => DeletionSentinel::ZeroPrice,
        _ => return Err(invalid(key, value)),
    };
    // A zero-amount rule never matches a raw-book deletion
    if sentinel == DeletionSentinel::ZeroAmount && sentinel_for_precision(precision) == DeletionSentinel::ZeroPrice {
        return Err(invalid(key, value));
    }
    Ok(sentinel)
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// The schema is spliced into SQL text, so only plain identifiers pass.
fn validate_identifier(key: &str, value: String) -> Result<String, ConfigError> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(value)
    } else {
        Err(invalid(key, &value))
    }
}
