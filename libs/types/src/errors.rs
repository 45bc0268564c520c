//! Error types for the capture service
//!
//! Error taxonomy using thiserror. Transport faults never appear here: they
//! belong to the feed supervisor and only surface as a channel close.

use thiserror::Error;

use crate::ids::ChannelId;

/// Failures converting exchange-native encodings into exact values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),

    #[error("Decimal underflows to zero: {0}")]
    Underflow(String),

    #[error("Invalid integer: {0}")]
    InvalidInteger(String),

    #[error("Expected a number or numeric string, got {0}")]
    NotNumeric(String),

    #[error("Epoch milliseconds out of range: {0}")]
    TimestampOutOfRange(i64),
}

/// Protocol faults: the stream's framing contract was violated
///
/// Fatal to the affected channel's processing. Never recovered from locally,
/// continuing would risk corrupting episode grouping.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Data event for unknown channel: {channel_id}")]
    UnknownChannel { channel_id: ChannelId },

    #[error("Subscription acknowledged for unsupported channel: {channel}")]
    UnknownSubscription { channel: String },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Numeric field error: {0}")]
    Numeric(#[from] NumericError),
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }
}

/// Storage faults reported by a sink
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Insert into {table} failed: {reason}")]
    Insert { table: String, reason: String },

    #[error("Bulk insert of {rows} rows into {table} failed: {reason}")]
    BulkInsert {
        table: String,
        rows: usize,
        reason: String,
    },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Invalid configuration values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_from_numeric() {
        let err: ProtocolError = NumericError::InvalidDecimal("abc".to_string()).into();
        assert!(matches!(err, ProtocolError::Numeric(_)));
        assert_eq!(err.to_string(), "Numeric field error: Invalid decimal: abc");
    }

    #[test]
    fn test_unknown_channel_display() {
        let err = ProtocolError::UnknownChannel {
            channel_id: ChannelId::new(1234),
        };
        assert_eq!(err.to_string(), "Data event for unknown channel: 1234");
    }

    #[test]
    fn test_bulk_insert_error_display() {
        let err = StorageError::BulkInsert {
            table: "transient_raw_book_events".to_string(),
            rows: 1001,
            reason: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("1001 rows"));
        assert!(err.to_string().contains("connection reset"));
    }
}
