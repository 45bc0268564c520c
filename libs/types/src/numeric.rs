//! Exact decimal and timestamp normalization
//!
//! The exchange encodes decimals either as JSON strings (when the
//! decimals-as-strings connection flag is set) or as JSON numbers, integers
//! likewise, and timestamps as epoch milliseconds. Numbers are always parsed
//! from their textual form so no binary float rounding leaks into stored
//! prices or amounts.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::NumericError;

/// Timestamps are UTC instants with millisecond exchange precision.
pub type Timestamp = DateTime<Utc>;

/// Parse a decimal from its textual form, accepting scientific notation.
///
/// Digits beyond the 28-digit scale are rounded away by `Decimal`; a
/// non-zero value that would round to zero is rejected, since zero is a
/// deletion marker.
pub fn parse_decimal(text: &str) -> Result<Decimal, NumericError> {
    let text = text.trim();
    let value = Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| NumericError::InvalidDecimal(text.to_string()))?;

    if value.is_zero() && has_nonzero_digit(text) {
        return Err(NumericError::Underflow(text.to_string()));
    }
    Ok(value)
}

/// Whether the significand (before any exponent) has a digit other than 0.
fn has_nonzero_digit(text: &str) -> bool {
    text.chars()
        .take_while(|c| !matches!(c, 'e' | 'E'))
        .any(|c| matches!(c, '1'..='9'))
}

/// Normalize a JSON string or number into an exact decimal.
pub fn decimal_from_value(value: &Value) -> Result<Decimal, NumericError> {
    match value {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        other => Err(NumericError::NotNumeric(other.to_string())),
    }
}

/// Normalize a JSON integer or string-encoded integer.
pub fn integer_from_value(value: &Value) -> Result<i64, NumericError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| NumericError::InvalidInteger(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| NumericError::InvalidInteger(s.clone())),
        other => Err(NumericError::NotNumeric(other.to_string())),
    }
}

/// Convert epoch milliseconds into a timestamp.
pub fn timestamp_from_millis(millis: i64) -> Result<Timestamp, NumericError> {
    DateTime::from_timestamp_millis(millis).ok_or(NumericError::TimestampOutOfRange(millis))
}

/// Normalize a JSON epoch-milliseconds value into a timestamp.
///
/// Some encoders emit millisecond timestamps with a fractional part; it is
/// truncated toward zero.
pub fn timestamp_from_value(value: &Value) -> Result<Timestamp, NumericError> {
    let millis = match value {
        Value::Number(n) if n.is_f64() => {
            let dec = parse_decimal(&n.to_string())?;
            dec.trunc()
                .to_i64()
                .ok_or_else(|| NumericError::InvalidInteger(n.to_string()))?
        }
        other => integer_from_value(other)?,
    };
    timestamp_from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decimal_from_string_is_exact() {
        let d = decimal_from_value(&json!("3714.1")).unwrap();
        assert_eq!(d, Decimal::new(37141, 1));
    }

    #[test]
    fn test_decimal_from_number_keeps_text_form() {
        // 0.1 has no exact binary representation; the textual path keeps it exact
        let d = decimal_from_value(&json!(0.1)).unwrap();
        assert_eq!(d, Decimal::new(1, 1));

        let neg = decimal_from_value(&json!(-0.02)).unwrap();
        assert_eq!(neg, Decimal::new(-2, 2));
    }

    #[test]
    fn test_decimal_scientific_notation() {
        let d = parse_decimal("1.5e-5").unwrap();
        assert_eq!(d, Decimal::new(15, 6));
    }

    #[test]
    fn test_decimal_rejects_garbage() {
        assert!(matches!(
            decimal_from_value(&json!("12a")),
            Err(NumericError::InvalidDecimal(_))
        ));
        assert!(matches!(
            decimal_from_value(&json!([1])),
            Err(NumericError::NotNumeric(_))
        ));
    }

    #[test]
    fn test_decimal_underflow_is_rejected() {
        assert_eq!(
            parse_decimal("0.00000000000000000000000000001"),
            Err(NumericError::Underflow("0.00000000000000000000000000001".to_string()))
        );
        assert!(decimal_from_value(&json!("-0.000000000000000000000000000001")).is_err());

        // Genuine zeros still parse
        assert!(parse_decimal("0").unwrap().is_zero());
        assert!(parse_decimal("0.000").unwrap().is_zero());
        assert!(parse_decimal("0e5").unwrap().is_zero());
    }

    #[test]
    fn test_integer_from_string_and_number() {
        assert_eq!(integer_from_value(&json!(34006478190_i64)).unwrap(), 34006478190);
        assert_eq!(integer_from_value(&json!("401597393")).unwrap(), 401597393);
        assert!(integer_from_value(&json!(1.5)).is_err());
        assert!(integer_from_value(&json!(null)).is_err());
    }

    #[test]
    fn test_timestamp_from_millis() {
        let ts = timestamp_from_millis(1_574_694_478_808).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_574_694_478_808);
        assert_eq!(ts.to_rfc3339(), "2019-11-25T15:07:58.808+00:00");
    }

    #[test]
    fn test_timestamp_out_of_range() {
        assert_eq!(
            timestamp_from_millis(i64::MAX),
            Err(NumericError::TimestampOutOfRange(i64::MAX))
        );
    }

    #[test]
    fn test_timestamp_fractional_millis_truncated() {
        let ts = timestamp_from_value(&json!(1574694478808.9)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_574_694_478_808);
    }

    proptest! {
        #[test]
        fn prop_decimal_string_roundtrip(mantissa in -1_000_000_000i64..1_000_000_000, scale in 0u32..8) {
            let d = Decimal::new(mantissa, scale);
            let parsed = decimal_from_value(&Value::String(d.to_string())).unwrap();
            prop_assert_eq!(parsed, d);
        }
    }
}
