//! Small, deterministic helpers shared across the pipeline.
//!
//! No business logic belongs here — only time, address validation, and
//! decimal rounding utilities that every layer needs.

use rust_decimal::Decimal;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX_EPOCH")
        .as_millis() as i64
}

/// Validates that `s` is a 42-character `0x`-prefixed hex address.
pub fn is_valid_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Clamps `value` to `[lo, hi]`.
pub fn clamp_decimal(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn validates_address_shape() {
        assert!(is_valid_address(
            "0x1234567890123456789012345678901234567890"
        ));
        assert!(!is_valid_address("0x123")); // too short
        assert!(!is_valid_address(
            "1234567890123456789012345678901234567890ab"
        )); // missing 0x
        assert!(!is_valid_address(
            "0xzz34567890123456789012345678901234567890"
        )); // non-hex
    }

    #[test]
    fn clamps_into_range() {
        assert_eq!(clamp_decimal(dec!(1.5), dec!(0), dec!(1)), dec!(1));
        assert_eq!(clamp_decimal(dec!(-0.5), dec!(0), dec!(1)), dec!(0));
        assert_eq!(clamp_decimal(dec!(0.3), dec!(0), dec!(1)), dec!(0.3));
    }
}
