//! Resource quantities
//!
//! Parses Kubernetes quantity strings ("10Gi", "500M", "1.5Ti", "1e3") into a
//! byte count, rounding fractional results up.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a quantity string into bytes
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::QuantityParse("empty quantity string".into()));
    }

    // Find where the number ends and the suffix begins
    let num_end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let suffix = &s[num_end..];

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::QuantityParse(format!("invalid number: {}", num_str)))?;
    if num < 0.0 {
        return Err(Error::QuantityParse(format!("negative quantity: {}", s)));
    }

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..]
                .parse()
                .map_err(|_| Error::QuantityParse(format!("invalid exponent: {}", exp)))?;
            10f64.powi(power)
        }
        other => {
            return Err(Error::QuantityParse(format!("unknown suffix: {}", other)));
        }
    };

    let value = (num * multiplier).ceil();
    if value > u64::MAX as f64 {
        return Err(Error::QuantityParse(format!("quantity out of range: {}", s)));
    }
    Ok(value as u64)
}

/// Byte count of a `Quantity`
pub fn quantity_bytes(quantity: &Quantity) -> Result<u64> {
    parse_quantity(&quantity.0)
}
