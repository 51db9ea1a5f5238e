//! Kubernetes quantity strings (`"500m"`, `"8Gi"`, `"1e3"`) to integral units.

use core::error::Error;

use error_stack::Report;
use error_stack::ResultExt;

/// Extended resource name under which nodes advertise and pods request GPUs.
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

#[derive(Debug, derive_more::Display)]
#[display("Invalid quantity {input:?}: {reason}")]
pub struct QuantityError {
    pub input: String,
    pub reason: &'static str,
}

impl Error for QuantityError {}

impl QuantityError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Parse a CPU quantity into millicores. `"500m"` → 500, `"4"` → 4000, `"1.5"` → 1500.
pub fn parse_cpu_millis(value: &str) -> Result<u64, Report<QuantityError>> {
    let cores = parse_scaled(value)?;
    to_units(value, cores * 1000.0)
}

/// Parse a memory quantity into bytes.
///
/// Supports the following suffixes:
/// - Binary: "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"
/// - Decimal: "k", "M", "G", "T", "P", "E"
/// - Exponent: "1e3", "12E6"
/// - No suffix: plain bytes
pub fn parse_memory_bytes(value: &str) -> Result<u64, Report<QuantityError>> {
    let bytes = parse_scaled(value)?;
    to_units(value, bytes)
}

/// Parse a countable extended resource (e.g. `nvidia.com/gpu`). Fractions are rejected.
pub fn parse_count(value: &str) -> Result<u64, Report<QuantityError>> {
    let count = parse_scaled(value)?;
    if count.fract() != 0.0 {
        return Err(Report::new(QuantityError::new(
            value,
            "countable resources must be whole numbers",
        )));
    }
    to_units(value, count)
}

fn parse_scaled(value: &str) -> Result<f64, Report<QuantityError>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Report::new(QuantityError::new(value, "empty value")));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(trimmed.len());
    let (numeric_part, suffix) = trimmed.split_at(split);

    let number = numeric_part
        .parse::<f64>()
        .change_context(QuantityError::new(value, "invalid numeric part"))?;
    if !number.is_finite() {
        return Err(Report::new(QuantityError::new(value, "not a finite number")));
    }
    if number < 0.0 {
        return Err(Report::new(QuantityError::new(value, "negative quantity")));
    }

    Ok(number * multiplier(value, suffix)?)
}

fn multiplier(value: &str, suffix: &str) -> Result<f64, Report<QuantityError>> {
    const KI: f64 = 1024.0;
    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => KI,
        "Mi" => KI.powi(2),
        "Gi" => KI.powi(3),
        "Ti" => KI.powi(4),
        "Pi" => KI.powi(5),
        "Ei" => KI.powi(6),
        _ => {
            let exponent = suffix
                .strip_prefix(['e', 'E'])
                .and_then(|exp| exp.parse::<i32>().ok())
                .ok_or_else(|| Report::new(QuantityError::new(value, "unsupported suffix")))?;
            10f64.powi(exponent)
        }
    };
    Ok(multiplier)
}

fn to_units(value: &str, scaled: f64) -> Result<u64, Report<QuantityError>> {
    if !scaled.is_finite() || scaled >= u64::MAX as f64 {
        return Err(Report::new(QuantityError::new(value, "out of range")));
    }
    // Absorb float noise like 0.1 * 1000 = 100.00000000000001 before rounding up.
    let rounded = scaled.round();
    let units = if (scaled - rounded).abs() < 1e-6 {
        rounded
    } else {
        scaled.ceil()
    };
    Ok(units as u64)
}
