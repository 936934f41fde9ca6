//! Built-in value fixers.
//!
//! A fixer takes the value and the extra arguments from its
//! configuration entry, and returns the normalized value.

use serde_json::{json, Value};

use super::Fixer;

/// Collapse floats with an integral value (`2.0` becomes `2`), so
/// such values do not fork the identity hash.
fn int_floats(value: Value, _args: &[Value]) -> Value {
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) && value.is_f64() {
            return json!(f as i64);
        }
    }
    value
}

/// Round a float to `args[0]` decimal digits (0 when absent).
fn round(value: Value, args: &[Value]) -> Value {
    let digits = args.first().and_then(|a| a.as_u64()).unwrap_or(0) as i32;
    if let Some(f) = value.as_f64() {
        if value.is_f64() {
            let factor = 10f64.powi(digits);
            return json!((f * factor).round() / factor);
        }
    }
    value
}

/// Registered under the conventional `fixer_NAME` names.
pub const BUILTINS: &[(&str, Fixer)] = &[("fixer_intFloats", int_floats), ("fixer_round", round)];
