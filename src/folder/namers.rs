//! Built-in namers.
//!
//! A namer takes the setting record (with the name as rewritten by
//! the previous namer in the chain) and the extra arguments from its
//! configuration entry, and returns the effective name.

use serde_json::Value;

use crate::simulation::SettingRecord;

use super::Namer;

fn arg_str(args: &[Value], k: usize) -> &str {
    args.get(k).and_then(|a| a.as_str()).unwrap_or("")
}

/// Append `args[0]` to the name.
fn suffix(setting: &SettingRecord, args: &[Value]) -> String {
    format!("{}{}", setting.name, arg_str(args, 0))
}

/// Prepend `args[0]` to the name.
fn prefix(setting: &SettingRecord, args: &[Value]) -> String {
    format!("{}{}", arg_str(args, 0), setting.name)
}

/// Registered under the conventional `namer_NAME` names.
pub const BUILTINS: &[(&str, Namer)] = &[("namer_prefix", prefix), ("namer_suffix", suffix)];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> SettingRecord {
        SettingRecord {
            name: name.into(),
            value: json!(0),
            exclude: false,
            pattern: "{name}={value}".into(),
        }
    }

    #[test]
    fn t_prefix_suffix() {
        assert_eq!(suffix(&record("n"), &[json!("_iter")]), "n_iter");
        assert_eq!(prefix(&record("n"), &[json!("opt_")]), "opt_n");
        assert_eq!(suffix(&record("n"), &[]), "n");
    }
}
