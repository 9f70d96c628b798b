//! Type coercion table
//!
//! Every key the hook knows about is listed here with its expected type and
//! default. Values arrive from YAML (native types) or from migrated INI files
//! (everything a string); [`coerce_value`] normalizes both to one shape.

use serde_yaml::Value;

use super::literal::parse_literal;
use crate::{HookError, Result};

/// Expected type of a known configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Plain string, passed through
    Str,
    /// Integer; unparsable input is a fatal config error
    Int,
    /// Normalized to the literal strings "yes" / "no"
    YesNo,
    /// Mapping / sequence, parsed from text when needed
    Literal,
}

/// One row of the coercion table
#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub key: &'static str,
    pub kind: ValueKind,
    /// Raw default; `None` means the key stays absent unless configured
    pub default: Option<&'static str>,
}

const fn spec(key: &'static str, kind: ValueKind, default: Option<&'static str>) -> KeySpec {
    KeySpec { key, kind, default }
}

/// Known keys, their types and defaults
pub const CONFIG_SCHEMA: &[KeySpec] = &[
    spec("secrets", ValueKind::Str, None),
    spec("base_data_path", ValueKind::Str, Some("/var/lib/zmeventnotification")),
    spec("image_path", ValueKind::Str, Some("${base_data_path}/images")),
    spec("portal", ValueKind::Str, Some("")),
    spec("api_portal", ValueKind::Str, Some("")),
    spec("user", ValueKind::Str, None),
    spec("password", ValueKind::Str, None),
    spec("allow_self_signed", ValueKind::YesNo, Some("yes")),
    spec("wait", ValueKind::Int, Some("0")),
    spec("cpu_max_processes", ValueKind::Int, Some("1")),
    spec("gpu_max_processes", ValueKind::Int, Some("1")),
    spec("tpu_max_processes", ValueKind::Int, Some("1")),
    spec("cpu_max_lock_wait", ValueKind::Int, Some("120")),
    spec("gpu_max_lock_wait", ValueKind::Int, Some("120")),
    spec("tpu_max_lock_wait", ValueKind::Int, Some("120")),
    spec("poly_thickness", ValueKind::Int, Some("2")),
    spec("poly_color", ValueKind::Literal, Some("(255,255,255)")),
    spec("show_percent", ValueKind::YesNo, Some("no")),
    spec("write_image_to_zm", ValueKind::YesNo, Some("yes")),
    spec("write_debug_image", ValueKind::YesNo, Some("no")),
    spec("import_zm_zones", ValueKind::YesNo, Some("no")),
    spec("only_triggered_zm_zones", ValueKind::YesNo, Some("no")),
    spec("ml_gateway", ValueKind::Str, None),
    spec("ml_user", ValueKind::Str, None),
    spec("ml_password", ValueKind::Str, None),
    spec("ml_fallback_local", ValueKind::YesNo, Some("no")),
    spec("ml_timeout", ValueKind::Int, Some("60")),
    spec("ml_gateway_mode", ValueKind::Str, Some("image")),
    spec("tag_detected_objects", ValueKind::YesNo, Some("no")),
    spec("create_animation", ValueKind::YesNo, Some("no")),
    spec("animation_types", ValueKind::Str, Some("mp4,gif")),
    spec("event_path_retries", ValueKind::Int, Some("3")),
    spec("event_path_retry_delay", ValueKind::Int, Some("2")),
    spec("pyzm_overrides", ValueKind::Literal, Some("{}")),
    spec("ml_sequence", ValueKind::Literal, None),
    spec("stream_sequence", ValueKind::Literal, None),
];

/// Look up a key in the coercion table
pub fn lookup(key: &str) -> Option<&'static KeySpec> {
    CONFIG_SCHEMA.iter().find(|s| s.key == key)
}

/// Interpret a bool-like value; `None` when it is neither truthy nor falsy
pub fn parse_yes_no(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::Null => Some(false),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "yes" | "true" | "1" => Some(true),
            "no" | "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Whether a value reads as enabled ("yes", "true", "1", true)
pub fn is_truthy(value: &Value) -> bool {
    parse_yes_no(value).unwrap_or(false)
}

fn yes_no(flag: bool) -> Value {
    Value::String(if flag { "yes" } else { "no" }.to_string())
}

/// Convert a raw value to the kind declared for `key`
pub fn coerce_value(key: &str, kind: ValueKind, value: Value) -> Result<Value> {
    match kind {
        ValueKind::Str => Ok(match value {
            Value::String(_) | Value::Null => value,
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => other,
        }),
        ValueKind::Int => match &value {
            Value::Number(n) if n.is_i64() => Ok(value),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Value::Number((f as i64).into()))
                .ok_or_else(|| HookError::config(format!("{} must be an integer, got {}", key, n))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|v| Value::Number(v.into()))
                .map_err(|_| HookError::config(format!("{} must be an integer, got '{}'", key, s))),
            other => Err(HookError::config(format!(
                "{} must be an integer, got {:?}",
                key, other
            ))),
        },
        ValueKind::YesNo => match parse_yes_no(&value) {
            Some(flag) => Ok(yes_no(flag)),
            None => {
                log::warn!("{}: unrecognized value {:?}, treating as 'no'", key, value);
                Ok(yes_no(false))
            }
        },
        ValueKind::Literal => match value {
            Value::String(s) => {
                if s.trim().is_empty() {
                    Ok(Value::Null)
                } else {
                    parse_literal(&s)
                }
            }
            other => Ok(other),
        },
    }
}

/// Raw default for a key as a YAML value, before coercion
pub fn default_value(spec: &KeySpec) -> Option<Value> {
    spec.default.map(|d| Value::String(d.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn test_lookup() {
        let spec = lookup("show_percent").unwrap();
        assert_eq!(spec.kind, ValueKind::YesNo);
        assert_eq!(spec.default, Some("no"));
        assert!(lookup("not_a_key").is_none());
    }

    #[test]
    fn test_int_coercion() {
        assert_eq!(coerce_value("wait", ValueKind::Int, s("5")).unwrap().as_i64(), Some(5));
        assert_eq!(
            coerce_value("wait", ValueKind::Int, Value::Number(3i64.into())).unwrap().as_i64(),
            Some(3)
        );
        assert_eq!(
            coerce_value("wait", ValueKind::Int, Value::Number(2.0f64.into())).unwrap().as_i64(),
            Some(2)
        );
    }

    #[test]
    fn test_int_coercion_invalid_is_fatal() {
        let err = coerce_value("wait", ValueKind::Int, s("soon")).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("wait"));

        assert!(coerce_value("wait", ValueKind::Int, Value::Number(2.5f64.into())).is_err());
    }

    #[test]
    fn test_yes_no_coercion() {
        for raw in [s("yes"), s("Yes"), s("true"), s("1"), Value::Bool(true)] {
            assert_eq!(coerce_value("k", ValueKind::YesNo, raw).unwrap(), s("yes"));
        }
        for raw in [s("no"), s("False"), s("0"), Value::Bool(false), Value::Null] {
            assert_eq!(coerce_value("k", ValueKind::YesNo, raw).unwrap(), s("no"));
        }
        assert_eq!(coerce_value("k", ValueKind::YesNo, s("maybe")).unwrap(), s("no"));
    }

    #[test]
    fn test_only_yes_true_one_are_truthy() {
        for raw in ["yes", "TRUE", "1"] {
            assert!(is_truthy(&s(raw)), "{} should be truthy", raw);
        }
        for raw in ["y", "on", "enabled"] {
            assert!(!is_truthy(&s(raw)), "{} should not be truthy", raw);
            assert_eq!(parse_yes_no(&s(raw)), None);
        }
    }

    #[test]
    fn test_literal_coercion_parses_strings() {
        let v = coerce_value("stream_sequence", ValueKind::Literal, s("{'resize': 800}")).unwrap();
        assert_eq!(v.get("resize").and_then(Value::as_i64), Some(800));
    }

    #[test]
    fn test_literal_coercion_passes_structures_through() {
        let mut map = serde_yaml::Mapping::new();
        map.insert(s("resize"), Value::Number(640i64.into()));
        let v = coerce_value("stream_sequence", ValueKind::Literal, Value::Mapping(map.clone())).unwrap();
        assert_eq!(v, Value::Mapping(map));
    }

    #[test]
    fn test_str_coercion_stringifies_scalars() {
        assert_eq!(coerce_value("portal", ValueKind::Str, Value::Number(8i64.into())).unwrap(), s("8"));
        assert_eq!(coerce_value("portal", ValueKind::Str, Value::Bool(true)).unwrap(), s("true"));
    }

    #[test]
    fn test_truthy() {
        assert!(is_truthy(&s("yes")));
        assert!(is_truthy(&s("TRUE")));
        assert!(is_truthy(&s("1")));
        assert!(!is_truthy(&s("no")));
        assert!(!is_truthy(&s("enabled")));
    }

    #[test]
    fn test_every_default_coerces() {
        for spec in CONFIG_SCHEMA {
            if let Some(raw) = default_value(spec) {
                assert!(
                    coerce_value(spec.key, spec.kind, raw).is_ok(),
                    "default for {} does not coerce",
                    spec.key
                );
            }
        }
    }
}
