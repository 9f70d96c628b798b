//! Configuration resolution
//!
//! A run starts from one YAML file. The resolver flattens it, fills defaults
//! from the coercion table, substitutes `${key}` and `!SECRET` placeholders,
//! overlays the per-monitor block and finally coerces every known key to its
//! declared type. The result is a [`RunContext`] that the dispatcher and the
//! formatter read from; nothing is global.

pub mod literal;
pub mod resolver;
pub mod schema;
pub mod secrets;
pub mod zones;

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::detect::sequence::{MlSequence, StreamSequence};
use crate::{HookError, Result};

pub use literal::parse_literal;
pub use resolver::{resolve, ConfigResolver};
pub use schema::{is_truthy, ValueKind, CONFIG_SCHEMA};
pub use secrets::{SecretMap, Substitutor};
pub use zones::{normalize_zone_name, ZonePolygon};

static NULL: Value = Value::Null;

/// Final, typed configuration for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, Value>,
}

impl ResolvedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw access to any key, known or not
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value of a key; numbers are not converted
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    /// Whether a bool-like key reads as enabled
    pub fn is_yes(&self, key: &str) -> bool {
        self.values.get(key).map(is_truthy).unwrap_or(false)
    }

    /// Set a key, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Raw `ml_sequence` structure, `Null` when absent
    pub fn ml_sequence_value(&self) -> &Value {
        self.values.get("ml_sequence").unwrap_or(&NULL)
    }

    /// Raw `stream_sequence` structure, `Null` when absent
    pub fn stream_sequence_value(&self) -> &Value {
        self.values.get("stream_sequence").unwrap_or(&NULL)
    }

    /// Typed view of `ml_sequence`
    pub fn ml_sequence(&self) -> Result<MlSequence> {
        MlSequence::from_value(self.ml_sequence_value())
    }

    /// Typed view of `stream_sequence`
    pub fn stream_sequence(&self) -> Result<StreamSequence> {
        StreamSequence::from_value(self.stream_sequence_value())
    }

    /// Seconds to sleep before detection
    pub fn wait_secs(&self) -> u64 {
        self.get_int("wait").unwrap_or(0).max(0) as u64
    }

    /// Remote gateway URL, if one is configured
    pub fn ml_gateway(&self) -> Option<&str> {
        self.get_str("ml_gateway").filter(|s| !s.trim().is_empty())
    }

    /// Whether debug logging was requested through `pyzm_overrides`
    pub fn log_debug(&self) -> bool {
        self.get("pyzm_overrides")
            .and_then(|o| o.get("log_debug"))
            .map(is_truthy)
            .unwrap_or(false)
    }
}

impl FromIterator<(String, Value)> for ResolvedConfig {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Everything a single invocation works from
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: ResolvedConfig,
    pub zones: Vec<ZonePolygon>,
    pub monitor_id: Option<String>,
}

impl RunContext {
    pub fn new(config: ResolvedConfig) -> Self {
        Self {
            config,
            zones: Vec::new(),
            monitor_id: None,
        }
    }

    pub fn with_zones(mut self, zones: Vec<ZonePolygon>) -> Self {
        self.zones = zones;
        self
    }

    /// Check that both model and stream sequences are present
    ///
    /// Their contents are typed later, when the detectors are built.
    pub fn validate(&self) -> Result<()> {
        for key in ["ml_sequence", "stream_sequence"] {
            match self.config.get(key) {
                Some(Value::Mapping(m)) if !m.is_empty() => {}
                _ => return Err(HookError::config(format!("{} missing", key))),
            }
        }
        Ok(())
    }
}
