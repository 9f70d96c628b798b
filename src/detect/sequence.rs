//! Typed views over `ml_sequence` and `stream_sequence`

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::schema::parse_yes_no;
use crate::config::secrets::scalar_to_string;
use crate::{HookError, Result};

const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;

/// How models of one category are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelStrategy {
    /// Stop at the first model with a surviving detection
    #[default]
    First,
    /// Run every model and merge the results in model order
    Union,
}

impl FromStr for ModelStrategy {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(ModelStrategy::First),
            "union" => Ok(ModelStrategy::Union),
            other => Err(HookError::config(format!(
                "unknown same_model_sequence_strategy '{}'",
                other
            ))),
        }
    }
}

/// How a frame is picked among the frames of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStrategy {
    /// First frame with any detection
    #[default]
    First,
    /// Frame with the most detections
    Most,
    /// Frame with the most distinct labels
    MostUnique,
    /// Frame with detections from the most distinct models
    MostModels,
}

impl FromStr for FrameStrategy {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(FrameStrategy::First),
            "most" => Ok(FrameStrategy::Most),
            "most_unique" => Ok(FrameStrategy::MostUnique),
            "most_models" => Ok(FrameStrategy::MostModels),
            other => Err(HookError::config(format!("unknown frame strategy '{}'", other))),
        }
    }
}

/// `ml_sequence.general`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MlGeneral {
    #[serde(default)]
    pub model_sequence: Option<String>,
    #[serde(default)]
    pub same_model_sequence_strategy: Option<String>,
}

/// `<category>.general`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CategoryGeneral {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub ignore_pattern: Option<String>,
}

/// One detector entry in a category's `sequence`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<Value>,
    /// Every other key (`object_weights`, `object_min_confidence`, ...)
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl ModelDescriptor {
    /// A missing `enabled` key means enabled
    pub fn is_enabled(&self) -> bool {
        match &self.enabled {
            None => true,
            Some(v) => parse_yes_no(v).unwrap_or(false),
        }
    }

    /// `<category>_<key>`, falling back to the bare `<key>`
    pub fn option(&self, category: &str, key: &str) -> Option<&Value> {
        self.options
            .get(&format!("{}_{}", category, key))
            .or_else(|| self.options.get(key))
    }

    pub fn option_str(&self, category: &str, key: &str) -> Option<String> {
        self.option(category, key).and_then(scalar_to_string)
    }

    pub fn framework(&self, category: &str) -> Option<String> {
        self.option_str(category, "framework").map(|f| f.to_lowercase())
    }

    pub fn min_confidence(&self, category: &str) -> f64 {
        self.option(category, "min_confidence")
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(DEFAULT_MIN_CONFIDENCE)
    }

    pub fn max_detection_size(&self, category: &str) -> Option<String> {
        self.option_str(category, "max_detection_size")
            .filter(|s| !s.trim().is_empty())
    }

    /// Name used in logs and in `model_names`
    pub fn display_name(&self, category: &str, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}#{}", category, index))
    }
}

/// `<category>` block: label filters plus the model list
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CategoryConfig {
    #[serde(default)]
    pub general: CategoryGeneral,
    #[serde(default)]
    pub sequence: Vec<ModelDescriptor>,
}

impl CategoryConfig {
    pub fn enabled_models(&self) -> impl Iterator<Item = (usize, &ModelDescriptor)> {
        self.sequence.iter().enumerate().filter(|(_, m)| m.is_enabled())
    }
}

/// Parsed `ml_sequence`
#[derive(Debug, Clone, Default)]
pub struct MlSequence {
    pub general: MlGeneral,
    pub strategy: ModelStrategy,
    /// Categories in evaluation order
    pub categories: Vec<(String, CategoryConfig)>,
}

impl MlSequence {
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Mapping(map) = value else {
            return Err(HookError::config("ml_sequence must be a mapping"));
        };

        let general: MlGeneral = match map.get("general") {
            Some(g) => serde_yaml::from_value(g.clone())
                .map_err(|e| HookError::config(format!("ml_sequence.general: {}", e)))?,
            None => MlGeneral::default(),
        };
        let strategy = match general.same_model_sequence_strategy.as_deref() {
            Some(s) => s.parse()?,
            None => ModelStrategy::default(),
        };

        let order = general.model_sequence.as_deref().unwrap_or("object");
        let mut categories = Vec::new();
        for name in order.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match map.get(name) {
                Some(block) => categories.push((name.to_string(), category_config(name, block)?)),
                None => log::warn!("model_sequence names '{}' but ml_sequence has no such block", name),
            }
        }

        Ok(Self {
            general,
            strategy,
            categories,
        })
    }
}

/// Type one category block; `sequence` entries that are not model
/// mappings are skipped
fn category_config(name: &str, block: &Value) -> Result<CategoryConfig> {
    let mut block = block.clone();
    if let Some(Value::Sequence(models)) = block.get_mut("sequence") {
        models.retain(|m| {
            let keep = m.is_mapping();
            if !keep {
                log::warn!("ml_sequence.{}: ignoring non-model entry {:?}", name, m);
            }
            keep
        });
    }
    serde_yaml::from_value(block).map_err(|e| HookError::config(format!("ml_sequence.{}: {}", name, e)))
}

/// Parsed `stream_sequence`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamSequence {
    #[serde(default)]
    pub frame_set: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub resize: Option<Value>,
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl StreamSequence {
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_mapping() {
            return Err(HookError::config("stream_sequence must be a mapping"));
        }
        serde_yaml::from_value(value.clone())
            .map_err(|e| HookError::config(format!("stream_sequence: {}", e)))
    }

    /// Frame ids to try for an event, `snapshot,alarm` by default
    pub fn frames(&self) -> Vec<String> {
        let set = self.frame_set.as_deref().unwrap_or("snapshot,alarm");
        let frames: Vec<String> = set
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if frames.is_empty() {
            vec!["snapshot".to_string()]
        } else {
            frames
        }
    }

    pub fn frame_strategy(&self) -> Result<FrameStrategy> {
        match self.strategy.as_deref() {
            Some(s) => s.parse(),
            None => Ok(FrameStrategy::default()),
        }
    }
}
