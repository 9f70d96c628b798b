//! Secret store loading and placeholder substitution
//!
//! Two placeholder forms are understood inside any string of the config tree:
//!
//! - `!TOKEN` is looked up (lower-cased) in the secrets file
//! - `${key}` is looked up in the flat config (`${base_data_path}/models`)
//!
//! Unknown placeholders stay in place untouched so they can be reported later.
//! Substitution walks the typed tree directly; nothing is stringified and
//! re-parsed, so a secret value can never change the shape of the config.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_yaml::Value;

use crate::{HookError, Result};

static SECRET_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!(\w+)").expect("secret token pattern is valid"));
static CONFIG_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{(\w+)\}").expect("config variable pattern is valid"));

/// Flat secret name → value mapping, keys lower-cased
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretMap {
    values: HashMap<String, String>,
}

impl SecretMap {
    /// Create an empty secret map
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the `secrets:` section of a YAML secrets file
    ///
    /// A missing file yields an empty map; an unreadable or malformed one is
    /// a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!("Secrets file {} not found, continuing without secrets", path.display());
            return Ok(Self::new());
        }

        let content = std::fs::read_to_string(path).map_err(|source| HookError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: Value = serde_yaml::from_str(&content).map_err(|source| HookError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

        let mut map = Self::new();
        if let Some(Value::Mapping(section)) = doc.get("secrets") {
            for (key, value) in section {
                let Some(key) = scalar_to_string(key) else { continue };
                match scalar_to_string(value) {
                    Some(v) => map.insert(&key, v),
                    None => log::warn!("Secret {} is not a scalar, ignoring", key),
                }
            }
        } else {
            log::debug!("{} has no secrets section", path.display());
        }

        log::debug!("Loaded {} secrets from {}", map.len(), path.display());
        Ok(map)
    }

    /// Insert a secret (name is lower-cased)
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_lowercase(), value.into());
    }

    /// Look up a secret case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Render a YAML scalar as a string
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Rewrites placeholders throughout a config tree
#[derive(Debug, Default)]
pub struct Substitutor<'a> {
    secrets: Option<&'a SecretMap>,
    vars: Option<&'a HashMap<String, String>>,
}

impl<'a> Substitutor<'a> {
    /// Create a substitutor that changes nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `!TOKEN` placeholders from this secret map
    pub fn with_secrets(mut self, secrets: &'a SecretMap) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Resolve `${key}` placeholders from these config variables
    pub fn with_vars(mut self, vars: &'a HashMap<String, String>) -> Self {
        self.vars = Some(vars);
        self
    }

    /// Substitute every string inside `value`, keeping its structure
    pub fn substitute(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute_str(s)),
            Value::Sequence(items) => {
                Value::Sequence(items.iter().map(|item| self.substitute(item)).collect())
            }
            Value::Mapping(map) => Value::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute(v)))
                    .collect(),
            ),
            Value::Tagged(tagged) => {
                let mut tagged = tagged.as_ref().clone();
                tagged.value = self.substitute(&tagged.value);
                Value::Tagged(Box::new(tagged))
            }
            other => other.clone(),
        }
    }

    /// Substitute placeholders in a single string
    pub fn substitute_str(&self, input: &str) -> String {
        let mut out = input.to_string();

        if let Some(vars) = self.vars {
            if out.contains("${") {
                out = CONFIG_VAR
                    .replace_all(&out, |caps: &Captures| match vars.get(&caps[1]) {
                        Some(v) => v.clone(),
                        None => caps[0].to_string(),
                    })
                    .into_owned();
            }
        }

        if let Some(secrets) = self.secrets {
            if out.contains('!') {
                out = SECRET_TOKEN
                    .replace_all(&out, |caps: &Captures| match secrets.get(&caps[1]) {
                        Some(v) => v.to_string(),
                        // unknown tokens stay, lower-cased
                        None => format!("!{}", caps[1].to_lowercase()),
                    })
                    .into_owned();
            }
        }

        out
    }
}

/// Collect `!TOKEN` and `${key}` placeholders still present in a tree
pub fn unresolved_placeholders(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_unresolved(value, &mut found);
    found
}

fn collect_unresolved(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for m in SECRET_TOKEN.find_iter(s).chain(CONFIG_VAR.find_iter(s)) {
                found.push(m.as_str().to_string());
            }
        }
        Value::Sequence(items) => items.iter().for_each(|item| collect_unresolved(item, found)),
        Value::Mapping(map) => map.values().for_each(|v| collect_unresolved(v, found)),
        Value::Tagged(tagged) => collect_unresolved(&tagged.value, found),
        _ => {}
    }
}
