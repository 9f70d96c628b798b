//! Layered config resolution

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::schema::{self, ValueKind, CONFIG_SCHEMA};
use super::secrets::{scalar_to_string, unresolved_placeholders, SecretMap, Substitutor};
use super::zones::{import_platform_zones, parse_monitor_zones, ZonePolygon};
use super::{ResolvedConfig, RunContext};
use crate::platform::PlatformClient;
use crate::{HookError, Result};

/// Resolve a config file, optionally for one monitor
///
/// Convenience wrapper around [`ConfigResolver`] without zone import.
pub fn resolve(path: &Path, monitor_id: Option<&str>) -> Result<(ResolvedConfig, Vec<ZonePolygon>)> {
    let mut resolver = ConfigResolver::new(path);
    if let Some(mid) = monitor_id {
        resolver = resolver.monitor(mid);
    }
    let ctx = resolver.resolve()?;
    Ok((ctx.config, ctx.zones))
}

/// Builds a [`RunContext`] from a config file
pub struct ConfigResolver<'a> {
    path: PathBuf,
    monitor_id: Option<String>,
    reason: Option<String>,
    platform: Option<&'a dyn PlatformClient>,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            monitor_id: None,
            reason: None,
            platform: None,
        }
    }

    /// Apply the override block of this monitor
    pub fn monitor(mut self, monitor_id: impl Into<String>) -> Self {
        self.monitor_id = Some(monitor_id.into());
        self
    }

    /// Alarm cause, used to filter imported zones
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Platform client used for `import_zm_zones`
    pub fn platform(mut self, client: &'a dyn PlatformClient) -> Self {
        self.platform = Some(client);
        self
    }

    pub fn resolve(&self) -> Result<RunContext> {
        let raw = load_yaml(&self.path)?;
        let Value::Mapping(root) = &raw else {
            return Err(HookError::config(format!(
                "{} does not contain a mapping",
                self.path.display()
            )));
        };

        let mut flat = flatten(root)?;
        fill_defaults(&mut flat);
        parse_literal_keys(&mut flat)?;

        // Monitor overrides land before substitution so derived paths follow
        // an overridden base_data_path
        let mut zone_block = None;
        if let Some(mut block) = self.monitor_block(root)? {
            log::debug!(
                "Applying overrides for monitor {}",
                self.monitor_id.as_deref().unwrap_or_default()
            );
            zone_block = block.remove("zones");
            flat.extend(block);
        }

        // ${key} placeholders, then secrets
        let vars = scalar_vars(&flat);
        let vars_sub = Substitutor::new().with_vars(&vars);
        substitute_all(&mut flat, &vars_sub);

        let secrets = match flat.get("secrets").and_then(Value::as_str) {
            Some(path) if !path.trim().is_empty() => SecretMap::load(Path::new(path))?,
            _ => SecretMap::new(),
        };
        let secrets_sub = Substitutor::new().with_secrets(&secrets);
        substitute_all(&mut flat, &secrets_sub);

        let mut zones = Vec::new();
        let mut declared_patterns = HashMap::new();
        if let Some(block) = zone_block {
            let block = secrets_sub.substitute(&vars_sub.substitute(&block));
            let declared = parse_monitor_zones(&block)?;
            zones.extend(declared.polygons);
            declared_patterns = declared.patterns;
        }

        if flat.get("import_zm_zones").map(schema::is_truthy).unwrap_or(false) {
            let only_triggered = flat
                .get("only_triggered_zm_zones")
                .map(schema::is_truthy)
                .unwrap_or(false);
            self.import_zones(only_triggered, &declared_patterns, &mut zones);
        }

        coerce_all(&mut flat)?;

        for token in unresolved_placeholders(&Value::Mapping(
            flat.iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect(),
        )) {
            log::warn!("Unresolved placeholder {} left in config", token);
        }

        let ctx = RunContext {
            config: flat.into_iter().collect(),
            zones,
            monitor_id: self.monitor_id.clone(),
        };
        ctx.validate()?;

        log::debug!(
            "Resolved config from {} with {} zones",
            self.path.display(),
            ctx.zones.len()
        );
        Ok(ctx)
    }

    fn monitor_block(&self, root: &serde_yaml::Mapping) -> Result<Option<BTreeMap<String, Value>>> {
        let Some(mid) = self.monitor_id.as_deref() else {
            return Ok(None);
        };
        let Some(Value::Mapping(monitors)) = root.get("monitors") else {
            return Ok(None);
        };

        let found = monitors
            .iter()
            .find(|(k, _)| scalar_to_string(k).as_deref() == Some(mid));
        let Some((_, block)) = found else {
            log::debug!("No overrides for monitor {}", mid);
            return Ok(None);
        };

        let Value::Mapping(block) = block else {
            return Err(HookError::config(format!("monitor {} block is not a mapping", mid)));
        };

        let mut out = BTreeMap::new();
        for (k, v) in block {
            if let Some(key) = scalar_to_string(k) {
                out.insert(key, v.clone());
            }
        }
        parse_literal_keys(&mut out)?;
        Ok(Some(out))
    }

    fn import_zones(
        &self,
        only_triggered: bool,
        declared: &HashMap<String, super::zones::ZonePatterns>,
        zones: &mut Vec<ZonePolygon>,
    ) {
        let (Some(platform), Some(mid)) = (self.platform, self.monitor_id.as_deref()) else {
            log::debug!("import_zm_zones set without a platform client or monitor, skipping");
            return;
        };

        match platform.monitor_zones(mid) {
            Ok(remote) => {
                for zone in import_platform_zones(remote, self.reason.as_deref(), only_triggered, declared) {
                    if zones.iter().any(|z| z.name == zone.name) {
                        log::debug!("zone {} already declared in config, keeping config one", zone.name);
                        continue;
                    }
                    zones.push(zone);
                }
            }
            Err(e) => log::warn!("Could not import zones for monitor {}: {}", mid, e),
        }
    }
}

fn load_yaml(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|source| HookError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| HookError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Flatten every section except `monitors`; `general` wins on conflicts
fn flatten(root: &serde_yaml::Mapping) -> Result<BTreeMap<String, Value>> {
    let mut flat = BTreeMap::new();
    let mut general = None;

    for (key, value) in root {
        let Some(key) = scalar_to_string(key) else {
            return Err(HookError::config(format!("unsupported top-level key {:?}", key)));
        };
        let literal_key = schema::lookup(&key).is_some_and(|s| s.kind == ValueKind::Literal);

        match (key.as_str(), value) {
            ("monitors", _) => {}
            ("general", Value::Mapping(section)) => general = Some(section),
            (_, Value::Mapping(section)) if !literal_key => {
                for (k, v) in section {
                    if let Some(k) = scalar_to_string(k) {
                        flat.insert(k, v.clone());
                    }
                }
            }
            _ => {
                flat.insert(key, value.clone());
            }
        }
    }

    if let Some(section) = general {
        for (k, v) in section {
            if let Some(k) = scalar_to_string(k) {
                flat.insert(k, v.clone());
            }
        }
    }
    Ok(flat)
}

fn fill_defaults(flat: &mut BTreeMap<String, Value>) {
    for spec in CONFIG_SCHEMA {
        if flat.contains_key(spec.key) {
            continue;
        }
        if let Some(default) = schema::default_value(spec) {
            flat.insert(spec.key.to_string(), default);
        }
    }
}

/// Parse string-encoded structures before any substitution runs
fn parse_literal_keys(map: &mut BTreeMap<String, Value>) -> Result<()> {
    for (key, value) in map.iter_mut() {
        let Some(spec) = schema::lookup(key) else { continue };
        if spec.kind == ValueKind::Literal && value.is_string() {
            *value = schema::coerce_value(key, ValueKind::Literal, std::mem::take(value))?;
        }
    }
    Ok(())
}

fn scalar_vars(flat: &BTreeMap<String, Value>) -> HashMap<String, String> {
    flat.iter()
        .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k.clone(), v)))
        .collect()
}

fn substitute_all(map: &mut BTreeMap<String, Value>, sub: &Substitutor<'_>) {
    for value in map.values_mut() {
        *value = sub.substitute(value);
    }
}

fn coerce_all(flat: &mut BTreeMap<String, Value>) -> Result<()> {
    for (key, value) in flat.iter_mut() {
        if let Some(spec) = schema::lookup(key) {
            *value = schema::coerce_value(key, spec.kind, std::mem::take(value))?;
        }
    }
    Ok(())
}
