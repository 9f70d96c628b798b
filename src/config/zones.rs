//! Zone / polygon parsing
//!
//! Zones come from two places: per-monitor `zones` blocks in the config file,
//! and (when `import_zm_zones` is on) the platform's own zone list. Both end
//! up as [`ZonePolygon`] records with normalized names.

use std::collections::HashMap;

use serde::Serialize;
use serde_yaml::Value;

use super::secrets::scalar_to_string;
use crate::platform::PlatformZone;
use crate::{HookError, Result};

/// A named detection region with optional label filters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZonePolygon {
    /// Lower-case name, spaces replaced by underscores
    pub name: String,
    /// Ordered vertices; coordinates keep their fractional part
    #[serde(rename = "value")]
    pub points: Vec<(f64, f64)>,
    /// Labels must match this (prefix-anchored) to count in the zone
    pub pattern: Option<String>,
    /// Labels matching this are dropped in the zone
    pub ignore_pattern: Option<String>,
}

impl ZonePolygon {
    pub fn new(name: &str, points: Vec<(f64, f64)>) -> Self {
        Self {
            name: normalize_zone_name(name),
            points,
            pattern: None,
            ignore_pattern: None,
        }
    }

    pub fn with_patterns(mut self, patterns: &ZonePatterns) -> Self {
        self.pattern = patterns.pattern.clone();
        self.ignore_pattern = patterns.ignore_pattern.clone();
        self
    }
}

/// Label filters declared for a zone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZonePatterns {
    pub pattern: Option<String>,
    pub ignore_pattern: Option<String>,
}

/// Zones declared in a monitor block
#[derive(Debug, Clone, Default)]
pub struct MonitorZones {
    /// Zones with their own coordinates
    pub polygons: Vec<ZonePolygon>,
    /// Patterns for every declared zone, keyed by normalized name; also
    /// applied to platform zones of the same name
    pub patterns: HashMap<String, ZonePatterns>,
}

/// Normalize a zone name: lower-case, spaces become underscores
pub fn normalize_zone_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Parse `"x,y x,y ..."` into vertices
pub fn parse_coords(text: &str) -> Result<Vec<(f64, f64)>> {
    text.split_whitespace()
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| HookError::config(format!("bad zone point '{}'", pair)))?;
            let x = x.trim().parse::<f64>();
            let y = y.trim().parse::<f64>();
            match (x, y) {
                (Ok(x), Ok(y)) => Ok((x, y)),
                _ => Err(HookError::config(format!("bad zone point '{}'", pair))),
            }
        })
        .collect()
}

fn coords_from_value(name: &str, value: &Value) -> Result<Vec<(f64, f64)>> {
    let points = match value {
        Value::String(s) => parse_coords(s)?,
        Value::Sequence(items) => items
            .iter()
            .map(|item| match item.as_sequence().map(Vec::as_slice) {
                Some([x, y]) => match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => Ok((x, y)),
                    _ => Err(HookError::config(format!("zone {}: non-numeric point", name))),
                },
                _ => Err(HookError::config(format!("zone {}: points must be [x, y] pairs", name))),
            })
            .collect::<Result<_>>()?,
        other => {
            return Err(HookError::config(format!(
                "zone {}: unsupported coordinates {:?}",
                name, other
            )))
        }
    };

    if points.len() < 3 {
        return Err(HookError::config(format!(
            "zone {} needs at least 3 points, got {}",
            name,
            points.len()
        )));
    }
    Ok(points)
}

fn optional_string(block: &Value, key: &str) -> Option<String> {
    block
        .get(key)
        .and_then(scalar_to_string)
        .filter(|s| !s.is_empty())
}

/// Parse a monitor's `zones` block
///
/// Each entry is either a coordinate string or a mapping with `coords`,
/// `detection_pattern` and `ignore_pattern`. Entries without `coords` only
/// contribute patterns.
pub fn parse_monitor_zones(block: &Value) -> Result<MonitorZones> {
    let mut zones = MonitorZones::default();
    let Value::Mapping(entries) = block else {
        if !block.is_null() {
            log::warn!("monitor zones block is not a mapping, ignoring");
        }
        return Ok(zones);
    };

    for (name, entry) in entries {
        let Some(raw_name) = scalar_to_string(name) else { continue };
        let name = normalize_zone_name(&raw_name);

        let (coords, patterns) = match entry {
            Value::Mapping(_) => (
                entry.get("coords"),
                ZonePatterns {
                    pattern: optional_string(entry, "detection_pattern"),
                    ignore_pattern: optional_string(entry, "ignore_pattern"),
                },
            ),
            _ => (Some(entry), ZonePatterns::default()),
        };

        if let Some(coords) = coords {
            let points = coords_from_value(&name, coords)?;
            log::debug!("monitor zone {} with {} points", name, points.len());
            zones
                .polygons
                .push(ZonePolygon::new(&name, points).with_patterns(&patterns));
        }
        zones.patterns.insert(name, patterns);
    }

    Ok(zones)
}

/// Zone names mentioned in an alarm cause such as `"Motion: Driveway,Porch"`
pub fn triggered_zone_names(reason: &str) -> Vec<String> {
    let body = reason.split_once(':').map_or(reason, |(_, rest)| rest);
    body.split(',')
        .map(normalize_zone_name)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Convert platform zones into polygons
///
/// Only zones whose type is exactly `Active` are kept. When `only_triggered`
/// is set and a reason is supplied, zones not named in the reason are
/// dropped as well.
pub fn import_platform_zones(
    zones: Vec<PlatformZone>,
    reason: Option<&str>,
    only_triggered: bool,
    declared: &HashMap<String, ZonePatterns>,
) -> Vec<ZonePolygon> {
    let triggered = match reason {
        Some(r) if only_triggered => Some(triggered_zone_names(r)),
        _ => None,
    };

    let mut out = Vec::new();
    for zone in zones {
        if zone.kind != "Active" {
            log::debug!("skipping zone {} of type {}", zone.name, zone.kind);
            continue;
        }

        let name = normalize_zone_name(&zone.name);
        if let Some(triggered) = &triggered {
            if !triggered.contains(&name) {
                log::debug!("skipping zone {}, not in alarm cause", name);
                continue;
            }
        }
        if zone.points.len() < 3 {
            log::warn!("platform zone {} has fewer than 3 points, skipping", name);
            continue;
        }

        let mut polygon = ZonePolygon::new(&name, zone.points);
        polygon.pattern = zone.pattern;
        polygon.ignore_pattern = zone.ignore_pattern;
        if let Some(patterns) = declared.get(&name) {
            if patterns.pattern.is_some() {
                polygon.pattern = patterns.pattern.clone();
            }
            if patterns.ignore_pattern.is_some() {
                polygon.ignore_pattern = patterns.ignore_pattern.clone();
            }
        }
        out.push(polygon);
    }

    log::debug!("imported {} platform zones", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform_zone(name: &str, coords: &str, kind: &str) -> PlatformZone {
        PlatformZone {
            name: name.to_string(),
            kind: kind.to_string(),
            points: parse_coords(coords).unwrap(),
            pattern: None,
            ignore_pattern: None,
        }
    }

    #[test]
    fn test_normalize_zone_name() {
        assert_eq!(normalize_zone_name("Front Yard"), "front_yard");
        assert_eq!(normalize_zone_name("Front Yard Camera 1"), "front_yard_camera_1");
        assert_eq!(normalize_zone_name("driveway"), "driveway");
    }

    #[test]
    fn test_parse_coords_keeps_floats() {
        let points = parse_coords("26.41,33.5 75.2,33.5 75.2,90.1 26.41,90.1").unwrap();
        assert_eq!(points, vec![(26.41, 33.5), (75.2, 33.5), (75.2, 90.1), (26.41, 90.1)]);

        let points = parse_coords("0,0 640,0 640,480").unwrap();
        assert_eq!(points[1], (640.0, 0.0));
    }

    #[test]
    fn test_parse_coords_rejects_garbage() {
        assert!(parse_coords("0,0 640 640,480").is_err());
        assert!(parse_coords("a,b").is_err());
    }

    #[test]
    fn test_monitor_zones() {
        let block: Value = serde_yaml::from_str(
            r#"
            Front Yard:
              coords: 0,0 640,0 640,480 0,480
              detection_pattern: person
            driveway:
              coords: [[0, 0], [100, 0], [100, 100]]
              detection_pattern: (person|car)
              ignore_pattern: (car|truck)
            porch:
              ignore_pattern: cat
            "#,
        )
        .unwrap();

        let zones = parse_monitor_zones(&block).unwrap();
        assert_eq!(zones.polygons.len(), 2);

        let front = &zones.polygons[0];
        assert_eq!(front.name, "front_yard");
        assert_eq!(front.points, vec![(0.0, 0.0), (640.0, 0.0), (640.0, 480.0), (0.0, 480.0)]);
        assert_eq!(front.pattern.as_deref(), Some("person"));
        assert_eq!(front.ignore_pattern, None);

        let driveway = &zones.polygons[1];
        assert_eq!(driveway.pattern.as_deref(), Some("(person|car)"));
        assert_eq!(driveway.ignore_pattern.as_deref(), Some("(car|truck)"));

        assert_eq!(zones.patterns["porch"].ignore_pattern.as_deref(), Some("cat"));
    }

    #[test]
    fn test_monitor_zone_shorthand() {
        let block: Value = serde_yaml::from_str("garden: 0,0 10,0 10,10 0,10\n").unwrap();
        let zones = parse_monitor_zones(&block).unwrap();
        assert_eq!(zones.polygons[0].name, "garden");
        assert_eq!(zones.polygons[0].pattern, None);
    }

    #[test]
    fn test_monitor_zone_too_few_points() {
        let block: Value = serde_yaml::from_str("tiny: 0,0 1,1\n").unwrap();
        assert!(parse_monitor_zones(&block).unwrap_err().is_fatal());
    }

    #[test]
    fn test_import_active_only() {
        let zones = vec![
            platform_zone("Active Zone", "0,0 100,0 100,100 0,100", "Active"),
            platform_zone("Disabled Zone", "50,50 150,50 150,150 50,150", "Inactive"),
        ];
        let out = import_platform_zones(zones, None, false, &HashMap::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "active_zone");
        assert_eq!(out[0].pattern, None);
    }

    #[test]
    fn test_import_filters_by_reason() {
        let zones = || {
            vec![
                platform_zone("Driveway", "0,0 100,0 100,100 0,100", "Active"),
                platform_zone("Backyard", "50,50 150,50 150,150 50,150", "Active"),
            ]
        };

        let out = import_platform_zones(zones(), Some("Motion: Driveway"), true, &HashMap::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "driveway");

        let out = import_platform_zones(zones(), Some("Motion: Driveway"), false, &HashMap::new());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_import_applies_metadata_and_declared_patterns() {
        let mut zone = platform_zone("Front Door", "0,0 10,0 10,10", "Active");
        zone.pattern = Some("person".to_string());
        let mut declared = HashMap::new();
        declared.insert(
            "front_door".to_string(),
            ZonePatterns {
                pattern: None,
                ignore_pattern: Some("cat".to_string()),
            },
        );

        let out = import_platform_zones(vec![zone], None, false, &declared);
        assert_eq!(out[0].pattern.as_deref(), Some("person"));
        assert_eq!(out[0].ignore_pattern.as_deref(), Some("cat"));
    }

    #[test]
    fn test_triggered_zone_names() {
        assert_eq!(triggered_zone_names("Motion: Front Yard,Porch"), vec!["front_yard", "porch"]);
        assert_eq!(triggered_zone_names("driveway"), vec!["driveway"]);
    }
}
