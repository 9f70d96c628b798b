//! Surveillance platform integration
//!
//! The hook needs a handful of things from the platform: the zones of a
//! monitor, an event's notes and storage path, and (optionally) tagging.
//! [`PlatformClient`] is that seam; [`ZmApiClient`] talks to the ZoneMinder
//! REST API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectionResult;
use crate::output::DetectionPayload;
use crate::{HookError, Result};

/// File written next to the event's frames
pub const OBJECTS_FILE: &str = "objects.json";

const NOTES_MARKER: &str = "Motion:";

/// A zone as reported by the platform
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformZone {
    pub name: String,
    /// Zone type, e.g. `Active`, `Inclusive`, `Inactive`
    pub kind: String,
    pub points: Vec<(f64, f64)>,
    pub pattern: Option<String>,
    pub ignore_pattern: Option<String>,
}

/// Operations the hook needs from the surveillance platform
pub trait PlatformClient {
    /// Zones defined for a monitor
    fn monitor_zones(&self, monitor_id: &str) -> Result<Vec<PlatformZone>>;

    /// Current notes of an event
    fn event_notes(&self, event_id: &str) -> Result<String>;

    /// Replace the notes of an event
    fn update_event_notes(&self, event_id: &str, notes: &str) -> Result<()>;

    /// Attach detected labels as tags
    fn tag_event(&self, event_id: &str, labels: &[String]) -> Result<()>;

    /// Storage directory of an event, `None` while it is not known yet
    fn event_path(&self, event_id: &str) -> Result<Option<PathBuf>>;
}

/// New notes: the prediction, followed by the old `Motion:` section if any
pub fn merge_notes(prediction: &str, old_notes: &str) -> String {
    match old_notes.split(NOTES_MARKER).nth(1) {
        Some(motion) => format!("{}{}{}", prediction, NOTES_MARKER, motion),
        None => prediction.to_string(),
    }
}

/// Prepend the prediction to an event's notes
pub fn update_notes(client: &dyn PlatformClient, event_id: &str, prediction: &str) -> Result<()> {
    let old = client.event_notes(event_id)?;
    let notes = merge_notes(prediction, &old);
    log::debug!("Updating notes for event {}: {}", event_id, notes);
    client.update_event_notes(event_id, &notes)
}

/// Ask the platform for an event's path, retrying a fixed number of times
///
/// Freshly started events may not have a path yet.
pub fn resolve_event_path(
    client: &dyn PlatformClient,
    event_id: &str,
    retries: u32,
    delay: Duration,
) -> Result<PathBuf> {
    let attempts = retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match client.event_path(event_id) {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => log::debug!("Event {} has no path yet (attempt {}/{})", event_id, attempt, attempts),
            Err(e) => {
                log::debug!("Event path lookup failed (attempt {}/{}): {}", attempt, attempts, e);
                last_error = Some(e);
            }
        }
        if attempt < attempts && !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    Err(last_error.unwrap_or_else(|| {
        HookError::platform(format!("no path for event {} after {} attempts", event_id, attempts))
    }))
}

/// Write `objects.json` into `dir`
pub fn write_objects_json(dir: &Path, result: &DetectionResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| HookError::OutputWrite(format!("{}: {}", dir.display(), e)))?;
    let file = dir.join(OBJECTS_FILE);
    let json = DetectionPayload::new(result).to_json()?;
    std::fs::write(&file, json)
        .map_err(|e| HookError::OutputWrite(format!("{}: {}", file.display(), e)))?;
    log::debug!("Wrote {}", file.display());
    Ok(file)
}

#[cfg(feature = "remote")]
pub use zm::ZmApiClient;

#[cfg(feature = "remote")]
mod zm {
    use super::*;
    use crate::config::zones::parse_coords;
    use crate::config::ResolvedConfig;
    use crate::detect::remote::http_client;
    use reqwest::blocking::Client;
    use serde_json::Value as JsonValue;

    /// ZoneMinder REST API client
    pub struct ZmApiClient {
        api_url: String,
        http: Client,
        token: Option<String>,
    }

    impl ZmApiClient {
        /// Connect and log in when credentials are given
        pub fn connect(
            api_url: &str,
            user: Option<&str>,
            password: Option<&str>,
            allow_self_signed: bool,
            timeout: Duration,
        ) -> Result<Self> {
            let api_url = api_url.trim_end_matches('/').to_string();
            if api_url.is_empty() {
                return Err(HookError::platform("api_portal is not configured"));
            }

            let http = http_client(timeout, allow_self_signed)
                .map_err(|e| HookError::platform(format!("failed to build HTTP client: {}", e)))?;

            let mut client = Self {
                api_url,
                http,
                token: None,
            };
            if let (Some(user), Some(password)) = (user, password) {
                client.token = Some(client.login(user, password)?);
            }
            Ok(client)
        }

        pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
            let timeout = config.get_int("ml_timeout").unwrap_or(60).max(1) as u64;
            Self::connect(
                config.get_str("api_portal").unwrap_or_default(),
                config.get_str("user").filter(|s| !s.is_empty()),
                config.get_str("password").filter(|s| !s.is_empty()),
                config.is_yes("allow_self_signed"),
                Duration::from_secs(timeout),
            )
        }

        fn login(&self, user: &str, password: &str) -> Result<String> {
            log::debug!("Logging into {}", self.api_url);
            let body: JsonValue = self
                .http
                .post(format!("{}/host/login.json", self.api_url))
                .form(&[("user", user), ("pass", password)])
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json())
                .map_err(|e| HookError::platform(format!("login failed: {}", e)))?;

            body.get("access_token")
                .and_then(JsonValue::as_str)
                .map(String::from)
                .ok_or_else(|| HookError::platform("login response has no access_token"))
        }

        fn url(&self, path: &str) -> String {
            match &self.token {
                Some(token) => format!("{}/{}?token={}", self.api_url, path, token),
                None => format!("{}/{}", self.api_url, path),
            }
        }

        fn get_json(&self, path: &str) -> Result<JsonValue> {
            self.http
                .get(self.url(path))
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json())
                .map_err(|e| HookError::platform(format!("GET {} failed: {}", path, e)))
        }

        fn event(&self, event_id: &str) -> Result<JsonValue> {
            let body = self.get_json(&format!("events/{}.json", event_id))?;
            body.get("event")
                .and_then(|e| e.get("Event"))
                .cloned()
                .ok_or_else(|| HookError::platform(format!("event {} not found", event_id)))
        }
    }

    fn zone_from_json(raw: &JsonValue) -> Option<PlatformZone> {
        let zone = raw.get("Zone")?;
        let text = |key: &str| {
            zone.get(key)
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let name = text("Name")?;
        let points = match parse_coords(&text("Coords")?) {
            Ok(points) => points,
            Err(e) => {
                log::warn!("Zone {}: {}", name, e);
                return None;
            }
        };
        Some(PlatformZone {
            kind: text("Type").unwrap_or_default(),
            pattern: text("detection_pattern").or_else(|| text("pattern")),
            ignore_pattern: text("ignore_pattern"),
            name,
            points,
        })
    }

    impl PlatformClient for ZmApiClient {
        fn monitor_zones(&self, monitor_id: &str) -> Result<Vec<PlatformZone>> {
            let body = self.get_json(&format!("zones/forMonitor/{}.json", monitor_id))?;
            let zones = body
                .get("zones")
                .and_then(JsonValue::as_array)
                .map(|zones| zones.iter().filter_map(zone_from_json).collect())
                .unwrap_or_default();
            Ok(zones)
        }

        fn event_notes(&self, event_id: &str) -> Result<String> {
            Ok(self
                .event(event_id)?
                .get("Notes")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string())
        }

        fn update_event_notes(&self, event_id: &str, notes: &str) -> Result<()> {
            self.http
                .put(self.url(&format!("events/{}.json", event_id)))
                .form(&[("Event[Notes]", notes)])
                .send()
                .and_then(|r| r.error_for_status())
                .map(|_| ())
                .map_err(|e| HookError::platform(format!("notes update failed: {}", e)))
        }

        fn tag_event(&self, _event_id: &str, _labels: &[String]) -> Result<()> {
            Err(HookError::platform("event tagging is not available through the ZoneMinder API"))
        }

        fn event_path(&self, event_id: &str) -> Result<Option<PathBuf>> {
            Ok(self
                .event(event_id)?
                .get("FileSystemPath")
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn test_zone_from_json() {
            let raw = json!({"Zone": {"Name": "Front Yard", "Type": "Active", "Coords": "0,0 100,0 100,100 0,100"}});
            let zone = zone_from_json(&raw).unwrap();
            assert_eq!(zone.name, "Front Yard");
            assert_eq!(zone.kind, "Active");
            assert_eq!(zone.points.len(), 4);
            assert_eq!(zone.pattern, None);

            let raw = json!({"Zone": {"Name": "x", "Type": "Active", "Coords": "bogus"}});
            assert!(zone_from_json(&raw).is_none());
        }

        #[test]
        fn test_connect_requires_api_url() {
            let err = ZmApiClient::connect("", None, None, false, Duration::from_secs(1))
                .err()
                .unwrap();
            assert!(matches!(err, HookError::Platform(_)));
        }
    }
}

#[cfg(test)]
pub(crate) use mock::MockPlatform;
