//! Inference gateway client
//!
//! Protocol:
//!
//! - `POST {gateway}/login` with `{username, password}` returns
//!   `{access_token, expires}`; the token is cached on disk
//! - `POST {gateway}/detect/object?type=object&...` with a bearer token runs
//!   detection; files go up as multipart, events as a JSON body
//!
//! Zones travel inside `stream_options.polygons` so the gateway filters
//! with the same polygons a local run would use.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::token_cache::{unix_now, TokenCache};
use super::{Detection, DetectionResult, Detector, ImageDimensions, Target};
use crate::config::{ResolvedConfig, RunContext, ZonePolygon};
use crate::{HookError, Result};

const DETECT_QUERY: &str = "detect/object?type=object&delete=true&response_format=new";

/// Connection settings for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub mode: String,
    pub allow_self_signed: bool,
    pub token_cache: TokenCache,
}

impl GatewayConfig {
    /// `None` when no `ml_gateway` is configured
    pub fn from_config(config: &ResolvedConfig) -> Option<Self> {
        let url = config.ml_gateway()?.trim_end_matches('/').to_string();
        let non_empty = |key: &str| config.get_str(key).filter(|s| !s.is_empty()).map(String::from);
        let base = config
            .get_str("base_data_path")
            .unwrap_or("/var/lib/zmeventnotification");

        Some(Self {
            url,
            user: non_empty("ml_user"),
            password: non_empty("ml_password"),
            timeout: Duration::from_secs(config.get_int("ml_timeout").unwrap_or(60).max(1) as u64),
            mode: config.get_str("ml_gateway_mode").unwrap_or("image").to_string(),
            allow_self_signed: config.is_yes("allow_self_signed"),
            token_cache: TokenCache::in_dir(Path::new(base)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires: i64,
}

fn default_expiry() -> i64 {
    3600
}

/// `matched_data` as returned by the gateway
#[derive(Debug, Default, Deserialize)]
struct GatewayMatch {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    boxes: Vec<[f64; 4]>,
    #[serde(default)]
    confidences: Vec<f64>,
    #[serde(default)]
    model_names: Vec<String>,
    #[serde(default)]
    frame_id: Option<JsonValue>,
    #[serde(default)]
    image_dimensions: Option<JsonValue>,
}

/// Runs detection on a remote gateway
pub struct RemoteDetector {
    config: GatewayConfig,
    http: Client,
    stream_options: JsonValue,
    ml_overrides: JsonValue,
    zones: Vec<ZonePolygon>,
}

impl RemoteDetector {
    pub fn new(
        config: GatewayConfig,
        ml_sequence: &serde_yaml::Value,
        stream_sequence: &serde_yaml::Value,
        zones: Vec<ZonePolygon>,
    ) -> Result<Self> {
        let http = http_client(config.timeout, config.allow_self_signed)
            .map_err(|e| HookError::remote(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            stream_options: stream_options(stream_sequence, &zones)?,
            ml_overrides: to_json(ml_sequence)?,
            config,
            http,
            zones,
        })
    }

    /// Build from a run context; `None` when no gateway is configured
    pub fn from_context(ctx: &RunContext) -> Result<Option<Self>> {
        let Some(config) = GatewayConfig::from_config(&ctx.config) else {
            return Ok(None);
        };
        Self::new(
            config,
            ctx.config.ml_sequence_value(),
            ctx.config.stream_sequence_value(),
            ctx.zones.clone(),
        )
        .map(Some)
    }

    fn login(&self) -> Result<Option<String>> {
        let (Some(user), Some(password)) = (&self.config.user, &self.config.password) else {
            log::debug!("No gateway credentials configured, skipping login");
            return Ok(None);
        };

        log::debug!("Logging into gateway {}", self.config.url);
        let resp = self
            .http
            .post(format!("{}/login", self.config.url))
            .json(&json!({ "username": user, "password": password }))
            .send()
            .map_err(|e| HookError::remote(format!("login request failed: {}", e)))?;
        let resp = check_status(resp, "login")?;
        let login: LoginResponse = resp
            .json()
            .map_err(|e| HookError::remote(format!("bad login response: {}", e)))?;

        if let Err(e) = self
            .config
            .token_cache
            .store(&login.access_token, login.expires, unix_now())
        {
            log::warn!("{}", e);
        }
        Ok(Some(login.access_token))
    }

    fn token(&self) -> Result<(Option<String>, bool)> {
        if let Some(token) = self.config.token_cache.valid_token(unix_now()) {
            return Ok((Some(token), true));
        }
        Ok((self.login()?, false))
    }

    fn request(&self, target: &Target, token: Option<&str>) -> Result<RequestBuilder> {
        let url = format!("{}/{}", self.config.url, DETECT_QUERY);
        let mut req = self.http.post(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        let req = match target {
            Target::File(path) => {
                let body = request_body(&stream_name(target), &self.stream_options, &self.ml_overrides);
                let form = multipart::Form::new()
                    .file("file", path)
                    .map_err(|e| HookError::remote(format!("cannot read {}: {}", path.display(), e)))?
                    .text("json", body.to_string());
                req.multipart(form)
            }
            Target::Event(_) => {
                req.json(&request_body(&stream_name(target), &self.stream_options, &self.ml_overrides))
            }
        };
        Ok(req)
    }
}

impl Detector for RemoteDetector {
    fn name(&self) -> &str {
        "remote"
    }

    fn detect(&self, target: &Target) -> Result<DetectionResult> {
        log::debug!(
            "Sending {} to gateway {} (mode {})",
            stream_name(target),
            self.config.url,
            self.config.mode
        );

        let (token, cached) = self.token()?;
        let send = |token: Option<&str>| {
            self.request(target, token)?
                .send()
                .map_err(|e| HookError::remote(format!("detect request failed: {}", e)))
        };

        let mut resp = send(token.as_deref())?;
        if resp.status() == StatusCode::UNAUTHORIZED && cached {
            log::debug!("Cached gateway token rejected, logging in again");
            let fresh = self.login()?;
            resp = send(fresh.as_deref())?;
        }

        let resp = check_status(resp, "detect")?;
        let body: JsonValue = resp
            .json()
            .map_err(|e| HookError::remote(format!("bad detect response: {}", e)))?;
        parse_response(&body, &self.zones)
    }
}

/// Blocking client shared by the gateway and platform API code
pub(crate) fn http_client(timeout: Duration, allow_self_signed: bool) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(allow_self_signed)
        .build()
}

fn check_status(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let text = resp.text().unwrap_or_default();
        Err(HookError::remote(format!("{} returned {}: {}", what, status, text)))
    }
}

fn to_json(value: &serde_yaml::Value) -> Result<JsonValue> {
    serde_json::to_value(value).map_err(|e| HookError::remote(format!("cannot encode request: {}", e)))
}

fn stream_name(target: &Target) -> String {
    match target {
        Target::File(path) => path.display().to_string(),
        Target::Event(id) => id.clone(),
    }
}

/// `stream_sequence` plus the zones as `polygons`
pub fn stream_options(stream_sequence: &serde_yaml::Value, zones: &[ZonePolygon]) -> Result<JsonValue> {
    let mut options = match to_json(stream_sequence)? {
        JsonValue::Object(map) => map,
        JsonValue::Null => serde_json::Map::new(),
        other => return Err(HookError::remote(format!("stream_sequence is not a mapping: {}", other))),
    };
    let polygons =
        serde_json::to_value(zones).map_err(|e| HookError::remote(format!("cannot encode zones: {}", e)))?;
    options.insert("polygons".to_string(), polygons);
    Ok(JsonValue::Object(options))
}

/// JSON object sent with every detect request
pub fn request_body(stream: &str, stream_options: &JsonValue, ml_overrides: &JsonValue) -> JsonValue {
    json!({
        "stream": stream,
        "stream_options": stream_options,
        "ml_overrides": ml_overrides,
    })
}

/// Convert a gateway reply into a [`DetectionResult`]
pub fn parse_response(body: &JsonValue, zones: &[ZonePolygon]) -> Result<DetectionResult> {
    let matched = body.get("matched_data").unwrap_or(body);
    if matched.is_null() {
        let mut result = DetectionResult::empty("snapshot");
        result.polygons = zones.to_vec();
        return Ok(result);
    }

    let data: GatewayMatch = serde_json::from_value(matched.clone())
        .map_err(|e| HookError::remote(format!("unexpected detect response: {}", e)))?;

    if data.labels.len() != data.boxes.len() || data.labels.len() != data.confidences.len() {
        return Err(HookError::remote(format!(
            "mismatched response: {} labels, {} boxes, {} confidences",
            data.labels.len(),
            data.boxes.len(),
            data.confidences.len()
        )));
    }

    let frame_id = match data.frame_id {
        Some(JsonValue::String(s)) => s,
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => "snapshot".to_string(),
    };
    let image_dimensions: ImageDimensions = data
        .image_dimensions
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    let detections = data
        .labels
        .into_iter()
        .zip(data.boxes)
        .zip(data.confidences)
        .enumerate()
        .map(|(i, ((label, b), confidence))| Detection {
            label,
            bbox: [b[0].round() as i64, b[1].round() as i64, b[2].round() as i64, b[3].round() as i64],
            confidence,
            model_name: data.model_names.get(i).cloned().unwrap_or_else(|| "remote".to_string()),
        })
        .collect();

    Ok(DetectionResult {
        frame_id,
        detections,
        image_dimensions,
        polygons: zones.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TempDir;
    use parking_lot::Mutex;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    /// One request as seen by the fake gateway
    #[derive(Debug, Clone)]
    struct Seen {
        line: String,
        authorization: Option<String>,
        body: String,
    }

    /// Serves scripted `(status, body)` replies, one connection each
    fn fake_gateway(replies: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        std::thread::spawn(move || {
            for (status, body) in replies {
                let Ok((stream, _)) = listener.accept() else { return };
                let mut reader = BufReader::new(stream);

                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let mut authorization = None;
                let mut length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    let header = header.trim_end();
                    if header.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        match name.trim().to_ascii_lowercase().as_str() {
                            "authorization" => authorization = Some(value.trim().to_string()),
                            "content-length" => length = value.trim().parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                }
                let mut buf = vec![0u8; length];
                reader.read_exact(&mut buf).unwrap();

                log.lock().push(Seen {
                    line: line.trim_end().to_string(),
                    authorization,
                    body: String::from_utf8_lossy(&buf).into_owned(),
                });

                let reason = if status == 200 { "OK" } else { "Unauthorized" };
                let reply = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let mut stream = reader.into_inner();
                stream.write_all(reply.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });

        (url, seen)
    }

    const DETECTED: &str = r#"{"matched_data": {"labels": ["person"], "boxes": [[1, 2, 30, 40]], "confidences": [0.9], "frame_id": "alarm"}}"#;

    fn gateway(url: &str, cache_dir: &TempDir, credentials: bool) -> GatewayConfig {
        GatewayConfig {
            url: url.to_string(),
            user: credentials.then(|| "admin".to_string()),
            password: credentials.then(|| "secret".to_string()),
            timeout: Duration::from_secs(5),
            mode: "image".to_string(),
            allow_self_signed: false,
            token_cache: TokenCache::in_dir(cache_dir.path()),
        }
    }

    fn detector(config: GatewayConfig) -> RemoteDetector {
        let ml: serde_yaml::Value = serde_yaml::from_str("{general: {model_sequence: object}}").unwrap();
        RemoteDetector::new(config, &ml, &serde_yaml::Value::Null, Vec::new()).unwrap()
    }

    const DETECT_LINE: &str =
        "POST /detect/object?type=object&delete=true&response_format=new HTTP/1.1";

    #[test]
    fn test_login_then_cached_token_is_reused() {
        let cache = TempDir::new("gateway_login");
        let (url, seen) = fake_gateway(vec![
            (200, r#"{"access_token": "tok123", "expires": 3600}"#),
            (200, DETECTED),
            (200, DETECTED),
        ]);

        let result = detector(gateway(&url, &cache, true)).detect(&Target::event("42")).unwrap();
        assert_eq!(result.labels(), vec!["person"]);
        assert_eq!(result.frame_id, "alarm");

        // a second run picks the token up from the cache
        let again = detector(gateway(&url, &cache, true)).detect(&Target::event("42")).unwrap();
        assert_eq!(again.labels(), vec!["person"]);

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].line, "POST /login HTTP/1.1");
        let login: JsonValue = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(login["username"], "admin");
        assert_eq!(login["password"], "secret");
        for request in &seen[1..] {
            assert_eq!(request.line, DETECT_LINE);
            assert_eq!(request.authorization.as_deref(), Some("Bearer tok123"));
        }
        let body: JsonValue = serde_json::from_str(&seen[1].body).unwrap();
        assert_eq!(body["stream"], "42");
        assert!(body["stream_options"]["polygons"].is_array());
    }

    #[test]
    fn test_rejected_cached_token_logs_in_again() {
        let cache = TempDir::new("gateway_relogin");
        TokenCache::in_dir(cache.path()).store("stale", 3600, unix_now()).unwrap();
        let (url, seen) = fake_gateway(vec![
            (401, r#"{"msg": "token expired"}"#),
            (200, r#"{"access_token": "fresh", "expires": 3600}"#),
            (200, DETECTED),
        ]);

        let result = detector(gateway(&url, &cache, true)).detect(&Target::event("7")).unwrap();
        assert_eq!(result.labels(), vec!["person"]);

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer stale"));
        assert_eq!(seen[1].line, "POST /login HTTP/1.1");
        assert_eq!(seen[2].authorization.as_deref(), Some("Bearer fresh"));
        assert_eq!(
            TokenCache::in_dir(cache.path()).valid_token(unix_now()).as_deref(),
            Some("fresh")
        );
    }

    #[test]
    fn test_no_credentials_skips_login() {
        let cache = TempDir::new("gateway_anon");
        let (url, seen) = fake_gateway(vec![(200, DETECTED)]);

        detector(gateway(&url, &cache, false)).detect(&Target::event("9")).unwrap();
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].line, DETECT_LINE);
        assert_eq!(seen[0].authorization, None);
    }

    #[test]
    fn test_unreachable_gateway_is_remote_error() {
        let cache = TempDir::new("gateway_down");
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{}", port);

        let err = detector(gateway(&url, &cache, false))
            .detect(&Target::event("1"))
            .unwrap_err();
        assert!(matches!(err, HookError::Remote(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_failed_login_is_remote_error() {
        let cache = TempDir::new("gateway_badlogin");
        let (url, _) = fake_gateway(vec![(401, r#"{"msg": "bad credentials"}"#)]);

        let err = detector(gateway(&url, &cache, true)).detect(&Target::event("1")).unwrap_err();
        assert!(matches!(err, HookError::Remote(_)));
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "matched_data": {
                "labels": ["person", "car"],
                "boxes": [[10, 20, 110, 220], [5.4, 5.6, 50, 60]],
                "confidences": [0.91, 0.55],
                "model_names": ["yolov4", "yolov4"],
                "frame_id": "alarm",
                "image_dimensions": {"original": [1080, 1920], "resized": [450, 800]}
            },
            "all_matches": []
        });

        let result = parse_response(&body, &[]).unwrap();
        assert_eq!(result.frame_id, "alarm");
        assert_eq!(result.labels(), vec!["person", "car"]);
        assert_eq!(result.boxes()[1], [5, 6, 50, 60]);
        assert_eq!(result.model_names(), vec!["yolov4", "yolov4"]);
        assert_eq!(result.image_dimensions.original, Some([1080, 1920]));
    }

    #[test]
    fn test_parse_response_numeric_frame_and_empty() {
        let body = json!({"matched_data": {"labels": [], "boxes": [], "confidences": [], "frame_id": 37}});
        let result = parse_response(&body, &[]).unwrap();
        assert_eq!(result.frame_id, "37");
        assert!(result.is_empty());

        let result = parse_response(&json!({"matched_data": null}), &[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_parse_response_rejects_mismatch() {
        let body = json!({"matched_data": {"labels": ["person"], "boxes": [], "confidences": [0.9]}});
        let err = parse_response(&body, &[]).unwrap_err();
        assert!(matches!(err, HookError::Remote(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_stream_options_carry_polygons() {
        let stream: serde_yaml::Value = serde_yaml::from_str("{frame_set: 'snapshot,alarm', resize: 800}").unwrap();
        let zone = ZonePolygon::new("Front Yard", vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]);
        let options = stream_options(&stream, &[zone]).unwrap();

        assert_eq!(options["resize"], 800);
        assert_eq!(options["polygons"][0]["name"], "front_yard");
        assert_eq!(options["polygons"][0]["value"][1], json!([10.0, 0.0]));
        assert!(options["polygons"][0]["pattern"].is_null());

        let body = request_body("42", &options, &json!({"general": {}}));
        assert_eq!(body["stream"], "42");
        assert!(body["ml_overrides"]["general"].is_object());
    }

    #[test]
    fn test_gateway_config_from_resolved() {
        let mut config = ResolvedConfig::new();
        assert!(GatewayConfig::from_config(&config).is_none());

        config.set("ml_gateway", serde_yaml::Value::String("http://gpu:5000/api/v1/".into()));
        config.set("ml_timeout", serde_yaml::Value::Number(5i64.into()));
        config.set("base_data_path", serde_yaml::Value::String("/tmp/zmes".into()));
        let gateway = GatewayConfig::from_config(&config).unwrap();
        assert_eq!(gateway.url, "http://gpu:5000/api/v1");
        assert_eq!(gateway.timeout, Duration::from_secs(5));
        assert_eq!(gateway.user, None);
        assert_eq!(gateway.token_cache.path(), Path::new("/tmp/zmes/zm_login.json"));
    }
}
