//! Wire output
//!
//! `<prefix>detected:<labels>--SPLIT--<json>`, consumed by the event server.

use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::detect::{BoundingBox, DetectionResult, ImageDimensions};
use crate::{HookError, Result};

/// Separator between the human-readable part and the JSON payload
pub const SPLIT: &str = "--SPLIT--";

/// JSON payload; also the content of `objects.json`
#[derive(Debug, Serialize)]
pub struct DetectionPayload<'a> {
    pub labels: Vec<&'a str>,
    pub boxes: Vec<BoundingBox>,
    pub frame_id: &'a str,
    pub confidences: Vec<f64>,
    pub image_dimensions: &'a ImageDimensions,
}

impl<'a> DetectionPayload<'a> {
    pub fn new(result: &'a DetectionResult) -> Self {
        Self {
            labels: result.labels(),
            boxes: result.boxes(),
            frame_id: &result.frame_id,
            confidences: result.confidences(),
            image_dimensions: &result.image_dimensions,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| HookError::OutputWrite(format!("payload: {}", e)))
    }
}

/// `[s] ` for snapshot, `[a] ` for alarm, `[x] ` otherwise
pub fn frame_prefix(frame_id: &str) -> &'static str {
    match frame_id {
        "snapshot" => "[s] ",
        "alarm" => "[a] ",
        _ => "[x] ",
    }
}

/// Labels in first-seen order, with the confidence of the first occurrence
fn unique_labels(result: &DetectionResult) -> Vec<(&str, f64)> {
    let mut seen: Vec<(&str, f64)> = Vec::new();
    for d in &result.detections {
        if !seen.iter().any(|(l, _)| *l == d.label) {
            seen.push((d.label.as_str(), d.confidence));
        }
    }
    seen
}

/// Human-readable part: prefix, `detected:` and the label list
pub fn prediction_string(result: &DetectionResult, show_percent: bool) -> String {
    let labels = unique_labels(result);
    let joined = if show_percent {
        labels
            .iter()
            .map(|(l, c)| format!("{}:{:.0}% ", l, c * 100.0))
            .collect::<String>()
    } else {
        labels.iter().map(|(l, _)| *l).collect::<Vec<_>>().join(",")
    };
    format!("{}detected:{}", frame_prefix(&result.frame_id), joined)
}

/// Render the full wire string; empty when there is nothing to report
pub fn format_detection(result: &DetectionResult, config: &ResolvedConfig) -> Result<String> {
    if result.is_empty() {
        return Ok(String::new());
    }
    let show_percent = config.get_str("show_percent") == Some("yes");
    let json = DetectionPayload::new(result).to_json()?;
    Ok(format!("{}{}{}", prediction_string(result, show_percent), SPLIT, json))
}
