//! Local model-sequence execution

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use super::geometry::{box_area, box_intersects_polygon};
use super::sequence::{FrameStrategy, MlSequence, ModelDescriptor, ModelStrategy, StreamSequence};
use super::{BackendRegistry, Detection, DetectionResult, Detector, FrameRef, ImageDimensions, Target};
use crate::config::{RunContext, ZonePolygon};
use crate::{HookError, Result};

const DEFAULT_FRAMEWORK: &str = "opencv";

/// Compile a label pattern that must match from the start of the label
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})", pattern))
        .map_err(|e| HookError::config(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Pattern / ignore-pattern pair
#[derive(Debug, Clone)]
struct LabelFilter {
    pattern: Option<Regex>,
    ignore: Option<Regex>,
}

impl LabelFilter {
    fn new(pattern: Option<&str>, ignore: Option<&str>) -> Result<Self> {
        Ok(Self {
            pattern: pattern.map(anchored).transpose()?,
            ignore: ignore.map(anchored).transpose()?,
        })
    }

    fn accepts(&self, label: &str) -> bool {
        self.pattern.as_ref().map_or(true, |p| p.is_match(label))
            && !self.ignore.as_ref().is_some_and(|i| i.is_match(label))
    }
}

#[derive(Debug, Clone)]
struct CompiledZone {
    name: String,
    points: Vec<(f64, f64)>,
    filter: LabelFilter,
}

/// Runs the model sequence through registered backends
pub struct LocalDetector {
    ml: MlSequence,
    frames: Vec<String>,
    frame_strategy: FrameStrategy,
    registry: Arc<BackendRegistry>,
    zones: Vec<ZonePolygon>,
    compiled_zones: Vec<CompiledZone>,
    category_filters: Vec<LabelFilter>,
    max_parallel: usize,
}

impl LocalDetector {
    pub fn new(
        ml: MlSequence,
        stream: &StreamSequence,
        registry: Arc<BackendRegistry>,
        zones: Vec<ZonePolygon>,
    ) -> Result<Self> {
        let category_filters = ml
            .categories
            .iter()
            .map(|(_, cat)| {
                LabelFilter::new(
                    Some(cat.general.pattern.as_deref().unwrap_or(".*")),
                    cat.general.ignore_pattern.as_deref(),
                )
            })
            .collect::<Result<_>>()?;

        let compiled_zones = zones
            .iter()
            .map(|z| {
                Ok(CompiledZone {
                    name: z.name.clone(),
                    points: z.points.clone(),
                    filter: LabelFilter::new(z.pattern.as_deref(), z.ignore_pattern.as_deref())?,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            ml,
            frames: stream.frames(),
            frame_strategy: stream.frame_strategy()?,
            registry,
            zones,
            compiled_zones,
            category_filters,
            max_parallel: 1,
        })
    }

    /// Build from a resolved run context
    pub fn from_context(ctx: &RunContext, registry: Arc<BackendRegistry>) -> Result<Self> {
        let detector = Self::new(
            ctx.config.ml_sequence()?,
            &ctx.config.stream_sequence()?,
            registry,
            ctx.zones.clone(),
        )?;
        let parallel = ctx.config.get_int("cpu_max_processes").unwrap_or(1);
        Ok(detector.with_max_parallel(parallel.max(1) as usize))
    }

    /// Allow up to `n` union-strategy models to run at once
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    fn frame_score(&self, result: &DetectionResult) -> usize {
        match self.frame_strategy {
            FrameStrategy::First | FrameStrategy::Most => result.detections.len(),
            FrameStrategy::MostUnique => result
                .detections
                .iter()
                .map(|d| d.label.as_str())
                .collect::<HashSet<_>>()
                .len(),
            FrameStrategy::MostModels => result
                .detections
                .iter()
                .map(|d| d.model_name.as_str())
                .collect::<HashSet<_>>()
                .len(),
        }
    }

    fn detect_frame(&self, frame: &FrameRef) -> Result<DetectionResult> {
        let mut result = DetectionResult::empty(frame.frame_id.clone());
        result.polygons = self.zones.clone();

        for (index, (category, config)) in self.ml.categories.iter().enumerate() {
            let filter = &self.category_filters[index];
            let models: Vec<(usize, &ModelDescriptor)> = config.enabled_models().collect();
            if models.is_empty() {
                log::debug!("No enabled models for {}", category);
                continue;
            }

            match self.ml.strategy {
                ModelStrategy::First => {
                    let mut last_error = None;
                    let mut ran = false;
                    for &(i, model) in &models {
                        match self.run_model(frame, category, i, model, filter) {
                            Ok((detections, dims)) => {
                                ran = true;
                                merge_dimensions(&mut result.image_dimensions, dims);
                                if !detections.is_empty() {
                                    result.detections.extend(detections);
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("{}", e);
                                last_error = Some(e);
                            }
                        }
                    }
                    if let (false, Some(e)) = (ran, last_error) {
                        return Err(e);
                    }
                }
                ModelStrategy::Union => {
                    for output in self.run_all(frame, category, &models, filter) {
                        match output {
                            Ok((detections, dims)) => {
                                merge_dimensions(&mut result.image_dimensions, dims);
                                result.detections.extend(detections);
                            }
                            Err(e) => log::warn!("{}", e),
                        }
                    }
                }
            }
        }

        Ok(result)
    }

    /// Run every model; results come back in model order
    fn run_all(
        &self,
        frame: &FrameRef,
        category: &str,
        models: &[(usize, &ModelDescriptor)],
        filter: &LabelFilter,
    ) -> Vec<Result<(Vec<Detection>, ImageDimensions)>> {
        if self.max_parallel <= 1 || models.len() <= 1 {
            return models
                .iter()
                .map(|&(i, m)| self.run_model(frame, category, i, m, filter))
                .collect();
        }

        let slots: Mutex<Vec<Option<Result<(Vec<Detection>, ImageDimensions)>>>> =
            Mutex::new((0..models.len()).map(|_| None).collect());

        for (chunk_index, chunk) in models.chunks(self.max_parallel).enumerate() {
            std::thread::scope(|scope| {
                for (offset, &(i, model)) in chunk.iter().enumerate() {
                    let slot = chunk_index * self.max_parallel + offset;
                    let slots = &slots;
                    scope.spawn(move || {
                        let output = self.run_model(frame, category, i, model, filter);
                        slots.lock()[slot] = Some(output);
                    });
                }
            });
        }

        slots
            .into_inner()
            .into_iter()
            .zip(models)
            .map(|(slot, &(i, model))| {
                slot.unwrap_or_else(|| {
                    Err(HookError::model(model.display_name(category, i), "model did not run"))
                })
            })
            .collect()
    }

    /// Run one model and apply confidence, label, size and zone filters
    fn run_model(
        &self,
        frame: &FrameRef,
        category: &str,
        index: usize,
        model: &ModelDescriptor,
        filter: &LabelFilter,
    ) -> Result<(Vec<Detection>, ImageDimensions)> {
        let name = model.display_name(category, index);
        let framework = model
            .framework(category)
            .unwrap_or_else(|| DEFAULT_FRAMEWORK.to_string());
        let backend = self.registry.get(&framework).ok_or_else(|| {
            HookError::model(&name, format!("no backend registered for framework '{}'", framework))
        })?;

        log::debug!("Running {} model {} on frame {}", category, name, frame.frame_id);
        let output = backend.detect(frame, category, model)?;

        let min_confidence = model.min_confidence(category);
        let max_area = model
            .max_detection_size(category)
            .and_then(|spec| max_detection_area(&spec, output.dimensions.area()));

        let survivors = output
            .detections
            .into_iter()
            .filter_map(|mut d| {
                d.model_name = name.clone();
                if d.confidence < min_confidence {
                    log::debug!(
                        "{} dropped: confidence {:.2} below {:.2}",
                        d.label, d.confidence, min_confidence
                    );
                    return None;
                }
                if !filter.accepts(&d.label) {
                    log::debug!("{} dropped: does not match {} pattern", d.label, category);
                    return None;
                }
                if let Some(max) = max_area {
                    if box_area(&d.bbox) > max {
                        log::debug!("{} dropped: larger than max_detection_size", d.label);
                        return None;
                    }
                }
                if !self.in_zones(&d) {
                    log::debug!("{} dropped: outside every matching zone", d.label);
                    return None;
                }
                Some(d)
            })
            .collect::<Vec<_>>();

        log::debug!("{} produced {} detections after filtering", name, survivors.len());
        Ok((survivors, output.dimensions))
    }

    fn in_zones(&self, detection: &Detection) -> bool {
        if self.compiled_zones.is_empty() {
            return true;
        }
        self.compiled_zones.iter().any(|zone| {
            let hit = box_intersects_polygon(&detection.bbox, &zone.points)
                && zone.filter.accepts(&detection.label);
            if hit {
                log::debug!("{} matched zone {}", detection.label, zone.name);
            }
            hit
        })
    }
}

impl Detector for LocalDetector {
    fn name(&self) -> &str {
        "local"
    }

    fn detect(&self, target: &Target) -> Result<DetectionResult> {
        let frames = match target {
            Target::File(_) => vec!["snapshot".to_string()],
            Target::Event(_) => self.frames.clone(),
        };

        let mut best: Option<(usize, DetectionResult)> = None;
        for frame_id in frames {
            let frame = FrameRef {
                target: target.clone(),
                frame_id,
            };
            let result = self.detect_frame(&frame)?;
            if self.frame_strategy == FrameStrategy::First && !result.is_empty() {
                return Ok(result);
            }

            let score = self.frame_score(&result);
            match &best {
                Some((best_score, _)) if score <= *best_score => {}
                _ => best = Some((score, result)),
            }
        }

        Ok(best
            .map(|(_, r)| r)
            .unwrap_or_else(|| DetectionResult::empty("snapshot")))
    }
}

fn merge_dimensions(into: &mut ImageDimensions, from: ImageDimensions) {
    if into.original.is_none() {
        into.original = from.original;
    }
    if into.resized.is_none() {
        into.resized = from.resized;
    }
}

/// Largest allowed box area: `"90%"` of the image or an absolute pixel count
pub fn max_detection_area(spec: &str, image_area: Option<i64>) -> Option<i64> {
    let spec = spec.trim();
    if let Some(percent) = spec.strip_suffix('%') {
        let percent: f64 = percent.trim().parse().ok()?;
        let Some(area) = image_area else {
            log::debug!("max_detection_size {} ignored, image size unknown", spec);
            return None;
        };
        return Some((area as f64 * percent / 100.0) as i64);
    }
    spec.trim_end_matches("px").trim().parse::<f64>().ok().map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::mock::MockBackend;
    use crate::detect::sequence::StreamSequence;

    fn det(label: &str, bbox: [i64; 4], confidence: f64) -> Detection {
        Detection::new(label, bbox, confidence)
    }

    fn ml(strategy: &str, models: &str) -> MlSequence {
        let text = format!(
            "general: {{model_sequence: object, same_model_sequence_strategy: {}}}\nobject:\n  general: {{pattern: '(person|car|dog)'}}\n  sequence:\n{}",
            strategy, models
        );
        MlSequence::from_value(&serde_yaml::from_str(&text).unwrap()).unwrap()
    }

    const TWO_MODELS: &str = "    - {name: yolo, enabled: 'yes'}\n    - {name: tiny, enabled: 'yes'}\n";

    fn registry(backend: MockBackend) -> Arc<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(backend));
        Arc::new(registry)
    }

    fn backend() -> MockBackend {
        MockBackend::new("opencv")
            .with("yolo", vec![det("person", [10, 10, 50, 100], 0.9)])
            .with(
                "tiny",
                vec![det("car", [200, 200, 300, 260], 0.8), det("dog", [5, 5, 20, 20], 0.6)],
            )
    }

    fn detector(ml: MlSequence, backend: MockBackend, zones: Vec<ZonePolygon>) -> LocalDetector {
        LocalDetector::new(ml, &StreamSequence::default(), registry(backend), zones).unwrap()
    }

    #[test]
    fn test_first_stops_at_first_match() {
        let d = detector(ml("first", TWO_MODELS), backend(), vec![]);
        let result = d.detect(&Target::file("/tmp/x.jpg")).unwrap();
        assert_eq!(result.labels(), vec!["person"]);
        assert_eq!(result.model_names(), vec!["yolo"]);
        assert_eq!(result.frame_id, "snapshot");
    }

    #[test]
    fn test_union_merges_in_model_order() {
        let d = detector(ml("union", TWO_MODELS), backend(), vec![]);
        let result = d.detect(&Target::file("/tmp/x.jpg")).unwrap();
        assert_eq!(result.labels(), vec!["person", "car", "dog"]);
        assert_eq!(result.model_names(), vec!["yolo", "tiny", "tiny"]);
    }

    #[test]
    fn test_union_not_smaller_than_first() {
        let target = Target::file("/tmp/x.jpg");
        let first = detector(ml("first", TWO_MODELS), backend(), vec![]).detect(&target).unwrap();
        let union = detector(ml("union", TWO_MODELS), backend(), vec![]).detect(&target).unwrap();
        assert!(union.labels().len() >= first.labels().len());
    }

    #[test]
    fn test_parallel_union_is_deterministic() {
        let models = "    - {name: a, enabled: 'yes'}\n    - {name: b, enabled: 'yes'}\n    - {name: c, enabled: 'yes'}\n";
        let backend = || {
            MockBackend::new("opencv")
                .with("a", vec![det("person", [1, 1, 9, 9], 0.9)])
                .with("b", vec![det("car", [1, 1, 9, 9], 0.9)])
                .with("c", vec![det("dog", [1, 1, 9, 9], 0.9)])
        };
        for _ in 0..5 {
            let d = detector(ml("union", models), backend(), vec![]).with_max_parallel(2);
            let result = d.detect(&Target::file("/tmp/x.jpg")).unwrap();
            assert_eq!(result.model_names(), vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn test_min_confidence_drops_everything() {
        let models = "    - {name: yolo, enabled: 'yes', object_min_confidence: 0.99}\n";
        let d = detector(ml("first", models), backend(), vec![]);
        let result = d.detect(&Target::file("/tmp/x.jpg")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_disabled_model_yields_nothing() {
        let models = "    - {name: yolo, enabled: 'no'}\n";
        let backend = backend();
        let d = LocalDetector::new(
            ml("union", models),
            &StreamSequence::default(),
            registry(backend),
            vec![],
        )
        .unwrap();
        let result = d.detect(&Target::file("/tmp/x.jpg")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_category_pattern_is_prefix_anchored() {
        let text = "general: {model_sequence: object}\nobject:\n  general: {pattern: car}\n  sequence:\n    - {name: yolo}\n";
        let ml = MlSequence::from_value(&serde_yaml::from_str(text).unwrap()).unwrap();
        let backend = MockBackend::new("opencv").with(
            "yolo",
            vec![det("racecar", [1, 1, 9, 9], 0.9), det("carriage", [1, 1, 9, 9], 0.9)],
        );
        let result = detector(ml, backend, vec![]).detect(&Target::file("/x")).unwrap();
        assert_eq!(result.labels(), vec!["carriage"]);
    }

    #[test]
    fn test_zone_filtering() {
        let inside = ZonePolygon::new(
            "Front Yard",
            vec![(0.0, 0.0), (100.0, 0.0), (100.0, 120.0), (0.0, 120.0)],
        );
        let d = detector(ml("union", TWO_MODELS), backend(), vec![inside]);
        let result = d.detect(&Target::file("/x")).unwrap();
        // car box sits at 200..300, outside the zone
        assert_eq!(result.labels(), vec!["person", "dog"]);
        assert_eq!(result.polygons[0].name, "front_yard");
    }

    #[test]
    fn test_zone_patterns() {
        let mut zone = ZonePolygon::new("all", vec![(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)]);
        zone.pattern = Some("(person|dog)".to_string());
        zone.ignore_pattern = Some("dog".to_string());
        let d = detector(ml("union", TWO_MODELS), backend(), vec![zone]);
        let result = d.detect(&Target::file("/x")).unwrap();
        assert_eq!(result.labels(), vec!["person"]);
    }

    #[test]
    fn test_missing_backend_under_first_fails() {
        let models = "    - {name: yolo, object_framework: coral_edgetpu}\n";
        let d = detector(ml("first", models), backend(), vec![]);
        match d.detect(&Target::file("/x")) {
            Err(HookError::ModelExecution { model, .. }) => assert_eq!(model, "yolo"),
            other => panic!("expected model error, got {:?}", other),
        }
    }

    #[test]
    fn test_failing_model_skipped_under_union() {
        let d = detector(ml("union", TWO_MODELS), backend().failing("yolo"), vec![]);
        let result = d.detect(&Target::file("/x")).unwrap();
        assert_eq!(result.labels(), vec!["car", "dog"]);
    }

    #[test]
    fn test_failing_model_falls_through_under_first() {
        let d = detector(ml("first", TWO_MODELS), backend().failing("yolo"), vec![]);
        let result = d.detect(&Target::file("/x")).unwrap();
        assert_eq!(result.labels(), vec!["car", "dog"]);
    }

    #[test]
    fn test_max_detection_size() {
        let models = "    - {name: tiny, object_max_detection_size: '10%'}\n";
        // image is 480x640 = 307200 px, 10% = 30720; car box is 100x60 = 6000
        let d = detector(ml("first", models), backend(), vec![]);
        assert_eq!(d.detect(&Target::file("/x")).unwrap().labels().len(), 2);

        let models = "    - {name: tiny, object_max_detection_size: '1000'}\n";
        let d = detector(ml("first", models), backend(), vec![]);
        assert_eq!(d.detect(&Target::file("/x")).unwrap().labels(), vec!["dog"]);
    }

    #[test]
    fn test_max_detection_area() {
        assert_eq!(max_detection_area("50%", Some(1000)), Some(500));
        assert_eq!(max_detection_area("50%", None), None);
        assert_eq!(max_detection_area("2000px", None), Some(2000));
        assert_eq!(max_detection_area("big", Some(1000)), None);
    }

    #[test]
    fn test_event_frame_strategy() {
        let stream = StreamSequence::from_value(
            &serde_yaml::from_str("{frame_set: 'snapshot,alarm', strategy: most}").unwrap(),
        )
        .unwrap();

        struct PerFrame;
        impl crate::detect::ModelBackend for PerFrame {
            fn framework(&self) -> &str {
                "opencv"
            }
            fn detect(
                &self,
                frame: &FrameRef,
                _category: &str,
                _model: &ModelDescriptor,
            ) -> Result<crate::detect::ModelOutput> {
                let detections = if frame.frame_id == "alarm" {
                    vec![det("person", [1, 1, 9, 9], 0.9), det("car", [1, 1, 9, 9], 0.9)]
                } else {
                    vec![det("person", [1, 1, 9, 9], 0.9)]
                };
                Ok(crate::detect::ModelOutput {
                    detections,
                    ..Default::default()
                })
            }
        }

        let mut registry = BackendRegistry::new();
        registry.register(Box::new(PerFrame));
        let d = LocalDetector::new(ml("first", "    - {name: yolo}\n"), &stream, Arc::new(registry), vec![]).unwrap();

        let result = d.detect(&Target::event("42")).unwrap();
        assert_eq!(result.frame_id, "alarm");
        assert_eq!(result.labels().len(), 2);

        // a file target is always the snapshot
        let result = d.detect(&Target::file("/x")).unwrap();
        assert_eq!(result.frame_id, "snapshot");
    }

    #[test]
    fn test_invalid_zone_pattern_is_config_error() {
        let mut zone = ZonePolygon::new("z", vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]);
        zone.pattern = Some("(unclosed".to_string());
        let err = LocalDetector::new(ml("first", TWO_MODELS), &StreamSequence::default(), registry(backend()), vec![zone])
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
