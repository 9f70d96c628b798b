//! Detection dispatch
//!
//! Two detector variants implement one [`Detector`] contract:
//!
//! - [`LocalDetector`] runs the configured model sequence through
//!   [`ModelBackend`]s looked up in a [`BackendRegistry`]
//! - `RemoteDetector` (feature `remote`) hands the image to an inference
//!   gateway over HTTP
//!
//! The [`Dispatcher`] picks between them and applies the fallback policy.
//!
//! # Example
//!
//! ```ignore
//! use zmes_hook::detect::{BackendRegistry, Dispatcher, Target};
//!
//! let registry = BackendRegistry::new();
//! let dispatcher = Dispatcher::from_context(&ctx, registry)?;
//! let outcome = dispatcher.run(&Target::file("/tmp/snapshot.jpg"))?;
//! ```

pub mod dispatcher;
pub mod geometry;
pub mod local;
#[cfg(feature = "remote")]
pub mod remote;
pub mod sequence;
pub mod token_cache;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ZonePolygon;
use crate::Result;

pub use dispatcher::{DispatchOutcome, DispatchState, Dispatcher};
pub use geometry::BoundingBox;
pub use local::LocalDetector;
#[cfg(feature = "remote")]
pub use remote::{GatewayConfig, RemoteDetector};
pub use sequence::{FrameStrategy, MlSequence, ModelDescriptor, ModelStrategy, StreamSequence};

/// A single labeled box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub model_name: String,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BoundingBox, confidence: f64) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence,
            model_name: String::new(),
        }
    }
}

/// Image sizes as `[height, width]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resized: Option<[u32; 2]>,
}

impl ImageDimensions {
    /// Pixel area of the original image, if known
    pub fn area(&self) -> Option<i64> {
        self.original.map(|[h, w]| h as i64 * w as i64)
    }
}

/// Outcome of one detection run
///
/// Detections are stored as whole records, so every per-detection sequence
/// (`labels`, `boxes`, `confidences`, `model_names`) has the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub frame_id: String,
    pub detections: Vec<Detection>,
    pub image_dimensions: ImageDimensions,
    /// Zones that were applied
    pub polygons: Vec<ZonePolygon>,
}

impl DetectionResult {
    pub fn empty(frame_id: impl Into<String>) -> Self {
        Self {
            frame_id: frame_id.into(),
            detections: Vec::new(),
            image_dimensions: ImageDimensions::default(),
            polygons: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.detections.iter().map(|d| d.label.as_str()).collect()
    }

    pub fn boxes(&self) -> Vec<BoundingBox> {
        self.detections.iter().map(|d| d.bbox).collect()
    }

    pub fn confidences(&self) -> Vec<f64> {
        self.detections.iter().map(|d| d.confidence).collect()
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.detections.iter().map(|d| d.model_name.as_str()).collect()
    }

    /// Replace detections with synthetic ones for `labels`
    pub fn fake(&mut self, labels: &[String]) {
        self.detections = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let offset = 100 * i as i64;
                Detection::new(label.clone(), [50 + offset, 50, 150 + offset, 200], 0.996)
            })
            .collect();
    }
}

/// What to run detection on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A local image file
    File(PathBuf),
    /// An event stored on the platform
    Event(String),
}

impl Target {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Target::File(path.into())
    }

    pub fn event(id: impl Into<String>) -> Self {
        Target::Event(id.into())
    }
}

/// One frame handed to a model backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef {
    pub target: Target,
    /// `snapshot`, `alarm` or a frame number
    pub frame_id: String,
}

/// What a backend returns for one frame
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    pub detections: Vec<Detection>,
    pub dimensions: ImageDimensions,
}

/// Inference for one framework (OpenCV DNN, Coral, face, ALPR ...)
pub trait ModelBackend: Send + Sync {
    /// Framework name this backend serves, lower-case
    fn framework(&self) -> &str;

    /// Run `model` against one frame
    fn detect(&self, frame: &FrameRef, category: &str, model: &ModelDescriptor) -> Result<ModelOutput>;
}

/// Model backends keyed by framework
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn ModelBackend>>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its framework name
    pub fn register(&mut self, backend: Box<dyn ModelBackend>) {
        let framework = backend.framework().to_lowercase();
        log::debug!("Registering model backend {}", framework);
        self.backends.insert(framework, backend);
    }

    pub fn get(&self, framework: &str) -> Option<&dyn ModelBackend> {
        self.backends
            .get(&framework.to_lowercase())
            .map(|b| b.as_ref())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Common contract of the local and remote detectors
pub trait Detector: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    fn detect(&self, target: &Target) -> Result<DetectionResult>;
}
