//! zmes-hook
//!
//! Object detection hook for ZoneMinder events.
//! Resolves a layered YAML configuration (secrets, per-monitor overrides,
//! zones), runs the configured model sequence locally or through a remote
//! inference gateway, and renders the result in the wire format the event
//! server parses.
//!
//! The crate is split the way a run flows:
//! - [`config`]: file → [`config::RunContext`]
//! - [`detect`]: context + target → [`detect::DetectionResult`]
//! - [`output`]: result → `<prefix>detected:<labels>--SPLIT--<json>`
//! - [`platform`]: notes, zones and event paths from the surveillance platform

pub mod config;
pub mod detect;
mod error;
pub mod output;
pub mod platform;

#[cfg(test)]
mod test_util;

pub use config::{ConfigResolver, ResolvedConfig, RunContext, ZonePolygon};
pub use detect::{BackendRegistry, DetectionResult, Detector, Dispatcher, ModelBackend, Target};
pub use error::{HookError, Result};
pub use output::{format_detection, SPLIT};
pub use platform::PlatformClient;

/// Crate version, printed by `--bareversion`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
