//! Local / remote selection with fallback
//!
//! ```text
//! INIT ─┬─> REMOTE ─┬─> DONE
//!       │           └─> FALLBACK_LOCAL ─> DONE | FAILED
//!       │           └─> FAILED
//!       └─> LOCAL ────> DONE | FAILED
//! ```

use std::fmt;
use std::sync::Arc;

use super::{BackendRegistry, DetectionResult, Detector, LocalDetector, Target};
use crate::config::RunContext;
use crate::Result;

/// Where a dispatch run is, or where it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Init,
    Local,
    Remote,
    FallbackLocal,
    Done,
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchState::Init => "INIT",
            DispatchState::Local => "LOCAL",
            DispatchState::Remote => "REMOTE",
            DispatchState::FallbackLocal => "FALLBACK_LOCAL",
            DispatchState::Done => "DONE",
            DispatchState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Successful dispatch
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: DetectionResult,
    /// The state that produced the result (`Local`, `Remote` or `FallbackLocal`)
    pub via: DispatchState,
}

/// Chooses the detector for a run and applies the fallback policy
pub struct Dispatcher {
    remote: Option<Box<dyn Detector>>,
    local: Box<dyn Detector>,
    fallback_local: bool,
}

impl Dispatcher {
    pub fn new(remote: Option<Box<dyn Detector>>, local: Box<dyn Detector>, fallback_local: bool) -> Self {
        Self {
            remote,
            local,
            fallback_local,
        }
    }

    /// Wire up local and (when `ml_gateway` is set) remote detectors
    pub fn from_context(ctx: &RunContext, registry: BackendRegistry) -> Result<Self> {
        let local = LocalDetector::from_context(ctx, Arc::new(registry))?;
        let fallback_local = ctx.config.is_yes("ml_fallback_local");
        Ok(Self::new(remote_detector(ctx)?, Box::new(local), fallback_local))
    }

    /// Run detection for `target`
    ///
    /// An empty result is a normal outcome. Errors are returned only when the
    /// run ends in `FAILED`.
    pub fn run(&self, target: &Target) -> Result<DispatchOutcome> {
        let mut state = DispatchState::Init;

        if let Some(remote) = &self.remote {
            transition(&mut state, DispatchState::Remote);
            match remote.detect(target) {
                Ok(result) => return Ok(finish(&mut state, result)),
                Err(e) if self.fallback_local => {
                    log::warn!("Remote detection failed ({}), falling back to local", e);
                    transition(&mut state, DispatchState::FallbackLocal);
                }
                Err(e) => {
                    log::error!("Remote detection failed: {}", e);
                    transition(&mut state, DispatchState::Failed);
                    return Err(e);
                }
            }
        } else {
            transition(&mut state, DispatchState::Local);
        }

        match self.local.detect(target) {
            Ok(result) => Ok(finish(&mut state, result)),
            Err(e) => {
                log::error!("{} detection failed: {}", self.local.name(), e);
                transition(&mut state, DispatchState::Failed);
                Err(e)
            }
        }
    }
}

fn transition(state: &mut DispatchState, next: DispatchState) {
    log::debug!("dispatch: {} -> {}", state, next);
    *state = next;
}

fn finish(state: &mut DispatchState, result: DetectionResult) -> DispatchOutcome {
    let via = *state;
    transition(state, DispatchState::Done);
    log::debug!("{} detections via {}", result.detections.len(), via);
    DispatchOutcome { result, via }
}

#[cfg(feature = "remote")]
fn remote_detector(ctx: &RunContext) -> Result<Option<Box<dyn Detector>>> {
    Ok(super::RemoteDetector::from_context(ctx)?.map(|d| Box::new(d) as Box<dyn Detector>))
}

#[cfg(not(feature = "remote"))]
fn remote_detector(ctx: &RunContext) -> Result<Option<Box<dyn Detector>>> {
    if ctx.config.ml_gateway().is_some() {
        log::warn!("ml_gateway is set but remote support is not compiled in, using local models");
    }
    Ok(None)
}
