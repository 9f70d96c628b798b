//! Error types for the detection hook
//!
//! Configuration failures are fatal and stop the run before detection starts.
//! Everything else degrades: remote failures may fall back to local models,
//! model failures drop that model, and output failures are only logged.

use std::path::PathBuf;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, HookError>;

/// Error type for config resolution, detection and output
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A config or secrets file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config or secrets file is not valid YAML
    #[error("Failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A string-encoded literal structure could not be parsed
    #[error("Literal parse error at offset {offset}: {message}")]
    Literal { offset: usize, message: String },

    /// The inference gateway could not be reached or returned garbage
    #[error("Remote detection failed: {0}")]
    Remote(String),

    /// A single model in a sequence failed to run
    #[error("Model '{model}' failed: {message}")]
    ModelExecution { model: String, message: String },

    /// Writing debug output, objects.json or notes failed
    #[error("Output write failed: {0}")]
    OutputWrite(String),

    /// The surveillance platform API returned an error
    #[error("Platform API error: {0}")]
    Platform(String),
}

impl HookError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        HookError::Config(message.into())
    }

    /// Create a remote detection error
    pub fn remote(message: impl Into<String>) -> Self {
        HookError::Remote(message.into())
    }

    /// Create a model execution error
    pub fn model(model: impl Into<String>, message: impl Into<String>) -> Self {
        HookError::ModelExecution {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Create a platform API error
    pub fn platform(message: impl Into<String>) -> Self {
        HookError::Platform(message.into())
    }

    /// Whether this error must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HookError::Config(_)
                | HookError::Io { .. }
                | HookError::Yaml { .. }
                | HookError::Literal { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(HookError::config("ml_sequence missing").is_fatal());
        assert!(HookError::Literal {
            offset: 3,
            message: "unexpected ']'".to_string()
        }
        .is_fatal());
        let io = HookError::Io {
            path: PathBuf::from("/nonexistent.yml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(io.is_fatal());
    }

    #[test]
    fn test_runtime_errors_are_not_fatal() {
        assert!(!HookError::remote("timeout").is_fatal());
        assert!(!HookError::model("yolo", "weights missing").is_fatal());
        assert!(!HookError::OutputWrite("disk full".to_string()).is_fatal());
        assert!(!HookError::platform("401").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = HookError::model("yolov4", "weights not found");
        let s = err.to_string();
        assert!(s.contains("yolov4"));
        assert!(s.contains("weights not found"));

        let err = HookError::Literal {
            offset: 7,
            message: "expected ':'".to_string(),
        };
        assert!(err.to_string().contains("offset 7"));
    }
}
