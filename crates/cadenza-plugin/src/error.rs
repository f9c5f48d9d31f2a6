//! Error types for plugin adapters.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Scanning,
    Opening,
    Factory,
    Instantiation,
    Initialization,
    Setup,
    Activation,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Scanning => write!(f, "scanning"),
            LoadStage::Opening => write!(f, "opening library"),
            LoadStage::Factory => write!(f, "getting descriptor"),
            LoadStage::Instantiation => write!(f, "creating instance"),
            LoadStage::Initialization => write!(f, "initializing ports"),
            LoadStage::Setup => write!(f, "setting up buffers"),
            LoadStage::Activation => write!(f, "activating"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    LoadFailed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    #[error("Plugin requires feature '{0}' which is not supported")]
    MissingFeature(String),

    #[error("Plugin requires extension '{0}' which is not available")]
    MissingExtension(String),

    #[error("Failed to find the requested plugin: {0}")]
    NotFound(String),

    #[error("Invalid port {index}: {reason}")]
    InvalidPort { index: u32, reason: String },

    #[error("Parameter {0} out of range")]
    InvalidParameter(u32),

    #[error("Plugin does not support {0}")]
    Unsupported(String),

    #[error("Native plugin call panicked: {0}")]
    NativePanic(String),

    #[error("Failed to save plugin state: {0}")]
    StateSave(String),

    #[error("Failed to restore plugin state: {0}")]
    StateRestore(String),

    #[error("UI bridge error: {0}")]
    Bridge(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Descriptor cache error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, PluginError>;

impl From<PluginError> for cadenza_core::Error {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Io(io) => cadenza_core::Error::Io(io),
            other => cadenza_core::Error::Plugin(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_stage_display() {
        assert_eq!(LoadStage::Opening.to_string(), "opening library");
        assert_eq!(LoadStage::Instantiation.to_string(), "creating instance");
    }

    #[test]
    fn test_missing_feature_message() {
        let err = PluginError::MissingFeature("http://lv2plug.in/ns/ext/instance-access".into());
        assert_eq!(
            err.to_string(),
            "Plugin requires feature 'http://lv2plug.in/ns/ext/instance-access' which is not supported"
        );
    }

    #[test]
    fn test_converts_into_engine_error() {
        let err: cadenza_core::Error = PluginError::Unsupported("bridging".into()).into();
        assert_eq!(err.to_string(), "Plugin does not support bridging");
    }
}
