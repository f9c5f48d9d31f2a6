//! Error types for cadenza-core.

use thiserror::Error;

/// Error type for engine-level operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid plugin id {id} (current count is {count})")]
    InvalidPluginId { id: u32, count: u32 },

    #[error("Invalid option value for {option}: {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("Cannot set this option while engine is running!")]
    OptionWhileRunning,

    #[error("An operation is still being processed, please wait for it to finish")]
    OperationPending,

    #[error("Maximum number of plugins reached")]
    MaxPluginsReached,

    #[error("Invalid plugin binary or type: {0}")]
    InvalidPluginType(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Project load canceled")]
    Canceled,

    #[error("Not a valid Carla project or preset file")]
    InvalidProject,

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Patchbay error: {0}")]
    Patchbay(String),

    #[error("{0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidPluginId { id: 4, count: 2 };
        assert!(err.to_string().contains("4"));

        assert_eq!(Error::Canceled.to_string(), "Project load canceled");
        assert_eq!(
            Error::InvalidProject.to_string(),
            "Not a valid Carla project or preset file"
        );
    }

    #[test]
    fn test_plugin_error_passthrough() {
        let err = Error::Plugin("Plugin requires feature 'x'".into());
        assert_eq!(err.to_string(), "Plugin requires feature 'x'");
    }
}
