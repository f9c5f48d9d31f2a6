//! Centralized error type for the cadenza umbrella crate.
//!
//! Wraps the engine and plugin errors so `?` propagates across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] cadenza_core::Error),

    #[error("Plugin: {0}")]
    Plugin(#[from] cadenza_plugin::PluginError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
