//! # Cadenza - Real-time Plugin Host Engine
//!
//! Hosts audio plugins behind one uniform contract and drives them from an audio callback.
//!
//! ## Architecture
//!
//! Cadenza is an umbrella crate that coordinates:
//! - **cadenza-core** - Options, callbacks, events, transport, ring buffers, project XML reader
//! - **cadenza-plugin** - Plugin contract, LV2 adapter, plugin state, UI bridge protocol
//! - **cadenza-engine** - Plugin registry, rack and patchbay processing, project files
//!
//! ## Quick Start
//!
//! ```ignore
//! use cadenza::prelude::*;
//!
//! let engine = HostBuilder::default().lv2_world(world).start()?;
//!
//! let id = engine.add_plugin(PluginInit {
//!     binary_type: BinaryType::native(),
//!     plugin_type: PluginType::Lv2,
//!     label: "http://lv2plug.in/plugins/eg-amp".into(),
//!     ..Default::default()
//! })?;
//! engine.get_plugin(id)?.set_parameter_value(0, 0.5, false, false);
//! engine.save_project(Path::new("session.carxp"))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Engine with in-process LV2 worlds
//! - `native-lv2` - Bind real LV2 binaries through `libloading`

/// Re-export of cadenza-core for direct access
pub use cadenza_core as core;

/// Re-export of cadenza-plugin for direct access
pub use cadenza_plugin as plugin;

/// Re-export of cadenza-engine for direct access
pub use cadenza_engine as engine;

// Core types
pub use cadenza_core::{
    BinaryType, CallbackEvent, EngineCallback, EngineCallbackOpcode, EngineEvent, EngineOption,
    EngineOptions, EventBuffer, FileCallback, FileCallbackOpcode, PluginCategory, PluginType,
    ProcessMode, TimeInfo, TransportMode,
};

// Plugin contract
pub use cadenza_plugin::{
    CustomData, Plugin, PluginError, PluginHints, PluginInit, PluginOptions, StateSave,
};

// Engine
pub use cadenza_engine::{
    Driver, DummyDriver, Engine, EngineBuilder, PatchbayGraph, PluginFactory,
};

mod builder;
mod error;

pub use builder::HostBuilder;
pub use error::{Error, Result};

/// Convenience prelude for common imports
pub mod prelude {
    // Host
    pub use crate::{Engine, HostBuilder};

    // Plugins
    pub use crate::plugin::{Plugin, PluginInit, StateSave};
    pub use crate::core::{BinaryType, PluginType};

    // Configuration and notifications
    pub use crate::core::{CallbackEvent, EngineCallbackOpcode, EngineOptions, ProcessMode};

    pub use std::path::Path;
    pub use std::sync::Arc;
}
