//! Plugin host engine for Cadenza
//!
//! The [`Engine`] owns the plugin registry and drives it from a [`Driver`]:
//!
//! - lifecycle: add, remove, replace, clone, switch and rename plugins
//! - realtime dispatch in rack or patchbay mode
//! - the patchbay graph and its connections
//! - project save and load
//!
//! ```ignore
//! use cadenza_engine::{Engine, PluginFactory};
//!
//! let engine = Engine::new(EngineOptions::default(), PluginFactory::with_lv2(world));
//! engine.init(DummyDriver::NAME)?;
//! engine.add_plugin(init)?;
//! engine.idle();
//! ```

mod action;
mod deletion;
mod driver;
mod engine;
mod factory;
pub mod graph;
mod names;
mod process;
mod project;
mod registry;

#[cfg(test)]
mod test_support;

pub use action::{PendingAction, PendingActionOpcode};
pub use cadenza_core::{Error, Result};
pub use driver::{Driver, DummyDriver};
pub use engine::{Engine, EngineBuilder, ENGINE_AUDIO_CHANNELS};
pub use factory::{
    bridge_binary_name, choose_instantiation, find_bridge_binary, BridgeConstructor,
    Instantiation, PluginConstructor, PluginFactory,
};
pub use graph::{GroupPosition, PatchbayConnection, PatchbayGraph, PatchbayGroup, PatchbayPort};
pub use names::{unique_plugin_name, MAX_PLUGIN_NAME_LENGTH};
pub use project::{binary_type_from_file, find_binary_in_paths};
pub use registry::PluginSlot;
