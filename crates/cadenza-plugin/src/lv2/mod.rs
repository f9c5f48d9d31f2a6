//! LV2 adapter.
//!
//! [`Lv2Plugin`] implements the [`Plugin`](crate::Plugin) contract on top of
//! an [`Lv2World`], which supplies plugin descriptions and native execution
//! units. With the `native-lv2` feature, [`NativeLv2World`] binds real LV2
//! binaries; tests use in-process worlds.

pub mod atom;
pub mod descriptor;
pub mod state;
pub mod urid;
pub mod worker;

mod plugin;
mod process;
mod ui;

#[cfg(feature = "native-lv2")]
mod native;

pub use atom::{AtomRef, AtomSequence};
pub use descriptor::{
    AtomSupports, HostFeatures, HostOptions, Lv2Catalog, Lv2Extensions, Lv2Instance, Lv2OptionValue,
    Lv2OptionsInterface, Lv2ParameterInfo, Lv2ParameterKind, Lv2PluginInfo, Lv2PortInfo,
    Lv2PresetInfo, Lv2ProgramsInterface, Lv2StateInterface, Lv2Status, Lv2UiInfo, Lv2UiType,
    Lv2Worker, Lv2World, PortBuffers, PortDesignation, PortKind, PortProperties, TimeField,
};
pub use plugin::Lv2Plugin;
pub use state::PathMapper;
pub use ui::UI_BRIDGE_PREFIX;
pub use urid::UridMap;

#[cfg(feature = "native-lv2")]
pub use native::{NativeLv2Instance, NativeLv2World};
