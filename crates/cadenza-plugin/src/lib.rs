//! Plugin contract and LV2 adapter for the Cadenza plugin host
//!
//! Every plugin format is wrapped in an adapter implementing [`Plugin`]. The
//! adapter owns a [`PluginCommon`] with the state every format shares
//! (parameters, programs, custom data, post-processing) and translates the
//! format's own model onto it.
//!
//! - [`lv2`]: the LV2 adapter, its URID table, atom sequences, worker and state
//! - [`StateSave`]: the XML plugin state stored in projects
//! - [`UiBridge`]: out-of-process plugin UIs over the [`UiMessage`] text protocol

pub mod error;
pub use error::{LoadStage, PluginError, Result};

pub mod custom_data;
pub use custom_data::CustomData;

pub mod hints;
pub use hints::{ParameterHints, PluginHints, PluginOptions};

pub mod parameter;
pub use parameter::{Parameter, ParameterData, ParameterRanges, ParameterSpecial, ParameterType};

mod program;
pub use program::{MidiProgramData, MidiProgramList, ProgramList};

pub mod state;
pub use state::{StateParameter, StateSave};

mod plugin;
pub use plugin::{
    guard_native, EngineInit, Plugin, PluginCommon, PluginInit, PluginPorts, PostProcessing,
    PostRtEvent, ProcessContext, ProjectFolder,
};

pub mod protocol;
pub use protocol::{UiMessage, UiMessageReader};

mod ui_bridge;
pub use ui_bridge::{BridgeState, UiBridge};

pub mod lv2;
pub use lv2::Lv2Plugin;
