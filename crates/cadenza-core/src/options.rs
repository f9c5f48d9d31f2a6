//! Engine options and the validated option setter.
//!
//! Project files and the live API both go through [`EngineOptions::set_option`],
//! so a value outside its accepted range never reaches the engine.

use crate::types::PluginType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum plugin count for the single/multiple client modes.
pub const MAX_DEFAULT_PLUGINS: u32 = 99;
/// Maximum plugin count for the continuous rack.
pub const MAX_RACK_PLUGINS: u32 = 16;
/// Maximum plugin count for the patchbay.
pub const MAX_PATCHBAY_PLUGINS: u32 = 255;
/// Default parameter limit per plugin.
pub const MAX_DEFAULT_PARAMETERS: u32 = 200;

/// How plugins are exposed to the audio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProcessMode {
    SingleClient = 0,
    MultipleClients = 1,
    ContinuousRack = 2,
    #[default]
    Patchbay = 3,
    Bridge = 4,
}

impl ProcessMode {
    pub fn from_index(value: i32) -> Option<Self> {
        match value {
            0 => Some(ProcessMode::SingleClient),
            1 => Some(ProcessMode::MultipleClients),
            2 => Some(ProcessMode::ContinuousRack),
            3 => Some(ProcessMode::Patchbay),
            4 => Some(ProcessMode::Bridge),
            _ => None,
        }
    }

    /// Slot capacity of the plugin registry in this mode.
    pub fn max_plugin_number(self) -> u32 {
        match self {
            ProcessMode::ContinuousRack => MAX_RACK_PLUGINS,
            ProcessMode::Patchbay => MAX_PATCHBAY_PLUGINS,
            ProcessMode::Bridge => 1,
            ProcessMode::SingleClient | ProcessMode::MultipleClients => MAX_DEFAULT_PLUGINS,
        }
    }
}

/// Source of transport information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportMode {
    Disabled = 0,
    #[default]
    Internal = 1,
    Jack = 2,
    Plugin = 3,
    Bridge = 4,
}

impl TransportMode {
    pub fn from_index(value: i32) -> Option<Self> {
        match value {
            0 => Some(TransportMode::Disabled),
            1 => Some(TransportMode::Internal),
            2 => Some(TransportMode::Jack),
            3 => Some(TransportMode::Plugin),
            4 => Some(TransportMode::Bridge),
            _ => None,
        }
    }
}

/// Identifier of a settable engine option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOption {
    ProcessMode,
    TransportMode,
    ForceStereo,
    PreferPluginBridges,
    PreferUiBridges,
    UisAlwaysOnTop,
    MaxParameters,
    UiBridgesTimeout,
    AudioBufferSize,
    AudioSampleRate,
    AudioTripleBuffer,
    AudioDevice,
    PluginPath,
    PathBinaries,
    PathResources,
}

impl std::fmt::Display for EngineOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Per-format plugin search paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginPaths {
    pub ladspa: Option<String>,
    pub dssi: Option<String>,
    pub lv2: Option<String>,
    pub vst2: Option<String>,
    pub vst3: Option<String>,
    pub sf2: Option<String>,
    pub sfz: Option<String>,
}

impl PluginPaths {
    pub fn get(&self, ty: PluginType) -> Option<&str> {
        match ty {
            PluginType::Ladspa => self.ladspa.as_deref(),
            PluginType::Dssi => self.dssi.as_deref(),
            PluginType::Lv2 => self.lv2.as_deref(),
            PluginType::Vst2 => self.vst2.as_deref(),
            PluginType::Vst3 => self.vst3.as_deref(),
            PluginType::Sf2 => self.sf2.as_deref(),
            PluginType::Sfz => self.sfz.as_deref(),
            _ => None,
        }
    }

    fn slot_mut(&mut self, ty: PluginType) -> Option<&mut Option<String>> {
        match ty {
            PluginType::Ladspa => Some(&mut self.ladspa),
            PluginType::Dssi => Some(&mut self.dssi),
            PluginType::Lv2 => Some(&mut self.lv2),
            PluginType::Vst2 => Some(&mut self.vst2),
            PluginType::Vst3 => Some(&mut self.vst3),
            PluginType::Sf2 => Some(&mut self.sf2),
            PluginType::Sfz => Some(&mut self.sfz),
            _ => None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub process_mode: ProcessMode,
    pub transport_mode: TransportMode,
    pub force_stereo: bool,
    pub prefer_plugin_bridges: bool,
    pub prefer_ui_bridges: bool,
    pub uis_always_on_top: bool,
    pub max_parameters: u32,
    /// Milliseconds to wait for a UI bridge to answer.
    pub ui_bridges_timeout: u32,
    pub audio_buffer_size: u32,
    pub audio_sample_rate: u32,
    pub audio_triple_buffer: bool,
    pub audio_device: Option<String>,
    pub plugin_paths: PluginPaths,
    pub binary_dir: Option<PathBuf>,
    pub resource_dir: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            process_mode: ProcessMode::default(),
            transport_mode: TransportMode::default(),
            force_stereo: false,
            prefer_plugin_bridges: false,
            prefer_ui_bridges: true,
            uis_always_on_top: false,
            max_parameters: MAX_DEFAULT_PARAMETERS,
            ui_bridges_timeout: 4000,
            audio_buffer_size: 512,
            audio_sample_rate: 44100,
            audio_triple_buffer: false,
            audio_device: None,
            plugin_paths: PluginPaths::default(),
            binary_dir: None,
            resource_dir: None,
        }
    }
}

fn invalid(option: EngineOption, reason: impl Into<String>) -> Error {
    Error::InvalidOption {
        option: option.to_string(),
        reason: reason.into(),
    }
}

fn as_bool(option: EngineOption, value: i32) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(invalid(option, format!("{} is not a boolean", value))),
    }
}

fn non_negative(option: EngineOption, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| invalid(option, format!("{} is negative", value)))
}

impl EngineOptions {
    /// Apply one option change, rejecting values outside the accepted range.
    pub fn set_option(
        &mut self,
        option: EngineOption,
        value: i32,
        value_str: Option<&str>,
        running: bool,
    ) -> Result<()> {
        if running
            && matches!(
                option,
                EngineOption::ProcessMode
                    | EngineOption::AudioTripleBuffer
                    | EngineOption::AudioDevice
            )
        {
            return Err(Error::OptionWhileRunning);
        }

        // the rack is always stereo
        if self.process_mode == ProcessMode::ContinuousRack
            && option == EngineOption::ForceStereo
            && value == 0
        {
            tracing::debug!("ignoring request to un-force stereo in rack mode");
            return Ok(());
        }

        match option {
            EngineOption::ProcessMode => {
                self.process_mode = ProcessMode::from_index(value)
                    .ok_or_else(|| invalid(option, format!("unknown process mode {}", value)))?;
            }
            EngineOption::TransportMode => {
                self.transport_mode = TransportMode::from_index(value)
                    .ok_or_else(|| invalid(option, format!("unknown transport mode {}", value)))?;
            }
            EngineOption::ForceStereo => self.force_stereo = as_bool(option, value)?,
            EngineOption::PreferPluginBridges => {
                self.prefer_plugin_bridges = as_bool(option, value)?
            }
            EngineOption::PreferUiBridges => self.prefer_ui_bridges = as_bool(option, value)?,
            EngineOption::UisAlwaysOnTop => self.uis_always_on_top = as_bool(option, value)?,
            EngineOption::MaxParameters => self.max_parameters = non_negative(option, value)?,
            EngineOption::UiBridgesTimeout => {
                self.ui_bridges_timeout = non_negative(option, value)?
            }
            EngineOption::AudioBufferSize => {
                if value < 8 {
                    return Err(invalid(option, format!("{} is below 8 frames", value)));
                }
                self.audio_buffer_size = value as u32;
            }
            EngineOption::AudioSampleRate => {
                if value < 22050 {
                    return Err(invalid(option, format!("{} is below 22050 Hz", value)));
                }
                self.audio_sample_rate = value as u32;
            }
            EngineOption::AudioTripleBuffer => self.audio_triple_buffer = as_bool(option, value)?,
            EngineOption::AudioDevice => {
                let device = value_str.ok_or_else(|| invalid(option, "missing device name"))?;
                self.audio_device = Some(device.to_string());
            }
            EngineOption::PluginPath => {
                let ty = PluginType::from_index(value);
                let slot = self
                    .plugin_paths
                    .slot_mut(ty)
                    .ok_or_else(|| invalid(option, format!("plugin type {} has no path", value)))?;
                *slot = value_str.map(str::to_string);
            }
            EngineOption::PathBinaries => {
                self.binary_dir = Some(non_empty_path(option, value_str)?);
            }
            EngineOption::PathResources => {
                self.resource_dir = Some(non_empty_path(option, value_str)?);
            }
        }

        Ok(())
    }

    /// Check a whole configuration, as used before starting the engine.
    pub fn validate(&self) -> Result<()> {
        if self.audio_buffer_size < 8 {
            return Err(invalid(
                EngineOption::AudioBufferSize,
                format!("{} is below 8 frames", self.audio_buffer_size),
            ));
        }
        if self.audio_sample_rate < 22050 {
            return Err(invalid(
                EngineOption::AudioSampleRate,
                format!("{} is below 22050 Hz", self.audio_sample_rate),
            ));
        }
        Ok(())
    }
}

fn non_empty_path(option: EngineOption, value_str: Option<&str>) -> Result<PathBuf> {
    match value_str {
        Some(s) if !s.is_empty() => Ok(PathBuf::from(s)),
        _ => Err(invalid(option, "path must not be empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.process_mode, ProcessMode::Patchbay);
        assert_eq!(options.max_parameters, MAX_DEFAULT_PARAMETERS);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_bool_options_reject_other_values() {
        let mut options = EngineOptions::default();
        assert!(options
            .set_option(EngineOption::ForceStereo, 2, None, false)
            .is_err());
        assert!(options
            .set_option(EngineOption::ForceStereo, 1, None, false)
            .is_ok());
        assert!(options.force_stereo);
    }

    #[test]
    fn test_range_checks() {
        let mut options = EngineOptions::default();
        assert!(options
            .set_option(EngineOption::AudioBufferSize, 4, None, false)
            .is_err());
        assert!(options
            .set_option(EngineOption::AudioSampleRate, 8000, None, false)
            .is_err());
        assert!(options
            .set_option(EngineOption::MaxParameters, -1, None, false)
            .is_err());
        assert!(options
            .set_option(EngineOption::UiBridgesTimeout, 2500, None, false)
            .is_ok());
        assert_eq!(options.ui_bridges_timeout, 2500);
    }

    #[test]
    fn test_process_mode_locked_while_running() {
        let mut options = EngineOptions::default();
        let err = options
            .set_option(EngineOption::ProcessMode, 2, None, true)
            .unwrap_err();
        assert!(matches!(err, Error::OptionWhileRunning));
        assert_eq!(options.process_mode, ProcessMode::Patchbay);
    }

    #[test]
    fn test_rack_keeps_forced_stereo() {
        let mut options = EngineOptions {
            process_mode: ProcessMode::ContinuousRack,
            force_stereo: true,
            ..Default::default()
        };
        options
            .set_option(EngineOption::ForceStereo, 0, None, false)
            .unwrap();
        assert!(options.force_stereo);
    }

    #[test]
    fn test_plugin_paths() {
        let mut options = EngineOptions::default();
        options
            .set_option(
                EngineOption::PluginPath,
                PluginType::Lv2.index(),
                Some("/usr/lib/lv2"),
                false,
            )
            .unwrap();
        assert_eq!(options.plugin_paths.get(PluginType::Lv2), Some("/usr/lib/lv2"));
        assert!(options
            .set_option(EngineOption::PluginPath, PluginType::Jack.index(), Some("x"), false)
            .is_err());
        assert!(options
            .set_option(EngineOption::PathBinaries, 0, Some(""), false)
            .is_err());
    }

    #[test]
    fn test_options_serde_snapshot() {
        let options = EngineOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: EngineOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_max_plugin_number() {
        assert_eq!(ProcessMode::ContinuousRack.max_plugin_number(), 16);
        assert_eq!(ProcessMode::Patchbay.max_plugin_number(), 255);
        assert_eq!(ProcessMode::MultipleClients.max_plugin_number(), 99);
    }
}
