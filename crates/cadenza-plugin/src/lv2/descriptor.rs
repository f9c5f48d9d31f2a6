//! Static LV2 plugin description and the capability traits an LV2 binding provides.
//!
//! [`Lv2PluginInfo`] comes from a scan cache ([`Lv2Catalog`]). An [`Lv2World`]
//! turns it into one or more [`Lv2Instance`] execution units; optional
//! extensions are exposed as typed accessors resolved once per instance.

use super::state::PathMapper;
use super::urid::UridMap;
use super::worker::WorkerSchedule;
use crate::custom_data::CustomData;
use crate::error::Result;
use crate::hints::flags;
use cadenza_core::{PluginCategory, TimeInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub const LV2_CORE_PREFIX: &str = "http://lv2plug.in/ns/lv2core#";
pub const LV2_FEATURE_HARD_RT_CAPABLE: &str = "http://lv2plug.in/ns/lv2core#hardRTCapable";
pub const LV2_FEATURE_IN_PLACE_BROKEN: &str = "http://lv2plug.in/ns/lv2core#inPlaceBroken";
pub const LV2_FEATURE_IS_LIVE: &str = "http://lv2plug.in/ns/lv2core#isLive";
pub const LV2_FEATURE_URID_MAP: &str = "http://lv2plug.in/ns/ext/urid#map";
pub const LV2_FEATURE_URID_UNMAP: &str = "http://lv2plug.in/ns/ext/urid#unmap";
pub const LV2_FEATURE_OPTIONS: &str = "http://lv2plug.in/ns/ext/options#options";
pub const LV2_FEATURE_BOUNDED_BLOCK_LENGTH: &str =
    "http://lv2plug.in/ns/ext/buf-size#boundedBlockLength";
pub const LV2_FEATURE_FIXED_BLOCK_LENGTH: &str = "http://lv2plug.in/ns/ext/buf-size#fixedBlockLength";
pub const LV2_FEATURE_POWER_OF_2_BLOCK_LENGTH: &str =
    "http://lv2plug.in/ns/ext/buf-size#powerOf2BlockLength";
pub const LV2_FEATURE_WORKER_SCHEDULE: &str = "http://lv2plug.in/ns/ext/worker#schedule";
pub const LV2_FEATURE_STATE_MAKE_PATH: &str = "http://lv2plug.in/ns/ext/state#makePath";
pub const LV2_FEATURE_STATE_MAP_PATH: &str = "http://lv2plug.in/ns/ext/state#mapPath";
pub const LV2_FEATURE_STATE_FREE_PATH: &str = "http://lv2plug.in/ns/ext/state#freePath";

/// Is a feature the host can provide for the given block configuration?
pub fn is_feature_supported(uri: &str, fixed_buffers: bool, power_of_two: bool) -> bool {
    match uri {
        LV2_FEATURE_FIXED_BLOCK_LENGTH => fixed_buffers,
        LV2_FEATURE_POWER_OF_2_BLOCK_LENGTH => power_of_two,
        LV2_FEATURE_HARD_RT_CAPABLE
        | LV2_FEATURE_IN_PLACE_BROKEN
        | LV2_FEATURE_IS_LIVE
        | LV2_FEATURE_URID_MAP
        | LV2_FEATURE_URID_UNMAP
        | LV2_FEATURE_OPTIONS
        | LV2_FEATURE_BOUNDED_BLOCK_LENGTH
        | LV2_FEATURE_WORKER_SCHEDULE
        | LV2_FEATURE_STATE_MAKE_PATH
        | LV2_FEATURE_STATE_MAP_PATH
        | LV2_FEATURE_STATE_FREE_PATH => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    Audio,
    Cv,
    Control,
    /// Atom sequence port.
    Atom,
}

/// Transport field a control input can be designated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeField {
    Bar,
    BarBeat,
    Beat,
    BeatUnit,
    BeatsPerBar,
    BeatsPerMinute,
    Frame,
    FramesPerSecond,
    Speed,
    TicksPerBeat,
}

impl TimeField {
    /// Value of this field for a transport snapshot. BBT fields need BBT info.
    pub fn value(self, time: &TimeInfo, sample_rate: f64) -> Option<f32> {
        match self {
            TimeField::Speed => Some(if time.playing { 1.0 } else { 0.0 }),
            TimeField::Frame => Some(time.frame as f32),
            TimeField::FramesPerSecond => Some(sample_rate as f32),
            field => {
                let bbt = time.bbt.as_ref()?;
                Some(match field {
                    TimeField::Bar => (bbt.bar - 1) as f32,
                    TimeField::BarBeat => {
                        (bbt.beat - 1) as f32 + (bbt.tick / bbt.ticks_per_beat) as f32
                    }
                    TimeField::Beat => (bbt.beat - 1) as f32,
                    TimeField::BeatUnit => bbt.beat_type,
                    TimeField::BeatsPerBar => bbt.beats_per_bar,
                    TimeField::BeatsPerMinute => bbt.beats_per_minute as f32,
                    TimeField::TicksPerBeat => bbt.ticks_per_beat as f32,
                    _ => return None,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PortDesignation {
    #[default]
    None,
    /// `lv2:control`: the main event port.
    Control,
    Freewheel,
    Latency,
    SampleRate,
    Time(TimeField),
}

flags! {
    /// `lv2:portProperty` values the host acts on.
    PortProperties {
        OPTIONAL = 0x0001;
        ENUMERATION = 0x0002;
        INTEGER = 0x0004;
        SAMPLE_RATE = 0x0008;
        TOGGLED = 0x0010;
        CAUSES_ARTIFACTS = 0x0020;
        CONTINUOUS_CV = 0x0040;
        DISCRETE_CV = 0x0080;
        EXPENSIVE = 0x0100;
        STRICT_BOUNDS = 0x0200;
        LOGARITHMIC = 0x0400;
        NOT_AUTOMATIC = 0x0800;
        NOT_ON_GUI = 0x1000;
        TRIGGER = 0x2000;
        NON_AUTOMABLE = 0x4000;
    }
}

flags! {
    /// Payload types an atom port accepts or produces.
    AtomSupports {
        MIDI = 0x1;
        TIME = 0x2;
        PATCH = 0x4;
    }
}

flags! {
    /// Extension data a plugin provides.
    Lv2Extensions {
        STATE = 0x1;
        WORKER = 0x2;
        PROGRAMS = 0x4;
        OPTIONS = 0x8;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lv2PortInfo {
    pub index: u32,
    pub symbol: String,
    pub name: String,
    pub kind: PortKind,
    pub is_input: bool,
    pub designation: PortDesignation,
    pub properties: PortProperties,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub default: Option<f32>,
    pub unit: String,
    /// MIDI CC bound to this control port by the plugin metadata.
    pub midi_cc: Option<u8>,
    pub atom_supports: AtomSupports,
    /// Minimum atom buffer size in bytes requested by the plugin.
    pub min_buffer_size: u32,
    pub scale_points: Vec<(f32, String)>,
}

impl Lv2PortInfo {
    pub fn new(index: u32, symbol: &str, kind: PortKind, is_input: bool) -> Self {
        Self {
            index,
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            kind,
            is_input,
            designation: PortDesignation::None,
            properties: PortProperties::empty(),
            min: None,
            max: None,
            default: None,
            unit: String::new(),
            midi_cc: None,
            atom_supports: AtomSupports::empty(),
            min_buffer_size: 0,
            scale_points: Vec::new(),
        }
    }

    pub fn has_property(&self, property: PortProperties) -> bool {
        self.properties.contains(property)
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PortKind::Audio
    }

    pub fn is_midi_atom(&self) -> bool {
        self.kind == PortKind::Atom && self.atom_supports.contains(AtomSupports::MIDI)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lv2ParameterKind {
    Bool,
    Int,
    Long,
    Float,
    Double,
    Path,
    String,
}

/// A `patch:writable` / `patch:readable` property of the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lv2ParameterInfo {
    pub uri: String,
    pub label: String,
    pub kind: Lv2ParameterKind,
    /// Writable by the host.
    pub is_input: bool,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub file_types: String,
}

impl Lv2ParameterInfo {
    pub fn is_numeric(&self) -> bool {
        !matches!(self.kind, Lv2ParameterKind::Path | Lv2ParameterKind::String)
    }
}

/// A preset: port values plus optional plugin state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Lv2PresetInfo {
    pub uri: String,
    pub label: String,
    pub port_values: Vec<(String, f32)>,
    pub state: Vec<CustomData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lv2UiType {
    Gtk2,
    Gtk3,
    Qt4,
    Qt5,
    Cocoa,
    Windows,
    X11,
    External,
    Unknown,
}

impl Lv2UiType {
    /// Suffix of the bridge executable hosting this kind of UI.
    pub fn bridge_suffix(self) -> &'static str {
        match self {
            Lv2UiType::Gtk2 => "gtk2",
            Lv2UiType::Gtk3 => "gtk3",
            Lv2UiType::Qt4 => "qt4",
            Lv2UiType::Qt5 => "qt5",
            Lv2UiType::Cocoa => "cocoa",
            Lv2UiType::Windows => "windows",
            Lv2UiType::X11 => "x11",
            Lv2UiType::External | Lv2UiType::Unknown => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lv2UiInfo {
    pub uri: String,
    pub ui_type: Lv2UiType,
    pub bundle: String,
    pub binary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lv2PluginInfo {
    pub uri: String,
    pub name: String,
    pub maker: String,
    pub license: String,
    pub bundle: String,
    pub binary: String,
    pub category: PluginCategory,
    pub is_synth: bool,
    pub unique_id: i64,
    pub ports: Vec<Lv2PortInfo>,
    pub parameters: Vec<Lv2ParameterInfo>,
    pub presets: Vec<Lv2PresetInfo>,
    pub required_features: Vec<String>,
    pub optional_features: Vec<String>,
    pub extensions: Lv2Extensions,
    pub uis: Vec<Lv2UiInfo>,
}

impl Lv2PluginInfo {
    pub fn new(uri: &str, name: &str) -> Self {
        Self {
            uri: uri.to_string(),
            name: name.to_string(),
            maker: String::new(),
            license: String::new(),
            bundle: String::new(),
            binary: String::new(),
            category: PluginCategory::None,
            is_synth: false,
            unique_id: 0,
            ports: Vec::new(),
            parameters: Vec::new(),
            presets: Vec::new(),
            required_features: Vec::new(),
            optional_features: Vec::new(),
            extensions: Lv2Extensions::empty(),
            uis: Vec::new(),
        }
    }

    fn count(&self, kind: PortKind, is_input: bool) -> usize {
        self.ports
            .iter()
            .filter(|p| p.kind == kind && p.is_input == is_input)
            .count()
    }

    pub fn audio_ins(&self) -> usize {
        self.count(PortKind::Audio, true)
    }

    pub fn audio_outs(&self) -> usize {
        self.count(PortKind::Audio, false)
    }

    pub fn cv_ins(&self) -> usize {
        self.count(PortKind::Cv, true)
    }

    pub fn cv_outs(&self) -> usize {
        self.count(PortKind::Cv, false)
    }

    pub fn midi_ins(&self) -> usize {
        self.ports.iter().filter(|p| p.is_input && p.is_midi_atom()).count()
    }

    pub fn midi_outs(&self) -> usize {
        self.ports.iter().filter(|p| !p.is_input && p.is_midi_atom()).count()
    }

    pub fn has_extension(&self, extension: Lv2Extensions) -> bool {
        self.extensions.contains(extension)
    }

    pub fn has_feature(&self, uri: &str) -> bool {
        self.required_features.iter().any(|f| f == uri)
            || self.optional_features.iter().any(|f| f == uri)
    }

    pub fn latency_port(&self) -> Option<&Lv2PortInfo> {
        self.ports.iter().find(|p| {
            p.kind == PortKind::Control
                && !p.is_input
                && (p.designation == PortDesignation::Latency
                    || p.symbol == "latency"
                    || p.symbol == "_latency")
        })
    }

    /// The plugin can only run with a fixed or power-of-two block length.
    pub fn needs_fixed_buffers(&self) -> bool {
        self.required_features.iter().any(|f| {
            f == LV2_FEATURE_FIXED_BLOCK_LENGTH || f == LV2_FEATURE_POWER_OF_2_BLOCK_LENGTH
        })
    }
}

/// Scan cache of plugin descriptions, stored with bincode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lv2Catalog {
    pub plugins: Vec<Lv2PluginInfo>,
}

impl Lv2Catalog {
    pub fn find(&self, uri: &str) -> Option<&Lv2PluginInfo> {
        self.plugins.iter().find(|p| p.uri == uri)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// Block and rate values offered through the options feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostOptions {
    pub min_block_length: u32,
    pub max_block_length: u32,
    pub nominal_block_length: u32,
    pub sequence_size: u32,
    pub sample_rate: f64,
}

/// Host features handed to `instantiate`.
#[derive(Debug, Clone)]
pub struct HostFeatures {
    pub urids: Arc<UridMap>,
    pub options: HostOptions,
    /// Present only when the plugin provides the worker extension.
    pub worker: Option<WorkerSchedule>,
    pub paths: PathMapper,
    pub fixed_block_length: bool,
    pub power_of_two_block_length: bool,
}

/// Status returned by extension calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lv2Status {
    Success,
    Error,
    NoSpace,
    Unknown,
}

/// Buffers of one execution unit for one `run()`.
pub trait PortBuffers {
    /// Audio or CV buffer connected to `port`.
    fn audio(&mut self, port: u32) -> Option<&mut [f32]>;

    fn control(&self, port: u32) -> f32;

    fn set_control(&mut self, port: u32, value: f32);

    fn atom_in(&self, port: u32) -> Option<&super::atom::AtomSequence>;

    fn atom_out(&mut self, port: u32) -> Option<&mut super::atom::AtomSequence>;

    /// Raw pointer to connect `port` to native code. Null for unconnected ports.
    fn port_ptr(&mut self, port: u32) -> *mut std::ffi::c_void;
}

/// Work run off the audio thread.
pub trait Lv2Worker: Send {
    fn work(&mut self, respond: &mut dyn FnMut(&[u8]) -> bool, data: &[u8]) -> Lv2Status;
}

/// `state:interface`. Keys and types are URIDs.
pub trait Lv2StateInterface {
    fn save(
        &mut self,
        store: &mut dyn FnMut(u32, &[u8], u32) -> bool,
        paths: &PathMapper,
    ) -> Lv2Status;

    fn restore(
        &mut self,
        retrieve: &dyn Fn(u32) -> Option<(Vec<u8>, u32)>,
        paths: &PathMapper,
    ) -> Lv2Status;
}

/// MIDI program extension.
pub trait Lv2ProgramsInterface {
    /// `(bank, program, name)` at `index`, `None` past the end.
    fn program(&self, index: u32) -> Option<(u32, u32, String)>;

    fn select_program(&mut self, bank: u32, program: u32);
}

/// Value pushed through `opts:interface`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lv2OptionValue {
    Int(i32),
    Float(f32),
}

pub trait Lv2OptionsInterface {
    fn set(&mut self, options: &[(u32, Lv2OptionValue)]) -> Lv2Status;
}

/// One native handle.
pub trait Lv2Instance: Send {
    fn activate(&mut self);

    fn deactivate(&mut self);

    fn run(&mut self, ports: &mut dyn PortBuffers, frames: u32);

    /// The worker object, taken once; it runs on a non-realtime thread.
    fn take_worker(&mut self) -> Option<Box<dyn Lv2Worker>> {
        None
    }

    fn work_response(&mut self, _data: &[u8]) {}

    fn end_run(&mut self) {}

    fn state(&mut self) -> Option<&mut dyn Lv2StateInterface> {
        None
    }

    fn programs(&mut self) -> Option<&mut dyn Lv2ProgramsInterface> {
        None
    }

    fn options(&mut self) -> Option<&mut dyn Lv2OptionsInterface> {
        None
    }
}

/// Source of plugin descriptions and native instances.
pub trait Lv2World: Send + Sync {
    fn plugin_info(&self, uri: &str) -> Option<Lv2PluginInfo>;

    fn instantiate(
        &self,
        info: &Lv2PluginInfo,
        sample_rate: f64,
        features: &HostFeatures,
    ) -> Result<Box<dyn Lv2Instance>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::Bbt;

    #[test]
    fn test_port_counts() {
        let mut info = Lv2PluginInfo::new("urn:test", "Test");
        info.ports.push(Lv2PortInfo::new(0, "in", PortKind::Audio, true));
        info.ports.push(Lv2PortInfo::new(1, "out_l", PortKind::Audio, false));
        info.ports.push(Lv2PortInfo::new(2, "out_r", PortKind::Audio, false));
        let mut midi = Lv2PortInfo::new(3, "midi", PortKind::Atom, true);
        midi.atom_supports = AtomSupports::MIDI;
        info.ports.push(midi);
        let mut latency = Lv2PortInfo::new(4, "latency", PortKind::Control, false);
        latency.designation = PortDesignation::Latency;
        info.ports.push(latency);

        assert_eq!(info.audio_ins(), 1);
        assert_eq!(info.audio_outs(), 2);
        assert_eq!(info.midi_ins(), 1);
        assert_eq!(info.midi_outs(), 0);
        assert_eq!(info.latency_port().map(|p| p.index), Some(4));
    }

    #[test]
    fn test_catalog_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lv2.cache");
        let mut info = Lv2PluginInfo::new("urn:test:cache", "Cached");
        info.ports.push(Lv2PortInfo::new(0, "gain", PortKind::Control, true));
        let catalog = Lv2Catalog {
            plugins: vec![info],
        };
        catalog.save(&path).unwrap();
        let loaded = Lv2Catalog::load(&path).unwrap();
        assert_eq!(loaded, catalog);
        assert!(loaded.find("urn:test:cache").is_some());
    }

    #[test]
    fn test_time_field_values() {
        let time = TimeInfo {
            playing: false,
            frame: 96,
            usecs: 0,
            bbt: Some(Bbt {
                bar: 5,
                beat: 3,
                ..Default::default()
            }),
        };
        assert_eq!(TimeField::Speed.value(&time, 48000.0), Some(0.0));
        assert_eq!(TimeField::Bar.value(&time, 48000.0), Some(4.0));
        assert_eq!(TimeField::Beat.value(&time, 48000.0), Some(2.0));
        assert_eq!(TimeField::FramesPerSecond.value(&time, 48000.0), Some(48000.0));
        let no_bbt = TimeInfo::default();
        assert_eq!(TimeField::BeatsPerMinute.value(&no_bbt, 48000.0), None);
    }

    #[test]
    fn test_feature_support() {
        assert!(is_feature_supported(LV2_FEATURE_URID_MAP, false, false));
        assert!(!is_feature_supported(LV2_FEATURE_FIXED_BLOCK_LENGTH, false, true));
        assert!(is_feature_supported(LV2_FEATURE_FIXED_BLOCK_LENGTH, true, true));
        assert!(!is_feature_supported("http://example.org/unknown", true, true));
    }
}
