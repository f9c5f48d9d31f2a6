//! LV2 adapter: one logical plugin over one or two native execution units.
//!
//! The second unit only exists for forced stereo, where a mono plugin runs
//! twice with shared control values and its own audio and event buffers.

use super::atom::{forge_patch_set, string_body, AtomSequence};
use super::descriptor::{
    is_feature_supported, HostFeatures, HostOptions, Lv2Extensions, Lv2Instance,
    Lv2OptionValue, Lv2ParameterKind, Lv2PluginInfo, Lv2World, PortBuffers, PortDesignation,
    PortKind, PortProperties, TimeField, LV2_FEATURE_HARD_RT_CAPABLE,
};
use super::state::{retrieve_value, store_value, PathMapper};
use super::urid::*;
use super::worker::{worker_rings, WorkerHost, WorkerResponses};
use crate::custom_data::{self, CustomData, CUSTOM_DATA_TYPE_PROPERTY};
use crate::error::{PluginError, Result};
use crate::hints::{ParameterHints, PluginHints, PluginOptions};
use crate::parameter::{
    Parameter, ParameterData, ParameterRanges, ParameterSpecial, ParameterType,
    CONTROL_INDEX_NONE,
};
use crate::plugin::{guard_native, EngineInit, Plugin, PluginCommon, PluginInit, PluginPorts, ProcessContext};
use crate::program::{fix_current_index, MidiProgramData};
use crate::ui_bridge::UiBridge;
use arc_swap::ArcSwap;
use cadenza_core::{
    byte_ring, AtomicFloat, EngineCallbackOpcode, PluginCategory, PluginType, RingReader,
    RingWriter, TimeInfo,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Atom buffer size when no port asks for more.
pub(super) const DEFAULT_SEQUENCE_SIZE: usize = 8192;
/// UI/main thread to audio thread events.
const EVENT_IN_RING_SIZE: usize = 65536;
const MAX_UI_OUT_RING_SIZE: usize = 1_638_400;

/// Atom port as seen by the adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) struct EventPort {
    pub port: u32,
    pub midi: bool,
    pub time: bool,
}

/// Where each kind of port lives, rebuilt by `reload()`.
#[derive(Debug, Clone, Default)]
pub(super) struct PortLayout {
    pub audio_in: Vec<u32>,
    pub audio_out: Vec<u32>,
    pub cv_in: Vec<u32>,
    pub cv_out: Vec<u32>,
    pub events_in: Vec<EventPort>,
    pub events_out: Vec<EventPort>,
    /// Index into `events_in` of the port receiving control and MIDI events.
    pub ctrl_in: Option<usize>,
    pub ctrl_out: Option<usize>,
    /// Indices into `events_in` of MIDI ports, control port first.
    pub midi_in: Vec<usize>,
    pub midi_out: Vec<usize>,
    pub forced_stereo: bool,
    pub latency_port: Option<u32>,
    pub freewheel_port: Option<u32>,
    pub sample_rate_ports: Vec<(u32, f32)>,
    pub time_ports: Vec<(u32, TimeField)>,
    /// `(parameter index, control slot, default)` of trigger inputs.
    pub triggers: Vec<(u32, usize, f32)>,
    /// `(parameter index, control slot)` of output parameters.
    pub outputs: Vec<(u32, usize)>,
    /// Number of native ports; LV2 parameters use control slots after these.
    pub port_count: usize,
    /// URID of each LV2 parameter's URI, by parameter position.
    pub parameter_urids: Vec<u32>,
}

impl PortLayout {
    pub fn logical_ins(&self) -> usize {
        if self.forced_stereo && self.audio_in.len() == 1 {
            2
        } else {
            self.audio_in.len()
        }
    }

    pub fn logical_outs(&self) -> usize {
        if self.forced_stereo && self.audio_out.len() == 1 {
            2
        } else {
            self.audio_out.len()
        }
    }

    /// `(unit, port)` backing logical channel `channel`.
    pub fn audio_slot(&self, channel: usize, is_input: bool) -> Option<(usize, u32)> {
        let ports = if is_input { &self.audio_in } else { &self.audio_out };
        if self.forced_stereo && ports.len() == 1 {
            (channel < 2).then(|| (channel, ports[0]))
        } else {
            ports.get(channel).map(|&port| (0, port))
        }
    }

    pub fn ctrl_in_port(&self) -> Option<u32> {
        self.ctrl_in.and_then(|i| self.events_in.get(i)).map(|p| p.port)
    }
}

/// Buffers of one execution unit, indexed by port.
pub(super) struct UnitBuffers {
    pub audio: Vec<Vec<f32>>,
    pub atoms: Vec<Option<AtomSequence>>,
    pub atom_inputs: Vec<bool>,
}

impl UnitBuffers {
    pub fn new(info: &Lv2PluginInfo, frames: usize, sequence_size: usize) -> Self {
        let mut audio = Vec::with_capacity(info.ports.len());
        let mut atoms = Vec::with_capacity(info.ports.len());
        let mut atom_inputs = Vec::with_capacity(info.ports.len());
        for port in &info.ports {
            match port.kind {
                PortKind::Audio | PortKind::Cv => {
                    audio.push(vec![0.0; frames]);
                    atoms.push(None);
                }
                PortKind::Atom => {
                    audio.push(Vec::new());
                    let size = sequence_size.max(port.min_buffer_size as usize);
                    let mut sequence = AtomSequence::new(size);
                    if !port.is_input {
                        sequence.prepare_output();
                    }
                    atoms.push(Some(sequence));
                }
                PortKind::Control => {
                    audio.push(Vec::new());
                    atoms.push(None);
                }
            }
            atom_inputs.push(port.is_input);
        }
        Self {
            audio,
            atoms,
            atom_inputs,
        }
    }

    /// Empty every input sequence and re-advertise free space on outputs.
    pub fn reset_atoms(&mut self) {
        for (sequence, &is_input) in self.atoms.iter_mut().zip(&self.atom_inputs) {
            if let Some(sequence) = sequence {
                if is_input {
                    sequence.clear();
                } else {
                    sequence.prepare_output();
                }
            }
        }
    }

    pub fn atom_in_mut(&mut self, port: u32) -> Option<&mut AtomSequence> {
        let index = port as usize;
        if !self.atom_inputs.get(index).copied().unwrap_or(false) {
            return None;
        }
        self.atoms.get_mut(index)?.as_mut()
    }
}

/// [`PortBuffers`] over one unit's buffers and the shared control values.
pub(super) struct UnitPorts<'a> {
    pub buffers: &'a mut UnitBuffers,
    pub controls: &'a [AtomicFloat],
}

impl PortBuffers for UnitPorts<'_> {
    fn audio(&mut self, port: u32) -> Option<&mut [f32]> {
        self.buffers
            .audio
            .get_mut(port as usize)
            .filter(|buffer| !buffer.is_empty())
            .map(Vec::as_mut_slice)
    }

    fn control(&self, port: u32) -> f32 {
        self.controls.get(port as usize).map_or(0.0, AtomicFloat::get)
    }

    fn set_control(&mut self, port: u32, value: f32) {
        if let Some(control) = self.controls.get(port as usize) {
            control.set(value);
        }
    }

    fn atom_in(&self, port: u32) -> Option<&AtomSequence> {
        self.buffers.atoms.get(port as usize)?.as_ref()
    }

    fn atom_out(&mut self, port: u32) -> Option<&mut AtomSequence> {
        self.buffers.atoms.get_mut(port as usize)?.as_mut()
    }

    fn port_ptr(&mut self, port: u32) -> *mut std::ffi::c_void {
        let index = port as usize;
        if let Some(buffer) = self.buffers.audio.get_mut(index).filter(|b| !b.is_empty()) {
            return buffer.as_mut_ptr().cast();
        }
        if let Some(Some(sequence)) = self.buffers.atoms.get_mut(index) {
            return sequence.as_mut_ptr();
        }
        match self.controls.get(index) {
            Some(control) => control.as_ptr().cast(),
            None => std::ptr::null_mut(),
        }
    }
}

/// Everything the audio thread touches, behind the process lock.
pub(super) struct RtState {
    pub units: SmallVec<[Box<dyn Lv2Instance>; 2]>,
    pub buffers: SmallVec<[UnitBuffers; 2]>,
    pub layout: PortLayout,
    /// Logical outputs of the span being post-processed.
    pub wet: Vec<Vec<f32>>,
    pub scratch: Vec<f32>,
    pub message: Vec<u8>,
    pub events_in: RingReader,
    pub ui_out: RingWriter,
    pub worker_responses: Option<WorkerResponses>,
    pub last_time: TimeInfo,
    pub first_run: bool,
    pub next_bank: u32,
}

/// UI side state, touched only from the main thread.
#[derive(Default)]
pub(super) struct UiState {
    pub bridge: Option<UiBridge>,
    pub visible: bool,
    /// Last output values sent to the UI, by control slot.
    pub sent_outputs: Vec<f32>,
}

pub struct Lv2Plugin {
    pub(super) common: PluginCommon,
    pub(super) world: Arc<dyn Lv2World>,
    pub(super) info: Lv2PluginInfo,
    pub(super) urids: Arc<UridMap>,
    pub(super) paths: PathMapper,
    pub(super) features: HostFeatures,
    /// Control values by port index; LV2 parameters follow the ports.
    pub(super) controls: ArcSwap<Vec<AtomicFloat>>,
    pub(super) rt: Mutex<RtState>,
    pub(super) events_in: Mutex<RingWriter>,
    pub(super) ui_out: Mutex<RingReader>,
    pub(super) worker: Mutex<Option<WorkerHost>>,
    pub(super) ui: Mutex<UiState>,
    /// A UI is showing and wants plugin output atoms.
    pub(super) ui_active: AtomicBool,
    has_second_unit: AtomicBool,
    reloaded: AtomicBool,
}

impl std::fmt::Debug for Lv2Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lv2Plugin")
            .field("uri", &self.info.uri)
            .field("common", &self.common)
            .finish_non_exhaustive()
    }
}

fn parameter_steps(ranges: &mut ParameterRanges, hints: ParameterHints) {
    let range = ranges.max - ranges.min;
    if hints.contains(ParameterHints::IS_BOOLEAN) {
        ranges.step = range;
        ranges.step_small = range;
        ranges.step_large = range;
    } else if hints.contains(ParameterHints::IS_INTEGER) {
        ranges.step = 1.0;
        ranges.step_small = 1.0;
        ranges.step_large = 10.0;
    } else {
        ranges.step = range / 100.0;
        ranges.step_small = range / 1000.0;
        ranges.step_large = range / 10.0;
    }
}

/// Declared range with broken declarations repaired.
fn checked_range(name: &str, min: Option<f32>, max: Option<f32>, default: Option<f32>) -> ParameterRanges {
    let min = min.unwrap_or(0.0);
    let mut max = max.unwrap_or(1.0);
    if min >= max {
        tracing::warn!("Broken plugin parameter '{}': min >= max", name);
        max = min + 0.1;
    }
    let def = match default {
        Some(def) => def,
        None if min <= 0.0 && max >= 0.0 => 0.0,
        None => min,
    };
    ParameterRanges {
        def: def.clamp(min, max),
        min,
        max,
        ..Default::default()
    }
}

/// Value atom for a numeric LV2 parameter.
pub(super) fn parameter_atom(kind: Lv2ParameterKind, value: f32) -> (u32, SmallVec<[u8; 8]>) {
    match kind {
        Lv2ParameterKind::Bool => (
            URID_ATOM_BOOL,
            SmallVec::from_slice(&i32::from(value > 0.5).to_le_bytes()),
        ),
        Lv2ParameterKind::Int => (
            URID_ATOM_INT,
            SmallVec::from_slice(&(value.round() as i32).to_le_bytes()),
        ),
        Lv2ParameterKind::Long => (
            URID_ATOM_LONG,
            SmallVec::from_slice(&(value.round() as i64).to_le_bytes()),
        ),
        Lv2ParameterKind::Double => (
            URID_ATOM_DOUBLE,
            SmallVec::from_slice(&f64::from(value).to_bits().to_le_bytes()),
        ),
        Lv2ParameterKind::Float | Lv2ParameterKind::Path | Lv2ParameterKind::String => (
            URID_ATOM_FLOAT,
            SmallVec::from_slice(&value.to_bits().to_le_bytes()),
        ),
    }
}

impl Lv2Plugin {
    /// Resolve `init.label` as a plugin URI and instantiate its first unit.
    ///
    /// Call [`Plugin::reload`] afterwards to build ports and parameters.
    pub fn new(
        world: Arc<dyn Lv2World>,
        id: u32,
        mut init: PluginInit,
        engine: &EngineInit,
    ) -> Result<Self> {
        if init.label.is_empty() {
            return Err(PluginError::NotFound("no plugin URI given".into()));
        }
        let info = world
            .plugin_info(&init.label)
            .ok_or_else(|| PluginError::NotFound(init.label.clone()))?;

        let power_of_two = engine.buffer_size.is_power_of_two();
        if let Some(feature) = info
            .required_features
            .iter()
            .find(|f| !is_feature_supported(f, true, power_of_two))
        {
            return Err(PluginError::MissingFeature(feature.clone()));
        }

        if init.name.is_empty() {
            init.name = info.name.clone();
        }
        if init.filename.is_empty() {
            init.filename = info.binary.clone();
        }
        init.plugin_type = PluginType::Lv2;

        let common = PluginCommon::new(id, init, engine);
        let urids = Arc::new(UridMap::new());
        let paths = PathMapper::new(engine.project_folder.clone(), &common.name());

        let sequence_size = info
            .ports
            .iter()
            .filter(|p| p.kind == PortKind::Atom)
            .map(|p| p.min_buffer_size as usize)
            .max()
            .unwrap_or(0)
            .max(DEFAULT_SEQUENCE_SIZE);
        let needs_fixed = info.needs_fixed_buffers();

        let (schedule, queues, responses) = if info.has_extension(Lv2Extensions::WORKER) {
            let (schedule, queues, responses) = worker_rings(sequence_size * 4);
            (Some(schedule), Some(queues), Some(responses))
        } else {
            (None, None, None)
        };

        let features = HostFeatures {
            urids: Arc::clone(&urids),
            options: HostOptions {
                min_block_length: if needs_fixed { engine.buffer_size } else { 1 },
                max_block_length: engine.buffer_size,
                nominal_block_length: engine.buffer_size,
                sequence_size: sequence_size as u32,
                sample_rate: engine.sample_rate,
            },
            worker: schedule,
            paths: paths.clone(),
            fixed_block_length: needs_fixed,
            power_of_two_block_length: power_of_two,
        };

        let mut unit = world.instantiate(&info, engine.sample_rate, &features)?;
        let worker = match queues {
            Some(queues) => match unit.take_worker() {
                Some(worker) => Some(queues.attach(worker)),
                None => {
                    tracing::warn!("Plugin '{}' declares a worker but provides none", info.uri);
                    None
                }
            },
            None => None,
        };

        let (events_in_writer, events_in_reader) = byte_ring(EVENT_IN_RING_SIZE);
        let (ui_out_writer, ui_out_reader) =
            byte_ring((sequence_size * 32).min(MAX_UI_OUT_RING_SIZE));

        let mut units: SmallVec<[Box<dyn Lv2Instance>; 2]> = SmallVec::new();
        units.push(unit);

        tracing::debug!("Instantiated LV2 plugin '{}'", info.uri);

        Ok(Self {
            rt: Mutex::new(RtState {
                units,
                buffers: SmallVec::new(),
                layout: PortLayout::default(),
                wet: Vec::new(),
                scratch: Vec::new(),
                message: Vec::with_capacity(EVENT_IN_RING_SIZE),
                events_in: events_in_reader,
                ui_out: ui_out_writer,
                worker_responses: responses,
                last_time: TimeInfo::default(),
                first_run: true,
                next_bank: 0,
            }),
            controls: ArcSwap::from_pointee(Vec::new()),
            common,
            world,
            info,
            urids,
            paths,
            features,
            events_in: Mutex::new(events_in_writer),
            ui_out: Mutex::new(ui_out_reader),
            worker: Mutex::new(worker),
            ui: Mutex::new(UiState::default()),
            ui_active: AtomicBool::new(false),
            has_second_unit: AtomicBool::new(false),
            reloaded: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &Lv2PluginInfo {
        &self.info
    }

    pub fn urids(&self) -> &Arc<UridMap> {
        &self.urids
    }

    pub fn path_mapper(&self) -> &PathMapper {
        &self.paths
    }

    /// Number of native execution units (2 when stereo is forced).
    pub fn unit_count(&self) -> usize {
        self.rt.lock().units.len()
    }

    pub(super) fn sequence_size(&self) -> usize {
        self.features.options.sequence_size as usize
    }

    /// Control slot of parameter `index`.
    pub(super) fn control_slot(&self, index: u32) -> Option<usize> {
        let params = self.common.parameters.read();
        let param = params.get(index as usize)?;
        usize::try_from(param.data.rindex).ok()
    }

    /// LV2 parameter behind a control slot past the ports.
    pub(super) fn lv2_parameter_at(&self, slot: usize, port_count: usize) -> Option<&super::descriptor::Lv2ParameterInfo> {
        slot.checked_sub(port_count)
            .and_then(|i| self.info.parameters.get(i))
    }

    /// Queue an atom for an input port; it reaches the plugin on the next block.
    pub(super) fn queue_atom(&self, port: u32, atom: &[u8]) -> bool {
        let mut writer = self.events_in.lock();
        let queued = writer.write_u32(port)
            && writer.write_u32(atom.len() as u32)
            && writer.write_bytes(atom)
            && writer.commit_write();
        if !queued {
            writer.discard();
            tracing::error!("Event input buffer full, at least 1 message lost");
        }
        queued
    }

    fn ctrl_in_port(&self) -> Option<u32> {
        self.rt.lock().layout.ctrl_in_port()
    }

    fn instantiate_second_unit(&self) -> Result<Box<dyn Lv2Instance>> {
        let features = HostFeatures {
            worker: None,
            ..self.features.clone()
        };
        self.world
            .instantiate(&self.info, self.common.sample_rate(), &features)
    }

    /// Push block/rate options to every unit that listens for them.
    fn send_options(&self, rt: &mut RtState, options: &[(u32, Lv2OptionValue)]) {
        for unit in rt.units.iter_mut() {
            guard_native("options.set", || {
                if let Some(interface) = unit.options() {
                    interface.set(options);
                }
            });
        }
    }

    fn build_parameters(&self, layout: &mut PortLayout, previous: &[AtomicFloat]) -> (Vec<Parameter>, Vec<AtomicFloat>) {
        let sample_rate = self.common.sample_rate() as f32;
        let max_parameters = self.common.engine_options().max_parameters as usize;
        let latency_port = self.info.latency_port().map(|p| p.index);
        let port_count = self.info.ports.len();
        let controls: Vec<AtomicFloat> =
            (0..port_count + self.info.parameters.len()).map(|_| AtomicFloat::new(0.0)).collect();
        let mut params = Vec::new();

        for port in self.info.ports.iter().filter(|p| p.kind == PortKind::Control) {
            let mut ranges = checked_range(&port.name, port.min, port.max, port.default);
            let mut hints = ParameterHints::empty();
            let mut special = ParameterSpecial::None;

            if port.has_property(PortProperties::SAMPLE_RATE) {
                ranges.min *= sample_rate;
                ranges.max *= sample_rate;
                ranges.def *= sample_rate;
                hints.insert(ParameterHints::USES_SAMPLERATE);
            }
            if port.has_property(PortProperties::TOGGLED) {
                hints.insert(ParameterHints::IS_BOOLEAN);
            } else if port.has_property(PortProperties::INTEGER) {
                hints.insert(ParameterHints::IS_INTEGER);
            }
            if port.has_property(PortProperties::LOGARITHMIC) {
                hints.insert(ParameterHints::IS_LOGARITHMIC);
            }
            if port.has_property(PortProperties::STRICT_BOUNDS) {
                hints.insert(ParameterHints::IS_STRICT_BOUNDS);
            }
            if port.has_property(PortProperties::TRIGGER) {
                hints.insert(ParameterHints::IS_TRIGGER);
            }
            if !port.scale_points.is_empty() {
                hints.insert(ParameterHints::USES_SCALEPOINTS);
            }

            let automable = !port.has_property(PortProperties::NOT_AUTOMATIC)
                && !port.has_property(PortProperties::NON_AUTOMABLE);

            let kind = if port.is_input {
                match port.designation {
                    PortDesignation::SampleRate => {
                        special = ParameterSpecial::SampleRate;
                        ranges.min = 0.0;
                        ranges.max = sample_rate;
                        ranges.def = sample_rate;
                        layout.sample_rate_ports.push((port.index, sample_rate));
                    }
                    PortDesignation::Freewheel => {
                        special = ParameterSpecial::Freewheel;
                        ranges.min = 0.0;
                        ranges.max = 1.0;
                        ranges.def = if self.common.is_offline() { 1.0 } else { 0.0 };
                        hints.insert(ParameterHints::IS_BOOLEAN);
                        layout.freewheel_port = Some(port.index);
                    }
                    PortDesignation::Time(field) => {
                        special = ParameterSpecial::Time;
                        layout.time_ports.push((port.index, field));
                    }
                    _ => {
                        hints.insert(ParameterHints::IS_ENABLED);
                        if automable {
                            hints.insert(ParameterHints::IS_AUTOMABLE);
                        }
                    }
                }
                ParameterType::Input
            } else {
                if Some(port.index) == latency_port {
                    special = ParameterSpecial::Latency;
                    ranges.min = 0.0;
                    ranges.max = sample_rate;
                    ranges.def = 0.0;
                    layout.latency_port = Some(port.index);
                } else {
                    hints.insert(ParameterHints::IS_ENABLED);
                    if automable {
                        hints.insert(ParameterHints::IS_AUTOMABLE);
                    }
                }
                ParameterType::Output
            };

            parameter_steps(&mut ranges, hints);

            let slot = port.index as usize;
            let value = previous
                .get(slot)
                .filter(|_| previous.len() == controls.len())
                .map(|v| ranges.fix_value(v.get()))
                .unwrap_or(ranges.def);
            if let Some(control) = controls.get(slot) {
                control.set(value);
            }

            if params.len() >= max_parameters {
                tracing::warn!(
                    "Plugin '{}' has more than {} parameters, ignoring the rest",
                    self.info.uri,
                    max_parameters
                );
                continue;
            }

            let index = params.len() as u32;
            if hints.contains(ParameterHints::IS_TRIGGER) && kind == ParameterType::Input {
                layout.triggers.push((index, slot, ranges.def));
            }
            if kind == ParameterType::Output && special == ParameterSpecial::None {
                layout.outputs.push((index, slot));
            }

            params.push(Parameter {
                data: ParameterData {
                    kind,
                    hints,
                    index: index as i32,
                    rindex: port.index as i32,
                    midi_channel: 0,
                    mapped_control_index: port
                        .midi_cc
                        .map_or(CONTROL_INDEX_NONE, i16::from),
                },
                ranges,
                special,
                name: port.name.clone(),
                symbol: port.symbol.clone(),
                unit: port.unit.clone(),
            });
        }

        for (i, lv2_param) in self.info.parameters.iter().enumerate() {
            if !lv2_param.is_numeric() {
                continue;
            }
            let slot = port_count + i;
            let mut ranges = checked_range(
                &lv2_param.label,
                Some(lv2_param.min),
                Some(lv2_param.max),
                Some(lv2_param.default),
            );
            let mut hints = ParameterHints::IS_ENABLED | ParameterHints::IS_AUTOMABLE;
            match lv2_param.kind {
                Lv2ParameterKind::Bool => hints.insert(ParameterHints::IS_BOOLEAN),
                Lv2ParameterKind::Int | Lv2ParameterKind::Long => {
                    hints.insert(ParameterHints::IS_INTEGER)
                }
                _ => {}
            }
            parameter_steps(&mut ranges, hints);

            let value = previous
                .get(slot)
                .filter(|_| previous.len() == controls.len())
                .map(|v| ranges.fix_value(v.get()))
                .unwrap_or(ranges.def);
            controls[slot].set(value);

            if params.len() >= max_parameters {
                continue;
            }
            let index = params.len() as u32;
            let kind = if lv2_param.is_input {
                ParameterType::Input
            } else {
                layout.outputs.push((index, slot));
                ParameterType::Output
            };
            params.push(Parameter {
                data: ParameterData {
                    kind,
                    hints,
                    index: index as i32,
                    rindex: slot as i32,
                    midi_channel: 0,
                    mapped_control_index: CONTROL_INDEX_NONE,
                },
                ranges,
                special: ParameterSpecial::None,
                name: lv2_param.label.clone(),
                symbol: lv2_param.uri.clone(),
                unit: String::new(),
            });
        }

        (params, controls)
    }

    fn build_layout(&self, forced_stereo: bool) -> PortLayout {
        let mut layout = PortLayout {
            forced_stereo,
            port_count: self.info.ports.len(),
            ..Default::default()
        };
        let mut designated_in = None;
        let mut designated_out = None;

        for port in &self.info.ports {
            match (port.kind, port.is_input) {
                (PortKind::Audio, true) => layout.audio_in.push(port.index),
                (PortKind::Audio, false) => layout.audio_out.push(port.index),
                (PortKind::Cv, true) => layout.cv_in.push(port.index),
                (PortKind::Cv, false) => layout.cv_out.push(port.index),
                (PortKind::Atom, is_input) => {
                    let event = EventPort {
                        port: port.index,
                        midi: port.is_midi_atom(),
                        time: port
                            .atom_supports
                            .contains(super::descriptor::AtomSupports::TIME),
                    };
                    let list = if is_input {
                        &mut layout.events_in
                    } else {
                        &mut layout.events_out
                    };
                    if port.designation == PortDesignation::Control {
                        if is_input {
                            designated_in = Some(list.len());
                        } else {
                            designated_out = Some(list.len());
                        }
                    }
                    list.push(event);
                }
                (PortKind::Control, _) => {}
            }
        }

        let pick = |ports: &[EventPort], designated: Option<usize>| {
            designated
                .or_else(|| ports.iter().position(|p| p.midi))
                .or_else(|| (!ports.is_empty()).then_some(0))
        };
        layout.ctrl_in = pick(&layout.events_in, designated_in);
        layout.ctrl_out = pick(&layout.events_out, designated_out);

        let order = |ports: &[EventPort], ctrl: Option<usize>| {
            let mut midi: Vec<usize> = ctrl.filter(|&c| ports[c].midi).into_iter().collect();
            midi.extend(
                ports
                    .iter()
                    .enumerate()
                    .filter(|(i, p)| p.midi && Some(*i) != ctrl)
                    .map(|(i, _)| i),
            );
            midi
        };
        layout.midi_in = order(&layout.events_in, layout.ctrl_in);
        layout.midi_out = order(&layout.events_out, layout.ctrl_out);
        layout
    }

    fn port_name(&self, port: u32) -> String {
        self.info
            .ports
            .get(port as usize)
            .map(|p| p.name.clone())
            .unwrap_or_default()
    }

    fn build_ports(&self, layout: &PortLayout, params: &[Parameter]) -> PluginPorts {
        let audio_names = |ports: &[u32], logical: usize| -> Vec<String> {
            if logical > ports.len() {
                let base = ports.first().map(|&p| self.port_name(p)).unwrap_or_default();
                (0..logical).map(|c| format!("{} {}", base, c + 1)).collect()
            } else {
                ports.iter().map(|&p| self.port_name(p)).collect()
            }
        };

        let needs_ctrl_in = !layout.events_in.is_empty()
            || params.iter().any(|p| p.is_input() && p.has_hint(ParameterHints::IS_AUTOMABLE));
        let needs_ctrl_out = !layout.events_out.is_empty()
            || params.iter().any(|p| p.is_output() && p.has_hint(ParameterHints::IS_AUTOMABLE));

        let mut event_in = Vec::new();
        if needs_ctrl_in {
            event_in.push("events-in".to_string());
        }
        for &i in layout.midi_in.iter().skip(1) {
            event_in.push(self.port_name(layout.events_in[i].port));
        }
        let mut event_out = Vec::new();
        if needs_ctrl_out {
            event_out.push("events-out".to_string());
        }
        for &i in layout.midi_out.iter().skip(1) {
            event_out.push(self.port_name(layout.events_out[i].port));
        }

        PluginPorts {
            audio_in: audio_names(&layout.audio_in, layout.logical_ins()),
            audio_out: audio_names(&layout.audio_out, layout.logical_outs()),
            cv_in: layout.cv_in.iter().map(|&p| self.port_name(p)).collect(),
            cv_out: layout.cv_out.iter().map(|&p| self.port_name(p)).collect(),
            event_in,
            event_out,
        }
    }

    fn compute_hints(&self, layout: &PortLayout) -> PluginHints {
        let ins = layout.logical_ins();
        let outs = layout.logical_outs();
        let mut hints = PluginHints::empty();
        if self.info.has_feature(LV2_FEATURE_HARD_RT_CAPABLE) {
            hints.insert(PluginHints::IS_RTSAFE);
        }
        if self.info.is_synth || self.info.category == PluginCategory::Synth {
            hints.insert(PluginHints::IS_SYNTH);
        }
        if !self.info.uis.is_empty() {
            hints.insert(PluginHints::HAS_CUSTOM_UI);
        }
        if outs > 0 && (ins == outs || ins == 1) {
            hints.insert(PluginHints::CAN_DRYWET);
        }
        if outs > 0 {
            hints.insert(PluginHints::CAN_VOLUME);
        }
        if outs >= 2 && outs % 2 == 0 {
            hints.insert(PluginHints::CAN_BALANCE);
        }
        if self.info.needs_fixed_buffers() {
            hints.insert(PluginHints::NEEDS_FIXED_BUFFERS);
        }
        hints
    }

    /// Run the first unit once on scratch buffers and read the latency it reports.
    fn probe_latency(&self, rt: &mut RtState, controls: &[AtomicFloat]) -> u32 {
        let Some(port) = rt.layout.latency_port else {
            return 0;
        };
        let Some(unit) = rt.units.first_mut() else {
            return 0;
        };
        let mut scratch = UnitBuffers::new(&self.info, 2, self.sequence_size());
        let was_active = self.common.is_active();
        guard_native("latency probe", || {
            if !was_active {
                unit.activate();
            }
            unit.run(
                &mut UnitPorts {
                    buffers: &mut scratch,
                    controls,
                },
                2,
            );
            if !was_active {
                unit.deactivate();
            }
        });
        let latency = controls.get(port as usize).map_or(0.0, AtomicFloat::get);
        if latency.is_finite() && latency > 0.0 {
            latency as u32
        } else {
            0
        }
    }

    fn activate_units(&self, rt: &mut RtState) {
        for unit in rt.units.iter_mut() {
            guard_native("activate", || unit.activate());
        }
        rt.first_run = true;
    }

    fn deactivate_units(&self, rt: &mut RtState) {
        for unit in rt.units.iter_mut() {
            guard_native("deactivate", || unit.deactivate());
        }
    }

    /// Apply a preset's port values and state.
    fn load_preset(&self, index: usize) {
        let Some(preset) = self.info.presets.get(index) else {
            return;
        };
        let symbols: Vec<(u32, String)> = self
            .common
            .parameters
            .read()
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p.symbol.clone()))
            .collect();
        for (symbol, value) in &preset.port_values {
            match symbols.iter().find(|(_, s)| s == symbol) {
                Some((param, _)) => self.set_parameter_value(*param, *value, true, true),
                None => tracing::debug!("Preset '{}' sets unknown port '{}'", preset.label, symbol),
            }
        }

        if !preset.state.is_empty() {
            let mut rt = self.rt.lock();
            for unit in rt.units.iter_mut() {
                guard_native("state.restore", || {
                    if let Some(state) = unit.state() {
                        state.restore(
                            &|key| retrieve_value(&preset.state, &self.urids, key),
                            &self.paths,
                        );
                    }
                });
            }
        }
    }

    fn read_midi_programs(&self) -> Vec<MidiProgramData> {
        if !self.info.has_extension(Lv2Extensions::PROGRAMS) {
            return Vec::new();
        }
        let mut rt = self.rt.lock();
        let Some(unit) = rt.units.first_mut() else {
            return Vec::new();
        };
        guard_native("programs.get_program", || {
            let mut list = Vec::new();
            if let Some(programs) = unit.programs() {
                while let Some((bank, program, name)) = programs.program(list.len() as u32) {
                    list.push(MidiProgramData {
                        bank,
                        program,
                        name,
                    });
                }
            }
            list
        })
        .unwrap_or_default()
    }
}

impl Plugin for Lv2Plugin {
    fn common(&self) -> &PluginCommon {
        &self.common
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Lv2
    }

    fn reload(&self) -> Result<()> {
        let _master = self.common.master_lock.lock();
        let was_active = self.common.is_active();
        let first_reload = !self.reloaded.swap(true, Ordering::AcqRel);

        if first_reload {
            let requested = self
                .common
                .init()
                .options
                .unwrap_or(PluginOptions::DEFAULTS);
            let mut options = requested.intersection(self.options_available());
            if self.info.needs_fixed_buffers() {
                options.insert(PluginOptions::FIXED_BUFFERS);
            }
            self.common.set_options(options);
        }

        {
            let mut rt = self.rt.lock();
            if was_active {
                self.deactivate_units(&mut rt);
            }

            let ins = self.info.audio_ins();
            let outs = self.info.audio_outs();
            let can_force_stereo = ins <= 1
                && outs <= 1
                && (ins == 1 || outs == 1)
                && !self.info.has_extension(Lv2Extensions::STATE)
                && !self.info.has_extension(Lv2Extensions::WORKER);
            let wants_stereo = self.common.options().contains(PluginOptions::FORCE_STEREO)
                || self.common.engine_options().force_stereo;

            if wants_stereo && can_force_stereo && rt.units.len() == 1 {
                match self.instantiate_second_unit() {
                    Ok(unit) => rt.units.push(unit),
                    Err(err) => tracing::warn!("Could not force stereo for '{}': {}", self.info.uri, err),
                }
            } else if !(wants_stereo && can_force_stereo) && rt.units.len() > 1 {
                rt.units.truncate(1);
            }
            let forced = rt.units.len() > 1;
            self.has_second_unit.store(forced, Ordering::Release);

            let mut options = self.common.options();
            options.set(PluginOptions::FORCE_STEREO, forced);
            self.common.set_options(options);

            let mut layout = self.build_layout(forced);
            layout.parameter_urids = self
                .info
                .parameters
                .iter()
                .map(|p| self.urids.map(&p.uri))
                .collect();
            let previous = self.controls.load_full();
            let (params, controls) = self.build_parameters(&mut layout, &previous);

            let frames = self.common.buffer_size() as usize;
            let sequence_size = self.sequence_size();
            rt.buffers = (0..rt.units.len())
                .map(|_| UnitBuffers::new(&self.info, frames, sequence_size))
                .collect();
            rt.wet = vec![vec![0.0; frames]; layout.logical_outs()];
            rt.scratch = vec![0.0; frames];
            rt.next_bank = 0;

            let ports = self.build_ports(&layout, &params);
            self.common.set_hints(self.compute_hints(&layout));
            rt.layout = layout;

            let latency = self.probe_latency(&mut rt, &controls);
            {
                let channels = rt.layout.logical_ins().max(rt.layout.logical_outs());
                let mut buffers = self.common.latency.lock();
                buffers.recreate(channels, latency as usize);
            }
            if latency > 0 {
                tracing::debug!("Plugin '{}' reports {} frames of latency", self.info.uri, latency);
            }

            *self.common.parameters.write() = params;
            *self.common.ports.write() = ports;
            self.controls.store(Arc::new(controls));
        }
        self.ui.lock().sent_outputs.clear();

        self.reload_programs(first_reload);

        if was_active {
            let mut rt = self.rt.lock();
            self.activate_units(&mut rt);
        }

        tracing::debug!(
            "Reloaded LV2 plugin '{}': {} parameters",
            self.info.uri,
            self.common.parameter_count()
        );
        Ok(())
    }

    fn process(&self, ctx: &mut ProcessContext<'_>) {
        self.process_block(ctx);
    }

    fn category(&self) -> PluginCategory {
        self.info.category
    }

    fn label(&self) -> String {
        self.info.uri.clone()
    }

    fn maker(&self) -> String {
        self.info.maker.clone()
    }

    fn copyright(&self) -> String {
        self.info.license.clone()
    }

    fn unique_id(&self) -> i64 {
        self.info.unique_id
    }

    fn filename(&self) -> String {
        self.info.binary.clone()
    }

    fn options_available(&self) -> PluginOptions {
        let mut options = PluginOptions::empty();

        if self.info.latency_port().is_none()
            && self.info.midi_outs() == 0
            && !self.info.needs_fixed_buffers()
        {
            options.insert(PluginOptions::FIXED_BUFFERS);
        }

        if !self.common.engine_options().force_stereo {
            let ins = self.info.audio_ins();
            let outs = self.info.audio_outs();
            if ins == 1 || outs == 1 || self.has_second_unit.load(Ordering::Acquire) {
                options.insert(PluginOptions::FORCE_STEREO);
            }
        }

        if self.info.has_extension(Lv2Extensions::PROGRAMS) {
            options.insert(PluginOptions::MAP_PROGRAM_CHANGES);
        }

        if self.info.midi_ins() > 0 {
            options.insert(PluginOptions::SEND_CONTROL_CHANGES);
            options.insert(PluginOptions::SEND_CHANNEL_PRESSURE);
            options.insert(PluginOptions::SEND_NOTE_AFTERTOUCH);
            options.insert(PluginOptions::SEND_PITCHBEND);
            options.insert(PluginOptions::SEND_ALL_SOUND_OFF);
            options.insert(PluginOptions::SEND_PROGRAM_CHANGES);
        }

        options
    }

    fn set_option(&self, option: PluginOptions, enabled: bool, send_callback: bool) {
        let mut options = self.common.options();
        if options.contains(option) == enabled {
            return;
        }
        options.set(option, enabled);
        self.common.set_options(options);
        if send_callback {
            self.common.callback(
                EngineCallbackOpcode::OptionChanged,
                option.bits() as i32,
                i32::from(enabled),
                0,
                0.0,
                None,
            );
        }

        if option == PluginOptions::FORCE_STEREO {
            if let Err(err) = self.reload() {
                tracing::error!("Reload after option change failed: {}", err);
            }
            self.common
                .callback(EngineCallbackOpcode::ReloadAll, 0, 0, 0, 0.0, None);
        }
    }

    fn parameter_value(&self, index: u32) -> f32 {
        let Some(slot) = self.control_slot(index) else {
            return 0.0;
        };
        self.controls.load().get(slot).map_or(0.0, AtomicFloat::get)
    }

    fn parameter_text(&self, index: u32) -> Option<String> {
        let slot = self.control_slot(index)?;
        let port = self.info.ports.get(slot)?;
        let value = self.parameter_value(index);
        port.scale_points
            .iter()
            .find(|(point, _)| (point - value).abs() < f32::EPSILON)
            .map(|(_, label)| label.clone())
    }

    fn set_parameter_value(&self, index: u32, value: f32, send_gui: bool, send_callback: bool) {
        let Some(param) = self.common.parameter(index) else {
            return;
        };
        let Ok(slot) = usize::try_from(param.data.rindex) else {
            return;
        };
        let value = param.ranges.fix_value(value);
        if let Some(control) = self.controls.load().get(slot) {
            control.set(value);
        }

        if let Some(lv2_param) = self.lv2_parameter_at(slot, self.info.ports.len()) {
            if lv2_param.is_input {
                if let Some(port) = self.ctrl_in_port() {
                    let property = self.urids.map(&lv2_param.uri);
                    let (value_type, body) = parameter_atom(lv2_param.kind, value);
                    self.queue_atom(port, &forge_patch_set(property, value_type, &body));
                }
            }
        }

        if send_gui {
            self.ui_parameter_change(index, value);
        }
        if send_callback {
            self.common.callback(
                EngineCallbackOpcode::ParameterValueChanged,
                index as i32,
                0,
                0,
                value,
                None,
            );
        }
    }

    fn set_parameter_value_rt(&self, index: u32, value: f32) {
        let Some(param) = self.common.parameters.try_read().and_then(|p| p.get(index as usize).cloned()) else {
            return;
        };
        let value = param.ranges.fix_value(value);
        if let Ok(slot) = usize::try_from(param.data.rindex) {
            if let Some(control) = self.controls.load().get(slot) {
                control.set(value);
            }
        }
        self.common
            .postpone_rt_event(crate::plugin::PostRtEvent::ParameterChange {
                index: index as i32,
                value,
                send_callback: true,
            });
    }

    fn set_program(&self, index: i32, send_gui: bool, send_callback: bool, _doing_init: bool) {
        let count = self.common.programs.read().count() as i32;
        if index < -1 || index >= count {
            return;
        }
        if let Ok(preset) = usize::try_from(index) {
            let _master = self.common.master_lock.lock();
            self.load_preset(preset);
        }
        self.common.program_changed(index, send_callback);
        if send_gui {
            self.ui_program_change(index.max(0) as u32);
        }
    }

    fn set_midi_program(&self, index: i32, send_gui: bool, send_callback: bool, _doing_init: bool) {
        let program = {
            let programs = self.common.midi_programs.read();
            if index < -1 || index >= programs.count() as i32 {
                return;
            }
            usize::try_from(index).ok().and_then(|i| programs.data.get(i).cloned())
        };
        if let Some(program) = program {
            let mut rt = self.rt.lock();
            for unit in rt.units.iter_mut() {
                guard_native("programs.select_program", || {
                    if let Some(programs) = unit.programs() {
                        programs.select_program(program.bank, program.program);
                    }
                });
            }
        }
        self.common.midi_program_changed(index, send_callback);
        if send_gui {
            self.ui_midi_program_change(index.max(0) as u32);
        }
    }

    fn reload_programs(&self, init: bool) {
        let old_count = self.common.programs.read().count();
        let names: Vec<String> = self.info.presets.iter().map(|p| p.label.clone()).collect();
        {
            let mut programs = self.common.programs.write();
            let new_count = names.len();
            programs.names = names;
            programs.current = if init {
                -1
            } else {
                fix_current_index(programs.current, old_count, new_count)
            };
        }

        let midi = self.read_midi_programs();
        let old_midi_count = self.common.midi_programs.read().count();
        let new_midi_count = midi.len();
        let current = {
            let mut programs = self.common.midi_programs.write();
            let current = if init {
                if new_midi_count > 0 {
                    0
                } else {
                    -1
                }
            } else {
                fix_current_index(programs.current, old_midi_count, new_midi_count)
            };
            programs.data = midi;
            programs.current = -1;
            current
        };
        if current >= 0 {
            self.set_midi_program(current, false, !init, true);
        }

        if !init {
            self.common
                .callback(EngineCallbackOpcode::ReloadPrograms, 0, 0, 0, 0.0, None);
        }
    }

    fn set_custom_data(&self, data_type: &str, key: &str, value: &str, send_gui: bool) {
        if data_type.is_empty() || key.is_empty() {
            tracing::warn!("Ignoring custom data with empty type or key");
            return;
        }
        custom_data::upsert(
            &mut self.common.custom_data.write(),
            CustomData::new(data_type, key, value),
        );
        if data_type == CUSTOM_DATA_TYPE_PROPERTY {
            return;
        }

        let Some(lv2_param) = self
            .info
            .parameters
            .iter()
            .find(|p| p.uri == key && p.is_input && !p.is_numeric())
        else {
            return;
        };
        let Some(port) = self.ctrl_in_port() else {
            return;
        };
        let property = self.urids.map(&lv2_param.uri);
        let value_type = if lv2_param.kind == Lv2ParameterKind::Path {
            URID_ATOM_PATH
        } else {
            URID_ATOM_STRING
        };
        let atom = forge_patch_set(property, value_type, &string_body(value));
        self.queue_atom(port, &atom);
        if send_gui {
            self.ui_send_atom(port, &atom);
        }
    }

    fn prepare_for_save(&self, temporary: bool) {
        if !self.info.has_extension(Lv2Extensions::STATE) {
            return;
        }
        self.paths.set_temporary(temporary);
        let mut rt = self.rt.lock();
        let Some(unit) = rt.units.first_mut() else {
            return;
        };
        let mut custom = self.common.custom_data.write();
        guard_native("state.save", || {
            if let Some(state) = unit.state() {
                state.save(
                    &mut |key: u32, value: &[u8], value_type: u32| {
                        store_value(&mut custom, &self.urids, key, value, value_type)
                    },
                    &self.paths,
                );
            }
        });
    }

    fn restore_state(&self, temporary: bool) {
        if !self.info.has_extension(Lv2Extensions::STATE) {
            return;
        }
        self.paths.set_temporary(temporary);
        let custom = self.common.custom_data_list();
        let mut rt = self.rt.lock();
        for unit in rt.units.iter_mut() {
            guard_native("state.restore", || {
                if let Some(state) = unit.state() {
                    state.restore(&|key| retrieve_value(&custom, &self.urids, key), &self.paths);
                }
            });
        }
    }

    fn activate(&self) {
        let mut rt = self.rt.lock();
        self.activate_units(&mut rt);
    }

    fn deactivate(&self) {
        let mut rt = self.rt.lock();
        self.deactivate_units(&mut rt);
    }

    fn buffer_size_changed(&self, buffer_size: u32) {
        self.common.store_buffer_size(buffer_size);
        let active = self.common.is_active();
        let mut rt = self.rt.lock();
        if active {
            self.deactivate_units(&mut rt);
        }
        let frames = buffer_size as usize;
        for buffers in rt.buffers.iter_mut() {
            for (buffer, port) in buffers.audio.iter_mut().zip(&self.info.ports) {
                if matches!(port.kind, PortKind::Audio | PortKind::Cv) {
                    buffer.resize(frames, 0.0);
                }
            }
        }
        for buffer in rt.wet.iter_mut() {
            buffer.resize(frames, 0.0);
        }
        rt.scratch.resize(frames, 0.0);
        self.send_options(
            &mut rt,
            &[
                (URID_BUF_NOMINAL_LENGTH, Lv2OptionValue::Int(buffer_size as i32)),
                (URID_BUF_MAX_LENGTH, Lv2OptionValue::Int(buffer_size as i32)),
            ],
        );
        if active {
            self.activate_units(&mut rt);
        }
    }

    fn sample_rate_changed(&self, sample_rate: f64) {
        self.common.store_sample_rate(sample_rate);
        let mut rt = self.rt.lock();
        self.send_options(
            &mut rt,
            &[(URID_PARAM_SAMPLE_RATE, Lv2OptionValue::Float(sample_rate as f32))],
        );
        let controls = self.controls.load();
        for (port, value) in rt.layout.sample_rate_ports.iter_mut() {
            *value = sample_rate as f32;
            if let Some(control) = controls.get(*port as usize) {
                control.set(*value);
            }
        }
    }

    fn offline_mode_changed(&self, offline: bool) {
        self.common.store_offline(offline);
        let port = self.rt.lock().layout.freewheel_port;
        if let Some(port) = port {
            if let Some(control) = self.controls.load().get(port as usize) {
                control.set(if offline { 1.0 } else { 0.0 });
            }
        }
    }

    fn idle(&self) {
        if self.common.is_offline() {
            return;
        }
        if let Some(worker) = self.worker.lock().as_mut() {
            let ran = worker.run_pending();
            if ran > 0 {
                tracing::trace!("Ran {} worker jobs for '{}'", ran, self.info.uri);
            }
        }
    }

    fn show_custom_ui(&self, show: bool) {
        self.show_ui(show);
    }

    fn ui_idle(&self) {
        self.idle_ui();
    }

    fn ui_parameter_change(&self, index: u32, value: f32) {
        self.ui_send_parameter(index, value);
    }

    fn ui_program_change(&self, index: u32) {
        self.ui_send(&crate::protocol::UiMessage::Program(index));
    }

    fn ui_midi_program_change(&self, index: u32) {
        let program = self.common.midi_programs.read().data.get(index as usize).cloned();
        if let Some(program) = program {
            self.ui_send(&crate::protocol::UiMessage::MidiProgram {
                bank: program.bank,
                program: program.program,
            });
        }
    }

    fn ui_note_on(&self, channel: u8, note: u8, velocity: u8) {
        self.ui_send(&crate::protocol::UiMessage::Note {
            on: true,
            channel,
            note,
            velocity,
        });
    }

    fn ui_note_off(&self, channel: u8, note: u8) {
        self.ui_send(&crate::protocol::UiMessage::Note {
            on: false,
            channel,
            note,
            velocity: 0,
        });
    }

    fn prepare_for_deletion(&self) {
        self.common.set_enabled(false);
        self.show_ui(false);
    }
}
