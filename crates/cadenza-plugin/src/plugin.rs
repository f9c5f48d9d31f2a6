//! The uniform plugin contract every adapter implements.
//!
//! [`PluginCommon`] carries the state shared by all adapters. It is built from
//! atomics and short-lived locks so the engine can call `&self` methods from
//! the main thread while the audio thread is inside [`Plugin::process`].

use crate::custom_data::{self, CustomData, CUSTOM_DATA_TYPE_PROPERTY};
use crate::error::{PluginError, Result};
use crate::hints::{ParameterHints, PluginHints, PluginOptions};
use crate::parameter::{
    Parameter, ParameterType, PARAMETER_ACTIVE, PARAMETER_BALANCE_LEFT, PARAMETER_BALANCE_RIGHT,
    PARAMETER_CTRL_CHANNEL, PARAMETER_DRYWET, PARAMETER_PANNING, PARAMETER_VOLUME,
};
use crate::program::{MidiProgramList, ProgramList};
use crate::state::{compact_base64, StateParameter, StateSave};
use base64::Engine as _;
use cadenza_core::{
    AtomicDouble, AtomicFloat, BinaryType, CallbackSink, EngineCallbackOpcode, EngineEvent,
    EngineOptions, EventBuffer, LatencyBuffers, PluginCategory, PluginType, TimeInfo, XmlNode,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, Ordering};
use std::sync::Arc;

const POST_RT_EVENTS_CAPACITY: usize = 512;

/// Arguments a plugin was created with; kept so the engine can clone it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginInit {
    pub binary_type: BinaryType,
    pub plugin_type: PluginType,
    pub filename: String,
    pub name: String,
    pub label: String,
    pub unique_id: i64,
    /// Requested options; `None` applies [`PluginOptions::DEFAULTS`] within what is available.
    pub options: Option<PluginOptions>,
}

/// Folder of the project being saved or loaded, shared between engine and plugins.
#[derive(Debug, Clone, Default)]
pub struct ProjectFolder(Arc<RwLock<Option<PathBuf>>>);

impl ProjectFolder {
    pub fn get(&self) -> Option<PathBuf> {
        self.0.read().clone()
    }

    pub fn set(&self, folder: Option<PathBuf>) {
        *self.0.write() = folder;
    }
}

/// Everything a plugin needs from the engine at construction time.
#[derive(Debug, Clone)]
pub struct EngineInit {
    pub sample_rate: f64,
    pub buffer_size: u32,
    pub options: Arc<EngineOptions>,
    pub callbacks: CallbackSink,
    pub project_folder: ProjectFolder,
}

impl Default for EngineInit {
    fn default() -> Self {
        let options = EngineOptions::default();
        Self {
            sample_rate: f64::from(options.audio_sample_rate),
            buffer_size: options.audio_buffer_size,
            options: Arc::new(options),
            callbacks: CallbackSink::default(),
            project_folder: ProjectFolder::default(),
        }
    }
}

/// Port names exposed to the engine, rebuilt on every reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginPorts {
    pub audio_in: Vec<String>,
    pub audio_out: Vec<String>,
    pub cv_in: Vec<String>,
    pub cv_out: Vec<String>,
    pub event_in: Vec<String>,
    pub event_out: Vec<String>,
}

/// Buffers for one processing block.
pub struct ProcessContext<'a> {
    pub audio_in: &'a [Vec<f32>],
    pub audio_out: &'a mut [Vec<f32>],
    pub cv_in: &'a [Vec<f32>],
    pub cv_out: &'a mut [Vec<f32>],
    pub events_in: &'a [EngineEvent],
    pub events_out: &'a mut EventBuffer,
    pub time: &'a TimeInfo,
    pub frames: u32,
}

impl ProcessContext<'_> {
    /// Zero every output buffer for this block.
    pub fn silence(&mut self) {
        let frames = self.frames as usize;
        for buffer in self.audio_out.iter_mut().chain(self.cv_out.iter_mut()) {
            let end = frames.min(buffer.len());
            buffer[..end].fill(0.0);
        }
    }
}

/// Changes made on the audio thread, reported to the host from `idle()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostRtEvent {
    /// `index` may be one of the negative internal parameters (dry/wet, volume, ...).
    ParameterChange { index: i32, value: f32, send_callback: bool },
    ProgramChange(i32),
    MidiProgramChange(i32),
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
}

/// Dry/wet, volume, balance and panning applied after the plugin ran.
#[derive(Debug, Default)]
pub struct PostProcessing {
    pub dry_wet: AtomicFloat,
    pub volume: AtomicFloat,
    pub balance_left: AtomicFloat,
    pub balance_right: AtomicFloat,
    pub panning: AtomicFloat,
}

impl PostProcessing {
    fn new() -> Self {
        Self {
            dry_wet: AtomicFloat::new(1.0),
            volume: AtomicFloat::new(1.0),
            balance_left: AtomicFloat::new(-1.0),
            balance_right: AtomicFloat::new(1.0),
            panning: AtomicFloat::new(0.0),
        }
    }
}

/// State shared by every adapter.
pub struct PluginCommon {
    init: PluginInit,
    id: AtomicU32,
    name: RwLock<String>,
    enabled: AtomicBool,
    active: AtomicBool,
    needs_reset: AtomicBool,
    hints: AtomicU32,
    options: AtomicU32,
    ctrl_channel: AtomicI8,
    pub post_proc: PostProcessing,
    pub parameters: RwLock<Vec<Parameter>>,
    pub programs: RwLock<ProgramList>,
    pub midi_programs: RwLock<MidiProgramList>,
    pub custom_data: RwLock<Vec<CustomData>>,
    pub ports: RwLock<PluginPorts>,
    pub latency: Mutex<LatencyBuffers>,
    /// Serializes structural changes (reload, program loading) on non-audio threads.
    pub master_lock: Mutex<()>,
    sample_rate: AtomicDouble,
    buffer_size: AtomicU32,
    offline: AtomicBool,
    callbacks: CallbackSink,
    engine_options: Arc<EngineOptions>,
    project_folder: ProjectFolder,
    post_rt_tx: Sender<PostRtEvent>,
    post_rt_rx: Receiver<PostRtEvent>,
}

impl std::fmt::Debug for PluginCommon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCommon")
            .field("id", &self.id())
            .field("name", &*self.name.read())
            .field("type", &self.init.plugin_type)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PluginCommon {
    pub fn new(id: u32, init: PluginInit, engine: &EngineInit) -> Self {
        let (post_rt_tx, post_rt_rx) = crossbeam_channel::bounded(POST_RT_EVENTS_CAPACITY);
        Self {
            name: RwLock::new(init.name.clone()),
            init,
            id: AtomicU32::new(id),
            enabled: AtomicBool::new(false),
            active: AtomicBool::new(false),
            needs_reset: AtomicBool::new(false),
            hints: AtomicU32::new(0),
            options: AtomicU32::new(0),
            ctrl_channel: AtomicI8::new(0),
            post_proc: PostProcessing::new(),
            parameters: RwLock::new(Vec::new()),
            programs: RwLock::new(ProgramList::new()),
            midi_programs: RwLock::new(MidiProgramList::new()),
            custom_data: RwLock::new(Vec::new()),
            ports: RwLock::new(PluginPorts::default()),
            latency: Mutex::new(LatencyBuffers::default()),
            master_lock: Mutex::new(()),
            sample_rate: AtomicDouble::new(engine.sample_rate),
            buffer_size: AtomicU32::new(engine.buffer_size),
            offline: AtomicBool::new(false),
            callbacks: engine.callbacks.clone(),
            engine_options: Arc::clone(&engine.options),
            project_folder: engine.project_folder.clone(),
            post_rt_tx,
            post_rt_rx,
        }
    }

    pub fn init(&self) -> &PluginInit {
        &self.init
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn store_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Acquire)
    }

    pub fn set_needs_reset(&self, value: bool) {
        self.needs_reset.store(value, Ordering::Release);
    }

    /// Clear the reset flag, returning whether it was set.
    pub fn take_needs_reset(&self) -> bool {
        self.needs_reset.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn hints(&self) -> PluginHints {
        PluginHints::from_bits(self.hints.load(Ordering::Acquire))
    }

    pub fn set_hints(&self, hints: PluginHints) {
        self.hints.store(hints.bits(), Ordering::Release);
    }

    #[inline]
    pub fn options(&self) -> PluginOptions {
        PluginOptions::from_bits(self.options.load(Ordering::Acquire))
    }

    pub fn set_options(&self, options: PluginOptions) {
        self.options.store(options.bits(), Ordering::Release);
    }

    #[inline]
    pub fn ctrl_channel(&self) -> i8 {
        self.ctrl_channel.load(Ordering::Acquire)
    }

    pub fn store_ctrl_channel(&self, channel: i8) {
        self.ctrl_channel.store(channel, Ordering::Release);
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.get()
    }

    pub fn store_sample_rate(&self, sample_rate: f64) {
        self.sample_rate.set(sample_rate);
    }

    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Acquire)
    }

    pub fn store_buffer_size(&self, buffer_size: u32) {
        self.buffer_size.store(buffer_size, Ordering::Release);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub fn store_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn callbacks(&self) -> &CallbackSink {
        &self.callbacks
    }

    pub fn engine_options(&self) -> &EngineOptions {
        &self.engine_options
    }

    pub fn project_folder(&self) -> Option<PathBuf> {
        self.project_folder.get()
    }

    pub fn latency_frames(&self) -> u32 {
        self.latency.lock().frames() as u32
    }

    /// Emit a callback tagged with this plugin's id.
    pub fn callback(
        &self,
        opcode: EngineCallbackOpcode,
        value1: i32,
        value2: i32,
        value3: i32,
        valuef: f32,
        value_str: Option<&str>,
    ) {
        self.callbacks
            .call(opcode, self.id(), value1, value2, value3, valuef, value_str);
    }

    /// Queue a change made on the audio thread. Never blocks; drops when full.
    #[inline]
    pub fn postpone_rt_event(&self, event: PostRtEvent) {
        if self.post_rt_tx.try_send(event).is_err() {
            tracing::trace!("post-rt event queue full, event dropped");
        }
    }

    /// Drain postponed audio-thread events.
    pub fn take_post_rt_events(&self) -> Vec<PostRtEvent> {
        self.post_rt_rx.try_iter().collect()
    }

    pub fn parameter_count(&self) -> u32 {
        self.parameters.read().len() as u32
    }

    pub fn parameter(&self, index: u32) -> Option<Parameter> {
        self.parameters.read().get(index as usize).cloned()
    }

    pub fn custom_data_list(&self) -> Vec<CustomData> {
        self.custom_data.read().clone()
    }

    pub fn find_custom_data(&self, data_type: &str, key: &str) -> Option<String> {
        self.custom_data
            .read()
            .iter()
            .find(|d| d.data_type == data_type && d.key == key)
            .map(|d| d.value.clone())
    }

    /// Default program selection after programs were reloaded.
    ///
    /// Adapters call this from `set_program` once their own work is done.
    pub fn program_changed(&self, index: i32, send_callback: bool) {
        self.programs.write().current = index;
        if send_callback {
            self.callback(EngineCallbackOpcode::ProgramChanged, index, 0, 0, 0.0, None);
        }
    }

    pub fn midi_program_changed(&self, index: i32, send_callback: bool) {
        self.midi_programs.write().current = index;
        if send_callback {
            self.callback(EngineCallbackOpcode::MidiProgramChanged, index, 0, 0, 0.0, None);
        }
    }

    /// Apply dry/wet, balance and volume to one processed span and copy it into `dest`.
    ///
    /// `wet` holds the plugin output for `frames` samples, `inputs` the engine
    /// inputs for the whole block, read from `offset`. Dry samples come from the
    /// latency buffers while the plugin reports latency.
    #[allow(clippy::too_many_arguments)]
    pub fn post_process(
        &self,
        inputs: &[Vec<f32>],
        offset: usize,
        wet: &mut [Vec<f32>],
        dest: &mut [Vec<f32>],
        frames: usize,
        scratch: &mut [f32],
    ) {
        let hints = self.hints();
        let dry_wet = self.post_proc.dry_wet.get();
        let balance_left = self.post_proc.balance_left.get();
        let balance_right = self.post_proc.balance_right.get();
        let volume = self.post_proc.volume.get();

        let do_dry_wet = hints.contains(PluginHints::CAN_DRYWET) && dry_wet != 1.0;
        let do_balance = hints.contains(PluginHints::CAN_BALANCE)
            && !(balance_left == -1.0 && balance_right == 1.0);
        let is_mono = inputs.len() == 1;
        let mut latency = self.latency.try_lock();
        let outputs = wet.len();

        for i in 0..outputs {
            if do_dry_wet {
                let c = if is_mono { 0 } else { i };
                if let Some(input) = inputs.get(c) {
                    let input = &input[offset..(offset + frames).min(input.len())];
                    let out = &mut wet[i];
                    for k in 0..frames {
                        let dry = match latency.as_ref() {
                            Some(buffers) => buffers.dry_sample(c, k, input),
                            None => input.get(k).copied().unwrap_or(0.0),
                        };
                        out[k] = out[k] * dry_wet + dry * (1.0 - dry_wet);
                    }
                }
            }

            if do_balance && frames <= scratch.len() {
                let is_pair = i % 2 == 0;
                if is_pair {
                    scratch[..frames].copy_from_slice(&wet[i][..frames]);
                }
                let range_left = (balance_left + 1.0) / 2.0;
                let range_right = (balance_right + 1.0) / 2.0;
                if is_pair {
                    if i + 1 < outputs {
                        let (left, right) = wet.split_at_mut(i + 1);
                        let out = &mut left[i];
                        let next = &right[0];
                        for k in 0..frames {
                            out[k] = scratch[k] * (1.0 - range_left) + next[k] * (1.0 - range_right);
                        }
                    }
                } else {
                    let out = &mut wet[i];
                    for k in 0..frames {
                        out[k] = out[k] * range_right + scratch[k] * range_left;
                    }
                }
            }

            if let Some(dest) = dest.get_mut(i) {
                let end = (offset + frames).min(dest.len());
                for (d, s) in dest[offset..end].iter_mut().zip(&wet[i][..frames]) {
                    *d = s * volume;
                }
            }
        }

        if let Some(buffers) = latency.as_mut() {
            if buffers.frames() > 0 {
                let spans: smallvec::SmallVec<[&[f32]; 8]> = inputs
                    .iter()
                    .map(|input| &input[offset.min(input.len())..(offset + frames).min(input.len())])
                    .collect();
                buffers.store(&spans, frames);
            }
        }
    }
}

/// Run a call into foreign code, turning a panic into a logged error.
pub fn guard_native<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Native plugin call '{}' panicked: {}", what, message);
            None
        }
    }
}

/// The plugin contract the engine drives.
///
/// Adapters implement the required methods and override the hooks they need.
/// Provided methods implement the behaviour shared by every plugin format.
pub trait Plugin: Send + Sync {
    fn common(&self) -> &PluginCommon;

    fn plugin_type(&self) -> PluginType;

    /// Rebuild ports, parameters and programs from the native descriptor.
    fn reload(&self) -> Result<()>;

    /// Process one block. Called only on the audio thread.
    fn process(&self, ctx: &mut ProcessContext<'_>);

    // ------------------------------------------------------------------
    // Information

    fn category(&self) -> PluginCategory {
        PluginCategory::None
    }

    fn label(&self) -> String {
        self.common().init().label.clone()
    }

    fn maker(&self) -> String {
        String::new()
    }

    fn copyright(&self) -> String {
        String::new()
    }

    fn unique_id(&self) -> i64 {
        self.common().init().unique_id
    }

    fn filename(&self) -> String {
        self.common().init().filename.clone()
    }

    /// Options the user may toggle for this plugin.
    fn options_available(&self) -> PluginOptions {
        PluginOptions::empty()
    }

    // ------------------------------------------------------------------
    // Parameters

    fn parameter_value(&self, index: u32) -> f32 {
        self.common()
            .parameter(index)
            .map_or(0.0, |param| param.ranges.def)
    }

    fn parameter_text(&self, _index: u32) -> Option<String> {
        None
    }

    fn set_parameter_value(&self, index: u32, value: f32, _send_gui: bool, send_callback: bool) {
        let Some(param) = self.common().parameter(index) else {
            return;
        };
        let value = param.ranges.fix_value(value);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                index as i32,
                0,
                0,
                value,
                None,
            );
        }
    }

    /// Audio-thread variant; the host is told later from `idle()`.
    fn set_parameter_value_rt(&self, index: u32, value: f32) {
        self.common().postpone_rt_event(PostRtEvent::ParameterChange {
            index: index as i32,
            value,
            send_callback: true,
        });
    }

    fn set_parameter_midi_channel(&self, index: u32, channel: u8, send_callback: bool) {
        let channel = channel.min(15);
        {
            let mut params = self.common().parameters.write();
            let Some(param) = params.get_mut(index as usize) else {
                return;
            };
            param.data.midi_channel = channel;
        }
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterMidiChannelChanged,
                index as i32,
                i32::from(channel),
                0,
                0.0,
                None,
            );
        }
    }

    fn set_parameter_mapped_control_index(&self, index: u32, control: i16, send_callback: bool) {
        {
            let mut params = self.common().parameters.write();
            let Some(param) = params.get_mut(index as usize) else {
                return;
            };
            param.data.mapped_control_index = control;
        }
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterMidiCcChanged,
                index as i32,
                i32::from(control),
                0,
                0.0,
                None,
            );
        }
    }

    // ------------------------------------------------------------------
    // Programs

    fn set_program(&self, index: i32, _send_gui: bool, send_callback: bool, _doing_init: bool) {
        let count = self.common().programs.read().count() as i32;
        if index >= count {
            return;
        }
        self.common().program_changed(index.max(-1), send_callback);
    }

    fn set_midi_program(&self, index: i32, _send_gui: bool, send_callback: bool, _doing_init: bool) {
        let count = self.common().midi_programs.read().count() as i32;
        if index >= count {
            return;
        }
        self.common().midi_program_changed(index.max(-1), send_callback);
    }

    /// Audio-thread program change from a MIDI program message.
    fn set_midi_program_rt(&self, index: u32) {
        if let Some(mut programs) = self.common().midi_programs.try_write() {
            programs.current = index as i32;
        }
        self.common()
            .postpone_rt_event(PostRtEvent::MidiProgramChange(index as i32));
    }

    fn set_midi_program_by_id(&self, bank: u32, program: u32, send_gui: bool, send_callback: bool) {
        let found = self.common().midi_programs.read().find(bank, program);
        if let Some(index) = found {
            self.set_midi_program(index as i32, send_gui, send_callback, false);
        }
    }

    /// Rebuild program lists. `init` selects the first program.
    fn reload_programs(&self, _init: bool) {}

    // ------------------------------------------------------------------
    // Custom data and chunks

    fn set_custom_data(&self, data_type: &str, key: &str, value: &str, _send_gui: bool) {
        if data_type.is_empty() || key.is_empty() {
            tracing::warn!("Ignoring custom data with empty type or key");
            return;
        }
        custom_data::upsert(
            &mut self.common().custom_data.write(),
            CustomData::new(data_type, key, value),
        );
    }

    /// Entries that must be applied before programs are restored.
    fn custom_data_reloads_programs(&self, _data: &CustomData) -> bool {
        false
    }

    fn chunk_data(&self) -> Option<Vec<u8>> {
        None
    }

    fn set_chunk_data(&self, _data: &[u8]) -> Result<()> {
        Err(PluginError::Unsupported("chunks".into()))
    }

    /// Flush native state into custom data before a save.
    fn prepare_for_save(&self, _temporary: bool) {}

    /// Push custom data back into the native state after a load.
    fn restore_state(&self, _temporary: bool) {}

    /// Parameters are matched by symbol instead of index when restoring.
    fn uses_parameter_symbols(&self) -> bool {
        self.plugin_type() == PluginType::Lv2
    }

    // ------------------------------------------------------------------
    // Runtime hooks

    /// Activate the native handle. `set_active` tracks the flag.
    fn activate(&self) {}

    fn deactivate(&self) {}

    fn buffer_size_changed(&self, buffer_size: u32) {
        self.common().store_buffer_size(buffer_size);
    }

    fn sample_rate_changed(&self, sample_rate: f64) {
        self.common().store_sample_rate(sample_rate);
    }

    fn offline_mode_changed(&self, offline: bool) {
        self.common().store_offline(offline);
    }

    fn show_custom_ui(&self, _show: bool) {}

    fn idle(&self) {}

    fn ui_idle(&self) {}

    fn ui_parameter_change(&self, _index: u32, _value: f32) {}

    fn ui_program_change(&self, _index: u32) {}

    fn ui_midi_program_change(&self, _index: u32) {}

    fn ui_note_on(&self, _channel: u8, _note: u8, _velocity: u8) {}

    fn ui_note_off(&self, _channel: u8, _note: u8) {}

    /// Called right before the plugin is queued for deletion.
    fn prepare_for_deletion(&self) {
        self.common().set_enabled(false);
    }

    // ------------------------------------------------------------------
    // Shared behaviour

    fn id(&self) -> u32 {
        self.common().id()
    }

    fn name(&self) -> String {
        self.common().name()
    }

    fn hints(&self) -> PluginHints {
        self.common().hints()
    }

    fn options(&self) -> PluginOptions {
        self.common().options()
    }

    fn is_enabled(&self) -> bool {
        self.common().is_enabled()
    }

    fn is_active(&self) -> bool {
        self.common().is_active()
    }

    fn set_option(&self, option: PluginOptions, enabled: bool, send_callback: bool) {
        let mut options = self.common().options();
        options.set(option, enabled);
        self.common().set_options(options);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::OptionChanged,
                option.bits() as i32,
                i32::from(enabled),
                0,
                0.0,
                None,
            );
        }
    }

    fn set_active(&self, active: bool, send_callback: bool) {
        if self.common().is_active() == active {
            return;
        }
        if active {
            self.activate();
        } else {
            self.deactivate();
        }
        self.common().store_active(active);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_ACTIVE,
                0,
                0,
                if active { 1.0 } else { 0.0 },
                None,
            );
        }
    }

    fn set_dry_wet(&self, value: f32, send_callback: bool) {
        let value = value.clamp(0.0, 1.0);
        self.common().post_proc.dry_wet.set(value);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_DRYWET,
                0,
                0,
                value,
                None,
            );
        }
    }

    fn set_volume(&self, value: f32, send_callback: bool) {
        let value = value.clamp(0.0, 1.27);
        self.common().post_proc.volume.set(value);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_VOLUME,
                0,
                0,
                value,
                None,
            );
        }
    }

    fn set_balance_left(&self, value: f32, send_callback: bool) {
        let value = value.clamp(-1.0, 1.0);
        self.common().post_proc.balance_left.set(value);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_BALANCE_LEFT,
                0,
                0,
                value,
                None,
            );
        }
    }

    fn set_balance_right(&self, value: f32, send_callback: bool) {
        let value = value.clamp(-1.0, 1.0);
        self.common().post_proc.balance_right.set(value);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_BALANCE_RIGHT,
                0,
                0,
                value,
                None,
            );
        }
    }

    fn set_panning(&self, value: f32, send_callback: bool) {
        let value = value.clamp(-1.0, 1.0);
        self.common().post_proc.panning.set(value);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_PANNING,
                0,
                0,
                value,
                None,
            );
        }
    }

    /// `-1` disables control events; `0..=15` selects a MIDI channel.
    fn set_ctrl_channel(&self, channel: i8, send_callback: bool) {
        let channel = channel.clamp(-1, 15);
        self.common().store_ctrl_channel(channel);
        if send_callback {
            self.common().callback(
                EngineCallbackOpcode::ParameterValueChanged,
                PARAMETER_CTRL_CHANNEL,
                0,
                0,
                f32::from(channel),
                None,
            );
        }
    }

    /// Report audio-thread changes to the host and the UI.
    fn post_rt_events_run(&self) {
        for event in self.common().take_post_rt_events() {
            match event {
                PostRtEvent::ParameterChange {
                    index,
                    value,
                    send_callback,
                } => {
                    if let Ok(index) = u32::try_from(index) {
                        self.ui_parameter_change(index, value);
                    }
                    if send_callback {
                        self.common().callback(
                            EngineCallbackOpcode::ParameterValueChanged,
                            index,
                            0,
                            0,
                            value,
                            None,
                        );
                    }
                }
                PostRtEvent::ProgramChange(index) => {
                    self.ui_program_change(index.max(0) as u32);
                    self.common()
                        .callback(EngineCallbackOpcode::ProgramChanged, index, 0, 0, 0.0, None);
                }
                PostRtEvent::MidiProgramChange(index) => {
                    self.ui_midi_program_change(index.max(0) as u32);
                    self.common().callback(
                        EngineCallbackOpcode::MidiProgramChanged,
                        index,
                        0,
                        0,
                        0.0,
                        None,
                    );
                }
                PostRtEvent::NoteOn {
                    channel,
                    note,
                    velocity,
                } => {
                    self.ui_note_on(channel, note, velocity);
                    self.common().callback(
                        EngineCallbackOpcode::NoteOn,
                        i32::from(channel),
                        i32::from(note),
                        i32::from(velocity),
                        0.0,
                        None,
                    );
                }
                PostRtEvent::NoteOff { channel, note } => {
                    self.ui_note_off(channel, note);
                    self.common().callback(
                        EngineCallbackOpcode::NoteOff,
                        i32::from(channel),
                        i32::from(note),
                        0,
                        0.0,
                        None,
                    );
                }
            }
        }
    }

    /// Snapshot everything needed to recreate this plugin.
    fn get_state_save(&self, call_prepare_for_save: bool) -> StateSave {
        if call_prepare_for_save {
            self.prepare_for_save(false);
        }

        let common = self.common();
        let plugin_type = self.plugin_type();
        let options = common.options();
        let mut state = StateSave {
            plugin_type,
            name: common.name(),
            label: self.label(),
            binary: self.filename(),
            unique_id: self.unique_id(),
            options: options.bits(),
            active: common.is_active(),
            dry_wet: common.post_proc.dry_wet.get(),
            volume: common.post_proc.volume.get(),
            balance_left: common.post_proc.balance_left.get(),
            balance_right: common.post_proc.balance_right.get(),
            panning: common.post_proc.panning.get(),
            ctrl_channel: common.ctrl_channel(),
            ..Default::default()
        };

        let mut using_chunk = false;
        if options.contains(PluginOptions::USE_CHUNKS) {
            if let Some(data) = self.chunk_data().filter(|d| !d.is_empty()) {
                state.chunk = Some(base64::engine::general_purpose::STANDARD.encode(data));
                using_chunk = plugin_type != PluginType::Internal;
            }
        }

        if plugin_type != PluginType::Lv2 {
            let programs = common.programs.read();
            if let Some(name) = programs.current_name() {
                state.current_program_index = programs.current;
                state.current_program_name = name.to_string();
            }
        }

        if plugin_type != PluginType::Lv2 && plugin_type != PluginType::Sf2 {
            if let Some(current) = common.midi_programs.read().current() {
                state.current_midi_bank = current.bank as i32;
                state.current_midi_program = current.program as i32;
            }
        }

        let sample_rate = common.sample_rate() as f32;
        let params = common.parameters.read().clone();
        for (i, param) in params.iter().enumerate() {
            if !param.has_hint(ParameterHints::IS_ENABLED)
                || param.has_hint(ParameterHints::IS_NOT_SAVED)
            {
                continue;
            }
            let dummy = param.data.kind != ParameterType::Input || using_chunk;
            if dummy && param.data.mapped_control_index <= crate::parameter::CONTROL_INDEX_NONE {
                continue;
            }
            let mut value = 0.0;
            if !dummy {
                value = self.parameter_value(i as u32);
                if param.has_hint(ParameterHints::USES_SAMPLERATE) {
                    value /= sample_rate;
                }
            }
            state.parameters.push(StateParameter {
                dummy,
                index: param.data.index,
                name: param.name.clone(),
                symbol: param.symbol.clone(),
                value,
                midi_channel: param.data.midi_channel,
                mapped_control_index: param.data.mapped_control_index,
                mapped_range: None,
            });
        }

        state.custom_data = common
            .custom_data
            .read()
            .iter()
            .filter(|d| d.is_valid())
            .cloned()
            .collect();
        state
    }

    /// Restore a snapshot: program-affecting data, programs, parameters,
    /// remaining custom data, chunk, then the internal controls.
    fn load_state_save(&self, state: &StateSave) {
        let common = self.common();
        let uses_multi_progs = common.hints().contains(PluginHints::USES_MULTI_PROGS);

        for data in state.custom_data.iter().filter(|d| d.is_valid()) {
            if self.custom_data_reloads_programs(data)
                || (uses_multi_progs && data.key == "midiPrograms")
            {
                self.set_custom_data(&data.data_type, &data.key, &data.value, true);
            }
        }

        if state.current_program_index >= 0 && !state.current_program_name.is_empty() {
            let program = {
                let programs = common.programs.read();
                if (state.current_program_index as usize) < programs.count() {
                    Some(state.current_program_index as usize)
                } else {
                    programs.find(-1, &state.current_program_name)
                }
            };
            if let Some(index) = program {
                self.set_program(index as i32, true, true, false);
            }
        }

        if state.current_midi_bank >= 0 && state.current_midi_program >= 0 && !uses_multi_progs {
            self.set_midi_program_by_id(
                state.current_midi_bank as u32,
                state.current_midi_program as u32,
                true,
                true,
            );
        }

        let by_symbol = self.uses_parameter_symbols();
        let params = common.parameters.read().clone();
        let sample_rate = common.sample_rate() as f32;
        for saved in &state.parameters {
            let index = if by_symbol {
                if saved.symbol.is_empty() {
                    tracing::warn!("Plugin parameter '{}' has no symbol", saved.name);
                    None
                } else {
                    let found = params.iter().position(|p| p.symbol == saved.symbol);
                    if found.is_none() {
                        tracing::warn!(
                            "Failed to find parameter symbol '{}' for '{}'",
                            saved.symbol,
                            common.name()
                        );
                    }
                    found
                }
            } else {
                usize::try_from(saved.index).ok()
            };

            let Some(index) = index.filter(|&i| i < params.len()) else {
                tracing::warn!(
                    "Could not set parameter '{}' value for '{}'",
                    saved.name,
                    common.name()
                );
                continue;
            };

            if !saved.dummy {
                let mut value = saved.value;
                if params[index].has_hint(ParameterHints::USES_SAMPLERATE) {
                    value *= sample_rate;
                }
                self.set_parameter_value(index as u32, value, true, true);
            }
            self.set_parameter_mapped_control_index(index as u32, saved.mapped_control_index, true);
            self.set_parameter_midi_channel(index as u32, saved.midi_channel, true);
        }

        for data in state.custom_data.iter().filter(|d| d.is_valid()) {
            if self.custom_data_reloads_programs(data)
                || (uses_multi_progs && data.key == "midiPrograms")
            {
                continue;
            }
            self.set_custom_data(&data.data_type, &data.key, &data.value, true);
        }

        if self.plugin_type() == PluginType::Lv2
            && common
                .custom_data
                .read()
                .iter()
                .any(|d| d.is_valid() && d.data_type != CUSTOM_DATA_TYPE_PROPERTY)
        {
            self.restore_state(false);
        }

        if let Some(chunk) = state.chunk.as_deref() {
            if common.options().contains(PluginOptions::USE_CHUNKS) {
                match base64::engine::general_purpose::STANDARD.decode(compact_base64(chunk)) {
                    Ok(data) => {
                        if let Err(err) = self.set_chunk_data(&data) {
                            tracing::warn!("Failed to restore chunk for '{}': {}", common.name(), err);
                        }
                    }
                    Err(err) => tracing::warn!("Invalid chunk data for '{}': {}", common.name(), err),
                }
            }
        }

        let available = self.options_available();
        for bit in 0..10 {
            let option = PluginOptions::from_bits(1 << bit);
            if available.contains(option) {
                self.set_option(option, state.options & option.bits() != 0, true);
            }
        }

        self.set_dry_wet(state.dry_wet, true);
        self.set_volume(state.volume, true);
        self.set_balance_left(state.balance_left, true);
        self.set_balance_right(state.balance_right, true);
        self.set_panning(state.panning, true);
        self.set_ctrl_channel(state.ctrl_channel, true);
        self.set_active(state.active, true);
    }

    /// Write this plugin's state as a standalone preset file.
    fn save_state_to_file(&self, path: &Path) -> Result<()> {
        let body = self.get_state_save(true).dump_xml();
        let content = format!(
            "<?xml version='1.0' encoding='UTF-8'?>\n<!DOCTYPE CARLA-PRESET>\n<CARLA-PRESET VERSION='2.0'>\n{body}</CARLA-PRESET>\n"
        );
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load a preset written by [`Plugin::save_state_to_file`].
    fn load_state_from_file(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let root = XmlNode::parse(&content)
            .map_err(|e| PluginError::StateRestore(e.to_string()))?;
        if !root.is("CARLA-PRESET") {
            return Err(PluginError::StateRestore(
                "Not a valid Carla preset file".into(),
            ));
        }
        let mut state = StateSave::default();
        state.fill_from_xml(&root);
        self.load_state_save(&state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_data::CUSTOM_DATA_TYPE_STRING;
    use crate::parameter::ParameterRanges;
    use approx::assert_relative_eq;
    use cadenza_core::{CallbackEvent, EngineCallback};

    struct Dummy {
        common: PluginCommon,
        values: Mutex<Vec<f32>>,
    }

    impl Dummy {
        fn new(engine: &EngineInit) -> Self {
            let common = PluginCommon::new(
                0,
                PluginInit {
                    plugin_type: PluginType::Internal,
                    name: "Dummy".into(),
                    label: "dummy".into(),
                    ..Default::default()
                },
                engine,
            );
            *common.parameters.write() = vec![Parameter {
                name: "Gain".into(),
                symbol: "gain".into(),
                ranges: ParameterRanges {
                    def: 0.5,
                    ..Default::default()
                },
                data: crate::parameter::ParameterData {
                    kind: ParameterType::Input,
                    hints: ParameterHints::IS_ENABLED | ParameterHints::IS_AUTOMABLE,
                    index: 0,
                    rindex: 0,
                    ..Default::default()
                },
                ..Default::default()
            }];
            common.set_hints(
                PluginHints::CAN_DRYWET | PluginHints::CAN_VOLUME | PluginHints::CAN_BALANCE,
            );
            Self {
                common,
                values: Mutex::new(vec![0.5]),
            }
        }
    }

    impl Plugin for Dummy {
        fn common(&self) -> &PluginCommon {
            &self.common
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Internal
        }

        fn reload(&self) -> Result<()> {
            Ok(())
        }

        fn process(&self, ctx: &mut ProcessContext<'_>) {
            ctx.silence();
        }

        fn parameter_value(&self, index: u32) -> f32 {
            self.values.lock()[index as usize]
        }

        fn set_parameter_value(&self, index: u32, value: f32, _send_gui: bool, send_callback: bool) {
            self.values.lock()[index as usize] = value;
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
    }

    #[test]
    fn test_state_roundtrip_through_trait() {
        let engine = EngineInit::default();
        let source = Dummy::new(&engine);
        source.set_parameter_value(0, 0.8, false, false);
        source.set_custom_data(CUSTOM_DATA_TYPE_STRING, "mode", "hall", false);
        source.set_volume(0.7, false);
        source.set_active(true, false);

        let state = source.get_state_save(true);
        let target = Dummy::new(&engine);
        target.load_state_save(&state);

        assert_relative_eq!(target.parameter_value(0), 0.8);
        assert_eq!(target.common().custom_data_list(), source.common().custom_data_list());
        assert_relative_eq!(target.common().post_proc.volume.get(), 0.7);
        assert!(target.is_active());
    }

    #[test]
    fn test_setters_clamp_and_notify() {
        let events = Arc::new(Mutex::new(Vec::<CallbackEvent>::new()));
        let sink_events = Arc::clone(&events);
        let callback: EngineCallback =
            Arc::new(move |e: &CallbackEvent| sink_events.lock().push(e.clone()));
        let engine = EngineInit {
            callbacks: CallbackSink::new(Some(callback), None),
            ..Default::default()
        };
        let plugin = Dummy::new(&engine);
        plugin.set_dry_wet(3.0, true);
        plugin.set_ctrl_channel(40, true);
        assert_eq!(plugin.common().post_proc.dry_wet.get(), 1.0);
        assert_eq!(plugin.common().ctrl_channel(), 15);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].value1, PARAMETER_DRYWET);
        assert_eq!(events[1].value1, PARAMETER_CTRL_CHANNEL);
    }

    #[test]
    fn test_post_rt_events_reach_callback() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let callback: EngineCallback = Arc::new(move |_: &CallbackEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let engine = EngineInit {
            callbacks: CallbackSink::new(Some(callback), None),
            ..Default::default()
        };
        let plugin = Dummy::new(&engine);
        plugin.set_parameter_value_rt(0, 0.1);
        plugin.common().postpone_rt_event(PostRtEvent::NoteOn {
            channel: 0,
            note: 60,
            velocity: 100,
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
        plugin.post_rt_events_run();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_post_process_volume_and_dry_wet() {
        let plugin = Dummy::new(&EngineInit::default());
        plugin.set_dry_wet(0.5, false);
        plugin.set_volume(0.5, false);

        let inputs = vec![vec![1.0; 8], vec![1.0; 8]];
        let mut wet = vec![vec![0.0; 4], vec![0.0; 4]];
        let mut dest = vec![vec![9.0; 8], vec![9.0; 8]];
        let mut scratch = vec![0.0; 8];
        plugin
            .common()
            .post_process(&inputs, 4, &mut wet, &mut dest, 4, &mut scratch);

        assert_eq!(&dest[0][..4], &[9.0; 4]);
        for sample in &dest[0][4..] {
            assert_relative_eq!(*sample, 0.25);
        }
    }

    #[test]
    fn test_guard_native_catches_panic() {
        assert_eq!(guard_native("ok", || 3), Some(3));
        assert_eq!(guard_native("boom", || -> i32 { panic!("bad plugin") }), None);
    }
}
