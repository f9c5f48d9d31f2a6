//! The engine: plugin registry, lifecycle and host notifications.
//!
//! Every fallible call returns a [`Result`] and also records the message of
//! its last failure, readable through [`Engine::last_error`].

use crate::action::{ActionSlot, PendingAction, RunnerGate};
use crate::deletion::DeletionQueue;
use crate::driver::{DummyDriver, Driver};
use crate::factory::{choose_instantiation, PluginFactory};
use crate::graph::{GroupId, GroupPosition, PatchbayConnection, PatchbayGraph, Routing};
use crate::names::unique_plugin_name;
use crate::process::ProcessScratch;
use crate::registry::Registry;
use arc_swap::ArcSwap;
use cadenza_core::options::MAX_PATCHBAY_PLUGINS;
use cadenza_core::{
    AtomicDouble, AtomicFloat, CallbackEvent, CallbackSink, EngineCallback,
    EngineCallbackOpcode, EngineOption, EngineOptions, Error, FileCallback, InternalTransport,
    PluginType, ProcessMode, Result, TimeInfo,
};
use cadenza_plugin::{guard_native, EngineInit, Plugin, PluginHints, PluginInit, ProjectFolder};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Capture and playback channels the engine exchanges with its driver.
pub const ENGINE_AUDIO_CHANNELS: usize = 2;

/// A freshly created plugin, either already swapped in or waiting to be registered.
pub(crate) enum Created {
    Replaced(u32),
    New(Arc<dyn Plugin>),
}

pub struct Engine {
    pub(crate) options: ArcSwap<EngineOptions>,
    pub(crate) factory: PluginFactory,
    pub(crate) callbacks: CallbackSink,
    pub(crate) project_folder: ProjectFolder,

    pub(crate) registry: Registry,
    pub(crate) action: ActionSlot,
    pub(crate) runner: RunnerGate,
    pub(crate) deletions: DeletionQueue,

    pub(crate) graph: Mutex<PatchbayGraph>,
    pub(crate) external_graph: Mutex<PatchbayGraph>,
    pub(crate) routing: ArcSwap<Routing>,

    pub(crate) transport: Mutex<InternalTransport>,
    pub(crate) scratch: Mutex<ProcessScratch>,
    pub(crate) buffer_size: AtomicU32,
    pub(crate) sample_rate: AtomicDouble,
    pub(crate) dsp_load: AtomicFloat,
    pub(crate) xruns: AtomicU32,

    offline: AtomicBool,
    running: AtomicBool,
    about_to_close: AtomicBool,
    pub(crate) loading_project: AtomicBool,
    action_canceled: AtomicBool,
    last_error: Mutex<String>,

    drivers: Mutex<Vec<Box<dyn Driver>>>,
    active_driver: Mutex<Option<usize>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("process_mode", &self.options.load().process_mode)
            .field("plugins", &self.registry.count())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder for an [`Engine`].
///
/// ```ignore
/// let engine = Engine::builder()
///     .options(options)
///     .factory(factory)
///     .callback(Arc::new(|event: &CallbackEvent| println!("{:?}", event.opcode)))
///     .build();
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    options: EngineOptions,
    factory: PluginFactory,
    callback: Option<EngineCallback>,
    file_callback: Option<FileCallback>,
    drivers: Vec<Box<dyn Driver>>,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn factory(mut self, factory: PluginFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn callback(mut self, callback: EngineCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn file_callback(mut self, callback: FileCallback) -> Self {
        self.file_callback = Some(callback);
        self
    }

    /// Add a driver next to the built-in dummy driver.
    pub fn driver(mut self, driver: Box<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let buffer_size = self.options.audio_buffer_size;
        let sample_rate = f64::from(self.options.audio_sample_rate);

        let mut drivers: Vec<Box<dyn Driver>> = vec![Box::new(DummyDriver::new())];
        drivers.extend(self.drivers);

        Arc::new(Engine {
            options: ArcSwap::from_pointee(self.options),
            factory: self.factory,
            callbacks: CallbackSink::new(self.callback, self.file_callback),
            project_folder: ProjectFolder::default(),
            registry: Registry::new(MAX_PATCHBAY_PLUGINS),
            action: ActionSlot::default(),
            runner: RunnerGate::default(),
            deletions: DeletionQueue::default(),
            graph: Mutex::new(PatchbayGraph::internal(
                ENGINE_AUDIO_CHANNELS as u32,
                ENGINE_AUDIO_CHANNELS as u32,
            )),
            external_graph: Mutex::new(PatchbayGraph::external(
                ENGINE_AUDIO_CHANNELS as u32,
                ENGINE_AUDIO_CHANNELS as u32,
            )),
            routing: ArcSwap::from_pointee(Routing::default()),
            transport: Mutex::new(InternalTransport::new(sample_rate)),
            scratch: Mutex::new(ProcessScratch::new(buffer_size as usize)),
            buffer_size: AtomicU32::new(buffer_size),
            sample_rate: AtomicDouble::new(sample_rate),
            dsp_load: AtomicFloat::new(0.0),
            xruns: AtomicU32::new(0),
            offline: AtomicBool::new(false),
            running: AtomicBool::new(false),
            about_to_close: AtomicBool::new(false),
            loading_project: AtomicBool::new(false),
            action_canceled: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
            drivers: Mutex::new(drivers),
            active_driver: Mutex::new(None),
        })
    }
}

impl Engine {
    pub fn new(options: EngineOptions, factory: PluginFactory) -> Arc<Self> {
        Self::builder().options(options).factory(factory).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    // ------------------------------------------------------------------
    // Errors and notifications

    /// Message of the last failed call.
    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    pub fn set_last_error(&self, error: &str) {
        *self.last_error.lock() = error.to_string();
    }

    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            tracing::debug!("Engine call failed: {}", error);
            self.set_last_error(&error.to_string());
        }
        result
    }

    pub(crate) fn callback(&self, event: CallbackEvent) {
        self.callbacks.emit(event);
    }

    pub fn callbacks(&self) -> &CallbackSink {
        &self.callbacks
    }

    pub fn factory(&self) -> &PluginFactory {
        &self.factory
    }

    // ------------------------------------------------------------------
    // Options and state

    pub fn options(&self) -> Arc<EngineOptions> {
        self.options.load_full()
    }

    pub fn set_option(&self, option: EngineOption, value: i32, value_str: Option<&str>) -> Result<()> {
        let mut options = EngineOptions::clone(&self.options.load());
        let result = options.set_option(option, value, value_str, self.is_running());
        if result.is_ok() {
            self.options.store(Arc::new(options));
        }
        self.record(result)
    }

    pub fn process_mode(&self) -> ProcessMode {
        self.options.load().process_mode
    }

    pub fn max_plugin_number(&self) -> u32 {
        self.process_mode()
            .max_plugin_number()
            .min(self.registry.capacity())
    }

    pub fn current_plugin_count(&self) -> u32 {
        self.registry.count()
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub fn is_loading_project(&self) -> bool {
        self.loading_project.load(Ordering::Acquire)
    }

    pub fn is_about_to_close(&self) -> bool {
        self.about_to_close.load(Ordering::Acquire)
    }

    pub fn was_action_canceled(&self) -> bool {
        self.action_canceled.load(Ordering::Acquire)
    }

    /// Ask a running project load to stop at its next checkpoint.
    pub fn set_action_canceled(&self, canceled: bool) {
        self.action_canceled.store(canceled, Ordering::Release);
    }

    /// Load of the last processed block, 1.0 being the whole block duration.
    pub fn dsp_load(&self) -> f32 {
        self.dsp_load.get()
    }

    pub fn xrun_count(&self) -> u32 {
        self.xruns.load(Ordering::Acquire)
    }

    pub fn clear_xruns(&self) {
        self.xruns.store(0, Ordering::Release);
    }

    pub fn project_folder(&self) -> &ProjectFolder {
        &self.project_folder
    }

    /// What a plugin created now receives from the engine.
    pub fn engine_init(&self) -> EngineInit {
        EngineInit {
            sample_rate: self.sample_rate(),
            buffer_size: self.buffer_size(),
            options: self.options.load_full(),
            callbacks: self.callbacks.clone(),
            project_folder: self.project_folder.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Drivers

    pub fn add_driver(&self, driver: Box<dyn Driver>) {
        self.drivers.lock().push(driver);
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.drivers
            .lock()
            .iter()
            .map(|driver| driver.name().to_string())
            .collect()
    }

    pub fn driver_device_names(&self, index: usize) -> Vec<String> {
        self.drivers
            .lock()
            .get(index)
            .map(|driver| driver.device_names())
            .unwrap_or_default()
    }

    /// Start processing with the driver called `driver_name`.
    pub fn init(self: &Arc<Self>, driver_name: &str) -> Result<()> {
        let result = self.init_internal(driver_name);
        self.record(result)
    }

    fn init_internal(self: &Arc<Self>, driver_name: &str) -> Result<()> {
        if self.is_running() {
            return Err(Error::Plugin("Engine is already running".to_string()));
        }
        let options = self.options.load_full();
        options.validate()?;

        let mut drivers = self.drivers.lock();
        let index = drivers
            .iter()
            .position(|driver| driver.name() == driver_name)
            .ok_or_else(|| {
                Error::Plugin("The requested audio driver is not available".to_string())
            })?;

        self.about_to_close.store(false, Ordering::Release);
        self.action_canceled.store(false, Ordering::Release);

        let buffer_size = options.audio_buffer_size;
        let sample_rate = f64::from(options.audio_sample_rate);
        self.buffer_size.store(buffer_size, Ordering::Release);
        self.sample_rate.set(sample_rate);
        self.transport.lock().set_sample_rate(sample_rate);
        self.scratch.lock().resize(buffer_size as usize);

        drivers[index].start(Arc::downgrade(self), buffer_size, sample_rate)?;
        drop(drivers);

        *self.active_driver.lock() = Some(index);
        self.running.store(true, Ordering::Release);

        tracing::info!("Engine started with driver '{}'", driver_name);
        self.callback(
            CallbackEvent::new(EngineCallbackOpcode::EngineStarted, 0)
                .values(
                    options.process_mode as i32,
                    options.transport_mode as i32,
                    buffer_size as i32,
                )
                .float(sample_rate as f32)
                .text(driver_name),
        );
        Ok(())
    }

    /// Remove every plugin and stop the driver.
    pub fn close(&self) -> Result<()> {
        let result = self.close_internal();
        self.record(result)
    }

    fn close_internal(&self) -> Result<()> {
        if self.registry.count() != 0 {
            self.about_to_close.store(true, Ordering::Release);
            self.remove_all_plugins()?;
        }

        let index = self.active_driver.lock().take();
        if let Some(index) = index {
            if let Some(driver) = self.drivers.lock().get_mut(index) {
                driver.stop()?;
            }
        }
        self.running.store(false, Ordering::Release);
        self.deletions.drain();

        tracing::info!("Engine stopped");
        self.callback(CallbackEvent::new(EngineCallbackOpcode::EngineStopped, 0));
        Ok(())
    }

    /// Structural actions wait for the audio thread only while a driver runs.
    fn waits_for_runner(&self) -> bool {
        self.is_running()
    }

    pub(crate) fn post_action(&self, action: PendingAction) {
        self.action.post(action, self.waits_for_runner(), |action| {
            self.registry.apply(action)
        });
    }

    // ------------------------------------------------------------------
    // Plugin access

    pub fn get_plugin(&self, id: u32) -> Result<Arc<dyn Plugin>> {
        let count = self.registry.count();
        let result = if id < count {
            self.registry
                .plugin(id)
                .ok_or(Error::InvalidPluginId { id, count })
        } else {
            Err(Error::InvalidPluginId { id, count })
        };
        self.record(result)
    }

    /// Plugin in slot `id` without checking the current count.
    pub fn get_plugin_unchecked(&self, id: u32) -> Option<Arc<dyn Plugin>> {
        self.registry.plugin(id)
    }

    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.registry.plugins()
    }

    /// Input left/right and output left/right peaks of the last block.
    pub fn get_plugin_peaks(&self, id: u32) -> [f32; 4] {
        if id >= self.registry.count() {
            return [0.0; 4];
        }
        self.registry
            .with_slot(id, |slot| slot.peaks.snapshot())
            .unwrap_or([0.0; 4])
    }

    /// Plugins removed from the registry and not yet deleted by `idle()`.
    pub fn pending_deletion_count(&self) -> usize {
        self.deletions.len()
    }

    pub fn is_pending_deletion(&self, plugin: &Arc<dyn Plugin>) -> bool {
        self.deletions.contains(plugin)
    }

    pub fn get_unique_plugin_name(&self, name: &str) -> String {
        self.unique_name(name, None)
    }

    fn unique_name(&self, name: &str, skip: Option<u32>) -> String {
        let existing: Vec<String> = self
            .registry
            .plugins()
            .iter()
            .enumerate()
            .filter(|(id, _)| Some(*id as u32) != skip)
            .map(|(_, plugin)| plugin.name())
            .collect();
        unique_plugin_name(name, &existing)
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Create a plugin and append it, or swap it into the slot marked by
    /// [`replace_plugin`](Self::replace_plugin). Returns its id.
    pub fn add_plugin(&self, init: PluginInit) -> Result<u32> {
        let result = self.create_plugin(init).and_then(|created| match created {
            Created::Replaced(id) => Ok(id),
            Created::New(plugin) => self.register_plugin(plugin, true),
        });
        self.record(result)
    }

    pub(crate) fn create_plugin(&self, mut init: PluginInit) -> Result<Created> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        if init.binary_type == cadenza_core::BinaryType::None {
            return Err(Error::Plugin("Invalid plugin binary mode".to_string()));
        }
        if init.plugin_type == PluginType::None {
            return Err(Error::Plugin("Invalid plugin type".to_string()));
        }
        if init.filename.is_empty() && init.label.is_empty() {
            return Err(Error::Plugin("Invalid plugin filename and label".to_string()));
        }

        let count = self.registry.count();
        let replace = self.registry.replace_target().filter(|&id| id < count);
        let id = match replace {
            Some(id) => {
                self.registry.set_replace_target(None);
                id
            }
            None => {
                if count >= self.max_plugin_number() {
                    return Err(Error::MaxPluginsReached);
                }
                count
            }
        };

        if !init.name.is_empty() {
            init.name = self.unique_name(&init.name, replace);
        }

        let options = self.options.load_full();
        let how = choose_instantiation(&init, &options)?;
        tracing::debug!(
            "Creating {} plugin '{}' ({:?})",
            init.plugin_type,
            if init.label.is_empty() { &init.filename } else { &init.label },
            how
        );
        let plugin = self.factory.create(&how, id, init, &self.engine_init())?;

        plugin
            .reload()
            .map_err(|e| Error::Plugin(e.to_string()))?;

        let unique = self.unique_name(&plugin.name(), replace);
        if unique != plugin.name() {
            plugin.common().set_name(&unique);
        }

        self.check_process_mode_ports(&*plugin, options.process_mode)?;

        match replace {
            Some(id) => {
                self.swap_plugin(id, plugin);
                Ok(Created::Replaced(id))
            }
            None => Ok(Created::New(plugin)),
        }
    }

    fn check_process_mode_ports(&self, plugin: &dyn Plugin, mode: ProcessMode) -> Result<()> {
        let ports = plugin.common().ports.read();
        let has_cv = !ports.cv_in.is_empty() || !ports.cv_out.is_empty();
        match mode {
            ProcessMode::ContinuousRack if has_cv => Err(Error::Plugin(
                "Rack mode cannot work with plugins that have CV ports, sorry!".to_string(),
            )),
            ProcessMode::Patchbay if ports.event_in.len() > 1 || ports.event_out.len() > 1 => {
                Err(Error::Plugin(
                    "Patchbay mode cannot work with plugins that have multiple MIDI ports, sorry!"
                        .to_string(),
                ))
            }
            ProcessMode::Patchbay if has_cv => Err(Error::Plugin(
                "CV ports in patchbay mode is still TODO".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Replace slot `id` with `plugin`, carrying over activity and mix levels.
    fn swap_plugin(&self, id: u32, plugin: Arc<dyn Plugin>) {
        let _stopper = self.runner.stop();

        if let Some(old) = self.registry.plugin(id) {
            let hints = plugin.hints();
            if hints.contains(PluginHints::CAN_DRYWET) {
                plugin.set_dry_wet(old.common().post_proc.dry_wet.get(), false);
            }
            if hints.contains(PluginHints::CAN_VOLUME) {
                plugin.set_volume(old.common().post_proc.volume.get(), false);
            }
            plugin.set_active(old.is_active(), false);
        }
        plugin.common().set_id(id);
        plugin.common().set_enabled(true);

        let name = plugin.name();
        let ports = plugin.common().ports.read().clone();
        let dropped = self.graph.lock().replace_plugin(id, &name, &ports);
        self.refresh_routing();
        for connection in dropped {
            self.connection_removed(&connection);
        }

        if let Some(old) = self.registry.replace(id, plugin) {
            tracing::info!("Replaced plugin '{}' with '{}'", old.plugin.name(), name);
            self.deletions.push(old);
        }
        self.callback(CallbackEvent::new(EngineCallbackOpcode::ReloadAll, id));
    }

    /// Append a created plugin to the registry and the patchbay.
    pub(crate) fn register_plugin(&self, plugin: Arc<dyn Plugin>, activate: bool) -> Result<u32> {
        plugin.common().set_enabled(true);
        let name = plugin.name();
        let ports = plugin.common().ports.read().clone();

        let id = self
            .registry
            .append(Arc::clone(&plugin))
            .ok_or(Error::MaxPluginsReached)?;
        plugin.common().set_id(id);

        tracing::info!("Added plugin '{}' as #{}", name, id);
        self.callback(CallbackEvent::new(EngineCallbackOpcode::PluginAdded, id).text(name.as_str()));

        if activate {
            plugin.set_active(true, false);
        }

        self.graph.lock().add_plugin(&name, &ports);
        self.refresh_routing();
        Ok(id)
    }

    pub fn remove_plugin(&self, id: u32) -> Result<()> {
        let result = self.remove_plugin_internal(id);
        self.record(result)
    }

    fn remove_plugin_internal(&self, id: u32) -> Result<()> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        let count = self.registry.count();
        if id >= count {
            return Err(Error::InvalidPluginId { id, count });
        }
        let slot = self
            .registry
            .slot(id)
            .ok_or(Error::InvalidPluginId { id, count })?;

        let _stopper = self.runner.stop();

        let removed = self.graph.lock().remove_plugin(id);
        self.refresh_routing();
        for connection in removed {
            self.connection_removed(&connection);
        }

        self.post_action(PendingAction::remove_plugin(id));

        tracing::info!("Removed plugin '{}' (#{})", slot.plugin.name(), id);
        self.deletions.push(slot);
        self.callback(CallbackEvent::new(EngineCallbackOpcode::PluginRemoved, id));
        Ok(())
    }

    /// Remove every plugin, last one first.
    pub fn remove_all_plugins(&self) -> Result<()> {
        let result = self.remove_all_plugins_internal();
        self.record(result)
    }

    fn remove_all_plugins_internal(&self) -> Result<()> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        let count = self.registry.count();
        if count == 0 {
            return Ok(());
        }

        let _stopper = self.runner.stop();

        self.graph.lock().remove_all_plugins();
        self.refresh_routing();

        self.post_action(PendingAction::zero_count());
        self.registry.set_replace_target(None);
        self.callback(CallbackEvent::new(EngineCallbackOpcode::Idle, 0));

        for slot in self.registry.take_all(count) {
            let id = slot.plugin.id();
            self.deletions.push(slot);
            self.callback(CallbackEvent::new(EngineCallbackOpcode::PluginRemoved, id));
            self.callback(CallbackEvent::new(EngineCallbackOpcode::Idle, 0));
        }
        tracing::info!("Removed all {} plugins", count);
        Ok(())
    }

    /// Rename plugin `id`, returning the name it actually got.
    pub fn rename_plugin(&self, id: u32, new_name: &str) -> Result<String> {
        let result = self.rename_plugin_internal(id, new_name);
        self.record(result)
    }

    fn rename_plugin_internal(&self, id: u32, new_name: &str) -> Result<String> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        if new_name.is_empty() {
            return Err(Error::Plugin("Invalid plugin name".to_string()));
        }
        let count = self.registry.count();
        let plugin = match self.registry.plugin(id) {
            Some(plugin) if id < count => plugin,
            _ => return Err(Error::InvalidPluginId { id, count }),
        };

        let name = self.unique_name(new_name, Some(id));
        plugin.common().set_name(&name);
        self.graph.lock().rename_plugin(id, &name);
        self.callback(CallbackEvent::new(EngineCallbackOpcode::PluginRenamed, id).text(name.as_str()));
        Ok(name)
    }

    /// Add a copy of plugin `id` with its full state. Returns the new id.
    pub fn clone_plugin(&self, id: u32) -> Result<u32> {
        let result = self.clone_plugin_internal(id);
        self.record(result)
    }

    fn clone_plugin_internal(&self, id: u32) -> Result<u32> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        let count = self.registry.count();
        let source = match self.registry.plugin(id) {
            Some(plugin) if id < count => plugin,
            _ => return Err(Error::InvalidPluginId { id, count }),
        };

        let mut init = source.common().init().clone();
        init.name = source.name();
        init.options = Some(source.options());

        let new_id = match self.create_plugin(init)? {
            Created::Replaced(new_id) => new_id,
            Created::New(plugin) => self.register_plugin(plugin, true)?,
        };
        let clone = self
            .registry
            .plugin(new_id)
            .ok_or_else(|| Error::Plugin("No new plugin found".to_string()))?;
        clone.load_state_save(&source.get_state_save(true));
        Ok(new_id)
    }

    /// Mark slot `id` to be replaced by the next added plugin.
    ///
    /// Passing [`max_plugin_number`](Self::max_plugin_number) clears the mark.
    pub fn replace_plugin(&self, id: u32) -> Result<()> {
        let result = self.replace_plugin_internal(id);
        self.record(result)
    }

    fn replace_plugin_internal(&self, id: u32) -> Result<()> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        if id == self.max_plugin_number() {
            self.registry.set_replace_target(None);
            return Ok(());
        }
        let count = self.registry.count();
        if id >= count {
            return Err(Error::InvalidPluginId { id, count });
        }
        self.registry.set_replace_target(Some(id));
        Ok(())
    }

    pub fn switch_plugins(&self, id_a: u32, id_b: u32) -> Result<()> {
        let result = self.switch_plugins_internal(id_a, id_b);
        self.record(result)
    }

    fn switch_plugins_internal(&self, id_a: u32, id_b: u32) -> Result<()> {
        if self.action.is_pending() {
            return Err(Error::OperationPending);
        }
        let count = self.registry.count();
        if count < 2 {
            return Err(Error::Plugin("Invalid plugin number".to_string()));
        }
        if id_a == id_b {
            return Err(Error::Plugin(
                "Invalid operation, cannot switch plugin with itself".to_string(),
            ));
        }
        for id in [id_a, id_b] {
            if id >= count {
                return Err(Error::InvalidPluginId { id, count });
            }
        }

        let _stopper = self.runner.stop();
        self.graph.lock().switch_plugins(id_a, id_b);
        self.refresh_routing();
        self.post_action(PendingAction::switch_plugins(id_a, id_b));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Non-realtime pumping

    /// Delete queued plugins and run every enabled plugin's idle work.
    pub fn idle(&self) {
        let deleted = self.deletions.drain();
        if deleted > 0 {
            tracing::debug!("Deleted {} plugins", deleted);
        }

        for plugin in self.registry.plugins() {
            if !plugin.is_enabled() {
                continue;
            }
            guard_native("post_rt_events_run", || plugin.post_rt_events_run());
            guard_native("idle", || plugin.idle());
            if plugin.hints().contains(PluginHints::HAS_CUSTOM_UI) {
                guard_native("ui_idle", || plugin.ui_idle());
            }
        }
    }

    // ------------------------------------------------------------------
    // Driver notifications

    pub fn buffer_size_changed(&self, buffer_size: u32) {
        tracing::debug!("Buffer size changed to {}", buffer_size);
        self.buffer_size.store(buffer_size, Ordering::Release);
        self.scratch.lock().resize(buffer_size as usize);

        for plugin in self.registry.plugins() {
            if !plugin.is_enabled() {
                continue;
            }
            match plugin.common().master_lock.try_lock() {
                Some(_guard) => plugin.buffer_size_changed(buffer_size),
                None => tracing::debug!("Skipping buffer size change for busy '{}'", plugin.name()),
            }
        }
        self.callback(
            CallbackEvent::new(EngineCallbackOpcode::BufferSizeChanged, 0)
                .values(buffer_size as i32, 0, 0),
        );
    }

    pub fn sample_rate_changed(&self, sample_rate: f64) {
        tracing::debug!("Sample rate changed to {}", sample_rate);
        self.sample_rate.set(sample_rate);
        self.transport.lock().set_sample_rate(sample_rate);

        for plugin in self.registry.plugins() {
            if !plugin.is_enabled() {
                continue;
            }
            match plugin.common().master_lock.try_lock() {
                Some(_guard) => plugin.sample_rate_changed(sample_rate),
                None => tracing::debug!("Skipping sample rate change for busy '{}'", plugin.name()),
            }
        }
        self.callback(
            CallbackEvent::new(EngineCallbackOpcode::SampleRateChanged, 0).float(sample_rate as f32),
        );
    }

    pub fn offline_mode_changed(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
        for plugin in self.registry.plugins() {
            if plugin.is_enabled() {
                plugin.offline_mode_changed(offline);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport

    pub fn set_bpm(&self, bpm: f64) {
        self.transport.lock().set_bpm(bpm);
    }

    pub fn bpm(&self) -> f64 {
        self.transport.lock().bpm()
    }

    pub fn time_info(&self) -> TimeInfo {
        self.transport.lock().time_info()
    }

    pub fn transport_play(&self) {
        self.transport.lock().play();
    }

    pub fn transport_pause(&self) {
        self.transport.lock().pause();
    }

    pub fn transport_relocate(&self, frame: u64) {
        self.transport.lock().relocate(frame);
    }

    // ------------------------------------------------------------------
    // Patchbay

    fn graph_for(&self, external: bool) -> &Mutex<PatchbayGraph> {
        if external || self.process_mode() != ProcessMode::Patchbay {
            &self.external_graph
        } else {
            &self.graph
        }
    }

    pub(crate) fn refresh_routing(&self) {
        let routing = self.graph.lock().routing();
        self.routing.store(Arc::new(routing));
    }

    fn connection_added(&self, connection: &PatchbayConnection) {
        self.callback(
            CallbackEvent::new(EngineCallbackOpcode::PatchbayConnectionAdded, connection.id)
                .text(connection.describe()),
        );
    }

    fn connection_removed(&self, connection: &PatchbayConnection) {
        self.callback(CallbackEvent::new(
            EngineCallbackOpcode::PatchbayConnectionRemoved,
            connection.id,
        ));
    }

    /// Connect two ports by group and port id. Returns the connection id.
    pub fn patchbay_connect(
        &self,
        external: bool,
        group_a: GroupId,
        port_a: u32,
        group_b: GroupId,
        port_b: u32,
    ) -> Result<u32> {
        let result = self
            .graph_for(external)
            .lock()
            .connect(group_a, port_a, group_b, port_b);
        let connection = self.record(result)?;
        self.refresh_routing();
        self.connection_added(&connection);
        Ok(connection.id)
    }

    pub fn patchbay_disconnect(&self, external: bool, connection_id: u32) -> Result<()> {
        let result = self.graph_for(external).lock().disconnect(connection_id);
        let connection = self.record(result)?;
        self.refresh_routing();
        self.connection_removed(&connection);
        Ok(())
    }

    /// Connect two ports given as `<group>:<port>`, as stored in projects.
    pub fn restore_patchbay_connection(&self, external: bool, source: &str, target: &str) -> Result<()> {
        let result = self
            .graph_for(external)
            .lock()
            .connect_by_name(source, target);
        let connection = self.record(result)?;
        self.refresh_routing();
        self.connection_added(&connection);
        Ok(())
    }

    /// Current connections as `(source, target)` full port names.
    pub fn patchbay_connections(&self, external: bool) -> Vec<(String, String)> {
        self.graph_for(external).lock().connection_names()
    }

    pub fn patchbay_set_group_pos(
        &self,
        external: bool,
        group: GroupId,
        position: GroupPosition,
    ) -> Result<()> {
        let result = self.graph_for(external).lock().set_group_pos(group, position);
        self.record(result)
    }

    /// Snapshot of the internal or external graph.
    pub fn patchbay_graph(&self, external: bool) -> PatchbayGraph {
        self.graph_for(external).lock().clone()
    }
}
