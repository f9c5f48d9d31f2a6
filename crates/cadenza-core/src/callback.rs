//! Host notification callbacks.
//!
//! The engine reports every discrete event through one callback; there is no
//! polling API. Plugins get a [`CallbackSink`] so they can report parameter and
//! UI changes without holding a reference to the engine.

use std::sync::Arc;

/// Opcode of an engine notification. Values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EngineCallbackOpcode {
    Debug = 0,
    PluginAdded = 1,
    PluginRemoved = 2,
    PluginRenamed = 3,
    PluginUnavailable = 4,
    ParameterValueChanged = 5,
    ParameterDefaultChanged = 6,
    ParameterMidiCcChanged = 7,
    ParameterMidiChannelChanged = 8,
    ProgramChanged = 9,
    MidiProgramChanged = 10,
    OptionChanged = 11,
    UiStateChanged = 12,
    NoteOn = 13,
    NoteOff = 14,
    Update = 15,
    ReloadInfo = 16,
    ReloadParameters = 17,
    ReloadPrograms = 18,
    ReloadAll = 19,
    PatchbayClientAdded = 20,
    PatchbayClientRemoved = 21,
    PatchbayClientRenamed = 22,
    PatchbayClientDataChanged = 23,
    PatchbayPortAdded = 24,
    PatchbayPortRemoved = 25,
    PatchbayPortChanged = 26,
    PatchbayConnectionAdded = 27,
    PatchbayConnectionRemoved = 28,
    EngineStarted = 29,
    EngineStopped = 30,
    ProcessModeChanged = 31,
    TransportModeChanged = 32,
    BufferSizeChanged = 33,
    SampleRateChanged = 34,
    CancelableAction = 35,
    ProjectLoadFinished = 36,
    Idle = 38,
    Info = 39,
    Error = 40,
    Quit = 41,
}

impl EngineCallbackOpcode {
    pub fn value(self) -> u32 {
        self as u32
    }
}

/// One notification delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub opcode: EngineCallbackOpcode,
    pub plugin_id: u32,
    pub value1: i32,
    pub value2: i32,
    pub value3: i32,
    pub valuef: f32,
    pub value_str: Option<String>,
}

impl CallbackEvent {
    pub fn new(opcode: EngineCallbackOpcode, plugin_id: u32) -> Self {
        Self {
            opcode,
            plugin_id,
            value1: 0,
            value2: 0,
            value3: 0,
            valuef: 0.0,
            value_str: None,
        }
    }

    pub fn values(mut self, value1: i32, value2: i32, value3: i32) -> Self {
        self.value1 = value1;
        self.value2 = value2;
        self.value3 = value3;
        self
    }

    pub fn float(mut self, valuef: f32) -> Self {
        self.valuef = valuef;
        self
    }

    pub fn text(mut self, value_str: impl Into<String>) -> Self {
        self.value_str = Some(value_str.into());
        self
    }
}

/// Host notification function.
pub type EngineCallback = Arc<dyn Fn(&CallbackEvent) + Send + Sync>;

/// Request kind for the file callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCallbackOpcode {
    Debug,
    Open,
    Save,
}

/// Host-supplied file dialog: `(opcode, is_dir, title, filter) -> chosen path`.
pub type FileCallback =
    Arc<dyn Fn(FileCallbackOpcode, bool, &str, &str) -> Option<String> + Send + Sync>;

/// Cloneable handle used to emit notifications.
///
/// A sink without a callback silently discards events.
#[derive(Clone, Default)]
pub struct CallbackSink {
    callback: Option<EngineCallback>,
    file_callback: Option<FileCallback>,
}

impl CallbackSink {
    pub fn new(callback: Option<EngineCallback>, file_callback: Option<FileCallback>) -> Self {
        Self {
            callback,
            file_callback,
        }
    }

    pub fn emit(&self, event: CallbackEvent) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }

    /// Shorthand for the common seven-field form.
    #[allow(clippy::too_many_arguments)]
    pub fn call(
        &self,
        opcode: EngineCallbackOpcode,
        plugin_id: u32,
        value1: i32,
        value2: i32,
        value3: i32,
        valuef: f32,
        value_str: Option<&str>,
    ) {
        if self.callback.is_none() {
            return;
        }
        let mut event = CallbackEvent::new(opcode, plugin_id)
            .values(value1, value2, value3)
            .float(valuef);
        event.value_str = value_str.map(str::to_string);
        self.emit(event);
    }

    /// Ask the host for a file; `None` if there is no file callback or the user canceled.
    pub fn run_file_callback(
        &self,
        opcode: FileCallbackOpcode,
        is_dir: bool,
        title: &str,
        filter: &str,
    ) -> Option<String> {
        self.file_callback
            .as_ref()
            .and_then(|callback| callback(opcode, is_dir, title, filter))
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink")
            .field("callback", &self.callback.is_some())
            .field("file_callback", &self.file_callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_opcode_values_are_stable() {
        assert_eq!(EngineCallbackOpcode::PluginAdded.value(), 1);
        assert_eq!(EngineCallbackOpcode::UiStateChanged.value(), 12);
        assert_eq!(EngineCallbackOpcode::ProjectLoadFinished.value(), 36);
        assert_eq!(EngineCallbackOpcode::Idle.value(), 38);
    }

    #[test]
    fn test_sink_delivers_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let sink = CallbackSink::new(
            Some(Arc::new(move |event: &CallbackEvent| {
                seen_cb.lock().push(event.clone());
            })),
            None,
        );

        sink.call(
            EngineCallbackOpcode::PluginRenamed,
            3,
            0,
            0,
            0,
            0.0,
            Some("Reverb (2)"),
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].plugin_id, 3);
        assert_eq!(seen[0].value_str.as_deref(), Some("Reverb (2)"));
    }

    #[test]
    fn test_empty_sink_is_silent() {
        let sink = CallbackSink::default();
        sink.call(EngineCallbackOpcode::Idle, 0, 0, 0, 0, 0.0, None);
        assert!(sink
            .run_file_callback(FileCallbackOpcode::Open, false, "t", "*")
            .is_none());
    }
}
