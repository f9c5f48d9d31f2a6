//! Mock plugins and engine helpers shared by the engine tests.
#![allow(dead_code)]

use cadenza_core::{
    BinaryType, CallbackEvent, EngineCallback, EngineCallbackOpcode, EngineOptions, PluginType,
    ProcessMode,
};
use cadenza_engine::{Engine, PluginFactory};
use cadenza_plugin::{
    EngineInit, Plugin, PluginCommon, PluginHints, PluginInit, PluginPorts, ProcessContext,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const FRAMES: u32 = 64;

/// What a [`MockPlugin`] does, picked from its label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockKind {
    /// Stereo, `out = in * 0.5`.
    Gain,
    /// No audio input; writes 0.25 on both outputs and forwards its events.
    Synth,
    /// Event input and output only; forwards every event.
    MidiThru,
    Cv,
    DualMidi,
}

impl MockKind {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "gain" => Some(MockKind::Gain),
            "synth" => Some(MockKind::Synth),
            "midi-thru" => Some(MockKind::MidiThru),
            "cv" => Some(MockKind::Cv),
            "dual-midi" => Some(MockKind::DualMidi),
            _ => None,
        }
    }
}

pub struct MockPlugin {
    common: PluginCommon,
    kind: MockKind,
    pub process_calls: AtomicUsize,
}

impl Plugin for MockPlugin {
    fn common(&self) -> &PluginCommon {
        &self.common
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::Internal
    }

    fn reload(&self) -> cadenza_plugin::Result<()> {
        let stereo_in = vec!["in_1".to_string(), "in_2".to_string()];
        let stereo_out = vec!["out_1".to_string(), "out_2".to_string()];
        let ports = match self.kind {
            MockKind::Gain => PluginPorts {
                audio_in: stereo_in,
                audio_out: stereo_out,
                ..Default::default()
            },
            MockKind::Synth => PluginPorts {
                audio_out: stereo_out,
                event_in: vec!["events-in".to_string()],
                event_out: vec!["events-out".to_string()],
                ..Default::default()
            },
            MockKind::MidiThru => PluginPorts {
                event_in: vec!["events-in".to_string()],
                event_out: vec!["events-out".to_string()],
                ..Default::default()
            },
            MockKind::Cv => PluginPorts {
                audio_in: stereo_in,
                audio_out: stereo_out,
                cv_in: vec!["cv_in".to_string()],
                ..Default::default()
            },
            MockKind::DualMidi => PluginPorts {
                event_in: vec!["events-in".to_string(), "events-in-2".to_string()],
                ..Default::default()
            },
        };
        *self.common.ports.write() = ports;

        let mut hints = PluginHints::CAN_DRYWET | PluginHints::CAN_VOLUME;
        if self.kind == MockKind::Synth {
            hints.insert(PluginHints::IS_SYNTH);
        }
        self.common.set_hints(hints);
        Ok(())
    }

    fn process(&self, ctx: &mut ProcessContext<'_>) {
        self.process_calls.fetch_add(1, Ordering::Relaxed);
        let frames = ctx.frames as usize;
        if !self.common.is_active() {
            ctx.silence();
            return;
        }
        match self.kind {
            MockKind::Gain | MockKind::Cv => {
                for (input, output) in ctx.audio_in.iter().zip(ctx.audio_out.iter_mut()) {
                    for (o, i) in output[..frames].iter_mut().zip(&input[..frames]) {
                        *o = i * 0.5;
                    }
                }
            }
            MockKind::Synth => {
                for output in ctx.audio_out.iter_mut() {
                    output[..frames].fill(0.25);
                }
            }
            MockKind::MidiThru | MockKind::DualMidi => {}
        }
        for event in ctx.events_in {
            ctx.events_out.push(event.clone());
        }
    }
}

pub fn mock_factory() -> PluginFactory {
    let factory = PluginFactory::new();
    factory.register(PluginType::Internal, |id, init, engine: &EngineInit| {
        let kind = MockKind::from_label(&init.label).ok_or_else(|| {
            cadenza_plugin::PluginError::NotFound(format!("mock {}", init.label))
        })?;
        Ok(Arc::new(MockPlugin {
            common: PluginCommon::new(id, init, engine),
            kind,
            process_calls: AtomicUsize::new(0),
        }) as Arc<dyn Plugin>)
    });
    factory
}

pub fn mock(label: &str, name: &str) -> PluginInit {
    PluginInit {
        binary_type: BinaryType::native(),
        plugin_type: PluginType::Internal,
        name: name.to_string(),
        label: label.to_string(),
        ..Default::default()
    }
}

pub fn options(mode: ProcessMode) -> EngineOptions {
    EngineOptions {
        process_mode: mode,
        audio_buffer_size: FRAMES,
        ..Default::default()
    }
}

/// Every callback the engine emitted.
#[derive(Clone, Default)]
pub struct CallbackLog(pub Arc<Mutex<Vec<CallbackEvent>>>);

impl CallbackLog {
    pub fn callback(&self) -> EngineCallback {
        let events = Arc::clone(&self.0);
        Arc::new(move |event: &CallbackEvent| events.lock().push(event.clone()))
    }

    pub fn opcodes(&self) -> Vec<EngineCallbackOpcode> {
        self.0.lock().iter().map(|event| event.opcode).collect()
    }

    pub fn ids_of(&self, opcode: EngineCallbackOpcode) -> Vec<u32> {
        self.0
            .lock()
            .iter()
            .filter(|event| event.opcode == opcode)
            .map(|event| event.plugin_id)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

pub fn engine(mode: ProcessMode) -> (Arc<Engine>, CallbackLog) {
    let log = CallbackLog::default();
    let engine = Engine::builder()
        .options(options(mode))
        .factory(mock_factory())
        .callback(log.callback())
        .build();
    (engine, log)
}

pub fn stereo(value: f32) -> Vec<Vec<f32>> {
    vec![vec![value; FRAMES as usize]; 2]
}
