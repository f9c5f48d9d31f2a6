//! Test helpers and fixtures for Cadenza integration tests
//!
//! An in-process LV2 world with a single mono gain plugin stands in for real
//! binaries, so hosts can be built without touching the filesystem.
#![allow(dead_code)]

use cadenza::core::{CallbackEvent, EngineCallback};
use cadenza::plugin::lv2::{
    HostFeatures, Lv2Instance, Lv2PluginInfo, Lv2PortInfo, Lv2World, PortBuffers, PortKind,
};
use cadenza::prelude::*;
use parking_lot::Mutex;

pub const GAIN_URI: &str = "urn:cadenza:test#gain";

/// Buffer size used by every test host
pub const TEST_BUFFER_SIZE: u32 = 64;

/// Mono gain: `out = in * gain`.
struct Gain;

impl Lv2Instance for Gain {
    fn activate(&mut self) {}

    fn deactivate(&mut self) {}

    fn run(&mut self, ports: &mut dyn PortBuffers, frames: u32) {
        let frames = frames as usize;
        let gain = ports.control(2);
        let input: Vec<f32> = ports
            .audio(0)
            .map(|buffer| buffer[..frames].to_vec())
            .unwrap_or_default();
        if let Some(output) = ports.audio(1) {
            for (out, sample) in output[..frames].iter_mut().zip(&input) {
                *out = sample * gain;
            }
        }
    }
}

pub struct GainWorld {
    info: Lv2PluginInfo,
}

impl Lv2World for GainWorld {
    fn plugin_info(&self, uri: &str) -> Option<Lv2PluginInfo> {
        (uri == self.info.uri).then(|| self.info.clone())
    }

    fn instantiate(
        &self,
        _info: &Lv2PluginInfo,
        _sample_rate: f64,
        _features: &HostFeatures,
    ) -> cadenza::plugin::Result<Box<dyn Lv2Instance>> {
        Ok(Box::new(Gain))
    }
}

pub fn gain_world() -> Arc<dyn Lv2World> {
    let mut info = Lv2PluginInfo::new(GAIN_URI, "Test Gain");
    info.bundle = "/usr/lib/lv2/test.lv2".to_string();
    info.binary = "/usr/lib/lv2/test.lv2/test.so".to_string();

    let mut input = Lv2PortInfo::new(0, "in", PortKind::Audio, true);
    input.name = "In".to_string();
    let mut output = Lv2PortInfo::new(1, "out", PortKind::Audio, false);
    output.name = "Out".to_string();
    let mut gain = Lv2PortInfo::new(2, "gain", PortKind::Control, true);
    gain.name = "Gain".to_string();
    gain.min = Some(0.0);
    gain.max = Some(2.0);
    gain.default = Some(1.0);
    info.ports = vec![input, output, gain];

    Arc::new(GainWorld { info })
}

pub fn gain_init(name: &str) -> PluginInit {
    PluginInit {
        binary_type: BinaryType::native(),
        plugin_type: PluginType::Lv2,
        name: name.to_string(),
        label: GAIN_URI.to_string(),
        ..Default::default()
    }
}

pub fn test_options(mode: ProcessMode) -> EngineOptions {
    EngineOptions {
        process_mode: mode,
        audio_buffer_size: TEST_BUFFER_SIZE,
        ..Default::default()
    }
}

/// A host with the gain world registered and no driver started.
pub fn test_host(mode: ProcessMode) -> Arc<Engine> {
    HostBuilder::default()
        .options(test_options(mode))
        .lv2_world(gain_world())
        .build()
        .unwrap()
}

/// Records callback opcodes.
pub fn opcode_log() -> (EngineCallback, Arc<Mutex<Vec<EngineCallbackOpcode>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback: EngineCallback =
        Arc::new(move |event: &CallbackEvent| sink.lock().push(event.opcode));
    (callback, log)
}

pub fn stereo(value: f32) -> Vec<Vec<f32>> {
    vec![vec![value; TEST_BUFFER_SIZE as usize]; 2]
}
