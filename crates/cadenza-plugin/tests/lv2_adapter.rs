//! LV2 adapter behavior against an in-process gain plugin.

use approx::assert_relative_eq;
use cadenza_core::{
    CallbackEvent, CallbackSink, EngineCallback, EngineCallbackOpcode, EngineEvent, EventBuffer, TimeInfo,
};
use cadenza_plugin::lv2::atom::atom_bytes;
use cadenza_plugin::lv2::urid::{URID_ATOM_OBJECT, URID_ATOM_PATH, URID_MIDI_EVENT};
use cadenza_plugin::lv2::worker::WorkerSchedule;
use cadenza_plugin::lv2::{
    AtomRef, AtomSupports, HostFeatures, Lv2Extensions, Lv2Instance, Lv2ParameterInfo,
    Lv2ParameterKind, Lv2PluginInfo, Lv2PortInfo, Lv2Status, Lv2UiInfo, Lv2UiType, Lv2Worker,
    Lv2World, PortBuffers, PortDesignation, PortKind,
};
use cadenza_plugin::{
    EngineInit, Lv2Plugin, Plugin, PluginHints, PluginInit, PluginOptions, PostRtEvent,
    ProcessContext, UiBridge, UiMessage, UiMessageReader,
};
use parking_lot::Mutex;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GAIN_URI: &str = "urn:cadenza:test#gain";
const CUTOFF_URI: &str = "urn:cadenza:test#cutoff";
const SAMPLE_URI: &str = "urn:cadenza:test#sample";
const FRAMES: u32 = 64;

/// One `run()` as seen by the plugin.
#[derive(Debug, Clone)]
struct Run {
    unit: usize,
    frames: u32,
    atoms: Vec<(i64, u32, Vec<u8>)>,
}

#[derive(Default)]
struct RunLog {
    runs: Vec<Run>,
}

/// Mono gain: `out = in * gain`, reports the gain on its output control.
struct MockGain {
    unit: usize,
    log: Arc<Mutex<RunLog>>,
}

impl Lv2Instance for MockGain {
    fn activate(&mut self) {}

    fn deactivate(&mut self) {}

    fn run(&mut self, ports: &mut dyn PortBuffers, frames: u32) {
        let frames_usize = frames as usize;
        let gain = ports.control(2);
        let input: Vec<f32> = ports
            .audio(0)
            .map(|buffer| buffer[..frames_usize].to_vec())
            .unwrap_or_default();
        if let Some(output) = ports.audio(1) {
            for (out, sample) in output[..frames_usize].iter_mut().zip(&input) {
                *out = sample * gain;
            }
        }
        ports.set_control(4, gain);

        let atoms = ports
            .atom_in(3)
            .map(|sequence| {
                sequence
                    .iter()
                    .map(|event| (event.frames, event.atom.atom_type, event.atom.body.to_vec()))
                    .collect()
            })
            .unwrap_or_default();
        self.log.lock().runs.push(Run {
            unit: self.unit,
            frames,
            atoms,
        });
    }
}

struct MockWorld {
    info: Lv2PluginInfo,
    log: Arc<Mutex<RunLog>>,
    instances: AtomicUsize,
}

impl Lv2World for MockWorld {
    fn plugin_info(&self, uri: &str) -> Option<Lv2PluginInfo> {
        (uri == self.info.uri).then(|| self.info.clone())
    }

    fn instantiate(
        &self,
        _info: &Lv2PluginInfo,
        _sample_rate: f64,
        _features: &HostFeatures,
    ) -> cadenza_plugin::Result<Box<dyn Lv2Instance>> {
        Ok(Box::new(MockGain {
            unit: self.instances.fetch_add(1, Ordering::SeqCst),
            log: Arc::clone(&self.log),
        }))
    }
}

fn gain_info() -> Lv2PluginInfo {
    let mut info = Lv2PluginInfo::new(GAIN_URI, "Mock Gain");
    info.bundle = "/usr/lib/lv2/mock.lv2".to_string();
    info.binary = "/usr/lib/lv2/mock.lv2/mock.so".to_string();

    let mut input = Lv2PortInfo::new(0, "in", PortKind::Audio, true);
    input.name = "In".to_string();
    let mut output = Lv2PortInfo::new(1, "out", PortKind::Audio, false);
    output.name = "Out".to_string();
    let mut gain = Lv2PortInfo::new(2, "gain", PortKind::Control, true);
    gain.name = "Gain".to_string();
    gain.min = Some(0.0);
    gain.max = Some(2.0);
    gain.default = Some(1.0);
    gain.midi_cc = Some(20);
    let mut events = Lv2PortInfo::new(3, "events", PortKind::Atom, true);
    events.atom_supports = AtomSupports::MIDI;
    events.designation = PortDesignation::Control;
    let mut level = Lv2PortInfo::new(4, "level", PortKind::Control, false);
    level.name = "Level".to_string();
    level.min = Some(0.0);
    level.max = Some(2.0);
    info.ports = vec![input, output, gain, events, level];

    info.parameters = vec![
        Lv2ParameterInfo {
            uri: CUTOFF_URI.to_string(),
            label: "Cutoff".to_string(),
            kind: Lv2ParameterKind::Float,
            is_input: true,
            min: 20.0,
            max: 20000.0,
            default: 1000.0,
            file_types: String::new(),
        },
        Lv2ParameterInfo {
            uri: SAMPLE_URI.to_string(),
            label: "Sample".to_string(),
            kind: Lv2ParameterKind::Path,
            is_input: true,
            min: 0.0,
            max: 1.0,
            default: 0.0,
            file_types: "wav".to_string(),
        },
    ];
    info.uis = vec![Lv2UiInfo {
        uri: "urn:cadenza:test#gain-ui".to_string(),
        ui_type: Lv2UiType::X11,
        bundle: info.bundle.clone(),
        binary: "/usr/lib/lv2/mock.lv2/mock_ui.so".to_string(),
    }];
    info
}

struct Fixture {
    plugin: Lv2Plugin,
    log: Arc<Mutex<RunLog>>,
    callbacks: Arc<Mutex<Vec<CallbackEvent>>>,
}

fn fixture(options: Option<PluginOptions>) -> Fixture {
    let log = Arc::new(Mutex::new(RunLog::default()));
    let world = Arc::new(MockWorld {
        info: gain_info(),
        log: Arc::clone(&log),
        instances: AtomicUsize::new(0),
    });
    let callbacks = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&callbacks);
    let callback: EngineCallback =
        Arc::new(move |event: &CallbackEvent| seen.lock().push(event.clone()));
    let engine = EngineInit {
        sample_rate: 48000.0,
        buffer_size: FRAMES,
        callbacks: CallbackSink::new(Some(callback), None),
        ..Default::default()
    };
    let init = PluginInit {
        label: GAIN_URI.to_string(),
        options,
        ..Default::default()
    };
    let plugin = Lv2Plugin::new(world, 1, init, &engine).unwrap();
    plugin.reload().unwrap();
    plugin.set_active(true, false);
    log.lock().runs.clear();
    Fixture {
        plugin,
        log,
        callbacks,
    }
}

fn run_block(plugin: &Lv2Plugin, inputs: &[Vec<f32>], events: &[EngineEvent]) -> Vec<Vec<f32>> {
    let outs = plugin.common().ports.read().audio_out.len();
    let mut outputs = vec![vec![0.0; FRAMES as usize]; outs];
    let mut events_out = EventBuffer::new();
    let time = TimeInfo::default();
    let mut ctx = ProcessContext {
        audio_in: inputs,
        audio_out: &mut outputs,
        cv_in: &[],
        cv_out: &mut [],
        events_in: events,
        events_out: &mut events_out,
        time: &time,
        frames: FRAMES,
    };
    plugin.process(&mut ctx);
    outputs
}

fn sample_accurate() -> Option<PluginOptions> {
    Some(
        PluginOptions::SEND_CONTROL_CHANGES
            | PluginOptions::SEND_CHANNEL_PRESSURE
            | PluginOptions::SEND_NOTE_AFTERTOUCH
            | PluginOptions::SEND_PITCHBEND
            | PluginOptions::SEND_ALL_SOUND_OFF,
    )
}

#[test]
fn test_reload_builds_parameters_and_ports() {
    let fx = fixture(None);
    let plugin = &fx.plugin;

    assert_eq!(plugin.common().parameter_count(), 3);
    let gain = plugin.common().parameter(0).unwrap();
    assert_eq!(gain.name, "Gain");
    assert_eq!(gain.data.rindex, 2);
    assert_eq!(gain.data.mapped_control_index, 20);
    let level = plugin.common().parameter(1).unwrap();
    assert!(level.is_output());
    let cutoff = plugin.common().parameter(2).unwrap();
    assert_eq!(cutoff.symbol, CUTOFF_URI);
    assert_eq!(cutoff.data.rindex, 5);
    assert_relative_eq!(plugin.parameter_value(2), 1000.0);

    let ports = plugin.common().ports.read().clone();
    assert_eq!(ports.audio_in, vec!["In"]);
    assert_eq!(ports.audio_out, vec!["Out"]);
    assert_eq!(ports.event_in, vec!["events-in"]);

    let hints = plugin.hints();
    assert!(hints.contains(PluginHints::CAN_DRYWET));
    assert!(hints.contains(PluginHints::CAN_VOLUME));
    assert!(hints.contains(PluginHints::HAS_CUSTOM_UI));
    assert!(!hints.contains(PluginHints::CAN_BALANCE));

    let available = plugin.options_available();
    assert!(available.contains(PluginOptions::FORCE_STEREO));
    assert!(available.contains(PluginOptions::FIXED_BUFFERS));
    assert!(!available.contains(PluginOptions::MAP_PROGRAM_CHANGES));
    assert!(plugin.options().contains(PluginOptions::FIXED_BUFFERS));
}

#[test]
fn test_gain_applies_to_audio() {
    let fx = fixture(None);
    fx.plugin.set_parameter_value(0, 0.5, false, false);
    let outputs = run_block(&fx.plugin, &[vec![1.0; FRAMES as usize]], &[]);
    assert_relative_eq!(outputs[0][0], 0.5);
    assert_relative_eq!(outputs[0][FRAMES as usize - 1], 0.5);
    assert_relative_eq!(fx.plugin.parameter_value(1), 0.5);
}

#[test]
fn test_forced_stereo_runs_two_units() {
    let fx = fixture(Some(PluginOptions::DEFAULTS | PluginOptions::FORCE_STEREO));
    let plugin = &fx.plugin;
    assert_eq!(plugin.unit_count(), 2);
    assert!(plugin.options().contains(PluginOptions::FORCE_STEREO));

    let ports = plugin.common().ports.read().clone();
    assert_eq!(ports.audio_in, vec!["In 1", "In 2"]);
    assert_eq!(ports.audio_out, vec!["Out 1", "Out 2"]);
    assert!(plugin.hints().contains(PluginHints::CAN_BALANCE));

    let inputs = vec![vec![1.0; FRAMES as usize], vec![0.25; FRAMES as usize]];
    let outputs = run_block(plugin, &inputs, &[]);
    assert_relative_eq!(outputs[0][3], 1.0);
    assert_relative_eq!(outputs[1][3], 0.25);

    let units: Vec<usize> = fx.log.lock().runs.iter().map(|r| r.unit).collect();
    assert_eq!(units, vec![0, 1]);

    plugin.set_option(PluginOptions::FORCE_STEREO, false, false);
    assert_eq!(plugin.unit_count(), 1);
    assert_eq!(plugin.common().ports.read().audio_out, vec!["Out"]);
}

#[test]
fn test_events_split_the_block() {
    let fx = fixture(sample_accurate());
    assert!(!fx.plugin.options().contains(PluginOptions::FIXED_BUFFERS));

    let events = vec![
        EngineEvent::from_midi(10, 0, &[0x90, 60, 100]),
        EngineEvent::from_midi(30, 0, &[0x90, 60, 0]),
    ];
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &events);

    let runs = fx.log.lock().runs.clone();
    let spans: Vec<u32> = runs.iter().map(|r| r.frames).collect();
    assert_eq!(spans, vec![10, 20, 34]);
    assert!(runs[0].atoms.is_empty());
    assert_eq!(runs[1].atoms, vec![(0, URID_MIDI_EVENT, vec![0x90, 60, 100])]);
    // velocity 0 note-on arrives as note-off
    assert_eq!(runs[2].atoms, vec![(0, URID_MIDI_EVENT, vec![0x80, 60, 0])]);

    let post = fx.plugin.common().take_post_rt_events();
    assert!(post.contains(&PostRtEvent::NoteOn {
        channel: 0,
        note: 60,
        velocity: 100
    }));
    assert!(post.contains(&PostRtEvent::NoteOff { channel: 0, note: 60 }));
}

#[test]
fn test_fixed_buffers_keep_event_offsets() {
    let fx = fixture(None);
    let events = vec![EngineEvent::from_midi(12, 0, &[0x91, 64, 90])];
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &events);

    let runs = fx.log.lock().runs.clone();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].frames, FRAMES);
    assert_eq!(runs[0].atoms, vec![(12, URID_MIDI_EVENT, vec![0x91, 64, 90])]);
}

#[test]
fn test_events_past_the_block_are_skipped() {
    let fx = fixture(sample_accurate());
    let events = vec![EngineEvent::from_midi(FRAMES, 0, &[0x90, 60, 100])];
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &events);
    let runs = fx.log.lock().runs.clone();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].atoms.is_empty());
}

#[test]
fn test_filtered_midi_is_dropped() {
    let fx = fixture(Some(PluginOptions::SEND_CONTROL_CHANGES));
    let events = vec![
        EngineEvent::from_midi(0, 0, &[0xE0, 0, 64]),
        EngineEvent::from_midi(0, 0, &[0xD0, 40]),
    ];
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &events);
    let runs = fx.log.lock().runs.clone();
    assert!(runs.iter().all(|r| r.atoms.is_empty()));
}

#[test]
fn test_midi_cc_drives_mapped_parameter() {
    let fx = fixture(sample_accurate());
    let events = vec![EngineEvent::from_midi(0, 0, &[0xB0, 20, 127])];
    let outputs = run_block(&fx.plugin, &[vec![1.0; FRAMES as usize]], &events);

    assert_relative_eq!(fx.plugin.parameter_value(0), 2.0);
    assert_relative_eq!(outputs[0][0], 2.0);

    let post = fx.plugin.common().take_post_rt_events();
    assert!(post.iter().any(|event| matches!(
        event,
        PostRtEvent::ParameterChange { index: 0, value, .. } if (*value - 2.0).abs() < 1e-6
    )));

    // passed through as MIDI too
    let runs = fx.log.lock().runs.clone();
    assert_eq!(runs[0].atoms, vec![(0, URID_MIDI_EVENT, vec![0xB0, 20, 127])]);
}

#[test]
fn test_volume_controller_on_control_channel() {
    let fx = fixture(sample_accurate());
    let events = vec![EngineEvent::from_midi(0, 0, &[0xB0, 7, 127])];
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &events);
    assert_relative_eq!(fx.plugin.common().post_proc.volume.get(), 1.27, epsilon = 1e-5);

    // other channels leave it alone
    fx.plugin.common().post_proc.volume.set(1.0);
    let events = vec![EngineEvent::from_midi(0, 0, &[0xB3, 7, 0])];
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &events);
    assert_relative_eq!(fx.plugin.common().post_proc.volume.get(), 1.0);
}

#[test]
fn test_lv2_parameter_sends_patch_set() {
    let fx = fixture(None);
    fx.plugin.set_parameter_value(2, 440.0, false, true);
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &[]);

    let runs = fx.log.lock().runs.clone();
    let (frame, atom_type, body) = runs[0].atoms[0].clone();
    assert_eq!(frame, 0);
    assert_eq!(atom_type, URID_ATOM_OBJECT);
    let atom = atom_bytes(atom_type, &body);
    let (property, value) = AtomRef::parse(&atom).unwrap().parse_patch_set().unwrap();
    assert_eq!(property, fx.plugin.urids().map(CUTOFF_URI));
    assert_relative_eq!(value.as_f32().unwrap(), 440.0);

    assert!(fx.callbacks.lock().iter().any(|event| {
        event.opcode == EngineCallbackOpcode::ParameterValueChanged && event.value1 == 2
    }));
}

#[test]
fn test_path_custom_data_sends_patch_set() {
    let fx = fixture(None);
    let path_type = fx.plugin.urids().unmap(URID_ATOM_PATH).unwrap();
    fx.plugin
        .set_custom_data(&path_type, SAMPLE_URI, "/tmp/kick.wav", false);
    run_block(&fx.plugin, &[vec![0.0; FRAMES as usize]], &[]);

    let runs = fx.log.lock().runs.clone();
    let (_, atom_type, body) = runs[0].atoms[0].clone();
    let atom = atom_bytes(atom_type, &body);
    let (property, value) = AtomRef::parse(&atom).unwrap().parse_patch_set().unwrap();
    assert_eq!(property, fx.plugin.urids().map(SAMPLE_URI));
    assert_eq!(value.atom_type, URID_ATOM_PATH);
    assert_eq!(value.as_str(), Some("/tmp/kick.wav"));
    assert_eq!(
        fx.plugin.common().find_custom_data(&path_type, SAMPLE_URI).as_deref(),
        Some("/tmp/kick.wav")
    );
}

#[test]
fn test_inactive_plugin_outputs_silence() {
    let fx = fixture(None);
    fx.plugin.set_active(false, false);
    let outputs = run_block(&fx.plugin, &[vec![1.0; FRAMES as usize]], &[]);
    assert!(outputs[0].iter().all(|&s| s == 0.0));
    assert!(fx.log.lock().runs.is_empty());
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn sent_messages(sink: &SharedSink) -> Vec<UiMessage> {
    let bytes = sink.0.lock().clone();
    let mut reader = UiMessageReader::new(Cursor::new(bytes));
    let mut messages = Vec::new();
    while let Ok(Some(message)) = reader.read_message() {
        messages.push(message);
    }
    messages
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_ui_bridge_sync_and_messages() {
    let fx = fixture(None);
    let plugin = &fx.plugin;

    let mut script = UiMessage::Control {
        index: 2,
        value: 0.5,
    }
    .to_bytes();
    script.extend(
        UiMessage::Note {
            on: true,
            channel: 0,
            note: 60,
            velocity: 100,
        }
        .to_bytes(),
    );
    let sink = SharedSink::default();
    let bridge =
        UiBridge::from_streams(Cursor::new(script), sink.clone(), Duration::from_secs(5)).unwrap();
    plugin.attach_ui_bridge(bridge);
    assert!(plugin.is_ui_visible());

    let sent = sent_messages(&sink);
    assert!(sent.contains(&UiMessage::UiTitle("Mock Gain (GUI)".to_string())));
    assert!(sent.contains(&UiMessage::Control {
        index: 2,
        value: 1.0
    }));
    assert!(sent.contains(&UiMessage::ParameterControl {
        uri: CUTOFF_URI.to_string(),
        value: 1000.0
    }));
    assert!(sent.iter().any(|m| matches!(m, UiMessage::Urid { .. })));
    assert_eq!(sent.last(), Some(&UiMessage::Show));

    assert!(wait_until(|| {
        plugin.ui_idle();
        (plugin.parameter_value(0) - 0.5).abs() < 1e-6
    }));

    run_block(plugin, &[vec![0.0; FRAMES as usize]], &[]);
    let runs = fx.log.lock().runs.clone();
    assert!(runs[0]
        .atoms
        .contains(&(0, URID_MIDI_EVENT, vec![0x90, 60, 100])));

    // the script ended, so the UI is gone
    assert!(wait_until(|| {
        plugin.ui_idle();
        !plugin.is_ui_visible()
    }));
    assert!(fx.callbacks.lock().iter().any(|event| {
        event.opcode == EngineCallbackOpcode::UiStateChanged && event.value1 == 0
    }));
}

#[test]
fn test_show_ui_without_binary_dir_reports_failure() {
    let fx = fixture(None);
    fx.plugin.show_custom_ui(true);
    assert!(!fx.plugin.is_ui_visible());
    assert!(fx.callbacks.lock().iter().any(|event| {
        event.opcode == EngineCallbackOpcode::UiStateChanged && event.value1 == -1
    }));
}

/// Schedules one job per block carrying the block number; records responses.
struct Scheduler {
    schedule: Option<WorkerSchedule>,
    block: u8,
    responses: Arc<Mutex<Vec<Vec<u8>>>>,
}

struct Doubler;

impl Lv2Worker for Doubler {
    fn work(&mut self, respond: &mut dyn FnMut(&[u8]) -> bool, data: &[u8]) -> Lv2Status {
        let doubled: Vec<u8> = data.iter().map(|b| b * 2).collect();
        respond(&doubled);
        Lv2Status::Success
    }
}

impl Lv2Instance for Scheduler {
    fn activate(&mut self) {}

    fn deactivate(&mut self) {}

    fn run(&mut self, _ports: &mut dyn PortBuffers, _frames: u32) {
        self.block += 1;
        if let Some(schedule) = &self.schedule {
            assert_eq!(schedule.schedule(&[self.block]), Lv2Status::Success);
        }
    }

    fn take_worker(&mut self) -> Option<Box<dyn Lv2Worker>> {
        Some(Box::new(Doubler))
    }

    fn work_response(&mut self, data: &[u8]) {
        self.responses.lock().push(data.to_vec());
    }
}

struct WorkerWorld {
    info: Lv2PluginInfo,
    responses: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Lv2World for WorkerWorld {
    fn plugin_info(&self, uri: &str) -> Option<Lv2PluginInfo> {
        (uri == self.info.uri).then(|| self.info.clone())
    }

    fn instantiate(
        &self,
        _info: &Lv2PluginInfo,
        _sample_rate: f64,
        features: &HostFeatures,
    ) -> cadenza_plugin::Result<Box<dyn Lv2Instance>> {
        Ok(Box::new(Scheduler {
            schedule: features.worker.clone(),
            block: 0,
            responses: Arc::clone(&self.responses),
        }))
    }
}

#[test]
fn test_worker_response_arrives_on_the_block_after_idle() {
    let mut info = gain_info();
    info.extensions.insert(Lv2Extensions::WORKER);
    let responses = Arc::new(Mutex::new(Vec::new()));
    let world = Arc::new(WorkerWorld {
        info,
        responses: Arc::clone(&responses),
    });
    let engine = EngineInit {
        sample_rate: 48000.0,
        buffer_size: FRAMES,
        ..Default::default()
    };
    let init = PluginInit {
        label: GAIN_URI.to_string(),
        ..Default::default()
    };
    let plugin = Lv2Plugin::new(world, 1, init, &engine).unwrap();
    plugin.reload().unwrap();
    plugin.set_active(true, false);
    let input = [vec![0.0; FRAMES as usize]];

    run_block(&plugin, &input, &[]);
    assert!(responses.lock().is_empty());

    // work runs on idle, the response waits for the audio thread
    plugin.idle();
    assert!(responses.lock().is_empty());

    run_block(&plugin, &input, &[]);
    assert_eq!(*responses.lock(), vec![vec![2u8]]);

    // jobs queued by blocks 2 and 3 wait for the next idle
    run_block(&plugin, &input, &[]);
    assert_eq!(responses.lock().len(), 1);
    plugin.idle();
    run_block(&plugin, &input, &[]);
    assert_eq!(*responses.lock(), vec![vec![2u8], vec![4u8], vec![6u8]]);
}
