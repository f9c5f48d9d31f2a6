//! End-to-end host tests: LV2 plugins through the engine, the driver and project files.

mod helpers;

use approx::assert_relative_eq;
use cadenza::prelude::*;
use cadenza::EventBuffer;
use helpers::*;

fn run(engine: &Engine, value: f32) -> Vec<Vec<f32>> {
    let mut outputs = stereo(0.0);
    let mut events = EventBuffer::new();
    engine.process(&stereo(value), &mut outputs, &[], &mut events, TEST_BUFFER_SIZE);
    outputs
}

#[test]
fn lv2_gain_runs_in_the_rack() {
    let engine = test_host(ProcessMode::ContinuousRack);
    let id = engine.add_plugin(gain_init("Gain")).unwrap();
    assert_eq!(id, 0);

    let outputs = run(&engine, 0.5);
    assert_relative_eq!(outputs[0][0], 0.5);
    assert_relative_eq!(outputs[1][0], 0.5);

    engine.get_plugin(id).unwrap().set_parameter_value(0, 0.5, false, false);
    let outputs = run(&engine, 0.5);
    assert_relative_eq!(outputs[0][7], 0.25);
    assert_relative_eq!(outputs[1][7], 0.25);
}

#[test]
fn unknown_uri_surfaces_as_an_error() {
    fn add(engine: &Engine) -> cadenza::Result<u32> {
        let mut init = gain_init("Missing");
        init.label = "urn:cadenza:test#missing".to_string();
        Ok(engine.add_plugin(init)?)
    }

    let engine = test_host(ProcessMode::ContinuousRack);
    let err = add(&engine).unwrap_err();
    assert!(matches!(err, cadenza::Error::Engine(_)));
    assert_eq!(err.to_string(), engine.last_error());
    assert_eq!(engine.current_plugin_count(), 0);
}

#[test]
fn session_survives_save_and_load_with_a_running_driver() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.carxp");

    let (callback, log) = opcode_log();
    let engine = HostBuilder::default()
        .options(test_options(ProcessMode::Patchbay))
        .lv2_world(gain_world())
        .callback(callback)
        .start()
        .unwrap();
    assert!(engine.is_running());

    engine.add_plugin(gain_init("Lead")).unwrap();
    engine.add_plugin(gain_init("Lead")).unwrap();
    engine.get_plugin(1).unwrap().set_parameter_value(0, 1.5, false, false);
    engine
        .restore_patchbay_connection(false, "Lead:Out", "Lead (2):In")
        .unwrap();
    engine.save_project(&path).unwrap();
    engine.close().unwrap();
    assert!(!engine.is_running());
    assert!(log.lock().contains(&EngineCallbackOpcode::EngineStopped));

    let restored = HostBuilder::default()
        .options(test_options(ProcessMode::Patchbay))
        .lv2_world(gain_world())
        .start()
        .unwrap();
    restored.load_project(&path).unwrap();

    assert_eq!(restored.current_plugin_count(), 2);
    let second = restored.get_plugin(1).unwrap();
    assert_eq!(second.name(), "Lead (2)");
    assert_relative_eq!(second.parameter_value(0), 1.5);
    assert_eq!(
        restored.patchbay_connections(false),
        vec![("Lead:Out".to_string(), "Lead (2):In".to_string())]
    );
    restored.close().unwrap();
}
