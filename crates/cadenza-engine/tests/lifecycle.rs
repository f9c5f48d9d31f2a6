//! Registry invariants across add/remove/replace/switch, with and without a running driver.

mod common;

use cadenza_core::{EngineCallbackOpcode, Error, ProcessMode};
use cadenza_engine::DummyDriver;
use common::{engine, mock};
use std::sync::Arc;

fn assert_ids_match_slots(engine: &cadenza_engine::Engine) {
    for id in 0..engine.current_plugin_count() {
        let plugin = engine.get_plugin(id).unwrap();
        assert_eq!(plugin.id(), id, "plugin '{}' has a stale id", plugin.name());
    }
}

#[test]
fn remove_all_queues_every_plugin_once() {
    let (engine, log) = engine(ProcessMode::Patchbay);
    for name in ["one", "two", "three", "four"] {
        engine.add_plugin(mock("gain", name)).unwrap();
    }
    let handles = engine.plugins();
    log.clear();

    engine.remove_all_plugins().unwrap();

    assert_eq!(engine.current_plugin_count(), 0);
    assert_eq!(engine.pending_deletion_count(), handles.len());
    for handle in &handles {
        assert!(engine.is_pending_deletion(handle));
        assert!(!handle.is_enabled());
    }
    assert_eq!(log.ids_of(EngineCallbackOpcode::PluginRemoved), vec![3, 2, 1, 0]);

    drop(handles);
    engine.idle();
    assert_eq!(engine.pending_deletion_count(), 0);
}

#[test]
fn idle_keeps_plugins_still_referenced() {
    let (engine, _) = engine(ProcessMode::Patchbay);
    engine.add_plugin(mock("gain", "kept")).unwrap();
    let plugin = engine.get_plugin(0).unwrap();
    engine.remove_plugin(0).unwrap();

    engine.idle();
    assert_eq!(engine.pending_deletion_count(), 0);
    // the queue drops its slot, the caller's handle stays usable
    assert_eq!(plugin.name(), "kept");
    assert_eq!(Arc::strong_count(&plugin), 1);
}

#[test]
fn ids_stay_dense_through_structural_changes() {
    let (engine, _) = engine(ProcessMode::Patchbay);
    for name in ["a", "b", "c", "d", "e"] {
        engine.add_plugin(mock("gain", name)).unwrap();
    }
    engine.remove_plugin(1).unwrap();
    assert_ids_match_slots(&engine);
    engine.switch_plugins(0, 3).unwrap();
    assert_ids_match_slots(&engine);
    engine.replace_plugin(2).unwrap();
    engine.add_plugin(mock("synth", "f")).unwrap();
    assert_ids_match_slots(&engine);
    engine.clone_plugin(0).unwrap();
    assert_ids_match_slots(&engine);

    let names: Vec<String> = engine.plugins().iter().map(|p| p.name()).collect();
    assert_eq!(names, vec!["e", "c", "f", "a", "e (2)"]);

    let graph = engine.patchbay_graph(false);
    assert_eq!(graph.plugin_count(), 5);
    for (id, name) in names.iter().enumerate() {
        let group = graph.plugin_group(id as u32).unwrap();
        assert_eq!(&graph.group(group).unwrap().name, name);
    }
}

#[test]
fn failed_creation_leaves_registry_untouched() {
    let (engine, log) = engine(ProcessMode::Patchbay);
    engine.add_plugin(mock("gain", "a")).unwrap();
    log.clear();

    let err = engine.add_plugin(mock("no-such-mock", "b")).unwrap_err();
    assert_eq!(engine.last_error(), err.to_string());
    assert!(engine.last_error().contains("no-such-mock"));
    assert_eq!(engine.current_plugin_count(), 1);
    assert!(log.opcodes().is_empty());
}

#[test]
fn rack_mode_rejects_cv_plugins() {
    let (engine, _) = engine(ProcessMode::ContinuousRack);
    assert!(engine.add_plugin(mock("cv", "cv")).is_err());
    assert_eq!(
        engine.last_error(),
        "Rack mode cannot work with plugins that have CV ports, sorry!"
    );
    assert_eq!(engine.current_plugin_count(), 0);
}

#[test]
fn patchbay_mode_rejects_multiple_midi_ports() {
    let (engine, _) = engine(ProcessMode::Patchbay);
    assert!(engine.add_plugin(mock("dual-midi", "x")).is_err());
    assert!(engine.last_error().contains("multiple MIDI ports"));
    assert!(engine.add_plugin(mock("cv", "y")).is_err());
    assert_eq!(engine.last_error(), "CV ports in patchbay mode is still TODO");
}

#[test]
fn bridge_mode_holds_a_single_plugin() {
    let (engine, _) = engine(ProcessMode::Bridge);
    engine.add_plugin(mock("gain", "only")).unwrap();
    assert!(matches!(
        engine.add_plugin(mock("gain", "second")),
        Err(Error::MaxPluginsReached)
    ));
}

#[test]
fn structural_changes_while_driver_runs() {
    let (engine, log) = engine(ProcessMode::Patchbay);
    engine.init(DummyDriver::NAME).unwrap();

    for round in 0..3 {
        for name in ["a", "b", "c"] {
            engine.add_plugin(mock("gain", name)).unwrap();
        }
        engine
            .restore_patchbay_connection(false, "Audio Input:capture_1", "a:in_1")
            .unwrap();
        engine.switch_plugins(0, 2).unwrap();
        engine.remove_plugin(1).unwrap();
        assert_eq!(engine.current_plugin_count(), 2, "round {round}");
        assert_ids_match_slots(&engine);
        engine.remove_all_plugins().unwrap();
        assert_eq!(engine.current_plugin_count(), 0);
        engine.idle();
    }

    engine.close().unwrap();
    assert_eq!(engine.pending_deletion_count(), 0);
    assert_eq!(
        log.opcodes().last(),
        Some(&EngineCallbackOpcode::EngineStopped)
    );
}

#[test]
fn pending_action_blocks_other_operations() {
    use cadenza_engine::PendingAction;

    let action = PendingAction::remove_plugin(3);
    assert!(!action.is_null());
    assert!(PendingAction::default().is_null());

    let (engine, _) = engine(ProcessMode::Patchbay);
    engine.add_plugin(mock("gain", "a")).unwrap();
    // without a running driver actions apply inline, so nothing stays pending
    engine.remove_plugin(0).unwrap();
    engine.add_plugin(mock("gain", "b")).unwrap();
    assert_eq!(engine.current_plugin_count(), 1);
}
