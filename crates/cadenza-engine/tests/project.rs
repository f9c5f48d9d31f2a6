//! Project files written and read through the engine.

mod common;

use cadenza_core::{EngineCallbackOpcode, ProcessMode};
use cadenza_plugin::CustomData;
use common::{engine, mock};
use std::collections::HashSet;

const TWO_PLUGINS: &str = "<?xml version='1.0' encoding='UTF-8'?>
<!DOCTYPE CARLA-PROJECT>
<CARLA-PROJECT VERSION='2.0'>
 <Plugin>
  <Info>
   <Type>INTERNAL</Type>
   <Name>Synth</Name>
   <Label>synth</Label>
  </Info>
  <Data>
   <Active>Yes</Active>
  </Data>
 </Plugin>
 <Plugin>
  <Info>
   <Type>INTERNAL</Type>
   <Name>Gain</Name>
   <Label>gain</Label>
  </Info>
  <Data>
   <Active>Yes</Active>
  </Data>
 </Plugin>
 <Patchbay>
  <Connection>
   <Source>Synth:out_1</Source>
   <Target>Gain:in_1</Target>
  </Connection>
 </Patchbay>
</CARLA-PROJECT>
";

#[test]
fn loads_plugins_and_connections_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("two.carxp");
    std::fs::write(&path, TWO_PLUGINS).unwrap();

    let (engine, log) = engine(ProcessMode::Patchbay);
    engine.load_project(&path).unwrap();

    assert_eq!(engine.current_plugin_count(), 2);
    assert_eq!(engine.get_plugin(0).unwrap().name(), "Synth");
    assert_eq!(engine.get_plugin(1).unwrap().name(), "Gain");
    assert!(engine.get_plugin(1).unwrap().is_active());
    assert_eq!(
        engine.patchbay_connections(false),
        vec![("Synth:out_1".to_string(), "Gain:in_1".to_string())]
    );
    assert_eq!(engine.project_folder().get().as_deref(), Some(dir.path()));

    let opcodes = log.opcodes();
    assert_eq!(
        opcodes.iter().filter(|op| **op == EngineCallbackOpcode::PluginAdded).count(),
        2
    );
    assert!(opcodes.contains(&EngineCallbackOpcode::PatchbayConnectionAdded));
    assert_eq!(opcodes.last(), Some(&EngineCallbackOpcode::CancelableAction));
}

#[test]
fn custom_data_survives_a_round_trip() {
    let (engine, _) = engine(ProcessMode::ContinuousRack);
    engine.add_plugin(mock("gain", "Gain")).unwrap();
    let plugin = engine.get_plugin(0).unwrap();
    plugin.set_custom_data("http://example.org/string", "mode", "wide & loud", false);
    plugin.set_custom_data("http://example.org/string", "path", "<none>", false);
    let xml = engine.save_project_to_string();

    let (loaded, _) = common::engine(ProcessMode::ContinuousRack);
    loaded.load_project_from_str(&xml).unwrap();

    let as_set = |data: Vec<CustomData>| -> HashSet<CustomData> { data.into_iter().collect() };
    let saved = as_set(plugin.get_state_save(false).custom_data);
    let restored = as_set(loaded.get_plugin(0).unwrap().get_state_save(false).custom_data);
    assert_eq!(saved.len(), 2);
    assert_eq!(saved, restored);
}

#[test]
fn rack_projects_keep_connections_out_of_the_internal_graph() {
    let (engine, _) = engine(ProcessMode::ContinuousRack);
    engine.load_project_from_str(TWO_PLUGINS).unwrap();

    assert_eq!(engine.current_plugin_count(), 2);
    assert!(engine.patchbay_connections(true).is_empty());
}

#[test]
fn saving_again_after_changes_reflects_the_registry() {
    let (engine, _) = engine(ProcessMode::Patchbay);
    engine.load_project_from_str(TWO_PLUGINS).unwrap();
    engine.remove_plugin(0).unwrap();
    engine.idle();

    let xml = engine.save_project_to_string();
    assert!(xml.contains(" <!-- Gain -->\n"));
    assert!(!xml.contains("<Name>Synth</Name>"));
    assert!(!xml.contains("<Connection>"));
}
