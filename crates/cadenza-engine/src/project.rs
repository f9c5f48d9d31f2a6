//! Project files: engine settings, plugin states and patchbay connections.
//!
//! Saving writes the XML with plain formatting. Loading goes in stages
//! (settings, transport, plugins, internal then external connections),
//! pumping an `Idle` callback between stages and stopping cleanly when the
//! load is canceled or the engine is about to close.

use crate::engine::{Created, Engine};
use crate::graph::GroupPosition;
use cadenza_core::xml::escape;
use cadenza_core::{
    BinaryType, CallbackEvent, EngineCallbackOpcode, EngineOption, Error, PluginType,
    ProcessMode, Result, XmlNode,
};
use cadenza_plugin::custom_data::{CUSTOM_DATA_KEY_PING, CUSTOM_DATA_TYPE_STRING};
use cadenza_plugin::{Plugin, PluginHints, PluginInit, PluginOptions, StateSave};
use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const PROJECT_HEADER: &str = "<?xml version='1.0' encoding='UTF-8'?>\n<!DOCTYPE CARLA-PROJECT>\n<CARLA-PROJECT VERSION='2.0'>\n";
const LOADING_PROJECT: &str = "Loading project";

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Architecture of a plugin binary, read from its executable header.
///
/// Unreadable or unknown files count as native.
pub fn binary_type_from_file(path: &Path) -> BinaryType {
    let mut header = [0u8; 0x40];
    let read = match std::fs::File::open(path) {
        Ok(mut file) => {
            use std::io::Read;
            file.read(&mut header).unwrap_or(0)
        }
        Err(_) => return BinaryType::native(),
    };
    let header = &header[..read];

    if header.starts_with(b"\x7fELF") && header.len() > 4 {
        return match header[4] {
            1 => BinaryType::Posix32,
            2 => BinaryType::Posix64,
            _ => BinaryType::native(),
        };
    }
    if header.starts_with(b"MZ") && header.len() >= 0x40 {
        let offset = u32::from_le_bytes([header[0x3C], header[0x3D], header[0x3E], header[0x3F]]);
        return pe_machine(path, u64::from(offset)).unwrap_or_else(BinaryType::native);
    }
    BinaryType::native()
}

fn pe_machine(path: &Path, offset: u64) -> Option<BinaryType> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path).ok()?;
    file.seek(SeekFrom::Start(offset)).ok()?;
    let mut signature = [0u8; 6];
    file.read_exact(&mut signature).ok()?;
    if &signature[..4] != b"PE\0\0" {
        return None;
    }
    match u16::from_le_bytes([signature[4], signature[5]]) {
        0x014C => Some(BinaryType::Win32),
        0x8664 | 0xAA64 => Some(BinaryType::Win64),
        _ => None,
    }
}

/// Look for `binary` (by file name) under the directories of `search_path`.
///
/// A Windows or macOS library name is retried with the native extension.
pub fn find_binary_in_paths(search_path: &str, binary: &str) -> Option<PathBuf> {
    let normalized = if cfg!(windows) {
        binary.to_string()
    } else {
        let bytes = binary.as_bytes();
        if bytes.len() > 2 && bytes[1] == b':' && (bytes[2] == b'\\' || bytes[2] == b'/') {
            binary[2..].replace('\\', "/")
        } else {
            binary.to_string()
        }
    };
    let file_name = Path::new(&normalized).file_name()?.to_string_lossy().into_owned();

    let search = |name: &str| {
        std::env::split_paths(search_path).find_map(|dir| find_file_named(&dir, name))
    };
    if let Some(found) = search(&file_name) {
        return Some(found);
    }

    let stem = Path::new(&file_name).file_stem()?.to_string_lossy().into_owned();
    let extension = Path::new(&file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let native = std::env::consts::DLL_EXTENSION;
    if extension == native || !["dll", "dylib", "so"].contains(&extension.as_str()) {
        return None;
    }
    search(&format!("{stem}.{native}"))
}

fn find_file_named(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }
        if path.is_dir() {
            subdirs.push(path);
        } else if entry.file_name().to_string_lossy() == name {
            return Some(path);
        }
    }
    subdirs.sort();
    subdirs.into_iter().find_map(|sub| find_file_named(&sub, name))
}

fn search_path_env(plugin_type: PluginType) -> Option<&'static str> {
    match plugin_type {
        PluginType::Ladspa => Some("LADSPA_PATH"),
        PluginType::Dssi => Some("DSSI_PATH"),
        PluginType::Vst2 => Some("VST_PATH"),
        PluginType::Vst3 => Some("VST3_PATH"),
        PluginType::Sf2 => Some("SF2_PATH"),
        PluginType::Sfz => Some("SFZ_PATH"),
        _ => None,
    }
}

fn set_ping(plugin: &Arc<dyn Plugin>, enabled: bool) {
    if plugin.hints().contains(PluginHints::IS_BRIDGE) {
        plugin.set_custom_data(CUSTOM_DATA_TYPE_STRING, CUSTOM_DATA_KEY_PING, bool_str(enabled), false);
    }
}

/// Reads `<Connection>` source/target pairs of a patchbay section.
fn connections_of(section: &XmlNode) -> Vec<(String, String)> {
    section
        .children
        .iter()
        .filter(|child| child.name == "Connection")
        .filter_map(|connection| {
            let source = connection.child_text("Source").unwrap_or_default();
            let target = connection.child_text("Target").unwrap_or_default();
            (!source.is_empty() && !target.is_empty())
                .then(|| (source.to_string(), target.to_string()))
        })
        .collect()
}

fn positions_of(section: &XmlNode) -> Vec<(String, GroupPosition)> {
    let Some(positions) = section.child("Positions") else {
        return Vec::new();
    };
    positions
        .children
        .iter()
        .filter(|child| child.name == "Position")
        .filter_map(|position| {
            let name = position.child_text("Name")?.to_string();
            let coord = |key: &str| {
                position
                    .attribute(key)
                    .and_then(|value| value.parse::<i32>().ok())
                    .unwrap_or(0)
            };
            Some((
                name,
                GroupPosition {
                    x1: coord("x1"),
                    y1: coord("y1"),
                    x2: coord("x2"),
                    y2: coord("y2"),
                },
            ))
        })
        .collect()
}

/// Resets the loading flag when a load ends, however it ends.
struct LoadingGuard<'a>(&'a Engine);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.loading_project.store(false, Ordering::Release);
    }
}

impl Engine {
    // ------------------------------------------------------------------
    // Save

    /// Write the project to `path` and make its folder the current project folder.
    pub fn save_project(&self, path: &Path) -> Result<()> {
        self.project_folder.set(path.parent().map(Path::to_path_buf));
        let xml = self.save_project_to_string();
        let result = std::fs::write(path, xml).map_err(Error::from);
        if result.is_ok() {
            tracing::info!("Saved project to {}", path.display());
        }
        self.record(result)
    }

    pub fn save_project_to_string(&self) -> String {
        let plugins: Vec<Arc<dyn Plugin>> = self
            .plugins()
            .into_iter()
            .filter(|plugin| plugin.is_enabled())
            .collect();

        for plugin in &plugins {
            set_ping(plugin, false);
            plugin.prepare_for_save(false);
        }

        let mut out = String::with_capacity(4096);
        out.push_str(PROJECT_HEADER);
        // Writing into a String never fails.
        let _ = self.write_settings(&mut out);

        for plugin in &plugins {
            let state = plugin.get_state_save(false);
            out.push('\n');
            let name = plugin.name();
            if !name.is_empty() {
                let _ = writeln!(out, " <!-- {} -->", escape(&name));
            }
            out.push_str(" <Plugin>\n");
            out.push_str(&state.dump_xml());
            out.push_str(" </Plugin>\n");
        }

        for plugin in &plugins {
            set_ping(plugin, true);
        }

        if self.process_mode() == ProcessMode::Patchbay {
            let _ = self.write_patchbay(&mut out, "Patchbay", false);
        }
        let _ = self.write_patchbay(&mut out, "ExternalPatchbay", true);

        out.push_str("</CARLA-PROJECT>\n");
        out
    }

    fn write_settings(&self, out: &mut String) -> std::fmt::Result {
        let options = self.options();
        out.push_str(" <EngineSettings>\n");
        writeln!(out, "  <ForceStereo>{}</ForceStereo>", bool_str(options.force_stereo))?;
        writeln!(
            out,
            "  <PreferPluginBridges>{}</PreferPluginBridges>",
            bool_str(options.prefer_plugin_bridges)
        )?;
        writeln!(
            out,
            "  <PreferUiBridges>{}</PreferUiBridges>",
            bool_str(options.prefer_ui_bridges)
        )?;
        writeln!(
            out,
            "  <UIsAlwaysOnTop>{}</UIsAlwaysOnTop>",
            bool_str(options.uis_always_on_top)
        )?;
        writeln!(out, "  <MaxParameters>{}</MaxParameters>", options.max_parameters)?;
        writeln!(
            out,
            "  <UIBridgesTimeout>{}</UIBridgesTimeout>",
            options.ui_bridges_timeout
        )?;
        out.push_str(" </EngineSettings>\n");

        if self.time_info().bbt.is_some() {
            out.push_str("\n <Transport>\n");
            writeln!(out, "  <BeatsPerMinute>{}</BeatsPerMinute>", self.bpm())?;
            out.push_str(" </Transport>\n");
        }
        Ok(())
    }

    fn write_patchbay(&self, out: &mut String, tag: &str, external: bool) -> std::fmt::Result {
        let graph = self.patchbay_graph(external);
        let connections = graph.connection_names();
        let positions: Vec<_> = graph
            .groups()
            .iter()
            .filter_map(|group| group.position.map(|pos| (group.name.clone(), pos)))
            .collect();
        if connections.is_empty() && positions.is_empty() {
            return Ok(());
        }

        writeln!(out, "\n <{tag}>")?;
        for (source, target) in &connections {
            out.push_str("  <Connection>\n");
            writeln!(out, "   <Source>{}</Source>", escape(source))?;
            writeln!(out, "   <Target>{}</Target>", escape(target))?;
            out.push_str("  </Connection>\n");
        }
        if !positions.is_empty() {
            out.push_str("  <Positions>\n");
            for (name, pos) in &positions {
                writeln!(
                    out,
                    "   <Position x1=\"{}\" y1=\"{}\" x2=\"{}\" y2=\"{}\">",
                    pos.x1, pos.y1, pos.x2, pos.y2
                )?;
                writeln!(out, "    <Name>{}</Name>", escape(name))?;
                out.push_str("   </Position>\n");
            }
            out.push_str("  </Positions>\n");
        }
        writeln!(out, " </{tag}>")
    }

    // ------------------------------------------------------------------
    // Load

    /// Load a project or preset file; its folder becomes the current project folder.
    pub fn load_project(&self, path: &Path) -> Result<()> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => return self.record(Err(Error::from(e))),
        };
        self.project_folder.set(path.parent().map(Path::to_path_buf));
        tracing::info!("Loading project {}", path.display());
        self.load_project_from_str(&source)
    }

    pub fn load_project_from_str(&self, source: &str) -> Result<()> {
        let result = XmlNode::parse(source).and_then(|root| self.load_project_xml(&root));
        self.record(result)
    }

    fn load_checkpoint(&self) -> Result<ControlFlow<()>> {
        self.callback(CallbackEvent::new(EngineCallbackOpcode::Idle, 0));
        if self.is_about_to_close() {
            return Ok(ControlFlow::Break(()));
        }
        if self.was_action_canceled() {
            tracing::info!("Project load canceled");
            return Err(Error::Canceled);
        }
        Ok(ControlFlow::Continue(()))
    }

    fn load_project_xml(&self, root: &XmlNode) -> Result<()> {
        let is_preset = root.is("CARLA-PRESET");
        if !(root.is("CARLA-PROJECT") || is_preset) {
            self.callback(CallbackEvent::new(EngineCallbackOpcode::ProjectLoadFinished, 0));
            return Err(Error::InvalidProject);
        }

        self.set_action_canceled(false);
        self.callback(
            CallbackEvent::new(EngineCallbackOpcode::CancelableAction, 0)
                .values(1, 0, 0)
                .text(LOADING_PROJECT),
        );
        self.loading_project.store(true, Ordering::Release);
        let _loading = LoadingGuard(self);

        if self.load_checkpoint()?.is_break() {
            return Ok(());
        }

        if !is_preset {
            if let Some(settings) = root.child("EngineSettings") {
                self.load_settings(settings);
                if self.load_checkpoint()?.is_break() {
                    return Ok(());
                }
            }

            if let Some(bpm) = root
                .child("Transport")
                .and_then(|transport| transport.child_text("BeatsPerMinute"))
            {
                let bpm: f64 = bpm.parse().unwrap_or(0.0);
                if (20.0..400.0).contains(&bpm) {
                    self.set_bpm(bpm);
                }
                if self.load_checkpoint()?.is_break() {
                    return Ok(());
                }
            }
        }

        let elements: Vec<&XmlNode> = if is_preset {
            vec![root]
        } else {
            root.children.iter().filter(|child| child.name == "Plugin").collect()
        };
        for element in elements {
            let mut state = StateSave::default();
            state.fill_from_xml(element);
            if self.load_checkpoint()?.is_break() {
                return Ok(());
            }
            if self.load_plugin_state(&state, is_preset)?.is_break() {
                return Ok(());
            }
        }

        if is_preset {
            self.finish_loading();
            return Ok(());
        }

        for plugin in self.plugins() {
            if plugin.is_enabled() {
                set_ping(&plugin, true);
            }
        }
        if self.load_checkpoint()?.is_break() {
            return Ok(());
        }

        let patchbay_mode = self.process_mode() == ProcessMode::Patchbay;
        if patchbay_mode {
            if let Some(section) = root.child("Patchbay") {
                self.restore_section(section, false);
                if self.load_checkpoint()?.is_break() {
                    return Ok(());
                }
            }
        }

        for section in &root.children {
            let external = match section.name.as_str() {
                "Patchbay" => !patchbay_mode,
                "ExternalPatchbay" => true,
                _ => false,
            };
            if external {
                self.restore_section(section, true);
            }
        }

        self.finish_loading();
        Ok(())
    }

    fn finish_loading(&self) {
        tracing::info!("Project loaded with {} plugins", self.current_plugin_count());
        self.callback(CallbackEvent::new(EngineCallbackOpcode::ProjectLoadFinished, 0));
        self.callback(
            CallbackEvent::new(EngineCallbackOpcode::CancelableAction, 0).text(LOADING_PROJECT),
        );
    }

    fn load_settings(&self, settings: &XmlNode) {
        for setting in &settings.children {
            let text = setting.text();
            let flag = i32::from(text == "true");
            let (option, value) = match setting.name.as_str() {
                "ForceStereo" => (EngineOption::ForceStereo, flag),
                "PreferPluginBridges" => (EngineOption::PreferPluginBridges, flag),
                "PreferUiBridges" => (EngineOption::PreferUiBridges, flag),
                "UIsAlwaysOnTop" => (EngineOption::UisAlwaysOnTop, flag),
                "MaxParameters" => (EngineOption::MaxParameters, text.parse().unwrap_or(0)),
                "UIBridgesTimeout" => (EngineOption::UiBridgesTimeout, text.parse().unwrap_or(0)),
                "LADSPA_PATH" | "DSSI_PATH" | "LV2_PATH" | "VST2_PATH" | "VST3_PATH"
                | "AU_PATH" | "SF2_PATH" | "SFZ_PATH" | "GIG_PATH" => continue,
                other => {
                    tracing::warn!("Unhandled option '{}'", other);
                    continue;
                }
            };
            if let Err(e) = self.set_option(option, value, None) {
                tracing::warn!("Ignoring project setting '{}': {}", setting.name, e);
            }
        }
    }

    /// Re-locate a binary saved on another machine.
    fn resolve_binary(&self, state: &mut StateSave) {
        let relocatable = matches!(
            state.plugin_type,
            PluginType::Ladspa
                | PluginType::Dssi
                | PluginType::Vst2
                | PluginType::Vst3
                | PluginType::Sf2
                | PluginType::Sfz
        );
        if !relocatable || state.binary.is_empty() {
            return;
        }
        let binary = Path::new(&state.binary);
        if binary.is_absolute() && binary.exists() {
            return;
        }

        let options = self.options();
        let Some(search_path) = options.plugin_paths.get(state.plugin_type).filter(|p| !p.is_empty())
        else {
            return;
        };
        tracing::warn!(
            "Plugin binary '{}' doesn't exist on this filesystem, looking for it",
            state.binary
        );
        let found = find_binary_in_paths(search_path, &state.binary).or_else(|| {
            let env_path = std::env::var(search_path_env(state.plugin_type)?).ok()?;
            find_binary_in_paths(&env_path, &state.binary)
        });
        match found {
            Some(path) => state.binary = path.to_string_lossy().into_owned(),
            None => tracing::warn!("Could not find plugin binary '{}'", state.binary),
        }
    }

    fn load_plugin_state(&self, state: &StateSave, is_preset: bool) -> Result<ControlFlow<()>> {
        if state.plugin_type == PluginType::None {
            tracing::warn!("Skipping plugin '{}' without a type", state.name);
            return Ok(ControlFlow::Continue(()));
        }
        let mut state = state.clone();
        self.resolve_binary(&mut state);

        let binary_type = match state.plugin_type {
            PluginType::Ladspa | PluginType::Dssi | PluginType::Lv2 | PluginType::Vst2 => {
                binary_type_from_file(Path::new(&state.binary))
            }
            _ => BinaryType::native(),
        };
        let init = PluginInit {
            binary_type,
            plugin_type: state.plugin_type,
            filename: state.binary.clone(),
            name: state.name.clone(),
            label: state.label.clone(),
            unique_id: state.unique_id,
            options: Some(PluginOptions::from_bits(state.options)),
        };

        let created = match self.create_plugin(init) {
            Ok(created) => created,
            Err(e) => {
                tracing::error!("Failed to load a plugin '{}', error was: {}", state.name, e);
                self.set_last_error(&e.to_string());
                return Ok(ControlFlow::Continue(()));
            }
        };

        if self.load_checkpoint()?.is_break() {
            return Ok(ControlFlow::Break(()));
        }

        match created {
            Created::Replaced(id) => {
                if let Some(plugin) = self.get_plugin_unchecked(id) {
                    plugin.load_state_save(&state);
                }
            }
            Created::New(plugin) => {
                if !is_preset {
                    set_ping(&plugin, false);
                }
                plugin.load_state_save(&state);
                if let Err(e) = self.register_plugin(plugin, false) {
                    tracing::error!("Failed to register plugin '{}': {}", state.name, e);
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn restore_section(&self, section: &XmlNode, external: bool) {
        for (source, target) in connections_of(section) {
            if let Err(e) = self.restore_patchbay_connection(external, &source, &target) {
                tracing::warn!("Failed to restore connection {} -> {}: {}", source, target, e);
            }
        }
        for (name, position) in positions_of(section) {
            let group = self
                .patchbay_graph(external)
                .group_by_name(&name)
                .map(|group| group.id);
            if let Some(group) = group {
                if let Err(e) = self.patchbay_set_group_pos(external, group, position) {
                    tracing::warn!("Failed to restore position of '{}': {}", name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::PluginFactory;
    use crate::test_support::StubPlugin;
    use cadenza_core::EngineCallback;
    use parking_lot::Mutex;
    use std::sync::{OnceLock, Weak};
    use tempfile::TempDir;

    fn factory() -> PluginFactory {
        let factory = PluginFactory::new();
        factory.register(PluginType::Internal, |id, init, engine| {
            Ok(StubPlugin::with_init(id, init, engine))
        });
        factory
    }

    fn stub(name: &str) -> PluginInit {
        PluginInit {
            binary_type: BinaryType::native(),
            plugin_type: PluginType::Internal,
            name: name.to_string(),
            label: "stub".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_writes_header_and_settings() {
        let engine = Engine::new(Default::default(), factory());
        engine.add_plugin(stub("Gain")).unwrap();
        let xml = engine.save_project_to_string();

        assert!(xml.starts_with(PROJECT_HEADER));
        assert!(xml.contains("  <ForceStereo>false</ForceStereo>\n"));
        assert!(xml.contains("  <MaxParameters>200</MaxParameters>\n"));
        assert!(xml.contains("  <BeatsPerMinute>120</BeatsPerMinute>\n"));
        assert!(xml.contains(" <!-- Gain -->\n <Plugin>\n  <Info>\n"));
        assert!(xml.ends_with("</CARLA-PROJECT>\n"));
    }

    #[test]
    fn test_load_rejects_unknown_root() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: EngineCallback = Arc::new(move |event: &CallbackEvent| {
            sink.lock().push(event.opcode);
        });
        let engine = Engine::builder().factory(factory()).callback(callback).build();

        assert!(matches!(
            engine.load_project_from_str("<SOMETHING-ELSE/>"),
            Err(Error::InvalidProject)
        ));
        assert_eq!(engine.last_error(), "Not a valid Carla project or preset file");
        assert_eq!(*log.lock(), vec![EngineCallbackOpcode::ProjectLoadFinished]);
        assert!(!engine.is_loading_project());
    }

    #[test]
    fn test_round_trip_restores_plugins_and_connections() {
        let engine = Engine::new(Default::default(), factory());
        engine.add_plugin(stub("a")).unwrap();
        engine.add_plugin(stub("b")).unwrap();
        engine.get_plugin(1).unwrap().set_volume(0.5, false);
        engine
            .restore_patchbay_connection(false, "a:out_1", "b:in_1")
            .unwrap();
        engine.set_bpm(90.0);
        let xml = engine.save_project_to_string();

        let loaded = Engine::new(Default::default(), factory());
        loaded.load_project_from_str(&xml).unwrap();

        assert_eq!(loaded.current_plugin_count(), 2);
        assert_eq!(loaded.get_plugin(0).unwrap().name(), "a");
        assert_eq!(loaded.get_plugin(1).unwrap().common().post_proc.volume.get(), 0.5);
        assert_eq!(
            loaded.patchbay_connections(false),
            vec![("a:out_1".to_string(), "b:in_1".to_string())]
        );
        assert_eq!(loaded.bpm(), 90.0);
        assert!(!loaded.is_loading_project());
    }

    #[test]
    fn test_out_of_range_bpm_is_ignored() {
        let engine = Engine::new(Default::default(), factory());
        let xml = format!(
            "{PROJECT_HEADER} <Transport>\n  <BeatsPerMinute>800</BeatsPerMinute>\n </Transport>\n</CARLA-PROJECT>\n"
        );
        engine.load_project_from_str(&xml).unwrap();
        assert_eq!(engine.bpm(), 120.0);
    }

    #[test]
    fn test_invalid_setting_goes_through_validation() {
        let engine = Engine::new(Default::default(), factory());
        let xml = format!(
            "{PROJECT_HEADER} <EngineSettings>\n  <MaxParameters>-5</MaxParameters>\n  <ForceStereo>true</ForceStereo>\n  <Bogus>1</Bogus>\n </EngineSettings>\n</CARLA-PROJECT>\n"
        );
        engine.load_project_from_str(&xml).unwrap();
        let options = engine.options();
        assert_eq!(options.max_parameters, 200);
        assert!(options.force_stereo);
    }

    #[test]
    fn test_preset_loads_single_plugin() {
        let source = Engine::new(Default::default(), factory());
        source.add_plugin(stub("Solo")).unwrap();
        let state = source.get_plugin(0).unwrap().get_state_save(true);
        let preset = format!(
            "<?xml version='1.0' encoding='UTF-8'?>\n<!DOCTYPE CARLA-PRESET>\n<CARLA-PRESET VERSION='2.0'>\n{}</CARLA-PRESET>\n",
            state.dump_xml()
        );

        let engine = Engine::new(Default::default(), factory());
        engine.load_project_from_str(&preset).unwrap();
        assert_eq!(engine.current_plugin_count(), 1);
        assert_eq!(engine.get_plugin(0).unwrap().name(), "Solo");
    }

    #[test]
    fn test_cancel_stops_adding_plugins() {
        let handle: Arc<OnceLock<Weak<Engine>>> = Arc::new(OnceLock::new());
        let weak = Arc::clone(&handle);
        let callback: EngineCallback = Arc::new(move |event: &CallbackEvent| {
            if event.opcode == EngineCallbackOpcode::PluginAdded {
                if let Some(engine) = weak.get().and_then(Weak::upgrade) {
                    engine.set_action_canceled(true);
                }
            }
        });
        let engine = Engine::builder().factory(factory()).callback(callback).build();
        handle.set(Arc::downgrade(&engine)).unwrap();

        let source = Engine::new(Default::default(), factory());
        for name in ["a", "b", "c"] {
            source.add_plugin(stub(name)).unwrap();
        }
        let xml = source.save_project_to_string();

        assert!(matches!(engine.load_project_from_str(&xml), Err(Error::Canceled)));
        assert_eq!(engine.last_error(), "Project load canceled");
        assert_eq!(engine.current_plugin_count(), 1);
        assert!(!engine.is_loading_project());
    }

    #[test]
    fn test_save_and_load_file_sets_project_folder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.carxp");
        let engine = Engine::new(Default::default(), factory());
        engine.add_plugin(stub("a")).unwrap();
        engine.save_project(&path).unwrap();
        assert_eq!(engine.project_folder().get().as_deref(), Some(dir.path()));

        let loaded = Engine::new(Default::default(), factory());
        loaded.load_project(&path).unwrap();
        assert_eq!(loaded.current_plugin_count(), 1);
        assert!(loaded.load_project(&dir.path().join("missing.carxp")).is_err());
    }

    #[test]
    fn test_binary_type_from_header() {
        let dir = TempDir::new().unwrap();
        let elf64 = dir.path().join("plugin.so");
        let mut header = vec![0x7f, b'E', b'L', b'F', 2];
        header.resize(64, 0);
        std::fs::write(&elf64, &header).unwrap();
        assert_eq!(binary_type_from_file(&elf64), BinaryType::Posix64);

        let pe32 = dir.path().join("plugin.dll");
        let mut pe = vec![0u8; 0x80];
        pe[0] = b'M';
        pe[1] = b'Z';
        pe[0x3C] = 0x40;
        pe[0x40..0x44].copy_from_slice(b"PE\0\0");
        pe[0x44..0x46].copy_from_slice(&0x014Cu16.to_le_bytes());
        std::fs::write(&pe32, &pe).unwrap();
        assert_eq!(binary_type_from_file(&pe32), BinaryType::Win32);

        assert_eq!(
            binary_type_from_file(&dir.path().join("missing")),
            BinaryType::native()
        );
    }

    #[test]
    fn test_find_binary_searches_subdirectories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("vendor").join("x64");
        std::fs::create_dir_all(&nested).unwrap();
        let native = format!("reverb.{}", std::env::consts::DLL_EXTENSION);
        std::fs::write(nested.join(&native), b"").unwrap();

        let search = dir.path().to_string_lossy().into_owned();
        assert_eq!(
            find_binary_in_paths(&search, &format!("/old/machine/{native}")),
            Some(nested.join(&native))
        );
        if std::env::consts::DLL_EXTENSION != "dll" {
            assert_eq!(
                find_binary_in_paths(&search, "C:\\Plugins\\reverb.dll"),
                Some(nested.join(&native))
            );
        }
        assert_eq!(find_binary_in_paths(&search, "missing.so"), None);
    }
}
