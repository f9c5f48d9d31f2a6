//! Bridged LV2 UIs: launching, syncing and relaying messages from `ui_idle()`.

use super::atom::{atom_bytes, AtomRef};
use super::descriptor::{Lv2ParameterKind, Lv2UiType};
use super::plugin::Lv2Plugin;
use super::urid::{URID_ATOM_PATH, URID_ATOM_STRING, URID_MIDI_EVENT};
use crate::custom_data::{self, CustomData};
use crate::plugin::Plugin;
use crate::protocol::UiMessage;
use crate::ui_bridge::{BridgeState, UiBridge};
use cadenza_core::events::{MIDI_STATUS_NOTE_OFF, MIDI_STATUS_NOTE_ON};
use cadenza_core::{EngineCallbackOpcode, FileCallbackOpcode};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Prefix of the UI bridge executables, followed by the toolkit suffix.
pub const UI_BRIDGE_PREFIX: &str = "cadenza-bridge-lv2-";

impl Lv2Plugin {
    /// Use `bridge` as this plugin's UI and send it the current state.
    pub fn attach_ui_bridge(&self, bridge: UiBridge) {
        let sync = self.ui_sync_messages();
        if let Err(err) = bridge.send_all(&sync) {
            tracing::warn!("Could not sync UI for '{}': {}", self.info.uri, err);
        }
        let mut ui = self.ui.lock();
        ui.sent_outputs.clear();
        ui.bridge = Some(bridge);
        ui.visible = true;
        self.ui_active.store(true, Ordering::Release);
    }

    pub fn is_ui_visible(&self) -> bool {
        self.ui.lock().visible
    }

    /// URID table, values, programs and finally `show`.
    fn ui_sync_messages(&self) -> Vec<UiMessage> {
        let mut messages: Vec<UiMessage> = self
            .urids
            .entries_from(1)
            .into_iter()
            .map(|(urid, uri)| UiMessage::Urid { urid, uri })
            .collect();
        messages.push(UiMessage::UiTitle(format!("{} (GUI)", self.common.name())));

        let count = self.common.parameter_count();
        for index in 0..count {
            if let Some(message) = self.parameter_message(index, self.parameter_value(index)) {
                messages.push(message);
            }
        }

        let program = self.common.programs.read().current;
        if let Ok(program) = u32::try_from(program) {
            messages.push(UiMessage::Program(program));
        }
        if let Some(current) = self.common.midi_programs.read().current().cloned() {
            messages.push(UiMessage::MidiProgram {
                bank: current.bank,
                program: current.program,
            });
        }
        messages.push(UiMessage::Show);
        messages
    }

    /// Port values go by port index, LV2 parameters by URI.
    fn parameter_message(&self, index: u32, value: f32) -> Option<UiMessage> {
        let slot = self.control_slot(index)?;
        match self.lv2_parameter_at(slot, self.info.ports.len()) {
            Some(param) => Some(UiMessage::ParameterControl {
                uri: param.uri.clone(),
                value,
            }),
            None => Some(UiMessage::Control {
                index: slot as u32,
                value,
            }),
        }
    }

    pub(super) fn ui_send(&self, message: &UiMessage) {
        let ui = self.ui.lock();
        if let Some(bridge) = ui.bridge.as_ref() {
            if let Err(err) = bridge.send(message) {
                tracing::debug!("UI message for '{}' not sent: {}", self.info.uri, err);
            }
        }
    }

    pub(super) fn ui_send_parameter(&self, index: u32, value: f32) {
        if let Some(message) = self.parameter_message(index, value) {
            self.ui_send(&message);
        }
    }

    pub(super) fn ui_send_atom(&self, port: u32, atom: &[u8]) {
        self.ui_send(&UiMessage::Atom {
            index: port,
            atom: atom.to_vec(),
        });
    }

    fn report_ui_state(&self, state: i32, message: Option<&str>) {
        self.common
            .callback(EngineCallbackOpcode::UiStateChanged, state, 0, 0, 0.0, message);
    }

    fn close_ui(&self) {
        let bridge = {
            let mut ui = self.ui.lock();
            ui.visible = false;
            ui.bridge.take()
        };
        self.ui_active.store(false, Ordering::Release);
        if let Some(mut bridge) = bridge {
            bridge.close();
        }
    }

    pub(super) fn show_ui(&self, show: bool) {
        if !show {
            self.close_ui();
            return;
        }

        {
            let ui = self.ui.lock();
            if let Some(bridge) = ui.bridge.as_ref() {
                if let Err(err) = bridge.send_all(&[UiMessage::Show, UiMessage::Focus]) {
                    tracing::debug!("UI show for '{}' not sent: {}", self.info.uri, err);
                }
                return;
            }
        }

        let Some(ui) = self
            .info
            .uis
            .iter()
            .find(|ui| ui.ui_type != Lv2UiType::Unknown)
            .or_else(|| self.info.uis.first())
        else {
            self.report_ui_state(-1, Some("plugin has no UI"));
            return;
        };

        let options = self.common.engine_options();
        let Some(binary_dir) = options.binary_dir.clone() else {
            self.report_ui_state(-1, Some("binary directory is not set"));
            return;
        };
        let executable =
            binary_dir.join(format!("{}{}", UI_BRIDGE_PREFIX, ui.ui_type.bridge_suffix()));
        let args = vec![
            self.info.uri.clone(),
            ui.uri.clone(),
            ui.bundle.clone(),
            ui.binary.clone(),
            format!("{} (GUI)", self.common.name()),
        ];
        let timeout = Duration::from_millis(u64::from(options.ui_bridges_timeout));

        match UiBridge::spawn(&executable, &args, timeout) {
            Ok(bridge) => self.attach_ui_bridge(bridge),
            Err(err) => {
                tracing::error!("Could not start UI for '{}': {}", self.info.uri, err);
                self.report_ui_state(-1, Some(&err.to_string()));
            }
        }
    }

    pub(super) fn idle_ui(&self) {
        let mut incoming = Vec::new();
        {
            let ui = self.ui.lock();
            let Some(bridge) = ui.bridge.as_ref() else {
                drop(ui);
                self.ui_out.lock().clear();
                return;
            };
            match bridge.state() {
                BridgeState::TimedOut => {
                    drop(ui);
                    tracing::warn!("UI bridge for '{}' timed out", self.info.uri);
                    self.close_ui();
                    self.report_ui_state(-1, Some("the UI bridge did not respond in time"));
                    return;
                }
                BridgeState::Closed => {
                    drop(ui);
                    self.close_ui();
                    self.report_ui_state(0, Some("the UI exited"));
                    return;
                }
                BridgeState::Starting | BridgeState::Running => {}
            }
            while let Some(message) = bridge.try_recv() {
                incoming.push(message);
            }
        }

        for message in incoming {
            if !self.handle_ui_message(message) {
                self.close_ui();
                self.report_ui_state(0, Some("the UI exited"));
                return;
            }
        }

        self.send_output_changes();
        self.forward_output_atoms();
    }

    /// Output parameter values the UI has not seen yet.
    fn send_output_changes(&self) {
        let params = self.common.parameters.read().clone();
        let mut updates = Vec::new();
        {
            let mut ui = self.ui.lock();
            if ui.sent_outputs.len() != params.len() {
                ui.sent_outputs = vec![f32::NAN; params.len()];
            }
            for (index, param) in params.iter().enumerate() {
                if !param.is_output() {
                    continue;
                }
                let value = self.parameter_value(index as u32);
                if ui.sent_outputs[index] != value {
                    ui.sent_outputs[index] = value;
                    updates.push((index as u32, value));
                }
            }
        }
        for (index, value) in updates {
            self.ui_send_parameter(index, value);
        }
    }

    fn forward_output_atoms(&self) {
        let mut atoms = Vec::new();
        {
            let mut ring = self.ui_out.lock();
            while let Some(port) = ring.read_u32() {
                let Some(size) = ring.read_u32() else {
                    ring.clear();
                    break;
                };
                let mut atom = vec![0; size as usize];
                if !ring.read_bytes(&mut atom) {
                    ring.clear();
                    break;
                }
                atoms.push(UiMessage::Atom { index: port, atom });
            }
        }
        if atoms.is_empty() {
            return;
        }
        let ui = self.ui.lock();
        if let Some(bridge) = ui.bridge.as_ref() {
            if let Err(err) = bridge.send_all(&atoms) {
                tracing::debug!("UI atoms for '{}' not sent: {}", self.info.uri, err);
            }
        }
    }

    fn parameter_for_slot(&self, slot: usize) -> Option<u32> {
        self.common
            .parameters
            .read()
            .iter()
            .position(|p| p.data.rindex == slot as i32)
            .map(|index| index as u32)
    }

    /// Returns `false` once the UI says it is leaving.
    fn handle_ui_message(&self, message: UiMessage) -> bool {
        match message {
            UiMessage::Control { index, value } => {
                if let Some(param) = self.parameter_for_slot(index as usize) {
                    self.set_parameter_value(param, value, false, true);
                }
            }
            UiMessage::ParameterControl { uri, value } => {
                let slot = self
                    .info
                    .parameters
                    .iter()
                    .position(|p| p.uri == uri)
                    .map(|position| self.info.ports.len() + position);
                if let Some(param) = slot.and_then(|slot| self.parameter_for_slot(slot)) {
                    self.set_parameter_value(param, value, false, true);
                }
            }
            UiMessage::Atom { index, atom } => {
                self.remember_ui_property(&atom);
                self.queue_atom(index, &atom);
            }
            UiMessage::Program(index) => {
                self.set_program(index as i32, false, true, false);
            }
            UiMessage::MidiProgram { bank, program } => {
                self.set_midi_program_by_id(bank, program, false, true);
            }
            UiMessage::Urid { urid, uri } => {
                if !self.urids.handle_ui_map(urid, &uri) {
                    tracing::warn!("Rejected URID {} '{}' from the UI", urid, uri);
                }
            }
            UiMessage::ReloadPrograms(_) => self.reload_programs(false),
            UiMessage::RequestValue { key, value_type } => self.request_value(key, value_type),
            UiMessage::Note {
                on,
                channel,
                note,
                velocity,
            } => self.queue_ui_note(on, channel, note, velocity),
            UiMessage::Exiting => return false,
            UiMessage::UiTitle(_) | UiMessage::Show | UiMessage::Focus | UiMessage::Hide => {}
        }
        true
    }

    /// Keep string and path properties set by the UI so they are saved.
    fn remember_ui_property(&self, atom: &[u8]) {
        let Some((property, value)) = AtomRef::parse(atom).and_then(|a| a.parse_patch_set()) else {
            return;
        };
        let (Some(uri), Some(text)) = (self.urids.unmap(property), value.as_str()) else {
            return;
        };
        let Some(param) = self.info.parameters.iter().find(|p| p.uri == uri) else {
            return;
        };
        let data_type = if param.kind == Lv2ParameterKind::Path {
            URID_ATOM_PATH
        } else {
            URID_ATOM_STRING
        };
        let Some(type_uri) = self.urids.unmap(data_type) else {
            return;
        };
        custom_data::upsert(
            &mut self.common.custom_data.write(),
            CustomData::new(type_uri, uri, text),
        );
    }

    /// The UI asked the host to pick a file for a path property.
    fn request_value(&self, key: u32, value_type: u32) {
        if value_type != URID_ATOM_PATH {
            tracing::debug!("UI requested a value of unsupported type {}", value_type);
            return;
        }
        let Some(uri) = self.urids.unmap(key) else {
            return;
        };
        let Some(param) = self.info.parameters.iter().find(|p| p.uri == uri) else {
            return;
        };
        let Some(path) = self.common.callbacks().run_file_callback(
            FileCallbackOpcode::Open,
            false,
            &param.label,
            &param.file_types,
        ) else {
            return;
        };
        let Some(type_uri) = self.urids.unmap(URID_ATOM_PATH) else {
            return;
        };
        self.set_custom_data(&type_uri, &uri, &path, true);
    }

    fn queue_ui_note(&self, on: bool, channel: u8, note: u8, velocity: u8) {
        let port = {
            let rt = self.rt.lock();
            let layout = &rt.layout;
            layout
                .midi_in
                .first()
                .and_then(|&i| layout.events_in.get(i))
                .map(|event_port| event_port.port)
        };
        let Some(port) = port else {
            return;
        };
        let status = if on { MIDI_STATUS_NOTE_ON } else { MIDI_STATUS_NOTE_OFF };
        let data = [status | (channel & 0x0F), note & 0x7F, velocity & 0x7F];
        self.queue_atom(port, &atom_bytes(URID_MIDI_EVENT, &data));
    }
}
