//! Patchbay graph: named groups of ports and the connections between them.
//!
//! The internal graph has one group per plugin plus the system audio and MIDI
//! groups; it decides audio routing in patchbay mode. The external graph
//! describes how the engine itself is wired to the driver's hardware ports.
//!
//! Full port names are `<group>:<port>`. Group names are plugin names, which
//! never contain `:`.

use cadenza_core::{Error, Result};
use cadenza_plugin::PluginPorts;

pub type GroupId = u32;
pub type PortId = u32;
pub type ConnectionId = u32;

pub const GROUP_AUDIO_IN: GroupId = 1;
pub const GROUP_AUDIO_OUT: GroupId = 2;
pub const GROUP_MIDI_IN: GroupId = 3;
pub const GROUP_MIDI_OUT: GroupId = 4;
/// The engine's own client in the external graph.
pub const GROUP_ENGINE: GroupId = 5;

const FIRST_PLUGIN_GROUP: GroupId = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Audio,
    Cv,
    Event,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchbayPort {
    pub id: PortId,
    pub name: String,
    pub kind: PortKind,
    pub is_input: bool,
    /// Position among the group's ports of the same kind and direction.
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    AudioIn,
    AudioOut,
    MidiIn,
    MidiOut,
    Engine,
    Plugin,
}

/// Canvas rectangle of a group, as stored in projects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupPosition {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchbayGroup {
    pub id: GroupId,
    pub name: String,
    pub kind: GroupKind,
    pub ports: Vec<PatchbayPort>,
    pub position: Option<GroupPosition>,
}

impl PatchbayGroup {
    fn new(id: GroupId, name: &str, kind: GroupKind) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            ports: Vec::new(),
            position: None,
        }
    }

    fn add_port(&mut self, name: &str, kind: PortKind, is_input: bool) {
        let index = self
            .ports
            .iter()
            .filter(|p| p.kind == kind && p.is_input == is_input)
            .count() as u32;
        self.ports.push(PatchbayPort {
            id: self.ports.len() as PortId,
            name: name.to_string(),
            kind,
            is_input,
            index,
        });
    }

    fn set_plugin_ports(&mut self, ports: &PluginPorts) {
        self.ports.clear();
        let sets = [
            (&ports.audio_in, PortKind::Audio, true),
            (&ports.audio_out, PortKind::Audio, false),
            (&ports.cv_in, PortKind::Cv, true),
            (&ports.cv_out, PortKind::Cv, false),
            (&ports.event_in, PortKind::Event, true),
            (&ports.event_out, PortKind::Event, false),
        ];
        for (names, kind, is_input) in sets {
            for name in names {
                self.add_port(name, kind, is_input);
            }
        }
    }

    pub fn port(&self, id: PortId) -> Option<&PatchbayPort> {
        self.ports.get(id as usize)
    }

    pub fn port_by_name(&self, name: &str) -> Option<&PatchbayPort> {
        self.ports.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchbayConnection {
    pub id: ConnectionId,
    pub group_a: GroupId,
    pub port_a: PortId,
    pub group_b: GroupId,
    pub port_b: PortId,
}

impl PatchbayConnection {
    /// Text form used in connection callbacks.
    pub fn describe(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.group_a, self.port_a, self.group_b, self.port_b
        )
    }
}

/// Where a routed buffer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Capture(usize),
    Plugin { plugin: usize, port: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    MidiIn,
    Plugin(usize),
}

/// Snapshot of the internal graph read by the audio thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routing {
    /// `[plugin][audio input]` sources.
    pub plugin_audio: Vec<Vec<Vec<AudioSource>>>,
    /// Event sources feeding each plugin's first event input.
    pub plugin_events: Vec<Vec<EventSource>>,
    /// Sources of each system playback channel.
    pub playback: Vec<Vec<AudioSource>>,
    pub midi_out: Vec<EventSource>,
}

#[derive(Debug, Clone)]
pub struct PatchbayGraph {
    groups: Vec<PatchbayGroup>,
    /// Group of each plugin, indexed by plugin id.
    plugin_groups: Vec<GroupId>,
    connections: Vec<PatchbayConnection>,
    next_group_id: GroupId,
    next_connection_id: ConnectionId,
}

impl PatchbayGraph {
    /// Graph of plugins between the system capture and playback ports.
    pub fn internal(audio_ins: u32, audio_outs: u32) -> Self {
        let mut graph = Self::empty();
        graph.groups.push(Self::system_group(
            GROUP_AUDIO_IN,
            "Audio Input",
            GroupKind::AudioIn,
            audio_ins,
        ));
        graph.groups.push(Self::system_group(
            GROUP_AUDIO_OUT,
            "Audio Output",
            GroupKind::AudioOut,
            audio_outs,
        ));
        graph.groups.push(Self::system_group(GROUP_MIDI_IN, "Midi Input", GroupKind::MidiIn, 0));
        graph.groups.push(Self::system_group(GROUP_MIDI_OUT, "Midi Output", GroupKind::MidiOut, 0));
        graph
    }

    /// Graph of the engine client and the driver's hardware ports.
    pub fn external(audio_ins: u32, audio_outs: u32) -> Self {
        let mut graph = Self::internal(audio_ins, audio_outs);
        let mut engine = PatchbayGroup::new(GROUP_ENGINE, "Cadenza", GroupKind::Engine);
        engine.add_port("audio-in1", PortKind::Audio, true);
        engine.add_port("audio-in2", PortKind::Audio, true);
        engine.add_port("audio-out1", PortKind::Audio, false);
        engine.add_port("audio-out2", PortKind::Audio, false);
        engine.add_port("midi-in", PortKind::Event, true);
        engine.add_port("midi-out", PortKind::Event, false);
        graph.groups.push(engine);
        graph
    }

    fn empty() -> Self {
        Self {
            groups: Vec::new(),
            plugin_groups: Vec::new(),
            connections: Vec::new(),
            next_group_id: FIRST_PLUGIN_GROUP,
            next_connection_id: 1,
        }
    }

    fn system_group(id: GroupId, name: &str, kind: GroupKind, channels: u32) -> PatchbayGroup {
        let mut group = PatchbayGroup::new(id, name, kind);
        match kind {
            GroupKind::AudioIn => {
                for i in 1..=channels {
                    group.add_port(&format!("capture_{i}"), PortKind::Audio, false);
                }
            }
            GroupKind::AudioOut => {
                for i in 1..=channels {
                    group.add_port(&format!("playback_{i}"), PortKind::Audio, true);
                }
            }
            GroupKind::MidiIn => group.add_port("capture", PortKind::Event, false),
            GroupKind::MidiOut => group.add_port("playback", PortKind::Event, true),
            GroupKind::Engine | GroupKind::Plugin => {}
        }
        group
    }

    pub fn groups(&self) -> &[PatchbayGroup] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&PatchbayGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    fn group_mut(&mut self, id: GroupId) -> Option<&mut PatchbayGroup> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&PatchbayGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn plugin_group(&self, plugin_id: u32) -> Option<GroupId> {
        self.plugin_groups.get(plugin_id as usize).copied()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugin_groups.len()
    }

    fn plugin_of_group(&self, group: GroupId) -> Option<usize> {
        self.plugin_groups.iter().position(|&g| g == group)
    }

    pub fn connections(&self) -> &[PatchbayConnection] {
        &self.connections
    }

    /// Append a group for the plugin with the next id.
    pub fn add_plugin(&mut self, name: &str, ports: &PluginPorts) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        let mut group = PatchbayGroup::new(id, name, GroupKind::Plugin);
        group.set_plugin_ports(ports);
        self.groups.push(group);
        self.plugin_groups.push(id);
        id
    }

    /// Give plugin `plugin_id` a new name and port set.
    ///
    /// Connections survive when a port of the same name and direction still
    /// exists; the dropped ones are returned.
    pub fn replace_plugin(
        &mut self,
        plugin_id: u32,
        name: &str,
        ports: &PluginPorts,
    ) -> Vec<PatchbayConnection> {
        let Some(group_id) = self.plugin_group(plugin_id) else {
            return Vec::new();
        };
        let Some(old_ports) = self.group(group_id).map(|g| g.ports.clone()) else {
            return Vec::new();
        };
        if let Some(group) = self.group_mut(group_id) {
            group.name = name.to_string();
            group.set_plugin_ports(ports);
        }
        let Some(group) = self.group(group_id).cloned() else {
            return Vec::new();
        };

        let remap = |port: PortId| -> Option<PortId> {
            let old = old_ports.get(port as usize)?;
            group
                .ports
                .iter()
                .find(|p| p.name == old.name && p.is_input == old.is_input && p.kind == old.kind)
                .map(|p| p.id)
        };

        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.connections.len());
        for mut connection in self.connections.drain(..) {
            let mut valid = true;
            if connection.group_a == group_id {
                match remap(connection.port_a) {
                    Some(port) => connection.port_a = port,
                    None => valid = false,
                }
            }
            if connection.group_b == group_id {
                match remap(connection.port_b) {
                    Some(port) => connection.port_b = port,
                    None => valid = false,
                }
            }
            if valid {
                kept.push(connection);
            } else {
                dropped.push(connection);
            }
        }
        self.connections = kept;
        dropped
    }

    /// Remove a plugin's group; later plugins move down one id.
    pub fn remove_plugin(&mut self, plugin_id: u32) -> Vec<PatchbayConnection> {
        if plugin_id as usize >= self.plugin_groups.len() {
            return Vec::new();
        }
        let group_id = self.plugin_groups.remove(plugin_id as usize);
        self.groups.retain(|g| g.id != group_id);
        let (removed, kept) = self
            .connections
            .drain(..)
            .partition(|c| c.group_a == group_id || c.group_b == group_id);
        self.connections = kept;
        removed
    }

    pub fn remove_all_plugins(&mut self) {
        let groups = std::mem::take(&mut self.plugin_groups);
        self.groups.retain(|g| !groups.contains(&g.id));
        self.connections
            .retain(|c| !groups.contains(&c.group_a) && !groups.contains(&c.group_b));
    }

    pub fn switch_plugins(&mut self, id_a: u32, id_b: u32) {
        let (a, b) = (id_a as usize, id_b as usize);
        if a < self.plugin_groups.len() && b < self.plugin_groups.len() {
            self.plugin_groups.swap(a, b);
        }
    }

    pub fn rename_plugin(&mut self, plugin_id: u32, name: &str) {
        if let Some(group_id) = self.plugin_group(plugin_id) {
            if let Some(group) = self.group_mut(group_id) {
                group.name = name.to_string();
            }
        }
    }

    /// Connect an output port to an input port of the same kind.
    pub fn connect(
        &mut self,
        group_a: GroupId,
        port_a: PortId,
        group_b: GroupId,
        port_b: PortId,
    ) -> Result<PatchbayConnection> {
        let source = self
            .group(group_a)
            .and_then(|g| g.port(port_a))
            .ok_or_else(|| Error::Patchbay("Invalid source port".to_string()))?;
        let target = self
            .group(group_b)
            .and_then(|g| g.port(port_b))
            .ok_or_else(|| Error::Patchbay("Invalid target port".to_string()))?;

        if source.is_input || !target.is_input {
            return Err(Error::Patchbay(
                "Connections go from an output to an input".to_string(),
            ));
        }
        if source.kind != target.kind {
            return Err(Error::Patchbay("Cannot connect ports of different types".to_string()));
        }
        if self.connections.iter().any(|c| {
            c.group_a == group_a && c.port_a == port_a && c.group_b == group_b && c.port_b == port_b
        }) {
            return Err(Error::Patchbay("Ports are already connected".to_string()));
        }

        let connection = PatchbayConnection {
            id: self.next_connection_id,
            group_a,
            port_a,
            group_b,
            port_b,
        };
        self.next_connection_id += 1;
        self.connections.push(connection);
        Ok(connection)
    }

    pub fn disconnect(&mut self, connection_id: ConnectionId) -> Result<PatchbayConnection> {
        let index = self
            .connections
            .iter()
            .position(|c| c.id == connection_id)
            .ok_or_else(|| Error::Patchbay(format!("Failed to find connection {connection_id}")))?;
        Ok(self.connections.remove(index))
    }

    /// Resolve `<group>:<port>` to ids.
    pub fn find_port(&self, full_name: &str) -> Option<(GroupId, PortId)> {
        let (group_name, port_name) = full_name.split_once(':')?;
        let group = self.group_by_name(group_name)?;
        let port = group.port_by_name(port_name)?;
        Some((group.id, port.id))
    }

    pub fn full_port_name(&self, group: GroupId, port: PortId) -> Option<String> {
        let group = self.group(group)?;
        let port = group.port(port)?;
        Some(format!("{}:{}", group.name, port.name))
    }

    /// Connect two ports given by full name, as stored in projects.
    pub fn connect_by_name(&mut self, source: &str, target: &str) -> Result<PatchbayConnection> {
        let (group_a, port_a) = self
            .find_port(source)
            .ok_or_else(|| Error::Patchbay(format!("Unknown port '{source}'")))?;
        let (group_b, port_b) = self
            .find_port(target)
            .ok_or_else(|| Error::Patchbay(format!("Unknown port '{target}'")))?;
        self.connect(group_a, port_a, group_b, port_b)
    }

    /// Every connection as a `(source, target)` pair of full port names.
    pub fn connection_names(&self) -> Vec<(String, String)> {
        self.connections
            .iter()
            .filter_map(|c| {
                Some((
                    self.full_port_name(c.group_a, c.port_a)?,
                    self.full_port_name(c.group_b, c.port_b)?,
                ))
            })
            .collect()
    }

    pub fn set_group_pos(&mut self, group: GroupId, position: GroupPosition) -> Result<()> {
        let group = self
            .group_mut(group)
            .ok_or_else(|| Error::Patchbay(format!("Invalid group {group}")))?;
        group.position = Some(position);
        Ok(())
    }

    /// Build the audio thread's view of the graph.
    pub fn routing(&self) -> Routing {
        let plugin_count = self.plugin_groups.len();
        let mut routing = Routing {
            plugin_audio: Vec::with_capacity(plugin_count),
            plugin_events: vec![Vec::new(); plugin_count],
            playback: Vec::new(),
            midi_out: Vec::new(),
        };

        for &group_id in &self.plugin_groups {
            let inputs = self
                .group(group_id)
                .map(|g| {
                    g.ports
                        .iter()
                        .filter(|p| p.kind == PortKind::Audio && p.is_input)
                        .count()
                })
                .unwrap_or(0);
            routing.plugin_audio.push(vec![Vec::new(); inputs]);
        }
        if let Some(playback) = self.group(GROUP_AUDIO_OUT) {
            routing.playback = vec![Vec::new(); playback.ports.len()];
        }

        for connection in &self.connections {
            let (Some(source_group), Some(target_group)) =
                (self.group(connection.group_a), self.group(connection.group_b))
            else {
                continue;
            };
            let (Some(source), Some(target)) = (
                source_group.port(connection.port_a),
                target_group.port(connection.port_b),
            ) else {
                continue;
            };

            match source.kind {
                PortKind::Audio => {
                    let from = match source_group.kind {
                        GroupKind::AudioIn => AudioSource::Capture(source.index as usize),
                        GroupKind::Plugin => match self.plugin_of_group(source_group.id) {
                            Some(plugin) => AudioSource::Plugin {
                                plugin,
                                port: source.index as usize,
                            },
                            None => continue,
                        },
                        _ => continue,
                    };
                    let sources = match target_group.kind {
                        GroupKind::AudioOut => routing.playback.get_mut(target.index as usize),
                        GroupKind::Plugin => self
                            .plugin_of_group(target_group.id)
                            .and_then(|plugin| routing.plugin_audio.get_mut(plugin))
                            .and_then(|ports| ports.get_mut(target.index as usize)),
                        _ => None,
                    };
                    if let Some(sources) = sources {
                        sources.push(from);
                    }
                }
                PortKind::Event => {
                    let from = match source_group.kind {
                        GroupKind::MidiIn => EventSource::MidiIn,
                        GroupKind::Plugin => match self.plugin_of_group(source_group.id) {
                            Some(plugin) => EventSource::Plugin(plugin),
                            None => continue,
                        },
                        _ => continue,
                    };
                    match target_group.kind {
                        GroupKind::MidiOut => routing.midi_out.push(from),
                        GroupKind::Plugin if target.index == 0 => {
                            if let Some(sources) = self
                                .plugin_of_group(target_group.id)
                                .and_then(|plugin| routing.plugin_events.get_mut(plugin))
                            {
                                sources.push(from);
                            }
                        }
                        _ => {}
                    }
                }
                PortKind::Cv => {}
            }
        }
        routing
    }
}
