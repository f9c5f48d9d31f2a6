//! Serialized plugin state, as stored inside `<Plugin>` elements of projects.

use crate::custom_data::{CustomData, CUSTOM_DATA_TYPE_CHUNK};
use crate::parameter::{CONTROL_INDEX_MAX_ALLOWED, CONTROL_INDEX_MIDI_LEARN, CONTROL_INDEX_NONE};
use cadenza_core::events::MAX_MIDI_CONTROL;
use cadenza_core::xml::{escape, XmlNode};
use cadenza_core::PluginType;
use std::fmt::Write;

const MAX_MIDI_CHANNELS: i32 = 16;
const CHUNK_LINE_WIDTH: usize = 120;
const LONG_VALUE_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct StateParameter {
    /// No `<Value>` was stored; only the MIDI mapping is restored.
    pub dummy: bool,
    pub index: i32,
    pub name: String,
    pub symbol: String,
    pub value: f32,
    pub midi_channel: u8,
    pub mapped_control_index: i16,
    pub mapped_range: Option<(f32, f32)>,
}

impl Default for StateParameter {
    fn default() -> Self {
        Self {
            dummy: true,
            index: -1,
            name: String::new(),
            symbol: String::new(),
            value: 0.0,
            midi_channel: 0,
            mapped_control_index: CONTROL_INDEX_NONE,
            mapped_range: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSave {
    pub plugin_type: PluginType,
    pub name: String,
    pub label: String,
    pub binary: String,
    pub unique_id: i64,
    pub options: u32,

    pub active: bool,
    pub dry_wet: f32,
    pub volume: f32,
    pub balance_left: f32,
    pub balance_right: f32,
    pub panning: f32,
    /// -1 when the plugin ignores control events.
    pub ctrl_channel: i8,

    pub current_program_index: i32,
    pub current_program_name: String,
    pub current_midi_bank: i32,
    pub current_midi_program: i32,

    pub parameters: Vec<StateParameter>,
    pub custom_data: Vec<CustomData>,
    /// Base64 chunk for plugins using chunks.
    pub chunk: Option<String>,
}

impl Default for StateSave {
    fn default() -> Self {
        Self {
            plugin_type: PluginType::None,
            name: String::new(),
            label: String::new(),
            binary: String::new(),
            unique_id: 0,
            options: 0,
            active: false,
            dry_wet: 1.0,
            volume: 1.0,
            balance_left: -1.0,
            balance_right: 1.0,
            panning: 0.0,
            ctrl_channel: -1,
            current_program_index: -1,
            current_program_name: String::new(),
            current_midi_bank: -1,
            current_midi_program: -1,
            parameters: Vec::new(),
            custom_data: Vec::new(),
            chunk: None,
        }
    }
}

fn parse_f32(text: &str) -> f32 {
    text.parse().unwrap_or(0.0)
}

fn parse_i32(text: &str) -> i32 {
    text.parse().unwrap_or(0)
}

fn not_equal(a: f32, b: f32) -> bool {
    (a - b).abs() >= f32::EPSILON
}

impl StateSave {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Read the `<Info>` and `<Data>` children of a `<Plugin>` element.
    ///
    /// Out-of-range values are clamped or ignored; nothing here fails.
    pub fn fill_from_xml(&mut self, element: &XmlNode) {
        self.clear();

        for section in &element.children {
            if section.name == "Info" {
                for info in &section.children {
                    let text = info.text();
                    match info.name.as_str() {
                        "Type" => self.plugin_type = PluginType::from_name(text),
                        "Name" => self.name = text.to_string(),
                        "Label" | "URI" | "Identifier" | "Setup" => self.label = text.to_string(),
                        "Binary" | "Filename" => self.binary = text.to_string(),
                        "UniqueID" => self.unique_id = text.parse().unwrap_or(0),
                        _ => {}
                    }
                }
            } else if section.name == "Data" {
                for data in &section.children {
                    self.fill_data(data);
                }
            }
        }
    }

    fn fill_data(&mut self, data: &XmlNode) {
        let text = data.text();
        match data.name.as_str() {
            "Active" => self.active = text == "Yes",
            "DryWet" => self.dry_wet = parse_f32(text).clamp(0.0, 1.0),
            "Volume" => self.volume = parse_f32(text).clamp(0.0, 1.27),
            "Balance-Left" => self.balance_left = parse_f32(text).clamp(-1.0, 1.0),
            "Balance-Right" => self.balance_right = parse_f32(text).clamp(-1.0, 1.0),
            "Panning" => self.panning = parse_f32(text).clamp(-1.0, 1.0),
            "ControlChannel" => {
                if !text.starts_with(['n', 'N']) {
                    let value = parse_i32(text);
                    if (1..=MAX_MIDI_CHANNELS).contains(&value) {
                        self.ctrl_channel = (value - 1) as i8;
                    }
                }
            }
            "Options" => {
                let hex = text.trim_start_matches("0x").trim_start_matches("0X");
                if let Ok(value) = u32::from_str_radix(hex, 16) {
                    if value > 0 {
                        self.options = value;
                    }
                }
            }
            "CurrentProgramIndex" => {
                let value = parse_i32(text);
                if value >= 1 {
                    self.current_program_index = value - 1;
                }
            }
            "CurrentProgramName" => self.current_program_name = text.to_string(),
            "CurrentMidiBank" => {
                let value = parse_i32(text);
                if value >= 1 {
                    self.current_midi_bank = value - 1;
                }
            }
            "CurrentMidiProgram" => {
                let value = parse_i32(text);
                if value >= 1 {
                    self.current_midi_program = value - 1;
                }
            }
            "Parameter" => self.parameters.push(Self::read_parameter(data)),
            "CustomData" => {
                let mut custom = CustomData::default();
                for field in &data.children {
                    match field.name.as_str() {
                        "Type" => custom.data_type = field.text().to_string(),
                        "Key" => custom.key = field.text().to_string(),
                        "Value" => custom.value = field.text().to_string(),
                        _ => {}
                    }
                }
                if custom.is_valid() {
                    self.custom_data.push(custom);
                } else {
                    tracing::warn!("Reading CustomData property failed, missing data");
                }
            }
            "Chunk" => self.chunk = Some(text.to_string()),
            _ => {}
        }
    }

    fn read_parameter(element: &XmlNode) -> StateParameter {
        let mut param = StateParameter::default();
        let mut mapped_min = None;
        let mut mapped_max = None;

        for field in &element.children {
            let text = field.text();
            match field.name.as_str() {
                "Index" => {
                    let index = parse_i32(text);
                    if index >= 0 {
                        param.index = index;
                    }
                }
                "Name" => param.name = text.to_string(),
                "Symbol" => param.symbol = text.to_string(),
                "Value" => {
                    param.dummy = false;
                    param.value = parse_f32(text);
                }
                "MidiChannel" => {
                    let channel = parse_i32(text);
                    if (1..=MAX_MIDI_CHANNELS).contains(&channel) {
                        param.midi_channel = (channel - 1) as u8;
                    }
                }
                "MidiCC" => {
                    let cc = parse_i32(text);
                    if cc > 0 && cc < i32::from(MAX_MIDI_CONTROL) {
                        param.mapped_control_index = cc as i16;
                    }
                }
                "MappedControlIndex" => {
                    let ctrl = parse_i32(text);
                    if ctrl > i32::from(CONTROL_INDEX_NONE)
                        && ctrl <= i32::from(CONTROL_INDEX_MAX_ALLOWED)
                        && ctrl != i32::from(CONTROL_INDEX_MIDI_LEARN)
                    {
                        param.mapped_control_index = ctrl as i16;
                    }
                }
                "MappedMinimum" => mapped_min = Some(parse_f32(text)),
                "MappedMaximum" => mapped_max = Some(parse_f32(text)),
                _ => {}
            }
        }

        if let (Some(min), Some(max)) = (mapped_min, mapped_max) {
            param.mapped_range = Some((min, max));
        }
        param
    }

    /// Serialize as the body of a `<Plugin>` element.
    pub fn dump_xml(&self) -> String {
        let mut out = String::with_capacity(1024);
        // Writing into a String never fails.
        let _ = self.write_info(&mut out);
        let _ = self.write_data(&mut out);
        out
    }

    fn write_info(&self, out: &mut String) -> std::fmt::Result {
        let label = escape(&self.label);
        let binary = escape(&self.binary);

        out.push_str("  <Info>\n");
        writeln!(out, "   <Type>{}</Type>", self.plugin_type.as_str())?;
        writeln!(out, "   <Name>{}</Name>", escape(&self.name))?;

        match self.plugin_type {
            PluginType::None => {}
            PluginType::Internal => writeln!(out, "   <Label>{label}</Label>")?,
            PluginType::Ladspa => {
                writeln!(out, "   <Binary>{binary}</Binary>")?;
                writeln!(out, "   <Label>{label}</Label>")?;
                writeln!(out, "   <UniqueID>{}</UniqueID>", self.unique_id)?;
            }
            PluginType::Dssi | PluginType::Vst3 => {
                writeln!(out, "   <Binary>{binary}</Binary>")?;
                writeln!(out, "   <Label>{label}</Label>")?;
            }
            PluginType::Lv2 => writeln!(out, "   <URI>{label}</URI>")?,
            PluginType::Vst2 => {
                writeln!(out, "   <Binary>{binary}</Binary>")?;
                writeln!(out, "   <UniqueID>{}</UniqueID>", self.unique_id)?;
            }
            PluginType::Au => writeln!(out, "   <Identifier>{label}</Identifier>")?,
            PluginType::Dls | PluginType::Gig | PluginType::Sf2 => {
                writeln!(out, "   <Filename>{binary}</Filename>")?;
                writeln!(out, "   <Label>{label}</Label>")?;
            }
            PluginType::Sfz => writeln!(out, "   <Filename>{binary}</Filename>")?,
            PluginType::Jack => {
                writeln!(out, "   <Filename>{binary}</Filename>")?;
                writeln!(out, "   <Setup>{label}</Setup>")?;
            }
        }

        out.push_str("  </Info>\n\n");
        Ok(())
    }

    fn write_data(&self, out: &mut String) -> std::fmt::Result {
        out.push_str("  <Data>\n");
        writeln!(
            out,
            "   <Active>{}</Active>",
            if self.active { "Yes" } else { "No" }
        )?;
        if not_equal(self.dry_wet, 1.0) {
            writeln!(out, "   <DryWet>{:.7}</DryWet>", self.dry_wet)?;
        }
        if not_equal(self.volume, 1.0) {
            writeln!(out, "   <Volume>{:.7}</Volume>", self.volume)?;
        }
        if not_equal(self.balance_left, -1.0) {
            writeln!(out, "   <Balance-Left>{:.7}</Balance-Left>", self.balance_left)?;
        }
        if not_equal(self.balance_right, 1.0) {
            writeln!(out, "   <Balance-Right>{:.7}</Balance-Right>", self.balance_right)?;
        }
        if not_equal(self.panning, 0.0) {
            writeln!(out, "   <Panning>{:.7}</Panning>", self.panning)?;
        }
        if self.ctrl_channel < 0 {
            out.push_str("   <ControlChannel>N</ControlChannel>\n");
        } else {
            writeln!(
                out,
                "   <ControlChannel>{}</ControlChannel>",
                i32::from(self.ctrl_channel) + 1
            )?;
        }
        writeln!(out, "   <Options>0x{:x}</Options>", self.options)?;

        for param in &self.parameters {
            out.push_str("\n   <Parameter>\n");
            writeln!(out, "    <Index>{}</Index>", param.index)?;
            writeln!(out, "    <Name>{}</Name>", escape(&param.name))?;
            if !param.symbol.is_empty() {
                writeln!(out, "    <Symbol>{}</Symbol>", escape(&param.symbol))?;
            }
            let mapped = param.mapped_control_index;
            if mapped > CONTROL_INDEX_NONE && mapped <= CONTROL_INDEX_MAX_ALLOWED {
                writeln!(out, "    <MidiChannel>{}</MidiChannel>", param.midi_channel + 1)?;
                writeln!(out, "    <MappedControlIndex>{mapped}</MappedControlIndex>")?;
                if let Some((min, max)) = param.mapped_range {
                    writeln!(out, "    <MappedMinimum>{min}</MappedMinimum>")?;
                    writeln!(out, "    <MappedMaximum>{max}</MappedMaximum>")?;
                }
                if mapped > 0 && (mapped as u16) < MAX_MIDI_CONTROL {
                    writeln!(out, "    <MidiCC>{mapped}</MidiCC>")?;
                }
            }
            if !param.dummy {
                writeln!(out, "    <Value>{}</Value>", param.value)?;
            }
            out.push_str("   </Parameter>\n");
        }

        if self.current_program_index >= 0
            && !self.current_program_name.is_empty()
            && (self.current_program_index > 0
                || !self.current_program_name.eq_ignore_ascii_case("default"))
        {
            writeln!(
                out,
                "\n   <CurrentProgramIndex>{}</CurrentProgramIndex>",
                self.current_program_index + 1
            )?;
            writeln!(
                out,
                "   <CurrentProgramName>{}</CurrentProgramName>",
                escape(&self.current_program_name)
            )?;
        }

        if self.current_midi_bank >= 0 && self.current_midi_program >= 0 {
            writeln!(
                out,
                "\n   <CurrentMidiBank>{}</CurrentMidiBank>",
                self.current_midi_bank + 1
            )?;
            writeln!(
                out,
                "   <CurrentMidiProgram>{}</CurrentMidiProgram>",
                self.current_midi_program + 1
            )?;
        }

        for custom in self.custom_data.iter().filter(|c| c.is_valid()) {
            out.push_str("\n   <CustomData>\n");
            writeln!(out, "    <Type>{}</Type>", escape(&custom.data_type))?;
            writeln!(out, "    <Key>{}</Key>", escape(&custom.key))?;
            if custom.data_type == CUSTOM_DATA_TYPE_CHUNK
                || custom.value.len() >= LONG_VALUE_LENGTH
            {
                writeln!(out, "    <Value>\n{}\n    </Value>", escape(&custom.value))?;
            } else {
                writeln!(out, "    <Value>{}</Value>", escape(&custom.value))?;
            }
            out.push_str("   </CustomData>\n");
        }

        if let Some(chunk) = self.chunk.as_deref().filter(|c| !c.is_empty()) {
            out.push_str("\n   <Chunk>\n");
            out.push_str(&split_lines(chunk, CHUNK_LINE_WIDTH));
            out.push_str("\n   </Chunk>\n");
        }

        out.push_str("  </Data>\n");
        Ok(())
    }
}

/// Break ASCII text (base64) into fixed-width lines.
fn split_lines(text: &str, width: usize) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / width + 1);
    let bytes = text.as_bytes();
    for (i, line) in bytes.chunks(width).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&String::from_utf8_lossy(line));
    }
    out
}

/// Base64 text as read back from a project, with line breaks removed.
pub fn compact_base64(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_data::{CUSTOM_DATA_TYPE_PROPERTY, CUSTOM_DATA_TYPE_STRING};

    fn wrap(body: &str) -> XmlNode {
        XmlNode::parse(&format!("<Plugin>\n{body}</Plugin>")).unwrap()
    }

    fn sample_state() -> StateSave {
        StateSave {
            plugin_type: PluginType::Lv2,
            name: "Reverb & Co".into(),
            label: "urn:example:reverb".into(),
            options: 0x3f1,
            active: true,
            dry_wet: 0.5,
            ctrl_channel: 0,
            parameters: vec![StateParameter {
                dummy: false,
                index: 2,
                name: "Room".into(),
                symbol: "room".into(),
                value: 0.25,
                midi_channel: 1,
                mapped_control_index: 74,
                mapped_range: None,
            }],
            custom_data: vec![
                CustomData::new(CUSTOM_DATA_TYPE_STRING, "mode", "hall"),
                CustomData::new(CUSTOM_DATA_TYPE_PROPERTY, "long", "x".repeat(200)),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_dump_layout() {
        let xml = sample_state().dump_xml();
        assert!(xml.starts_with("  <Info>\n   <Type>LV2</Type>\n"));
        assert!(xml.contains("   <Name>Reverb &amp; Co</Name>\n"));
        assert!(xml.contains("   <URI>urn:example:reverb</URI>\n"));
        assert!(xml.contains("   <DryWet>0.5000000</DryWet>\n"));
        assert!(!xml.contains("<Volume>"));
        assert!(xml.contains("   <ControlChannel>1</ControlChannel>\n"));
        assert!(xml.contains("   <Options>0x3f1</Options>\n"));
        assert!(xml.contains("    <MidiCC>74</MidiCC>\n"));
        assert!(xml.contains(&format!("    <Value>\n{}\n    </Value>\n", "x".repeat(200))));
        assert!(xml.ends_with("  </Data>\n"));
    }

    #[test]
    fn test_fill_restores_dumped_state() {
        let original = sample_state();
        let mut restored = StateSave::default();
        restored.fill_from_xml(&wrap(&original.dump_xml()));
        assert_eq!(restored, original);
    }

    #[test]
    fn test_default_program_is_not_written() {
        let mut state = StateSave {
            current_program_index: 0,
            current_program_name: "Default".into(),
            ..Default::default()
        };
        assert!(!state.dump_xml().contains("CurrentProgramIndex"));
        state.current_program_index = 1;
        assert!(state
            .dump_xml()
            .contains("<CurrentProgramIndex>2</CurrentProgramIndex>"));
    }

    #[test]
    fn test_fill_clamps_values() {
        let node = wrap(
            "<Data><Volume>3.0</Volume><Panning>-4</Panning><ControlChannel>17</ControlChannel>\
             <Options>0x0</Options><CurrentMidiBank>0</CurrentMidiBank>\
             <CustomData><Key>orphan</Key><Value>1</Value></CustomData></Data>",
        );
        let mut state = StateSave::default();
        state.fill_from_xml(&node);
        assert_eq!(state.volume, 1.27);
        assert_eq!(state.panning, -1.0);
        assert_eq!(state.ctrl_channel, -1);
        assert_eq!(state.options, 0);
        assert_eq!(state.current_midi_bank, -1);
        assert!(state.custom_data.is_empty());
    }

    #[test]
    fn test_chunk_is_split_and_compacted() {
        let chunk = "A".repeat(250);
        let state = StateSave {
            chunk: Some(chunk.clone()),
            ..Default::default()
        };
        let xml = state.dump_xml();
        assert!(xml.contains(&format!("{}\n", "A".repeat(120))));
        let mut restored = StateSave::default();
        restored.fill_from_xml(&wrap(&xml));
        assert_eq!(compact_base64(restored.chunk.as_deref().unwrap()), chunk);
    }
}
