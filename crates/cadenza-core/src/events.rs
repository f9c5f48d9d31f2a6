//! Engine events: the per-block control and MIDI stream handed to plugins.

use smallvec::SmallVec;

/// Fixed capacity of one event buffer; writes past it are dropped.
pub const MAX_ENGINE_EVENTS: usize = 2048;

pub const MIDI_STATUS_NOTE_OFF: u8 = 0x80;
pub const MIDI_STATUS_NOTE_ON: u8 = 0x90;
pub const MIDI_STATUS_POLYPHONIC_AFTERTOUCH: u8 = 0xA0;
pub const MIDI_STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const MIDI_STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const MIDI_STATUS_CHANNEL_PRESSURE: u8 = 0xD0;
pub const MIDI_STATUS_PITCH_WHEEL_CONTROL: u8 = 0xE0;

pub const MIDI_CONTROL_BANK_SELECT: u16 = 0x00;
pub const MIDI_CONTROL_BREATH_CONTROLLER: u16 = 0x02;
pub const MIDI_CONTROL_CHANNEL_VOLUME: u16 = 0x07;
pub const MIDI_CONTROL_BALANCE: u16 = 0x08;
pub const MIDI_CONTROL_BANK_SELECT_LSB: u16 = 0x20;
pub const MIDI_CONTROL_ALL_SOUND_OFF: u16 = 0x78;
pub const MIDI_CONTROL_ALL_NOTES_OFF: u16 = 0x7B;
/// Controllers at or above this number are channel-mode messages.
pub const MAX_MIDI_CONTROL: u16 = 0x78;

/// Status nibble of a MIDI message, channel stripped for channel messages.
#[inline]
pub fn midi_status(data: &[u8]) -> u8 {
    match data.first() {
        Some(&status) if status < 0xF0 => status & 0xF0,
        Some(&status) => status,
        None => 0,
    }
}

#[inline]
pub fn midi_channel(data: &[u8]) -> u8 {
    data.first().map_or(0, |status| status & 0x0F)
}

/// Kind of a control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEventType {
    Parameter,
    MidiBank,
    MidiProgram,
    AllSoundOff,
    AllNotesOff,
}

/// High-level control event (CC, bank/program, panic messages).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineControlEvent {
    pub kind: ControlEventType,
    pub param: u16,
    /// Raw 7-bit value when the event came from MIDI, -1 otherwise.
    pub midi_value: i8,
    pub normalized_value: f32,
}

impl EngineControlEvent {
    /// Equivalent MIDI bytes on `channel`.
    pub fn to_midi_data(&self, channel: u8) -> SmallVec<[u8; 4]> {
        let channel = channel & 0x0F;
        let mut data = SmallVec::new();
        match self.kind {
            ControlEventType::Parameter => {
                let value = if self.midi_value >= 0 {
                    self.midi_value as u8
                } else {
                    (self.normalized_value.clamp(0.0, 1.0) * 127.0).round() as u8
                };
                data.extend_from_slice(&[
                    MIDI_STATUS_CONTROL_CHANGE | channel,
                    self.param as u8,
                    value,
                ]);
            }
            ControlEventType::MidiBank => data.extend_from_slice(&[
                MIDI_STATUS_CONTROL_CHANGE | channel,
                MIDI_CONTROL_BANK_SELECT as u8,
                self.param as u8,
            ]),
            ControlEventType::MidiProgram => {
                data.extend_from_slice(&[MIDI_STATUS_PROGRAM_CHANGE | channel, self.param as u8])
            }
            ControlEventType::AllSoundOff => data.extend_from_slice(&[
                MIDI_STATUS_CONTROL_CHANGE | channel,
                MIDI_CONTROL_ALL_SOUND_OFF as u8,
                0,
            ]),
            ControlEventType::AllNotesOff => data.extend_from_slice(&[
                MIDI_STATUS_CONTROL_CHANGE | channel,
                MIDI_CONTROL_ALL_NOTES_OFF as u8,
                0,
            ]),
        }
        data
    }
}

/// Raw MIDI event. The status byte is stored without its channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMidiEvent {
    pub port: u8,
    pub data: SmallVec<[u8; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    Control(EngineControlEvent),
    Midi(EngineMidiEvent),
}

/// Event at a frame offset inside the current block.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub time: u32,
    pub channel: u8,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    /// Decode raw MIDI. Controller, bank and program messages become control events.
    pub fn from_midi(time: u32, port: u8, data: &[u8]) -> Self {
        let status = midi_status(data);
        let channel = midi_channel(data);

        if status == MIDI_STATUS_CONTROL_CHANGE && data.len() >= 3 {
            let control = u16::from(data[1]);
            let value = data[2] & 0x7F;
            let kind = match control {
                MIDI_CONTROL_BANK_SELECT | MIDI_CONTROL_BANK_SELECT_LSB => {
                    ControlEventType::MidiBank
                }
                MIDI_CONTROL_ALL_SOUND_OFF => ControlEventType::AllSoundOff,
                MIDI_CONTROL_ALL_NOTES_OFF => ControlEventType::AllNotesOff,
                _ => ControlEventType::Parameter,
            };
            let param = if kind == ControlEventType::MidiBank {
                u16::from(value)
            } else {
                control
            };
            return Self::control(
                time,
                channel,
                EngineControlEvent {
                    kind,
                    param,
                    midi_value: value as i8,
                    normalized_value: f32::from(value) / 127.0,
                },
            );
        }

        if status == MIDI_STATUS_PROGRAM_CHANGE && data.len() >= 2 {
            return Self::control(
                time,
                channel,
                EngineControlEvent {
                    kind: ControlEventType::MidiProgram,
                    param: u16::from(data[1] & 0x7F),
                    midi_value: -1,
                    normalized_value: 0.0,
                },
            );
        }

        let mut bytes: SmallVec<[u8; 4]> = SmallVec::from_slice(data);
        if let Some(first) = bytes.first_mut() {
            *first = status;
        }
        Self {
            time,
            channel,
            kind: EngineEventKind::Midi(EngineMidiEvent { port, data: bytes }),
        }
    }

    pub fn control(time: u32, channel: u8, event: EngineControlEvent) -> Self {
        Self {
            time,
            channel,
            kind: EngineEventKind::Control(event),
        }
    }
}

/// Preallocated event list; the audio thread never grows it.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: Vec<EngineEvent>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuffer {
    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(MAX_ENGINE_EVENTS),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Returns `false` when the buffer is full.
    pub fn push(&mut self, event: EngineEvent) -> bool {
        if self.events.len() >= MAX_ENGINE_EVENTS {
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn write_control_event(
        &mut self,
        time: u32,
        channel: u8,
        kind: ControlEventType,
        param: u16,
        normalized_value: f32,
    ) -> bool {
        self.push(EngineEvent::control(
            time,
            channel,
            EngineControlEvent {
                kind,
                param,
                midi_value: -1,
                normalized_value,
            },
        ))
    }

    /// `data` holds a full MIDI message; the channel in its status byte is replaced by `channel`.
    pub fn write_midi_event(&mut self, time: u32, channel: u8, port: u8, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut bytes: SmallVec<[u8; 4]> = SmallVec::from_slice(data);
        bytes[0] = midi_status(data);
        self.push(EngineEvent {
            time,
            channel: channel & 0x0F,
            kind: EngineEventKind::Midi(EngineMidiEvent { port, data: bytes }),
        })
    }

    /// Keep events ordered by time; stable for equal times.
    pub fn sort(&mut self) {
        self.events.sort_by_key(|event| event.time);
    }
}
