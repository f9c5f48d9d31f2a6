//! LV2 atoms and atom sequences in their native memory layout.
//!
//! A sequence buffer is handed to plugins as-is, so it is backed by `u64`
//! words to keep the 64-bit alignment LV2 requires.

use super::urid::*;
use cadenza_core::TimeInfo;

const ATOM_HEADER_SIZE: usize = 8;
const SEQUENCE_BODY_HEADER_SIZE: usize = 8;
const EVENT_HEADER_SIZE: usize = 16;

#[inline]
pub const fn pad_size(size: usize) -> usize {
    (size + 7) & !7
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_i64(bytes: &[u8], offset: usize) -> Option<i64> {
    let b = bytes.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(i64::from_le_bytes(raw))
}

/// Borrowed atom: its type URID and body bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomRef<'a> {
    pub atom_type: u32,
    pub body: &'a [u8],
}

impl<'a> AtomRef<'a> {
    /// Read an atom from bytes starting with its `{size, type}` header.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let size = read_u32(bytes, 0)? as usize;
        let atom_type = read_u32(bytes, 4)?;
        let body = bytes.get(ATOM_HEADER_SIZE..ATOM_HEADER_SIZE + size)?;
        Some(Self { atom_type, body })
    }

    /// Header plus body, as sent over the UI bridge.
    pub fn to_bytes(&self) -> Vec<u8> {
        atom_bytes(self.atom_type, self.body)
    }

    /// Numeric value of scalar atoms.
    pub fn as_f32(&self) -> Option<f32> {
        let body = self.body;
        match self.atom_type {
            URID_ATOM_BOOL | URID_ATOM_INT | URID_ATOM_URID => {
                read_u32(body, 0).map(|v| v as i32 as f32)
            }
            URID_ATOM_FLOAT => read_u32(body, 0).map(f32::from_bits),
            URID_ATOM_LONG => read_i64(body, 0).map(|v| v as f32),
            URID_ATOM_DOUBLE => read_i64(body, 0).map(|v| f64::from_bits(v as u64) as f32),
            _ => None,
        }
    }

    /// String payload of String/Path/URI atoms, without the trailing NUL.
    pub fn as_str(&self) -> Option<&'a str> {
        match self.atom_type {
            URID_ATOM_STRING | URID_ATOM_PATH | URID_ATOM_URI => {
                let end = self.body.iter().position(|&b| b == 0).unwrap_or(self.body.len());
                std::str::from_utf8(&self.body[..end]).ok()
            }
            _ => None,
        }
    }

    /// Properties of an Object atom as `(key, value)` pairs.
    pub fn object_properties(&self) -> Vec<(u32, AtomRef<'a>)> {
        let mut props = Vec::new();
        if self.atom_type != URID_ATOM_OBJECT && self.atom_type != URID_ATOM_BLANK {
            return props;
        }
        let body = self.body;
        let mut offset = 8;
        while offset + 16 <= body.len() {
            let Some(key) = read_u32(body, offset) else {
                break;
            };
            let Some(value) = AtomRef::parse(&body[offset + 8..]) else {
                break;
            };
            offset += 8 + ATOM_HEADER_SIZE + pad_size(value.body.len());
            props.push((key, value));
        }
        props
    }

    /// Object type URID of an Object atom.
    pub fn object_type(&self) -> Option<u32> {
        if self.atom_type == URID_ATOM_OBJECT || self.atom_type == URID_ATOM_BLANK {
            read_u32(self.body, 4)
        } else {
            None
        }
    }

    /// `(property, value)` of a `patch:Set` object.
    pub fn parse_patch_set(&self) -> Option<(u32, AtomRef<'a>)> {
        if self.object_type()? != URID_PATCH_SET {
            return None;
        }
        let props = self.object_properties();
        let property = props
            .iter()
            .find(|(key, _)| *key == URID_PATCH_PROPERTY)
            .and_then(|(_, value)| read_u32(value.body, 0))?;
        let value = props
            .iter()
            .find(|(key, _)| *key == URID_PATCH_VALUE)
            .map(|(_, value)| *value)?;
        Some((property, value))
    }
}

/// Serialize an atom header and body.
pub fn atom_bytes(atom_type: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ATOM_HEADER_SIZE + pad_size(body.len()));
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&atom_type.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Build an Object atom from `(key, value type, value body)` properties.
pub fn forge_object(object_type: u32, properties: &[(u32, u32, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&object_type.to_le_bytes());
    for (key, value_type, value) in properties {
        body.extend_from_slice(&key.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&(value.len() as u32).to_le_bytes());
        body.extend_from_slice(&value_type.to_le_bytes());
        body.extend_from_slice(value);
        body.resize(pad_size(body.len()), 0);
    }
    atom_bytes(URID_ATOM_OBJECT, &body)
}

/// `patch:Set` of `property` to a value atom.
pub fn forge_patch_set(property: u32, value_type: u32, value: &[u8]) -> Vec<u8> {
    forge_object(
        URID_PATCH_SET,
        &[
            (URID_PATCH_PROPERTY, URID_ATOM_URID, &property.to_le_bytes()),
            (URID_PATCH_VALUE, value_type, value),
        ],
    )
}

/// Null-terminated body of a String or Path atom.
pub fn string_body(text: &str) -> Vec<u8> {
    let mut body = text.as_bytes().to_vec();
    body.push(0);
    body
}

/// `time:Position` describing the current transport.
pub fn forge_time_position(time: &TimeInfo) -> Vec<u8> {
    let speed = if time.playing { 1.0f32 } else { 0.0 };
    let speed = speed.to_bits().to_le_bytes();
    let frame = (time.frame as i64).to_le_bytes();

    match &time.bbt {
        Some(bbt) => {
            let bar = i64::from(bbt.bar - 1).to_le_bytes();
            let bar_beat = ((bbt.beat - 1) as f32 + (bbt.tick / bbt.ticks_per_beat) as f32)
                .to_bits()
                .to_le_bytes();
            let beat = f64::from(bbt.beat - 1).to_bits().to_le_bytes();
            let beat_unit = (bbt.beat_type as i32).to_le_bytes();
            let beats_per_bar = bbt.beats_per_bar.to_bits().to_le_bytes();
            let bpm = (bbt.beats_per_minute as f32).to_bits().to_le_bytes();
            let ticks_per_beat = bbt.ticks_per_beat.to_bits().to_le_bytes();
            forge_object(
                URID_TIME_POSITION,
                &[
                    (URID_TIME_SPEED, URID_ATOM_FLOAT, &speed),
                    (URID_TIME_FRAME, URID_ATOM_LONG, &frame),
                    (URID_TIME_BAR, URID_ATOM_LONG, &bar),
                    (URID_TIME_BAR_BEAT, URID_ATOM_FLOAT, &bar_beat),
                    (URID_TIME_BEAT, URID_ATOM_DOUBLE, &beat),
                    (URID_TIME_BEAT_UNIT, URID_ATOM_INT, &beat_unit),
                    (URID_TIME_BEATS_PER_BAR, URID_ATOM_FLOAT, &beats_per_bar),
                    (URID_TIME_BEATS_PER_MINUTE, URID_ATOM_FLOAT, &bpm),
                    (URID_TIME_TICKS_PER_BEAT, URID_ATOM_DOUBLE, &ticks_per_beat),
                ],
            )
        }
        None => forge_object(
            URID_TIME_POSITION,
            &[
                (URID_TIME_SPEED, URID_ATOM_FLOAT, &speed),
                (URID_TIME_FRAME, URID_ATOM_LONG, &frame),
            ],
        ),
    }
}

/// One event read back from a sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomEvent<'a> {
    pub frames: i64,
    pub atom: AtomRef<'a>,
}

pub struct AtomEvents<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for AtomEvents<'a> {
    type Item = AtomEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + EVENT_HEADER_SIZE > self.bytes.len() {
            return None;
        }
        let frames = read_i64(self.bytes, self.offset)?;
        let atom = AtomRef::parse(&self.bytes[self.offset + 8..])?;
        self.offset += EVENT_HEADER_SIZE + pad_size(atom.body.len());
        Some(AtomEvent { frames, atom })
    }
}

/// Body of a `patch:Set` object written into a fixed buffer.
///
/// Same layout as [`forge_patch_set`] without the outer atom header; `None`
/// when the value does not fit.
pub fn patch_set_body(
    property: u32,
    value_type: u32,
    value: &[u8],
) -> Option<smallvec::SmallVec<[u8; 64]>> {
    let mut body = smallvec::SmallVec::<[u8; 64]>::new();
    if 48 + pad_size(value.len()) > body.inline_size() {
        return None;
    }
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&URID_PATCH_SET.to_le_bytes());
    for (key, kind, data) in [
        (URID_PATCH_PROPERTY, URID_ATOM_URID, &property.to_le_bytes()[..]),
        (URID_PATCH_VALUE, value_type, value),
    ] {
        body.extend_from_slice(&key.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(&kind.to_le_bytes());
        body.extend_from_slice(data);
        body.resize(pad_size(body.len()), 0);
    }
    Some(body)
}

/// `LV2_Atom_Sequence` with a fixed capacity.
#[derive(Debug, Clone)]
pub struct AtomSequence {
    words: Vec<u64>,
}

impl AtomSequence {
    /// `capacity` is the total buffer size in bytes, header included.
    pub fn new(capacity: usize) -> Self {
        let capacity = pad_size(capacity.max(ATOM_HEADER_SIZE + SEQUENCE_BODY_HEADER_SIZE));
        let mut sequence = Self {
            words: vec![0; capacity / 8],
        };
        sequence.clear();
        sequence
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * 8
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: u8 has no alignment requirement and the length covers exactly the words
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.words.len() * 8) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, with unique access through `&mut self`
        unsafe {
            std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.words.len() * 8)
        }
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn size(&self) -> usize {
        read_u32(self.bytes(), 0).unwrap_or(0) as usize
    }

    /// Empty input sequence.
    pub fn clear(&mut self) {
        self.write_u32(0, SEQUENCE_BODY_HEADER_SIZE as u32);
        self.write_u32(4, URID_ATOM_SEQUENCE);
        self.write_u32(8, 0);
        self.write_u32(12, 0);
    }

    /// Empty output sequence: a chunk advertising the free space to the plugin.
    pub fn prepare_output(&mut self) {
        let free = (self.capacity() - ATOM_HEADER_SIZE) as u32;
        self.write_u32(0, free);
        self.write_u32(4, URID_ATOM_CHUNK);
        self.write_u32(8, 0);
        self.write_u32(12, 0);
    }

    /// Append an event; `false` when it does not fit.
    pub fn append(&mut self, frames: i64, atom_type: u32, data: &[u8]) -> bool {
        if read_u32(self.bytes(), 4) != Some(URID_ATOM_SEQUENCE) {
            self.clear();
        }
        let size = self.size();
        let offset = ATOM_HEADER_SIZE + size;
        let needed = EVENT_HEADER_SIZE + pad_size(data.len());
        if offset + needed > self.capacity() {
            return false;
        }

        let bytes = self.bytes_mut();
        bytes[offset..offset + 8].copy_from_slice(&frames.to_le_bytes());
        bytes[offset + 8..offset + 12].copy_from_slice(&(data.len() as u32).to_le_bytes());
        bytes[offset + 12..offset + 16].copy_from_slice(&atom_type.to_le_bytes());
        bytes[offset + 16..offset + 16 + data.len()].copy_from_slice(data);
        bytes[offset + 16 + data.len()..offset + needed].fill(0);
        self.write_u32(0, (size + needed) as u32);
        true
    }

    /// Append a serialized atom (header + body).
    pub fn append_atom(&mut self, frames: i64, atom: &[u8]) -> bool {
        match AtomRef::parse(atom) {
            Some(atom) => self.append(frames, atom.atom_type, atom.body),
            None => false,
        }
    }

    /// Iterate events without allocating; empty when the plugin left a chunk behind.
    pub fn iter(&self) -> AtomEvents<'_> {
        let bytes = self.bytes();
        let end = if read_u32(bytes, 4) == Some(URID_ATOM_SEQUENCE) {
            (ATOM_HEADER_SIZE + self.size()).min(bytes.len())
        } else {
            0
        };
        AtomEvents {
            bytes: &bytes[..end],
            offset: ATOM_HEADER_SIZE + SEQUENCE_BODY_HEADER_SIZE,
        }
    }

    pub fn events(&self) -> Vec<AtomEvent<'_>> {
        self.iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Copy the used part of `other` without allocating. `false` if it does not fit.
    pub fn copy_from(&mut self, other: &AtomSequence) -> bool {
        let used = pad_size(ATOM_HEADER_SIZE + other.size()).min(other.capacity());
        if used > self.capacity() {
            return false;
        }
        let words = used / 8;
        self.words[..words].copy_from_slice(&other.words[..words]);
        true
    }

    pub fn as_mut_ptr(&mut self) -> *mut std::ffi::c_void {
        self.words.as_mut_ptr().cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::Bbt;

    #[test]
    fn test_sequence_append_and_read() {
        let mut seq = AtomSequence::new(256);
        assert!(seq.append(0, URID_MIDI_EVENT, &[0x90, 60, 100]));
        assert!(seq.append(12, URID_MIDI_EVENT, &[0x80, 60, 0]));

        let events = seq.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].frames, 12);
        assert_eq!(events[1].atom.body, &[0x80, 60, 0]);

        seq.clear();
        assert!(seq.is_empty());
    }

    #[test]
    fn test_sequence_rejects_overflow() {
        let mut seq = AtomSequence::new(48);
        assert!(seq.append(0, URID_MIDI_EVENT, &[1, 2, 3]));
        assert!(!seq.append(0, URID_MIDI_EVENT, &[1, 2, 3]));
        assert_eq!(seq.events().len(), 1);
    }

    #[test]
    fn test_output_chunk_reads_empty() {
        let mut seq = AtomSequence::new(128);
        seq.prepare_output();
        assert!(seq.events().is_empty());
    }

    #[test]
    fn test_patch_set_parses_back() {
        let value = 0.25f32.to_bits().to_le_bytes();
        let bytes = forge_patch_set(77, URID_ATOM_FLOAT, &value);
        let atom = AtomRef::parse(&bytes).unwrap();
        let (property, value) = atom.parse_patch_set().unwrap();
        assert_eq!(property, 77);
        assert_eq!(value.as_f32(), Some(0.25));
    }

    #[test]
    fn test_patch_set_body_matches_forge() {
        let value = 3i32.to_le_bytes();
        let body = patch_set_body(90, URID_ATOM_INT, &value).unwrap();
        let forged = forge_patch_set(90, URID_ATOM_INT, &value);
        assert_eq!(&forged[8..], &body[..]);
        assert!(patch_set_body(90, URID_ATOM_STRING, &[0; 32]).is_none());
    }

    #[test]
    fn test_time_position_fields() {
        let time = TimeInfo {
            playing: true,
            frame: 4800,
            usecs: 0,
            bbt: Some(Bbt {
                bar: 3,
                beat: 2,
                tick: 0.0,
                bar_start_tick: 0.0,
                beats_per_bar: 4.0,
                beat_type: 4.0,
                ticks_per_beat: 1920.0,
                beats_per_minute: 120.0,
            }),
        };
        let bytes = forge_time_position(&time);
        let atom = AtomRef::parse(&bytes).unwrap();
        assert_eq!(atom.object_type(), Some(URID_TIME_POSITION));
        let props = atom.object_properties();
        let get = |key| props.iter().find(|(k, _)| *k == key).and_then(|(_, v)| v.as_f32());
        assert_eq!(get(URID_TIME_SPEED), Some(1.0));
        assert_eq!(get(URID_TIME_FRAME), Some(4800.0));
        assert_eq!(get(URID_TIME_BAR), Some(2.0));
        assert_eq!(get(URID_TIME_BEAT), Some(1.0));
        assert_eq!(get(URID_TIME_BEATS_PER_MINUTE), Some(120.0));
    }

    #[test]
    fn test_string_atoms() {
        let bytes = atom_bytes(URID_ATOM_PATH, &string_body("/tmp/a.wav"));
        assert_eq!(AtomRef::parse(&bytes).unwrap().as_str(), Some("/tmp/a.wav"));
    }
}
