//! URID table shared by every execution unit of a plugin and its UI bridge.
//!
//! Ids are dense and start at 1; `0` is the null URID. The table only grows.

use parking_lot::RwLock;

macro_rules! standard_urids {
    ($($name:ident = $uri:expr;)*) => {
        standard_urids!(@consts 1u32; $($name,)*);

        /// URIs pre-seeded into every table, indexed by URID.
        pub const STANDARD_URIS: &[&str] = &["", $($uri,)*];
    };
    (@consts $n:expr; $name:ident, $($rest:ident,)*) => {
        pub const $name: u32 = $n;
        standard_urids!(@consts $n + 1; $($rest,)*);
    };
    (@consts $n:expr;) => {
        /// Number of pre-seeded URIDs, the null URID included.
        pub const STANDARD_URID_COUNT: u32 = $n;
    };
}

standard_urids! {
    URID_ATOM_BLANK = "http://lv2plug.in/ns/ext/atom#Blank";
    URID_ATOM_BOOL = "http://lv2plug.in/ns/ext/atom#Bool";
    URID_ATOM_CHUNK = "http://lv2plug.in/ns/ext/atom#Chunk";
    URID_ATOM_DOUBLE = "http://lv2plug.in/ns/ext/atom#Double";
    URID_ATOM_EVENT = "http://lv2plug.in/ns/ext/atom#Event";
    URID_ATOM_FLOAT = "http://lv2plug.in/ns/ext/atom#Float";
    URID_ATOM_INT = "http://lv2plug.in/ns/ext/atom#Int";
    URID_ATOM_LITERAL = "http://lv2plug.in/ns/ext/atom#Literal";
    URID_ATOM_LONG = "http://lv2plug.in/ns/ext/atom#Long";
    URID_ATOM_NUMBER = "http://lv2plug.in/ns/ext/atom#Number";
    URID_ATOM_OBJECT = "http://lv2plug.in/ns/ext/atom#Object";
    URID_ATOM_PATH = "http://lv2plug.in/ns/ext/atom#Path";
    URID_ATOM_PROPERTY = "http://lv2plug.in/ns/ext/atom#Property";
    URID_ATOM_RESOURCE = "http://lv2plug.in/ns/ext/atom#Resource";
    URID_ATOM_SEQUENCE = "http://lv2plug.in/ns/ext/atom#Sequence";
    URID_ATOM_SOUND = "http://lv2plug.in/ns/ext/atom#Sound";
    URID_ATOM_STRING = "http://lv2plug.in/ns/ext/atom#String";
    URID_ATOM_TUPLE = "http://lv2plug.in/ns/ext/atom#Tuple";
    URID_ATOM_URI = "http://lv2plug.in/ns/ext/atom#URI";
    URID_ATOM_URID = "http://lv2plug.in/ns/ext/atom#URID";
    URID_ATOM_VECTOR = "http://lv2plug.in/ns/ext/atom#Vector";
    URID_ATOM_TRANSFER_ATOM = "http://lv2plug.in/ns/ext/atom#atomTransfer";
    URID_ATOM_TRANSFER_EVENT = "http://lv2plug.in/ns/ext/atom#eventTransfer";
    URID_BUF_MAX_LENGTH = "http://lv2plug.in/ns/ext/buf-size#maxBlockLength";
    URID_BUF_MIN_LENGTH = "http://lv2plug.in/ns/ext/buf-size#minBlockLength";
    URID_BUF_NOMINAL_LENGTH = "http://lv2plug.in/ns/ext/buf-size#nominalBlockLength";
    URID_BUF_SEQUENCE_SIZE = "http://lv2plug.in/ns/ext/buf-size#sequenceSize";
    URID_LOG_ERROR = "http://lv2plug.in/ns/ext/log#Error";
    URID_LOG_NOTE = "http://lv2plug.in/ns/ext/log#Note";
    URID_LOG_TRACE = "http://lv2plug.in/ns/ext/log#Trace";
    URID_LOG_WARNING = "http://lv2plug.in/ns/ext/log#Warning";
    URID_PATCH_GET = "http://lv2plug.in/ns/ext/patch#Get";
    URID_PATCH_SET = "http://lv2plug.in/ns/ext/patch#Set";
    URID_PATCH_PROPERTY = "http://lv2plug.in/ns/ext/patch#property";
    URID_PATCH_SUBJECT = "http://lv2plug.in/ns/ext/patch#subject";
    URID_PATCH_VALUE = "http://lv2plug.in/ns/ext/patch#value";
    URID_TIME_POSITION = "http://lv2plug.in/ns/ext/time#Position";
    URID_TIME_BAR = "http://lv2plug.in/ns/ext/time#bar";
    URID_TIME_BAR_BEAT = "http://lv2plug.in/ns/ext/time#barBeat";
    URID_TIME_BEAT = "http://lv2plug.in/ns/ext/time#beat";
    URID_TIME_BEAT_UNIT = "http://lv2plug.in/ns/ext/time#beatUnit";
    URID_TIME_BEATS_PER_BAR = "http://lv2plug.in/ns/ext/time#beatsPerBar";
    URID_TIME_BEATS_PER_MINUTE = "http://lv2plug.in/ns/ext/time#beatsPerMinute";
    URID_TIME_FRAME = "http://lv2plug.in/ns/ext/time#frame";
    URID_TIME_FRAMES_PER_SECOND = "http://lv2plug.in/ns/ext/time#framesPerSecond";
    URID_TIME_SPEED = "http://lv2plug.in/ns/ext/time#speed";
    URID_TIME_TICKS_PER_BEAT = "http://kxstudio.sf.net/ns/lv2ext/props#TimePositionTicksPerBeat";
    URID_MIDI_EVENT = "http://lv2plug.in/ns/ext/midi#MidiEvent";
    URID_PARAM_SAMPLE_RATE = "http://lv2plug.in/ns/ext/parameters#sampleRate";
    URID_UI_WINDOW_TITLE = "http://lv2plug.in/ns/extensions/ui#windowTitle";
    URID_CADENZA_ATOM_WORKER_IN = "urn:cadenza:atomWorkerIn";
    URID_CADENZA_ATOM_WORKER_RESP = "urn:cadenza:atomWorkerResp";
}

/// Append-only URI <-> URID table.
#[derive(Debug)]
pub struct UridMap {
    uris: RwLock<Vec<String>>,
}

impl Default for UridMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UridMap {
    pub fn new() -> Self {
        Self {
            uris: RwLock::new(STANDARD_URIS.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// URID for `uri`, appending it when unknown. Empty URIs map to 0.
    pub fn map(&self, uri: &str) -> u32 {
        if uri.is_empty() {
            return 0;
        }
        if let Some(urid) = self.lookup(uri) {
            return urid;
        }

        let mut uris = self.uris.write();
        // another thread may have added it between the two locks
        if let Some(index) = uris.iter().position(|u| u == uri) {
            return index as u32;
        }
        uris.push(uri.to_string());
        (uris.len() - 1) as u32
    }

    /// URID for `uri` without inserting.
    pub fn lookup(&self, uri: &str) -> Option<u32> {
        self.uris
            .read()
            .iter()
            .skip(1)
            .position(|u| u == uri)
            .map(|index| index as u32 + 1)
    }

    pub fn unmap(&self, urid: u32) -> Option<String> {
        if urid == 0 {
            return None;
        }
        self.uris.read().get(urid as usize).cloned()
    }

    /// Accept a mapping made by the UI process.
    ///
    /// The entry must either extend the table by exactly one or repeat a known mapping.
    pub fn handle_ui_map(&self, urid: u32, uri: &str) -> bool {
        if urid == 0 || uri.is_empty() {
            return false;
        }
        let mut uris = self.uris.write();
        let len = uris.len() as u32;
        if urid < len {
            if uris[urid as usize] == uri {
                return true;
            }
            tracing::warn!(
                "UI mapped URID {} to '{}' but it is already '{}'",
                urid,
                uri,
                uris[urid as usize]
            );
            return false;
        }
        if urid != len {
            tracing::warn!("UI mapped URID {} out of order (table size {})", urid, len);
            return false;
        }
        uris.push(uri.to_string());
        true
    }

    /// Number of entries, the null URID included.
    pub fn len(&self) -> u32 {
        self.uris.read().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Every `(urid, uri)` pair from `start`, for syncing a UI.
    pub fn entries_from(&self, start: u32) -> Vec<(u32, String)> {
        self.uris
            .read()
            .iter()
            .enumerate()
            .skip(start.max(1) as usize)
            .map(|(index, uri)| (index as u32, uri.clone()))
            .collect()
    }
}
