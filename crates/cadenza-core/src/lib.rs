//! Core primitives for the Cadenza plugin host.
//!
//! - [`EngineOptions`]: validated engine configuration
//! - [`CallbackSink`]: host notification channel
//! - [`byte_ring`]: SPSC byte ring buffers between audio, worker and UI threads
//! - [`EventBuffer`]: per-block control/MIDI event stream
//! - [`XmlNode`]: tree reader for project files

pub mod error;
pub use error::{Error, Result};

pub mod callback;
pub use callback::{
    CallbackEvent, CallbackSink, EngineCallback, EngineCallbackOpcode, FileCallback,
    FileCallbackOpcode,
};

pub mod events;
pub use events::{
    ControlEventType, EngineControlEvent, EngineEvent, EngineEventKind, EngineMidiEvent,
    EventBuffer, MAX_ENGINE_EVENTS,
};

mod latency;
pub use latency::LatencyBuffers;

mod lockfree;
pub use lockfree::{AtomicDouble, AtomicFloat, PeakMeters};

pub mod options;
pub use options::{EngineOption, EngineOptions, PluginPaths, ProcessMode, TransportMode};

pub mod ring;
pub use ring::{byte_ring, RingReader, RingWriter};

pub mod time;
pub use time::{Bbt, InternalTransport, TimeInfo};

pub mod types;
pub use types::{BinaryType, PluginCategory, PluginType};

pub mod xml;
pub use xml::XmlNode;

pub use smallvec;
