//! Plugin hints, plugin options and parameter hints.
//!
//! Bit values are stable: options are written to project files as hex.

use serde::{Deserialize, Serialize};

macro_rules! flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            #[inline]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            #[inline]
            pub fn set(&mut self, other: Self, enabled: bool) {
                if enabled {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }

            pub const fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

pub(crate) use flags;

flags! {
    /// Capabilities reported by an adapter after `reload()`.
    PluginHints {
        IS_BRIDGE = 0x001;
        IS_RTSAFE = 0x002;
        IS_SYNTH = 0x004;
        HAS_CUSTOM_UI = 0x008;
        CAN_DRYWET = 0x010;
        CAN_VOLUME = 0x020;
        CAN_BALANCE = 0x040;
        CAN_PANNING = 0x080;
        NEEDS_FIXED_BUFFERS = 0x100;
        NEEDS_UI_MAIN_THREAD = 0x200;
        USES_MULTI_PROGS = 0x400;
    }
}

flags! {
    /// User-selectable behaviour switches.
    PluginOptions {
        FIXED_BUFFERS = 0x001;
        FORCE_STEREO = 0x002;
        MAP_PROGRAM_CHANGES = 0x004;
        USE_CHUNKS = 0x008;
        SEND_CONTROL_CHANGES = 0x010;
        SEND_CHANNEL_PRESSURE = 0x020;
        SEND_NOTE_AFTERTOUCH = 0x040;
        SEND_PITCHBEND = 0x080;
        SEND_ALL_SOUND_OFF = 0x100;
        SEND_PROGRAM_CHANGES = 0x200;
    }
}

impl PluginOptions {
    /// Options applied to a freshly added plugin when nothing else is requested.
    pub const DEFAULTS: Self = Self(
        Self::FIXED_BUFFERS.0
            | Self::SEND_CONTROL_CHANGES.0
            | Self::SEND_CHANNEL_PRESSURE.0
            | Self::SEND_NOTE_AFTERTOUCH.0
            | Self::SEND_PITCHBEND.0
            | Self::SEND_ALL_SOUND_OFF.0,
    );
}

flags! {
    /// Per-parameter behaviour.
    ParameterHints {
        IS_BOOLEAN = 0x001;
        IS_INTEGER = 0x002;
        IS_LOGARITHMIC = 0x004;
        IS_ENABLED = 0x010;
        IS_AUTOMABLE = 0x020;
        IS_READ_ONLY = 0x040;
        USES_SAMPLERATE = 0x100;
        USES_SCALEPOINTS = 0x200;
        USES_CUSTOM_TEXT = 0x400;
        IS_STRICT_BOUNDS = 0x1000;
        IS_TRIGGER = 0x2000;
        /// Excluded from saved state.
        IS_NOT_SAVED = 0x4000;
    }
}
