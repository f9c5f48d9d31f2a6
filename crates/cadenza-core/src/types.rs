//! Plugin and binary type enumerations.

use serde::{Deserialize, Serialize};

/// Plugin format handled by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PluginType {
    #[default]
    None,
    Internal,
    Ladspa,
    Dssi,
    Lv2,
    Vst2,
    Vst3,
    Au,
    Dls,
    Gig,
    Sf2,
    Sfz,
    Jack,
}

impl PluginType {
    /// Name used in project files.
    pub fn as_str(self) -> &'static str {
        match self {
            PluginType::None => "NONE",
            PluginType::Internal => "INTERNAL",
            PluginType::Ladspa => "LADSPA",
            PluginType::Dssi => "DSSI",
            PluginType::Lv2 => "LV2",
            PluginType::Vst2 => "VST2",
            PluginType::Vst3 => "VST3",
            PluginType::Au => "AU",
            PluginType::Dls => "DLS",
            PluginType::Gig => "GIG",
            PluginType::Sf2 => "SF2",
            PluginType::Sfz => "SFZ",
            PluginType::Jack => "JACK",
        }
    }

    /// Case-insensitive parse; unknown strings map to `None`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "INTERNAL" => PluginType::Internal,
            "LADSPA" => PluginType::Ladspa,
            "DSSI" => PluginType::Dssi,
            "LV2" => PluginType::Lv2,
            "VST" | "VST2" => PluginType::Vst2,
            "VST3" => PluginType::Vst3,
            "AU" => PluginType::Au,
            "DLS" => PluginType::Dls,
            "GIG" => PluginType::Gig,
            "SF2" | "SF3" => PluginType::Sf2,
            "SFZ" => PluginType::Sfz,
            "JACK" => PluginType::Jack,
            _ => PluginType::None,
        }
    }

    /// Types that always run in-process.
    pub fn never_bridged(self) -> bool {
        matches!(
            self,
            PluginType::Internal | PluginType::Sf2 | PluginType::Sfz | PluginType::Jack
        )
    }

    /// Types identified by a label or URI rather than by a file name.
    pub fn uses_label_only(self) -> bool {
        matches!(self, PluginType::Internal | PluginType::Lv2 | PluginType::Jack)
    }
}

impl PluginType {
    /// Numeric index used by the option API.
    pub fn index(self) -> i32 {
        match self {
            PluginType::None => 0,
            PluginType::Internal => 1,
            PluginType::Ladspa => 2,
            PluginType::Dssi => 3,
            PluginType::Lv2 => 4,
            PluginType::Vst2 => 5,
            PluginType::Vst3 => 6,
            PluginType::Au => 7,
            PluginType::Dls => 8,
            PluginType::Gig => 9,
            PluginType::Sf2 => 10,
            PluginType::Sfz => 11,
            PluginType::Jack => 12,
        }
    }

    pub fn from_index(value: i32) -> Self {
        match value {
            1 => PluginType::Internal,
            2 => PluginType::Ladspa,
            3 => PluginType::Dssi,
            4 => PluginType::Lv2,
            5 => PluginType::Vst2,
            6 => PluginType::Vst3,
            7 => PluginType::Au,
            8 => PluginType::Dls,
            9 => PluginType::Gig,
            10 => PluginType::Sf2,
            11 => PluginType::Sfz,
            12 => PluginType::Jack,
            _ => PluginType::None,
        }
    }
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architecture of a plugin binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BinaryType {
    #[default]
    None,
    Posix32,
    Posix64,
    Win32,
    Win64,
    Other,
}

impl BinaryType {
    /// Architecture of the running host.
    pub const fn native() -> Self {
        if cfg!(windows) {
            if cfg!(target_pointer_width = "64") {
                BinaryType::Win64
            } else {
                BinaryType::Win32
            }
        } else if cfg!(target_pointer_width = "64") {
            BinaryType::Posix64
        } else {
            BinaryType::Posix32
        }
    }
}

/// Plugin category reported by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PluginCategory {
    #[default]
    None,
    Synth,
    Delay,
    Eq,
    Filter,
    Distortion,
    Dynamics,
    Modulator,
    Utility,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_type_names() {
        for ty in [
            PluginType::Internal,
            PluginType::Ladspa,
            PluginType::Dssi,
            PluginType::Lv2,
            PluginType::Vst2,
            PluginType::Vst3,
            PluginType::Sf2,
            PluginType::Sfz,
            PluginType::Jack,
        ] {
            assert_eq!(PluginType::from_name(ty.as_str()), ty);
        }
        assert_eq!(PluginType::from_name("lv2"), PluginType::Lv2);
        assert_eq!(PluginType::from_name("bogus"), PluginType::None);
    }

    #[test]
    fn test_never_bridged() {
        assert!(PluginType::Sf2.never_bridged());
        assert!(PluginType::Jack.never_bridged());
        assert!(!PluginType::Lv2.never_bridged());
    }

    #[test]
    fn test_native_binary_is_concrete() {
        assert_ne!(BinaryType::native(), BinaryType::None);
        assert_ne!(BinaryType::native(), BinaryType::Other);
    }
}
