//! Parameter model shared by all adapters.

use crate::hints::ParameterHints;
use serde::{Deserialize, Serialize};

/// Pseudo-parameter ids used in callbacks for the internal post-processing values.
pub const PARAMETER_ACTIVE: i32 = -2;
pub const PARAMETER_DRYWET: i32 = -3;
pub const PARAMETER_VOLUME: i32 = -4;
pub const PARAMETER_BALANCE_LEFT: i32 = -5;
pub const PARAMETER_BALANCE_RIGHT: i32 = -6;
pub const PARAMETER_PANNING: i32 = -7;
pub const PARAMETER_CTRL_CHANNEL: i32 = -8;

/// Values of [`ParameterData::mapped_control_index`] outside the MIDI CC range.
pub const CONTROL_INDEX_NONE: i16 = -1;
pub const CONTROL_INDEX_MIDI_LEARN: i16 = -2;
pub const CONTROL_INDEX_CV: i16 = 130;
pub const CONTROL_INDEX_MIDI_PITCHBEND: i16 = 131;
pub const CONTROL_INDEX_MAX_ALLOWED: i16 = CONTROL_INDEX_MIDI_PITCHBEND;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterType {
    #[default]
    Unknown,
    Input,
    Output,
}

/// Host-driven role of a control port; such parameters are never user-automated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterSpecial {
    #[default]
    None,
    SampleRate,
    Freewheel,
    Latency,
    Time,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterData {
    pub kind: ParameterType,
    pub hints: ParameterHints,
    pub index: i32,
    /// Index into the native descriptor (port index, or port count + parameter index).
    pub rindex: i32,
    pub midi_channel: u8,
    /// MIDI CC mapped to this parameter, or one of the `CONTROL_INDEX_*` values.
    pub mapped_control_index: i16,
}

impl Default for ParameterData {
    fn default() -> Self {
        Self {
            kind: ParameterType::Unknown,
            hints: ParameterHints::empty(),
            index: -1,
            rindex: -1,
            midi_channel: 0,
            mapped_control_index: CONTROL_INDEX_NONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRanges {
    pub def: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
}

impl Default for ParameterRanges {
    fn default() -> Self {
        Self {
            def: 0.0,
            min: 0.0,
            max: 1.0,
            step: 0.01,
            step_small: 0.0001,
            step_large: 0.1,
        }
    }
}

impl ParameterRanges {
    #[inline]
    pub fn fix_value(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    #[inline]
    pub fn fix_default(&mut self) {
        self.def = self.fix_value(self.def);
    }

    /// Clamp, then map to 0..1.
    #[inline]
    pub fn normalized_value(&self, value: f32) -> f32 {
        let normalized = (self.fix_value(value) - self.min) / (self.max - self.min);
        normalized.clamp(0.0, 1.0)
    }

    #[inline]
    pub fn unnormalized_value(&self, normalized: f32) -> f32 {
        normalized * (self.max - self.min) + self.min
    }

    /// Inverse of a logarithmic mapping; zero bounds are nudged off zero.
    pub fn unnormalized_log_value(&self, normalized: f32) -> f32 {
        let min = if self.min == 0.0 { 0.00001 } else { self.min };
        let max = if self.max == 0.0 { 0.00001 } else { self.max };
        min * (max / min).powf(normalized)
    }
}

/// One plugin parameter as exposed by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub data: ParameterData,
    pub ranges: ParameterRanges,
    pub special: ParameterSpecial,
    pub name: String,
    pub symbol: String,
    pub unit: String,
}

impl Parameter {
    pub fn is_input(&self) -> bool {
        self.data.kind == ParameterType::Input
    }

    pub fn is_output(&self) -> bool {
        self.data.kind == ParameterType::Output
    }

    pub fn has_hint(&self, hint: ParameterHints) -> bool {
        self.data.hints.contains(hint)
    }

    /// Map a normalized controller value into this parameter's range.
    pub fn value_from_normalized(&self, normalized: f32) -> f32 {
        if self.has_hint(ParameterHints::IS_BOOLEAN) {
            return if normalized >= 0.5 {
                self.ranges.max
            } else {
                self.ranges.min
            };
        }
        let mut value = if self.has_hint(ParameterHints::IS_LOGARITHMIC) {
            self.ranges.unnormalized_log_value(normalized)
        } else {
            self.ranges.unnormalized_value(normalized)
        };
        if self.has_hint(ParameterHints::IS_INTEGER) {
            value = value.round();
        }
        value
    }
}
