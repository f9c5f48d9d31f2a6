//! Program and MIDI program lists.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramList {
    pub names: Vec<String>,
    /// -1 when no program is selected.
    pub current: i32,
}

impl ProgramList {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            current: -1,
        }
    }

    pub fn count(&self) -> usize {
        self.names.len()
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.current = -1;
    }

    pub fn current_name(&self) -> Option<&str> {
        usize::try_from(self.current)
            .ok()
            .and_then(|index| self.names.get(index))
            .map(String::as_str)
    }

    /// Index of the program called `name`, preferring `hint` when it matches.
    pub fn find(&self, hint: i32, name: &str) -> Option<usize> {
        if let Ok(index) = usize::try_from(hint) {
            if self.names.get(index).is_some_and(|n| n == name) {
                return Some(index);
            }
        }
        self.names.iter().position(|n| n == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiProgramData {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MidiProgramList {
    pub data: Vec<MidiProgramData>,
    pub current: i32,
}

impl MidiProgramList {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            current: -1,
        }
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.current = -1;
    }

    pub fn current(&self) -> Option<&MidiProgramData> {
        usize::try_from(self.current)
            .ok()
            .and_then(|index| self.data.get(index))
    }

    pub fn find(&self, bank: u32, program: u32) -> Option<usize> {
        self.data
            .iter()
            .position(|d| d.bank == bank && d.program == program)
    }

    /// Bank of the current program, 0 when nothing is selected.
    pub fn current_bank(&self) -> u32 {
        self.current().map_or(0, |d| d.bank)
    }
}

/// Repair the current index after the list was rebuilt from `old_count` entries.
pub fn fix_current_index(current: i32, old_count: usize, new_count: usize) -> i32 {
    let new = new_count as i32;
    if new_count == old_count + 1 {
        // one program added, probably created by the user
        old_count as i32
    } else if current < 0 && new > 0 {
        0
    } else if current >= 0 && new == 0 {
        -1
    } else if current >= new {
        0
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_prefers_hint() {
        let list = ProgramList {
            names: vec!["A".into(), "B".into(), "A".into()],
            current: 0,
        };
        assert_eq!(list.find(2, "A"), Some(2));
        assert_eq!(list.find(1, "A"), Some(0));
        assert_eq!(list.find(-1, "C"), None);
    }

    #[test]
    fn test_fix_current_index() {
        assert_eq!(fix_current_index(1, 3, 4), 3);
        assert_eq!(fix_current_index(-1, 0, 5), 0);
        assert_eq!(fix_current_index(2, 3, 0), -1);
        assert_eq!(fix_current_index(4, 6, 2), 0);
        assert_eq!(fix_current_index(1, 3, 3), 1);
    }

    #[test]
    fn test_midi_program_lookup() {
        let list = MidiProgramList {
            data: vec![
                MidiProgramData { bank: 0, program: 0, name: "Piano".into() },
                MidiProgramData { bank: 1, program: 5, name: "Pad".into() },
            ],
            current: 1,
        };
        assert_eq!(list.find(1, 5), Some(1));
        assert_eq!(list.current_bank(), 1);
    }
}
