//! Text protocol spoken with out-of-process plugin UIs.
//!
//! Every message is a command line followed by a fixed number of field lines.
//! Newlines inside string fields travel as `\r`. Atom payloads are base64 and
//! carry both their decoded and encoded sizes.

use crate::error::{PluginError, Result};
use base64::Engine as _;
use std::io::{BufRead, Write};

/// One message in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum UiMessage {
    /// Control port value, by port index.
    Control { index: u32, value: f32 },
    /// LV2 parameter value, by URI.
    ParameterControl { uri: String, value: f32 },
    /// Serialized atom (header + body) for a port.
    Atom { index: u32, atom: Vec<u8> },
    Program(u32),
    MidiProgram { bank: u32, program: u32 },
    Urid { urid: u32, uri: String },
    ReloadPrograms(i32),
    RequestValue { key: u32, value_type: u32 },
    UiTitle(String),
    Note { on: bool, channel: u8, note: u8, velocity: u8 },
    Show,
    Focus,
    Hide,
    Exiting,
}

fn escape_line(text: &str) -> String {
    text.replace('\n', "\r")
}

fn unescape_line(text: &str) -> String {
    text.replace('\r', "\n")
}

impl UiMessage {
    /// Frame this message onto `out`.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        match self {
            UiMessage::Control { index, value } => {
                write!(out, "control\n{index}\n{value:.6}\n")
            }
            UiMessage::ParameterControl { uri, value } => {
                write!(out, "pcontrol\n{}\n{value:.6}\n", escape_line(uri))
            }
            UiMessage::Atom { index, atom } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(atom);
                write!(
                    out,
                    "atom\n{index}\n{}\n{}\n{encoded}\n",
                    atom.len(),
                    encoded.len()
                )
            }
            UiMessage::Program(index) => write!(out, "program\n{index}\n"),
            UiMessage::MidiProgram { bank, program } => {
                write!(out, "midiprogram\n{bank}\n{program}\n")
            }
            UiMessage::Urid { urid, uri } => {
                let uri = escape_line(uri);
                write!(out, "urid\n{urid}\n{}\n{uri}\n", uri.len())
            }
            UiMessage::ReloadPrograms(index) => write!(out, "reloadprograms\n{index}\n"),
            UiMessage::RequestValue { key, value_type } => {
                write!(out, "requestvalue\n{key}\n{value_type}\n")
            }
            UiMessage::UiTitle(title) => write!(out, "uiTitle\n{}\n", escape_line(title)),
            UiMessage::Note {
                on,
                channel,
                note,
                velocity,
            } => write!(out, "note\n{on}\n{channel}\n{note}\n{velocity}\n"),
            UiMessage::Show => out.write_all(b"show\n"),
            UiMessage::Focus => out.write_all(b"focus\n"),
            UiMessage::Hide => out.write_all(b"hide\n"),
            UiMessage::Exiting => out.write_all(b"exiting\n"),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }
}

/// Reads framed messages from a byte stream.
pub struct UiMessageReader<R> {
    input: R,
    line: String,
}

impl<R: BufRead> UiMessageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: String::new(),
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        self.line.clear();
        if self.input.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let line = self.line.strip_suffix('\n').unwrap_or(&self.line);
        Ok(Some(line.to_string()))
    }

    fn field(&mut self, command: &str) -> Result<String> {
        self.next_line()?
            .ok_or_else(|| PluginError::Protocol(format!("'{command}' message truncated")))
    }

    fn number<T: std::str::FromStr>(&mut self, command: &str) -> Result<T> {
        let text = self.field(command)?;
        text.trim()
            .parse()
            .map_err(|_| PluginError::Protocol(format!("'{command}' has invalid field '{text}'")))
    }

    /// Next message, or `None` at end of stream.
    pub fn read_message(&mut self) -> Result<Option<UiMessage>> {
        let Some(command) = self.next_line()? else {
            return Ok(None);
        };
        let command = command.trim().to_string();

        let message = match command.as_str() {
            "control" => UiMessage::Control {
                index: self.number(&command)?,
                value: self.number(&command)?,
            },
            "pcontrol" => UiMessage::ParameterControl {
                uri: unescape_line(&self.field(&command)?),
                value: self.number(&command)?,
            },
            "atom" => {
                let index = self.number(&command)?;
                let atom_size: usize = self.number(&command)?;
                let base64_size: usize = self.number(&command)?;
                let encoded = self.field(&command)?;
                if encoded.len() != base64_size {
                    return Err(PluginError::Protocol(format!(
                        "atom payload is {} bytes, expected {}",
                        encoded.len(),
                        base64_size
                    )));
                }
                let atom = base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes())?;
                if atom.len() != atom_size {
                    return Err(PluginError::Protocol(format!(
                        "atom decoded to {} bytes, expected {}",
                        atom.len(),
                        atom_size
                    )));
                }
                UiMessage::Atom { index, atom }
            }
            "program" => UiMessage::Program(self.number(&command)?),
            "midiprogram" => UiMessage::MidiProgram {
                bank: self.number(&command)?,
                program: self.number(&command)?,
            },
            "urid" => {
                let urid = self.number(&command)?;
                let size: usize = self.number(&command)?;
                let uri = self.field(&command)?;
                if uri.len() != size {
                    return Err(PluginError::Protocol(format!(
                        "urid uri is {} bytes, expected {}",
                        uri.len(),
                        size
                    )));
                }
                UiMessage::Urid {
                    urid,
                    uri: unescape_line(&uri),
                }
            }
            "reloadprograms" => UiMessage::ReloadPrograms(self.number(&command)?),
            "requestvalue" => UiMessage::RequestValue {
                key: self.number(&command)?,
                value_type: self.number(&command)?,
            },
            "uiTitle" => UiMessage::UiTitle(unescape_line(&self.field(&command)?)),
            "note" => UiMessage::Note {
                on: self.field(&command)? == "true",
                channel: self.number(&command)?,
                note: self.number(&command)?,
                velocity: self.number(&command)?,
            },
            "show" => UiMessage::Show,
            "focus" => UiMessage::Focus,
            "hide" => UiMessage::Hide,
            "exiting" => UiMessage::Exiting,
            other => {
                return Err(PluginError::Protocol(format!("unknown message '{other}'")));
            }
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(bytes: &[u8]) -> Vec<UiMessage> {
        let mut reader = UiMessageReader::new(Cursor::new(bytes.to_vec()));
        let mut messages = Vec::new();
        while let Some(message) = reader.read_message().unwrap() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_control_framing() {
        let bytes = UiMessage::Control {
            index: 3,
            value: 0.5,
        }
        .to_bytes();
        assert_eq!(bytes, b"control\n3\n0.500000\n");
    }

    #[test]
    fn test_atom_carries_both_sizes() {
        let message = UiMessage::Atom {
            index: 2,
            atom: vec![4, 0, 0, 0, 7, 0, 0, 0, 1, 2, 3, 4],
        };
        let bytes = message.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "atom");
        assert_eq!(lines[2], "12");
        assert_eq!(lines[3], "16");
        assert_eq!(read_all(&bytes), vec![message]);
    }

    #[test]
    fn test_newlines_in_strings_survive() {
        let message = UiMessage::UiTitle("two\nlines".into());
        let bytes = message.to_bytes();
        assert_eq!(bytes, b"uiTitle\ntwo\rlines\n");
        assert_eq!(read_all(&bytes), vec![message]);
    }

    #[test]
    fn test_mixed_stream() {
        let mut stream = Vec::new();
        let messages = vec![
            UiMessage::Urid {
                urid: 60,
                uri: "urn:test:prop".into(),
            },
            UiMessage::RequestValue {
                key: 60,
                value_type: 12,
            },
            UiMessage::Program(4),
            UiMessage::Show,
            UiMessage::Exiting,
        ];
        for message in &messages {
            message.write_to(&mut stream).unwrap();
        }
        assert_eq!(read_all(&stream), messages);
    }

    #[test]
    fn test_truncated_and_unknown_messages() {
        let mut reader = UiMessageReader::new(Cursor::new(b"control\n1\n".to_vec()));
        assert!(matches!(reader.read_message(), Err(PluginError::Protocol(_))));

        let mut reader = UiMessageReader::new(Cursor::new(b"bogus\n".to_vec()));
        assert!(matches!(reader.read_message(), Err(PluginError::Protocol(_))));
    }
}
