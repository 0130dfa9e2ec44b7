// Control channel messages and their binary encoding.
//
// Every message is a fixed header (see `wire::Header`) optionally followed by
// a run of string/blob bytes whose lengths travel in the header.

use serde::{Deserialize, Serialize};
use std::io::Read;

use super::wire::{self, checked_len, wire_len, Header, NULL_LEN};
use crate::error::{CommError, CommResult};

pub use super::wire::HEADER_SIZE;

/// Maximum number of buttons in a choice dialog.
pub const MAX_CHOICES: usize = 4;

/// Discriminant of a control channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    // Scalar family, used as replies
    Int = 1,
    Long = 2,
    Float = 3,
    Double = 4,
    Str = 5,
    Blob = 6,

    // Dialogs and log views
    Print = 16,
    ShowMessage = 17,
    ShowAlert = 18,
    ShowChoices = 19,
    ShowFileSelector = 20,
    ShowInputDialog = 21,
    AppendProgramLine = 22,
    AppendOutputLine = 23,
    Freeze = 24,

    // Opaque layout blobs
    LayoutCreate = 32,
    LayoutDelete = 33,
    ButtonCreate = 34,
    ButtonDelete = 35,
    ButtonState = 36,
    SliderCreate = 37,
    SliderDelete = 38,
    SliderState = 39,
    InputCreate = 40,
    InputDelete = 41,
    InputState = 42,
    MenuCreate = 43,
    MenuDelete = 44,
    MenuChoice = 45,
    ToolboxChanged = 46,
    ToolboxWait = 47,
}

impl MessageKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use MessageKind::*;
        Some(match raw {
            1 => Int,
            2 => Long,
            3 => Float,
            4 => Double,
            5 => Str,
            6 => Blob,
            16 => Print,
            17 => ShowMessage,
            18 => ShowAlert,
            19 => ShowChoices,
            20 => ShowFileSelector,
            21 => ShowInputDialog,
            22 => AppendProgramLine,
            23 => AppendOutputLine,
            24 => Freeze,
            32..=47 => return LayoutOp::from_raw(raw).map(LayoutOp::kind),
            _ => return None,
        })
    }

    /// Scalar kinds only ever travel as replies.
    pub fn is_reply(self) -> bool {
        (self as u32) < MessageKind::Print as u32
    }

    /// Kind of the reply the controller sends back, or `None` for one-way
    /// requests and for replies themselves.
    pub fn reply_kind(self) -> Option<MessageKind> {
        use MessageKind::*;
        match self {
            ShowMessage | ShowAlert | ShowChoices => Some(Int),
            ShowFileSelector | ShowInputDialog => Some(Str),
            Print | AppendProgramLine | AppendOutputLine | Freeze => None,
            Int | Long | Float | Double | Str | Blob => None,
            _ => Some(Blob),
        }
    }
}

/// Layout operations the core forwards as opaque byte runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutOp {
    LayoutCreate,
    LayoutDelete,
    ButtonCreate,
    ButtonDelete,
    ButtonState,
    SliderCreate,
    SliderDelete,
    SliderState,
    InputCreate,
    InputDelete,
    InputState,
    MenuCreate,
    MenuDelete,
    MenuChoice,
    ToolboxChanged,
    ToolboxWait,
}

impl LayoutOp {
    const ALL: [LayoutOp; 16] = [
        LayoutOp::LayoutCreate,
        LayoutOp::LayoutDelete,
        LayoutOp::ButtonCreate,
        LayoutOp::ButtonDelete,
        LayoutOp::ButtonState,
        LayoutOp::SliderCreate,
        LayoutOp::SliderDelete,
        LayoutOp::SliderState,
        LayoutOp::InputCreate,
        LayoutOp::InputDelete,
        LayoutOp::InputState,
        LayoutOp::MenuCreate,
        LayoutOp::MenuDelete,
        LayoutOp::MenuChoice,
        LayoutOp::ToolboxChanged,
        LayoutOp::ToolboxWait,
    ];

    fn from_raw(raw: u32) -> Option<Self> {
        let first = MessageKind::LayoutCreate as u32;
        raw.checked_sub(first)
            .and_then(|offset| Self::ALL.get(offset as usize).copied())
    }

    pub fn kind(self) -> MessageKind {
        use LayoutOp::*;
        match self {
            LayoutCreate => MessageKind::LayoutCreate,
            LayoutDelete => MessageKind::LayoutDelete,
            ButtonCreate => MessageKind::ButtonCreate,
            ButtonDelete => MessageKind::ButtonDelete,
            ButtonState => MessageKind::ButtonState,
            SliderCreate => MessageKind::SliderCreate,
            SliderDelete => MessageKind::SliderDelete,
            SliderState => MessageKind::SliderState,
            InputCreate => MessageKind::InputCreate,
            InputDelete => MessageKind::InputDelete,
            InputState => MessageKind::InputState,
            MenuCreate => MessageKind::MenuCreate,
            MenuDelete => MessageKind::MenuDelete,
            MenuChoice => MessageKind::MenuChoice,
            ToolboxChanged => MessageKind::ToolboxChanged,
            ToolboxWait => MessageKind::ToolboxWait,
        }
    }
}

/// Button dialog: up to four labels, answered with the chosen index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choices {
    pub text: String,
    pub labels: Vec<String>,
    #[serde(default)]
    pub default: i32,
}

/// File selector: every field may be absent. Answered with the chosen path,
/// or NULL when cancelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSelector {
    pub message: Option<String>,
    pub directory: Option<String>,
    pub pattern: Option<String>,
    pub default_file: Option<String>,
}

/// Text input dialog, answered with the entered string (NULL if cancelled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDialog {
    pub message: String,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// `None` travels as length -1 and is distinct from the empty string.
    Str(Option<String>),
    /// Verdict of a layout operation; `None` means rejected.
    Blob(Option<Vec<u8>>),
    Print(String),
    ShowMessage(String),
    ShowAlert(String),
    ShowChoices(Choices),
    ShowFileSelector(FileSelector),
    ShowInputDialog(InputDialog),
    /// All lines for the program view, sent as a NULL-terminated run.
    AppendProgramLine(Vec<String>),
    /// All lines for the output view, sent as a NULL-terminated run.
    AppendOutputLine(Vec<String>),
    Freeze(bool),
    Layout { op: LayoutOp, data: Vec<u8> },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Int(_) => MessageKind::Int,
            Message::Long(_) => MessageKind::Long,
            Message::Float(_) => MessageKind::Float,
            Message::Double(_) => MessageKind::Double,
            Message::Str(_) => MessageKind::Str,
            Message::Blob(_) => MessageKind::Blob,
            Message::Print(_) => MessageKind::Print,
            Message::ShowMessage(_) => MessageKind::ShowMessage,
            Message::ShowAlert(_) => MessageKind::ShowAlert,
            Message::ShowChoices(_) => MessageKind::ShowChoices,
            Message::ShowFileSelector(_) => MessageKind::ShowFileSelector,
            Message::ShowInputDialog(_) => MessageKind::ShowInputDialog,
            Message::AppendProgramLine(_) => MessageKind::AppendProgramLine,
            Message::AppendOutputLine(_) => MessageKind::AppendOutputLine,
            Message::Freeze(_) => MessageKind::Freeze,
            Message::Layout { op, .. } => op.kind(),
        }
    }

    /// Encode header and tail into one buffer. `max` bounds every string,
    /// blob and line run, matching what the receiver accepts.
    pub fn encode(&self, max: usize) -> CommResult<Vec<u8>> {
        let mut header = Header::new(self.kind() as u32);
        let mut tail: Vec<u8> = Vec::new();

        match self {
            Message::Int(v) => {
                header.set_word(0, *v);
            }
            Message::Long(v) => {
                header.set_long(0, *v);
            }
            Message::Float(v) => {
                header.set_word(0, v.to_bits() as i32);
            }
            Message::Double(v) => {
                header.set_long(0, v.to_bits() as i64);
            }
            Message::Str(s) => {
                put_str(&mut header, 0, &mut tail, s.as_deref(), max)?;
            }
            Message::Blob(data) => {
                let len = wire_len(data.as_deref(), max)?;
                header.set_long(0, len);
                if let Some(bytes) = data {
                    tail.extend_from_slice(bytes);
                }
            }
            Message::Print(text) | Message::ShowMessage(text) | Message::ShowAlert(text) => {
                put_str(&mut header, 0, &mut tail, Some(text), max)?;
            }
            Message::ShowChoices(choices) => {
                validate_choices(choices.labels.len(), choices.default)?;
                header.set_word(0, choices.labels.len() as i32);
                header.set_word(1, choices.default);
                put_str(&mut header, 2, &mut tail, Some(&choices.text), max)?;
                for i in 0..MAX_CHOICES {
                    let label = choices.labels.get(i).map(String::as_str);
                    put_str(&mut header, 3 + i, &mut tail, label, max)?;
                }
            }
            Message::ShowFileSelector(sel) => {
                put_str(&mut header, 0, &mut tail, sel.message.as_deref(), max)?;
                put_str(&mut header, 1, &mut tail, sel.directory.as_deref(), max)?;
                put_str(&mut header, 2, &mut tail, sel.pattern.as_deref(), max)?;
                put_str(&mut header, 3, &mut tail, sel.default_file.as_deref(), max)?;
            }
            Message::ShowInputDialog(dialog) => {
                put_str(&mut header, 0, &mut tail, Some(&dialog.message), max)?;
                put_str(&mut header, 1, &mut tail, dialog.default.as_deref(), max)?;
            }
            Message::AppendProgramLine(lines) | Message::AppendOutputLine(lines) => {
                let mut run = 0usize;
                for line in lines {
                    let len = wire_len(Some(line.as_bytes()), max)?;
                    run += 4 + line.len();
                    if run > max {
                        return Err(CommError::Malformed(format!(
                            "line run exceeds the {} byte message limit",
                            max
                        )));
                    }
                    tail.extend_from_slice(&(len as i32).to_le_bytes());
                    tail.extend_from_slice(line.as_bytes());
                }
                tail.extend_from_slice(&NULL_LEN.to_le_bytes());
            }
            Message::Freeze(frozen) => {
                header.set_word(0, *frozen as i32);
            }
            Message::Layout { data, .. } => {
                let len = wire_len(Some(data), max)?;
                header.set_long(0, len);
                tail.extend_from_slice(data);
            }
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + tail.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&tail);
        Ok(out)
    }

    /// Read one complete message. Either the whole message is returned or an
    /// error; a partially read message is never surfaced.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, max: usize) -> CommResult<Message> {
        let header = Header::read_from(reader)?;
        Self::decode(header, reader, max)
    }

    /// Decode the rest of a message whose header was already read.
    pub fn decode<R: Read + ?Sized>(header: Header, reader: &mut R, max: usize) -> CommResult<Message> {
        let kind = MessageKind::from_raw(header.discriminant)
            .ok_or(CommError::UnknownDiscriminant(header.discriminant))?;

        let message = match kind {
            MessageKind::Int => Message::Int(header.word(0)),
            MessageKind::Long => Message::Long(header.long(0)),
            MessageKind::Float => Message::Float(f32::from_bits(header.word(0) as u32)),
            MessageKind::Double => Message::Double(f64::from_bits(header.long(0) as u64)),
            MessageKind::Str => Message::Str(take_str(&header, 0, reader, max)?),
            MessageKind::Blob => {
                let len = checked_len(header.long(0), max)?;
                Message::Blob(wire::read_bytes(reader, len)?)
            }
            MessageKind::Print => Message::Print(take_required(&header, 0, reader, max)?),
            MessageKind::ShowMessage => {
                Message::ShowMessage(take_required(&header, 0, reader, max)?)
            }
            MessageKind::ShowAlert => Message::ShowAlert(take_required(&header, 0, reader, max)?),
            MessageKind::ShowChoices => {
                let count = header.word(0);
                if count < 1 || count as usize > MAX_CHOICES {
                    return Err(CommError::Malformed(format!(
                        "choice dialog with {} buttons",
                        count
                    )));
                }
                let count = count as usize;
                let default = header.word(1);
                validate_choices(count, default)?;
                let text = take_required(&header, 2, reader, max)?;
                let mut labels = Vec::with_capacity(count);
                for i in 0..MAX_CHOICES {
                    let label = take_str(&header, 3 + i, reader, max)?;
                    match (i < count, label) {
                        (true, Some(label)) => labels.push(label),
                        (false, None) => {}
                        (true, None) => {
                            return Err(CommError::Malformed(format!("choice label {} missing", i)))
                        }
                        (false, Some(_)) => {
                            return Err(CommError::Malformed(format!(
                                "choice label {} beyond button count {}",
                                i, count
                            )))
                        }
                    }
                }
                Message::ShowChoices(Choices {
                    text,
                    labels,
                    default,
                })
            }
            MessageKind::ShowFileSelector => Message::ShowFileSelector(FileSelector {
                message: take_str(&header, 0, reader, max)?,
                directory: take_str(&header, 1, reader, max)?,
                pattern: take_str(&header, 2, reader, max)?,
                default_file: take_str(&header, 3, reader, max)?,
            }),
            MessageKind::ShowInputDialog => Message::ShowInputDialog(InputDialog {
                message: take_required(&header, 0, reader, max)?,
                default: take_str(&header, 1, reader, max)?,
            }),
            MessageKind::AppendProgramLine => Message::AppendProgramLine(read_lines(reader, max)?),
            MessageKind::AppendOutputLine => Message::AppendOutputLine(read_lines(reader, max)?),
            MessageKind::Freeze => Message::Freeze(header.word(0) != 0),
            _ => {
                let op = LayoutOp::from_raw(header.discriminant)
                    .ok_or(CommError::UnknownDiscriminant(header.discriminant))?;
                let len = checked_len(header.long(0), max)?.ok_or_else(|| {
                    CommError::Malformed(format!("{:?} without a payload", op))
                })?;
                let data = wire::read_bytes(reader, Some(len))?.unwrap_or_default();
                Message::Layout { op, data }
            }
        };
        Ok(message)
    }
}

fn validate_choices(count: usize, default: i32) -> CommResult<()> {
    if count == 0 || count > MAX_CHOICES {
        return Err(CommError::Malformed(format!(
            "choice dialog needs 1..={} labels, got {}",
            MAX_CHOICES, count
        )));
    }
    if default < 0 || default as usize >= count {
        return Err(CommError::Malformed(format!(
            "default choice {} outside 0..{}",
            default, count
        )));
    }
    Ok(())
}

fn put_str(
    header: &mut Header,
    word: usize,
    tail: &mut Vec<u8>,
    value: Option<&str>,
    max: usize,
) -> CommResult<()> {
    let len = wire_len(value.map(str::as_bytes), max)?;
    header.set_word(word, len as i32);
    if let Some(s) = value {
        tail.extend_from_slice(s.as_bytes());
    }
    Ok(())
}

fn take_str<R: Read + ?Sized>(
    header: &Header,
    word: usize,
    reader: &mut R,
    max: usize,
) -> CommResult<Option<String>> {
    let len = checked_len(header.word(word) as i64, max)?;
    wire::read_string(reader, len)
}

fn take_required<R: Read + ?Sized>(
    header: &Header,
    word: usize,
    reader: &mut R,
    max: usize,
) -> CommResult<String> {
    take_str(header, word, reader, max)?
        .ok_or_else(|| CommError::Malformed(format!("required string in word {} is NULL", word)))
}

// Lines follow the header as (length, bytes) records up to a NULL length.
fn read_lines<R: Read + ?Sized>(reader: &mut R, max: usize) -> CommResult<Vec<String>> {
    let mut lines = Vec::new();
    let mut run = 0usize;
    loop {
        let mut len_buf = [0u8; 4];
        wire::read_full(reader, &mut len_buf)?;
        let len = match checked_len(i32::from_le_bytes(len_buf) as i64, max)? {
            None => return Ok(lines),
            Some(len) => len,
        };
        run += 4 + len;
        if run > max {
            return Err(CommError::Malformed(format!(
                "line run exceeds the {} byte message limit",
                max
            )));
        }
        let line = wire::read_string(reader, Some(len))?.unwrap_or_default();
        lines.push(line);
    }
}
