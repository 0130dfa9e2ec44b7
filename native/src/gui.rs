// Controller-side collaborators the dispatcher routes to.

use crate::error::CommResult;
use crate::ipc::{FileSelector, InputDialog, LayoutOp, SlotKind};

/// One call per request kind. Implementations may block (a modal dialog);
/// the worker waits for the reply meanwhile.
pub trait GuiCollaborator {
    fn print(&mut self, text: &str);
    /// Returns once the operator acknowledged the message.
    fn show_message(&mut self, text: &str);
    fn show_alert(&mut self, text: &str);
    /// Index of the chosen label.
    fn show_choices(&mut self, text: &str, labels: &[String], default: i32) -> i32;
    /// Chosen path, `None` when cancelled.
    fn show_file_selector(&mut self, request: &FileSelector) -> Option<String>;
    /// Entered text, `None` when cancelled.
    fn show_input(&mut self, request: &InputDialog) -> Option<String>;
    /// Full contents of the program view.
    fn append_program_lines(&mut self, lines: &[String]);
    /// Full contents of the output view.
    fn append_output_lines(&mut self, lines: &[String]);
    fn freeze(&mut self, frozen: bool);
    /// Apply an opaque layout operation. `None` rejects it.
    fn apply_layout_blob(&mut self, op: LayoutOp, data: &[u8]) -> Option<Vec<u8>>;
    /// The run was aborted after a channel failure.
    fn report_aborted(&mut self, reason: &str);
}

/// Receives measurement payloads in publication order. An error means the
/// payload could not be interpreted and escalates like any channel failure.
pub trait DataSink {
    fn consume(&mut self, kind: SlotKind, payload: &[u8]) -> CommResult<()>;
}
