// Terminal stand-ins for the GUI and the data views.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use labctl::ipc::{FileSelector, InputDialog, LayoutOp, SlotKind};
use labctl::{CommResult, DataSink, GuiCollaborator, MeasurementBlock};

/// Dialogs as stdin prompts, views as stdout lines.
pub struct ConsoleGui {
    frozen: bool,
    program_lines: usize,
    output_lines: usize,
    layouts: HashMap<LayoutOp, Vec<u8>>,
    aborted: Option<String>,
}

impl ConsoleGui {
    pub fn new() -> Self {
        Self {
            frozen: false,
            program_lines: 0,
            output_lines: 0,
            layouts: HashMap::new(),
            aborted: None,
        }
    }

    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    /// One line from stdin without the newline; `None` on EOF.
    fn prompt(&self, question: &str) -> Option<String> {
        print!("{} ", question);
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()),
            Err(e) => {
                warn!("[CONTROLLER] Cannot read from stdin: {}", e);
                None
            }
        }
    }

    // Only lines beyond what was already shown are printed.
    fn show_new_lines(label: &str, lines: &[String], shown: &mut usize) {
        if lines.len() < *shown {
            *shown = 0;
        }
        for line in &lines[*shown..] {
            println!("[{}] {}", label, line);
        }
        *shown = lines.len();
    }
}

impl GuiCollaborator for ConsoleGui {
    fn print(&mut self, text: &str) {
        if self.frozen {
            debug!("[CONTROLLER] Suppressed output while frozen");
            return;
        }
        println!("{}", text);
    }

    fn show_message(&mut self, text: &str) {
        println!("{}", text);
        let _ = self.prompt("(press Enter)");
    }

    fn show_alert(&mut self, text: &str) {
        println!("!! {}", text);
        let _ = self.prompt("(press Enter)");
    }

    fn show_choices(&mut self, text: &str, labels: &[String], default: i32) -> i32 {
        println!("{}", text);
        for (i, label) in labels.iter().enumerate() {
            let marker = if i as i32 == default { "*" } else { " " };
            println!(" {}{}) {}", marker, i, label);
        }
        match self.prompt("Choice:") {
            Some(answer) => match answer.trim().parse::<i32>() {
                Ok(index) if index >= 0 && (index as usize) < labels.len() => index,
                _ => default,
            },
            None => default,
        }
    }

    fn show_file_selector(&mut self, request: &FileSelector) -> Option<String> {
        if let Some(message) = &request.message {
            println!("{}", message);
        }
        let hint = match (&request.directory, &request.pattern) {
            (Some(dir), Some(pattern)) => format!("{}/{}", dir, pattern),
            (Some(dir), None) => dir.clone(),
            (None, Some(pattern)) => pattern.clone(),
            (None, None) => String::new(),
        };
        let answer = self.prompt(&format!("File [{}] (empty = default, '-' = cancel):", hint))?;
        match answer.as_str() {
            "-" => None,
            "" => request.default_file.clone(),
            path => Some(path.to_string()),
        }
    }

    fn show_input(&mut self, request: &InputDialog) -> Option<String> {
        let question = match &request.default {
            Some(default) => format!("{} [{}]:", request.message, default),
            None => format!("{}:", request.message),
        };
        let answer = self.prompt(&question)?;
        if answer.is_empty() {
            request.default.clone().or(Some(answer))
        } else {
            Some(answer)
        }
    }

    fn append_program_lines(&mut self, lines: &[String]) {
        Self::show_new_lines("program", lines, &mut self.program_lines);
    }

    fn append_output_lines(&mut self, lines: &[String]) {
        Self::show_new_lines("output", lines, &mut self.output_lines);
    }

    fn freeze(&mut self, frozen: bool) {
        info!("[CONTROLLER] Display {}", if frozen { "frozen" } else { "live" });
        self.frozen = frozen;
    }

    fn apply_layout_blob(&mut self, op: LayoutOp, data: &[u8]) -> Option<Vec<u8>> {
        use LayoutOp::*;
        match op {
            LayoutCreate | ButtonCreate | SliderCreate | InputCreate | MenuCreate => {
                self.layouts.insert(op, data.to_vec());
                Some(Vec::new())
            }
            LayoutDelete | ButtonDelete | SliderDelete | InputDelete | MenuDelete => {
                self.layouts.remove(&op);
                Some(Vec::new())
            }
            ButtonState | SliderState | InputState => Some(data.to_vec()),
            // Nothing to click on a terminal.
            MenuChoice | ToolboxChanged | ToolboxWait => {
                debug!("[CONTROLLER] Rejecting {:?} on the console", op);
                None
            }
        }
    }

    fn report_aborted(&mut self, reason: &str) {
        eprintln!("Experiment aborted: {}", reason);
        self.aborted = Some(reason.to_string());
    }
}

/// Logs every block and keeps totals.
#[derive(Default)]
pub struct LoggingSink {
    pub blocks: usize,
    pub samples: usize,
}

impl DataSink for LoggingSink {
    fn consume(&mut self, kind: SlotKind, payload: &[u8]) -> CommResult<()> {
        let block = MeasurementBlock::decode(payload)?;
        self.blocks += 1;
        self.samples += block.values.len();
        info!(
            "[CONTROLLER] {:?} block at {}: {} row(s) x {} column(s)",
            kind,
            block.start,
            block.rows(),
            block.columns
        );
        Ok(())
    }
}
