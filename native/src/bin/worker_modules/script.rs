// Experiment scripts: a JSON list of steps, each one exercising the channel.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use labctl::ipc::{Choices, FileSelector, InputDialog, LayoutOp, WorkerPeer};
use labctl::{CommResult, MeasurementBlock};

/// Values per published block when a sweep is split up.
const SWEEP_BLOCK: usize = 64;
const SLEEP_SLICE: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Cannot read script: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid script: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Print { text: String },
    Message { text: String },
    Alert { text: String },
    Choices(Choices),
    FileSelector(FileSelector),
    Input(InputDialog),
    /// Program view lines; the whole view is resent each time.
    Program { lines: Vec<String> },
    /// Output view lines; the whole view is resent each time.
    Output { lines: Vec<String> },
    Freeze { frozen: bool },
    Layout {
        op: LayoutOp,
        #[serde(default)]
        data: Vec<u8>,
    },
    /// One explicit block of samples.
    Block {
        #[serde(default)]
        start: u64,
        #[serde(default = "one_column")]
        columns: u32,
        values: Vec<f64>,
    },
    /// Synthetic linear ramp, published in blocks.
    Sweep { points: usize, increment: f64 },
    Sleep { ms: u64 },
}

fn one_column() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Run every step in order. The first channel failure ends the run.
    pub fn run(&self, peer: &mut WorkerPeer) -> CommResult<()> {
        let mut views = Views::default();
        for (index, step) in self.steps.iter().enumerate() {
            debug!("[WORKER] Step {}: {:?}", index, step);
            run_step(step, peer, &mut views)?;
        }
        info!("[WORKER] Script finished ({} steps)", self.steps.len());
        Ok(())
    }
}

#[derive(Default)]
struct Views {
    program: Vec<String>,
    output: Vec<String>,
    next_row: u64,
}

impl Views {
    // Dialog answers are echoed into the output view.
    fn record(&mut self, peer: &mut WorkerPeer, line: String) -> CommResult<()> {
        self.output.push(line);
        peer.append_output_lines(&self.output)
    }
}

fn run_step(step: &Step, peer: &mut WorkerPeer, views: &mut Views) -> CommResult<()> {
    match step {
        Step::Print { text } => peer.print(text),
        Step::Message { text } => peer.show_message(text),
        Step::Alert { text } => peer.show_alert(text),
        Step::Choices(choices) => {
            let index = peer.show_choices(choices)?;
            let label = choices
                .labels
                .get(index as usize)
                .map(String::as_str)
                .unwrap_or("?");
            views.record(peer, format!("choice: {} ({})", index, label))
        }
        Step::FileSelector(selector) => {
            let answer = peer.show_file_selector(selector)?;
            let line = match answer {
                Some(path) => format!("file: {}", path),
                None => "file: <cancelled>".to_string(),
            };
            views.record(peer, line)
        }
        Step::Input(dialog) => {
            let answer = peer.show_input_dialog(dialog)?;
            let line = match answer {
                Some(text) => format!("input: {:?}", text),
                None => "input: <cancelled>".to_string(),
            };
            views.record(peer, line)
        }
        Step::Program { lines } => {
            views.program.extend(lines.iter().cloned());
            peer.append_program_lines(&views.program)
        }
        Step::Output { lines } => {
            views.output.extend(lines.iter().cloned());
            peer.append_output_lines(&views.output)
        }
        Step::Freeze { frozen } => peer.freeze(*frozen),
        Step::Layout { op, data } => {
            let verdict = peer.layout(*op, data)?;
            let line = match verdict {
                Some(reply) => format!("{:?}: accepted ({} bytes)", op, reply.len()),
                None => format!("{:?}: rejected", op),
            };
            views.record(peer, line)
        }
        Step::Block {
            start,
            columns,
            values,
        } => {
            let block = MeasurementBlock {
                start: *start,
                columns: *columns,
                values: values.clone(),
            };
            peer.publish_data(block.slot_kind(), &block.encode())?;
            Ok(())
        }
        Step::Sweep { points, increment } => {
            let values: Vec<f64> = (0..*points).map(|i| i as f64 * increment).collect();
            for chunk in values.chunks(SWEEP_BLOCK) {
                let block = MeasurementBlock::trace(views.next_row, chunk.to_vec());
                views.next_row += chunk.len() as u64;
                peer.publish_data(block.slot_kind(), &block.encode())?;
            }
            Ok(())
        }
        Step::Sleep { ms } => peer
            .cancel_token()
            .sleep(Duration::from_millis(*ms), SLEEP_SLICE),
    }
}
