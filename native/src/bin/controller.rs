extern crate labctl;
use log::{error, info, warn};

#[path = "controller_modules/console.rs"]
mod console;

use console::{ConsoleGui, LoggingSink};
use labctl::ipc::{create_channel, WorkerProcess};
use labctl::{logging, Dispatcher, IpcConfig};
use std::path::PathBuf;
use std::process::Command;

type ConsoleDispatcher = Dispatcher<ConsoleGui, LoggingSink, WorkerProcess>;

const WORKER_BINARY: &str = "labctl-worker";

fn main() {
    // Load or ignore .env file
    let _ = dotenvy::dotenv();
    labctl::init_diagnostics("labctl-controller");

    let script = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: labctl-controller <script.json>");
            std::process::exit(2);
        }
    };

    let code = match run(script) {
        Ok(code) => code,
        Err(e) => {
            logging::log_critical_error("controller", &e.to_string());
            match logging::crash_log_path() {
                Some(path) => eprintln!("labctl-controller: {} (details in {})", e, path.display()),
                None => eprintln!("labctl-controller: {}", e),
            }
            1
        }
    };

    logging::shutdown_sentry();
    std::process::exit(code);
}

fn run(script: PathBuf) -> Result<i32, Box<dyn std::error::Error>> {
    let config = IpcConfig::load()?;
    config.validate()?;

    let (channel, endpoints) = create_channel(&config)?;
    let mut command = Command::new(worker_executable(&config)?);
    command.arg(&script);
    let worker = endpoints.spawn(command)?;

    let mut dispatcher = Dispatcher::new(channel, ConsoleGui::new(), LoggingSink::default(), worker);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(drive(&mut dispatcher, config.idle_tick()))?;

    if let Some(reason) = dispatcher.gui().aborted() {
        warn!("[CONTROLLER] Run aborted: {}", reason);
    }
    let sink = dispatcher.sink();
    info!(
        "[CONTROLLER] Run finished: {} block(s), {} sample(s)",
        sink.blocks, sink.samples
    );
    Ok(code)
}

/// Tick the dispatcher until the worker is gone and its queue is drained.
async fn drive(
    dispatcher: &mut ConsoleDispatcher,
    idle_tick: std::time::Duration,
) -> Result<i32, Box<dyn std::error::Error>> {
    let mut interval = tokio::time::interval(idle_tick);
    let mut abort_sent = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                dispatcher.tick();
                if dispatcher.is_aborted() {
                    return Ok(1);
                }
                if let Some(status) = dispatcher.worker_exit()? {
                    if dispatcher.queue().is_empty() {
                        info!("[CONTROLLER] Worker exited ({})", status);
                        return Ok(status.code().unwrap_or(1));
                    }
                }
            }
            signal = tokio::signal::ctrl_c(), if !abort_sent => {
                if let Err(e) = signal {
                    warn!("[CONTROLLER] Ctrl-C handler failed: {}", e);
                }
                abort_sent = true;
                println!("Aborting experiment...");
                if let Err(e) = dispatcher.abort_run() {
                    error!("[CONTROLLER] Failed to signal worker: {}", e);
                }
            }
        }
    }
}

/// Configured worker path, or `labctl-worker` next to this executable.
fn worker_executable(config: &IpcConfig) -> std::io::Result<PathBuf> {
    if let Some(path) = &config.worker_executable {
        return Ok(path.clone());
    }
    let exe = std::env::current_exe()?;
    Ok(exe
        .parent()
        .map(|dir| dir.join(WORKER_BINARY))
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY)))
}
