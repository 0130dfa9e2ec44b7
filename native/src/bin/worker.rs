extern crate labctl;
use log::{error, info, warn};

#[path = "worker_modules/script.rs"]
mod script;

use labctl::ipc::WorkerPeer;
use labctl::{install_termination_handler, logging, CancelToken, CommError};
use script::Script;
use std::path::{Path, PathBuf};

// Conventional status for a process ended by SIGTERM.
const EXIT_TERMINATED: i32 = 128 + 15;

fn main() {
    // Load or ignore .env file
    let _ = dotenvy::dotenv();
    labctl::init_diagnostics("labctl-worker");

    let script = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: labctl-worker <script.json> (started by labctl-controller)");
            std::process::exit(2);
        }
    };

    let code = match run(&script) {
        Ok(()) => 0,
        Err(e) => match e.downcast_ref::<CommError>() {
            Some(CommError::Cancelled) => {
                warn!("[WORKER] Run cancelled by the controller");
                EXIT_TERMINATED
            }
            _ => {
                error!("[WORKER] Run failed: {}", e);
                logging::log_critical_error("worker", &e.to_string());
                1
            }
        },
    };

    logging::shutdown_sentry();
    std::process::exit(code);
}

fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let script = Script::load(path)?;
    let cancel = install_termination_handler(&CancelToken::new())?;
    let mut peer = WorkerPeer::from_env(cancel)?;

    info!(
        "[WORKER] Running {} ({} steps)",
        path.display(),
        script.steps.len()
    );
    script.run(&mut peer)?;
    Ok(())
}
