pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gui;
pub mod ipc;
pub mod logging;
pub mod measurement;
pub mod shm;

use log::info;

pub use cancel::{install_termination_handler, CancelToken};
pub use config::{ConfigError, IpcConfig};
pub use dispatcher::{Dispatcher, TickReport};
pub use error::{CommError, CommResult};
pub use gui::{DataSink, GuiCollaborator};
pub use measurement::MeasurementBlock;

/// Logging, crash log and optional Sentry, in the order both binaries need
/// them. Returns whether Sentry is active.
pub fn init_diagnostics(process: &str) -> bool {
    logging::init_logger();
    logging::init_crash_logger();

    let sentry = logging::init_sentry_from_env();
    info!(
        "[INIT] {} {} starting (sentry: {})",
        process,
        get_version(),
        if sentry { "on" } else { "off" }
    );
    sentry
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
