use log::{error, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// DSN for optional crash reporting. Unset disables Sentry.
pub const SENTRY_DSN_ENV: &str = "LABCTL_SENTRY_DSN";
pub const SENTRY_ENVIRONMENT_ENV: &str = "LABCTL_SENTRY_ENVIRONMENT";

static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY_GUARD: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);

/// Initialize Sentry monitoring with optional DSN.
/// If DSN is None or empty, Sentry will be disabled.
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> bool {
    let dsn_value = match dsn {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("[SENTRY] No DSN provided - Sentry disabled");
            return false;
        }
    };

    let env_cow = environment.map(|e| std::borrow::Cow::Owned(e.to_string()));

    let guard = sentry::init((
        dsn_value,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: env_cow,
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if guard.is_enabled() {
        if let Ok(mut slot) = SENTRY_GUARD.lock() {
            *slot = Some(guard);
        }
        info!("[SENTRY] Initialized - Environment: {:?}", environment);
        true
    } else {
        info!("[SENTRY] Failed to initialize");
        false
    }
}

/// Initialize Sentry from `LABCTL_SENTRY_DSN` / `LABCTL_SENTRY_ENVIRONMENT`.
pub fn init_sentry_from_env() -> bool {
    let dsn = std::env::var(SENTRY_DSN_ENV).ok();
    let environment = std::env::var(SENTRY_ENVIRONMENT_ENV).ok();
    init_sentry(dsn.as_deref(), environment.as_deref())
}

pub fn is_sentry_enabled() -> bool {
    SENTRY_GUARD
        .lock()
        .map(|guard| guard.as_ref().map_or(false, |g| g.is_enabled()))
        .unwrap_or(false)
}

/// Flush pending events and end the session.
pub fn shutdown_sentry() {
    let guard = SENTRY_GUARD.lock().ok().and_then(|mut slot| slot.take());
    if let Some(guard) = guard {
        info!("[SENTRY] Shutting down - flushing events");
        drop(guard);
    }
}

/// Report a failure that ended a run (worker killed, channel torn down).
pub fn capture_critical_error(context: &str, error: &str) {
    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("error_type", "critical");
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Fatal));
            },
            || {
                sentry::capture_message(
                    &format!("[CRITICAL] {}: {}", context, error),
                    sentry::Level::Fatal,
                );
            },
        );
    }
}

/// env_logger with a `Warn` default when `RUST_LOG` is unset.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// Install the panic hook writing to `<data_local_dir>/labctl/crash.log`.
pub fn init_crash_logger() {
    let log_dir = dirs::data_local_dir()
        .map(|dir| dir.join("labctl"))
        .unwrap_or_else(|| PathBuf::from("."));

    let _ = fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("crash.log");

    if let Ok(mut slot) = CRASH_LOG_PATH.lock() {
        *slot = Some(log_path.clone());
    }

    std::panic::set_hook(Box::new(move |panic_info| {
        let crash_msg = format_panic_message(panic_info);

        if is_sentry_enabled() {
            sentry::capture_message(&crash_msg, sentry::Level::Fatal);
        }

        if let Err(e) = write_crash_log(&crash_msg) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }

        error!("\n{}", crash_msg);
    }));

    info!("[CRASH LOGGER] Initialized - Log: {:?}", log_path);
}

fn format_panic_message(panic_info: &std::panic::PanicHookInfo) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    let location = panic_info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "Unknown location".to_string());

    format!(
        r#"
===== PANIC =====
Timestamp: {}
Process: {} (pid {})
Location: {}
Message: {}
Thread: {:?}

Backtrace:
{:?}

"#,
        timestamp,
        process_name(),
        std::process::id(),
        location,
        payload,
        std::thread::current().name().unwrap_or("unnamed"),
        std::backtrace::Backtrace::capture()
    )
}

// Controller and worker share one crash log; tell their entries apart.
fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "labctl".to_string())
}

fn write_crash_log(message: &str) -> std::io::Result<()> {
    let path = CRASH_LOG_PATH.lock().ok().and_then(|slot| slot.clone());
    if let Some(log_path) = path {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        writeln!(file, "{}", message)?;
    }
    Ok(())
}

/// Log a critical error to the crash log without panicking.
pub fn log_critical_error(context: &str, error: &str) {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let message = format!(
        r#"
===== CRITICAL ERROR =====
Timestamp: {}
Process: {} (pid {})
Context: {}
Error: {}

"#,
        timestamp,
        process_name(),
        std::process::id(),
        context,
        error,
    );

    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("context", context);
                scope.set_level(Some(sentry::Level::Error));
            },
            || {
                sentry::capture_message(error, sentry::Level::Error);
            },
        );
    }

    if let Err(e) = write_crash_log(&message) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }

    error!("{}", message);
}

pub fn crash_log_path() -> Option<PathBuf> {
    CRASH_LOG_PATH.lock().ok().and_then(|slot| slot.clone())
}
