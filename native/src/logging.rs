//! Log output, crash file and optional Sentry reporting for the relay.
//!
//! Log lines carry the thread name because the relay's work is split across
//! `telemetry-ingest`, `telemetry-push` and the main thread.

use crate::channel::{ChannelAddress, ChannelError};
use log::{error, info, warn, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SENTRY_DSN_VAR: &str = "RELAY_SENTRY_DSN";
pub const SENTRY_ENVIRONMENT_VAR: &str = "SENTRY_ENVIRONMENT";

const CRASH_LOG_DIR: &str = "UHTelemetryRelay";
const CRASH_LOG_FILE: &str = "relay_crash.log";

static CRASH_LOG: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);
// Channel and push endpoint, appended to every crash entry.
static RELAY_CONTEXT: Mutex<Option<String>> = Mutex::new(None);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Install env_logger. `RUST_LOG` wins; otherwise `info`.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Info);
    }

    builder.format(|buf, record| {
        let thread = std::thread::current();
        writeln!(
            buf,
            "{} [{}] ({}) {}: {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            thread.name().unwrap_or("unnamed"),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// Start Sentry from `RELAY_SENTRY_DSN` / `SENTRY_ENVIRONMENT`.
pub fn init_sentry_from_env() -> bool {
    let dsn = std::env::var(SENTRY_DSN_VAR).ok();
    let environment = std::env::var(SENTRY_ENVIRONMENT_VAR).ok();
    init_sentry(dsn.as_deref(), environment.as_deref())
}

/// Start Sentry. A missing or empty DSN leaves it disabled.
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> bool {
    let Some(dsn) = dsn.filter(|d| !d.is_empty()) else {
        info!("[SENTRY] Disabled (no {} configured)", SENTRY_DSN_VAR);
        return false;
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: environment.map(|e| e.to_string().into()),
            attach_stacktrace: true,
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if !guard.is_enabled() {
        warn!("[SENTRY] Client did not start");
        return false;
    }

    sentry::configure_scope(|scope| scope.set_tag("component", "uh-relay"));
    *lock(&SENTRY) = Some(guard);
    info!("[SENTRY] Initialized - Environment: {:?}", environment);
    true
}

pub fn is_sentry_enabled() -> bool {
    lock(&SENTRY).as_ref().is_some_and(|guard| guard.is_enabled())
}

/// Flush pending events and close the Sentry client.
pub fn shutdown_sentry() {
    if let Some(guard) = lock(&SENTRY).take() {
        info!("[SENTRY] Flushing events");
        drop(guard);
    }
}

/// Attach the running channel and push endpoint to crash entries and to
/// every Sentry event.
pub fn set_relay_context(channel: &ChannelAddress, push: Option<SocketAddr>) {
    let push = push.map_or_else(|| "disabled".to_string(), |addr| addr.to_string());
    *lock(&RELAY_CONTEXT) = Some(format!("Channel: {}\nPush: {}", channel, push));

    if is_sentry_enabled() {
        sentry::configure_scope(|scope| {
            scope.set_tag("channel", channel.to_string());
            scope.set_tag("push", &push);
        });
    }
}

/// Send a channel failure to Sentry, tagged with its kind.
pub fn capture_channel_error(err: &ChannelError) {
    if !is_sentry_enabled() {
        return;
    }
    sentry::with_scope(
        |scope| {
            scope.set_tag("channel_error", err.kind_name());
            scope.set_level(Some(sentry::Level::Error));
        },
        || {
            sentry::capture_message(&err.to_string(), sentry::Level::Error);
        },
    );
}

/// An error that stops the relay: logged, written to the crash file and
/// sent to Sentry as fatal.
pub fn log_critical_error(context: &str, message: &str) {
    error!("[{}] {}", context, message);

    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| scope.set_tag("context", context),
            || {
                sentry::capture_message(
                    &format!("{}: {}", context, message),
                    sentry::Level::Fatal,
                );
            },
        );
    }

    let entry = crash_entry("CRITICAL ERROR", &format!("Context: {}\nError: {}", context, message));
    if let Err(e) = append_crash_log(&entry) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }
}

/// Record panics in `<local data>/UHTelemetryRelay/relay_crash.log`.
///
/// Sentry's own panic integration reports the panic when it is enabled, so
/// the hook only writes the file and the log.
pub fn init_crash_logger() {
    let dir = dirs::data_local_dir()
        .map(|base| base.join(CRASH_LOG_DIR))
        .unwrap_or_else(|| PathBuf::from("."));
    init_crash_logger_at(&dir);
}

fn init_crash_logger_at(dir: &Path) {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("[CRASH LOGGER] Cannot create {}: {}", dir.display(), e);
    }
    let path = dir.join(CRASH_LOG_FILE);
    *lock(&CRASH_LOG) = Some(path.clone());

    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let entry = crash_entry(
            "RELAY PANIC",
            &format!(
                "Location: {}\nMessage: {}\n\nBacktrace:\n{}",
                location,
                panic_payload(info.payload()),
                std::backtrace::Backtrace::capture()
            ),
        );

        if let Err(e) = append_crash_log(&entry) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }
        error!("\n{}", entry);
    }));

    info!("[CRASH LOGGER] Writing to {}", path.display());
}

fn panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn crash_entry(title: &str, body: &str) -> String {
    let context = lock(&RELAY_CONTEXT)
        .clone()
        .unwrap_or_else(|| "Channel: not started".to_string());
    format!(
        "===== {} =====\nTimestamp: {}\nThread: {}\n{}\n{}\n",
        title,
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        std::thread::current().name().unwrap_or("unnamed"),
        context,
        body
    )
}

fn append_crash_log(entry: &str) -> std::io::Result<()> {
    let Some(path) = lock(&CRASH_LOG).clone() else {
        return Ok(());
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", entry)
}
