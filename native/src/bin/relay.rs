extern crate uh_telemetry_relay;
use clap::Parser;
use log::{debug, error, info, warn};

#[path = "relay_modules/cli.rs"]
mod cli;

use std::process::{Child, ExitCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uh_telemetry_relay::logging;
use uh_telemetry_relay::{Pipeline, PipelineConfig, SampleBuffer};

const DISPLAY_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let args = cli::CliArgs::parse();

    logging::init_logger();
    logging::init_crash_logger();

    logging::init_sentry_from_env();

    info!("[RELAY] UH telemetry relay v{}", uh_telemetry_relay::get_version());

    let code = match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::log_critical_error("Relay", &e);
            ExitCode::FAILURE
        }
    };

    logging::shutdown_sentry();
    code
}

fn run(args: &cli::CliArgs) -> Result<(), String> {
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path).and_then(PipelineConfig::with_env),
        None => PipelineConfig::from_env(),
    }
    .map_err(|e| format!("Invalid configuration: {}", e))?;

    let mut pipeline = Pipeline::new(config).map_err(|e| e.to_string())?;
    let address = pipeline.start().map_err(|e| e.to_string())?;
    logging::set_relay_context(&address, pipeline.push_addr());

    let environment = pipeline
        .monitored_environment()
        .ok_or_else(|| format!("No channel environment for {}", address))?;
    environment.export();

    let mut child = match (&args.exe, args.auto_launch) {
        (Some(exe), true) => match environment.launch(exe) {
            Ok(child) => Some(child),
            Err(e) => {
                error!("[RELAY] {}", e);
                None
            }
        },
        (Some(exe), false) => {
            info!(
                "[RELAY] Start {} with the exported environment to begin relaying",
                exe.display()
            );
            None
        }
        _ => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let display = spawn_display_poller(pipeline.buffer(), Arc::clone(&running));

    info!("[RELAY] Running - press Ctrl+C to stop");
    if let Err(e) = pipeline.block_on(tokio::signal::ctrl_c()) {
        warn!("[RELAY] Failed to listen for Ctrl+C: {}", e);
    }

    info!("[RELAY] Shutting down...");
    running.store(false, Ordering::Release);
    if let Some(handle) = display {
        let _ = handle.join();
    }

    if !pipeline.stop() {
        warn!("[RELAY] Ingest thread detached during shutdown");
    }

    if args.kill_on_exit {
        if let Some(child) = child.as_mut() {
            kill_child(child);
        }
    }

    let stats = pipeline.ingest_stats();
    let push = pipeline.push_stats();
    info!(
        "[RELAY] Shutdown complete - {} lines, {} matched, {} reconnects, {} pushed, {} subscribers dropped",
        stats.lines, stats.matched, stats.reconnects, push.published, push.dropped
    );
    Ok(())
}

/// Log the newest sample at debug level until `running` clears. Frames with
/// nothing new are skipped.
fn spawn_display_poller(
    buffer: Arc<SampleBuffer>,
    running: Arc<AtomicBool>,
) -> Option<thread::JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("telemetry-display".to_string())
        .spawn(move || {
            let mut shown = 0;
            while running.load(Ordering::Acquire) {
                let recorded = buffer.recorded_total();
                if recorded == shown {
                    thread::sleep(DISPLAY_INTERVAL);
                    continue;
                }
                shown = recorded;

                if let Some(sample) = buffer.latest() {
                    debug!(
                        "[DISPLAY] x={:.4} y={:.4} z={:.4} intensity={:.3} ({} buffered)",
                        sample.x,
                        sample.y,
                        sample.z,
                        sample.intensity,
                        buffer.len()
                    );
                }
                thread::sleep(DISPLAY_INTERVAL);
            }
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("[RELAY] Display poller not started: {}", e);
            None
        }
    }
}

fn kill_child(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!("[RELAY] Monitored process already exited: {}", status),
        _ => {
            if let Err(e) = child.kill() {
                warn!("[RELAY] Failed to stop monitored process: {}", e);
            } else {
                let _ = child.wait();
                info!("[RELAY] Monitored process stopped");
            }
        }
    }
}
