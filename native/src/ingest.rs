//! Ingestion loop feeding the sample buffer and the broadcaster.
//!
//! The loop owns the channel endpoint and cycles through
//! `Disconnected -> Connecting -> Reading`, dropping back to `Disconnected`
//! whenever the writer goes away or a read fails. It runs on a dedicated
//! thread with its own current-thread runtime, see [`IngestionHandle`].

use crate::broadcast::Broadcaster;
use crate::buffer::SampleBuffer;
use crate::channel::{self, ChannelAddress, ChannelEndpoint, ChannelError, Chunk};
use crate::logging;
use crate::parser::{chunk_lines, parse_line};
use crate::sample::Sample;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Default wait for the ingest thread to acknowledge a stop request.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

// Time given to a FIFO open still parked in a blocking task after stop.
// `IngestionHandle::stop` keeps waking the channel during this window.
const BLOCKING_TASK_GRACE: Duration = Duration::from_millis(250);

const WAKE_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// What to do with lines that carry no control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Record a null sample so the buffer keeps one slot per log line.
    #[default]
    RecordNull,
    /// Ignore the line entirely.
    Skip,
}

/// Connection state of the ingestion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IngestState {
    Disconnected = 0,
    Connecting = 1,
    Reading = 2,
    Stopped = 3,
}

impl IngestState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => IngestState::Connecting,
            2 => IngestState::Reading,
            3 => IngestState::Stopped,
            _ => IngestState::Disconnected,
        }
    }
}

#[derive(Default)]
struct IngestCounters {
    lines: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    reconnects: AtomicU64,
    read_errors: AtomicU64,
    setup_errors: AtomicU64,
}

/// Point-in-time copy of the ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub reconnects: u64,
    pub read_errors: u64,
    pub setup_errors: u64,
}

/// Read-only view of a running loop, shareable across threads.
#[derive(Clone)]
pub struct IngestMonitor {
    state: Arc<AtomicU8>,
    counters: Arc<IngestCounters>,
}

impl IngestMonitor {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(IngestState::Disconnected as u8)),
            counters: Arc::new(IngestCounters::default()),
        }
    }

    pub fn state(&self) -> IngestState {
        IngestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            lines: c.lines.load(Ordering::Relaxed),
            matched: c.matched.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            setup_errors: c.setup_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub unmatched: UnmatchedPolicy,
    /// First delay after a failed connect; doubles up to `retry_max`.
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            unmatched: UnmatchedPolicy::RecordNull,
            retry_initial: Duration::from_millis(250),
            retry_max: Duration::from_secs(5),
        }
    }
}

enum ReadExit {
    Shutdown,
    Closed,
    Failed(ChannelError),
}

pub struct IngestionLoop<E> {
    endpoint: E,
    buffer: Arc<SampleBuffer>,
    broadcaster: Arc<Broadcaster>,
    options: IngestOptions,
    monitor: IngestMonitor,
}

impl<E: ChannelEndpoint> IngestionLoop<E> {
    pub fn new(
        endpoint: E,
        buffer: Arc<SampleBuffer>,
        broadcaster: Arc<Broadcaster>,
        options: IngestOptions,
    ) -> Self {
        Self {
            endpoint,
            buffer,
            broadcaster,
            options,
            monitor: IngestMonitor::new(),
        }
    }

    pub fn monitor(&self) -> IngestMonitor {
        self.monitor.clone()
    }

    pub fn address(&self) -> &ChannelAddress {
        self.endpoint.address()
    }

    fn set_state(&self, state: IngestState) {
        self.monitor.state.store(state as u8, Ordering::Release);
    }

    /// Run until `shutdown` flips to true or its sender is dropped, then hand
    /// the endpoint back so the caller decides when the channel goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> E {
        info!("[INGEST] Reading telemetry from {}", self.endpoint.address());
        let mut backoff = self.options.retry_initial;

        while !*shutdown.borrow() {
            self.set_state(IngestState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                result = connect(&mut self.endpoint) => result,
            };

            if let Err(e) = connected {
                self.monitor.counters.setup_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[INGEST] {} - retrying in {:?}", e, backoff);
                // Report the first failure of a streak only.
                if backoff == self.options.retry_initial {
                    logging::capture_channel_error(&e);
                }
                self.endpoint.invalidate();
                self.set_state(IngestState::Disconnected);

                if !pause(&mut shutdown, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(self.options.retry_max);
                continue;
            }

            self.set_state(IngestState::Reading);
            let (exit, chunks) = self.read_until_closed(&mut shutdown).await;
            self.endpoint.invalidate();
            self.set_state(IngestState::Disconnected);

            match exit {
                ReadExit::Shutdown => break,
                ReadExit::Closed => {
                    info!(
                        "[INGEST] Writer closed {} - waiting for the next one",
                        self.endpoint.address()
                    );
                }
                ReadExit::Failed(e) => {
                    self.monitor.counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("[INGEST] {} - re-establishing channel", e);
                    logging::capture_channel_error(&e);
                }
            }
            self.monitor.counters.reconnects.fetch_add(1, Ordering::Relaxed);

            if chunks > 0 {
                backoff = self.options.retry_initial;
            } else {
                // A session that ends before delivering anything would
                // otherwise spin on an endpoint that keeps failing fast.
                if !pause(&mut shutdown, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(self.options.retry_max);
            }
        }

        self.endpoint.invalidate();
        self.set_state(IngestState::Stopped);
        info!("[INGEST] Stopped reading {}", self.endpoint.address());
        self.endpoint
    }

    async fn read_until_closed(&mut self, shutdown: &mut watch::Receiver<bool>) -> (ReadExit, u64) {
        let mut chunks = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = stopped(shutdown) => return (ReadExit::Shutdown, chunks),
                chunk = self.endpoint.read_chunk() => chunk,
            };

            match chunk {
                Ok(Chunk::Bytes(bytes)) => {
                    for line in chunk_lines(&bytes) {
                        self.ingest_line(&line);
                    }
                }
                Ok(Chunk::Line(line)) => self.ingest_line(&line),
                Ok(Chunk::Closed) => return (ReadExit::Closed, chunks),
                Err(e) => return (ReadExit::Failed(e), chunks),
            }
            chunks += 1;

            if *shutdown.borrow() {
                return (ReadExit::Shutdown, chunks);
            }
        }
    }

    fn ingest_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let counters = &self.monitor.counters;
        counters.lines.fetch_add(1, Ordering::Relaxed);

        match parse_line(line) {
            Some(sample) => {
                counters.matched.fetch_add(1, Ordering::Relaxed);
                self.buffer.record(sample);
                self.broadcaster.publish(&sample);
            }
            None => {
                counters.unmatched.fetch_add(1, Ordering::Relaxed);
                trace!("[INGEST] No control point in: {}", line);
                if self.options.unmatched == UnmatchedPolicy::RecordNull {
                    self.buffer.record(Sample::NULL);
                }
            }
        }
    }
}

async fn connect<E: ChannelEndpoint>(endpoint: &mut E) -> Result<(), ChannelError> {
    endpoint.create().await?;
    endpoint.accept().await
}

/// Resolves once a stop has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless stopped first. Returns false when stopped.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stopped(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Ingestion loop running on its own thread.
pub struct IngestionHandle {
    address: ChannelAddress,
    monitor: IngestMonitor,
    shutdown_tx: watch::Sender<bool>,
    done_rx: std_mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl IngestionHandle {
    /// Start `ingestion` on a dedicated `telemetry-ingest` thread.
    pub fn spawn<E>(ingestion: IngestionLoop<E>) -> io::Result<Self>
    where
        E: ChannelEndpoint + 'static,
    {
        let address = ingestion.address().clone();
        let monitor = ingestion.monitor();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = std_mpsc::channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = thread::Builder::new()
            .name("telemetry-ingest".to_string())
            .spawn(move || {
                let endpoint = runtime.block_on(ingestion.run(shutdown_rx));
                // An open() abandoned by the loop can still be parked on the
                // channel; keep the channel until it has been released.
                runtime.shutdown_timeout(BLOCKING_TASK_GRACE);
                drop(endpoint);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            address,
            monitor,
            shutdown_tx,
            done_rx,
            thread: Some(thread),
        })
    }

    pub fn monitor(&self) -> &IngestMonitor {
        &self.monitor
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Request a stop and wait up to `timeout` for the loop to finish.
    ///
    /// Returns false if the thread had to be detached. Calling it again after
    /// the thread is gone is a no-op returning true.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        info!("[INGEST] Stop requested");
        let _ = self.shutdown_tx.send(true);

        // The loop may not have parked in open() yet when the first wake
        // lands, so keep waking until it reports done.
        let deadline = Instant::now() + timeout;
        loop {
            channel::wake_pending(&self.address);
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.done_rx.recv_timeout(remaining.min(WAKE_RETRY_INTERVAL)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if thread.join().is_err() {
                        warn!("[INGEST] Ingest thread panicked");
                    }
                    debug!("[INGEST] Ingest thread joined");
                    return true;
                }
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                    warn!(
                        "[INGEST] Ingest thread did not stop within {:?} - detaching",
                        timeout
                    );
                    return false;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

impl Drop for IngestionHandle {
    fn drop(&mut self) {
        self.stop(DEFAULT_STOP_TIMEOUT);
    }
}
