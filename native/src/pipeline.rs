//! Wiring of channel, ingestion loop, sample buffer and push server.

use crate::broadcast::{Broadcaster, PushServer, PushServerStatus, PushStats, SubscriberSet};
use crate::buffer::SampleBuffer;
use crate::channel::{ChannelAddress, ChannelEndpoint, ChannelError, PlatformEndpoint};
use crate::config::PipelineConfig;
use crate::environment::MonitoredEnvironment;
use crate::ingest::{IngestState, IngestStats, IngestionHandle, IngestionLoop};
use log::{info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to create Tokio runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("Failed to start ingest thread: {0}")]
    Thread(#[source] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Push server error: {0}")]
    Push(#[source] io::Error),
    #[error("Pipeline already running")]
    AlreadyRunning,
}

/// Owns every running part of the relay.
///
/// Meant to be driven from synchronous code: it owns a Tokio runtime and
/// must not be dropped from inside an async context.
pub struct Pipeline {
    config: PipelineConfig,
    buffer: Arc<SampleBuffer>,
    broadcaster: Arc<Broadcaster>,
    runtime: tokio::runtime::Runtime,
    address: Option<ChannelAddress>,
    ingest: Option<IngestionHandle>,
    push: Option<PushServer>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("telemetry-push")
            .enable_all()
            .build()
            .map_err(PipelineError::Runtime)?;

        let subscribers = Arc::new(SubscriberSet::new(config.subscriber_queue));
        let broadcaster = Arc::new(Broadcaster::new(subscribers, config.push_intensity));
        let buffer = Arc::new(SampleBuffer::new(config.buffer_capacity));

        Ok(Self {
            config,
            buffer,
            broadcaster,
            runtime,
            address: None,
            ingest: None,
            push: None,
        })
    }

    /// Create the channel, start ingesting and, if configured, start pushing.
    pub fn start(&mut self) -> Result<ChannelAddress, PipelineError> {
        if self.ingest.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let mut endpoint = match &self.config.channel_path {
            Some(path) => PlatformEndpoint::at(path.clone()),
            None => PlatformEndpoint::with_name(&self.config.channel_name)?,
        };
        let address = endpoint.address().clone();

        // Create up front so the channel exists before anyone is told about it.
        if let Err(e) = self.runtime.block_on(endpoint.create()) {
            warn!("[PIPELINE] {} - the ingest loop will keep retrying", e);
        }

        // Nothing is committed until both halves are up.
        if self.config.push_enabled {
            self.enable_push()?;
        }

        let ingestion = IngestionLoop::new(
            endpoint,
            Arc::clone(&self.buffer),
            Arc::clone(&self.broadcaster),
            self.config.ingest_options(),
        );
        let handle = match IngestionHandle::spawn(ingestion) {
            Ok(handle) => handle,
            Err(e) => {
                self.disable_push();
                return Err(PipelineError::Thread(e));
            }
        };
        self.ingest = Some(handle);
        self.address = Some(address.clone());

        info!("[PIPELINE] Started - channel {}", address);
        Ok(address)
    }

    /// Start the push server. Returns the bound address, or `None` when the
    /// port already belongs to another server.
    pub fn enable_push(&mut self) -> Result<Option<SocketAddr>, PipelineError> {
        if let Some(server) = &self.push {
            return Ok(Some(server.local_addr()));
        }

        let status = self
            .runtime
            .block_on(PushServer::bind(
                self.config.push_bind,
                Arc::clone(&self.broadcaster),
            ))
            .map_err(PipelineError::Push)?;

        match status {
            PushServerStatus::Listening(server) => {
                let addr = server.local_addr();
                self.push = Some(server);
                Ok(Some(addr))
            }
            PushServerStatus::AlreadyRunning => Ok(None),
        }
    }

    pub fn disable_push(&mut self) {
        if let Some(server) = self.push.take() {
            self.runtime.block_on(server.shutdown());
        }
    }

    /// Stop pushing and ingesting. Returns false if the ingest thread had to
    /// be detached after the configured timeout.
    pub fn stop(&mut self) -> bool {
        self.disable_push();

        let stopped = match self.ingest.as_mut() {
            Some(handle) => handle.stop(self.config.stop_timeout()),
            None => true,
        };
        self.ingest = None;
        self.address = None;

        info!("[PIPELINE] Stopped");
        stopped
    }

    pub fn buffer(&self) -> Arc<SampleBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn channel_address(&self) -> Option<&ChannelAddress> {
        self.address.as_ref()
    }

    pub fn push_addr(&self) -> Option<SocketAddr> {
        self.push.as_ref().map(PushServer::local_addr)
    }

    /// Environment the monitored process needs to log into this pipeline.
    pub fn monitored_environment(&self) -> Option<MonitoredEnvironment> {
        self.address
            .as_ref()
            .map(|address| MonitoredEnvironment::new(address.clone(), self.config.sdk_log_level))
    }

    pub fn ingest_state(&self) -> IngestState {
        self.ingest
            .as_ref()
            .map(|handle| handle.monitor().state())
            .unwrap_or(IngestState::Stopped)
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.ingest
            .as_ref()
            .map(|handle| handle.monitor().stats())
            .unwrap_or_default()
    }

    pub fn push_stats(&self) -> PushStats {
        self.broadcaster.stats()
    }

    /// Run a future on the pipeline's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Dropping the server closes its shutdown channel, which ends the
        // accept loop and every session without blocking here.
        self.push = None;
        if let Some(mut handle) = self.ingest.take() {
            handle.stop(self.config.stop_timeout());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn local_config(dir: &tempfile::TempDir) -> PipelineConfig {
        PipelineConfig {
            channel_path: Some(dir.path().join("relay.fifo")),
            push_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            stop_timeout_ms: 1_000,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_idle_pipeline() {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        assert_eq!(pipeline.ingest_state(), IngestState::Stopped);
        assert_eq!(pipeline.ingest_stats(), IngestStats::default());
        assert!(pipeline.monitored_environment().is_none());
        assert!(pipeline.push_addr().is_none());
        assert!(pipeline.buffer().is_empty());
    }

    #[test]
    fn test_start_creates_channel_and_push() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(local_config(&dir)).unwrap();

        let address = pipeline.start().unwrap();
        assert_eq!(address.as_path(), dir.path().join("relay.fifo"));
        assert!(address.as_path().exists());

        let push = pipeline.push_addr().unwrap();
        assert_ne!(push.port(), 0);

        let env = pipeline.monitored_environment().unwrap();
        assert_eq!(env.destination(), &address);

        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
        assert!(pipeline.stop());
        assert_eq!(pipeline.ingest_state(), IngestState::Stopped);
    }

    #[test]
    fn test_failed_push_bind_leaves_pipeline_idle() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            // TEST-NET-1, never assigned to a local interface.
            push_bind: "192.0.2.1:0".parse().unwrap(),
            ..local_config(&dir)
        };
        let mut pipeline = Pipeline::new(config).unwrap();

        assert!(matches!(pipeline.start(), Err(PipelineError::Push(_))));
        assert_eq!(pipeline.ingest_state(), IngestState::Stopped);
        assert!(pipeline.channel_address().is_none());
        assert!(pipeline.push_addr().is_none());

        // A retry fails the same way instead of reporting a running pipeline.
        assert!(matches!(pipeline.start(), Err(PipelineError::Push(_))));
    }

    #[test]
    fn test_toggle_push() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            push_enabled: false,
            ..local_config(&dir)
        };
        let mut pipeline = Pipeline::new(config).unwrap();
        pipeline.start().unwrap();
        assert!(pipeline.push_addr().is_none());

        let first = pipeline.enable_push().unwrap();
        assert!(first.is_some());
        assert_eq!(pipeline.enable_push().unwrap(), first);

        pipeline.disable_push();
        assert!(pipeline.push_addr().is_none());
        assert!(pipeline.stop());
    }
}
