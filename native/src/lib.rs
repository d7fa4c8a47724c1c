//! Telemetry relay for the Ultrahaptics SDK log stream.
//!
//! The monitored process writes its log into a local channel (a named pipe on
//! Windows, a FIFO elsewhere). Each control-point line is parsed into a
//! [`Sample`], kept in a bounded [`SampleBuffer`] and pushed to WebSocket
//! subscribers.

pub mod broadcast;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod environment;
pub mod ingest;
pub mod logging;
pub mod parser;
pub mod pipeline;
pub mod sample;

pub use broadcast::{
    Broadcaster, PushMessage, PushServer, PushStats, SubscriberSet, Subscription,
};
pub use buffer::SampleBuffer;
pub use channel::{ChannelAddress, ChannelEndpoint, ChannelError, PlatformEndpoint};
pub use config::{ConfigError, PipelineConfig};
pub use environment::{LaunchError, MonitoredEnvironment};
pub use ingest::{IngestState, IngestStats, UnmatchedPolicy};
pub use parser::parse_line;
pub use pipeline::{Pipeline, PipelineError};
pub use sample::Sample;

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
