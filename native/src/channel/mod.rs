// Byte channel the monitored process writes its SDK log into.
// Named pipe on Windows, FIFO elsewhere; both sit behind `ChannelEndpoint`.

#[cfg(unix)]
pub mod fifo;
#[cfg(windows)]
pub mod named_pipe;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
pub use fifo::{wake_pending, FifoEndpoint as PlatformEndpoint};
#[cfg(windows)]
pub use named_pipe::{wake_pending, NamedPipeEndpoint as PlatformEndpoint};

/// Largest chunk an endpoint hands out in one read.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Default channel name, matching what the SDK tooling expects.
pub const DEFAULT_CHANNEL_NAME: &str = "UHSDK2";

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to create channel at {address}: {source}")]
    Setup {
        address: ChannelAddress,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to connect channel at {address}: {source}")]
    Connect {
        address: ChannelAddress,
        #[source]
        source: std::io::Error,
    },
    #[error("Read failed on {address}: {source}")]
    Read {
        address: ChannelAddress,
        #[source]
        source: std::io::Error,
    },
    #[error("Channel at {0} is not established")]
    NotReady(ChannelAddress),
}

impl ChannelError {
    /// True for failures that happen before a peer is attached.
    pub fn is_setup(&self) -> bool {
        matches!(self, ChannelError::Setup { .. } | ChannelError::Connect { .. })
    }

    /// Short tag for reports, e.g. `"connect"`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ChannelError::Setup { .. } => "setup",
            ChannelError::Connect { .. } => "connect",
            ChannelError::Read { .. } => "read",
            ChannelError::NotReady(_) => "not_ready",
        }
    }
}

/// Well-known location of a channel: a pipe name or a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelAddress(PathBuf);

impl ChannelAddress {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Result of one blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw bytes that may hold several lines (named pipe).
    Bytes(Vec<u8>),
    /// Exactly one line without its terminator (FIFO).
    Line(String),
    /// The writer went away.
    Closed,
}

/// A duplex byte channel read by a single ingestion loop.
///
/// Implementations must be idempotent in `create` and must drop their OS
/// handle in `invalidate` so the next cycle starts from a fresh one.
pub trait ChannelEndpoint: Send {
    fn address(&self) -> &ChannelAddress;

    /// Establish the channel at its address.
    fn create(&mut self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Wait until a writer is attached.
    fn accept(&mut self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Wait for the next chunk of data.
    fn read_chunk(&mut self) -> impl Future<Output = Result<Chunk, ChannelError>> + Send;

    /// Drop the current handle after a failure or at shutdown.
    fn invalidate(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let address = ChannelAddress::new("/tmp/uh-telemetry-x/UHSDK2");
        let io = || std::io::Error::from(std::io::ErrorKind::BrokenPipe);

        let connect = ChannelError::Connect {
            address: address.clone(),
            source: io(),
        };
        assert!(connect.is_setup());
        assert_eq!(connect.kind_name(), "connect");

        let read = ChannelError::Read {
            address: address.clone(),
            source: io(),
        };
        assert!(!read.is_setup());
        assert_eq!(read.kind_name(), "read");

        assert_eq!(ChannelError::NotReady(address).kind_name(), "not_ready");
    }
}
