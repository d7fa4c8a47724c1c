// Named pipe channel for Windows hosts, built on Tokio's pipe server.

use super::{ChannelAddress, ChannelEndpoint, ChannelError, Chunk, MAX_CHUNK_BYTES};
use log::{debug, info, warn};
use std::io;
use tokio::io::AsyncReadExt;
use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};

const PIPE_PREFIX: &str = r"\\.\pipe\";

pub struct NamedPipeEndpoint {
    address: ChannelAddress,
    server: Option<NamedPipeServer>,
    connected: bool,
    buffer: Vec<u8>,
}

impl NamedPipeEndpoint {
    /// Pipe `\\.\pipe\<name>`.
    pub fn with_name(name: &str) -> Result<Self, ChannelError> {
        Ok(Self::at(format!("{}{}", PIPE_PREFIX, name)))
    }

    /// Pipe at a fully qualified pipe path.
    pub fn at(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            address: ChannelAddress::new(path),
            server: None,
            connected: false,
            buffer: vec![0u8; MAX_CHUNK_BYTES],
        }
    }
}

impl ChannelEndpoint for NamedPipeEndpoint {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    async fn create(&mut self) -> Result<(), ChannelError> {
        if self.server.is_some() {
            return Ok(());
        }

        let server = ServerOptions::new()
            .access_inbound(true)
            .access_outbound(true)
            .pipe_mode(PipeMode::Message)
            .in_buffer_size(MAX_CHUNK_BYTES as u32)
            .out_buffer_size(MAX_CHUNK_BYTES as u32)
            .create(self.address.as_path())
            .map_err(|source| {
                if source.kind() == io::ErrorKind::PermissionDenied {
                    warn!(
                        "[CHANNEL] Pipe {} already exists and is owned elsewhere",
                        self.address
                    );
                }
                ChannelError::Setup {
                    address: self.address.clone(),
                    source,
                }
            })?;

        info!("[CHANNEL] Created named pipe {}", self.address);
        self.server = Some(server);
        self.connected = false;
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), ChannelError> {
        if self.connected {
            return Ok(());
        }

        let server = self
            .server
            .as_ref()
            .ok_or_else(|| ChannelError::NotReady(self.address.clone()))?;

        debug!("[CHANNEL] Waiting for a client on {}", self.address);
        server
            .connect()
            .await
            .map_err(|source| ChannelError::Connect {
                address: self.address.clone(),
                source,
            })?;

        self.connected = true;
        info!("[CHANNEL] Client connected to {}", self.address);
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Chunk, ChannelError> {
        let server = match (self.server.as_mut(), self.connected) {
            (Some(server), true) => server,
            _ => return Err(ChannelError::NotReady(self.address.clone())),
        };

        let read = server
            .read(&mut self.buffer)
            .await
            .map_err(|source| ChannelError::Read {
                address: self.address.clone(),
                source,
            })?;

        if read == 0 {
            return Ok(Chunk::Closed);
        }

        Ok(Chunk::Bytes(self.buffer[..read].to_vec()))
    }

    fn invalidate(&mut self) {
        if let Some(server) = self.server.take() {
            if self.connected {
                let _ = server.disconnect();
            }
            debug!("[CHANNEL] Closed pipe handle {}", self.address);
        }
        self.connected = false;
    }
}

/// Pending `connect()` calls are cancelled with the task that awaits them, so
/// there is nothing to release on this platform.
pub fn wake_pending(_address: &ChannelAddress) {}
