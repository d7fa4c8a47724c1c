// FIFO channel for Unix hosts. The SDK opens the path for writing and emits
// one log line per write.

use super::{ChannelAddress, ChannelEndpoint, ChannelError, Chunk, MAX_CHUNK_BYTES};
use log::{debug, info, warn};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::unix::pipe;

const FIFO_MODE: libc::mode_t = 0o600;

pub struct FifoEndpoint {
    address: ChannelAddress,
    // Private directory owning the FIFO; removed when the endpoint is dropped.
    _dir: Option<TempDir>,
    created: bool,
    reader: Option<BufReader<pipe::Receiver>>,
    // Partial line carried between reads.
    pending: Vec<u8>,
}

impl FifoEndpoint {
    /// FIFO named `name` inside a fresh private temp directory.
    pub fn with_name(name: &str) -> Result<Self, ChannelError> {
        let dir = tempfile::Builder::new()
            .prefix("uh-telemetry-")
            .tempdir()
            .map_err(|source| ChannelError::Setup {
                address: ChannelAddress::new(std::env::temp_dir().join(name)),
                source,
            })?;

        let address = ChannelAddress::new(dir.path().join(name));
        Ok(Self {
            address,
            _dir: Some(dir),
            created: false,
            reader: None,
            pending: Vec::new(),
        })
    }

    /// FIFO at an explicit path. The path is left in place on drop.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            address: ChannelAddress::new(path),
            _dir: None,
            created: false,
            reader: None,
            pending: Vec::new(),
        }
    }

    fn setup_error(&self, source: io::Error) -> ChannelError {
        ChannelError::Setup {
            address: self.address.clone(),
            source,
        }
    }
}

impl ChannelEndpoint for FifoEndpoint {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    async fn create(&mut self) -> Result<(), ChannelError> {
        let path = self.address.as_path();
        if self.created && is_fifo(path) {
            return Ok(());
        }

        match make_fifo(path) {
            Ok(()) => info!("[CHANNEL] Created FIFO at {}", self.address),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_fifo(path) {
                    return Err(self.setup_error(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "path exists and is not a FIFO",
                    )));
                }
                warn!("[CHANNEL] FIFO {} already exists, reusing it", self.address);
            }
            Err(e) => return Err(self.setup_error(e)),
        }

        self.created = true;
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), ChannelError> {
        if self.reader.is_some() {
            return Ok(());
        }

        debug!("[CHANNEL] Waiting for a writer on {}", self.address);

        // open(2) on a FIFO blocks until the other end is opened.
        let path = self.address.as_path().to_path_buf();
        let opened = tokio::task::spawn_blocking(move || fs::File::open(path))
            .await
            .map_err(io::Error::other)
            .and_then(|result| result)
            .and_then(pipe::Receiver::from_file);

        let receiver = opened.map_err(|source| ChannelError::Connect {
            address: self.address.clone(),
            source,
        })?;

        self.reader = Some(BufReader::with_capacity(MAX_CHUNK_BYTES, receiver));
        self.pending.clear();
        info!("[CHANNEL] Writer attached to {}", self.address);
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Chunk, ChannelError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ChannelError::NotReady(self.address.clone()))?;

        // A line longer than MAX_CHUNK_BYTES is handed out in pieces.
        if self.pending.len() < MAX_CHUNK_BYTES {
            let limit = (MAX_CHUNK_BYTES - self.pending.len()) as u64;
            let read = reader
                .take(limit)
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(|source| ChannelError::Read {
                    address: self.address.clone(),
                    source,
                })?;

            if read == 0 && self.pending.is_empty() {
                return Ok(Chunk::Closed);
            }
        }

        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.pending.clear();
        Ok(Chunk::Line(line))
    }

    fn invalidate(&mut self) {
        if self.reader.take().is_some() {
            debug!("[CHANNEL] Closed reader on {}", self.address);
        }
        self.pending.clear();
    }
}

/// Unblock a reader parked in `open()` on this FIFO.
///
/// Opening the write end without blocking succeeds only while a reader is
/// waiting, which releases it; otherwise this is a no-op.
pub fn wake_pending(address: &ChannelAddress) {
    match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(address.as_path())
    {
        Ok(_) => debug!("[CHANNEL] Released pending reader on {}", address),
        Err(e) => debug!("[CHANNEL] No pending reader on {}: {}", address, e),
    }
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: c_path is a valid NUL-terminated string for the whole call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn is_fifo(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry");

        let mut endpoint = FifoEndpoint::at(&path);
        endpoint.create().await.unwrap();
        endpoint.create().await.unwrap();

        let mut second = FifoEndpoint::at(&path);
        second.create().await.unwrap();

        assert!(is_fifo(&path));
    }

    #[tokio::test]
    async fn test_create_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-fifo");
        fs::write(&path, b"log").unwrap();

        let mut endpoint = FifoEndpoint::at(&path);
        let err = endpoint.create().await.unwrap_err();
        assert!(err.is_setup());
    }

    #[tokio::test]
    async fn test_private_dir_removed_on_drop() {
        let endpoint = FifoEndpoint::with_name("telemetry").unwrap();
        let dir = endpoint.address().as_path().parent().unwrap().to_path_buf();
        assert!(dir.exists());
        drop(endpoint);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_read_before_accept_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut endpoint = FifoEndpoint::at(dir.path().join("telemetry"));
        endpoint.create().await.unwrap();

        assert!(matches!(
            endpoint.read_chunk().await,
            Err(ChannelError::NotReady(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_lines_until_writer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry");
        let mut endpoint = FifoEndpoint::at(&path);
        endpoint.create().await.unwrap();

        let writer = std::thread::spawn(move || {
            let mut fifo = OpenOptions::new().write(true).open(path).unwrap();
            fifo.write_all(b"[1,2,3] intensity 1\r\nnoise\npartial").unwrap();
        });

        endpoint.accept().await.unwrap();
        writer.join().unwrap();

        assert_eq!(
            endpoint.read_chunk().await.unwrap(),
            Chunk::Line("[1,2,3] intensity 1".into())
        );
        assert_eq!(endpoint.read_chunk().await.unwrap(), Chunk::Line("noise".into()));
        assert_eq!(endpoint.read_chunk().await.unwrap(), Chunk::Line("partial".into()));
        assert_eq!(endpoint.read_chunk().await.unwrap(), Chunk::Closed);

        endpoint.invalidate();
        assert!(matches!(
            endpoint.read_chunk().await,
            Err(ChannelError::NotReady(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_line_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry");
        let mut endpoint = FifoEndpoint::at(&path);
        endpoint.create().await.unwrap();

        let writer = std::thread::spawn(move || {
            let mut fifo = OpenOptions::new().write(true).open(path).unwrap();
            fifo.write_all(&vec![b'x'; 150_000]).unwrap();
            fifo.write_all(b"\n[1,2,3] intensity 1\n").unwrap();
        });

        endpoint.accept().await.unwrap();

        let mut lengths = Vec::new();
        loop {
            match endpoint.read_chunk().await.unwrap() {
                Chunk::Line(line) if line.starts_with('x') => lengths.push(line.len()),
                Chunk::Line(line) => {
                    assert_eq!(line, "[1,2,3] intensity 1");
                    break;
                }
                other => panic!("unexpected chunk {:?}", other),
            }
        }
        writer.join().unwrap();

        assert_eq!(
            lengths,
            vec![MAX_CHUNK_BYTES, MAX_CHUNK_BYTES, 150_000 - 2 * MAX_CHUNK_BYTES]
        );
        assert!(endpoint.pending.capacity() <= 2 * MAX_CHUNK_BYTES);
        assert_eq!(endpoint.read_chunk().await.unwrap(), Chunk::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wake_pending_releases_blocked_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry");
        let mut endpoint = FifoEndpoint::at(&path);
        endpoint.create().await.unwrap();
        let address = endpoint.address().clone();

        let accept = tokio::spawn(async move {
            endpoint.accept().await.map(|_| endpoint)
        });

        // Retry until the reader is parked in open().
        for _ in 0..100 {
            wake_pending(&address);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if accept.is_finished() {
                break;
            }
        }
        assert!(accept.is_finished(), "accept should have been released");

        let mut endpoint = accept.await.unwrap().unwrap();
        assert_eq!(endpoint.read_chunk().await.unwrap(), Chunk::Closed);
    }
}
