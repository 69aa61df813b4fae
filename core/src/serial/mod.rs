//! Serial ingest: open a byte stream, decode it, and feed every chunk
//! through the monitor pipeline.

mod decoder;
mod monitor;
mod session;

pub use decoder::Utf8ChunkDecoder;
pub use monitor::{SerialConnection, SerialMonitor, SerialWriter};
pub use session::{export_filename, SessionEntry, SessionLog};

use crate::{Result, SosError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Line settings and session limits.
///
/// Line settings are recorded and reported; configuring the port itself
/// (e.g. with `stty`) is left to the host.
#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Session log entries kept in memory.
    pub max_log_size: usize,
    pub read_buffer_size: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: std::env::var("SOS_BAUD_RATE")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(115_200),
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            max_log_size: std::env::var("SOS_MAX_LOG_SIZE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(1000),
            read_buffer_size: 1024,
        }
    }
}

impl SerialConfig {
    /// `115200 8N1`
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        format!(
            "{} {}{}{}",
            self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}

/// Where the device stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialSource {
    /// A character device such as `/dev/ttyUSB0`, opened read/write.
    Device(PathBuf),
    /// A serial-over-TCP bridge.
    Tcp(String),
    /// Read-only.
    Stdin,
}

impl fmt::Display for SerialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialSource::Device(path) => write!(f, "{}", path.display()),
            SerialSource::Tcp(addr) => write!(f, "tcp://{}", addr),
            SerialSource::Stdin => f.write_str("stdin"),
        }
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

impl SerialSource {
    /// Open the source, returning its read half and, if writable, its write half.
    pub async fn open(&self) -> Result<(BoxedReader, Option<BoxedWriter>)> {
        match self {
            SerialSource::Device(path) => {
                let (r, w) = open_device(path).map_err(|e| {
                    SosError::SerialError(format!("failed to open {}: {}", path.display(), e))
                })?;
                info!(target: "serial", source = %self, "Opened serial device");
                Ok((r, Some(w)))
            }
            SerialSource::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await.map_err(|e| {
                    SosError::SerialError(format!("failed to connect to {}: {}", addr, e))
                })?;
                let (r, w) = stream.into_split();
                info!(target: "serial", source = %self, "Connected to serial bridge");
                Ok((Box::new(r), Some(Box::new(w))))
            }
            SerialSource::Stdin => Ok((Box::new(tokio::io::stdin()), None)),
        }
    }
}

/// Open a device as two independent handles so a read parked on a quiet
/// line never holds up a write or the final flush.
///
/// Character devices and FIFOs are opened non-blocking and driven by the
/// reactor. Anything the reactor cannot poll (a plain capture file being
/// replayed, say) falls back to two clones of one blocking file.
fn open_device(path: &Path) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    #[cfg(unix)]
    {
        match open_polled(path) {
            Ok(pair) => return Ok(pair),
            Err(e) => {
                debug!(target: "serial", path = %path.display(), error = %e, "Device not pollable, using blocking file")
            }
        }
    }

    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let reader = tokio::fs::File::from_std(file.try_clone()?);
    let writer = tokio::fs::File::from_std(file);
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(unix)]
fn open_polled(path: &Path) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    use tokio::net::unix::pipe;

    let mut opts = pipe::OpenOptions::new();
    // keep a FIFO writable with no peer attached
    #[cfg(target_os = "linux")]
    opts.read_write(true);
    opts.unchecked(true);

    let rx = opts.open_receiver(path)?;
    let tx = opts.open_sender(path)?;
    Ok((Box::new(rx), Box::new(tx)))
}
