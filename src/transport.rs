//! TCP transport for a single device connection.
//! Sends whole frames and reads back exactly one full frame per call.

use crate::error::{Result, TuyaError};
use crate::protocol::{
    HEADER_LEN_55AA, HEADER_LEN_6699, PREFIX_55AA, PREFIX_6699, TuyaHeader, parse_header,
};
use log::{debug, trace};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Bytes skipped while looking for a frame prefix before giving up.
const MAX_PREFIX_SCAN: usize = 1024;

/// Owns one TCP connection. Once closed it stays closed.
#[derive(Debug)]
pub struct Transport {
    stream: Option<TcpStream>,
    peer: String,
    io_timeout: Duration,
}

impl Transport {
    /// Connect to `ip:port`, failing with [`TuyaError::Connect`] on refusal,
    /// unreachable host or when `connect_timeout` elapses.
    pub async fn connect(ip: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let peer = format!("{}:{}", ip, port);
        debug!("Connecting to {}", peer);
        let stream = timeout(connect_timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| TuyaError::Connect(format!("timed out connecting to {}", peer)))?
            .map_err(|e| TuyaError::Connect(format!("{}: {}", peer, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", peer, e);
        }

        Ok(Self {
            stream: Some(stream),
            peer,
            io_timeout: connect_timeout,
        })
    }

    /// Wrap an already connected stream (e.g. an accepted socket).
    pub fn from_stream(stream: TcpStream, io_timeout: Duration) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream: Some(stream),
            peer,
            io_timeout,
        }
    }

    /// Timeout applied to writes.
    pub fn set_io_timeout(&mut self, io_timeout: Duration) {
        self.io_timeout = io_timeout;
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TuyaError::Connect("connection is closed".into()))
    }

    /// Write one encoded frame. Any failure closes the transport.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let io_timeout = self.io_timeout;
        let stream = self.stream_mut()?;
        let result = match timeout(io_timeout, stream.write_all(frame)).await {
            Ok(res) => res.map_err(TuyaError::from),
            Err(_) => Err(TuyaError::Timeout),
        };

        if result.is_err() {
            self.close().await;
        } else {
            trace!("Sent {} bytes to {}", frame.len(), self.peer);
        }
        result
    }

    /// Read the next complete frame, returning its raw bytes and parsed header.
    ///
    /// The whole read is bounded by `deadline`; a zero deadline only succeeds
    /// if a full frame is already buffered. Any failure closes the transport.
    pub async fn receive(&mut self, deadline: Duration) -> Result<(Vec<u8>, TuyaHeader)> {
        let stream = self.stream_mut()?;
        let result = match timeout(deadline, read_frame(stream)).await {
            Ok(res) => res,
            Err(_) => Err(TuyaError::Timeout),
        };

        match &result {
            Ok((packet, header)) => {
                trace!(
                    "Received frame from {}: cmd=0x{:02X}, seqno={}, {} bytes",
                    self.peer,
                    header.cmd,
                    header.seqno,
                    packet.len()
                );
            }
            Err(e) => {
                debug!("Receive from {} failed: {}", self.peer, e);
                self.close().await;
            }
        }
        result
    }

    /// Shut the socket down. Safe to call any number of times.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing connection to {}", self.peer);
            let _ = stream.shutdown().await;
        }
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(stream: &mut R) -> Result<(Vec<u8>, TuyaHeader)> {
    let prefix = scan_for_prefix(stream).await?;

    let header_len = if prefix == PREFIX_6699.to_be_bytes() {
        HEADER_LEN_6699
    } else {
        HEADER_LEN_55AA
    };
    let mut packet = vec![0u8; header_len];
    packet[..4].copy_from_slice(&prefix);
    stream.read_exact(&mut packet[4..]).await.map_err(eof)?;

    let header = parse_header(&packet)?;
    let total = header.total_length as usize;
    if total < header_len {
        return Err(TuyaError::Frame(format!("declared length {} too small", total)));
    }
    packet.resize(total, 0);
    stream
        .read_exact(&mut packet[header_len..])
        .await
        .map_err(eof)?;

    Ok((packet, header))
}

/// Skip bytes until a 55AA or 6699 prefix shows up.
async fn scan_for_prefix<R: AsyncReadExt + Unpin>(stream: &mut R) -> Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.map_err(eof)?;

    for _ in 0..MAX_PREFIX_SCAN {
        let val = u32::from_be_bytes(buf);
        if val == PREFIX_55AA || val == PREFIX_6699 {
            return Ok(buf);
        }
        buf.rotate_left(1);
        buf[3] = stream.read_u8().await.map_err(eof)?;
    }
    Err(TuyaError::Frame("no frame prefix found".into()))
}

fn eof(e: std::io::Error) -> TuyaError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TuyaError::Io("connection closed by device".into())
    } else {
        TuyaError::from(e)
    }
}
