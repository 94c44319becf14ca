//! Length-prefixed framing over stream sockets
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! exactly that many payload bytes. `FramedChannel` wraps an outbound
//! connection that is opened lazily and reopened after a failed send.

use super::error::{FrameError, FrameResult};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Size of the length header preceding every frame
pub const HEADER_LEN: usize = 4;

/// Largest frame accepted by default
pub const MAX_FRAME_LEN: usize = 10_000_000;

/// Encode a payload as a single frame
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode the first frame in `bytes`, returning its payload
///
/// Trailing bytes after the frame are ignored.
pub fn decode_frame(bytes: &[u8]) -> FrameResult<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            received: bytes.len(),
        });
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let len = u32::from_be_bytes(header) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() < len {
        return Err(FrameError::Truncated {
            expected: len,
            received: body.len(),
        });
    }
    Ok(&body[..len])
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    write_frame_parts(writer, &[payload])
}

/// Write several fragments behind one combined length header
pub fn write_frame_parts<W: Write>(writer: &mut W, parts: &[&[u8]]) -> io::Result<()> {
    let total: usize = parts.iter().map(|part| part.len()).sum();
    let len = u32::try_from(total)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    for part in parts {
        writer.write_all(part)?;
    }
    writer.flush()
}

/// Read one frame, refusing anything larger than `max_len`
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> FrameResult<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_fully(reader, &mut header)?;
    if got == 0 {
        return Err(FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    if got < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            received: got,
        });
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let mut payload = vec![0u8; len];
    let got = read_fully(reader, &mut payload)?;
    if got < len {
        return Err(FrameError::Truncated {
            expected: len,
            received: got,
        });
    }
    Ok(payload)
}

/// Write a frame holding a single big-endian `i32`
pub fn write_i32_frame<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    write_frame(writer, &value.to_be_bytes())
}

/// Read a frame holding a single big-endian `i32`
pub fn read_i32_frame<R: Read>(reader: &mut R) -> FrameResult<i32> {
    let payload = read_frame(reader, HEADER_LEN)?;
    if payload.len() != 4 {
        return Err(FrameError::Truncated {
            expected: 4,
            received: payload.len(),
        });
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&payload);
    Ok(i32::from_be_bytes(bytes))
}

// Fill as much of `buf` as the stream provides, stopping only at EOF.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Outbound framed connection to one peer
#[derive(Debug)]
pub struct FramedChannel {
    address: String,
    port: u16,
    connect_timeout: Duration,
    max_frame_len: usize,
    stream: Option<TcpStream>,
}

impl FramedChannel {
    /// Create a channel; the connection is opened on first use
    pub fn new(address: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            port,
            connect_timeout,
            max_frame_len: MAX_FRAME_LEN,
            stream: None,
        }
    }

    /// Override the largest frame `receive` accepts
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Remote address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Remote port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the connection if it is not already open
    pub fn connect(&mut self) -> FrameResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let target = format!("{}:{}", self.address, self.port);
        let addrs: Vec<SocketAddr> = target.to_socket_addrs()?.collect();
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!("Connected framed channel to {}", target);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.map(FrameError::Io).unwrap_or(FrameError::NotConnected(target)))
    }

    /// Send one frame, returning false on any failure
    pub fn send(&mut self, payload: &[u8]) -> bool {
        self.send_parts(&[payload])
    }

    /// Send several fragments as one frame, returning false on any failure
    pub fn send_parts(&mut self, parts: &[&[u8]]) -> bool {
        if let Err(e) = self.connect() {
            tracing::warn!("Failed to connect to {}:{}: {}", self.address, self.port, e);
            return false;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match write_frame_parts(stream, parts) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to send frame to {}:{}: {}", self.address, self.port, e);
                self.stream = None;
                false
            }
        }
    }

    /// Send one frame, reconnecting between attempts
    pub fn send_with_retries(&mut self, payload: &[u8], attempts: u32) -> bool {
        (0..attempts.max(1)).any(|_| self.send(payload))
    }

    /// Block until one complete frame arrives
    pub fn receive(&mut self) -> FrameResult<Vec<u8>> {
        self.connect()?;
        let max = self.max_frame_len;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FrameError::NotConnected(format!("{}:{}", self.address, self.port)))?;
        let result = read_frame(stream, max);
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    /// Drop the connection
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Closed framed channel to {}:{}", self.address, self.port);
        }
    }
}
