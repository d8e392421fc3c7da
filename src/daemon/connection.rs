//! Buffered client connections
//!
//! Each connection keeps an inbound buffer of bytes not yet forming a full
//! line and an outbound buffer of encoded responses not yet written.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

const READ_CHUNK: usize = 4096;

/// A connected control-socket client
#[derive(Debug)]
pub struct ClientConnection {
    stream: UnixStream,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    closing: bool,
}

impl ClientConnection {
    /// Wrap an accepted stream, switching it to nonblocking mode
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            inbound: Vec::new(),
            outbound: Vec::new(),
            closing: false,
        })
    }

    /// Whether there is output waiting for the socket
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Read whatever the socket has.
    ///
    /// End of stream or a read error marks the connection for removal.
    pub fn read_available(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closing = true;
                    return;
                }
                Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Client read failed: {}", e);
                    self.closing = true;
                    return;
                }
            }
        }
    }

    /// Remove and return every complete line from the inbound buffer.
    ///
    /// Lines come back without their terminator; a trailing partial line
    /// stays buffered.
    pub fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.inbound.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.inbound.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Append an encoded response to the outbound buffer
    pub fn queue(&mut self, data: &str) {
        self.outbound.extend_from_slice(data.as_bytes());
    }

    /// Write as much buffered output as the socket accepts.
    ///
    /// A failed write marks the connection for removal.
    pub fn flush(&mut self) {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.closing = true;
                    return;
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Client write failed: {}", e);
                    self.closing = true;
                    return;
                }
            }
        }
    }
}

impl AsFd for ClientConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
