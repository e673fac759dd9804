// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefixed framing over a TCP stream.
//!
//! Every frame is a 4-byte big-endian length followed by the payload.
//! [`Connection::read_frame`] keeps partial input in its own buffer, so it
//! can be dropped from a `select!` branch without losing bytes.

use crate::error::RpcError;
use serde_json::Value;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest accepted payload (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// A framed, bidirectional connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    max_frame_size: usize,
    read_buffer: Vec<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream,
            peer_addr,
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Wrap a stream received from another process.
    pub fn from_std(stream: std::net::TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(TcpStream::from_std(stream)?))
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Read one frame payload.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                return Ok(frame);
            }
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.read_buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.read_buffer[..HEADER_LEN]);
        let size = u32::from_be_bytes(header) as usize;
        if size == 0 {
            return Err(FrameError::Empty);
        }
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        if self.read_buffer.len() < HEADER_LEN + size {
            return Ok(None);
        }
        let frame = self.read_buffer[HEADER_LEN..HEADER_LEN + size].to_vec();
        self.read_buffer.drain(..HEADER_LEN + size);
        Ok(Some(frame))
    }

    /// Read one frame and decode it as JSON.
    pub async fn read_message(&mut self) -> Result<Value, FrameError> {
        let frame = self.read_frame().await?;
        serde_json::from_slice(&frame).map_err(|e| FrameError::Json(e.to_string()))
    }

    /// Write one frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        }
        let len = payload.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Encode and write one JSON message.
    pub async fn write_message(&mut self, message: &Value) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(message).map_err(|e| FrameError::Json(e.to_string()))?;
        self.write_frame(&payload).await
    }

    /// Give up the socket, for handing it to another process.
    ///
    /// Fails if unread input is still buffered, since it would be lost.
    pub fn into_std(self) -> Result<std::net::TcpStream, FrameError> {
        if !self.read_buffer.is_empty() {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cannot detach a connection with buffered input",
            )));
        }
        let stream = self.stream.into_std()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Framing and transport errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("empty frame")]
    Empty,
    #[error("frame too large: {size} > {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed JSON: {0}")]
    Json(String),
}

impl FrameError {
    /// True when the peer went away rather than misbehaved.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<FrameError> for RpcError {
    #[track_caller]
    fn from(e: FrameError) -> Self {
        if e.is_closed() {
            RpcError::closed(e.to_string())
        } else {
            RpcError::exception(e.to_string())
        }
    }
}
