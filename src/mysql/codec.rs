use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::MAX_PAYLOAD_LEN;
use crate::error::{FrontendError, Result};

const READ_BUFFER_SIZE: usize = 8192;
const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Packet framing over a byte stream.
///
/// Reads reassemble payloads split at 0xffffff, writes split them. The
/// sequence id is advanced on every packet in both directions and is never
/// checked against what the client sends.
pub struct PacketIo<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    sequence: u8,
    max_allowed_packet: usize,
    read_timeout: Option<Duration>,
}

impl<S> PacketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            sequence: 0,
            max_allowed_packet: usize::MAX,
            read_timeout: None,
        }
    }

    pub fn with_max_allowed_packet(mut self, max: usize) -> Self {
        self.max_allowed_packet = max;
        self
    }

    pub fn set_max_allowed_packet(&mut self, max: usize) {
        self.max_allowed_packet = max;
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Swap in `replacement` and hand back the old stream together with any
    /// bytes that were read from it but not consumed yet.
    pub fn swap_stream(&mut self, replacement: S) -> (S, bytes::Bytes) {
        let buffered = self.read_buf.split().freeze();
        let old = std::mem::replace(&mut self.stream, replacement);
        (old, buffered)
    }

    pub fn set_stream(&mut self, stream: S) {
        self.stream = stream;
    }

    /// Read one logical payload, honoring the read timeout.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.read_payload()).await {
                Ok(result) => result,
                Err(_) => Err(FrontendError::Timeout),
            },
            None => self.read_payload().await,
        }
    }

    async fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            self.fill(4).await?;
            let len = (self.read_buf[0] as usize)
                | ((self.read_buf[1] as usize) << 8)
                | ((self.read_buf[2] as usize) << 16);
            let seq = self.read_buf[3];
            self.read_buf.advance(4);
            self.sequence = seq.wrapping_add(1);

            if payload.len() + len > self.max_allowed_packet {
                return Err(FrontendError::PacketTooLarge);
            }

            self.fill(len).await?;
            payload.extend_from_slice(&self.read_buf[..len]);
            self.read_buf.advance(len);

            if len < MAX_PAYLOAD_LEN {
                return Ok(payload);
            }
        }
    }

    async fn fill(&mut self, needed: usize) -> Result<()> {
        while self.read_buf.len() < needed {
            self.read_buf.reserve(needed.saturating_sub(self.read_buf.len()).max(READ_BUFFER_SIZE));
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(FrontendError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Queue one logical payload, splitting it into as many packets as needed.
    /// Buffered bytes go out once the buffer grows past its soft limit or on `flush`.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = payload;
        loop {
            let n = rest.len().min(MAX_PAYLOAD_LEN);
            self.write_buf.reserve(4 + n);
            self.write_buf.put_uint_le(n as u64, 3);
            self.write_buf.put_u8(self.sequence);
            self.write_buf.put_slice(&rest[..n]);
            self.sequence = self.sequence.wrapping_add(1);
            rest = &rest[n..];

            if self.write_buf.len() >= WRITE_BUFFER_SIZE {
                self.stream.write_all(&self.write_buf).await?;
                self.write_buf.clear();
            }
            if n < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
