//! Length-prefixed frame codec (C1).
//!
//! A frame on the wire is `[u32_be length][payload]`, where `length` counts
//! only the payload bytes. This module is deliberately ignorant of payload
//! contents — `wire` builds and interprets the bytes inside a frame.

use std::io::{ErrorKind, IoSlice};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, FramingError};

/// Hard ceiling on a single frame's payload length (§3, §6).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Payloads at or below this size are packed into one buffer and written
/// with a single `write_all`; larger payloads are split into a header write
/// and a body write (or a vectored write) to avoid a full-size copy.
pub const COALESCE_THRESHOLD_BYTES: usize = 4 * 1024;

/// Per-exchange, per-direction decoded body byte ceiling (§3, §7, §8).
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Size used when re-chunking an oversized body write into bridge frames.
pub const BODY_CHUNK_BYTES: usize = 64 * 1024;

/// Writes one length-prefixed frame, applying the coalescing policy.
pub async fn write_frame<S>(socket: &mut S, payload: &[u8]) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FramingError::OversizeFrame(payload.len(), MAX_FRAME_BYTES).into());
    }
    let header = (payload.len() as u32).to_be_bytes();

    if payload.is_empty() {
        socket.write_all(&header).await?;
        return Ok(());
    }
    if payload.len() <= COALESCE_THRESHOLD_BYTES {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        socket.write_all(&out).await?;
        return Ok(());
    }
    write_all_vectored(socket, &[&header, payload]).await?;
    Ok(())
}

/// Writes `[len][version][type][chunk_len][chunk]` for a chunk-shaped frame
/// (REQ_CHUNK, RESP_CHUNK, TUN_CHUNK), applying the same coalescing policy
/// as [`write_frame`] but without ever concatenating a large chunk into a
/// temporary buffer.
pub async fn write_chunk_frame<S>(
    socket: &mut S,
    version: u8,
    frame_type: u8,
    chunk: &[u8],
) -> Result<(), BridgeError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let chunk_len = u32::try_from(chunk.len())
        .map_err(|_| FramingError::OversizeFrame(chunk.len(), u32::MAX as usize))?;
    let payload_len = 6usize
        .checked_add(chunk.len())
        .ok_or(FramingError::OversizeFrame(usize::MAX, MAX_FRAME_BYTES))?;
    if payload_len > MAX_FRAME_BYTES {
        return Err(FramingError::OversizeFrame(payload_len, MAX_FRAME_BYTES).into());
    }
    let header = (payload_len as u32).to_be_bytes();
    let mut prefix = [0_u8; 6];
    prefix[0] = version;
    prefix[1] = frame_type;
    prefix[2..6].copy_from_slice(&chunk_len.to_be_bytes());

    if payload_len <= COALESCE_THRESHOLD_BYTES {
        let mut out = Vec::with_capacity(10 + chunk.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(chunk);
        socket.write_all(&out).await?;
        return Ok(());
    }
    if chunk.is_empty() {
        write_all_vectored(socket, &[&header, &prefix]).await?;
        return Ok(());
    }
    write_all_vectored(socket, &[&header, &prefix, chunk]).await?;
    Ok(())
}

/// Writes a sequence of byte slices, preferring vectored IO over
/// concatenation. Up to three slices are placed in a stack array; larger
/// sequences spill to a heap `Vec<IoSlice>`.
pub async fn write_all_vectored<S>(socket: &mut S, buffers: &[&[u8]]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut index = 0usize;
    let mut offset = 0usize;

    while index < buffers.len() {
        while index < buffers.len() && offset == buffers[index].len() {
            index += 1;
            offset = 0;
        }
        if index >= buffers.len() {
            break;
        }

        let remaining_buffers = buffers.len() - index;
        let written = if remaining_buffers <= 3 {
            let mut io_slices = [IoSlice::new(&[]), IoSlice::new(&[]), IoSlice::new(&[])];
            io_slices[0] = IoSlice::new(&buffers[index][offset..]);
            let mut slice_len = 1usize;
            if remaining_buffers >= 2 {
                io_slices[1] = IoSlice::new(buffers[index + 1]);
                slice_len = 2;
            }
            if remaining_buffers >= 3 {
                io_slices[2] = IoSlice::new(buffers[index + 2]);
                slice_len = 3;
            }
            socket.write_vectored(&io_slices[..slice_len]).await?
        } else {
            let mut io_slices = Vec::with_capacity(remaining_buffers);
            io_slices.push(IoSlice::new(&buffers[index][offset..]));
            for buffer in &buffers[(index + 1)..] {
                io_slices.push(IoSlice::new(buffer));
            }
            socket.write_vectored(&io_slices).await?
        };
        if written == 0 {
            return Err(std::io::Error::new(
                ErrorKind::WriteZero,
                "failed to write frame bytes",
            ));
        }

        let mut remaining = written;
        while index < buffers.len() && remaining > 0 {
            let available = buffers[index].len() - offset;
            if remaining < available {
                offset += remaining;
                remaining = 0;
            } else {
                remaining -= available;
                index += 1;
                offset = 0;
            }
        }
    }

    Ok(())
}

/// Reads one length-prefixed frame into a fresh buffer.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<S>(socket: &mut S) -> Result<Option<Vec<u8>>, BridgeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut payload = Vec::new();
    if read_frame_reuse(socket, &mut payload).await? {
        Ok(Some(payload))
    } else {
        Ok(None)
    }
}

/// Reads one length-prefixed frame into a reused buffer, returning `false`
/// on a clean EOF at a frame boundary and an error on EOF mid-frame (§4.1).
pub async fn read_frame_reuse<S>(
    socket: &mut S,
    payload: &mut Vec<u8>,
) -> Result<bool, BridgeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0_u8; 4];
    let mut read = 0;
    while read < header.len() {
        let n = socket.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(FramingError::TruncatedFrame.into());
        }
        read += n;
    }

    let payload_len = u32::from_be_bytes(header) as usize;
    if payload_len > MAX_FRAME_BYTES {
        return Err(FramingError::OversizeFrame(payload_len, MAX_FRAME_BYTES).into());
    }

    payload.resize(payload_len, 0);
    let mut read = 0;
    while read < payload_len {
        let n = socket.read(&mut payload[read..payload_len]).await?;
        if n == 0 {
            return Err(FramingError::TruncatedFrame.into());
        }
        read += n;
    }

    Ok(true)
}

/// Minimal binary writer used by the wire codec to build one frame payload.
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Reserves space for a `u32` to be patched later (used for header
    /// counts, which aren't known until headers are iterated).
    pub fn reserve_u32(&mut self) -> usize {
        let pos = self.bytes.len();
        self.bytes.extend_from_slice(&0_u32.to_be_bytes());
        pos
    }

    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.bytes[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_string(&mut self, value: &str) -> Result<(), BridgeError> {
        self.put_bytes(value.as_bytes())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| FramingError::OversizeFrame(bytes.len(), u32::MAX as usize))?;
        self.put_u32(len);
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal binary reader used by the wire codec to interpret one frame
/// payload. Borrows from the caller's buffer so string/byte fields can be
/// returned as zero-copy slices (§3 "lazy view").
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn get_u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.get_exact(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, FramingError> {
        let bytes = self.get_exact(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, FramingError> {
        let bytes = self.get_exact(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], FramingError> {
        let (start, length) = self.get_bytes_range()?;
        Ok(&self.bytes[start..start + length])
    }

    pub fn get_str(&mut self) -> Result<&'a str, FramingError> {
        std::str::from_utf8(self.get_bytes()?).map_err(|_| FramingError::InvalidUtf8)
    }

    pub fn get_bytes_range(&mut self) -> Result<(usize, usize), FramingError> {
        let length = self.get_u32()? as usize;
        if self.offset + length > self.bytes.len() {
            return Err(FramingError::TruncatedFrame);
        }
        let start = self.offset;
        self.offset += length;
        Ok((start, length))
    }

    pub fn ensure_done(&self) -> Result<(), FramingError> {
        if self.offset == self.bytes.len() {
            Ok(())
        } else {
            Err(FramingError::TrailingBytes(self.bytes.len() - self.offset))
        }
    }

    fn get_exact(&mut self, len: usize) -> Result<&'a [u8], FramingError> {
        if self.offset + len > self.bytes.len() {
            return Err(FramingError::TruncatedFrame);
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.bytes[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_small_frame_round_trips() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"ping").await.unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let payload = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(payload, b"ping");
    }

    #[tokio::test]
    async fn write_then_read_large_frame_round_trips() {
        let body = vec![7_u8; COALESCE_THRESHOLD_BYTES + 1];
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &body).await.unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let payload = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(payload, body);
    }

    #[tokio::test]
    async fn chunk_frame_round_trips_through_byte_reader() {
        let mut buffer = Vec::new();
        write_chunk_frame(&mut buffer, 2, 7, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let payload = read_frame(&mut cursor).await.unwrap().unwrap();
        let mut reader = ByteReader::new(&payload);
        assert_eq!(reader.get_u8().unwrap(), 2);
        assert_eq!(reader.get_u8().unwrap(), 7);
        assert_eq!(reader.get_bytes().unwrap(), b"hello");
        reader.ensure_done().unwrap();
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let huge = vec![0_u8; MAX_FRAME_BYTES + 1];
        let mut buffer = Vec::new();
        let error = write_frame(&mut buffer, &huge).await.unwrap_err();
        assert!(matches!(
            error,
            BridgeError::Framing(FramingError::OversizeFrame(_, _))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_header_is_an_error() {
        let mut cursor = std::io::Cursor::new(vec![0_u8, 0, 0]);
        let error = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            error,
            BridgeError::Framing(FramingError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn chunked_byte_stream_recovers_same_frames() {
        // Exercise the reader against a source that only ever yields frame
        // bytes split at arbitrary offsets, mirroring the chunking-invariance
        // property: the reader must not care where TCP segment boundaries
        // land.
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"one").await.unwrap();
        write_frame(&mut buffer, b"two-longer-payload").await.unwrap();

        for split in 1..buffer.len() {
            let (left, right) = buffer.split_at(split);
            let source = ChunkedReader {
                parts: vec![left.to_vec(), right.to_vec()],
                index: 0,
                pos: 0,
            };
            let mut source = source;
            let first = read_frame(&mut source).await.unwrap();
            let second = read_frame(&mut source).await.unwrap();
            assert_eq!(first.as_deref(), Some(&b"one"[..]));
            assert_eq!(second.as_deref(), Some(&b"two-longer-payload"[..]));
        }
    }

    struct ChunkedReader {
        parts: Vec<Vec<u8>>,
        index: usize,
        pos: usize,
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let this = self.get_mut();
            while this.index < this.parts.len() && this.pos == this.parts[this.index].len() {
                this.index += 1;
                this.pos = 0;
            }
            if this.index >= this.parts.len() {
                return std::task::Poll::Ready(Ok(()));
            }
            let part = &this.parts[this.index];
            let n = (part.len() - this.pos).min(buf.remaining()).min(1);
            buf.put_slice(&part[this.pos..this.pos + n]);
            this.pos += n;
            std::task::Poll::Ready(Ok(()))
        }
    }
}
