//! Frame I/O over the externally-terminated byte stream.
//!
//! The transport collaborator hands the server an ordered, reliable,
//! already-authenticated stream per client (TLS termination happens in
//! front of us, configured by the file paths on the command line). This
//! module only does length-prefixed framing on top of it: a u32 big-endian
//! length followed by that many envelope bytes.

use std::path::PathBuf;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SignalingError;
use shoal_core::MAX_FRAME_SIZE;

/// TLS material paths handed to the terminating front.
///
/// The core never opens these; it only checks they exist so a broken
/// deployment fails at startup instead of at the first connection.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub dh_parameters: Option<PathBuf>,
}

impl TlsFiles {
    pub fn check(&self) -> std::io::Result<()> {
        let mut required = vec![&self.certificate, &self.private_key];
        if let Some(dh) = &self.dh_parameters {
            required.push(dh);
        }
        for path in required {
            if !path.is_file() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing TLS file: {}", path.display()),
                ));
            }
        }
        Ok(())
    }
}

/// Buffered frame reader.
///
/// `next_frame` is cancel-safe: a partially received frame stays in the
/// internal buffer across cancellation, so it can be used directly inside
/// `select!`.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next frame. Returns `None` on a clean end-of-stream between
    /// frames; a stream that dies mid-frame is an error.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, SignalingError> {
        loop {
            if let Some(frame) = self.parse_buffered()? {
                return Ok(Some(frame));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(SignalingError::Disconnected);
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<Bytes>, SignalingError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if len == 0 || len > MAX_FRAME_SIZE {
            return Err(SignalingError::Protocol(format!(
                "invalid frame length {} (max {})",
                len, MAX_FRAME_SIZE
            )));
        }

        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), SignalingError>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        return Err(SignalingError::Internal(format!(
            "outgoing frame of {} bytes exceeds limit",
            frame.len()
        )));
    }

    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
