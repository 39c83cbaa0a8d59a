use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ChannelError;

/// Width of every integer frame on the control channel.
pub const U32_FRAME_LEN: usize = 4;

/// Buffer size for the duplex pair used in tests.
const PAIR_BUFFER_SIZE: usize = 4096;

/// Ordered byte stream to the driver, carrying only small fixed-width frames.
///
/// All integers are big-endian `u32`. A read that hits EOF before the first
/// byte of a frame is [`ChannelError::Disconnected`]; EOF after some bytes is
/// [`ChannelError::Framing`].
pub struct ControlChannel {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Connect to a Unix socket endpoint.
    pub async fn connect(endpoint: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let stream = tokio::net::UnixStream::connect(endpoint.as_ref())
            .await
            .map_err(ChannelError::Connect)?;
        Ok(Self::new(stream))
    }

    /// Wrap any ordered duplex byte stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Build a channel from separate read and write halves.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Two connected in-memory ends.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PAIR_BUFFER_SIZE);
        (Self::new(a), Self::new(b))
    }

    /// Send the identity token. There is no length prefix.
    pub async fn send_identity(&mut self, name: &str) -> Result<(), ChannelError> {
        self.send_raw(name.as_bytes()).await
    }

    /// Write raw bytes and flush.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(ChannelError::Io)?;
        self.writer.flush().await.map_err(ChannelError::Io)
    }

    pub async fn write_u32_be(&mut self, value: u32) -> Result<(), ChannelError> {
        self.send_raw(&value.to_be_bytes()).await
    }

    /// Block until a full 4-byte frame has arrived.
    pub async fn read_u32_be(&mut self) -> Result<u32, ChannelError> {
        let mut buf = [0u8; U32_FRAME_LEN];
        let mut filled = 0;
        while filled < U32_FRAME_LEN {
            let n = self
                .reader
                .read(&mut buf[filled..])
                .await
                .map_err(ChannelError::Io)?;
            if n == 0 {
                return Err(if filled == 0 {
                    ChannelError::Disconnected
                } else {
                    ChannelError::Framing {
                        expected: U32_FRAME_LEN,
                        got: filled,
                    }
                });
            }
            filled += n;
        }
        Ok(u32::from_be_bytes(buf))
    }

    /// One bounded read of at most `max_len` bytes, with NUL padding removed.
    ///
    /// This is not a delimited scan: whatever a single read returns is the
    /// string. The sender must stay within `max_len`.
    pub async fn read_short_string(&mut self, max_len: usize) -> Result<String, ChannelError> {
        let mut buf = vec![0u8; max_len];
        let n = self
            .reader
            .read(&mut buf)
            .await
            .map_err(ChannelError::Io)?;
        if n == 0 {
            return Err(ChannelError::Disconnected);
        }
        buf.truncate(n);
        buf.retain(|&b| b != 0);
        String::from_utf8(buf).map_err(|_| ChannelError::InvalidUtf8)
    }

    /// Counterpart of [`read_short_string`](Self::read_short_string): the
    /// string padded with NULs to exactly `frame_len` bytes.
    pub async fn write_padded_string(
        &mut self,
        value: &str,
        frame_len: usize,
    ) -> Result<(), ChannelError> {
        let mut frame = value.as_bytes().to_vec();
        frame.resize(frame_len.max(frame.len()), 0);
        self.send_raw(&frame).await
    }

    /// Shut down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await.map_err(ChannelError::Io)
    }
}
