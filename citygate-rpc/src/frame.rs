use citygate_core::Envelope;
use citygate_core::protocol::{
    self, DEFAULT_MAX_FRAME_SIZE, ProtocolError, VarintDecoder, encode_frame,
};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream cleanly between frames.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection closed mid-frame: expected {expected} bytes, received {received}")]
    UnexpectedEof { expected: u64, received: u64 },
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: usize },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed frame, waiting until all declared bytes arrive.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<T, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    read_frame_with_limit(reader, DEFAULT_MAX_FRAME_SIZE).await
}

pub async fn read_frame_with_limit<T, R>(reader: &mut R, max: usize) -> Result<T, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut decoder = VarintDecoder::new();
    let len = loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if decoder.is_empty() {
                    return Err(FrameError::ConnectionClosed);
                }
                return Err(FrameError::UnexpectedEof {
                    expected: decoder.len() as u64 + 1,
                    received: decoder.len() as u64,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(len) = decoder.push(byte)? {
            break len;
        }
    };

    if len > max as u64 {
        return Err(FrameError::TooLarge { size: len, max });
    }

    let mut payload = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < payload.len() {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(FrameError::UnexpectedEof {
                expected: len,
                received: filled as u64,
            });
        }
        filled += n;
    }

    Ok(protocol::decode_payload(&payload)?)
}

pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, FrameError> {
    read_frame(reader).await
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), FrameError> {
    write_frame(writer, envelope).await
}
