//! Length-prefixed bincode frames spoken between clients and the relay hub.
//!
//! Each frame on the wire is a big-endian `u32` payload length followed by
//! the bincode encoding of a [`RelayFrame`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use murmur_shared::constants::MAX_ENVELOPE_SIZE;
use murmur_shared::types::UserId;

use crate::error::TransportError;

/// Largest frame accepted by default: an envelope plus framing overhead.
pub const DEFAULT_MAX_FRAME_SIZE: usize = MAX_ENVELOPE_SIZE + 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame a client sends after connecting.
    Hello { user_id: UserId, protocol: String },
    /// An envelope in its JSON wire form.
    Envelope { json: String },
    /// Hub notice: another client joined.
    PeerJoined { user_id: UserId },
    /// Hub notice: another client left.
    PeerLeft { user_id: UserId },
    /// Hub refused the connection or a frame.
    Error { reason: String },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let payload =
            bincode::serialize(self).map_err(|e| TransportError::Codec(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| TransportError::Codec("frame too large".into()))?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        buf.put_u32(len);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(payload).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &RelayFrame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<RelayFrame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::ChannelUnavailable(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::Codec(format!(
            "frame of {len} bytes exceeds limit of {max_size}"
        )));
    }

    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::ChannelUnavailable(e.to_string()))?;

    RelayFrame::decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let hello = RelayFrame::Hello {
            user_id: UserId([7; 32]),
            protocol: "/murmur/1.0.0".into(),
        };
        let envelope = RelayFrame::Envelope {
            json: "{\"type\":\"direct_message\"}".into(),
        };

        write_frame(&mut client, &hello).await.unwrap();
        write_frame(&mut client, &envelope).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 4096).await.unwrap(), Some(hello));
        assert_eq!(read_frame(&mut server, 4096).await.unwrap(), Some(envelope));
        assert_eq!(read_frame(&mut server, 4096).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = RelayFrame::Envelope {
            json: "x".repeat(512),
        };
        write_frame(&mut client, &frame).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, 128).await,
            Err(TransportError::Codec(_))
        ));
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let bytes = RelayFrame::PeerLeft {
            user_id: UserId([0; 32]),
        }
        .encode()
        .unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - LENGTH_PREFIX);
    }
}
