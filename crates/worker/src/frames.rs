// Path: crates/worker/src/frames.rs
//! Length-prefixed protobuf framing for the direct data stream.
//!
//! Layout per frame: a big-endian u32 length followed by the encoded
//! `DataFrame`. The limit leaves headroom over the maximum chunk size
//! for the envelope fields.

use gantry_types::error::TransferError;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on one frame: the largest legal chunk plus envelope.
pub const MAX_FRAME_LEN: u32 = (gantry_transfer::MAX_CHUNK_SIZE + 64 * 1024) as u32;

/// Writes one frame and flushes it.
pub async fn write_frame<S, M>(stream: &mut S, message: &M) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin + Send,
    M: Message,
{
    let encoded = message.encode_to_vec();
    if encoded.len() as u32 > MAX_FRAME_LEN {
        return Err(TransferError::Internal(format!(
            "outbound frame of {} bytes exceeds limit",
            encoded.len()
        )));
    }
    stream
        .write_u32(encoded.len() as u32)
        .await
        .map_err(|e| TransferError::Transport(e.to_string()))?;
    stream
        .write_all(&encoded)
        .await
        .map_err(|e| TransferError::Transport(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| TransferError::Transport(e.to_string()))?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<S, M>(stream: &mut S) -> Result<Option<M>, TransferError>
where
    S: AsyncRead + Unpin + Send,
    M: Message + Default,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransferError::Transport(e.to_string())),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(TransferError::Transport(format!(
            "invalid frame length: {len}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransferError::Transport(e.to_string()))?;
    M::decode(buf.as_slice())
        .map(Some)
        .map_err(|e| TransferError::Transport(format!("frame decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_ipc::v1 as proto;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);
        let frame = proto::DataFrame {
            payload: Some(proto::data_frame::Payload::Ack(proto::TransferAck {
                offset: 4096,
                success: true,
                error: String::new(),
                progress: 0.5,
                digest_sha256: String::new(),
            })),
        };
        write_frame(&mut a, &frame).await.unwrap();
        let back: proto::DataFrame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(back, frame);

        // Clean EOF at a boundary reads as stream end.
        drop(a);
        assert!(read_frame::<_, proto::DataFrame>(&mut b).await.unwrap().is_none());
    }
}
