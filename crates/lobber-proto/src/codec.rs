//! Frame encoding and decoding
//!
//! Frame format: `[tag: u8][length: u32 big-endian][payload: length bytes]`.
//! The payload is JSON; Ready frames carry a zero-length payload. Decoders
//! verify the tag they expect; a mismatch is a protocol violation and
//! terminal for the session.

use crate::messages::{Request, Response};
use bytes::{BufMut, BytesMut};
use serde::de::Error as _;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ready frame tag.
pub const TAG_READY: u8 = 0x00;
/// Request frame tag.
pub const TAG_REQUEST: u8 = 0x01;
/// Response frame tag.
pub const TAG_RESPONSE: u8 = 0x02;

/// Maximum frame payload size (16MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected frame tag: got {got:#04x}, want {want:#04x}")]
    UnexpectedTag { got: u8, want: u8 },

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write a Ready frame (zero-length payload).
pub async fn write_ready<W>(writer: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, TAG_READY, &[]).await
}

/// Write a Request frame.
pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(request)?;
    write_frame(writer, TAG_REQUEST, &payload).await
}

/// Write a Response frame.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(response)?;
    write_frame(writer, TAG_RESPONSE, &payload).await
}

/// Read a Ready frame. Accepts both a zero-length payload and an empty
/// JSON object.
pub async fn read_ready<R>(reader: &mut R) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, TAG_READY).await?;
    if payload.is_empty() {
        return Ok(());
    }
    let value: serde_json::Value = serde_json::from_slice(&payload)?;
    if !value.is_object() {
        return Err(FrameError::Json(serde_json::Error::custom(
            "ready payload must be an empty object",
        )));
    }
    Ok(())
}

/// Read a Request frame.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, TAG_REQUEST).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Read a Response frame.
pub async fn read_response<R>(reader: &mut R) -> Result<Response, FrameError>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, TAG_RESPONSE).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Write one frame as a single buffer so the wire never sees a torn frame
/// from this writer.
async fn write_frame<W>(writer: &mut W, tag: u8, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(1 + 4 + payload.len());
    buf.put_u8(tag);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, verifying the tag. On a tag mismatch only the tag byte
/// has been consumed.
async fn read_frame<R>(reader: &mut R, want: u8) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;
    if tag[0] != want {
        return Err(FrameError::UnexpectedTag { got: tag[0], want });
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Headers;

    fn sample_request() -> Request {
        let mut headers = Headers::new();
        headers.insert(
            "X-Forwarded-For".to_string(),
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        );
        headers.insert("Host".to_string(), vec!["test.example.com".to_string()]);
        Request {
            id: "req-42".to_string(),
            method: "GET".to_string(),
            path: "/api/test?q=1".to_string(),
            headers,
            body: vec![1, 2, 3, 0, 255],
        }
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let req = sample_request();
        write_request(&mut client, &req).await.unwrap();

        let decoded = read_request(&mut server).await.unwrap();
        assert_eq!(decoded, req);
        assert_eq!(
            decoded.headers["X-Forwarded-For"],
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut headers = Headers::new();
        headers.insert("Set-Cookie".to_string(), vec!["a=1".into(), "b=2".into()]);
        let resp = Response {
            id: "req-42".to_string(),
            status_code: 201,
            headers,
            body: b"created".to_vec(),
        };
        write_response(&mut client, &resp).await.unwrap();

        let decoded = read_response(&mut server).await.unwrap();
        assert_eq!(decoded, resp);
    }

    #[tokio::test]
    async fn test_ready_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_ready(&mut client).await.unwrap();
        read_ready(&mut server).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_accepts_empty_object() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Hand-built Ready frame with a `{}` payload
        client
            .write_all(&[TAG_READY, 0, 0, 0, 2, b'{', b'}'])
            .await
            .unwrap();
        read_ready(&mut server).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_rejects_non_object() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&[TAG_READY, 0, 0, 0, 4, b'n', b'u', b'l', b'l'])
            .await
            .unwrap();
        assert!(matches!(
            read_ready(&mut server).await,
            Err(FrameError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_tag_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_request(&mut client, &sample_request()).await.unwrap();

        let err = read_response(&mut server).await.unwrap_err();
        match err {
            FrameError::UnexpectedTag { got, want } => {
                assert_eq!(got, TAG_REQUEST);
                assert_eq!(want, TAG_RESPONSE);
            }
            other => panic!("expected UnexpectedTag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client
            .write_all(&[TAG_RESPONSE, len[0], len[1], len[2], len[3]])
            .await
            .unwrap();
        assert!(matches!(
            read_response(&mut server).await,
            Err(FrameError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Length says 100 bytes, but the peer hangs up after 3.
        client
            .write_all(&[TAG_REQUEST, 0, 0, 0, 100, b'a', b'b', b'c'])
            .await
            .unwrap();
        drop(client);
        assert!(matches!(
            read_request(&mut server).await,
            Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_json_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&[TAG_REQUEST, 0, 0, 0, 3, b'{', b'{', b'{'])
            .await
            .unwrap();
        assert!(matches!(
            read_request(&mut server).await,
            Err(FrameError::Json(_))
        ));
    }
}
