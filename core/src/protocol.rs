//! Local stream-socket wire protocol (spec.md §6): every frame is `u32 length | u8 kind |
//! payload`, `length` counting only the payload. Two JSON frame kinds carry control requests and
//! responses; two binary frame kinds carry the raw terminal byte stream in each direction once a
//! client has attached. Grounded on the teacher's `web_server.rs` WS message framing, adapted
//! from axum's `Message` enum to raw length-prefixed frames over a Unix stream socket, with the
//! `kind` byte idiom borrowed from the shpool-style chunk framing studied in the example pack.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Frames larger than this are rejected outright (spec.md §6).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    JsonRequest = 0,
    JsonResponse = 1,
    StreamStdout = 2,
    StreamStdin = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(FrameKind::JsonRequest),
            1 => Ok(FrameKind::JsonResponse),
            2 => Ok(FrameKind::StreamStdout),
            3 => Ok(FrameKind::StreamStdin),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// A single decoded frame: its kind plus raw payload bytes. JSON frames still carry their bytes
/// here; callers deserialize after matching on `kind`.
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|_| ProtocolError::Desynchronized)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut kind_buf = [0u8; 1];
    r.read_exact(&mut kind_buf).await?;
    let kind = FrameKind::try_from(kind_buf[0])?;

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&[kind as u8]).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_json_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    response: &Response,
) -> Result<(), ProtocolError> {
    let bytes = serde_json::to_vec(response).map_err(ProtocolError::MalformedJson)?;
    write_frame(w, FrameKind::JsonResponse, &bytes).await
}

pub fn decode_request(frame: &Frame) -> Result<Request, ProtocolError> {
    serde_json::from_slice(&frame.payload).map_err(ProtocolError::MalformedJson)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Attach {
        cols: u16,
        rows: u16,
        /// Priority newly-composed messages from this client are enqueued at (spec.md §3 Client
        /// attribute "chosen default priority"); defaults to `Normal` when omitted.
        #[serde(default)]
        default_priority: Option<crate::queue::Priority>,
    },
    Send {
        from: String,
        priority: crate::queue::Priority,
        body: String,
    },
    Status,
    Stop,
    Hook {
        state: crate::tracker::AgentState,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Attached {
        cols: u16,
        rows: u16,
    },
    Status {
        state: crate::tracker::AgentState,
        pending_messages: usize,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameKind::StreamStdin, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.kind, FrameKind::StreamStdin);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        buf.push(FrameKind::StreamStdin as u8);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(9);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFrameKind(9)));
    }

    #[test]
    fn decode_attach_request() {
        let json = br#"{"type":"attach","cols":80,"rows":24}"#;
        let frame = Frame {
            kind: FrameKind::JsonRequest,
            payload: json.to_vec(),
        };
        let req = decode_request(&frame).unwrap();
        match req {
            Request::Attach { cols, rows, default_priority } => {
                assert_eq!(cols, 80);
                assert_eq!(rows, 24);
                assert_eq!(default_priority, None);
            }
            _ => panic!("wrong variant"),
        }
    }
}
