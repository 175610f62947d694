//! Transport envelope: 4-byte little-endian length prefix + bincode frame.
//!
//! A [`Request`] carries the sender's session id, optional origin/target
//! client ids and an opaque body. The body is a packed frame, encrypted under
//! the session cipher once a session exists.

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{pack, unpack};
use crate::constants::MAX_FRAME_LEN;
use crate::crypto::SessionCipher;
use crate::error::VeilError;
use crate::protocol::Payload;
use crate::types::{ClientId, SessionId, Status};

const LEN_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub session_id: Option<SessionId>,
    pub origin: Option<ClientId>,
    pub targets: Vec<ClientId>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(session_id: Option<SessionId>, body: Vec<u8>) -> Self {
        Self {
            session_id,
            origin: None,
            targets: Vec::new(),
            body,
        }
    }

    pub fn with_origin(mut self, origin: ClientId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_targets(mut self, targets: Vec<ClientId>) -> Self {
        self.targets = targets;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Pack and encrypt payloads into an envelope body.
pub fn seal(cipher: &SessionCipher, payloads: &[Payload]) -> Result<Vec<u8>, VeilError> {
    let packed = pack(payloads)?;
    Ok(cipher.encrypt(&packed)?)
}

/// Decrypt and unpack an envelope body. An empty body carries no payloads.
pub fn open(cipher: &SessionCipher, body: &[u8]) -> Result<Vec<Payload>, VeilError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let packed = cipher.decrypt(body)?;
    unpack(&packed)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), VeilError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::DefaultOptions::new()
        .serialize(frame)
        .map_err(|e| VeilError::Internal(format!("frame encode: {e}")))?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| VeilError::validation(format!("frame of {} bytes too large", bytes.len())))?;

    let mut out = Vec::with_capacity(LEN_SIZE + bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&bytes);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, VeilError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    let mut filled = 0;
    while filled < LEN_SIZE {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(VeilError::Corrupted(format!("frame length {len} exceeds limit")));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    let frame = bincode::DefaultOptions::new()
        .deserialize(&bytes)
        .map_err(|e| VeilError::Corrupted(format!("frame decode: {e}")))?;
    Ok(Some(frame))
}

pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, VeilError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(Frame::Request(req)) => Ok(Some(req)),
        Some(Frame::Response(_)) => Err(VeilError::Corrupted("expected request frame".into())),
        None => Ok(None),
    }
}

pub async fn read_response<R>(reader: &mut R) -> Result<Response, VeilError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(Frame::Response(resp)) => Ok(resp),
        Some(Frame::Request(_)) => Err(VeilError::Corrupted("expected response frame".into())),
        None => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_CIPHER;
    use crate::protocol::{ChatRequest, PingRequest};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = Request::new(Some(SessionId::random()), vec![1, 2, 3])
            .with_origin(ClientId::random())
            .with_targets(vec![ClientId::random()]);

        write_frame(&mut a, &Frame::Request(req.clone())).await.unwrap();
        write_frame(&mut a, &Frame::Response(Response::status(Status::NotFound)))
            .await
            .unwrap();

        assert_eq!(read_request(&mut b).await.unwrap(), Some(req));
        let resp = read_response(&mut b).await.unwrap();
        assert_eq!(resp.status, Status::NotFound);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn test_clean_close_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&100u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0u8; 10]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, VeilError::Transport(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, VeilError::Corrupted(_)));
    }

    #[test]
    fn test_seal_open() {
        let cipher = SessionCipher::new(DEFAULT_CIPHER, &[3u8; 32]).unwrap();
        let payloads = vec![
            Payload::ChatRequest(ChatRequest::new("sealed")),
            Payload::PingRequest(PingRequest { reverse: true }),
        ];
        let body = seal(&cipher, &payloads).unwrap();
        assert_eq!(open(&cipher, &body).unwrap(), payloads);
        assert!(open(&cipher, &[]).unwrap().is_empty());

        let other = SessionCipher::new(DEFAULT_CIPHER, &[4u8; 32]).unwrap();
        assert!(matches!(open(&other, &body), Err(VeilError::Crypto(_))));
    }
}
