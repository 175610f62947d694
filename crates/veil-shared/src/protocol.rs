//! Typed payloads carried inside a packed frame.
//!
//! Each payload has a one-byte [`PayloadType`] tag. The codec writes the tags
//! of every payload in a frame up front so the receiver can route by type
//! before it decodes any bodies.

use std::io::{Read, Write};

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkRange};
use crate::constants::*;
use crate::error::VeilError;
use crate::types::{ClientId, GroupId, RoomId, RouterType, SessionId, Status, TransferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadType {
    HandshakeRequest = 0x01,
    HandshakeResponse = 0x02,
    JoinRequest = 0x03,
    JoinResponse = 0x04,
    PingRequest = 0x05,
    PingResponse = 0x06,
    RoomRequest = 0x07,
    RoomResponse = 0x08,
    MuteRequest = 0x09,
    ChatRequest = 0x0a,
    BrowseRequest = 0x0b,
    BrowseResponse = 0x0c,
    SearchRequest = 0x0d,
    SearchResponse = 0x0e,
    TransferRequest = 0x0f,
    TransferResponse = 0x10,
    UploadRequest = 0x11,
    UploadResponse = 0x12,
    DownloadRequest = 0x13,
    DownloadResponse = 0x14,
    TunnelRequest = 0x15,
    QuitRequest = 0x16,
    Info = 0x17,
}

impl PayloadType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use PayloadType::*;
        let ty = match b {
            0x01 => HandshakeRequest,
            0x02 => HandshakeResponse,
            0x03 => JoinRequest,
            0x04 => JoinResponse,
            0x05 => PingRequest,
            0x06 => PingResponse,
            0x07 => RoomRequest,
            0x08 => RoomResponse,
            0x09 => MuteRequest,
            0x0a => ChatRequest,
            0x0b => BrowseRequest,
            0x0c => BrowseResponse,
            0x0d => SearchRequest,
            0x0e => SearchResponse,
            0x0f => TransferRequest,
            0x10 => TransferResponse,
            0x11 => UploadRequest,
            0x12 => UploadResponse,
            0x13 => DownloadRequest,
            0x14 => DownloadResponse,
            0x15 => TunnelRequest,
            0x16 => QuitRequest,
            0x17 => Info,
            _ => return None,
        };
        Some(ty)
    }
}

/// Every payload the relay exchanges.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    RoomRequest(RoomRequest),
    RoomResponse(RoomResponse),
    MuteRequest(MuteRequest),
    ChatRequest(ChatRequest),
    BrowseRequest(BrowseRequest),
    BrowseResponse(BrowseResponse),
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    UploadRequest(UploadRequest),
    UploadResponse(UploadResponse),
    DownloadRequest(DownloadRequest),
    DownloadResponse(DownloadResponse),
    TunnelRequest(TunnelRequest),
    QuitRequest(QuitRequest),
    Info(InfoEvent),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

fn put<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), VeilError> {
    options()
        .serialize_into(writer, value)
        .map_err(|e| VeilError::Internal(format!("payload encode: {e}")))
}

fn take<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, VeilError> {
    options()
        .deserialize_from(reader)
        .map_err(|e| VeilError::validation(format!("payload decode: {e}")))
}

impl Payload {
    pub fn kind(&self) -> PayloadType {
        match self {
            Payload::HandshakeRequest(_) => PayloadType::HandshakeRequest,
            Payload::HandshakeResponse(_) => PayloadType::HandshakeResponse,
            Payload::JoinRequest(_) => PayloadType::JoinRequest,
            Payload::JoinResponse(_) => PayloadType::JoinResponse,
            Payload::PingRequest(_) => PayloadType::PingRequest,
            Payload::PingResponse(_) => PayloadType::PingResponse,
            Payload::RoomRequest(_) => PayloadType::RoomRequest,
            Payload::RoomResponse(_) => PayloadType::RoomResponse,
            Payload::MuteRequest(_) => PayloadType::MuteRequest,
            Payload::ChatRequest(_) => PayloadType::ChatRequest,
            Payload::BrowseRequest(_) => PayloadType::BrowseRequest,
            Payload::BrowseResponse(_) => PayloadType::BrowseResponse,
            Payload::SearchRequest(_) => PayloadType::SearchRequest,
            Payload::SearchResponse(_) => PayloadType::SearchResponse,
            Payload::TransferRequest(_) => PayloadType::TransferRequest,
            Payload::TransferResponse(_) => PayloadType::TransferResponse,
            Payload::UploadRequest(_) => PayloadType::UploadRequest,
            Payload::UploadResponse(_) => PayloadType::UploadResponse,
            Payload::DownloadRequest(_) => PayloadType::DownloadRequest,
            Payload::DownloadResponse(_) => PayloadType::DownloadResponse,
            Payload::TunnelRequest(_) => PayloadType::TunnelRequest,
            Payload::QuitRequest(_) => PayloadType::QuitRequest,
            Payload::Info(_) => PayloadType::Info,
        }
    }

    /// Write the payload body (without its tag).
    pub fn encode_body<W: Write>(&self, w: &mut W) -> Result<(), VeilError> {
        match self {
            Payload::HandshakeRequest(p) => put(w, p),
            Payload::HandshakeResponse(p) => put(w, p),
            Payload::JoinRequest(p) => put(w, p),
            Payload::JoinResponse(p) => put(w, p),
            Payload::PingRequest(p) => put(w, p),
            Payload::PingResponse(p) => put(w, p),
            Payload::RoomRequest(p) => put(w, p),
            Payload::RoomResponse(p) => put(w, p),
            Payload::MuteRequest(p) => put(w, p),
            Payload::ChatRequest(p) => put(w, p),
            Payload::BrowseRequest(p) => put(w, p),
            Payload::BrowseResponse(p) => put(w, p),
            Payload::SearchRequest(p) => put(w, p),
            Payload::SearchResponse(p) => put(w, p),
            Payload::TransferRequest(p) => put(w, p),
            Payload::TransferResponse(p) => put(w, p),
            Payload::UploadRequest(p) => put(w, p),
            Payload::UploadResponse(p) => put(w, p),
            Payload::DownloadRequest(p) => put(w, p),
            Payload::DownloadResponse(p) => put(w, p),
            Payload::TunnelRequest(p) => put(w, p),
            Payload::QuitRequest(p) => put(w, p),
            Payload::Info(p) => put(w, p),
        }
    }

    /// Read one payload body whose tag came from the frame header.
    pub fn decode_body<R: Read>(kind: PayloadType, r: &mut R) -> Result<Self, VeilError> {
        let payload = match kind {
            PayloadType::HandshakeRequest => Payload::HandshakeRequest(take(r)?),
            PayloadType::HandshakeResponse => Payload::HandshakeResponse(take(r)?),
            PayloadType::JoinRequest => Payload::JoinRequest(take(r)?),
            PayloadType::JoinResponse => Payload::JoinResponse(take(r)?),
            PayloadType::PingRequest => Payload::PingRequest(take(r)?),
            PayloadType::PingResponse => Payload::PingResponse(take(r)?),
            PayloadType::RoomRequest => Payload::RoomRequest(take(r)?),
            PayloadType::RoomResponse => Payload::RoomResponse(take(r)?),
            PayloadType::MuteRequest => Payload::MuteRequest(take(r)?),
            PayloadType::ChatRequest => Payload::ChatRequest(take(r)?),
            PayloadType::BrowseRequest => Payload::BrowseRequest(take(r)?),
            PayloadType::BrowseResponse => Payload::BrowseResponse(take(r)?),
            PayloadType::SearchRequest => Payload::SearchRequest(take(r)?),
            PayloadType::SearchResponse => Payload::SearchResponse(take(r)?),
            PayloadType::TransferRequest => Payload::TransferRequest(take(r)?),
            PayloadType::TransferResponse => Payload::TransferResponse(take(r)?),
            PayloadType::UploadRequest => Payload::UploadRequest(take(r)?),
            PayloadType::UploadResponse => Payload::UploadResponse(take(r)?),
            PayloadType::DownloadRequest => Payload::DownloadRequest(take(r)?),
            PayloadType::DownloadResponse => Payload::DownloadResponse(take(r)?),
            PayloadType::TunnelRequest => Payload::TunnelRequest(take(r)?),
            PayloadType::QuitRequest => Payload::QuitRequest(take(r)?),
            PayloadType::Info => Payload::Info(take(r)?),
        };
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Field validation
// ---------------------------------------------------------------------------

pub(crate) fn check_len(field: &str, value: &str, max: usize) -> Result<(), VeilError> {
    if value.len() > max {
        return Err(VeilError::validation(format!(
            "{field} exceeds {max} bytes ({})",
            value.len()
        )));
    }
    Ok(())
}

fn check_session_id(id: &SessionId) -> Result<(), VeilError> {
    check_len("session id", &id.0, MAX_ID_SIZE)?;
    if !id.is_well_formed() {
        return Err(VeilError::validation("session id is not hex"));
    }
    Ok(())
}

fn check_not_empty(field: &str, value: &str) -> Result<(), VeilError> {
    if value.trim().is_empty() {
        return Err(VeilError::validation(format!("{field} is empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Stretching parameters sent when the negotiated strength is weak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub hash: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub router_type: RouterType,
    pub group: String,
    pub prime_size: u32,
    pub generator: u32,
    pub public_key: Vec<u8>,
    pub cipher: String,
    pub key_size: u32,
    pub kdf: Option<KdfParams>,
    /// Session id held before a reconnect, if any
    pub session_id: Option<SessionId>,
}

impl HandshakeRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        check_len("group", &self.group, MAX_CIPHER_SIZE)?;
        check_len("cipher", &self.cipher, MAX_CIPHER_SIZE)?;
        if self.public_key.len() != PUBKEY_SIZE {
            return Err(VeilError::validation(format!(
                "public key must be {PUBKEY_SIZE} bytes, got {}",
                self.public_key.len()
            )));
        }
        if let Some(kdf) = &self.kdf {
            check_len("hash", &kdf.hash, MAX_HASH_SIZE)?;
            if kdf.salt.is_empty() || kdf.salt.len() > MAX_SALT_SIZE {
                return Err(VeilError::validation("salt length out of range"));
            }
            if kdf.iterations == 0 || kdf.iterations > MAX_ITERATIONS {
                return Err(VeilError::validation("iteration count out of range"));
            }
        }
        if let Some(id) = &self.session_id {
            check_session_id(id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub public_key: Vec<u8>,
    pub session_id: SessionId,
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Event types a member is willing to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub chat: bool,
    pub transfer: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            chat: true,
            transfer: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub color: String,
    pub group: GroupId,
    pub passphrase: Option<String>,
    pub share: bool,
    pub prefs: Preferences,
}

impl JoinRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        check_not_empty("name", &self.name)?;
        check_len("name", &self.name, MAX_NAME_SIZE)?;
        check_len("color", &self.color, MAX_COLOR_SIZE)?;
        check_len("group", &self.group.0, MAX_ID_SIZE)?;
        if let Some(pass) = &self.passphrase {
            check_len("passphrase", pass, MAX_PASSPHRASE_SIZE)?;
        }
        Ok(())
    }
}

/// Public view of a member, as listed to other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: ClientId,
    pub name: String,
    pub color: String,
    pub troll: bool,
    pub verified: bool,
    pub share: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub members: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub client: ClientId,
    pub name: String,
    pub motd: String,
    pub members: Vec<MemberInfo>,
    pub rooms: Vec<RoomInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomRequest {
    Browse,
    Join { room: RoomId },
    Quit { room: RoomId },
}

impl RoomRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        match self {
            RoomRequest::Browse => Ok(()),
            RoomRequest::Join { room } | RoomRequest::Quit { room } => {
                check_not_empty("room", &room.0)?;
                check_len("room", &room.0, MAX_ID_SIZE)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomResponse {
    pub rooms: Vec<RoomInfo>,
    pub members: Vec<MemberInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRequest {
    pub client: ClientId,
    pub mute: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoKind {
    Join,
    Leave,
    Rename,
    Update,
}

/// Presence notice pushed to group members over their tunnels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEvent {
    pub kind: InfoKind,
    pub member: MemberInfo,
    pub room: Option<RoomId>,
}

// ---------------------------------------------------------------------------
// Chat / ping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    pub room: Option<RoomId>,
    pub timestamp: DateTime<Utc>,
}

impl ChatRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            room: None,
            timestamp: Utc::now(),
        }
    }

    pub fn validate(&self, max_text: usize) -> Result<(), VeilError> {
        check_not_empty("text", &self.text)?;
        check_len("text", &self.text, max_text)?;
        if let Some(room) = &self.room {
            check_len("room", &room.0, MAX_ID_SIZE)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingRequest {
    /// Ask the router to ping back over the caller's tunnel
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PingResponse {
    pub reverse: Option<Status>,
}

// ---------------------------------------------------------------------------
// Sharing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

impl FileInfo {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrowseRequest {
    pub path: String,
}

impl BrowseRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        check_len("path", &self.path, MAX_PATH_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrowseResponse {
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub keyword: String,
}

impl SearchRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        check_not_empty("keyword", &self.keyword)?;
        check_len("keyword", &self.keyword, MAX_KEYWORD_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub keyword: String,
    pub files: Vec<FileInfo>,
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub transfer: TransferId,
    pub file: FileInfo,
}

impl TransferRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        check_not_empty("path", &self.file.path)?;
        check_len("path", &self.file.path, MAX_PATH_SIZE)?;
        if self.file.size == 0 {
            return Err(VeilError::validation("file size is zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResponse {
    pub transfer: TransferId,
    pub chunk_size: u64,
}

/// Uploader side: hand in the chunk just read (if any), get the next range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub transfer: TransferId,
    pub file_size: u64,
    pub chunk: Option<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadResponse {
    /// False when the download buffer was full; resend the same chunk
    pub accepted: bool,
    pub range: Option<ChunkRange>,
    pub done: bool,
}

/// Downloader side: acknowledge delivered chunks, get the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub transfer: TransferId,
    pub file_size: u64,
    pub acks: Vec<ChunkRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub chunk: Option<Chunk>,
    pub done: bool,
}

// ---------------------------------------------------------------------------
// Connection control
// ---------------------------------------------------------------------------

/// Turns the connection it arrives on into the relay channel of the client
/// that owns `session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub session: SessionId,
}

impl TunnelRequest {
    pub fn validate(&self) -> Result<(), VeilError> {
        check_session_id(&self.session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuitRequest {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_type_from_byte() {
        assert_eq!(PayloadType::from_byte(0x0a), Some(PayloadType::ChatRequest));
        assert_eq!(PayloadType::from_byte(0x17), Some(PayloadType::Info));
        assert_eq!(PayloadType::from_byte(0x00), None);
        assert_eq!(PayloadType::from_byte(0xff), None);
    }

    #[test]
    fn test_kind_matches_tag() {
        let payload = Payload::PingRequest(PingRequest { reverse: true });
        assert_eq!(payload.kind(), PayloadType::PingRequest);
        assert_eq!(payload.kind() as u8, 0x05);
    }

    #[test]
    fn test_body_roundtrip_through_tag() {
        let payload = Payload::MuteRequest(MuteRequest {
            client: ClientId::random(),
            mute: true,
        });
        let mut buf = Vec::new();
        payload.encode_body(&mut buf).unwrap();
        let decoded = Payload::decode_body(payload.kind(), &mut buf.as_slice()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_truncated_body_is_validation_error() {
        let payload = Payload::SearchRequest(SearchRequest {
            keyword: "holiday".into(),
        });
        let mut buf = Vec::new();
        payload.encode_body(&mut buf).unwrap();
        buf.truncate(2);
        let err = Payload::decode_body(PayloadType::SearchRequest, &mut buf.as_slice());
        assert!(matches!(err, Err(VeilError::Validation(_))));
    }

    #[test]
    fn test_join_validation() {
        let mut join = JoinRequest {
            name: "alice".into(),
            color: "#ff0000".into(),
            group: GroupId::default(),
            passphrase: None,
            share: false,
            prefs: Preferences::default(),
        };
        assert!(join.validate().is_ok());

        join.name = "x".repeat(MAX_NAME_SIZE + 1);
        assert!(join.validate().is_err());

        join.name = "   ".into();
        assert!(join.validate().is_err());
    }

    #[test]
    fn test_chat_validation_uses_limit() {
        let chat = ChatRequest::new("hello there");
        assert!(chat.validate(64).is_ok());
        assert!(chat.validate(5).is_err());
        assert!(ChatRequest::new("").validate(64).is_err());
    }

    #[test]
    fn test_handshake_rejects_short_key() {
        let req = HandshakeRequest {
            router_type: RouterType::Message,
            group: DEFAULT_GROUP.into(),
            prime_size: 2048,
            generator: DEFAULT_GENERATOR,
            public_key: vec![0u8; 16],
            cipher: DEFAULT_CIPHER.into(),
            key_size: 256,
            kdf: None,
            session_id: None,
        };
        assert!(matches!(req.validate(), Err(VeilError::Validation(_))));
    }

    #[test]
    fn test_file_name() {
        let file = FileInfo {
            path: "music/live/set.flac".into(),
            size: 10,
        };
        assert_eq!(file.name(), "set.flac");
    }
}
