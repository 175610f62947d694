//! Shared protocol core for the Veil relay: wire codec, payload types,
//! session crypto, handshake rules, chunk queues and envelope framing.
//!
//! Both the router and the client build on this crate; nothing in here
//! owns a socket.

pub mod chunk;
pub mod codec;
pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod types;

pub use codec::{pack, unpack};
pub use envelope::{read_frame, write_frame, Frame, Request, Response};
pub use error::{CryptoError, VeilError};
pub use protocol::{Payload, PayloadType};
pub use types::{ClientId, GroupId, RoomId, RouterType, SessionId, Status, TransferId};
