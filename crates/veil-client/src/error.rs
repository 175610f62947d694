use thiserror::Error;
use veil_shared::{Status, VeilError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] VeilError),

    #[error("Router answered {status} to {what}")]
    Refused { status: Status, what: &'static str },

    #[error("Unexpected reply to {0}")]
    Unexpected(&'static str),

    #[error("Not connected to a router")]
    NotConnected,

    #[error("Client task has stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Fatal errors mean the router connection is unusable and the state
    /// machine has to reconnect.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Protocol(e) => e.is_fatal(),
            ClientError::Io(_) | ClientError::NotConnected => true,
            ClientError::Refused { .. } | ClientError::Unexpected(_) | ClientError::Stopped => {
                false
            }
        }
    }

    /// Status to answer the router with when an inbound request fails.
    pub fn status(&self) -> Status {
        match self {
            ClientError::Protocol(e) => match e.status() {
                Status::None => Status::InternalServerError,
                status => status,
            },
            ClientError::Refused { status, .. } => *status,
            ClientError::Unexpected(_) => Status::BadRequest,
            ClientError::NotConnected | ClientError::Stopped | ClientError::Io(_) => {
                Status::InternalServerError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_follows_protocol_kind() {
        assert!(ClientError::from(VeilError::Corrupted("frame".into())).is_fatal());
        assert!(!ClientError::from(VeilError::validation("path")).is_fatal());
        assert!(!ClientError::Refused {
            status: Status::NotFound,
            what: "browse"
        }
        .is_fatal());
        assert!(ClientError::NotConnected.is_fatal());
    }

    #[test]
    fn test_status_never_none() {
        let err = ClientError::from(VeilError::Checksum("crc".into()));
        assert_eq!(err.status(), Status::InternalServerError);
        let err = ClientError::from(VeilError::not_found("file"));
        assert_eq!(err.status(), Status::NotFound);
    }
}
