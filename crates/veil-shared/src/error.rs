use thiserror::Error;

use crate::types::Status;

/// Every failure the relay protocol can produce.
///
/// The split between fatal and non-fatal kinds drives connection handling:
/// non-fatal errors become a status code written back to the caller, fatal
/// ones tear the connection down.
#[derive(Error, Debug)]
pub enum VeilError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    #[error("Corrupted frame: {0}")]
    Corrupted(String),

    #[error("Unsupported protocol version: {0}")]
    Version(u32),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Not implemented: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Transport(#[from] std::io::Error),
}

impl VeilError {
    /// Fatal errors close the connection and clean up everything it registered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VeilError::Checksum(_)
                | VeilError::Corrupted(_)
                | VeilError::Version(_)
                | VeilError::Crypto(_)
                | VeilError::Transport(_)
        )
    }

    /// Status written back to the caller for this error.
    pub fn status(&self) -> Status {
        match self {
            VeilError::Validation(_) => Status::BadRequest,
            VeilError::NotFound(_) => Status::NotFound,
            VeilError::Capacity(_) => Status::ServiceUnavailable,
            VeilError::Unsupported(_) => Status::NotImplemented,
            VeilError::Internal(_) => Status::InternalServerError,
            _ => Status::None,
        }
    }

    /// Inverse of [`VeilError::status`] for a non-ok status a peer answered
    /// with; `what` names the failed operation.
    pub fn from_status(status: Status, what: &str) -> Self {
        match status {
            Status::BadRequest => VeilError::validation(format!("{what} rejected by peer")),
            Status::NotFound => VeilError::not_found(format!("{what}: not found on peer")),
            Status::NotImplemented => VeilError::Unsupported(format!("{what} not supported by peer")),
            Status::ServiceUnavailable => VeilError::Capacity(format!("{what}: peer busy")),
            Status::Ok | Status::InternalServerError | Status::None => {
                VeilError::Internal(format!("{what} failed on peer ({status})"))
            }
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        VeilError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        VeilError::NotFound(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Unsupported hash: {0}")]
    UnsupportedHash(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(VeilError::Checksum("crc".into()).is_fatal());
        assert!(VeilError::Version(99).is_fatal());
        assert!(VeilError::Crypto(CryptoError::DecryptionFailed).is_fatal());
        assert!(!VeilError::validation("name").is_fatal());
        assert!(!VeilError::Capacity("transfers".into()).is_fatal());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(VeilError::validation("x").status(), Status::BadRequest);
        assert_eq!(VeilError::not_found("x").status(), Status::NotFound);
        assert_eq!(
            VeilError::Capacity("x".into()).status(),
            Status::ServiceUnavailable
        );
        assert_eq!(
            VeilError::Unsupported("x".into()).status(),
            Status::NotImplemented
        );
        assert_eq!(VeilError::Version(1).status(), Status::None);
    }

    #[test]
    fn test_from_status_maps_back() {
        for status in [
            Status::BadRequest,
            Status::NotFound,
            Status::NotImplemented,
            Status::ServiceUnavailable,
            Status::InternalServerError,
        ] {
            assert_eq!(VeilError::from_status(status, "browse").status(), status);
        }
    }
}
