//! Handshake rules shared by initiator (client) and responder (router).
//!
//! Both sides derive the session key with [`session_key`]: a request that
//! carries stretching parameters is stretched, anything else is hashed
//! directly from the X25519 shared secret.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CIPHER, DEFAULT_GENERATOR, DEFAULT_GROUP, DEFAULT_HASH, DEFAULT_ITERATIONS,
    DEFAULT_SALT_SIZE,
};
use crate::crypto::{self, KeyAgreement, SessionCipher};
use crate::error::{CryptoError, VeilError};
use crate::protocol::{HandshakeRequest, HandshakeResponse, KdfParams};
use crate::types::{RouterType, SessionId};

/// Strength labels and key sizes a router accepts for one router type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePolicy {
    pub prime_sizes: Vec<u32>,
    pub key_sizes: Vec<u32>,
    /// Prime sizes below this must carry stretching parameters
    pub weak_prime_threshold: u32,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            prime_sizes: vec![1024, 1536, 2048, 3072, 4096],
            key_sizes: vec![256],
            weak_prime_threshold: 2048,
        }
    }
}

impl HandshakePolicy {
    pub fn is_weak(&self, prime_size: u32) -> bool {
        prime_size < self.weak_prime_threshold
    }

    pub fn check(&self, req: &HandshakeRequest) -> Result<(), VeilError> {
        req.validate()?;
        if !req.group.eq_ignore_ascii_case(DEFAULT_GROUP) {
            return Err(CryptoError::KeyAgreement(format!("unsupported group {}", req.group)).into());
        }
        if !self.prime_sizes.contains(&req.prime_size) {
            return Err(VeilError::validation(format!(
                "prime size {} not allowed for {} routers",
                req.prime_size, req.router_type
            )));
        }
        if !self.key_sizes.contains(&req.key_size) {
            return Err(VeilError::validation(format!(
                "key size {} not allowed for {} routers",
                req.key_size, req.router_type
            )));
        }
        if self.is_weak(req.prime_size) && req.kdf.is_none() {
            return Err(VeilError::validation(format!(
                "prime size {} requires stretching parameters",
                req.prime_size
            )));
        }
        Ok(())
    }
}

/// The derivation rule both parties apply to the raw shared secret.
pub fn session_key(shared: &[u8], req: &HandshakeRequest) -> Result<Vec<u8>, CryptoError> {
    match &req.kdf {
        Some(kdf) => crypto::stretch(&kdf.hash, shared, &kdf.salt, kdf.iterations, req.key_size),
        None => crypto::derive_key(shared, req.key_size),
    }
}

/// Outcome of a completed handshake on either side.
#[derive(Debug)]
pub struct Established {
    pub session_id: SessionId,
    pub cipher: SessionCipher,
}

/// Client half of the exchange: holds the ephemeral secret until the
/// router's response arrives.
pub struct Initiator {
    agreement: KeyAgreement,
    request: HandshakeRequest,
}

impl Initiator {
    pub fn new(
        router_type: RouterType,
        prime_size: u32,
        key_size: u32,
        weak_prime_threshold: u32,
        previous: Option<SessionId>,
    ) -> Self {
        let agreement = KeyAgreement::generate();
        let kdf = (prime_size < weak_prime_threshold).then(|| KdfParams {
            hash: DEFAULT_HASH.to_string(),
            salt: crypto::generate_salt(DEFAULT_SALT_SIZE),
            iterations: DEFAULT_ITERATIONS,
        });
        let request = HandshakeRequest {
            router_type,
            group: DEFAULT_GROUP.to_string(),
            prime_size,
            generator: DEFAULT_GENERATOR,
            public_key: agreement.public_key().to_vec(),
            cipher: DEFAULT_CIPHER.to_string(),
            key_size,
            kdf,
            session_id: previous,
        };
        Self { agreement, request }
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    pub fn complete(self, response: &HandshakeResponse) -> Result<Established, VeilError> {
        let shared = self.agreement.compute(&response.public_key)?;
        let key = session_key(&shared, &self.request)?;
        let cipher = SessionCipher::new(&self.request.cipher, &key)?;
        Ok(Established {
            session_id: response.session_id.clone(),
            cipher,
        })
    }
}

/// Router half: our public key and the bound cipher. The caller allocates
/// or migrates the session id.
pub struct Accepted {
    pub public_key: Vec<u8>,
    pub cipher: SessionCipher,
}

pub fn respond(policy: &HandshakePolicy, req: &HandshakeRequest) -> Result<Accepted, VeilError> {
    policy.check(req)?;
    let agreement = KeyAgreement::generate();
    let shared = agreement.compute(&req.public_key)?;
    let key = session_key(&shared, req)?;
    let cipher = SessionCipher::new(&req.cipher, &key)?;
    Ok(Accepted {
        public_key: agreement.public_key().to_vec(),
        cipher,
    })
}
