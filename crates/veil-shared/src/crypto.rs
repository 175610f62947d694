use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{
    DEFAULT_CIPHER, DEFAULT_HASH, KDF_CONTEXT_SESSION_KEY, KDF_CONTEXT_STRETCH, NONCE_SIZE,
    PUBKEY_SIZE,
};
use crate::error::CryptoError;

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Cipher bound to a session once the handshake completes.
pub struct SessionCipher {
    cipher: XChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(name: &str, key: &[u8]) -> Result<Self, CryptoError> {
        if !name.eq_ignore_ascii_case(DEFAULT_CIPHER) {
            return Err(CryptoError::UnsupportedCipher(name.to_string()));
        }
        let cipher =
            XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    // Returns nonce || ciphertext (24 bytes nonce prepended)
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = generate_nonce();
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(xchacha20poly1305)")
    }
}

/// One side of an X25519 exchange.
pub struct KeyAgreement {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyAgreement {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBKEY_SIZE] {
        self.public.to_bytes()
    }

    /// Shared secret with the peer's public key. Low-order peer keys, which
    /// would yield an all-zero secret, are rejected.
    pub fn compute(&self, peer_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let bytes: [u8; PUBKEY_SIZE] = peer_public
            .try_into()
            .map_err(|_| CryptoError::KeyAgreement("peer key must be 32 bytes".into()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyAgreement("non-contributory peer key".into()));
        }
        Ok(shared.to_bytes())
    }
}

/// Key of `key_size` bits hashed directly from the shared secret.
pub fn derive_key(shared_secret: &[u8], key_size: u32) -> Result<Vec<u8>, CryptoError> {
    if key_size == 0 || key_size % 8 != 0 {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SESSION_KEY);
    hasher.update(shared_secret);
    let mut key = vec![0u8; (key_size >> 3) as usize];
    hasher.finalize_xof().fill(&mut key);
    Ok(key)
}

/// Salted, iterated hashing of a weak shared secret before key derivation.
pub fn stretch(
    hash: &str,
    shared_secret: &[u8],
    salt: &[u8],
    iterations: u32,
    key_size: u32,
) -> Result<Vec<u8>, CryptoError> {
    if !hash.eq_ignore_ascii_case(DEFAULT_HASH) {
        return Err(CryptoError::UnsupportedHash(hash.to_string()));
    }

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_STRETCH);
    hasher.update(salt);
    hasher.update(shared_secret);
    let mut block = *hasher.finalize().as_bytes();

    for _ in 1..iterations {
        let mut round = blake3::Hasher::new_keyed(&block);
        round.update(salt);
        block = *round.finalize().as_bytes();
    }

    derive_key(&block, key_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SessionCipher {
        SessionCipher::new(DEFAULT_CIPHER, &[7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let c = cipher();
        let encrypted = c.encrypt(b"over the relay").unwrap();
        assert_eq!(c.decrypt(&encrypted).unwrap(), b"over the relay");
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = cipher().encrypt(b"secret").unwrap();
        let other = SessionCipher::new(DEFAULT_CIPHER, &[8u8; 32]).unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher();
        let mut encrypted = c.encrypt(b"important").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xff;
        assert!(c.decrypt(&encrypted).is_err());
        assert!(c.decrypt(&[]).is_err());
    }

    #[test]
    fn test_cipher_rejects_bad_input() {
        assert!(matches!(
            SessionCipher::new("aes-256-cbc", &[0u8; 32]),
            Err(CryptoError::UnsupportedCipher(_))
        ));
        assert!(matches!(
            SessionCipher::new(DEFAULT_CIPHER, &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength)
        ));
    }

    #[test]
    fn test_both_sides_agree() {
        let a = KeyAgreement::generate();
        let b = KeyAgreement::generate();
        let shared_a = a.compute(&b.public_key()).unwrap();
        let shared_b = b.compute(&a.public_key()).unwrap();
        assert_eq!(shared_a, shared_b);
        assert_eq!(derive_key(&shared_a, 256).unwrap(), derive_key(&shared_b, 256).unwrap());
    }

    #[test]
    fn test_low_order_key_rejected() {
        let a = KeyAgreement::generate();
        assert!(matches!(a.compute(&[0u8; 32]), Err(CryptoError::KeyAgreement(_))));
        assert!(a.compute(&[1u8; 12]).is_err());
    }

    #[test]
    fn test_derive_key_length() {
        assert_eq!(derive_key(b"secret", 128).unwrap().len(), 16);
        assert_eq!(derive_key(b"secret", 512).unwrap().len(), 64);
        assert!(derive_key(b"secret", 0).is_err());
        assert!(derive_key(b"secret", 100).is_err());
    }

    #[test]
    fn test_stretch_depends_on_salt_and_iterations() {
        let base = stretch(DEFAULT_HASH, b"weak", b"salt-a", 16, 256).unwrap();
        assert_eq!(base, stretch(DEFAULT_HASH, b"weak", b"salt-a", 16, 256).unwrap());
        assert_ne!(base, stretch(DEFAULT_HASH, b"weak", b"salt-b", 16, 256).unwrap());
        assert_ne!(base, stretch(DEFAULT_HASH, b"weak", b"salt-a", 17, 256).unwrap());
        assert_ne!(base, derive_key(b"weak", 256).unwrap());
        assert!(matches!(
            stretch("md5", b"weak", b"salt", 1, 256),
            Err(CryptoError::UnsupportedHash(_))
        ));
    }
}
