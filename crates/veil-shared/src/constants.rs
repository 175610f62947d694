/// Wire protocol version written into every packed frame
pub const PROTOCOL_VERSION: u32 = 4;

/// Oldest peer version this build can still interpret
pub const MIN_PROTOCOL_VERSION: u32 = 4;

/// Newest peer version this build can still interpret
pub const MAX_PROTOCOL_VERSION: u32 = 4;

/// Application name
pub const APP_NAME: &str = "Veil";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Cipher negotiated by default during the handshake
pub const DEFAULT_CIPHER: &str = "xchacha20poly1305";

/// Hash used for key stretching when the prime is weak
pub const DEFAULT_HASH: &str = "blake3";

/// Key agreement group named in the handshake
pub const DEFAULT_GROUP: &str = "x25519";

/// DH generator advertised with the group
pub const DEFAULT_GENERATOR: u32 = 2;

/// Default stretching iterations for weak primes
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Salt length generated by initiators for weak primes
pub const DEFAULT_SALT_SIZE: usize = 16;

/// Field-size limits enforced by every handler before touching shared state
pub const MAX_ID_SIZE: usize = 64;
pub const MAX_NAME_SIZE: usize = 64;
pub const MAX_COLOR_SIZE: usize = 16;
pub const MAX_TEXT_SIZE: usize = 2048;
pub const MAX_KEYWORD_SIZE: usize = 256;
pub const MAX_PASSPHRASE_SIZE: usize = 128;
pub const MAX_KEY_SIZE: usize = 512;
pub const MAX_CIPHER_SIZE: usize = 32;
pub const MAX_HASH_SIZE: usize = 32;
pub const MAX_SALT_SIZE: usize = 64;
pub const MAX_PATH_SIZE: usize = 1024;
pub const MAX_ITERATIONS: u32 = 1 << 20;

/// Upper bound on one length-prefixed frame (16 MiB)
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Chunk sizing (bytes)
pub const MIN_CHUNK_SIZE: u64 = 1 << 10;
pub const DEFAULT_CHUNK_SIZE: u64 = 768 << 10;
pub const MAX_CHUNK_SIZE: u64 = 8 << 20;

/// Download-queue capacity in chunks
pub const DEFAULT_CHUNK_BUFFER: u64 = 16;

/// Upload in-flight window; 0 disables the window
pub const DEFAULT_CHUNK_DRIFT: u64 = 0;

/// Concurrent transfers a router will hold
pub const DEFAULT_MAX_TRANSFERS: usize = 1 << 10;

/// Broadcast fan-out worker cap
pub const DEFAULT_MAX_THREADS: usize = 128;

/// Default TCP port of a router
pub const DEFAULT_ROUTER_PORT: u16 = 8080;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SESSION_KEY: &str = "veil-session-key-v1";
pub const KDF_CONTEXT_STRETCH: &str = "veil-stretch-v1";
