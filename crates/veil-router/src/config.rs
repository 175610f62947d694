//! Router configuration loaded from environment variables.
//!
//! Every setting has a default, so a router starts with zero configuration
//! for local development. Invalid values are logged and ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use veil_shared::constants::{
    DEFAULT_CHUNK_BUFFER, DEFAULT_CHUNK_DRIFT, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_THREADS,
    DEFAULT_MAX_TRANSFERS, DEFAULT_ROUTER_PORT, MAX_CHUNK_SIZE, MAX_TEXT_SIZE, MIN_CHUNK_SIZE,
};
use veil_shared::handshake::HandshakePolicy;
use veil_shared::RouterType;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Env: `VEIL_LISTEN_ADDR`, default `0.0.0.0:8080`
    pub listen_addr: SocketAddr,

    /// Env: `VEIL_ROUTER_NAME`
    pub name: String,

    /// Message of the day returned on join.
    /// Env: `VEIL_MOTD`
    pub motd: String,

    /// Serve chat, presence, search and browse.
    /// Env: `VEIL_MESSAGE_ROUTER` (true/false)
    pub message_router: bool,

    /// Serve chunk upload/download.
    /// Env: `VEIL_TRANSFER_ROUTER` (true/false)
    pub transfer_router: bool,

    /// Bytes per chunk, clamped to the protocol limits.
    /// Env: `VEIL_CHUNK_SIZE`
    pub chunk_size: u64,

    /// Download-queue capacity in chunks.
    /// Env: `VEIL_CHUNK_BUFFER`
    pub chunk_buffer: usize,

    /// Upload in-flight window in chunks; 0 disables the window.
    /// Env: `VEIL_CHUNK_DRIFT`
    pub chunk_drift: u64,

    /// Env: `VEIL_MAX_TRANSFERS`
    pub max_transfers: usize,

    /// Broadcast fan-out worker cap.
    /// Env: `VEIL_MAX_THREADS`
    pub max_threads: usize,

    /// Env: `VEIL_MAX_TEXT`
    pub max_text: usize,

    /// Env: `VEIL_SOCKET_TIMEOUT` (seconds)
    pub socket_timeout: Duration,

    /// How long a disconnected session stays available for migration.
    /// Env: `VEIL_SESSION_TIMEOUT` (seconds)
    pub session_timeout: Duration,

    /// Env: `VEIL_TRANSFER_TIMEOUT` (seconds)
    pub transfer_timeout: Duration,

    /// Grace period for a joined client to open its tunnel.
    /// Env: `VEIL_CLIENT_TIMEOUT` (seconds)
    pub client_timeout: Duration,

    /// Env: `VEIL_SWEEP_INTERVAL` (seconds)
    pub sweep_interval: Duration,

    /// Requests allowed per window before suppression; 0 disables the guard.
    /// Env: `VEIL_SPAM_THRESHOLD`
    pub spam_threshold: u32,

    /// Env: `VEIL_SPAM_WINDOW` (seconds)
    pub spam_window: Duration,

    /// Suppression length, 1 to 60 minutes.
    /// Env: `VEIL_SPAM_TIMEOUT` (minutes)
    pub spam_timeout: Duration,

    /// Env: `VEIL_MESSAGE_PRIME_SIZES`, `VEIL_MESSAGE_KEY_SIZES`
    pub message_policy: HandshakePolicy,

    /// Env: `VEIL_TRANSFER_PRIME_SIZES`, `VEIL_TRANSFER_KEY_SIZES`
    pub transfer_policy: HandshakePolicy,

    /// Verified names and their passphrases.
    /// Env: `VEIL_VERIFIED` as `name:passphrase,name:passphrase`
    pub verified: HashMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_ROUTER_PORT).into(),
            name: "Veil Router".to_string(),
            motd: String::new(),
            message_router: true,
            transfer_router: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_buffer: DEFAULT_CHUNK_BUFFER as usize,
            chunk_drift: DEFAULT_CHUNK_DRIFT,
            max_transfers: DEFAULT_MAX_TRANSFERS,
            max_threads: DEFAULT_MAX_THREADS,
            max_text: MAX_TEXT_SIZE,
            socket_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(300),
            transfer_timeout: Duration::from_secs(120),
            client_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            spam_threshold: 10,
            spam_window: Duration::from_secs(10),
            spam_timeout: Duration::from_secs(5 * 60),
            message_policy: HandshakePolicy::default(),
            transfer_policy: HandshakePolicy::default(),
            verified: HashMap::new(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("VEIL_LISTEN_ADDR", &mut config.listen_addr);
        if let Ok(name) = std::env::var("VEIL_ROUTER_NAME") {
            config.name = name;
        }
        if let Ok(motd) = std::env::var("VEIL_MOTD") {
            config.motd = motd;
        }
        env_flag("VEIL_MESSAGE_ROUTER", &mut config.message_router);
        env_flag("VEIL_TRANSFER_ROUTER", &mut config.transfer_router);

        env_parse("VEIL_CHUNK_SIZE", &mut config.chunk_size);
        config.chunk_size = config.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        env_parse("VEIL_CHUNK_BUFFER", &mut config.chunk_buffer);
        env_parse("VEIL_CHUNK_DRIFT", &mut config.chunk_drift);
        env_parse("VEIL_MAX_TRANSFERS", &mut config.max_transfers);
        env_parse("VEIL_MAX_THREADS", &mut config.max_threads);
        config.max_threads = config.max_threads.max(1);
        env_parse("VEIL_MAX_TEXT", &mut config.max_text);

        env_secs("VEIL_SOCKET_TIMEOUT", &mut config.socket_timeout);
        env_secs("VEIL_SESSION_TIMEOUT", &mut config.session_timeout);
        env_secs("VEIL_TRANSFER_TIMEOUT", &mut config.transfer_timeout);
        env_secs("VEIL_CLIENT_TIMEOUT", &mut config.client_timeout);
        env_secs("VEIL_SWEEP_INTERVAL", &mut config.sweep_interval);

        env_parse("VEIL_SPAM_THRESHOLD", &mut config.spam_threshold);
        env_secs("VEIL_SPAM_WINDOW", &mut config.spam_window);
        let mut spam_minutes = config.spam_timeout.as_secs() / 60;
        env_parse("VEIL_SPAM_TIMEOUT", &mut spam_minutes);
        config.spam_timeout = Duration::from_secs(spam_minutes.clamp(1, 60) * 60);

        env_sizes("VEIL_MESSAGE_PRIME_SIZES", &mut config.message_policy.prime_sizes);
        env_sizes("VEIL_MESSAGE_KEY_SIZES", &mut config.message_policy.key_sizes);
        env_sizes("VEIL_TRANSFER_PRIME_SIZES", &mut config.transfer_policy.prime_sizes);
        env_sizes("VEIL_TRANSFER_KEY_SIZES", &mut config.transfer_policy.key_sizes);
        let mut threshold = config.message_policy.weak_prime_threshold;
        env_parse("VEIL_WEAK_PRIME_THRESHOLD", &mut threshold);
        config.message_policy.weak_prime_threshold = threshold;
        config.transfer_policy.weak_prime_threshold = threshold;

        if let Ok(list) = std::env::var("VEIL_VERIFIED") {
            config.verified = parse_verified(&list);
        }

        config
    }

    pub fn serves(&self, router_type: RouterType) -> bool {
        match router_type {
            RouterType::Message => self.message_router,
            RouterType::Transfer => self.transfer_router,
        }
    }

    pub fn policy(&self, router_type: RouterType) -> &HandshakePolicy {
        match router_type {
            RouterType::Message => &self.message_policy,
            RouterType::Transfer => &self.transfer_policy,
        }
    }

    /// True when `passphrase` matches the verified entry for `name`.
    pub fn is_verified(&self, name: &str, passphrase: Option<&str>) -> bool {
        match (self.verified.get(name), passphrase) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

fn env_flag(key: &str, target: &mut bool) {
    if let Ok(val) = std::env::var(key) {
        *target = val != "false" && val != "0";
    }
}

fn env_secs(key: &str, target: &mut Duration) {
    let mut secs = target.as_secs();
    env_parse(key, &mut secs);
    *target = Duration::from_secs(secs);
}

fn env_sizes(key: &str, target: &mut Vec<u32>) {
    if let Ok(raw) = std::env::var(key) {
        match parse_sizes(&raw) {
            Some(sizes) => *target = sizes,
            None => tracing::warn!(key, value = %raw, "Invalid size list, using default"),
        }
    }
}

/// Parse `"1024, 2048"` into sizes; `None` on any bad entry or an empty list.
fn parse_sizes(raw: &str) -> Option<Vec<u32>> {
    let sizes: Option<Vec<u32>> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().ok().filter(|n| *n > 0))
        .collect();
    sizes.filter(|v| !v.is_empty())
}

fn parse_verified(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, pass) = entry.split_once(':')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), pass.to_string()))
        })
        .collect()
}
