//! Client configuration loaded from environment variables.
//!
//! Same conventions as the router: every field has a default and invalid
//! values are logged and ignored.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use veil_shared::constants::DEFAULT_ROUTER_PORT;
use veil_shared::protocol::{JoinRequest, Preferences};
use veil_shared::{GroupId, RoomId, RouterType};

use crate::connection::HandshakeParams;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Env: `VEIL_ROUTER_ADDR`, default `127.0.0.1:8080`
    pub router_addr: SocketAddr,

    /// Router used for upload/download; `None` uses `router_addr`.
    /// Env: `VEIL_TRANSFER_ADDR`
    pub transfer_addr: Option<SocketAddr>,

    /// Env: `VEIL_NAME`
    pub name: String,

    /// Env: `VEIL_COLOR`
    pub color: String,

    /// Env: `VEIL_GROUP`
    pub group: GroupId,

    /// Passphrase for a verified name.
    /// Env: `VEIL_PASSWORD`
    pub password: Option<String>,

    /// Answer search, browse and transfer requests.
    /// Env: `VEIL_SHARE` (true/false)
    pub share: bool,

    /// Rooms joined after every (re)connect.
    /// Env: `VEIL_ROOMS` as `lobby,music`
    pub rooms: Vec<RoomId>,

    /// Env: `VEIL_PRIME_SIZE`
    pub prime_size: u32,

    /// Env: `VEIL_KEY_SIZE`
    pub key_size: u32,

    /// Env: `VEIL_TRANSFER_PRIME_SIZE`
    pub transfer_prime_size: u32,

    /// Sizes below this send stretching parameters.
    /// Env: `VEIL_WEAK_PRIME_THRESHOLD`
    pub weak_prime_threshold: u32,

    /// Env: `VEIL_RETRY_DELAY` (seconds)
    pub retry_delay: Duration,

    /// Env: `VEIL_SOCKET_TIMEOUT` (seconds)
    pub socket_timeout: Duration,

    /// Env: `VEIL_REVERSE_PING_DELAY` (milliseconds)
    pub reverse_ping_delay: Duration,

    /// Env: `VEIL_CHAT` (true/false)
    pub chat: bool,

    /// Env: `VEIL_TRANSFER` (true/false)
    pub transfer: bool,

    /// Env: `VEIL_DOWNLOAD_POLL` (milliseconds)
    pub download_poll: Duration,

    /// Env: `VEIL_UPLOAD_POLL` (milliseconds)
    pub upload_poll: Duration,

    /// A transfer that moves no chunk for this long is abandoned.
    /// Env: `VEIL_STALL_TIMEOUT` (seconds)
    pub stall_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            router_addr: ([127, 0, 0, 1], DEFAULT_ROUTER_PORT).into(),
            transfer_addr: None,
            name: "anonymous".to_string(),
            color: "#808080".to_string(),
            group: GroupId::default(),
            password: None,
            share: false,
            rooms: Vec::new(),
            prime_size: 2048,
            key_size: 256,
            transfer_prime_size: 2048,
            weak_prime_threshold: 2048,
            retry_delay: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(30),
            reverse_ping_delay: Duration::from_millis(500),
            chat: true,
            transfer: true,
            download_poll: Duration::from_millis(100),
            upload_poll: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("VEIL_ROUTER_ADDR", &mut config.router_addr);
        if let Ok(raw) = std::env::var("VEIL_TRANSFER_ADDR") {
            match raw.trim().parse() {
                Ok(addr) => config.transfer_addr = Some(addr),
                Err(_) => tracing::warn!(key = "VEIL_TRANSFER_ADDR", value = %raw, "Invalid value, using default"),
            }
        }
        if let Ok(name) = std::env::var("VEIL_NAME") {
            config.name = name;
        }
        if let Ok(color) = std::env::var("VEIL_COLOR") {
            config.color = color;
        }
        if let Ok(group) = std::env::var("VEIL_GROUP") {
            config.group = GroupId::new(group);
        }
        config.password = std::env::var("VEIL_PASSWORD").ok().filter(|p| !p.is_empty());
        env_flag("VEIL_SHARE", &mut config.share);
        if let Ok(rooms) = std::env::var("VEIL_ROOMS") {
            config.rooms = parse_rooms(&rooms);
        }

        env_parse("VEIL_PRIME_SIZE", &mut config.prime_size);
        env_parse("VEIL_KEY_SIZE", &mut config.key_size);
        env_parse("VEIL_TRANSFER_PRIME_SIZE", &mut config.transfer_prime_size);
        env_parse("VEIL_WEAK_PRIME_THRESHOLD", &mut config.weak_prime_threshold);

        env_secs("VEIL_RETRY_DELAY", &mut config.retry_delay);
        env_secs("VEIL_SOCKET_TIMEOUT", &mut config.socket_timeout);
        env_millis("VEIL_REVERSE_PING_DELAY", &mut config.reverse_ping_delay);
        env_flag("VEIL_CHAT", &mut config.chat);
        env_flag("VEIL_TRANSFER", &mut config.transfer);
        env_millis("VEIL_DOWNLOAD_POLL", &mut config.download_poll);
        env_millis("VEIL_UPLOAD_POLL", &mut config.upload_poll);
        env_secs("VEIL_STALL_TIMEOUT", &mut config.stall_timeout);

        config
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr.unwrap_or(self.router_addr)
    }

    pub fn handshake(&self, router_type: RouterType) -> HandshakeParams {
        let prime_size = match router_type {
            RouterType::Message => self.prime_size,
            RouterType::Transfer => self.transfer_prime_size,
        };
        HandshakeParams {
            router_type,
            prime_size,
            key_size: self.key_size,
            weak_prime_threshold: self.weak_prime_threshold,
            timeout: self.socket_timeout,
        }
    }

    pub fn join_request(&self) -> JoinRequest {
        JoinRequest {
            name: self.name.clone(),
            color: self.color.clone(),
            group: self.group.clone(),
            passphrase: self.password.clone(),
            share: self.share,
            prefs: Preferences {
                chat: self.chat,
                transfer: self.transfer,
            },
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

fn env_millis(key: &str, target: &mut Duration) {
    let mut millis = target.as_millis() as u64;
    env_parse(key, &mut millis);
    *target = Duration::from_millis(millis);
}

fn parse_rooms(raw: &str) -> Vec<RoomId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(RoomId::new)
        .collect()
}
