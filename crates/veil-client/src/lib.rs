//! Client side of the Veil relay.
//!
//! [`Client::spawn`] starts a background task that drives the connection
//! state machine (handshake, join, rooms, tunnel, run) and reconnects after
//! failures. The host talks to it through a [`ClientHandle`] and receives
//! [`ClientEvent`]s on a channel.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
mod handlers;
mod machine;
pub mod share;
pub mod transfer;

pub use client::{Client, ClientHandle};
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, ClientState};
pub use share::{ChunkSink, FileSink, FsStore, MemorySink, MemoryStore, ShareStore};

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber honouring `RUST_LOG`.
///
/// Hosts that configure tracing themselves should skip this; a second global
/// subscriber is silently ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,veil_client=debug")),
        )
        .try_init();
}
