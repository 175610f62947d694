//! # veil-router
//!
//! Relay router for the Veil network. Clients connect, negotiate an
//! encrypted session, join a group and talk to each other only through the
//! router:
//! - **message role**: membership, rooms, chat, search and browse fan-out
//!   over per-client tunnels
//! - **transfer role**: chunked file relay between an uploading and a
//!   downloading client, with bounded buffering
//!
//! One process can serve either role or both.

pub mod broadcast;
pub mod commands;
pub mod config;
pub mod context;
pub mod directory;
pub mod guard;
pub mod server;
pub mod session;
pub mod transfer;
pub mod tunnel;

pub use config::RouterConfig;
pub use context::RouterContext;
pub use server::{serve, spawn_sweeper};
