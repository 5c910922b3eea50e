//! # slsk-client
//!
//! A client library for the Soulseek peer-to-peer file sharing network.
//!
//! The crate provides the full network substrate: a server session over a
//! single long-lived connection, a peer connection manager handling direct
//! and firewall-piercing establishment, a distributed-mesh manager that
//! forwards search traffic through a parent/children tree, framed message
//! codecs for all four protocol scopes, and upload/download engines with
//! token-bucket throttling.
//!
//! Start with [`SoulseekClient`]: construct it with [`ClientOptions`], log
//! in, and consume the returned event channel.

pub mod client;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod events;
pub mod limiter;
pub mod messages;
pub mod protocol;
pub mod resolvers;
pub mod transfer;
pub mod waiter;

mod listener;
mod mesh;
mod peers;
mod session;

pub use client::SoulseekClient;
pub use config::ClientOptions;
pub use error::{Error, Result};
pub use protocol::{MessageRead, MessageWrite, ProtocolRead, ProtocolWrite};
