//! Client/server object replication and remote commands over UDP.
//!
//! The pieces, bottom up: a self-describing bit-packed value codec keyed by
//! a minimal perfect hash over command and field names, a command dictionary
//! shipped to clients in a manifest, reliable and unreliable message
//! channels over packet-level acks, and the [`Server`] / [`Client`]
//! endpoints. [`NetCtx`] wraps one optional server plus local clients for
//! the common single-loop setup.

pub mod channel;
pub mod client;
pub mod codec;
pub mod command;
pub mod context;
pub mod dispatcher;
pub mod endpoint;
pub mod mphf;
pub mod protocol;
pub mod server;
pub mod token;
pub mod transport;

pub use client::{Client, ClientEvents, ClientState};
pub use codec::{TypeDesc, Value};
pub use command::{CallReply, CommandHandle, CommandRegistry, NetRole};
pub use context::NetCtx;
pub use dispatcher::ServerDispatcher;
pub use endpoint::{Call, NetError};
pub use protocol::{ClientData, ClientId, DEFAULT_PORT, MAX_PLAYERS, ObjectId};
pub use server::{Server, ServerConfig, ServerEvents};
pub use token::{
    DEFAULT_TOKEN_LIFETIME, TOKEN_BYTES, generate_connect_token, key_from_secret,
    verify_connect_token,
};
pub use transport::{NetworkStats, PacketLossSimulation};
