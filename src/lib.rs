//! Multi-room chat server library
//!
//! One TCP port, two wire protocols:
//! - a line protocol for raw-socket clients (telnet, netcat)
//! - JSON envelopes over WebSocket frames, after an HTTP upgrade
//!
//! Both share the same rooms and private messaging.
//!
//! # Features
//! - First-byte protocol sniffing with byte-exact replay
//! - Upgrade handshake and frame codec
//! - Telnet-friendly line editing with server-side echo
//! - Lazily created rooms, with a `lobby` that always exists
//! - Best-effort fan-out: slow clients lose messages, never stall others
//! - Case-insensitive direct messages
//!
//! # Architecture
//! - `ChatServer` is the shared context, passed to every handler as an `Arc`
//! - `RoomRegistry` and each `Room` have their own `RwLock`; no lock is held
//!   across socket I/O
//! - Each connection has a reader (the handler task) and a writer task that
//!   drains the client's bounded mailbox
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use multichat::{serve, ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!     serve(listener, Arc::new(ChatServer::new(config))).await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod message;
pub mod room;
pub mod server;
pub mod sniff;
pub mod text;
pub mod types;
pub mod writer;

// Re-export main types for convenience
pub use client::{Client, Delivery, Mailbox};
pub use config::ServerConfig;
pub use error::{AppError, FrameError, HandshakeError};
pub use handler::{handle_connection, handle_stream, serve};
pub use message::{ClientEnvelope, Command, Envelope, RoomSummary};
pub use room::{Room, RoomRegistry};
pub use server::{ChatServer, Flow};
pub use types::{ClientId, Transport};
