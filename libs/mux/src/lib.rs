//! Connection multiplexing for a single bound listener.
//!
//! This library provides:
//! - A multiplexing [`Listener`] that owns the bound socket, runs the accept
//!   loop and applies a pluggable error-handling policy
//! - [`SniffedConn`], which lets matching logic peek at a connection's first
//!   bytes and replay them to whoever reads the connection next
//! - [`MuxListener`], a listener facade fed by the multiplexer, so any
//!   server written against [`Listen`] can be driven by it
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use connmux::{matcher, Listen, Listener, ListenerConfig};
//!
//! let mux = Arc::new(Listener::bind(ListenerConfig::new(":7000")).await?);
//! mux.serve_async(matcher::prefix("SSH-"), |listener| async move {
//!     loop {
//!         let (conn, peer_addr) = listener.accept().await?;
//!         // hand `conn` to the SSH side
//!     }
//! });
//! mux.serve().await?;
//! ```

pub mod error;
pub mod facade;
pub mod listen;
pub mod matcher;
pub mod mux;
pub mod sniff;

pub use error::{is_temporary_io, ErrorHandler, MuxError};
pub use facade::MuxListener;
pub use listen::{BoundListener, Listen};
pub use matcher::{MatchResult, Matcher};
pub use mux::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_SNIFF_BYTES, DEFAULT_QUEUE_CAPACITY,
};
pub use sniff::{Sniff, SniffedConn};
