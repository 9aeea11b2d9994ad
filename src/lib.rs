//! # Transocks
//!
//! A transparent proxy that picks up TCP connections redirected by the
//! kernel's packet filter and relays them through an upstream SOCKS5 server.
//! The original destination of every intercepted connection is recovered from
//! the socket and forwarded inside the SOCKS5 CONNECT request, so neither the
//! client nor the destination has to know the proxy exists.
//!
//! ## Connection lifecycle
//!
//! Every intercepted connection is owned by a [`Client`], which walks through
//! the states of [`ClientState`]:
//!
//! 1. **`new`**: the listener accepted the socket and the transparent method
//!    recovered the original destination.
//! 2. **`relay_connected`**: a TCP connection to the SOCKS5 relay is open.
//! 3. **`handshake_finished`**: method negotiation (no authentication) and the
//!    CONNECT request succeeded.
//! 4. **`pumping`**: bytes flow in both directions until both peers have
//!    closed their write side, an error occurs, or the idle timer fires.
//! 5. **`invalid`**: the connection was torn down. Nothing leaves this state.
//!
//! ## Execution model
//!
//! Everything runs on one current-thread tokio runtime. Each connection is a
//! local task, shared state lives in `Rc`/`RefCell`, and no borrow is held
//! across an `.await`. The [`Environment`] keeps a registry of every live
//! connection so that a shutdown signal can tear them all down.
//!
//! ## Example
//!
//! ```no_run
//! use transocks::{config::Config, Environment};
//!
//! fn main() -> transocks::Result<()> {
//!     let config = Config::new(
//!         "0.0.0.0:12345".parse().unwrap(),
//!         "0.0.0.0:12345".parse().unwrap(),
//!         "127.0.0.1:1080".parse().unwrap(),
//!     );
//!     let env = Environment::create(config)?;
//!     env.run()
//! }
//! ```

use std::io;

use protocol::{AuthMethod, Reply};
use thiserror::Error;

pub mod client;
pub mod config;
pub mod env;
pub mod listener;
pub mod protocol;
pub mod pump;
pub mod signal;
mod socks5_connector;
pub mod transparent;

pub use client::{Client, ClientId, ClientInfo, ClientState};
pub use env::{EnvHandle, Environment};
pub use socks5_connector::Socks5Connector;

pub type Result<T> = std::result::Result<T, TransocksError>;

#[derive(Error, Debug)]
pub enum TransocksError {
    #[error("SOCKS5 relay replied: {0}")]
    Socks5Error(#[from] Reply),
    #[error("SOCKS5 relay accepts none of the offered methods")]
    NoAcceptableMethods,
    #[error("SOCKS5 relay selected an unsupported method: {0}")]
    UnsupportedMethod(AuthMethod),
    #[error("Malformed SOCKS5 reply: {0}")]
    MalformedReply(&'static str),
    #[error("{0} timeout expired")]
    Timeout(client::TimeoutKind),
    #[error("Invalid address and port: {0}")]
    InvalidAddrPort(String),
    #[error("Unknown pump method: {0}")]
    UnknownPumpMethod(String),
    #[error("Unknown transparent method: {0}")]
    UnknownTransparentMethod(String),
    #[error("Error in network operation: {0}")]
    IoError(#[from] io::Error),
}
