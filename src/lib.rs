//! # Mirage Tunnel
//!
//! A blocking-resistant tunnelling transport that carries an arbitrary
//! bidirectional byte stream as a sequence of ordinary HTTP(S)
//! request/response pairs.
//!
//! ## How it works
//!
//! ```text
//! ┌──────────────┐  SOCKS  ┌───────────────┐  HTTP POST   ┌───────────────┐  TCP  ┌────────────┐
//! │ local client ├────────▶│ mirage-client ├─────────────▶│ mirage-server ├──────▶│ downstream │
//! └──────────────┘         └───────────────┘  ≤64 KiB     └───────────────┘       └────────────┘
//! ```
//!
//! The client splits each local SOCKS stream into HTTP POST requests keyed
//! by a random session id; the server demultiplexes requests by that id
//! onto persistent connections to a co-located downstream service and ships
//! back whatever the service produced before a short turnaround deadline.
//! To the network the exchange looks like normal web traffic, and the
//! TLS/DNS name can be rotated independently of the HTTP Host header
//! (domain fronting).

pub mod config;
pub mod logging;
pub mod obfuscation;
pub mod proxy;
pub mod pt;
pub mod relay;
pub mod transport;
pub mod tunnel;

/// Program version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The largest request body the server is willing to process, and the
/// largest chunk of data either side will send in a single body.
pub const MAX_PAYLOAD_LENGTH: usize = 0x10000;

/// Session ids shorter than this are rejected, as a weak defence against
/// client bugs that send an empty id or something similarly likely to
/// collide.
pub const MIN_SESSION_ID_LENGTH: usize = 8;

/// Number of random bytes in a freshly generated session id (encoded as
/// unpadded base64 on the wire).
pub const SESSION_ID_LENGTH: usize = 8;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Transport plugin error: {0}")]
    Pt(#[from] pt::PtError),

    #[error("Configuration error: {0}")]
    Config(String),
}
