//! Server relay core
//!
//! The server terminates HTTP(S), demultiplexes POST requests by session id
//! onto persistent connections to a downstream service, and ships back
//! whatever the service produced before a short turnaround deadline. GET
//! requests get the cover identity instead.

mod handler;
mod listener;
mod session;

pub use handler::{CoverConfig, Relay};
pub use listener::start_server;
pub use session::{transact, SessionTable};

use std::time::Duration;

/// How long to try to read something back from the downstream connection
/// before returning the response. Shorter wastes polls; longer accumulates
/// head-of-line delay.
pub const TURNAROUND_TIMEOUT: Duration = Duration::from_millis(10);

/// Ceiling on the handling of one request, body read included.
pub const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// Cull unused sessions (with their downstream connections) when we have
/// not seen any activity for this long.
pub const MAX_SESSION_STALENESS: Duration = Duration::from_secs(120);

/// How long to wait for the serve loop to report an error before deciding
/// that startup succeeded.
pub const LISTEN_ERROR_TIMEOUT: Duration = Duration::from_millis(100);

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("downstream connection closed")]
    DownstreamClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("cannot listen on port 0; configure an explicit port")]
    PortZero,
}
