//! Request-issuing transports
//!
//! The client's whole contact with the network is "issue one POST, get back
//! a status and at most 64 KiB of body". That capability is the
//! [`RoundTripper`] trait, with three implementations chosen per
//! connection:
//!
//! - [`NativeRoundTripper`] — a shared, pooled HTTP client;
//! - [`HelperRoundTripper`] — delegates the request to an external browser
//!   helper over a local TCP socket;
//! - [`MimicRoundTripper`] — a per-connection client whose TLS ClientHello
//!   mimics a named browser profile.

pub mod helper;
pub mod mimic;
pub mod native;

pub use helper::HelperRoundTripper;
pub use mimic::MimicRoundTripper;
pub use native::NativeRoundTripper;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;
use url::Url;

/// Try an HTTP round trip at most this many times.
pub const MAX_TRIES: u32 = 10;

/// Wait this long between retries.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status code was {0}, not 200")]
    Status(u16),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("helper error: {0}")]
    Helper(String),

    #[error("helper timeout")]
    HelperTimeout,

    #[error("unknown TLS fingerprint profile {0:?}")]
    UnknownProfile(String),

    #[error("invalid Host header value {0:?}")]
    InvalidHost(String),

    #[error("don't understand proxy URL scheme {0:?}")]
    UnsupportedProxyScheme(String),

    #[error("a proxy URL with a username or password can't be used with the helper")]
    ProxyCredentialsWithHelper,
}

/// One tunnelled request: everything needed to build the POST.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// The URL to request
    pub url: Url,
    /// Host header override; when set, the URL names the front and this
    /// names the covert origin
    pub host: Option<String>,
    /// Value for the `X-Session-Id` header
    pub session_id: String,
    /// Payload chunk; empty means a bare poll
    pub body: Bytes,
}

/// The interesting parts of a completed round trip.
#[derive(Debug)]
pub struct TunnelResponse {
    pub status: u16,
    /// Response body, already capped at [`crate::MAX_PAYLOAD_LENGTH`]
    pub body: Bytes,
}

/// A way to carry one POST to the server and bring back its response.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, request: &TunnelRequest) -> Result<TunnelResponse, TransportError>;
}

/// Do a round trip, trying at most `limit` times if there is an HTTP status
/// other than 200. In case all tries fail, returns the last error seen.
///
/// Only a completed round trip with a bad status is retried. A
/// transport-level error leaves the remote in an unknown state, and
/// retrying it could replay bytes the server already consumed, so it
/// returns immediately.
pub async fn round_trip_retries(
    rt: &dyn RoundTripper,
    request: &TunnelRequest,
    limit: u32,
) -> Result<TunnelResponse, TransportError> {
    let mut limit = limit;
    loop {
        limit = limit.saturating_sub(1);
        let response = rt.round_trip(request).await?;
        if response.status == 200 {
            return Ok(response);
        }
        let err = TransportError::Status(response.status);
        if limit == 0 {
            return Err(err);
        }
        info!(
            "{}; trying again after {} seconds ({})",
            err,
            RETRY_DELAY.as_secs(),
            limit
        );
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

/// Check that a proxy URL works with the rest of the configuration.
///
/// Natively we hand the proxy to the HTTP client, which speaks http, https
/// and socks5. With the helper it is the browser that does the proxying:
/// http, socks5 and socks4a are accepted but credentials cannot be
/// forwarded.
pub fn check_proxy_url(url: &Url, with_helper: bool) -> Result<(), TransportError> {
    if !with_helper {
        match url.scheme() {
            "http" | "https" | "socks5" => Ok(()),
            other => Err(TransportError::UnsupportedProxyScheme(other.to_string())),
        }
    } else {
        match url.scheme() {
            "http" | "socks5" | "socks4a" => {}
            other => return Err(TransportError::UnsupportedProxyScheme(other.to_string())),
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(TransportError::ProxyCredentialsWithHelper);
        }
        Ok(())
    }
}
