//! Browser-fingerprint round-tripper
//!
//! Built per tunnelled connection when the `utls` argument names a browser
//! profile: the TLS ClientHello, ALPN, and User-Agent all tell the same
//! story. Unlike the native round-tripper there is no sharing — each
//! connection gets its own client so its TLS sessions stay its own.

use async_trait::async_trait;
use url::Url;

use super::native::send_with_client;
use super::{RoundTripper, TransportError, TunnelRequest, TunnelResponse};
use crate::obfuscation::{build_tls_config, BrowserProfile, FingerprintError};

/// Round-tripper whose TLS layer mimics a named browser.
pub struct MimicRoundTripper {
    client: reqwest::Client,
}

impl MimicRoundTripper {
    /// Build a client for the profile named by `name` (e.g. `chrome`,
    /// `firefox`, or a uTLS-style `HelloChrome_Auto`), routed through
    /// `proxy` when given.
    pub fn new(name: &str, proxy: Option<&Url>) -> Result<Self, TransportError> {
        let profile = BrowserProfile::from_name(name)
            .ok_or_else(|| TransportError::UnknownProfile(name.to_string()))?;
        let tls = build_tls_config(profile)?;

        let builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .user_agent(profile.user_agent());
        let builder = match proxy {
            Some(url) => builder.proxy(reqwest::Proxy::all(url.as_str())?),
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl From<FingerprintError> for TransportError {
    fn from(e: FingerprintError) -> Self {
        TransportError::Tls(e.to_string())
    }
}

#[async_trait]
impl RoundTripper for MimicRoundTripper {
    async fn round_trip(&self, request: &TunnelRequest) -> Result<TunnelResponse, TransportError> {
        send_with_client(&self.client, request).await
    }
}
