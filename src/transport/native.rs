//! Native HTTP round-tripper
//!
//! A single pooled client shared by every tunnelled connection, so that
//! polls reuse warm connections to the server. Environment proxy settings
//! are ignored; only an explicitly configured proxy URL is honored.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE, HOST};
use url::Url;

use super::{RoundTripper, TransportError, TunnelRequest, TunnelResponse};
use crate::MAX_PAYLOAD_LENGTH;

/// Round-tripper backed by a shared [`reqwest::Client`].
pub struct NativeRoundTripper {
    client: reqwest::Client,
}

impl NativeRoundTripper {
    /// Build the shared client, routing through `proxy` when given.
    pub fn new(proxy: Option<&Url>) -> Result<Self, TransportError> {
        let builder = reqwest::Client::builder();
        let builder = match proxy {
            Some(url) => builder.proxy(reqwest::Proxy::all(url.as_str())?),
            None => builder.no_proxy(),
        };
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl RoundTripper for NativeRoundTripper {
    async fn round_trip(&self, request: &TunnelRequest) -> Result<TunnelResponse, TransportError> {
        send_with_client(&self.client, request).await
    }
}

/// Issue `request` through `client` and collect at most
/// [`MAX_PAYLOAD_LENGTH`] bytes of response body.
pub(crate) async fn send_with_client(
    client: &reqwest::Client,
    request: &TunnelRequest,
) -> Result<TunnelResponse, TransportError> {
    let mut builder = client
        .post(request.url.clone())
        .header(CONTENT_TYPE, "application/octet-stream")
        .header("X-Session-Id", &request.session_id);

    if let Some(host) = &request.host {
        let host = HeaderValue::from_str(host)
            .map_err(|_| TransportError::InvalidHost(host.clone()))?;
        builder = builder.header(HOST, host);
    }
    // An empty chunk is sent with no body attached at all; the client then
    // signals emptiness with Content-Length: 0 rather than a chunked
    // zero-length stream, which some HTTP/2 backends reject with 411.
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();

    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let remaining = MAX_PAYLOAD_LENGTH - body.len();
        if remaining == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }

    Ok(TunnelResponse {
        status,
        body: body.freeze(),
    })
}
