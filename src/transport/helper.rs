//! Browser-helper round-tripper
//!
//! With a helper configured, this process performs no network operations of
//! its own: each request is handed to a browser extension over a local TCP
//! socket, and the extension makes the HTTP request with the browser's own
//! network stack (and TLS fingerprint).
//!
//! Wire format, both directions: a 4-byte big-endian length followed by
//! that many bytes of JSON. Request bodies and response bodies are base64
//! strings inside the JSON.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use super::{RoundTripper, TransportError, TunnelRequest, TunnelResponse};
use crate::MAX_PAYLOAD_LENGTH;

/// Safety limits on interaction with the helper.
pub const MAX_HELPER_RESPONSE_LENGTH: usize = 10_000_000;
pub const HELPER_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const HELPER_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// The request message handed to the helper.
#[derive(Serialize)]
struct HelperRequest<'a> {
    method: &'a str,
    url: &'a str,
    header: HashMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "String::is_empty")]
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<HelperProxy>,
}

/// Proxy specification inside a helper request.
#[derive(Serialize, Clone)]
struct HelperProxy {
    #[serde(rename = "type")]
    kind: String,
    host: String,
    port: u16,
}

/// The helper's answer: either an error string or a completed round trip.
#[derive(Deserialize)]
struct HelperResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    body: String,
}

/// Round-tripper that delegates requests to a browser helper.
pub struct HelperRoundTripper {
    helper_addr: String,
    proxy: Option<HelperProxy>,
}

impl HelperRoundTripper {
    /// Create a round-tripper speaking to the helper at `helper_addr`
    /// (`host:port`).
    pub fn new(helper_addr: &str) -> Self {
        Self {
            helper_addr: helper_addr.to_string(),
            proxy: None,
        }
    }

    /// Ask the helper to route its requests through `proxy`. The URL must
    /// already have passed [`super::check_proxy_url`].
    pub fn set_proxy(&mut self, proxy: &Url) -> Result<(), TransportError> {
        let host = proxy
            .host_str()
            .ok_or_else(|| TransportError::Helper("proxy URL has no host".to_string()))?;
        let port = proxy.port_or_known_default().ok_or_else(|| {
            TransportError::Helper("proxy URL has no port".to_string())
        })?;
        self.proxy = Some(HelperProxy {
            kind: proxy.scheme().to_string(),
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    async fn exchange<S>(&self, stream: &mut S, request: &TunnelRequest) -> Result<TunnelResponse, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = HashMap::new();
        header.insert("X-Session-Id", request.session_id.as_str());
        header.insert("Content-Type", "application/octet-stream");
        if let Some(host) = &request.host {
            header.insert("Host", host.as_str());
        }

        let url = request.url.to_string();
        let message = serde_json::to_vec(&HelperRequest {
            method: "POST",
            url: &url,
            header,
            body: BASE64.encode(&request.body),
            proxy: self.proxy.clone(),
        })
        .map_err(|e| TransportError::Helper(e.to_string()))?;

        let mut framed = Vec::with_capacity(4 + message.len());
        framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
        framed.extend_from_slice(&message);
        timeout(HELPER_WRITE_TIMEOUT, stream.write_all(&framed))
            .await
            .map_err(|_| TransportError::HelperTimeout)??;

        let mut len_buf = [0u8; 4];
        timeout(HELPER_READ_TIMEOUT, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| TransportError::HelperTimeout)??;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_HELPER_RESPONSE_LENGTH {
            return Err(TransportError::Helper(format!(
                "helper response too long: {} bytes",
                len
            )));
        }

        let mut message = vec![0u8; len];
        timeout(HELPER_READ_TIMEOUT, stream.read_exact(&mut message))
            .await
            .map_err(|_| TransportError::HelperTimeout)??;

        let response: HelperResponse =
            serde_json::from_slice(&message).map_err(|e| TransportError::Helper(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(TransportError::Helper(error));
        }

        let mut body = BASE64
            .decode(response.body.as_bytes())
            .map_err(|e| TransportError::Helper(format!("bad body encoding: {}", e)))?;
        body.truncate(MAX_PAYLOAD_LENGTH);

        Ok(TunnelResponse {
            status: response.status,
            body: Bytes::from(body),
        })
    }
}

#[async_trait]
impl RoundTripper for HelperRoundTripper {
    async fn round_trip(&self, request: &TunnelRequest) -> Result<TunnelResponse, TransportError> {
        // One helper connection per request; the extension treats each
        // socket as one transaction.
        let mut stream = TcpStream::connect(&self.helper_addr).await?;
        self.exchange(&mut stream, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &'static [u8]) -> TunnelRequest {
        TunnelRequest {
            url: Url::parse("https://forbidden.example/").unwrap(),
            host: Some("allowed.example".to_string()),
            session_id: "AAAAAAAAAAA".to_string(),
            body: Bytes::from_static(body),
        }
    }

    async fn fake_helper(
        mut stream: tokio::io::DuplexStream,
        reply: serde_json::Value,
    ) -> serde_json::Value {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut message = vec![0u8; len];
        stream.read_exact(&mut message).await.unwrap();
        let received: serde_json::Value = serde_json::from_slice(&message).unwrap();

        let out = serde_json::to_vec(&reply).unwrap();
        stream
            .write_all(&(out.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&out).await.unwrap();
        received
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let rt = HelperRoundTripper::new("127.0.0.1:7999");

        let helper = tokio::spawn(fake_helper(
            server,
            serde_json::json!({ "status": 200, "body": BASE64.encode(b"pong") }),
        ));

        let mut client = client;
        let response = rt.exchange(&mut client, &request(b"ping")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"pong");

        let received = helper.await.unwrap();
        assert_eq!(received["method"], "POST");
        assert_eq!(received["url"], "https://forbidden.example/");
        assert_eq!(received["header"]["Host"], "allowed.example");
        assert_eq!(received["header"]["X-Session-Id"], "AAAAAAAAAAA");
        assert_eq!(received["body"], BASE64.encode(b"ping"));
    }

    #[tokio::test]
    async fn test_exchange_helper_error() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let rt = HelperRoundTripper::new("127.0.0.1:7999");

        let helper = tokio::spawn(fake_helper(
            server,
            serde_json::json!({ "error": "connection refused" }),
        ));

        let mut client = client;
        let err = rt.exchange(&mut client, &request(b"")).await.unwrap_err();
        assert!(matches!(err, TransportError::Helper(msg) if msg == "connection refused"));
        helper.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_body_is_omitted() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let rt = HelperRoundTripper::new("127.0.0.1:7999");

        let helper = tokio::spawn(fake_helper(
            server,
            serde_json::json!({ "status": 200, "body": "" }),
        ));

        let mut client = client;
        rt.exchange(&mut client, &request(b"")).await.unwrap();
        let received = helper.await.unwrap();
        assert!(received.get("body").is_none());
        assert!(received.get("proxy").is_none());
    }

    #[test]
    fn test_set_proxy() {
        let mut rt = HelperRoundTripper::new("127.0.0.1:7999");
        rt.set_proxy(&Url::parse("socks5://127.0.0.1:9050").unwrap())
            .unwrap();
        let proxy = rt.proxy.unwrap();
        assert_eq!(proxy.kind, "socks5");
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 9050);
    }
}
