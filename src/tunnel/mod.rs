//! Client tunnel core
//!
//! One instance of the copy loop runs per accepted local connection. A
//! producer task reads the local stream into chunks; the driver turns each
//! chunk (or an empty poll, when the adaptive interval expires first) into
//! an HTTP POST and feeds the response body back into the local stream.
//!
//! The server cannot push: every byte it has for us rides on the response
//! to a poll. The interval therefore collapses to zero while data flows in
//! either direction and backs off geometrically while idle, so the tunnel
//! stays responsive without hammering the server.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD as BASE64_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::proxy::SocksArgs;
use crate::transport::{
    round_trip_retries, HelperRoundTripper, MimicRoundTripper, NativeRoundTripper, RoundTripper,
    TransportError, TunnelRequest, MAX_TRIES,
};
use crate::{MAX_PAYLOAD_LENGTH, SESSION_ID_LENGTH};

/// The poll interval starts at this value after the first idle round.
pub const INIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum polling interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Geometric increase in the polling interval each idle round.
pub const POLL_INTERVAL_MULTIPLIER: f64 = 1.5;

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no URL for SOCKS request")]
    NoUrl,

    #[error("bad URL: {0}")]
    BadUrl(#[from] url::ParseError),

    #[error("bad front domain {0:?}")]
    BadFront(String),

    #[error("cannot use utls with the helper")]
    UtlsWithHelper,
}

/// Process-wide client settings consulted when a connection carries no
/// SOCKS args of its own.
pub struct ClientOptions {
    /// Default `url=` value
    pub url: Option<String>,
    /// Default `front=` value
    pub front: Option<String>,
    /// Default `utls=` value
    pub utls: Option<String>,
    /// Outbound proxy, already validated
    pub proxy_url: Option<Url>,
    /// Helper round-tripper; when set it is used for every connection
    pub helper: Option<Arc<HelperRoundTripper>>,
    /// Shared native round-tripper
    pub native: Arc<NativeRoundTripper>,
}

/// Everything needed for the request–response round trips of one local
/// connection. Immutable for the connection's lifetime.
pub struct RequestInfo {
    /// What to put in the X-Session-Id header
    pub session_id: String,
    /// The URL to request
    pub url: Url,
    /// Host header override (may differ from the URL's host when fronting)
    pub host: Option<String>,
    /// How to carry the requests
    pub round_tripper: Arc<dyn RoundTripper>,
}

impl RequestInfo {
    /// Resolve the configuration for one connection. Each of `url`,
    /// `front`, and `utls` is taken from the SOCKS args first and the
    /// command-line options second.
    pub fn resolve(args: &SocksArgs, options: &ClientOptions) -> Result<Self, TunnelError> {
        let url_value = args
            .get("url")
            .or(options.url.as_deref())
            .ok_or(TunnelError::NoUrl)?;
        let mut url = Url::parse(url_value)?;

        let front = args.get("front").or(options.front.as_deref());
        let host = match front {
            Some(front) => {
                // The URL keeps determining DNS, TCP, and SNI; the Host
                // header keeps naming the covert origin.
                let covert = url
                    .host_str()
                    .ok_or_else(|| TunnelError::BadFront(front.to_string()))?
                    .to_string();
                url.set_host(Some(front))
                    .map_err(|_| TunnelError::BadFront(front.to_string()))?;
                Some(covert)
            }
            None => None,
        };

        let utls = args.get("utls").or(options.utls.as_deref());

        // The helper, when configured, always wins; it is the browser's
        // TLS stack, so a utls profile cannot apply on top of it.
        let round_tripper: Arc<dyn RoundTripper> = match (&options.helper, utls) {
            (Some(_), Some(_)) => return Err(TunnelError::UtlsWithHelper),
            (Some(helper), None) => helper.clone(),
            (None, Some(name)) => {
                Arc::new(MimicRoundTripper::new(name, options.proxy_url.as_ref())?)
            }
            (None, None) => options.native.clone(),
        };

        Ok(Self {
            session_id: gen_session_id(),
            url,
            host,
            round_tripper,
        })
    }
}

/// Generate a fresh random session id.
pub fn gen_session_id() -> String {
    let mut buf = [0u8; SESSION_ID_LENGTH];
    rand::thread_rng().fill_bytes(&mut buf);
    BASE64_NO_PAD.encode(buf)
}

/// Adaptive polling interval.
///
/// Zero while data moves (poll again immediately), then 100 ms for the
/// first idle round, growing by 1.5× per idle round up to the 5 s ceiling.
#[derive(Debug, Clone)]
pub struct PollInterval {
    current: Duration,
}

impl PollInterval {
    pub fn new() -> Self {
        Self {
            current: INIT_POLL_INTERVAL,
        }
    }

    /// The wait before the next poll.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Feed back whether the last round moved any data in either
    /// direction.
    pub fn update(&mut self, transferred: bool) {
        if transferred {
            self.current = Duration::ZERO;
        } else if self.current.is_zero() {
            self.current = INIT_POLL_INTERVAL;
        } else {
            self.current = self
                .current
                .mul_f64(POLL_INTERVAL_MULTIPLIER)
                .min(MAX_POLL_INTERVAL);
        }
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::new()
    }
}

/// Send `body` to the remote URL, wait for the reply, and feed the reply
/// body back into `conn`. Returns the number of bytes written to `conn`.
pub async fn send_recv<W>(
    body: Bytes,
    conn: &mut W,
    info: &RequestInfo,
) -> Result<usize, TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let request = TunnelRequest {
        url: info.url.clone(),
        host: info.host.clone(),
        session_id: info.session_id.clone(),
        body,
    };
    let response = round_trip_retries(info.round_tripper.as_ref(), &request, MAX_TRIES).await?;

    if !response.body.is_empty() {
        conn.write_all(&response.body).await?;
        conn.flush().await?;
    }
    Ok(response.body.len())
}

/// Repeatedly read from `conn`, issue HTTP requests, and write the
/// responses back to `conn`. Runs until the local stream ends or a round
/// trip fails for good.
pub async fn copy_loop<S>(conn: S, info: RequestInfo) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(conn);

    // Single-slot hand-off: the producer stays at most one chunk ahead of
    // the driver, closing the channel on end-of-stream.
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(produce_chunks(read_half, tx));

    let mut interval = PollInterval::new();
    loop {
        let body = tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
            _ = tokio::time::sleep(interval.current()) => Bytes::new(),
        };

        let sent = !body.is_empty();
        let received = send_recv(body, &mut write_half, &info).await?;
        interval.update(received > 0 || sent);
    }

    Ok(())
}

/// Read the local stream into payload-sized chunks for the driver.
async fn produce_chunks<R>(mut conn: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_PAYLOAD_LENGTH];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("error reading from local connection: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TunnelResponse;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn options(native_proxy: Option<Url>) -> ClientOptions {
        ClientOptions {
            url: None,
            front: None,
            utls: None,
            proxy_url: native_proxy,
            helper: None,
            native: Arc::new(NativeRoundTripper::new(None).unwrap()),
        }
    }

    #[test]
    fn test_session_ids_are_long_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = gen_session_id();
            assert!(id.len() >= crate::MIN_SESSION_ID_LENGTH);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_poll_interval_backoff_sequence() {
        let mut interval = PollInterval::new();
        assert_eq!(interval.current(), Duration::from_millis(100));

        interval.update(false);
        assert_eq!(interval.current(), Duration::from_millis(150));
        interval.update(false);
        assert_eq!(interval.current(), Duration::from_millis(225));
        interval.update(false);
        assert_eq!(interval.current(), Duration::from_micros(337_500));

        for _ in 0..20 {
            interval.update(false);
        }
        assert_eq!(interval.current(), MAX_POLL_INTERVAL);
    }

    #[test]
    fn test_poll_interval_resets_on_activity() {
        let mut interval = PollInterval::new();
        interval.update(false);
        interval.update(false);

        interval.update(true);
        assert_eq!(interval.current(), Duration::ZERO);

        // First idle round after activity goes back to the initial value.
        interval.update(false);
        assert_eq!(interval.current(), INIT_POLL_INTERVAL);
    }

    #[test]
    fn test_resolve_requires_url() {
        let args = SocksArgs::parse("").unwrap();
        assert!(matches!(
            RequestInfo::resolve(&args, &options(None)),
            Err(TunnelError::NoUrl)
        ));
    }

    #[test]
    fn test_resolve_args_override_options() {
        let mut opts = options(None);
        opts.url = Some("https://fallback.example/".to_string());

        let args = SocksArgs::parse("url=https://forbidden.example/").unwrap();
        let info = RequestInfo::resolve(&args, &opts).unwrap();
        assert_eq!(info.url.as_str(), "https://forbidden.example/");

        let no_args = SocksArgs::parse("").unwrap();
        let info = RequestInfo::resolve(&no_args, &opts).unwrap();
        assert_eq!(info.url.as_str(), "https://fallback.example/");
    }

    #[test]
    fn test_resolve_fronting_swaps_hosts() {
        let args = SocksArgs::parse("url=https://forbidden.example/;front=allowed.example")
            .unwrap();
        let info = RequestInfo::resolve(&args, &options(None)).unwrap();
        assert_eq!(info.url.host_str(), Some("allowed.example"));
        assert_eq!(info.host.as_deref(), Some("forbidden.example"));
    }

    #[test]
    fn test_resolve_rejects_utls_with_helper() {
        let mut opts = options(None);
        opts.helper = Some(Arc::new(HelperRoundTripper::new("127.0.0.1:7999")));

        let args = SocksArgs::parse("url=https://x.example/;utls=chrome").unwrap();
        assert!(matches!(
            RequestInfo::resolve(&args, &opts),
            Err(TunnelError::UtlsWithHelper)
        ));
    }

    #[test]
    fn test_resolve_rejects_bad_url() {
        let args = SocksArgs::parse("url=not a url").unwrap();
        assert!(matches!(
            RequestInfo::resolve(&args, &options(None)),
            Err(TunnelError::BadUrl(_))
        ));
    }

    /// Round-tripper that echoes each request body and records what it saw.
    struct EchoRoundTripper {
        bodies: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl RoundTripper for EchoRoundTripper {
        async fn round_trip(
            &self,
            request: &TunnelRequest,
        ) -> Result<TunnelResponse, TransportError> {
            self.bodies.lock().unwrap().push(request.body.clone());
            Ok(TunnelResponse {
                status: 200,
                body: request.body.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_copy_loop_round_trips_bytes() {
        let (mut app, tunnel_side) = tokio::io::duplex(1 << 16);
        let echo = Arc::new(EchoRoundTripper {
            bodies: Mutex::new(Vec::new()),
        });

        let info = RequestInfo {
            session_id: gen_session_id(),
            url: Url::parse("https://forbidden.example/").unwrap(),
            host: None,
            round_tripper: echo.clone(),
        };
        let loop_task = tokio::spawn(copy_loop(tunnel_side, info));

        app.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        app.shutdown().await.unwrap();
        loop_task.await.unwrap().unwrap();

        let bodies = echo.bodies.lock().unwrap();
        assert!(bodies.iter().any(|b| &b[..] == b"ping"));
    }

    #[tokio::test]
    async fn test_copy_loop_aborts_on_transport_error() {
        struct DeadRoundTripper;

        #[async_trait]
        impl RoundTripper for DeadRoundTripper {
            async fn round_trip(
                &self,
                _request: &TunnelRequest,
            ) -> Result<TunnelResponse, TransportError> {
                Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        }

        let (mut app, tunnel_side) = tokio::io::duplex(1 << 16);
        let info = RequestInfo {
            session_id: gen_session_id(),
            url: Url::parse("https://forbidden.example/").unwrap(),
            host: None,
            round_tripper: Arc::new(DeadRoundTripper),
        };
        let loop_task = tokio::spawn(copy_loop(tunnel_side, info));

        app.write_all(b"ping").await.unwrap();
        let result = loop_task.await.unwrap();
        assert!(matches!(result, Err(TunnelError::Transport(_))));
    }
}
