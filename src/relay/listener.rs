//! Listener startup and TLS termination
//!
//! Exactly one of three modes terminates the public listener: plain HTTP,
//! a supplied certificate, or automatic certificates. Mode resolution and
//! mutual exclusion happen in [`crate::config::TlsMode`]; this module turns
//! the chosen mode into a running accept loop.
//!
//! Startup cannot simply await the accept loop — it never returns on
//! success — so it races the loop against a short timer: an error that
//! arrives within [`LISTEN_ERROR_TIMEOUT`] is propagated as fatal, silence
//! means the listener is up.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info};

use super::{Relay, RelayError, LISTEN_ERROR_TIMEOUT};
use crate::config::TlsMode;
use crate::logging::scrub;

/// Start serving `relay` on `addr` in the given TLS mode.
///
/// Returns once startup is judged successful; the accept loop keeps
/// running in the background until the process exits or the listener
/// fails. `cache_dir` hosts the automatic-certificate cache when the ACME
/// mode is selected.
pub async fn start_server(
    addr: SocketAddr,
    tls_mode: TlsMode,
    relay: Arc<Relay>,
    cache_dir: Option<PathBuf>,
) -> Result<(), crate::Error> {
    // An ephemeral port would be unknowable to the clients polling us.
    if addr.port() == 0 {
        return Err(RelayError::PortZero.into());
    }

    let listener = TcpListener::bind(addr).await.map_err(RelayError::Io)?;
    let (err_tx, mut err_rx) = mpsc::channel::<crate::Error>(1);

    match tls_mode {
        TlsMode::Disabled => {
            info!("listening with plain HTTP on {}", addr);
            tokio::spawn(accept_loop(listener, relay, None, err_tx));
        }
        TlsMode::Static { cert, key } => {
            let certs = load_certs(&cert)?;
            let key = load_private_key(&key)?;
            // Name the provider explicitly; the dependency graph enables
            // more than one and the default-provider shortcut would be
            // ambiguous.
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| RelayError::Tls(e.to_string()))?
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| RelayError::Tls(e.to_string()))?;
            tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

            info!("listening with HTTPS on {}", addr);
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));
            tokio::spawn(accept_loop(listener, relay, Some(acceptor), err_tx));
        }
        TlsMode::Acme { hostnames, email } => {
            info!(
                "listening with HTTPS on {} (automatic certificates for {:?})",
                addr, hostnames
            );
            let mut config = AcmeConfig::new(hostnames).directory_lets_encrypt(true);
            if let Some(email) = email {
                config = config.contact_push(format!("mailto:{}", email));
            }
            match &cache_dir {
                Some(dir) => info!("caching certificates in {:?}", dir),
                None => info!("no state directory; certificate cache disabled"),
            }
            let config = config.cache_option(cache_dir.map(DirCache::new));

            let incoming = config.tokio_incoming(
                TcpListenerStream::new(listener),
                vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            );
            tokio::spawn(acme_accept_loop(incoming, relay, err_tx));
        }
    }

    // Wait a short time for the loop to report a startup error; if it
    // stays silent, assume the listener is healthy.
    match timeout(LISTEN_ERROR_TIMEOUT, err_rx.recv()).await {
        Ok(Some(e)) => Err(e),
        _ => Ok(()),
    }
}

async fn accept_loop(
    listener: TcpListener,
    relay: Arc<Relay>,
    acceptor: Option<TlsAcceptor>,
    err_tx: mpsc::Sender<crate::Error>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let relay = relay.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    stream.set_nodelay(true).ok();
                    match acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve_connection(tls_stream, relay).await,
                            Err(e) => {
                                debug!("TLS accept error: {}", scrub(&e.to_string()));
                            }
                        },
                        None => serve_connection(stream, relay).await,
                    }
                });
            }
            Err(e) => {
                let _ = err_tx.send(RelayError::Io(e).into()).await;
                return;
            }
        }
    }
}

async fn acme_accept_loop<St, S>(
    mut incoming: St,
    relay: Arc<Relay>,
    err_tx: mpsc::Sender<crate::Error>,
) where
    St: futures_util::Stream<Item = std::io::Result<S>> + Unpin,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match incoming.next().await {
            Some(Ok(tls_stream)) => {
                let relay = relay.clone();
                tokio::spawn(serve_connection(tls_stream, relay));
            }
            Some(Err(e)) => {
                debug!("TLS accept error: {}", scrub(&e.to_string()));
            }
            None => {
                let _ = err_tx
                    .send(crate::Error::Config("listener stream ended".to_string()))
                    .await;
                return;
            }
        }
    }
}

async fn serve_connection<S>(stream: S, relay: Arc<Relay>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let relay = relay.clone();
        async move { Ok::<_, Infallible>(relay.handle(request).await) }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("connection error: {}", scrub(&e.to_string()));
    }
}

/// Load a TLS certificate chain from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, crate::Error> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(RelayError::Io)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(RelayError::Tls(format!("no certificates found in {:?}", path)).into());
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, crate::Error> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(RelayError::Io)?);
    let key = rustls_pemfile::private_key(&mut file)
        .map_err(|e| RelayError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| RelayError::Tls(format!("no private key found in {:?}", path)))?;
    Ok(key)
}
