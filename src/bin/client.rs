//! Mirage Tunnel Client
//!
//! Listens for local SOCKS connections and carries each one to the server
//! as a stream of HTTP POST requests keyed by a random session id.
//!
//! Most configuration can arrive either through SOCKS args (url=, front=,
//! utls= on an individual connection) or through command-line options;
//! SOCKS args take precedence per connection. With `--front` the domain in
//! the URL is used for DNS, TCP, and TLS SNI, while the HTTP Host header
//! keeps the original domain — the observable connection metadata names
//! the front.
//!
//! With `--helper`, no network operations happen in this process at all:
//! requests are handed to a browser extension over a local socket.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use url::Url;

use mirage_tunnel::config::{ClientConfig, Config, DEFAULT_PORT};
use mirage_tunnel::logging::{self, scrub};
use mirage_tunnel::proxy::SocksConn;
use mirage_tunnel::pt;
use mirage_tunnel::transport::{check_proxy_url, HelperRoundTripper, NativeRoundTripper};
use mirage_tunnel::tunnel::{copy_loop, ClientOptions, RequestInfo};

/// Mirage Tunnel Client - blocking-resistant tunnel over HTTP polling
#[derive(Parser, Debug)]
#[command(name = "mirage-client")]
#[command(about = "Mirage Tunnel Client - carries byte streams as ordinary HTTP requests")]
#[command(version)]
struct Args {
    /// URL to request if no url= SOCKS arg
    #[arg(long)]
    url: Option<String>,

    /// Front domain name if no front= SOCKS arg
    #[arg(long)]
    front: Option<String>,

    /// TLS fingerprint profile if no utls= SOCKS arg
    #[arg(long)]
    utls: Option<String>,

    /// Address of HTTP helper (browser extension)
    #[arg(long)]
    helper: Option<String>,

    /// Outbound proxy URL
    #[arg(long)]
    proxy: Option<String>,

    /// Local SOCKS listening port
    #[arg(long)]
    port: Option<u16>,

    /// Name of log file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Merge with the optional config file; flags win.
    fn merge(self) -> Result<ClientConfig> {
        let file = match &self.config {
            Some(path) => Config::load(path)
                .context("failed to load configuration")?
                .client
                .unwrap_or_default(),
            None => ClientConfig::default(),
        };
        Ok(ClientConfig {
            url: self.url.or(file.url),
            front: self.front.or(file.front),
            utls: self.utls.or(file.utls),
            helper: self.helper.or(file.helper),
            proxy: self.proxy.or(file.proxy),
            port: self.port.or(file.port),
            log: self.log.or(file.log),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().merge()?;

    // Self-host the supervisor handshake so the program runs standalone.
    if env::var("TOR_PT_MANAGED_TRANSPORT_VER").is_err() {
        env::set_var("TOR_PT_MANAGED_TRANSPORT_VER", "1");
    }
    if env::var("TOR_PT_CLIENT_TRANSPORTS").is_err() {
        env::set_var("TOR_PT_CLIENT_TRANSPORTS", pt::METHOD_NAME);
    }

    let pt_info = match pt::client_setup() {
        Ok(info) => info,
        Err(e) => {
            pt::env_error(&e.to_string());
            return Err(e.into());
        }
    };

    logging::init(config.log.as_deref(), "info").context("error opening log file")?;
    info!("starting version {}", mirage_tunnel::VERSION);

    // Command-line proxy overrides managed configuration.
    let mut proxy_url = config
        .proxy
        .as_deref()
        .map(Url::parse)
        .transpose()
        .context("can't parse proxy URL")?;
    if proxy_url.is_none() {
        proxy_url = pt_info.proxy_url.clone();
    }
    if let Some(url) = &proxy_url {
        if let Err(e) = check_proxy_url(url, config.helper.is_some()) {
            pt::proxy_error(&e.to_string());
            anyhow::bail!("proxy error: {}", e);
        }
        info!("using proxy {}", url);
        if pt_info.proxy_url.is_some() {
            pt::proxy_done();
        }
    }

    let helper = match &config.helper {
        Some(addr) => {
            info!("using helper on {}", addr);
            let mut helper = HelperRoundTripper::new(addr);
            if let Some(url) = &proxy_url {
                helper.set_proxy(url).context("proxy error")?;
            }
            Some(Arc::new(helper))
        }
        None => None,
    };

    let native = Arc::new(
        NativeRoundTripper::new(proxy_url.as_ref()).context("failed to build HTTP client")?,
    );

    let options = Arc::new(ClientOptions {
        url: config.url,
        front: config.front,
        utls: config.utls,
        proxy_url,
        helper,
        native,
    });

    let port = config.port.unwrap_or(DEFAULT_PORT);
    let mut started = 0;
    for method_name in &pt_info.method_names {
        if method_name != pt::METHOD_NAME {
            pt::cmethod_error(method_name, "no such method");
            continue;
        }
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                pt::cmethod(method_name, addr);
                info!("listening on {}", addr);
                tokio::spawn(accept_loop(listener, options.clone()));
                started += 1;
            }
            Err(e) => pt::cmethod_error(method_name, &e.to_string()),
        }
    }
    pt::cmethods_done();

    if started == 0 {
        anyhow::bail!("no listeners started");
    }

    pt::wait_for_shutdown().await;
    info!("done");
    Ok(())
}

/// Accept SOCKS connections until the listener fails for good.
async fn accept_loop(listener: TcpListener, options: Arc<ClientOptions>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let options = options.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_socks(stream, &options).await {
                        info!("error in handling request: {}", scrub(&e.to_string()));
                    }
                });
            }
            Err(e) => {
                info!("error in accept: {}", scrub(&e.to_string()));
                // Transient per-connection failures leave the listener
                // usable; anything else ends acceptance.
                match e.kind() {
                    std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted => continue,
                    _ => break,
                }
            }
        }
    }
}

/// Serve one accepted SOCKS connection to completion.
async fn handle_socks(stream: TcpStream, options: &ClientOptions) -> mirage_tunnel::Result<()> {
    let mut conn = SocksConn::handshake(stream).await?;
    conn.grant().await?;
    let info = RequestInfo::resolve(&conn.args, options)?;
    copy_loop(conn.into_inner(), info).await?;
    Ok(())
}
