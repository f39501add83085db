//! Mirage Tunnel Server
//!
//! Acts as an ordinary HTTP(S) server, keeps track of session ids, and
//! forwards received data to a downstream service.
//!
//! The server runs in HTTPS mode by default, either with a supplied
//! certificate (`--cert`/`--key`) or with automatic certificates
//! (`--acme-hostnames`). Use `--disable-tls` for plain HTTP behind some
//! other terminator. GET requests see only the cover identity: a redirect
//! (`--redirect`), an HTML document (`--mask`), or a stock one-liner.
//!
//! Without `--external-service` a built-in SOCKS5 forwarder is spawned and
//! used as the downstream, so the tunnel exits into a general-purpose
//! proxy.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use mirage_tunnel::config::{Config, ServerConfig, TlsMode, DEFAULT_PORT, DEFAULT_SOCKS_PORT};
use mirage_tunnel::logging;
use mirage_tunnel::proxy::Socks5Server;
use mirage_tunnel::pt;
use mirage_tunnel::relay::{start_server, CoverConfig, Relay, SessionTable};

/// Mirage Tunnel Server - blocking-resistant tunnel over HTTP polling
#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
#[command(about = "Mirage Tunnel Server - terminates HTTP-carried byte streams")]
#[command(version)]
struct Args {
    /// Service listening port
    #[arg(long)]
    port: Option<u16>,

    /// TLS certificate file
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key file
    #[arg(long)]
    key: Option<PathBuf>,

    /// Comma-separated hostnames for automatic TLS certificates
    #[arg(long)]
    acme_hostnames: Option<String>,

    /// Optional contact email for certificate notifications
    #[arg(long)]
    acme_email: Option<String>,

    /// Don't use HTTPS
    #[arg(long)]
    disable_tls: bool,

    /// HTML file served as the cover page
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Cover redirect location (overrides mask)
    #[arg(long)]
    redirect: Option<String>,

    /// External downstream address [host:port]; the built-in SOCKS5
    /// service is used when missing
    #[arg(long)]
    external_service: Option<String>,

    /// Port for the built-in SOCKS5 service
    #[arg(long)]
    socks: Option<u16>,

    /// Name of log file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Merge with the optional config file; flags win.
    fn merge(self) -> Result<ServerConfig> {
        let file = match &self.config {
            Some(path) => Config::load(path)
                .context("failed to load configuration")?
                .server
                .unwrap_or_default(),
            None => ServerConfig::default(),
        };
        Ok(ServerConfig {
            port: self.port.or(file.port),
            cert: self.cert.or(file.cert),
            key: self.key.or(file.key),
            acme_hostnames: self.acme_hostnames.or(file.acme_hostnames),
            acme_email: self.acme_email.or(file.acme_email),
            disable_tls: self.disable_tls || file.disable_tls,
            mask: self.mask.or(file.mask),
            redirect: self.redirect.or(file.redirect),
            external_service: self.external_service.or(file.external_service),
            socks: self.socks.or(file.socks),
            log: self.log.or(file.log),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().merge()?;
    let port = config.port.unwrap_or(DEFAULT_PORT);
    let socks_port = config.socks.unwrap_or(DEFAULT_SOCKS_PORT);

    // Self-host the supervisor handshake so the program runs standalone.
    env::set_var("TOR_PT_MANAGED_TRANSPORT_VER", "1");
    env::set_var("TOR_PT_SERVER_TRANSPORTS", pt::METHOD_NAME);
    env::set_var(
        "TOR_PT_SERVER_BINDADDR",
        format!("{}-0.0.0.0:{}", pt::METHOD_NAME, port),
    );

    match &config.external_service {
        Some(addr) => {
            env::set_var("TOR_PT_ORPORT", addr);
        }
        None => {
            env::set_var("TOR_PT_ORPORT", format!("127.0.0.1:{}", socks_port));
        }
    }

    let pt_info = match pt::server_setup() {
        Ok(info) => info,
        Err(e) => {
            pt::env_error(&e.to_string());
            return Err(e.into());
        }
    };

    logging::init(config.log.as_deref(), "info").context("error opening log file")?;
    info!("starting version {}", mirage_tunnel::VERSION);

    // The downstream must be answering before the first session dials it.
    if config.external_service.is_none() {
        let socks = Socks5Server::bind(&format!("127.0.0.1:{}", socks_port))
            .await
            .context("failed to start built-in SOCKS service")?;
        info!("built-in SOCKS service on port {}", socks_port);
        tokio::spawn(socks.run());
    } else {
        info!("using external service {}", pt_info.or_addr);
    }

    let tls_mode = match TlsMode::resolve(&config) {
        Ok(mode) => mode,
        Err(e) => {
            pt::smethod_error(pt::METHOD_NAME, &e.to_string());
            return Err(e.into());
        }
    };

    // The certificate cache lives under the supervisor-provided state dir.
    let cache_dir = match &tls_mode {
        TlsMode::Acme { .. } => match pt::make_state_dir() {
            Ok(dir) => Some(dir.join("certificate-cache")),
            Err(e) => {
                info!("disabling certificate cache: {}", e);
                None
            }
        },
        _ => None,
    };

    let mut started = 0;
    for bindaddr in &pt_info.bindaddrs {
        if bindaddr.method_name != pt::METHOD_NAME {
            pt::smethod_error(&bindaddr.method_name, "no such method");
            continue;
        }
        let mut addr = bindaddr.addr;
        if port != 0 {
            addr.set_port(port);
        }

        let cover = match CoverConfig::new(config.mask.clone(), config.redirect.as_deref()) {
            Ok(cover) => cover,
            Err(e) => {
                pt::smethod_error(&bindaddr.method_name, &e.to_string());
                continue;
            }
        };

        let sessions = Arc::new(SessionTable::new(pt_info.or_addr.clone()));
        let sweeper = sessions.clone();
        tokio::spawn(async move { sweeper.run_expiry().await });

        let relay = Arc::new(Relay::new(sessions, cover));
        match start_server(addr, tls_mode.clone(), relay, cache_dir.clone()).await {
            Ok(()) => {
                pt::smethod(&bindaddr.method_name, addr);
                started += 1;
            }
            Err(e) => pt::smethod_error(&bindaddr.method_name, &e.to_string()),
        }
    }
    pt::smethods_done();

    if started == 0 {
        anyhow::bail!("no listeners started");
    }

    pt::wait_for_shutdown().await;
    info!("done");
    Ok(())
}
