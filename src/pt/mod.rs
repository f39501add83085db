//! Pluggable-transport supervisor handshake
//!
//! A parent supervisor (tor, or a wrapper script) configures the transport
//! through `TOR_PT_*` environment variables and reads single-line reports
//! from stdout: the negotiated protocol version, one line per established
//! listener (`CMETHOD`/`SMETHOD`), error lines, and a `DONE` marker.
//!
//! Both binaries also seed the environment with defaults at startup, so
//! they run standalone without a supervisor.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use url::Url;

/// The transport method name announced to the supervisor.
pub const METHOD_NAME: &str = "meek";

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum PtError {
    #[error("no-version: supervisor offered no supported managed-transport version")]
    NoVersion,

    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("malformed {var}: {reason}")]
    MalformedVar { var: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client-side handshake result
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Transport methods the supervisor asked for
    pub method_names: Vec<String>,
    /// Outbound proxy the supervisor wants all traffic to use
    pub proxy_url: Option<Url>,
}

/// One server listener requested by the supervisor
#[derive(Debug, Clone)]
pub struct Bindaddr {
    pub method_name: String,
    pub addr: SocketAddr,
}

/// Server-side handshake result
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Listeners the supervisor asked for
    pub bindaddrs: Vec<Bindaddr>,
    /// Downstream target address (`TOR_PT_ORPORT`)
    pub or_addr: String,
}

/// Check the offered managed-transport version and report ours.
///
/// Must run before any other report line; on mismatch it emits
/// `VERSION-ERROR` and the caller exits nonzero.
fn negotiate_version() -> Result<(), PtError> {
    let offered = env::var("TOR_PT_MANAGED_TRANSPORT_VER").unwrap_or_default();
    if offered.split(',').any(|v| v == "1") {
        println!("VERSION 1");
        Ok(())
    } else {
        println!("VERSION-ERROR no-version");
        Err(PtError::NoVersion)
    }
}

/// Perform the client-side handshake: version exchange plus intake of the
/// requested methods and proxy.
pub fn client_setup() -> Result<ClientInfo, PtError> {
    negotiate_version()?;

    let transports =
        env::var("TOR_PT_CLIENT_TRANSPORTS").map_err(|_| PtError::MissingVar("TOR_PT_CLIENT_TRANSPORTS"))?;
    let method_names = transports.split(',').map(str::to_string).collect();

    let proxy_url = match env::var("TOR_PT_PROXY") {
        Ok(raw) => Some(Url::parse(&raw).map_err(|e| PtError::MalformedVar {
            var: "TOR_PT_PROXY",
            reason: e.to_string(),
        })?),
        Err(_) => None,
    };

    Ok(ClientInfo {
        method_names,
        proxy_url,
    })
}

/// Perform the server-side handshake: version exchange plus intake of the
/// requested bind addresses and the downstream target.
pub fn server_setup() -> Result<ServerInfo, PtError> {
    negotiate_version()?;

    let raw = env::var("TOR_PT_SERVER_BINDADDR")
        .map_err(|_| PtError::MissingVar("TOR_PT_SERVER_BINDADDR"))?;
    let mut bindaddrs = Vec::new();
    for entry in raw.split(',') {
        // Each entry is "<method>-<host:port>".
        let (method_name, addr) = entry.split_once('-').ok_or_else(|| PtError::MalformedVar {
            var: "TOR_PT_SERVER_BINDADDR",
            reason: format!("{:?} is not method-addr", entry),
        })?;
        let addr: SocketAddr = addr.parse().map_err(|_| PtError::MalformedVar {
            var: "TOR_PT_SERVER_BINDADDR",
            reason: format!("bad address {:?}", addr),
        })?;
        bindaddrs.push(Bindaddr {
            method_name: method_name.to_string(),
            addr,
        });
    }

    let or_addr = env::var("TOR_PT_ORPORT").map_err(|_| PtError::MissingVar("TOR_PT_ORPORT"))?;

    Ok(ServerInfo { bindaddrs, or_addr })
}

/// Report an established client listener.
pub fn cmethod(name: &str, addr: SocketAddr) {
    println!("CMETHOD {} socks5 {}", name, addr);
}

/// Report a client method that could not be established.
pub fn cmethod_error(name: &str, msg: &str) {
    println!("CMETHOD-ERROR {} {}", name, msg);
}

/// Mark the end of client method reports.
pub fn cmethods_done() {
    println!("CMETHODS DONE");
}

/// Report an established server listener.
pub fn smethod(name: &str, addr: SocketAddr) {
    println!("SMETHOD {} {}", name, addr);
}

/// Report a server method that could not be established.
pub fn smethod_error(name: &str, msg: &str) {
    println!("SMETHOD-ERROR {} {}", name, msg);
}

/// Mark the end of server method reports.
pub fn smethods_done() {
    println!("SMETHODS DONE");
}

/// Acknowledge the supervisor-provided proxy.
pub fn proxy_done() {
    println!("PROXY DONE");
}

/// Reject the supervisor-provided proxy.
pub fn proxy_error(msg: &str) {
    println!("PROXY-ERROR {}", msg);
}

/// Report a fatal environment problem.
pub fn env_error(msg: &str) {
    println!("ENV-ERROR {}", msg);
}

/// Resolve (and create) the supervisor-provided state directory.
pub fn make_state_dir() -> Result<PathBuf, PtError> {
    let dir = env::var("TOR_PT_STATE_LOCATION")
        .map_err(|_| PtError::MissingVar("TOR_PT_STATE_LOCATION"))?;
    let dir = PathBuf::from(dir);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Whether the supervisor asked us to treat stdin EOF like SIGTERM.
pub fn exit_on_stdin_close() -> bool {
    env::var("TOR_PT_EXIT_ON_STDIN_CLOSE").as_deref() == Ok("1")
}

/// Consume stdin until EOF. Used to synthesize a shutdown signal when the
/// supervisor closes our stdin.
pub async fn await_stdin_eof() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

/// Block until the process should shut down: SIGTERM, Ctrl-C, or (when the
/// supervisor requested it) stdin EOF.
pub async fn wait_for_shutdown() {
    let stdin_eof = async {
        if exit_on_stdin_close() {
            await_stdin_eof().await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!("cannot install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("got signal TERM"),
            _ = tokio::signal::ctrl_c() => tracing::info!("got signal INT"),
            _ = stdin_eof => tracing::info!("synthesizing SIGTERM because of stdin close"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("got interrupt"),
            _ = stdin_eof => tracing::info!("synthesizing shutdown because of stdin close"),
        }
    }
}
