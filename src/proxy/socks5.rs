//! SOCKS protocol handling (RFC 1928 plus SOCKS4a)
//!
//! The acceptor side deliberately ignores the requested destination: for a
//! tunnelled connection the target is determined by the `url` argument, not
//! by the SOCKS address, which supervisors fill with a placeholder.

use super::{Address, ProxyError, SocksArgs};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// SOCKS5 version byte
const SOCKS5_VERSION: u8 = 0x05;
/// SOCKS4/SOCKS4a version byte
const SOCKS4_VERSION: u8 = 0x04;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Which protocol version an accepted connection spoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    Socks4a,
    Socks5,
}

/// An accepted SOCKS connection that has completed the request phase but
/// has not yet been granted.
pub struct SocksConn<S> {
    stream: S,
    version: SocksVersion,
    /// Requested destination (informational; the tunnel ignores it)
    pub dest: Address,
    /// Per-connection args from the authentication fields
    pub args: SocksArgs,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SocksConn<S> {
    /// Run the version negotiation, authentication, and request phases on
    /// `stream`.
    pub async fn handshake(mut stream: S) -> Result<Self, ProxyError> {
        let mut version = [0u8; 1];
        stream.read_exact(&mut version).await?;

        match version[0] {
            SOCKS5_VERSION => Self::handshake_v5(stream).await,
            SOCKS4_VERSION => Self::handshake_v4a(stream).await,
            other => Err(ProxyError::InvalidSocksVersion(other)),
        }
    }

    async fn handshake_v5(mut stream: S) -> Result<Self, ProxyError> {
        let mut buf = [0u8; 512];

        stream.read_exact(&mut buf[..1]).await?;
        let nmethods = buf[0] as usize;
        stream.read_exact(&mut buf[..nmethods]).await?;

        // Prefer username/password: that is where a supervisor smuggles the
        // per-connection args. Plain clients get no-auth.
        let method = if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
            AuthMethod::UsernamePassword
        } else if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::NoAcceptable
        };

        stream.write_all(&[SOCKS5_VERSION, method as u8]).await?;
        if method == AuthMethod::NoAcceptable {
            return Err(ProxyError::AuthenticationFailed);
        }

        let args = if method == AuthMethod::UsernamePassword {
            stream.read_exact(&mut buf[..2]).await?; // subnegotiation version, ulen
            let ulen = buf[1] as usize;
            stream.read_exact(&mut buf[..ulen]).await?;
            let mut encoded = String::from_utf8_lossy(&buf[..ulen]).into_owned();

            stream.read_exact(&mut buf[..1]).await?;
            let plen = buf[0] as usize;
            stream.read_exact(&mut buf[..plen]).await?;
            let password = String::from_utf8_lossy(&buf[..plen]);
            // A lone NUL password is filler for "args fit in the username".
            if password != "\0" {
                encoded.push_str(&password);
            }

            let args = SocksArgs::parse(&encoded);
            let ok = args.is_ok();
            stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            args?
        } else {
            SocksArgs::default()
        };

        // Request: VER CMD RSV ATYP
        stream.read_exact(&mut buf[..4]).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }
        let cmd = buf[1];
        let atyp = buf[3];

        let dest = match atyp {
            0x01 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Address::Ipv4(ip, u16::from_be_bytes(port))
            }
            0x03 => {
                stream.read_exact(&mut buf[..1]).await?;
                let len = buf[0] as usize;
                stream.read_exact(&mut buf[..len]).await?;
                let domain = String::from_utf8_lossy(&buf[..len]).into_owned();
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Address::Domain(domain, u16::from_be_bytes(port))
            }
            0x04 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Address::Ipv6(ip, u16::from_be_bytes(port))
            }
            other => {
                let reply = make_reply_v5(Reply::AddressTypeNotSupported);
                stream.write_all(&reply).await?;
                return Err(ProxyError::UnsupportedAddressType(other));
            }
        };

        if cmd != 0x01 {
            // CONNECT only
            let reply = make_reply_v5(Reply::CommandNotSupported);
            stream.write_all(&reply).await?;
            return Err(ProxyError::UnsupportedCommand(cmd));
        }

        Ok(Self {
            stream,
            version: SocksVersion::Socks5,
            dest,
            args,
        })
    }

    async fn handshake_v4a(mut stream: S) -> Result<Self, ProxyError> {
        let mut head = [0u8; 7]; // CMD PORT(2) IP(4)
        stream.read_exact(&mut head).await?;
        let cmd = head[0];
        let port = u16::from_be_bytes([head[1], head[2]]);
        let ip = [head[3], head[4], head[5], head[6]];

        let userid = read_nul_terminated(&mut stream).await?;

        // SOCKS4a: 0.0.0.x (x nonzero) means a hostname follows the userid.
        let dest = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
            let host = read_nul_terminated(&mut stream).await?;
            Address::Domain(host, port)
        } else {
            Address::Ipv4(ip, port)
        };

        if cmd != 0x01 {
            stream.write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0]).await?;
            return Err(ProxyError::UnsupportedCommand(cmd));
        }

        let args = SocksArgs::parse(&userid)?;

        Ok(Self {
            stream,
            version: SocksVersion::Socks4a,
            dest,
            args,
        })
    }

    /// Send a success reply with a zero bind address, completing the
    /// handshake. The tunnel has no meaningful reply address to offer.
    pub async fn grant(&mut self) -> Result<(), ProxyError> {
        match self.version {
            SocksVersion::Socks5 => {
                self.stream.write_all(&make_reply_v5(Reply::Succeeded)).await?;
            }
            SocksVersion::Socks4a => {
                self.stream.write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]).await?;
            }
        }
        Ok(())
    }

    /// Consume the handshake wrapper, yielding the raw stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn make_reply_v5(reply: Reply) -> [u8; 10] {
    [SOCKS5_VERSION, reply as u8, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}

async fn read_nul_terminated<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, ProxyError> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            break;
        }
        if out.len() >= 512 {
            return Err(ProxyError::GeneralFailure("userid too long".to_string()));
        }
        out.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Standalone SOCKS5 forwarding server.
///
/// Used as the server's built-in downstream when no external service is
/// configured: every CONNECT is dialed directly and relayed byte for byte.
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind the forwarder to `addr`.
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 service listening on {}", addr);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the listener fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("new SOCKS5 connection from {}", peer_addr);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream).await {
                    debug!("SOCKS5 connection error: {}", e);
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream) -> Result<(), ProxyError> {
        let mut conn = SocksConn::handshake(stream).await?;
        let dest = conn.dest.to_string();

        let mut target = TcpStream::connect(&dest).await?;
        target.set_nodelay(true).ok();
        conn.grant().await?;

        debug!("SOCKS5 connected to {}", dest);
        let mut stream = conn.into_inner();
        tokio::io::copy_bidirectional(&mut stream, &mut target).await?;
        Ok(())
    }
}
