//! SOCKS layer
//!
//! Two roles live here:
//!
//! - the client-side acceptor ([`socks5::handshake`]) that receives local
//!   SOCKS4a/SOCKS5 connections together with their per-connection
//!   `key=value` args, carried in the authentication fields the way a
//!   pluggable-transport supervisor encodes them;
//! - the server's built-in standalone forwarder ([`socks5::Socks5Server`]),
//!   used as the downstream service when no external one is configured.

pub mod socks5;

pub use socks5::{Socks5Server, SocksConn};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Malformed SOCKS args: {0}")]
    MalformedArgs(String),

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

/// Proxy target address
#[derive(Debug, Clone)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Per-connection `key=value` arguments.
///
/// A supervisor smuggles connection parameters through the SOCKS
/// authentication fields as `key1=value1;key2=value2`, where `;`, `=` and
/// `\` inside keys or values are escaped with a backslash.
#[derive(Debug, Clone, Default)]
pub struct SocksArgs(Vec<(String, String)>);

impl SocksArgs {
    /// Parse an encoded args string. The empty string yields no args.
    pub fn parse(encoded: &str) -> Result<Self, ProxyError> {
        let mut args = Vec::new();
        if encoded.is_empty() {
            return Ok(Self(args));
        }

        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut chars = encoded.chars();

        loop {
            let c = chars.next();
            match c {
                Some('\\') => {
                    let escaped = chars.next().ok_or_else(|| {
                        ProxyError::MalformedArgs("dangling escape".to_string())
                    })?;
                    if in_value { value.push(escaped) } else { key.push(escaped) }
                }
                Some('=') if !in_value => in_value = true,
                Some(';') | None => {
                    if !in_value {
                        return Err(ProxyError::MalformedArgs(format!(
                            "no value for key {:?}",
                            key
                        )));
                    }
                    args.push((std::mem::take(&mut key), std::mem::take(&mut value)));
                    in_value = false;
                    if c.is_none() {
                        break;
                    }
                }
                Some(c) => {
                    if in_value { value.push(c) } else { key.push(c) }
                }
            }
        }

        Ok(Self(args))
    }

    /// Look up the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let args = SocksArgs::parse("").unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn test_parse_single() {
        let args = SocksArgs::parse("url=https://forbidden.example/").unwrap();
        assert_eq!(args.get("url"), Some("https://forbidden.example/"));
        assert_eq!(args.get("front"), None);
    }

    #[test]
    fn test_parse_multiple() {
        let args =
            SocksArgs::parse("url=https://forbidden.example/;front=allowed.example").unwrap();
        assert_eq!(args.get("url"), Some("https://forbidden.example/"));
        assert_eq!(args.get("front"), Some("allowed.example"));
    }

    #[test]
    fn test_parse_escapes() {
        let args = SocksArgs::parse(r"key=a\;b\=c\\d").unwrap();
        assert_eq!(args.get("key"), Some(r"a;b=c\d"));
    }

    #[test]
    fn test_parse_rejects_keys_without_values() {
        assert!(SocksArgs::parse("keyonly").is_err());
        assert!(SocksArgs::parse("a=1;keyonly").is_err());
    }

    #[test]
    fn test_parse_rejects_dangling_escape() {
        assert!(SocksArgs::parse(r"key=value\").is_err());
    }

    #[test]
    fn test_first_value_wins() {
        let args = SocksArgs::parse("k=first;k=second").unwrap();
        assert_eq!(args.get("k"), Some("first"));
    }
}
