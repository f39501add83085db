//! Configuration management
//!
//! Both binaries accept an optional TOML configuration file; command-line
//! flags take precedence over file values, which take precedence over the
//! built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default local SOCKS listening port (client) and service port (server).
pub const DEFAULT_PORT: u16 = 4455;

/// Default port for the server's built-in SOCKS5 downstream.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }
}

/// Client configuration: defaults for the per-connection SOCKS args plus
/// process-wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL to request if no url= SOCKS arg
    pub url: Option<String>,
    /// Front domain name if no front= SOCKS arg
    pub front: Option<String>,
    /// TLS fingerprint profile if no utls= SOCKS arg
    pub utls: Option<String>,
    /// Address of the HTTP helper (browser extension)
    pub helper: Option<String>,
    /// Outbound proxy URL
    pub proxy: Option<String>,
    /// Local SOCKS listening port
    pub port: Option<u16>,
    /// Append-mode log file
    pub log: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Service listening port
    pub port: Option<u16>,
    /// TLS certificate file
    pub cert: Option<PathBuf>,
    /// TLS private key file
    pub key: Option<PathBuf>,
    /// Comma-separated hostnames for automatic TLS certificates
    pub acme_hostnames: Option<String>,
    /// Contact email for the ACME account
    pub acme_email: Option<String>,
    /// Serve plain HTTP
    #[serde(default)]
    pub disable_tls: bool,
    /// HTML file served as the cover page
    pub mask: Option<PathBuf>,
    /// Cover redirect location (overrides mask)
    pub redirect: Option<String>,
    /// External downstream address; the built-in SOCKS5 service is used
    /// when absent
    pub external_service: Option<String>,
    /// Port for the built-in SOCKS5 service
    pub socks: Option<u16>,
    /// Append-mode log file
    pub log: Option<PathBuf>,
}

/// How the server terminates its public listener. Exactly one mode may be
/// configured; anything else is a startup error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain HTTP, no TLS
    Disabled,
    /// Static certificate and key files
    Static { cert: PathBuf, key: PathBuf },
    /// Automatic certificates for the given hostnames
    Acme {
        hostnames: Vec<String>,
        email: Option<String>,
    },
}

impl TlsMode {
    /// Resolve the TLS mode from the configuration, enforcing mutual
    /// exclusion between `disable_tls`, `cert`/`key`, and
    /// `acme_hostnames`.
    pub fn resolve(config: &ServerConfig) -> Result<Self, crate::Error> {
        let has_static = config.cert.is_some() || config.key.is_some();
        let has_acme = config.acme_hostnames.is_some() || config.acme_email.is_some();

        if config.disable_tls {
            if has_static || has_acme {
                return Err(crate::Error::Config(
                    "the cert, key, acme-hostnames, and acme-email options \
                     are not allowed with disable-tls"
                        .to_string(),
                ));
            }
            return Ok(TlsMode::Disabled);
        }

        if has_static {
            if has_acme {
                return Err(crate::Error::Config(
                    "the cert and key options are not allowed with \
                     acme-hostnames or acme-email"
                        .to_string(),
                ));
            }
            return match (&config.cert, &config.key) {
                (Some(cert), Some(key)) => Ok(TlsMode::Static {
                    cert: cert.clone(),
                    key: key.clone(),
                }),
                _ => Err(crate::Error::Config(
                    "the cert and key options must be used together".to_string(),
                )),
            };
        }

        match &config.acme_hostnames {
            Some(hostnames) => {
                let hostnames: Vec<String> = hostnames
                    .split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect();
                if hostnames.is_empty() {
                    return Err(crate::Error::Config(
                        "acme-hostnames must name at least one hostname".to_string(),
                    ));
                }
                Ok(TlsMode::Acme {
                    hostnames,
                    email: config.acme_email.clone(),
                })
            }
            None => Err(crate::Error::Config(
                "you must use either acme-hostnames, or cert and key, or \
                 disable-tls"
                    .to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            port: Some(443),
            ..Default::default()
        }
    }

    #[test]
    fn test_disable_tls() {
        let mut config = base_config();
        config.disable_tls = true;
        assert_eq!(TlsMode::resolve(&config).unwrap(), TlsMode::Disabled);
    }

    #[test]
    fn test_static_mode() {
        let mut config = base_config();
        config.cert = Some(PathBuf::from("cert.pem"));
        config.key = Some(PathBuf::from("key.pem"));
        assert!(matches!(
            TlsMode::resolve(&config).unwrap(),
            TlsMode::Static { .. }
        ));
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let mut config = base_config();
        config.cert = Some(PathBuf::from("cert.pem"));
        assert!(TlsMode::resolve(&config).is_err());
    }

    #[test]
    fn test_acme_mode_splits_hostnames() {
        let mut config = base_config();
        config.acme_hostnames = Some("a.example, b.example".to_string());
        match TlsMode::resolve(&config).unwrap() {
            TlsMode::Acme { hostnames, .. } => {
                assert_eq!(hostnames, vec!["a.example", "b.example"]);
            }
            other => panic!("unexpected mode: {:?}", other),
        }
    }

    #[test]
    fn test_modes_are_mutually_exclusive() {
        let mut config = base_config();
        config.disable_tls = true;
        config.acme_hostnames = Some("a.example".to_string());
        assert!(TlsMode::resolve(&config).is_err());

        let mut config = base_config();
        config.cert = Some(PathBuf::from("cert.pem"));
        config.key = Some(PathBuf::from("key.pem"));
        config.acme_email = Some("admin@example.com".to_string());
        assert!(TlsMode::resolve(&config).is_err());
    }

    #[test]
    fn test_no_mode_is_an_error() {
        assert!(TlsMode::resolve(&base_config()).is_err());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = std::env::temp_dir().join("mirage-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "[client]\nurl = \"https://forbidden.example/\"\nport = 4455\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.url.as_deref(), Some("https://forbidden.example/"));
        assert_eq!(client.port, Some(4455));
        assert!(config.server.is_none());
    }
}
