//! TLS fingerprint mimicry
//!
//! Censors fingerprint TLS clients (JA3/JA4) by cipher-suite order,
//! extension order, ALPN, and friends. When a connection requests a
//! profile, we build a rustls `ClientConfig` whose observable parameters
//! match the named browser as closely as rustls allows, and pair it with
//! that browser's User-Agent.
//!
//! rustls does not expose full ClientHello construction; this is the best
//! mimicry available within its constraints.

use rustls::crypto::ring as ring_provider;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
use std::sync::Arc;

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserProfile {
    /// Chrome on desktop
    #[default]
    Chrome,
    /// Firefox on desktop
    Firefox,
    /// Safari on macOS/iOS
    Safari,
    /// Microsoft Edge (Chromium-based)
    Edge,
    /// Random selection from the concrete profiles
    Random,
}

impl BrowserProfile {
    /// Resolve a profile name. Accepts our short names and, for
    /// compatibility with configurations written for uTLS, its
    /// `HelloBrowser_*` Client-Hello id strings.
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        match lowered.as_str() {
            "chrome" => Some(Self::Chrome),
            "firefox" => Some(Self::Firefox),
            "safari" | "ios" => Some(Self::Safari),
            "edge" => Some(Self::Edge),
            "random" => Some(Self::Random),
            _ => {
                let lowered = lowered.replace(['_', '-'], "");
                match lowered.as_str() {
                    s if s.starts_with("hellochrome") => Some(Self::Chrome),
                    s if s.starts_with("hellofirefox") => Some(Self::Firefox),
                    s if s.starts_with("hellosafari") || s.starts_with("helloios") => {
                        Some(Self::Safari)
                    }
                    s if s.starts_with("helloedge") => Some(Self::Edge),
                    s if s.starts_with("hellorandomized") => Some(Self::Random),
                    _ => None,
                }
            }
        }
    }

    /// Pick a concrete profile at random.
    pub fn random() -> Self {
        match rand::random::<u8>() % 4 {
            0 => Self::Chrome,
            1 => Self::Firefox,
            2 => Self::Safari,
            _ => Self::Edge,
        }
    }

    /// The User-Agent string that matches this TLS fingerprint.
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome | Self::Edge => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            Self::Firefox => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0"
            }
            Self::Safari => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
            }
            Self::Random => Self::random().user_agent(),
        }
    }

    /// ALPN protocols offered by this profile.
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        // Every current browser offers h2 then http/1.1.
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    }
}

/// Build a rustls `ClientConfig` that mimics `profile`.
pub fn build_tls_config(profile: BrowserProfile) -> Result<ClientConfig, FingerprintError> {
    let profile = match profile {
        BrowserProfile::Random => BrowserProfile::random(),
        p => p,
    };

    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    // Cipher-suite order is the loudest part of the fingerprint rustls
    // lets us control.
    let crypto_provider = CryptoProvider {
        cipher_suites: cipher_suites(profile),
        ..ring_provider::default_provider()
    };

    let mut tls_config = ClientConfig::builder_with_provider(Arc::new(crypto_provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| FingerprintError::Config(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tls_config.alpn_protocols = profile.alpn_protocols();
    // Browsers resume sessions; so do we.
    tls_config.resumption = rustls::client::Resumption::default();

    Ok(tls_config)
}

/// Cipher suites ordered to match the browser profile.
fn cipher_suites(profile: BrowserProfile) -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;

    match profile {
        BrowserProfile::Chrome | BrowserProfile::Edge => {
            vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ]
        }
        BrowserProfile::Firefox => {
            vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ]
        }
        BrowserProfile::Safari => {
            vec![
                cipher_suite::TLS13_AES_128_GCM_SHA256,
                cipher_suite::TLS13_AES_256_GCM_SHA384,
                cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ]
        }
        BrowserProfile::Random => cipher_suites(BrowserProfile::random()),
    }
}

/// Fingerprint-related errors
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("TLS configuration error: {0}")]
    Config(String),
}
