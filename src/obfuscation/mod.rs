//! Traffic-appearance shaping
//!
//! The transport's cover story is "a browser talking to a web site". The
//! fingerprint module keeps the TLS side of that story consistent when a
//! connection asks for a specific browser profile.

mod fingerprint;

pub use fingerprint::{build_tls_config, BrowserProfile, FingerprintError};
