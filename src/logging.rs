//! Logging setup and log scrubbing
//!
//! Both binaries log through `tracing`. When a log file is configured the
//! subscriber appends to it; otherwise output goes to stderr. Errors that
//! may embed a remote peer address must pass through [`scrub`] before being
//! logged, so that client IPs are never written to disk. Downstream-side
//! errors always refer to localhost and are logged as-is.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// With `log_file` set, opens (creating if necessary) the file in append
/// mode and writes there without ANSI colors; otherwise logs go to stderr.
/// The filter honors `RUST_LOG`, falling back to `level`.
pub fn init(log_file: Option<&Path>, level: &str) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Replace anything that looks like a socket address or bare IP in `text`
/// with `[scrubbed]`.
///
/// Io errors render the peer address into their message ("connection reset
/// by 203.0.113.7:443"); we keep the surrounding text but not the literal
/// address.
pub fn scrub(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while !rest.is_empty() {
        match find_address(rest) {
            Some((start, end)) => {
                out.push_str(&rest[..start]);
                out.push_str("[scrubbed]");
                rest = &rest[end..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Find the first IPv4/IPv6 address (optionally with `:port`) in `text`,
/// returning its byte range.
fn find_address(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let boundary = i == 0 || !is_addr_byte(bytes[i - 1]);
        if boundary && (c.is_ascii_hexdigit() || c == b'[') {
            let mut j = i;
            while j < bytes.len() && (is_addr_byte(bytes[j]) || bytes[j] == b'[' || bytes[j] == b']')
            {
                j += 1;
            }
            // Punctuation that follows an address gets swept up by the scan
            // ("10.0.0.1:80:" in "tcp 10.0.0.1:80: reset"); peel it off the
            // tail until the rest parses or nothing separator-like remains.
            let mut candidate = &text[i..j];
            loop {
                if looks_like_address(candidate) {
                    return Some((i, i + candidate.len()));
                }
                match candidate.strip_suffix([':', '.']) {
                    Some(shorter) if !shorter.is_empty() => candidate = shorter,
                    _ => break,
                }
            }
            i = j;
        }
        i += 1;
    }
    None
}

fn is_addr_byte(b: u8) -> bool {
    b.is_ascii_hexdigit() || b == b'.' || b == b':'
}

fn looks_like_address(s: &str) -> bool {
    let host = match s.strip_prefix('[').and_then(|rest| rest.split(']').next()) {
        Some(inner) => inner,
        // Unbracketed: strip a trailing :port from an IPv4 form.
        None => match s.rsplit_once(':') {
            Some((head, port))
                if !port.is_empty()
                    && port.chars().all(|c| c.is_ascii_digit())
                    && head.contains('.') =>
            {
                head
            }
            _ => s,
        },
    };
    host.parse::<std::net::IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_ipv4_with_port() {
        assert_eq!(
            scrub("read tcp 203.0.113.7:443: connection reset"),
            "read tcp [scrubbed]: connection reset"
        );
    }

    #[test]
    fn test_scrub_bare_ipv4() {
        assert_eq!(scrub("peer 198.51.100.22 went away"), "peer [scrubbed] went away");
    }

    #[test]
    fn test_scrub_ipv6() {
        assert_eq!(
            scrub("error writing to [2001:db8::1]:8443 during poll"),
            "error writing to [scrubbed] during poll"
        );
    }

    #[test]
    fn test_scrub_leaves_plain_text() {
        let msg = "body longer than 65536 bytes";
        assert_eq!(scrub(msg), msg);
    }

    #[test]
    fn test_scrub_leaves_version_numbers() {
        let msg = "starting version 0.38.0";
        assert_eq!(scrub(msg), msg);
    }

    #[test]
    fn test_scrub_multiple_addresses() {
        assert_eq!(
            scrub("10.0.0.1:80 -> 10.0.0.2:81"),
            "[scrubbed] -> [scrubbed]"
        );
    }
}
