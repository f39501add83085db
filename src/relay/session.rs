//! Session table
//!
//! Every session id maps to an open downstream connection, kept alive
//! between requests. The first request with an unseen id dials a new
//! connection; later requests reuse it; a sweeper reaps sessions that go
//! quiet. While a session is in the table its connection is open, and a
//! removed session is never resurrected — the same id dials afresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{RelayError, MAX_SESSION_STALENESS, TURNAROUND_TIMEOUT};
use crate::MAX_PAYLOAD_LENGTH;

struct Session {
    /// The downstream connection. Its own mutex serializes transacts for
    /// this session even if a misbehaving client overlaps POSTs.
    downstream: Arc<Mutex<TcpStream>>,
    last_seen: Instant,
}

impl Session {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_expired(&self, staleness: Duration) -> bool {
        self.last_seen.elapsed() > staleness
    }
}

/// Map of session id → downstream connection, with idle expiry.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
    downstream_addr: String,
    staleness: Duration,
}

impl SessionTable {
    /// Create a table dialing `downstream_addr` for new sessions, with the
    /// default staleness horizon.
    pub fn new(downstream_addr: String) -> Self {
        Self::with_staleness(downstream_addr, MAX_SESSION_STALENESS)
    }

    /// As [`SessionTable::new`] with an explicit staleness horizon.
    pub fn with_staleness(downstream_addr: String, staleness: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            downstream_addr,
            staleness,
        }
    }

    /// Look up a session by id, or create one (dialing its downstream
    /// connection) if the id is unseen. Touches the session either way.
    ///
    /// The table lock is held across the dial: concurrent first requests
    /// for the same id must observe a single winning session.
    pub async fn lookup(
        &self,
        session_id: &str,
    ) -> Result<Arc<Mutex<TcpStream>>, RelayError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = sessions.get_mut(session_id) {
            session.touch();
            return Ok(session.downstream.clone());
        }

        trace!("unknown session id; creating new session");
        let stream = TcpStream::connect(&self.downstream_addr).await?;
        stream.set_nodelay(true).ok();

        let downstream = Arc::new(Mutex::new(stream));
        sessions.insert(
            session_id.to_string(),
            Session {
                downstream: downstream.clone(),
                last_seen: Instant::now(),
            },
        );
        Ok(downstream)
    }

    /// Remove a session, closing its downstream connection. Does nothing
    /// for unknown ids.
    pub async fn close_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(session_id).is_some() {
            debug!("closing session");
        }
        // The stream closes when the last clone of its handle drops; an
        // in-flight transact may briefly hold one.
    }

    /// Whether `session_id` currently maps to a session.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// One expiry pass: drop every session idle beyond the horizon.
    pub async fn sweep(&self) {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(self.staleness));
        let reaped = before - sessions.len();
        if reaped > 0 {
            debug!("expired {} idle session(s)", reaped);
        }
    }

    /// Loop forever, checking for expired sessions and removing them.
    pub async fn run_expiry(&self) {
        loop {
            tokio::time::sleep(self.staleness / 2).await;
            self.sweep().await;
        }
    }
}

/// Feed `body` into the session's downstream connection and collect
/// whatever comes back within the turnaround window.
///
/// A read timeout is not an error: it means no data was ready this
/// turnaround, and the reply is empty. EOF or a read/write error is fatal
/// for the session.
pub async fn transact(
    downstream: &Mutex<TcpStream>,
    body: &[u8],
) -> Result<Bytes, RelayError> {
    let mut downstream = downstream.lock().await;

    downstream.write_all(body).await?;

    let mut buf = vec![0u8; MAX_PAYLOAD_LENGTH];
    match timeout(TURNAROUND_TIMEOUT, downstream.read(&mut buf)).await {
        Err(_) => Ok(Bytes::new()),
        Ok(Ok(0)) => Err(RelayError::DownstreamClosed),
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }
        Ok(Err(e)) => Err(RelayError::Io(e)),
    }
}
