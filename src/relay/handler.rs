//! HTTP request handling
//!
//! POST requests carry tunnel traffic; everything else gets the cover
//! identity. The handler never exposes tunnel internals in an error body —
//! failures collapse into the same terse responses a generic web server
//! would produce.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use tokio::time::timeout;
use tracing::warn;

use super::{SessionTable, READ_WRITE_TIMEOUT};
use crate::{MAX_PAYLOAD_LENGTH, MIN_SESSION_ID_LENGTH};

/// What to serve on GET: a redirect, a mask document, or a stock one-liner.
pub struct CoverConfig {
    mask_doc: PathBuf,
    redirect: Option<HeaderValue>,
}

impl CoverConfig {
    /// Build the cover configuration. `redirect` overrides the mask
    /// document; `mask_doc` defaults to `index.html`.
    pub fn new(
        mask_doc: Option<PathBuf>,
        redirect: Option<&str>,
    ) -> Result<Self, crate::Error> {
        let redirect = redirect
            .map(|location| {
                HeaderValue::from_str(location)
                    .map_err(|_| crate::Error::Config(format!("bad redirect URL {:?}", location)))
            })
            .transpose()?;
        Ok(Self {
            mask_doc: mask_doc.unwrap_or_else(|| PathBuf::from("index.html")),
            redirect,
        })
    }
}

/// The relay: session table plus cover identity, shared by every
/// connection the listener accepts.
pub struct Relay {
    pub sessions: Arc<SessionTable>,
    cover: CoverConfig,
}

impl Relay {
    pub fn new(sessions: Arc<SessionTable>, cover: CoverConfig) -> Self {
        Self { sessions, cover }
    }

    /// Handle one request, bounded by the read/write deadline.
    pub async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        match timeout(READ_WRITE_TIMEOUT, self.dispatch(request)).await {
            Ok(response) => response,
            Err(_) => internal_server_error(),
        }
    }

    async fn dispatch(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        match request.method().as_str() {
            "GET" => self.get(request).await,
            "POST" => self.post(request).await,
            _ => bad_request(),
        }
    }

    /// Serve the cover identity. This has no purpose for the tunnel itself;
    /// it is what a passerby sees.
    async fn get(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        if request.uri().path() != "/" {
            return not_found();
        }

        if let Some(location) = &self.cover.redirect {
            let mut response = text_response(
                StatusCode::MOVED_PERMANENTLY,
                "text/html; charset=utf-8",
                Bytes::from_static(b"Moved permanently.\n"),
            );
            response.headers_mut().insert(LOCATION, location.clone());
            return response;
        }

        match tokio::fs::read(&self.cover.mask_doc).await {
            Ok(contents) => text_response(
                StatusCode::OK,
                "text/html; charset=utf-8",
                Bytes::from(contents),
            ),
            Err(_) => text_response(
                StatusCode::OK,
                "text/plain; charset=utf-8",
                Bytes::from_static("I’m just a happy little web server.\n".as_bytes()),
            ),
        }
    }

    /// Handle a tunnel request: look up the session and do a transaction.
    async fn post(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let session_id = match request
            .headers()
            .get("X-Session-Id")
            .and_then(|value| value.to_str().ok())
        {
            Some(id) if id.len() >= MIN_SESSION_ID_LENGTH => id.to_string(),
            _ => return bad_request(),
        };

        // Cap the body before touching any session state, so an oversize
        // request cannot create or destroy anything.
        let body = match Limited::new(request.into_body(), MAX_PAYLOAD_LENGTH)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return payload_too_large(),
        };

        let downstream = match self.sessions.lookup(&session_id).await {
            Ok(downstream) => downstream,
            Err(e) => {
                // The dial target is local; no scrubbing needed.
                warn!("session create failed: {}", e);
                return internal_server_error();
            }
        };

        match super::transact(&downstream, &body).await {
            Ok(reply) => text_response(StatusCode::OK, "application/octet-stream", reply),
            Err(e) => {
                warn!("transact failed: {}", e);
                self.sessions.close_session(&session_id).await;
                internal_server_error()
            }
        }
    }
}

/// Build a response without fallible header plumbing.
fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn bad_request() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::BAD_REQUEST,
        "text/plain; charset=utf-8",
        Bytes::from_static(b"Bad request.\n"),
    )
}

fn internal_server_error() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "text/plain; charset=utf-8",
        Bytes::from_static(b"Internal server error.\n"),
    )
}

fn not_found() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::NOT_FOUND,
        "text/plain; charset=utf-8",
        Bytes::from_static(b"Not found.\n"),
    )
}

fn payload_too_large() -> Response<Full<Bytes>> {
    text_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        "text/plain; charset=utf-8",
        Bytes::from_static(b"Payload too large.\n"),
    )
}
