//! Per-connection request handling
//!
//! One [`ServeConnection`] runs for every accepted socket. It parses a single
//! request, authenticates it against the realm table, routes it, invokes the
//! handler and closes the socket after the response.
//!
//! ```text
//! AwaitingRequestLine → HeadersParsed → Authenticated → Dispatched → ResponseFlushed → Closed
//! ```
//!
//! Any failure jumps straight to `Closed` after a best-effort error response.

use crate::auth::BASIC_AUTH;
use crate::codec::{
    BoxedReader, BoxedWriter, Line, MAX_HEADER_LINE, MAX_REQUEST_LINE, ResponseHead,
    ServeInputStream, ServeOutputStream,
};
use crate::cookie::{SessionCookieSlot, http_date, parse_cookie_header};
use crate::error::{HttpError, RuntimeError};
use crate::request::{Request, RequestHead, SessionContext, decode_path};
use crate::response::Response;
use crate::router::split_at_match;
use crate::server::ServerState;
use crate::throttle::ThrottledWriter;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, trace, warn};

/// Most header lines accepted in one request
const MAX_HEADERS: usize = 100;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its single request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRequestLine,
    HeadersParsed,
    Authenticated,
    Dispatched,
    ResponseFlushed,
    Closed,
}

/// Worker for one accepted socket
pub(crate) struct ServeConnection {
    id: ConnectionId,
    state: Arc<ServerState>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    phase: ConnectionState,
}

impl ServeConnection {
    pub(crate) fn new(
        state: Arc<ServerState>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            state,
            peer,
            local,
            phase: ConnectionState::AwaitingRequestLine,
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        trace!(connection_id = %self.id, from = ?self.phase, to = ?next, "Connection state");
        self.phase = next;
    }

    /// Serve one request on `stream` and close it
    pub(crate) async fn serve<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let config = &self.state.config;
        let mut input = ServeInputStream::new(Box::new(read_half) as BoxedReader)
            .with_read_timeout(config.read_timeout);

        let head = match read_request_head(&mut input).await {
            Ok(head) => head,
            Err(http_err) => {
                debug!(connection_id = %self.id, peer = ?self.peer, status = http_err.status, message = %http_err.message, "Rejecting request");
                let mut response = self.plain_response(write_half, "HTTP/1.0");
                if let Err(e) = response.send_error(http_err.status, &http_err.message).await {
                    debug!(connection_id = %self.id, error = %e, "Could not send error response");
                }
                self.close(&mut response).await;
                return;
            }
        };
        self.advance(ConnectionState::HeadersParsed);
        self.dispatch(head, input, write_half).await;
    }

    fn plain_response<W>(&self, writer: W, protocol: &str) -> Response
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let out = ServeOutputStream::new(Box::new(writer) as BoxedWriter, ResponseHead::new(protocol))
            .with_write_timeout(self.state.config.write_timeout);
        Response::new(out)
    }

    async fn dispatch<W>(
        &mut self,
        mut head: RequestHead,
        mut input: ServeInputStream<BoxedReader>,
        writer: W,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::clone(&self.state);
        let config = &state.config;
        let response_protocol = if head.is_one_one() { "HTTP/1.1" } else { "HTTP/1.0" };

        // Body framing
        let chunked = head
            .header_values("Transfer-Encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            head.remove_header("Content-Length");
            input.set_chunking(true);
        } else {
            match head.header("Content-Length").map(|v| v.trim().parse::<u64>()) {
                Some(Ok(length)) => input.set_limit(Some(length)),
                Some(Err(_)) => {
                    let mut response = self.plain_response(writer, response_protocol);
                    self.fail(&mut response, HttpError::bad_request("Invalid Content-Length")).await;
                    return;
                }
                None => input.set_limit(Some(0)),
            }
        }

        let Some(matched) = state.handlers.lookup(&head.path) else {
            debug!(connection_id = %self.id, path = %head.path, "No handler matched");
            self.advance(ConnectionState::Closed);
            return;
        };
        let entry = matched.value;
        let (servlet_path, path_info) = split_at_match(&head.path, matched.offset);
        let (servlet_path, path_info) = (servlet_path.to_string(), path_info.map(str::to_string));

        // Cookies and session touch
        let cookies: Vec<_> = head
            .header_values("Cookie")
            .flat_map(parse_cookie_header)
            .collect();
        let session_cookie_name = &state.sessions.config().cookie_name;
        let requested_id = cookies
            .iter()
            .find(|c| &c.name == session_cookie_name)
            .map(|c| c.value.clone());
        if let Some(id) = requested_id.as_deref() {
            if state.sessions.access(id).is_none() {
                debug!(connection_id = %self.id, session_id = %id, "Requested session is not live");
            }
        }

        // Output, throttled when a rule matches the path
        let sink: BoxedWriter = match state.throttles.lookup(&head.path) {
            Some(rate) => {
                debug!(connection_id = %self.id, path = %head.path, rate, "Throttling response");
                Box::new(ThrottledWriter::new(writer, rate))
            }
            None => Box::new(writer),
        };
        let cookie_slot = SessionCookieSlot::new();
        let mut out = ServeOutputStream::new(sink, ResponseHead::new(response_protocol))
            .with_write_timeout(config.write_timeout)
            .with_session_cookie(cookie_slot.clone());
        if head.method.eq_ignore_ascii_case("HEAD") {
            out.suppress_body();
        }
        let mut response = Response::new(out);
        response.set_header("Server", crate::server_signature());
        response.set_header("Date", http_date(Utc::now()));
        response.set_header("Content-Type", "text/html");
        response.set_header("Connection", "close");

        let expects_continue = head.is_one_one()
            && head
                .header("Expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
        let authorization = head.header("Authorization").map(str::to_string);
        let method = head.method.clone();
        let path = head.path.clone();

        let mut request = Request::new(
            head,
            cookies,
            servlet_path,
            path_info,
            self.peer,
            self.local,
            input,
            SessionContext {
                store: Arc::clone(&state.sessions),
                requested_id,
                cookie_slot,
            },
            Arc::clone(&state.aliases),
        );

        // Authentication
        if let Some(realm) = state.realms.find(&path) {
            match realm.authenticate(authorization.as_deref()) {
                Some(user) => {
                    debug!(connection_id = %self.id, realm = %realm.name(), user = %user, "Authenticated");
                    request.set_authenticated(user, BASIC_AUTH);
                }
                None => {
                    debug!(connection_id = %self.id, realm = %realm.name(), path = %path, "Authentication required");
                    response.set_header("WWW-Authenticate", realm.challenge());
                    let challenge = HttpError::unauthorized("This resource requires authentication.");
                    if let Err(e) = response
                        .send_error(challenge.status, &challenge.message)
                        .await
                    {
                        debug!(connection_id = %self.id, error = %e, "Could not send challenge");
                    }
                    self.finish(&mut response, &method, &path).await;
                    return;
                }
            }
        }
        self.advance(ConnectionState::Authenticated);

        if expects_continue {
            if let Err(e) = response.send_continue().await {
                debug!(connection_id = %self.id, error = %e, "Could not send 100 Continue");
            }
        }

        let outcome = AssertUnwindSafe(entry.invoke(&mut request, &mut response))
            .catch_unwind()
            .await;
        self.advance(ConnectionState::Dispatched);
        drop(request);

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(panic) => Some(RuntimeError::handler(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        if let Some(err) = failure {
            if err.is_io() {
                warn!(connection_id = %self.id, handler = %entry.pattern(), method = %method, path = %path, error = %err, "Handler I/O failure");
            } else {
                error!(connection_id = %self.id, handler = %entry.pattern(), method = %method, path = %path, error = ?err, "Handler failed");
            }
            if response.is_committed() {
                warn!(connection_id = %self.id, path = %path, "Response already committed, cannot send error");
            } else {
                self.fail(&mut response, HttpError::from(err)).await;
                return;
            }
        }

        self.finish(&mut response, &method, &path).await;
    }

    async fn fail(&mut self, response: &mut Response, http_err: HttpError) {
        if let Err(e) = response.send_error(http_err.status, &http_err.message).await {
            debug!(connection_id = %self.id, error = %e, "Could not send error response");
        }
        self.close(response).await;
    }

    async fn finish(&mut self, response: &mut Response, method: &str, path: &str) {
        self.close(response).await;
        if self.state.config.access_log {
            info!(
                peer = ?self.peer,
                method = %method,
                path = %path,
                status = response.status(),
                bytes = response.bytes_written(),
                "request"
            );
        }
    }

    async fn close(&mut self, response: &mut Response) {
        match response.close().await {
            Ok(()) => self.advance(ConnectionState::ResponseFlushed),
            Err(e) => debug!(connection_id = %self.id, error = %e, "Error closing response"),
        }
        self.advance(ConnectionState::Closed);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Parse the request line and headers
///
/// Errors carry the status to answer with: 400 for malformed input, 414 for
/// an over-long request line.
pub(crate) async fn read_request_head<R>(input: &mut ServeInputStream<R>) -> Result<RequestHead, HttpError>
where
    R: AsyncRead + Unpin,
{
    let line = match input.read_protocol_line(MAX_REQUEST_LINE).await {
        Ok(Line::Text(line)) => line,
        Ok(Line::Eof) => return Err(HttpError::bad_request("Empty request line")),
        Ok(Line::TooLong) => return Err(HttpError::uri_too_long("Request line too long")),
        Err(e) => return Err(HttpError::bad_request(format!("Error reading request: {e}"))),
    };
    if line.trim().is_empty() {
        return Err(HttpError::bad_request("Empty request line"));
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(protocol), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::bad_request("Malformed request line"));
    };
    if !protocol.starts_with("HTTP/") {
        return Err(HttpError::bad_request(format!("Unsupported protocol {protocol}")));
    }

    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (target, None),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = match input.read_protocol_line(MAX_HEADER_LINE).await {
            Ok(Line::Text(line)) => line,
            Ok(Line::TooLong) => return Err(HttpError::bad_request("Header line too long")),
            Ok(Line::Eof) => return Err(HttpError::bad_request("Connection closed inside headers")),
            Err(e) => return Err(HttpError::bad_request(format!("Error reading headers: {e}"))),
        };
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            // Folded continuation of the previous header
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(HttpError::bad_request("Malformed header line")),
            }
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(HttpError::bad_request(format!("Malformed header line: {line}")));
        };
        if headers.len() >= MAX_HEADERS {
            return Err(HttpError::bad_request("Too many headers"));
        }
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let head = RequestHead {
        method: method.to_string(),
        uri: target.to_string(),
        path: decode_path(raw_path),
        query,
        protocol: protocol.to_string(),
        headers,
    };
    if head.is_one_one() && head.header("Host").is_none() {
        return Err(HttpError::bad_request("HTTP/1.1 requests must include a Host header"));
    }
    Ok(head)
}
