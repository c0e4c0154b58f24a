//! Request facade handed to handlers

use crate::alias::AliasTable;
use crate::codec::{BoxedReader, ServeInputStream};
use crate::cookie::{Cookie, SessionCookieSlot};
use crate::session::{Session, SessionStore};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent, including any query
    pub uri: String,
    /// Percent-decoded path without the query
    pub path: String,
    pub query: Option<String>,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }

    /// HTTP/1.1 or later
    pub fn is_one_one(&self) -> bool {
        match self.protocol.strip_prefix("HTTP/") {
            Some(version) => {
                let mut parts = version.splitn(2, '.');
                let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                major > 1 || (major == 1 && minor >= 1)
            }
            None => false,
        }
    }
}

/// Session state seen by one request
pub(crate) struct SessionContext {
    pub store: Arc<SessionStore>,
    pub requested_id: Option<String>,
    pub cookie_slot: SessionCookieSlot,
}

/// A request being dispatched to a handler
pub struct Request {
    head: RequestHead,
    cookies: Vec<Cookie>,
    parameters: HashMap<String, Vec<String>>,
    servlet_path: String,
    path_info: Option<String>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    remote_user: Option<String>,
    auth_type: Option<&'static str>,
    attributes: HashMap<String, serde_json::Value>,
    body: ServeInputStream<BoxedReader>,
    sessions: SessionContext,
    session: Option<Arc<Session>>,
    aliases: Arc<AliasTable>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        head: RequestHead,
        cookies: Vec<Cookie>,
        servlet_path: String,
        path_info: Option<String>,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        body: ServeInputStream<BoxedReader>,
        sessions: SessionContext,
        aliases: Arc<AliasTable>,
    ) -> Self {
        let parameters = head
            .query
            .as_deref()
            .map(parse_parameters)
            .unwrap_or_default();
        Self {
            head,
            cookies,
            parameters,
            servlet_path,
            path_info,
            remote_addr,
            local_addr,
            remote_user: None,
            auth_type: None,
            attributes: HashMap::new(),
            body,
            sessions,
            session: None,
            aliases,
        }
    }

    pub fn method(&self) -> &str {
        &self.head.method
    }

    /// Request target as received, including the query
    pub fn request_uri(&self) -> &str {
        &self.head.uri
    }

    /// Decoded request path without the query
    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.head.query.as_deref()
    }

    pub fn protocol(&self) -> &str {
        &self.head.protocol
    }

    /// Portion of the path matched by the handler's pattern
    pub fn servlet_path(&self) -> &str {
        &self.servlet_path
    }

    /// Remainder of the path beyond the handler's pattern
    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.head.header_values(name)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.head.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// Declared body length; `None` when absent or chunked
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// First value of a query (or form, after [`Request::read_form`]) parameter
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn parameter_values(&self, name: &str) -> &[String] {
        self.parameters
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.parameters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Read an `application/x-www-form-urlencoded` body into the parameters
    pub async fn read_form(&mut self) -> io::Result<()> {
        let is_form = self.content_type().is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| {
                    mime.trim()
                        .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                })
        });
        if !is_form {
            return Ok(());
        }
        let mut body = Vec::new();
        self.body.read_to_end(&mut body).await?;
        for (name, value) in url::form_urlencoded::parse(&body).into_owned() {
            self.parameters.entry(name).or_default().push(value);
        }
        Ok(())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Username authenticated by a realm
    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    pub fn auth_type(&self) -> Option<&str> {
        self.auth_type
    }

    pub(crate) fn set_authenticated(&mut self, user: String, auth_type: &'static str) {
        self.remote_user = Some(user);
        self.auth_type = Some(auth_type);
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<serde_json::Value> {
        self.attributes.remove(name)
    }

    /// Filesystem path for a URL path through the alias table
    pub fn real_path(&self, url_path: &str) -> Option<PathBuf> {
        self.aliases.translate(url_path)
    }

    /// Body reader; chunked bodies are decoded transparently
    pub fn body(&mut self) -> &mut ServeInputStream<BoxedReader> {
        &mut self.body
    }

    /// Read the whole body
    pub async fn read_body(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        self.body.read_to_end(&mut body).await?;
        Ok(body)
    }

    /// Session id sent by the client, whether or not it is still live
    pub fn requested_session_id(&self) -> Option<&str> {
        self.sessions.requested_id.as_deref()
    }

    pub fn is_requested_session_id_valid(&self) -> bool {
        self.requested_session_id()
            .is_some_and(|id| self.sessions.store.get(id).is_some())
    }

    /// Session ids only travel in cookies
    pub fn is_requested_session_id_from_cookie(&self) -> bool {
        self.sessions.requested_id.is_some()
    }

    /// Current session, creating one when `create` is set
    ///
    /// A new session's cookie is sent with the response headers.
    pub fn session(&mut self, create: bool) -> Option<Arc<Session>> {
        if let Some(session) = self.session.as_ref().filter(|s| s.is_valid()) {
            return Some(Arc::clone(session));
        }
        if let Some(session) = self
            .sessions
            .requested_id
            .as_deref()
            .and_then(|id| self.sessions.store.get(id))
        {
            self.session = Some(Arc::clone(&session));
            return Some(session);
        }
        if !create {
            return None;
        }

        let session = self.sessions.store.create();
        let cookie = self.sessions.store.session_cookie(session.id());
        if !self.sessions.cookie_slot.offer(cookie) {
            warn!(session_id = %session.id(), "Session created after headers were sent; cookie not delivered");
        }
        self.session = Some(Arc::clone(&session));
        Some(session)
    }
}

/// Parse a query string into name -> values
pub fn parse_parameters(query: &str) -> HashMap<String, Vec<String>> {
    let mut parameters: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()).into_owned() {
        parameters.entry(name).or_default().push(value);
    }
    parameters
}

/// Percent-decode a request path; malformed escapes are kept literally
pub fn decode_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    fn head(target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        RequestHead {
            method: "GET".to_string(),
            uri: target.to_string(),
            path: decode_path(path),
            query,
            protocol: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn request(head: RequestHead, body: &'static [u8], requested: Option<&str>) -> Request {
        let mut input = ServeInputStream::new(Box::new(body) as BoxedReader);
        input.set_limit(Some(body.len() as u64));
        Request::new(
            head,
            Vec::new(),
            String::new(),
            None,
            None,
            None,
            input,
            SessionContext {
                store: Arc::new(SessionStore::new(SessionConfig::default())),
                requested_id: requested.map(str::to_string),
                cookie_slot: SessionCookieSlot::new(),
            },
            Arc::new(AliasTable::new()),
        )
    }

    #[test]
    fn test_decode_path() {
        assert_eq!(decode_path("/a%20b/c"), "/a b/c");
        assert_eq!(decode_path("/100%"), "/100%");
        assert_eq!(decode_path("/%zz"), "/%zz");
        assert_eq!(decode_path("/caf%C3%A9"), "/café");
    }

    #[test]
    fn test_protocol_versions() {
        let mut h = head("/", &[]);
        assert!(h.is_one_one());
        h.protocol = "HTTP/1.0".to_string();
        assert!(!h.is_one_one());
        h.protocol = "HTTP/2.0".to_string();
        assert!(h.is_one_one());
    }

    #[test]
    fn test_query_parameters() {
        let req = request(head("/search?q=rust+lang&tag=a&tag=b", &[]), b"", None);
        assert_eq!(req.parameter("q"), Some("rust lang"));
        assert_eq!(req.parameter_values("tag"), ["a", "b"]);
        assert_eq!(req.parameter_names(), ["q", "tag"]);
        assert!(req.parameter("missing").is_none());
    }

    #[test]
    fn test_headers_case_insensitive() {
        let req = request(
            head("/", &[("content-length", "0"), ("X-Tag", "1"), ("x-tag", "2")]),
            b"",
            None,
        );
        assert_eq!(req.content_length(), Some(0));
        assert_eq!(req.header_values("X-TAG").collect::<Vec<_>>(), ["1", "2"]);
    }

    #[tokio::test]
    async fn test_read_form() {
        let mut req = request(
            head(
                "/submit?a=1",
                &[("Content-Type", "application/x-www-form-urlencoded; charset=utf-8")],
            ),
            b"a=2&b=hello%21",
            None,
        );
        req.read_form().await.unwrap();
        assert_eq!(req.parameter_values("a"), ["1", "2"]);
        assert_eq!(req.parameter("b"), Some("hello!"));
    }

    #[test]
    fn test_session_creation_offers_cookie() {
        let mut req = request(head("/", &[]), b"", None);
        assert!(req.session(false).is_none());
        let session = req.session(true).unwrap();
        let again = req.session(false).unwrap();
        assert_eq!(session.id(), again.id());

        let cookie = req.sessions.cookie_slot.commit().unwrap();
        assert_eq!(cookie.name, "JSESSIONID");
        assert_eq!(cookie.value, session.id());
    }

    #[test]
    fn test_stale_requested_session() {
        let mut req = request(head("/", &[]), b"", Some("STALE"));
        assert_eq!(req.requested_session_id(), Some("STALE"));
        assert!(!req.is_requested_session_id_valid());
        assert!(req.session(false).is_none());
    }
}
