//! Cookies
//!
//! Parsing of the incoming `Cookie` header and generation of `Set-Cookie`
//! lines. Each outgoing cookie becomes its own `Set-Cookie` line.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// An HTTP cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Lifetime in seconds; `Some(0)` deletes the cookie on the client
    pub max_age: Option<i64>,
    /// Absolute expiry, used when `max_age` is not set
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    /// 0 for Netscape-style cookies, 1 for RFC 2109
    pub version: u8,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            expires: None,
            secure: false,
            http_only: false,
            version: 0,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Format the value of a `Set-Cookie` header for this cookie
    pub fn to_set_cookie(&self) -> String {
        self.to_set_cookie_at(Utc::now())
    }

    fn to_set_cookie_at(&self, now: DateTime<Utc>) -> String {
        let mut cookie = format!("{}={}", self.name, self.value);

        if self.version > 0 {
            cookie.push_str(&format!("; Version={}", self.version));
        }
        if let Some(domain) = &self.domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }
        if let Some(path) = &self.path {
            cookie.push_str(&format!("; Path={}", path));
        }

        match (self.max_age, self.expires) {
            (Some(max_age), _) if self.version > 0 => {
                cookie.push_str(&format!("; Max-Age={}", max_age));
            }
            (Some(max_age), _) => {
                // Netscape cookies only understand Expires
                let expires = if max_age <= 0 {
                    DateTime::<Utc>::UNIX_EPOCH
                } else {
                    now + ChronoDuration::seconds(max_age)
                };
                cookie.push_str(&format!("; Expires={}", http_date(expires)));
            }
            (None, Some(expires)) => {
                cookie.push_str(&format!("; Expires={}", http_date(expires)));
            }
            (None, None) => {}
        }

        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie
    }
}

/// Format a timestamp as an RFC 1123 HTTP date
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse a `Cookie` request header into its cookies, in header order
///
/// RFC 2109 attributes (`$Version`, `$Path`, `$Domain`) are folded into the
/// cookies they apply to rather than returned as cookies.
pub fn parse_cookie_header(header: &str) -> Vec<Cookie> {
    let mut cookies: Vec<Cookie> = Vec::new();
    let mut version = 0u8;

    for part in header.split(';') {
        let part = part.trim();
        let Some(eq_pos) = part.find('=') else {
            continue;
        };
        let name = part[..eq_pos].trim();
        // Remove surrounding quotes if present
        let value = part[eq_pos + 1..].trim().trim_matches('"');
        if name.is_empty() {
            continue;
        }

        match name {
            "$Version" => version = value.parse().unwrap_or(0),
            "$Path" => {
                if let Some(last) = cookies.last_mut() {
                    last.path = Some(value.to_string());
                }
            }
            "$Domain" => {
                if let Some(last) = cookies.last_mut() {
                    last.domain = Some(value.to_string());
                }
            }
            _ if name.starts_with('$') => {}
            _ => cookies.push(Cookie::new(name, value).with_version(version)),
        }
    }

    cookies
}

/// Hand-off for the session cookie between a request and its response
///
/// The request side deposits a cookie when it creates a session; the
/// response side takes it when the headers are committed.
#[derive(Debug, Clone, Default)]
pub struct SessionCookieSlot {
    inner: Arc<Mutex<SlotState>>,
}

#[derive(Debug, Default)]
struct SlotState {
    cookie: Option<Cookie>,
    committed: bool,
}

impl SessionCookieSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie to be sent; returns false once headers are committed
    pub fn offer(&self, cookie: Cookie) -> bool {
        let mut state = self.inner.lock();
        if state.committed {
            return false;
        }
        state.cookie = Some(cookie);
        true
    }

    /// Take the pending cookie and mark the headers as committed
    pub fn commit(&self) -> Option<Cookie> {
        let mut state = self.inner.lock();
        state.committed = true;
        state.cookie.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_two_cookies() {
        let cookies = parse_cookie_header("a=1; b=2");
        assert_eq!(cookies.len(), 2);
        assert_eq!((cookies[0].name.as_str(), cookies[0].value.as_str()), ("a", "1"));
        assert_eq!((cookies[1].name.as_str(), cookies[1].value.as_str()), ("b", "2"));
    }

    #[test]
    fn test_parse_quoted_and_malformed() {
        let cookies = parse_cookie_header("session=\"abc123\"; junk; =x; theme=dark");
        let names: Vec<_> = cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["session", "theme"]);
        assert_eq!(cookies[0].value, "abc123");
    }

    #[test]
    fn test_parse_rfc2109_attributes() {
        let cookies = parse_cookie_header("$Version=1; id=7; $Path=/app; lang=en");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].version, 1);
        assert_eq!(cookies[0].path.as_deref(), Some("/app"));
        assert_eq!(cookies[1].path, None);
    }

    #[test]
    fn test_set_cookie_netscape_max_age_becomes_expires() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let cookie = Cookie::new("JSESSIONID", "xyz")
            .with_path("/")
            .with_max_age(60)
            .http_only(true);
        assert_eq!(
            cookie.to_set_cookie_at(now),
            "JSESSIONID=xyz; Path=/; Expires=Mon, 01 Jan 2024 00:01:00 GMT; HttpOnly"
        );
    }

    #[test]
    fn test_set_cookie_rfc2109() {
        let cookie = Cookie::new("a", "1")
            .with_version(1)
            .with_domain("example.com")
            .with_max_age(0)
            .secure(true);
        assert_eq!(
            cookie.to_set_cookie(),
            "a=1; Version=1; Domain=example.com; Max-Age=0; Secure"
        );
    }

    #[test]
    fn test_session_slot_refuses_after_commit() {
        let slot = SessionCookieSlot::new();
        assert!(slot.offer(Cookie::new("a", "1")));
        assert_eq!(slot.commit().map(|c| c.name), Some("a".to_string()));
        assert!(!slot.offer(Cookie::new("b", "2")));
        assert!(slot.commit().is_none());
    }
}
