//! Error types for tinyserve
//!
//! Provides structured error handling across the listener, codecs, session
//! store and handlers.

use thiserror::Error;

/// Main error type for the server
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Error in listener or connection operations
    #[error("Server error: {message}")]
    Server {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Configuration error (bad flag, unreadable side file)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Operation not allowed in the current response state
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Session store error
    #[error("Session error: {message}")]
    Session { message: String },

    /// Failure raised by handler code
    #[error("Handler error: {message}")]
    Handler {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {message}")]
    WithContext { context: String, message: String },
}

impl RuntimeError {
    /// Create a server error
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
            source: None,
        }
    }

    /// Create a server error with source
    pub fn server_with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Server {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler error with source
    pub fn handler_with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Handler {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            message: self.to_string(),
        }
    }

    /// Whether this error originated in socket or body I/O
    pub fn is_io(&self) -> bool {
        matches!(self, RuntimeError::Io(_))
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<std::io::Error>() {
            Ok(io) => RuntimeError::Io(io),
            Err(other) => RuntimeError::handler_with_source(other.to_string(), other),
        }
    }
}

/// Result type alias for server operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// HTTP error response produced by the connection layer
#[derive(Debug)]
pub struct HttpError {
    pub status: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    pub fn uri_too_long(message: impl Into<String>) -> Self {
        Self::new(414, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// Reason phrase for the status code
    pub fn reason(&self) -> &'static str {
        reason_phrase(self.status)
    }

    /// Render as a small HTML error page
    pub fn to_html(&self) -> String {
        format!(
            "<HTML><HEAD><TITLE>{code} {reason}</TITLE></HEAD>\n<BODY BGCOLOR=\"#cc9999\"><H2>{code} {reason}</H2>\n{message}\n</BODY></HTML>\n",
            code = self.status,
            reason = self.reason(),
            message = escape_html(&self.message),
        )
    }
}

impl From<RuntimeError> for HttpError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Io(e) => HttpError::bad_request(e.to_string()),
            _ => HttpError::internal_error("The server encountered an unexpected condition."),
        }
    }
}

/// Canonical reason phrase for a status code, `"Unknown"` if none exists
pub fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
