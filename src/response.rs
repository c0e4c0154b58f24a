//! Response facade handed to handlers
//!
//! Status and headers stay mutable until the first body byte or an explicit
//! flush commits them. The body may be written either as raw bytes through
//! [`Response::output_stream`] or as text through [`Response::writer`],
//! never both.

use crate::codec::{BoxedWriter, ServeOutputStream};
use crate::cookie::{Cookie, http_date};
use crate::error::{HttpError, RuntimeError, RuntimeResult, escape_html};
use chrono::{DateTime, Utc};
use std::io;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Unclaimed,
    Stream,
    Writer,
}

/// A response being produced by a handler
pub struct Response {
    out: ServeOutputStream<BoxedWriter>,
    mode: OutputMode,
}

impl Response {
    pub(crate) fn new(out: ServeOutputStream<BoxedWriter>) -> Self {
        Self {
            out,
            mode: OutputMode::Unclaimed,
        }
    }

    pub fn status(&self) -> u16 {
        self.out.head().status
    }

    /// Set the status code; ignored once committed
    pub fn set_status(&mut self, status: u16) {
        match self.out.head_mut() {
            Some(head) => {
                head.status = status;
                head.reason = None;
            }
            None => debug!(status, "set_status after commit ignored"),
        }
    }

    pub fn set_status_with_reason(&mut self, status: u16, reason: impl Into<String>) {
        if let Some(head) = self.out.head_mut() {
            head.status = status;
            head.reason = Some(reason.into());
        }
    }

    /// Replace a header; ignored once committed
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        match self.out.head_mut() {
            Some(head) => head.set_header(name, value),
            None => debug!(header = name, "set_header after commit ignored"),
        }
    }

    /// Add a value to a possibly multi-valued header
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        match self.out.head_mut() {
            Some(head) => head.add_header(name, value),
            None => debug!(header = name, "add_header after commit ignored"),
        }
    }

    pub fn set_int_header(&mut self, name: &str, value: i64) {
        self.set_header(name, value.to_string());
    }

    /// Set a header to an RFC 1123 date
    pub fn set_date_header(&mut self, name: &str, value: DateTime<Utc>) {
        self.set_header(name, http_date(value));
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.out.head().contains_header(name)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.out.head().header(name)
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.set_header("Content-Length", length.to_string());
    }

    /// Queue a cookie; each becomes its own `Set-Cookie` line
    pub fn add_cookie(&mut self, cookie: Cookie) {
        match self.out.head_mut() {
            Some(head) => head.add_cookie(cookie),
            None => debug!(cookie = %cookie.name, "add_cookie after commit ignored"),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.out.is_committed()
    }

    /// Body bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.out.bytes_written()
    }

    /// Commit the headers and flush whatever has been written
    pub async fn flush_buffer(&mut self) -> io::Result<()> {
        self.out.flush().await
    }

    fn claim(&mut self, wanted: OutputMode) -> RuntimeResult<()> {
        match self.mode {
            OutputMode::Unclaimed => {
                self.mode = wanted;
                Ok(())
            }
            current if current == wanted => Ok(()),
            OutputMode::Stream => Err(RuntimeError::illegal_state(
                "output stream already obtained for this response",
            )),
            OutputMode::Writer => Err(RuntimeError::illegal_state(
                "writer already obtained for this response",
            )),
        }
    }

    /// Raw byte access to the body
    pub fn output_stream(&mut self) -> RuntimeResult<&mut ServeOutputStream<BoxedWriter>> {
        self.claim(OutputMode::Stream)?;
        Ok(&mut self.out)
    }

    /// Text access to the body, UTF-8 encoded
    pub fn writer(&mut self) -> RuntimeResult<ResponseWriter<'_>> {
        self.claim(OutputMode::Writer)?;
        if let Some(head) = self.out.head_mut() {
            if let Some(ct) = head.header("Content-Type") {
                if ct.starts_with("text/") && !ct.contains("charset") {
                    head.set_header("Content-Type", format!("{ct}; charset=utf-8"));
                }
            }
        }
        Ok(ResponseWriter { out: &mut self.out })
    }

    /// Send an HTML error page
    ///
    /// Fails with an illegal-state error once the response is committed.
    pub async fn send_error(&mut self, status: u16, message: &str) -> RuntimeResult<()> {
        if self.is_committed() {
            return Err(RuntimeError::illegal_state(format!(
                "cannot send error {status}: response already committed"
            )));
        }
        let page = HttpError::new(status, message).to_html();
        if let Some(head) = self.out.head_mut() {
            head.status = status;
            head.reason = None;
            head.remove_header("Transfer-Encoding");
            head.set_header("Content-Type", "text/html; charset=utf-8");
            head.set_header("Content-Length", page.len().to_string());
        }
        self.out.write(page.as_bytes()).await?;
        self.out.finish().await?;
        Ok(())
    }

    /// Redirect the client with a 302
    ///
    /// Fails with an illegal-state error once the response is committed.
    pub async fn send_redirect(&mut self, location: &str) -> RuntimeResult<()> {
        if self.is_committed() {
            return Err(RuntimeError::illegal_state(format!(
                "cannot redirect to {location}: response already committed"
            )));
        }
        let page = format!(
            "<HTML><HEAD><TITLE>Moved</TITLE></HEAD><BODY>Moved to <A HREF=\"{0}\">{0}</A></BODY></HTML>\n",
            escape_html(location)
        );
        if let Some(head) = self.out.head_mut() {
            head.status = 302;
            head.reason = None;
            head.set_header("Location", location);
            head.set_header("Content-Type", "text/html; charset=utf-8");
            head.set_header("Content-Length", page.len().to_string());
        }
        self.out.write(page.as_bytes()).await?;
        self.out.finish().await?;
        Ok(())
    }

    pub(crate) async fn send_continue(&mut self) -> io::Result<()> {
        self.out.write_interim(100).await
    }

    /// Commit headers, terminate the body and close the write side
    pub(crate) async fn close(&mut self) -> io::Result<()> {
        self.out.shutdown().await
    }
}

/// Text writer over the response body
pub struct ResponseWriter<'a> {
    out: &'a mut ServeOutputStream<BoxedWriter>,
}

impl ResponseWriter<'_> {
    pub async fn print(&mut self, text: impl AsRef<str>) -> io::Result<()> {
        self.out.write(text.as_ref().as_bytes()).await
    }

    pub async fn println(&mut self, text: impl AsRef<str>) -> io::Result<()> {
        let mut line = String::with_capacity(text.as_ref().len() + 2);
        line.push_str(text.as_ref());
        line.push_str("\r\n");
        self.out.write(line.as_bytes()).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.out.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ResponseHead;
    use tokio::io::AsyncReadExt;

    fn response(protocol: &str) -> (Response, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let out = ServeOutputStream::new(Box::new(server) as BoxedWriter, ResponseHead::new(protocol));
        (Response::new(out), client)
    }

    async fn wire(mut response: Response, mut client: tokio::io::DuplexStream) -> String {
        response.close().await.unwrap();
        drop(response);
        let mut text = String::new();
        client.read_to_string(&mut text).await.unwrap();
        text
    }

    #[tokio::test]
    async fn test_stream_and_writer_are_exclusive() {
        let (mut resp, _client) = response("HTTP/1.0");
        resp.output_stream().unwrap();
        assert!(resp.output_stream().is_ok());
        assert!(matches!(
            resp.writer(),
            Err(RuntimeError::IllegalState { .. })
        ));

        let (mut resp, _client) = response("HTTP/1.0");
        resp.writer().unwrap();
        assert!(matches!(
            resp.output_stream(),
            Err(RuntimeError::IllegalState { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_output() {
        let (mut resp, client) = response("HTTP/1.0");
        resp.set_content_type("text/plain");
        resp.add_cookie(Cookie::new("a", "1"));
        resp.add_cookie(Cookie::new("b", "2"));
        {
            let mut w = resp.writer().unwrap();
            w.println("hello").await.unwrap();
        }
        resp.set_status(500);
        let text = wire(resp, client).await;
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Set-Cookie: a=1\r\n"));
        assert!(text.contains("Set-Cookie: b=2\r\n"));
        assert!(text.ends_with("\r\n\r\nhello\r\n"));
    }

    #[tokio::test]
    async fn test_send_error_after_commit_is_illegal() {
        let (mut resp, _client) = response("HTTP/1.0");
        resp.output_stream().unwrap().write(b"partial").await.unwrap();
        let err = resp.send_error(500, "late").await.unwrap_err();
        assert!(matches!(err, RuntimeError::IllegalState { .. }));
        let err = resp.send_redirect("/elsewhere").await.unwrap_err();
        assert!(matches!(err, RuntimeError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_send_error_page() {
        let (mut resp, client) = response("HTTP/1.1");
        resp.send_error(404, "no such thing").await.unwrap();
        let text = wire(resp, client).await;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!text.contains("chunked"));
        assert!(text.contains("no such thing"));
    }

    #[tokio::test]
    async fn test_send_redirect() {
        let (mut resp, client) = response("HTTP/1.1");
        resp.send_redirect("/login").await.unwrap();
        let text = wire(resp, client).await;
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: /login\r\n"));
    }

    #[tokio::test]
    async fn test_custom_reason_and_int_header() {
        let (mut resp, client) = response("HTTP/1.0");
        resp.set_status_with_reason(299, "Fine");
        resp.set_int_header("X-Count", 3);
        let text = wire(resp, client).await;
        assert!(text.starts_with("HTTP/1.0 299 Fine\r\n"));
        assert!(text.contains("X-Count: 3\r\n"));
    }
}
