//! Connection I/O codecs
//!
//! [`ServeInputStream`] reads the request line, headers and body of one
//! request, decoding chunked transfer coding when enabled.
//! [`ServeOutputStream`] holds the response status and headers and writes
//! them lazily, right before the first body byte or on an explicit flush.

use crate::cookie::{Cookie, SessionCookieSlot};
use bytes::{BufMut, BytesMut};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

/// Boxed read half of a connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Longest request line accepted before answering 414
pub const MAX_REQUEST_LINE: usize = 4096;

/// Longest header or chunk-size line accepted
pub const MAX_HEADER_LINE: usize = 8192;

const READ_BUFFER_SIZE: usize = 8192;

/// Outcome of reading one protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Text(String),
    TooLong,
    Eof,
}

pub(crate) async fn with_deadline<T>(
    limit: Option<Duration>,
    operation: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socket operation timed out"))?,
        None => operation.await,
    }
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Request-side reader with line parsing and chunk decoding
pub struct ServeInputStream<R> {
    reader: BufReader<R>,
    /// Byte pushed back after a bare CR on the raw stream
    pushback: Option<u8>,
    /// Byte pushed back after a bare CR in a body line
    body_pushback: Option<u8>,
    chunking: bool,
    chunk_remaining: usize,
    /// A chunk's data has been consumed and its CRLF is still unread
    chunk_crlf_pending: bool,
    /// Bytes of a `Content-Length` body still unread; `None` reads to EOF
    limit: Option<u64>,
    body_done: bool,
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> ServeInputStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            pushback: None,
            body_pushback: None,
            chunking: false,
            chunk_remaining: 0,
            chunk_crlf_pending: false,
            limit: None,
            body_done: false,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enable or disable chunked decoding of the body
    pub fn set_chunking(&mut self, chunking: bool) {
        self.chunking = chunking;
        self.chunk_remaining = 0;
        self.chunk_crlf_pending = false;
        self.body_done = false;
    }

    pub fn is_chunking(&self) -> bool {
        self.chunking
    }

    /// Bound the non-chunked body to `limit` bytes
    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
        self.body_done = false;
    }

    async fn raw_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(byte) = self.pushback.take() {
            return Ok(Some(byte));
        }
        let mut byte = [0u8; 1];
        let n = with_deadline(self.read_timeout, self.reader.read(&mut byte)).await?;
        Ok((n == 1).then_some(byte[0]))
    }

    async fn raw_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(byte) = self.pushback.take() {
            buf[0] = byte;
            return Ok(1);
        }
        with_deadline(self.read_timeout, self.reader.read(buf)).await
    }

    /// Read one protocol line, accepting LF, CRLF or a bare CR as terminator
    ///
    /// Bytes are mapped one-to-one to chars (ISO-8859-1).
    pub async fn read_protocol_line(&mut self, max_len: usize) -> io::Result<Line> {
        let mut line = Vec::new();
        loop {
            match self.raw_byte().await? {
                None if line.is_empty() => return Ok(Line::Eof),
                None | Some(b'\n') => break,
                Some(b'\r') => {
                    match self.raw_byte().await? {
                        Some(b'\n') | None => {}
                        Some(other) => self.pushback = Some(other),
                    }
                    break;
                }
                Some(byte) => {
                    if line.len() >= max_len {
                        return Ok(Line::TooLong);
                    }
                    line.push(byte);
                }
            }
        }
        Ok(Line::Text(line.iter().map(|&b| b as char).collect()))
    }

    async fn read_chunk_size(&mut self) -> io::Result<usize> {
        let line = match self.read_protocol_line(MAX_HEADER_LINE).await? {
            Line::Text(line) => line,
            Line::TooLong => return Err(invalid_data("chunk size line too long")),
            Line::Eof => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunk size",
                ));
            }
        };
        let token = line.split(';').next().unwrap_or("").trim();
        if token.is_empty() {
            return Err(invalid_data("empty chunk size"));
        }
        usize::from_str_radix(token, 16)
            .map_err(|_| invalid_data(format!("bad chunk size: {token}")))
    }

    /// Consume the CRLF that terminates a chunk's data
    async fn read_chunk_terminator(&mut self) -> io::Result<()> {
        match self.raw_byte().await? {
            Some(b'\n') => Ok(()),
            Some(b'\r') => match self.raw_byte().await? {
                Some(b'\n') => Ok(()),
                _ => Err(invalid_data("malformed chunk framing: CR without LF")),
            },
            Some(other) => Err(invalid_data(format!(
                "malformed chunk framing: expected CRLF after chunk data, got 0x{other:02x}"
            ))),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            )),
        }
    }

    async fn read_trailers(&mut self) -> io::Result<()> {
        loop {
            match self.read_protocol_line(MAX_HEADER_LINE).await? {
                Line::Text(line) if line.is_empty() => return Ok(()),
                Line::Text(line) => trace!(trailer = %line, "ignoring chunked trailer"),
                Line::TooLong => return Err(invalid_data("trailer line too long")),
                Line::Eof => return Ok(()),
            }
        }
    }

    /// Read body bytes, returning 0 at the end of the body
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.body_pushback.take() {
            buf[0] = byte;
            return Ok(1);
        }
        if self.body_done {
            return Ok(0);
        }

        if self.chunking {
            if self.chunk_remaining == 0 {
                if self.chunk_crlf_pending {
                    self.read_chunk_terminator().await?;
                    self.chunk_crlf_pending = false;
                }
                let size = self.read_chunk_size().await?;
                if size == 0 {
                    self.read_trailers().await?;
                    self.body_done = true;
                    return Ok(0);
                }
                self.chunk_remaining = size;
            }

            let want = buf.len().min(self.chunk_remaining);
            let n = self.raw_read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside chunk",
                ));
            }
            self.chunk_remaining -= n;
            if self.chunk_remaining == 0 {
                self.chunk_crlf_pending = true;
            }
            return Ok(n);
        }

        let want = match self.limit {
            Some(0) => {
                self.body_done = true;
                return Ok(0);
            }
            Some(remaining) => buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        let n = self.raw_read(&mut buf[..want]).await?;
        match self.limit.as_mut() {
            Some(remaining) if n == 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed with {remaining} body bytes outstanding"),
                ));
            }
            Some(remaining) => *remaining -= n as u64,
            None if n == 0 => self.body_done = true,
            None => {}
        }
        Ok(n)
    }

    async fn read_body_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = self.read(&mut byte).await?;
        Ok((n == 1).then_some(byte[0]))
    }

    /// Read one line of the body, without its terminator
    ///
    /// Returns `None` at the end of the body.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = Vec::new();
        loop {
            match self.read_body_byte().await? {
                None if line.is_empty() => return Ok(None),
                None | Some(b'\n') => break,
                Some(b'\r') => {
                    match self.read_body_byte().await? {
                        Some(b'\n') | None => {}
                        Some(other) => self.body_pushback = Some(other),
                    }
                    break;
                }
                Some(byte) => line.push(byte),
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Read the remaining body into `out`
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }
}

/// Whether the status line and headers have gone out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    NotSent,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Raw,
    Chunked,
}

/// Status line and headers of a response, mutable until committed
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub protocol: String,
    pub status: u16,
    pub reason: Option<String>,
    headers: Vec<(String, Vec<String>)>,
    cookies: Vec<Cookie>,
}

impl ResponseHead {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            status: 200,
            reason: None,
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    /// Replace all values of a header
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(idx) => self.headers[idx].1 = vec![value.into()],
            None => self.headers.push((name.to_string(), vec![value.into()])),
        }
    }

    /// Append a value to a header
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        match self.position(name) {
            Some(idx) => self.headers[idx].1.push(value.into()),
            None => self.headers.push((name.to_string(), vec![value.into()])),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        if let Some(idx) = self.position(name) {
            self.headers.remove(idx);
        }
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// All values of a header, comma-joined
    pub fn header(&self, name: &str) -> Option<String> {
        self.position(name).map(|idx| self.headers[idx].1.join(", "))
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Reason phrase sent on the status line
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| crate::error::reason_phrase(self.status))
    }

    /// Serialize the status line, headers and the blank line
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(
            format!("{} {} {}\r\n", self.protocol, self.status, self.reason_phrase()).as_bytes(),
        );
        for (name, values) in &self.headers {
            if name.eq_ignore_ascii_case("set-cookie") {
                for value in values {
                    out.put_slice(format!("{name}: {value}\r\n").as_bytes());
                }
            } else {
                out.put_slice(format!("{}: {}\r\n", name, values.join(", ")).as_bytes());
            }
        }
        for cookie in &self.cookies {
            out.put_slice(format!("Set-Cookie: {}\r\n", cookie.to_set_cookie()).as_bytes());
        }
        out.put_slice(b"\r\n");
    }
}

/// Response-side writer with lazy header flush and chunked encoding
pub struct ServeOutputStream<W> {
    inner: W,
    head: ResponseHead,
    state: HeaderState,
    framing: Framing,
    /// Body bytes are discarded (HEAD, 204, 304)
    body_allowed: bool,
    /// Chunked coding may be chosen at commit time
    chunking_allowed: bool,
    session_cookie: SessionCookieSlot,
    closed: bool,
    bytes_written: u64,
    write_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> ServeOutputStream<W> {
    pub fn new(inner: W, head: ResponseHead) -> Self {
        let chunking_allowed = head.protocol == "HTTP/1.1";
        Self {
            inner,
            head,
            state: HeaderState::NotSent,
            framing: Framing::Raw,
            body_allowed: true,
            chunking_allowed,
            session_cookie: SessionCookieSlot::new(),
            closed: false,
            bytes_written: 0,
            write_timeout: None,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_session_cookie(mut self, slot: SessionCookieSlot) -> Self {
        self.session_cookie = slot;
        self
    }

    /// Discard body bytes, e.g. for HEAD requests
    pub fn suppress_body(&mut self) {
        self.body_allowed = false;
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Mutable access to status and headers, `None` once committed
    pub fn head_mut(&mut self) -> Option<&mut ResponseHead> {
        match self.state {
            HeaderState::NotSent => Some(&mut self.head),
            HeaderState::Sent => None,
        }
    }

    pub fn state(&self) -> HeaderState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.state == HeaderState::Sent
    }

    pub fn is_chunked(&self) -> bool {
        self.framing == Framing::Chunked
    }

    /// Body bytes handed to `write` so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        with_deadline(self.write_timeout, self.inner.write_all(data)).await
    }

    /// Send an interim `1xx` response; only valid before commit
    pub async fn write_interim(&mut self, status: u16) -> io::Result<()> {
        if self.is_committed() {
            return Err(io::Error::other("interim response after commit"));
        }
        let line = format!(
            "{} {} {}\r\n\r\n",
            self.head.protocol,
            status,
            crate::error::reason_phrase(status)
        );
        self.write_raw(line.as_bytes()).await?;
        with_deadline(self.write_timeout, self.inner.flush()).await
    }

    /// Send the status line and headers if they have not gone out yet
    pub async fn commit(&mut self) -> io::Result<()> {
        if self.state == HeaderState::Sent {
            return Ok(());
        }
        if !(200..=999).contains(&self.head.status)
            || self.head.status == 204
            || self.head.status == 304
        {
            self.body_allowed = false;
        }
        if self.body_allowed
            && self.chunking_allowed
            && !self.head.contains_header("Content-Length")
        {
            self.head.set_header("Transfer-Encoding", "chunked");
            self.framing = Framing::Chunked;
        }
        if let Some(cookie) = self.session_cookie.commit() {
            self.head.add_cookie(cookie);
        }

        let mut encoded = BytesMut::with_capacity(256);
        self.head.encode(&mut encoded);
        self.state = HeaderState::Sent;
        trace!(status = self.head.status, chunked = self.is_chunked(), "headers flushed");
        self.write_raw(&encoded).await
    }

    /// Write body bytes, committing the headers first
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response output already closed",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.commit().await?;
        self.bytes_written += data.len() as u64;
        if !self.body_allowed {
            return Ok(());
        }

        match self.framing {
            Framing::Raw => self.write_raw(data).await,
            Framing::Chunked => {
                let mut frame = BytesMut::with_capacity(data.len() + 12);
                frame.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
                frame.put_slice(data);
                frame.put_slice(b"\r\n");
                self.write_raw(&frame).await
            }
        }
    }

    /// Commit headers and push buffered bytes to the socket
    pub async fn flush(&mut self) -> io::Result<()> {
        self.commit().await?;
        with_deadline(self.write_timeout, self.inner.flush()).await
    }

    /// Terminate the body; later writes fail
    pub async fn finish(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.commit().await?;
        self.closed = true;
        if self.framing == Framing::Chunked && self.body_allowed {
            self.write_raw(b"0\r\n\r\n").await?;
        }
        with_deadline(self.write_timeout, self.inner.flush()).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Finish the body and shut down the write side of the connection
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.finish().await?;
        with_deadline(self.write_timeout, self.inner.shutdown()).await
    }
}
