//! Output bandwidth throttling
//!
//! [`ThrottledWriter`] paces writes so the running average rate since the
//! writer was created stays under a bytes-per-second ceiling. Short bursts
//! go through; sustained output converges to the cap.

use crate::config::read_toml;
use crate::error::{RuntimeError, RuntimeResult};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::time::Sleep;
use tracing::debug;

/// Rate-limiting decorator around an async writer
///
/// A write that pushes the average over the cap completes only after the
/// pause it incurs has elapsed, so a single `write_all` is paced without a
/// following flush.
pub struct ThrottledWriter<W> {
    inner: W,
    max_bytes_per_second: u64,
    bytes_written: u64,
    started: Instant,
    pause: Option<Pin<Box<Sleep>>>,
    /// Bytes already handed to `inner`, reported once the pause is over
    pending: Option<usize>,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, max_bytes_per_second: u64) -> Self {
        Self {
            inner,
            max_bytes_per_second: max_bytes_per_second.max(1),
            bytes_written: 0,
            started: Instant::now(),
            pause: None,
            pending: None,
        }
    }

    pub fn max_bytes_per_second(&self) -> u64 {
        self.max_bytes_per_second
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Delay needed for the average rate to fall back under the cap
    fn required_pause(&self) -> Option<Duration> {
        let elapsed_ms = (self.started.elapsed().as_millis() as u64).max(1);
        let needed_ms = self.bytes_written.saturating_mul(1000) / self.max_bytes_per_second;
        (needed_ms > elapsed_ms).then(|| Duration::from_millis(needed_ms - elapsed_ms))
    }

    fn record(&mut self, n: usize) {
        self.bytes_written += n as u64;
        if let Some(delay) = self.required_pause() {
            self.pause = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }

    fn poll_pause(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(pause) = self.pause.as_mut() {
            ready!(pause.as_mut().poll(cx));
            self.pause = None;
        }
        Poll::Ready(())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.is_none() {
            ready!(this.poll_pause(cx));
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
            this.record(n);
            this.pending = Some(n);
        }
        ready!(this.poll_pause(cx));
        Poll::Ready(Ok(this.pending.take().unwrap_or(0)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pause(cx));
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pause(cx));
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// A wildcard pattern with its rate ceiling
#[derive(Debug, Clone)]
pub struct ThrottleRule {
    pub pattern: glob::Pattern,
    pub max_bytes_per_second: u64,
}

/// Ordered throttle rules; the first matching pattern wins
#[derive(Debug, Clone, Default)]
pub struct ThrottleTable {
    rules: Vec<ThrottleRule>,
}

#[derive(Debug, Deserialize)]
struct ThrottlesFile {
    #[serde(default)]
    throttle: Vec<ThrottleEntry>,
}

#[derive(Debug, Deserialize)]
struct ThrottleEntry {
    pattern: String,
    max_bytes_per_second: u64,
}

impl ThrottleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; `pattern` uses `*`, `?` and `[...]` wildcards
    pub fn add(&mut self, pattern: &str, max_bytes_per_second: u64) -> RuntimeResult<()> {
        if max_bytes_per_second == 0 {
            return Err(RuntimeError::config(format!(
                "throttle for {pattern} must allow at least one byte per second"
            )));
        }
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| RuntimeError::config(format!("bad throttle pattern {pattern}: {e}")))?;
        self.rules.push(ThrottleRule {
            pattern,
            max_bytes_per_second,
        });
        Ok(())
    }

    /// Load rules from a TOML file of `[[throttle]]` tables
    pub fn load(path: &Path) -> RuntimeResult<Self> {
        let file: ThrottlesFile = read_toml(path)?;
        let mut table = Self::new();
        for entry in file.throttle {
            table.add(&entry.pattern, entry.max_bytes_per_second)?;
        }
        debug!(rules = table.len(), path = %path.display(), "Loaded throttle rules");
        Ok(table)
    }

    /// Ceiling for `path`, if any rule matches
    pub fn lookup(&self, path: &str) -> Option<u64> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(path))
            .map(|rule| rule.max_bytes_per_second)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
