//! Request handlers
//!
//! A [`Handler`] is bound to a path pattern and receives every request whose
//! path has that pattern as its longest registered prefix.

use crate::error::RuntimeResult;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Request-processing logic bound to a URL path pattern
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: &mut Request, response: &mut Response) -> RuntimeResult<()>;

    /// Serialize invocations of this handler instance across requests
    fn single_threaded(&self) -> bool {
        false
    }
}

/// Handler built from a closure returning a boxed future
pub struct FnHandler<F> {
    f: F,
    single_threaded: bool,
}

impl<F> FnHandler<F> {
    /// Serialize invocations of this handler
    pub fn serialized(mut self) -> Self {
        self.single_threaded = true;
        self
    }
}

/// Wrap a closure as a [`Handler`]
///
/// ```rust,no_run
/// use tinyserve::handler_fn;
///
/// let hello = handler_fn(|_req, resp| {
///     Box::pin(async move {
///         resp.set_content_type("text/plain");
///         resp.writer()?.print("hello").await?;
///         Ok(())
///     })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, RuntimeResult<()>>
        + Send
        + Sync
        + 'static,
{
    FnHandler {
        f,
        single_threaded: false,
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, RuntimeResult<()>>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, request: &mut Request, response: &mut Response) -> RuntimeResult<()> {
        (self.f)(request, response).await
    }

    fn single_threaded(&self) -> bool {
        self.single_threaded
    }
}

/// Catch-all registered at `/` when nothing else is
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn handle(&self, request: &mut Request, response: &mut Response) -> RuntimeResult<()> {
        let message = format!("{} was not found on this server.", request.path());
        response.send_error(404, &message).await
    }
}

/// A handler bound into the registry
#[derive(Clone)]
pub struct HandlerEntry {
    pattern: String,
    handler: Arc<dyn Handler>,
    /// Present for single-threaded handlers
    serial: Option<Arc<TokioMutex<()>>>,
}

impl HandlerEntry {
    pub fn new(pattern: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let serial = handler
            .single_threaded()
            .then(|| Arc::new(TokioMutex::new(())));
        Self {
            pattern: pattern.into(),
            handler,
            serial,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_single_threaded(&self) -> bool {
        self.serial.is_some()
    }

    /// Run the handler, holding this entry's lock if it is single-threaded
    pub async fn invoke(&self, request: &mut Request, response: &mut Response) -> RuntimeResult<()> {
        let _guard = match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        self.handler.handle(request, response).await
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("pattern", &self.pattern)
            .field("single_threaded", &self.is_single_threaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Serial;

    #[async_trait]
    impl Handler for Serial {
        async fn handle(&self, _request: &mut Request, _response: &mut Response) -> RuntimeResult<()> {
            Ok(())
        }

        fn single_threaded(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_entry_single_threaded_flag() {
        let entry = HandlerEntry::new("/serial", Arc::new(Serial));
        assert!(entry.is_single_threaded());
        assert_eq!(entry.pattern(), "/serial");

        let entry = HandlerEntry::new("/", Arc::new(NotFoundHandler));
        assert!(!entry.is_single_threaded());
    }

    #[test]
    fn test_fn_handler_single_threaded() {
        let handler = handler_fn(|_req, _resp| Box::pin(async move { Ok(()) })).serialized();
        assert!(Handler::single_threaded(&handler));
    }
}
