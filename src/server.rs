//! Listener and server lifecycle
//!
//! [`Server`] collects handlers, realms, throttles and aliases. [`Server::bind`]
//! loads the side files, restores persisted sessions and opens the listening
//! socket. [`BoundServer::serve`] accepts connections until its shutdown
//! future resolves, then drains in-flight connections and saves sessions.

use crate::alias::AliasTable;
use crate::auth::{Realm, RealmTable};
use crate::config::ServerConfig;
use crate::connection::ServeConnection;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handler::{Handler, HandlerEntry, NotFoundHandler};
use crate::router::PathTreeDictionary;
use crate::session::{
    SharedSessionStore, create_session_store, restore_or_start_empty, spawn_sweeper,
};
use crate::throttle::ThrottleTable;
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::signal;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Byte stream a connection is served over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Turns an accepted TCP stream into the stream requests are read from
///
/// The default [`PlainAcceptor`] passes the socket through. A TLS acceptor
/// would perform its handshake here.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream>;
}

/// Serves plain TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainAcceptor;

#[async_trait]
impl Acceptor for PlainAcceptor {
    async fn accept(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Tables shared by every connection
pub(crate) struct ServerState {
    pub config: ServerConfig,
    pub handlers: PathTreeDictionary<HandlerEntry>,
    pub realms: RealmTable,
    pub throttles: ThrottleTable,
    pub aliases: Arc<AliasTable>,
    pub sessions: SharedSessionStore,
}

/// An unstarted server
pub struct Server {
    config: ServerConfig,
    handlers: PathTreeDictionary<HandlerEntry>,
    realms: Vec<(String, Arc<Realm>)>,
    throttles: Vec<(String, u64)>,
    aliases: Vec<(String, PathBuf)>,
    acceptor: Arc<dyn Acceptor>,
    sessions: SharedSessionStore,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = create_session_store(config.session_config());
        Self {
            config,
            handlers: PathTreeDictionary::new(),
            realms: Vec::new(),
            throttles: Vec::new(),
            aliases: Vec::new(),
            acceptor: Arc::new(PlainAcceptor),
            sessions,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind `handler` to `pattern`
    pub fn handler(mut self, pattern: &str, handler: impl Handler) -> Self {
        self.add_handler(pattern, Arc::new(handler));
        self
    }

    /// Bind `handler` to `pattern`, returning whatever was bound there before
    pub fn add_handler(&mut self, pattern: &str, handler: Arc<dyn Handler>) -> Option<HandlerEntry> {
        let entry = HandlerEntry::new(pattern, handler);
        debug!(pattern, single_threaded = entry.is_single_threaded(), "Registered handler");
        self.handlers.insert(pattern, entry)
    }

    /// Require credentials from `realm` for `path` and everything under it
    pub fn protect(mut self, path: &str, realm: Arc<Realm>) -> Self {
        self.realms.push((path.to_string(), realm));
        self
    }

    /// Cap responses for paths matching `pattern`
    pub fn throttle(mut self, pattern: &str, max_bytes_per_second: u64) -> Self {
        self.throttles.push((pattern.to_string(), max_bytes_per_second));
        self
    }

    /// Map URL prefix `prefix` onto directory `dir`
    pub fn alias(mut self, prefix: &str, dir: impl Into<PathBuf>) -> Self {
        self.aliases.push((prefix.to_string(), dir.into()));
        self
    }

    pub fn with_acceptor(mut self, acceptor: impl Acceptor) -> Self {
        self.acceptor = Arc::new(acceptor);
        self
    }

    /// The session store connections will use
    pub fn sessions(&self) -> SharedSessionStore {
        Arc::clone(&self.sessions)
    }

    /// Load side files, restore sessions and open the listening socket
    pub async fn bind(self) -> RuntimeResult<BoundServer> {
        let Server {
            config,
            mut handlers,
            realms: extra_realms,
            throttles: extra_throttles,
            aliases: extra_aliases,
            acceptor,
            sessions,
        } = self;

        let mut realms = match &config.realms_file {
            Some(path) => RealmTable::load(path)?,
            None => RealmTable::new(),
        };
        for (path, realm) in extra_realms {
            realms.protect(&path, realm);
        }

        let mut throttles = match &config.throttles_file {
            Some(path) => ThrottleTable::load(path)?,
            None => ThrottleTable::new(),
        };
        for (pattern, rate) in extra_throttles {
            throttles.add(&pattern, rate)?;
        }

        let mut aliases = match &config.aliases_file {
            Some(path) => AliasTable::load(path)?,
            None => AliasTable::new(),
        };
        for (prefix, dir) in extra_aliases {
            aliases.add(&prefix, dir);
        }

        if let Some(cgi) = &config.cgi_path {
            info!(cgi_path = %cgi, "CGI path configured; CGI programs are not executed by this server");
        }

        if config.persist_sessions {
            restore_or_start_empty(&sessions, &config.session_file()).await;
        }

        if handlers.get("/").is_none() {
            handlers.insert("/", HandlerEntry::new("/", Arc::new(NotFoundHandler)));
        }

        let listener = open_listener(&config).await?;
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            handlers = handlers.len(),
            realms = realms.len(),
            throttles = throttles.len(),
            sessions = sessions.len(),
            "Server listening"
        );

        Ok(BoundServer {
            listener,
            local_addr,
            acceptor,
            state: Arc::new(ServerState {
                config,
                handlers,
                realms,
                throttles,
                aliases: Arc::new(aliases),
                sessions,
            }),
        })
    }
}

async fn open_listener(config: &ServerConfig) -> RuntimeResult<TcpListener> {
    let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            RuntimeError::server_with_source(format!("cannot resolve {}", config.host), e.into())
        })?
        .next()
        .ok_or_else(|| RuntimeError::server(format!("no address for {}", config.host)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .map_err(|e| RuntimeError::server_with_source(format!("cannot bind {addr}"), e.into()))?;
    Ok(socket.listen(config.backlog)?)
}

/// A server with an open listening socket
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: Arc<dyn Acceptor>,
    state: Arc<ServerState>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> SharedSessionStore {
        Arc::clone(&self.state.sessions)
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> RuntimeResult<()> {
        self.serve(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves
    ///
    /// On shutdown the listener is closed first, in-flight connections get
    /// `drain_timeout` to finish and are then aborted, the session sweeper
    /// stops and sessions are saved if persistence is on.
    pub async fn serve<F>(self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let BoundServer {
            listener,
            local_addr,
            acceptor,
            state,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = if state.sessions.config().reap {
            Some(spawn_sweeper(
                Arc::clone(&state.sessions),
                state.sessions.config().sweep_interval,
                shutdown_rx,
            ))
        } else {
            debug!("Negative session timeout, idle sessions are kept");
            None
        };
        let limit = Arc::new(Semaphore::new(state.config.max_connections));
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            while let Some(finished) = connections.try_join_next() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "Connection task panicked");
                    }
                }
            }

            // Backpressure: wait for a slot before accepting
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            debug!(
                peer_addr = %peer,
                available_permits = limit.available_permits(),
                "Connection accepted"
            );

            let acceptor = Arc::clone(&acceptor);
            let state = Arc::clone(&state);
            connections.spawn(async move {
                let _permit = permit;
                let local = stream.local_addr().ok();
                match acceptor.accept(stream).await {
                    Ok(stream) => {
                        ServeConnection::new(state, Some(peer), local)
                            .serve(stream)
                            .await
                    }
                    Err(e) => debug!(peer_addr = %peer, error = %e, "Acceptor rejected connection"),
                }
            });
        }

        drop(listener);
        info!(address = %local_addr, in_flight = connections.len(), "Listener closed, draining connections");
        let _ = shutdown_tx.send(true);

        let drained = tokio::time::timeout(state.config.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(remaining = connections.len(), "Drain timeout elapsed, aborting connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!(error = %e, "Session sweeper ended abnormally");
            }
        }

        if state.config.persist_sessions {
            let path = state.config.session_file();
            match state.sessions.save(&path).await {
                Ok(saved) => info!(sessions = saved, path = %path.display(), "Sessions saved"),
                Err(e) => error!(path = %path.display(), error = %e, "Could not save sessions"),
            }
        }

        info!("Server shut down gracefully");
        Ok(())
    }
}

/// Bind and serve `server` until a termination signal
pub async fn start_server(server: Server) -> RuntimeResult<()> {
    server.bind().await?.run().await
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received termination signal, shutting down...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_session_dir(dir)
    }

    #[tokio::test]
    async fn test_bind_registers_not_found_handler() {
        let dir = tempfile::tempdir().unwrap();
        let bound = Server::new(config(dir.path())).bind().await.unwrap();
        assert_ne!(bound.local_addr().port(), 0);
        assert!(bound.state.handlers.get("/").is_some());
    }

    #[tokio::test]
    async fn test_bad_throttle_rule_fails_bind() {
        let dir = tempfile::tempdir().unwrap();
        let result = Server::new(config(dir.path())).throttle("/slow/*", 0).bind().await;
        assert!(matches!(result, Err(RuntimeError::Config { .. })));
    }

    #[tokio::test]
    async fn test_missing_realms_file_fails_bind() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_realms_file(dir.path().join("absent.toml"));
        assert!(Server::new(config).bind().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_saves_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(config(dir.path()));
        let sessions = server.sessions();
        let bound = server.bind().await.unwrap();
        let file = bound.state.config.session_file();
        sessions.create();

        bound.serve(async {}).await.unwrap();
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_negative_timeout_serves_without_sweeper() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path())
            .with_session_timeout_minutes(-1)
            .with_sweep_interval(Duration::from_secs(1));
        let server = Server::new(config);
        let sessions = server.sessions();
        let bound = server.bind().await.unwrap();
        let file = bound.state.config.session_file();
        let kept = sessions.create();
        kept.touch(chrono::Utc::now() - chrono::Duration::minutes(10));

        bound
            .serve(tokio::time::sleep(Duration::from_millis(1500)))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);

        let restored = crate::session::SessionStore::new(sessions.config().clone());
        assert_eq!(restored.load(&file).await.unwrap(), 1);
    }
}
