//! tinyserve
//!
//! A small embeddable HTTP/1.0 and HTTP/1.1 server for servlet-style handlers.
//!
//! # Overview
//!
//! tinyserve accepts connections, parses one request per connection and hands
//! it to the handler bound to the longest matching path prefix. It provides:
//!
//! - **Routing**: a path-segment trie with longest-prefix lookup and path info
//! - **Codecs**: chunked request decoding and lazily committed, optionally
//!   chunked responses
//! - **Sessions**: cookie-tracked sessions with expiry sweeps and persistence
//!   across restarts
//! - **Basic auth**: realms guarding path prefixes
//! - **Throttling**: per-path output rate ceilings
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Listener   │──► Semaphore-bounded accept, graceful drain
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ Connection  │──► Request line, headers, body framing
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │Router/Realms│──► Longest prefix match, Basic auth challenge
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │   Handler   │──► Request/Response facades, sessions
//! └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use tinyserve::{Server, ServerConfig, handler_fn};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default().with_port(3000);
//!     let server = Server::new(config).handler(
//!         "/hello",
//!         handler_fn(|req, resp| {
//!             Box::pin(async move {
//!                 let name = req.parameter("name").unwrap_or("world").to_string();
//!                 resp.set_content_type("text/plain");
//!                 resp.writer()?.println(format!("hello {name}")).await?;
//!                 Ok(())
//!             })
//!         }),
//!     );
//!
//!     server.bind().await.unwrap().run().await.unwrap();
//! }
//! ```

pub mod alias;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod cookie;
pub mod error;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod throttle;

// Re-exports for convenience
pub use alias::AliasTable;
pub use auth::{Realm, RealmTable};
pub use codec::{HeaderState, ServeInputStream, ServeOutputStream};
pub use config::ServerConfig;
pub use connection::ConnectionState;
pub use cookie::Cookie;
pub use error::{HttpError, RuntimeError, RuntimeResult};
pub use handler::{FnHandler, Handler, NotFoundHandler, handler_fn};
pub use request::Request;
pub use response::{Response, ResponseWriter};
pub use router::{PathMatch, PathTreeDictionary};
pub use server::{Acceptor, BoundServer, PlainAcceptor, Server, shutdown_signal, start_server};
pub use session::{
    Session, SessionBindingListener, SessionConfig, SessionStore, SharedSessionStore,
    create_session_store,
};
pub use throttle::{ThrottleTable, ThrottledWriter};

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name
pub const NAME: &str = "tinyserve";

/// Value of the `Server` response header
pub fn server_signature() -> String {
    format!("{}/{}", NAME, VERSION)
}
