//! sqlgate-proxy — the MySQL-protocol front door.
//!
//! # Architecture
//!
//! ```text
//! ProxyServer::run(shutdown)
//!   → build + prewarm admin and readonly pools    (Starting)
//!   → bind listener, spawn shutdown watcher       (Serving)
//!   → accept loop: one supervised task per socket
//!       → SessionHandler::handle(stream, ctx)
//!           → authenticate via CredentialStore
//!           → check out backend connections per statement route
//!   → stop signal: close listener                 (Draining)
//!   → drain both pools                            (Stopped)
//! ```
//!
//! A panic inside one session is contained to that session's task; the
//! accept loop and the other sessions keep running.

pub mod credentials;
pub mod error;
pub mod handler;
pub mod mysql;
pub mod server;
pub mod state;
pub mod supervise;
pub mod topology;

pub use credentials::CredentialStore;
pub use error::{ProxyError, SessionError, TopologyError};
pub use handler::{SessionContext, SessionHandler};
pub use mysql::{MysqlSessionHandler, Route, mysql_proxy};
pub use server::{ProxyServer, ServerHandle};
pub use state::ServerState;
pub use topology::TopologyInitializer;
