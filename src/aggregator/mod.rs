//! Aggregator runtime
//!
//! Everything needed to manage external MCP servers and fan requests out to
//! them:
//! - [`registry`]: persisted server records + lifecycle orchestration
//! - [`session`]: live MCP client sessions (STDIO child processes, SSE/HTTP)
//! - [`router`]: unified dispatch over internal handlers and sessions
//! - [`health`]: per-server health loops

pub mod health;
pub mod registry;
pub mod router;
pub mod session;

pub use health::{HealthEvent, HealthMonitor};
pub use registry::{AggregatorError, RemovalReport, ServerRegistry, ServerView};
pub use router::{RequestRouter, RouteError};
pub use session::{SessionError, SessionHandle, SessionManager, SessionState};
