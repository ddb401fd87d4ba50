//! PostgreSQL frontend/backend wire protocol engine for the herald proxy:
//! per-client sessions, the LISTEN/UNLISTEN mini parser, the notification
//! fan-out dispatcher, the upstream liveness gate, and the accept loop.

pub mod auth;
pub mod codec;
pub mod dispatch;
pub mod listen;
pub mod liveness;
pub mod parser;
pub mod query;
pub mod server;
pub mod session;
pub mod upstream;
