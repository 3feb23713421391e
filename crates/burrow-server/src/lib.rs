//! Server half of the burrow reverse-tunnel service.
//!
//! Two listeners cooperate: a TLS control port where clients register,
//! log in, establish tunnels and park worker connections, and a plain
//! TCP public port where visitor TLS connections are routed by SNI
//! onto those parked workers.

pub mod control;
pub mod pool;
pub mod public;
pub mod server;
pub mod sni;
pub mod token_store;

pub use control::{handle_control, ControlError, ServerState};
pub use pool::{ConnectionPool, PoolError, PooledConn, Session};
pub use server::{Server, ServerConfig, ServerError};
pub use sni::SniError;
pub use token_store::TokenStore;
