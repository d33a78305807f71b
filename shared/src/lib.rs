//! MCP Tunnel Shared Library
//!
//! Wire protocol, message bus abstraction and error types used by both the
//! relay (remote execution side) and the tunnel client.

pub mod bus;
pub mod error;
pub mod protocol;

pub use error::{Error, Rejection, Result};
