//! Utilities for integration tests.
//!
//! The centrepiece is [`MockDashboard`], an in-process websocket server
//! speaking the framed duplex protocol from the dashboard's side: it
//! authenticates new connections, acknowledges every message, answers the
//! host's calls from a scriptable response table, and lets tests drive the
//! host with calls of their own.

/// Boxed error type shared by test helpers.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

mod dashboard;

pub use dashboard::{MockDashboard, ReceivedCall, framed_socket};
