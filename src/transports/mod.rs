//! Transport implementations for the Snapper protocol.
//!
//! This module provides concrete [`Transport`](crate::Transport) and
//! [`Connector`](crate::Connector) implementations behind feature gates.
//! Enable the corresponding Cargo feature to pull in a transport:
//!
//! | Feature         | Transport        | Connector        |
//! |-----------------|------------------|------------------|
//! | `transport-tcp` | [`TcpTransport`] | [`TcpConnector`] |

#[cfg(feature = "transport-tcp")]
pub mod tcp;

#[cfg(feature = "transport-tcp")]
pub use tcp::{TcpConnector, TcpTransport};
