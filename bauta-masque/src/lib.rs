#![forbid(unsafe_code)]

//! MASQUE CONNECT-IP session layer.
//!
//! The client dials a mutually-authenticated QUIC connection (ALPN `h3`),
//! issues a CONNECT-IP upgrade request at `/vpn` over a bidirectional
//! stream, and receives its assigned prefix plus advertised routes as a
//! control message. After negotiation the same stream carries discrete
//! tunnel packets; the framing for that phase lives in [`framing`].

pub mod client;
pub mod connect;
pub mod endpoint;
pub mod framing;
pub mod identity;
pub mod server;
pub mod tls;

use std::time::Duration;

/// QUIC dial/handshake deadline.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// CONNECT-IP negotiation deadline (request, response, grant).
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);
/// QUIC idle timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// QUIC keep-alive interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline on a single tunnel packet read.
pub const TUNNEL_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline on a single tunnel packet write.
pub const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub use client::{establish, EstablishedSession};
pub use connect::{ConnectRequest, ConnectResponse, SessionGrant};
