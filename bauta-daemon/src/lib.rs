#![forbid(unsafe_code)]

//! The Bauta daemon: everything that turns the leaf crates into a running
//! VPN node.
//!
//! The server owns an [`pool::IpPool`], a [`session::SessionTable`], and the
//! TUN demultiplexer; the client owns a single session. Both sides run the
//! same pair of packet pumps per session. All tasks hang off one root
//! [`tokio_util::sync::CancellationToken`]; the first terminal error a pump
//! reports cancels the session and teardown releases its address exactly
//! once.

pub mod client;
pub mod demux;
pub mod pool;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod signals;
pub mod telemetry;
