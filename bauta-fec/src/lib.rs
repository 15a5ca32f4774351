#![forbid(unsafe_code)]

//! XOR block forward-error-correction for the tunnel packet stream.
//!
//! The code is deliberately simple: packets are grouped into blocks of
//! `block_size`, and each block gains one redundancy packet carrying the
//! bytewise XOR of its members. That recovers at most one lost packet per
//! block, but it is addition-free, allocation-bounded, and fits an
//! MTU-constrained datagram tunnel. The codec knows nothing about QUIC, IP,
//! or TUN devices; sequence framing is the caller's concern.

pub mod xor;

pub use xor::{FecParams, XorCodec};

/// FEC error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Parameters outside the accepted ranges.
    #[error("invalid fec parameters: {0}")]
    InvalidParams(String),
}

/// Crate-local result alias.
pub type Result<T> = core::result::Result<T, Error>;
