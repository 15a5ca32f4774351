//! Server-side negotiation primitives.
//!
//! The daemon owns the resources a verdict depends on (registry, pool,
//! session table); this module only speaks the wire protocol, so it stays
//! testable over any byte stream.

use crate::connect::{self, ConnectRequest, ConnectResponse, SessionGrant};
use crate::NEGOTIATE_TIMEOUT;
use bauta_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

pub use crate::endpoint::server as server_endpoint;

/// Read the CONNECT-IP request within the negotiation deadline.
pub async fn read_connect<R: AsyncRead + Unpin>(recv: &mut R) -> Result<ConnectRequest> {
    timeout(NEGOTIATE_TIMEOUT, connect::read_request(recv))
        .await
        .map_err(|_| Error::protocol("connect-ip request timed out"))?
}

/// Validate the request shape: CONNECT on `/vpn` with the MASQUE markers.
pub fn validate(request: &ConnectRequest) -> std::result::Result<(), ConnectResponse> {
    if request.path != connect::CONNECT_PATH {
        return Err(ConnectResponse::BadRequest);
    }
    if request.method != "CONNECT" || !request.is_masque() {
        return Err(ConnectResponse::BadRequest);
    }
    Ok(())
}

/// Send a verdict.
pub async fn respond<W: AsyncWrite + Unpin>(send: &mut W, verdict: ConnectResponse) -> Result<()> {
    connect::write_response(send, verdict).await
}

/// Send the grant that follows a 200.
pub async fn send_grant<W: AsyncWrite + Unpin>(send: &mut W, grant: &SessionGrant) -> Result<()> {
    connect::write_grant(send, grant).await
}
