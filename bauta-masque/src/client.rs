//! Client-side session establishment.

use crate::connect::{self, SessionGrant};
use crate::{endpoint, DIAL_TIMEOUT, NEGOTIATE_TIMEOUT};
use bauta_core::{config::ClientConfig, Error, Result};
use tokio::time::timeout;
use tracing::info;

/// An established CONNECT-IP session, ready for the packet pumps.
///
/// The endpoint is kept alive here: dropping it would tear the connection
/// down underneath the pumps.
#[derive(Debug)]
pub struct EstablishedSession {
    /// Local QUIC endpoint.
    pub endpoint: quinn::Endpoint,
    /// The tunnel connection.
    pub connection: quinn::Connection,
    /// Write half of the tunnel stream.
    pub send: quinn::SendStream,
    /// Read half of the tunnel stream.
    pub recv: quinn::RecvStream,
    /// Assigned prefix and advertised routes.
    pub grant: SessionGrant,
}

/// Dial the server and negotiate CONNECT-IP.
///
/// Fails with `Connection` on dial/handshake problems and with `Protocol`
/// on any response other than 200.
pub async fn establish(cfg: &ClientConfig) -> Result<EstablishedSession> {
    let endpoint = endpoint::client(cfg)?;

    let connecting = endpoint
        .connect(cfg.server_addr, &cfg.server_name)
        .map_err(|e| Error::connection(format!("dial {}: {e}", cfg.server_addr)))?;
    let connection = timeout(DIAL_TIMEOUT, connecting)
        .await
        .map_err(|_| Error::connection("quic handshake timed out"))?
        .map_err(|e| Error::connection(format!("quic handshake: {e}")))?;

    let negotiated = timeout(NEGOTIATE_TIMEOUT, negotiate(&connection)).await;
    let (send, recv, grant) = match negotiated {
        Ok(result) => result?,
        Err(_) => return Err(Error::connection("connect-ip negotiation timed out")),
    };

    info!(
        assigned = %grant.assigned,
        routes = grant.routes.len(),
        "connect-ip session established"
    );
    Ok(EstablishedSession {
        endpoint,
        connection,
        send,
        recv,
        grant,
    })
}

async fn negotiate(
    connection: &quinn::Connection,
) -> Result<(quinn::SendStream, quinn::RecvStream, SessionGrant)> {
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::connection(format!("open stream: {e}")))?;

    connect::write_request(&mut send).await?;
    let status = connect::read_response(&mut recv).await?;
    if status != 200 {
        return Err(Error::protocol(format!(
            "connect-ip rejected with status {status}"
        )));
    }
    let grant = connect::read_grant(&mut recv).await?;
    Ok((send, recv, grant))
}
