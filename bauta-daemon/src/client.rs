//! Client runtime: establish the session, configure the TUN, run the pumps
//! until the root context cancels or a pump reports a terminal error.

use crate::pump::{self, FecEncoder, TunnelWriter};
use bauta_core::{config::ClientConfig, Error, Result};
use bauta_fec::FecParams;
use bauta_masque::client::establish;
use bauta_tun::device::{TunDevice, TunOptions};
use bauta_tun::{netcfg, BufferPool, Tun};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pool depth for inbound packet buffers.
const RECV_POOL: usize = 64;

/// Backoff bounds for reconnect attempts.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Run sessions until the root context cancels, reconnecting with
/// exponential backoff when the tunnel drops. Configuration and system
/// failures are fatal and propagate immediately.
pub async fn run_with_backoff(cfg: ClientConfig, root: CancellationToken) -> Result<()> {
    let mut delay = BACKOFF_MIN;
    loop {
        match run(cfg.clone(), root.clone()).await {
            Ok(()) if root.is_cancelled() => return Ok(()),
            Ok(()) => {
                warn!("tunnel closed by peer, reconnecting in {delay:?}");
            }
            Err(err @ (Error::Config(_) | Error::System(_))) => return Err(err),
            Err(err) => {
                warn!("session failed: {err}, reconnecting in {delay:?}");
            }
        }
        tokio::select! {
            _ = root.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(BACKOFF_MAX);
    }
}

/// Connect, configure, and pump until shutdown.
pub async fn run(cfg: ClientConfig, root: CancellationToken) -> Result<()> {
    let session = establish(&cfg).await?;
    let grant = session.grant.clone();

    let tun = TunDevice::create(&TunOptions {
        name: cfg.tun_name.clone(),
        mtu: cfg.mtu,
        address: grant.assigned.addr(),
        gateway: grant.gateway,
    })?;
    netcfg::assign_address(tun.name(), &grant.assigned, grant.gateway).await?;
    netcfg::install_routes(tun.name(), &grant.routes, grant.gateway).await?;

    let tun: Arc<dyn Tun> = Arc::new(tun);
    run_pumps(
        cfg,
        tun,
        Some(session.connection.clone()),
        session.send,
        session.recv,
        root,
    )
    .await
}

/// Wire one pump pair onto an established transport. Factored out of
/// [`run`] so tests can drive it with an in-memory device and transport.
pub async fn run_pumps<W, R>(
    cfg: ClientConfig,
    tun: Arc<dyn Tun>,
    connection: Option<quinn::Connection>,
    send: W,
    recv: R,
    root: CancellationToken,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let fec = fec_params(&cfg)?;
    let cancel = root.child_token();
    let (errors_tx, mut errors_rx) = mpsc::channel::<Error>(2);

    let encoder = fec.map(|params| Arc::new(FecEncoder::new(params)));
    let mut writer = TunnelWriter::new(send, encoder);
    let outbound_tun = tun.clone();
    let outbound_cancel = cancel.clone();
    let outbound_errors = errors_tx.clone();
    let outbound = tokio::spawn(async move {
        pump::tun_to_tunnel(outbound_tun, &mut writer, outbound_cancel, outbound_errors).await;
    });

    let pool = Arc::new(BufferPool::new(
        RECV_POOL,
        pump::recv_buf_len(tun.offset(), tun.mtu()),
    ));
    let inbound_tun = tun.clone();
    let inbound_cancel = cancel.clone();
    let mut recv = recv;
    let inbound = tokio::spawn(async move {
        pump::tunnel_to_tun(&mut recv, inbound_tun, fec, pool, inbound_cancel, errors_tx).await;
    });

    let outcome = tokio::select! {
        _ = root.cancelled() => Ok(()),
        err = errors_rx.recv() => match err {
            Some(err) => {
                error!("pump failed: {err}");
                Err(err)
            }
            None => Ok(()),
        },
    };

    // First exit cause wins; everything else is ordinary teardown.
    cancel.cancel();
    if let Some(connection) = connection {
        connection.close(0u32.into(), b"client shutdown");
    }
    tun.close().await;
    let _ = outbound.await;
    let _ = inbound.await;
    info!("client session closed");
    outcome
}

fn fec_params(cfg: &ClientConfig) -> Result<Option<FecParams>> {
    if !cfg.fec.enabled {
        return Ok(None);
    }
    FecParams::new(cfg.fec.redundancy_percent, cfg.fec.block_size)
        .map(Some)
        .map_err(|e| Error::config(e.to_string()))
}
