//! Server runtime: the QUIC accept loop, the CONNECT-IP handler, and the
//! administrative forced-disconnect path.
//!
//! Shared state (pool, table, registry) travels as explicit handles; there
//! is no process-wide singleton. The handler itself is generic over the
//! byte transport so the scenario tests can drive it without QUIC.

use crate::demux;
use crate::pool::IpPool;
use crate::pump::{self, FecEncoder, TunnelWriter};
use crate::registry::ClientRegistry;
use crate::session::{Session, SessionTable};
use crate::telemetry;
use bauta_core::{config::ServerConfig, ClientId, Error, Result};
use bauta_fec::FecParams;
use bauta_masque::connect::{ConnectResponse, SessionGrant};
use bauta_masque::{identity, server as masque};
use bauta_tun::device::{TunDevice, TunOptions};
use bauta_tun::{netcfg, sink::SinkTun, BufferPool, Tun};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pool depth for inbound packet buffers, per session.
const RECV_POOL: usize = 64;

/// Everything a CONNECT-IP verdict depends on.
pub struct ServerState {
    cfg: ServerConfig,
    pool: Arc<IpPool>,
    table: Arc<SessionTable>,
    registry: Arc<dyn ClientRegistry>,
    tun: Arc<dyn Tun>,
    root: CancellationToken,
}

impl ServerState {
    /// Build state with an explicit TUN device (tests pass a `MemTun`).
    pub fn with_tun(
        cfg: ServerConfig,
        registry: Arc<dyn ClientRegistry>,
        tun: Arc<dyn Tun>,
        root: CancellationToken,
    ) -> Result<Arc<Self>> {
        let gateway = IpAddr::V4(cfg.gateway());
        let pool = Arc::new(IpPool::new(cfg.assign_cidr.into(), gateway)?);
        Ok(Arc::new(Self {
            cfg,
            pool,
            table: Arc::new(SessionTable::new()),
            registry,
            tun,
            root,
        }))
    }

    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    fn fec_params(&self) -> Result<Option<FecParams>> {
        if !self.cfg.fec.enabled {
            return Ok(None);
        }
        FecParams::new(self.cfg.fec.redundancy_percent, self.cfg.fec.block_size)
            .map(Some)
            .map_err(|e| Error::config(e.to_string()))
    }

    fn grant_for(&self, assigned: ipnet::IpNet) -> SessionGrant {
        SessionGrant {
            assigned,
            gateway: IpAddr::V4(self.cfg.gateway()),
            routes: self.cfg.advertise_routes.clone(),
        }
    }

    /// Administrative disconnect: close the client's tunnel and return its
    /// address to the pool (exactly once, via the terminating latch).
    pub fn disconnect_client(&self, client: &ClientId) -> bool {
        let Some((addr, session)) = self.table.remove_by_client(client) else {
            return false;
        };
        session.close();
        if session.begin_teardown() {
            self.pool.release(addr);
            telemetry::SESSIONS_CLOSED.inc();
        }
        info!(client = %client, addr = %addr, "session force-disconnected");
        true
    }
}

/// Run the server until the root token cancels: bring up the TUN (unless
/// disabled), start the demultiplexer, and accept QUIC connections.
pub async fn run(
    cfg: ServerConfig,
    registry: Arc<dyn ClientRegistry>,
    root: CancellationToken,
) -> Result<()> {
    let endpoint = masque::server_endpoint(&cfg)?;

    let tun: Arc<dyn Tun> = if cfg.tun_name.is_empty() {
        info!("tun disabled, running as signalling harness");
        Arc::new(SinkTun::new(cfg.mtu))
    } else {
        let gateway = IpAddr::V4(cfg.gateway());
        let device = TunDevice::create(&TunOptions {
            name: cfg.tun_name.clone(),
            mtu: cfg.mtu,
            address: gateway,
            gateway: bauta_core::ip::next_address(gateway),
        })?;
        let gateway_net =
            ipnet::IpNet::new(gateway, cfg.assign_cidr.prefix_len()).map_err(|e| {
                Error::config(format!("gateway prefix: {e}"))
            })?;
        netcfg::assign_address(device.name(), &gateway_net, gateway).await?;
        Arc::new(device)
    };

    let state = ServerState::with_tun(cfg, registry, tun.clone(), root.clone())?;

    let demux_handle = tokio::spawn(demux::demux_loop(
        tun.clone(),
        state.table.clone(),
        root.child_token(),
    ));

    info!(listen = %endpoint.local_addr()?, "server accepting connections");
    loop {
        let incoming = tokio::select! {
            _ = root.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else { break };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(state, incoming).await {
                if !err.is_closed_network() {
                    warn!("connection handling failed: {err}");
                }
            }
        });
    }

    // Drain: cancel children, close the endpoint, wait for sessions.
    root.cancel();
    endpoint.close(0u32.into(), b"server shutdown");
    tun.close().await;
    let _ = demux_handle.await;
    endpoint.wait_idle().await;
    info!("server stopped");
    Ok(())
}

async fn handle_connection(state: Arc<ServerState>, incoming: quinn::Incoming) -> Result<()> {
    let connection = incoming
        .await
        .map_err(|e| Error::connection(format!("quic accept: {e}")))?;
    let client_id = identity::client_id_from_connection(&connection);
    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|e| Error::connection(format!("accept stream: {e}")))?;
    handle_session(state, send, recv, client_id, Some(connection)).await
}

/// Negotiate one CONNECT-IP session and run its pumps to completion.
///
/// `client_id` is the identity extracted from the client certificate; the
/// QUIC layer guarantees the certificate chains to the operator CA before
/// this point, so a `None` here means no usable identity was presented.
pub async fn handle_session<W, R>(
    state: Arc<ServerState>,
    mut send: W,
    mut recv: R,
    client_id: Option<ClientId>,
    connection: Option<quinn::Connection>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let request = match masque::read_connect(&mut recv).await {
        Ok(request) => request,
        Err(err) => {
            masque::respond(&mut send, ConnectResponse::BadRequest).await?;
            return Err(err);
        }
    };

    let client = match client_id {
        Some(client) if state.registry.is_registered(&client) => client,
        Some(client) => {
            warn!(client = %client, "unregistered client rejected");
            masque::respond(&mut send, ConnectResponse::Unauthorized).await?;
            return Ok(());
        }
        None => {
            warn!("connection without client identity rejected");
            masque::respond(&mut send, ConnectResponse::Unauthorized).await?;
            return Ok(());
        }
    };

    if let Err(verdict) = masque::validate(&request) {
        masque::respond(&mut send, verdict).await?;
        return Err(Error::protocol(format!(
            "invalid connect-ip request from {client}"
        )));
    }

    let assigned = match state.pool.allocate(&client) {
        Ok(assigned) => assigned,
        Err(err) => {
            error!(client = %client, "no available IP");
            telemetry::POOL_EXHAUSTED.inc();
            masque::respond(&mut send, ConnectResponse::PoolExhausted).await?;
            return Err(err);
        }
    };

    let cancel = state.root.child_token();
    let (session, outbound_rx) = Session::new(client.clone(), assigned, cancel.clone(), connection);
    if let Some(displaced) = state.table.insert(session.clone()) {
        displaced.close();
        if displaced.begin_teardown() {
            state.pool.release(displaced.assigned().addr());
            telemetry::SESSIONS_CLOSED.inc();
        }
    }

    masque::respond(&mut send, ConnectResponse::Ok).await?;
    masque::send_grant(&mut send, &state.grant_for(assigned)).await?;
    telemetry::SESSIONS_OPENED.inc();
    info!(client = %client, assigned = %assigned, "session established");

    run_session_pumps(&state, &session, send, recv, outbound_rx, cancel).await;

    // Pumps exited: remove the table entry (unless a reconnect displaced
    // this session already) and release the address exactly once.
    state.table.remove_session(&session);
    if session.begin_teardown() {
        state.pool.release(session.assigned().addr());
        telemetry::SESSIONS_CLOSED.inc();
    }
    session.close();
    debug!(client = %client, "session torn down");
    Ok(())
}

async fn run_session_pumps<W, R>(
    state: &Arc<ServerState>,
    session: &Arc<Session>,
    send: W,
    mut recv: R,
    outbound_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let fec = match state.fec_params() {
        Ok(fec) => fec,
        Err(err) => {
            error!("invalid fec configuration: {err}");
            None
        }
    };
    let (errors_tx, mut errors_rx) = mpsc::channel::<Error>(2);

    let encoder = fec.map(|params| Arc::new(FecEncoder::new(params)));
    let mut writer = TunnelWriter::new(send, encoder);
    let outbound_cancel = cancel.clone();
    let outbound_errors = errors_tx.clone();
    let outbound = tokio::spawn(async move {
        pump::channel_to_tunnel(outbound_rx, &mut writer, outbound_cancel, outbound_errors).await;
    });

    let tun = state.tun.clone();
    let pool = Arc::new(BufferPool::new(
        RECV_POOL,
        pump::recv_buf_len(tun.offset(), tun.mtu()),
    ));
    let inbound_cancel = cancel.clone();
    let inbound = tokio::spawn(async move {
        pump::tunnel_to_tun(&mut recv, tun, fec, pool, inbound_cancel, errors_tx).await;
    });

    tokio::select! {
        _ = cancel.cancelled() => {}
        err = errors_rx.recv() => {
            if let Some(err) = err {
                warn!(client = %session.client(), "pump failed: {err}");
            }
        }
    }
    cancel.cancel();
    let _ = outbound.await;
    let _ = inbound.await;
}
