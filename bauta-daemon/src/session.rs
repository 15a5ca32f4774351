//! Per-client session state and the table that maps identities and
//! addresses onto live sessions.

use bauta_core::ClientId;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Depth of the demux → outbound-pump queue per session.
const OUTBOUND_DEPTH: usize = 512;

/// Server-side state of one client tunnel.
pub struct Session {
    client: ClientId,
    assigned: IpNet,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    connection: Option<quinn::Connection>,
    terminating: AtomicBool,
}

impl Session {
    /// Build a session and the receiver its outbound pump consumes.
    pub fn new(
        client: ClientId,
        assigned: IpNet,
        cancel: CancellationToken,
        connection: Option<quinn::Connection>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        (
            Arc::new(Self {
                client,
                assigned,
                outbound: tx,
                cancel,
                connection,
                terminating: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn assigned(&self) -> IpNet {
        self.assigned
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue an egress packet for this session's Tun→Tunnel path. Overrun
    /// is a drop; a closed queue means the session is going away.
    pub fn enqueue(&self, packet: Vec<u8>) -> bool {
        self.outbound.try_send(packet).is_ok()
    }

    /// Close the tunnel: cancel the pumps and shut the QUIC connection.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(connection) = &self.connection {
            connection.close(0u32.into(), b"session closed");
        }
    }

    /// Flip the terminating latch. Returns true exactly once, so the pool
    /// slot is released by exactly one of the pump-exit and forced-
    /// disconnect paths.
    pub fn begin_teardown(&self) -> bool {
        !self.terminating.swap(true, Ordering::AcqRel)
    }
}

struct Tables {
    by_client: HashMap<ClientId, IpAddr>,
    by_addr: HashMap<IpAddr, Arc<Session>>,
}

/// Two synchronized maps under one reader/writer lock.
///
/// Invariant: `by_client[c] = a` iff `by_addr[a].client() == c`; both maps
/// change in the same critical section.
pub struct SessionTable {
    inner: RwLock<Tables>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables {
                by_client: HashMap::new(),
                by_addr: HashMap::new(),
            }),
        }
    }

    /// Insert a session under both keys. A session the same client left
    /// behind (e.g. a half-dead reconnect) is displaced and returned so the
    /// caller can tear it down.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let addr = session.assigned().addr();
        let client = session.client().clone();
        let mut tables = self.write();
        let displaced = tables
            .by_client
            .insert(client, addr)
            .and_then(|old_addr| tables.by_addr.remove(&old_addr));
        tables.by_addr.insert(addr, session);
        displaced
    }

    /// Remove a client's entry from both maps.
    pub fn remove_by_client(&self, client: &ClientId) -> Option<(IpAddr, Arc<Session>)> {
        let mut tables = self.write();
        let addr = tables.by_client.remove(client)?;
        let session = tables.by_addr.remove(&addr)?;
        Some((addr, session))
    }

    /// Remove a specific session, but only while it is still the one the
    /// table holds for its client. A pump exiting after the session was
    /// displaced by a reconnect must not evict the replacement.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut tables = self.write();
        let addr = session.assigned().addr();
        match tables.by_addr.get(&addr) {
            Some(current) if Arc::ptr_eq(current, session) => {
                tables.by_addr.remove(&addr);
                tables.by_client.remove(session.client());
                debug!(client = %session.client(), addr = %addr, "session removed");
                true
            }
            _ => false,
        }
    }

    /// Look a session up by its assigned address.
    pub fn lookup_by_addr(&self, addr: &IpAddr) -> Option<Arc<Session>> {
        self.read().by_addr.get(addr).cloned()
    }

    /// Address assigned to a client, if connected.
    pub fn addr_of(&self, client: &ClientId) -> Option<IpAddr> {
        self.read().by_client.get(client).copied()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All (client, address) pairs, for observability.
    pub fn snapshot(&self) -> Vec<(ClientId, IpAddr)> {
        self.read()
            .by_client
            .iter()
            .map(|(c, a)| (c.clone(), *a))
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
