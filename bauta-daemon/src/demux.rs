//! Server demultiplexer: one task reads the server TUN and dispatches each
//! egress packet to the owning session by destination address.

use crate::session::SessionTable;
use crate::telemetry;
use bauta_core::ip;
use bauta_tun::Tun;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Read the server TUN until cancellation or device EOF, routing packets by
/// destination IP. Packets for unallocated destinations are silently
/// dropped; so are frames the IP parser rejects.
pub async fn demux_loop(tun: Arc<dyn Tun>, table: Arc<SessionTable>, cancel: CancellationToken) {
    let offset = tun.offset();
    let mut buf = vec![0u8; offset + usize::from(tun.mtu())];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tun.recv(&mut buf, offset) => result,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!("demux tun read failed: {err}");
                break;
            }
        };
        telemetry::TUN_RX_PACKETS.inc();

        let packet = &buf[offset..offset + n];
        let dest = match ip::destination(packet) {
            Ok(dest) => dest,
            Err(err) => {
                trace!("demux dropped unparseable frame: {err}");
                telemetry::DEMUX_DROPS.inc();
                continue;
            }
        };
        match table.lookup_by_addr(&dest) {
            Some(session) => {
                // Bounded queue: overrun degrades to a drop, never blocks
                // the single TUN reader.
                if !session.enqueue(packet.to_vec()) {
                    telemetry::DEMUX_DROPS.inc();
                }
            }
            None => {
                trace!(dest = %dest, "no session for destination");
                telemetry::DEMUX_DROPS.inc();
            }
        }
    }
    debug!("demultiplexer exited");
}
