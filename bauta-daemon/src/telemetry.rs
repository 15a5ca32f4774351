//! Counter registry.
//!
//! The core maintains the counters; serving them over HTTP is an external
//! concern. Tests and an embedding process can read the registry through
//! [`registry`] or the text dump.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, Registry};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    #[allow(clippy::expect_used)]
    let c = IntCounter::new(name, help).expect("static counter definition");
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
}

/// Packets read from a TUN device.
pub static TUN_RX_PACKETS: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_tun_rx_packets", "packets read from tun"));
/// Packets written to a TUN device.
pub static TUN_TX_PACKETS: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_tun_tx_packets", "packets written to tun"));
/// Frames read from tunnels.
pub static TUNNEL_RX_PACKETS: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_tunnel_rx_packets", "frames read from tunnels"));
/// Frames written to tunnels.
pub static TUNNEL_TX_PACKETS: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_tunnel_tx_packets", "frames written to tunnels"));
/// FEC blocks encoded.
pub static FEC_BLOCKS_ENCODED: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_fec_blocks_encoded", "fec blocks encoded"));
/// Packets recovered by block recovery.
pub static FEC_PACKETS_RECOVERED: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_fec_packets_recovered", "packets recovered via fec"));
/// Blocks with more losses than the code can repair.
pub static FEC_BLOCKS_UNRECOVERABLE: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "bauta_fec_blocks_unrecoverable",
        "blocks dropped with unrecoverable losses",
    )
});
/// Egress packets with no session for their destination.
pub static DEMUX_DROPS: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_demux_drops", "egress packets without a session"));
/// Sessions successfully negotiated.
pub static SESSIONS_OPENED: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_sessions_opened", "sessions opened"));
/// Sessions torn down.
pub static SESSIONS_CLOSED: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_sessions_closed", "sessions closed"));
/// CONNECT-IP requests rejected for pool exhaustion.
pub static POOL_EXHAUSTED: Lazy<IntCounter> =
    Lazy::new(|| counter("bauta_pool_exhausted", "allocations rejected, pool empty"));

/// The process-wide registry, for an external exposition endpoint.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Text-format dump used by tests.
pub fn dump() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    let _ = encoder.encode(&REGISTRY.gather(), &mut buf);
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_dump() {
        SESSIONS_OPENED.inc();
        FEC_PACKETS_RECOVERED.inc_by(3);
        let text = dump();
        assert!(text.contains("bauta_sessions_opened"));
        assert!(text.contains("bauta_fec_packets_recovered"));
    }
}
