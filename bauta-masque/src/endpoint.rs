//! quinn endpoint construction with the transport timeouts of the tunnel.

use crate::{tls, IDLE_TIMEOUT, KEEPALIVE_INTERVAL};
use bauta_core::{config, Error, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn transport() -> Result<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| Error::config(format!("idle timeout: {e}")))?,
    ));
    transport.keep_alive_interval(Some(KEEPALIVE_INTERVAL));
    Ok(transport)
}

/// Client endpoint on an OS-chosen local port.
pub fn client(cfg: &config::ClientConfig) -> Result<quinn::Endpoint> {
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| Error::connection(format!("udp bind: {e}")))?;

    let tls = tls::client_tls(cfg)?;
    let quic = QuicClientConfig::try_from(tls)
        .map_err(|e| Error::config(format!("quic client config: {e}")))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic));
    client_config.transport_config(Arc::new(transport()?));
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Server endpoint bound to the configured listen address.
pub fn server(cfg: &config::ServerConfig) -> Result<quinn::Endpoint> {
    let tls = tls::server_tls(cfg)?;
    let quic = QuicServerConfig::try_from(tls)
        .map_err(|e| Error::config(format!("quic server config: {e}")))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic));
    server_config.transport_config(Arc::new(transport()?));

    quinn::Endpoint::server(server_config, cfg.listen_addr)
        .map_err(|e| Error::connection(format!("listen on {}: {e}", cfg.listen_addr)))
}
