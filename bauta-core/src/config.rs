//! Daemon configuration handling. Parses a TOML file into strongly-typed
//! structures; validation is explicit so that startup fails with a config
//! error instead of a mid-flight surprise.
//!
//! Several options have grown a second accepted name over time
//! (`ca_pem`/`ca_file`, `cert_pem`/`tls_cert`, `key_pem`/`tls_key`); serde
//! aliases keep both spellings working.

use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Deserialize;
use std::{fs, net::SocketAddr, path::Path, path::PathBuf};

/// Forward-error-correction knobs shared by both roles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FecSettings {
    /// Toggle the XOR code on the outbound path.
    pub enabled: bool,
    /// Redundancy budget in percent of a block (0-100).
    pub redundancy_percent: u8,
    /// Data packets per block (1-255).
    pub block_size: u8,
}

impl Default for FecSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redundancy_percent: 10,
            block_size: 10,
        }
    }
}

impl FecSettings {
    fn validate(&self) -> Result<()> {
        if self.redundancy_percent > 100 {
            return Err(Error::config(format!(
                "fec.redundancy_percent {} out of range 0-100",
                self.redundancy_percent
            )));
        }
        if self.block_size == 0 {
            return Err(Error::config("fec.block_size must be at least 1"));
        }
        Ok(())
    }
}

/// Client daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Remote UDP endpoint of the server.
    pub server_addr: SocketAddr,
    /// TLS SNI / hostname the server certificate must match.
    pub server_name: String,
    /// CA bundle used to verify the server certificate.
    #[serde(alias = "ca_pem")]
    pub ca_file: PathBuf,
    /// Client leaf certificate presented during the handshake.
    #[serde(alias = "cert_pem")]
    pub tls_cert: PathBuf,
    /// Private key matching the leaf certificate.
    #[serde(alias = "key_pem")]
    pub tls_key: PathBuf,
    /// Test-only escape hatch: accept any server certificate.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Requested local TUN name; empty picks the platform default.
    #[serde(default)]
    pub tun_name: String,
    /// MTU for the TUN interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional NSS-format key log for test debugging.
    #[serde(default)]
    pub key_log_file: Option<PathBuf>,
    /// FEC shape.
    #[serde(default)]
    pub fec: FecSettings,
}

/// Server daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// UDP endpoint to listen on.
    pub listen_addr: SocketAddr,
    /// IPv4 network addresses are assigned from. The first host is the
    /// gateway and is never handed out.
    pub assign_cidr: Ipv4Net,
    /// Optional IPv6 assignment network.
    #[serde(default)]
    pub assign_cidr_v6: Option<Ipv6Net>,
    /// Routes advertised verbatim to every client.
    #[serde(default)]
    pub advertise_routes: Vec<IpNet>,
    /// Server TUN name; empty disables the TUN and the demultiplexer,
    /// reducing the server to a signalling harness.
    #[serde(default)]
    pub tun_name: String,
    /// MTU for the TUN interface.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// CA bundle client certificates must chain to.
    #[serde(alias = "ca_pem")]
    pub ca_file: PathBuf,
    /// Server leaf certificate.
    #[serde(alias = "cert_pem")]
    pub tls_cert: PathBuf,
    /// Private key matching the leaf certificate.
    #[serde(alias = "key_pem")]
    pub tls_key: PathBuf,
    /// Flat file listing one registered client Common Name per line.
    #[serde(default)]
    pub registry_file: Option<PathBuf>,
    /// Logging verbosity.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional NSS-format key log.
    #[serde(default)]
    pub key_log_file: Option<PathBuf>,
    /// FEC shape applied to sessions.
    #[serde(default)]
    pub fec: FecSettings,
}

fn default_mtu() -> u16 {
    1400
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg: ClientConfig = toml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot work before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(Error::config("server_name must not be empty"));
        }
        if self.mtu < 576 {
            return Err(Error::config(format!("mtu {} below IPv4 minimum", self.mtu)));
        }
        self.fec.validate()
    }
}

impl ServerConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg: ServerConfig = toml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Gateway address of the assignment network: its first host.
    pub fn gateway(&self) -> std::net::Ipv4Addr {
        std::net::Ipv4Addr::from(u32::from(self.assign_cidr.network()) + 1)
    }

    /// Reject configurations that cannot work before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.assign_cidr.prefix_len() > 30 {
            return Err(Error::config(format!(
                "assign_cidr {} leaves no assignable host addresses",
                self.assign_cidr
            )));
        }
        if self.mtu < 576 {
            return Err(Error::config(format!("mtu {} below IPv4 minimum", self.mtu)));
        }
        self.fec.validate()
    }
}
