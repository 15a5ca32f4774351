//! Production TUN back-end built on the `tun` crate.
//!
//! The device is split into read/write halves so one pump can read while
//! another writes. The macOS utun path prepends a 4-byte address-family word
//! to every packet; that header lives in the `offset` bytes the trait
//! reserves, so the pumps never see it.

use crate::{Tun, OFFSET_MACOS, OFFSET_NONE};
use async_trait::async_trait;
use bauta_core::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::info;

#[cfg(target_os = "macos")]
const AF_INET: u8 = 2;
#[cfg(target_os = "macos")]
const AF_INET6: u8 = 30;

/// OS-level TUN interface.
pub struct TunDevice {
    name: String,
    mtu: u16,
    offset: usize,
    reader: Mutex<ReadHalf<tun::AsyncDevice>>,
    writer: Mutex<WriteHalf<tun::AsyncDevice>>,
    closed: std::sync::atomic::AtomicBool,
}

/// Parameters for device creation.
#[derive(Debug, Clone)]
pub struct TunOptions {
    /// Requested interface name; empty picks the platform default.
    pub name: String,
    /// Interface MTU.
    pub mtu: u16,
    /// Host address assigned to the interface.
    pub address: std::net::IpAddr,
    /// Point-to-point peer (macOS) / on-link gateway used by route shims.
    pub gateway: std::net::IpAddr,
}

impl TunDevice {
    /// Create and bring up the interface.
    pub fn create(opts: &TunOptions) -> Result<Self> {
        let mut config = tun::Configuration::default();
        if !opts.name.is_empty() {
            config.tun_name(&opts.name);
        }
        config.address(opts.address).mtu(opts.mtu).up();

        #[cfg(target_os = "macos")]
        config.destination(opts.gateway);

        #[cfg(target_os = "linux")]
        config.platform_config(|p| {
            p.ensure_root_privileges(true);
        });

        let dev = tun::create_as_async(&config)
            .map_err(|e| Error::system(format!("tun create failed: {e}")))?;

        let name = if opts.name.is_empty() {
            // Fall back to the requested-name convention when the driver does
            // not report the generated name.
            "tun0".to_string()
        } else {
            opts.name.clone()
        };

        let offset = if cfg!(target_os = "macos") {
            OFFSET_MACOS
        } else {
            OFFSET_NONE
        };

        let (reader, writer) = tokio::io::split(dev);
        info!(name = %name, mtu = opts.mtu, "tun device up");
        Ok(Self {
            name,
            mtu: opts.mtu,
            offset,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Tun for TunDevice {
    async fn recv(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        let start = offset - self.offset;
        let n = reader.read(&mut buf[start..]).await?;
        if n == 0 {
            return Ok(0);
        }
        if n < self.offset {
            return Err(Error::protocol("tun frame shorter than platform header"));
        }
        Ok(n - self.offset)
    }

    async fn send(&self, buf: &[u8], offset: usize, len: usize) -> Result<()> {
        let mut writer = self.writer.lock().await;
        #[cfg(target_os = "macos")]
        {
            // The family word travels in the reserved header bytes.
            let family = match buf.get(offset).map(|b| b >> 4) {
                Some(6) => AF_INET6,
                _ => AF_INET,
            };
            let mut frame = Vec::with_capacity(OFFSET_MACOS + len);
            frame.extend_from_slice(&[0, 0, 0, family]);
            frame.extend_from_slice(&buf[offset..offset + len]);
            writer.write_all(&frame).await?;
        }
        #[cfg(not(target_os = "macos"))]
        {
            writer.write_all(&buf[offset..offset + len]).await?;
        }
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
    }
}
