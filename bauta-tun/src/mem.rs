//! Channel-backed TUN stand-in for tests.
//!
//! `MemTun` mirrors the trait contract of a real device: a test injects
//! "kernel" packets through [`MemTunHandle::inject`] and observes what the
//! pumps wrote through [`MemTunHandle::written`]. Overrun on the inject path
//! is a drop, matching the bounded receive buffers of real drivers.

use crate::Tun;
use async_trait::async_trait;
use bauta_core::{Error, Result};
use tokio::sync::{mpsc, Mutex};

const CHANNEL_DEPTH: usize = 256;

/// In-memory TUN device.
pub struct MemTun {
    name: String,
    mtu: u16,
    offset: usize,
    batch: usize,
    from_kernel: Mutex<mpsc::Receiver<Vec<u8>>>,
    to_kernel: mpsc::Sender<Vec<u8>>,
}

/// Test-side handle to a [`MemTun`].
pub struct MemTunHandle {
    /// Push a packet that the device will hand to the next `recv`.
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Packets the pumps wrote to the device.
    pub written: mpsc::Receiver<Vec<u8>>,
}

impl MemTun {
    /// Build a device plus its test handle.
    pub fn new(name: &str, mtu: u16, offset: usize, batch: usize) -> (Self, MemTunHandle) {
        let (inject_tx, inject_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (written_tx, written_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self {
                name: name.to_string(),
                mtu,
                offset,
                batch,
                from_kernel: Mutex::new(inject_rx),
                to_kernel: written_tx,
            },
            MemTunHandle {
                inject: inject_tx,
                written: written_rx,
            },
        )
    }
}

#[async_trait]
impl Tun for MemTun {
    async fn recv(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        // One reading pump owns this receiver; the lock exists to keep the
        // trait object shareable, not to multiplex readers.
        let mut rx = self.from_kernel.lock().await;
        match rx.recv().await {
            Some(pkt) => copy_in(buf, offset, &pkt),
            None => Ok(0),
        }
    }

    fn try_recv(&self, buf: &mut [u8], offset: usize) -> Option<usize> {
        let mut rx = self.from_kernel.try_lock().ok()?;
        let pkt = rx.try_recv().ok()?;
        copy_in(buf, offset, &pkt).ok()
    }

    async fn send(&self, buf: &[u8], offset: usize, len: usize) -> Result<()> {
        if offset + len > buf.len() {
            return Err(Error::protocol("send length exceeds buffer"));
        }
        let pkt = buf[offset..offset + len].to_vec();
        match self.to_kernel.try_send(pkt) {
            Ok(()) => Ok(()),
            // Bounded test channel: overrun is a drop, not an error.
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::TransportClosed("mem tun closed".into()))
            }
        }
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn batch_size(&self) -> usize {
        self.batch
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) {
        self.from_kernel.lock().await.close();
    }
}

fn copy_in(buf: &mut [u8], offset: usize, pkt: &[u8]) -> Result<usize> {
    if offset + pkt.len() > buf.len() {
        return Err(Error::protocol("packet exceeds buffer"));
    }
    buf[offset..offset + pkt.len()].copy_from_slice(pkt);
    Ok(pkt.len())
}
