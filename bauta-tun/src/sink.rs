//! A no-op device for the TUN-less server mode (empty `tun_name`), where
//! the server is reduced to a signalling harness: writes are discarded and
//! reads park until cancellation tears the pump down.

use crate::Tun;
use async_trait::async_trait;
use bauta_core::Result;

/// Discards every packet; never produces one.
pub struct SinkTun {
    mtu: u16,
}

impl SinkTun {
    pub fn new(mtu: u16) -> Self {
        Self { mtu }
    }
}

#[async_trait]
impl Tun for SinkTun {
    async fn recv(&self, _buf: &mut [u8], _offset: usize) -> Result<usize> {
        // Park forever; the owning pump exits via its cancellation token.
        std::future::pending::<()>().await;
        Ok(0)
    }

    async fn send(&self, _buf: &[u8], _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn offset(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        ""
    }

    async fn close(&self) {}
}
