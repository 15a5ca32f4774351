//! The packet pumps: Tun→Tunnel and Tunnel→Tun.
//!
//! One pump pair runs per session. The outbound side batches TUN reads and
//! feeds the optional FEC encoder; the inbound side writes data packets to
//! the TUN as they arrive and runs block recovery when a block boundary
//! passes. A pump reports at most one terminal error on the shared channel
//! and exits; "the network went away" kinds are treated as graceful
//! shutdown and not reported.

use crate::telemetry;
use bauta_core::{Error, Result};
use bauta_fec::{FecParams, XorCodec};
use bauta_masque::framing::{read_frame, write_frame, TunnelFrame};
use bauta_masque::{TUNNEL_READ_TIMEOUT, TUNNEL_WRITE_TIMEOUT};
use bauta_tun::{BufferPool, Tun};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receive buffers must fit a redundancy packet: its length-prefix header
/// can add up to this much beyond the MTU.
pub const FEC_OVERHEAD: usize = 1 + 2 * 255;

/// Buffer length the inbound pump needs for a device with this offset/MTU.
pub fn recv_buf_len(offset: usize, mtu: u16) -> usize {
    offset + usize::from(mtu) + FEC_OVERHEAD
}

/// Per-session FEC encoder state: the pending block and the sequence
/// counter, under the session-local mutex so callers cannot interleave
/// mid-block.
pub struct FecEncoder {
    codec: XorCodec,
    inner: Mutex<EncoderState>,
}

struct EncoderState {
    pending: Vec<Vec<u8>>,
    seq: u32,
}

impl FecEncoder {
    pub fn new(params: FecParams) -> Self {
        Self {
            codec: XorCodec::new(params),
            inner: Mutex::new(EncoderState {
                pending: Vec::with_capacity(params.block_size()),
                seq: 0,
            }),
        }
    }

    /// Append a packet (copied: the caller reuses its read buffers). When
    /// the pending block is full it is encoded and returned as sequenced
    /// frames to write out.
    pub fn push(&self, packet: &[u8]) -> Vec<(u32, Vec<u8>)> {
        let mut state = self.lock();
        state.pending.push(packet.to_vec());
        if state.pending.len() < self.codec.params().block_size() {
            return Vec::new();
        }
        Self::encode_block(&self.codec, &mut state)
    }

    /// Encode a partial pending block at a batch boundary. The block is
    /// padded to full size with empty packets so the receive-side sequence
    /// grid stays aligned; empty frames cost four bytes on the wire and are
    /// never written to a TUN.
    pub fn flush(&self) -> Vec<(u32, Vec<u8>)> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return Vec::new();
        }
        let bs = self.codec.params().block_size();
        while state.pending.len() < bs {
            state.pending.push(Vec::new());
        }
        Self::encode_block(&self.codec, &mut state)
    }

    /// Next sequence number to be assigned (for tests and diagnostics).
    pub fn next_seq(&self) -> u32 {
        self.lock().seq
    }

    fn encode_block(codec: &XorCodec, state: &mut EncoderState) -> Vec<(u32, Vec<u8>)> {
        let encoded = codec.encode(&state.pending);
        state.pending.clear();
        telemetry::FEC_BLOCKS_ENCODED.inc();
        encoded
            .into_iter()
            .map(|frame| {
                let seq = state.seq;
                state.seq = state.seq.wrapping_add(1);
                (seq, frame)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EncoderState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Outbound half of a tunnel: frames packets (sequenced when FEC is on)
/// onto the byte transport with the write deadline applied per packet.
pub struct TunnelWriter<W> {
    writer: W,
    scratch: Vec<u8>,
    encoder: Option<Arc<FecEncoder>>,
}

impl<W: AsyncWrite + Unpin> TunnelWriter<W> {
    pub fn new(writer: W, encoder: Option<Arc<FecEncoder>>) -> Self {
        Self {
            writer,
            scratch: Vec::with_capacity(2048),
            encoder,
        }
    }

    /// Send one IP packet, through the encoder when FEC is enabled.
    pub async fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        let frames = self.encoder.as_ref().map(|enc| enc.push(packet));
        match frames {
            None => self.write_one(None, packet).await,
            Some(frames) => self.write_frames(frames).await,
        }
    }

    /// Flush a partial FEC block at a batch boundary.
    pub async fn flush_partial(&mut self) -> Result<()> {
        let frames = self.encoder.as_ref().map(|enc| enc.flush());
        match frames {
            None => Ok(()),
            Some(frames) => self.write_frames(frames).await,
        }
    }

    async fn write_frames(&mut self, frames: Vec<(u32, Vec<u8>)>) -> Result<()> {
        for (seq, frame) in frames {
            self.write_one(Some(seq), &frame).await?;
        }
        Ok(())
    }

    async fn write_one(&mut self, seq: Option<u32>, payload: &[u8]) -> Result<()> {
        timeout(
            TUNNEL_WRITE_TIMEOUT,
            write_frame(&mut self.writer, &mut self.scratch, seq, payload),
        )
        .await
        .map_err(|_| Error::connection("tunnel write timed out"))??;
        telemetry::TUNNEL_TX_PACKETS.inc();
        Ok(())
    }
}

/// Report a terminal error unless it is ordinary shutdown noise.
fn report(errors: &mpsc::Sender<Error>, err: Error) {
    if err.is_closed_network() {
        debug!("pump observed closed transport: {err}");
        return;
    }
    let _ = errors.try_send(err);
}

/// Tun→Tunnel pump: batch-read the device, feed the tunnel writer.
pub async fn tun_to_tunnel<W: AsyncWrite + Unpin>(
    tun: Arc<dyn Tun>,
    writer: &mut TunnelWriter<W>,
    cancel: CancellationToken,
    errors: mpsc::Sender<Error>,
) {
    let offset = tun.offset();
    let batch = tun.batch_size().max(1);
    let buf_len = offset + usize::from(tun.mtu());
    let mut bufs: Vec<Vec<u8>> = (0..batch).map(|_| vec![0u8; buf_len]).collect();
    let mut lens = vec![0usize; batch];

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tun.recv(&mut bufs[0], offset) => result,
        };
        let n = match first {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                report(&errors, err);
                break;
            }
        };
        lens[0] = n;
        let mut count = 1;
        while count < batch {
            match tun.try_recv(&mut bufs[count], offset) {
                Some(n) if n > 0 => {
                    lens[count] = n;
                    count += 1;
                }
                _ => break,
            }
        }

        let mut stop = false;
        for i in 0..count {
            telemetry::TUN_RX_PACKETS.inc();
            if let Err(err) = writer.send_packet(&bufs[i][offset..offset + lens[i]]).await {
                report(&errors, err);
                stop = true;
                break;
            }
        }
        if stop {
            break;
        }
        // Trailing latency floor: a partial pending block does not wait for
        // the next batch.
        if let Err(err) = writer.flush_partial().await {
            report(&errors, err);
            break;
        }
    }
    // End of stream: whatever is pending goes out as a final padded block.
    let _ = writer.flush_partial().await;
    debug!(tun = tun.name(), "tun→tunnel pump exited");
}

/// Channel→Tunnel pump: the server-side outbound path, fed by the
/// demultiplexer. Drains the queue opportunistically so FEC blocks fill
/// from bursts, then flushes the partial block.
pub async fn channel_to_tunnel<W: AsyncWrite + Unpin>(
    mut packets: mpsc::Receiver<Vec<u8>>,
    writer: &mut TunnelWriter<W>,
    cancel: CancellationToken,
    errors: mpsc::Sender<Error>,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            pkt = packets.recv() => pkt,
        };
        let Some(first) = first else { break };

        let mut stop = false;
        let mut next = Some(first);
        while let Some(pkt) = next {
            if let Err(err) = writer.send_packet(&pkt).await {
                report(&errors, err);
                stop = true;
                break;
            }
            next = packets.try_recv().ok();
        }
        if stop {
            break;
        }
        if let Err(err) = writer.flush_partial().await {
            report(&errors, err);
            break;
        }
    }
    let _ = writer.flush_partial().await;
    debug!("session outbound pump exited");
}

/// Receive-side block reassembly state.
struct RecvBlocks {
    params: FecParams,
    codec: XorCodec,
    current: Option<u32>,
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    recovered: bool,
}

impl RecvBlocks {
    fn new(params: FecParams) -> Self {
        Self {
            params,
            codec: XorCodec::new(params),
            current: None,
            slots: vec![None; params.total_block_size()],
            received: 0,
            recovered: false,
        }
    }

    fn total(&self) -> u32 {
        self.params.total_block_size() as u32
    }

    fn reset(&mut self, block: u32) {
        self.current = Some(block);
        for slot in &mut self.slots {
            *slot = None;
        }
        self.received = 0;
        self.recovered = false;
    }

    fn store(&mut self, idx: usize, payload: &[u8]) {
        if self.slots[idx].is_none() {
            self.received += 1;
        }
        self.slots[idx] = Some(payload.to_vec());
    }

    /// Every slot but one is filled: recovery can run without waiting for
    /// the block boundary.
    fn nearly_complete(&self) -> bool {
        !self.recovered && self.received + 1 == self.slots.len()
    }

    /// Recover the block's single lost data packet if the redundancy
    /// packet made it.
    fn recover(&mut self) -> Option<Vec<u8>> {
        self.current?;
        let bs = self.params.block_size();
        let lost: Vec<usize> = (0..bs).filter(|&i| self.slots[i].is_none()).collect();
        match lost.len() {
            0 => return None,
            1 => {}
            _ => {
                telemetry::FEC_BLOCKS_UNRECOVERABLE.inc();
                return None;
            }
        }
        if self.slots.get(bs).map_or(true, Option::is_none) {
            telemetry::FEC_BLOCKS_UNRECOVERABLE.inc();
            return None;
        }
        // One decode attempt per block, successful or not.
        self.recovered = true;
        let recovered = self.codec.decode(&self.slots, &lost).swap_remove(lost[0]);
        if recovered.is_some() {
            telemetry::FEC_PACKETS_RECOVERED.inc();
        } else {
            telemetry::FEC_BLOCKS_UNRECOVERABLE.inc();
        }
        recovered
    }
}

/// Tunnel→Tun pump: write data packets through immediately, keep a copy per
/// block, and run recovery when the block id advances.
pub async fn tunnel_to_tun<R: AsyncRead + Unpin>(
    reader: &mut R,
    tun: Arc<dyn Tun>,
    fec: Option<FecParams>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    errors: mpsc::Sender<Error>,
) {
    let offset = tun.offset();
    let fec_enabled = fec.is_some();
    let mut blocks = fec.map(RecvBlocks::new);

    enum Step {
        Frame(Result<TunnelFrame>),
        TimedOut,
        Cancelled,
    }

    loop {
        let mut buf = pool.take();
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Cancelled,
            result = timeout(
                TUNNEL_READ_TIMEOUT,
                read_frame(reader, &mut buf, offset, fec_enabled),
            ) => match result {
                Ok(frame) => Step::Frame(frame),
                Err(_) => Step::TimedOut,
            }
        };

        let frame = match step {
            Step::Cancelled => {
                pool.put(buf);
                break;
            }
            Step::TimedOut => {
                pool.put(buf);
                report(&errors, Error::connection("tunnel read timed out"));
                break;
            }
            Step::Frame(frame) => frame,
        };

        let result = match (frame, blocks.as_mut()) {
            (Ok(TunnelFrame::Eof), _) => {
                pool.put(buf);
                break;
            }
            (Ok(TunnelFrame::Malformed), _) => {
                trace!("dropping undersized fec frame");
                pool.put(buf);
                continue;
            }
            (Ok(TunnelFrame::Raw { len }), _) => {
                telemetry::TUNNEL_RX_PACKETS.inc();
                let result = deliver(&*tun, &buf, offset, len).await;
                pool.put(buf);
                result
            }
            (Ok(TunnelFrame::Fec { seq, len }), Some(state)) => {
                telemetry::TUNNEL_RX_PACKETS.inc();
                let result = process_fec(state, &*tun, &pool, &mut buf, offset, seq, len).await;
                pool.put(buf);
                result
            }
            // read_frame only produces Fec frames when fec_enabled is set.
            (Ok(TunnelFrame::Fec { .. }), None) => {
                pool.put(buf);
                continue;
            }
            (Err(err), _) => {
                pool.put(buf);
                report(&errors, err);
                break;
            }
        };
        if let Err(err) = result {
            report(&errors, err);
            break;
        }
    }
    debug!(tun = tun.name(), "tunnel→tun pump exited");
}

async fn process_fec(
    state: &mut RecvBlocks,
    tun: &dyn Tun,
    pool: &BufferPool,
    buf: &mut [u8],
    offset: usize,
    seq: u32,
    len: usize,
) -> Result<()> {
    let total = state.total();
    let block_id = seq / total;
    let idx = (seq % total) as usize;

    if state.current != Some(block_id) {
        if !state.recovered {
            if let Some(recovered) = state.recover() {
                deliver_owned(tun, pool, offset, &recovered).await?;
            }
        }
        state.reset(block_id);
    }

    // Heap-owned copy: the read buffer goes back to the pool immediately.
    state.store(idx, &buf[offset..offset + len]);

    // Data packets go out at once; redundancy and padding frames do not.
    if idx < state.params.block_size() && len > 0 {
        deliver(tun, buf, offset, len).await?;
    }

    // With one slot still missing the redundancy already determines it; do
    // not sit on a recoverable packet until the next block shows up.
    if state.nearly_complete() {
        if let Some(recovered) = state.recover() {
            deliver_owned(tun, pool, offset, &recovered).await?;
        }
    }
    Ok(())
}

async fn deliver(tun: &dyn Tun, buf: &[u8], offset: usize, len: usize) -> Result<()> {
    tun.send(buf, offset, len).await?;
    telemetry::TUN_TX_PACKETS.inc();
    Ok(())
}

async fn deliver_owned(tun: &dyn Tun, pool: &BufferPool, offset: usize, packet: &[u8]) -> Result<()> {
    if packet.is_empty() {
        return Ok(());
    }
    let mut buf = pool.take();
    if offset + packet.len() > buf.len() {
        return Err(Error::protocol("recovered packet exceeds buffer"));
    }
    buf[offset..offset + packet.len()].copy_from_slice(packet);
    let result = deliver(tun, &buf, offset, packet.len()).await;
    pool.put(buf);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pct: u8, bs: u8) -> FecParams {
        FecParams::new(pct, bs).unwrap()
    }

    #[test]
    fn encoder_emits_full_blocks_with_monotonic_seq() {
        let enc = FecEncoder::new(params(10, 3));
        assert!(enc.push(&[1]).is_empty());
        assert!(enc.push(&[2]).is_empty());
        let frames = enc.push(&[3]);
        assert_eq!(frames.len(), 4); // 3 data + 1 redundancy
        let seqs: Vec<u32> = frames.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(enc.next_seq(), 4);
    }

    #[test]
    fn encoder_flush_pads_partial_block() {
        let enc = FecEncoder::new(params(10, 4));
        enc.push(&[7, 7]);
        let frames = enc.flush();
        assert_eq!(frames.len(), 5); // 4 data slots + redundancy
        assert_eq!(frames[0].1, vec![7, 7]);
        assert!(frames[1].1.is_empty()); // padding
        assert!(frames[2].1.is_empty());
        assert!(frames[3].1.is_empty());
        // Next block continues on the aligned grid.
        assert_eq!(enc.next_seq(), 5);
        assert!(enc.flush().is_empty());
    }

    #[test]
    fn recv_blocks_recover_single_loss() {
        let p = params(10, 3);
        let enc = FecEncoder::new(p);
        enc.push(b"aaaa".as_slice());
        enc.push(b"bb".as_slice());
        let frames = enc.push(b"cccccc".as_slice());

        let mut state = RecvBlocks::new(p);
        state.reset(0);
        for (seq, frame) in &frames {
            let idx = (*seq % state.total()) as usize;
            if idx != 1 {
                state.slots[idx] = Some(frame.clone());
            }
        }
        let recovered = state.recover().unwrap();
        assert_eq!(recovered, b"bb");
    }

    #[test]
    fn recv_blocks_skip_double_loss() {
        let p = params(10, 3);
        let enc = FecEncoder::new(p);
        enc.push(b"aaaa".as_slice());
        enc.push(b"bb".as_slice());
        let frames = enc.push(b"cccccc".as_slice());

        let mut state = RecvBlocks::new(p);
        state.reset(0);
        for (seq, frame) in &frames {
            let idx = (*seq % state.total()) as usize;
            if idx != 1 && idx != 2 {
                state.slots[idx] = Some(frame.clone());
            }
        }
        assert!(state.recover().is_none());
    }
}
