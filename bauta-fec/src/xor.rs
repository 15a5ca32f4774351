//! Block codec: encoder appends one XOR redundancy packet per block, decoder
//! recovers blocks that lost exactly one data packet.
//!
//! Redundancy packet layout (big-endian):
//! `[n: u8][len_1: u16] … [len_n: u16][xor-payload]` where the payload length
//! equals the maximum `len_i` of the block and shorter packets are padded
//! with zero bytes for the XOR.

use crate::{Error, Result};

/// Validated codec configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    redundancy_percent: u8,
    block_size: u8,
}

impl FecParams {
    /// Validate and build. `redundancy_percent` must be 0-100 and
    /// `block_size` 1-255.
    pub fn new(redundancy_percent: u8, block_size: u8) -> Result<Self> {
        if redundancy_percent > 100 {
            return Err(Error::InvalidParams(format!(
                "redundancy_percent {redundancy_percent} out of range 0-100"
            )));
        }
        if block_size == 0 {
            return Err(Error::InvalidParams("block_size must be at least 1".into()));
        }
        Ok(Self {
            redundancy_percent,
            block_size,
        })
    }

    /// Data packets per block.
    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Redundancy packets per block: `max(1, block_size * percent / 100)`
    /// when the percentage is non-zero, otherwise 0. The XOR construction
    /// emits a single redundancy packet regardless, so any non-zero count
    /// enables the code.
    pub fn redundancy_packets(&self) -> usize {
        if self.redundancy_percent == 0 {
            return 0;
        }
        (self.block_size as usize * self.redundancy_percent as usize / 100).max(1)
    }

    /// Whether encoding adds redundancy at all.
    pub fn has_redundancy(&self) -> bool {
        self.redundancy_packets() > 0
    }

    /// Stream slots a block occupies: data packets plus the redundancy
    /// packet when the code is active.
    pub fn total_block_size(&self) -> usize {
        self.block_size() + usize::from(self.has_redundancy())
    }
}

/// Stateless XOR encoder/decoder over whole packet batches.
#[derive(Debug, Clone, Copy)]
pub struct XorCodec {
    params: FecParams,
}

impl XorCodec {
    pub fn new(params: FecParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> FecParams {
        self.params
    }

    /// Encode a batch: all input packets in order, followed by one
    /// redundancy packet per block in block order. Empty input or a zero
    /// redundancy budget returns the input unchanged.
    pub fn encode(&self, packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
        if packets.is_empty() || !self.params.has_redundancy() {
            return packets.to_vec();
        }
        let bs = self.params.block_size();
        let blocks: Vec<&[Vec<u8>]> = packets.chunks(bs).collect();

        let mut out = Vec::with_capacity(packets.len() + blocks.len());
        out.extend(packets.iter().cloned());
        for block in blocks {
            out.push(redundancy_packet(block));
        }
        out
    }

    /// Recover lost packets where possible. `received` is the encoded
    /// stream with `None` at each lost index; `lost` lists those indices.
    ///
    /// Only blocks with exactly one lost data packet and a surviving
    /// redundancy packet are recovered; everything else is skipped. The
    /// decoder never fails hard: malformed redundancy headers simply leave
    /// their block unrecovered. The result has the same length as
    /// `received`, with recovered packets at their original indices.
    pub fn decode(
        &self,
        received: &[Option<Vec<u8>>],
        lost: &[usize],
    ) -> Vec<Option<Vec<u8>>> {
        let mut out: Vec<Option<Vec<u8>>> = vec![None; received.len()];
        if received.is_empty() || !self.params.has_redundancy() {
            return out;
        }
        let bs = self.params.block_size();
        // encode() maps n data packets to n + B entries with B = ceil(n/bs)
        // blocks, which inverts to B = ceil(len / (bs + 1)).
        let blocks = received.len().div_ceil(bs + 1);
        let n_data = received.len() - blocks;

        for block in 0..blocks {
            let start = block * bs;
            let end = ((block + 1) * bs).min(n_data);
            let lost_here: Vec<usize> = lost
                .iter()
                .copied()
                .filter(|&i| i >= start && i < end && received.get(i).is_some_and(|p| p.is_none()))
                .collect();
            if lost_here.len() != 1 {
                continue;
            }
            let Some(Some(redundancy)) = received.get(n_data + block) else {
                continue;
            };
            let lost_idx = lost_here[0];
            let survivors = received[start..end]
                .iter()
                .enumerate()
                .filter(|(i, _)| start + i != lost_idx)
                .filter_map(|(_, p)| p.as_deref());
            if let Some(recovered) = recover_one(redundancy, survivors, lost_idx - start) {
                out[lost_idx] = Some(recovered);
            }
        }
        out
    }
}

/// Build the redundancy packet for one block (which may be short).
fn redundancy_packet(block: &[Vec<u8>]) -> Vec<u8> {
    let max_len = block.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = Vec::with_capacity(1 + 2 * block.len() + max_len);
    out.push(block.len() as u8);
    for pkt in block {
        out.extend_from_slice(&(pkt.len() as u16).to_be_bytes());
    }
    let header = out.len();
    out.resize(header + max_len, 0);
    for pkt in block {
        xor_into(&mut out[header..], pkt);
    }
    out
}

/// XOR the redundancy payload against every survivor and truncate to the
/// length recorded for the lost slot. Returns `None` on a malformed header.
fn recover_one<'a>(
    redundancy: &[u8],
    survivors: impl Iterator<Item = &'a [u8]>,
    slot: usize,
) -> Option<Vec<u8>> {
    let n = *redundancy.first()? as usize;
    if slot >= n {
        return None;
    }
    let header = 1 + 2 * n;
    if redundancy.len() < header {
        return None;
    }
    let len_at = 1 + 2 * slot;
    let lost_len = u16::from_be_bytes([redundancy[len_at], redundancy[len_at + 1]]) as usize;
    let mut payload = redundancy[header..].to_vec();
    if lost_len > payload.len() {
        return None;
    }
    for pkt in survivors {
        xor_into(&mut payload, pkt);
    }
    payload.truncate(lost_len);
    Some(payload)
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pct: u8, bs: u8) -> FecParams {
        FecParams::new(pct, bs).unwrap()
    }

    fn batch(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                (0..(20 + i % 7))
                    .map(|j| (i * 31 + j) as u8)
                    .collect::<Vec<u8>>()
            })
            .collect()
    }

    #[test]
    fn params_validation() {
        assert!(FecParams::new(101, 10).is_err());
        assert!(FecParams::new(10, 0).is_err());
        assert!(FecParams::new(0, 1).is_ok());
        assert!(FecParams::new(100, 255).is_ok());
    }

    #[test]
    fn redundancy_count_formula() {
        assert_eq!(params(0, 10).redundancy_packets(), 0);
        assert_eq!(params(10, 10).redundancy_packets(), 1);
        assert_eq!(params(1, 10).redundancy_packets(), 1); // floor 0 -> min 1
        assert_eq!(params(50, 10).redundancy_packets(), 5);
        assert_eq!(params(0, 10).total_block_size(), 10);
        assert_eq!(params(10, 10).total_block_size(), 11);
    }

    #[test]
    fn encode_passthrough_without_redundancy() {
        let codec = XorCodec::new(params(0, 10));
        let pkts = batch(5);
        assert_eq!(codec.encode(&pkts), pkts);
        assert!(codec.encode(&[]).is_empty());
    }

    #[test]
    fn encode_appends_one_redundancy_per_block() {
        let codec = XorCodec::new(params(10, 4));
        let pkts = batch(10); // blocks of 4, 4, 2
        let encoded = codec.encode(&pkts);
        assert_eq!(encoded.len(), 13);
        assert_eq!(&encoded[..10], &pkts[..]);
        // Short trailing block records its true member count.
        assert_eq!(encoded[12][0], 2);
    }

    #[test]
    fn roundtrip_without_loss_changes_nothing() {
        let codec = XorCodec::new(params(10, 10));
        let pkts = batch(10);
        let encoded = codec.encode(&pkts);
        let received: Vec<Option<Vec<u8>>> = encoded.into_iter().map(Some).collect();
        let recovered = codec.decode(&received, &[]);
        assert!(recovered.iter().all(Option::is_none));
    }

    #[test]
    fn single_loss_recovers_every_index() {
        let codec = XorCodec::new(params(10, 10));
        for n in [1usize, 3, 10, 17, 25] {
            let pkts = batch(n);
            let encoded = codec.encode(&pkts);
            for i in 0..n {
                let mut received: Vec<Option<Vec<u8>>> =
                    encoded.iter().cloned().map(Some).collect();
                received[i] = None;
                let recovered = codec.decode(&received, &[i]);
                assert_eq!(recovered[i].as_ref(), Some(&pkts[i]), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn double_loss_in_one_block_recovers_nothing() {
        let codec = XorCodec::new(params(10, 10));
        let pkts = batch(10);
        let encoded = codec.encode(&pkts);
        let mut received: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        received[2] = None;
        received[3] = None;
        let recovered = codec.decode(&received, &[2, 3]);
        assert!(recovered[2].is_none());
        assert!(recovered[3].is_none());
    }

    #[test]
    fn losses_in_distinct_blocks_both_recover() {
        let codec = XorCodec::new(params(10, 5));
        let pkts = batch(10); // two full blocks
        let encoded = codec.encode(&pkts);
        let mut received: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        received[1] = None;
        received[7] = None;
        let recovered = codec.decode(&received, &[1, 7]);
        assert_eq!(recovered[1].as_ref(), Some(&pkts[1]));
        assert_eq!(recovered[7].as_ref(), Some(&pkts[7]));
    }

    #[test]
    fn missing_redundancy_packet_skips_block() {
        let codec = XorCodec::new(params(10, 10));
        let pkts = batch(10);
        let encoded = codec.encode(&pkts);
        let mut received: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        received[4] = None;
        received[10] = None; // the redundancy slot
        let recovered = codec.decode(&received, &[4]);
        assert!(recovered[4].is_none());
    }

    #[test]
    fn malformed_redundancy_header_is_not_fatal() {
        let codec = XorCodec::new(params(10, 3));
        let pkts = batch(3);
        let mut encoded = codec.encode(&pkts);
        encoded[3] = vec![0xff]; // claims 255 members with no lengths
        let mut received: Vec<Option<Vec<u8>>> = encoded.into_iter().map(Some).collect();
        received[0] = None;
        let recovered = codec.decode(&received, &[0]);
        assert!(recovered[0].is_none());
    }

    #[test]
    fn zero_length_member_recovers_empty() {
        let codec = XorCodec::new(params(10, 3));
        let pkts = vec![vec![1, 2, 3], Vec::new(), vec![9, 9]];
        let encoded = codec.encode(&pkts);
        let mut received: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        received[1] = None;
        let recovered = codec.decode(&received, &[1]);
        assert_eq!(recovered[1].as_deref(), Some(&[][..]));
    }
}
