//! Tunnel packet framing.
//!
//! QUIC bidirectional streams are byte streams, so discrete tunnel packets
//! travel as `[len: u16 be][frame]`. With FEC off the frame is a raw IP
//! packet; with FEC on it starts with the 4-byte big-endian sequence number.
//! The reader pulls the sequence word off the stream separately so the
//! payload lands directly at the caller's offset with no gap to close.

use bauta_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One decoded tunnel frame.
#[derive(Debug, PartialEq, Eq)]
pub enum TunnelFrame {
    /// Raw IP packet of `len` bytes at the caller's offset.
    Raw { len: usize },
    /// Sequenced FEC frame; payload (possibly empty) at the caller's offset.
    Fec { seq: u32, len: usize },
    /// FEC frame shorter than the sequence word; dropped per protocol.
    Malformed,
    /// Peer closed the stream.
    Eof,
}

/// Write one tunnel frame, reusing `scratch` for the assembled bytes so the
/// transport sees a single write.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    scratch: &mut Vec<u8>,
    seq: Option<u32>,
    payload: &[u8],
) -> Result<()> {
    let frame_len = payload.len() + if seq.is_some() { 4 } else { 0 };
    if frame_len > usize::from(u16::MAX) {
        return Err(Error::protocol(format!("frame of {frame_len} bytes exceeds framing limit")));
    }
    scratch.clear();
    scratch.extend_from_slice(&(frame_len as u16).to_be_bytes());
    if let Some(seq) = seq {
        scratch.extend_from_slice(&seq.to_be_bytes());
    }
    scratch.extend_from_slice(payload);
    w.write_all(scratch).await?;
    Ok(())
}

/// Read one tunnel frame into `buf[offset..]`.
///
/// EOF on the length field is a clean shutdown; EOF mid-frame is a
/// transport error surfaced to the caller.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    offset: usize,
    fec_enabled: bool,
) -> Result<TunnelFrame> {
    let len = match r.read_u16().await {
        Ok(len) => usize::from(len),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(TunnelFrame::Eof),
        Err(e) => return Err(e.into()),
    };

    if !fec_enabled {
        if offset + len > buf.len() {
            return Err(Error::protocol("frame exceeds receive buffer"));
        }
        r.read_exact(&mut buf[offset..offset + len]).await?;
        return Ok(TunnelFrame::Raw { len });
    }

    if len < 4 {
        // Too short to carry a sequence number; consume and drop.
        let mut sink = [0u8; 4];
        r.read_exact(&mut sink[..len]).await?;
        return Ok(TunnelFrame::Malformed);
    }
    let seq = r.read_u32().await?;
    let payload_len = len - 4;
    if offset + payload_len > buf.len() {
        return Err(Error::protocol("frame exceeds receive buffer"));
    }
    r.read_exact(&mut buf[offset..offset + payload_len]).await?;
    Ok(TunnelFrame::Fec {
        seq,
        len: payload_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_roundtrip() {
        let (mut w, mut r) = tokio::io::duplex(4096);
        let mut scratch = Vec::new();
        write_frame(&mut w, &mut scratch, None, &[1, 2, 3, 4]).await.unwrap();

        let mut buf = vec![0u8; 64];
        let frame = read_frame(&mut r, &mut buf, 4, false).await.unwrap();
        assert_eq!(frame, TunnelFrame::Raw { len: 4 });
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn fec_roundtrip_and_padding_frame() {
        let (mut w, mut r) = tokio::io::duplex(4096);
        let mut scratch = Vec::new();
        write_frame(&mut w, &mut scratch, Some(7), &[9, 9]).await.unwrap();
        write_frame(&mut w, &mut scratch, Some(8), &[]).await.unwrap();

        let mut buf = vec![0u8; 64];
        let frame = read_frame(&mut r, &mut buf, 0, true).await.unwrap();
        assert_eq!(frame, TunnelFrame::Fec { seq: 7, len: 2 });
        assert_eq!(&buf[..2], &[9, 9]);

        let frame = read_frame(&mut r, &mut buf, 0, true).await.unwrap();
        assert_eq!(frame, TunnelFrame::Fec { seq: 8, len: 0 });
    }

    #[tokio::test]
    async fn short_fec_frame_is_dropped_not_fatal() {
        let (mut w, mut r) = tokio::io::duplex(4096);
        w.write_all(&[0, 2, 0xAA, 0xBB]).await.unwrap(); // len=2 < 4
        let mut scratch = Vec::new();
        write_frame(&mut w, &mut scratch, Some(1), &[5]).await.unwrap();

        let mut buf = vec![0u8; 64];
        assert_eq!(
            read_frame(&mut r, &mut buf, 0, true).await.unwrap(),
            TunnelFrame::Malformed
        );
        assert_eq!(
            read_frame(&mut r, &mut buf, 0, true).await.unwrap(),
            TunnelFrame::Fec { seq: 1, len: 1 }
        );
    }

    #[tokio::test]
    async fn clean_eof() {
        let (w, mut r) = tokio::io::duplex(4096);
        drop(w);
        let mut buf = vec![0u8; 8];
        assert_eq!(
            read_frame(&mut r, &mut buf, 0, false).await.unwrap(),
            TunnelFrame::Eof
        );
    }
}
