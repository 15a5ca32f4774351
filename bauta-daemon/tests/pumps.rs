//! Pump behaviour at the transport boundary: raw-mode pass-through,
//! padding-frame suppression, and graceful exit on peer close.

use bauta_core::Error;
use bauta_daemon::pump::{self, FecEncoder, TunnelWriter};
use bauta_fec::FecParams;
use bauta_tun::mem::MemTun;
use bauta_tun::{BufferPool, Tun};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MTU: u16 = 1400;

#[tokio::test(flavor = "multi_thread")]
async fn raw_mode_carries_packets_both_ways() {
    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let (mut a_read, a_write) = tokio::io::split(a_io);
    let (mut b_read, b_write) = tokio::io::split(b_io);

    let (a_tun, a_handle) = MemTun::new("a0", MTU, 0, 4);
    let (b_tun, mut b_handle) = MemTun::new("b0", MTU, 4, 4);
    let a_tun: Arc<dyn Tun> = Arc::new(a_tun);
    let b_tun: Arc<dyn Tun> = Arc::new(b_tun);

    let cancel = CancellationToken::new();
    let (errors, _errors_rx) = mpsc::channel::<Error>(4);

    let mut a_writer = TunnelWriter::new(a_write, None);
    let out_tun = a_tun.clone();
    let (c, e) = (cancel.clone(), errors.clone());
    tokio::spawn(async move { pump::tun_to_tunnel(out_tun, &mut a_writer, c, e).await });

    let in_tun = b_tun.clone();
    let pool = Arc::new(BufferPool::new(8, pump::recv_buf_len(4, MTU)));
    let (c, e) = (cancel.clone(), errors.clone());
    tokio::spawn(async move { pump::tunnel_to_tun(&mut b_read, in_tun, None, pool, c, e).await });

    // Reverse direction reuses the same machinery.
    let mut b_writer = TunnelWriter::new(b_write, None);
    let out_tun = b_tun.clone();
    let (c, e) = (cancel.clone(), errors.clone());
    tokio::spawn(async move { pump::tun_to_tunnel(out_tun, &mut b_writer, c, e).await });

    let in_tun = a_tun.clone();
    let pool = Arc::new(BufferPool::new(8, pump::recv_buf_len(0, MTU)));
    let (c, e) = (cancel.clone(), errors.clone());
    tokio::spawn(async move { pump::tunnel_to_tun(&mut a_read, in_tun, None, pool, c, e).await });

    a_handle.inject.send(vec![1, 2, 3]).await.unwrap();
    let got = timeout(Duration::from_secs(1), b_handle.written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, vec![1, 2, 3]);

    b_handle.inject.send(vec![9, 8]).await.unwrap();
    let mut a_handle = a_handle;
    let got = timeout(Duration::from_secs(1), a_handle.written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, vec![9, 8]);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn padding_frames_never_reach_the_tun() {
    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let (_a_read, a_write) = tokio::io::split(a_io);
    let (mut b_read, _b_write) = tokio::io::split(b_io);

    let params = FecParams::new(10, 8).unwrap();
    let (a_tun, a_handle) = MemTun::new("a0", MTU, 0, 16);
    let a_tun: Arc<dyn Tun> = Arc::new(a_tun);
    let (b_tun, mut b_handle) = MemTun::new("b0", MTU, 0, 16);
    let b_tun: Arc<dyn Tun> = Arc::new(b_tun);

    let cancel = CancellationToken::new();
    let (errors, _errors_rx) = mpsc::channel::<Error>(4);

    let encoder = Some(Arc::new(FecEncoder::new(params)));
    let mut writer = TunnelWriter::new(a_write, encoder);
    let out_tun = a_tun.clone();
    let (c, e) = (cancel.clone(), errors.clone());
    tokio::spawn(async move { pump::tun_to_tunnel(out_tun, &mut writer, c, e).await });

    let in_tun = b_tun.clone();
    let pool = Arc::new(BufferPool::new(8, pump::recv_buf_len(0, MTU)));
    let (c, e) = (cancel.clone(), errors.clone());
    tokio::spawn(async move {
        pump::tunnel_to_tun(&mut b_read, in_tun, Some(params), pool, c, e).await
    });

    // A lone packet forces a padded partial-block flush: the receiver must
    // deliver exactly one packet, never the padding or redundancy frames.
    a_handle.inject.send(vec![0x45, 1, 2, 3]).await.unwrap();
    let got = timeout(Duration::from_secs(1), b_handle.written.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, vec![0x45, 1, 2, 3]);

    assert!(
        timeout(Duration::from_millis(200), b_handle.written.recv())
            .await
            .is_err(),
        "padding produced a spurious tun write"
    );
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_close_is_graceful_not_an_error() {
    let (a_io, b_io) = tokio::io::duplex(16 * 1024);
    let (_a_read, a_write) = tokio::io::split(a_io);
    let (mut b_read, _b_write) = tokio::io::split(b_io);

    let (tun, _handle) = MemTun::new("b0", MTU, 0, 4);
    let tun: Arc<dyn Tun> = Arc::new(tun);
    let cancel = CancellationToken::new();
    let (errors, mut errors_rx) = mpsc::channel::<Error>(4);

    let pool = Arc::new(BufferPool::new(4, pump::recv_buf_len(0, MTU)));
    let (c, e) = (cancel.clone(), errors.clone());
    let inbound = tokio::spawn(async move {
        pump::tunnel_to_tun(&mut b_read, tun, None, pool, c, e).await
    });

    // Dropping the peer's write half is EOF on the length prefix.
    drop(a_write);
    timeout(Duration::from_secs(1), inbound)
        .await
        .expect("pump exits on eof")
        .unwrap();
    drop(errors);
    assert!(
        errors_rx.recv().await.is_none(),
        "eof must not be reported as a fault"
    );
}
