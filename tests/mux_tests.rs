use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use chezdav::mux;
use chezdav::outq::OutputQueue;

// The host side of the pipe, split in two directions, plus a running
// mux service with its own TCP listener.
async fn start_mux() -> (
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
    std::net::SocketAddr,
    CancellationToken,
    tokio::task::JoinHandle<std::io::Result<()>>,
) {
    let (host_side, mux_side) = tokio::io::duplex(1 << 16);
    let (host_rd, host_wr) = tokio::io::split(host_side);
    let (mux_rd, mux_wr) = tokio::io::split(mux_side);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(mux::run(mux_rd, mux_wr, listener, cancel.clone()));
    (host_rd, host_wr, addr, cancel, handle)
}

#[tokio::test]
async fn test_mux_frame_delivery() {
    let (mut host_rd, mut host_wr, addr, cancel, handle) = start_mux().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    // the client's bytes arrive framed; this teaches us its id.
    let (id, payload) = mux::read_frame(&mut host_rd).await.unwrap();
    assert_eq!(&payload[..], b"ping");

    // a frame addressed to that id lands on the client socket, in order.
    host_wr
        .write_all(&mux::encode_frame(id, b"hello"))
        .await
        .unwrap();
    host_wr
        .write_all(&mux::encode_frame(id, b" world"))
        .await
        .unwrap();
    let mut buf = [0u8; 11];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello world");

    // frames for unknown ids are discarded, the service stays up.
    host_wr
        .write_all(&mux::encode_frame(0xdead, b"nobody"))
        .await
        .unwrap();

    // a zero-size frame half-closes the client.
    host_wr
        .write_all(&mux::encode_frame(id, &[]))
        .await
        .unwrap();
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    cancel.cancel();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn test_mux_client_eof_sends_zero_frame() {
    let (mut host_rd, _host_wr, addr, cancel, handle) = start_mux().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"bye").await.unwrap();
    let (id, payload) = mux::read_frame(&mut host_rd).await.unwrap();
    assert_eq!(&payload[..], b"bye");

    drop(client);
    let (eof_id, payload) = mux::read_frame(&mut host_rd).await.unwrap();
    assert_eq!(eof_id, id);
    assert!(payload.is_empty());

    cancel.cancel();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn test_mux_two_clients_have_distinct_ids() {
    let (mut host_rd, mut host_wr, addr, cancel, handle) = start_mux().await;

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(b"one").await.unwrap();
    let (id1, p1) = mux::read_frame(&mut host_rd).await.unwrap();
    assert_eq!(&p1[..], b"one");

    let mut c2 = TcpStream::connect(addr).await.unwrap();
    c2.write_all(b"two").await.unwrap();
    let (id2, p2) = mux::read_frame(&mut host_rd).await.unwrap();
    assert_eq!(&p2[..], b"two");
    assert_ne!(id1, id2);

    // routing is per id.
    host_wr
        .write_all(&mux::encode_frame(id2, b"2nd"))
        .await
        .unwrap();
    let mut buf = [0u8; 3];
    c2.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"2nd");

    host_wr
        .write_all(&mux::encode_frame(id1, b"1st"))
        .await
        .unwrap();
    c1.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"1st");

    cancel.cancel();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn test_mux_pipe_eof_is_fatal() {
    let (host_rd, host_wr, addr, _cancel, handle) = start_mux().await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    // closing the host side of the pipe tears the whole service down.
    drop(host_rd);
    drop(host_wr);
    assert!(handle.await.unwrap().is_err());

    // ... including the client socket.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_output_queue_payload_order_through_pipe() {
    // a sequence of pushes arrives contiguous and in order on the far
    // side, interleaved with nothing.
    let (host_side, mux_side) = tokio::io::duplex(256);
    let q = OutputQueue::new(mux_side);

    let frames: Vec<Bytes> = (0u8..20)
        .map(|i| mux::encode_frame(i as u64, &vec![i; (i as usize) * 37 % 512]))
        .collect();
    // queue everything up front; the writer drains as the reader keeps up.
    let completions: Vec<_> = frames.iter().map(|f| q.push(f.clone())).collect();

    let (mut host_rd, _host_wr) = tokio::io::split(host_side);
    for (i, f) in frames.iter().enumerate() {
        let (id, payload) = mux::read_frame(&mut host_rd).await.unwrap();
        assert_eq!(id, i as u64);
        assert_eq!(&payload[..], &f[10..]);
    }
    for c in completions {
        c.await.unwrap();
    }
}
