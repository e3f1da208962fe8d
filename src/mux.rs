//! Channel multiplexer.
//!
//! Carries many TCP sessions over one bidirectional byte stream (typically
//! a virtio serial port). Each accepted socket becomes a client with a
//! unique 64-bit id; traffic is framed as
//! `client_id: u64 LE | size: u16 LE | payload`, a zero size signalling
//! half-close of that client.
//!
//! Both pipelines preserve backpressure: a client's next socket read is
//! not armed until its previous frame is fully on the pipe, and the pipe
//! reader does not pick up the next frame until the previous payload has
//! been accepted by the destination client's write queue. An I/O error on
//! the pipe is fatal to the whole service; a socket error only drops that
//! client.
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::outq::OutputQueue;

/// Maximum payload carried by one frame.
pub const MAX_PAYLOAD: usize = 65535;

/// Well-known pipe device path on this platform.
#[cfg(target_os = "macos")]
pub const DEFAULT_PIPE_PATH: &str = "/dev/tty.org.spice-space.webdav.0";
#[cfg(windows)]
pub const DEFAULT_PIPE_PATH: &str = r"\\.\Global\org.spice-space.webdav.0";
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_PIPE_PATH: &str = "/dev/virtio-ports/org.spice-space.webdav.0";

type Clients = Arc<Mutex<HashMap<u64, OutputQueue>>>;

/// Encode one frame.
pub fn encode_frame(client_id: u64, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut buf = BytesMut::with_capacity(10 + payload.len());
    buf.put_u64_le(client_id);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Read one frame. Any short read is an error.
pub async fn read_frame<R>(r: &mut R) -> io::Result<(u64, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut id = [0u8; 8];
    r.read_exact(&mut id).await?;
    let mut size = [0u8; 2];
    r.read_exact(&mut size).await?;
    let size = u16::from_le_bytes(size) as usize;
    let mut payload = vec![0u8; size];
    r.read_exact(&mut payload).await?;
    Ok((u64::from_le_bytes(id), Bytes::from(payload)))
}

/// Run the multiplexer until the pipe fails or `cancel` fires.
///
/// `pipe_rd`/`pipe_wr` are the two directions of the muxing channel;
/// `listener` accepts the client sockets.
pub async fn run<R, W>(
    pipe_rd: R,
    pipe_wr: W,
    listener: TcpListener,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pipe_q = OutputQueue::new(pipe_wr);
    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));

    let accept = {
        let clients = clients.clone();
        let pipe_q = pipe_q.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut next_id: u64 = 1;
            loop {
                let conn = tokio::select! {
                    _ = cancel.cancelled() => break,
                    conn = listener.accept() => conn,
                };
                match conn {
                    Ok((socket, addr)) => {
                        let id = next_id;
                        next_id += 1;
                        debug!("mux: client {} connected from {}", id, addr);
                        let _ = socket.set_nodelay(true);
                        let (rd, wr) = socket.into_split();
                        clients.lock().insert(id, OutputQueue::new(wr));
                        tokio::spawn(client_to_pipe(
                            id,
                            rd,
                            pipe_q.clone(),
                            clients.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => warn!("mux: accept failed: {}", e),
                }
            }
        })
    };

    let res = demux(pipe_rd, &clients, &cancel).await;

    // fatal or shutting down: drop everything.
    cancel.cancel();
    let _ = accept.await;
    for (_, q) in clients.lock().drain() {
        q.cancel();
    }
    pipe_q.cancel();
    res
}

// Pipe -> clients.
async fn demux<R>(mut pipe_rd: R, clients: &Clients, cancel: &CancellationToken) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut pipe_rd) => frame,
        };
        let (id, payload) = match frame {
            Ok(frame) => frame,
            Err(e) => {
                error!("mux: pipe read failed: {}", e);
                return Err(e);
            }
        };
        if payload.is_empty() {
            debug!("mux: half-close for client {}", id);
            if let Some(q) = clients.lock().remove(&id) {
                q.cancel();
            }
            continue;
        }
        let q = clients.lock().get(&id).cloned();
        match q {
            Some(q) => {
                // hold off the next pipe read until this payload has been
                // handed to the client socket; this bounds demuxer memory
                // to a single frame.
                if q.write(payload).await.is_err() {
                    debug!("mux: client {} write failed, dropping", id);
                    if let Some(q) = clients.lock().remove(&id) {
                        q.cancel();
                    }
                }
            }
            None => trace!("mux: discarding frame for unknown client {}", id),
        }
    }
}

// One client socket -> pipe. A failed write on the shared pipe is fatal
// to the whole service, not just to this client.
async fn client_to_pipe(
    id: u64,
    mut rd: OwnedReadHalf,
    pipe_q: OutputQueue,
    clients: Clients,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PAYLOAD];
    let mut pipe_failed = false;
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                // tell the peer, then drop the client.
                pipe_failed = pipe_q.write(encode_frame(id, &[])).await.is_err();
                break;
            }
            Ok(n) => {
                // re-arm the read only after the frame is on the pipe.
                if let Err(e) = pipe_q.write(encode_frame(id, &buf[..n])).await {
                    error!("mux: pipe write failed: {}", e);
                    pipe_failed = true;
                    break;
                }
            }
            Err(e) => {
                debug!("mux: client {} read failed: {}", id, e);
                pipe_failed = pipe_q.write(encode_frame(id, &[])).await.is_err();
                break;
            }
        }
    }
    if pipe_failed {
        // same teardown path as a pipe read error in demux: every client
        // is dropped and the event loop exits.
        cancel.cancel();
    }
    if let Some(q) = clients.lock().remove(&id) {
        q.cancel();
    }
    debug!("mux: client {} removed", id);
}

/// Wait until the peer end of the (already opened) pipe device is
/// present: poll until `POLLHUP` clears, sleeping one second in between.
#[cfg(unix)]
pub async fn wait_for_peer(file: &std::fs::File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if pfd.revents & libc::POLLHUP == 0 {
            return Ok(());
        }
        debug!("mux: peer not present yet, waiting");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

/// Windows WebDAV drive mapping: find an existing mapping for our share,
/// or attach an unused drive letter after a short grace period.
#[cfg(windows)]
pub mod drive {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use windows_sys::Win32::Foundation::NO_ERROR;
    use windows_sys::Win32::NetworkManagement::WNet::{
        NETRESOURCEW, RESOURCETYPE_DISK, WNetAddConnection2W, WNetCancelConnection2W,
        WNetGetConnectionW, CONNECT_TEMPORARY,
    };

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn remote_path(port: u16) -> String {
        format!(r"\\localhost@{}\DavWWWRoot", port)
    }

    /// A drive letter already bound to our share, if any.
    pub fn find_mapped(port: u16) -> Option<char> {
        let want = remote_path(port).to_ascii_lowercase();
        for letter in b'A'..=b'Z' {
            let local = wide(&format!("{}:", letter as char));
            let mut buf = [0u16; 1024];
            let mut len = buf.len() as u32;
            let rc = unsafe { WNetGetConnectionW(local.as_ptr(), buf.as_mut_ptr(), &mut len) };
            if rc == NO_ERROR {
                let n = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
                if String::from_utf16_lossy(&buf[..n]).to_ascii_lowercase() == want {
                    return Some(letter as char);
                }
            }
        }
        None
    }

    /// Try unused letters from Z: downward. Returns the mapped local name.
    pub async fn map_drive(port: u16, cancel: CancellationToken) -> Option<String> {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        let remote = wide(&remote_path(port));
        for letter in (b'D'..=b'Z').rev() {
            if cancel.is_cancelled() {
                return None;
            }
            let local_str = format!("{}:", letter as char);
            let local = wide(&local_str);
            let mut res: NETRESOURCEW = unsafe { std::mem::zeroed() };
            res.dwType = RESOURCETYPE_DISK;
            res.lpLocalName = local.as_ptr() as *mut u16;
            res.lpRemoteName = remote.as_ptr() as *mut u16;
            let rc = unsafe {
                WNetAddConnection2W(&res, std::ptr::null(), std::ptr::null(), CONNECT_TEMPORARY)
            };
            if rc == NO_ERROR {
                return Some(local_str);
            }
        }
        None
    }

    /// Disconnect a mapping made by `map_drive`.
    pub fn unmap(local: &str) {
        let local = wide(local);
        unsafe { WNetCancelConnection2W(local.as_ptr(), 0, 1) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let frames: Vec<(u64, Vec<u8>)> = vec![
            (1, b"hello".to_vec()),
            (u64::MAX, vec![0xab; MAX_PAYLOAD]),
            (2, Vec::new()),
            (1, b"world".to_vec()),
        ];
        let mut wire = Vec::new();
        for (id, payload) in &frames {
            wire.extend_from_slice(&encode_frame(*id, payload));
        }
        let mut rd = &wire[..];
        for (id, payload) in &frames {
            let (did, dpayload) = read_frame(&mut rd).await.unwrap();
            assert_eq!(did, *id);
            assert_eq!(&dpayload[..], &payload[..]);
        }
        // nothing left over.
        assert!(read_frame(&mut rd).await.is_err());
    }

    #[test]
    fn frame_layout_is_little_endian() {
        let f = encode_frame(0x0102030405060708, b"\xff");
        assert_eq!(
            &f[..],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x01, 0x00, 0xff]
        );
    }
}
