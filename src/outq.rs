//! Serialized write queue over an arbitrary byte sink.
//!
//! Pushed buffers are written strictly in push order, one at a time, each
//! followed by a flush. Every push resolves a completion exactly once,
//! with the write result. Cancelling fails all pending and future pushes.
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Handle to a write queue. Cheap to clone; all clones feed the same
/// single-flight writer.
#[derive(Clone, Debug)]
pub struct OutputQueue {
    tx: mpsc::UnboundedSender<(Bytes, oneshot::Sender<io::Result<()>>)>,
    cancel: CancellationToken,
}

/// Resolves when the corresponding push has been written and flushed,
/// or failed.
pub struct Completion(oneshot::Receiver<io::Result<()>>);

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "output queue cancelled")
}

impl Future for Completion {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            // the queue was cancelled before this push was written.
            Poll::Ready(Err(_)) => Poll::Ready(Err(cancelled_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl OutputQueue {
    /// Start a queue writing to `sink`. The writer task runs until the
    /// queue is cancelled or every handle is dropped.
    pub fn new<W>(mut sink: W) -> OutputQueue
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Bytes, oneshot::Sender<io::Result<()>>)>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let (buf, done) = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                // a cancel also aborts the write in flight.
                let res = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(cancelled_error()),
                    res = write_one(&mut sink, &buf) => res,
                };
                if let Err(ref e) = res {
                    debug!("output queue: write failed: {}", e);
                }
                let _ = done.send(res);
                if token.is_cancelled() {
                    break;
                }
            }
            // fail whatever is still queued.
            rx.close();
            while let Some((_, done)) = rx.recv().await {
                let _ = done.send(Err(cancelled_error()));
            }
        });

        OutputQueue { tx, cancel }
    }

    /// Submit a buffer. The returned completion resolves exactly once.
    pub fn push(&self, buf: Bytes) -> Completion {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send((buf, done_tx)).is_err() {
            // the writer is gone; done_tx was dropped, so the completion
            // resolves with the cancellation error.
        }
        Completion(done_rx)
    }

    /// Push and wait for the write to finish.
    pub async fn write(&self, buf: Bytes) -> io::Result<()> {
        self.push(buf).await
    }

    /// Abort the queue: future pushes fail, pending completions resolve
    /// with an error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn write_one<W>(sink: &mut W, buf: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(buf).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writes_are_ordered_and_contiguous() {
        let (client, mut server) = tokio::io::duplex(64);
        let q = OutputQueue::new(client);

        let mut completions = Vec::new();
        for i in 0..50u8 {
            completions.push(q.push(Bytes::from(vec![i; 100])));
        }

        let reader = tokio::spawn(async move {
            let mut all = Vec::new();
            let mut buf = [0u8; 512];
            while all.len() < 50 * 100 {
                let n = server.read(&mut buf).await.unwrap();
                assert!(n > 0);
                all.extend_from_slice(&buf[..n]);
            }
            all
        });

        for c in completions {
            c.await.unwrap();
        }
        let all = reader.await.unwrap();
        for (i, chunk) in all.chunks(100).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn cancel_fails_pending() {
        // a tiny duplex buffer so pushes back up behind the first write.
        let (client, _server) = tokio::io::duplex(8);
        let q = OutputQueue::new(client);

        let c1 = q.push(Bytes::from(vec![0u8; 1024]));
        let c2 = q.push(Bytes::from(vec![1u8; 1024]));
        q.cancel();

        // both eventually resolve, the second one with an error.
        let _ = c1.await;
        assert!(c2.await.is_err());
        assert!(q.write(Bytes::from_static(b"more")).await.is_err());
    }
}
