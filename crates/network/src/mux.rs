//! Stream multiplexing over a session's TCP connection
//!
//! A [`Mux`] owns one driver task that polls the `yamux::Connection`. Opening
//! a sub-stream sends a request to the driver; inbound sub-streams are pushed
//! into a bounded channel read by [`Mux::accept`].

use std::collections::VecDeque;
use std::future::Future;
use std::task::Poll;

use futures::future::poll_fn;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sub-stream handed out by [`Mux`], adapted to tokio's I/O traits.
pub type SubStream = Compat<yamux::Stream>;

const INBOUND_BUFFER: usize = 64;
const OPEN_BUFFER: usize = 16;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("multiplexer shut down")]
    Shutdown,
    #[error("multiplexer connection failed: {0}")]
    Connection(#[from] yamux::ConnectionError),
}

type OpenReply = oneshot::Sender<Result<yamux::Stream, MuxError>>;

pub struct Mux {
    open_tx: mpsc::Sender<OpenReply>,
    inbound_rx: Mutex<mpsc::Receiver<yamux::Stream>>,
    cancel: CancellationToken,
}

impl Mux {
    /// Start multiplexing `io`. The driver stops when `cancel` fires or the
    /// connection fails, and cancels `cancel` on its way out.
    pub fn new<T>(io: T, mode: yamux::Mode, cancel: CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = yamux::Connection::new(
            TokioAsyncReadCompatExt::compat(io),
            yamux::Config::default(),
            mode,
        );
        let (open_tx, open_rx) = mpsc::channel(OPEN_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(drive(conn, open_rx, inbound_tx, cancel.clone()));

        Self {
            open_tx,
            inbound_rx: Mutex::new(inbound_rx),
            cancel,
        }
    }

    pub async fn open(&self) -> Result<SubStream, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.open_tx.send(tx).await.map_err(|_| MuxError::Shutdown)?;
        let stream = rx.await.map_err(|_| MuxError::Shutdown)??;
        Ok(FuturesAsyncReadCompatExt::compat(stream))
    }

    pub async fn accept(&self) -> Result<SubStream, MuxError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream
                .map(FuturesAsyncReadCompatExt::compat)
                .ok_or(MuxError::Shutdown),
            _ = self.cancel.cancelled() => Err(MuxError::Shutdown),
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive<T>(
    mut conn: yamux::Connection<T>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
    cancel: CancellationToken,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut pending: VecDeque<OpenReply> = VecDeque::new();
    let cancelled = cancel.cancelled();
    tokio::pin!(cancelled);

    let result: Result<(), MuxError> = poll_fn(|cx| {
        if cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }

        while let Poll::Ready(Some(reply)) = open_rx.poll_recv(cx) {
            pending.push_back(reply);
        }
        while !pending.is_empty() {
            match conn.poll_new_outbound(cx) {
                Poll::Ready(res) => {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(res.map_err(MuxError::from));
                    }
                }
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound_tx.try_send(stream).is_err() {
                        warn!("Inbound sub-stream buffer full, dropping stream");
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e.into())),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    match result {
        Ok(()) => {
            if let Err(e) = poll_fn(|cx| conn.poll_close(cx)).await {
                debug!(error = %e, "Multiplexer close failed");
            }
        }
        Err(e) => debug!(error = %e, "Multiplexer connection ended"),
    }
    for reply in pending {
        let _ = reply.send(Err(MuxError::Shutdown));
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn pair() -> (Mux, Mux, CancellationToken, CancellationToken) {
        let (a, b) = duplex(64 * 1024);
        let (ca, cb) = (CancellationToken::new(), CancellationToken::new());
        (
            Mux::new(a, yamux::Mode::Client, ca.clone()),
            Mux::new(b, yamux::Mode::Server, cb.clone()),
            ca,
            cb,
        )
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (client, server, _, _) = pair();

        let accept = tokio::spawn(async move {
            let mut s = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            s.flush().await.unwrap();
            server
        });

        let mut s = client.open().await.unwrap();
        s.write_all(b"hello").await.unwrap();
        s.flush().await.unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_peer() {
        let (client, server, _, cb) = pair();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.open().await, Err(MuxError::Shutdown)));

        tokio::time::timeout(Duration::from_secs(5), cb.cancelled())
            .await
            .unwrap();
        assert!(matches!(server.accept().await, Err(MuxError::Shutdown)));
    }
}
