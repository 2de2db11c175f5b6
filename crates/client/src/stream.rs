use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use dmsg_core::{Addr, PublicKey};
use dmsg_crypto::Transport;
use dmsg_network::{NoiseStream, PortReservation, SubStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

use crate::listener::ListenerRef;

/// What a client's porter holds for a port.
#[derive(Clone)]
pub enum PortEntry {
    Listener(ListenerRef),
    Stream(StreamMeta),
}

/// Endpoints of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
    pub local: Addr,
    pub remote: Addr,
    /// Relay carrying the stream.
    pub server: PublicKey,
    pub stream_id: u32,
}

/// An established end-to-end encrypted stream.
///
/// Holds the porter reservation for its local port (dialed streams) or for
/// its remote port under the listener's port (accepted streams). The
/// reservation is released when the stream is closed or dropped.
pub struct Stream {
    io: NoiseStream<SubStream>,
    meta: StreamMeta,
    reservation: Option<PortReservation<PortEntry>>,
}

impl Stream {
    pub(crate) fn new(
        sub: SubStream,
        transport: Transport,
        local: Addr,
        remote: Addr,
        server: PublicKey,
        reservation: Option<PortReservation<PortEntry>>,
    ) -> Self {
        let stream_id = sub.get_ref().id().val();
        Self {
            io: NoiseStream::new(sub, transport),
            meta: StreamMeta {
                local,
                remote,
                server,
                stream_id,
            },
            reservation,
        }
    }

    pub(crate) fn attach_reservation(&mut self, reservation: PortReservation<PortEntry>) {
        self.reservation = Some(reservation);
    }

    pub fn local_addr(&self) -> Addr {
        self.meta.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.meta.remote
    }

    pub fn server_pk(&self) -> PublicKey {
        self.meta.server
    }

    pub fn stream_id(&self) -> u32 {
        self.meta.stream_id
    }

    pub fn meta(&self) -> StreamMeta {
        self.meta
    }

    /// Release the port reservation, then close the write side.
    pub async fn close(mut self) -> io::Result<()> {
        if let Some(reservation) = self.reservation.take() {
            reservation.release();
        }
        debug!(
            local_addr = %self.meta.local,
            remote_addr = %self.meta.remote,
            stream_id = self.meta.stream_id,
            "Closing stream"
        );
        self.io.shutdown().await
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("meta", &self.meta)
            .field("reservation", &self.reservation)
            .finish()
    }
}
