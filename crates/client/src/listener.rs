use std::sync::{Arc, Weak};

use dmsg_core::{Addr, DmsgError, ACCEPT_BUFFER_SIZE};
use dmsg_network::{Lifecycle, PortReservation, Porter};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::{PortEntry, Stream};
use crate::{ClientError, Result};

/// Accept point for streams addressed to one local port.
///
/// Cloning yields another handle to the same listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    addr: Addr,
    porter: Porter<PortEntry>,
    tx: mpsc::Sender<Stream>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    reservation: Mutex<Option<PortReservation<PortEntry>>>,
    life: Lifecycle,
    closed: CancellationToken,
}

/// What the porter keeps for a listening port.
///
/// Does not keep the listener alive: once the last [`Listener`] handle is
/// dropped the port is freed.
#[derive(Clone)]
pub struct ListenerRef(Weak<ListenerInner>);

impl ListenerRef {
    /// The listener, unless every handle to it is gone.
    pub fn upgrade(&self) -> Option<Listener> {
        self.0.upgrade().map(|inner| Listener { inner })
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.closed.cancel();
        if let Some(reservation) = self.reservation.get_mut().take() {
            reservation.release();
        }
        debug!(addr = %self.addr, "Listener dropped");
    }
}

/// A free slot in a listener's accept queue.
pub(crate) struct AcceptSlot(mpsc::OwnedPermit<Stream>);

impl AcceptSlot {
    pub(crate) fn introduce(self, stream: Stream) {
        self.0.send(stream);
    }
}

impl Listener {
    /// Reserve `addr.port` on `porter` and listen on it.
    pub(crate) fn bind(porter: &Porter<PortEntry>, addr: Addr) -> Result<Self> {
        let (tx, rx) = mpsc::channel(ACCEPT_BUFFER_SIZE);
        let inner = Arc::new(ListenerInner {
            addr,
            porter: porter.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            reservation: Mutex::new(None),
            life: Lifecycle::new(),
            closed: CancellationToken::new(),
        });
        let entry = PortEntry::Listener(ListenerRef(Arc::downgrade(&inner)));
        let reservation = porter.reserve(addr.port, entry)?;
        *inner.reservation.lock() = Some(reservation);
        Ok(Self { inner })
    }

    pub fn addr(&self) -> Addr {
        self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.life.is_open()
    }

    /// Queue a handshaken stream. Never blocks: a full queue drops the
    /// stream.
    pub fn introduce(&self, stream: Stream) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::ClosedPipe);
        }
        self.inner.tx.try_send(stream).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DmsgError::AcceptChanMaxed.into(),
            mpsc::error::TrySendError::Closed(_) => ClientError::ClosedPipe,
        })
    }

    /// Claim room in the accept queue before answering a stream request.
    pub(crate) fn reserve_slot(&self) -> std::result::Result<AcceptSlot, DmsgError> {
        if self.is_closed() {
            return Err(DmsgError::ReqNoListener);
        }
        self.inner
            .tx
            .clone()
            .try_reserve_owned()
            .map(AcceptSlot)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DmsgError::AcceptChanMaxed,
                mpsc::error::TrySendError::Closed(_) => DmsgError::ReqNoListener,
            })
    }

    /// Wait for the next stream.
    ///
    /// The stream's remote port is reserved under this listener's port; a
    /// stream whose remote port is already in use here is dropped.
    pub async fn accept(&self) -> Result<Stream> {
        loop {
            let next = {
                let mut rx = self.inner.rx.lock().await;
                let next = tokio::select! {
                    biased;
                    _ = self.inner.closed.cancelled() => None,
                    stream = rx.recv() => stream,
                };
                if next.is_none() {
                    // close() could not take the queue while we held it.
                    drain(&mut rx);
                }
                next
            };
            let mut stream = next.ok_or(ClientError::ClosedPipe)?;

            let remote = stream.remote_addr();
            match self.inner.porter.reserve_child(
                self.inner.addr.port,
                remote.port,
                PortEntry::Stream(stream.meta()),
            ) {
                Ok(reservation) => {
                    stream.attach_reservation(reservation);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        local_addr = %self.inner.addr,
                        remote_addr = %remote,
                        error = %e,
                        "Dropping accepted stream"
                    );
                }
            }
        }
    }

    /// Idempotent. Drops queued streams and frees the port.
    pub fn close(&self) {
        if !self.inner.life.begin_close() {
            return;
        }
        self.inner.closed.cancel();
        let reservation = self.inner.reservation.lock().take();
        if let Some(reservation) = reservation {
            reservation.release();
        }
        // A blocked accept() holds the queue and drains it itself.
        if let Ok(mut rx) = self.inner.rx.try_lock() {
            drain(&mut rx);
        }
        self.inner.life.finish_close();
        debug!(addr = %self.inner.addr, "Listener closed");
    }
}

/// Close the queue and drop whatever is waiting in it.
fn drain(rx: &mut mpsc::Receiver<Stream>) {
    rx.close();
    while rx.try_recv().is_ok() {}
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
