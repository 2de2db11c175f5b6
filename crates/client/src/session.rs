use std::sync::Arc;
use std::time::Duration;

use dmsg_core::{Addr, DmsgError, PublicKey};
use dmsg_crypto::{HandshakePattern, Keypair, Noise};
use dmsg_network::{
    Inbound, Porter, SessionCommon, SessionError, Signed, StreamRequest, StreamResponse,
    SubStream, TimestampClock, TimestampTracker,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::{PortEntry, Stream, StreamMeta};
use crate::{ClientError, Result};

/// State shared by every session of one client.
pub(crate) struct StreamContext {
    pub keypair: Arc<Keypair>,
    pub porter: Porter<PortEntry>,
    pub tracker: TimestampTracker,
    pub clock: TimestampClock,
    pub handshake_timeout: Duration,
    pub cancel: CancellationToken,
}

/// A client's session with one relay.
#[derive(Clone)]
pub struct ClientSession {
    session: Arc<SessionCommon>,
    ctx: Arc<StreamContext>,
}

impl ClientSession {
    pub(crate) fn new(session: Arc<SessionCommon>, ctx: Arc<StreamContext>) -> Self {
        Self { session, ctx }
    }

    pub fn common(&self) -> &Arc<SessionCommon> {
        &self.session
    }

    pub fn local_pk(&self) -> PublicKey {
        self.session.local_pk()
    }

    /// The relay's key.
    pub fn remote_pk(&self) -> PublicKey {
        self.session.remote_pk()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub async fn ping(&self) -> Result<Duration> {
        Ok(self.session.ping().await?)
    }

    pub fn close(&self) -> bool {
        self.session.close()
    }

    /// Open a stream to `dst` through this session's relay.
    ///
    /// A failed handshake only costs the sub-stream; the session stays up.
    pub async fn dial_stream(&self, dst: Addr) -> Result<Stream> {
        if self.ctx.cancel.is_cancelled() {
            return Err(DmsgError::EntityClosed.into());
        }
        let local_pk = self.local_pk();
        let server = self.remote_pk();
        let mut sub = self.session.open_sub_stream().await?;
        let stream_id = sub.get_ref().id().val();
        let (port, reservation) = self.ctx.porter.reserve_ephemeral(&self.ctx.cancel, |port| {
            PortEntry::Stream(StreamMeta {
                local: Addr::new(local_pk, port),
                remote: dst,
                server,
                stream_id,
            })
        })?;
        let local = Addr::new(local_pk, port);

        let handshake = async {
            let mut noise = Noise::new(HandshakePattern::KK, &self.ctx.keypair, Some(dst.pk), true)?;
            let req = Signed::sign(
                StreamRequest {
                    timestamp: self.ctx.clock.next(),
                    src: local,
                    dst,
                    noise_msg: noise.write_message(&[])?,
                },
                &self.ctx.keypair,
            )?;
            self.session.write_object(&mut sub, req.raw()).await?;

            let resp = Signed::<StreamResponse>::decode(self.session.read_object(&mut sub).await?)?;
            resp.verify(&req, Some(&server))?;
            noise.read_message(&resp.noise_msg)?;
            Ok::<_, ClientError>(noise.into_transport()?)
        };
        let transport = tokio::time::timeout(self.ctx.handshake_timeout, handshake)
            .await
            .map_err(|_| ClientError::Timeout)??;

        debug!(local_addr = %local, remote_addr = %dst, relay = %server, "Dialed stream");
        Ok(Stream::new(sub, transport, local, dst, server, Some(reservation)))
    }

    /// Accept streams from the relay until the session ends.
    ///
    /// Returns the error that ended the session.
    pub(crate) async fn serve(&self) -> SessionError {
        let remote_pk = self.remote_pk();
        loop {
            let sub = match self.session.accept_sub_stream().await {
                Ok(sub) => sub,
                Err(e) => {
                    if e.is_closed() {
                        debug!(remote_pk = %remote_pk, "Session stopped");
                    } else {
                        warn!(remote_pk = %remote_pk, error = %e, "Failed to accept stream, stopping session");
                    }
                    return e;
                }
            };

            let stream_id = sub.get_ref().id();
            let this = self.clone();
            tokio::spawn(async move {
                let accepted =
                    tokio::time::timeout(this.ctx.handshake_timeout, this.accept_stream(sub))
                        .await
                        .unwrap_or(Err(ClientError::Timeout));
                if let Err(e) = accepted {
                    debug!(%stream_id, error = %e, "Inbound stream failed");
                }
            });
        }
    }

    async fn accept_stream(&self, mut sub: SubStream) -> Result<()> {
        let raw = match self.session.read_inbound(&mut sub).await? {
            Inbound::Object(raw) => raw,
            Inbound::Probe => return Ok(self.session.answer_probe(sub).await?),
        };
        let req = Signed::<StreamRequest>::decode(raw)?;

        if let Err(code) = self.check_request(&req) {
            self.reject(&mut sub, &req, code).await;
            return Err(code.into());
        }
        let listener = match self.ctx.porter.port_value(req.dst.port) {
            Some(PortEntry::Listener(entry)) => entry.upgrade(),
            _ => None,
        };
        let listener = match listener {
            Some(listener) => listener,
            None => {
                self.reject(&mut sub, &req, DmsgError::ReqNoListener).await;
                return Err(DmsgError::ReqNoListener.into());
            }
        };
        let slot = match listener.reserve_slot() {
            Ok(slot) => slot,
            Err(code) => {
                self.reject(&mut sub, &req, code).await;
                return Err(code.into());
            }
        };

        let mut noise = Noise::new(HandshakePattern::KK, &self.ctx.keypair, Some(req.src.pk), false)?;
        noise.read_message(&req.noise_msg)?;
        let resp = Signed::sign(
            StreamResponse::accept(req.hash(), noise.write_message(&[])?),
            &self.ctx.keypair,
        )?;
        self.session.write_object(&mut sub, resp.raw()).await?;
        let transport = noise.into_transport()?;

        info!(src_addr = %req.src, dst_addr = %req.dst, "Accepted stream");
        slot.introduce(Stream::new(sub, transport, req.dst, req.src, self.remote_pk(), None));
        Ok(())
    }

    fn check_request(&self, req: &Signed<StreamRequest>) -> std::result::Result<(), DmsgError> {
        if req.dst.pk != self.local_pk() {
            return Err(DmsgError::ReqInvalidDstPk);
        }
        self.ctx.tracker.verify(req)
    }

    async fn reject(&self, sub: &mut SubStream, req: &Signed<StreamRequest>, code: DmsgError) {
        debug!(src_addr = %req.src, dst_addr = %req.dst, error = %code, "Rejecting stream");
        let resp = match Signed::sign(StreamResponse::reject(req.hash(), code), &self.ctx.keypair) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "Failed to sign stream rejection");
                return;
            }
        };
        if let Err(e) = self.session.write_object(sub, resp.raw()).await {
            debug!(error = %e, "Failed to send stream rejection");
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("local_pk", &self.local_pk())
            .field("remote_pk", &self.remote_pk())
            .field("closed", &self.is_closed())
            .finish()
    }
}
