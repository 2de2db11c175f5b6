use std::sync::Arc;
use std::time::Duration;

use dmsg_core::DmsgError;
use dmsg_crypto::Keypair;
use dmsg_network::{
    EntityCommon, Inbound, SessionCommon, Signed, StreamRequest, StreamResponse, SubStream,
    TimestampTracker,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::metrics::{Delta, ServerMetrics};
use crate::{RelayError, Result};

/// State shared by every session of one relay.
pub(crate) struct RelayContext {
    pub entity: Arc<EntityCommon>,
    pub keypair: Arc<Keypair>,
    pub tracker: TimestampTracker,
    pub metrics: Arc<dyn ServerMetrics>,
    pub handshake_timeout: Duration,
    pub max_streams_per_session: usize,
}

/// A client's session as seen by the relay.
#[derive(Clone)]
pub struct ServerSession {
    session: Arc<SessionCommon>,
    ctx: Arc<RelayContext>,
    stream_limit: Option<Arc<Semaphore>>,
}

impl ServerSession {
    pub(crate) fn new(session: Arc<SessionCommon>, ctx: Arc<RelayContext>) -> Self {
        let stream_limit = match ctx.max_streams_per_session {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            session,
            ctx,
            stream_limit,
        }
    }

    pub fn session(&self) -> &Arc<SessionCommon> {
        &self.session
    }

    /// Accept sub-streams until the session ends, relaying each one.
    pub async fn serve(&self) {
        let remote_pk = self.session.remote_pk();
        self.ctx.metrics.record_session(Delta::Connect);

        loop {
            let sub = match self.session.accept_sub_stream().await {
                Ok(sub) => sub,
                Err(e) if e.is_closed() => {
                    info!(remote_pk = %remote_pk, "Stopping session");
                    break;
                }
                Err(e) => {
                    warn!(remote_pk = %remote_pk, error = %e, "Failed to accept stream, stopping session");
                    break;
                }
            };

            let stream_id = sub.get_ref().id();
            debug!(remote_pk = %remote_pk, %stream_id, "Initiating stream");
            let this = self.clone();
            tokio::spawn(async move {
                match this.serve_stream(sub).await {
                    Ok(()) => debug!(%stream_id, "Stopped stream"),
                    Err(e) => debug!(%stream_id, error = %e, "Stopped stream"),
                }
            });
        }

        self.ctx.metrics.record_session(Delta::Disconnect);
    }

    async fn serve_stream(&self, mut sub: SubStream) -> Result<()> {
        let raw = match tokio::time::timeout(
            self.ctx.handshake_timeout,
            self.session.read_inbound(&mut sub),
        )
        .await
        {
            Ok(Ok(Inbound::Object(raw))) => raw,
            Ok(Ok(Inbound::Probe)) => return Ok(self.session.answer_probe(sub).await?),
            Ok(Err(e)) => {
                self.ctx.metrics.record_stream(Delta::Failed);
                return Err(e.into());
            }
            Err(_) => {
                self.ctx.metrics.record_stream(Delta::Failed);
                return Err(RelayError::Timeout);
            }
        };
        let req = match Signed::<StreamRequest>::decode(raw) {
            Ok(req) => req,
            Err(e) => {
                self.ctx.metrics.record_stream(Delta::Failed);
                return Err(e.into());
            }
        };

        let (next, _permit) = match self.admit(&req) {
            Ok(admitted) => admitted,
            Err(code) => {
                self.ctx.metrics.record_stream(Delta::Failed);
                self.reject(&mut sub, &req, code).await;
                return Err(code.into());
            }
        };
        debug!(src_addr = %req.src, dst_addr = %req.dst, "Read stream request from initiating side");

        let forwarded = tokio::time::timeout(
            self.ctx.handshake_timeout,
            forward_request(&next, &req),
        )
        .await
        .unwrap_or(Err(RelayError::Timeout));
        let (mut next_sub, resp) = match forwarded {
            Ok(forwarded) => forwarded,
            Err(e) => {
                self.ctx.metrics.record_stream(Delta::Failed);
                self.reject(&mut sub, &req, e.code()).await;
                return Err(e);
            }
        };

        if let Err(e) = self.session.write_object(&mut sub, resp.raw()).await {
            self.ctx.metrics.record_stream(Delta::Failed);
            return Err(e.into());
        }
        if !resp.accepted {
            debug!(src_addr = %req.src, dst_addr = %req.dst, "Forwarded stream rejection");
            self.ctx.metrics.record_stream(Delta::Failed);
            return Ok(());
        }

        info!(src_addr = %req.src, dst_addr = %req.dst, "Serving stream");
        self.ctx.metrics.record_stream(Delta::Connect);
        let result = tokio::io::copy_bidirectional(&mut sub, &mut next_sub).await;
        self.ctx.metrics.record_stream(Delta::Disconnect);
        result?;
        Ok(())
    }

    /// Checks a request may be relayed and finds the destination's session.
    fn admit(
        &self,
        req: &Signed<StreamRequest>,
    ) -> std::result::Result<(Arc<SessionCommon>, Option<OwnedSemaphorePermit>), DmsgError> {
        if req.src.pk != self.session.remote_pk() {
            return Err(DmsgError::ReqInvalidSrcPk);
        }
        self.ctx.tracker.verify(req)?;

        let next = self
            .ctx
            .entity
            .session(&req.dst.pk)
            .ok_or(DmsgError::ReqNoNextSession)?;
        let permit = match &self.stream_limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| DmsgError::ReqStreamLimit)?,
            ),
            None => None,
        };
        Ok((next, permit))
    }

    /// Best-effort relay-signed rejection.
    async fn reject(&self, sub: &mut SubStream, req: &Signed<StreamRequest>, code: DmsgError) {
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

/// Pass `req` to the destination over `next` and return its verified answer.
async fn forward_request(
    next: &SessionCommon,
    req: &Signed<StreamRequest>,
) -> Result<(SubStream, Signed<StreamResponse>)> {
    let mut sub = next.open_sub_stream().await?;
    next.write_object(&mut sub, req.raw()).await?;
    let resp = Signed::<StreamResponse>::decode(next.read_object(&mut sub).await?)?;
    resp.verify_binding(req, None)?;
    Ok((sub, resp))
}
