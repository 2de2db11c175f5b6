use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dmsg_core::{PublicKey, ServerConfig};
use dmsg_crypto::Keypair;
use dmsg_disc::{DiscError, DiscoveryClient};
use dmsg_network::{
    EntityCommon, Retrier, RetryError, SessionCommon, SessionObserver, TimestampTracker,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::metrics::{Delta, ServerMetrics};
use crate::session::{RelayContext, ServerSession};
use crate::{RelayError, Result};

/// Republishes the relay entry whenever the session count changes.
struct ServerEntryObserver {
    addr: Arc<OnceLock<String>>,
    max_sessions: usize,
}

#[async_trait]
impl SessionObserver for ServerEntryObserver {
    async fn on_session_established(&self, entity: &EntityCommon) -> std::result::Result<(), DiscError> {
        self.update(entity).await
    }

    async fn on_session_closed(&self, entity: &EntityCommon) -> std::result::Result<(), DiscError> {
        self.update(entity).await
    }
}

impl ServerEntryObserver {
    async fn update(&self, entity: &EntityCommon) -> std::result::Result<(), DiscError> {
        match self.addr.get() {
            Some(addr) if !entity.is_closed() => {
                entity.update_server_entry(addr, self.max_sessions).await
            }
            _ => Ok(()),
        }
    }
}

/// A relay ("dmsg server") entity.
#[derive(Clone)]
pub struct Server {
    ctx: Arc<RelayContext>,
    config: ServerConfig,
    addr: Arc<OnceLock<String>>,
    ready: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Server {
    pub fn new(
        keypair: Keypair,
        disc: Arc<dyn DiscoveryClient>,
        config: ServerConfig,
        metrics: Arc<dyn ServerMetrics>,
    ) -> Self {
        let keypair = Arc::new(keypair);
        let cancel = CancellationToken::new();
        let addr = Arc::new(OnceLock::new());
        let observer = Arc::new(ServerEntryObserver {
            addr: addr.clone(),
            max_sessions: config.max_sessions,
        });
        let entity = Arc::new(EntityCommon::new(
            keypair.clone(),
            disc,
            config.update_interval,
            observer,
            cancel.clone(),
        ));
        let ctx = Arc::new(RelayContext {
            entity,
            keypair,
            tracker: TimestampTracker::new(config.replay_protection),
            metrics,
            handshake_timeout: config.handshake_timeout,
            max_streams_per_session: config.max_streams_per_session,
        });

        Self {
            ctx,
            config,
            addr,
            ready: Arc::new(watch::channel(false).0),
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    pub fn local_pk(&self) -> PublicKey {
        self.ctx.entity.local_pk()
    }

    /// Address published in the relay's discovery entry, once serving.
    pub fn advertised_addr(&self) -> Option<String> {
        self.addr.get().cloned()
    }

    pub fn session_count(&self) -> usize {
        self.ctx.entity.session_count()
    }

    pub fn sessions(&self) -> Vec<Arc<SessionCommon>> {
        self.ctx.entity.sessions()
    }

    /// Resolves once the relay has published its entry and accepts sessions.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Publish the relay entry and accept sessions on `listener` until closed.
    ///
    /// With no `advertised_addr` the listener's local address is published,
    /// which is only reachable in local setups.
    pub async fn serve(&self, listener: TcpListener, advertised_addr: Option<String>) -> Result<()> {
        let addr = match advertised_addr.filter(|a| !a.is_empty()) {
            Some(addr) => addr,
            None => {
                let local = listener.local_addr()?.to_string();
                warn!(addr = %local, "Advertising the local listener address");
                local
            }
        };
        if self.addr.set(addr.clone()).is_err() {
            return Err(RelayError::AlreadyServing);
        }
        info!(advertised_addr = %addr, local_pk = %self.local_pk(), "Serving server");

        let entity = self.ctx.entity.clone();
        let max_sessions = self.config.max_sessions;
        let published = Retrier::new(self.config.retry)
            .run(&self.cancel, || entity.update_server_entry(&addr, max_sessions))
            .await;
        match published {
            Ok(()) => {}
            Err(RetryError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        {
            let entity = entity.clone();
            let addr = addr.clone();
            let cancel = self.cancel.clone();
            self.tasks.spawn(async move {
                entity.update_server_entry_loop(&addr, max_sessions, cancel).await;
            });
        }

        info!("Accepting sessions");
        self.ready.send_replace(true);
        loop {
            let (conn, remote_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        return Err(e.into());
                    }
                },
            };

            if self.session_count() >= max_sessions {
                debug!(
                    max_sessions,
                    remote_tcp = %remote_addr,
                    "Max sessions reached, still accepting for clients that delegated us"
                );
            }

            let this = self.clone();
            self.tasks.spawn(async move { this.handle_session(conn).await });
        }
        info!("Stopped server");
        Ok(())
    }

    async fn handle_session(&self, conn: TcpStream) {
        let remote_tcp = conn.peer_addr().ok();
        let session =
            match SessionCommon::init_server(&self.ctx.keypair, conn, self.cancel.child_token()).await {
                Ok(session) => Arc::new(session),
                Err(e) => {
                    self.ctx.metrics.record_session(Delta::Failed);
                    debug!(remote_tcp = ?remote_tcp, error = %e, "Session handshake failed");
                    return;
                }
            };
        let remote_pk = session.remote_pk();

        if !self.ctx.entity.set_session(session.clone()).await {
            warn!(remote_pk = %remote_pk, "Session with peer already exists, dropping new one");
            session.close();
            return;
        }
        info!(remote_pk = %remote_pk, remote_tcp = ?remote_tcp, "Started session");

        ServerSession::new(session.clone(), self.ctx.clone()).serve().await;

        session.close();
        self.ctx.entity.del_session(&session, false).await;
        info!(remote_pk = %remote_pk, "Stopped session");
    }

    /// Stop accepting, close every session and wait for their tasks.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.ctx.entity.close_sessions();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(local_pk = %self.local_pk(), "Server closed");
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dmsg_disc::MemoryDiscovery;

    use super::*;
    use crate::metrics::{CounterMetrics, NoopMetrics};

    async fn start(disc: Arc<MemoryDiscovery>, metrics: Arc<dyn ServerMetrics>) -> (Server, Keypair) {
        dmsg_logging::try_init_for_tests();
        let kp = Keypair::generate();
        let server = Server::new(kp.clone(), disc, ServerConfig::default(), metrics);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let s = server.clone();
        tokio::spawn(async move { s.serve(listener, None).await });
        tokio::time::timeout(Duration::from_secs(5), server.ready())
            .await
            .unwrap();
        (server, kp)
    }

    #[tokio::test]
    async fn test_serve_publishes_entry() {
        let disc = Arc::new(MemoryDiscovery::new());
        let (server, kp) = start(disc.clone(), Arc::new(NoopMetrics)).await;

        let entry = disc.entry(&kp.public_key()).await.unwrap();
        let info = entry.server.unwrap();
        assert_eq!(Some(info.address), server.advertised_addr());
        assert_eq!(info.available_sessions, ServerConfig::default().max_sessions);
        server.close().await;
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_session_updates_available_sessions() {
        let disc = Arc::new(MemoryDiscovery::new());
        let metrics = Arc::new(CounterMetrics::new());
        let (server, kp) = start(disc.clone(), metrics.clone()).await;
        let addr = server.advertised_addr().unwrap();

        let client = Keypair::generate();
        let conn = TcpStream::connect(&addr).await.unwrap();
        let session = SessionCommon::init_client(&client, conn, kp.public_key(), CancellationToken::new())
            .await
            .unwrap();

        let wait_for = |want: usize| {
            let disc = disc.clone();
            let pk = kp.public_key();
            async move {
                for _ in 0..100 {
                    let entry = disc.entry(&pk).await.unwrap();
                    if entry.server.unwrap().available_sessions == want {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                panic!("available sessions never reached {want}");
            }
        };
        let max = ServerConfig::default().max_sessions;
        wait_for(max - 1).await;
        assert_eq!(server.session_count(), 1);

        session.close();
        wait_for(max).await;
        assert_eq!(server.session_count(), 0);
        assert_eq!(metrics.snapshot().total_sessions, 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_serve_twice_rejected() {
        let disc = Arc::new(MemoryDiscovery::new());
        let (server, _) = start(disc, Arc::new(NoopMetrics)).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            server.serve(listener, None).await,
            Err(RelayError::AlreadyServing)
        ));
        server.close().await;
    }
}
