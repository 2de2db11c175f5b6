use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dmsg_core::{Addr, ClientConfig, DmsgError, PublicKey};
use dmsg_crypto::Keypair;
use dmsg_disc::{DiscError, DiscoveryClient, Entry};
use dmsg_network::{
    get_client_entry, get_server_entry, Backoff, EntityCommon, Lifecycle, Porter, Retrier,
    RetryError, SessionCommon, SessionObserver, TimestampClock, TimestampTracker,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::callbacks::{ClientCallbacks, NoopCallbacks};
use crate::listener::Listener;
use crate::session::{ClientSession, StreamContext};
use crate::stream::{PortEntry, Stream, StreamMeta};
use crate::{ClientError, Result};

const SESSION_NETWORK: &str = "tcp";

/// Publishes the delegated servers whenever the session set changes.
struct ClientEntryObserver {
    ready: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl SessionObserver for ClientEntryObserver {
    async fn on_session_established(&self, entity: &EntityCommon) -> std::result::Result<(), DiscError> {
        entity.update_client_entry().await?;
        if entity.session_count() > 0 {
            self.ready.send_replace(true);
        }
        Ok(())
    }

    async fn on_session_closed(&self, entity: &EntityCommon) -> std::result::Result<(), DiscError> {
        entity.update_client_entry().await
    }
}

/// A dmsg client entity.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    entity: Arc<EntityCommon>,
    ctx: Arc<StreamContext>,
    config: ClientConfig,
    callbacks: Arc<dyn ClientCallbacks>,
    ready: Arc<watch::Sender<bool>>,
    /// Held while establishing a session so one relay is never dialed twice.
    dial_mx: tokio::sync::Mutex<()>,
    /// Relays whose session ended while the client was open.
    loss_tx: mpsc::Sender<PublicKey>,
    loss_rx: tokio::sync::Mutex<mpsc::Receiver<PublicKey>>,
    life: Lifecycle,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Client {
    pub fn new(keypair: Keypair, disc: Arc<dyn DiscoveryClient>, config: ClientConfig) -> Self {
        Self::with_callbacks(keypair, disc, config, Arc::new(NoopCallbacks))
    }

    pub fn with_callbacks(
        keypair: Keypair,
        disc: Arc<dyn DiscoveryClient>,
        config: ClientConfig,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Self {
        let keypair = Arc::new(keypair);
        let cancel = CancellationToken::new();
        let ready = Arc::new(watch::channel(false).0);
        let entity = Arc::new(EntityCommon::new(
            keypair.clone(),
            disc,
            config.update_interval,
            Arc::new(ClientEntryObserver {
                ready: ready.clone(),
            }),
            cancel.clone(),
        ));
        let ctx = Arc::new(StreamContext {
            keypair,
            porter: Porter::default(),
            tracker: TimestampTracker::new(config.replay_protection),
            clock: TimestampClock::new(),
            handshake_timeout: config.handshake_timeout,
            cancel: cancel.clone(),
        });
        let (loss_tx, loss_rx) = mpsc::channel(16);

        Self {
            inner: Arc::new(ClientInner {
                entity,
                ctx,
                config,
                callbacks,
                ready,
                dial_mx: tokio::sync::Mutex::new(()),
                loss_tx,
                loss_rx: tokio::sync::Mutex::new(loss_rx),
                life: Lifecycle::new(),
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn local_pk(&self) -> PublicKey {
        self.inner.entity.local_pk()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Local port registry: listeners and open streams.
    pub fn porter(&self) -> &Porter<PortEntry> {
        &self.inner.ctx.porter
    }

    /// Resolves once a client entry naming at least one delegated server
    /// has been published.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Keep sessions with relays until the client is closed.
    ///
    /// Holds `min_sessions` sessions (every available relay when zero),
    /// returning to discovery whenever one is lost or a refresh is due.
    pub async fn serve(&self) {
        let mut losses = self.inner.loss_rx.lock().await;
        let mut backoff = Backoff::new(&self.inner.config.backoff);
        let cancel = &self.inner.cancel;
        let min_sessions = self.inner.config.min_sessions;
        // Discovery is consulted again after this long even without losses.
        let refresh = self.inner.config.update_interval;

        'serve: loop {
            if cancel.is_cancelled() {
                break;
            }
            debug!("Discovering dmsg servers");
            let entries = match self.discover_servers().await {
                Ok(entries) => entries,
                Err(RetryError::Cancelled) => break,
                Err(RetryError::Exhausted(e)) => {
                    warn!(error = %e, "Failed to discover dmsg servers");
                    if !backoff.wait(cancel).await {
                        break;
                    }
                    continue;
                }
            };
            if entries.is_empty() {
                warn!("No dmsg servers found, trying again later");
                if !backoff.wait(cancel).await {
                    break;
                }
                continue;
            }

            for entry in &entries {
                if cancel.is_cancelled() {
                    break 'serve;
                }
                if min_sessions != 0 && self.inner.entity.session_count() >= min_sessions {
                    debug!(min_sessions, "Minimum sessions reached, waiting for a loss");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'serve,
                        loss = losses.recv() => log_loss(loss),
                    }
                }
                if let Err(e) = self.ensure_session(entry).await {
                    warn!(remote_pk = %entry.static_pk, error = %e, "Failed to establish session");
                }
            }

            let wanted = match min_sessions {
                0 => entries.len(),
                n => n.min(entries.len()),
            };
            if self.inner.entity.session_count() < wanted {
                if !backoff.wait(cancel).await {
                    break;
                }
                continue;
            }
            backoff.reset();

            tokio::select! {
                _ = cancel.cancelled() => break,
                loss = losses.recv() => log_loss(loss),
                _ = tokio::time::sleep(refresh) => {}
            }
        }
        debug!("Stopped serving client");
    }

    async fn discover_servers(&self) -> std::result::Result<Vec<Entry>, RetryError<DiscError>> {
        let disc = self.inner.entity.disc().clone();
        let preferred = self.inner.config.preferred_server;
        let mut entries = Retrier::new(self.inner.config.retry)
            .run(&self.inner.cancel, || {
                let disc = disc.clone();
                async move {
                    match preferred {
                        Some(_) => disc.all_servers().await,
                        None => disc.available_servers().await,
                    }
                }
            })
            .await?;
        if let Some(pk) = preferred {
            entries.retain(|entry| entry.static_pk == pk);
        }
        Ok(entries)
    }

    /// Make sure a session with the relay described by `entry` exists.
    pub async fn ensure_session(&self, entry: &Entry) -> Result<()> {
        let _guard = self.inner.dial_mx.lock().await;
        if self.inner.entity.session(&entry.static_pk).is_some() {
            return Ok(());
        }
        self.dial_session(entry).await.map(|_| ())
    }

    /// The session with relay `pk`, establishing it first if needed.
    pub async fn ensure_and_obtain_session(&self, pk: &PublicKey) -> Result<ClientSession> {
        let _guard = self.inner.dial_mx.lock().await;
        if let Some(session) = self.session(pk) {
            return Ok(session);
        }
        let entry = get_server_entry(self.inner.entity.disc().as_ref(), pk).await?;
        self.dial_session(&entry).await
    }

    async fn dial_session(&self, entry: &Entry) -> Result<ClientSession> {
        if self.is_closed() {
            return Err(DmsgError::EntityClosed.into());
        }
        let addr = entry
            .server
            .as_ref()
            .map(|server| server.address.clone())
            .ok_or(DmsgError::DiscEntryIsNotServer)?;
        self.inner
            .callbacks
            .on_session_dial(SESSION_NETWORK, &addr)
            .map_err(ClientError::DialRejected)?;

        let session = match self.connect(&addr, entry.static_pk).await {
            Ok(session) => session,
            Err(e) => {
                self.inner.callbacks.on_session_disconnect(SESSION_NETWORK, &addr, &e);
                return Err(e);
            }
        };
        if !self.inner.entity.set_session(session.clone()).await {
            session.close();
            let e = ClientError::SessionExists(entry.static_pk);
            self.inner.callbacks.on_session_disconnect(SESSION_NETWORK, &addr, &e);
            return Err(e);
        }
        info!(remote_pk = %entry.static_pk, remote_tcp = %addr, "Started session");

        let client_session = ClientSession::new(session.clone(), self.inner.ctx.clone());
        let this = self.clone();
        let serving = client_session.clone();
        self.inner.tasks.spawn(async move {
            let error = ClientError::Session(serving.serve().await);
            session.close();
            let server = session.remote_pk();
            info!(remote_pk = %server, error = %error, "Stopped session");
            if !this.is_closed() {
                this.inner.entity.del_session(&session, false).await;
                let _ = this.inner.loss_tx.try_send(server);
            }
            this.inner
                .callbacks
                .on_session_disconnect(SESSION_NETWORK, &addr, &error);
        });
        Ok(client_session)
    }

    async fn connect(&self, addr: &str, server: PublicKey) -> Result<Arc<SessionCommon>> {
        let conn = TcpStream::connect(addr).await?;
        let session =
            SessionCommon::init_client(&self.inner.ctx.keypair, conn, server, self.inner.cancel.child_token())
                .await?;
        Ok(Arc::new(session))
    }

    /// Open a stream to `addr` through one of its delegated servers.
    ///
    /// Relays we already hold a session with are tried first.
    pub async fn dial(&self, addr: Addr) -> Result<Stream> {
        if self.is_closed() {
            return Err(DmsgError::EntityClosed.into());
        }
        let entry = get_client_entry(self.inner.entity.disc().as_ref(), &addr.pk).await?;
        let delegated = entry
            .client
            .map(|client| client.delegated_servers)
            .unwrap_or_default();

        for server in &delegated {
            if let Some(session) = self.session(server) {
                return session.dial_stream(addr).await;
            }
        }
        for server in &delegated {
            match self.ensure_and_obtain_session(server).await {
                Ok(session) => return session.dial_stream(addr).await,
                Err(e) => {
                    debug!(remote_pk = %server, error = %e, "Failed to reach delegated server");
                }
            }
        }
        Err(DmsgError::CannotConnectToDelegated.into())
    }

    /// Listen for streams on `port`.
    pub fn listen(&self, port: u16) -> Result<Listener> {
        if self.is_closed() {
            return Err(DmsgError::EntityClosed.into());
        }
        Listener::bind(&self.inner.ctx.porter, Addr::new(self.local_pk(), port))
    }

    pub fn session(&self, pk: &PublicKey) -> Option<ClientSession> {
        self.inner
            .entity
            .session(pk)
            .map(|session| ClientSession::new(session, self.inner.ctx.clone()))
    }

    pub fn all_sessions(&self) -> Vec<ClientSession> {
        self.inner
            .entity
            .sessions()
            .into_iter()
            .map(|session| ClientSession::new(session, self.inner.ctx.clone()))
            .collect()
    }

    /// TCP addresses of the relays we hold sessions with.
    pub fn connected_servers(&self) -> Vec<String> {
        self.inner
            .entity
            .sessions()
            .iter()
            .filter_map(|session| session.remote_tcp_addr())
            .map(|addr| addr.to_string())
            .collect()
    }

    /// Every open stream, dialed or accepted.
    pub fn all_streams(&self) -> Vec<StreamMeta> {
        let mut streams = Vec::new();
        for (_, value, children) in self.inner.ctx.porter.range() {
            if let Some(PortEntry::Stream(meta)) = value {
                streams.push(meta);
            }
            streams.extend(children.into_iter().filter_map(|(_, child)| match child {
                PortEntry::Stream(meta) => Some(meta),
                PortEntry::Listener(_) => None,
            }));
        }
        streams
    }

    /// Remote client key to the relays its streams run through.
    pub fn connections_summary(&self) -> HashMap<PublicKey, Vec<PublicKey>> {
        let mut summary: HashMap<PublicKey, Vec<PublicKey>> = HashMap::new();
        for meta in self.all_streams() {
            let servers = summary.entry(meta.remote.pk).or_default();
            if !servers.contains(&meta.server) {
                servers.push(meta.server);
            }
        }
        summary
    }

    /// Keys of every entry known to discovery.
    pub async fn all_entries(&self) -> Result<Vec<String>> {
        let disc = self.inner.entity.disc().clone();
        Ok(Retrier::new(self.inner.config.retry)
            .run(&self.inner.cancel, || {
                let disc = disc.clone();
                async move { disc.all_entries().await }
            })
            .await?)
    }

    /// Close every session and listener and remove our discovery entry.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.life.begin_close() {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.entity.close_sessions();
        for value in self.inner.ctx.porter.close_all() {
            if let Some(listener) = match value {
                PortEntry::Listener(entry) => entry.upgrade(),
                PortEntry::Stream(_) => None,
            } {
                listener.close();
            }
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let deleted = self.inner.entity.del_entry().await;
        self.inner.life.finish_close();
        match deleted {
            Ok(()) | Err(DiscError::KeyNotFound) => {
                debug!(local_pk = %self.local_pk(), "Client closed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to delete client entry");
                Err(e.into())
            }
        }
    }
}

fn log_loss(loss: Option<PublicKey>) {
    if let Some(server) = loss {
        debug!(remote_pk = %server, "Session lost, rediscovering");
    }
}
