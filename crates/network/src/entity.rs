//! Identity and session bookkeeping shared by clients and relays

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dmsg_core::{DmsgError, PublicKey};
use dmsg_crypto::Keypair;
use dmsg_disc::{DiscError, DiscoveryClient, Entry};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::SessionCommon;

/// Reacts to changes of an entity's session table, typically by
/// republishing the entity's discovery entry.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_session_established(&self, entity: &EntityCommon) -> Result<(), DiscError>;

    async fn on_session_closed(&self, entity: &EntityCommon) -> Result<(), DiscError>;
}

/// Observer that does nothing.
pub struct NoopObserver;

#[async_trait]
impl SessionObserver for NoopObserver {
    async fn on_session_established(&self, _: &EntityCommon) -> Result<(), DiscError> {
        Ok(())
    }

    async fn on_session_closed(&self, _: &EntityCommon) -> Result<(), DiscError> {
        Ok(())
    }
}

pub struct EntityCommon {
    keypair: Arc<Keypair>,
    pk: PublicKey,
    disc: Arc<dyn DiscoveryClient>,
    sessions: Mutex<HashMap<PublicKey, Arc<SessionCommon>>>,
    /// Minimum time between entry updates that carry no change.
    update_interval: Duration,
    last_update: Mutex<Option<Instant>>,
    observer: Arc<dyn SessionObserver>,
    /// Serialises entry publication.
    entry_mx: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl EntityCommon {
    pub fn new(
        keypair: Arc<Keypair>,
        disc: Arc<dyn DiscoveryClient>,
        update_interval: Duration,
        observer: Arc<dyn SessionObserver>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pk: keypair.public_key(),
            keypair,
            disc,
            sessions: Mutex::new(HashMap::new()),
            update_interval,
            last_update: Mutex::new(None),
            observer,
            entry_mx: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    pub fn local_pk(&self) -> PublicKey {
        self.pk
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn disc(&self) -> &Arc<dyn DiscoveryClient> {
        &self.disc
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn session(&self, pk: &PublicKey) -> Option<Arc<SessionCommon>> {
        self.sessions.lock().get(pk).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Arc<SessionCommon>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Register `session` under its remote key. Returns false if a session
    /// with that peer already exists; the caller still owns `session` then.
    pub async fn set_session(&self, session: Arc<SessionCommon>) -> bool {
        let remote_pk = session.remote_pk();
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&remote_pk) {
                return false;
            }
            sessions.insert(remote_pk, session);
        }

        if let Err(e) = self.observer.on_session_established(self).await {
            warn!(remote_pk = %remote_pk, error = %e, "Entry update after new session failed");
        }
        true
    }

    /// Unregister `session`. Nothing happens if the table holds a different
    /// session for the same peer. `server_end` suppresses the observer.
    pub async fn del_session(&self, session: &Arc<SessionCommon>, server_end: bool) -> bool {
        let remote_pk = session.remote_pk();
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&remote_pk) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(&remote_pk),
                _ => None,
            }
        };
        if removed.is_none() {
            return false;
        }
        debug!(remote_pk = %remote_pk, "Session removed");

        if !server_end {
            if let Err(e) = self.observer.on_session_closed(self).await {
                warn!(remote_pk = %remote_pk, error = %e, "Entry update after session loss failed");
            }
        }
        true
    }

    /// Close and forget every session.
    pub fn close_sessions(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    fn update_is_due(&self) -> bool {
        self.last_update
            .lock()
            .map_or(true, |at| at.elapsed() >= self.update_interval)
    }

    /// Time until the next periodic update is due.
    fn until_due(&self) -> Duration {
        self.last_update
            .lock()
            .map_or(Duration::ZERO, |at| self.update_interval.saturating_sub(at.elapsed()))
    }

    fn record_update(&self) {
        *self.last_update.lock() = Some(Instant::now());
    }

    /// Publish `{address, available_sessions}` for a relay.
    ///
    /// Nothing is sent if the stored entry already matches and the update
    /// interval has not elapsed since the last publication.
    pub async fn update_server_entry(&self, addr: &str, max_sessions: usize) -> Result<(), DiscError> {
        if addr.is_empty() {
            return Err(DiscError::BadInput);
        }
        let _guard = self.entry_mx.lock().await;
        let available = max_sessions.saturating_sub(self.session_count());

        let mut entry = match self.disc.entry(&self.pk).await {
            Ok(entry) => entry,
            Err(DiscError::KeyNotFound) => {
                let mut entry = Entry::new_server(self.pk, 0, addr, available);
                entry.sign(&self.keypair)?;
                self.disc.post_entry(&entry).await?;
                self.record_update();
                debug!(addr, available_sessions = available, "Server entry created");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let server = entry
            .server
            .as_mut()
            .ok_or(DiscError::Protocol(DmsgError::DiscEntryIsNotServer))?;
        let sessions_delta = server.available_sessions != available;
        let addr_delta = server.address != addr;
        if !sessions_delta && !addr_delta && !self.update_is_due() {
            return Ok(());
        }
        server.available_sessions = available;
        server.address = addr.to_string();

        self.disc.put_entry(&self.keypair, &mut entry).await?;
        self.record_update();
        debug!(addr, available_sessions = available, "Server entry updated");
        Ok(())
    }

    /// Keep the relay's entry fresh until `cancel` fires.
    pub async fn update_server_entry_loop(
        &self,
        addr: &str,
        max_sessions: usize,
        cancel: CancellationToken,
    ) {
        let mut wait = self.update_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if !self.update_is_due() {
                wait = self.until_due();
                continue;
            }
            if let Err(e) = self.update_server_entry(addr, max_sessions).await {
                warn!(error = %e, "Failed to update discovery entry");
            }
            wait = self.update_interval;
        }
    }

    /// Publish the relays this client is currently reachable through.
    pub async fn update_client_entry(&self) -> Result<(), DiscError> {
        if self.is_closed() {
            return Ok(());
        }
        let _guard = self.entry_mx.lock().await;
        let mut delegated: Vec<PublicKey> = self.sessions.lock().keys().copied().collect();
        delegated.sort();

        let mut entry = match self.disc.entry(&self.pk).await {
            Ok(entry) => entry,
            Err(DiscError::KeyNotFound) => {
                let mut entry = Entry::new_client(self.pk, 0, delegated);
                entry.sign(&self.keypair)?;
                self.disc.post_entry(&entry).await?;
                self.record_update();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let client = entry
            .client
            .as_mut()
            .ok_or(DiscError::Protocol(DmsgError::DiscEntryIsNotClient))?;
        client.delegated_servers = delegated;
        debug!(delegated = client.delegated_servers.len(), "Updating client entry");
        self.disc.put_entry(&self.keypair, &mut entry).await?;
        self.record_update();
        Ok(())
    }

    /// Remove this entity's discovery entry.
    pub async fn del_entry(&self) -> Result<(), DiscError> {
        let _guard = self.entry_mx.lock().await;
        let entry = self.disc.entry(&self.pk).await?;
        self.disc.del_entry(&entry).await?;
        debug!(pk = %self.pk.short(), "Entry deleted");
        Ok(())
    }
}

/// Entry of the relay `pk`.
pub async fn get_server_entry(disc: &dyn DiscoveryClient, pk: &PublicKey) -> Result<Entry, DmsgError> {
    let entry = disc
        .entry(pk)
        .await
        .map_err(|_| DmsgError::DiscEntryNotFound)?;
    if entry.server.is_none() {
        return Err(DmsgError::DiscEntryIsNotServer);
    }
    Ok(entry)
}

/// Entry of the client `pk`, which must list at least one delegated relay.
pub async fn get_client_entry(disc: &dyn DiscoveryClient, pk: &PublicKey) -> Result<Entry, DmsgError> {
    let entry = disc
        .entry(pk)
        .await
        .map_err(|_| DmsgError::DiscEntryNotFound)?;
    match &entry.client {
        None => Err(DmsgError::DiscEntryIsNotClient),
        Some(client) if client.delegated_servers.is_empty() => Err(DmsgError::DiscEntryHasNoDelegated),
        Some(_) => Ok(entry),
    }
}
