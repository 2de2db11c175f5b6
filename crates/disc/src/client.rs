use async_trait::async_trait;
use dmsg_core::{unix_nanos, PublicKey};
use dmsg_crypto::Keypair;
use tracing::debug;

use crate::entry::Entry;
use crate::error::{DiscError, Result, ValidationError};

/// Access to the discovery service.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Entry registered for `pk`. Fails with [`DiscError::KeyNotFound`] if there is none.
    async fn entry(&self, pk: &PublicKey) -> Result<Entry>;

    /// Publish a signed entry.
    async fn post_entry(&self, entry: &Entry) -> Result<()>;

    /// Remove the entry.
    async fn del_entry(&self, entry: &Entry) -> Result<()>;

    /// Relays that still accept sessions.
    async fn available_servers(&self) -> Result<Vec<Entry>>;

    /// Every registered relay.
    async fn all_servers(&self) -> Result<Vec<Entry>>;

    /// Public keys of every registered entry.
    async fn all_entries(&self) -> Result<Vec<String>>;

    /// Publish the next iteration of an existing entry.
    ///
    /// Bumps the sequence, refreshes the timestamp and re-signs. If the
    /// service reports a sequence conflict the remote entry is fetched: a
    /// newer remote entry wins and the update is dropped, otherwise the
    /// update is retried on top of the remote sequence.
    async fn put_entry(&self, keypair: &Keypair, entry: &mut Entry) -> Result<()> {
        put_entry_iteration(self, keypair, entry).await
    }
}

pub(crate) async fn put_entry_iteration<C>(client: &C, keypair: &Keypair, entry: &mut Entry) -> Result<()>
where
    C: DiscoveryClient + ?Sized,
{
    entry.sequence += 1;
    entry.timestamp = unix_nanos();

    loop {
        entry.sign(keypair)?;
        let err = match client.post_entry(entry).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !matches!(err, DiscError::Validation(ValidationError::WrongSequence)) {
            entry.sequence -= 1;
            return Err(err);
        }
        let remote = match client.entry(&entry.static_pk).await {
            Ok(remote) => remote,
            Err(_) => return Err(err),
        };
        if remote.timestamp > entry.timestamp {
            debug!(
                pk = %entry.static_pk.short(),
                "Discovery holds a newer entry, dropping update"
            );
            entry.sequence = remote.sequence;
            return Ok(());
        }
        entry.sequence = remote.sequence + 1;
    }
}
