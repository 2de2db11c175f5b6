use std::collections::HashMap;

use async_trait::async_trait;
use dmsg_core::PublicKey;
use parking_lot::Mutex;

use crate::client::DiscoveryClient;
use crate::entry::Entry;
use crate::error::{DiscError, Result, ValidationError};

/// In-process discovery store applying the same validation rules as the
/// discovery service.
#[derive(Default)]
pub struct MemoryDiscovery {
    entries: Mutex<HashMap<PublicKey, Entry>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn sorted(&self, filter: impl Fn(&Entry) -> bool) -> Vec<Entry> {
        let mut out: Vec<Entry> = self
            .entries
            .lock()
            .values()
            .filter(|e| filter(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.static_pk.cmp(&b.static_pk));
        out
    }
}

#[async_trait]
impl DiscoveryClient for MemoryDiscovery {
    async fn entry(&self, pk: &PublicKey) -> Result<Entry> {
        self.entries
            .lock()
            .get(pk)
            .cloned()
            .ok_or(DiscError::KeyNotFound)
    }

    async fn post_entry(&self, entry: &Entry) -> Result<()> {
        entry.verify_signature()?;
        entry.validate()?;

        let mut entries = self.entries.lock();
        match entries.get(&entry.static_pk) {
            Some(previous) => previous.validate_iteration(entry)?,
            None if entry.sequence != 0 => return Err(ValidationError::NonZeroSequence.into()),
            None => {}
        }
        entries.insert(entry.static_pk, entry.clone());
        Ok(())
    }

    async fn del_entry(&self, entry: &Entry) -> Result<()> {
        self.entries
            .lock()
            .remove(&entry.static_pk)
            .map(|_| ())
            .ok_or(DiscError::KeyNotFound)
    }

    async fn available_servers(&self) -> Result<Vec<Entry>> {
        Ok(self.sorted(|e| e.server.as_ref().is_some_and(|s| s.available_sessions > 0)))
    }

    async fn all_servers(&self) -> Result<Vec<Entry>> {
        Ok(self.sorted(Entry::is_server))
    }

    async fn all_entries(&self) -> Result<Vec<String>> {
        Ok(self.sorted(|_| true).iter().map(|e| e.static_pk.to_string()).collect())
    }
}
