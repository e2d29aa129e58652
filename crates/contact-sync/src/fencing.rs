use crate::model::IntegrationId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use taskq::TaskId;
use tokio::time::Instant;

/// Key under which the authoritative run token for `integration_id` lives.
pub fn fencing_key(integration_id: IntegrationId) -> String {
    const KEY_PREFIX: &str = "create_contact_points_for_datasource";
    format!("{KEY_PREFIX}_{integration_id}")
}

/// A shared key-value store with per-key TTL, used to coordinate overlapping
/// sync runs. At most one token is authoritative per key at any instant, and
/// `set` supersedes unconditionally. Tokens are never explicitly deleted:
/// they expire by TTL or are overwritten.
pub trait FencingStore: Send + Sync + 'static {
    fn set<'s>(
        &'s self,
        key: &'s str,
        token: TaskId,
        ttl: Duration,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 's;

    fn get<'s>(
        &'s self,
        key: &'s str,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<TaskId>>> + Send + 's;
}

/// In-memory FencingStore. Entries are lazily expired on read.
#[derive(Debug, Default)]
pub struct MemoryFencingStore {
    entries: Mutex<HashMap<String, (TaskId, Instant)>>,
}

impl MemoryFencingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FencingStore for MemoryFencingStore {
    async fn set(&self, key: &str, token: TaskId, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (token, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<TaskId>> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(&(token, deadline)) if deadline > Instant::now() => Ok(Some(token)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
