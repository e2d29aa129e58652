use crate::client::BackendCredentials;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Identity of an integration owning datasources to reconcile.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IntegrationId(pub u64);

impl std::fmt::Display for IntegrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An integration record. The sync core reads its identity and credentials,
/// and writes `setup_complete` exactly once, when a round converges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    /// Base URL of the owning organization's Grafana instance.
    pub grafana_url: url::Url,
    /// API token authenticating against the organization's Grafana.
    pub api_token: String,
    /// Set once contact points exist for every (non-skipped) datasource.
    pub setup_complete: bool,
}

impl Integration {
    pub fn credentials(&self) -> BackendCredentials {
        BackendCredentials {
            base_url: self.grafana_url.clone(),
            api_token: self.api_token.clone(),
        }
    }

    /// Name under which this integration's contact points are created.
    pub fn contact_point_name(&self) -> String {
        format!("contact-point-{}", self.id)
    }
}

/// Reference to a datasource for which alerting must be configured.
/// The builtin Grafana datasource is the one with neither an id nor a uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl DatasourceRef {
    pub fn builtin() -> Self {
        Self { id: None, uid: None }
    }

    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            uid: None,
        }
    }

    pub fn by_uid(uid: impl Into<String>) -> Self {
        Self {
            id: None,
            uid: Some(uid.into()),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id.is_none() && self.uid.is_none()
    }
}

/// Lookup and update of integration records. Persistence lives elsewhere:
/// the sync core depends only on this seam.
pub trait IntegrationStore: Send + Sync + 'static {
    fn find<'s>(
        &'s self,
        id: IntegrationId,
    ) -> impl std::future::Future<Output = anyhow::Result<Option<Integration>>> + Send + 's;

    fn mark_setup_complete<'s>(
        &'s self,
        id: IntegrationId,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 's;
}

/// In-memory IntegrationStore for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryIntegrationStore {
    integrations: Mutex<BTreeMap<IntegrationId, Integration>>,
    completion_writes: AtomicUsize,
}

impl MemoryIntegrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, integration: Integration) {
        self.integrations
            .lock()
            .unwrap()
            .insert(integration.id, integration);
    }

    pub fn get(&self, id: IntegrationId) -> Option<Integration> {
        self.integrations.lock().unwrap().get(&id).cloned()
    }

    /// Number of completion-flag writes performed over this store's lifetime.
    pub fn completion_writes(&self) -> usize {
        self.completion_writes.load(Ordering::SeqCst)
    }
}

impl IntegrationStore for MemoryIntegrationStore {
    async fn find(&self, id: IntegrationId) -> anyhow::Result<Option<Integration>> {
        Ok(self.get(id))
    }

    async fn mark_setup_complete(&self, id: IntegrationId) -> anyhow::Result<()> {
        let mut integrations = self.integrations.lock().unwrap();
        let integration = integrations
            .get_mut(&id)
            .with_context(|| format!("integration {id} does not exist"))?;

        integration.setup_complete = true;
        self.completion_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_datasource_is_inferred_from_absent_id_and_uid() {
        assert!(DatasourceRef::builtin().is_builtin());
        assert!(!DatasourceRef::by_id(10).is_builtin());
        assert!(!DatasourceRef::by_uid("ds-a").is_builtin());
    }

    #[test]
    fn datasource_serde_omits_absent_fields() {
        let json = serde_json::to_string(&DatasourceRef::by_uid("ds-a")).unwrap();
        assert_eq!(json, r#"{"uid":"ds-a"}"#);

        let parsed: DatasourceRef = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_builtin());
    }
}
