use crate::classify::{classify, config_action, AttemptOutcome, ConfigAction};
use crate::client::AlertingBackend;
use crate::fencing::{fencing_key, FencingStore};
use crate::model::{DatasourceRef, IntegrationId, IntegrationStore};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use taskq::{Queue, TaskId};

/// How long a stored run token remains authoritative.
const TOKEN_TTL: Duration = Duration::from_secs(600);
/// Coalescing delay between requesting a sync and executing it. Rapid
/// successive schedule calls collapse onto the most recently stored token.
const START_DELAY: Duration = Duration::from_secs(3);

/// Payload of one contact-point sync task.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub integration_id: IntegrationId,
    pub datasources: Vec<DatasourceRef>,
    /// Reschedule round, starting at zero. Informational: rounds are not
    /// bounded, and a datasource which keeps failing keeps rescheduling.
    #[serde(default)]
    pub round: u32,
}

/// SyncScheduler issues run tokens. Scheduling enqueues a delayed sync task
/// and stores the task's id as the authoritative token for the integration,
/// superseding any earlier in-flight run.
pub struct SyncScheduler<F> {
    fencing: Arc<F>,
    start_delay: Duration,
    token_ttl: Duration,
}

impl<F> Clone for SyncScheduler<F> {
    fn clone(&self) -> Self {
        Self {
            fencing: self.fencing.clone(),
            start_delay: self.start_delay,
            token_ttl: self.token_ttl,
        }
    }
}

impl<F: FencingStore> SyncScheduler<F> {
    pub fn new(fencing: Arc<F>) -> Self {
        Self {
            fencing,
            start_delay: START_DELAY,
            token_ttl: TOKEN_TTL,
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Request a sync of `datasources` for `integration_id`. The returned
    /// TaskId is the new authoritative run token.
    pub async fn schedule(
        &self,
        queue: &Queue,
        integration_id: IntegrationId,
        datasources: Vec<DatasourceRef>,
    ) -> anyhow::Result<TaskId> {
        self.schedule_round(queue, integration_id, datasources, 0)
            .await
    }

    pub(crate) async fn schedule_round(
        &self,
        queue: &Queue,
        integration_id: IntegrationId,
        datasources: Vec<DatasourceRef>,
        round: u32,
    ) -> anyhow::Result<TaskId> {
        let request = SyncRequest {
            integration_id,
            datasources,
            round,
        };
        let token = queue
            .enqueue(
                taskq::task_types::CONTACT_POINT_SYNC,
                &request,
                self.start_delay,
            )
            .context("failed to enqueue contact-point sync task")?;

        self.fencing
            .set(&fencing_key(integration_id), token, self.token_ttl)
            .await
            .context("failed to store run token")?;

        tracing::debug!(%integration_id, %token, round, "scheduled contact-point sync");
        Ok(token)
    }
}

/// Executes one sync attempt: fenced by the run token, it drives the
/// per-datasource protocol, accumulates the subset which failed, and either
/// reschedules that subset as a fresh round or marks the integration's
/// alerting setup complete.
pub struct ContactPointSyncExecutor<B, I, F> {
    backend: Arc<B>,
    integrations: Arc<I>,
    scheduler: SyncScheduler<F>,
}

impl<B, I, F> ContactPointSyncExecutor<B, I, F> {
    pub fn new(backend: Arc<B>, integrations: Arc<I>, scheduler: SyncScheduler<F>) -> Self {
        Self {
            backend,
            integrations,
            scheduler,
        }
    }
}

impl<B, I, F> ContactPointSyncExecutor<B, I, F>
where
    F: FencingStore,
{
    /// True when a different run token has become authoritative for the
    /// integration. An absent token means no supersession is known, and the
    /// attempt proceeds. Re-checked before every externally visible side
    /// effect, so a stale run cannot stomp a newer token or complete stale
    /// work after passing the entry check.
    async fn is_superseded(
        &self,
        integration_id: IntegrationId,
        own_token: TaskId,
    ) -> anyhow::Result<bool> {
        let stored = self
            .scheduler
            .fencing
            .get(&fencing_key(integration_id))
            .await
            .context("failed to read run token")?;

        Ok(stored.is_some_and(|token| token != own_token))
    }
}

impl<B, I, F> taskq::Executor for ContactPointSyncExecutor<B, I, F>
where
    B: AlertingBackend,
    I: IntegrationStore,
    F: FencingStore,
{
    const TASK_TYPE: taskq::TaskType = taskq::task_types::CONTACT_POINT_SYNC;

    type Msg = SyncRequest;

    #[tracing::instrument(
        skip_all,
        fields(task_id = %task_id, integration_id = %msg.integration_id, round = msg.round),
    )]
    async fn poll<'s>(
        &'s self,
        queue: &'s Queue,
        task_id: TaskId,
        msg: SyncRequest,
    ) -> anyhow::Result<()> {
        let SyncRequest {
            integration_id,
            datasources,
            round,
        } = msg;

        if self.is_superseded(integration_id, task_id).await? {
            tracing::debug!("sync run was superseded, nothing to do");
            return Ok(());
        }

        let Some(integration) = self
            .integrations
            .find(integration_id)
            .await
            .context("failed to fetch integration")?
        else {
            tracing::debug!("cannot create contact points: integration does not exist");
            return Ok(());
        };
        let creds = integration.credentials();
        let name = integration.contact_point_name();

        // Datasources whose contact point could not be created this round.
        let mut retry_set = Vec::new();

        for ds in &datasources {
            let config = self.backend.fetch_alerting_config(&creds, ds).await;

            let mut creation = None;
            match config_action(&config) {
                ConfigAction::Create => {
                    if self.is_superseded(integration_id, task_id).await? {
                        tracing::debug!("sync run was superseded mid-round");
                        return Ok(());
                    }
                    creation = Some(self.backend.create_contact_point(&creds, ds, &name).await);
                }
                ConfigAction::InitializeThenCreate => {
                    if self.is_superseded(integration_id, task_id).await? {
                        tracing::debug!("sync run was superseded mid-round");
                        return Ok(());
                    }
                    tracing::debug!(?ds, "alerting uninitialized for datasource, initializing");
                    if let Err(error) = self.backend.initialize_alertmanager(&creds, ds).await {
                        tracing::warn!(?ds, %error, "failed to initialize alertmanager");
                    }
                    creation = Some(self.backend.create_contact_point(&creds, ds, &name).await);
                }
                ConfigAction::SkipPermanently => {
                    tracing::warn!(
                        ?ds,
                        error = ?config.as_ref().err(),
                        "backend rejected datasource, skipping it permanently"
                    );
                }
                ConfigAction::Retry => {
                    tracing::warn!(
                        ?ds,
                        error = ?config.as_ref().err(),
                        "ambiguous config fetch failure, datasource will be retried"
                    );
                }
            }

            match classify(&config, creation.as_ref()) {
                AttemptOutcome::Succeeded => {
                    tracing::debug!(?ds, "contact point created");
                }
                AttemptOutcome::SkippedPermanently => (),
                AttemptOutcome::Retry => retry_set.push(ds.clone()),
            }
        }

        if self.is_superseded(integration_id, task_id).await? {
            tracing::debug!("sync run was superseded before convergence");
            return Ok(());
        }

        if !retry_set.is_empty() {
            tracing::info!(
                failed = retry_set.len(),
                "rescheduling datasources which failed this round"
            );
            self.scheduler
                .schedule_round(queue, integration_id, retry_set, round + 1)
                .await?;
        } else {
            if !integration.setup_complete {
                self.integrations
                    .mark_setup_complete(integration_id)
                    .await
                    .context("failed to mark alerting setup complete")?;
            }
            tracing::info!("contact-point sync converged");
        }
        Ok(())
    }
}
