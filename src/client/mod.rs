//! Control-plane client: start, query, signal, terminate, suspend/resume and
//! purge instances, plus entity access.
//!
//! The client is intentionally thin: every operation communicates with the
//! runtime exclusively through the shared provider (enqueue + reads), so any
//! process holding the same provider can act as a client.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{EntityCaller, EntityOperation, InstanceMetadata, Provider, WorkItem};
use crate::runtime::{OrchestrationStatus, WaitError};
use crate::{EntityId, ErrorDetails, Event};

/// Options for scheduling an orchestration instance.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Pin the instance to a specific registered version (immutable).
    pub version: Option<String>,
    /// Deferred start: the instance begins at this wall-clock time.
    pub start_at_ms: Option<u64>,
}

/// Full management view of one instance.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance: String,
    pub status: OrchestrationStatus,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub failure: Option<ErrorDetails>,
}

/// Filters for `query_instances`. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub statuses: Vec<String>,
    pub created_from_ms: Option<u64>,
    pub created_to_ms: Option<u64>,
    pub id_prefix: Option<String>,
    /// Page size; 0 means the default of 100.
    pub page_size: usize,
    /// Opaque token from a previous page.
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstancePage {
    pub instances: Vec<InstanceDescription>,
    pub continuation_token: Option<String>,
}

/// Filters for `purge_instances`.
#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    pub statuses: Vec<String>,
    pub created_from_ms: Option<u64>,
    pub created_to_ms: Option<u64>,
}

/// Thin client for control-plane operations over a shared provider.
pub struct DurataskClient {
    store: Arc<dyn Provider>,
}

impl DurataskClient {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    // ---- starting instances ----

    /// Schedule an orchestration instance with string input.
    pub async fn schedule_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.schedule_orchestration_with(instance, orchestration, input, ScheduleOptions::default())
            .await
    }

    /// Schedule with explicit options (version pin, deferred start).
    pub async fn schedule_orchestration_with(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
        options: ScheduleOptions,
    ) -> Result<(), String> {
        let delay_ms = options
            .start_at_ms
            .map(|at| at.saturating_sub(crate::wall_clock_now_ms()));
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
            version: options.version,
            parent_instance: None,
            parent_id: None,
            parent_execution_id: None,
        };
        self.store
            .enqueue_orchestrator_work(item, delay_ms)
            .await
            .map_err(|e| e.to_string())
    }

    /// Schedule with a generated instance id; returns the id.
    pub async fn schedule_orchestration_new(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, String> {
        let instance = format!("{}-{}", orchestration.to_lowercase(), crate::generate_guid());
        self.schedule_orchestration(&instance, orchestration, input)
            .await?;
        Ok(instance)
    }

    /// Schedule an instance pinned to a specific version.
    pub async fn schedule_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.schedule_orchestration_with(
            instance,
            orchestration,
            input,
            ScheduleOptions {
                version: Some(version.into()),
                start_at_ms: None,
            },
        )
        .await
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn schedule_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), String> {
        let payload = Json::encode(input)?;
        self.schedule_orchestration(instance, orchestration, payload)
            .await
    }

    // ---- signals & control ----

    /// Raise an external event into a running instance. Raises are buffered
    /// FIFO per event name and survive until consumed.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), String> {
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: event_name.into(),
            data: data.into(),
        };
        self.store
            .enqueue_orchestrator_work(item, None)
            .await
            .map_err(|e| e.to_string())
    }

    /// Terminate an instance with the given output. Running children are
    /// terminated too; orchestrator code does not run again.
    pub async fn terminate_instance(
        &self,
        instance: &str,
        output: impl Into<String>,
    ) -> Result<(), String> {
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            output: output.into(),
        };
        self.store
            .enqueue_orchestrator_work(item, None)
            .await
            .map_err(|e| e.to_string())
    }

    /// Pause turn execution. Completions continue to accumulate in history
    /// and replay after resume.
    pub async fn suspend_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), String> {
        let item = WorkItem::SuspendInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store
            .enqueue_orchestrator_work(item, None)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn resume_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), String> {
        let item = WorkItem::ResumeInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store
            .enqueue_orchestrator_work(item, None)
            .await
            .map_err(|e| e.to_string())
    }

    // ---- status & queries ----

    fn status_from_metadata(meta: &InstanceMetadata) -> OrchestrationStatus {
        match meta.status.as_str() {
            "Pending" => OrchestrationStatus::Pending,
            "Suspended" => OrchestrationStatus::Suspended,
            "Completed" => OrchestrationStatus::Completed {
                output: meta.output.clone().unwrap_or_default(),
            },
            "Failed" => OrchestrationStatus::Failed {
                details: meta
                    .failure
                    .clone()
                    .unwrap_or_else(|| {
                        ErrorDetails::application(meta.output.clone().unwrap_or_default())
                    }),
            },
            "Terminated" => OrchestrationStatus::Terminated {
                output: meta.output.clone().unwrap_or_default(),
            },
            _ => OrchestrationStatus::Running,
        }
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        match self.store.read_instance_metadata(instance).await {
            Some(meta) => Self::status_from_metadata(&meta),
            None => OrchestrationStatus::NotFound,
        }
    }

    /// Full instance description. With `include_io`, the input is read from
    /// the current execution's history.
    pub async fn get_instance(
        &self,
        instance: &str,
        include_io: bool,
    ) -> Option<InstanceDescription> {
        let meta = self.store.read_instance_metadata(instance).await?;
        let mut description = InstanceDescription {
            instance: instance.to_string(),
            status: Self::status_from_metadata(&meta),
            created_at_ms: meta.created_at_ms,
            updated_at_ms: meta.updated_at_ms,
            input: None,
            output: None,
            custom_status: meta.custom_status.clone(),
            failure: meta.failure.clone(),
        };
        if include_io {
            description.output = meta.output.clone();
            description.input = self
                .store
                .read(instance)
                .await
                .iter()
                .find_map(|e| match e {
                    Event::OrchestrationStarted { input, .. } => Some(input.clone()),
                    _ => None,
                });
        }
        Some(description)
    }

    /// Block until the instance reaches a terminal state or the timeout
    /// elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.get_orchestration_status(instance).await;
            match status {
                OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. } => return Ok(status),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Query instances with filters and opaque pagination.
    pub async fn query_instances(&self, query: InstanceQuery) -> InstancePage {
        let page_size = if query.page_size == 0 { 100 } else { query.page_size };
        let offset: usize = query
            .continuation_token
            .as_deref()
            .and_then(|t| t.strip_prefix("off:"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        let mut all = self.store.list_instance_metadata().await;
        all.retain(|meta| {
            (query.statuses.is_empty() || query.statuses.contains(&meta.status))
                && query.created_from_ms.is_none_or(|from| meta.created_at_ms >= from)
                && query.created_to_ms.is_none_or(|to| meta.created_at_ms <= to)
                && query
                    .id_prefix
                    .as_deref()
                    .is_none_or(|prefix| meta.instance.starts_with(prefix))
        });
        all.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.instance.cmp(&b.instance))
        });

        let page: Vec<InstanceDescription> = all
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|meta| InstanceDescription {
                instance: meta.instance.clone(),
                status: Self::status_from_metadata(meta),
                created_at_ms: meta.created_at_ms,
                updated_at_ms: meta.updated_at_ms,
                input: None,
                output: meta.output.clone(),
                custom_status: meta.custom_status.clone(),
                failure: meta.failure.clone(),
            })
            .collect();

        let next = offset + page.len();
        let continuation_token = if next < all.len() {
            Some(format!("off:{next}"))
        } else {
            None
        };
        InstancePage {
            instances: page,
            continuation_token,
        }
    }

    /// Remove instances matching the filter; returns how many were purged.
    pub async fn purge_instances(&self, filter: PurgeFilter) -> Result<usize, String> {
        let all = self.store.list_instance_metadata().await;
        let mut purged = 0usize;
        for meta in all {
            let matches = (filter.statuses.is_empty() || filter.statuses.contains(&meta.status))
                && filter
                    .created_from_ms
                    .is_none_or(|from| meta.created_at_ms >= from)
                && filter.created_to_ms.is_none_or(|to| meta.created_at_ms <= to);
            if matches {
                self.store
                    .remove_instance(&meta.instance)
                    .await
                    .map_err(|e| e.to_string())?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Read the current execution's history (postmortem inspection).
    pub async fn read_history(&self, instance: &str) -> Vec<Event> {
        self.store.read(instance).await
    }

    // ---- entities ----

    /// Fire-and-forget entity signal.
    pub async fn signal_entity(
        &self,
        entity: EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.store
            .enqueue_entity_work(WorkItem::EntityOp {
                entity,
                op: EntityOperation::Signal {
                    operation: operation.into(),
                    input: input.into(),
                },
            })
            .await
            .map_err(|e| e.to_string())
    }

    /// Invoke an entity operation and wait for its result. The call queues
    /// behind in-flight operations (and any held lock) like any other.
    pub async fn call_entity(
        &self,
        entity: EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, String> {
        let token = format!("call-{}", crate::generate_guid());
        self.store
            .enqueue_entity_work(WorkItem::EntityOp {
                entity,
                op: EntityOperation::Call {
                    operation: operation.into(),
                    input: input.into(),
                    caller: EntityCaller::Client {
                        token: token.clone(),
                    },
                },
            })
            .await
            .map_err(|e| e.to_string())?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.store.take_client_response(&token).await {
                return result;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err("entity call timed out".to_string());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Read an entity's raw state blob, if the entity exists.
    pub async fn get_entity_state(&self, entity: &EntityId) -> Option<String> {
        self.store.read_entity_state(entity).await
    }

    /// Typed entity state read.
    pub async fn get_entity_state_typed<T: DeserializeOwned>(
        &self,
        entity: &EntityId,
    ) -> Result<Option<T>, String> {
        match self.get_entity_state(entity).await {
            Some(raw) => Json::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_entities(&self) -> Vec<EntityId> {
        self.store.list_entities().await
    }
}
