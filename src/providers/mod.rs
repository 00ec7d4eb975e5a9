//! Storage abstraction: append-only per-instance histories, peek-lock work
//! queues with delayed visibility, entity records, and instance metadata.
//!
//! Providers are datastores only; the runtime owns all execution logic. The
//! central contract is the atomic orchestration item: one locked batch of
//! messages for one instance, acknowledged together with the history delta and
//! all downstream work it produced.

use serde::{Deserialize, Serialize};

use crate::{EntityId, ErrorDetails, Event};

pub mod error;
/// Filesystem-backed provider for local development.
pub mod fs;
/// In-memory provider for tests.
pub mod in_memory;

pub use error::ProviderError;

/// A unit of dispatchable work carried through the provider queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkItem {
    // orchestrator queue
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
        parent_execution_id: Option<u64>,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        /// External events carried into the new epoch as `(name, data)`.
        carried_events: Vec<(String, String)>,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    SubOrchFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    EntityCallCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    EntityCallFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    EntityLockGranted {
        instance: String,
        execution_id: u64,
        id: u64,
    },
    EntityLockFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        reason: String,
    },
    TerminateInstance {
        instance: String,
        output: String,
    },
    SuspendInstance {
        instance: String,
        reason: String,
    },
    ResumeInstance {
        instance: String,
        reason: String,
    },

    // worker queue
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },

    // timer queue (anything with a fire time; re-enqueued to the
    // orchestrator queue with delayed visibility)
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    EntityLockTimeout {
        instance: String,
        execution_id: u64,
        id: u64,
        entities: Vec<EntityId>,
        fire_at_ms: u64,
    },

    // entity queue
    EntityOp {
        entity: EntityId,
        op: EntityOperation,
    },
}

impl WorkItem {
    /// The orchestration instance this item targets, if any.
    pub fn instance(&self) -> Option<&str> {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::SubOrchCompleted { instance, .. }
            | WorkItem::SubOrchFailed { instance, .. }
            | WorkItem::EntityCallCompleted { instance, .. }
            | WorkItem::EntityCallFailed { instance, .. }
            | WorkItem::EntityLockGranted { instance, .. }
            | WorkItem::EntityLockFailed { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::EntityLockTimeout { instance, .. } => Some(instance),
            WorkItem::EntityOp { .. } => None,
        }
    }
}

/// Who is waiting on an entity call result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntityCaller {
    /// An orchestration suspended on `EntityCallScheduled` correlation `id`.
    Orchestration {
        instance: String,
        execution_id: u64,
        id: u64,
    },
    /// An external client polling the response mailbox under `token`.
    Client { token: String },
}

/// One operation in an entity's FIFO queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntityOperation {
    Signal {
        operation: String,
        input: String,
    },
    Call {
        operation: String,
        input: String,
        caller: EntityCaller,
    },
    /// Chained multi-entity lock acquisition: each member entity marks itself
    /// held and forwards the request to `entities[index + 1]`; the last one
    /// notifies the orchestration. `entities` is sorted (the global order).
    LockAcquire {
        instance: String,
        execution_id: u64,
        source_event_id: u64,
        entities: Vec<EntityId>,
        index: usize,
    },
    /// Release this entity if held by `instance`; no-op otherwise.
    LockRelease { instance: String },
}

impl EntityOperation {
    /// Whether this operation may run while the entity is locked by
    /// `lock_holder`. Holder operations proceed; others are deferred.
    pub fn eligible(&self, lock_holder: Option<&str>) -> bool {
        let Some(holder) = lock_holder else {
            return true;
        };
        match self {
            EntityOperation::Signal { .. } => false,
            EntityOperation::Call { caller, .. } => match caller {
                EntityCaller::Orchestration { instance, .. } => instance == holder,
                EntityCaller::Client { .. } => false,
            },
            EntityOperation::LockAcquire { instance, .. } => instance == holder,
            EntityOperation::LockRelease { instance } => instance == holder,
        }
    }
}

/// A locked batch of orchestrator work for one instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    /// Current execution (epoch) number; `INITIAL_EXECUTION_ID` if new.
    pub execution_id: u64,
    /// History of the current execution.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// A single eligible entity operation, locked for processing.
#[derive(Debug, Clone)]
pub struct EntityItem {
    pub entity: EntityId,
    pub state: Option<String>,
    pub lock_holder: Option<String>,
    pub operation: EntityOperation,
    pub lock_token: String,
}

/// Semantic summary of a turn, computed by the runtime and stored by the
/// provider so that management reads need no orchestration knowledge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Terminal or notable status reached this turn, if any
    /// ("Completed", "Failed", "Terminated", "ContinuedAsNew", "Suspended",
    /// "Running").
    pub status: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub failure: Option<ErrorDetails>,
}

/// Stored per-instance management record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance: String,
    pub status: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorDetails>,
}

/// Storage abstraction consumed by the runtime and the client.
///
/// Append durability contract: `ack_orchestration_item` commits the history
/// delta, all downstream queue work, and the metadata update atomically; the
/// runtime performs no externally visible action before the ack succeeds, and
/// retries retryable failures with backoff.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    // ---- orchestrator queue ----

    /// Enqueue orchestrator work, optionally invisible for `delay_ms`.
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    /// Fetch the next locked batch of visible orchestrator messages for an
    /// instance that is not already locked. Returns `None` when idle.
    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem>;

    /// Atomically commit a turn. Acking with `execution_id` greater than the
    /// stored latest starts a fresh execution seeded with `history_delta`
    /// (epoch rollover; prior executions are retained for reads). On a
    /// terminal status the provider releases every entity lock held by the
    /// instance.
    #[allow(clippy::too_many_arguments)]
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Return a fetched batch to the queue, optionally delayed.
    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError>;

    // ---- worker (activity) queue ----

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError>;
    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError>;

    // ---- timer queue ----

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError>;

    // ---- entity queue / records ----

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Fetch the next eligible entity operation, serialized per entity:
    /// an entity with an operation in flight yields nothing until the ack.
    /// Eligibility honors the entity lock (`EntityOperation::eligible`).
    async fn fetch_entity_item(&self) -> Option<EntityItem>;

    /// Commit one entity operation: optional state write (`Some(None)`
    /// deletes), optional lock-holder change, plus follow-on work.
    async fn ack_entity_item(
        &self,
        lock_token: &str,
        state: Option<Option<String>>,
        lock_holder: Option<Option<String>>,
        orchestrator_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    async fn abandon_entity_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    async fn read_entity_state(&self, entity: &EntityId) -> Option<String>;
    async fn list_entities(&self) -> Vec<EntityId>;

    // ---- history & management reads ----

    /// Read the current execution's history.
    async fn read(&self, instance: &str) -> Vec<Event>;
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;
    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;
    async fn list_instances(&self) -> Vec<String>;
    async fn read_instance_metadata(&self, instance: &str) -> Option<InstanceMetadata>;
    async fn list_instance_metadata(&self) -> Vec<InstanceMetadata>;
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;
    async fn remove_instances(&self, instances: &[String]) -> Result<(), ProviderError> {
        for id in instances {
            self.remove_instance(id).await?;
        }
        Ok(())
    }

    // ---- client entity-call mailbox ----

    async fn put_client_response(
        &self,
        token: &str,
        result: Result<String, String>,
    ) -> Result<(), ProviderError>;
    async fn take_client_response(&self, token: &str) -> Option<Result<String, String>>;

    // ---- test utilities ----

    async fn reset(&self);
    async fn dump_all_pretty(&self) -> String;
}
