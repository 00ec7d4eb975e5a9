//! In-process runtime: dispatcher loops that drive orchestration turns,
//! execute activities, fire timers, and apply entity operations, all through
//! a shared [`Provider`].

use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{
    EntityCaller, EntityOperation, ExecutionMetadata, OrchestrationItem, Provider, WorkItem,
};
use crate::{ActivityContext, Action, EntityId, ErrorDetails, Event, OrchestrationContext};

pub mod entities;
pub mod orchestration_turn;
pub mod registry;
pub mod router;
mod state_helpers;

pub use entities::{EntityContext, EntityHandler};
pub use orchestration_turn::{OrchestrationTurn, TurnResult};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder,
    OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};
pub use router::{FailureStrategy, MatchStrategy, VersionRouter};
pub use state_helpers::{BatchReader, HistoryInfo};

/// Configuration options for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval when dispatcher queues are empty. Lower values are
    /// more responsive at the cost of idle CPU. Default: 10ms.
    pub dispatcher_idle_sleep_ms: u64,
    /// Upper bound on instances executing turns concurrently.
    pub max_concurrent_orchestrations: usize,
    /// Upper bound on activities executing concurrently.
    pub max_concurrent_activities: usize,
    /// Upper bound on entity operations executing concurrently (per-entity
    /// serialization is enforced by the provider regardless).
    pub max_concurrent_entity_operations: usize,
    /// This worker's version declaration and routing strategies.
    pub version_router: VersionRouter,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            max_concurrent_orchestrations: 8,
            max_concurrent_activities: 16,
            max_concurrent_entity_operations: 8,
            version_router: VersionRouter::default(),
        }
    }
}

/// High-level orchestration status derived from stored instance metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationStatus {
    NotFound,
    Pending,
    Running,
    Suspended,
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { output: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Trait implemented by orchestration handlers invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime executing orchestrations, activities, timers and
/// entities against a shared provider.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    entity_registry: Arc<EntityRegistry>,
    options: RuntimeOptions,
    orchestration_permits: Arc<Semaphore>,
    activity_permits: Arc<Semaphore>,
    entity_permits: Arc<Semaphore>,
}

impl Runtime {
    /// Start a runtime over the in-memory provider.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: Arc<EntityRegistry>,
    ) -> Arc<Self> {
        let store: Arc<dyn Provider> = Arc::new(crate::providers::in_memory::InMemoryProvider::new());
        Self::start_with_store(store, activity_registry, orchestration_registry, entity_registry)
            .await
    }

    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: Arc<EntityRegistry>,
    ) -> Arc<Self> {
        Self::start_with_options(
            store,
            activity_registry,
            orchestration_registry,
            entity_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: Arc<EntityRegistry>,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set (fine to call often).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            store,
            orchestration_registry,
            activity_registry,
            entity_registry,
            orchestration_permits: Arc::new(Semaphore::new(options.max_concurrent_orchestrations)),
            activity_permits: Arc::new(Semaphore::new(options.max_concurrent_activities)),
            entity_permits: Arc::new(Semaphore::new(options.max_concurrent_entity_operations)),
            options,
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);
        let handle = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.push(handle);
        let handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(handle);
        let handle = runtime.clone().start_entity_dispatcher();
        runtime.joins.lock().await.push(handle);

        runtime
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    /// Abort background dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for join in joins.drain(..) {
            join.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let permit = self
                    .orchestration_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                if let Some(item) = self.store.fetch_orchestration_item().await {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        runtime.process_orchestration_item(item).await;
                        drop(permit);
                    });
                } else {
                    drop(permit);
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await;
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_worker_peek_lock().await {
                    let permit = self
                        .activity_permits
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        runtime.execute_activity(item, token).await;
                        drop(permit);
                    });
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await;
                }
            }
        })
    }

    async fn execute_activity(self: Arc<Self>, item: WorkItem, token: String) {
        match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
            } => {
                let ctx = ActivityContext {
                    instance: instance.clone(),
                    execution_id,
                    activity_id: id,
                    name: name.clone(),
                };
                let completion = match self.activity_registry.resolve_handler(&name) {
                    Some((_, handler)) => match handler.invoke(ctx, input).await {
                        Ok(result) => WorkItem::ActivityCompleted {
                            instance: instance.clone(),
                            execution_id,
                            id,
                            result,
                        },
                        Err(error) => WorkItem::ActivityFailed {
                            instance: instance.clone(),
                            execution_id,
                            id,
                            details: ErrorDetails::application(error),
                        },
                    },
                    None => WorkItem::ActivityFailed {
                        instance: instance.clone(),
                        execution_id,
                        id,
                        details: ErrorDetails::application_typed(
                            "activity",
                            format!("unregistered:{name}"),
                        ),
                    },
                };

                // Ack only after the completion is durably enqueued.
                if self
                    .store
                    .enqueue_orchestrator_work(completion, None)
                    .await
                    .is_ok()
                {
                    let _ = self.store.ack_worker(&token).await;
                } else {
                    warn!(instance = %instance, id, "worker: completion enqueue failed; abandoning");
                    let _ = self.store.abandon_worker(&token).await;
                }
            }
            other => {
                error!(?other, "unexpected WorkItem in worker dispatcher; state corruption");
                let _ = self.store.ack_worker(&token).await;
            }
        }
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Timers ride the provider's delayed visibility: a schedule is
        // converted into an orchestrator item that becomes visible at its
        // fire time.
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.store.dequeue_timer_peek_lock().await {
                    let (converted, fire_at_ms) = match item {
                        WorkItem::TimerSchedule {
                            instance,
                            execution_id,
                            id,
                            fire_at_ms,
                        } => (
                            WorkItem::TimerFired {
                                instance,
                                execution_id,
                                id,
                                fire_at_ms,
                            },
                            fire_at_ms,
                        ),
                        WorkItem::EntityLockTimeout {
                            instance,
                            execution_id,
                            id,
                            entities,
                            fire_at_ms,
                        } => (
                            WorkItem::EntityLockTimeout {
                                instance,
                                execution_id,
                                id,
                                entities,
                                fire_at_ms,
                            },
                            fire_at_ms,
                        ),
                        other => {
                            error!(?other, "unexpected WorkItem in timer dispatcher; state corruption");
                            let _ = self.store.ack_timer(&token).await;
                            continue;
                        }
                    };
                    let delay_ms = fire_at_ms.saturating_sub(crate::wall_clock_now_ms());
                    if self
                        .store
                        .enqueue_orchestrator_work(converted, Some(delay_ms))
                        .await
                        .is_ok()
                    {
                        let _ = self.store.ack_timer(&token).await;
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await;
                }
            }
        })
    }

    fn start_entity_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(item) = self.store.fetch_entity_item().await {
                    let permit = self
                        .entity_permits
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let registry = self.entity_registry.clone();
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        entities::process_entity_item(&registry, &store, item).await;
                        drop(permit);
                    });
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await;
                }
            }
        })
    }

    /// Child instances scheduled in this history that have not completed.
    fn outstanding_children(history: &[Event]) -> Vec<String> {
        let mut children = Vec::new();
        for event in history {
            if let Event::SubOrchestrationScheduled {
                event_id, instance, ..
            } = event
            {
                let done = history.iter().any(|e| match e {
                    Event::SubOrchestrationCompleted { source_event_id, .. }
                    | Event::SubOrchestrationFailed { source_event_id, .. } => {
                        source_event_id == event_id
                    }
                    _ => false,
                });
                if !done {
                    children.push(instance.clone());
                }
            }
        }
        children
    }

    fn lock_request_entities(history: &[Event], id: u64) -> Option<Vec<EntityId>> {
        history.iter().find_map(|e| match e {
            Event::EntityLockRequested {
                event_id, entities, ..
            } if *event_id == id => Some(entities.clone()),
            _ => None,
        })
    }

    /// Scan a turn's history delta for terminal/suspension markers and the
    /// latest custom status, producing the provider metadata update.
    fn compute_execution_metadata(history_delta: &[Event]) -> ExecutionMetadata {
        let mut metadata = ExecutionMetadata::default();
        for event in history_delta {
            match event {
                Event::OrchestrationCompleted { output, .. } => {
                    metadata.status = Some("Completed".to_string());
                    metadata.output = Some(output.clone());
                }
                Event::OrchestrationFailed { details, .. } => {
                    metadata.status = Some("Failed".to_string());
                    metadata.output = Some(details.display_message());
                    metadata.failure = Some(details.clone());
                }
                Event::OrchestrationTerminated { output, .. } => {
                    metadata.status = Some("Terminated".to_string());
                    metadata.output = Some(output.clone());
                }
                Event::OrchestrationContinuedAsNew { .. } => {
                    metadata.status = Some("Running".to_string());
                }
                Event::OrchestrationSuspended { .. } => {
                    metadata.status = Some("Suspended".to_string());
                }
                Event::OrchestrationResumed { .. } => {
                    metadata.status = Some("Running".to_string());
                }
                Event::SystemCall { op, value, .. } if op == crate::SYSCALL_OP_CUSTOM_STATUS => {
                    metadata.custom_status = Some(value.clone());
                }
                _ => {}
            }
        }
        if metadata.status.is_none() && !history_delta.is_empty() {
            metadata.status = Some("Running".to_string());
        }
        metadata
    }

    /// Convert a turn's recorded actions into queued work items.
    fn convert_actions(
        &self,
        instance: &str,
        execution_id: u64,
        actions: &[Action],
    ) -> (Vec<WorkItem>, Vec<WorkItem>, Vec<WorkItem>, Vec<WorkItem>) {
        let mut worker_items = Vec::new();
        let mut timer_items = Vec::new();
        let mut orchestrator_items = Vec::new();
        let mut entity_items = Vec::new();

        for action in actions {
            match action.clone() {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                } => worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id,
                    id: scheduling_event_id,
                    name,
                    input,
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => timer_items.push(WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    execution_id,
                    id: scheduling_event_id,
                    fire_at_ms,
                }),
                Action::WaitExternal { .. } => {}
                Action::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    version,
                    instance: child,
                    input,
                } => orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    input,
                    version,
                    parent_instance: Some(instance.to_string()),
                    parent_id: Some(scheduling_event_id),
                    parent_execution_id: Some(execution_id),
                }),
                Action::StartOrchestrationDetached {
                    name,
                    version,
                    instance: child,
                    input,
                    ..
                } => orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    input,
                    version,
                    parent_instance: None,
                    parent_id: None,
                    parent_execution_id: None,
                }),
                Action::SignalEntity {
                    entity,
                    operation,
                    input,
                    ..
                } => entity_items.push(WorkItem::EntityOp {
                    entity,
                    op: EntityOperation::Signal { operation, input },
                }),
                Action::CallEntity {
                    scheduling_event_id,
                    entity,
                    operation,
                    input,
                } => entity_items.push(WorkItem::EntityOp {
                    entity,
                    op: EntityOperation::Call {
                        operation,
                        input,
                        caller: EntityCaller::Orchestration {
                            instance: instance.to_string(),
                            execution_id,
                            id: scheduling_event_id,
                        },
                    },
                }),
                Action::RequestEntityLock {
                    scheduling_event_id,
                    entities,
                    timeout_ms,
                } => {
                    if entities.is_empty() {
                        orchestrator_items.push(WorkItem::EntityLockGranted {
                            instance: instance.to_string(),
                            execution_id,
                            id: scheduling_event_id,
                        });
                        continue;
                    }
                    entity_items.push(WorkItem::EntityOp {
                        entity: entities[0].clone(),
                        op: EntityOperation::LockAcquire {
                            instance: instance.to_string(),
                            execution_id,
                            source_event_id: scheduling_event_id,
                            entities: entities.clone(),
                            index: 0,
                        },
                    });
                    if let Some(timeout) = timeout_ms {
                        timer_items.push(WorkItem::EntityLockTimeout {
                            instance: instance.to_string(),
                            execution_id,
                            id: scheduling_event_id,
                            entities,
                            fire_at_ms: crate::wall_clock_now_ms().saturating_add(timeout),
                        });
                    }
                }
                Action::ReleaseEntityLock { entities, .. } => {
                    for entity in entities {
                        entity_items.push(WorkItem::EntityOp {
                            entity,
                            op: EntityOperation::LockRelease {
                                instance: instance.to_string(),
                            },
                        });
                    }
                }
                Action::SystemCall { .. } | Action::ContinueAsNew { .. } => {}
            }
        }

        (worker_items, timer_items, orchestrator_items, entity_items)
    }

    /// Ack with bounded retries on retryable provider errors; abandon after
    /// the budget is spent so the batch re-delivers.
    #[allow(clippy::too_many_arguments)]
    async fn ack_with_retry(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;
        loop {
            match self
                .store
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    history_delta.clone(),
                    worker_items.clone(),
                    timer_items.clone(),
                    orchestrator_items.clone(),
                    entity_items.clone(),
                    metadata.clone(),
                )
                .await
            {
                Ok(()) => {
                    debug!("ack_orchestration_item succeeded");
                    return;
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(attempts, error = %e, "ack_orchestration_item failed; abandoning batch");
                    let _ = self
                        .store
                        .abandon_orchestration_item(lock_token, Some(50))
                        .await;
                    return;
                }
            }
        }
    }

    async fn process_orchestration_item(self: Arc<Self>, item: OrchestrationItem) {
        let instance = item.instance.clone();
        let info = HistoryInfo::from_history(&item.history);
        let batch = BatchReader::from_messages(&item.messages, &info, &instance);

        // Terminal histories accept no further work; a CAN'd execution with
        // its rollover message pending is the one exception. Late lock
        // grants must still be released or the entities leak.
        if info.is_terminal() && !(info.is_continued_as_new && batch.is_continue_as_new) {
            let mut entity_items = Vec::new();
            for msg in &batch.completion_messages {
                if let WorkItem::EntityLockGranted { id, .. } = msg {
                    if let Some(entities) = Self::lock_request_entities(&item.history, *id) {
                        warn!(instance = %instance, id, "lock granted to terminal instance; releasing");
                        for entity in entities {
                            entity_items.push(WorkItem::EntityOp {
                                entity,
                                op: EntityOperation::LockRelease {
                                    instance: instance.clone(),
                                },
                            });
                        }
                    }
                }
            }
            debug!(instance = %instance, "instance is terminal; acking batch without processing");
            self.ack_with_retry(
                &item.lock_token,
                item.execution_id,
                vec![],
                vec![],
                vec![],
                vec![],
                entity_items,
                ExecutionMetadata::default(),
            )
            .await;
            return;
        }

        // Version routing: only compatible workers may run this instance.
        let tag_source = if item.history.is_empty() {
            batch.version.clone()
        } else {
            info.orchestration_version.clone()
        };
        let tag = tag_source
            .as_deref()
            .filter(|v| *v != "0.0.0")
            .and_then(|v| Version::parse(v).ok());
        if !self.options.version_router.accepts(tag.as_ref()) {
            match self.options.version_router.failure_strategy {
                FailureStrategy::Fail => {
                    warn!(
                        instance = %instance,
                        instance_version = ?tag,
                        worker_version = ?self.options.version_router.worker_version,
                        "incompatible instance version; leaving work undelivered"
                    );
                    let _ = self
                        .store
                        .abandon_orchestration_item(&item.lock_token, Some(1_000))
                        .await;
                    return;
                }
                FailureStrategy::Succeed => {
                    warn!(
                        instance = %instance,
                        instance_version = ?tag,
                        "incompatible instance version; processing anyway per FailureStrategy::Succeed"
                    );
                }
            }
        }

        // Termination bypasses orchestrator code entirely.
        if let Some(output) = batch.terminate.clone() {
            let mut turn = OrchestrationTurn::new(
                instance.clone(),
                item.history.len() as u64,
                item.execution_id,
                item.history.clone(),
            );
            turn.seed(Event::OrchestrationTerminated {
                event_id: 0,
                output: output.clone(),
            });
            let mut orchestrator_items = Vec::new();
            for child in Self::outstanding_children(&item.history) {
                orchestrator_items.push(WorkItem::TerminateInstance {
                    instance: child,
                    output: "terminated by parent".to_string(),
                });
            }
            if let Some((parent, id, parent_execution)) = info.parent_link() {
                orchestrator_items.push(WorkItem::SubOrchFailed {
                    instance: parent,
                    execution_id: parent_execution,
                    id,
                    details: ErrorDetails::Cancelled {
                        reason: output.clone(),
                    },
                });
            }
            let metadata = Self::compute_execution_metadata(turn.history_delta());
            self.ack_with_retry(
                &item.lock_token,
                item.execution_id,
                turn.history_delta().to_vec(),
                vec![],
                vec![],
                orchestrator_items,
                vec![],
                metadata,
            )
            .await;
            return;
        }

        // A ContinueAsNew message is only actionable while the current
        // execution ends in ContinuedAsNew; anything else is a duplicate
        // delivery of an already-applied rollover.
        if batch.is_continue_as_new && !info.is_continued_as_new {
            warn!(instance = %instance, "duplicate continue-as-new delivery; acking without processing");
            self.ack_with_retry(
                &item.lock_token,
                item.execution_id,
                vec![],
                vec![],
                vec![],
                vec![],
                vec![],
                ExecutionMetadata::default(),
            )
            .await;
            return;
        }

        // Decide the execution and seed events for starts and rollovers.
        let is_new = item.history.is_empty();
        let (execution_id, mut turn, orchestration_name, resolved_version, input, parent_link) =
            if batch.is_continue_as_new {
                let execution_id = item.execution_id + 1;
                let mut turn =
                    OrchestrationTurn::new(instance.clone(), 0, execution_id, Vec::new());
                let name = batch.orchestration_name.clone();
                let version = match &batch.version {
                    Some(v) => v.clone(),
                    None => self
                        .orchestration_registry
                        .resolve_handler(&name)
                        .map(|(v, _)| v.to_string())
                        .or_else(|| info.orchestration_version.clone())
                        .unwrap_or_else(|| "0.0.0".to_string()),
                };
                debug!(instance = %instance, orchestration = %name, execution_id, "starting continued-as-new execution");
                turn.seed(Event::OrchestrationStarted {
                    event_id: 0,
                    name: name.clone(),
                    version: version.clone(),
                    input: batch.input.clone(),
                    parent_instance: batch.parent_instance.clone(),
                    parent_id: batch.parent_id,
                    parent_execution_id: batch.parent_execution_id,
                });
                // The preserved, still-unconsumed raises from the old epoch.
                for (name, data) in &batch.carried_events {
                    turn.seed(Event::ExternalEvent {
                        event_id: 0,
                        name: name.clone(),
                        data: data.clone(),
                    });
                }
                let parent = batch
                    .parent_instance
                    .clone()
                    .zip(batch.parent_id)
                    .zip(batch.parent_execution_id)
                    .map(|((p, id), exec)| (p, id, exec));
                (execution_id, turn, name, version, batch.input.clone(), parent)
            } else if is_new {
                if !batch.has_start_item() {
                    if !batch.completion_messages.is_empty() {
                        warn!(instance = %instance, "completion messages for unstarted instance; dropping");
                    }
                    self.ack_with_retry(
                        &item.lock_token,
                        item.execution_id,
                        vec![],
                        vec![],
                        vec![],
                        vec![],
                        vec![],
                        ExecutionMetadata::default(),
                    )
                    .await;
                    return;
                }
                let name = batch.orchestration_name.clone();
                let mut turn =
                    OrchestrationTurn::new(instance.clone(), 0, item.execution_id, Vec::new());
                let resolved = match &batch.version {
                    Some(v) => Some(v.clone()),
                    None => self
                        .orchestration_registry
                        .resolve_handler(&name)
                        .map(|(v, _)| v.to_string()),
                };
                let parent = batch
                    .parent_instance
                    .clone()
                    .zip(batch.parent_id)
                    .zip(batch.parent_execution_id)
                    .map(|((p, id), exec)| (p, id, exec));
                let Some(version) = resolved else {
                    // Unregistered orchestration: record a proper history and
                    // fail immediately.
                    turn.seed(Event::OrchestrationStarted {
                        event_id: 0,
                        name: name.clone(),
                        version: "0.0.0".to_string(),
                        input: batch.input.clone(),
                        parent_instance: batch.parent_instance.clone(),
                        parent_id: batch.parent_id,
                        parent_execution_id: batch.parent_execution_id,
                    });
                    let details = ErrorDetails::application_typed(
                        "orchestration",
                        format!("unregistered:{name}"),
                    );
                    turn.seed(Event::OrchestrationFailed {
                        event_id: 0,
                        details: details.clone(),
                    });
                    let mut orchestrator_items = Vec::new();
                    if let Some((parent, id, parent_execution)) = parent {
                        orchestrator_items.push(WorkItem::SubOrchFailed {
                            instance: parent,
                            execution_id: parent_execution,
                            id,
                            details,
                        });
                    }
                    let metadata = Self::compute_execution_metadata(turn.history_delta());
                    self.ack_with_retry(
                        &item.lock_token,
                        item.execution_id,
                        turn.history_delta().to_vec(),
                        vec![],
                        vec![],
                        orchestrator_items,
                        vec![],
                        metadata,
                    )
                    .await;
                    return;
                };
                debug!(instance = %instance, orchestration = %name, version = %version, "starting new instance");
                turn.seed(Event::OrchestrationStarted {
                    event_id: 0,
                    name: name.clone(),
                    version: version.clone(),
                    input: batch.input.clone(),
                    parent_instance: batch.parent_instance.clone(),
                    parent_id: batch.parent_id,
                    parent_execution_id: batch.parent_execution_id,
                });
                (item.execution_id, turn, name, version, batch.input.clone(), parent)
            } else {
                let turn = OrchestrationTurn::new(
                    instance.clone(),
                    item.history.len() as u64,
                    item.execution_id,
                    item.history.clone(),
                );
                (
                    item.execution_id,
                    turn,
                    info.orchestration_name.clone().unwrap_or_default(),
                    info.orchestration_version
                        .clone()
                        .unwrap_or_else(|| "0.0.0".to_string()),
                    info.orchestration_input.clone().unwrap_or_default(),
                    info.parent_link(),
                )
            };

        // Suspension gates execution, not history: completions arriving
        // while suspended are appended and replay after resume.
        let resuming = batch.resume.is_some();
        if info.is_suspended && !resuming {
            turn.prep_completions(&batch.completion_messages);
            let entity_items = turn.take_extra_entity_items();
            let mut metadata = Self::compute_execution_metadata(turn.history_delta());
            metadata.status = None; // stays Suspended
            self.ack_with_retry(
                &item.lock_token,
                execution_id,
                turn.history_delta().to_vec(),
                vec![],
                vec![],
                vec![],
                entity_items,
                metadata,
            )
            .await;
            return;
        }
        if let Some(reason) = batch.suspend.clone() {
            if !resuming {
                turn.prep_completions(&batch.completion_messages);
                turn.seed(Event::OrchestrationSuspended {
                    event_id: 0,
                    reason,
                });
                let entity_items = turn.take_extra_entity_items();
                let metadata = Self::compute_execution_metadata(turn.history_delta());
                self.ack_with_retry(
                    &item.lock_token,
                    execution_id,
                    turn.history_delta().to_vec(),
                    vec![],
                    vec![],
                    vec![],
                    entity_items,
                    metadata,
                )
                .await;
                return;
            }
        }
        turn.prep_completions(&batch.completion_messages);
        if resuming && info.is_suspended {
            turn.seed(Event::OrchestrationResumed {
                event_id: 0,
                reason: batch.resume.clone().unwrap_or_default(),
            });
        }

        // Resolve the handler at the instance's pinned version.
        let handler = Version::parse(&resolved_version)
            .ok()
            .and_then(|v| {
                self.orchestration_registry
                    .resolve_handler_exact(&orchestration_name, &v)
            });
        let Some(handler) = handler else {
            let details = ErrorDetails::application_typed(
                "orchestration",
                format!("unregistered:{orchestration_name}@{resolved_version}"),
            );
            turn.seed(Event::OrchestrationFailed {
                event_id: 0,
                details: details.clone(),
            });
            let mut orchestrator_items = Vec::new();
            if let Some((parent, id, parent_execution)) = parent_link {
                orchestrator_items.push(WorkItem::SubOrchFailed {
                    instance: parent,
                    execution_id: parent_execution,
                    id,
                    details,
                });
            }
            let metadata = Self::compute_execution_metadata(turn.history_delta());
            self.ack_with_retry(
                &item.lock_token,
                execution_id,
                turn.history_delta().to_vec(),
                vec![],
                vec![],
                orchestrator_items,
                vec![],
                metadata,
            )
            .await;
            return;
        };

        let result = turn.execute_orchestration(handler, input);

        let mut orchestrator_items = Vec::new();
        match result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => {
                turn.seed(Event::OrchestrationCompleted {
                    event_id: 0,
                    output: output.clone(),
                });
                if let Some((parent, id, parent_execution)) = parent_link.clone() {
                    orchestrator_items.push(WorkItem::SubOrchCompleted {
                        instance: parent,
                        execution_id: parent_execution,
                        id,
                        result: output,
                    });
                }
            }
            TurnResult::Failed(details) => {
                turn.seed(Event::OrchestrationFailed {
                    event_id: 0,
                    details: details.clone(),
                });
                if let Some((parent, id, parent_execution)) = parent_link.clone() {
                    // Parents observe child failures as catchable application
                    // failures regardless of the underlying class.
                    let delivered = if details.is_application() {
                        details.clone()
                    } else {
                        ErrorDetails::application_typed(
                            "suborchestration",
                            details.display_message(),
                        )
                    };
                    orchestrator_items.push(WorkItem::SubOrchFailed {
                        instance: parent,
                        execution_id: parent_execution,
                        id,
                        details: delivered,
                    });
                }
            }
            TurnResult::ContinueAsNew {
                input: next_input,
                version,
                preserve_unprocessed_events,
            } => {
                let carried_events = if preserve_unprocessed_events {
                    turn.unconsumed_external_events()
                } else {
                    Vec::new()
                };
                turn.seed(Event::OrchestrationContinuedAsNew {
                    event_id: 0,
                    input: next_input.clone(),
                });
                orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.clone(),
                    orchestration: orchestration_name.clone(),
                    input: next_input,
                    version,
                    carried_events,
                });
            }
        }

        let (worker_items, timer_items, action_orch_items, mut entity_items) =
            self.convert_actions(&instance, execution_id, turn.pending_actions());
        orchestrator_items.extend(action_orch_items);
        entity_items.extend(turn.take_extra_entity_items());

        let metadata = Self::compute_execution_metadata(turn.history_delta());
        debug!(
            instance = %instance,
            delta = turn.history_delta().len(),
            workers = worker_items.len(),
            timers = timer_items.len(),
            orch = orchestrator_items.len(),
            entities = entity_items.len(),
            "acking orchestration turn"
        );
        self.ack_with_retry(
            &item.lock_token,
            execution_id,
            turn.history_delta().to_vec(),
            worker_items,
            timer_items,
            orchestrator_items,
            entity_items,
            metadata,
        )
        .await;
    }
}
