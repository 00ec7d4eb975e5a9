//! duratask: a durable execution runtime.
//!
//! Orchestrations are deterministic functions re-executed ("replayed") against
//! an append-only history of events. Scheduling calls made by orchestration
//! code bind to recorded events by correlation id; calls with no recorded
//! completion suspend the orchestration until the completion arrives through
//! the provider queues. Entities are serialized-access actors sharing the same
//! event/queue substrate.

use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod _typed_codec;
pub mod client;
mod errors;
pub mod futures;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use errors::ErrorDetails;
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture, TryJoinFuture};
pub use retry::RetryPolicy;

use crate::_typed_codec::{Codec, Json};
use crate::futures::{AggregateDurableFuture, Kind};

/// First event id of every execution.
pub const INITIAL_EVENT_ID: u64 = 1;
/// Execution (epoch) numbering starts at 1; ContinueAsNew increments it.
pub const INITIAL_EXECUTION_ID: u64 = 1;

pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_UTCNOW_MS: &str = "utcnow_ms";
pub(crate) const SYSCALL_OP_CUSTOM_STATUS: &str = "custom_status";
pub(crate) const SYSCALL_OP_TRACE_PREFIX: &str = "trace:";

/// Identity of an entity: a logical name plus a partition key.
///
/// The derived `Ord` (lexicographic by `(name, key)`) is the total order used
/// for multi-entity lock acquisition; see `runtime::entities`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.key)
    }
}

/// One record of an instance's append-only history.
///
/// `event_id` is strictly increasing per execution and never reused.
/// Completion events point back at their scheduling event through
/// `source_event_id` (the correlation id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        version: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
        #[serde(default)]
        parent_execution_id: Option<u64>,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
        execution_id: u64,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
        execution_id: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    ExternalEvent {
        event_id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
        execution_id: u64,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    /// Detached (fire-and-forget) orchestration start; scheduling-only.
    OrchestrationChained {
        event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
        execution_id: u64,
    },
    /// One-way entity signal; scheduling-only, no completion.
    EntitySignaled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
        execution_id: u64,
    },
    EntityCallScheduled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
        execution_id: u64,
    },
    EntityCallCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    EntityCallFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    EntityLockRequested {
        event_id: u64,
        entities: Vec<EntityId>,
        execution_id: u64,
    },
    EntityLockGranted {
        event_id: u64,
        source_event_id: u64,
    },
    EntityLockFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    /// Lock released by orchestration code; scheduling-only.
    EntityLockReleased {
        event_id: u64,
        source_event_id: u64,
    },
    /// Deterministic system call (guid, utcnow, trace, custom status); the
    /// recorded value is replayed verbatim.
    SystemCall {
        event_id: u64,
        op: String,
        value: String,
        execution_id: u64,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        details: ErrorDetails,
    },
    OrchestrationContinuedAsNew {
        event_id: u64,
        input: String,
    },
    OrchestrationTerminated {
        event_id: u64,
        output: String,
    },
    OrchestrationSuspended {
        event_id: u64,
        reason: String,
    },
    OrchestrationResumed {
        event_id: u64,
        reason: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::OrchestrationChained { event_id, .. }
            | Event::EntitySignaled { event_id, .. }
            | Event::EntityCallScheduled { event_id, .. }
            | Event::EntityCallCompleted { event_id, .. }
            | Event::EntityCallFailed { event_id, .. }
            | Event::EntityLockRequested { event_id, .. }
            | Event::EntityLockGranted { event_id, .. }
            | Event::EntityLockFailed { event_id, .. }
            | Event::EntityLockReleased { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. }
            | Event::OrchestrationSuspended { event_id, .. }
            | Event::OrchestrationResumed { event_id, .. } => *event_id,
        }
    }

    pub fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::OrchestrationChained { event_id, .. }
            | Event::EntitySignaled { event_id, .. }
            | Event::EntityCallScheduled { event_id, .. }
            | Event::EntityCallCompleted { event_id, .. }
            | Event::EntityCallFailed { event_id, .. }
            | Event::EntityLockRequested { event_id, .. }
            | Event::EntityLockGranted { event_id, .. }
            | Event::EntityLockFailed { event_id, .. }
            | Event::EntityLockReleased { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. }
            | Event::OrchestrationSuspended { event_id, .. }
            | Event::OrchestrationResumed { event_id, .. } => *event_id = id,
        }
    }

    /// True for events that represent a scheduling decision made by
    /// orchestration code (the claimable side of a correlation pair).
    pub fn is_scheduling_event(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. }
                | Event::TimerCreated { .. }
                | Event::ExternalSubscribed { .. }
                | Event::SubOrchestrationScheduled { .. }
                | Event::OrchestrationChained { .. }
                | Event::EntitySignaled { .. }
                | Event::EntityCallScheduled { .. }
                | Event::EntityLockRequested { .. }
                | Event::EntityLockReleased { .. }
                | Event::SystemCall { .. }
        )
    }
}

/// A decision emitted by a turn, converted into queued work by the runtime
/// after the history delta is durably committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    StartOrchestrationDetached {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    SignalEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    CallEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    RequestEntityLock {
        scheduling_event_id: u64,
        entities: Vec<EntityId>,
        timeout_ms: Option<u64>,
    },
    ReleaseEntityLock {
        scheduling_event_id: u64,
        lock_event_id: u64,
        entities: Vec<EntityId>,
    },
    SystemCall {
        scheduling_event_id: u64,
        op: String,
        value: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
        preserve_unprocessed_events: bool,
    },
}

/// Options for `OrchestrationContext::continue_as_new_with`.
#[derive(Debug, Clone, Default)]
pub struct ContinueAsNewOptions {
    /// Pin the next execution to a specific registered version.
    pub version: Option<String>,
    /// Carry external events raised but not yet consumed into the new epoch.
    pub preserve_unprocessed_events: bool,
}

pub(crate) fn wall_clock_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Unique id recorded on first execution and replayed verbatim afterwards.
pub(crate) fn generate_guid() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    thread_local! {
        static COUNTER: Cell<u32> = const { Cell::new(0) };
    }
    let counter = COUNTER.with(|c| {
        let v = c.get();
        c.set(v.wrapping_add(1));
        v
    });
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (timestamp >> 96) as u32,
        ((timestamp >> 80) & 0xFFFF) as u16,
        (counter & 0xFFFF) as u16,
        ((timestamp >> 64) & 0xFFFF) as u16,
        (timestamp & 0xFFFF_FFFF_FFFF) as u64
    )
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    #[allow(dead_code)]
    pub(crate) turn_index: u64,
    pub(crate) orchestration_name: Option<String>,
    pub(crate) orchestration_version: Option<String>,
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) cancelled_source_ids: HashSet<u64>,
    pub(crate) is_replaying: bool,
    pub(crate) nondeterminism_error: Option<String>,
    pub(crate) continued_as_new: bool,
}

impl CtxInner {
    fn new(instance: String, execution_id: u64, turn_index: u64, history: Vec<Event>) -> Self {
        let next_event_id = history.iter().map(Event::event_id).max().unwrap_or(0) + 1;
        let mut orchestration_name = None;
        let mut orchestration_version = None;
        for e in history.iter().rev() {
            if let Event::OrchestrationStarted { name, version, .. } = e {
                orchestration_name = Some(name.clone());
                orchestration_version = Some(version.clone());
                break;
            }
        }
        let is_replaying = history.iter().any(Event::is_scheduling_event);
        Self {
            instance,
            execution_id,
            turn_index,
            orchestration_name,
            orchestration_version,
            history,
            actions: Vec::new(),
            next_event_id,
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            cancelled_source_ids: HashSet::new(),
            is_replaying,
            nondeterminism_error: None,
            continued_as_new: false,
        }
    }

    /// Append a freshly created event, assigning it the next id. The first
    /// new append flips the context out of replay mode.
    pub(crate) fn append_new_event(&mut self, mut event: Event) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        event.set_event_id(id);
        self.history.push(event);
        self.is_replaying = false;
        id
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// No scheduling call may follow `continue_as_new` within a turn.
    pub(crate) fn scheduling_allowed(&mut self) -> bool {
        if self.continued_as_new {
            self.nondeterminism_error =
                Some("scheduling call issued after continue_as_new".to_string());
            false
        } else {
            true
        }
    }
}

/// Handle given to orchestration code; all interaction with the outside world
/// goes through it so that replay can intercept and bind to history.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(
        instance: String,
        execution_id: u64,
        turn_index: u64,
        history: Vec<Event>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                instance,
                execution_id,
                turn_index,
                history,
            ))),
        }
    }

    // ---- introspection ----

    /// True while this turn is reproducing recorded history; false once the
    /// first new event is appended.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().unwrap().is_replaying
    }

    pub fn instance_id(&self) -> String {
        self.inner.lock().unwrap().instance.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.inner.lock().unwrap().execution_id
    }

    pub fn orchestration_name(&self) -> Option<String> {
        self.inner.lock().unwrap().orchestration_name.clone()
    }

    /// The version tag pinned at instance creation. Fixed history data, so
    /// branching on it is replay-safe.
    pub fn orchestration_version(&self) -> Option<String> {
        self.inner.lock().unwrap().orchestration_version.clone()
    }

    // ---- task scheduling ----

    /// Schedule an activity invocation; await its completion or failure.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture(Kind::Activity {
            name: name.into(),
            input: input.into(),
            claimed_event_id: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Typed wrapper over `schedule_activity`.
    pub fn schedule_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + '_ {
        let name = name.into();
        let encoded = Json::encode(input);
        async move {
            let raw = self.schedule_activity(name, encoded?).into_activity().await?;
            Json::decode(&raw)
        }
    }

    /// Schedule an activity governed by a retry policy. Every attempt and
    /// every backoff delay is recorded in history, so replay reproduces the
    /// exact sequence without re-executing work.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> impl Future<Output = Result<String, String>> + '_ {
        let name = name.into();
        let input = input.into();
        async move {
            let started_at_ms = self.utcnow_ms();
            let mut attempt: u32 = 1;
            loop {
                match self
                    .schedule_activity(name.clone(), input.clone())
                    .into_activity()
                    .await
                {
                    Ok(v) => return Ok(v),
                    Err(err) => {
                        let elapsed_ms = self.utcnow_ms().saturating_sub(started_at_ms);
                        match policy.next_delay_ms(&err, attempt, elapsed_ms) {
                            Some(delay_ms) => {
                                self.schedule_timer(delay_ms).into_timer().await;
                                attempt += 1;
                            }
                            None => return Err(err),
                        }
                    }
                }
            }
        }
    }

    /// Create a durable timer firing `delay_ms` from now.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture(Kind::Timer {
            delay_ms,
            claimed_event_id: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Subscribe to the next external event with the given name. Raises are
    /// buffered FIFO per name; events raised before subscription are retained.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture(Kind::External {
            name: name.into(),
            claimed_event_id: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Typed wrapper over `schedule_wait`.
    pub fn schedule_wait_typed<Out: serde::de::DeserializeOwned>(
        &self,
        name: impl Into<String>,
    ) -> impl Future<Output = Result<Out, String>> + '_ {
        let name = name.into();
        async move {
            let raw = self.schedule_wait(name).into_event().await;
            Json::decode(&raw)
        }
    }

    /// Schedule a child orchestration and await its result. The child's
    /// instance id derives from the parent and the correlation id unless
    /// overridden.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        self.sub_orchestration_inner(name.into(), None, None, input.into())
    }

    /// Child orchestration pinned to a specific registered version.
    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        self.sub_orchestration_inner(name.into(), Some(version.into()), None, input.into())
    }

    /// Child orchestration with an explicit child instance id.
    pub fn schedule_sub_orchestration_with_id(
        &self,
        name: impl Into<String>,
        instance: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        self.sub_orchestration_inner(name.into(), None, Some(instance.into()), input.into())
    }

    fn sub_orchestration_inner(
        &self,
        name: String,
        version: Option<String>,
        explicit_instance: Option<String>,
        input: String,
    ) -> DurableFuture {
        DurableFuture(Kind::SubOrch {
            name,
            version,
            explicit_instance,
            instance: std::cell::RefCell::new(String::new()),
            input,
            claimed_event_id: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Start a detached orchestration (fire and forget). Returns the child
    /// instance id.
    pub fn schedule_orchestration(
        &self,
        name: impl Into<String>,
        instance: impl Into<String>,
        input: impl Into<String>,
    ) -> String {
        let name = name.into();
        let instance = instance.into();
        let input = input.into();
        let mut inner = self.inner.lock().unwrap();
        if !inner.scheduling_allowed() {
            return instance;
        }
        // Replay: adopt the recorded chained start for this instance.
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::OrchestrationChained {
                event_id,
                instance: inst,
                ..
            } if inst == &instance && !inner.claimed_scheduling_events.contains(event_id) => {
                Some(*event_id)
            }
            _ => None,
        });
        let event_id = match adopted {
            Some(id) => id,
            None => {
                let exec_id = inner.execution_id;
                let id = inner.append_new_event(Event::OrchestrationChained {
                    event_id: 0,
                    name: name.clone(),
                    version: None,
                    instance: instance.clone(),
                    input: input.clone(),
                    execution_id: exec_id,
                });
                inner.record_action(Action::StartOrchestrationDetached {
                    scheduling_event_id: id,
                    name,
                    version: None,
                    instance: instance.clone(),
                    input,
                });
                id
            }
        };
        inner.claimed_scheduling_events.insert(event_id);
        instance
    }

    // ---- entities ----

    /// Fire-and-forget signal to an entity. Best-effort: delivery failures
    /// are logged by the entity engine, never surfaced here.
    pub fn signal_entity(
        &self,
        entity: EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) {
        let operation = operation.into();
        let input = input.into();
        let mut inner = self.inner.lock().unwrap();
        if !inner.scheduling_allowed() {
            return;
        }
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::EntitySignaled {
                event_id,
                entity: ent,
                operation: op,
                ..
            } if ent == &entity
                && op == &operation
                && !inner.claimed_scheduling_events.contains(event_id) =>
            {
                Some(*event_id)
            }
            _ => None,
        });
        let event_id = match adopted {
            Some(id) => id,
            None => {
                let exec_id = inner.execution_id;
                let id = inner.append_new_event(Event::EntitySignaled {
                    event_id: 0,
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                    execution_id: exec_id,
                });
                inner.record_action(Action::SignalEntity {
                    scheduling_event_id: id,
                    entity,
                    operation,
                    input,
                });
                id
            }
        };
        inner.claimed_scheduling_events.insert(event_id);
    }

    /// Invoke an entity operation and await its result. The operation runs
    /// serialized against the entity's state.
    pub fn call_entity(
        &self,
        entity: EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture(Kind::EntityCall {
            entity,
            operation: operation.into(),
            input: input.into(),
            claimed_event_id: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Acquire exclusive locks on a set of entities. Acquisition happens in
    /// the total `EntityId` order regardless of argument order; the guard
    /// releases explicitly, and the runtime releases any still-held locks
    /// when the instance reaches a terminal state.
    pub fn lock_entities(
        &self,
        entities: Vec<EntityId>,
    ) -> impl Future<Output = Result<EntityLockGuard, String>> + '_ {
        self.lock_entities_inner(entities, None)
    }

    /// Like `lock_entities`, but the acquisition fails if not granted within
    /// `timeout_ms`. Partially acquired members are rolled back.
    pub fn lock_entities_with_timeout(
        &self,
        entities: Vec<EntityId>,
        timeout_ms: u64,
    ) -> impl Future<Output = Result<EntityLockGuard, String>> + '_ {
        self.lock_entities_inner(entities, Some(timeout_ms))
    }

    fn lock_entities_inner(
        &self,
        mut entities: Vec<EntityId>,
        timeout_ms: Option<u64>,
    ) -> impl Future<Output = Result<EntityLockGuard, String>> + '_ {
        entities.sort();
        entities.dedup();
        async move {
            let fut = DurableFuture(Kind::EntityLock {
                entities: entities.clone(),
                timeout_ms,
                claimed_event_id: Cell::new(None),
                ctx: self.clone(),
            });
            match fut.await {
                DurableOutput::EntityLock(Ok(lock_event_id)) => Ok(EntityLockGuard {
                    ctx: self.clone(),
                    lock_event_id,
                    entities,
                    released: Cell::new(false),
                }),
                DurableOutput::EntityLock(Err(e)) => Err(e),
                other => unreachable!("lock future yielded {other:?}"),
            }
        }
    }

    pub(crate) fn release_entity_lock_internal(&self, lock_event_id: u64, entities: &[EntityId]) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.scheduling_allowed() {
            return;
        }
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::EntityLockReleased {
                event_id,
                source_event_id,
            } if *source_event_id == lock_event_id
                && !inner.claimed_scheduling_events.contains(event_id) =>
            {
                Some(*event_id)
            }
            _ => None,
        });
        let event_id = match adopted {
            Some(id) => id,
            None => {
                let id = inner.append_new_event(Event::EntityLockReleased {
                    event_id: 0,
                    source_event_id: lock_event_id,
                });
                inner.record_action(Action::ReleaseEntityLock {
                    scheduling_event_id: id,
                    lock_event_id,
                    entities: entities.to_vec(),
                });
                id
            }
        };
        inner.claimed_scheduling_events.insert(event_id);
    }

    // ---- epochs ----

    /// End this execution and start a fresh epoch with `input` as the new
    /// seed. Must be the final scheduling call of the turn.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.continue_as_new_with(input, ContinueAsNewOptions::default());
    }

    /// ContinueAsNew pinned to a specific registered version.
    pub fn continue_as_new_versioned(&self, input: impl Into<String>, version: impl Into<String>) {
        self.continue_as_new_with(
            input,
            ContinueAsNewOptions {
                version: Some(version.into()),
                preserve_unprocessed_events: false,
            },
        );
    }

    pub fn continue_as_new_with(&self, input: impl Into<String>, options: ContinueAsNewOptions) {
        let mut inner = self.inner.lock().unwrap();
        if inner.continued_as_new {
            inner.nondeterminism_error = Some("continue_as_new invoked twice in one turn".into());
            return;
        }
        inner.continued_as_new = true;
        inner.record_action(Action::ContinueAsNew {
            input: input.into(),
            version: options.version,
            preserve_unprocessed_events: options.preserve_unprocessed_events,
        });
    }

    // ---- deterministic system calls ----

    fn system_call(&self, op: &str, compute: impl FnOnce(&CtxInner) -> String) -> String {
        let mut inner = self.inner.lock().unwrap();
        if !inner.scheduling_allowed() {
            return String::new();
        }
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::SystemCall {
                event_id,
                op: hist_op,
                value,
                ..
            } if hist_op == op && !inner.claimed_scheduling_events.contains(event_id) => {
                Some((*event_id, value.clone()))
            }
            _ => None,
        });
        if let Some((event_id, value)) = adopted {
            inner.claimed_scheduling_events.insert(event_id);
            return value;
        }
        let value = compute(&inner);
        let exec_id = inner.execution_id;
        let id = inner.append_new_event(Event::SystemCall {
            event_id: 0,
            op: op.to_string(),
            value: value.clone(),
            execution_id: exec_id,
        });
        inner.record_action(Action::SystemCall {
            scheduling_event_id: id,
            op: op.to_string(),
            value: value.clone(),
        });
        inner.claimed_scheduling_events.insert(id);
        value
    }

    /// Replay-stable unique identifier.
    pub fn new_guid(&self) -> String {
        self.system_call(SYSCALL_OP_GUID, |_| generate_guid())
    }

    /// Replay-stable wall-clock timestamp (milliseconds since epoch).
    pub fn utcnow_ms(&self) -> u64 {
        self.system_call(SYSCALL_OP_UTCNOW_MS, |_| wall_clock_now_ms().to_string())
            .parse()
            .unwrap_or(0)
    }

    /// Set the instance's custom status, visible through client queries.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.system_call(SYSCALL_OP_CUSTOM_STATUS, move |_| status);
    }

    /// Read back the most recently set custom status.
    pub fn get_custom_status(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().rev().find_map(|e| match e {
            Event::SystemCall { op, value, .. } if op == SYSCALL_OP_CUSTOM_STATUS => {
                Some(value.clone())
            }
            _ => None,
        })
    }

    fn trace(&self, level: &str, message: impl Into<String>) {
        let message = message.into();
        let op = format!("{SYSCALL_OP_TRACE_PREFIX}{level}");
        self.system_call(&op, move |inner| {
            // Only reached on first execution; replays adopt the recorded call.
            match level {
                "ERROR" => {
                    tracing::error!(target: "duratask::orchestration", instance = %inner.instance, execution_id = inner.execution_id, "{message}")
                }
                "WARN" => {
                    tracing::warn!(target: "duratask::orchestration", instance = %inner.instance, execution_id = inner.execution_id, "{message}")
                }
                "DEBUG" => {
                    tracing::debug!(target: "duratask::orchestration", instance = %inner.instance, execution_id = inner.execution_id, "{message}")
                }
                _ => {
                    tracing::info!(target: "duratask::orchestration", instance = %inner.instance, execution_id = inner.execution_id, "{message}")
                }
            }
            message.clone()
        });
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message);
    }
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message);
    }

    // ---- combinators ----

    /// Race two durable futures; the loser is cancelled (its late completion
    /// is recorded in history and ignored).
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(self.clone(), vec![a, b]))
    }

    /// Race any number of durable futures.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(self.clone(), futures))
    }

    /// Wait for all durable futures; outputs are returned in the completion
    /// order recorded in history.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(AggregateDurableFuture::new_join(self.clone(), futures))
    }

    /// Wait for all durable futures, failing fast on the first failure;
    /// remaining siblings are cancelled as in `select`.
    pub fn try_join(&self, futures: Vec<DurableFuture>) -> TryJoinFuture {
        TryJoinFuture(AggregateDurableFuture::new_try_join(self.clone(), futures))
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    pub(crate) fn nondeterminism_error(&self) -> Option<String> {
        self.inner.lock().unwrap().nondeterminism_error.clone()
    }

    pub(crate) fn history_snapshot(&self) -> Vec<Event> {
        self.inner.lock().unwrap().history.clone()
    }
}

/// Exclusive hold over a set of entities, obtained from
/// `OrchestrationContext::lock_entities`. Release is explicit; the runtime
/// releases anything still held when the owning instance terminates.
pub struct EntityLockGuard {
    ctx: OrchestrationContext,
    lock_event_id: u64,
    entities: Vec<EntityId>,
    released: Cell<bool>,
}

impl EntityLockGuard {
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Release all locked entities. Idempotent.
    pub fn release(&self) {
        if !self.released.replace(true) {
            self.ctx
                .release_entity_lock_internal(self.lock_event_id, &self.entities);
        }
    }
}

/// Context handed to activity handlers. Activities are non-deterministic and
/// may do real I/O; tracing here goes straight to the subscriber.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub execution_id: u64,
    pub activity_id: u64,
    pub name: String,
}

impl ActivityContext {
    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(target: "duratask::activity", instance = %self.instance, activity = %self.name, id = self.activity_id, "{}", message.as_ref());
    }
    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(target: "duratask::activity", instance = %self.instance, activity = %self.name, id = self.activity_id, "{}", message.as_ref());
    }
    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(target: "duratask::activity", instance = %self.instance, activity = %self.name, id = self.activity_id, "{}", message.as_ref());
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    // Safety: fut is not moved for the remainder of this call.
    let pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.poll(&mut cx)
}

/// Result of driving one orchestration turn.
#[derive(Debug)]
pub struct TurnExecution {
    /// Working history after the turn (baseline + events appended this turn).
    pub history: Vec<Event>,
    /// Actions recorded for events appended this turn.
    pub actions: Vec<Action>,
    /// Present when the orchestrator function returned.
    pub output: Option<Result<String, String>>,
    /// Set when the turn detected a history/code divergence.
    pub nondeterminism: Option<String>,
}

/// Execute one turn: replay the given history through the orchestrator
/// function until it completes or suspends at the first unresolved call.
///
/// Durable futures bind synchronously during the poll, so a single poll
/// drives the function as far as the recorded history allows.
pub fn run_turn<F, Fut>(
    instance: &str,
    execution_id: u64,
    turn_index: u64,
    history: Vec<Event>,
    orchestrator: F,
) -> TurnExecution
where
    F: Fn(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance.to_string(), execution_id, turn_index, history);
    let mut fut = orchestrator(ctx.clone());
    let polled = poll_once(&mut fut);
    let nondeterminism = ctx.nondeterminism_error();
    let actions = ctx.take_actions();
    let history = ctx.history_snapshot();
    match polled {
        Poll::Ready(output) => TurnExecution {
            history,
            actions,
            output: Some(output),
            nondeterminism,
        },
        Poll::Pending => TurnExecution {
            history,
            actions,
            output: None,
            nondeterminism,
        },
    }
}
