//! One orchestration turn: convert queued completion messages into history
//! events, replay the orchestrator function over the working history, and
//! harvest the resulting delta and actions.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{Action, EntityId, ErrorDetails, Event};

/// Result of executing an orchestration turn.
#[derive(Debug)]
pub enum TurnResult {
    /// Turn suspended at an unresolved scheduling call; actions pending.
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew {
        input: String,
        version: Option<String>,
        preserve_unprocessed_events: bool,
    },
}

pub struct OrchestrationTurn {
    instance: String,
    turn_index: u64,
    execution_id: u64,
    baseline_history: Vec<Event>,
    history_delta: Vec<Event>,
    pending_actions: Vec<Action>,
    next_event_id: u64,
    nondet_error: Option<String>,
    /// Entity work produced while prepping completions (late-grant and
    /// timeout rollbacks).
    extra_entity_items: Vec<WorkItem>,
}

impl OrchestrationTurn {
    pub fn new(
        instance: String,
        turn_index: u64,
        execution_id: u64,
        baseline_history: Vec<Event>,
    ) -> Self {
        let next_event_id = baseline_history
            .iter()
            .map(Event::event_id)
            .max()
            .unwrap_or(0)
            + 1;
        Self {
            instance,
            turn_index,
            execution_id,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            next_event_id,
            nondet_error: None,
            extra_entity_items: Vec::new(),
        }
    }

    /// Append a runtime-produced event (seed, suspension marker, terminal)
    /// to this turn's delta.
    pub fn seed(&mut self, mut event: Event) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        event.set_event_id(id);
        self.history_delta.push(event);
        id
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    /// The kind of scheduling event recorded under `id`, if any.
    fn schedule_kind(&self, id: u64) -> Option<&'static str> {
        self.all_events().find_map(|e| match e {
            Event::ActivityScheduled { event_id, .. } if *event_id == id => Some("activity"),
            Event::TimerCreated { event_id, .. } if *event_id == id => Some("timer"),
            Event::SubOrchestrationScheduled { event_id, .. } if *event_id == id => {
                Some("suborchestration")
            }
            Event::EntityCallScheduled { event_id, .. } if *event_id == id => Some("entitycall"),
            Event::EntityLockRequested { event_id, .. } if *event_id == id => Some("entitylock"),
            _ => None,
        })
    }

    fn completion_recorded(&self, id: u64) -> bool {
        self.all_events().any(|e| match e {
            Event::ActivityCompleted { source_event_id, .. }
            | Event::ActivityFailed { source_event_id, .. }
            | Event::TimerFired { source_event_id, .. }
            | Event::SubOrchestrationCompleted { source_event_id, .. }
            | Event::SubOrchestrationFailed { source_event_id, .. }
            | Event::EntityCallCompleted { source_event_id, .. }
            | Event::EntityCallFailed { source_event_id, .. }
            | Event::EntityLockGranted { source_event_id, .. }
            | Event::EntityLockFailed { source_event_id, .. } => *source_event_id == id,
            _ => false,
        })
    }

    /// The entity set recorded in the lock request with correlation `id`.
    fn lock_request_entities(&self, id: u64) -> Option<Vec<EntityId>> {
        self.all_events().find_map(|e| match e {
            Event::EntityLockRequested {
                event_id, entities, ..
            } if *event_id == id => Some(entities.clone()),
            _ => None,
        })
    }

    fn push_lock_rollback(&mut self, entities: &[EntityId]) {
        for entity in entities {
            self.extra_entity_items.push(WorkItem::EntityOp {
                entity: entity.clone(),
                op: crate::providers::EntityOperation::LockRelease {
                    instance: self.instance.clone(),
                },
            });
        }
    }

    /// Stage 1: convert completion messages into history events, dropping
    /// stale-epoch and duplicate deliveries and flagging completions that
    /// have no matching schedule (nondeterminism).
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        debug!(
            instance = %self.instance,
            turn_index = self.turn_index,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            // Epoch check: stale completions no longer resolve.
            let stale = match msg {
                WorkItem::ActivityCompleted { execution_id, .. }
                | WorkItem::ActivityFailed { execution_id, .. }
                | WorkItem::TimerFired { execution_id, .. }
                | WorkItem::SubOrchCompleted { execution_id, .. }
                | WorkItem::SubOrchFailed { execution_id, .. }
                | WorkItem::EntityCallCompleted { execution_id, .. }
                | WorkItem::EntityCallFailed { execution_id, .. }
                | WorkItem::EntityLockGranted { execution_id, .. }
                | WorkItem::EntityLockFailed { execution_id, .. }
                | WorkItem::EntityLockTimeout { execution_id, .. } => {
                    *execution_id != self.execution_id
                }
                _ => false,
            };
            if stale {
                warn!(instance = %self.instance, "dropping completion from a previous execution");
                // A lock granted to a dead epoch must not stay held.
                if let WorkItem::EntityLockGranted { id, .. } = msg {
                    if let Some(entities) = self.lock_request_entities(*id) {
                        self.push_lock_rollback(&entities);
                    }
                }
                continue;
            }

            // Duplicate check (at-least-once delivery).
            let source_id = match msg {
                WorkItem::ActivityCompleted { id, .. }
                | WorkItem::ActivityFailed { id, .. }
                | WorkItem::TimerFired { id, .. }
                | WorkItem::SubOrchCompleted { id, .. }
                | WorkItem::SubOrchFailed { id, .. }
                | WorkItem::EntityCallCompleted { id, .. }
                | WorkItem::EntityCallFailed { id, .. }
                | WorkItem::EntityLockGranted { id, .. }
                | WorkItem::EntityLockFailed { id, .. } => Some(*id),
                _ => None,
            };
            if let Some(id) = source_id {
                if self.completion_recorded(id) {
                    // Late grant after a recorded timeout failure: give the
                    // chain back instead of leaking held entities.
                    if matches!(msg, WorkItem::EntityLockGranted { .. })
                        && self.all_events().any(|e| {
                            matches!(e, Event::EntityLockFailed { source_event_id, .. } if *source_event_id == id)
                        })
                    {
                        if let Some(entities) = self.lock_request_entities(id) {
                            warn!(instance = %self.instance, id, "lock granted after timeout; releasing");
                            self.push_lock_rollback(&entities);
                        }
                    } else {
                        warn!(instance = %self.instance, id, "ignoring duplicate completion");
                    }
                    continue;
                }
            }

            // Kind check: a completion with no matching schedule (or the
            // wrong schedule kind) means replay has diverged.
            let expected_kind = match msg {
                WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. } => {
                    Some("activity")
                }
                WorkItem::TimerFired { .. } => Some("timer"),
                WorkItem::SubOrchCompleted { .. } | WorkItem::SubOrchFailed { .. } => {
                    Some("suborchestration")
                }
                WorkItem::EntityCallCompleted { .. } | WorkItem::EntityCallFailed { .. } => {
                    Some("entitycall")
                }
                WorkItem::EntityLockGranted { .. }
                | WorkItem::EntityLockFailed { .. }
                | WorkItem::EntityLockTimeout { .. } => Some("entitylock"),
                _ => None,
            };
            if let (Some(expected), Some(id)) = (
                expected_kind,
                source_id.or(match msg {
                    WorkItem::EntityLockTimeout { id, .. } => Some(*id),
                    _ => None,
                }),
            ) {
                match self.schedule_kind(id) {
                    Some(kind) if kind == expected => {}
                    Some(kind) => {
                        let err = format!(
                            "completion kind mismatch for id={id}: schedule is '{kind}', completion is '{expected}'"
                        );
                        warn!(instance = %self.instance, error = %err, "nondeterminism in completion batch");
                        self.nondet_error = Some(err);
                        continue;
                    }
                    None => {
                        let err = format!("no matching schedule for completion id={id}");
                        warn!(instance = %self.instance, error = %err, "nondeterminism in completion batch");
                        self.nondet_error = Some(err);
                        continue;
                    }
                }
            }

            let event = match msg.clone() {
                WorkItem::ActivityCompleted { id, result, .. } => Some(Event::ActivityCompleted {
                    event_id: 0,
                    source_event_id: id,
                    result,
                }),
                WorkItem::ActivityFailed { id, details, .. } => Some(Event::ActivityFailed {
                    event_id: 0,
                    source_event_id: id,
                    details,
                }),
                WorkItem::TimerFired { id, fire_at_ms, .. } => Some(Event::TimerFired {
                    event_id: 0,
                    source_event_id: id,
                    fire_at_ms,
                }),
                // Raises are buffered even with no subscription yet; a later
                // schedule_wait consumes them FIFO.
                WorkItem::ExternalRaised { name, data, .. } => Some(Event::ExternalEvent {
                    event_id: 0,
                    name,
                    data,
                }),
                WorkItem::SubOrchCompleted { id, result, .. } => {
                    Some(Event::SubOrchestrationCompleted {
                        event_id: 0,
                        source_event_id: id,
                        result,
                    })
                }
                WorkItem::SubOrchFailed { id, details, .. } => {
                    Some(Event::SubOrchestrationFailed {
                        event_id: 0,
                        source_event_id: id,
                        details,
                    })
                }
                WorkItem::EntityCallCompleted { id, result, .. } => {
                    Some(Event::EntityCallCompleted {
                        event_id: 0,
                        source_event_id: id,
                        result,
                    })
                }
                WorkItem::EntityCallFailed { id, details, .. } => Some(Event::EntityCallFailed {
                    event_id: 0,
                    source_event_id: id,
                    details,
                }),
                WorkItem::EntityLockGranted { id, .. } => Some(Event::EntityLockGranted {
                    event_id: 0,
                    source_event_id: id,
                }),
                WorkItem::EntityLockFailed { id, reason, .. } => Some(Event::EntityLockFailed {
                    event_id: 0,
                    source_event_id: id,
                    details: ErrorDetails::application_typed("entitylock", reason),
                }),
                WorkItem::EntityLockTimeout { id, entities, .. } => {
                    // The request may have been granted in this same batch.
                    if self.completion_recorded(id) {
                        None
                    } else {
                        warn!(instance = %self.instance, id, "entity lock acquisition timed out; rolling back");
                        self.push_lock_rollback(&entities);
                        Some(Event::EntityLockFailed {
                            event_id: 0,
                            source_event_id: id,
                            details: ErrorDetails::application_typed(
                                "entitylock",
                                "lock acquisition timed out",
                            ),
                        })
                    }
                }
                // Start/control items are handled by the runtime, never here.
                WorkItem::StartOrchestration { .. }
                | WorkItem::ContinueAsNew { .. }
                | WorkItem::TerminateInstance { .. }
                | WorkItem::SuspendInstance { .. }
                | WorkItem::ResumeInstance { .. }
                | WorkItem::ActivityExecute { .. }
                | WorkItem::TimerSchedule { .. }
                | WorkItem::EntityOp { .. } => None,
            };

            if let Some(event) = event {
                self.seed(event);
            }
        }

        debug!(
            instance = %self.instance,
            event_count = self.history_delta.len(),
            "completion events created"
        );
    }

    /// Stage 2: replay the orchestrator function over baseline + delta.
    pub fn execute_orchestration(
        &mut self,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnResult {
        debug!(
            instance = %self.instance,
            turn_index = self.turn_index,
            "executing orchestration turn"
        );
        if let Some(err) = self.nondet_error.clone() {
            return TurnResult::Failed(ErrorDetails::nondeterminism(err));
        }

        let mut working_history = self.baseline_history.clone();
        working_history.extend(self.history_delta.clone());
        let working_len = working_history.len();

        let instance = self.instance.clone();
        let execution_id = self.execution_id;
        let turn_index = self.turn_index;
        let run = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn(&instance, execution_id, turn_index, working_history, move |ctx| {
                let handler = handler.clone();
                let input = input.clone();
                async move { handler.invoke(ctx, input).await }
            })
        }));

        let execution = match run {
            Ok(execution) => execution,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return TurnResult::Failed(ErrorDetails::application_typed("panic", msg));
            }
        };

        if let Some(err) = execution.nondeterminism {
            return TurnResult::Failed(ErrorDetails::nondeterminism(err));
        }

        if execution.history.len() > working_len {
            self.history_delta
                .extend(execution.history[working_len..].to_vec());
        }
        self.pending_actions = execution.actions;

        // ContinueAsNew wins over a returned output.
        for action in &self.pending_actions {
            if let Action::ContinueAsNew {
                input,
                version,
                preserve_unprocessed_events,
            } = action
            {
                return TurnResult::ContinueAsNew {
                    input: input.clone(),
                    version: version.clone(),
                    preserve_unprocessed_events: *preserve_unprocessed_events,
                };
            }
        }

        match execution.output {
            Some(Ok(output)) => TurnResult::Completed(output),
            Some(Err(error)) => TurnResult::Failed(ErrorDetails::application(error)),
            None => TurnResult::Continue,
        }
    }

    /// External events raised but not yet consumed, FIFO per name. Used to
    /// carry unprocessed events across a ContinueAsNew boundary.
    pub fn unconsumed_external_events(&self) -> Vec<(String, String)> {
        let mut raised: Vec<(&str, &str)> = Vec::new();
        let mut subscriptions: std::collections::HashMap<&str, usize> =
            std::collections::HashMap::new();
        for event in self.all_events() {
            match event {
                Event::ExternalEvent { name, data, .. } => raised.push((name, data)),
                Event::ExternalSubscribed { name, .. } => {
                    *subscriptions.entry(name.as_str()).or_default() += 1;
                }
                _ => {}
            }
        }
        let mut carried = Vec::new();
        let mut seen: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        for (name, data) in raised {
            let position = seen.entry(name).or_default();
            let consumed = subscriptions.get(name).copied().unwrap_or(0);
            if *position >= consumed {
                carried.push((name.to_string(), data.to_string()));
            }
            *position += 1;
        }
        carried
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn take_extra_entity_items(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.extra_entity_items)
    }

    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }

    pub fn final_history(&self) -> Vec<Event> {
        let mut history = self.baseline_history.clone();
        history.extend(self.history_delta.clone());
        history
    }

    pub fn next_event_id(&self) -> u64 {
        self.next_event_id
    }
}
