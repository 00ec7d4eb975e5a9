//! Durable futures: the replay cursor model.
//!
//! Every scheduling call made by orchestration code produces a
//! [`DurableFuture`]. On poll, the future either binds ("claims") the next
//! unclaimed scheduling event recorded in history, or appends a new scheduling
//! event and records an [`Action`] for the runtime to dispatch. Completions
//! are consumed strictly in the order they were recorded, keyed by
//! `source_event_id`, which is what makes replay deterministic and lets the
//! engine detect history/code divergence.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{
    Action, CtxInner, EntityId, Event, OrchestrationContext, wall_clock_now_ms,
};

/// Scheduling-event kinds whose replay order is enforced strictly.
/// (System calls, signals and lock releases adopt by payload instead.)
fn strict_schedule_descriptor(event: &Event) -> Option<String> {
    match event {
        Event::ActivityScheduled { name, input, .. } => {
            Some(format!("ActivityScheduled('{name}','{input}')"))
        }
        Event::TimerCreated { .. } => Some("TimerCreated".to_string()),
        Event::ExternalSubscribed { name, .. } => Some(format!("ExternalSubscribed('{name}')")),
        Event::SubOrchestrationScheduled { name, input, .. } => {
            Some(format!("SubOrchestrationScheduled('{name}','{input}')"))
        }
        Event::EntityCallScheduled {
            entity, operation, ..
        } => Some(format!("EntityCallScheduled('{entity}','{operation}')")),
        Event::EntityLockRequested { entities, .. } => {
            Some(format!("EntityLockRequested({} entities)", entities.len()))
        }
        _ => None,
    }
}

/// The next strictly ordered scheduling event not yet claimed by a future,
/// if any. Claims must bind to this exact event or replay has diverged.
fn next_unclaimed_strict(inner: &CtxInner) -> Option<Event> {
    inner
        .history
        .iter()
        .find(|e| {
            strict_schedule_descriptor(e).is_some()
                && !inner.claimed_scheduling_events.contains(&e.event_id())
        })
        .cloned()
}

/// True if an external-event subscription for `name` is still outstanding
/// (subscribed, not cancelled, with fewer consumed raises than subscriptions).
fn has_active_subscription(inner: &CtxInner, name: &str) -> bool {
    let subs = inner
        .history
        .iter()
        .filter(|e| {
            matches!(e, Event::ExternalSubscribed { event_id, name: n }
                if n == name && !inner.cancelled_source_ids.contains(event_id))
        })
        .count();
    let consumed = inner
        .history
        .iter()
        .filter(|e| {
            matches!(e, Event::ExternalEvent { event_id, name: n, .. }
                if n == name && inner.consumed_completions.contains(event_id))
        })
        .count();
    subs > consumed
}

/// FIFO gate: a completion may only be consumed once every completion that
/// was recorded before it has been consumed, with two exemptions: completions
/// whose scheduling call was cancelled (select losers), and external raises
/// with no outstanding subscription (parked buffer).
fn can_consume_completion(inner: &CtxInner, completion_event_id: u64) -> bool {
    inner.history.iter().all(|e| match e {
        Event::ActivityCompleted {
            event_id,
            source_event_id,
            ..
        }
        | Event::ActivityFailed {
            event_id,
            source_event_id,
            ..
        }
        | Event::TimerFired {
            event_id,
            source_event_id,
            ..
        }
        | Event::SubOrchestrationCompleted {
            event_id,
            source_event_id,
            ..
        }
        | Event::SubOrchestrationFailed {
            event_id,
            source_event_id,
            ..
        }
        | Event::EntityCallCompleted {
            event_id,
            source_event_id,
            ..
        }
        | Event::EntityCallFailed {
            event_id,
            source_event_id,
            ..
        }
        | Event::EntityLockGranted {
            event_id,
            source_event_id,
        }
        | Event::EntityLockFailed {
            event_id,
            source_event_id,
            ..
        } => {
            if inner.cancelled_source_ids.contains(source_event_id) {
                return true;
            }
            *event_id >= completion_event_id || inner.consumed_completions.contains(event_id)
        }
        Event::ExternalEvent { event_id, name, .. } => {
            if !has_active_subscription(inner, name) {
                return true;
            }
            *event_id >= completion_event_id || inner.consumed_completions.contains(event_id)
        }
        _ => true,
    })
}

#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
    EntityCall(Result<String, String>),
    /// `Ok` carries the lock's correlation id (used by the guard to release).
    EntityLock(Result<u64, String>),
}

pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    Timer {
        delay_ms: u64,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    External {
        name: String,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    SubOrch {
        name: String,
        version: Option<String>,
        explicit_instance: Option<String>,
        instance: RefCell<String>,
        input: String,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    EntityCall {
        entity: EntityId,
        operation: String,
        input: String,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    EntityLock {
        entities: Vec<EntityId>,
        timeout_ms: Option<u64>,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
}

impl Kind {
    fn claimed_event_id(&self) -> Option<u64> {
        match self {
            Kind::Activity {
                claimed_event_id, ..
            }
            | Kind::Timer {
                claimed_event_id, ..
            }
            | Kind::External {
                claimed_event_id, ..
            }
            | Kind::SubOrch {
                claimed_event_id, ..
            }
            | Kind::EntityCall {
                claimed_event_id, ..
            }
            | Kind::EntityLock {
                claimed_event_id, ..
            } => claimed_event_id.get(),
        }
    }

    fn ctx(&self) -> &OrchestrationContext {
        match self {
            Kind::Activity { ctx, .. }
            | Kind::Timer { ctx, .. }
            | Kind::External { ctx, .. }
            | Kind::SubOrch { ctx, .. }
            | Kind::EntityCall { ctx, .. }
            | Kind::EntityLock { ctx, .. } => ctx,
        }
    }
}

/// Claim the next strict scheduling event if it matches `expected`;
/// otherwise record a nondeterminism error. `None` means no recorded event is
/// left to claim (first execution: append a new one).
fn claim_strict(
    inner: &mut CtxInner,
    expected: &str,
    matches_event: impl Fn(&Event) -> bool,
) -> Result<Option<u64>, ()> {
    match next_unclaimed_strict(inner) {
        Some(event) if matches_event(&event) => {
            let id = event.event_id();
            inner.claimed_scheduling_events.insert(id);
            Ok(Some(id))
        }
        Some(other) => {
            let found = strict_schedule_descriptor(&other).unwrap_or_else(|| format!("{other:?}"));
            inner.nondeterminism_error = Some(format!(
                "schedule order mismatch: next is {found} but expected {expected}"
            ));
            Err(())
        }
        None => Ok(None),
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: all interior state is Cell/RefCell; nothing is moved out.
        let this = unsafe { self.get_unchecked_mut() };

        match &mut this.0 {
            Kind::Activity {
                name,
                input,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed_event_id.get().is_none() {
                    if !inner.scheduling_allowed() {
                        return Poll::Pending;
                    }
                    let expected = format!("ActivityScheduled('{name}','{input}')");
                    let claimed = match claim_strict(&mut inner, &expected, |e| {
                        matches!(e, Event::ActivityScheduled { name: n, input: inp, .. }
                            if n == name && inp == input)
                    }) {
                        Ok(c) => c,
                        Err(()) => return Poll::Pending,
                    };
                    let event_id = claimed.unwrap_or_else(|| {
                        let exec_id = inner.execution_id;
                        let id = inner.append_new_event(Event::ActivityScheduled {
                            event_id: 0,
                            name: name.clone(),
                            input: input.clone(),
                            execution_id: exec_id,
                        });
                        inner.record_action(Action::CallActivity {
                            scheduling_event_id: id,
                            name: name.clone(),
                            input: input.clone(),
                        });
                        inner.claimed_scheduling_events.insert(id);
                        id
                    });
                    claimed_event_id.set(Some(event_id));
                }

                let our_id = claimed_event_id.get().unwrap();
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::ActivityCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == our_id => Some((*event_id, Ok(result.clone()))),
                    Event::ActivityFailed {
                        event_id,
                        source_event_id,
                        details,
                    } if *source_event_id == our_id => {
                        debug_assert!(
                            details.is_application(),
                            "only application errors reach orchestration code: {details:?}"
                        );
                        Some((*event_id, Err(details.display_message())))
                    }
                    _ => None,
                });
                if let Some((completion_event_id, result)) = completion {
                    if can_consume_completion(&inner, completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::Activity(result));
                    }
                }
                Poll::Pending
            }
            Kind::Timer {
                delay_ms,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed_event_id.get().is_none() {
                    if !inner.scheduling_allowed() {
                        return Poll::Pending;
                    }
                    let claimed = match claim_strict(&mut inner, "TimerCreated", |e| {
                        matches!(e, Event::TimerCreated { .. })
                    }) {
                        Ok(c) => c,
                        Err(()) => return Poll::Pending,
                    };
                    let event_id = claimed.unwrap_or_else(|| {
                        let fire_at_ms = wall_clock_now_ms().saturating_add(*delay_ms);
                        let exec_id = inner.execution_id;
                        let id = inner.append_new_event(Event::TimerCreated {
                            event_id: 0,
                            fire_at_ms,
                            execution_id: exec_id,
                        });
                        inner.record_action(Action::CreateTimer {
                            scheduling_event_id: id,
                            fire_at_ms,
                        });
                        inner.claimed_scheduling_events.insert(id);
                        id
                    });
                    claimed_event_id.set(Some(event_id));
                }

                let our_id = claimed_event_id.get().unwrap();
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::TimerFired {
                        event_id,
                        source_event_id,
                        ..
                    } if *source_event_id == our_id => Some(*event_id),
                    _ => None,
                });
                if let Some(completion_event_id) = completion {
                    if can_consume_completion(&inner, completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::Timer);
                    }
                }
                Poll::Pending
            }
            Kind::External {
                name,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed_event_id.get().is_none() {
                    if !inner.scheduling_allowed() {
                        return Poll::Pending;
                    }
                    let expected = format!("ExternalSubscribed('{name}')");
                    let claimed = match claim_strict(&mut inner, &expected, |e| {
                        matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name)
                    }) {
                        Ok(c) => c,
                        Err(()) => return Poll::Pending,
                    };
                    let event_id = claimed.unwrap_or_else(|| {
                        let id = inner.append_new_event(Event::ExternalSubscribed {
                            event_id: 0,
                            name: name.clone(),
                        });
                        inner.record_action(Action::WaitExternal {
                            scheduling_event_id: id,
                            name: name.clone(),
                        });
                        inner.claimed_scheduling_events.insert(id);
                        id
                    });
                    claimed_event_id.set(Some(event_id));
                }

                // Earliest unconsumed raise of this name; raises queue FIFO.
                let candidate = inner.history.iter().find_map(|e| match e {
                    Event::ExternalEvent {
                        event_id,
                        name: n,
                        data,
                    } if n == name && !inner.consumed_completions.contains(event_id) => {
                        Some((*event_id, data.clone()))
                    }
                    _ => None,
                });
                if let Some((completion_event_id, data)) = candidate {
                    if can_consume_completion(&inner, completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::External(data));
                    }
                }
                Poll::Pending
            }
            Kind::SubOrch {
                name,
                version,
                explicit_instance,
                instance,
                input,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed_event_id.get().is_none() {
                    if !inner.scheduling_allowed() {
                        return Poll::Pending;
                    }
                    let expected = format!("SubOrchestrationScheduled('{name}','{input}')");
                    let claimed = match claim_strict(&mut inner, &expected, |e| {
                        matches!(e, Event::SubOrchestrationScheduled { name: n, input: inp, .. }
                            if n == name && inp == input)
                    }) {
                        Ok(c) => c,
                        Err(()) => return Poll::Pending,
                    };
                    let event_id = match claimed {
                        Some(id) => {
                            // Adopt the recorded child instance id.
                            if let Some(Event::SubOrchestrationScheduled {
                                instance: inst, ..
                            }) = inner.history.iter().find(|e| e.event_id() == id)
                            {
                                *instance.borrow_mut() = inst.clone();
                            }
                            id
                        }
                        None => {
                            let id = inner.next_event_id;
                            let child = explicit_instance
                                .clone()
                                .unwrap_or_else(|| format!("{}::sub-{id}", inner.instance));
                            *instance.borrow_mut() = child.clone();
                            let exec_id = inner.execution_id;
                            let assigned = inner.append_new_event(Event::SubOrchestrationScheduled {
                                event_id: 0,
                                name: name.clone(),
                                instance: child.clone(),
                                input: input.clone(),
                                execution_id: exec_id,
                            });
                            inner.record_action(Action::StartSubOrchestration {
                                scheduling_event_id: assigned,
                                name: name.clone(),
                                version: version.clone(),
                                instance: child,
                                input: input.clone(),
                            });
                            inner.claimed_scheduling_events.insert(assigned);
                            assigned
                        }
                    };
                    claimed_event_id.set(Some(event_id));
                }

                let our_id = claimed_event_id.get().unwrap();
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::SubOrchestrationCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == our_id => Some((*event_id, Ok(result.clone()))),
                    Event::SubOrchestrationFailed {
                        event_id,
                        source_event_id,
                        details,
                    } if *source_event_id == our_id => {
                        Some((*event_id, Err(details.display_message())))
                    }
                    _ => None,
                });
                if let Some((completion_event_id, result)) = completion {
                    if can_consume_completion(&inner, completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::SubOrchestration(result));
                    }
                }
                Poll::Pending
            }
            Kind::EntityCall {
                entity,
                operation,
                input,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed_event_id.get().is_none() {
                    if !inner.scheduling_allowed() {
                        return Poll::Pending;
                    }
                    let expected = format!("EntityCallScheduled('{entity}','{operation}')");
                    let claimed = match claim_strict(&mut inner, &expected, |e| {
                        matches!(e, Event::EntityCallScheduled { entity: ent, operation: op, input: inp, .. }
                            if ent == entity && op == operation && inp == input)
                    }) {
                        Ok(c) => c,
                        Err(()) => return Poll::Pending,
                    };
                    let event_id = claimed.unwrap_or_else(|| {
                        let exec_id = inner.execution_id;
                        let id = inner.append_new_event(Event::EntityCallScheduled {
                            event_id: 0,
                            entity: entity.clone(),
                            operation: operation.clone(),
                            input: input.clone(),
                            execution_id: exec_id,
                        });
                        inner.record_action(Action::CallEntity {
                            scheduling_event_id: id,
                            entity: entity.clone(),
                            operation: operation.clone(),
                            input: input.clone(),
                        });
                        inner.claimed_scheduling_events.insert(id);
                        id
                    });
                    claimed_event_id.set(Some(event_id));
                }

                let our_id = claimed_event_id.get().unwrap();
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::EntityCallCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == our_id => Some((*event_id, Ok(result.clone()))),
                    Event::EntityCallFailed {
                        event_id,
                        source_event_id,
                        details,
                    } if *source_event_id == our_id => {
                        Some((*event_id, Err(details.display_message())))
                    }
                    _ => None,
                });
                if let Some((completion_event_id, result)) = completion {
                    if can_consume_completion(&inner, completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::EntityCall(result));
                    }
                }
                Poll::Pending
            }
            Kind::EntityLock {
                entities,
                timeout_ms,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed_event_id.get().is_none() {
                    if !inner.scheduling_allowed() {
                        return Poll::Pending;
                    }
                    let expected = format!("EntityLockRequested({} entities)", entities.len());
                    let claimed = match claim_strict(&mut inner, &expected, |e| {
                        matches!(e, Event::EntityLockRequested { entities: ents, .. } if ents == entities)
                    }) {
                        Ok(c) => c,
                        Err(()) => return Poll::Pending,
                    };
                    let event_id = claimed.unwrap_or_else(|| {
                        let exec_id = inner.execution_id;
                        let id = inner.append_new_event(Event::EntityLockRequested {
                            event_id: 0,
                            entities: entities.clone(),
                            execution_id: exec_id,
                        });
                        inner.record_action(Action::RequestEntityLock {
                            scheduling_event_id: id,
                            entities: entities.clone(),
                            timeout_ms: *timeout_ms,
                        });
                        inner.claimed_scheduling_events.insert(id);
                        id
                    });
                    claimed_event_id.set(Some(event_id));
                }

                let our_id = claimed_event_id.get().unwrap();
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::EntityLockGranted {
                        event_id,
                        source_event_id,
                    } if *source_event_id == our_id => Some((*event_id, Ok(our_id))),
                    Event::EntityLockFailed {
                        event_id,
                        source_event_id,
                        details,
                    } if *source_event_id == our_id => {
                        Some((*event_id, Err(details.display_message())))
                    }
                    _ => None,
                });
                if let Some((completion_event_id, result)) = completion {
                    if can_consume_completion(&inner, completion_event_id) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::EntityLock(result));
                    }
                }
                Poll::Pending
            }
        }
    }
}

// DurableFuture must remain Unpin: poll projects &mut self into Kind freely.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
};

impl DurableFuture {
    /// Await an activity result.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        MapFuture {
            inner: self,
            map: |out| match out {
                DurableOutput::Activity(r) => r,
                other => unreachable!("expected activity output, got {other:?}"),
            },
        }
    }

    /// Await a timer firing.
    pub fn into_timer(self) -> impl Future<Output = ()> {
        MapFuture {
            inner: self,
            map: |out| match out {
                DurableOutput::Timer => (),
                other => unreachable!("expected timer output, got {other:?}"),
            },
        }
    }

    /// Await an external event payload.
    pub fn into_event(self) -> impl Future<Output = String> {
        MapFuture {
            inner: self,
            map: |out| match out {
                DurableOutput::External(data) => data,
                other => unreachable!("expected external output, got {other:?}"),
            },
        }
    }

    /// Await a sub-orchestration result.
    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, String>> {
        MapFuture {
            inner: self,
            map: |out| match out {
                DurableOutput::SubOrchestration(r) => r,
                other => unreachable!("expected sub-orchestration output, got {other:?}"),
            },
        }
    }

    /// Await an entity call result.
    pub fn into_entity(self) -> impl Future<Output = Result<String, String>> {
        MapFuture {
            inner: self,
            map: |out| match out {
                DurableOutput::EntityCall(r) => r,
                other => unreachable!("expected entity output, got {other:?}"),
            },
        }
    }
}

struct MapFuture<F> {
    inner: DurableFuture,
    map: F,
}

impl<F, T> Future for MapFuture<F>
where
    F: Fn(DurableOutput) -> T + Unpin,
{
    type Output = T;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(out) => Poll::Ready((this.map)(out)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The history event id of a child's completion, used to order join outputs
/// and pick deterministic try-join failures. `u64::MAX` when not yet recorded.
fn completion_event_id(inner: &CtxInner, child: &DurableFuture) -> u64 {
    let Some(source_id) = child.0.claimed_event_id() else {
        return u64::MAX;
    };
    match &child.0 {
        Kind::Activity { .. } => inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ActivityCompleted {
                    event_id,
                    source_event_id,
                    ..
                }
                | Event::ActivityFailed {
                    event_id,
                    source_event_id,
                    ..
                } if *source_event_id == source_id => Some(*event_id),
                _ => None,
            })
            .unwrap_or(u64::MAX),
        Kind::Timer { .. } => inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::TimerFired {
                    event_id,
                    source_event_id,
                    ..
                } if *source_event_id == source_id => Some(*event_id),
                _ => None,
            })
            .unwrap_or(u64::MAX),
        Kind::External { name, .. } => inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ExternalEvent {
                    event_id, name: n, ..
                } if n == name && inner.consumed_completions.contains(event_id) => Some(*event_id),
                _ => None,
            })
            .unwrap_or(u64::MAX),
        Kind::SubOrch { .. } => inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::SubOrchestrationCompleted {
                    event_id,
                    source_event_id,
                    ..
                }
                | Event::SubOrchestrationFailed {
                    event_id,
                    source_event_id,
                    ..
                } if *source_event_id == source_id => Some(*event_id),
                _ => None,
            })
            .unwrap_or(u64::MAX),
        Kind::EntityCall { .. } => inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::EntityCallCompleted {
                    event_id,
                    source_event_id,
                    ..
                }
                | Event::EntityCallFailed {
                    event_id,
                    source_event_id,
                    ..
                } if *source_event_id == source_id => Some(*event_id),
                _ => None,
            })
            .unwrap_or(u64::MAX),
        Kind::EntityLock { .. } => inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::EntityLockGranted {
                    event_id,
                    source_event_id,
                }
                | Event::EntityLockFailed {
                    event_id,
                    source_event_id,
                    ..
                } if *source_event_id == source_id => Some(*event_id),
                _ => None,
            })
            .unwrap_or(u64::MAX),
    }
}

fn failure_message(out: &DurableOutput) -> Option<String> {
    match out {
        DurableOutput::Activity(Err(e))
        | DurableOutput::SubOrchestration(Err(e))
        | DurableOutput::EntityCall(Err(e)) => Some(e.clone()),
        DurableOutput::EntityLock(Err(e)) => Some(e.clone()),
        _ => None,
    }
}

enum AggregateMode {
    Select,
    Join,
    TryJoin,
}

pub enum AggregateOutput {
    Select {
        winner_index: usize,
        output: DurableOutput,
    },
    Join {
        outputs: Vec<DurableOutput>,
    },
    TryJoin {
        result: Result<Vec<DurableOutput>, String>,
    },
}

pub struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    mode: AggregateMode,
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Select,
        }
    }
    pub(crate) fn new_join(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::Join,
        }
    }
    pub(crate) fn new_try_join(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self {
            ctx,
            children,
            mode: AggregateMode::TryJoin,
        }
    }

    /// Mark every child except `keep` as cancelled so their completions, if
    /// they ever arrive, no longer block the FIFO gate and are ignored.
    fn cancel_losers(&self, keep: Option<usize>) {
        let mut inner = self.ctx.inner.lock().unwrap();
        for (i, child) in self.children.iter().enumerate() {
            if Some(i) == keep {
                continue;
            }
            if let Some(source_id) = child.0.claimed_event_id() {
                inner.cancelled_source_ids.insert(source_id);
            }
        }
    }
}

impl Future for AggregateDurableFuture {
    type Output = AggregateOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };

        match this.mode {
            AggregateMode::Select => {
                // Phase 1: poll every child so all claim their scheduling
                // events, even when the winner is already resolvable from
                // history. Phase 2: the ready child with the earliest recorded
                // completion wins. Phase 3: cancel the rest.
                let mut ready: Vec<Option<DurableOutput>> = Vec::with_capacity(this.children.len());
                for child in this.children.iter_mut() {
                    ready.push(match Pin::new(child).poll(cx) {
                        Poll::Ready(out) => Some(out),
                        Poll::Pending => None,
                    });
                }

                let winner = {
                    let inner = this.ctx.inner.lock().unwrap();
                    ready
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| r.is_some())
                        .min_by_key(|(i, _)| completion_event_id(&inner, &this.children[*i]))
                        .map(|(i, _)| i)
                };

                if let Some(winner_index) = winner {
                    this.cancel_losers(Some(winner_index));
                    let output = ready[winner_index]
                        .take()
                        .expect("winner index points at a ready result");
                    return Poll::Ready(AggregateOutput::Select {
                        winner_index,
                        output,
                    });
                }
                Poll::Pending
            }
            AggregateMode::Join | AggregateMode::TryJoin => {
                let fail_fast = matches!(this.mode, AggregateMode::TryJoin);
                // Fixed point: consuming one completion can unblock the FIFO
                // gate for the next, so keep polling until quiescent.
                let mut results: Vec<Option<DurableOutput>> = vec![None; this.children.len()];
                loop {
                    let mut made_progress = false;
                    for (i, child) in this.children.iter_mut().enumerate() {
                        if results[i].is_some() {
                            continue;
                        }
                        if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                            results[i] = Some(out);
                            made_progress = true;
                        }
                    }

                    if fail_fast {
                        let failed = {
                            let inner = this.ctx.inner.lock().unwrap();
                            results
                                .iter()
                                .enumerate()
                                .filter_map(|(i, r)| {
                                    r.as_ref().and_then(failure_message).map(|m| (i, m))
                                })
                                .min_by_key(|(i, _)| {
                                    completion_event_id(&inner, &this.children[*i])
                                })
                        };
                        if let Some((failed_index, message)) = failed {
                            this.cancel_losers(Some(failed_index));
                            return Poll::Ready(AggregateOutput::TryJoin {
                                result: Err(message),
                            });
                        }
                    }

                    if results.iter().all(|r| r.is_some()) {
                        // Order outputs by recorded completion id.
                        let ordered = {
                            let inner = this.ctx.inner.lock().unwrap();
                            let mut items: Vec<(u64, DurableOutput)> = results
                                .iter_mut()
                                .enumerate()
                                .map(|(i, r)| {
                                    (
                                        completion_event_id(&inner, &this.children[i]),
                                        r.take().expect("all results ready"),
                                    )
                                })
                                .collect();
                            items.sort_by_key(|(eid, _)| *eid);
                            items.into_iter().map(|(_, o)| o).collect::<Vec<_>>()
                        };
                        return Poll::Ready(match this.mode {
                            AggregateMode::TryJoin => AggregateOutput::TryJoin {
                                result: Ok(ordered),
                            },
                            _ => AggregateOutput::Join { outputs: ordered },
                        });
                    }

                    if !made_progress {
                        return Poll::Pending;
                    }
                }
            }
        }
    }
}

pub struct SelectFuture(pub(crate) AggregateDurableFuture);
impl Future for SelectFuture {
    type Output = (usize, DurableOutput);
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
        match inner.poll(cx) {
            Poll::Ready(AggregateOutput::Select {
                winner_index,
                output,
            }) => Poll::Ready((winner_index, output)),
            Poll::Ready(_) => unreachable!(),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct JoinFuture(pub(crate) AggregateDurableFuture);
impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
        match inner.poll(cx) {
            Poll::Ready(AggregateOutput::Join { outputs }) => Poll::Ready(outputs),
            Poll::Ready(_) => unreachable!(),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TryJoinFuture(pub(crate) AggregateDurableFuture);
impl Future for TryJoinFuture {
    type Output = Result<Vec<DurableOutput>, String>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
        match inner.poll(cx) {
            Poll::Ready(AggregateOutput::TryJoin { result }) => Poll::Ready(result),
            Poll::Ready(_) => unreachable!(),
            Poll::Pending => Poll::Pending,
        }
    }
}
