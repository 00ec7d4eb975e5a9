//! Entity engine: serialized stateful actors over the provider substrate.
//!
//! Each entity `(name, key)` owns an opaque state blob and a FIFO operation
//! queue. The provider serves at most one eligible operation per entity at a
//! time; this module applies the operation against the state and emits the
//! follow-on work (call completions, forwarded lock requests, signals sent by
//! the handler).
//!
//! Multi-entity locks use chained acquisition: the runtime sends a
//! `LockAcquire` to the first entity of the sorted set; each member marks
//! itself held by the requesting orchestration and forwards the request to
//! the next member; the final member enqueues the grant completion. Because
//! every requester walks the same total order (`EntityId`'s `Ord`), two
//! overlapping requests serialize at their first common entity instead of
//! deadlocking.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::_typed_codec::{Codec, Json};
use crate::providers::{
    EntityCaller, EntityItem, EntityOperation, Provider, WorkItem,
};
use crate::{EntityId, ErrorDetails};

use super::registry::EntityRegistry;

/// Handler invoked for every operation delivered to an entity of its name.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn invoke(
        &self,
        ctx: EntityContext,
        operation: String,
        input: String,
    ) -> Result<String, String>;
}

/// Function wrapper implementing `EntityHandler`.
pub struct FnEntity<F, Fut>(pub F)
where
    F: Fn(EntityContext, String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> EntityHandler for FnEntity<F, Fut>
where
    F: Fn(EntityContext, String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: EntityContext,
        operation: String,
        input: String,
    ) -> Result<String, String> {
        (self.0)(ctx, operation, input).await
    }
}

#[derive(Default)]
struct EntityOutbox {
    signals: Vec<(EntityId, String, String)>,
    starts: Vec<(String, String, String)>,
}

/// Handle given to entity handlers. State reads/writes go through here and
/// are committed atomically with the operation's ack. Entities may signal
/// other entities (one-way) and start orchestrations, but cannot call
/// entities: only orchestrations participate in the lock protocol.
#[derive(Clone)]
pub struct EntityContext {
    entity: EntityId,
    state: Arc<Mutex<Option<String>>>,
    outbox: Arc<Mutex<EntityOutbox>>,
}

impl EntityContext {
    fn new(entity: EntityId, state: Option<String>) -> Self {
        Self {
            entity,
            state: Arc::new(Mutex::new(state)),
            outbox: Arc::new(Mutex::new(EntityOutbox::default())),
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity
    }

    pub fn get_state_raw(&self) -> Option<String> {
        self.state.lock().unwrap().clone()
    }

    pub fn get_state<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, String> {
        match self.get_state_raw() {
            Some(raw) => Json::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_state_raw(&self, raw: impl Into<String>) {
        *self.state.lock().unwrap() = Some(raw.into());
    }

    pub fn set_state<T: serde::Serialize>(&self, value: &T) -> Result<(), String> {
        let raw = Json::encode(value)?;
        self.set_state_raw(raw);
        Ok(())
    }

    pub fn delete_state(&self) {
        *self.state.lock().unwrap() = None;
    }

    /// One-way signal to another entity, delivered after this operation's
    /// state change commits.
    pub fn signal_entity(
        &self,
        target: EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) {
        self.outbox
            .lock()
            .unwrap()
            .signals
            .push((target, operation.into(), input.into()));
    }

    /// Start a detached orchestration, delivered after this operation's
    /// state change commits.
    pub fn start_orchestration(
        &self,
        name: impl Into<String>,
        instance: impl Into<String>,
        input: impl Into<String>,
    ) {
        self.outbox
            .lock()
            .unwrap()
            .starts
            .push((name.into(), instance.into(), input.into()));
    }

    fn into_effects(self) -> (Option<String>, Vec<WorkItem>, Vec<WorkItem>) {
        let state = self.state.lock().unwrap().clone();
        let outbox = std::mem::take(&mut *self.outbox.lock().unwrap());
        let entity_items = outbox
            .signals
            .into_iter()
            .map(|(entity, operation, input)| WorkItem::EntityOp {
                entity,
                op: EntityOperation::Signal { operation, input },
            })
            .collect();
        let orchestrator_items = outbox
            .starts
            .into_iter()
            .map(|(orchestration, instance, input)| WorkItem::StartOrchestration {
                instance,
                orchestration,
                input,
                version: None,
                parent_instance: None,
                parent_id: None,
                parent_execution_id: None,
            })
            .collect();
        (state, orchestrator_items, entity_items)
    }
}

/// Apply one fetched entity operation and ack it.
pub(crate) async fn process_entity_item(
    registry: &EntityRegistry,
    store: &Arc<dyn Provider>,
    item: EntityItem,
) {
    let EntityItem {
        entity,
        state,
        lock_holder,
        operation,
        lock_token,
    } = item;

    let mut state_update: Option<Option<String>> = None;
    let mut lock_update: Option<Option<String>> = None;
    let mut orchestrator_items: Vec<WorkItem> = Vec::new();
    let mut entity_items: Vec<WorkItem> = Vec::new();

    match operation {
        EntityOperation::Signal { operation, input } => {
            match registry.resolve_handler(&entity.name) {
                Some((_, handler)) => {
                    let ctx = EntityContext::new(entity.clone(), state);
                    match handler.invoke(ctx.clone(), operation.clone(), input).await {
                        Ok(_) => {
                            let (new_state, orch, ents) = ctx.into_effects();
                            state_update = Some(new_state);
                            orchestrator_items.extend(orch);
                            entity_items.extend(ents);
                        }
                        Err(error) => {
                            // Signals surface nowhere; failures are logged and
                            // the state change is discarded.
                            warn!(entity = %entity, operation = %operation, error = %error, "entity signal failed");
                        }
                    }
                }
                None => {
                    warn!(entity = %entity, operation = %operation, "signal for unregistered entity dropped");
                }
            }
        }
        EntityOperation::Call {
            operation,
            input,
            caller,
        } => {
            let result = match registry.resolve_handler(&entity.name) {
                Some((_, handler)) => {
                    let ctx = EntityContext::new(entity.clone(), state);
                    match handler.invoke(ctx.clone(), operation.clone(), input).await {
                        Ok(result) => {
                            let (new_state, orch, ents) = ctx.into_effects();
                            state_update = Some(new_state);
                            orchestrator_items.extend(orch);
                            entity_items.extend(ents);
                            Ok(result)
                        }
                        // Failed calls roll the state change back.
                        Err(error) => Err(error),
                    }
                }
                None => Err(format!("unregistered:{}", entity.name)),
            };

            match caller {
                EntityCaller::Orchestration {
                    instance,
                    execution_id,
                    id,
                } => {
                    let completion = match &result {
                        Ok(value) => WorkItem::EntityCallCompleted {
                            instance,
                            execution_id,
                            id,
                            result: value.clone(),
                        },
                        Err(error) => WorkItem::EntityCallFailed {
                            instance,
                            execution_id,
                            id,
                            details: ErrorDetails::application_typed("entity", error.clone()),
                        },
                    };
                    orchestrator_items.push(completion);
                }
                EntityCaller::Client { token } => {
                    if let Err(e) = store.put_client_response(&token, result).await {
                        warn!(entity = %entity, token = %token, error = %e, "failed to store client entity-call response");
                    }
                }
            }
        }
        EntityOperation::LockAcquire {
            instance,
            execution_id,
            source_event_id,
            entities,
            index,
        } => {
            debug!(entity = %entity, instance = %instance, index, total = entities.len(), "entity lock acquired");
            lock_update = Some(Some(instance.clone()));
            if index + 1 < entities.len() {
                entity_items.push(WorkItem::EntityOp {
                    entity: entities[index + 1].clone(),
                    op: EntityOperation::LockAcquire {
                        instance,
                        execution_id,
                        source_event_id,
                        entities: entities.clone(),
                        index: index + 1,
                    },
                });
            } else {
                orchestrator_items.push(WorkItem::EntityLockGranted {
                    instance,
                    execution_id,
                    id: source_event_id,
                });
            }
        }
        EntityOperation::LockRelease { instance } => {
            if lock_holder.as_deref() == Some(instance.as_str()) {
                debug!(entity = %entity, instance = %instance, "entity lock released");
                lock_update = Some(None);
            } else {
                debug!(entity = %entity, instance = %instance, holder = ?lock_holder, "release for non-holder ignored");
            }
        }
    }

    if let Err(e) = store
        .ack_entity_item(
            &lock_token,
            state_update,
            lock_update,
            orchestrator_items,
            entity_items,
        )
        .await
    {
        warn!(entity = %entity, error = %e, "entity ack failed; abandoning");
        let _ = store.abandon_entity_item(&lock_token).await;
    }
}
