//! In-memory provider: the reference implementation of the storage contract,
//! used by tests and as the default store for local runtimes.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

use super::{
    EntityItem, ExecutionMetadata, InstanceMetadata, OrchestrationItem, Provider, ProviderError,
    WorkItem,
};
use crate::{EntityId, Event, wall_clock_now_ms};

const DEFAULT_HISTORY_CAP: usize = 1024;

#[derive(Debug)]
struct QueueEntry {
    item: WorkItem,
    visible_at_ms: u64,
}

#[derive(Debug, Default)]
struct EntityRecord {
    state: Option<String>,
    lock_holder: Option<String>,
}

#[derive(Default)]
struct Core {
    /// instance -> executions (execution_id starts at 1).
    executions: HashMap<String, Vec<Vec<Event>>>,
    metadata: HashMap<String, InstanceMetadata>,
    orchestrator_q: Vec<QueueEntry>,
    worker_q: Vec<QueueEntry>,
    timer_q: Vec<QueueEntry>,
    entity_q: Vec<QueueEntry>,
    entities: HashMap<EntityId, EntityRecord>,
    /// instance -> outstanding lock token.
    locked_instances: HashMap<String, String>,
    /// token -> (instance, fetched messages), for abandon.
    inflight_orch: HashMap<String, (String, Vec<WorkItem>)>,
    inflight_worker: HashMap<String, WorkItem>,
    inflight_timer: HashMap<String, WorkItem>,
    inflight_entity: HashMap<String, (EntityId, WorkItem)>,
    busy_entities: HashSet<EntityId>,
    mailbox: HashMap<String, Result<String, String>>,
    next_token: u64,
}

impl Core {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}-{}", self.next_token)
    }

    fn ensure_metadata(&mut self, instance: &str, now: u64) -> &mut InstanceMetadata {
        self.metadata
            .entry(instance.to_string())
            .or_insert_with(|| InstanceMetadata {
                instance: instance.to_string(),
                status: "Pending".to_string(),
                created_at_ms: now,
                updated_at_ms: now,
                output: None,
                custom_status: None,
                failure: None,
            })
    }
}

pub struct InMemoryProvider {
    core: Mutex<Core>,
    history_cap: usize,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(Core::default()),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    /// Custom history cap (useful for tests exercising the guard).
    pub fn new_with_cap(history_cap: usize) -> Self {
        Self {
            core: Mutex::new(Core::default()),
            history_cap,
        }
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let now = wall_clock_now_ms();
        if let WorkItem::StartOrchestration { instance, .. } = &item {
            // Register the instance as Pending so queries see it before the
            // first turn runs.
            let instance = instance.clone();
            core.ensure_metadata(&instance, now);
        }
        core.orchestrator_q.push(QueueEntry {
            item,
            visible_at_ms: now + delay_ms.unwrap_or(0),
        });
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let mut core = self.core.lock().await;
        let now = wall_clock_now_ms();
        let instance = core.orchestrator_q.iter().find_map(|entry| {
            if entry.visible_at_ms > now {
                return None;
            }
            let inst = entry.item.instance()?;
            if core.locked_instances.contains_key(inst) {
                return None;
            }
            Some(inst.to_string())
        })?;

        // Batch every visible message for the chosen instance.
        let mut messages = Vec::new();
        let mut i = 0;
        while i < core.orchestrator_q.len() {
            let entry = &core.orchestrator_q[i];
            if entry.visible_at_ms <= now && entry.item.instance() == Some(instance.as_str()) {
                messages.push(core.orchestrator_q.remove(i).item);
            } else {
                i += 1;
            }
        }

        let token = core.token("orch");
        core.locked_instances.insert(instance.clone(), token.clone());
        core.inflight_orch
            .insert(token.clone(), (instance.clone(), messages.clone()));

        let (execution_id, history) = match core.executions.get(&instance) {
            Some(execs) if !execs.is_empty() => {
                (execs.len() as u64, execs.last().cloned().unwrap_or_default())
            }
            _ => (crate::INITIAL_EXECUTION_ID, Vec::new()),
        };

        Some(OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token: token,
        })
    }

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
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (instance, _) = core
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "unknown lock token"))?;
        core.locked_instances.remove(&instance);

        let execs = core.executions.entry(instance.clone()).or_default();
        let stored_latest = execs.len() as u64;
        if execution_id > stored_latest {
            // Epoch rollover: the delta seeds a fresh execution.
            execs.push(history_delta);
        } else if !history_delta.is_empty() {
            let current = execs
                .last_mut()
                .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "no execution"))?;
            if current.len() + history_delta.len() > self.history_cap {
                return Err(ProviderError::permanent(
                    "ack_orchestration_item",
                    format!(
                        "history cap exceeded (cap={}, have={}, append={})",
                        self.history_cap,
                        current.len(),
                        history_delta.len()
                    ),
                ));
            }
            // Idempotent re-ack: never append an id at or below the last.
            let max_existing = current.last().map(|e| e.event_id()).unwrap_or(0);
            current.extend(
                history_delta
                    .into_iter()
                    .filter(|e| e.event_id() > max_existing),
            );
        }

        let now = wall_clock_now_ms();
        let status = metadata.status.clone();
        let meta = core.ensure_metadata(&instance, now);
        if let Some(status) = &status {
            meta.status = status.clone();
        }
        meta.updated_at_ms = now;
        if let Some(output) = metadata.output {
            meta.output = Some(output);
        }
        if let Some(custom) = metadata.custom_status {
            meta.custom_status = Some(custom);
        }
        if let Some(failure) = metadata.failure {
            meta.failure = Some(failure);
        }

        // Terminal instances give back every entity lock they still hold.
        if matches!(
            status.as_deref(),
            Some("Completed") | Some("Failed") | Some("Terminated")
        ) {
            for record in core.entities.values_mut() {
                if record.lock_holder.as_deref() == Some(instance.as_str()) {
                    record.lock_holder = None;
                }
            }
        }

        for item in worker_items {
            core.worker_q.push(QueueEntry {
                item,
                visible_at_ms: now,
            });
        }
        for item in timer_items {
            core.timer_q.push(QueueEntry {
                item,
                visible_at_ms: now,
            });
        }
        for item in orchestrator_items {
            if let WorkItem::StartOrchestration { instance, .. } = &item {
                let instance = instance.clone();
                core.ensure_metadata(&instance, now);
            }
            core.orchestrator_q.push(QueueEntry {
                item,
                visible_at_ms: now,
            });
        }
        for item in entity_items {
            core.entity_q.push(QueueEntry {
                item,
                visible_at_ms: now,
            });
        }
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (instance, messages) = core
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "unknown lock token"))?;
        core.locked_instances.remove(&instance);
        let visible_at_ms = wall_clock_now_ms() + delay_ms.unwrap_or(0);
        for (i, item) in messages.into_iter().enumerate() {
            core.orchestrator_q.insert(i, QueueEntry { item, visible_at_ms });
        }
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut core = self.core.lock().await;
        let now = wall_clock_now_ms();
        let idx = core
            .worker_q
            .iter()
            .position(|entry| entry.visible_at_ms <= now)?;
        let entry = core.worker_q.remove(idx);
        let token = core.token("work");
        core.inflight_worker.insert(token.clone(), entry.item.clone());
        Some((entry.item, token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.inflight_worker
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("ack_worker", "unknown token"))
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let item = core
            .inflight_worker
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("abandon_worker", "unknown token"))?;
        let now = wall_clock_now_ms();
        core.worker_q.insert(0, QueueEntry { item, visible_at_ms: now });
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut core = self.core.lock().await;
        let now = wall_clock_now_ms();
        let idx = core
            .timer_q
            .iter()
            .position(|entry| entry.visible_at_ms <= now)?;
        let entry = core.timer_q.remove(idx);
        let token = core.token("timer");
        core.inflight_timer.insert(token.clone(), entry.item.clone());
        Some((entry.item, token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.inflight_timer
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("ack_timer", "unknown token"))
    }

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        if !matches!(item, WorkItem::EntityOp { .. }) {
            return Err(ProviderError::permanent(
                "enqueue_entity_work",
                "entity queue accepts only EntityOp items",
            ));
        }
        let mut core = self.core.lock().await;
        let now = wall_clock_now_ms();
        core.entity_q.push(QueueEntry {
            item,
            visible_at_ms: now,
        });
        Ok(())
    }

    async fn fetch_entity_item(&self) -> Option<EntityItem> {
        let mut core = self.core.lock().await;
        let now = wall_clock_now_ms();
        let idx = core.entity_q.iter().position(|entry| {
            if entry.visible_at_ms > now {
                return false;
            }
            let WorkItem::EntityOp { entity, op } = &entry.item else {
                return false;
            };
            if core.busy_entities.contains(entity) {
                return false;
            }
            let holder = core
                .entities
                .get(entity)
                .and_then(|r| r.lock_holder.as_deref());
            op.eligible(holder)
        })?;
        let entry = core.entity_q.remove(idx);
        let WorkItem::EntityOp { entity, op } = entry.item.clone() else {
            unreachable!("entity queue holds only EntityOp items");
        };
        let token = core.token("entity");
        core.busy_entities.insert(entity.clone());
        core.inflight_entity
            .insert(token.clone(), (entity.clone(), entry.item));
        let record = core.entities.get(&entity);
        Some(EntityItem {
            state: record.and_then(|r| r.state.clone()),
            lock_holder: record.and_then(|r| r.lock_holder.clone()),
            entity,
            operation: op,
            lock_token: token,
        })
    }

    async fn ack_entity_item(
        &self,
        lock_token: &str,
        state: Option<Option<String>>,
        lock_holder: Option<Option<String>>,
        orchestrator_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (entity, _) = core
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_entity_item", "unknown token"))?;
        core.busy_entities.remove(&entity);
        let record = core.entities.entry(entity).or_default();
        if let Some(new_state) = state {
            record.state = new_state;
        }
        if let Some(new_holder) = lock_holder {
            record.lock_holder = new_holder;
        }
        let now = wall_clock_now_ms();
        for item in orchestrator_items {
            core.orchestrator_q.push(QueueEntry {
                item,
                visible_at_ms: now,
            });
        }
        for item in entity_items {
            core.entity_q.push(QueueEntry {
                item,
                visible_at_ms: now,
            });
        }
        Ok(())
    }

    async fn abandon_entity_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (entity, item) = core
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_entity_item", "unknown token"))?;
        core.busy_entities.remove(&entity);
        let now = wall_clock_now_ms();
        core.entity_q.insert(0, QueueEntry { item, visible_at_ms: now });
        Ok(())
    }

    async fn read_entity_state(&self, entity: &EntityId) -> Option<String> {
        let core = self.core.lock().await;
        core.entities.get(entity).and_then(|r| r.state.clone())
    }

    async fn list_entities(&self) -> Vec<EntityId> {
        let core = self.core.lock().await;
        core.entities
            .iter()
            .filter(|(_, r)| r.state.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn read(&self, instance: &str) -> Vec<Event> {
        let core = self.core.lock().await;
        core.executions
            .get(instance)
            .and_then(|execs| execs.last().cloned())
            .unwrap_or_default()
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let core = self.core.lock().await;
        core.executions
            .get(instance)
            .and_then(|execs| execs.get(execution_id.saturating_sub(1) as usize).cloned())
            .unwrap_or_default()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let core = self.core.lock().await;
        core.executions
            .get(instance)
            .filter(|execs| !execs.is_empty())
            .map(|execs| execs.len() as u64)
    }

    async fn list_instances(&self) -> Vec<String> {
        let core = self.core.lock().await;
        core.metadata.keys().cloned().collect()
    }

    async fn read_instance_metadata(&self, instance: &str) -> Option<InstanceMetadata> {
        let core = self.core.lock().await;
        core.metadata.get(instance).cloned()
    }

    async fn list_instance_metadata(&self) -> Vec<InstanceMetadata> {
        let core = self.core.lock().await;
        core.metadata.values().cloned().collect()
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        if core.executions.remove(instance).is_none() && core.metadata.remove(instance).is_none() {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        core.metadata.remove(instance);
        core.orchestrator_q
            .retain(|entry| entry.item.instance() != Some(instance));
        core.worker_q
            .retain(|entry| entry.item.instance() != Some(instance));
        core.timer_q
            .retain(|entry| entry.item.instance() != Some(instance));
        Ok(())
    }

    async fn put_client_response(
        &self,
        token: &str,
        result: Result<String, String>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.mailbox.insert(token.to_string(), result);
        Ok(())
    }

    async fn take_client_response(&self, token: &str) -> Option<Result<String, String>> {
        let mut core = self.core.lock().await;
        core.mailbox.remove(token)
    }

    async fn reset(&self) {
        let mut core = self.core.lock().await;
        *core = Core::default();
    }

    async fn dump_all_pretty(&self) -> String {
        let core = self.core.lock().await;
        let mut out = String::new();
        for (instance, execs) in core.executions.iter() {
            out.push_str(&format!("instance={instance}\n"));
            for (i, events) in execs.iter().enumerate() {
                out.push_str(&format!("  execution {}\n", i + 1));
                for e in events {
                    out.push_str(&format!("    {e:?}\n"));
                }
            }
        }
        out
    }
}
