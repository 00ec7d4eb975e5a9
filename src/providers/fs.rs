//! Filesystem-backed provider for local development: JSONL history per
//! execution, JSON queue files, JSON entity/metadata records.
//!
//! Queue entries stay in their file until acked; an in-process invisibility
//! set hides fetched entries, so a crash re-delivers them (at-least-once).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    EntityItem, ExecutionMetadata, InstanceMetadata, OrchestrationItem, Provider, ProviderError,
    WorkItem,
};
use crate::{EntityId, Event, wall_clock_now_ms};

const DEFAULT_HISTORY_CAP: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: u64,
    item: WorkItem,
    visible_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EntityRecord {
    state: Option<String>,
    lock_holder: Option<String>,
}

#[derive(Default)]
struct Side {
    locked_instances: HashMap<String, String>,
    /// token -> (instance, entry ids, messages)
    inflight_orch: HashMap<String, (String, Vec<u64>, Vec<WorkItem>)>,
    inflight_worker: HashMap<String, u64>,
    inflight_timer: HashMap<String, u64>,
    inflight_entity: HashMap<String, (EntityId, u64)>,
    invisible_orch: HashSet<u64>,
    invisible_worker: HashSet<u64>,
    invisible_timer: HashSet<u64>,
    invisible_entity: HashSet<u64>,
    busy_entities: HashSet<EntityId>,
    next_token: u64,
}

impl Side {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}-{}", self.next_token)
    }
}

pub struct FsProvider {
    root: PathBuf,
    history_cap: usize,
    side: Mutex<Side>,
}

impl FsProvider {
    /// Create a store rooted at `root`. With `reset_on_create`, any existing
    /// data under the root is removed first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = std::fs::create_dir_all(path.join("instances"));
        Self {
            root: path,
            history_cap: DEFAULT_HISTORY_CAP,
            side: Mutex::new(Side::default()),
        }
    }

    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, history_cap: usize) -> Self {
        let mut provider = Self::new(root, reset_on_create);
        provider.history_cap = history_cap;
        provider
    }

    fn queue_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }

    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.instance_dir(instance).join(format!("{execution_id}.jsonl"))
    }

    async fn load_queue(&self, name: &str) -> Vec<StoredEntry> {
        let data = fs::read_to_string(self.queue_path(name)).await.unwrap_or_default();
        if data.trim().is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&data).unwrap_or_default()
    }

    async fn save_queue(&self, name: &str, entries: &[StoredEntry]) -> Result<(), ProviderError> {
        let data = serde_json::to_string_pretty(entries)
            .map_err(|e| ProviderError::permanent("save_queue", e.to_string()))?;
        fs::write(self.queue_path(name), data)
            .await
            .map_err(|e| ProviderError::retryable("save_queue", e.to_string()))
    }

    async fn push_queue(
        &self,
        name: &str,
        items: Vec<WorkItem>,
        visible_at_ms: u64,
    ) -> Result<(), ProviderError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut entries = self.load_queue(name).await;
        let mut next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        for item in items {
            entries.push(StoredEntry {
                id: next_id,
                item,
                visible_at_ms,
            });
            next_id += 1;
        }
        self.save_queue(name, &entries).await
    }

    async fn load_metadata(&self) -> HashMap<String, InstanceMetadata> {
        let data = fs::read_to_string(self.root.join("metadata.json")).await.unwrap_or_default();
        if data.trim().is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&data).unwrap_or_default()
    }

    async fn save_metadata(
        &self,
        metadata: &HashMap<String, InstanceMetadata>,
    ) -> Result<(), ProviderError> {
        let data = serde_json::to_string_pretty(metadata)
            .map_err(|e| ProviderError::permanent("save_metadata", e.to_string()))?;
        fs::write(self.root.join("metadata.json"), data)
            .await
            .map_err(|e| ProviderError::retryable("save_metadata", e.to_string()))
    }

    async fn load_entities(&self) -> HashMap<String, EntityRecord> {
        let data = fs::read_to_string(self.root.join("entities.json")).await.unwrap_or_default();
        if data.trim().is_empty() {
            return HashMap::new();
        }
        serde_json::from_str(&data).unwrap_or_default()
    }

    async fn save_entities(
        &self,
        entities: &HashMap<String, EntityRecord>,
    ) -> Result<(), ProviderError> {
        let data = serde_json::to_string_pretty(entities)
            .map_err(|e| ProviderError::permanent("save_entities", e.to_string()))?;
        fs::write(self.root.join("entities.json"), data)
            .await
            .map_err(|e| ProviderError::retryable("save_entities", e.to_string()))
    }

    async fn read_history(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let data = fs::read_to_string(self.exec_path(instance, execution_id))
            .await
            .unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str::<Event>(line) {
                out.push(event);
            }
        }
        out
    }

    async fn append_history(
        &self,
        instance: &str,
        execution_id: u64,
        events: &[Event],
        existing_len: usize,
    ) -> Result<(), ProviderError> {
        if existing_len + events.len() > self.history_cap {
            return Err(ProviderError::permanent(
                "append_history",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    self.history_cap,
                    existing_len,
                    events.len()
                ),
            ));
        }
        fs::create_dir_all(self.instance_dir(instance))
            .await
            .map_err(|e| ProviderError::retryable("append_history", e.to_string()))?;
        let mut lines = String::new();
        for event in events {
            let line = serde_json::to_string(event)
                .map_err(|e| ProviderError::permanent("append_history", e.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        let path = self.exec_path(instance, execution_id);
        let mut current = fs::read_to_string(&path).await.unwrap_or_default();
        current.push_str(&lines);
        fs::write(&path, current)
            .await
            .map_err(|e| ProviderError::retryable("append_history", e.to_string()))
    }

    async fn latest_execution(&self, instance: &str) -> Option<u64> {
        let mut latest = None;
        let mut dir = fs::read_dir(self.instance_dir(instance)).await.ok()?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if let Ok(id) = stem.parse::<u64>() {
                    latest = Some(latest.map_or(id, |l: u64| l.max(id)));
                }
            }
        }
        latest
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    async fn enqueue_orchestrator_work(
        &self,
        item: WorkItem,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let _side = self.side.lock().await;
        let now = wall_clock_now_ms();
        if let WorkItem::StartOrchestration { instance, .. } = &item {
            let mut metadata = self.load_metadata().await;
            metadata.entry(instance.clone()).or_insert_with(|| InstanceMetadata {
                instance: instance.clone(),
                status: "Pending".to_string(),
                created_at_ms: now,
                updated_at_ms: now,
                output: None,
                custom_status: None,
                failure: None,
            });
            self.save_metadata(&metadata).await?;
        }
        self.push_queue("orch-queue", vec![item], now + delay_ms.unwrap_or(0))
            .await
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let mut side = self.side.lock().await;
        let now = wall_clock_now_ms();
        let entries = self.load_queue("orch-queue").await;
        let instance = entries.iter().find_map(|entry| {
            if entry.visible_at_ms > now || side.invisible_orch.contains(&entry.id) {
                return None;
            }
            let inst = entry.item.instance()?;
            if side.locked_instances.contains_key(inst) {
                return None;
            }
            Some(inst.to_string())
        })?;

        let mut ids = Vec::new();
        let mut messages = Vec::new();
        for entry in entries.iter() {
            if entry.visible_at_ms <= now
                && !side.invisible_orch.contains(&entry.id)
                && entry.item.instance() == Some(instance.as_str())
            {
                ids.push(entry.id);
                messages.push(entry.item.clone());
            }
        }
        let token = side.token("orch");
        for id in &ids {
            side.invisible_orch.insert(*id);
        }
        side.locked_instances.insert(instance.clone(), token.clone());
        side.inflight_orch
            .insert(token.clone(), (instance.clone(), ids, messages.clone()));

        let (execution_id, history) = match self.latest_execution(&instance).await {
            Some(latest) => (latest, self.read_history(&instance, latest).await),
            None => (crate::INITIAL_EXECUTION_ID, Vec::new()),
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
        let mut side = self.side.lock().await;
        let (instance, ids, _) = side
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "unknown lock token"))?;
        side.locked_instances.remove(&instance);
        for id in &ids {
            side.invisible_orch.remove(id);
        }

        // Drop the acked entries from the queue file.
        let entries: Vec<StoredEntry> = self
            .load_queue("orch-queue")
            .await
            .into_iter()
            .filter(|e| !ids.contains(&e.id))
            .collect();
        self.save_queue("orch-queue", &entries).await?;

        let stored_latest = self.latest_execution(&instance).await.unwrap_or(0);
        if execution_id > stored_latest {
            // Epoch rollover: fresh file seeded with the delta.
            self.append_history(&instance, execution_id, &history_delta, 0)
                .await?;
        } else if !history_delta.is_empty() {
            let existing = self.read_history(&instance, execution_id).await;
            let max_existing = existing.last().map(|e| e.event_id()).unwrap_or(0);
            let fresh: Vec<Event> = history_delta
                .into_iter()
                .filter(|e| e.event_id() > max_existing)
                .collect();
            self.append_history(&instance, execution_id, &fresh, existing.len())
                .await?;
        }

        let now = wall_clock_now_ms();
        let status = metadata.status.clone();
        let mut all_metadata = self.load_metadata().await;
        let meta = all_metadata.entry(instance.clone()).or_insert_with(|| InstanceMetadata {
            instance: instance.clone(),
            status: "Pending".to_string(),
            created_at_ms: now,
            updated_at_ms: now,
            output: None,
            custom_status: None,
            failure: None,
        });
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
        for item in &orchestrator_items {
            if let WorkItem::StartOrchestration { instance, .. } = item {
                all_metadata.entry(instance.clone()).or_insert_with(|| InstanceMetadata {
                    instance: instance.clone(),
                    status: "Pending".to_string(),
                    created_at_ms: now,
                    updated_at_ms: now,
                    output: None,
                    custom_status: None,
                    failure: None,
                });
            }
        }
        self.save_metadata(&all_metadata).await?;

        if matches!(
            status.as_deref(),
            Some("Completed") | Some("Failed") | Some("Terminated")
        ) {
            let mut entities = self.load_entities().await;
            let mut changed = false;
            for record in entities.values_mut() {
                if record.lock_holder.as_deref() == Some(instance.as_str()) {
                    record.lock_holder = None;
                    changed = true;
                }
            }
            if changed {
                self.save_entities(&entities).await?;
            }
        }

        self.push_queue("work-queue", worker_items, now).await?;
        self.push_queue("timer-queue", timer_items, now).await?;
        self.push_queue("orch-queue", orchestrator_items, now).await?;
        self.push_queue("entity-queue", entity_items, now).await?;
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        delay_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut side = self.side.lock().await;
        let (instance, ids, _) = side
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "unknown lock token"))?;
        side.locked_instances.remove(&instance);
        for id in &ids {
            side.invisible_orch.remove(id);
        }
        if let Some(delay) = delay_ms {
            let visible_at = wall_clock_now_ms() + delay;
            let mut entries = self.load_queue("orch-queue").await;
            for entry in entries.iter_mut() {
                if ids.contains(&entry.id) {
                    entry.visible_at_ms = visible_at;
                }
            }
            self.save_queue("orch-queue", &entries).await?;
        }
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut side = self.side.lock().await;
        let now = wall_clock_now_ms();
        let entries = self.load_queue("work-queue").await;
        let entry = entries
            .iter()
            .find(|e| e.visible_at_ms <= now && !side.invisible_worker.contains(&e.id))?
            .clone();
        let token = side.token("work");
        side.invisible_worker.insert(entry.id);
        side.inflight_worker.insert(token.clone(), entry.id);
        Some((entry.item, token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut side = self.side.lock().await;
        let id = side
            .inflight_worker
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_worker", "unknown token"))?;
        side.invisible_worker.remove(&id);
        let entries: Vec<StoredEntry> = self
            .load_queue("work-queue")
            .await
            .into_iter()
            .filter(|e| e.id != id)
            .collect();
        self.save_queue("work-queue", &entries).await
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut side = self.side.lock().await;
        let id = side
            .inflight_worker
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("abandon_worker", "unknown token"))?;
        side.invisible_worker.remove(&id);
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut side = self.side.lock().await;
        let now = wall_clock_now_ms();
        let entries = self.load_queue("timer-queue").await;
        let entry = entries
            .iter()
            .find(|e| e.visible_at_ms <= now && !side.invisible_timer.contains(&e.id))?
            .clone();
        let token = side.token("timer");
        side.invisible_timer.insert(entry.id);
        side.inflight_timer.insert(token.clone(), entry.id);
        Some((entry.item, token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut side = self.side.lock().await;
        let id = side
            .inflight_timer
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_timer", "unknown token"))?;
        side.invisible_timer.remove(&id);
        let entries: Vec<StoredEntry> = self
            .load_queue("timer-queue")
            .await
            .into_iter()
            .filter(|e| e.id != id)
            .collect();
        self.save_queue("timer-queue", &entries).await
    }

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        if !matches!(item, WorkItem::EntityOp { .. }) {
            return Err(ProviderError::permanent(
                "enqueue_entity_work",
                "entity queue accepts only EntityOp items",
            ));
        }
        let _side = self.side.lock().await;
        self.push_queue("entity-queue", vec![item], wall_clock_now_ms())
            .await
    }

    async fn fetch_entity_item(&self) -> Option<EntityItem> {
        let mut side = self.side.lock().await;
        let now = wall_clock_now_ms();
        let entries = self.load_queue("entity-queue").await;
        let records = self.load_entities().await;
        let entry = entries
            .iter()
            .find(|e| {
                if e.visible_at_ms > now || side.invisible_entity.contains(&e.id) {
                    return false;
                }
                let WorkItem::EntityOp { entity, op } = &e.item else {
                    return false;
                };
                if side.busy_entities.contains(entity) {
                    return false;
                }
                let holder = records
                    .get(&entity.to_string())
                    .and_then(|r| r.lock_holder.as_deref());
                op.eligible(holder)
            })?
            .clone();
        let WorkItem::EntityOp { entity, op } = entry.item else {
            unreachable!("entity queue holds only EntityOp items");
        };
        let token = side.token("entity");
        side.invisible_entity.insert(entry.id);
        side.busy_entities.insert(entity.clone());
        side.inflight_entity
            .insert(token.clone(), (entity.clone(), entry.id));
        let record = records.get(&entity.to_string());
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
        let mut side = self.side.lock().await;
        let (entity, id) = side
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_entity_item", "unknown token"))?;
        side.busy_entities.remove(&entity);
        side.invisible_entity.remove(&id);

        let entries: Vec<StoredEntry> = self
            .load_queue("entity-queue")
            .await
            .into_iter()
            .filter(|e| e.id != id)
            .collect();
        self.save_queue("entity-queue", &entries).await?;

        if state.is_some() || lock_holder.is_some() {
            let mut records = self.load_entities().await;
            let record = records.entry(entity.to_string()).or_default();
            if let Some(new_state) = state {
                record.state = new_state;
            }
            if let Some(new_holder) = lock_holder {
                record.lock_holder = new_holder;
            }
            self.save_entities(&records).await?;
        }

        let now = wall_clock_now_ms();
        self.push_queue("orch-queue", orchestrator_items, now).await?;
        self.push_queue("entity-queue", entity_items, now).await?;
        Ok(())
    }

    async fn abandon_entity_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut side = self.side.lock().await;
        let (entity, id) = side
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_entity_item", "unknown token"))?;
        side.busy_entities.remove(&entity);
        side.invisible_entity.remove(&id);
        Ok(())
    }

    async fn read_entity_state(&self, entity: &EntityId) -> Option<String> {
        let _side = self.side.lock().await;
        self.load_entities()
            .await
            .get(&entity.to_string())
            .and_then(|r| r.state.clone())
    }

    async fn list_entities(&self) -> Vec<EntityId> {
        let _side = self.side.lock().await;
        self.load_entities()
            .await
            .iter()
            .filter(|(_, r)| r.state.is_some())
            .filter_map(|(key, _)| {
                let (name, k) = key.split_once('@')?;
                Some(EntityId::new(name, k))
            })
            .collect()
    }

    async fn read(&self, instance: &str) -> Vec<Event> {
        match self.latest_execution(instance).await {
            Some(latest) => self.read_history(instance, latest).await,
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.read_history(instance, execution_id).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        self.latest_execution(instance).await
    }

    async fn list_instances(&self) -> Vec<String> {
        self.load_metadata().await.keys().cloned().collect()
    }

    async fn read_instance_metadata(&self, instance: &str) -> Option<InstanceMetadata> {
        self.load_metadata().await.get(instance).cloned()
    }

    async fn list_instance_metadata(&self) -> Vec<InstanceMetadata> {
        self.load_metadata().await.values().cloned().collect()
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let _side = self.side.lock().await;
        let mut metadata = self.load_metadata().await;
        let existed = metadata.remove(instance).is_some();
        let dir_existed = fs::remove_dir_all(self.instance_dir(instance)).await.is_ok();
        if !existed && !dir_existed {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        self.save_metadata(&metadata).await
    }

    async fn put_client_response(
        &self,
        token: &str,
        result: Result<String, String>,
    ) -> Result<(), ProviderError> {
        let _side = self.side.lock().await;
        let path = self.root.join("mailbox.json");
        let data = fs::read_to_string(&path).await.unwrap_or_default();
        let mut mailbox: HashMap<String, Result<String, String>> = if data.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&data).unwrap_or_default()
        };
        mailbox.insert(token.to_string(), result);
        let data = serde_json::to_string_pretty(&mailbox)
            .map_err(|e| ProviderError::permanent("put_client_response", e.to_string()))?;
        fs::write(&path, data)
            .await
            .map_err(|e| ProviderError::retryable("put_client_response", e.to_string()))
    }

    async fn take_client_response(&self, token: &str) -> Option<Result<String, String>> {
        let _side = self.side.lock().await;
        let path = self.root.join("mailbox.json");
        let data = fs::read_to_string(&path).await.ok()?;
        let mut mailbox: HashMap<String, Result<String, String>> =
            serde_json::from_str(&data).ok()?;
        let result = mailbox.remove(token)?;
        if let Ok(data) = serde_json::to_string_pretty(&mailbox) {
            let _ = fs::write(&path, data).await;
        }
        Some(result)
    }

    async fn reset(&self) {
        let mut side = self.side.lock().await;
        *side = Side::default();
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(self.root.join("instances")).await;
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for instance in self.list_instances().await {
            out.push_str(&format!("instance={instance}\n"));
            if let Some(latest) = self.latest_execution(&instance).await {
                for exec in 1..=latest {
                    out.push_str(&format!("  execution {exec}\n"));
                    for event in self.read_history(&instance, exec).await {
                        out.push_str(&format!("    {event:?}\n"));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_appends_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path(), true);
        provider
            .enqueue_orchestrator_work(
                WorkItem::StartOrchestration {
                    instance: "fs-1".into(),
                    orchestration: "Test".into(),
                    input: "in".into(),
                    version: None,
                    parent_instance: None,
                    parent_id: None,
                    parent_execution_id: None,
                },
                None,
            )
            .await
            .unwrap();
        let item = provider.fetch_orchestration_item().await.unwrap();
        provider
            .ack_orchestration_item(
                &item.lock_token,
                1,
                vec![Event::OrchestrationStarted {
                    event_id: 1,
                    name: "Test".into(),
                    version: "1.0.0".into(),
                    input: "in".into(),
                    parent_instance: None,
                    parent_id: None,
                    parent_execution_id: None,
                }],
                vec![],
                vec![],
                vec![],
                vec![],
                ExecutionMetadata::default(),
            )
            .await
            .unwrap();

        // A second provider over the same root sees the committed history.
        let reopened = FsProvider::new(dir.path(), false);
        let history = reopened.read("fs-1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(
            reopened.read_instance_metadata("fs-1").await.unwrap().status,
            "Running"
        );
    }

    #[tokio::test]
    async fn delayed_visibility_hides_queue_entries() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsProvider::new(dir.path(), true);
        provider
            .enqueue_orchestrator_work(
                WorkItem::ExternalRaised {
                    instance: "x".into(),
                    name: "later".into(),
                    data: String::new(),
                },
                Some(60_000),
            )
            .await
            .unwrap();
        assert!(provider.fetch_orchestration_item().await.is_none());
    }
}
