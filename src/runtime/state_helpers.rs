//! Readers that extract execution state from histories and work-item batches
//! so the dispatcher does not rescan events at every decision point.

use tracing::warn;

use crate::Event;
use crate::providers::WorkItem;

/// Metadata derived from one execution's history.
#[derive(Debug, Clone, Default)]
pub struct HistoryInfo {
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
    pub orchestration_input: Option<String>,
    pub parent_instance: Option<String>,
    pub parent_id: Option<u64>,
    pub parent_execution_id: Option<u64>,
    pub is_completed: bool,
    pub is_failed: bool,
    pub is_terminated: bool,
    pub is_continued_as_new: bool,
    pub is_suspended: bool,
}

impl HistoryInfo {
    pub fn from_history(history: &[Event]) -> Self {
        let mut info = Self::default();
        for event in history {
            match event {
                Event::OrchestrationStarted {
                    name,
                    version,
                    input,
                    parent_instance,
                    parent_id,
                    parent_execution_id,
                    ..
                } => {
                    info.orchestration_name = Some(name.clone());
                    info.orchestration_version = Some(version.clone());
                    info.orchestration_input = Some(input.clone());
                    info.parent_instance = parent_instance.clone();
                    info.parent_id = *parent_id;
                    info.parent_execution_id = *parent_execution_id;
                }
                Event::OrchestrationCompleted { .. } => info.is_completed = true,
                Event::OrchestrationFailed { .. } => info.is_failed = true,
                Event::OrchestrationTerminated { .. } => info.is_terminated = true,
                Event::OrchestrationContinuedAsNew { .. } => info.is_continued_as_new = true,
                Event::OrchestrationSuspended { .. } => info.is_suspended = true,
                Event::OrchestrationResumed { .. } => info.is_suspended = false,
                _ => {}
            }
        }
        info
    }

    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_failed || self.is_terminated || self.is_continued_as_new
    }

    pub fn parent_link(&self) -> Option<(String, u64, u64)> {
        match (&self.parent_instance, self.parent_id, self.parent_execution_id) {
            (Some(instance), Some(id), Some(execution_id)) => {
                Some((instance.clone(), id, execution_id))
            }
            _ => None,
        }
    }
}

/// A fetched message batch split by role: at most one start/CAN item, at most
/// one of each control item, and the completion messages.
#[derive(Debug, Default)]
pub struct BatchReader {
    pub start_item: Option<WorkItem>,
    pub is_continue_as_new: bool,
    pub orchestration_name: String,
    pub input: String,
    pub version: Option<String>,
    pub parent_instance: Option<String>,
    pub parent_id: Option<u64>,
    pub parent_execution_id: Option<u64>,
    pub carried_events: Vec<(String, String)>,
    pub terminate: Option<String>,
    pub suspend: Option<String>,
    pub resume: Option<String>,
    pub completion_messages: Vec<WorkItem>,
}

impl BatchReader {
    pub fn from_messages(messages: &[WorkItem], info: &HistoryInfo, instance: &str) -> Self {
        let mut reader = Self::default();

        for item in messages {
            match item {
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => {
                    if reader.start_item.is_some() {
                        warn!(instance, "duplicate start/continue-as-new in batch; ignoring");
                        continue;
                    }
                    reader.start_item = Some(item.clone());
                }
                WorkItem::TerminateInstance { output, .. } => {
                    reader.terminate = Some(output.clone());
                }
                WorkItem::SuspendInstance { reason, .. } => {
                    reader.suspend = Some(reason.clone());
                }
                WorkItem::ResumeInstance { reason, .. } => {
                    reader.resume = Some(reason.clone());
                }
                WorkItem::ActivityCompleted { .. }
                | WorkItem::ActivityFailed { .. }
                | WorkItem::TimerFired { .. }
                | WorkItem::ExternalRaised { .. }
                | WorkItem::SubOrchCompleted { .. }
                | WorkItem::SubOrchFailed { .. }
                | WorkItem::EntityCallCompleted { .. }
                | WorkItem::EntityCallFailed { .. }
                | WorkItem::EntityLockGranted { .. }
                | WorkItem::EntityLockFailed { .. }
                | WorkItem::EntityLockTimeout { .. } => {
                    reader.completion_messages.push(item.clone());
                }
                // Worker/entity queue items never belong in this batch.
                WorkItem::ActivityExecute { .. }
                | WorkItem::TimerSchedule { .. }
                | WorkItem::EntityOp { .. } => {
                    warn!(instance, item = ?item, "unexpected queue item in orchestrator batch");
                }
            }
        }

        match &reader.start_item {
            Some(WorkItem::StartOrchestration {
                orchestration,
                input,
                version,
                parent_instance,
                parent_id,
                parent_execution_id,
                ..
            }) => {
                reader.orchestration_name = orchestration.clone();
                reader.input = input.clone();
                reader.version = version.clone();
                reader.parent_instance = parent_instance.clone();
                reader.parent_id = *parent_id;
                reader.parent_execution_id = *parent_execution_id;
            }
            Some(WorkItem::ContinueAsNew {
                orchestration,
                input,
                version,
                carried_events,
                ..
            }) => {
                reader.is_continue_as_new = true;
                reader.orchestration_name = orchestration.clone();
                reader.input = input.clone();
                reader.version = version.clone();
                reader.carried_events = carried_events.clone();
                // ContinueAsNew keeps the instance id, so the parent link
                // from the prior epoch still applies.
                reader.parent_instance = info.parent_instance.clone();
                reader.parent_id = info.parent_id;
                reader.parent_execution_id = info.parent_execution_id;
            }
            _ => {
                reader.orchestration_name =
                    info.orchestration_name.clone().unwrap_or_default();
                reader.input = info.orchestration_input.clone().unwrap_or_default();
            }
        }

        reader
    }

    pub fn has_start_item(&self) -> bool {
        self.start_item.is_some()
    }

    pub fn has_orchestration_name(&self) -> bool {
        !self.orchestration_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_tracks_suspension_pairs() {
        let history = vec![
            Event::OrchestrationStarted {
                event_id: 1,
                name: "Flow".into(),
                version: "1.0.0".into(),
                input: String::new(),
                parent_instance: None,
                parent_id: None,
                parent_execution_id: None,
            },
            Event::OrchestrationSuspended {
                event_id: 2,
                reason: "pause".into(),
            },
            Event::OrchestrationResumed {
                event_id: 3,
                reason: "go".into(),
            },
            Event::OrchestrationSuspended {
                event_id: 4,
                reason: "pause again".into(),
            },
        ];
        let info = HistoryInfo::from_history(&history);
        assert!(info.is_suspended);
        assert!(!info.is_terminal());
    }

    #[test]
    fn batch_reader_splits_roles() {
        let info = HistoryInfo::default();
        let messages = vec![
            WorkItem::StartOrchestration {
                instance: "i".into(),
                orchestration: "Flow".into(),
                input: "in".into(),
                version: Some("1.2.0".into()),
                parent_instance: Some("parent".into()),
                parent_id: Some(4),
                parent_execution_id: Some(1),
            },
            WorkItem::SuspendInstance {
                instance: "i".into(),
                reason: "hold".into(),
            },
            WorkItem::ActivityCompleted {
                instance: "i".into(),
                execution_id: 1,
                id: 2,
                result: "r".into(),
            },
        ];
        let reader = BatchReader::from_messages(&messages, &info, "i");
        assert!(reader.has_start_item());
        assert_eq!(reader.orchestration_name, "Flow");
        assert_eq!(reader.version.as_deref(), Some("1.2.0"));
        assert_eq!(reader.suspend.as_deref(), Some("hold"));
        assert_eq!(reader.completion_messages.len(), 1);
        assert_eq!(reader.parent_id, Some(4));
    }

    #[test]
    fn continue_as_new_keeps_parent_link_from_history() {
        let mut info = HistoryInfo::default();
        info.parent_instance = Some("parent".into());
        info.parent_id = Some(9);
        info.parent_execution_id = Some(2);
        let messages = vec![WorkItem::ContinueAsNew {
            instance: "i".into(),
            orchestration: "Flow".into(),
            input: "next".into(),
            version: None,
            carried_events: vec![("go".into(), "x".into())],
        }];
        let reader = BatchReader::from_messages(&messages, &info, "i");
        assert!(reader.is_continue_as_new);
        assert_eq!(reader.parent_instance.as_deref(), Some("parent"));
        assert_eq!(reader.carried_events.len(), 1);
    }
}
