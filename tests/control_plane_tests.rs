use std::sync::Arc;
use std::time::Duration;

use duratask::client::{DurataskClient, InstanceQuery, PurgeFilter};
use duratask::providers::Provider;
use duratask::providers::in_memory::InMemoryProvider;
use duratask::runtime::{
    ActivityRegistry, EntityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime,
};
use duratask::OrchestrationContext;

fn no_extras() -> (Arc<ActivityRegistry>, Arc<EntityRegistry>) {
    (
        Arc::new(ActivityRegistry::builder().build()),
        Arc::new(EntityRegistry::builder().build()),
    )
}

fn waiting_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(
            "Waiter",
            |ctx: OrchestrationContext, _input: String| async move {
                let data = ctx.schedule_wait("signal").into_event().await;
                Ok(format!("got {data}"))
            },
        )
        .register(
            "Quick",
            |_ctx: OrchestrationContext, input: String| async move { Ok(format!("done {input}")) },
        )
        .register(
            "Broken",
            |_ctx: OrchestrationContext, _input: String| async move {
                Err("deliberate failure".to_string())
            },
        )
        .register(
            "StatusReporter",
            |ctx: OrchestrationContext, _input: String| async move {
                ctx.set_custom_status("phase one");
                let data = ctx.schedule_wait("go").into_event().await;
                ctx.set_custom_status("phase two");
                Ok(data)
            },
        )
        .build()
}

#[tokio::test]
async fn suspended_instances_buffer_completions_until_resume() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-susp", "Waiter", "")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.suspend_instance("inst-susp", "operator hold").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.get_orchestration_status("inst-susp").await,
        OrchestrationStatus::Suspended
    );

    // The raise lands while suspended: recorded, not processed.
    client.raise_event("inst-susp", "signal", "later").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        client.get_orchestration_status("inst-susp").await,
        OrchestrationStatus::Suspended
    );

    client.resume_instance("inst-susp", "operator release").await.unwrap();
    let status = client
        .wait_for_orchestration("inst-susp", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "got later".to_string()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_stops_an_instance_and_keeps_its_history() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-term", "Waiter", "")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.terminate_instance("inst-term", "operator said stop").await.unwrap();

    let status = client
        .wait_for_orchestration("inst-term", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Terminated {
            output: "operator said stop".to_string()
        }
    );
    // Full history retained for postmortem inspection.
    let history = client.read_history("inst-term").await;
    assert!(!history.is_empty());
    rt.shutdown().await;
}

#[tokio::test]
async fn failed_instances_expose_failure_details() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-broken", "Broken", "")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-broken", Duration::from_secs(10))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Failed { details } => {
            assert_eq!(details.display_message(), "deliberate failure");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let description = client.get_instance("inst-broken", true).await.unwrap();
    assert!(description.failure.is_some());
    rt.shutdown().await;
}

#[tokio::test]
async fn custom_status_is_visible_through_get_instance() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-status", "StatusReporter", "")
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let description = client.get_instance("inst-status", false).await;
        if let Some(d) = description {
            if d.custom_status.as_deref() == Some("phase one") {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "custom status never surfaced");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.raise_event("inst-status", "go", "now").await.unwrap();
    client
        .wait_for_orchestration("inst-status", Duration::from_secs(10))
        .await
        .unwrap();
    let description = client.get_instance("inst-status", true).await.unwrap();
    assert_eq!(description.custom_status.as_deref(), Some("phase two"));
    assert_eq!(description.output.as_deref(), Some("now"));
    assert_eq!(description.input.as_deref(), Some(""));
    rt.shutdown().await;
}

#[tokio::test]
async fn query_filters_by_status_prefix_and_paginates() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    for i in 1..=3 {
        client
            .schedule_orchestration(&format!("batch-{i}"), "Quick", i.to_string())
            .await
            .unwrap();
    }
    client
        .schedule_orchestration("other-1", "Broken", "")
        .await
        .unwrap();
    for i in 1..=3 {
        client
            .wait_for_orchestration(&format!("batch-{i}"), Duration::from_secs(10))
            .await
            .unwrap();
    }
    client
        .wait_for_orchestration("other-1", Duration::from_secs(10))
        .await
        .unwrap();

    let completed = client
        .query_instances(InstanceQuery {
            statuses: vec!["Completed".to_string()],
            ..InstanceQuery::default()
        })
        .await;
    assert_eq!(completed.instances.len(), 3);
    assert!(completed.continuation_token.is_none());

    let prefixed = client
        .query_instances(InstanceQuery {
            id_prefix: Some("batch-".to_string()),
            ..InstanceQuery::default()
        })
        .await;
    assert_eq!(prefixed.instances.len(), 3);

    // Page through one at a time with the opaque token.
    let mut seen = Vec::new();
    let mut token = None;
    loop {
        let page = client
            .query_instances(InstanceQuery {
                id_prefix: Some("batch-".to_string()),
                page_size: 1,
                continuation_token: token.clone(),
                ..InstanceQuery::default()
            })
            .await;
        assert!(page.instances.len() <= 1);
        seen.extend(page.instances.iter().map(|d| d.instance.clone()));
        match page.continuation_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(seen.len(), 3);

    rt.shutdown().await;
}

#[tokio::test]
async fn purge_removes_matching_instances_only() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("purge-done", "Quick", "x")
        .await
        .unwrap();
    client
        .schedule_orchestration("purge-broken", "Broken", "")
        .await
        .unwrap();
    client
        .wait_for_orchestration("purge-done", Duration::from_secs(10))
        .await
        .unwrap();
    client
        .wait_for_orchestration("purge-broken", Duration::from_secs(10))
        .await
        .unwrap();

    let purged = client
        .purge_instances(PurgeFilter {
            statuses: vec!["Completed".to_string()],
            ..PurgeFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert_eq!(
        client.get_orchestration_status("purge-done").await,
        OrchestrationStatus::NotFound
    );
    // The failed instance survives with its history.
    match client.get_orchestration_status("purge-broken").await {
        OrchestrationStatus::Failed { .. } => {}
        other => panic!("expected failed instance to remain, got {other:?}"),
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn deferred_start_waits_for_its_start_time() {
    let (activities, entities) = no_extras();
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, waiting_orchestrations(), entities)
            .await;
    let client = DurataskClient::new(store.clone());

    let start_at = duratask_test_now_ms() + 300;
    client
        .schedule_orchestration_with(
            "inst-deferred",
            "Quick",
            "late",
            duratask::client::ScheduleOptions {
                version: None,
                start_at_ms: Some(start_at),
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.get_orchestration_status("inst-deferred").await,
        OrchestrationStatus::Pending
    );
    let status = client
        .wait_for_orchestration("inst-deferred", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "done late".to_string()
        }
    );
    rt.shutdown().await;
}

fn duratask_test_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
