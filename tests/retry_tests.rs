use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use duratask::client::DurataskClient;
use duratask::providers::Provider;
use duratask::providers::in_memory::InMemoryProvider;
use duratask::runtime::{
    ActivityRegistry, EntityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime,
};
use duratask::{Event, OrchestrationContext, RetryPolicy};

fn no_entities() -> Arc<EntityRegistry> {
    Arc::new(EntityRegistry::builder().build())
}

#[tokio::test]
async fn retry_records_every_attempt_and_delay_in_history() {
    // Fails twice, succeeds on the third attempt.
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in = attempts.clone();
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("Flaky", move |_ctx, input: String| {
                let attempts = attempts_in.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("transient failure #{n}"))
                    } else {
                        Ok(format!("finally: {input}"))
                    }
                }
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "RetriedCall",
            |ctx: OrchestrationContext, input: String| async move {
                let policy = RetryPolicy::new(3, 50).with_backoff(2.0);
                ctx.schedule_activity_with_retry("Flaky", input, policy).await
            },
        )
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, orchestrations, no_entities()).await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-retry-1", "RetriedCall", "payload")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-retry-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "finally: payload".to_string()
        }
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // The full retry sequence is recorded: three schedule/outcome pairs and
    // exactly two backoff timers (the two retry delays).
    let history = store.read("inst-retry-1").await;
    let scheduled = history
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "Flaky"))
        .count();
    let failed = history
        .iter()
        .filter(|e| matches!(e, Event::ActivityFailed { .. }))
        .count();
    let completed = history
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    let timers_created = history
        .iter()
        .filter(|e| matches!(e, Event::TimerCreated { .. }))
        .count();
    let timers_fired = history
        .iter()
        .filter(|e| matches!(e, Event::TimerFired { .. }))
        .count();
    assert_eq!(scheduled, 3);
    assert_eq!(failed, 2);
    assert_eq!(completed, 1);
    assert_eq!(timers_created, 2);
    assert_eq!(timers_fired, 2);

    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_surface_as_catchable_failure() {
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("AlwaysBroken", |_ctx, _input: String| async move {
                Err("permanently broken".to_string())
            })
            .register("Recover", |_ctx, _input: String| async move {
                Ok("recovered".to_string())
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "RecoverAfterRetries",
            |ctx: OrchestrationContext, _input: String| async move {
                let policy = RetryPolicy::new(2, 10);
                match ctx
                    .schedule_activity_with_retry("AlwaysBroken", "", policy)
                    .await
                {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        ctx.trace_warn(format!("activity gave up: {e}"));
                        ctx.schedule_activity("Recover", "").into_activity().await
                    }
                }
            },
        )
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, orchestrations, no_entities()).await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-retry-2", "RecoverAfterRetries", "")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-retry-2", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "recovered".to_string()
        }
    );

    // Two attempts, one retry delay.
    let history = store.read("inst-retry-2").await;
    let broken_attempts = history
        .iter()
        .filter(
            |e| matches!(e, Event::ActivityScheduled { name, .. } if name == "AlwaysBroken"),
        )
        .count();
    assert_eq!(broken_attempts, 2);

    rt.shutdown().await;
}

#[tokio::test]
async fn custom_decision_stops_on_fatal_failures() {
    let activities = Arc::new(
        ActivityRegistry::builder()
            .register("FatalOnce", |_ctx, _input: String| async move {
                Err("fatal: unrecoverable".to_string())
            })
            .build(),
    );
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "CustomPolicy",
            |ctx: OrchestrationContext, _input: String| async move {
                let policy = RetryPolicy::new(5, 10).with_decision(|failure, _attempt| {
                    if failure.starts_with("fatal:") {
                        None
                    } else {
                        Some(10)
                    }
                });
                match ctx.schedule_activity_with_retry("FatalOnce", "", policy).await {
                    Ok(_) => Err("expected failure".to_string()),
                    Err(e) => Ok(format!("gave up immediately: {e}")),
                }
            },
        )
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt =
        Runtime::start_with_store(store.clone(), activities, orchestrations, no_entities()).await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-retry-3", "CustomPolicy", "")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-retry-3", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "gave up immediately: fatal: unrecoverable".to_string()
        }
    );

    // No retry timer was ever created.
    let history = store.read("inst-retry-3").await;
    assert!(!history.iter().any(|e| matches!(e, Event::TimerCreated { .. })));

    rt.shutdown().await;
}
