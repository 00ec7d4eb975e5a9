use std::sync::Arc;
use std::time::Duration;

use duratask::client::DurataskClient;
use duratask::providers::Provider;
use duratask::providers::in_memory::InMemoryProvider;
use duratask::runtime::{
    ActivityRegistry, EntityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime,
};
use duratask::{ContinueAsNewOptions, Event, OrchestrationContext};

fn no_entities() -> Arc<EntityRegistry> {
    Arc::new(EntityRegistry::builder().build())
}

#[tokio::test]
async fn continue_as_new_resets_history_per_epoch() {
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "CountedLoop",
            |ctx: OrchestrationContext, input: String| async move {
                let round: u64 = input.parse().map_err(|e| format!("{e}"))?;
                ctx.trace_info(format!("round {round}"));
                if round < 3 {
                    ctx.continue_as_new((round + 1).to_string());
                    return Ok(String::new());
                }
                Ok(format!("finished after {round} rounds"))
            },
        )
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        no_entities(),
    )
    .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-can-1", "CountedLoop", "0")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-can-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "finished after 3 rounds".to_string()
        }
    );

    // Rounds 0..2 each rolled an epoch: four executions in total, and the
    // final epoch's history is seeded fresh (no events from prior epochs).
    assert_eq!(store.latest_execution_id("inst-can-1").await, Some(4));
    let final_history = store.read("inst-can-1").await;
    match &final_history[0] {
        Event::OrchestrationStarted { input, .. } => assert_eq!(input, "3"),
        other => panic!("expected started seed, got {other:?}"),
    }
    // Seed + trace syscall + completion: nothing carried over.
    assert!(
        !final_history
            .iter()
            .any(|e| matches!(e, Event::OrchestrationContinuedAsNew { .. }))
    );

    // Prior epochs remain readable for postmortem inspection.
    let first_epoch = store.read_with_execution("inst-can-1", 1).await;
    assert!(
        first_epoch
            .iter()
            .any(|e| matches!(e, Event::OrchestrationContinuedAsNew { .. }))
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn preserve_unprocessed_events_carries_raises_into_new_epoch() {
    let orchestrations = OrchestrationRegistry::builder()
        .register(
            "Inbox",
            |ctx: OrchestrationContext, input: String| async move {
                if input == "first" {
                    // Consume one event, then roll over keeping the rest.
                    let consumed = ctx.schedule_wait("mail").into_event().await;
                    ctx.trace_info(format!("first epoch consumed {consumed}"));
                    ctx.continue_as_new_with(
                        "second",
                        ContinueAsNewOptions {
                            version: None,
                            preserve_unprocessed_events: true,
                        },
                    );
                    return Ok(String::new());
                }
                let carried = ctx.schedule_wait("mail").into_event().await;
                Ok(format!("second epoch got {carried}"))
            },
        )
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        no_entities(),
    )
    .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration("inst-can-2", "Inbox", "first")
        .await
        .unwrap();
    client.raise_event("inst-can-2", "mail", "one").await.unwrap();
    client.raise_event("inst-can-2", "mail", "two").await.unwrap();

    let status = client
        .wait_for_orchestration("inst-can-2", Duration::from_secs(10))
        .await
        .unwrap();
    // Whether "two" rides the epoch rollover or arrives after it, it is not
    // lost.
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "second epoch got two".to_string()
        }
    );

    rt.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_can_switch_versions() {
    let orchestrations = OrchestrationRegistry::builder()
        .register_versioned(
            "Versioned",
            "1.0.0",
            |ctx: OrchestrationContext, input: String| async move {
                if input == "go" {
                    ctx.continue_as_new_versioned("upgraded", "2.0.0");
                    return Ok(String::new());
                }
                Ok("still v1".to_string())
            },
        )
        .register_versioned(
            "Versioned",
            "2.0.0",
            |ctx: OrchestrationContext, _input: String| async move {
                Ok(format!(
                    "running v{}",
                    ctx.orchestration_version().unwrap_or_default()
                ))
            },
        )
        .build();

    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        orchestrations,
        no_entities(),
    )
    .await;
    let client = DurataskClient::new(store.clone());

    client
        .schedule_orchestration_versioned("inst-can-3", "Versioned", "1.0.0", "go")
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-can-3", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "running v2.0.0".to_string()
        }
    );
    rt.shutdown().await;
}
