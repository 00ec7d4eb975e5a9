//! Direct tests of the turn executor: determinism, idempotent replay, and
//! divergence detection, without any runtime or provider in the loop.

use duratask::{Action, Event, OrchestrationContext, run_turn};

fn started(event_id: u64) -> Event {
    Event::OrchestrationStarted {
        event_id,
        name: "HelloPipeline".into(),
        version: "1.0.0".into(),
        input: "Seattle".into(),
        parent_instance: None,
        parent_id: None,
        parent_execution_id: None,
    }
}

async fn hello_pipeline(ctx: OrchestrationContext) -> Result<String, String> {
    let greeting = ctx
        .schedule_activity("SayHello", "Seattle")
        .into_activity()
        .await?;
    let upper = ctx.schedule_activity("ToUpper", greeting).into_activity().await?;
    ctx.schedule_activity("AddExclamation", upper)
        .into_activity()
        .await
}

/// History after the first two activities have completed.
fn two_completions_history() -> Vec<Event> {
    vec![
        started(1),
        Event::ActivityScheduled {
            event_id: 2,
            name: "SayHello".into(),
            input: "Seattle".into(),
            execution_id: 1,
        },
        Event::ActivityCompleted {
            event_id: 3,
            source_event_id: 2,
            result: "Hello, Seattle".into(),
        },
        Event::ActivityScheduled {
            event_id: 4,
            name: "ToUpper".into(),
            input: "Hello, Seattle".into(),
            execution_id: 1,
        },
        Event::ActivityCompleted {
            event_id: 5,
            source_event_id: 4,
            result: "HELLO, SEATTLE".into(),
        },
    ]
}

fn full_history() -> Vec<Event> {
    let mut history = two_completions_history();
    history.push(Event::ActivityScheduled {
        event_id: 6,
        name: "AddExclamation".into(),
        input: "HELLO, SEATTLE".into(),
        execution_id: 1,
    });
    history.push(Event::ActivityCompleted {
        event_id: 7,
        source_event_id: 6,
        result: "HELLO, SEATTLE!".into(),
    });
    history
}

#[test]
fn replay_resumes_at_third_activity_without_reinvoking_earlier_ones() {
    let execution = run_turn("inst", 1, 0, two_completions_history(), hello_pipeline);

    assert!(execution.output.is_none());
    assert!(execution.nondeterminism.is_none());
    // Only the third activity is newly scheduled; the first two bind to
    // recorded results and trigger no dispatch.
    assert_eq!(execution.actions.len(), 1);
    match &execution.actions[0] {
        Action::CallActivity {
            scheduling_event_id,
            name,
            input,
        } => {
            assert_eq!(*scheduling_event_id, 6);
            assert_eq!(name, "AddExclamation");
            assert_eq!(input, "HELLO, SEATTLE");
        }
        other => panic!("unexpected action {other:?}"),
    }
    assert_eq!(execution.history.len(), 6);
}

#[test]
fn replaying_a_full_history_emits_no_actions_and_same_output() {
    let first = run_turn("inst", 1, 0, full_history(), hello_pipeline);
    let second = run_turn("inst", 1, 1, full_history(), hello_pipeline);

    assert_eq!(first.output, Some(Ok("HELLO, SEATTLE!".to_string())));
    assert_eq!(second.output, Some(Ok("HELLO, SEATTLE!".to_string())));
    // Idempotent replay: no new events, no duplicate dispatches.
    assert!(first.actions.is_empty());
    assert!(second.actions.is_empty());
    assert_eq!(first.history, second.history);
    assert_eq!(first.history.len(), full_history().len());
}

#[test]
fn schedule_order_divergence_is_flagged_fatal() {
    // History says a timer was created; the code schedules an activity.
    let history = vec![
        started(1),
        Event::TimerCreated {
            event_id: 2,
            fire_at_ms: 42,
            execution_id: 1,
        },
    ];
    let execution = run_turn("inst", 1, 0, history, |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("SayHello", "Seattle")
            .into_activity()
            .await
    });
    let err = execution.nondeterminism.expect("divergence must be detected");
    assert!(err.contains("schedule order mismatch"), "got: {err}");
    assert!(execution.actions.is_empty());
}

#[test]
fn input_mismatch_is_flagged_fatal() {
    let history = vec![
        started(1),
        Event::ActivityScheduled {
            event_id: 2,
            name: "SayHello".into(),
            input: "Tokyo".into(),
            execution_id: 1,
        },
    ];
    let execution = run_turn("inst", 1, 0, history, |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("SayHello", "Seattle")
            .into_activity()
            .await
    });
    assert!(execution.nondeterminism.is_some());
}

#[test]
fn is_replaying_flips_when_new_events_are_appended() {
    let observed = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let observed_in = observed.clone();
    let execution = run_turn(
        "inst",
        1,
        0,
        two_completions_history(),
        move |ctx: OrchestrationContext| {
            let observed = observed_in.clone();
            async move {
                observed.lock().unwrap().push(ctx.is_replaying());
                let greeting = ctx
                    .schedule_activity("SayHello", "Seattle")
                    .into_activity()
                    .await?;
                observed.lock().unwrap().push(ctx.is_replaying());
                let upper = ctx.schedule_activity("ToUpper", greeting).into_activity().await?;
                // The third schedule appends a new event: live from here.
                let fut = ctx.schedule_activity("AddExclamation", upper).into_activity();
                observed.lock().unwrap().push(ctx.is_replaying());
                fut.await
            }
        },
    );
    assert!(execution.output.is_none());
    let observed = observed.lock().unwrap();
    assert_eq!(observed.as_slice(), &[true, true, true]);
    // After the turn the context had appended the new schedule, which is
    // only reachable through the pending future; the recorded action proves
    // the live transition happened.
    assert_eq!(execution.actions.len(), 1);
}

#[test]
fn system_calls_replay_recorded_values() {
    // First execution records a guid.
    let first = run_turn(
        "inst",
        1,
        0,
        vec![started(1)],
        |ctx: OrchestrationContext| async move {
            let id = ctx.new_guid();
            Ok(id)
        },
    );
    let output = first.output.clone().unwrap().unwrap();
    assert!(!output.is_empty());

    // Replaying over the recorded history returns the identical value.
    let second = run_turn("inst", 1, 1, first.history.clone(), |ctx: OrchestrationContext| async move {
        let id = ctx.new_guid();
        Ok(id)
    });
    assert_eq!(second.output, Some(Ok(output)));
    assert!(second.actions.is_empty());
}

#[test]
fn scheduling_after_continue_as_new_is_rejected() {
    let execution = run_turn(
        "inst",
        1,
        0,
        vec![started(1)],
        |ctx: OrchestrationContext| async move {
            ctx.continue_as_new("next");
            // Illegal: continue_as_new must end the turn.
            ctx.schedule_activity("SayHello", "x").into_activity().await
        },
    );
    assert!(execution.nondeterminism.is_some());
}
