// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery: a restarted engine resumes from the persisted
//! `current_step` without re-running finished steps.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use stepflow_core::engine::Engine;
use stepflow_core::models::{InstanceStatus, JsonMap, StepDefinition, StepRecord, StepStatus, StepType};
use stepflow_core::persistence::StepResolution;

fn three_steps() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new("A", StepType::Action)
            .with_config("action", "count_a")
            .then(["B"]),
        StepDefinition::new("B", StepType::Action)
            .with_config("action", "count_b")
            .then(["C"]),
        StepDefinition::new("C", StepType::Action).with_config("action", "count_c"),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_without_rerunning_finished_step() {
    let store = memory_store().await;
    let (a, b, c) = (
        CountingAction::new("count_a"),
        CountingAction::new("count_b"),
        CountingAction::new("count_c"),
    );
    let template = insert_template(&store, three_steps()).await;
    let instance = create_instance(&store, &template, json!({})).await;

    // State left by a process that finished A and B, persisted current_step = B,
    // then died before advancing.
    store.start_instance(&instance.id).await.unwrap();
    for step_id in ["A", "B"] {
        let record = StepRecord::new(&instance.id, step_id, StepType::Action, JsonMap::new());
        store.insert_step(&record).await.unwrap();
        store.start_step(&record.id).await.unwrap();
        assert!(
            store
                .finish_step_if_running(&record.id, StepStatus::Completed, &JsonMap::new(), None)
                .await
                .unwrap()
        );
    }
    store.set_current_step(&instance.id, "B").await.unwrap();

    // Startup recovery picks the running instance up without an explicit queue.
    let engine = start_engine(store.clone(), registry(&[&a, &b, &c])).await;

    let done = wait_for_status(&store, &instance.id, InstanceStatus::Completed).await;
    assert_eq!(done.current_step.as_deref(), Some("C"));
    assert_eq!(a.runs(), 0);
    assert_eq!(b.runs(), 0);
    assert_eq!(c.runs(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_step_interrupted_mid_flight_runs_again() {
    let store = memory_store().await;
    let (a, b, c) = (
        CountingAction::new("count_a"),
        CountingAction::new("count_b"),
        CountingAction::new("count_c"),
    );
    let template = insert_template(&store, three_steps()).await;
    let instance = create_instance(&store, &template, json!({})).await;

    store.start_instance(&instance.id).await.unwrap();
    let record = StepRecord::new(&instance.id, "A", StepType::Action, JsonMap::new());
    store.insert_step(&record).await.unwrap();
    store.start_step(&record.id).await.unwrap();
    store.set_current_step(&instance.id, "A").await.unwrap();

    let engine = start_engine(store.clone(), registry(&[&a, &b, &c])).await;

    wait_for_status(&store, &instance.id, InstanceStatus::Completed).await;
    assert_eq!((a.runs(), b.runs(), c.runs()), (1, 1, 1));

    let steps = store.list_steps(&instance.id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_engine_resumes_after_shutdown() {
    let store = memory_store().await;
    let first_run = CountingAction::new("count_a");
    let template = insert_template(
        &store,
        vec![
            StepDefinition::new("A", StepType::Action)
                .with_config("action", "count_a")
                .then(["pause"]),
            StepDefinition::new("pause", StepType::Wait)
                .with_config("duration", 3600)
                .then(["C"]),
            StepDefinition::new("C", StepType::Action).with_config("action", "count_c"),
        ],
    )
    .await;
    let instance = create_instance(&store, &template, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[&first_run])).await;
    engine.queue(&instance.id).unwrap();
    wait_for_step(&store, &instance.id, "pause", |s| s.status == StepStatus::Running).await;
    engine.shutdown().await.unwrap();
    assert_eq!(first_run.runs(), 1);

    // The timer does not survive the restart: the wait is entered again but A is not.
    let second_run = CountingAction::new("count_a");
    let engine = start_engine(store.clone(), registry(&[&second_run])).await;
    wait_for_step(&store, &instance.id, "pause", |s| {
        s.status == StepStatus::Running && s.waiting_for.is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second_run.runs(), 0);

    let stored = store.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Running);
    assert_eq!(stored.current_step.as_deref(), Some("pause"));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_beyond_queue_capacity_finishes_every_instance() {
    let store = memory_store().await;
    let counter = CountingAction::new("count_a");
    let template = insert_template(
        &store,
        vec![StepDefinition::new("A", StepType::Action).with_config("action", "count_a")],
    )
    .await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let instance = create_instance(&store, &template, json!({})).await;
        store.start_instance(&instance.id).await.unwrap();
        ids.push(instance.id);
    }

    let engine = Engine::builder()
        .persistence(store.clone())
        .actions(registry(&[&counter]))
        .queue_capacity(2)
        .max_concurrent_workflows(1)
        .check_interval(Duration::from_millis(50))
        .step_yield(Duration::from_millis(1))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    for id in &ids {
        wait_for_status(&store, id, InstanceStatus::Completed).await;
    }
    assert_eq!(counter.runs(), 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_wake_up_is_retried_by_sweep() {
    let store = memory_store().await;
    let c = CountingAction::new("count_c");
    let template = insert_template(
        &store,
        vec![
            StepDefinition::new("approval", StepType::Wait)
                .with_config("event", "approved")
                .then(["C"]),
            StepDefinition::new("C", StepType::Action).with_config("action", "count_c"),
        ],
    )
    .await;

    // The first sweep lands well after the setup below.
    let engine = Engine::builder()
        .persistence(store.clone())
        .actions(registry(&[&c]))
        .check_interval(Duration::from_millis(300))
        .step_yield(Duration::from_millis(1))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    // A wait resolved in the store whose queue() call never happened.
    let instance = create_instance(&store, &template, json!({})).await;
    store.start_instance(&instance.id).await.unwrap();
    let record = StepRecord::new(&instance.id, "approval", StepType::Wait, JsonMap::new());
    store.insert_step(&record).await.unwrap();
    store.start_step(&record.id).await.unwrap();
    store.set_step_waiting(&record.id, "event:approved").await.unwrap();
    store.set_current_step(&instance.id, "approval").await.unwrap();
    assert!(
        store
            .resolve_waiting_step(
                &instance.id,
                "event:approved",
                &StepResolution::completed(JsonMap::new())
            )
            .await
            .unwrap()
    );

    let done = wait_for_status(&store, &instance.id, InstanceStatus::Completed).await;
    assert_eq!(done.current_step.as_deref(), Some("C"));
    assert_eq!(c.runs(), 1);

    engine.shutdown().await.unwrap();
}
