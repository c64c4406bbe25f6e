// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait steps: event suspension, trigger delivery, duration sleeps.

mod common;

use std::time::{Duration, Instant};

use common::*;
use serde_json::json;
use stepflow_core::events::WorkflowEvent;
use stepflow_core::models::{InstanceStatus, StepDefinition, StepStatus, StepType};

fn approval_steps() -> Vec<StepDefinition> {
    vec![
        StepDefinition::new("approval", StepType::Wait)
            .with_config("wait_type", "event")
            .with_config("event", "order_approved")
            .then(["ship"]),
        StepDefinition::new("ship", StepType::Action)
            .with_config("action", "log_message")
            .with_config("message", "shipping"),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_for_event_blocks_until_published() {
    let store = memory_store().await;
    let template = insert_template(&store, approval_steps()).await;
    let instance = create_instance(&store, &template, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&instance.id).unwrap();

    let waiting = wait_for_step(&store, &instance.id, "approval", |s| s.is_suspended()).await;
    assert_eq!(waiting.waiting_for.as_deref(), Some("event:order_approved"));

    // Unrelated wake-ups and several sweeps do not advance it.
    engine.queue(&instance.id).unwrap();
    engine
        .event_bus()
        .publish(&WorkflowEvent::triggered("something_else").for_instance(&instance.id))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let still = store.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(still.status, InstanceStatus::Running);
    assert_eq!(still.current_step.as_deref(), Some("approval"));
    assert!(!engine.is_running(&instance.id), "suspended instance must not hold a worker");

    let mut payload = stepflow_core::models::JsonMap::new();
    payload.insert("approved_by".to_string(), json!("ops"));
    engine
        .event_bus()
        .publish(
            &WorkflowEvent::triggered("order_approved")
                .for_instance(&instance.id)
                .with_data(payload),
        )
        .await
        .unwrap();

    let done = wait_for_status(&store, &instance.id, InstanceStatus::Completed).await;
    assert_eq!(done.current_step.as_deref(), Some("ship"));

    let approval = store.find_step(&instance.id, "approval").await.unwrap().unwrap();
    assert_eq!(approval.status, StepStatus::Completed);
    assert_eq!(approval.output_data["approved_by"], "ops");
    assert!(approval.waiting_for.is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_event_wakes_all_waiting_instances() {
    let store = memory_store().await;
    let template = insert_template(&store, approval_steps()).await;
    let first = create_instance(&store, &template, json!({})).await;
    let second = create_instance(&store, &template, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&first.id).unwrap();
    engine.queue(&second.id).unwrap();

    wait_for_step(&store, &first.id, "approval", |s| s.is_suspended()).await;
    wait_for_step(&store, &second.id, "approval", |s| s.is_suspended()).await;

    engine
        .event_bus()
        .publish(&WorkflowEvent::triggered("order_approved"))
        .await
        .unwrap();

    wait_for_status(&store, &first.id, InstanceStatus::Completed).await;
    wait_for_status(&store, &second.id, InstanceStatus::Completed).await;

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duration_wait_sleeps_then_continues() {
    let store = memory_store().await;
    let template = insert_template(
        &store,
        vec![
            StepDefinition::new("pause", StepType::Wait)
                .with_config("duration", 0.2)
                .then(["after"]),
            StepDefinition::new("after", StepType::Action)
                .with_config("action", "log_message")
                .with_config("message", "done"),
        ],
    )
    .await;
    let instance = create_instance(&store, &template, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    let started = Instant::now();
    engine.queue(&instance.id).unwrap();

    wait_for_status(&store, &instance.id, InstanceStatus::Completed).await;
    assert!(started.elapsed() >= Duration::from_millis(200));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_interrupts_duration_wait() {
    let store = memory_store().await;
    let template = insert_template(
        &store,
        vec![StepDefinition::new("pause", StepType::Wait).with_config("duration", 3600)],
    )
    .await;
    let instance = create_instance(&store, &template, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&instance.id).unwrap();
    wait_for_step(&store, &instance.id, "pause", |s| s.status == StepStatus::Running).await;

    tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .expect("shutdown must not wait for the timer")
        .unwrap();

    // Left resumable: instance running, step running.
    let instance = store.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    let pause = store.find_step(&instance.id, "pause").await.unwrap().unwrap();
    assert_eq!(pause.status, StepStatus::Running);
}
