// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subflows: the parent suspends until its child finishes, and the child's
//! outcome becomes the parent step's outcome.

mod common;

use common::*;
use serde_json::json;
use stepflow_core::models::{InstanceStatus, StepDefinition, StepStatus, StepType, Template};

async fn parent_template(
    store: &std::sync::Arc<dyn stepflow_core::persistence::Persistence>,
    child: &Template,
) -> Template {
    insert_template(
        store,
        vec![
            StepDefinition::new("sub", StepType::Subflow)
                .with_config("template_id", child.id.clone())
                .with_config("inherit_variables", true)
                .with_config("variables", json!({"from_parent": true}))
                .then(["after"]),
            StepDefinition::new("after", StepType::Action)
                .with_config("action", "log_message")
                .with_config("message", "parent resumed"),
        ],
    )
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parent_resumes_after_child_completes() {
    let store = memory_store().await;
    let child = insert_template(
        &store,
        vec![
            StepDefinition::new("work", StepType::Action)
                .with_config("action", "update_variables")
                .with_config("updates", json!({"result": "ok"})),
        ],
    )
    .await;
    let parent = parent_template(&store, &child).await;
    let instance = create_instance(&store, &parent, json!({"order": 7})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&instance.id).unwrap();

    let done = wait_for_status(&store, &instance.id, InstanceStatus::Completed).await;
    assert_eq!(done.current_step.as_deref(), Some("after"));

    let sub = store.find_step(&instance.id, "sub").await.unwrap().unwrap();
    assert_eq!(sub.status, StepStatus::Completed);
    assert_eq!(sub.output_data["status"], "completed");

    let child_id = sub.output_data["child_instance_id"].as_str().unwrap().to_string();
    let child_instance = store.get_instance(&child_id).await.unwrap().unwrap();
    assert_eq!(child_instance.status, InstanceStatus::Completed);
    assert_eq!(child_instance.parent_instance_id.as_deref(), Some(instance.id.as_str()));
    assert_eq!(child_instance.variables["order"], 7);
    assert_eq!(child_instance.variables["from_parent"], true);
    assert_eq!(sub.output_data["variables"]["result"], "ok");

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_child_failure_fails_parent() {
    let store = memory_store().await;
    let child = insert_template(
        &store,
        vec![StepDefinition::new("broken", StepType::Action).with_config("action", "nope")],
    )
    .await;
    let parent = parent_template(&store, &child).await;
    let instance = create_instance(&store, &parent, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&instance.id).unwrap();

    let failed = wait_for_status(&store, &instance.id, InstanceStatus::Failed).await;
    let message = failed.error_message.unwrap();
    assert!(message.starts_with("step 'sub' failed: subflow instance"), "{}", message);
    assert!(message.contains("unknown action type: nope"), "{}", message);

    let sub = store.find_step(&instance.id, "sub").await.unwrap().unwrap();
    assert_eq!(sub.status, StepStatus::Failed);
    assert_eq!(sub.output_data["status"], "failed");

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_child_fails_waiting_parent() {
    let store = memory_store().await;
    let child = insert_template(
        &store,
        vec![
            StepDefinition::new("hold", StepType::Wait)
                .with_config("wait_type", "event")
                .with_config("event", "never"),
        ],
    )
    .await;
    let parent = parent_template(&store, &child).await;
    let instance = create_instance(&store, &parent, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&instance.id).unwrap();

    let sub = wait_for_step(&store, &instance.id, "sub", |s| s.is_suspended()).await;
    let child_id = sub
        .waiting_for
        .as_deref()
        .and_then(|k| k.strip_prefix("subflow:"))
        .unwrap()
        .to_string();
    wait_for_step(&store, &child_id, "hold", |s| s.is_suspended()).await;

    assert!(
        store
            .update_instance_status(&child_id, InstanceStatus::Running, InstanceStatus::Cancelled)
            .await
            .unwrap()
    );
    engine.queue(&child_id).unwrap();

    let failed = wait_for_status(&store, &instance.id, InstanceStatus::Failed).await;
    assert!(failed.error_message.unwrap().contains("cancelled"));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_subflow_template_is_configuration_error() {
    let store = memory_store().await;
    let template = insert_template(
        &store,
        vec![StepDefinition::new("sub", StepType::Subflow).with_config("subflow_id", "ghost")],
    )
    .await;
    let instance = create_instance(&store, &template, json!({})).await;

    let engine = start_engine(store.clone(), registry(&[])).await;
    engine.queue(&instance.id).unwrap();

    let failed = wait_for_status(&store, &instance.id, InstanceStatus::Failed).await;
    assert_eq!(
        failed.error_message.as_deref(),
        Some("step 'sub' failed: subflow template 'ghost' not found")
    );

    engine.shutdown().await.unwrap();
}
