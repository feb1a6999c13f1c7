// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Suspend/resume across engine restarts.
//!
//! A continuation captured by one engine and restored by another must lead
//! to the same result as a run that never stopped.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tempfile::TempDir;

use common::*;
use waypoint_core::persistence::{InstanceState, NewInstance};
use waypoint_core::{Continuation, LaunchOptions, Locals, Persistence};

fn expected_result(first: serde_json::Value, second: serde_json::Value) -> serde_json::Value {
    json!({
        "aString": "A",
        "bString": "B",
        "localIntValue": 2,
        "first": first,
        "second": second,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_waits_with_early_events() {
    let dir = TempDir::new().unwrap();
    let engine = start_engine(
        file_store(&dir).await,
        registry([compatibility_workflow(CompatVariant::Base)]),
        2,
    )
    .await;

    let id = engine.launch(COMPAT_ALIAS, LaunchOptions::new()).await.unwrap();
    // Both responses may arrive before their waits are registered.
    engine
        .on_event(&compat_correlation_id(&id, "A"), json!("first"))
        .await
        .unwrap();
    engine
        .on_event(&compat_correlation_id(&id, "B"), json!("second"))
        .await
        .unwrap();

    let view = wait_for_state(&engine, &id, InstanceState::Finished).await;
    assert_eq!(view.result, Some(expected_result(json!("first"), json!("second"))));
    assert_eq!(view.version, "1.1.001");

    let events = event_types(&engine, &id).await;
    assert_eq!(events.iter().filter(|e| *e == "waiting").count(), 2);
    assert_eq!(events.iter().filter(|e| *e == "resumed").count(), 2);
    assert_eq!(events.last().map(String::as_str), Some("finished"));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_reproduces_uninterrupted_run() {
    // Both waits time out, so the result does not depend on timing.
    let uninterrupted_dir = TempDir::new().unwrap();
    let engine = start_engine(
        file_store(&uninterrupted_dir).await,
        registry([compatibility_workflow(CompatVariant::Base)]),
        1,
    )
    .await;
    let id = engine.launch(COMPAT_ALIAS, LaunchOptions::new()).await.unwrap();
    let uninterrupted = wait_for_state(&engine, &id, InstanceState::Finished).await;
    engine.shutdown().await.unwrap();

    let dir = TempDir::new().unwrap();
    let first = start_engine(
        file_store(&dir).await,
        registry([compatibility_workflow(CompatVariant::Base)]),
        1,
    )
    .await;
    let id = first.launch(COMPAT_ALIAS, LaunchOptions::new()).await.unwrap();
    wait_for_state(&first, &id, InstanceState::Waiting).await;
    first.shutdown().await.unwrap();

    let second = start_engine(
        file_store(&dir).await,
        registry([compatibility_workflow(CompatVariant::Base)]),
        1,
    )
    .await;
    let resumed = wait_for_state(&second, &id, InstanceState::Finished).await;

    assert_eq!(resumed.result, uninterrupted.result);
    assert_eq!(resumed.result, Some(expected_result(json!(null), json!(null))));

    second.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_responses_survive_restart() {
    let dir = TempDir::new().unwrap();
    let first = start_engine(file_store(&dir).await, registry([collect_workflow()]), 1).await;
    let id = first
        .launch(COLLECT_ALIAS, collect_options("all", &["x", "y"], None))
        .await
        .unwrap();
    wait_for_state(&first, &id, InstanceState::Waiting).await;
    first.on_event("x", json!(1)).await.unwrap();
    first.shutdown().await.unwrap();

    let second = start_engine(file_store(&dir).await, registry([collect_workflow()]), 1).await;
    assert_eq!(second.recovery().responses, 1);
    assert_eq!(
        second.monitor().instance(&id).await.unwrap().state,
        InstanceState::Waiting
    );

    second.on_event("y", json!(2)).await.unwrap();
    let view = wait_for_state(&second, &id, InstanceState::Finished).await;
    assert_eq!(
        view.result,
        Some(json!({
            "kind": "satisfied",
            "payloads": {"x": 1, "y": 2},
            "absent": [],
        }))
    );

    second.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_correlation_id_survives_restart() {
    let dir = TempDir::new().unwrap();
    let first = start_engine(file_store(&dir).await, registry([collect_workflow()]), 1).await;
    let any = first
        .launch(COLLECT_ALIAS, collect_options("any", &["shared"], None))
        .await
        .unwrap();
    let all = first
        .launch(COLLECT_ALIAS, collect_options("all", &["shared", "other"], None))
        .await
        .unwrap();
    wait_for_state(&first, &any, InstanceState::Waiting).await;
    wait_for_state(&first, &all, InstanceState::Waiting).await;

    first.on_event("shared", json!("S")).await.unwrap();
    wait_for_state(&first, &any, InstanceState::Finished).await;
    first.shutdown().await.unwrap();

    let second = start_engine(file_store(&dir).await, registry([collect_workflow()]), 1).await;
    assert_eq!(second.recovery().responses, 1);

    second.on_event("other", json!("O")).await.unwrap();
    let view = wait_for_state(&second, &all, InstanceState::Finished).await;
    assert_eq!(
        view.result,
        Some(json!({
            "kind": "satisfied",
            "payloads": {"shared": "S", "other": "O"},
            "absent": [],
        }))
    );
    assert!(second.persistence().pending_responses().await.unwrap().is_empty());

    second.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_response_is_not_replayed_after_restart() {
    let dir = TempDir::new().unwrap();
    let first = start_engine(file_store(&dir).await, registry([collect_workflow()]), 1).await;
    let id = first
        .launch(COLLECT_ALIAS, collect_options("all", &["d1", "d2"], None))
        .await
        .unwrap();
    wait_for_state(&first, &id, InstanceState::Waiting).await;

    first.on_event("d1", json!(1)).await.unwrap();
    first.on_event("d1", json!(2)).await.unwrap();
    first.on_event("d2", json!(3)).await.unwrap();
    let view = wait_for_state(&first, &id, InstanceState::Finished).await;
    assert_eq!(view.result.unwrap()["payloads"], json!({"d1": 1, "d2": 3}));
    first.shutdown().await.unwrap();

    // The duplicate was dropped in memory, so nothing is left to replay.
    let second = start_engine(file_store(&dir).await, registry([collect_workflow()]), 1).await;
    assert_eq!(second.recovery().responses, 0);

    second.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_running_instance_is_recovered() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;

    let mut args = Locals::new();
    args.insert("label".to_string(), json!("crashed"));
    let continuation = Continuation::start(
        RECORD_ALIAS,
        waypoint_core::Version::new(1, 0, 0),
        "main",
        args,
    );
    store
        .create_instance(&NewInstance {
            instance_id: "crashed".to_string(),
            alias: RECORD_ALIAS.to_string(),
            version: "1.0.000".to_string(),
            priority: 0,
            pool_id: "default".to_string(),
            continuation: serde_json::to_vec(&continuation).unwrap(),
        })
        .await
        .unwrap();
    assert!(store
        .transition_state("crashed", InstanceState::Enqueued, InstanceState::Running)
        .await
        .unwrap());

    let log = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(AtomicBool::new(true));
    let engine = start_engine(store, registry([recording_workflow(log.clone(), gate)]), 1).await;
    assert_eq!(engine.recovery().interrupted, 1);
    assert_eq!(engine.recovery().enqueued, 1);

    let view = wait_for_state(&engine, "crashed", InstanceState::Finished).await;
    assert_eq!(view.result, Some(json!("crashed")));
    assert_eq!(*log.lock().unwrap(), vec!["crashed".to_string()]);
    assert!(event_types(&engine, "crashed")
        .await
        .contains(&"recovered".to_string()));

    engine.shutdown().await.unwrap();
}
