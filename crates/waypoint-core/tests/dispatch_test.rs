// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Priority ordering and pool isolation of the dispatcher.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use common::*;
use waypoint_core::config::PoolConfig;
use waypoint_core::persistence::InstanceState;
use waypoint_core::{Engine, LaunchOptions};

fn labelled(label: &str) -> LaunchOptions {
    LaunchOptions::new().arg("label", label).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_higher_priority_runs_first() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(AtomicBool::new(false));
    let engine = start_engine(
        file_store(&dir).await,
        registry([recording_workflow(log.clone(), gate.clone())]),
        1,
    )
    .await;

    // Occupy the only worker so everything below queues up.
    let blocker = engine.launch(RECORD_ALIAS, labelled("blocker")).await.unwrap();
    wait_for_state(&engine, &blocker, InstanceState::Running).await;

    let mut ids = Vec::new();
    for (label, priority) in [("p5-first", 5), ("p1", 1), ("p5-second", 5), ("p3", 3)] {
        let id = engine
            .launch(RECORD_ALIAS, labelled(label).priority(priority))
            .await
            .unwrap();
        ids.push(id);
    }

    let pools = engine.monitor().pools().await;
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].queued, 4);
    assert_eq!(pools[0].busy, 1);

    gate.store(true, Ordering::SeqCst);
    for id in &ids {
        wait_for_state(&engine, id, InstanceState::Finished).await;
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec!["blocker", "p5-first", "p5-second", "p3", "p1"]
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pools_do_not_share_workers() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(AtomicBool::new(false));
    let engine = Engine::builder()
        .persistence(file_store(&dir).await)
        .definitions(registry([recording_workflow(log.clone(), gate.clone())]))
        .pools([PoolConfig::new("default", 1), PoolConfig::new("reports", 1)])
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let blocker = engine.launch(RECORD_ALIAS, labelled("blocker")).await.unwrap();
    wait_for_state(&engine, &blocker, InstanceState::Running).await;

    // The busy default pool does not hold back the other one.
    let report = engine
        .launch(RECORD_ALIAS, labelled("report").pool("reports"))
        .await
        .unwrap();
    let view = wait_for_state(&engine, &report, InstanceState::Finished).await;
    assert_eq!(view.pool_id, "reports");
    assert_eq!(
        engine.monitor().instance(&blocker).await.unwrap().state,
        InstanceState::Running
    );

    gate.store(true, Ordering::SeqCst);
    wait_for_state(&engine, &blocker, InstanceState::Finished).await;
    assert_eq!(*log.lock().unwrap(), vec!["report", "blocker"]);

    let pools = engine.monitor().pools().await;
    let ids: Vec<&str> = pools.iter().map(|p| p.pool_id.as_str()).collect();
    assert_eq!(ids, vec!["default", "reports"]);
    assert!(pools.iter().all(|p| p.workers == 1));

    engine.shutdown().await.unwrap();
}
