// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for waypoint-core integration tests.
//!
//! Provides fixture workflows, file-backed stores and polling helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use waypoint_core::config::PoolConfig;
use waypoint_core::persistence::InstanceState;
use waypoint_core::{
    CallSite, DefinitionRegistry, Engine, InstanceView, LaunchOptions, MethodDef, Persistence,
    SqlitePersistence, Step, Version, WaitRequest, WorkflowDefinition,
};

/// Alias of the version-compatibility fixture.
pub const COMPAT_ALIAS: &str = "compatibility-check";

/// Alias of the wait-collecting fixture.
pub const COLLECT_ALIAS: &str = "collect";

/// Alias of the dispatch-recording fixture.
pub const RECORD_ALIAS: &str = "record";

/// Timeout of the wait inside `directlyWaitingMethod`.
pub const COMPAT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Versions of the compatibility fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatVariant {
    /// 1.1.001: the base version.
    Base,
    /// 1.1.002: a new local in `directlyWaitingMethod` before its wait.
    NewLocalBeforeWait,
    /// 1.1.003: a new local after the last wait and one in a never-waiting helper.
    NewLocalAfterWait,
}

impl CompatVariant {
    pub fn version(self) -> Version {
        match self {
            Self::Base => Version::new(1, 1, 1),
            Self::NewLocalBeforeWait => Version::new(1, 1, 2),
            Self::NewLocalAfterWait => Version::new(1, 1, 3),
        }
    }
}

/// Correlation id the fixture waits on for a given string argument.
pub fn compat_correlation_id(instance_id: &str, str_value: &str) -> String {
    format!("{}-{}", instance_id, str_value)
}

/// The compatibility fixture.
///
/// ```text
/// main
///   -> directlyWaitingMethod("A", 1)
///        -> neverWaitingMethod -> anotherNeverWaitingMethod
///        -> wait(ALL, 500ms, <id>-A)
///   -> indirectlyWaitingMethod("B", 2)
///        -> directlyWaitingMethod("B", 2)
///             -> wait(ALL, 500ms, <id>-B)
/// ```
pub fn compatibility_workflow(variant: CompatVariant) -> WorkflowDefinition {
    let mut waiting_locals = vec!["strValue", "intValue"];
    if variant == CompatVariant::NewLocalBeforeWait {
        waiting_locals.push("NEW_LOCAL_VARIABLE");
    }
    let mut helper_locals = vec!["strValue", "intValue"];
    if variant == CompatVariant::NewLocalAfterWait {
        helper_locals.push("helperOnly");
    }

    WorkflowDefinition::builder(COMPAT_ALIAS, variant.version())
        .entry("main")
        .method(
            MethodDef::new("main", |ctx| {
                if ctx.resumed_after("indirectly") {
                    let second: Value = ctx.returned()?.unwrap_or(Value::Null);
                    let local_int_value: i64 = ctx.get("localIntValue")?;
                    return Ok(Step::returning(&json!({
                        "aString": ctx.field::<String>("aString")?,
                        "bString": ctx.field::<String>("bString")?,
                        "localIntValue": local_int_value,
                        "first": ctx.field::<Value>("first")?,
                        "second": second,
                    }))?);
                }
                if ctx.resumed_after("directly") {
                    let first: Value = ctx.returned()?.unwrap_or(Value::Null);
                    ctx.set_field("first", &first)?;
                    ctx.set_field("bString", "B")?;
                    let local_int_value = ctx.get::<i64>("localIntValue")? + 1;
                    ctx.set("localIntValue", &local_int_value)?;
                    return Ok(Step::call("indirectly", "indirectlyWaitingMethod")
                        .arg("strValue", "B")?
                        .arg("intValue", &local_int_value)?);
                }
                ctx.set_field("aString", "A")?;
                ctx.set("localIntValue", &1)?;
                Ok(Step::call("directly", "directlyWaitingMethod")
                    .arg("strValue", "A")?
                    .arg("intValue", &1)?)
            })
            .site(CallSite::call("directly", "directlyWaitingMethod", ["localIntValue"]))
            .site(CallSite::call("indirectly", "indirectlyWaitingMethod", ["localIntValue"])),
        )
        .method(
            MethodDef::new("directlyWaitingMethod", move |ctx| {
                if ctx.resumed_after("wait") {
                    let str_value: String = ctx.get("strValue")?;
                    let id = compat_correlation_id(ctx.instance_id(), &str_value);
                    let payload = ctx
                        .wait_outcome()
                        .and_then(|o| o.payload(&id))
                        .cloned()
                        .unwrap_or(Value::Null);
                    match variant {
                        CompatVariant::NewLocalBeforeWait => {
                            let marker: String = ctx.get("NEW_LOCAL_VARIABLE")?;
                            tracing::info!(marker = %marker, "after wait");
                        }
                        CompatVariant::NewLocalAfterWait => {
                            ctx.set("afterLastWait", &true)?;
                        }
                        CompatVariant::Base => {}
                    }
                    return Ok(Step::Return(payload));
                }
                if ctx.resumed_after("never") {
                    let str_value: String = ctx.get("strValue")?;
                    let id = compat_correlation_id(ctx.instance_id(), &str_value);
                    return Ok(Step::wait(
                        "wait",
                        WaitRequest::all([id]).with_timeout(COMPAT_WAIT_TIMEOUT),
                    ));
                }
                if variant == CompatVariant::NewLocalBeforeWait {
                    ctx.set("NEW_LOCAL_VARIABLE", "NEW_LOCAL_VARIABLE")?;
                }
                let str_value: String = ctx.get("strValue")?;
                let int_value: i64 = ctx.get("intValue")?;
                Ok(Step::call("never", "neverWaitingMethod")
                    .arg("strValue", &str_value)?
                    .arg("intValue", &int_value)?)
            })
            .site(CallSite::call("never", "neverWaitingMethod", waiting_locals.clone()))
            .site(CallSite::wait("wait", waiting_locals)),
        )
        .method(
            MethodDef::new("indirectlyWaitingMethod", |ctx| {
                if ctx.resumed_after("directly") {
                    let value: Value = ctx.returned()?.unwrap_or(Value::Null);
                    return Ok(Step::Return(value));
                }
                ctx.set("localObject", &10867)?;
                let str_value: String = ctx.get("strValue")?;
                let int_value: i64 = ctx.get("intValue")?;
                Ok(Step::call("directly", "directlyWaitingMethod")
                    .arg("strValue", &str_value)?
                    .arg("intValue", &int_value)?)
            })
            .site(CallSite::call(
                "directly",
                "directlyWaitingMethod",
                ["strValue", "intValue", "localObject"],
            )),
        )
        .method(
            MethodDef::new("neverWaitingMethod", move |ctx| {
                if ctx.resumed_after("another") {
                    return Ok(Step::done());
                }
                if variant == CompatVariant::NewLocalAfterWait {
                    ctx.set("helperOnly", "x")?;
                }
                let str_value: String = ctx.get("strValue")?;
                let int_value: i64 = ctx.get("intValue")?;
                Ok(Step::call("another", "anotherNeverWaitingMethod")
                    .arg("strValue", &str_value)?
                    .arg("intValue", &int_value)?)
            })
            .site(CallSite::call("another", "anotherNeverWaitingMethod", helper_locals)),
        )
        .method(MethodDef::new("anotherNeverWaitingMethod", |ctx| {
            let str_value: String = ctx.get("strValue")?;
            let int_value: i64 = ctx.get("intValue")?;
            tracing::debug!(str_value = %str_value, int_value, "never waiting");
            Ok(Step::done())
        }))
        .build()
        .expect("compatibility fixture is valid")
}

/// Waits once with the mode, ids and timeout given as arguments and returns
/// what it received.
pub fn collect_workflow() -> WorkflowDefinition {
    WorkflowDefinition::builder(COLLECT_ALIAS, Version::new(1, 0, 0))
        .method(
            MethodDef::new("main", |ctx| {
                if ctx.resumed_after("wait") {
                    let outcome = ctx
                        .wait_outcome()
                        .ok_or_else(|| anyhow::anyhow!("resumed without a wait outcome"))?;
                    let payloads: serde_json::Map<String, Value> = outcome
                        .responses
                        .iter()
                        .map(|(id, r)| (id.clone(), r.payload.clone()))
                        .collect();
                    return Ok(Step::returning(&json!({
                        "kind": outcome.kind,
                        "payloads": payloads,
                        "absent": outcome.absent,
                    }))?);
                }
                let mode: String = ctx.get("mode")?;
                let ids: Vec<String> = ctx.get("ids")?;
                let timeout_ms: Option<u64> = ctx.get("timeout_ms")?;
                let mut request = match mode.as_str() {
                    "all" => WaitRequest::all(ids),
                    _ => WaitRequest::any(ids),
                };
                if let Some(ms) = timeout_ms {
                    request = request.with_timeout(Duration::from_millis(ms));
                }
                Ok(Step::wait("wait", request))
            })
            .site(CallSite::wait("wait", ["mode", "ids", "timeout_ms"])),
        )
        .build()
        .expect("collect fixture is valid")
}

/// Launch options for [`collect_workflow`].
pub fn collect_options(mode: &str, ids: &[&str], timeout_ms: Option<u64>) -> LaunchOptions {
    LaunchOptions::new()
        .arg("mode", mode)
        .and_then(|o| o.arg("ids", ids))
        .and_then(|o| o.arg("timeout_ms", &timeout_ms))
        .expect("collect arguments serialize")
}

/// Records the `label` argument of every instance in run order. The
/// instance labelled `blocker` holds its worker until `gate` opens.
pub fn recording_workflow(log: Arc<Mutex<Vec<String>>>, gate: Arc<AtomicBool>) -> WorkflowDefinition {
    WorkflowDefinition::builder(RECORD_ALIAS, Version::new(1, 0, 0))
        .method(MethodDef::new("main", move |ctx| {
            let label: String = ctx.get("label")?;
            if label == "blocker" && !gate.load(Ordering::SeqCst) {
                // Needs the multi-thread runtime.
                tokio::task::block_in_place(|| {
                    let started = Instant::now();
                    while !gate.load(Ordering::SeqCst)
                        && started.elapsed() < Duration::from_secs(10)
                    {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                });
            }
            log.lock().unwrap().push(label.clone());
            Ok(Step::returning(&label)?)
        }))
        .build()
        .expect("recording fixture is valid")
}

/// Registry holding the given definitions.
pub fn registry(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> DefinitionRegistry {
    let mut registry = DefinitionRegistry::new();
    for definition in definitions {
        registry.deploy(definition).expect("fixture deploys");
    }
    registry
}

/// File-backed store inside `dir`; reopening the same dir sees the same data.
pub async fn file_store(dir: &TempDir) -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::from_path(dir.path().join("waypoint.db"))
            .await
            .expect("open sqlite store"),
    )
}

/// Start an engine with a single `default` pool of `workers` workers.
pub async fn start_engine(
    store: Arc<dyn Persistence>,
    definitions: DefinitionRegistry,
    workers: usize,
) -> Engine {
    init_tracing();
    Engine::builder()
        .persistence(store)
        .definitions(definitions)
        .pools([PoolConfig::new("default", workers)])
        .build()
        .expect("engine config")
        .start()
        .await
        .expect("engine start")
}

/// Poll until the instance reaches `state`.
pub async fn wait_for_state(engine: &Engine, instance_id: &str, state: InstanceState) -> InstanceView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = engine
            .monitor()
            .instance(instance_id)
            .await
            .expect("instance exists");
        if view.state == state {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "instance {} stuck in {} waiting for {}",
            instance_id,
            view.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the instance reaches any terminal state.
pub async fn wait_for_terminal(engine: &Engine, instance_id: &str) -> InstanceView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = engine
            .monitor()
            .instance(instance_id)
            .await
            .expect("instance exists");
        if view.state.is_terminal() {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "instance {} never terminated (state {})",
            instance_id,
            view.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Event types of an instance's lifecycle log.
pub async fn event_types(engine: &Engine, instance_id: &str) -> Vec<String> {
    engine
        .monitor()
        .events(instance_id)
        .await
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("waypoint_core=debug")),
        )
        .with_test_writer()
        .try_init();
}
