// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable workflow engine.
//!
//! [`Engine`] wires the store, the definition registry, the wait registry and
//! the processor pools together. It runs inside the host's tokio runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waypoint_core::{DefinitionRegistry, Engine, LaunchOptions, SqlitePersistence};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut definitions = DefinitionRegistry::new();
//!     definitions.deploy(order_workflow()?)?;
//!
//!     let engine = Engine::builder()
//!         .persistence(Arc::new(SqlitePersistence::from_path(".data/waypoint.db").await?))
//!         .definitions(definitions)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let id = engine.launch("order", LaunchOptions::new().priority(5)).await?;
//!     engine.on_event("payment-42", serde_json::json!({"paid": true})).await?;
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Instance lifecycle
//!
//! 1. `launch` stores an ENQUEUED instance and queues it on its pool.
//! 2. A worker claims it (ENQUEUED -> RUNNING), restores the continuation
//!    through the compatibility gate and runs it to the next wait.
//! 3. At a wait the continuation is captured and the instance is suspended
//!    (RUNNING -> WAITING) before the condition reaches the wait registry.
//! 4. A resolution moves it back to ENQUEUED with the outcome attached.
//!
//! Every transition is a compare-and-set in the store, so an instance reaches
//! its terminal state exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::capture;
use crate::config::{Config, DEFAULT_POOL, PoolConfig};
use crate::continuation::{Continuation, Locals, Response, Resumption, WaitRequest};
use crate::definition::{DefinitionRegistry, Deployed};
use crate::dispatcher::{Dispatcher, InstanceRunner};
use crate::error::{EngineError, Result};
use crate::executor::{DEFAULT_MAX_STEPS, Executor, SegmentOutcome};
use crate::monitor::Monitor;
use crate::persistence::{
    Completion, InstanceFilter, InstanceState, NewInstance, Persistence, WaitRecord,
};
use crate::retry::{RetryConfig, with_retry};
use crate::wait_registry::{ResolvedWait, WaitCondition, WaitRegistry};

/// Lower bound on how often stored responses are checked for expiry.
const MIN_PRUNE_INTERVAL: Duration = Duration::from_millis(50);

/// Options for starting a new instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    /// Dispatch priority (higher first).
    pub priority: i64,
    /// Processor pool to run on.
    pub pool_id: String,
    /// Initial locals of the entry method.
    pub args: Locals,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            pool_id: DEFAULT_POOL.to_string(),
            args: Locals::new(),
        }
    }
}

impl LaunchOptions {
    /// Defaults: priority 0 on the default pool, no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatch priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the processor pool.
    pub fn pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = pool_id.into();
        self
    }

    /// Add an argument for the entry method.
    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| EngineError::serialization(format!("argument '{}'", name), e))?;
        self.args.insert(name.to_string(), value);
        Ok(self)
    }
}

/// What startup recovery found in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// RUNNING instances interrupted by a crash and re-queued.
    pub interrupted: usize,
    /// ENQUEUED instances handed to their pools.
    pub enqueued: usize,
    /// ENQUEUED instances whose pool is not configured (moved to ERROR).
    pub rejected: usize,
    /// Pending waits re-registered.
    pub waits: usize,
    /// Unconsumed responses replayed.
    pub responses: usize,
    /// Buffered responses dropped as expired.
    pub expired_responses: u64,
}

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    definitions: DefinitionRegistry,
    pools: Vec<PoolConfig>,
    retry: RetryConfig,
    early_response_ttl: Duration,
    max_steps: usize,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("definitions", &self.definitions)
            .field("pools", &self.pools)
            .field("retry", &self.retry)
            .field("early_response_ttl", &self.early_response_ttl)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            definitions: DefinitionRegistry::new(),
            pools: vec![PoolConfig::new(DEFAULT_POOL, 4)],
            retry: RetryConfig::default(),
            early_response_ttl: Duration::from_secs(300),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take pools, retry policy and response TTL from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self::default()
            .pools(config.pools.clone())
            .retry(config.store_retry)
            .early_response_ttl(config.early_response_ttl)
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the deployed definitions.
    pub fn definitions(mut self, definitions: DefinitionRegistry) -> Self {
        self.definitions = definitions;
        self
    }

    /// Replace the processor pools.
    ///
    /// Default: one pool named `default` with 4 workers.
    pub fn pools(mut self, pools: impl IntoIterator<Item = PoolConfig>) -> Self {
        self.pools = pools.into_iter().collect();
        self
    }

    /// Set the retry policy for store operations.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// How long responses nobody waits for are kept.
    ///
    /// Default: 5 minutes
    pub fn early_response_ttl(mut self, ttl: Duration) -> Self {
        self.early_response_ttl = ttl;
        self
    }

    /// Upper bound on method segments per run.
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Build the engine configuration.
    ///
    /// Returns an error if required fields are missing or the pools are
    /// inconsistent.
    pub fn build(self) -> anyhow::Result<EngineConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        if self.pools.is_empty() {
            anyhow::bail!("at least one processor pool is required");
        }
        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.id.as_str()) {
                anyhow::bail!("duplicate processor pool '{}'", pool.id);
            }
            if pool.workers == 0 {
                anyhow::bail!("processor pool '{}' needs at least one worker", pool.id);
            }
        }

        Ok(EngineConfig {
            persistence,
            definitions: Arc::new(self.definitions),
            pools: self.pools,
            retry: self.retry,
            early_response_ttl: self.early_response_ttl,
            max_steps: self.max_steps.max(1),
        })
    }
}

/// Configuration for an [`Engine`].
pub struct EngineConfig {
    persistence: Arc<dyn Persistence>,
    definitions: Arc<DefinitionRegistry>,
    pools: Vec<PoolConfig>,
    retry: RetryConfig,
    early_response_ttl: Duration,
    max_steps: usize,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("persistence", &"...")
            .field("pools", &self.pools)
            .field("retry", &self.retry)
            .field("early_response_ttl", &self.early_response_ttl)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl EngineConfig {
    /// Recover the store, then start the wait registry, the resolution loop
    /// and every pool's workers.
    pub async fn start(self) -> anyhow::Result<Engine> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();

        let (waits, registry_handle) =
            WaitRegistry::spawn(self.early_response_ttl, resolved_tx, shutdown_rx.clone());
        let dispatcher = Arc::new(Dispatcher::new(&self.pools));

        let core = Arc::new(EngineCore {
            store: self.persistence,
            definitions: self.definitions,
            waits,
            dispatcher: dispatcher.clone(),
            retry: self.retry,
            max_steps: self.max_steps,
            early_response_ttl: self.early_response_ttl,
        });

        let recovery = core.recover().await?;

        let mut handles = vec![registry_handle];
        handles.push(tokio::spawn(resolution_loop(
            core.clone(),
            resolved_rx,
            shutdown_rx.clone(),
        )));
        handles.extend(dispatcher.start(core.clone(), shutdown_rx));

        info!(
            pools = self.pools.len(),
            recovered = recovery.interrupted + recovery.enqueued + recovery.waits,
            "Engine started"
        );

        Ok(Engine {
            monitor: Monitor::with_dispatcher(core.store.clone(), dispatcher),
            core,
            shutdown_tx,
            handles,
            recovery,
        })
    }
}

/// A running engine.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; running
/// segments finish first.
pub struct Engine {
    core: Arc<EngineCore>,
    monitor: Monitor,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Start a new instance of the newest deployed version of `alias`.
    #[instrument(skip(self, options), fields(priority = options.priority, pool_id = %options.pool_id))]
    pub async fn launch(&self, alias: &str, options: LaunchOptions) -> Result<String> {
        let core = &self.core;
        let deployed = core
            .definitions
            .latest(alias)
            .ok_or_else(|| EngineError::DefinitionNotFound {
                alias: alias.to_string(),
                version: None,
            })?;
        if !core.dispatcher.has_pool(&options.pool_id) {
            return Err(EngineError::UnknownPool {
                pool_id: options.pool_id,
            });
        }

        let definition = &deployed.definition;
        let continuation = Continuation::start(
            alias,
            definition.version(),
            definition.entry(),
            options.args,
        );
        let instance = NewInstance {
            instance_id: Uuid::new_v4().to_string(),
            alias: alias.to_string(),
            version: definition.version().to_string(),
            priority: options.priority,
            pool_id: options.pool_id,
            continuation: serde_json::to_vec(&continuation)?,
        };

        let store = &core.store;
        let new = &instance;
        with_retry("create_instance", &core.retry, move || {
            store.create_instance(new)
        })
        .await?;

        core.dispatcher
            .enqueue(&instance.pool_id, &instance.instance_id, instance.priority)
            .await?;

        info!(instance_id = %instance.instance_id, version = %instance.version, "Instance launched");
        Ok(instance.instance_id)
    }

    /// Deliver a response for a correlation id.
    ///
    /// The response is stored before it reaches the wait registry, so it
    /// survives a restart until a wait consumes it or it expires.
    #[instrument(skip(self, payload))]
    pub async fn on_event(&self, correlation_id: &str, payload: serde_json::Value) -> Result<()> {
        let response = Response {
            correlation_id: correlation_id.to_string(),
            payload,
            received_at: Utc::now(),
        };
        let store = &self.core.store;
        let saved = &response;
        with_retry("save_response", &self.core.retry, move || {
            store.save_response(saved)
        })
        .await?;
        self.core.waits.event(response)
    }

    /// Time out an instance's pending wait now.
    pub fn on_timeout(&self, instance_id: &str) -> Result<()> {
        self.core.waits.timeout(instance_id)
    }

    /// Request termination of an instance.
    ///
    /// A waiting instance resolves as cancelled and unwinds without running
    /// workflow code; a queued or running one is finished as cancelled the
    /// next time it would run.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: &str) -> Result<()> {
        let store = &self.core.store;
        let state = with_retry("request_cancel", &self.core.retry, move || {
            store.request_cancel(instance_id)
        })
        .await?
        .ok_or_else(|| EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })?;

        if state.is_terminal() {
            return Err(EngineError::InvalidState {
                instance_id: instance_id.to_string(),
                expected: "non-terminal".to_string(),
                actual: state.to_string(),
            });
        }
        if state == InstanceState::Waiting {
            self.core.waits.cancel(instance_id)?;
        }
        info!(%state, "Cancellation requested");
        Ok(())
    }

    /// Read-only query surface.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Deployed definitions.
    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.core.definitions
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.core.store
    }

    /// What startup recovery did.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Gracefully shut down the engine.
    ///
    /// Stops the wait registry and the resolution loop, lets every worker
    /// finish its current segment and waits for all tasks. State left in
    /// the store is picked up by the next start.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Engine shutting down...");

        // Signal shutdown
        let _ = self.shutdown_tx.send(true);

        let mut panicked = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Engine task panicked: {}", e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            anyhow::bail!("{} engine task(s) panicked", panicked);
        }
        info!("Engine shutdown complete");
        Ok(())
    }
}

struct EngineCore {
    store: Arc<dyn Persistence>,
    definitions: Arc<DefinitionRegistry>,
    waits: WaitRegistry,
    dispatcher: Arc<Dispatcher>,
    retry: RetryConfig,
    max_steps: usize,
    early_response_ttl: Duration,
}

#[async_trait]
impl InstanceRunner for EngineCore {
    async fn run(&self, instance_id: String) {
        if let Err(e) = self.execute(&instance_id).await {
            error!(instance_id = %instance_id, error = %e, code = e.error_code(), "Instance failed");
            self.fail(&instance_id, &e).await;
        }
    }
}

impl EngineCore {
    /// Run one segment: claim, restore, execute, then finish or suspend.
    async fn execute(&self, instance_id: &str) -> Result<()> {
        let store = &self.store;

        let claimed = with_retry("claim", &self.retry, move || {
            store.transition_state(instance_id, InstanceState::Enqueued, InstanceState::Running)
        })
        .await?;
        if !claimed {
            debug!(instance_id, "Instance is no longer enqueued, skipping");
            return Ok(());
        }

        let record = with_retry("get_instance", &self.retry, move || {
            store.get_instance(instance_id)
        })
        .await?
        .ok_or_else(|| EngineError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })?;

        if record.cancel_requested {
            self.terminate(instance_id, InstanceState::Running, &Completion::cancelled())
                .await?;
            return Ok(());
        }

        let stored = with_retry("load_continuation", &self.retry, move || {
            store.load_continuation(instance_id)
        })
        .await?
        .ok_or_else(|| EngineError::serialization("restore", "no continuation stored"))?;

        let (mut continuation, deployed) =
            match capture::restore(instance_id, &stored.data, &self.definitions) {
                Ok(restored) => restored,
                Err(
                    e @ (EngineError::IncompatibleVersion { .. }
                    | EngineError::DefinitionNotFound { .. }),
                ) => {
                    warn!(instance_id, error = %e, "Continuation rejected, instance is invalid");
                    self.terminate(instance_id, InstanceState::Running, &Completion::invalid(&e))
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

        let version = continuation.version.to_string();
        if version != record.version {
            let upgraded = version.as_str();
            with_retry("update_version", &self.retry, move || {
                store.update_version(instance_id, upgraded)
            })
            .await?;
        }

        let resumption = stored
            .wait_outcome
            .map(Resumption::Waited)
            .unwrap_or(Resumption::Start);

        let outcome = Executor::new(&deployed.definition)
            .with_max_steps(self.max_steps)
            .run(instance_id, &mut continuation, resumption)?;

        match outcome {
            SegmentOutcome::Finished(value) => {
                self.terminate(instance_id, InstanceState::Running, &Completion::finished(value))
                    .await?;
            }
            SegmentOutcome::InterruptedForWait(request) => {
                self.suspend(instance_id, &deployed, &continuation, request)
                    .await?;
            }
        }
        Ok(())
    }

    /// Capture, persist and register a wait. The store write happens before
    /// registration, so a resolution never precedes its suspension.
    async fn suspend(
        &self,
        instance_id: &str,
        deployed: &Deployed,
        continuation: &Continuation,
        request: WaitRequest,
    ) -> Result<()> {
        let bytes = capture::capture(deployed, continuation)?;

        let deadline = match request.timeout {
            Some(timeout) => Some(
                chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .ok_or_else(|| EngineError::InvalidWait {
                        reason: format!("timeout {:?} is out of range", timeout),
                    })?,
            ),
            None => None,
        };
        let wait = WaitRecord {
            instance_id: instance_id.to_string(),
            mode: request.mode,
            correlation_ids: request.correlation_ids,
            deadline,
        };

        let store = &self.store;
        let version = continuation.version.to_string();
        let (version, bytes, record) = (version.as_str(), bytes.as_slice(), &wait);
        let suspended = with_retry("suspend", &self.retry, move || {
            store.suspend(instance_id, version, bytes, record)
        })
        .await?;
        if !suspended {
            warn!(instance_id, "Instance left RUNNING during its segment, dropping capture");
            return Ok(());
        }

        info!(
            instance_id,
            mode = wait.mode.as_str(),
            correlation_ids = ?wait.correlation_ids,
            deadline = ?wait.deadline,
            "Instance waiting"
        );

        if let Err(e) = self.waits.register(wait_condition(&wait)) {
            // The wait is durable; the next start registers it again.
            warn!(instance_id, error = %e, "Wait registry unavailable");
            return Ok(());
        }

        // A cancel that arrived while the segment ran only set the flag.
        let cancel_requested = with_retry("get_instance", &self.retry, move || {
            store.get_instance(instance_id)
        })
        .await?
        .is_some_and(|r| r.cancel_requested);
        if cancel_requested && let Err(e) = self.waits.cancel(instance_id) {
            warn!(instance_id, error = %e, "Wait registry unavailable");
        }
        Ok(())
    }

    /// Move an instance to a terminal state if it is still in `from`.
    async fn terminate(
        &self,
        instance_id: &str,
        from: InstanceState,
        completion: &Completion,
    ) -> Result<bool> {
        let store = &self.store;
        let done = with_retry("complete", &self.retry, move || {
            store.complete(instance_id, from, completion)
        })
        .await?;

        if done {
            info!(
                instance_id,
                state = %completion.state,
                reason = completion.reason.as_deref().unwrap_or("completed"),
                "Instance terminated"
            );
        } else {
            debug!(instance_id, from = %from, "Instance already left state, completion skipped");
        }
        Ok(done)
    }

    /// Escalate an unrecovered fault to ERROR.
    async fn fail(&self, instance_id: &str, error: &EngineError) {
        let completion = Completion::failed(error);
        for from in [InstanceState::Running, InstanceState::Enqueued] {
            match self.terminate(instance_id, from, &completion).await {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    error!(instance_id, error = %e, "Failed to record instance error");
                    return;
                }
            }
        }
    }

    /// Persist a resolution and queue the instance again.
    async fn apply_resolution(&self, resolved: ResolvedWait) {
        let ResolvedWait {
            instance_id,
            outcome,
            consumed,
        } = resolved;
        let store = &self.store;
        let (id, outcome, consumed) = (instance_id.as_str(), &outcome, &consumed);

        match with_retry("resolve_wait", &self.retry, move || {
            store.resolve_wait(id, outcome, consumed)
        })
        .await
        {
            Ok(true) => self.requeue(id).await,
            Ok(false) => {
                debug!(instance_id = id, "Resolution race: wait already resolved in store, ignoring");
            }
            Err(e) => {
                error!(instance_id = id, error = %e, "Failed to persist wait resolution");
                if let Err(e) = self
                    .terminate(id, InstanceState::Waiting, &Completion::failed(&e))
                    .await
                {
                    error!(instance_id = id, error = %e, "Failed to record instance error");
                }
            }
        }
    }

    async fn requeue(&self, instance_id: &str) {
        let store = &self.store;
        let record = match with_retry("get_instance", &self.retry, move || {
            store.get_instance(instance_id)
        })
        .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                // Still ENQUEUED in the store; recovery queues it on the next start.
                error!(instance_id, error = %e, "Failed to load resumed instance");
                return;
            }
        };
        if let Err(e) = self
            .dispatcher
            .enqueue(&record.pool_id, instance_id, record.priority)
            .await
        {
            self.fail(instance_id, &e).await;
        }
    }

    /// Delete stored responses older than the early-response TTL that no
    /// pending wait references.
    async fn prune_responses(&self) -> Result<u64> {
        let Ok(ttl) = chrono::Duration::from_std(self.early_response_ttl) else {
            return Ok(0);
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return Ok(0);
        };
        let store = &self.store;
        with_retry("delete_responses_before", &self.retry, move || {
            store.delete_responses_before(cutoff)
        })
        .await
    }

    /// Bring the in-memory state in line with the store after a restart.
    async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let store = &self.store;

        report.expired_responses = self.prune_responses().await?;

        let running = store
            .list_instances(&InstanceFilter {
                state: Some(InstanceState::Running),
                ..Default::default()
            })
            .await?;
        for record in running {
            // Re-executes from the last wait boundary.
            if store
                .transition_state(&record.instance_id, InstanceState::Running, InstanceState::Enqueued)
                .await?
            {
                store
                    .append_event(&record.instance_id, "recovered", Some("interrupted while running"))
                    .await?;
                report.interrupted += 1;
            }
        }

        let enqueued = store
            .list_instances(&InstanceFilter {
                state: Some(InstanceState::Enqueued),
                ..Default::default()
            })
            .await?;
        for record in enqueued {
            match self
                .dispatcher
                .enqueue(&record.pool_id, &record.instance_id, record.priority)
                .await
            {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    warn!(instance_id = %record.instance_id, error = %e, "Cannot queue recovered instance");
                    self.terminate(&record.instance_id, InstanceState::Enqueued, &Completion::failed(&e))
                        .await?;
                    report.rejected += 1;
                }
            }
        }

        for wait in store.list_waits().await? {
            self.waits.register(wait_condition(&wait))?;
            report.waits += 1;
        }

        let cancelled = store
            .list_instances(&InstanceFilter {
                state: Some(InstanceState::Waiting),
                ..Default::default()
            })
            .await?;
        for record in cancelled.iter().filter(|r| r.cancel_requested) {
            self.waits.cancel(record.instance_id.as_str())?;
        }

        for response in store.pending_responses().await? {
            self.waits.event(response)?;
            report.responses += 1;
        }

        info!(
            interrupted = report.interrupted,
            enqueued = report.enqueued,
            rejected = report.rejected,
            waits = report.waits,
            responses = report.responses,
            expired_responses = report.expired_responses,
            "Recovery complete"
        );
        Ok(report)
    }
}

/// Convert a stored wait into a registry condition. Deadlines already in the
/// past fire on the registry's next tick.
fn wait_condition(wait: &WaitRecord) -> WaitCondition {
    let now = tokio::time::Instant::now();
    let deadline = wait.deadline.map(|deadline| {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        now.checked_add(remaining).unwrap_or(now)
    });
    WaitCondition {
        instance_id: wait.instance_id.clone(),
        mode: wait.mode,
        deadline,
        correlation_ids: wait.correlation_ids.clone(),
    }
}

async fn resolution_loop(
    core: Arc<EngineCore>,
    mut resolved_rx: mpsc::UnboundedReceiver<ResolvedWait>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = core.early_response_ttl.max(MIN_PRUNE_INTERVAL);
    let mut prune = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Resolution loop received shutdown signal");
                    break;
                }
            }

            resolved = resolved_rx.recv() => {
                match resolved {
                    Some(resolved) => core.apply_resolution(resolved).await,
                    None => break,
                }
            }

            _ = prune.tick() => {
                match core.prune_responses().await {
                    Ok(0) => {}
                    Ok(deleted) => debug!(deleted, "Expired stored responses"),
                    Err(e) => warn!(error = %e, "Failed to expire stored responses"),
                }
            }
        }
    }
}
