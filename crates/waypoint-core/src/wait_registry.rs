// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait registry and resolver.
//!
//! All pending wait conditions are owned by one actor task. Registrations,
//! incoming responses, timeouts and cancellations arrive as commands on a
//! channel and are applied one at a time to a [`WaitTable`], so no condition
//! can be resolved twice. Each resolution is emitted exactly once on the
//! resolved channel; anything arriving for an already-resolved condition is
//! a no-op.
//!
//! ```text
//!   register ---> PENDING ---(ALL: every id / ANY: first id)---> SATISFIED
//!                    |------(deadline or on_timeout)----------> TIMED_OUT
//!                    +------(cancel)--------------------------> CANCELLED
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::continuation::{OutcomeKind, Response, WaitMode, WaitOutcome};
use crate::error::{EngineError, Result};

/// A wait handed to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitCondition {
    /// Waiting instance.
    pub instance_id: String,
    /// ALL or ANY.
    pub mode: WaitMode,
    /// When the wait times out.
    pub deadline: Option<Instant>,
    /// Expected correlation ids.
    pub correlation_ids: Vec<String>,
}

/// A wait that left the pending state.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWait {
    /// Instance to resume.
    pub instance_id: String,
    /// What the instance resumes with.
    pub outcome: WaitOutcome,
    /// Latest `received_at` per correlation id delivered to this wait,
    /// duplicates included. Stored responses up to these marks are consumed.
    pub consumed: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug)]
struct PendingWait {
    mode: WaitMode,
    correlation_ids: Vec<String>,
    deadline: Option<Instant>,
    received: BTreeMap<String, Response>,
    consumed: BTreeMap<String, DateTime<Utc>>,
}

impl PendingWait {
    fn is_satisfied(&self) -> bool {
        match self.mode {
            WaitMode::All => self.received.len() == self.correlation_ids.len(),
            WaitMode::Any => !self.received.is_empty(),
        }
    }

    /// Record a delivery. The first response per id is the one kept.
    fn deliver(&mut self, response: &Response) {
        let mark = self
            .consumed
            .entry(response.correlation_id.clone())
            .or_insert(response.received_at);
        *mark = (*mark).max(response.received_at);
        self.received
            .entry(response.correlation_id.clone())
            .or_insert_with(|| response.clone());
    }

    fn into_resolved(self, instance_id: String, kind: OutcomeKind) -> ResolvedWait {
        let absent = self
            .correlation_ids
            .iter()
            .filter(|id| !self.received.contains_key(id.as_str()))
            .cloned()
            .collect();
        ResolvedWait {
            instance_id,
            outcome: WaitOutcome {
                kind,
                responses: self.received,
                absent,
            },
            consumed: self.consumed,
        }
    }
}

/// Pending conditions, the correlation-id index and the early-response
/// buffer. Pure state: time is passed in by the caller.
#[derive(Debug)]
pub struct WaitTable {
    pending: HashMap<String, PendingWait>,
    by_correlation: HashMap<String, BTreeSet<String>>,
    early: HashMap<String, VecDeque<(Instant, Response)>>,
    early_ttl: Duration,
}

impl WaitTable {
    /// Create an empty table keeping unmatched responses for `early_ttl`.
    pub fn new(early_ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            by_correlation: HashMap::new(),
            early: HashMap::new(),
            early_ttl,
        }
    }

    /// Number of pending conditions.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of buffered early responses.
    pub fn early_len(&self) -> usize {
        self.early.values().map(VecDeque::len).sum()
    }

    /// True if the instance has a pending condition.
    pub fn is_pending(&self, instance_id: &str) -> bool {
        self.pending.contains_key(instance_id)
    }

    /// Add a condition. Buffered responses for its ids are consumed first, so
    /// the condition may resolve immediately.
    pub fn register(&mut self, condition: WaitCondition, now: Instant) -> Option<ResolvedWait> {
        let WaitCondition {
            instance_id,
            mode,
            deadline,
            correlation_ids,
        } = condition;

        if self.remove(&instance_id).is_some() {
            warn!(instance_id = %instance_id, "Replacing pending wait condition");
        }

        let mut wait = PendingWait {
            mode,
            correlation_ids,
            deadline,
            received: BTreeMap::new(),
            consumed: BTreeMap::new(),
        };

        for id in &wait.correlation_ids.clone() {
            if let Some(response) = self.take_early(id, now) {
                debug!(
                    instance_id = %instance_id,
                    correlation_id = %id,
                    "Consumed early response"
                );
                wait.deliver(&response);
            }
        }

        if wait.is_satisfied() {
            return Some(wait.into_resolved(instance_id, OutcomeKind::Satisfied));
        }

        for id in &wait.correlation_ids {
            self.by_correlation
                .entry(id.clone())
                .or_default()
                .insert(instance_id.clone());
        }
        self.pending.insert(instance_id, wait);
        None
    }

    /// Deliver a response to every condition referencing its correlation id,
    /// or buffer it if none does.
    pub fn on_event(&mut self, response: Response, now: Instant) -> Vec<ResolvedWait> {
        let Some(waiting) = self.by_correlation.get(&response.correlation_id).cloned() else {
            debug!(correlation_id = %response.correlation_id, "Buffering early response");
            self.early
                .entry(response.correlation_id.clone())
                .or_default()
                .push_back((now, response));
            return Vec::new();
        };

        let mut resolved = Vec::new();
        for instance_id in waiting {
            let Some(wait) = self.pending.get_mut(&instance_id) else {
                continue;
            };
            wait.deliver(&response);
            if wait.is_satisfied()
                && let Some(wait) = self.remove(&instance_id)
            {
                resolved.push(wait.into_resolved(instance_id, OutcomeKind::Satisfied));
            }
        }
        resolved
    }

    /// Time out a condition, handing over whatever arrived so far.
    pub fn on_timeout(&mut self, instance_id: &str) -> Option<ResolvedWait> {
        self.finish(instance_id, OutcomeKind::TimedOut)
    }

    /// Resolve a condition as cancelled.
    pub fn cancel(&mut self, instance_id: &str) -> Option<ResolvedWait> {
        self.finish(instance_id, OutcomeKind::Cancelled)
    }

    /// Earliest instant [`WaitTable::expire_due`] has work to do: a pending
    /// deadline or the expiry of a buffered response.
    pub fn next_deadline(&self) -> Option<Instant> {
        let deadlines = self.pending.values().filter_map(|w| w.deadline);
        // Queues are in arrival order, so the front expires first.
        let expiries = self
            .early
            .values()
            .filter_map(|queue| queue.front())
            .map(|(at, _)| *at + self.early_ttl);
        deadlines.chain(expiries).min()
    }

    /// Time out every condition whose deadline has passed and drop expired
    /// early responses.
    pub fn expire_due(&mut self, now: Instant) -> Vec<ResolvedWait> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, w)| w.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let ttl = self.early_ttl;
        self.early.retain(|_, queue| {
            queue.retain(|(at, _)| now.saturating_duration_since(*at) < ttl);
            !queue.is_empty()
        });

        due.iter()
            .filter_map(|id| self.finish(id, OutcomeKind::TimedOut))
            .collect()
    }

    fn finish(&mut self, instance_id: &str, kind: OutcomeKind) -> Option<ResolvedWait> {
        match self.remove(instance_id) {
            Some(wait) => Some(wait.into_resolved(instance_id.to_string(), kind)),
            None => {
                debug!(
                    instance_id,
                    trigger = ?kind,
                    "Resolution race: no pending wait, ignoring"
                );
                None
            }
        }
    }

    fn remove(&mut self, instance_id: &str) -> Option<PendingWait> {
        let wait = self.pending.remove(instance_id)?;
        for id in &wait.correlation_ids {
            if let Some(instances) = self.by_correlation.get_mut(id) {
                instances.remove(instance_id);
                if instances.is_empty() {
                    self.by_correlation.remove(id);
                }
            }
        }
        Some(wait)
    }

    fn take_early(&mut self, correlation_id: &str, now: Instant) -> Option<Response> {
        let queue = self.early.get_mut(correlation_id)?;
        let mut found = None;
        while let Some((at, response)) = queue.pop_front() {
            if now.saturating_duration_since(at) < self.early_ttl {
                found = Some(response);
                break;
            }
        }
        if queue.is_empty() {
            self.early.remove(correlation_id);
        }
        found
    }
}

#[derive(Debug)]
enum Command {
    Register(WaitCondition),
    Event(Response),
    Timeout(String),
    Cancel(String),
}

/// Handle to the registry actor.
#[derive(Debug, Clone)]
pub struct WaitRegistry {
    tx: mpsc::UnboundedSender<Command>,
}

impl WaitRegistry {
    /// Spawn the actor. Resolutions are sent on `resolved`; the actor stops
    /// when `shutdown` flips to true or every handle is dropped.
    pub fn spawn(
        early_ttl: Duration,
        resolved: mpsc::UnboundedSender<ResolvedWait>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(WaitTable::new(early_ttl), rx, resolved, shutdown));
        (Self { tx }, handle)
    }

    /// Register a pending wait.
    pub fn register(&self, condition: WaitCondition) -> Result<()> {
        self.send(Command::Register(condition))
    }

    /// Deliver a response.
    pub fn event(&self, response: Response) -> Result<()> {
        self.send(Command::Event(response))
    }

    /// Force the timeout of an instance's wait.
    pub fn timeout(&self, instance_id: impl Into<String>) -> Result<()> {
        self.send(Command::Timeout(instance_id.into()))
    }

    /// Resolve an instance's wait as cancelled.
    pub fn cancel(&self, instance_id: impl Into<String>) -> Result<()> {
        self.send(Command::Cancel(instance_id.into()))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| EngineError::Shutdown)
    }
}

async fn run(
    mut table: WaitTable,
    mut rx: mpsc::UnboundedReceiver<Command>,
    resolved: mpsc::UnboundedSender<ResolvedWait>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Wait registry started");

    loop {
        let next_deadline = table.next_deadline();
        // Far-future placeholder when nothing is due; the branch is disabled then.
        let timer = tokio::time::sleep_until(
            next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
        );

        let results = tokio::select! {
            _ = shutdown.changed() => {
                info!(pending = table.pending_len(), "Wait registry shutting down");
                break;
            }
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                let now = Instant::now();
                match command {
                    Command::Register(condition) => table.register(condition, now).into_iter().collect(),
                    Command::Event(response) => table.on_event(response, now),
                    Command::Timeout(instance_id) => table.on_timeout(&instance_id).into_iter().collect(),
                    Command::Cancel(instance_id) => table.cancel(&instance_id).into_iter().collect(),
                }
            }
            _ = timer, if next_deadline.is_some() => {
                table.expire_due(Instant::now())
            }
        };

        for result in results {
            debug!(
                instance_id = %result.instance_id,
                kind = ?result.outcome.kind,
                received = result.outcome.responses.len(),
                absent = result.outcome.absent.len(),
                "Wait resolved"
            );
            if resolved.send(result).is_err() {
                warn!("Resolution receiver dropped, stopping wait registry");
                return;
            }
        }
    }
}
