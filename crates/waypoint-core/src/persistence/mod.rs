//! Persistence interfaces and backends for waypoint-core.
//!
//! The store is the only resource both capture and restore mutate. Every
//! state change that must be atomic per instance (suspending at a wait,
//! resolving a wait, reaching a terminal state) is a single trait method so
//! backends can wrap it in one transaction.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::continuation::{Response, WaitMode, WaitOutcome};
use crate::error::{EngineError, Result};

/// Lifecycle state of a workflow instance.
///
/// ```text
///            launch
///              |
///              v
///   +----> ENQUEUED ----> RUNNING ----> FINISHED
///   |                      |   |  \
///   |  resolve             |   |   +--> ERROR
///   +------- WAITING <-----+   +------> INVALID (restore rejected)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    /// Runnable, queued in its processor pool.
    Enqueued,
    /// Held by a worker.
    Running,
    /// Suspended at a wait.
    Waiting,
    /// Completed (normally or by cancellation).
    Finished,
    /// Failed; kept for diagnosis, never dispatched.
    Error,
    /// Continuation incompatible with the deployed version; never dispatched.
    Invalid,
}

impl InstanceState {
    /// All states, in lifecycle order.
    pub const ALL: [InstanceState; 6] = [
        Self::Enqueued,
        Self::Running,
        Self::Waiting,
        Self::Finished,
        Self::Error,
        Self::Invalid,
    ];

    /// Returns the string representation stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "ENQUEUED",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Invalid => "INVALID",
        }
    }

    /// True for states an instance never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Invalid)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::serialization("instance state", format!("unknown state '{}'", s)))
    }
}

impl TryFrom<String> for InstanceState {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Instance record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub instance_id: String,
    /// Workflow alias.
    pub alias: String,
    /// Definition version the instance currently runs under.
    pub version: String,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub state: InstanceState,
    /// Dispatch priority (higher first).
    pub priority: i64,
    /// Processor pool the instance is dispatched to.
    pub pool_id: String,
    /// Enqueue order within equal priorities.
    pub enqueue_seq: i64,
    /// Absolute deadline of the pending wait, if any.
    pub wait_deadline: Option<DateTime<Utc>>,
    /// Cancellation has been requested.
    pub cancel_requested: bool,
    /// Return value of the entry method (JSON).
    pub result: Option<String>,
    /// Error message for ERROR and INVALID instances.
    pub error: Option<String>,
    /// How the instance reached its terminal state, when not a plain finish.
    pub termination_reason: Option<String>,
    /// When the instance was launched.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// A new instance to store.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Unique identifier.
    pub instance_id: String,
    /// Workflow alias.
    pub alias: String,
    /// Version the instance is created under.
    pub version: String,
    /// Dispatch priority.
    pub priority: i64,
    /// Processor pool.
    pub pool_id: String,
    /// Initial continuation (entry frame at its start).
    pub continuation: Vec<u8>,
}

/// Stored continuation of an instance.
#[derive(Debug, Clone)]
pub struct StoredContinuation {
    /// Version the continuation was written under.
    pub version: String,
    /// Encoded continuation.
    pub data: Vec<u8>,
    /// Resolved wait to deliver when the instance next runs.
    pub wait_outcome: Option<WaitOutcome>,
}

/// Pending wait condition as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRecord {
    /// Waiting instance.
    pub instance_id: String,
    /// ALL or ANY.
    pub mode: WaitMode,
    /// Expected correlation ids.
    pub correlation_ids: Vec<String>,
    /// Absolute timeout, if any.
    pub deadline: Option<DateTime<Utc>>,
}

/// How an instance reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Terminal state.
    pub state: InstanceState,
    /// Return value of the entry method.
    pub result: Option<serde_json::Value>,
    /// Error message.
    pub error: Option<String>,
    /// Termination reason, e.g. `cancelled`.
    pub reason: Option<String>,
}

impl Completion {
    /// Normal completion.
    pub fn finished(result: serde_json::Value) -> Self {
        Self {
            state: InstanceState::Finished,
            result: Some(result),
            error: None,
            reason: None,
        }
    }

    /// Unwound after a cancellation request.
    pub fn cancelled() -> Self {
        Self {
            state: InstanceState::Finished,
            result: None,
            error: None,
            reason: Some("cancelled".to_string()),
        }
    }

    /// Unrecovered fault.
    pub fn failed(error: &EngineError) -> Self {
        Self {
            state: InstanceState::Error,
            result: None,
            error: Some(error.to_string()),
            reason: Some(error.error_code().to_lowercase()),
        }
    }

    /// Continuation rejected at restore.
    pub fn invalid(error: &EngineError) -> Self {
        Self {
            state: InstanceState::Invalid,
            result: None,
            error: Some(error.to_string()),
            reason: Some(error.error_code().to_lowercase()),
        }
    }

    /// Event type written to the lifecycle log.
    pub fn event_type(&self) -> &str {
        match (&self.state, self.reason.as_deref()) {
            (InstanceState::Finished, Some(reason)) => reason,
            (InstanceState::Finished, None) => "finished",
            (InstanceState::Error, _) => "error",
            _ => "invalid",
        }
    }
}

/// Lifecycle log entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    /// Database primary key.
    pub id: i64,
    /// Instance this event belongs to.
    pub instance_id: String,
    /// Type of event (started, waiting, resumed, finished, cancelled, error, invalid, recovered, upgraded).
    pub event_type: String,
    /// Optional detail text.
    pub detail: Option<String>,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Only instances in this state.
    pub state: Option<InstanceState>,
    /// Only instances of this pool.
    pub pool_id: Option<String>,
    /// Only instances of this alias.
    pub alias: Option<String>,
    /// Maximum number of rows (unbounded when `None`).
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: i64,
}

/// Persistence interface used by the engine.
///
/// Results are ordered by dispatch order (priority descending, then enqueue
/// order) wherever a list is returned.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a new ENQUEUED instance with its initial continuation.
    async fn create_instance(&self, instance: &NewInstance) -> Result<()>;

    /// Fetch one instance.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// List instances matching a filter.
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>>;

    /// Number of instances per state (states without instances omitted).
    async fn count_by_state(&self) -> Result<Vec<(InstanceState, i64)>>;

    /// Compare-and-set the state. Returns false if the instance was not in `from`.
    async fn transition_state(
        &self,
        instance_id: &str,
        from: InstanceState,
        to: InstanceState,
    ) -> Result<bool>;

    /// Load the stored continuation.
    async fn load_continuation(&self, instance_id: &str) -> Result<Option<StoredContinuation>>;

    /// Record that the instance now runs under a newer compatible version.
    async fn update_version(&self, instance_id: &str, version: &str) -> Result<()>;

    /// RUNNING -> WAITING: replace the continuation and store the wait in one
    /// transaction. Returns false (and changes nothing) if the instance was
    /// no longer RUNNING.
    async fn suspend(
        &self,
        instance_id: &str,
        version: &str,
        continuation: &[u8],
        wait: &WaitRecord,
    ) -> Result<bool>;

    /// WAITING -> ENQUEUED: drop the wait and attach its outcome to the
    /// continuation. Stored responses for each id in `consumed` received at
    /// or before its mark are deleted, unless another pending wait still
    /// references that id. Returns false if the wait was already resolved.
    async fn resolve_wait(
        &self,
        instance_id: &str,
        outcome: &WaitOutcome,
        consumed: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<bool>;

    /// Move to a terminal state if the instance is still in `from`.
    async fn complete(
        &self,
        instance_id: &str,
        from: InstanceState,
        completion: &Completion,
    ) -> Result<bool>;

    /// Flag a non-terminal instance for cancellation. Returns its state, or
    /// `None` if the instance does not exist.
    async fn request_cancel(&self, instance_id: &str) -> Result<Option<InstanceState>>;

    /// All pending wait conditions.
    async fn list_waits(&self) -> Result<Vec<WaitRecord>>;

    /// Store an incoming response until a wait consumes it.
    async fn save_response(&self, response: &Response) -> Result<()>;

    /// Unconsumed responses, oldest first.
    async fn pending_responses(&self) -> Result<Vec<Response>>;

    /// Drop responses received before `cutoff` whose correlation id no
    /// pending wait references.
    async fn delete_responses_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Append to the lifecycle log.
    async fn append_event(
        &self,
        instance_id: &str,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<()>;

    /// Lifecycle log of an instance, oldest first.
    async fn list_events(&self, instance_id: &str) -> Result<Vec<EventRecord>>;
}
