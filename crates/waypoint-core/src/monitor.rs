// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only query surface for monitoring front-ends.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatcher::{Dispatcher, PoolStats};
use crate::error::{EngineError, Result};
use crate::persistence::{EventRecord, InstanceFilter, InstanceRecord, InstanceState, Persistence};

/// What a monitor shows for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    /// Instance identifier.
    pub instance_id: String,
    /// Workflow alias.
    pub alias: String,
    /// Definition version.
    pub version: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Dispatch priority.
    pub priority: i64,
    /// Processor pool.
    pub pool_id: String,
    /// Deadline of the pending wait.
    pub wait_deadline: Option<DateTime<Utc>>,
    /// Cancellation has been requested.
    pub cancel_requested: bool,
    /// Return value of the entry method.
    pub result: Option<serde_json::Value>,
    /// Error message for ERROR and INVALID instances.
    pub error: Option<String>,
    /// Termination reason.
    pub termination_reason: Option<String>,
    /// Launch time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Terminal time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<InstanceRecord> for InstanceView {
    fn from(record: InstanceRecord) -> Self {
        Self {
            result: record
                .result
                .as_deref()
                .and_then(|r| serde_json::from_str(r).ok()),
            instance_id: record.instance_id,
            alias: record.alias,
            version: record.version,
            state: record.state,
            priority: record.priority,
            pool_id: record.pool_id,
            wait_deadline: record.wait_deadline,
            cancel_requested: record.cancel_requested,
            error: record.error,
            termination_reason: record.termination_reason,
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
        }
    }
}

/// Instance counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    /// Count per state; every state is present.
    pub counts: BTreeMap<InstanceState, i64>,
}

impl StateSummary {
    /// Instances in a state.
    pub fn count(&self, state: InstanceState) -> i64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// All instances.
    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }
}

/// Read-only view over the store and the running pools.
#[derive(Clone)]
pub struct Monitor {
    store: Arc<dyn Persistence>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Monitor {
    /// Monitor a store without a running engine (no pool statistics).
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            dispatcher: None,
        }
    }

    pub(crate) fn with_dispatcher(store: Arc<dyn Persistence>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher: Some(dispatcher),
        }
    }

    /// One instance.
    pub async fn instance(&self, instance_id: &str) -> Result<InstanceView> {
        self.store
            .get_instance(instance_id)
            .await?
            .map(InstanceView::from)
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// Instances matching a filter, in dispatch order.
    pub async fn list(&self, filter: &InstanceFilter) -> Result<Vec<InstanceView>> {
        Ok(self
            .store
            .list_instances(filter)
            .await?
            .into_iter()
            .map(InstanceView::from)
            .collect())
    }

    /// Instance counts per state.
    pub async fn state_summary(&self) -> Result<StateSummary> {
        let mut counts: BTreeMap<InstanceState, i64> =
            InstanceState::ALL.into_iter().map(|s| (s, 0)).collect();
        for (state, count) in self.store.count_by_state().await? {
            counts.insert(state, count);
        }
        Ok(StateSummary { counts })
    }

    /// Processor pool statistics; empty without a running engine.
    pub async fn pools(&self) -> Vec<PoolStats> {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.stats().await,
            None => Vec::new(),
        }
    }

    /// Lifecycle log of an instance.
    pub async fn events(&self, instance_id: &str) -> Result<Vec<EventRecord>> {
        self.store.list_events(instance_id).await
    }
}
