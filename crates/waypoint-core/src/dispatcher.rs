// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher and processor pools.
//!
//! Each pool is an independent lane with a fixed number of workers pulling
//! from a priority queue: higher priority first, ties in enqueue order. A
//! worker holds one instance for its whole run-to-next-wait segment.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::PoolConfig;
use crate::error::{EngineError, Result};

/// Entry of a run queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInstance {
    /// Instance to run.
    pub instance_id: String,
    /// Dispatch priority (higher first).
    pub priority: i64,
    seq: u64,
}

impl Ord for QueuedInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the earlier enqueue.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue with FIFO tie-breaking.
#[derive(Debug, Default)]
pub struct RunQueue {
    heap: BinaryHeap<QueuedInstance>,
    next_seq: u64,
}

impl RunQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance.
    pub fn push(&mut self, instance_id: impl Into<String>, priority: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedInstance {
            instance_id: instance_id.into(),
            priority,
            seq,
        });
    }

    /// Take the next instance to run.
    pub fn pop(&mut self) -> Option<QueuedInstance> {
        self.heap.pop()
    }

    /// Number of queued instances.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Executes one instance's segment on a worker.
#[async_trait]
pub trait InstanceRunner: Send + Sync + 'static {
    /// Run the instance until it waits, finishes or fails.
    async fn run(&self, instance_id: String);
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Pool identifier.
    pub pool_id: String,
    /// Configured workers.
    pub workers: usize,
    /// Instances waiting for a worker.
    pub queued: usize,
    /// Workers currently running an instance.
    pub busy: usize,
}

struct ProcessorPool {
    id: String,
    workers: usize,
    queue: Mutex<RunQueue>,
    notify: Notify,
    busy: AtomicUsize,
}

/// Routes runnable instances to their pool's workers.
pub struct Dispatcher {
    pools: HashMap<String, Arc<ProcessorPool>>,
    order: Vec<String>,
}

impl Dispatcher {
    /// Create the pools. Nothing runs until [`Dispatcher::start`].
    pub fn new(pools: &[PoolConfig]) -> Self {
        let order = pools.iter().map(|p| p.id.clone()).collect();
        let pools = pools
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    Arc::new(ProcessorPool {
                        id: p.id.clone(),
                        workers: p.workers.max(1),
                        queue: Mutex::new(RunQueue::new()),
                        notify: Notify::new(),
                        busy: AtomicUsize::new(0),
                    }),
                )
            })
            .collect();
        Self { pools, order }
    }

    /// True if a pool with this id exists.
    pub fn has_pool(&self, pool_id: &str) -> bool {
        self.pools.contains_key(pool_id)
    }

    /// Queue an instance on its pool.
    #[instrument(skip(self), level = "debug")]
    pub async fn enqueue(&self, pool_id: &str, instance_id: &str, priority: i64) -> Result<()> {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or_else(|| EngineError::UnknownPool {
                pool_id: pool_id.to_string(),
            })?;
        pool.queue.lock().await.push(instance_id, priority);
        pool.notify.notify_one();
        debug!("Instance queued");
        Ok(())
    }

    /// Spawn every pool's workers.
    pub fn start(
        &self,
        runner: Arc<dyn InstanceRunner>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for pool_id in &self.order {
            let Some(pool) = self.pools.get(pool_id) else {
                continue;
            };
            info!(pool_id = %pool.id, workers = pool.workers, "Starting processor pool");
            for worker in 0..pool.workers {
                handles.push(tokio::spawn(worker_loop(
                    pool.clone(),
                    worker,
                    runner.clone(),
                    shutdown.clone(),
                )));
            }
        }
        handles
    }

    /// Pool statistics in configuration order.
    pub async fn stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::with_capacity(self.order.len());
        for pool_id in &self.order {
            if let Some(pool) = self.pools.get(pool_id) {
                stats.push(PoolStats {
                    pool_id: pool.id.clone(),
                    workers: pool.workers,
                    queued: pool.queue.lock().await.len(),
                    busy: pool.busy.load(AtomicOrdering::SeqCst),
                });
            }
        }
        stats
    }
}

async fn worker_loop(
    pool: Arc<ProcessorPool>,
    worker: usize,
    runner: Arc<dyn InstanceRunner>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(pool_id = %pool.id, worker, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = pool.queue.lock().await.pop();
        match next {
            Some(item) => {
                pool.busy.fetch_add(1, AtomicOrdering::SeqCst);
                debug!(
                    pool_id = %pool.id,
                    worker,
                    instance_id = %item.instance_id,
                    priority = item.priority,
                    "Dispatching instance"
                );
                runner.run(item.instance_id).await;
                pool.busy.fetch_sub(1, AtomicOrdering::SeqCst);
            }
            None => {
                tokio::select! {
                    _ = pool.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(pool_id = %pool.id, worker, "Worker stopped");
}
