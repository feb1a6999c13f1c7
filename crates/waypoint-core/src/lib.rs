// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waypoint Core - Durable Workflow Engine
//!
//! Long-running processes are written as sequential methods that may suspend
//! at declared wait points and resume exactly there later, possibly after a
//! restart and under a newer deployed version.
//!
//! # Architecture
//!
//! ```text
//!   launch / on_event / on_timeout / cancel
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                  │
//! │                                                                      │
//! │  ┌──────────────┐   run    ┌──────────────┐  capture  ┌───────────┐ │
//! │  │  Dispatcher  │ ───────► │   Executor   │ ────────► │   Store   │ │
//! │  │ (pools, prio)│          │ (frame stack)│           │ (SQLite)  │ │
//! │  └──────────────┘          └──────────────┘           └───────────┘ │
//! │         ▲                         ▲ restore (compat gate)     │      │
//! │         │ resolved                │                           │      │
//! │  ┌──────────────┐                 │                           │      │
//! │  │ Wait Registry│ ◄── register ───┴───────────────────────────┘      │
//! │  │   (actor)    │                                                    │
//! │  └──────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Writing workflows
//!
//! A method body is a closure that runs one segment per invocation. It
//! inspects its resume point, does its work and returns a [`Step`]:
//!
//! ```rust,ignore
//! let main = MethodDef::new("main", |ctx| {
//!     if ctx.resumed_after("payment") {
//!         let order: String = ctx.get("order")?;
//!         let paid = !ctx.wait_outcome().is_some_and(|o| o.timed_out());
//!         return Ok(Step::returning(&(order, paid))?);
//!     }
//!     ctx.set("order", "A-17")?;
//!     Ok(Step::wait(
//!         "payment",
//!         WaitRequest::any(["payment-A-17"]).with_timeout(Duration::from_secs(3600)),
//!     ))
//! })
//! .site(CallSite::wait("payment", ["order"]));
//! ```
//!
//! Call sites and the locals live at them are declared up front. They form
//! the [`VersionSignature`] that decides whether a suspended instance may
//! resume under a newer version.
//!
//! # Version compatibility
//!
//! | Change | Verdict |
//! |--------|---------|
//! | New local before a wait a continuation is parked at | incompatible |
//! | New local after the last wait of a method | compatible |
//! | New local in a never-waiting helper | compatible |
//! | Removed or renamed call site | incompatible |
//!
//! Incompatible instances move to INVALID and stay queryable.
//!
//! # Modules
//!
//! - [`continuation`] - frames, wait requests and outcomes
//! - [`definition`] - workflow definitions and the definition registry
//! - [`executor`] - runs a continuation to its next wait
//! - [`capture`] - continuation capture and gated restore
//! - [`signature`] - version signatures and the compatibility checker
//! - [`wait_registry`] - pending waits and their resolution
//! - [`dispatcher`] - processor pools and priority queues
//! - [`engine`] - the embeddable engine
//! - [`monitor`] - read-only queries
//! - [`persistence`] - store trait and SQLite backend

#![deny(missing_docs)]

pub mod capture;
pub mod config;
pub mod continuation;
pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod migrations;
pub mod monitor;
pub mod persistence;
pub mod retry;
pub mod signature;
pub mod wait_registry;

pub use continuation::{
    Continuation, Locals, MethodContext, OutcomeKind, Response, Step, WaitMode, WaitOutcome,
    WaitRequest,
};
pub use definition::{CallSite, DefinitionRegistry, MethodDef, Version, WorkflowDefinition};
pub use engine::{Engine, EngineBuilder, LaunchOptions, RecoveryReport};
pub use error::{EngineError, Result};
pub use monitor::{InstanceView, Monitor, StateSummary};
pub use persistence::{InstanceState, Persistence, SqlitePersistence};
pub use signature::{CompatibilityChecker, CompatibilityReport, Incompatibility, VersionSignature};
