// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation model.
//!
//! A running instance is an explicit stack of [`Frame`]s rather than a native
//! call stack. Each frame names the method it belongs to, the resumption point
//! it will continue from, and the method's locals at that point. A method body
//! runs one *segment* per invocation: it looks at its resumption point,
//! executes up to the next call or wait, and hands back a [`Step`].
//!
//! ```text
//!   frames[0]  main                   After("directly_waiting")   {localIntValue}
//!   frames[1]  directlyWaitingMethod  After("wait")               {strValue, intValue}
//! ```
//!
//! Frames below an already-returned call are popped immediately, so the stack
//! always mirrors the live call chain from the entry method down to the frame
//! that issued the wait.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::definition::Version;
use crate::error::{EngineError, Result};

/// Named values held by a frame (locals) or by the instance (fields).
pub type Locals = BTreeMap<String, serde_json::Value>;

/// Where a frame continues when it is next executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", content = "call_site", rename_all = "snake_case")]
pub enum ResumePoint {
    /// Beginning of the method body.
    Start,
    /// Directly after the named call site (a call or a wait).
    After(String),
}

impl ResumePoint {
    /// Call site this frame is parked at, if any.
    pub fn call_site(&self) -> Option<&str> {
        match self {
            Self::Start => None,
            Self::After(site) => Some(site),
        }
    }

    /// True when the frame is parked after the given call site.
    pub fn is_after(&self, site: &str) -> bool {
        self.call_site() == Some(site)
    }
}

/// One activation record of a waiting-capable method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Method this frame executes.
    pub method: String,
    /// Resumption point of the next segment.
    pub resume_point: ResumePoint,
    /// Locals live at the resumption point.
    pub locals: Locals,
}

impl Frame {
    /// Fresh frame entering `method` with its arguments as initial locals.
    pub fn enter(method: impl Into<String>, args: Locals) -> Self {
        Self {
            method: method.into(),
            resume_point: ResumePoint::Start,
            locals: args,
        }
    }

    /// Names of the locals currently held.
    pub fn local_names(&self) -> BTreeSet<String> {
        self.locals.keys().cloned().collect()
    }
}

/// Captured execution state of a suspended instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    /// Workflow alias.
    pub alias: String,
    /// Definition version the frames were captured under.
    pub version: Version,
    /// Call chain, outermost (entry method) first.
    pub frames: Vec<Frame>,
    /// Instance-level data shared by all methods.
    #[serde(default)]
    pub fields: Locals,
}

impl Continuation {
    /// Continuation positioned at the start of the entry method.
    pub fn start(alias: impl Into<String>, version: Version, entry: &str, args: Locals) -> Self {
        Self {
            alias: alias.into(),
            version,
            frames: vec![Frame::enter(entry, args)],
            fields: Locals::new(),
        }
    }

    /// Nesting depth of the call chain.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Innermost frame (the one that issued the wait).
    pub fn innermost(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

/// How a wait combines its correlation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Every correlation id must receive a response.
    All,
    /// The first response for any correlation id satisfies the wait.
    Any,
}

impl WaitMode {
    /// Returns the string representation of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
        }
    }

    /// Parse a mode from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "any" => Some(Self::Any),
            _ => None,
        }
    }
}

/// Arguments of a `wait` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRequest {
    /// Combination mode.
    pub mode: WaitMode,
    /// Relative timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Responses this wait expects.
    pub correlation_ids: Vec<String>,
}

impl WaitRequest {
    /// Wait for responses to every id.
    pub fn all<I, S>(correlation_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: WaitMode::All,
            timeout: None,
            correlation_ids: correlation_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Wait for the first response to any id.
    pub fn any<I, S>(correlation_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: WaitMode::Any,
            timeout: None,
            correlation_ids: correlation_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Durable sleep: no correlation ids, resumes at the timeout.
    pub fn sleep(duration: Duration) -> Self {
        Self {
            mode: WaitMode::Any,
            timeout: Some(duration),
            correlation_ids: Vec::new(),
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject requests that can never be resolved.
    pub fn validate(&self) -> Result<()> {
        if self.mode == WaitMode::Any && self.correlation_ids.is_empty() && self.timeout.is_none()
        {
            return Err(EngineError::InvalidWait {
                reason: "ANY wait without correlation ids needs a timeout".to_string(),
            });
        }
        let mut seen = BTreeSet::new();
        for id in &self.correlation_ids {
            if id.is_empty() {
                return Err(EngineError::InvalidWait {
                    reason: "correlation id must not be empty".to_string(),
                });
            }
            if !seen.insert(id) {
                return Err(EngineError::InvalidWait {
                    reason: format!("duplicate correlation id '{}'", id),
                });
            }
        }
        Ok(())
    }
}

/// A response delivered for a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id the response was sent for.
    pub correlation_id: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// When the response reached the engine.
    pub received_at: DateTime<Utc>,
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// All (ALL) or one (ANY) of the expected responses arrived.
    Satisfied,
    /// The timeout fired first; `absent` lists the missing responses.
    TimedOut,
    /// The instance was cancelled while waiting.
    Cancelled,
}

/// Result of a wait, handed to the frame that issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitOutcome {
    /// How the wait ended.
    pub kind: OutcomeKind,
    /// Responses that arrived, keyed by correlation id.
    pub responses: BTreeMap<String, Response>,
    /// Correlation ids that never received a response.
    pub absent: Vec<String>,
}

impl WaitOutcome {
    /// Payload received for a correlation id.
    pub fn payload(&self, correlation_id: &str) -> Option<&serde_json::Value> {
        self.responses.get(correlation_id).map(|r| &r.payload)
    }

    /// Deserialize the payload received for a correlation id.
    pub fn payload_as<T: DeserializeOwned>(&self, correlation_id: &str) -> Result<Option<T>> {
        self.payload(correlation_id)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| EngineError::serialization(correlation_id, e))
            })
            .transpose()
    }

    /// True when the wait ended by timeout.
    pub fn timed_out(&self) -> bool {
        self.kind == OutcomeKind::TimedOut
    }

    /// True when the wait ended by cancellation.
    pub fn cancelled(&self) -> bool {
        self.kind == OutcomeKind::Cancelled
    }
}

/// What a method segment asks the executor to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Invoke another method; this frame resumes after `site`.
    Call {
        /// Declared call-site identity.
        site: String,
        /// Method to invoke.
        method: String,
        /// Initial locals of the callee.
        args: Locals,
    },
    /// Suspend at a wait call site; this frame resumes after `site`.
    Wait {
        /// Declared call-site identity.
        site: String,
        /// What to wait for.
        request: WaitRequest,
    },
    /// Finish this frame, handing a value to the caller.
    Return(serde_json::Value),
}

impl Step {
    /// Invoke `method` from call site `site` with no arguments.
    pub fn call(site: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Call {
            site: site.into(),
            method: method.into(),
            args: Locals::new(),
        }
    }

    /// Add an argument to a [`Step::Call`].
    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        if let Self::Call { args, .. } = &mut self {
            let value = serde_json::to_value(value)
                .map_err(|e| EngineError::serialization(format!("argument '{}'", name), e))?;
            args.insert(name.to_string(), value);
        }
        Ok(self)
    }

    /// Suspend at `site` with the given request.
    pub fn wait(site: impl Into<String>, request: WaitRequest) -> Self {
        Self::Wait {
            site: site.into(),
            request,
        }
    }

    /// Return nothing.
    pub fn done() -> Self {
        Self::Return(serde_json::Value::Null)
    }

    /// Return a serializable value.
    pub fn returning<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::Return)
            .map_err(|e| EngineError::serialization("return value", e))
    }
}

/// Data handed to a frame when it resumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    /// Nothing: fresh frame or restart of the segment.
    Start,
    /// The wait at the resumption point ended.
    Waited(WaitOutcome),
    /// The call at the resumption point returned.
    Returned(serde_json::Value),
}

/// View of the current frame given to a method body.
pub struct MethodContext<'a> {
    instance_id: &'a str,
    frame: &'a mut Frame,
    fields: &'a mut Locals,
    resumption: Resumption,
}

impl<'a> MethodContext<'a> {
    pub(crate) fn new(
        instance_id: &'a str,
        frame: &'a mut Frame,
        fields: &'a mut Locals,
        resumption: Resumption,
    ) -> Self {
        Self {
            instance_id,
            frame,
            fields,
            resumption,
        }
    }

    /// Instance being executed.
    pub fn instance_id(&self) -> &str {
        self.instance_id
    }

    /// Method this frame executes.
    pub fn method(&self) -> &str {
        &self.frame.method
    }

    /// Where this segment starts.
    pub fn resume_point(&self) -> &ResumePoint {
        &self.frame.resume_point
    }

    /// Shorthand for `resume_point().is_after(site)`.
    pub fn resumed_after(&self, site: &str) -> bool {
        self.frame.resume_point.is_after(site)
    }

    /// Read a local.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .frame
            .locals
            .get(name)
            .ok_or_else(|| EngineError::MissingLocal {
                method: self.frame.method.clone(),
                name: name.to_string(),
            })?;
        serde_json::from_value(value.clone())
            .map_err(|e| EngineError::serialization(format!("local '{}'", name), e))
    }

    /// Write a local.
    pub fn set<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| EngineError::serialization(format!("local '{}'", name), e))?;
        self.frame.locals.insert(name.to_string(), value);
        Ok(())
    }

    /// Drop a local that is no longer live.
    pub fn unset(&mut self, name: &str) {
        self.frame.locals.remove(name);
    }

    /// Read an instance field, `None` when unset.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.fields
            .get(name)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| EngineError::serialization(format!("field '{}'", name), e))
            })
            .transpose()
    }

    /// Write an instance field.
    pub fn set_field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| EngineError::serialization(format!("field '{}'", name), e))?;
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    /// Outcome of the wait this frame resumed from.
    pub fn wait_outcome(&self) -> Option<&WaitOutcome> {
        match &self.resumption {
            Resumption::Waited(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Value returned by the call this frame resumed from.
    pub fn returned<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.resumption {
            Resumption::Returned(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| EngineError::serialization("returned value", e)),
            _ => Ok(None),
        }
    }
}
