// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Segment executor.
//!
//! Drives a continuation's frame stack: runs the innermost frame's segment,
//! pushes a frame on [`Step::Call`], pops on [`Step::Return`] and stops on
//! [`Step::Wait`]. Method bodies are synchronous, so a run is never
//! interleaved with another instance on the same worker.

use tracing::{debug, trace};

use crate::continuation::{
    Continuation, Frame, MethodContext, ResumePoint, Resumption, Step, WaitRequest,
};
use crate::definition::{CallSiteKind, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// Default upper bound on segments per run.
pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    /// The innermost frame called `wait`; the continuation is ready to capture.
    InterruptedForWait(WaitRequest),
    /// The entry method returned.
    Finished(serde_json::Value),
}

/// Runs continuations of one definition.
pub struct Executor<'a> {
    definition: &'a WorkflowDefinition,
    max_steps: usize,
}

impl<'a> Executor<'a> {
    /// Create an executor for a definition.
    pub fn new(definition: &'a WorkflowDefinition) -> Self {
        Self {
            definition,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Limit the number of segments one run may execute.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Execute until the next wait or completion.
    ///
    /// `resumption` is delivered to the innermost frame first.
    pub fn run(
        &self,
        instance_id: &str,
        continuation: &mut Continuation,
        mut resumption: Resumption,
    ) -> Result<SegmentOutcome> {
        let Continuation { frames, fields, .. } = continuation;

        for _ in 0..self.max_steps {
            let depth = frames.len();
            let Some(frame) = frames.last_mut() else {
                return Err(EngineError::WorkflowFault {
                    method: self.definition.entry().to_string(),
                    message: "continuation has no frames".to_string(),
                });
            };

            let method = self.definition.method(&frame.method).ok_or_else(|| {
                EngineError::WorkflowFault {
                    method: frame.method.clone(),
                    message: "method is not part of the definition".to_string(),
                }
            })?;

            trace!(method = %frame.method, resume_point = ?frame.resume_point, "Running segment");

            let step = {
                let mut ctx = MethodContext::new(
                    instance_id,
                    frame,
                    fields,
                    std::mem::replace(&mut resumption, Resumption::Start),
                );
                (method.body())(&mut ctx).map_err(|e| fault(method.name(), e))?
            };

            match step {
                Step::Call {
                    site,
                    method: callee,
                    args,
                } => {
                    let declared = method.call_site(&site).map(|s| &s.kind);
                    if !matches!(declared, Some(CallSiteKind::Call { callee: c }) if *c == callee)
                    {
                        return Err(EngineError::UndeclaredCallSite {
                            method: frame.method.clone(),
                            call_site: site,
                        });
                    }
                    frame.resume_point = ResumePoint::After(site);
                    frames.push(Frame::enter(callee, args));
                }
                Step::Wait { site, request } => {
                    if !matches!(
                        method.call_site(&site).map(|s| &s.kind),
                        Some(CallSiteKind::Wait)
                    ) {
                        return Err(EngineError::UndeclaredCallSite {
                            method: frame.method.clone(),
                            call_site: site,
                        });
                    }
                    request.validate()?;
                    debug!(
                        method = %frame.method,
                        call_site = %site,
                        depth = depth,
                        "Interrupted for wait"
                    );
                    frame.resume_point = ResumePoint::After(site);
                    return Ok(SegmentOutcome::InterruptedForWait(request));
                }
                Step::Return(value) => {
                    frames.pop();
                    if frames.is_empty() {
                        return Ok(SegmentOutcome::Finished(value));
                    }
                    resumption = Resumption::Returned(value);
                }
            }
        }

        Err(EngineError::WorkflowFault {
            method: frames
                .last()
                .map(|f| f.method.clone())
                .unwrap_or_default(),
            message: format!("exceeded {} segments without waiting", self.max_steps),
        })
    }
}

/// Keep engine errors raised through `?` in a body; wrap everything else.
fn fault(method: &str, err: anyhow::Error) -> EngineError {
    match err.downcast::<EngineError>() {
        Ok(engine_err) => engine_err,
        Err(other) => EngineError::WorkflowFault {
            method: method.to_string(),
            message: format!("{:#}", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::{Locals, OutcomeKind, WaitOutcome};
    use crate::definition::{CallSite, MethodDef, Version};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn counter_definition() -> WorkflowDefinition {
        WorkflowDefinition::builder("counter", Version::new(1, 0, 0))
            .method(
                MethodDef::new("main", |ctx| {
                    if ctx.resumed_after("inc") {
                        let n: u32 = ctx.returned()?.unwrap_or_default();
                        ctx.set_field("result", &n)?;
                        return Ok(Step::done());
                    }
                    ctx.set("n", &1u32)?;
                    Ok(Step::call("inc", "increment").arg("n", &1u32)?)
                })
                .site(CallSite::call("inc", "increment", ["n"])),
            )
            .method(
                MethodDef::new("increment", |ctx| {
                    if ctx.resumed_after("w") {
                        let n: u32 = ctx.get("n")?;
                        let outcome = ctx.wait_outcome().expect("resumed from wait");
                        let bump = if outcome.timed_out() { 10 } else { 1 };
                        return Ok(Step::returning(&(n + bump))?);
                    }
                    Ok(Step::wait(
                        "w",
                        WaitRequest::any(["tick"]).with_timeout(Duration::from_secs(1)),
                    ))
                })
                .site(CallSite::wait("w", ["n"])),
            )
            .build()
            .unwrap()
    }

    fn outcome(kind: OutcomeKind) -> WaitOutcome {
        WaitOutcome {
            kind,
            responses: BTreeMap::new(),
            absent: vec![],
        }
    }

    #[test]
    fn test_run_until_wait_then_resume() {
        let def = counter_definition();
        let executor = Executor::new(&def);
        let mut cont = Continuation::start("counter", def.version(), "main", Locals::new());

        let result = executor
            .run("i-1", &mut cont, Resumption::Start)
            .unwrap();
        assert!(matches!(result, SegmentOutcome::InterruptedForWait(_)));
        assert_eq!(cont.depth(), 2);
        assert_eq!(
            cont.frames[0].resume_point,
            ResumePoint::After("inc".to_string())
        );
        assert_eq!(
            cont.frames[1].resume_point,
            ResumePoint::After("w".to_string())
        );

        let result = executor
            .run(
                "i-1",
                &mut cont,
                Resumption::Waited(outcome(OutcomeKind::TimedOut)),
            )
            .unwrap();
        assert_eq!(result, SegmentOutcome::Finished(serde_json::Value::Null));
        assert_eq!(cont.fields.get("result"), Some(&serde_json::json!(11)));
        assert!(cont.frames.is_empty());
    }

    #[test]
    fn test_undeclared_call_site_is_rejected() {
        let def = WorkflowDefinition::builder("bad", Version::new(1, 0, 0))
            .method(MethodDef::new("main", |_ctx| {
                Ok(Step::wait("nowhere", WaitRequest::all(["x"])))
            }))
            .build()
            .unwrap();
        let mut cont = Continuation::start("bad", def.version(), "main", Locals::new());
        let err = Executor::new(&def)
            .run("i-1", &mut cont, Resumption::Start)
            .unwrap_err();
        assert_eq!(err.error_code(), "UNDECLARED_CALL_SITE");
    }

    #[test]
    fn test_call_to_wrong_callee_is_rejected() {
        let def = WorkflowDefinition::builder("bad", Version::new(1, 0, 0))
            .method(
                MethodDef::new("main", |_ctx| Ok(Step::call("c", "other")))
                    .site(CallSite::call("c", "helper", Vec::<String>::new())),
            )
            .method(MethodDef::new("helper", |_ctx| Ok(Step::done())))
            .method(MethodDef::new("other", |_ctx| Ok(Step::done())))
            .build()
            .unwrap();
        let mut cont = Continuation::start("bad", def.version(), "main", Locals::new());
        let err = Executor::new(&def)
            .run("i-1", &mut cont, Resumption::Start)
            .unwrap_err();
        assert_eq!(err.error_code(), "UNDECLARED_CALL_SITE");
    }

    #[test]
    fn test_body_errors_become_faults() {
        let def = WorkflowDefinition::builder("fails", Version::new(1, 0, 0))
            .method(MethodDef::new("main", |_ctx| {
                anyhow::bail!("payment service rejected the order")
            }))
            .build()
            .unwrap();
        let mut cont = Continuation::start("fails", def.version(), "main", Locals::new());
        let err = Executor::new(&def)
            .run("i-1", &mut cont, Resumption::Start)
            .unwrap_err();
        assert_eq!(err.error_code(), "WORKFLOW_FAULT");
        assert!(err.to_string().contains("payment service rejected"));
    }

    #[test]
    fn test_engine_errors_pass_through_bodies() {
        let def = WorkflowDefinition::builder("missing", Version::new(1, 0, 0))
            .method(MethodDef::new("main", |ctx| {
                let _: u32 = ctx.get("absent")?;
                Ok(Step::done())
            }))
            .build()
            .unwrap();
        let mut cont = Continuation::start("missing", def.version(), "main", Locals::new());
        let err = Executor::new(&def)
            .run("i-1", &mut cont, Resumption::Start)
            .unwrap_err();
        assert_eq!(err.error_code(), "MISSING_LOCAL");
    }

    #[test]
    fn test_step_limit() {
        let def = WorkflowDefinition::builder("loop", Version::new(1, 0, 0))
            .method(
                MethodDef::new("main", |_ctx| Ok(Step::call("again", "main")))
                    .site(CallSite::call("again", "main", Vec::<String>::new())),
            )
            .build()
            .unwrap();
        let mut cont = Continuation::start("loop", def.version(), "main", Locals::new());
        let err = Executor::new(&def)
            .with_max_steps(50)
            .run("i-1", &mut cont, Resumption::Start)
            .unwrap_err();
        assert!(err.to_string().contains("exceeded 50 segments"));
    }
}
