// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Continuation capture and restore.
//!
//! Capture turns a continuation that just stopped at a wait into bytes for
//! the store, after checking that it describes a real call chain and that
//! every frame holds exactly the locals declared live at its call site.
//! Restore decodes stored bytes and gates them through the compatibility
//! checker against the currently deployed definition.

use std::sync::Arc;

use tracing::{debug, info};

use crate::continuation::Continuation;
use crate::definition::{CallSiteKind, DefinitionRegistry, Deployed};
use crate::error::{EngineError, Result};
use crate::signature::CompatibilityChecker;

/// Encode a continuation suspended at a wait.
///
/// Never executes workflow code; a failure here leaves the instance's
/// previously stored continuation untouched.
pub fn capture(deployed: &Deployed, continuation: &Continuation) -> Result<Vec<u8>> {
    let definition = &deployed.definition;
    let last = continuation.frames.len().checked_sub(1).ok_or_else(|| {
        EngineError::serialization("capture", "continuation has no frames")
    })?;

    for (depth, frame) in continuation.frames.iter().enumerate() {
        let method = definition.method(&frame.method).ok_or_else(|| {
            EngineError::serialization(
                "capture",
                format!("frame {} names unknown method '{}'", depth, frame.method),
            )
        })?;
        let site_id = frame.resume_point.call_site().ok_or_else(|| {
            EngineError::serialization(
                "capture",
                format!("frame {} ('{}') is not parked at a call site", depth, frame.method),
            )
        })?;
        let site = method
            .call_site(site_id)
            .ok_or_else(|| EngineError::UndeclaredCallSite {
                method: frame.method.clone(),
                call_site: site_id.to_string(),
            })?;

        // Outer frames wait on the frame below them; only the innermost waits itself.
        let chain_ok = match (&site.kind, continuation.frames.get(depth + 1)) {
            (CallSiteKind::Wait, None) => depth == last,
            (CallSiteKind::Call { callee }, Some(next)) => *callee == next.method,
            _ => false,
        };
        if !chain_ok {
            return Err(EngineError::serialization(
                "capture",
                format!(
                    "frame {} ('{}' at '{}') does not match the call chain",
                    depth, frame.method, site_id
                ),
            ));
        }

        let actual = frame.local_names();
        if actual != site.live_locals {
            return Err(EngineError::LocalsMismatch {
                method: frame.method.clone(),
                call_site: site_id.to_string(),
                expected: site.live_locals.iter().cloned().collect(),
                actual: actual.into_iter().collect(),
            });
        }
    }

    let bytes = serde_json::to_vec(continuation)
        .map_err(|e| EngineError::serialization("capture", e))?;
    debug!(
        alias = %continuation.alias,
        version = %continuation.version,
        depth = continuation.depth(),
        bytes = bytes.len(),
        "Continuation captured"
    );
    Ok(bytes)
}

/// Decode stored bytes without any version check.
pub fn decode(bytes: &[u8]) -> Result<Continuation> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::serialization("restore", e))
}

/// Decode a continuation and bind it to the newest deployed version of its
/// alias, upgrading the recorded version when the checker allows it. A
/// deployment older than the recorded version is never a valid target.
pub fn restore(
    instance_id: &str,
    bytes: &[u8],
    registry: &DefinitionRegistry,
) -> Result<(Continuation, Deployed)> {
    let mut continuation = decode(bytes)?;
    let current = registry
        .latest(&continuation.alias)
        .cloned()
        .ok_or_else(|| EngineError::DefinitionNotFound {
            alias: continuation.alias.clone(),
            version: None,
        })?;

    let deployed_version = current.definition.version();
    if deployed_version == continuation.version {
        return Ok((continuation, current));
    }
    if deployed_version < continuation.version {
        return Err(EngineError::IncompatibleVersion {
            instance_id: instance_id.to_string(),
            from: continuation.version.to_string(),
            to: deployed_version.to_string(),
            reasons: vec!["deployed version is older than the captured one".to_string()],
        });
    }

    let old = registry
        .signature(&continuation.alias, continuation.version)
        .map(Arc::as_ref);
    CompatibilityChecker::verify(instance_id, &continuation, old, &current.signature)?;

    info!(
        instance_id,
        from = %continuation.version,
        to = %deployed_version,
        "Continuation upgraded to deployed version"
    );
    continuation.version = deployed_version;
    Ok((continuation, current))
}
