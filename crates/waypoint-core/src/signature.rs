// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version signatures and the compatibility checker.
//!
//! A signature lists, for every method reachable from the entry that can
//! (directly or transitively) reach a wait, each call site that waits or
//! invokes such a method, together with the locals live at that site. A
//! continuation captured under one version can resume under another only if
//! every frame it holds is parked at a site whose signature entry is
//! unchanged.
//!
//! Never-waiting methods and their call sites are excluded: they are always
//! re-run in full, so changing them cannot corrupt a captured frame.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::continuation::Continuation;
use crate::definition::{CallSiteKind, Version, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// One waiting-relevant call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Enclosing method.
    pub method: String,
    /// Call-site identity within the method.
    pub call_site: String,
    /// Wait, or call of a waiting-capable method.
    pub kind: CallSiteKind,
    /// Locals live at the site (order-insensitive).
    pub live_locals: BTreeSet<String>,
}

/// Structural fingerprint of one definition version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSignature {
    /// Workflow alias.
    pub alias: String,
    /// Definition version.
    pub version: Version,
    /// Entries in call-graph discovery order.
    pub entries: Vec<SignatureEntry>,
}

impl VersionSignature {
    /// Derive the signature of a definition.
    pub fn compute(definition: &WorkflowDefinition) -> Self {
        let waiting = waiting_capable(definition);

        // Breadth-first over waiting edges, in declaration order.
        let mut entries = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        if waiting.contains(definition.entry()) {
            queue.push_back(definition.entry().to_string());
            visited.insert(definition.entry().to_string());
        }

        while let Some(name) = queue.pop_front() {
            let Some(method) = definition.method(&name) else {
                continue;
            };
            for site in method.call_sites() {
                let relevant = match &site.kind {
                    CallSiteKind::Wait => true,
                    CallSiteKind::Call { callee } => waiting.contains(callee.as_str()),
                };
                if !relevant {
                    continue;
                }
                if let CallSiteKind::Call { callee } = &site.kind
                    && visited.insert(callee.clone())
                {
                    queue.push_back(callee.clone());
                }
                entries.push(SignatureEntry {
                    method: name.clone(),
                    call_site: site.id.clone(),
                    kind: site.kind.clone(),
                    live_locals: site.live_locals.clone(),
                });
            }
        }

        Self {
            alias: definition.alias().to_string(),
            version: definition.version(),
            entries,
        }
    }

    /// Entry for a method + call site.
    pub fn entry(&self, method: &str, call_site: &str) -> Option<&SignatureEntry> {
        self.entries
            .iter()
            .find(|e| e.method == method && e.call_site == call_site)
    }

    /// SHA-256 over the entries; equal digests mean identical structure.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            // serde_json never fails on these types
            let line = serde_json::to_string(entry).unwrap_or_default();
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Fixpoint of "has a wait site or calls a method that does".
fn waiting_capable(definition: &WorkflowDefinition) -> HashSet<&str> {
    let mut waiting: HashSet<&str> = definition
        .methods()
        .filter(|m| {
            m.call_sites()
                .iter()
                .any(|s| matches!(s.kind, CallSiteKind::Wait))
        })
        .map(|m| m.name())
        .collect();

    loop {
        let before = waiting.len();
        for method in definition.methods() {
            if waiting.contains(method.name()) {
                continue;
            }
            let reaches_wait = method
                .call_sites()
                .iter()
                .filter_map(|s| s.callee())
                .any(|callee| waiting.contains(callee));
            if reaches_wait {
                waiting.insert(method.name());
            }
        }
        if waiting.len() == before {
            return waiting;
        }
    }
}

/// A reason a continuation or signature cannot move to a newer version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Incompatibility {
    /// The call site no longer exists (or no longer waits) in the new version.
    CallSiteRemoved {
        /// Enclosing method.
        method: String,
        /// Missing call site.
        call_site: String,
    },
    /// The set of live locals at the call site changed.
    LocalsChanged {
        /// Enclosing method.
        method: String,
        /// Call site.
        call_site: String,
        /// Locals that appeared.
        added: Vec<String>,
        /// Locals that disappeared.
        removed: Vec<String>,
    },
    /// The call site now waits instead of calling, or calls another method.
    CallTargetChanged {
        /// Enclosing method.
        method: String,
        /// Call site.
        call_site: String,
        /// Old kind.
        old: CallSiteKind,
        /// New kind.
        new: CallSiteKind,
    },
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallSiteRemoved { method, call_site } => {
                write!(f, "call site '{}' in '{}' was removed", call_site, method)
            }
            Self::LocalsChanged {
                method,
                call_site,
                added,
                removed,
            } => write!(
                f,
                "live locals at '{}' in '{}' changed (added {:?}, removed {:?})",
                call_site, method, added, removed
            ),
            Self::CallTargetChanged {
                method,
                call_site,
                old,
                new,
            } => write!(
                f,
                "call site '{}' in '{}' changed from {:?} to {:?}",
                call_site, method, old, new
            ),
        }
    }
}

/// Verdict of comparing two signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    /// Workflow alias.
    pub alias: String,
    /// Version continuations were captured under.
    pub from: Version,
    /// Version they would resume under.
    pub to: Version,
    /// Problems found; empty means compatible.
    pub incompatibilities: Vec<Incompatibility>,
}

impl CompatibilityReport {
    /// True when nothing blocks the upgrade.
    pub fn is_compatible(&self) -> bool {
        self.incompatibilities.is_empty()
    }
}

/// Pure, deterministic comparisons between versions.
pub struct CompatibilityChecker;

impl CompatibilityChecker {
    /// True when any continuation captured under `old` can resume under `new`.
    pub fn is_compatible(old: &VersionSignature, new: &VersionSignature) -> bool {
        Self::diff(old, new).is_empty()
    }

    /// Every old entry that would break a continuation parked there.
    pub fn diff(old: &VersionSignature, new: &VersionSignature) -> Vec<Incompatibility> {
        old.entries
            .iter()
            .filter_map(|entry| compare_at(entry, new))
            .collect()
    }

    /// Full report for tooling.
    pub fn report(old: &VersionSignature, new: &VersionSignature) -> CompatibilityReport {
        CompatibilityReport {
            alias: new.alias.clone(),
            from: old.version,
            to: new.version,
            incompatibilities: Self::diff(old, new),
        }
    }

    /// Check only the frames a continuation actually holds.
    ///
    /// Uses the old signature's entry for each frame when available, and the
    /// frame's own captured locals otherwise (old version no longer deployed).
    pub fn verify(
        instance_id: &str,
        continuation: &Continuation,
        old: Option<&VersionSignature>,
        new: &VersionSignature,
    ) -> Result<()> {
        let mut reasons = Vec::new();

        for (depth, frame) in continuation.frames.iter().enumerate() {
            let Some(site) = frame.resume_point.call_site() else {
                // A frame at Start has not run yet; nothing of it was captured.
                continue;
            };

            let old_entry = match old.and_then(|sig| sig.entry(&frame.method, site)) {
                Some(entry) => entry.clone(),
                None => SignatureEntry {
                    method: frame.method.clone(),
                    call_site: site.to_string(),
                    kind: match continuation.frames.get(depth + 1) {
                        Some(callee) => CallSiteKind::Call {
                            callee: callee.method.clone(),
                        },
                        None => CallSiteKind::Wait,
                    },
                    live_locals: frame.local_names(),
                },
            };

            if let Some(problem) = compare_at(&old_entry, new) {
                reasons.push(problem);
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(EngineError::IncompatibleVersion {
                instance_id: instance_id.to_string(),
                from: continuation.version.to_string(),
                to: new.version.to_string(),
                reasons: reasons.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

fn compare_at(old: &SignatureEntry, new: &VersionSignature) -> Option<Incompatibility> {
    let Some(current) = new.entry(&old.method, &old.call_site) else {
        return Some(Incompatibility::CallSiteRemoved {
            method: old.method.clone(),
            call_site: old.call_site.clone(),
        });
    };
    if current.kind != old.kind {
        return Some(Incompatibility::CallTargetChanged {
            method: old.method.clone(),
            call_site: old.call_site.clone(),
            old: old.kind.clone(),
            new: current.kind.clone(),
        });
    }
    if current.live_locals != old.live_locals {
        return Some(Incompatibility::LocalsChanged {
            method: old.method.clone(),
            call_site: old.call_site.clone(),
            added: current
                .live_locals
                .difference(&old.live_locals)
                .cloned()
                .collect(),
            removed: old
                .live_locals
                .difference(&current.live_locals)
                .cloned()
                .collect(),
        });
    }
    None
}
