// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions and the deployed-definition registry.
//!
//! A definition is a named, versioned table of methods. Each method carries
//! its body and a declaration of its call sites: where it waits, which
//! methods it invokes, and which locals are live at each of those points.
//! The declarations feed the version signature; the executor enforces them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::continuation::{MethodContext, Step};
use crate::error::{EngineError, Result};
use crate::signature::{CompatibilityChecker, CompatibilityReport, VersionSignature};

/// Definition version as `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch level.
    pub patch: u32,
}

impl Version {
    /// Create a version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{:03}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidDefinition {
            alias: String::new(),
            reason: format!("'{}' is not a major.minor.patch version", s),
        };
        let mut parts = s.split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

/// Body of a method: runs one segment and reports the next step.
pub type MethodBody = Arc<dyn Fn(&mut MethodContext<'_>) -> anyhow::Result<Step> + Send + Sync>;

/// What happens at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallSiteKind {
    /// A `wait` call.
    Wait,
    /// An invocation of another declared method.
    Call {
        /// Invoked method.
        callee: String,
    },
}

/// A declared call site inside a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Identity of the site, unique within its method.
    pub id: String,
    /// Wait or call.
    pub kind: CallSiteKind,
    /// Locals live at this point.
    pub live_locals: BTreeSet<String>,
}

impl CallSite {
    /// Declare a wait call site.
    pub fn wait<I, S>(id: impl Into<String>, live_locals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind: CallSiteKind::Wait,
            live_locals: live_locals.into_iter().map(Into::into).collect(),
        }
    }

    /// Declare a call site invoking `callee`.
    pub fn call<I, S>(id: impl Into<String>, callee: impl Into<String>, live_locals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind: CallSiteKind::Call {
                callee: callee.into(),
            },
            live_locals: live_locals.into_iter().map(Into::into).collect(),
        }
    }

    /// Invoked method for call sites.
    pub fn callee(&self) -> Option<&str> {
        match &self.kind {
            CallSiteKind::Call { callee } => Some(callee),
            CallSiteKind::Wait => None,
        }
    }
}

/// A method of a workflow definition.
#[derive(Clone)]
pub struct MethodDef {
    name: String,
    call_sites: Vec<CallSite>,
    body: MethodBody,
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("call_sites", &self.call_sites)
            .finish()
    }
}

impl MethodDef {
    /// Create a method from its body.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut MethodContext<'_>) -> anyhow::Result<Step> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call_sites: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Declare a call site.
    pub fn site(mut self, site: CallSite) -> Self {
        self.call_sites.push(site);
        self
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared call sites in declaration order.
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    /// Look up a declared call site.
    pub fn call_site(&self, id: &str) -> Option<&CallSite> {
        self.call_sites.iter().find(|s| s.id == id)
    }

    pub(crate) fn body(&self) -> &MethodBody {
        &self.body
    }
}

/// A validated workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    alias: String,
    version: Version,
    entry: String,
    methods: BTreeMap<String, MethodDef>,
    // Declaration order, for deterministic signatures.
    order: Vec<String>,
}

impl WorkflowDefinition {
    /// Start building a definition.
    pub fn builder(alias: impl Into<String>, version: Version) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            alias: alias.into(),
            version,
            entry: None,
            methods: Vec::new(),
        }
    }

    /// Workflow alias.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Definition version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Entry method name.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Look up a method.
    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.get(name)
    }

    /// Methods in declaration order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.order.iter().filter_map(|name| self.methods.get(name))
    }
}

/// Builder for [`WorkflowDefinition`].
pub struct WorkflowDefinitionBuilder {
    alias: String,
    version: Version,
    entry: Option<String>,
    methods: Vec<MethodDef>,
}

impl WorkflowDefinitionBuilder {
    /// Set the entry method (defaults to `main`).
    pub fn entry(mut self, method: impl Into<String>) -> Self {
        self.entry = Some(method.into());
        self
    }

    /// Add a method.
    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<WorkflowDefinition> {
        let alias = self.alias;
        let invalid = |reason: String| EngineError::InvalidDefinition {
            alias: alias.clone(),
            reason,
        };

        if alias.is_empty() {
            return Err(invalid("alias must not be empty".to_string()));
        }

        let entry = self.entry.unwrap_or_else(|| "main".to_string());
        let mut order = Vec::with_capacity(self.methods.len());
        let mut methods = BTreeMap::new();
        for method in self.methods {
            let mut site_ids = BTreeSet::new();
            for site in &method.call_sites {
                if !site_ids.insert(site.id.as_str()) {
                    return Err(invalid(format!(
                        "call site '{}' declared twice in '{}'",
                        site.id, method.name
                    )));
                }
            }
            order.push(method.name.clone());
            if methods.insert(method.name.clone(), method).is_some() {
                return Err(invalid(format!(
                    "method '{}' declared twice",
                    order.last().map(String::as_str).unwrap_or_default()
                )));
            }
        }

        if !methods.contains_key(&entry) {
            return Err(invalid(format!("entry method '{}' is not declared", entry)));
        }

        for method in methods.values() {
            for site in &method.call_sites {
                if let Some(callee) = site.callee()
                    && !methods.contains_key(callee)
                {
                    return Err(invalid(format!(
                        "call site '{}' in '{}' invokes undeclared method '{}'",
                        site.id, method.name, callee
                    )));
                }
            }
        }

        Ok(WorkflowDefinition {
            alias,
            version: self.version,
            entry,
            methods,
            order,
        })
    }
}

/// A deployed definition with its precomputed signature.
#[derive(Debug, Clone)]
pub struct Deployed {
    /// The definition.
    pub definition: Arc<WorkflowDefinition>,
    /// Its structural signature.
    pub signature: Arc<VersionSignature>,
}

/// Deployed workflow definitions keyed by alias and version.
///
/// Populated by the host before the engine starts; the engine only reads it.
#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    by_alias: HashMap<String, BTreeMap<Version, Deployed>>,
}

impl DefinitionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a definition, computing its signature.
    ///
    /// Deploying the same alias and version twice is rejected.
    pub fn deploy(&mut self, definition: WorkflowDefinition) -> Result<Arc<VersionSignature>> {
        let versions = self
            .by_alias
            .entry(definition.alias().to_string())
            .or_default();
        if versions.contains_key(&definition.version()) {
            return Err(EngineError::InvalidDefinition {
                alias: definition.alias().to_string(),
                reason: format!("version {} is already deployed", definition.version()),
            });
        }
        let signature = Arc::new(VersionSignature::compute(&definition));
        versions.insert(
            definition.version(),
            Deployed {
                definition: Arc::new(definition),
                signature: signature.clone(),
            },
        );
        Ok(signature)
    }

    /// Newest deployed version of an alias.
    pub fn latest(&self, alias: &str) -> Option<&Deployed> {
        self.by_alias
            .get(alias)
            .and_then(|versions| versions.values().next_back())
    }

    /// A specific deployed version.
    pub fn get(&self, alias: &str, version: Version) -> Option<&Deployed> {
        self.by_alias
            .get(alias)
            .and_then(|versions| versions.get(&version))
    }

    /// Signature of a deployed version.
    pub fn signature(&self, alias: &str, version: Version) -> Option<&Arc<VersionSignature>> {
        self.get(alias, version).map(|d| &d.signature)
    }

    /// Deployed versions of an alias, oldest first.
    pub fn versions(&self, alias: &str) -> Vec<Version> {
        self.by_alias
            .get(alias)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Compare a candidate definition against every deployed version of its
    /// alias without deploying it.
    pub fn check_deployment(&self, candidate: &WorkflowDefinition) -> Vec<CompatibilityReport> {
        let candidate_sig = VersionSignature::compute(candidate);
        self.by_alias
            .get(candidate.alias())
            .map(|versions| {
                versions
                    .values()
                    .filter(|d| d.definition.version() != candidate.version())
                    .map(|d| CompatibilityChecker::report(&d.signature, &candidate_sig))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> MethodDef {
        MethodDef::new("main", |_ctx| Ok(Step::done()))
    }

    #[test]
    fn test_version_display_and_parse() {
        let v = Version::new(1, 1, 2);
        assert_eq!(v.to_string(), "1.1.002");
        assert_eq!("1.1.002".parse::<Version>().unwrap(), v);
        assert_eq!("2.0.15".parse::<Version>().unwrap(), Version::new(2, 0, 15));
        assert!("1.1".parse::<Version>().is_err());
        assert!("1.1.1.1".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        let mut versions = vec![
            Version::new(1, 1, 2),
            Version::new(1, 0, 9),
            Version::new(1, 1, 1),
        ];
        versions.sort();
        assert_eq!(
            versions,
            vec![
                Version::new(1, 0, 9),
                Version::new(1, 1, 1),
                Version::new(1, 1, 2)
            ]
        );
    }

    #[test]
    fn test_build_rejects_missing_entry() {
        let err = WorkflowDefinition::builder("wf", Version::new(1, 0, 0))
            .entry("start")
            .method(noop())
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DEFINITION");
        assert!(err.to_string().contains("entry method 'start'"));
    }

    #[test]
    fn test_build_rejects_unknown_callee() {
        let err = WorkflowDefinition::builder("wf", Version::new(1, 0, 0))
            .method(noop().site(CallSite::call("c1", "helper", ["x"])))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("undeclared method 'helper'"));
    }

    #[test]
    fn test_build_rejects_duplicates() {
        let err = WorkflowDefinition::builder("wf", Version::new(1, 0, 0))
            .method(noop())
            .method(noop())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));

        let err = WorkflowDefinition::builder("wf", Version::new(1, 0, 0))
            .method(
                noop()
                    .site(CallSite::wait("w", Vec::<String>::new()))
                    .site(CallSite::wait("w", Vec::<String>::new())),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("call site 'w' declared twice"));
    }

    #[test]
    fn test_registry_latest_and_duplicates() {
        let mut registry = DefinitionRegistry::new();
        for patch in [2, 1] {
            let def = WorkflowDefinition::builder("wf", Version::new(1, 0, patch))
                .method(noop())
                .build()
                .unwrap();
            registry.deploy(def).unwrap();
        }

        let latest = registry.latest("wf").unwrap();
        assert_eq!(latest.definition.version(), Version::new(1, 0, 2));
        assert_eq!(
            registry.versions("wf"),
            vec![Version::new(1, 0, 1), Version::new(1, 0, 2)]
        );
        assert!(registry.latest("other").is_none());

        let dup = WorkflowDefinition::builder("wf", Version::new(1, 0, 1))
            .method(noop())
            .build()
            .unwrap();
        assert!(registry.deploy(dup).is_err());
    }
}
