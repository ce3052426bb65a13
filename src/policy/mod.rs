//! Capability/trust policy gate.
//!
//! Every tool call made from an ACTIONS block goes through
//! [`ExecPolicy::can_call`] before the tool runs. Evaluation order is fixed
//! and each step fails closed:
//!
//! 1. trusted tools only run under [`TrustContext::Config`]
//! 2. a matching `deny` pattern rejects, whatever `allow` says
//! 3. no matching `allow` pattern rejects (an empty list allows nothing)
//! 4. every required capability needs a matching grant
//! 5. limits are checked and committed together

pub mod glob;
pub mod limits;

use std::fmt;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
pub use glob::{any_match, glob_match};
pub use limits::{Counters, GrantSet, Limits};

/// Privilege level a policy is evaluated under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustContext {
    /// Host configuration time. The only context where trusted tools run.
    Config,
    #[default]
    Normal,
    Test,
}

impl TrustContext {
    pub fn permits_trusted(self) -> bool {
        matches!(self, TrustContext::Config)
    }
}

impl fmt::Display for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustContext::Config => f.write_str("config"),
            TrustContext::Normal => f.write_str("normal"),
            TrustContext::Test => f.write_str("test"),
        }
    }
}

/// A declared permission: verbs allowed on a resource within some scopes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Capability {
    pub resource: String,
    pub verbs: Vec<String>,
    pub scopes: Vec<String>,
}

impl Capability {
    pub fn new(resource: &str, verbs: &[&str], scopes: &[&str]) -> Self {
        Self {
            resource: resource.to_string(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Same resource, verb listed (or `*`), and some scope pattern matching.
    pub fn satisfies(&self, req: &CapRequirement) -> bool {
        self.resource == req.resource
            && self.verbs.iter().any(|v| v == "*" || *v == req.verb)
            && any_match(&self.scopes, &req.scope)
    }
}

/// One capability a tool invocation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapRequirement {
    pub resource: String,
    pub verb: String,
    pub scope: String,
}

impl CapRequirement {
    pub fn new(resource: &str, verb: &str, scope: impl Into<String>) -> Self {
        Self {
            resource: resource.to_string(),
            verb: verb.to_string(),
            scope: scope.into(),
        }
    }
}

/// A priced call: `cents` charged against the budget of `center`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Cost {
    pub center: String,
    pub cents: u64,
}

/// Resources an invocation will consume, declared before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub net_calls: u64,
    pub net_bytes: u64,
    pub fs_bytes: u64,
    pub cost: Option<Cost>,
}

/// Everything the gate needs to know about one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMeta {
    /// Fully-qualified tool name, e.g. `fs.read`.
    pub name: String,
    pub requires_trust: bool,
    pub required_caps: Vec<CapRequirement>,
    pub usage: Usage,
}

impl ToolMeta {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires_trust: false,
            required_caps: Vec::new(),
            usage: Usage::default(),
        }
    }
}

/// Per-interpreter execution policy.
///
/// Immutable once built, except for the counters inside the grant set.
#[derive(Debug)]
pub struct ExecPolicy {
    context: TrustContext,
    allow: Vec<String>,
    deny: Vec<String>,
    grants: GrantSet,
}

impl ExecPolicy {
    pub fn new(
        context: TrustContext,
        allow: Vec<String>,
        deny: Vec<String>,
        grants: GrantSet,
    ) -> Self {
        Self {
            context,
            allow,
            deny,
            grants,
        }
    }

    /// A policy that allows nothing.
    pub fn deny_all(context: TrustContext) -> Self {
        Self::new(context, Vec::new(), Vec::new(), GrantSet::default())
    }

    /// A copy of this policy with fresh counters, for a new run.
    pub fn fresh_run(&self) -> Self {
        Self::new(
            self.context,
            self.allow.clone(),
            self.deny.clone(),
            self.grants.fresh(),
        )
    }

    pub fn context(&self) -> TrustContext {
        self.context
    }

    pub fn grants(&self) -> &GrantSet {
        &self.grants
    }

    /// Fails with a trust violation unless running under the config context.
    pub fn require_trust(&self, what: &str) -> Result<()> {
        if self.context.permits_trusted() {
            Ok(())
        } else {
            Err(Error::TrustViolation {
                tool: what.to_string(),
                context: self.context.to_string(),
            })
        }
    }

    /// Decides whether the invocation described by `meta` may run.
    ///
    /// On success the invocation's usage has been committed to the counters.
    pub fn can_call(&self, meta: &ToolMeta) -> Result<()> {
        let name = meta.name.as_str();

        if meta.requires_trust {
            self.require_trust(name).inspect_err(|e| warn!("Gate: {e}"))?;
        }

        if let Some(pattern) = self.deny.iter().find(|p| glob_match(p, name)) {
            warn!("Gate: {name} denied by pattern '{pattern}'");
            return Err(Error::policy(name, format!("is denied by '{pattern}'")));
        }

        if !any_match(&self.allow, name) {
            warn!("Gate: {name} matches no allow pattern");
            return Err(Error::policy(name, "is not allowed"));
        }

        for req in &meta.required_caps {
            let granted = self
                .grants
                .capabilities()
                .iter()
                .any(|cap| cap.satisfies(req));
            if !granted {
                warn!(
                    "Gate: {name} lacks {}:{} on '{}'",
                    req.resource, req.verb, req.scope
                );
                return Err(Error::CapabilityViolation {
                    tool: name.to_string(),
                    resource: req.resource.clone(),
                    verb: req.verb.clone(),
                    scope: req.scope.clone(),
                });
            }
        }

        self.grants.reserve(meta)?;
        debug!("Gate: {name} allowed");
        Ok(())
    }
}
