//! Consumption limits and the counters they are checked against.
//!
//! Counters only ever grow. A reservation either passes every check and
//! commits all of its usage, or fails and commits nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{Capability, ToolMeta};
use crate::error::{Error, LimitKind, Result};

/// Caps configured on a policy. `None` and absent map keys mean unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Limits {
    /// Maximum number of calls per fully-qualified tool name.
    #[serde(default)]
    pub tool_max_calls: HashMap<String, u64>,
    pub net_max_calls: Option<u64>,
    pub net_max_bytes: Option<u64>,
    pub fs_max_bytes: Option<u64>,
    /// Maximum cost of a single call, per cost center, in minor units.
    #[serde(default)]
    pub budget_per_call_cents: HashMap<String, u64>,
    /// Maximum total spend over one run, per cost center.
    #[serde(default)]
    pub budget_per_run_cents: HashMap<String, u64>,
}

/// Usage consumed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub tool_calls: HashMap<String, u64>,
    pub net_calls: u64,
    pub net_bytes: u64,
    pub fs_bytes: u64,
    pub spent_cents: HashMap<String, u64>,
}

fn ensure(limit: LimitKind, used: u64, requested: u64, max: Option<u64>) -> Result<()> {
    match max {
        Some(max) if used.saturating_add(requested) > max => Err(Error::LimitExceeded {
            limit,
            used,
            requested,
            max,
        }),
        _ => Ok(()),
    }
}

impl Limits {
    fn check(&self, counters: &Counters, meta: &ToolMeta) -> Result<()> {
        let used_calls = counters.tool_calls.get(&meta.name).copied().unwrap_or(0);
        ensure(
            LimitKind::ToolCalls(meta.name.clone()),
            used_calls,
            1,
            self.tool_max_calls.get(&meta.name).copied(),
        )?;

        let usage = &meta.usage;
        ensure(
            LimitKind::NetCalls,
            counters.net_calls,
            usage.net_calls,
            self.net_max_calls,
        )?;
        ensure(
            LimitKind::NetBytes,
            counters.net_bytes,
            usage.net_bytes,
            self.net_max_bytes,
        )?;
        ensure(
            LimitKind::FsBytes,
            counters.fs_bytes,
            usage.fs_bytes,
            self.fs_max_bytes,
        )?;

        if let Some(cost) = &usage.cost {
            ensure(
                LimitKind::BudgetPerCall(cost.center.clone()),
                0,
                cost.cents,
                self.budget_per_call_cents.get(&cost.center).copied(),
            )?;
            ensure(
                LimitKind::BudgetPerRun(cost.center.clone()),
                counters.spent_cents.get(&cost.center).copied().unwrap_or(0),
                cost.cents,
                self.budget_per_run_cents.get(&cost.center).copied(),
            )?;
        }
        Ok(())
    }
}

impl Counters {
    fn commit(&mut self, meta: &ToolMeta) {
        *self.tool_calls.entry(meta.name.clone()).or_insert(0) += 1;
        let usage = &meta.usage;
        self.net_calls = self.net_calls.saturating_add(usage.net_calls);
        self.net_bytes = self.net_bytes.saturating_add(usage.net_bytes);
        self.fs_bytes = self.fs_bytes.saturating_add(usage.fs_bytes);
        if let Some(cost) = &usage.cost {
            let spent = self.spent_cents.entry(cost.center.clone()).or_insert(0);
            *spent = spent.saturating_add(cost.cents);
        }
    }
}

/// Capability grants plus the limits and counters that go with them.
#[derive(Debug, Default)]
pub struct GrantSet {
    capabilities: Vec<Capability>,
    limits: Limits,
    counters: Mutex<Counters>,
}

impl GrantSet {
    pub fn new(capabilities: Vec<Capability>, limits: Limits) -> Self {
        Self {
            capabilities,
            limits,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Same grants and limits, counters reset.
    pub fn fresh(&self) -> Self {
        Self::new(self.capabilities.clone(), self.limits.clone())
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> Counters {
        match self.counters.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Checks every limit for `meta` and commits its usage, atomically.
    pub(crate) fn reserve(&self, meta: &ToolMeta) -> Result<()> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| Error::Internal("policy counters lock poisoned".to_string()))?;

        if let Err(e) = self.limits.check(&counters, meta) {
            warn!("Limit check failed for {}: {e}", meta.name);
            return Err(e);
        }
        counters.commit(meta);
        debug!(
            "Reserved usage for {} (calls: {})",
            meta.name,
            counters.tool_calls.get(&meta.name).copied().unwrap_or(0)
        );
        Ok(())
    }
}
