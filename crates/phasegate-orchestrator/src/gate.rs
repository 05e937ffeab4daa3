use phasegate_core::{Finding, GateAction, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity → action table of one phase.
///
/// In TOML: `gate = { CRITICAL = "BLOCK", HIGH = "BLOCK", MEDIUM = "WARN" }`.
/// Severities without an entry map to [`GateAction::Warn`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateRules(BTreeMap<Severity, GateAction>);

impl GateRules {
    /// Rules with no entries; every severity maps to WARN.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the action for `severity`.
    pub fn with(mut self, severity: Severity, action: GateAction) -> Self {
        self.0.insert(severity, action);
        self
    }

    /// Block on `severity` and everything above it.
    pub fn block_at_or_above(threshold: Severity) -> Self {
        Severity::DESCENDING
            .iter()
            .filter(|s| **s >= threshold)
            .map(|s| (*s, GateAction::Block))
            .collect()
    }

    /// Action configured for `severity`, WARN when unset.
    pub fn action_for(&self, severity: Severity) -> GateAction {
        self.0.get(&severity).copied().unwrap_or(GateAction::Warn)
    }
}

impl FromIterator<(Severity, GateAction)> for GateRules {
    fn from_iter<I: IntoIterator<Item = (Severity, GateAction)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Outcome of gating one phase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Overall outcome.
    pub action: GateAction,
    /// Findings at the highest severity present. Empty on PASS.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggering: Vec<Finding>,
}

impl Verdict {
    /// Verdict for a phase with no findings.
    pub fn pass() -> Self {
        Self {
            action: GateAction::Pass,
            triggering: Vec::new(),
        }
    }
}

/// Map findings to a verdict.
///
/// The highest severity present decides the action; no findings always
/// passes. Pure: the result depends only on the arguments.
pub fn evaluate(findings: &[Finding], rules: &GateRules) -> Verdict {
    let Some(highest) = findings.iter().map(|f| f.severity).max() else {
        return Verdict::pass();
    };

    let action = rules.action_for(highest);
    let triggering = if action == GateAction::Pass {
        Vec::new()
    } else {
        findings
            .iter()
            .filter(|f| f.severity == highest)
            .cloned()
            .collect()
    };

    Verdict { action, triggering }
}
