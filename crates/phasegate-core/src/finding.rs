use serde::{Deserialize, Serialize};

/// Severity of a [`Finding`].
///
/// Variants are declared from lowest to highest so the derived `Ord` ranks
/// `Critical` above everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Cosmetic or informational.
    Low,
    /// Should be addressed, rarely blocking.
    Medium,
    /// Serious issue, usually blocking.
    High,
    /// Must be fixed before any further step.
    Critical,
}

impl Severity {
    /// All severities from highest to lowest.
    pub const DESCENDING: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Action a gate takes, and the kind of verdict it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateAction {
    /// Advance to the next phase.
    Pass,
    /// Advance, but surface the findings in the non-blocking log.
    Warn,
    /// Halt the work item until an operator restarts it.
    Block,
}

impl std::fmt::Display for GateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateAction::Pass => write!(f, "PASS"),
            GateAction::Warn => write!(f, "WARN"),
            GateAction::Block => write!(f, "BLOCK"),
        }
    }
}

/// A structured observation emitted by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// How serious the observation is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Artifact location the finding refers to (file, `file:line`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Suggested remediation, if the agent proposed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Finding {
    /// Creates a finding with the given severity and message.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            location: None,
            remediation: None,
        }
    }

    /// Creates a [`Severity::Critical`] finding.
    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, message)
    }

    /// Creates a [`Severity::High`] finding.
    pub fn high(message: impl Into<String>) -> Self {
        Self::new(Severity::High, message)
    }

    /// Creates a [`Severity::Medium`] finding.
    pub fn medium(message: impl Into<String>) -> Self {
        Self::new(Severity::Medium, message)
    }

    /// Creates a [`Severity::Low`] finding.
    pub fn low(message: impl Into<String>) -> Self {
        Self::new(Severity::Low, message)
    }

    /// Attaches an artifact location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Attaches a suggested remediation.
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}
