use crate::error::PhasegateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// A permission an agent declares and a phase requires.
///
/// The textual form is `read`, `read:<scope>` or `write:<scope>`, where a
/// scope names an artifact (a file or a group of files, e.g. `src/auth`).
/// Scoped reads take a shared lock on their scope, writes an exclusive one.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// Read access. `None` means unscoped read of anything.
    Read { scope: Option<String> },
    /// Write access to one artifact scope.
    Write { scope: String },
}

impl Capability {
    /// Unscoped read access.
    pub fn read() -> Self {
        Capability::Read { scope: None }
    }

    /// Read access restricted to `scope`.
    pub fn read_scope(scope: impl Into<String>) -> Self {
        Capability::Read {
            scope: Some(scope.into()),
        }
    }

    /// Write access to `scope`.
    pub fn write(scope: impl Into<String>) -> Self {
        Capability::Write {
            scope: scope.into(),
        }
    }

    /// Whether holding `self` satisfies the `required` capability.
    ///
    /// A scoped grant satisfies requirements on the same scope or any
    /// scope nested below it. Write never implies read.
    pub fn covers(&self, required: &Capability) -> bool {
        match (self, required) {
            (Capability::Read { scope: None }, Capability::Read { .. }) => true,
            (Capability::Read { scope: Some(held) }, Capability::Read { scope: Some(req) }) => {
                scope_covers(held, req)
            }
            (Capability::Write { scope: held }, Capability::Write { scope: req }) => {
                scope_covers(held, req)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Read { scope: None } => write!(f, "read"),
            Capability::Read { scope: Some(s) } => write!(f, "read:{s}"),
            Capability::Write { scope } => write!(f, "write:{scope}"),
        }
    }
}

impl FromStr for Capability {
    type Err = PhasegateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, scope) = match s.split_once(':') {
            Some((kind, scope)) => (kind, Some(scope)),
            None => (s, None),
        };
        match kind.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Capability::Read {
                scope: scope.map(normalize_scope).transpose()?,
            }),
            "write" => {
                let scope = scope.ok_or_else(|| {
                    PhasegateError::Config(format!("Capability '{s}' must name a scope"))
                })?;
                Ok(Capability::Write {
                    scope: normalize_scope(scope)?,
                })
            }
            other => Err(PhasegateError::Config(format!(
                "Unknown capability kind '{other}' in '{s}'"
            ))),
        }
    }
}

impl TryFrom<String> for Capability {
    type Error = PhasegateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.to_string()
    }
}

fn normalize_scope(scope: &str) -> Result<String, PhasegateError> {
    let trimmed = scope.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(PhasegateError::Config(
            "Artifact scope must not be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Whether `outer` contains `inner`: equal, or `inner` nested below `outer`
/// on a `/` boundary. `*` contains every scope.
pub fn scope_covers(outer: &str, inner: &str) -> bool {
    if outer == "*" || outer == inner {
        return true;
    }
    inner
        .strip_prefix(outer)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Whether two artifact scopes share any artifact.
pub fn scopes_overlap(a: &str, b: &str) -> bool {
    scope_covers(a, b) || scope_covers(b, a)
}

/// A set of capabilities, declared by an agent or required by a phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a list of textual capabilities.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, PhasegateError> {
        items.iter().map(|s| s.as_ref().parse()).collect()
    }

    /// Adds a capability.
    pub fn grant(&mut self, cap: Capability) {
        self.capabilities.insert(cap);
    }

    /// Removes a capability.
    pub fn revoke(&mut self, cap: &Capability) {
        self.capabilities.remove(cap);
    }

    /// Exact membership test.
    pub fn has(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    /// Required capabilities not satisfied by any capability in `self`.
    pub fn missing(&self, required: &CapabilitySet) -> Vec<Capability> {
        required
            .iter()
            .filter(|req| !self.capabilities.iter().any(|held| held.covers(req)))
            .cloned()
            .collect()
    }

    /// Whether `self` is a superset of `required` (scope nesting allowed).
    pub fn covers(&self, required: &CapabilitySet) -> bool {
        self.missing(required).is_empty()
    }

    /// Scopes this set writes to.
    pub fn write_scopes(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().filter_map(|c| match c {
            Capability::Write { scope } => Some(scope.as_str()),
            _ => None,
        })
    }

    /// Scopes this set reads from (scoped reads only).
    pub fn read_scopes(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().filter_map(|c| match c {
            Capability::Read { scope: Some(scope) } => Some(scope.as_str()),
            _ => None,
        })
    }

    /// Whether any capability grants write access.
    pub fn requires_write(&self) -> bool {
        self.write_scopes().next().is_some()
    }

    /// Number of capabilities.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Iterates in a stable (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
