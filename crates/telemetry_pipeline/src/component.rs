//! Component identity and lifecycle.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Which configuration section a component belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Receiver,
    Processor,
    Exporter,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Receiver => "receiver",
            Section::Processor => "processor",
            Section::Exporter => "exporter",
        };
        f.write_str(name)
    }
}

/// `type` or `type/name`, e.g. `batch` or `batch/fast`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    kind: String,
    name: Option<String>,
}

impl ComponentId {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid component id `{0}`: expected `type` or `type/name`")]
pub struct InvalidComponentId(pub String);

impl FromStr for ComponentId {
    type Err = InvalidComponentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid_kind = |k: &str| {
            !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => (kind, Some(name)),
            None => (s, None),
        };
        if !valid_kind(kind) || name.is_some_and(|n| n.is_empty() || n.contains('/')) {
            return Err(InvalidComponentId(s.to_string()));
        }
        Ok(Self {
            kind: kind.to_string(),
            name: name.map(str::to_string),
        })
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.kind, name),
            None => f.write_str(&self.kind),
        }
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle shared by every component and by the service as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Created,
    Started,
    Draining,
    Stopped,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Created => "created",
            ComponentState::Started => "started",
            ComponentState::Draining => "draining",
            ComponentState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ComponentState,
    pub to: ComponentState,
}

/// Forward-only state machine. `Created -> Stopped` is allowed so a
/// component that never started can still be stopped.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ComponentState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(ComponentState::Created),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> ComponentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transition(&self, to: ComponentState) -> Result<(), InvalidTransition> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        let allowed = matches!(
            (from, to),
            (ComponentState::Created, ComponentState::Started)
                | (ComponentState::Started, ComponentState::Draining)
                | (ComponentState::Draining, ComponentState::Stopped)
                | (ComponentState::Created, ComponentState::Stopped)
        );
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        *state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_component_ids() {
        let id: ComponentId = "batch/fast".parse().unwrap();
        assert_eq!(id.kind(), "batch");
        assert_eq!(id.name(), Some("fast"));
        assert_eq!(id.to_string(), "batch/fast");

        let id: ComponentId = "tail_sampling".parse().unwrap();
        assert_eq!(id.name(), None);

        for bad in ["", "/x", "batch/", "ba tch", "a/b/c"] {
            assert!(bad.parse::<ComponentId>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let lifecycle = Lifecycle::default();
        assert!(lifecycle.transition(ComponentState::Draining).is_err());
        lifecycle.transition(ComponentState::Started).unwrap();
        lifecycle.transition(ComponentState::Draining).unwrap();
        assert!(lifecycle.transition(ComponentState::Started).is_err());
        lifecycle.transition(ComponentState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), ComponentState::Stopped);
    }
}
