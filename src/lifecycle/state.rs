use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    OnFire,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "CREATED",
            Lifecycle::Starting => "STARTING",
            Lifecycle::Running => "RUNNING",
            Lifecycle::Stopping => "STOPPING",
            Lifecycle::Stopped => "STOPPED",
            Lifecycle::OnFire => "ON_FIRE",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("`{entity}` cannot move from {from} to {to}")]
pub struct TransitionError {
    pub entity: String,
    pub from: Lifecycle,
    pub to: Lifecycle,
}

/// Holds one entity's lifecycle state and rejects transitions outside the allowed graph.
#[derive(Debug)]
pub struct LifecycleStateMachine {
    entity: String,
    state: Lifecycle,
}

impl LifecycleStateMachine {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            state: Lifecycle::Created,
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&mut self, next: Lifecycle) -> Result<Lifecycle, TransitionError> {
        if !Self::is_valid_transition(self.state, next) {
            return Err(TransitionError {
                entity: self.entity.clone(),
                from: self.state,
                to: next,
            });
        }

        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub fn is_valid_transition(current: Lifecycle, next: Lifecycle) -> bool {
        match current {
            Lifecycle::Created => matches!(next, Lifecycle::Starting),
            Lifecycle::Starting => matches!(next, Lifecycle::Running | Lifecycle::OnFire),
            Lifecycle::Running => matches!(next, Lifecycle::Stopping | Lifecycle::OnFire),
            Lifecycle::Stopping => matches!(next, Lifecycle::Stopped | Lifecycle::OnFire),
            Lifecycle::Stopped => matches!(next, Lifecycle::Starting),
            Lifecycle::OnFire => matches!(next, Lifecycle::Starting | Lifecycle::Stopping),
        }
    }
}
