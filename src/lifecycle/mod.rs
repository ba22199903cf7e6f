pub mod effector;
pub mod state;

pub use effector::{invoke_start_all, start_each, stop_sequentially};
pub use state::{Lifecycle, LifecycleStateMachine, TransitionError};

use crate::entity::keys::SERVICE_STATE;
use crate::entity::{Entity, Group, Location, StartupDependencies};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::steward_event;
use async_trait::async_trait;
use std::sync::Mutex;

/// Something that can be started at a set of locations and stopped again.
#[async_trait]
pub trait Startable: Send + Sync {
    fn entity(&self) -> &Entity;

    async fn start(&self, locations: &[Location]) -> Result<()> {
        self.start_with(locations, &StartupDependencies::none()).await
    }

    /// Starts once `dependencies` have been resolved onto this entity.
    ///
    /// The start is taken at once: the entity is `STARTING` while it waits, and a failed
    /// or aborted wait puts it `ON_FIRE`.
    async fn start_with(&self, locations: &[Location], dependencies: &StartupDependencies)
        -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        Err(Error::Unsupported {
            operation: "restart",
            entity: self.entity().to_string(),
        })
    }
}

/// A controller that fronts a pool of members.
#[async_trait]
pub trait Bindable: Send + Sync {
    /// Attaches the group this controller fronts. Must happen before `start`.
    async fn bind(&self, pool: Group) -> Result<()>;
}

#[async_trait]
pub trait Reconcilable: Send + Sync {
    /// Pushes the current desired state to the managed service.
    async fn update(&self) -> Result<()>;
}

/// Full capability set of a load-balancing controller.
pub trait PoolController: Startable + Bindable + Reconcilable {}

impl<T> PoolController for T where T: Startable + Bindable + Reconcilable {}

/// Owns an entity's [`Lifecycle`] and mirrors it into `service.state`.
pub struct LifecycleTracker {
    entity: Entity,
    machine: Mutex<LifecycleStateMachine>,
}

impl LifecycleTracker {
    pub fn new(entity: Entity) -> Self {
        entity.set_attribute(&SERVICE_STATE, Lifecycle::Created);
        let machine = LifecycleStateMachine::new(entity.to_string());
        Self {
            entity,
            machine: Mutex::new(machine),
        }
    }

    pub fn current(&self) -> Lifecycle {
        self.machine
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .state()
    }

    pub fn transition(&self, next: Lifecycle, reason: &str) -> Result<(), TransitionError> {
        let previous = self
            .machine
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .transition(next)?;
        self.publish(previous, next, reason);
        Ok(())
    }

    /// Enters `STARTING` from `CREATED`, `STOPPED` or `ON_FIRE`.
    pub fn begin_start(&self) -> Result<()> {
        Ok(self.transition(Lifecycle::Starting, "start requested")?)
    }

    /// Enters `STOPPING` when there is something to stop.
    ///
    /// Returns `Ok(false)` without a transition from `CREATED` or `STOPPED`.
    pub fn begin_stop(&self) -> Result<bool> {
        let previous = {
            let mut machine = self.machine.lock().unwrap_or_else(|err| err.into_inner());
            if matches!(machine.state(), Lifecycle::Created | Lifecycle::Stopped) {
                return Ok(false);
            }
            machine.transition(Lifecycle::Stopping)?
        };
        self.publish(previous, Lifecycle::Stopping, "stop requested");
        Ok(true)
    }

    /// Escalates to `ON_FIRE`, keeping the original error as the one reported.
    pub fn fail(&self, error: &Error) {
        let reason = error.to_string();
        if let Err(transition) = self.transition(Lifecycle::OnFire, &reason) {
            tracing::warn!(
                entity = %self.entity,
                error = %transition,
                "cannot mark entity on fire"
            );
        }
    }

    fn publish(&self, previous: Lifecycle, next: Lifecycle, reason: &str) {
        self.entity.set_attribute(&SERVICE_STATE, next);
        metrics().record_lifecycle_transition(
            &self.entity.to_string(),
            previous.as_str(),
            next.as_str(),
        );
        if next == Lifecycle::OnFire {
            steward_event!(
                error,
                "lifecycle_transition",
                entity = self.entity,
                state_from = previous.as_str(),
                state_to = next.as_str(),
                reason = reason
            );
        } else {
            steward_event!(
                info,
                "lifecycle_transition",
                entity = self.entity,
                state_from = previous.as_str(),
                state_to = next.as_str(),
                reason = reason
            );
        }
    }
}
