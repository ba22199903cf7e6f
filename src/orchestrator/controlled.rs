use crate::cluster::DynamicCluster;
use crate::entity::enricher::{Propagator, Selection};
use crate::entity::keys::{ADDRESS, HOSTNAME, ROOT_URL, SERVICE_UP};
use crate::entity::{Entity, Location, StartupDependencies};
use crate::error::Result;
use crate::lifecycle::{
    invoke_start_all, stop_sequentially, Lifecycle, LifecycleTracker, PoolController, Startable,
};
use crate::steward_event;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A cluster fronted by a controller, managed as one unit.
///
/// Start binds the controller to the cluster, starts both and pushes one update through
/// the controller. The composite then mirrors the cluster's attributes and the
/// controller's endpoint. The controller is only started and stopped here when this
/// composite owns it.
pub struct ControlledCluster {
    entity: Entity,
    cluster: Arc<DynamicCluster>,
    controller: Arc<dyn PoolController>,
    controller_component: Arc<dyn Startable>,
    lifecycle: LifecycleTracker,
    enrichers: Mutex<Option<CancellationToken>>,
}

impl ControlledCluster {
    pub fn new<C>(name: impl Into<String>, cluster: Arc<DynamicCluster>, controller: Arc<C>) -> Self
    where
        C: PoolController + 'static,
    {
        let entity = Entity::new(name);
        entity.set_attribute(&SERVICE_UP, false);
        entity.add_child(cluster.group().entity());

        let controller_component: Arc<dyn Startable> = controller.clone();
        let controller: Arc<dyn PoolController> = controller;
        Self {
            lifecycle: LifecycleTracker::new(entity.clone()),
            entity,
            cluster,
            controller,
            controller_component,
            enrichers: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &Arc<DynamicCluster> {
        &self.cluster
    }

    pub fn controller_entity(&self) -> &Entity {
        self.controller_component.entity()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.current()
    }

    pub async fn resize(&self, desired: usize) -> Result<usize> {
        self.cluster.resize(desired).await
    }

    pub fn current_size(&self) -> usize {
        self.cluster.current_size()
    }

    fn owns_controller(&self) -> bool {
        self.entity.is_parent_of(self.controller_entity())
    }

    fn components(&self) -> Vec<Arc<dyn Startable>> {
        let cluster: Arc<dyn Startable> = self.cluster.clone();
        let mut components = vec![cluster];
        if self.owns_controller() {
            components.push(Arc::clone(&self.controller_component));
        }
        components
    }

    fn attach_enrichers(&self) {
        let cancel = CancellationToken::new();
        Propagator::new(
            self.cluster.group().entity().clone(),
            self.entity.clone(),
            Selection::all_but([SERVICE_UP.name(), ROOT_URL.name()]),
        )
        .spawn(cancel.clone());
        Propagator::new(
            self.controller_entity().clone(),
            self.entity.clone(),
            Selection::only([
                HOSTNAME.name(),
                ADDRESS.name(),
                SERVICE_UP.name(),
                ROOT_URL.name(),
            ]),
        )
        .spawn(cancel.clone());

        let previous = self
            .enrichers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .replace(cancel);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn detach_enrichers(&self) {
        if let Some(cancel) = self
            .enrichers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            cancel.cancel();
        }
    }

    async fn start_inner(&self, locations: &[Location]) -> Result<()> {
        self.controller.bind(self.cluster.group().clone()).await?;
        if self.controller_entity().parent().is_none() {
            self.entity.add_child(self.controller_entity());
        }

        invoke_start_all(&self.components(), locations).await?;
        self.controller.update().await?;
        self.attach_enrichers();
        Ok(())
    }
}

#[async_trait]
impl Startable for ControlledCluster {
    fn entity(&self) -> &Entity {
        &self.entity
    }

    async fn start_with(
        &self,
        locations: &[Location],
        dependencies: &StartupDependencies,
    ) -> Result<()> {
        self.lifecycle.begin_start()?;
        let locations = if locations.is_empty() {
            self.entity.locations()
        } else {
            locations.to_vec()
        };
        self.entity.set_locations(&locations);

        let outcome = async {
            dependencies.resolve(&self.entity).await?;
            self.start_inner(&locations).await
        }
        .await;
        match outcome {
            Ok(()) => {
                self.lifecycle
                    .transition(Lifecycle::Running, "controller and cluster started")?;
                steward_event!(
                    info,
                    "controlled_cluster_started",
                    entity = self.entity,
                    controller = self.controller_entity(),
                    members = self.cluster.current_size()
                );
                Ok(())
            }
            Err(err) => {
                self.lifecycle.fail(&err);
                Err(err)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.begin_stop()? {
            return Ok(());
        }
        self.detach_enrichers();

        // Controller first so traffic stops before its targets disappear.
        let mut components = self.components();
        components.reverse();
        let outcome = stop_sequentially(&components).await;

        self.entity.clear_locations();
        self.entity.set_attribute(&SERVICE_UP, false);
        match outcome {
            Ok(()) => {
                self.lifecycle.transition(Lifecycle::Stopped, "controller and cluster stopped")?;
                Ok(())
            }
            Err(err) => {
                self.lifecycle.fail(&err);
                Err(err)
            }
        }
    }

    async fn restart(&self) -> Result<()> {
        let locations = self.entity.locations();
        self.stop().await?;
        self.start(&locations).await
    }
}

impl Drop for ControlledCluster {
    fn drop(&mut self) {
        self.detach_enrichers();
    }
}
