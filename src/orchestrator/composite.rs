use crate::entity::enricher::{Propagator, Selection};
use crate::entity::keys::SERVICE_UP;
use crate::entity::{Entity, Group, Location, StartupDependencies};
use crate::error::{Error, Result};
use crate::lifecycle::{stop_sequentially, Lifecycle, LifecycleTracker, Startable};
use crate::orchestrator::tier::{topological_order, Tier};
use crate::pool::tracker::{DerivedMembership, MembershipTracker};
use crate::steward_event;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

struct DerivedGroup {
    source: Group,
    policy: DerivedMembership,
}

struct Propagation {
    tier: usize,
    selection: Selection,
}

/// Background policies attached once a start succeeds; detached on stop.
#[derive(Default)]
struct Runtime {
    cancel: Option<CancellationToken>,
    // Held only so the trackers stay attached; dropping one detaches it.
    _trackers: Vec<MembershipTracker>,
}

pub struct CompositeBuilder {
    name: String,
    tiers: Vec<Tier>,
    derived: Vec<DerivedGroup>,
    propagations: Vec<(String, Selection)>,
}

impl CompositeBuilder {
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tiers.push(tier);
        self
    }

    /// After startup, mirror membership of `source` into the policy's target group.
    pub fn derived_membership(mut self, source: Group, policy: DerivedMembership) -> Self {
        self.derived.push(DerivedGroup { source, policy });
        self
    }

    /// After startup, copy the selected attributes of `tier` onto the composite.
    pub fn propagate(mut self, tier: impl Into<String>, selection: Selection) -> Self {
        self.propagations.push((tier.into(), selection));
        self
    }

    pub fn build(self) -> Result<CompositeOrchestrator> {
        let names: Vec<String> = self.tiers.iter().map(|tier| tier.name().to_string()).collect();
        let mut problems = Vec::new();

        for (index, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                problems.push(format!("tier #{index} has an empty name"));
            }
            if names[..index].contains(name) {
                problems.push(format!("tier `{name}` is declared more than once"));
            }
        }

        let dependencies: Vec<Vec<String>> = self
            .tiers
            .iter()
            .map(|tier| {
                let mut deps: Vec<String> = tier
                    .requirements()
                    .iter()
                    .map(|requirement| requirement.tier.clone())
                    .collect();
                if let Some(binding) = tier.binding() {
                    if let Some(pool_tier) = self
                        .tiers
                        .iter()
                        .find(|candidate| candidate.component().entity() == binding.pool.entity())
                    {
                        deps.push(pool_tier.name().to_string());
                    }
                }
                deps
            })
            .collect();

        for tier in &self.tiers {
            for requirement in tier.requirements() {
                if !names.contains(&requirement.tier) {
                    problems.push(format!(
                        "tier `{}` requires unknown tier `{}`",
                        tier.name(),
                        requirement.tier
                    ));
                }
            }
        }

        let mut propagations = Vec::new();
        for (tier, selection) in self.propagations {
            match names.iter().position(|name| *name == tier) {
                Some(index) => propagations.push(Propagation {
                    tier: index,
                    selection,
                }),
                None => problems.push(format!("cannot propagate from unknown tier `{tier}`")),
            }
        }

        let start_order = match topological_order(&names, &dependencies) {
            Ok(order) => order,
            Err(cycle) => {
                problems.push(format!("tier dependencies form a cycle: {}", cycle.join(", ")));
                Vec::new()
            }
        };

        if !problems.is_empty() {
            return Err(Error::configuration(format!(
                "invalid composite `{}`: {}",
                self.name,
                problems.join("; ")
            )));
        }

        let entity = Entity::new(self.name);
        entity.set_attribute(&SERVICE_UP, false);
        for tier in &self.tiers {
            entity.add_child(tier.component().entity());
        }

        Ok(CompositeOrchestrator {
            lifecycle: LifecycleTracker::new(entity.clone()),
            entity,
            tiers: self.tiers,
            start_order,
            derived: self.derived,
            propagations,
            runtime: Mutex::new(Runtime::default()),
        })
    }
}

/// Starts, stops and restarts a fixed set of tiers as one unit.
///
/// Every tier is issued its start at once. A tier with requirements stays `STARTING`
/// until the attributes it needs are published and copied onto it. A failure leaves
/// already started tiers running and puts the composite `ON_FIRE`. Stop runs tier by tier
/// in reverse dependency order.
pub struct CompositeOrchestrator {
    entity: Entity,
    tiers: Vec<Tier>,
    start_order: Vec<usize>,
    lifecycle: LifecycleTracker,
    derived: Vec<DerivedGroup>,
    propagations: Vec<Propagation>,
    runtime: Mutex<Runtime>,
}

impl CompositeOrchestrator {
    pub fn builder(name: impl Into<String>) -> CompositeBuilder {
        CompositeBuilder {
            name: name.into(),
            tiers: Vec::new(),
            derived: Vec::new(),
            propagations: Vec::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.current()
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn tier(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|tier| tier.name() == name)
    }

    pub fn is_restartable(&self) -> bool {
        self.tiers.iter().all(Tier::is_restartable)
    }

    pub fn start_order(&self) -> Vec<&str> {
        self.start_order
            .iter()
            .map(|index| self.tiers[*index].name())
            .collect()
    }

    pub fn stop_order(&self) -> Vec<&str> {
        self.start_order
            .iter()
            .rev()
            .map(|index| self.tiers[*index].name())
            .collect()
    }

    async fn bind_controllers(&self) -> Result<()> {
        for tier in &self.tiers {
            if let Some(binding) = tier.binding() {
                binding
                    .controller
                    .bind(binding.pool.clone())
                    .await
                    .map_err(|err| Error::start_failed(tier.name(), err))?;
                tracing::debug!(
                    entity = %self.entity,
                    tier = tier.name(),
                    pool = %binding.pool.entity(),
                    "controller bound to pool"
                );
            }
        }
        Ok(())
    }

    async fn start_tiers(&self, locations: &[Location]) -> Result<()> {
        let started_at = Instant::now();
        let abort_waits = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (index, tier) in self.tiers.iter().enumerate() {
            let component = Arc::clone(tier.component());
            let dependencies = tier.requirements().iter().fold(
                StartupDependencies::new(abort_waits.clone()),
                |dependencies, requirement| match self.tier(&requirement.tier) {
                    Some(producer) => dependencies.require(
                        producer.component().entity().clone(),
                        requirement.attribute.clone(),
                        requirement.timeout,
                    ),
                    None => dependencies,
                },
            );
            let locations = locations.to_vec();

            tasks.spawn(async move {
                let outcome = component.start_with(&locations, &dependencies).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<()>>> = self.tiers.iter().map(|_| None).collect();
        let mut aborted = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if outcome.is_err() {
                        abort_waits.cancel();
                    }
                    outcomes[index] = Some(outcome);
                }
                Err(err) => {
                    abort_waits.cancel();
                    aborted.get_or_insert(err);
                }
            }
        }

        let duration_ms = started_at.elapsed().as_millis() as u64;
        let failures: Vec<(usize, Error)> = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| match outcome {
                Some(Err(err)) => Some((index, err)),
                _ => None,
            })
            .collect();

        // Tiers whose waits were aborted by another failure are not the cause.
        let reported = failures
            .iter()
            .position(|(_, err)| !matches!(err, Error::Cancelled))
            .unwrap_or(0);
        if let Some((index, err)) = failures.into_iter().nth(reported) {
            let tier = &self.tiers[index];
            tracing::error!(
                entity = %self.entity,
                tier = tier.name(),
                error = %err,
                duration_ms,
                "tier start failed"
            );
            return Err(Error::start_failed(tier.name(), err));
        }
        if let Some(err) = aborted {
            return Err(Error::Join(err));
        }

        tracing::debug!(entity = %self.entity, tiers = self.tiers.len(), duration_ms, "all tiers started");
        Ok(())
    }

    fn attach_policies(&self) {
        let cancel = CancellationToken::new();
        let mut trackers = Vec::new();

        for derived in &self.derived {
            let policy = Arc::new(derived.policy.clone());
            let tracker = MembershipTracker::new(
                format!("{} derived {}", self.entity.name(), policy.target().name()),
                policy.clone(),
            );
            tracker.set_group(derived.source.clone(), &cancel);
            for member in derived.source.members() {
                policy.mirror(&member);
            }
            trackers.push(tracker);
        }

        for propagation in &self.propagations {
            let producer = self.tiers[propagation.tier].component().entity().clone();
            Propagator::new(producer, self.entity.clone(), propagation.selection.clone())
                .spawn(cancel.clone());
        }

        spawn_aggregate_up(
            self.tiers
                .iter()
                .map(|tier| tier.component().entity().clone())
                .collect(),
            self.entity.clone(),
            cancel.clone(),
        );

        let previous = std::mem::replace(
            &mut *self.runtime.lock().unwrap_or_else(|err| err.into_inner()),
            Runtime {
                cancel: Some(cancel),
                _trackers: trackers,
            },
        );
        if let Some(stale) = previous.cancel {
            stale.cancel();
        }
    }

    fn detach_policies(&self) {
        let runtime = std::mem::take(&mut *self.runtime.lock().unwrap_or_else(|err| err.into_inner()));
        if let Some(cancel) = runtime.cancel {
            cancel.cancel();
        }
    }
}

fn refresh_aggregate_up(tiers: &[Entity], target: &Entity) {
    let all_up = tiers
        .iter()
        .all(|tier| tier.attribute(&SERVICE_UP) == Some(true));
    target.set_attribute(&SERVICE_UP, all_up);
}

/// Sets `service.isUp` on `target` to whether every tier entity reports up, and keeps it
/// current until `cancel` fires.
fn spawn_aggregate_up(tiers: Vec<Entity>, target: Entity, cancel: CancellationToken) {
    refresh_aggregate_up(&tiers, &target);

    let tiers = Arc::new(tiers);
    for tier in tiers.iter() {
        let mut changes = tier.attributes().subscribe();
        let tiers = Arc::clone(&tiers);
        let target = target.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(change) if change.name == SERVICE_UP.name() => {
                            refresh_aggregate_up(&tiers, &target);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => refresh_aggregate_up(&tiers, &target),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Startable for CompositeOrchestrator {
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
            self.bind_controllers().await?;
            self.start_tiers(&locations).await?;
            self.attach_policies();
            Ok::<_, Error>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.lifecycle.transition(Lifecycle::Running, "all tiers started")?;
                steward_event!(
                    info,
                    "composite_started",
                    entity = self.entity,
                    tiers = self.start_order().join(","),
                    service_up = self.entity.attribute(&SERVICE_UP).unwrap_or(false)
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
        self.detach_policies();

        let ordered: Vec<Arc<dyn Startable>> = self
            .start_order
            .iter()
            .rev()
            .map(|index| Arc::clone(self.tiers[*index].component()))
            .collect();

        match stop_sequentially(&ordered).await {
            Ok(()) => {
                self.entity.clear_locations();
                self.entity.set_attribute(&SERVICE_UP, false);
                self.lifecycle.transition(Lifecycle::Stopped, "all tiers stopped")?;
                Ok(())
            }
            Err(err) => {
                self.entity.set_attribute(&SERVICE_UP, false);
                self.lifecycle.fail(&err);
                Err(err)
            }
        }
    }

    async fn restart(&self) -> Result<()> {
        if !self.is_restartable() {
            let pinned: Vec<&str> = self
                .tiers
                .iter()
                .filter(|tier| !tier.is_restartable())
                .map(Tier::name)
                .collect();
            tracing::warn!(
                entity = %self.entity,
                tiers = %pinned.join(","),
                "restart rejected: tiers cannot be restarted as a unit"
            );
            return Err(Error::Unsupported {
                operation: "restart",
                entity: self.entity.to_string(),
            });
        }

        let locations = self.entity.locations();
        self.stop().await?;
        self.start(&locations).await
    }
}

impl Drop for CompositeOrchestrator {
    fn drop(&mut self) {
        self.detach_policies();
    }
}
