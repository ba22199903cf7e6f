use crate::entity::keys::{ADDRESS, HOSTNAME, HOST_AND_PORT, HTTP_PORT, SERVICE_UP};
use crate::entity::{Entity, EntityConfig, Group, Location, StartupDependencies};
use crate::error::{Error, Result};
use crate::lifecycle::{start_each, stop_sequentially, Lifecycle, LifecycleTracker, Startable};
use crate::pool::tracker::{MembershipListener, MembershipTracker};
use crate::steward_event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Creates the members of a [`DynamicCluster`].
#[async_trait]
pub trait MemberFactory: Send + Sync {
    /// Builds member number `index` (zero-based, never reused) for `cluster`.
    async fn create(&self, cluster: &Entity, index: usize) -> Result<Arc<dyn Startable>>;
}

/// Keeps `service.isUp` on the cluster entity true while at least one member is up.
struct AggregateUp {
    group: Group,
}

impl AggregateUp {
    fn refresh(&self) {
        let any_up = self
            .group
            .members()
            .iter()
            .any(|member| member.attribute(&SERVICE_UP) == Some(true));
        self.group.entity().set_attribute(&SERVICE_UP, any_up);
    }
}

#[async_trait]
impl MembershipListener for AggregateUp {
    async fn on_member_added(&self, _member: &Entity) -> Result<()> {
        self.refresh();
        Ok(())
    }

    async fn on_member_removed(&self, _member: &Entity) -> Result<()> {
        self.refresh();
        Ok(())
    }

    async fn on_member_changed(&self, _member: &Entity) -> Result<()> {
        self.refresh();
        Ok(())
    }
}

/// A group that creates, starts and stops its own members.
pub struct DynamicCluster {
    group: Group,
    factory: Arc<dyn MemberFactory>,
    initial_size: usize,
    members: Mutex<Vec<Arc<dyn Startable>>>,
    next_index: AtomicUsize,
    lifecycle: LifecycleTracker,
    aggregate: Arc<AggregateUp>,
    tracker: MembershipTracker,
    shutdown: CancellationToken,
}

impl DynamicCluster {
    pub fn new(
        name: impl Into<String>,
        initial_size: usize,
        factory: Arc<dyn MemberFactory>,
    ) -> Self {
        let group = Group::new(name);
        group.entity().set_attribute(&SERVICE_UP, false);
        let aggregate = Arc::new(AggregateUp {
            group: group.clone(),
        });
        let tracker = MembershipTracker::new(
            format!("{} service-up aggregator", group.name()),
            aggregate.clone(),
        );

        Self {
            lifecycle: LifecycleTracker::new(group.entity().clone()),
            group,
            factory,
            initial_size,
            members: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            aggregate,
            tracker,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    pub fn current_size(&self) -> usize {
        self.group.size()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.current()
    }

    /// Grows or shrinks the cluster to `desired` members and returns the resulting size.
    ///
    /// Shrinking stops and removes the newest members first. Members that fail to start
    /// while growing are removed again and the first failure is returned.
    pub async fn resize(&self, desired: usize) -> Result<usize> {
        let mut members = self.members.lock().await;
        let current = members.len();
        let outcome = if desired > current {
            self.grow(&mut members, desired - current).await
        } else if desired < current {
            self.shrink(&mut members, current - desired).await
        } else {
            Ok(())
        };

        steward_event!(
            info,
            "cluster_resized",
            entity = self.group.entity(),
            from = current,
            to = members.len(),
            desired = desired
        );
        self.aggregate.refresh();
        outcome.map(|_| members.len())
    }

    async fn grow(&self, members: &mut Vec<Arc<dyn Startable>>, count: usize) -> Result<()> {
        let cluster = self.group.entity();
        let mut created = Vec::with_capacity(count);
        let mut first_failure = None;
        for _ in 0..count {
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            match self.factory.create(cluster, index).await {
                Ok(member) => {
                    cluster.add_child(member.entity());
                    self.group.add_member(member.entity());
                    created.push(member);
                }
                Err(err) => {
                    first_failure = Some(err);
                    break;
                }
            }
        }

        let locations = cluster.locations();
        let outcomes = start_each(&created, &locations).await;

        for (member, outcome) in created.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => members.push(member),
                Err(err) => {
                    tracing::warn!(
                        entity = %cluster,
                        member = %member.entity(),
                        error = %err,
                        "member failed to start; removing"
                    );
                    self.group.remove_member(member.entity());
                    cluster.remove_child(member.entity());
                    first_failure
                        .get_or_insert_with(|| Error::start_failed(member.entity().to_string(), err));
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn shrink(&self, members: &mut Vec<Arc<dyn Startable>>, count: usize) -> Result<()> {
        let keep = members.len().saturating_sub(count);
        let mut removed: Vec<Arc<dyn Startable>> = members.drain(keep..).collect();
        removed.reverse();

        // Out of the pool first so controllers stop routing before the member goes away.
        for member in &removed {
            self.group.remove_member(member.entity());
        }
        let outcome = stop_sequentially(&removed).await;
        for member in &removed {
            self.group.entity().remove_child(member.entity());
        }
        outcome
    }
}

#[async_trait]
impl Startable for DynamicCluster {
    fn entity(&self) -> &Entity {
        self.group.entity()
    }

    async fn start_with(
        &self,
        locations: &[Location],
        dependencies: &StartupDependencies,
    ) -> Result<()> {
        self.lifecycle.begin_start()?;
        self.group.entity().set_locations(locations);

        let outcome = async {
            dependencies.resolve(self.group.entity()).await?;
            self.tracker.set_group(self.group.clone(), &self.shutdown);
            self.resize(self.initial_size).await
        }
        .await;
        match outcome {
            Ok(_) => {
                self.lifecycle.transition(Lifecycle::Running, "cluster started")?;
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
        self.tracker.reset();

        let outcome = {
            let mut members = self.members.lock().await;
            let count = members.len();
            self.shrink(&mut members, count).await
        };
        self.group.entity().set_attribute(&SERVICE_UP, false);

        match outcome {
            Ok(()) => {
                self.group.entity().clear_locations();
                self.lifecycle.transition(Lifecycle::Stopped, "cluster stopped")?;
                Ok(())
            }
            Err(err) => {
                self.lifecycle.fail(&err);
                Err(err)
            }
        }
    }

    async fn restart(&self) -> Result<()> {
        let locations = self.group.entity().locations();
        self.stop().await?;
        self.start(&locations).await
    }
}

impl Drop for DynamicCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A pre-existing backend, described by host and port in its entity config.
pub struct StaticServer {
    entity: Entity,
    probe_timeout: Option<Duration>,
    lifecycle: LifecycleTracker,
}

impl StaticServer {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let config = EntityConfig::new()
            .with(&HOSTNAME, host.into())
            .with(&HTTP_PORT, port);
        let entity = Entity::with_config(name, config);
        entity.set_attribute(&SERVICE_UP, false);
        Self {
            lifecycle: LifecycleTracker::new(entity.clone()),
            entity,
            probe_timeout: None,
        }
    }

    /// Requires a TCP connection to succeed within `timeout` before reporting up.
    pub fn with_probe(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.current()
    }

    fn endpoint(&self) -> Result<(String, u16)> {
        let host = self.entity.config().get(&HOSTNAME);
        let port = self.entity.config().get(&HTTP_PORT);
        match (host, port) {
            (Some(host), Some(port)) => Ok((host, port)),
            _ => Err(Error::configuration(format!(
                "`{}` needs both a host and a port",
                self.entity
            ))),
        }
    }

    async fn probe(&self, host: &str, port: u16) -> Result<()> {
        let Some(limit) = self.probe_timeout else {
            return Ok(());
        };
        match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(Error::with_context(
                format!("probing {host}:{port}"),
                err.into(),
            )),
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let (host, port) = self.endpoint()?;
        self.probe(&host, port).await?;

        self.entity.set_attribute(&HOSTNAME, host.clone());
        self.entity.set_attribute(&ADDRESS, host.clone());
        self.entity.set_attribute(&HTTP_PORT, port);
        self.entity
            .set_attribute(&HOST_AND_PORT, format!("{host}:{port}"));
        self.entity.set_attribute(&SERVICE_UP, true);
        Ok(())
    }
}

#[async_trait]
impl Startable for StaticServer {
    fn entity(&self) -> &Entity {
        &self.entity
    }

    async fn start_with(
        &self,
        locations: &[Location],
        dependencies: &StartupDependencies,
    ) -> Result<()> {
        self.lifecycle.begin_start()?;
        self.entity.set_locations(locations);
        let outcome = async {
            dependencies.resolve(&self.entity).await?;
            self.start_inner().await
        }
        .await;
        match outcome {
            Ok(()) => {
                self.lifecycle.transition(Lifecycle::Running, "backend reachable")?;
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
        self.entity.set_attribute(&SERVICE_UP, false);
        self.entity.clear_locations();
        self.lifecycle.transition(Lifecycle::Stopped, "backend released")?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let locations = self.entity.locations();
        self.stop().await?;
        self.start(&locations).await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticMember {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Hands out a fixed list of backends, one per member index.
#[derive(Clone, Debug)]
pub struct StaticMemberFactory {
    members: Vec<StaticMember>,
    probe_timeout: Option<Duration>,
}

impl StaticMemberFactory {
    pub fn new(members: Vec<StaticMember>, probe_timeout: Option<Duration>) -> Self {
        Self {
            members,
            probe_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl MemberFactory for StaticMemberFactory {
    async fn create(&self, cluster: &Entity, index: usize) -> Result<Arc<dyn Startable>> {
        let spec = self.members.get(index).ok_or_else(|| {
            Error::configuration(format!(
                "`{cluster}` declares {} static member(s); member #{index} does not exist",
                self.members.len()
            ))
        })?;

        let mut server = StaticServer::new(spec.name.clone(), spec.host.clone(), spec.port);
        if let Some(timeout) = self.probe_timeout {
            server = server.with_probe(timeout);
        }
        Ok(Arc::new(server))
    }
}
