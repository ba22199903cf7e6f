use crate::cluster::{DynamicCluster, StaticMember, StaticMemberFactory};
use crate::config::deployment::{ControllerDefinition, DeploymentConfig, TierDefinition};
use crate::config::StewardConfig;
use crate::entity::enricher::Selection;
use crate::entity::keys::{ADDRESS, HOSTNAME, ROOT_URL};
use crate::entity::Location;
use crate::error::{Context, Error, Result};
use crate::lifecycle::Startable;
use crate::orchestrator::{CompositeBuilder, CompositeOrchestrator, Requirement, Tier};
use crate::pool::{ControllerSpec, DerivedMembership, LoadBalancer, UpstreamFile};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

const DEFAULT_LOCATION: &str = "localhost";

/// A deployment assembled from its descriptor and ready to be started.
pub struct StewardApp {
    config: StewardConfig,
    deployment: Arc<DeploymentConfig>,
    orchestrator: Arc<CompositeOrchestrator>,
    clusters: HashMap<String, Arc<DynamicCluster>>,
    controller: Option<Arc<LoadBalancer>>,
}

impl StewardApp {
    /// Loads the descriptor named by `config.deployment_path` and assembles it.
    pub fn initialise(config: StewardConfig) -> Result<Self> {
        let path = match config.deployment_path.as_deref() {
            Some(path) if !path.trim().is_empty() => path.to_string(),
            _ => {
                return Err(Error::configuration(
                    "no deployment descriptor configured (pass --config or set STEWARD__DEPLOYMENT_PATH)",
                ))
            }
        };
        let deployment = DeploymentConfig::from_path(&path)
            .with_context(|| format!("failed to load deployment descriptor from {path}"))?;
        Self::from_deployment(config, deployment)
    }

    pub fn from_deployment(config: StewardConfig, deployment: DeploymentConfig) -> Result<Self> {
        let mut clusters = HashMap::new();
        let mut builder = CompositeOrchestrator::builder(deployment.name.clone());

        for definition in &deployment.tiers {
            let cluster = Arc::new(build_cluster(definition));
            clusters.insert(definition.name.clone(), Arc::clone(&cluster));
            builder = builder.tier(build_tier(definition, cluster));
        }

        let controller = match &deployment.controller {
            Some(definition) => {
                let (next, controller) = attach_controller(builder, definition, &clusters)?;
                builder = next;
                Some(controller)
            }
            None => None,
        };

        if let Some(colocated) = &deployment.colocated {
            let (Some(source), Some(target)) = (
                clusters.get(&colocated.source),
                clusters.get(&colocated.target),
            ) else {
                return Err(Error::configuration(format!(
                    "colocated tiers `{}` and `{}` must both be declared",
                    colocated.source, colocated.target
                )));
            };
            builder = builder.derived_membership(
                source.group().clone(),
                DerivedMembership::identity(target.group().clone()),
            );
        }

        let orchestrator = Arc::new(builder.build()?);
        tracing::info!(
            entity = %orchestrator.entity(),
            tiers = deployment.tiers.len(),
            controller = deployment.controller.is_some(),
            "deployment assembled"
        );

        Ok(Self {
            config,
            deployment: Arc::new(deployment),
            orchestrator,
            clusters,
            controller,
        })
    }

    pub fn deployment(&self) -> &Arc<DeploymentConfig> {
        &self.deployment
    }

    pub fn orchestrator(&self) -> &Arc<CompositeOrchestrator> {
        &self.orchestrator
    }

    pub fn cluster(&self, name: &str) -> Option<&Arc<DynamicCluster>> {
        self.clusters.get(name)
    }

    pub fn controller(&self) -> Option<&Arc<LoadBalancer>> {
        self.controller.as_ref()
    }

    pub async fn start(&self) -> Result<()> {
        self.orchestrator
            .start(&[Location::new(DEFAULT_LOCATION)])
            .await
    }

    /// Stops the deployment, giving up after the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let limit = self.config.shutdown_timeout;
        let started_at = Instant::now();
        match timeout(limit, self.orchestrator.stop()).await {
            Ok(result) => {
                tracing::info!(
                    entity = %self.orchestrator.entity(),
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "deployment stopped"
                );
                result
            }
            Err(_) => {
                tracing::error!(
                    entity = %self.orchestrator.entity(),
                    timeout = ?limit,
                    "deployment stop exceeded shutdown_timeout"
                );
                Err(Error::Timeout(limit))
            }
        }
    }

    /// Starts the deployment, waits for Ctrl+C and stops it again.
    pub async fn run(self) -> Result<()> {
        self.start().await?;
        tracing::info!(
            entity = %self.orchestrator.entity(),
            start_order = %self.orchestrator.start_order().join(","),
            "steward running; press Ctrl+C to stop"
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown signal received");
        self.shutdown().await
    }
}

fn build_cluster(definition: &TierDefinition) -> DynamicCluster {
    let members = definition
        .members
        .iter()
        .map(|member| StaticMember {
            name: member.name.clone(),
            host: member.host.clone(),
            port: member.port,
        })
        .collect();
    let factory = StaticMemberFactory::new(members, definition.probe_timeout);
    DynamicCluster::new(definition.name.clone(), definition.initial_size, Arc::new(factory))
}

fn build_tier(definition: &TierDefinition, cluster: Arc<DynamicCluster>) -> Tier {
    let mut tier = Tier::new(definition.name.clone(), cluster).restartable(definition.restartable);
    for requirement in &definition.requires {
        let mut needed = Requirement::new(requirement.tier.clone(), requirement.attribute.clone());
        if let Some(limit) = requirement.timeout {
            needed = needed.within(limit);
        }
        tier = tier.requires(needed);
    }
    tier
}

fn attach_controller(
    builder: CompositeBuilder,
    definition: &ControllerDefinition,
    clusters: &HashMap<String, Arc<DynamicCluster>>,
) -> Result<(CompositeBuilder, Arc<LoadBalancer>)> {
    let pool = clusters
        .get(&definition.pool)
        .map(|cluster| cluster.group().clone())
        .ok_or_else(|| {
            Error::configuration(format!(
                "controller `{}` fronts unknown tier `{}`",
                definition.name, definition.pool
            ))
        })?;

    let mut spec = ControllerSpec::new(definition.name.clone(), definition.selector.clone())
        .with_pool(pool.clone());
    if let Some(listen) = &definition.listen {
        spec = spec.listening_on(listen.host.clone(), listen.port);
    }
    let upstream = UpstreamFile::new(definition.upstream.clone(), definition.config_path.clone())
        .with_reload_command(definition.reload_command.clone());
    let controller = Arc::new(LoadBalancer::with_upstream_file(spec, upstream));

    let builder = builder
        .tier(Tier::controller(
            definition.name.clone(),
            Arc::clone(&controller),
            pool,
        ))
        .propagate(
            definition.name.clone(),
            Selection::only([HOSTNAME.name(), ADDRESS.name(), ROOT_URL.name()]),
        );
    Ok((builder, controller))
}
