use crate::entity::keys::{ADDRESS, HOSTNAME, ROOT_URL, SERVICE_UP};
use crate::entity::{Entity, Group, Location, StartupDependencies};
use crate::error::{Context, Error, Result};
use crate::lifecycle::{Bindable, Lifecycle, LifecycleTracker, Reconcilable, Startable};
use crate::pool::address::AddressSelectorConfig;
use crate::pool::reconciler::{ServerPoolReconciler, ServerPoolSnapshot, ServiceReconfigurer};
use crate::pool::tracker::MembershipTracker;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddress {
    pub host: String,
    pub port: u16,
}

/// Everything needed to build a [`LoadBalancer`].
#[derive(Clone, Debug)]
pub struct ControllerSpec {
    pub name: String,
    pub selector: AddressSelectorConfig,
    /// Pool known at construction time; `bind` may still replace it before start.
    pub pool: Option<Group>,
    pub listen: Option<ListenAddress>,
}

impl ControllerSpec {
    pub fn new(name: impl Into<String>, selector: AddressSelectorConfig) -> Self {
        Self {
            name: name.into(),
            selector,
            pool: None,
            listen: None,
        }
    }

    pub fn with_pool(mut self, pool: Group) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn listening_on(mut self, host: impl Into<String>, port: u16) -> Self {
        self.listen = Some(ListenAddress {
            host: host.into(),
            port,
        });
        self
    }
}

/// Controller fronting a pool of members through a [`ServiceReconfigurer`].
///
/// The pool has to be bound before `start`; startup attaches the membership tracker,
/// rescans the pool and then activates the reconciler so any owed update runs once.
pub struct LoadBalancer {
    entity: Entity,
    reconciler: Arc<ServerPoolReconciler>,
    tracker: MembershipTracker,
    lifecycle: LifecycleTracker,
    pool: Mutex<Option<Group>>,
    listen: Option<ListenAddress>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl LoadBalancer {
    pub fn new(spec: ControllerSpec, service: Arc<dyn ServiceReconfigurer>) -> Self {
        let entity = Entity::new(spec.name.clone());
        entity.set_attribute(&SERVICE_UP, false);

        let reconciler = Arc::new(ServerPoolReconciler::new(
            entity.clone(),
            spec.selector.clone(),
            service,
        ));

        let mut tracked = vec![SERVICE_UP.name().to_string()];
        tracked.extend(
            [
                spec.selector.host_and_port.clone(),
                spec.selector.hostname.clone(),
                spec.selector.port.clone(),
            ]
            .into_iter()
            .flatten(),
        );
        let tracker = MembershipTracker::with_attributes(
            format!("{} targets tracker", spec.name),
            reconciler.clone(),
            tracked,
        );

        Self {
            lifecycle: LifecycleTracker::new(entity.clone()),
            entity,
            reconciler,
            tracker,
            pool: Mutex::new(spec.pool),
            listen: spec.listen,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Controller that renders its targets into an upstream file.
    pub fn with_upstream_file(spec: ControllerSpec, upstream: UpstreamFile) -> Self {
        Self::new(spec, Arc::new(upstream))
    }

    pub fn reconciler(&self) -> &Arc<ServerPoolReconciler> {
        &self.reconciler
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.current()
    }

    pub fn bound_pool(&self) -> Option<Group> {
        self.pool.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }

    pub async fn pool_snapshot(&self) -> ServerPoolSnapshot {
        self.reconciler.snapshot().await
    }

    fn publish_endpoint(&self) {
        let Some(listen) = self.listen.as_ref() else {
            return;
        };
        self.entity.set_attribute(&HOSTNAME, listen.host.clone());
        self.entity.set_attribute(&ADDRESS, listen.host.clone());
        self.entity
            .set_attribute(&ROOT_URL, format!("http://{}:{}/", listen.host, listen.port));
    }

    async fn start_inner(&self) -> Result<()> {
        let pool = self.bound_pool().ok_or_else(|| {
            Error::configuration(format!("`{}` has no server pool bound", self.entity))
        })?;

        // Subscribe before the rescan so nothing that changes in between is lost.
        self.tracker.set_group(pool.clone(), &self.shutdown);
        self.reconciler.bind(pool).await?;
        self.publish_endpoint();
        self.reconciler.activate().await?;
        self.entity.set_attribute(&SERVICE_UP, true);
        Ok(())
    }
}

#[async_trait]
impl Bindable for LoadBalancer {
    async fn bind(&self, pool: Group) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(Error::Unsupported {
                operation: "bind after start",
                entity: self.entity.to_string(),
            });
        }
        self.reconciler.bind(pool.clone()).await?;
        *self.pool.lock().unwrap_or_else(|err| err.into_inner()) = Some(pool);
        Ok(())
    }
}

#[async_trait]
impl Reconcilable for LoadBalancer {
    async fn update(&self) -> Result<()> {
        self.reconciler.update().await
    }
}

#[async_trait]
impl Startable for LoadBalancer {
    fn entity(&self) -> &Entity {
        &self.entity
    }

    async fn start_with(
        &self,
        locations: &[Location],
        dependencies: &StartupDependencies,
    ) -> Result<()> {
        self.lifecycle.begin_start()?;
        self.started.store(true, Ordering::SeqCst);
        self.entity.set_locations(locations);

        let outcome = async {
            dependencies.resolve(&self.entity).await?;
            self.start_inner().await
        }
        .await;
        match outcome {
            Ok(()) => {
                self.lifecycle.transition(Lifecycle::Running, "controller active")?;
                Ok(())
            }
            Err(err) => {
                self.tracker.reset();
                self.reconciler.deactivate().await;
                self.started.store(false, Ordering::SeqCst);
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
        self.reconciler.deactivate().await;
        self.entity.set_attribute(&SERVICE_UP, false);
        self.entity.clear_locations();
        self.started.store(false, Ordering::SeqCst);
        self.lifecycle.transition(Lifecycle::Stopped, "controller stopped")?;
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let locations = self.entity.locations();
        self.stop().await?;
        self.start(&locations).await
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Upstream block written for a reverse proxy, plus the command that makes it reload.
#[derive(Clone, Debug)]
pub struct UpstreamFile {
    upstream: String,
    path: PathBuf,
    reload_command: Vec<String>,
}

impl UpstreamFile {
    pub fn new(upstream: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            upstream: upstream.into(),
            path: path.into(),
            reload_command: Vec::new(),
        }
    }

    pub fn with_reload_command(mut self, command: Vec<String>) -> Self {
        self.reload_command = command;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renders `addresses` sorted, one `server` line each.
    pub fn render(&self, addresses: &[String]) -> String {
        let mut sorted = addresses.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut output = format!("upstream {} {{\n", self.upstream);
        for address in sorted {
            output.push_str("    server ");
            output.push_str(&address);
            output.push_str(";\n");
        }
        output.push_str("}\n");
        output
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "upstream".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ServiceReconfigurer for UpstreamFile {
    async fn reconfigure_service(&self, addresses: &[String]) -> Result<()> {
        let rendered = self.render(addresses);
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let staging = self.staging_path();
        tokio::fs::write(&staging, rendered.as_bytes())
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        tracing::debug!(
            path = %self.path.display(),
            targets = addresses.len(),
            "upstream file written"
        );
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            return Ok(());
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running reload command `{program}`"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::msg(format!(
                "reload command `{}` exited with {}: {}",
                self.reload_command.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
