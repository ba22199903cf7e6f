use crate::entity::keys::{SERVER_POOL_TARGETS, SERVICE_UP};
use crate::entity::{Entity, Group};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::pool::address::{AddressSelector, AddressSelectorConfig};
use crate::pool::state::ServerPoolState;
use crate::steward_event;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The service a reconciler keeps in sync, e.g. a load balancer's upstream configuration.
#[async_trait]
pub trait ServiceReconfigurer: Send + Sync {
    /// Rewrites the service configuration so it targets exactly `addresses`.
    async fn reconfigure_service(&self, addresses: &[String]) -> Result<()>;

    /// Makes the service pick up the configuration written by `reconfigure_service`.
    async fn reload(&self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerPoolSnapshot {
    pub members: usize,
    pub addresses: Vec<String>,
    pub active: bool,
    pub update_needed: bool,
    pub consistent: bool,
}

/// Keeps a service's backend set equal to the resolved addresses of the eligible members
/// of a bound group.
///
/// Every mutation, including the reconfigure and reload of the service, runs under one
/// async lock, so at most one reconfiguration is in flight and events for the same member
/// are applied in arrival order.
pub struct ServerPoolReconciler {
    entity: Entity,
    selector_config: AddressSelectorConfig,
    service: Arc<dyn ServiceReconfigurer>,
    state: Mutex<ServerPoolState>,
}

impl ServerPoolReconciler {
    pub fn new(
        entity: Entity,
        selector_config: AddressSelectorConfig,
        service: Arc<dyn ServiceReconfigurer>,
    ) -> Self {
        Self {
            entity,
            selector_config,
            service,
            state: Mutex::new(ServerPoolState::new()),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn selector_config(&self) -> &AddressSelectorConfig {
        &self.selector_config
    }

    /// Attaches `pool`, replacing any previously bound group, and rescans it.
    pub async fn bind(&self, pool: Group) -> Result<()> {
        let selector = self.selector_config.resolve_selector()?;
        let mut state = self.state.lock().await;
        if let Some(previous) = state.pool.as_ref().filter(|previous| **previous != pool) {
            tracing::info!(
                entity = %self.entity,
                previous = %previous.entity(),
                pool = %pool.entity(),
                "replacing bound server pool"
            );
        }
        state.selector = Some(selector);
        state.pool = Some(pool);
        self.reset_locked(&mut state).await
    }

    pub async fn pool(&self) -> Option<Group> {
        self.state.lock().await.pool.clone()
    }

    pub async fn selector(&self) -> Option<AddressSelector> {
        self.state.lock().await.selector.clone()
    }

    /// Rebuilds the target set from the bound group's live members.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reset_locked(&mut state).await
    }

    pub async fn on_member_added(&self, member: &Entity) -> Result<()> {
        self.on_member_changed(member).await
    }

    pub async fn on_member_removed(&self, member: &Entity) -> Result<()> {
        self.on_member_changed(member).await
    }

    /// Re-evaluates `member` against the current group and its current attributes.
    pub async fn on_member_changed(&self, member: &Entity) -> Result<()> {
        let mut state = self.state.lock().await;
        if Self::belongs_in_server_pool(&state, member) {
            self.add_member_locked(&mut state, member).await
        } else {
            self.remove_member_locked(&mut state, member).await
        }
    }

    pub async fn add_member(&self, member: &Entity) -> Result<()> {
        let mut state = self.state.lock().await;
        self.add_member_locked(&mut state, member).await
    }

    pub async fn remove_member(&self, member: &Entity) -> Result<()> {
        let mut state = self.state.lock().await;
        self.remove_member_locked(&mut state, member).await
    }

    /// Reconfigures and reloads the service when active; otherwise records that an update
    /// is owed. The target attribute is republished either way.
    pub async fn update(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.update_locked(&mut state).await
    }

    /// Marks the service as serving; performs the owed update, if any, exactly once.
    pub async fn activate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.active = true;
        if state.update_needed {
            self.update_locked(&mut state).await?;
        }
        Ok(())
    }

    pub async fn deactivate(&self) {
        self.state.lock().await.active = false;
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    pub async fn snapshot(&self) -> ServerPoolSnapshot {
        let state = self.state.lock().await;
        ServerPoolSnapshot {
            members: state.members().len(),
            addresses: state.addresses(),
            active: state.active,
            update_needed: state.update_needed,
            consistent: state.is_consistent(),
        }
    }

    pub async fn contains(&self, member: &Entity) -> bool {
        self.state.lock().await.contains(member)
    }

    fn belongs_in_server_pool(state: &ServerPoolState, member: &Entity) -> bool {
        if member.attribute(&SERVICE_UP) != Some(true) {
            tracing::trace!(member = %member, "not eligible: not up");
            return false;
        }
        let in_pool = state
            .pool
            .as_ref()
            .map(|pool| pool.has_member(member))
            .unwrap_or(false);
        if !in_pool {
            tracing::trace!(member = %member, "not eligible: not a pool member");
        }
        in_pool
    }

    fn selector_of<'a>(&self, state: &'a ServerPoolState) -> Result<&'a AddressSelector> {
        state.selector.as_ref().ok_or_else(|| {
            Error::configuration(format!("`{}` has no server pool bound", self.entity))
        })
    }

    async fn reset_locked(&self, state: &mut ServerPoolState) -> Result<()> {
        state.clear();
        let Some(pool) = state.pool.clone() else {
            self.publish_targets(state);
            return Ok(());
        };
        let selector = self.selector_of(state)?.clone();

        for member in pool.members() {
            if Self::belongs_in_server_pool(state, &member) {
                let address = selector.resolve_or_log(&self.entity, &member);
                state.insert(member, address);
            }
        }

        steward_event!(
            info,
            "pool_reset",
            entity = self.entity,
            pool = pool.entity(),
            members = state.members().len(),
            addresses = state.addresses().join(",")
        );
        self.update_locked(state).await
    }

    async fn add_member_locked(&self, state: &mut ServerPoolState, member: &Entity) -> Result<()> {
        let selector = self.selector_of(state)?;
        let address = selector.resolve_or_log(&self.entity, member);

        if let Some(existing) = state.target(member) {
            if *existing == address {
                tracing::trace!(entity = %self.entity, member = %member, "member already targeted");
                return Ok(());
            }
            steward_event!(
                info,
                "pool_member_readdressed",
                entity = self.entity,
                member = member,
                previous = existing.as_deref().unwrap_or("none"),
                address = address.as_deref().unwrap_or("none")
            );
        } else {
            steward_event!(
                info,
                "pool_member_added",
                entity = self.entity,
                member = member,
                address = address.as_deref().unwrap_or("none")
            );
        }

        state.insert(member.clone(), address);
        self.update_locked(state).await
    }

    async fn remove_member_locked(
        &self,
        state: &mut ServerPoolState,
        member: &Entity,
    ) -> Result<()> {
        let Some(address) = state.target(member).cloned() else {
            tracing::trace!(entity = %self.entity, member = %member, "member not targeted");
            return Ok(());
        };

        state.remove(member);
        steward_event!(
            info,
            "pool_member_removed",
            entity = self.entity,
            member = member,
            address = address.as_deref().unwrap_or("none")
        );
        self.update_locked(state).await
    }

    async fn update_locked(&self, state: &mut ServerPoolState) -> Result<()> {
        if !state.active {
            state.update_needed = true;
            metrics().record_deferred_update(&self.entity.to_string());
            tracing::debug!(entity = %self.entity, "service inactive; update deferred");
        } else {
            let addresses = state.addresses();
            tracing::debug!(entity = %self.entity, targets = addresses.len(), "reconfiguring service");
            if let Err(err) = self.service.reconfigure_service(&addresses).await {
                state.update_needed = true;
                return Err(err);
            }
            metrics().record_reconfiguration(&self.entity.to_string());

            let reloaded = self.service.reload().await;
            metrics().record_reload(&self.entity.to_string(), reloaded.is_ok());
            if let Err(err) = reloaded {
                state.update_needed = true;
                return Err(err);
            }

            state.update_needed = false;
            steward_event!(
                info,
                "pool_reconfigured",
                entity = self.entity,
                targets = addresses.join(",")
            );
        }

        self.publish_targets(state);
        Ok(())
    }

    fn publish_targets(&self, state: &ServerPoolState) {
        self.entity
            .set_attribute(&SERVER_POOL_TARGETS, state.addresses());
    }
}
