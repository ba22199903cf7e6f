use crate::entity::keys::GROUP_SIZE;
use crate::entity::Entity;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

const MEMBERSHIP_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(Entity),
    Removed(Entity),
}

impl MembershipEvent {
    pub fn member(&self) -> &Entity {
        match self {
            MembershipEvent::Added(member) | MembershipEvent::Removed(member) => member,
        }
    }
}

/// An entity whose essential attribute is a mutable set of member entities.
///
/// Membership is observed, never owned: adding an entity here does not re-parent it.
#[derive(Clone)]
pub struct Group {
    entity: Entity,
    members: Arc<RwLock<Vec<Entity>>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_entity(Entity::new(name))
    }

    pub fn from_entity(entity: Entity) -> Self {
        let (events, _) = broadcast::channel(MEMBERSHIP_CAPACITY);
        entity.set_attribute(&GROUP_SIZE, 0);
        Self {
            entity,
            members: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn name(&self) -> &str {
        self.entity.name()
    }

    /// Snapshot of the current members in insertion order.
    pub fn members(&self) -> Vec<Entity> {
        self.members
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn has_member(&self, member: &Entity) -> bool {
        self.members
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .contains(member)
    }

    pub fn size(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn add_member(&self, member: &Entity) -> bool {
        let size = {
            let mut members = self.members.write().unwrap_or_else(|err| err.into_inner());
            if members.contains(member) {
                return false;
            }
            members.push(member.clone());
            members.len()
        };

        self.entity.set_attribute(&GROUP_SIZE, size);
        let _ = self.events.send(MembershipEvent::Added(member.clone()));
        tracing::debug!(group = %self.entity, member = %member, size, "member added");
        true
    }

    pub fn remove_member(&self, member: &Entity) -> bool {
        let size = {
            let mut members = self.members.write().unwrap_or_else(|err| err.into_inner());
            let before = members.len();
            members.retain(|candidate| candidate != member);
            if members.len() == before {
                return false;
            }
            members.len()
        };

        self.entity.set_attribute(&GROUP_SIZE, size);
        let _ = self.events.send(MembershipEvent::Removed(member.clone()));
        tracing::debug!(group = %self.entity, member = %member, size, "member removed");
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}

impl Eq for Group {}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("entity", &self.entity)
            .field("size", &self.size())
            .finish()
    }
}
