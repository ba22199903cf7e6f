pub mod attributes;
pub mod dependent;
pub mod enricher;
pub mod group;
pub mod keys;

pub use attributes::{
    is_ready_value, AttributeChange, AttributeKey, AttributeMap, AttributeStore,
};
pub use dependent::{attribute_when_ready, attribute_when_ready_raw, StartupDependencies};
pub use enricher::{Propagator, Selection};
pub use group::{Group, MembershipEvent};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, Weak};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(Uuid);

impl EntityId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque location specifier (a machine, a zone, `localhost`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(String);

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration resolved for one entity instance; fixed once the entity exists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityConfig {
    values: AttributeMap,
}

impl EntityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Serialize>(mut self, key: &AttributeKey<T>, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(encoded) => {
                self.values.insert(key.name().to_string(), encoded);
            }
            Err(err) => {
                tracing::warn!(config = key.name(), error = %err, "config value cannot be encoded");
            }
        }
        self
    }

    pub fn get<T: DeserializeOwned>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.values
            .get(key.name())
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn get_raw(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }
}

struct EntityInner {
    id: EntityId,
    name: String,
    parent: RwLock<Weak<EntityInner>>,
    children: RwLock<Vec<Entity>>,
    attributes: AttributeStore,
    config: EntityConfig,
    locations: RwLock<Vec<Location>>,
}

/// Shared handle to a node of the managed entity tree.
///
/// Handles compare and hash by identity. Parents hold their children strongly; children
/// only keep a weak back-reference, so dropping a subtree happens when its parent lets go.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, EntityConfig::new())
    }

    pub fn with_config(name: impl Into<String>, config: EntityConfig) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                id: EntityId::generate(),
                name: name.into(),
                parent: RwLock::new(Weak::new()),
                children: RwLock::new(Vec::new()),
                attributes: AttributeStore::new(),
                config,
                locations: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.inner.attributes
    }

    pub fn config(&self) -> &EntityConfig {
        &self.inner.config
    }

    pub fn attribute<T: DeserializeOwned>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.inner.attributes.get(key)
    }

    pub fn set_attribute<T: Serialize>(&self, key: &AttributeKey<T>, value: T) -> bool {
        self.inner.attributes.set(key, value)
    }

    pub fn parent(&self) -> Option<Entity> {
        let parent = self
            .inner
            .parent
            .read()
            .unwrap_or_else(|err| err.into_inner());
        parent.upgrade().map(|inner| Entity { inner })
    }

    pub fn children(&self) -> Vec<Entity> {
        self.inner
            .children
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Re-parents `child` under `self`, detaching it from any previous parent.
    pub fn add_child(&self, child: &Entity) {
        if child == self {
            return;
        }
        if let Some(previous) = child.parent() {
            if &previous == self {
                return;
            }
            previous.remove_child(child);
        }

        *child
            .inner
            .parent
            .write()
            .unwrap_or_else(|err| err.into_inner()) = Arc::downgrade(&self.inner);
        self.inner
            .children
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .push(child.clone());
    }

    pub fn remove_child(&self, child: &Entity) -> bool {
        let removed = {
            let mut children = self
                .inner
                .children
                .write()
                .unwrap_or_else(|err| err.into_inner());
            let before = children.len();
            children.retain(|candidate| candidate != child);
            children.len() != before
        };

        if removed {
            *child
                .inner
                .parent
                .write()
                .unwrap_or_else(|err| err.into_inner()) = Weak::new();
        }
        removed
    }

    pub fn is_parent_of(&self, child: &Entity) -> bool {
        child.parent().as_ref() == Some(self)
    }

    pub fn locations(&self) -> Vec<Location> {
        self.inner
            .locations
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Replaces the recorded location set. Called from the owning component's lifecycle
    /// methods only.
    pub fn set_locations(&self, locations: &[Location]) {
        *self
            .inner
            .locations
            .write()
            .unwrap_or_else(|err| err.into_inner()) = locations.to_vec();
    }

    pub fn clear_locations(&self) {
        self.inner
            .locations
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.inner.name, self.inner.id.short())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}
