use crate::entity::Group;
use crate::lifecycle::{Bindable, PoolController, Startable};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Data a tier needs from another tier before its own start can complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub tier: String,
    pub attribute: String,
    pub timeout: Option<Duration>,
}

impl Requirement {
    pub fn new(tier: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            attribute: attribute.into(),
            timeout: None,
        }
    }

    pub fn within(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A controller tier together with the pool it must be bound to before it starts.
#[derive(Clone)]
pub struct PoolBinding {
    pub controller: Arc<dyn Bindable>,
    pub pool: Group,
}

/// A named sub-component of a composite deployment.
#[derive(Clone)]
pub struct Tier {
    name: String,
    component: Arc<dyn Startable>,
    requires: Vec<Requirement>,
    restartable: bool,
    binding: Option<PoolBinding>,
}

impl Tier {
    pub fn new(name: impl Into<String>, component: Arc<dyn Startable>) -> Self {
        Self {
            name: name.into(),
            component,
            requires: Vec::new(),
            restartable: true,
            binding: None,
        }
    }

    /// Tier whose component fronts `pool`; the binding is applied before any tier starts.
    pub fn controller<C>(name: impl Into<String>, controller: Arc<C>, pool: Group) -> Self
    where
        C: PoolController + 'static,
    {
        let component: Arc<dyn Startable> = controller.clone();
        let bindable: Arc<dyn Bindable> = controller;
        let mut tier = Self::new(name, component);
        tier.binding = Some(PoolBinding {
            controller: bindable,
            pool,
        });
        tier
    }

    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requires.push(requirement);
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &Arc<dyn Startable> {
        &self.component
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requires
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn binding(&self) -> Option<&PoolBinding> {
        self.binding.as_ref()
    }
}

impl fmt::Debug for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("name", &self.name)
            .field("entity", self.component.entity())
            .field("requires", &self.requires)
            .field("restartable", &self.restartable)
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

/// Orders `names` so every tier follows the tiers it depends on.
///
/// Among tiers that are ready at the same time, declaration order wins. Dependencies on
/// unknown names are ignored. On a cycle, returns the names of the tiers that could not
/// be ordered.
pub fn topological_order(
    names: &[String],
    dependencies: &[Vec<String>],
) -> std::result::Result<Vec<usize>, Vec<String>> {
    let index_of = |name: &str| names.iter().position(|candidate| candidate == name);
    let edges: Vec<BTreeSet<usize>> = names
        .iter()
        .enumerate()
        .map(|(index, _)| {
            dependencies
                .get(index)
                .map(|deps| {
                    deps.iter()
                        .filter_map(|dep| index_of(dep))
                        .filter(|dep| *dep != index)
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();

    let mut placed = vec![false; names.len()];
    let mut order = Vec::with_capacity(names.len());
    while order.len() < names.len() {
        let next = (0..names.len())
            .find(|index| !placed[*index] && edges[*index].iter().all(|dep| placed[*dep]));
        match next {
            Some(index) => {
                placed[index] = true;
                order.push(index);
            }
            None => {
                return Err(names
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !placed[*index])
                    .map(|(_, name)| name.clone())
                    .collect());
            }
        }
    }
    Ok(order)
}
