use crate::entity::{Entity, Group};
use crate::pool::address::AddressSelector;
use std::collections::{BTreeSet, HashMap};

/// Mutable state of one server pool reconciler; only ever touched under its lock.
///
/// `addresses` is always the set of non-null values in `targets`.
#[derive(Debug, Default)]
pub struct ServerPoolState {
    targets: HashMap<Entity, Option<String>>,
    addresses: BTreeSet<String>,
    pub active: bool,
    pub update_needed: bool,
    pub pool: Option<Group>,
    pub selector: Option<AddressSelector>,
}

impl ServerPoolState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, member: &Entity) -> bool {
        self.targets.contains_key(member)
    }

    pub fn target(&self, member: &Entity) -> Option<&Option<String>> {
        self.targets.get(member)
    }

    /// Records `member` with its resolved address (or none), replacing any previous entry.
    pub fn insert(&mut self, member: Entity, address: Option<String>) {
        if let Some(previous) = self.targets.insert(member, address.clone()) {
            self.release(previous);
        }
        if let Some(address) = address {
            self.addresses.insert(address);
        }
    }

    /// Forgets `member`; its address is dropped unless another member resolves to it too.
    pub fn remove(&mut self, member: &Entity) -> bool {
        match self.targets.remove(member) {
            Some(previous) => {
                self.release(previous);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.targets.clear();
        self.addresses.clear();
    }

    pub fn members(&self) -> Vec<Entity> {
        self.targets.keys().cloned().collect()
    }

    /// Sorted resolved addresses.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.iter().cloned().collect()
    }

    pub fn is_consistent(&self) -> bool {
        let derived: BTreeSet<String> = self.targets.values().flatten().cloned().collect();
        derived == self.addresses
    }

    fn release(&mut self, address: Option<String>) {
        let Some(address) = address else {
            return;
        };
        let still_used = self
            .targets
            .values()
            .any(|other| other.as_deref() == Some(address.as_str()));
        if !still_used {
            self.addresses.remove(&address);
        }
    }
}
