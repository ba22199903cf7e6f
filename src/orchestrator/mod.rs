//! Composite deployments: tiers started together, stopped in reverse dependency order.

pub mod composite;
pub mod controlled;
pub mod tier;

pub use composite::{CompositeBuilder, CompositeOrchestrator};
pub use controlled::ControlledCluster;
pub use tier::{topological_order, PoolBinding, Requirement, Tier};
