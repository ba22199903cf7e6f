pub mod address;
pub mod controller;
pub mod reconciler;
pub mod state;
pub mod tracker;

pub use address::{AddressSelector, AddressSelectorConfig};
pub use controller::{ControllerSpec, ListenAddress, LoadBalancer, UpstreamFile};
pub use reconciler::{ServerPoolReconciler, ServerPoolSnapshot, ServiceReconfigurer};
pub use state::ServerPoolState;
pub use tracker::{DerivedMembership, MembershipListener, MembershipTracker};
