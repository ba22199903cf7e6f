//! Well-known attribute keys shared by clusters, controllers and orchestrators.

use crate::entity::attributes::AttributeKey;
use crate::lifecycle::Lifecycle;

pub const SERVICE_UP: AttributeKey<bool> = AttributeKey::new("service.isUp");
pub const SERVICE_STATE: AttributeKey<Lifecycle> = AttributeKey::new("service.state");

pub const HOSTNAME: AttributeKey<String> = AttributeKey::new("host.name");
pub const ADDRESS: AttributeKey<String> = AttributeKey::new("host.address");
pub const HTTP_PORT: AttributeKey<u16> = AttributeKey::new("http.port");
pub const HOST_AND_PORT: AttributeKey<String> = AttributeKey::new("host.and.port");
pub const ROOT_URL: AttributeKey<String> = AttributeKey::new("main.uri");

/// Resolved backend addresses currently configured on a controller.
pub const SERVER_POOL_TARGETS: AttributeKey<Vec<String>> =
    AttributeKey::new("proxy.serverpool.targets");

pub const GROUP_SIZE: AttributeKey<usize> = AttributeKey::new("group.members.count");
