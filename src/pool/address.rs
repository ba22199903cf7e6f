use crate::entity::{AttributeKey, Entity};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Attribute names a controller reads to find a member's address, as configured.
///
/// Exactly one form must be supplied: the combined `host_and_port` attribute, or both
/// `hostname` and `port`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSelectorConfig {
    #[serde(default)]
    pub host_and_port: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
}

impl AddressSelectorConfig {
    pub fn host_and_port(attribute: impl Into<String>) -> Self {
        Self {
            host_and_port: Some(attribute.into()),
            ..Self::default()
        }
    }

    pub fn hostname_and_port(hostname: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host_and_port: None,
            hostname: Some(hostname.into()),
            port: Some(port.into()),
        }
    }

    pub fn resolve_selector(&self) -> Result<AddressSelector> {
        match (&self.host_and_port, &self.hostname, &self.port) {
            (Some(combined), None, None) => Ok(AddressSelector::HostAndPort(AttributeKey::named(
                combined.clone(),
            ))),
            (None, Some(hostname), Some(port)) => Ok(AddressSelector::HostnameAndPort {
                hostname: AttributeKey::named(hostname.clone()),
                port: AttributeKey::named(port.clone()),
            }),
            (Some(combined), _, _) => Err(Error::configuration(format!(
                "address selector is ambiguous: `{combined}` is configured together with a separate hostname/port attribute"
            ))),
            (None, None, None) => Err(Error::configuration(
                "address selector is missing: configure a host-and-port attribute or a hostname and port attribute",
            )),
            (None, Some(_), None) | (None, None, Some(_)) => Err(Error::configuration(
                "address selector is incomplete: hostname and port attributes must be configured together",
            )),
        }
    }
}

/// How a member's connectable address is read from its attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressSelector {
    HostAndPort(AttributeKey<JsonValue>),
    HostnameAndPort {
        hostname: AttributeKey<JsonValue>,
        port: AttributeKey<JsonValue>,
    },
}

impl AddressSelector {
    /// Attribute names whose changes can alter a member's resolved address.
    pub fn attribute_names(&self) -> Vec<String> {
        match self {
            AddressSelector::HostAndPort(key) => vec![key.name().to_string()],
            AddressSelector::HostnameAndPort { hostname, port } => {
                vec![hostname.name().to_string(), port.name().to_string()]
            }
        }
    }

    pub fn resolve(&self, member: &Entity) -> Result<String> {
        match self {
            AddressSelector::HostAndPort(key) => {
                read_text(member, key).ok_or_else(|| Error::MembershipResolution {
                    member: member.to_string(),
                    reason: format!("attribute `{}` is not set", key.name()),
                })
            }
            AddressSelector::HostnameAndPort { hostname, port } => {
                match (read_text(member, hostname), read_text(member, port)) {
                    (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
                    (host, _) => {
                        let missing = if host.is_none() { hostname } else { port };
                        Err(Error::MembershipResolution {
                            member: member.to_string(),
                            reason: format!("attribute `{}` is not set", missing.name()),
                        })
                    }
                }
            }
        }
    }

    /// Resolves `member`, logging and counting the failure instead of returning it.
    pub fn resolve_or_log(&self, owner: &Entity, member: &Entity) -> Option<String> {
        match self.resolve(member) {
            Ok(address) => Some(address),
            Err(err) => {
                tracing::warn!(
                    entity = %owner,
                    member = %member,
                    error = %err,
                    "member has no resolvable address; skipping"
                );
                metrics().record_unresolved_member(&owner.to_string());
                None
            }
        }
    }
}

/// Reads an attribute as text; numbers (ports) are rendered in decimal.
fn read_text(member: &Entity, key: &AttributeKey<JsonValue>) -> Option<String> {
    match member.attributes().get_raw(key.name())? {
        JsonValue::String(text) if !text.is_empty() => Some(text),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
