use super::tiers::TierDefinition;
use crate::pool::{AddressSelectorConfig, ListenAddress};
use serde::Deserialize;
use std::path::PathBuf;

/// Load balancer fronting one tier, writing its targets to an upstream file.
#[derive(Debug, Clone)]
pub struct ControllerDefinition {
    pub name: String,
    pub pool: String,
    pub selector: AddressSelectorConfig,
    pub config_path: PathBuf,
    /// Name of the rendered upstream block; defaults to the pool tier.
    pub upstream: String,
    pub reload_command: Vec<String>,
    pub listen: Option<ListenAddress>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawController {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    host_and_port_attribute: Option<String>,
    #[serde(default)]
    hostname_attribute: Option<String>,
    #[serde(default)]
    port_attribute: Option<String>,
    #[serde(default)]
    config_path: Option<PathBuf>,
    #[serde(default)]
    upstream: Option<String>,
    #[serde(default)]
    reload_command: Vec<String>,
    #[serde(default)]
    listen: Option<RawListen>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListen {
    #[serde(default)]
    host: Option<String>,
    port: u16,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_controller(
    raw: RawController,
    errors: &mut Vec<String>,
) -> Option<ControllerDefinition> {
    let name = non_empty(raw.name).unwrap_or_else(|| {
        errors.push("controller.name must be a non-empty string".to_string());
        String::new()
    });
    let pool = non_empty(raw.pool).unwrap_or_else(|| {
        errors.push("controller.pool is required".to_string());
        String::new()
    });

    let selector = AddressSelectorConfig {
        host_and_port: non_empty(raw.host_and_port_attribute),
        hostname: non_empty(raw.hostname_attribute),
        port: non_empty(raw.port_attribute),
    };
    if let Err(err) = selector.resolve_selector() {
        errors.push(format!("controller `{name}`: {err}"));
    }

    let config_path = match raw.config_path {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => {
            errors.push(format!("controller `{name}` requires config_path"));
            PathBuf::new()
        }
    };

    if raw.reload_command.iter().any(|part| part.trim().is_empty()) {
        errors.push(format!(
            "controller `{name}` reload_command contains an empty argument"
        ));
    }

    let listen = raw.listen.map(|listen| ListenAddress {
        host: non_empty(listen.host).unwrap_or_else(|| "0.0.0.0".to_string()),
        port: listen.port,
    });

    Some(ControllerDefinition {
        upstream: non_empty(raw.upstream).unwrap_or_else(|| pool.clone()),
        name,
        pool,
        selector,
        config_path,
        reload_command: raw.reload_command,
        listen,
    })
}

pub(crate) fn validate_references(
    controller: &ControllerDefinition,
    tiers: &[TierDefinition],
    errors: &mut Vec<String>,
) {
    if !controller.pool.is_empty() && !tiers.iter().any(|tier| tier.name == controller.pool) {
        errors.push(format!(
            "controller `{}` fronts unknown tier `{}`",
            controller.name, controller.pool
        ));
    }
    if tiers.iter().any(|tier| tier.name == controller.name) {
        errors.push(format!(
            "controller `{}` has the same name as a tier",
            controller.name
        ));
    }
}
