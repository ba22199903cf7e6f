mod controller;
mod tiers;

use crate::orchestrator::tier::topological_order;
use humantime::parse_duration;
use serde::de::Error as _;
use serde::Deserialize;
use serde_yaml::{self, Value as YamlValue};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use controller::ControllerDefinition;
pub use tiers::{MemberDefinition, RequirementDefinition, TierDefinition, TierKind};

/// A validated deployment descriptor.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub api_version: ApiVersion,
    pub name: String,
    pub tiers: Vec<TierDefinition>,
    pub controller: Option<ControllerDefinition>,
    pub colocated: Option<ColocatedDefinition>,
}

/// Mirror every member of `source` into the pool of `target` once the deployment is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColocatedDefinition {
    pub source: String,
    pub target: String,
}

const TOP_LEVEL_FIELDS: &str = "api_version, name, tiers, controller, colocated";

impl DeploymentConfig {
    pub fn from_reader(mut reader: impl Read) -> Result<Self, DeploymentConfigError> {
        let mut contents = String::new();
        reader.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DeploymentConfigError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, DeploymentConfigError> {
        let mut documents = serde_yaml::Deserializer::from_str(contents);
        let mut parsed = None;
        let mut extra_errors = Vec::new();

        for (index, document) in documents.by_ref().enumerate() {
            if index == 0 {
                parsed = Some(RawDeploymentFile::deserialize(document)?);
            } else {
                let _: YamlValue = YamlValue::deserialize(document)?;
                extra_errors.push("multiple YAML documents are not supported".to_string());
                break;
            }
        }

        let Some(raw) = parsed else {
            let err =
                serde_yaml::Error::custom("deployment descriptor must contain exactly one YAML document");
            return Err(DeploymentConfigError::Parse(err));
        };

        Self::from_raw(raw, extra_errors).map_err(DeploymentConfigError::Invalid)
    }

    fn from_raw(
        raw: RawDeploymentFile,
        mut errors: Vec<String>,
    ) -> Result<Self, DeploymentValidationError> {
        let RawDeploymentFile {
            api_version: raw_api_version,
            name: raw_name,
            tiers: raw_tiers,
            controller: raw_controller,
            colocated: raw_colocated,
            extra_fields,
        } = raw;

        for key in extra_fields.keys() {
            errors.push(format!(
                "unknown top-level key \"{key}\" (expected one of {TOP_LEVEL_FIELDS})"
            ));
        }

        let api_version = parse_api_version(raw_api_version, &mut errors);
        let name = match raw_name.map(|name| name.trim().to_string()) {
            Some(name) if !name.is_empty() => name,
            _ => {
                errors.push("name is required".to_string());
                String::new()
            }
        };

        let tiers = tiers::parse_tiers(raw_tiers, &mut errors);
        let controller =
            raw_controller.and_then(|section| controller::parse_controller(section, &mut errors));
        let colocated = raw_colocated.map(|section| ColocatedDefinition {
            source: section.source.trim().to_string(),
            target: section.target.trim().to_string(),
        });

        tiers::validate_references(&tiers, &mut errors);
        if let Some(controller) = &controller {
            controller::validate_references(controller, &tiers, &mut errors);
        }
        if let Some(colocated) = &colocated {
            validate_colocated(colocated, &tiers, &mut errors);
        }

        let config = Self {
            api_version,
            name,
            tiers,
            controller,
            colocated,
        };
        if let Err(cycle) = config.ordered_indices() {
            errors.push(format!(
                "tier dependencies form a cycle between: {}",
                cycle.join(", ")
            ));
        }

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(DeploymentValidationError::new(
                errors,
                schema_version_label(&config.api_version),
            ))
        }
    }

    /// Names of the tiers in start order, the controller last among its dependants.
    pub fn start_order(&self) -> Vec<String> {
        let names = self.unit_names();
        self.ordered_indices()
            .map(|order| order.into_iter().map(|index| names[index].clone()).collect())
            .unwrap_or(names)
    }

    pub fn stop_order(&self) -> Vec<String> {
        let mut order = self.start_order();
        order.reverse();
        order
    }

    pub fn tier(&self, name: &str) -> Option<&TierDefinition> {
        self.tiers.iter().find(|tier| tier.name == name)
    }

    fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tiers.iter().map(|tier| tier.name.clone()).collect();
        if let Some(controller) = &self.controller {
            names.push(controller.name.clone());
        }
        names
    }

    fn ordered_indices(&self) -> Result<Vec<usize>, Vec<String>> {
        let mut dependencies: Vec<Vec<String>> = self
            .tiers
            .iter()
            .map(|tier| {
                tier.requires
                    .iter()
                    .map(|requirement| requirement.tier.clone())
                    .collect()
            })
            .collect();
        if let Some(controller) = &self.controller {
            dependencies.push(vec![controller.pool.clone()]);
        }
        topological_order(&self.unit_names(), &dependencies)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApiVersion {
    #[default]
    V1,
    Unsupported(String),
}

fn parse_api_version(raw: Option<String>, errors: &mut Vec<String>) -> ApiVersion {
    match raw {
        None => {
            errors.push("api_version is required (supported versions: v1)".to_string());
            ApiVersion::V1
        }
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.eq_ignore_ascii_case("v1") {
                ApiVersion::V1
            } else {
                errors.push(format!(
                    "api_version `{trimmed}` is not supported (supported versions: v1)"
                ));
                ApiVersion::Unsupported(trimmed.to_string())
            }
        }
    }
}

fn schema_version_label(version: &ApiVersion) -> String {
    match version {
        ApiVersion::V1 => "v1".to_string(),
        ApiVersion::Unsupported(other) => other.clone(),
    }
}

fn validate_colocated(
    colocated: &ColocatedDefinition,
    tiers: &[TierDefinition],
    errors: &mut Vec<String>,
) {
    let known = |name: &str| tiers.iter().any(|tier| tier.name == name);
    for (field, value) in [("source", &colocated.source), ("target", &colocated.target)] {
        if !known(value) {
            errors.push(format!("colocated.{field} references unknown tier `{value}`"));
        }
    }
    if colocated.source == colocated.target {
        errors.push(format!(
            "colocated.source and colocated.target are both `{}`",
            colocated.source
        ));
    }
}

pub(crate) fn parse_duration_value(
    field_label: &str,
    raw: Option<String>,
    errors: &mut Vec<String>,
) -> Option<Duration> {
    let raw_value = raw?;

    let trimmed = raw_value.trim();
    if trimmed.is_empty() {
        errors.push(format!("{field_label} must be a non-empty duration string"));
        return None;
    }

    match parse_duration(trimmed) {
        Ok(duration) if duration.is_zero() => {
            errors.push(format!("{field_label} must be greater than zero"));
            None
        }
        Ok(duration) => Some(duration),
        Err(_) => {
            errors.push(format!(
                "{field_label} must be a valid duration (got `{trimmed}`)"
            ));
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDeploymentFile {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tiers: Vec<tiers::RawTier>,
    #[serde(default)]
    controller: Option<controller::RawController>,
    #[serde(default)]
    colocated: Option<RawColocated>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawColocated {
    source: String,
    target: String,
}

#[derive(Debug, Error)]
pub enum DeploymentConfigError {
    #[error("failed to read deployment descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse deployment descriptor: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(DeploymentValidationError),
}

impl DeploymentConfigError {
    /// Individual validation messages, empty for read and parse failures.
    pub fn messages(&self) -> &[String] {
        match self {
            DeploymentConfigError::Invalid(invalid) => &invalid.messages,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
#[error("deployment descriptor validation failed:\napi_version: \"{schema_version}\"\n{rendered}")]
pub struct DeploymentValidationError {
    schema_version: String,
    messages: Vec<String>,
    rendered: String,
}

impl DeploymentValidationError {
    pub fn new(messages: Vec<String>, schema_version: impl Into<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            schema_version: schema_version.into(),
            messages,
            rendered,
        }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

// tests live in tests/unit/config_deployment_tests.rs
