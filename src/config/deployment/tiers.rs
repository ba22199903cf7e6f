use super::parse_duration_value;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TierDefinition {
    pub name: String,
    pub kind: TierKind,
    pub members: Vec<MemberDefinition>,
    /// Members started with the tier; defaults to every declared member.
    pub initial_size: usize,
    pub probe_timeout: Option<Duration>,
    pub requires: Vec<RequirementDefinition>,
    pub restartable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierKind {
    StaticCluster,
    Unknown(String),
}

impl TierKind {
    pub(crate) fn from_raw(raw: &str) -> Self {
        match raw {
            "static_cluster" => TierKind::StaticCluster,
            other => TierKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TierKind::StaticCluster => "static_cluster",
            TierKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDefinition {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementDefinition {
    pub tier: String,
    pub attribute: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawTier {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    members: Vec<RawMember>,
    #[serde(default)]
    initial_size: Option<usize>,
    #[serde(default)]
    probe: Option<RawProbe>,
    #[serde(default)]
    requires: Vec<RawRequirement>,
    #[serde(default)]
    restartable: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMember {
    #[serde(default)]
    name: Option<String>,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProbe {
    #[serde(default)]
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequirement {
    tier: String,
    attribute: String,
    #[serde(default)]
    timeout: Option<String>,
}

pub(crate) fn parse_tiers(raw: Vec<RawTier>, errors: &mut Vec<String>) -> Vec<TierDefinition> {
    if raw.is_empty() {
        errors.push("at least one tier is required".to_string());
    }

    let mut seen = BTreeSet::new();
    let mut tiers = Vec::with_capacity(raw.len());
    for (index, tier) in raw.into_iter().enumerate() {
        let name = tier.name.unwrap_or_default().trim().to_string();
        if name.is_empty() {
            errors.push(format!("tiers[{index}].name must be a non-empty string"));
        } else if !seen.insert(name.clone()) {
            errors.push(format!("tier `{name}` is declared more than once"));
        }
        let label = if name.is_empty() {
            format!("tiers[{index}]")
        } else {
            format!("tier `{name}`")
        };

        let kind = match tier.kind.as_deref().map(str::trim) {
            None | Some("") => TierKind::StaticCluster,
            Some(raw_kind) => TierKind::from_raw(raw_kind),
        };
        if let TierKind::Unknown(other) = &kind {
            errors.push(format!(
                "{label} has unsupported kind `{other}` (supported kinds: static_cluster)"
            ));
        }

        let members: Vec<MemberDefinition> = tier
            .members
            .into_iter()
            .enumerate()
            .map(|(position, member)| MemberDefinition {
                name: member
                    .name
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| format!("{name}-{}", position + 1)),
                host: member.host.trim().to_string(),
                port: member.port,
            })
            .collect();
        if members.is_empty() {
            errors.push(format!("{label} declares no members"));
        }
        for member in &members {
            if member.host.is_empty() {
                errors.push(format!("{label} member `{}` has an empty host", member.name));
            }
            if member.port == 0 {
                errors.push(format!("{label} member `{}` has port 0", member.name));
            }
        }

        let initial_size = tier.initial_size.unwrap_or(members.len());
        if initial_size > members.len() {
            errors.push(format!(
                "{label} initial_size {initial_size} exceeds its {} declared member(s)",
                members.len()
            ));
        }

        let probe_timeout = tier.probe.and_then(|probe| {
            parse_duration_value(&format!("{label} probe.timeout"), probe.timeout, errors)
        });

        let requires = tier
            .requires
            .into_iter()
            .map(|requirement| RequirementDefinition {
                timeout: parse_duration_value(
                    &format!("{label} requirement on `{}` timeout", requirement.tier),
                    requirement.timeout,
                    errors,
                ),
                tier: requirement.tier.trim().to_string(),
                attribute: requirement.attribute.trim().to_string(),
            })
            .collect();

        tiers.push(TierDefinition {
            name,
            kind,
            members,
            initial_size,
            probe_timeout,
            requires,
            restartable: tier.restartable.unwrap_or(true),
        });
    }
    tiers
}

pub(crate) fn validate_references(tiers: &[TierDefinition], errors: &mut Vec<String>) {
    let known = |name: &str| tiers.iter().any(|tier| tier.name == name);
    for tier in tiers {
        for requirement in &tier.requires {
            if requirement.tier == tier.name {
                errors.push(format!("tier `{}` cannot require itself", tier.name));
            } else if !known(&requirement.tier) {
                errors.push(format!(
                    "tier `{}` requires unknown tier `{}`",
                    tier.name, requirement.tier
                ));
            }
            if requirement.attribute.is_empty() {
                errors.push(format!(
                    "tier `{}` requirement on `{}` names no attribute",
                    tier.name, requirement.tier
                ));
            }
        }
    }
}
