//! System configuration parsing.
//!
//! ```kdl
//! database url="postgres://beacon@localhost/beacon"
//! backend "kubernetes" namespace="beacon" fetcher-image="curlimages/curl:8.5.0"
//! placement "fewest-active-containers"
//! check-session min="5m" max="1h"
//! scanner interval="10s" default-check-every="1m"
//! checker interval="1s" concurrency=8 claim-grace="5m"
//! credentials env-prefix="BEACON_VAR_" {
//!     var "github-token" "abc123"
//! }
//! worker "local" addr="127.0.0.1:7788" {
//!     tag "linux"
//!     resource-type "git" image="concourse/git-resource" version="1.0"
//! }
//! ```

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};
use beacon_core::TeamId;
use beacon_core::owner::ContainerOwnerExpiries;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_FETCHER_IMAGE: &str = "curlimages/curl:8.5.0";
pub const DEFAULT_ENV_PREFIX: &str = "BEACON_VAR_";

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub database_url: Option<String>,
    pub backend: BackendConfig,
    pub placement: PlacementKind,
    pub check_session: ContainerOwnerExpiries,
    pub scanner: ScannerConfig,
    pub checker: CheckerConfig,
    pub credentials: CredentialsConfig,
    pub workers: Vec<WorkerConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            backend: BackendConfig::Docker { host: None },
            placement: PlacementKind::default(),
            check_session: ContainerOwnerExpiries::default(),
            scanner: ScannerConfig::default(),
            checker: CheckerConfig::default(),
            credentials: CredentialsConfig::default(),
            workers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Docker {
        /// Docker host override; the local socket is used when unset.
        host: Option<String>,
    },
    Kubernetes {
        namespace: String,
        fetcher_image: String,
    },
}

/// How a worker is chosen among the eligible ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementKind {
    #[default]
    FewestActiveContainers,
    Random,
    First,
}

impl FromStr for PlacementKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fewest-active-containers" => Ok(Self::FewestActiveContainers),
            "random" => Ok(Self::Random),
            "first" => Ok(Self::First),
            other => Err(ConfigError::InvalidValue {
                field: "placement".to_string(),
                message: format!("unknown strategy '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub interval: Duration,
    /// Used when a resource does not set its own `check_every`.
    pub default_check_every: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            default_check_every: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerConfig {
    pub interval: Duration,
    pub concurrency: usize,
    /// Added to a check's timeout to bound how long its claim holds. A
    /// claim left behind by a dead checker lapses after this long.
    pub claim_grace: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            concurrency: 8,
            claim_grace: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub vars: BTreeMap<String, String>,
    pub env_prefix: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            vars: BTreeMap::new(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }
}

/// A statically registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub addr: String,
    pub tags: Vec<String>,
    pub team_id: Option<TeamId>,
    pub resource_types: Vec<WorkerResourceTypeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceTypeConfig {
    pub type_: String,
    pub image: String,
    pub version: String,
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                config.database_url = Some(
                    get_string_prop(node, "url")
                        .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?,
                );
            }
            "backend" => config.backend = parse_backend(node)?,
            "placement" => {
                config.placement = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("placement strategy".to_string()))?
                    .parse()?;
            }
            "check-session" => {
                let defaults = ContainerOwnerExpiries::default();
                let expiries = ContainerOwnerExpiries {
                    min: get_duration_prop(node, "min")?.unwrap_or(defaults.min),
                    max: get_duration_prop(node, "max")?.unwrap_or(defaults.max),
                };
                if expiries.min > expiries.max {
                    return Err(ConfigError::InvalidValue {
                        field: "check-session".to_string(),
                        message: "min must not exceed max".to_string(),
                    });
                }
                config.check_session = expiries;
            }
            "scanner" => {
                if let Some(interval) = get_duration_prop(node, "interval")? {
                    config.scanner.interval = interval;
                }
                if let Some(every) = get_duration_prop(node, "default-check-every")? {
                    config.scanner.default_check_every = every;
                }
            }
            "checker" => {
                if let Some(interval) = get_duration_prop(node, "interval")? {
                    config.checker.interval = interval;
                }
                if let Some(concurrency) = get_usize_prop(node, "concurrency")? {
                    if concurrency == 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "checker concurrency".to_string(),
                            message: "must be at least 1".to_string(),
                        });
                    }
                    config.checker.concurrency = concurrency;
                }
                if let Some(grace) = get_duration_prop(node, "claim-grace")? {
                    config.checker.claim_grace = grace;
                }
            }
            "credentials" => config.credentials = parse_credentials(node)?,
            "worker" => config.workers.push(parse_worker(node)?),
            _ => {}
        }
    }

    Ok(config)
}

fn parse_backend(node: &KdlNode) -> ConfigResult<BackendConfig> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("backend kind".to_string()))?;

    match kind.as_str() {
        "docker" => Ok(BackendConfig::Docker {
            host: get_string_prop(node, "host"),
        }),
        "kubernetes" => Ok(BackendConfig::Kubernetes {
            namespace: get_string_prop(node, "namespace").unwrap_or_else(|| "default".to_string()),
            fetcher_image: get_string_prop(node, "fetcher-image")
                .unwrap_or_else(|| DEFAULT_FETCHER_IMAGE.to_string()),
        }),
        other => Err(ConfigError::InvalidValue {
            field: "backend".to_string(),
            message: format!("unknown backend '{}'", other),
        }),
    }
}

fn parse_credentials(node: &KdlNode) -> ConfigResult<CredentialsConfig> {
    let mut creds = CredentialsConfig::default();
    if let Some(prefix) = get_string_prop(node, "env-prefix") {
        creds.env_prefix = prefix;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "var" {
                continue;
            }
            let args = get_all_string_args(child);
            match args.as_slice() {
                [name, value] => {
                    creds.vars.insert(name.clone(), value.clone());
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "credentials var".to_string(),
                        message: "expected a name and a value".to_string(),
                    });
                }
            }
        }
    }

    Ok(creds)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;

    let mut worker = WorkerConfig {
        addr: get_string_prop(node, "addr").unwrap_or_default(),
        name,
        tags: Vec::new(),
        team_id: None,
        resource_types: Vec::new(),
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "tag" => worker.tags.extend(get_all_string_args(child)),
                "team" => {
                    let raw = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("worker team".to_string()))?;
                    let team = raw.parse().map_err(|_| ConfigError::InvalidValue {
                        field: "worker team".to_string(),
                        message: format!("'{}' is not a team id", raw),
                    })?;
                    worker.team_id = Some(team);
                }
                "resource-type" => {
                    let type_ = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField("worker resource-type name".to_string())
                    })?;
                    let image = get_string_prop(child, "image").ok_or_else(|| {
                        ConfigError::MissingField(format!("image for resource type '{}'", type_))
                    })?;
                    worker.resource_types.push(WorkerResourceTypeConfig {
                        type_,
                        image,
                        version: get_string_prop(child, "version").unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }
    }

    Ok(worker)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    get_string_prop(node, name)
        .map(|s| parse_duration(&s))
        .transpose()
}

fn get_usize_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<usize>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|n| usize::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: "expected a non-negative integer".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.check_session.min, Duration::from_secs(5 * 60));
        assert_eq!(config.check_session.max, Duration::from_secs(60 * 60));
        assert_eq!(config.placement, PlacementKind::FewestActiveContainers);
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            database url="postgres://beacon@localhost/beacon"
            backend "kubernetes" namespace="ci"
            placement "random"
            check-session min="1m" max="10m"
            scanner interval="30s" default-check-every="2m"
            checker interval="500ms" concurrency=4 claim-grace="30s"
            credentials env-prefix="CI_VAR_" {
                var "github-token" "abc123"
            }
            worker "local" addr="127.0.0.1:7788" {
                tag "linux" "amd64"
                team "0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b"
                resource-type "git" image="concourse/git-resource" version="1.0"
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://beacon@localhost/beacon")
        );
        assert_eq!(
            config.backend,
            BackendConfig::Kubernetes {
                namespace: "ci".to_string(),
                fetcher_image: DEFAULT_FETCHER_IMAGE.to_string(),
            }
        );
        assert_eq!(config.placement, PlacementKind::Random);
        assert_eq!(config.check_session.min, Duration::from_secs(60));
        assert_eq!(config.check_session.max, Duration::from_secs(600));
        assert_eq!(config.scanner.interval, Duration::from_secs(30));
        assert_eq!(config.scanner.default_check_every, Duration::from_secs(120));
        assert_eq!(config.checker.interval, Duration::from_millis(500));
        assert_eq!(config.checker.concurrency, 4);
        assert_eq!(config.checker.claim_grace, Duration::from_secs(30));
        assert_eq!(config.credentials.env_prefix, "CI_VAR_");
        assert_eq!(config.credentials.vars["github-token"], "abc123");

        let worker = &config.workers[0];
        assert_eq!(worker.name, "local");
        assert_eq!(worker.addr, "127.0.0.1:7788");
        assert_eq!(worker.tags, vec!["linux", "amd64"]);
        assert!(worker.team_id.is_some());
        assert_eq!(worker.resource_types[0].type_, "git");
        assert_eq!(worker.resource_types[0].version, "1.0");
    }

    #[test]
    fn test_rejects_unknown_backend_and_placement() {
        assert!(matches!(
            parse_system_config(r#"backend "nomad""#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_system_config(r#"placement "round-robin""#),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_durations() {
        let err = parse_system_config(r#"scanner interval="soon""#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        let err = parse_system_config(r#"check-session min="2h" max="1h""#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_worker_resource_type_requires_image() {
        let kdl = r#"
            worker "w" {
                resource-type "git"
            }
        "#;
        assert!(matches!(
            parse_system_config(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }
}
