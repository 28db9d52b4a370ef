//! Static policy configuration.
//!
//! The configuration file is read once at startup and compiled into an
//! immutable [`PolicyConfig`]. Evaluators receive it by reference; nothing
//! mutates it afterwards, so concurrent admission requests share it through
//! an `Arc` without locking.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::webhooks::policies::ResourceKind;
use crate::webhooks::policies::rules::RuleTable;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "ADMISSION_CONFIG";
/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/admission/config.yaml";

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk configuration layout.
///
/// Keys are camelCase; the PascalCase names of the legacy JSON layout are
/// accepted as aliases.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    #[serde(alias = "MonitorNamespaces")]
    pub monitor_namespaces: Vec<String>,
    #[serde(alias = "ExemptIngresses")]
    pub exempt_ingresses: Vec<String>,
    #[serde(alias = "ExemptDeployments")]
    pub exempt_deployments: Vec<String>,
    #[serde(alias = "ExemptServices")]
    pub exempt_services: Vec<String>,
    #[serde(alias = "ValidHosts")]
    pub valid_hosts: Vec<String>,
    #[serde(alias = "NginxMasterIngressAllow")]
    pub nginx_master_ingress_allow: BTreeMap<String, String>,
    #[serde(alias = "NginxMinionIngressAllow")]
    pub nginx_minion_ingress_allow: BTreeMap<String, String>,
    #[serde(alias = "IngressMinionRequiredAnnotations")]
    pub ingress_minion_required_annotations: BTreeMap<String, String>,
    #[serde(alias = "IngressMinionRequiredLabels")]
    pub ingress_minion_required_labels: BTreeMap<String, String>,
}

/// Compiled, read-only policy configuration
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    monitor_namespaces: Vec<String>,
    exempt_deployments: BTreeSet<String>,
    exempt_services: BTreeSet<String>,
    exempt_ingresses: BTreeSet<String>,
    valid_hosts: BTreeSet<String>,
    master_annotations: RuleTable,
    minion_annotations: RuleTable,
    minion_required_annotations: RuleTable,
    minion_required_labels: RuleTable,
}

/// Pods are exempted by namespace only
static NO_EXEMPTIONS: BTreeSet<String> = BTreeSet::new();

impl PolicyConfig {
    /// Load and compile the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let file: ConfigFile =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: shown.clone(),
                source,
            })?;

        let config = Self::from_file(file)?;
        info!(
            path = %shown,
            monitored_namespaces = config.monitor_namespaces.len(),
            valid_hosts = config.valid_hosts.len(),
            "Loaded policy configuration"
        );
        Ok(config)
    }

    /// Compile an already-parsed configuration
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let config = Self {
            monitor_namespaces: file.monitor_namespaces,
            exempt_deployments: exempt_set("exemptDeployments", file.exempt_deployments)?,
            exempt_services: exempt_set("exemptServices", file.exempt_services)?,
            exempt_ingresses: exempt_set("exemptIngresses", file.exempt_ingresses)?,
            valid_hosts: file.valid_hosts.into_iter().collect(),
            master_annotations: RuleTable::from_patterns(file.nginx_master_ingress_allow),
            minion_annotations: RuleTable::from_patterns(file.nginx_minion_ingress_allow),
            minion_required_annotations: RuleTable::from_patterns(
                file.ingress_minion_required_annotations,
            ),
            minion_required_labels: RuleTable::from_patterns(file.ingress_minion_required_labels),
        };

        if config.monitor_namespaces.is_empty() {
            warn!("No monitored namespaces configured, every request will be allowed unchanged");
        }
        for (table, name) in [
            (&config.master_annotations, "nginxMasterIngressAllow"),
            (&config.minion_annotations, "nginxMinionIngressAllow"),
            (
                &config.minion_required_annotations,
                "ingressMinionRequiredAnnotations",
            ),
            (&config.minion_required_labels, "ingressMinionRequiredLabels"),
        ] {
            for key in table.invalid_keys() {
                warn!(table = name, key = %key, "Rule will not be enforced");
            }
        }

        Ok(config)
    }

    /// Parse and compile configuration from a YAML (or JSON) string
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        Self::from_file(file)
    }

    pub fn with_monitored_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.monitor_namespaces.push(prefix.into());
        self
    }

    /// Exempt `namespace/name` for `kind`. Pods cannot be exempted by identity.
    pub fn with_exempt(mut self, kind: ResourceKind, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        match kind {
            ResourceKind::Deployment => {
                self.exempt_deployments.insert(identity);
            }
            ResourceKind::Service => {
                self.exempt_services.insert(identity);
            }
            ResourceKind::Ingress | ResourceKind::LegacyIngress => {
                self.exempt_ingresses.insert(identity);
            }
            ResourceKind::Pod => {
                warn!(identity = %identity, "Pods are exempted by namespace only, ignoring");
            }
        }
        self
    }

    pub fn with_valid_host(mut self, host: impl Into<String>) -> Self {
        self.valid_hosts.insert(host.into());
        self
    }

    pub fn with_master_annotation(mut self, key: impl Into<String>, pattern: &str) -> Self {
        self.master_annotations.insert(key, pattern);
        self
    }

    pub fn with_minion_annotation(mut self, key: impl Into<String>, pattern: &str) -> Self {
        self.minion_annotations.insert(key, pattern);
        self
    }

    pub fn with_minion_required_annotation(
        mut self,
        key: impl Into<String>,
        pattern: &str,
    ) -> Self {
        self.minion_required_annotations.insert(key, pattern);
        self
    }

    pub fn with_minion_required_label(mut self, key: impl Into<String>, pattern: &str) -> Self {
        self.minion_required_labels.insert(key, pattern);
        self
    }

    pub fn monitor_namespaces(&self) -> &[String] {
        &self.monitor_namespaces
    }

    /// Exempt `namespace/name` identities for `kind`
    pub fn exempt_identities(&self, kind: ResourceKind) -> &BTreeSet<String> {
        match kind {
            ResourceKind::Deployment => &self.exempt_deployments,
            ResourceKind::Service => &self.exempt_services,
            ResourceKind::Ingress | ResourceKind::LegacyIngress => &self.exempt_ingresses,
            ResourceKind::Pod => &NO_EXEMPTIONS,
        }
    }

    pub fn host_is_valid(&self, host: &str) -> bool {
        self.valid_hosts.contains(host)
    }

    pub fn master_annotations(&self) -> &RuleTable {
        &self.master_annotations
    }

    pub fn minion_annotations(&self) -> &RuleTable {
        &self.minion_annotations
    }

    pub fn minion_required_annotations(&self) -> &RuleTable {
        &self.minion_required_annotations
    }

    pub fn minion_required_labels(&self) -> &RuleTable {
        &self.minion_required_labels
    }
}

fn exempt_set(field: &str, entries: Vec<String>) -> Result<BTreeSet<String>, ConfigError> {
    entries
        .into_iter()
        .map(|entry| match entry.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(entry),
            _ => Err(ConfigError::Invalid(format!(
                "{} entry '{}' must have the form namespace/name",
                field, entry
            ))),
        })
        .collect()
}
