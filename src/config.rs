//! # Service Configuration
//!
//! TOML file read at startup. Every field has a default, so an empty file is
//! a valid single-node configuration with no resources.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8710
//!
//! [replication]
//! max_polls = 1000
//! poll_interval_ms = 100
//!
//! [directory.groups]
//! qa = ["alice", "bob"]
//! eng = ["@qa", "carol"]
//!
//! [[acls]]
//! name = "lab"
//! entries = [{ type = "group", principal = "qa", group_limit = 4 }]
//!
//! [[resources]]
//! name = "nfs01"
//! type = "nfs"
//! acl = "lab"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acl::model::resolve_entries;
use crate::acl::AclEntrySpec;
use crate::config_validator::{format_validation_errors, ConfigResult, ConfigValidationError, ConfigValidator};
use crate::observability::{LogFormat, SlowRequestConfig};
use crate::replication::GateConfig;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration:\n{}", format_validation_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8710,
        }
    }
}

impl ServerConfig {
    /// Listen address. Falls back to loopback if `bind` does not parse;
    /// validation reports that case at startup.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self
            .bind
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        SocketAddr::new(ip, self.port)
    }
}

/// Resource store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bound on waiting for the resource table lock; unbounded when unset
    pub lock_timeout_ms: Option<u64>,
    /// Seconds between expired-lease sweeps; 0 disables the sweep
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: None,
            sweep_interval_secs: 60,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Group membership served by the static directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Group name to members; `@name` nests another group
    pub groups: BTreeMap<String, Vec<String>>,
}

/// ACL created at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclSeed {
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Name of an ACL defined earlier in the file
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub entries: Vec<AclEntrySpec>,
}

fn default_owner() -> String {
    "admin".to_string()
}

/// Resource registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSeed {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub sites: Option<Vec<String>>,
    /// Name of the ACL whose pool the resource joins
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub replication: GateConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub slow_requests: SlowRequestConfig,
    pub directory: DirectoryConfig,
    pub acls: Vec<AclSeed>,
    pub resources: Vec<ResourceSeed>,
}

impl ServiceConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Check every value, collecting all errors.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut v = ConfigValidator::new();

        v.validate_ip("server.bind", &self.server.bind)
            .validate_port("server.port", self.server.port)
            .validate_range("replication.max_polls", u64::from(self.replication.max_polls), 0, 100_000)
            .validate_duration_ms("replication.poll_interval_ms", self.replication.poll_interval_ms, 1, 60_000);
        if let Some(ms) = self.store.lock_timeout_ms {
            v.validate_duration_ms("store.lock_timeout_ms", ms, 1, 600_000);
        }
        v.validate_range("store.sweep_interval_secs", self.store.sweep_interval_secs, 0, 86_400);
        if self.slow_requests.enabled {
            v.validate_range("slow_requests.threshold_ms", self.slow_requests.threshold_ms, 1, 3_600_000);
        }

        self.validate_directory(&mut v);
        let acl_names = self.validate_acls(&mut v);
        self.validate_resources(&mut v, &acl_names);

        v.finish()
    }

    fn validate_directory(&self, v: &mut ConfigValidator) {
        for (group, members) in &self.directory.groups {
            v.validate_non_empty("directory.groups", group);
            for member in members {
                let field = format!("directory.groups.{}", group);
                match member.strip_prefix('@') {
                    Some(nested) if !self.directory.groups.contains_key(nested) => {
                        v.error(&field, member, "Nested group is not defined");
                    }
                    _ => {
                        v.validate_non_empty(&field, member);
                    }
                }
            }
        }
    }

    fn validate_acls(&self, v: &mut ConfigValidator) -> HashSet<&str> {
        v.validate_unique("acls.name", self.acls.iter().map(|a| a.name.as_str()));

        let mut defined = HashSet::new();
        for acl in &self.acls {
            let field = format!("acls.{}", acl.name);
            v.validate_non_empty("acls.name", &acl.name)
                .validate_non_empty(&format!("{}.owner", field), &acl.owner);
            if acl.name.trim().parse::<u64>().is_ok() {
                v.error("acls.name", &acl.name, "Name must not be purely numeric");
            }
            if let Some(parent) = &acl.parent {
                // Seeds are created in file order
                v.validate_reference(&format!("{}.parent", field), parent, &defined);
            }
            if let Err(e) = resolve_entries(acl.entries.clone()) {
                v.error(&format!("{}.entries", field), acl.entries.len(), &e.to_string());
            }
            defined.insert(acl.name.as_str());
        }
        defined
    }

    fn validate_resources(&self, v: &mut ConfigValidator, acl_names: &HashSet<&str>) {
        v.validate_unique("resources.name", self.resources.iter().map(|r| r.name.as_str()));

        for resource in &self.resources {
            let field = format!("resources.{}", resource.name);
            v.validate_non_empty("resources.name", &resource.name)
                .validate_non_empty(&format!("{}.type", field), &resource.resource_type);
            if let Some(acl) = &resource.acl {
                v.validate_reference(&format!("{}.acl", field), acl, acl_names);
            }
            if matches!(&resource.sites, Some(sites) if sites.is_empty()) {
                v.error(
                    &format!("{}.sites", field),
                    "[]",
                    "Site list must not be empty; omit it to allow any site",
                );
            }
        }
    }
}
