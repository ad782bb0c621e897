use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::consul::Consistency;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub program: ProgramConfig,
    pub sources: SourcesConfig,
    pub sinks: SinksConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProgramConfig {
    pub services_config: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rack: Option<String>,
    /// Salt for the per-host node ordering; falls back to `HOSTNAME`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_salt: Option<String>,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            services_config: "services.yaml".into(),
            rack: None,
            sort_salt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourcesConfig {
    pub consul: ConsulConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsulConfig {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub consistency: Consistency,
    /// Upper bound on pooled connections to the agent.
    pub limit: usize,
    /// Seconds to wait before retrying a failed query.
    pub retry_delay: u64,
}

impl ConsulConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8500,
            scheme: "http".into(),
            consistency: Consistency::Stale,
            limit: 10,
            retry_delay: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SinksConfig {
    pub haproxy: HaproxyConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HaproxyConfig {
    pub service: ServiceCommands,
    pub global: Vec<String>,
    pub defaults: Vec<String>,
    pub extra: Vec<String>,
    pub services: Vec<ServiceEntry>,
}

/// How to reach and drive the load balancer process.
///
/// `check-config`, `status`, `start` and `reload` are shell templates;
/// `{config}` and `{pidfile}` are substituted before running them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceCommands {
    pub config: PathBuf,
    pub check_config: String,
    pub status: String,
    pub start: String,
    pub reload: String,
    pub pid_file: PathBuf,
    pub state_file: PathBuf,
    pub socket: PathBuf,
}

impl Default for ServiceCommands {
    fn default() -> Self {
        Self {
            config: "/etc/haproxy/haproxy.cfg".into(),
            check_config: "/usr/sbin/haproxy -c -f {config}".into(),
            status: "service haproxy status".into(),
            start: "service haproxy start".into(),
            reload: "service haproxy reload".into(),
            pid_file: "/var/run/haproxy.pid".into(),
            state_file: "/var/lib/haproxy/server-state".into(),
            socket: "/var/run/haproxy.sock".into(),
        }
    }
}

/// One item of `sinks.haproxy.services`: either a bare name or a
/// single-key map of name to options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServiceEntry {
    Name(String),
    WithOptions(BTreeMap<String, ServiceOptions>),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServiceOptions {
    pub rack_aware: bool,
    pub minimum: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_center: Option<DataCenters>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DataCenters {
    /// `"dc1 dc2"`
    Joined(String),
    List(Vec<String>),
}

impl DataCenters {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            DataCenters::Joined(s) => s.split_whitespace().map(str::to_string).collect(),
            DataCenters::List(v) => v.clone(),
        }
    }
}

/// Per canonical service settings for the load balancer sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub rack_aware: bool,
    /// Accepted but not acted upon yet.
    pub minimum: u32,
    pub data_centers: Option<Vec<String>>,
}

impl From<&ServiceOptions> for ServiceConfig {
    fn from(options: &ServiceOptions) -> Self {
        let data_centers = options
            .data_center
            .as_ref()
            .map(DataCenters::to_vec)
            .filter(|dcs| !dcs.is_empty());
        Self {
            rack_aware: options.rack_aware,
            minimum: options.minimum,
            data_centers,
        }
    }
}

impl HaproxyConfig {
    /// Flattens the configured service list, preserving its order.
    pub fn service_configs(&self) -> Result<Vec<(String, ServiceConfig)>> {
        let mut result = Vec::with_capacity(self.services.len());
        for entry in &self.services {
            match entry {
                ServiceEntry::Name(name) => result.push((name.clone(), ServiceConfig::default())),
                ServiceEntry::WithOptions(map) => {
                    if map.len() != 1 {
                        return Err(Error::Config(
                            "dictionary needs to have only one element (perhaps you forgot \
                             a dash in yaml config?)"
                                .into(),
                        ));
                    }
                    for (name, options) in map {
                        result.push((name.clone(), options.into()));
                    }
                }
            }
        }
        Ok(result)
    }
}

/// Entry of the static service map.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceDefinition {
    pub discovery: Discovery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<HaproxyServiceOptions>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discovery {
    pub method: String,
    pub service: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HaproxyServiceOptions {
    pub options: Vec<String>,
    pub server_options: String,
}

pub type ServiceMap = BTreeMap<String, ServiceDefinition>;

impl Config {
    pub fn load() -> Result<Self> {
        let path = std::env::var("TETHER_CONFIG").unwrap_or_else(|_| "tether.yaml".into());
        Self::figment(path).extract().map_err(Into::into)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Toml::file("tether.toml"))
            .merge(Env::prefixed("TETHER_").split("__"))
    }

    /// Salt used to order servers; unique per host when possible.
    pub fn sort_salt(&self) -> String {
        if let Some(ref salt) = self.program.sort_salt {
            return salt.clone();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) => host,
            Err(_) => {
                log::warn!("HOSTNAME is not set and no sort-salt configured; server order will match other hosts");
                String::new()
            }
        }
    }
}

/// Reads the static canonical service map.
pub fn load_services(path: &Path) -> Result<ServiceMap> {
    if !path.is_file() {
        return Err(Error::Config(format!(
            "services config {} does not exist",
            path.display()
        )));
    }
    Figment::from(Yaml::file(path))
        .extract()
        .map_err(Into::into)
}
