//! HAProxy sink.
//!
//! Each change batch is first tried against the running process through
//! its control socket (enable/disable servers).  Independently of that
//! the whole configuration is rendered from the current node lists and
//! installed when it differs from the file on disk; the process is
//! reloaded only when the live changes couldn't express the batch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::{HaproxyConfig, HaproxyServiceOptions, ServiceConfig, ServiceMap};
use crate::discovery::{ServiceNodes, ServiceResolver};
use crate::errors::{Error, Result};
use crate::types::{ChangeBatch, Node, NodeOrder};

pub mod comm;
pub mod state;
pub mod updater;

use comm::HaproxyComm;
use updater::ServiceUpdater;

const STATS_CONFIG: &[&str] = &[
    "bind :1024",
    "mode http",
    "stats enable",
    "stats uri /",
    "stats show-legends",
    "stats show-node",
    "stats refresh 60s",
    "monitor-uri /alive",
];

/// Valid HAProxy server weights.
const MAX_WEIGHT: i64 = 256;

const DEFAULT_WEIGHT: i64 = 10;
const SAME_RACK_WEIGHT: i64 = 20;

pub struct Haproxy {
    global: Vec<String>,
    defaults: Vec<String>,
    extra: Vec<String>,
    rack: Option<String>,
    /// canonical service -> sink options, in configuration order
    services: Vec<(String, ServiceConfig)>,
    listen: BTreeMap<String, HaproxyServiceOptions>,
    order: NodeOrder,
    nodes: Arc<dyn ServiceNodes>,
    comm: HaproxyComm,
    updater: ServiceUpdater,
    state_file: PathBuf,
    /// source -> raw service names to watch
    monitored: BTreeMap<String, Vec<String>>,
    started: bool,
}

impl Haproxy {
    pub fn new(
        config: &HaproxyConfig,
        rack: Option<String>,
        definitions: &ServiceMap,
        nodes: Arc<dyn ServiceNodes>,
        order: NodeOrder,
    ) -> Result<Self> {
        let services = config.service_configs()?;

        let mut listen = BTreeMap::new();
        for (name, _) in &services {
            let definition = definitions.get(name).ok_or_else(|| {
                Error::Config(format!("{} is not defined in the services config", name))
            })?;
            let options = definition.haproxy.clone().ok_or_else(|| {
                Error::Config(format!("{} has no haproxy section", name))
            })?;
            listen.insert(name.clone(), options);
        }

        Ok(Self {
            global: config.global.clone(),
            defaults: config.defaults.clone(),
            extra: config.extra.clone(),
            rack,
            services,
            listen,
            order,
            nodes,
            comm: HaproxyComm::new(&config.service.socket),
            updater: ServiceUpdater::new(&config.service),
            state_file: config.service.state_file.clone(),
            monitored: BTreeMap::new(),
            started: false,
        })
    }

    /// Works out which raw services every source has to watch.
    pub fn start(&mut self, resolver: &dyn ServiceResolver) -> Result<()> {
        let mut monitored: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, options) in &self.services {
            let (source, services) =
                resolver.service2sources(name, options.data_centers.as_deref())?;
            monitored.entry(source).or_default().extend(services);
        }
        self.monitored = monitored;
        self.started = true;
        Ok(())
    }

    pub fn services_needed(&self) -> &BTreeMap<String, Vec<String>> {
        &self.monitored
    }

    pub async fn generate_config(&self) -> Result<Vec<u8>> {
        let mut cnf = String::new();

        cnf.push_str("global\n");
        indent(&mut cnf, &self.global, 1);

        cnf.push_str("\ndefaults\n");
        indent(&mut cnf, &self.defaults, 1);

        cnf.push_str("\nfrontend stats\n");
        indent(&mut cnf, STATS_CONFIG, 1);

        for (service, config) in &self.services {
            let listen = &self.listen[service];

            cnf.push_str(&format!("\nlisten {}\n", service));
            indent(&mut cnf, &listen.options, 1);
            cnf.push('\n');

            let mut nodes = self
                .nodes
                .service_nodes(service, config.data_centers.as_deref())
                .await?;
            self.order.sort(&mut nodes);

            let servers: Vec<String> =
                calculate_weights(&nodes, config.rack_aware, self.rack.as_deref())
                    .into_iter()
                    .map(|(node, weight)| {
                        format!(
                            "server {} {}:{} {} weight {}",
                            node.name, node.address, node.port, listen.server_options, weight
                        )
                    })
                    .collect();
            indent(&mut cnf, &servers, 1);
        }

        if !self.extra.is_empty() {
            cnf.push_str("\n# Extra configuration added (you should normally avoid this setting)\n");
            indent(&mut cnf, &self.extra, 0);
        }

        Ok(cnf.into_bytes())
    }

    /// Applies what it safely can through the control socket and returns
    /// whether a full reload is still needed.
    async fn incremental_update(&self, changes: &ChangeBatch) -> Result<bool> {
        let backends = self.comm.get_backends().await?;

        let mut reload = false;
        let mut disable: Vec<(&str, &str)> = Vec::new();
        for (backend, change) in changes {
            debug!("Changes for {}: {:?}", backend, change);
            let mut backend_reload = false;

            if !change.updated.is_empty() {
                debug!("We have updates for {}; forcing reload", backend);
                backend_reload = true;
            }

            if !backends.contains(backend) {
                debug!("{} is new; forcing reload", backend);
                reload = true;
                continue;
            }

            let state = self.comm.get_servers_state(backend).await?;

            for server in &change.added {
                if !state.contains_key(&server.name) {
                    debug!("{}/{} is new; forcing reload", backend, server.name);
                    backend_reload = true;
                } else if self
                    .comm
                    .is_server_disabled(backend, &server.name, Some(&state))
                    .await?
                {
                    debug!("{}", state[&server.name].summary());
                    info!("enabling {}/{}", backend, server.name);
                    self.comm.enable_server(backend, &server.name).await?;
                }
            }

            // the backend gets regenerated anyway
            if backend_reload {
                reload = true;
                continue;
            }

            for server in &change.removed {
                if !state.contains_key(&server.name) {
                    error!(
                        "{}/{} is being removed but haproxy doesn't recognize it; forcing reload",
                        backend, server.name
                    );
                    backend_reload = true;
                    break;
                }
                if self
                    .comm
                    .is_server_disabled(backend, &server.name, Some(&state))
                    .await?
                {
                    error!(
                        "{}/{} is being removed but haproxy has it disabled already; forcing reload",
                        backend, server.name
                    );
                    backend_reload = true;
                    break;
                }
                debug!("{}", state[&server.name].summary());
                disable.push((backend.as_str(), server.name.as_str()));
            }

            reload |= backend_reload;
        }

        if !reload {
            for (backend, server) in disable {
                info!("disabling {}/{}", backend, server);
                self.comm.disable_server(backend, server).await?;
            }
        }

        Ok(reload)
    }

    pub async fn process_update(&self, source: &str, changes: &ChangeBatch) -> Result<()> {
        if !self.started {
            return Err(Error::NotRunning("haproxy sink"));
        }
        debug!("Processing changes of {} services from {}", changes.len(), source);

        let running = self.updater.is_running().await;
        let mut reload = if running && self.comm.has_socket() {
            self.incremental_update(changes).await?
        } else {
            true
        };

        debug!("Generating config");
        let new_config = self.generate_config().await?;

        if self.updater.needs_update(&new_config).await? {
            info!("Config is different; updating");
            self.updater.update_config(&new_config).await?;
        } else {
            info!("No change in config; skipping update");
            reload = false;
        }

        if !running {
            info!("HAProxy is not running; starting the service");
            // a state file left behind can't be trusted on a cold start
            self.remove_state_file().await?;
            if !self.updater.start().await {
                error!("Starting HAProxy failed");
            }
        } else if reload {
            if self.comm.has_socket() {
                info!("Writing state file to {}", self.state_file.display());
                self.comm.save_state(&self.state_file).await?;
            }

            info!("Reloading haproxy");
            if !self.updater.reload().await {
                error!("Reloading HAProxy failed");
            }

            self.remove_state_file().await?;
        }

        Ok(())
    }

    async fn remove_state_file(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.state_file).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn indent<S: AsRef<str>>(out: &mut String, lines: &[S], level: usize) {
    for line in lines {
        for _ in 0..level {
            out.push('\t');
        }
        out.push_str(line.as_ref());
        out.push('\n');
    }
}

enum Contribution {
    Static(i64),
    Percent(f64),
}

fn contribution(node: &Node, rack_aware: bool, local_rack: Option<&str>) -> Contribution {
    let default = || {
        let same_rack = rack_aware
            && match local_rack {
                // without a local rack every node is local
                None => true,
                Some(rack) => node.attrs.get("rack").map(String::as_str) == Some(rack),
            };
        Contribution::Static(if same_rack { SAME_RACK_WEIGHT } else { DEFAULT_WEIGHT })
    };

    let Some(weight) = node.attrs.get("weight") else {
        return default();
    };

    let parsed = match weight.strip_suffix('%') {
        Some(pct) => pct.trim().parse().map(Contribution::Percent).ok(),
        None => weight.trim().parse().map(Contribution::Static).ok(),
    };
    parsed.unwrap_or_else(|| {
        warn!("{} has an invalid weight {:?}; using the default", node.name, weight);
        default()
    })
}

/// Resolves every node's weight, keeping the input order.
///
/// Static weights are taken as they are.  Percentage weights are scaled so
/// that they receive that share of the total, anchored on the sum of the
/// static weights.
pub fn calculate_weights(
    nodes: &[Node],
    rack_aware: bool,
    local_rack: Option<&str>,
) -> Vec<(Node, u32)> {
    let contributions: Vec<Contribution> = nodes
        .iter()
        .map(|n| contribution(n, rack_aware, local_rack))
        .collect();

    let (mut sum_static, mut sum_pct) = (0i64, 0f64);
    for c in &contributions {
        match c {
            Contribution::Static(w) => sum_static = sum_static.saturating_add(*w),
            Contribution::Percent(p) => sum_pct += p,
        }
    }

    let weight_per_pct = if sum_static <= 0 {
        error!("There's not a single static weight; treating percentage weights as weights");
        1.0
    } else if sum_pct >= 100.0 {
        error!(
            "Sum of percentage weights is equal or higher than 100% ({}); treating percentage \
             weights as weights",
            sum_pct
        );
        1.0
    } else {
        sum_static as f64 / (100.0 - sum_pct)
    };

    nodes
        .iter()
        .zip(contributions)
        .map(|(node, c)| {
            let weight = match c {
                Contribution::Static(w) => w,
                Contribution::Percent(p) => {
                    let w = (weight_per_pct * p).round_ties_even() as i64;
                    if w < 1 {
                        warn!(
                            "{}'s weight is calculated to {}; this node won't be receiving any traffic",
                            node.name, w
                        );
                    }
                    w
                }
            };
            (node.clone(), weight.clamp(0, MAX_WEIGHT) as u32)
        })
        .collect()
}
