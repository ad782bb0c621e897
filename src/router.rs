//! Wires the consul watcher to the HAProxy sink.
//!
//! Change batches travel over a channel to a single reconciliation task,
//! so passes over the load balancer never overlap.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{load_services, Config, ServiceMap};
use crate::discovery::consul::{data_center, Consul};
use crate::discovery::{ChangeDetected, ConsulListener, ServiceResolver, ServicesNeeded, Sources};
use crate::errors::{Error, Result};
use crate::haproxy::Haproxy;
use crate::types::{ChangeBatch, NodeOrder};

type Update = (String, ChangeBatch);

/// Canonical service names and the discovery services behind them.
pub struct ServiceTable {
    services: ServiceMap,
    /// (method, raw service) -> canonical
    reverse: HashMap<(String, String), String>,
}

impl ServiceTable {
    pub fn new(services: ServiceMap) -> Self {
        let mut reverse: HashMap<(String, String), String> = HashMap::new();
        for (name, definition) in &services {
            let discovery = &definition.discovery;
            let key = (discovery.method.clone(), discovery.service.clone());
            match reverse.entry(key) {
                Entry::Occupied(existing) => warn!(
                    "{} and {} both use {} service {}; changes are only reported for {}",
                    existing.get(),
                    name,
                    discovery.method,
                    discovery.service,
                    existing.get()
                ),
                Entry::Vacant(slot) => {
                    slot.insert(name.clone());
                }
            }
        }
        Self { services, reverse }
    }
}

impl ServiceResolver for ServiceTable {
    fn service2sources(
        &self,
        canonical: &str,
        data_centers: Option<&[String]>,
    ) -> Result<(String, Vec<String>)> {
        let definition = self
            .services
            .get(canonical)
            .ok_or_else(|| Error::Config(format!("unknown service {}", canonical)))?;
        let discovery = &definition.discovery;

        let services = match data_centers {
            Some(dcs) => dcs
                .iter()
                .map(|dc| format!("{}/{}", dc, discovery.service))
                .collect(),
            None => vec![discovery.service.clone()],
        };
        Ok((discovery.method.clone(), services))
    }

    fn source2service(&self, source: &str, service: &str) -> Option<String> {
        let (_, service) = data_center(service);
        self.reverse
            .get(&(source.to_string(), service.to_string()))
            .cloned()
    }
}

/// What the watcher sees of the rest of the daemon.
struct Hooks {
    table: Arc<ServiceTable>,
    needed: BTreeMap<String, Vec<String>>,
    updates: mpsc::UnboundedSender<Update>,
}

impl ServicesNeeded for Hooks {
    fn services_needed(&self, source: &str) -> Vec<String> {
        self.needed.get(source).cloned().unwrap_or_default()
    }
}

impl ChangeDetected for Hooks {
    fn change_detected(&self, source: &str, changes: ChangeBatch) {
        if self.updates.send((source.to_string(), changes)).is_err() {
            error!("Reconciliation has stopped; dropping changes from {}", source);
        }
    }
}

impl ServiceResolver for Hooks {
    fn service2sources(
        &self,
        canonical: &str,
        data_centers: Option<&[String]>,
    ) -> Result<(String, Vec<String>)> {
        self.table.service2sources(canonical, data_centers)
    }

    fn source2service(&self, source: &str, service: &str) -> Option<String> {
        self.table.source2service(source, service)
    }
}

async fn reconcile(sink: Haproxy, mut updates: mpsc::UnboundedReceiver<Update>) {
    while let Some((source, changes)) = updates.recv().await {
        if let Err(e) = sink.process_update(&source, &changes).await {
            error!("Failed to apply changes from {}: {}", source, e.chain());
        }
    }
    debug!("Reconciliation channel closed");
}

pub struct Router {
    listener: Arc<ConsulListener>,
    reconciler: JoinHandle<()>,
}

impl Router {
    /// Builds every component and starts watching. Must run inside a
    /// tokio runtime.
    pub fn new(config: &Config) -> Result<Self> {
        let services = load_services(&config.program.services_config)?;
        let table = Arc::new(ServiceTable::new(services.clone()));

        let consul = Consul::new(&config.sources.consul)?;
        let listener = Arc::new(ConsulListener::new(
            Arc::new(consul),
            config.sources.consul.retry_delay(),
        ));
        let sources = Arc::new(Sources::new(table.clone(), listener.clone()));

        let mut sink = Haproxy::new(
            &config.sinks.haproxy,
            config.program.rack.clone(),
            &services,
            sources,
            NodeOrder::new(config.sort_salt()),
        )?;
        sink.start(table.as_ref())?;
        info!("Services needed: {:?}", sink.services_needed());

        let (updates, rx) = mpsc::unbounded_channel();
        let hooks = Hooks {
            table,
            needed: sink.services_needed().clone(),
            updates,
        };
        let reconciler = tokio::spawn(reconcile(sink, rx));
        listener.start(Arc::new(hooks));

        Ok(Self {
            listener,
            reconciler,
        })
    }

    /// Runs until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        wait_for_signal().await?;
        self.shutdown().await;
        Ok(())
    }

    /// Stops watching and lets the pass in progress finish.
    pub async fn shutdown(self) {
        // the watcher holds the only sender; stopping it closes the channel
        self.listener.stop().await;
        if let Err(e) = self.reconciler.await {
            error!("Reconciliation task failed: {}", e);
        }
        info!("Shutdown complete.");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Received Ctrl+C, shutting down...");
        }
        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}
