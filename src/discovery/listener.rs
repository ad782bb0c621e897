//! Consul watcher.
//!
//! All watch state (last snapshot per service, last index per monitored
//! service) is owned by a single task.  Inside that task every long poll
//! is a future in one [`FuturesUnordered`]; whichever completes first is
//! inspected and immediately re-issued with its new index.  Other tasks
//! read the state only by sending a request to the task and awaiting the
//! reply.
//!
//! Services in the same data center share one blocking index, so only
//! one of them per data center is long-polled.  When any index moves,
//! every watched service is fetched again and diffed against the previous
//! snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::consul::{data_center, Catalog, HealthEntry, HealthQuery};
use super::{SourceHooks, CONSUL};
use crate::errors::{Error, Result};
use crate::types::{ChangeBatch, Changes, Node};

/// How long consul may hold a blocking query.
const WAIT: &str = "5m";

/// Picks the first service of every data center; `None` (local) counts
/// as one data center.
pub fn monitor_services(services: &[String]) -> Vec<String> {
    let mut seen: HashSet<Option<&str>> = HashSet::new();
    let mut monitors = Vec::new();
    for service in services {
        if seen.insert(data_center(service).0) {
            monitors.push(service.clone());
        }
    }
    monitors
}

fn to_node(entry: &HealthEntry) -> Node {
    let address = if entry.service.address.is_empty() {
        &entry.node.address
    } else {
        &entry.service.address
    };
    Node::from_registry(
        address,
        &entry.service.port.to_string(),
        &entry.node.node,
        entry.service.tags.iter().flatten(),
    )
}

/// Queries consul until it answers; there's no upper bound on attempts.
async fn health_service(
    catalog: Arc<dyn Catalog>,
    service: String,
    index: Option<String>,
    retry_delay: Duration,
) -> (String, String, Vec<Node>) {
    let query = HealthQuery {
        service: service.clone(),
        wait: index.as_ref().map(|_| WAIT.to_string()),
        index,
        passing: true,
    };

    loop {
        match catalog.health(&query).await {
            Ok(resp) => {
                let nodes = resp.entries.iter().map(to_node).collect();
                return (service, resp.index, nodes);
            }
            Err(e) if e.is_registry_failure() => {
                error!("Received an error when querying consul for {}: {}", service, e);
            }
            Err(e) => {
                error!("Got an unknown error when pulling {} from consul: {}", service, e);
            }
        }

        info!("Sleeping for {:?} before retrying", retry_delay);
        sleep(retry_delay).await;
    }
}

enum Request {
    ServiceNodes {
        service: String,
        reply: oneshot::Sender<Option<Vec<Node>>>,
    },
}

struct Watch {
    catalog: Arc<dyn Catalog>,
    hooks: Arc<dyn SourceHooks>,
    retry_delay: Duration,
    /// raw service name -> last fetched nodes
    state: HashMap<String, Vec<Node>>,
    /// monitored service -> last seen index
    indexes: HashMap<String, String>,
}

impl Watch {
    fn query(
        &self,
        service: String,
        index: Option<String>,
    ) -> impl Future<Output = (String, String, Vec<Node>)> + Send + 'static {
        health_service(self.catalog.clone(), service, index, self.retry_delay)
    }

    async fn run(mut self, cancel: CancellationToken, mut requests: mpsc::Receiver<Request>) {
        let services = self.hooks.services_needed(CONSUL);
        if services.is_empty() {
            error!("No services to monitor");
            return;
        }

        let monitors = monitor_services(&services);
        info!(
            "Watching {} consul services through {:?}",
            services.len(),
            monitors
        );

        let mut queries = FuturesUnordered::new();
        for service in &monitors {
            queries.push(self.query(service.clone(), None));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Got cancellation request; exiting");
                    return;
                }
                Some(request) = requests.recv() => self.handle(request),
                Some((service, index, _)) = queries.next() => {
                    let mut changed = self.record_index(&service, &index);
                    queries.push(self.query(service, Some(index)));

                    // pick up anything else that finished meanwhile
                    while let Some(Some((service, index, _))) = queries.next().now_or_never() {
                        changed |= self.record_index(&service, &index);
                        queries.push(self.query(service, Some(index)));
                    }

                    if !changed {
                        continue;
                    }

                    debug!("Calculating differences for {} services", services.len());
                    let refresh = join_all(services.iter().map(|s| self.query(s.clone(), None)));
                    tokio::pin!(refresh);

                    // readers keep getting the previous snapshot meanwhile
                    let fetched = loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                info!("Got cancellation request; exiting");
                                return;
                            }
                            Some(request) = requests.recv() => self.handle(request),
                            fetched = &mut refresh => break fetched,
                        }
                    };

                    let changes = self.calculate_changes(&services, fetched);
                    self.hooks.change_detected(CONSUL, changes);
                }
            }
        }
    }

    fn handle(&self, request: Request) {
        match request {
            Request::ServiceNodes { service, reply } => {
                // requester may have timed out already
                let _ = reply.send(self.state.get(&service).cloned());
            }
        }
    }

    /// Returns whether the index moved.
    fn record_index(&mut self, service: &str, index: &str) -> bool {
        match self.indexes.insert(service.to_string(), index.to_string()) {
            Some(previous) if previous == index => {
                debug!("{}: timeout; no change", service);
                false
            }
            _ => {
                debug!("{}: got index {}", service, index);
                true
            }
        }
    }

    /// Replaces the snapshot with `fetched` and diffs it per canonical service.
    fn calculate_changes(
        &mut self,
        services: &[String],
        fetched: Vec<(String, String, Vec<Node>)>,
    ) -> ChangeBatch {
        let new_state: HashMap<String, Vec<Node>> = fetched
            .into_iter()
            .map(|(service, _, nodes)| (service, nodes))
            .collect();

        // several raw services (one per data center) may feed one canonical service
        let mut grouped: BTreeMap<String, (Vec<Node>, Vec<Node>)> = BTreeMap::new();
        for service in services {
            let Some(canonical) = self.hooks.source2service(CONSUL, service) else {
                warn!("{} doesn't map to any configured service; ignoring", service);
                continue;
            };
            let (old, new) = grouped.entry(canonical).or_default();
            old.extend(self.state.get(service).into_iter().flatten().cloned());
            new.extend(new_state.get(service).into_iter().flatten().cloned());
        }

        self.state = new_state;

        grouped
            .into_iter()
            .map(|(canonical, (old, new))| (canonical, Changes::between(&old, &new)))
            .collect()
    }
}

struct Monitor {
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ConsulListener {
    catalog: Arc<dyn Catalog>,
    retry_delay: Duration,
    control: Mutex<Option<Monitor>>,
}

impl ConsulListener {
    pub fn new(catalog: Arc<dyn Catalog>, retry_delay: Duration) -> Self {
        Self {
            catalog,
            retry_delay,
            control: Mutex::new(None),
        }
    }

    /// Spawns the watch task. Returns `false` if one is already running.
    pub fn start(&self, hooks: Arc<dyn SourceHooks>) -> bool {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(ref monitor) = *control {
            if !monitor.task.is_finished() {
                warn!("listener is already running");
                return false;
            }
            warn!("listener was not running, restarting");
        }

        let (requests, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watch = Watch {
            catalog: self.catalog.clone(),
            hooks,
            retry_delay: self.retry_delay,
            state: HashMap::new(),
            indexes: HashMap::new(),
        };
        let task = tokio::spawn(watch.run(cancel.clone(), rx));

        *control = Some(Monitor {
            requests,
            cancel,
            task,
        });
        true
    }

    /// Cancels every outstanding query and waits for the watch task to end.
    pub async fn stop(&self) {
        let monitor = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(monitor) = monitor {
            monitor.cancel.cancel();
            if let Err(e) = monitor.task.await {
                error!("consul listener ended abnormally: {}", e);
            }
            info!("consul listener stopped");
        }
    }

    /// Last fetched nodes of a raw consul service (`dc/` prefix allowed).
    pub async fn service_nodes(&self, service: &str, wait: Duration) -> Result<Vec<Node>> {
        let requests = {
            let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            control.as_ref().map(|m| m.requests.clone())
        }
        .ok_or(Error::NotRunning("consul listener"))?;

        let (reply, rx) = oneshot::channel();
        let request = Request::ServiceNodes {
            service: service.to_string(),
            reply,
        };

        let answer = timeout(wait, async move {
            requests.send(request).await.ok()?;
            rx.await.ok()
        })
        .await
        .map_err(|_| Error::Timeout("consul listener"))?;

        match answer {
            None => Err(Error::NotRunning("consul listener")),
            Some(None) => Err(Error::UnknownService(service.to_string())),
            Some(Some(nodes)) => Ok(nodes),
        }
    }
}
