//! In-process stand-ins for consul and the load balancer's control socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::discovery::consul::{data_center, Catalog, HealthEntry, HealthQuery, HealthResponse};
use crate::discovery::{ChangeDetected, ServiceNodes, ServiceResolver, ServicesNeeded, CONSUL};
use crate::errors::{Error, Result};
use crate::types::{ChangeBatch, Node};

/// Consul agent answering from a settable table.
///
/// Unindexed queries answer right away (after an optional delay).
/// Blocking queries wait until [`FakeCatalog::bump`] moves the index or
/// [`FakeCatalog::expire`] lets them time out with the same index.
pub struct FakeCatalog {
    index: Mutex<String>,
    /// bumped by `expire`
    generation: AtomicUsize,
    wake: Notify,
    delay: Mutex<Duration>,
    services: Mutex<HashMap<String, Vec<HealthEntry>>>,
    failures: AtomicUsize,
    blocking: Mutex<Vec<String>>,
}

impl FakeCatalog {
    pub fn new(index: &str) -> Self {
        Self {
            index: Mutex::new(index.to_string()),
            generation: AtomicUsize::new(0),
            wake: Notify::new(),
            delay: Mutex::new(Duration::ZERO),
            services: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
            blocking: Mutex::new(Vec::new()),
        }
    }

    /// `(node name, address, port, space separated tags)`
    pub fn set(&self, service: &str, nodes: &[(&str, &str, u16, &str)]) {
        let entries = nodes
            .iter()
            .map(|(node, address, port, tags)| {
                let tags: Vec<&str> = tags.split_whitespace().collect();
                serde_json::from_value(serde_json::json!({
                    "Node": {"Node": node, "Address": address},
                    "Service": {"Address": address, "Port": port, "Tags": tags},
                }))
                .unwrap()
            })
            .collect();
        self.services
            .lock()
            .unwrap()
            .insert(service.to_string(), entries);
    }

    /// Moves the index, releasing every blocking query.
    pub fn bump(&self, index: &str) {
        *self.index.lock().unwrap() = index.to_string();
        self.wake.notify_waiters();
    }

    /// Releases every blocking query with an unchanged index.
    pub fn expire(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Slows down every later unindexed query.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn blocking_queries(&self) -> Vec<String> {
        let mut queries = self.blocking.lock().unwrap().clone();
        queries.sort();
        queries.dedup();
        queries
    }

    /// Number of blocking queries issued so far.
    pub fn blocking_count(&self) -> usize {
        self.blocking.lock().unwrap().len()
    }

    fn current_index(&self) -> String {
        self.index.lock().unwrap().clone()
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn health(&self, query: &HealthQuery) -> Result<HealthResponse> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::HttpResponse {
                status: 500,
                reason: "Internal Server Error".into(),
                body: "rpc error".into(),
            });
        }

        match query.index {
            Some(ref index) => {
                let generation = self.generation.load(Ordering::SeqCst);
                self.blocking.lock().unwrap().push(query.service.clone());
                loop {
                    let notified = self.wake.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.current_index() != *index
                        || self.generation.load(Ordering::SeqCst) != generation
                    {
                        break;
                    }
                    notified.await;
                }
            }
            None => {
                let delay = *self.delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let entries = self
            .services
            .lock()
            .unwrap()
            .get(&query.service)
            .cloned()
            .unwrap_or_default();
        Ok(HealthResponse {
            index: self.current_index(),
            entries,
        })
    }
}

pub struct FakeHooks {
    services: Vec<String>,
    canonical: HashMap<String, String>,
    batches: mpsc::UnboundedSender<ChangeBatch>,
}

impl FakeHooks {
    /// `canonical` maps bare consul service names to canonical names.
    pub fn new(
        services: &[&str],
        canonical: &[(&str, &str)],
    ) -> (Self, mpsc::UnboundedReceiver<ChangeBatch>) {
        let (batches, rx) = mpsc::unbounded_channel();
        let hooks = Self {
            services: services.iter().map(|s| s.to_string()).collect(),
            canonical: canonical
                .iter()
                .map(|(raw, name)| (raw.to_string(), name.to_string()))
                .collect(),
            batches,
        };
        (hooks, rx)
    }
}

impl ServicesNeeded for FakeHooks {
    fn services_needed(&self, source: &str) -> Vec<String> {
        if source == CONSUL {
            self.services.clone()
        } else {
            Vec::new()
        }
    }
}

impl ChangeDetected for FakeHooks {
    fn change_detected(&self, _source: &str, changes: ChangeBatch) {
        let _ = self.batches.send(changes);
    }
}

impl ServiceResolver for FakeHooks {
    fn service2sources(
        &self,
        canonical: &str,
        _data_centers: Option<&[String]>,
    ) -> Result<(String, Vec<String>)> {
        let raw = self
            .canonical
            .iter()
            .filter(|(_, name)| name.as_str() == canonical)
            .map(|(raw, _)| raw.clone())
            .collect();
        Ok((CONSUL.to_string(), raw))
    }

    fn source2service(&self, _source: &str, service: &str) -> Option<String> {
        self.canonical.get(data_center(service).1).cloned()
    }
}

/// Node lists per canonical service, settable between calls.
#[derive(Default)]
pub struct StaticNodes {
    nodes: Mutex<HashMap<String, Vec<Node>>>,
}

impl StaticNodes {
    pub fn set(&self, service: &str, nodes: Vec<Node>) {
        self.nodes.lock().unwrap().insert(service.to_string(), nodes);
    }
}

#[async_trait]
impl ServiceNodes for StaticNodes {
    async fn service_nodes(
        &self,
        canonical: &str,
        _data_centers: Option<&[String]>,
    ) -> Result<Vec<Node>> {
        self.nodes
            .lock()
            .unwrap()
            .get(canonical)
            .cloned()
            .ok_or_else(|| Error::UnknownService(canonical.to_string()))
    }
}

/// Control socket that answers canned responses and records commands.
pub struct FakeHaproxy {
    pub socket: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<HashMap<String, String>>>,
    task: JoinHandle<()>,
}

impl FakeHaproxy {
    pub fn spawn(socket: &Path) -> Self {
        let listener = UnixListener::bind(socket).unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let responses: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));

        let task = {
            let commands = commands.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (read, mut write) = stream.into_split();
                    let mut line = String::new();
                    if BufReader::new(read).read_line(&mut line).await.is_err() {
                        continue;
                    }
                    let command = line.trim_end().to_string();
                    let response = responses
                        .lock()
                        .unwrap()
                        .get(&command)
                        .cloned()
                        .unwrap_or_else(|| "\n".to_string());
                    commands.lock().unwrap().push(command);
                    let _ = write.write_all(response.as_bytes()).await;
                    let _ = write.shutdown().await;
                }
            })
        };

        Self {
            socket: socket.to_path_buf(),
            commands,
            responses,
            task,
        }
    }

    pub fn respond(&self, command: &str, response: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), response.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands that change server state.
    pub fn mutations(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with("enable ") || c.starts_with("disable "))
            .collect()
    }
}

impl Drop for FakeHaproxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub const STATE_HEADER: &str = "# be_id be_name srv_id srv_name srv_addr srv_op_state \
    srv_admin_state srv_uweight srv_iweight srv_time_since_last_change srv_check_status \
    srv_check_result srv_check_health srv_check_state srv_agent_state bk_f_forced_id \
    srv_f_forced_id";

/// `show servers state` output for one backend; `(server, address, admin state)`.
pub fn servers_state(backend: &str, servers: &[(&str, &str, u32)]) -> String {
    let mut out = format!("1\n{}\n", STATE_HEADER);
    for (i, (name, address, admin)) in servers.iter().enumerate() {
        out.push_str(&format!(
            "3 {} {} {} {} 2 {} 10 10 120 6 3 4 6 0 0 0\n",
            backend,
            i + 1,
            name,
            address,
            admin
        ));
    }
    out.push('\n');
    out
}

pub fn backends(names: &[&str]) -> String {
    let mut out = String::from("# name\n");
    for name in names {
        out.push_str(name);
        out.push('\n');
    }
    out.push('\n');
    out
}
