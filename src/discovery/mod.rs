use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::types::{ChangeBatch, Node};

pub mod consul;
pub mod listener;
pub use listener::ConsulListener;

/// Discovery method name of the consul source.
pub const CONSUL: &str = "consul";

/// Default bound on a cross-context read of the watcher's state.
pub const SERVICE_NODES_TIMEOUT: Duration = Duration::from_secs(5);

pub trait ServicesNeeded: Send + Sync {
    /// Raw registry service names (possibly `dc/` prefixed) a source must watch.
    fn services_needed(&self, source: &str) -> Vec<String>;
}

pub trait ChangeDetected: Send + Sync {
    /// Hands a batch to the reconciliation side. Must not block.
    fn change_detected(&self, source: &str, changes: ChangeBatch);
}

pub trait ServiceResolver: Send + Sync {
    /// Canonical service to its discovery method and raw service names.
    fn service2sources(
        &self,
        canonical: &str,
        data_centers: Option<&[String]>,
    ) -> Result<(String, Vec<String>)>;

    /// Raw service name reported by `source` back to its canonical name.
    fn source2service(&self, source: &str, service: &str) -> Option<String>;
}

/// Everything a source needs from the rest of the daemon.
pub trait SourceHooks: ServicesNeeded + ChangeDetected + ServiceResolver {}

impl<T: ServicesNeeded + ChangeDetected + ServiceResolver> SourceHooks for T {}

#[async_trait]
pub trait ServiceNodes: Send + Sync {
    /// Current healthy nodes of a canonical service.
    async fn service_nodes(
        &self,
        canonical: &str,
        data_centers: Option<&[String]>,
    ) -> Result<Vec<Node>>;
}

/// Routes node lookups to whichever source backs a canonical service.
pub struct Sources {
    resolver: Arc<dyn ServiceResolver>,
    consul: Arc<ConsulListener>,
    timeout: Duration,
}

impl Sources {
    pub fn new(resolver: Arc<dyn ServiceResolver>, consul: Arc<ConsulListener>) -> Self {
        Self {
            resolver,
            consul,
            timeout: SERVICE_NODES_TIMEOUT,
        }
    }
}

#[async_trait]
impl ServiceNodes for Sources {
    async fn service_nodes(
        &self,
        canonical: &str,
        data_centers: Option<&[String]>,
    ) -> Result<Vec<Node>> {
        let (source, services) = self.resolver.service2sources(canonical, data_centers)?;
        if source != CONSUL {
            return Err(Error::Config(format!(
                "{}: discovery method {:?} is not supported",
                canonical, source
            )));
        }

        let mut nodes = Vec::new();
        for service in services {
            nodes.extend(self.consul.service_nodes(&service, self.timeout).await?);
        }
        Ok(nodes)
    }
}
