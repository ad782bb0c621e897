//! Minimal client for Consul's blocking health endpoint.

use async_trait::async_trait;
use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ConsulConfig;
use crate::errors::{Error, Result};

const INDEX_HEADER: &str = "x-consul-index";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    Default,
    Consistent,
    Stale,
}

/// Splits `"dc/service"` into its data center and service name.
///
/// A leading slash with nothing before it means "local data center".
pub fn data_center(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        None => (None, name),
        Some(("", service)) => (None, service),
        Some((dc, service)) => (Some(dc), service),
    }
}

/// Parameters of a single `/v1/health/service` request.
#[derive(Debug, Clone, Default)]
pub struct HealthQuery {
    /// Service name, optionally prefixed with `dc/`.
    pub service: String,
    /// Last seen index; when set the request blocks until it moves.
    pub index: Option<String>,
    /// How long the agent may hold a blocking request, e.g. `"5m"`.
    pub wait: Option<String>,
    pub passing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthEntry {
    pub node: CatalogNode,
    pub service: CatalogService,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogNode {
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct HealthResponse {
    pub index: String,
    pub entries: Vec<HealthEntry>,
}

/// The registry as seen by the watcher.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn health(&self, query: &HealthQuery) -> Result<HealthResponse>;
}

pub struct Consul {
    client: Client,
    base_url: String,
    consistency: Consistency,
}

impl Consul {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.limit)
            .build()
            .map_err(|e| Error::Unhandled(e.to_string()))?;

        Ok(Self {
            client,
            base_url: format!("{}://{}:{}", config.scheme, config.host, config.port),
            consistency: config.consistency,
        })
    }

    fn params(&self, query: &HealthQuery) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();

        if let (Some(dc), _) = data_center(&query.service) {
            params.push(("dc", dc.to_string()));
        }

        match self.consistency {
            Consistency::Default => {}
            Consistency::Consistent => params.push(("consistent", "true".into())),
            Consistency::Stale => params.push(("stale", "true".into())),
        }

        // wait only makes sense for a blocking query
        if let Some(ref index) = query.index {
            params.push(("index", index.clone()));
            if let Some(ref wait) = query.wait {
                params.push(("wait", wait.clone()));
            }
        }

        if query.passing {
            params.push(("passing", "true".into()));
        }

        params
    }

    fn url(&self, service: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| Error::Unhandled(format!("invalid consul address: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Unhandled("consul address can't be a base".into()))?
            .pop_if_empty()
            .extend(["v1", "health", "service", service]);
        Ok(url)
    }
}

#[async_trait]
impl Catalog for Consul {
    async fn health(&self, query: &HealthQuery) -> Result<HealthResponse> {
        let (_, service) = data_center(&query.service);
        let url = self.url(service)?;
        let params = self.params(query);
        debug!("GET {} {:?}", url, params);

        let resp = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() || !is_json {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::HttpResponse {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }

        let index = index.ok_or_else(|| Error::HttpResponse {
            status: status.as_u16(),
            reason: "missing X-Consul-Index header".into(),
            body: String::new(),
        })?;

        let bytes = resp.bytes().await.map_err(classify)?;
        let entries: Vec<HealthEntry> =
            serde_json::from_slice(&bytes).map_err(|e| Error::HttpResponse {
                status: status.as_u16(),
                reason: format!("invalid JSON: {}", e),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })?;

        Ok(HealthResponse { index, entries })
    }
}

fn classify(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
        Error::Connection(e)
    } else {
        Error::Unhandled(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consul(consistency: Consistency) -> Consul {
        Consul::new(&ConsulConfig {
            consistency,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_data_center() {
        assert_eq!(data_center("test service"), (None, "test service"));
        assert_eq!(data_center("/test service"), (None, "test service"));
        assert_eq!(data_center("data center/test service"), (Some("data center"), "test service"));
    }

    #[test]
    fn test_params_for_blocking_query() {
        let consul = consul(Consistency::Stale);
        let params = consul.params(&HealthQuery {
            service: "dc1/web".into(),
            index: Some("42".into()),
            wait: Some("5m".into()),
            passing: true,
        });
        assert_eq!(
            params,
            vec![
                ("dc", "dc1".to_string()),
                ("stale", "true".to_string()),
                ("index", "42".to_string()),
                ("wait", "5m".to_string()),
                ("passing", "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_params_without_index_drop_wait() {
        let consul = consul(Consistency::Consistent);
        let params = consul.params(&HealthQuery {
            service: "web".into(),
            index: None,
            wait: Some("5m".into()),
            passing: false,
        });
        assert_eq!(params, vec![("consistent", "true".to_string())]);
    }

    #[test]
    fn test_url_escapes_service() {
        let consul = consul(Consistency::Default);
        let url = consul.url("my service").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/health/service/my%20service");
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_a_connection_error() {
        let consul = Consul::new(&ConsulConfig {
            // nothing listens on the discard port
            port: 9,
            ..Default::default()
        })
        .unwrap();
        let err = consul
            .health(&HealthQuery {
                service: "web".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_registry_failure(), "{:?}", err);
        // the transport's causes are only visible through the source chain
        assert!(err.chain().len() > err.to_string().len(), "{}", err.chain());
    }

    #[test]
    fn test_health_entries_decode() {
        let body = r#"[{"Node": {"Node": "web-01.dc1", "Address": "10.0.0.1"},
                        "Service": {"Address": "", "Port": 8080, "Tags": ["weight=5", "canary"]},
                        "Checks": []}]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries[0].node.node, "web-01.dc1");
        assert_eq!(entries[0].service.port, 8080);
        assert_eq!(entries[0].service.tags.as_ref().unwrap().len(), 2);
    }
}
