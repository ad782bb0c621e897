//! Error types shared by every subsystem of the daemon.

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Consul could not be reached (refused, reset, timed out).
    #[error("unable to connect to consul: {0}")]
    Connection(#[source] reqwest::Error),

    /// Consul answered, but not with a 200 JSON document.
    #[error("{status} {reason}, message={body:?}")]
    HttpResponse {
        status: u16,
        reason: String,
        body: String,
    },

    /// Anything the consul client did not anticipate.
    #[error("unexpected error when talking to consul: {0}")]
    Unhandled(String),

    /// Malformed static configuration or service list.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Figment(#[from] figment::Error),

    /// Generated load balancer config failed external validation.
    #[error("config update failed: {0}")]
    Update(String),

    /// The control socket returned something we can't interpret.
    #[error("unexpected response from control socket: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The watcher has not fetched this service yet.
    #[error("no nodes known for service {0}")]
    UnknownService(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),
}

impl Error {
    /// Errors the watcher expects from a flaky registry and simply retries.
    pub fn is_registry_failure(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::HttpResponse { .. })
    }

    /// The message followed by every underlying cause, `: ` separated.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str(": ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}
