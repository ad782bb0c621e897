//! Client for HAProxy's runtime API over its stats socket.
//!
//! Every command uses a fresh connection: write one line, read until the
//! peer hangs up.

use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::state::{parse_servers_state, ServersState};
use crate::errors::{Error, Result};

pub struct HaproxyComm {
    socket: PathBuf,
}

impl HaproxyComm {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn has_socket(&self) -> bool {
        self.socket.exists()
    }

    pub async fn get_backends(&self) -> Result<Vec<String>> {
        let mut response = self.command("show backend").await?;
        if response.first().map(String::as_str) != Some("# name") {
            return Err(Error::Protocol(format!(
                "unexpected `show backend` header: {:?}",
                response.first()
            )));
        }
        response.remove(0);
        Ok(response)
    }

    pub async fn get_servers_state(&self, backend: &str) -> Result<ServersState> {
        let response = self
            .command(&format!("show servers state {}", backend))
            .await?;
        parse_servers_state(&response)
    }

    /// Whether `server` is in forced maintenance. Reuses `state` when given.
    pub async fn is_server_disabled(
        &self,
        backend: &str,
        server: &str,
        state: Option<&ServersState>,
    ) -> Result<bool> {
        let fetched;
        let state = match state {
            Some(state) => state,
            None => {
                fetched = self.get_servers_state(backend).await?;
                &fetched
            }
        };

        state
            .get(server)
            .map(|s| s.is_disabled())
            .ok_or_else(|| Error::Protocol(format!("{}/{} is unknown", backend, server)))
    }

    pub async fn enable_server(&self, backend: &str, server: &str) -> Result<()> {
        self.command(&format!("enable server {}/{}", backend, server))
            .await
            .map(drop)
    }

    pub async fn disable_server(&self, backend: &str, server: &str) -> Result<()> {
        self.command(&format!("disable server {}/{}", backend, server))
            .await
            .map(drop)
    }

    /// Streams the state of every backend's servers into `file`.
    pub async fn save_state(&self, file: &Path) -> Result<()> {
        let mut stream = self.send("show servers state").await?;
        let mut out = File::create(file).await?;
        tokio::io::copy(&mut stream, &mut out).await?;
        out.flush().await?;
        Ok(())
    }

    async fn send(&self, command: &str) -> Result<UnixStream> {
        debug!("haproxy <- {}", command);
        let mut stream = UnixStream::connect(&self.socket).await?;
        stream.write_all(format!("{}\n", command).as_bytes()).await?;
        Ok(stream)
    }

    async fn command(&self, command: &str) -> Result<Vec<String>> {
        let mut stream = self.send(command).await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;

        let text = String::from_utf8_lossy(&buf);
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        Ok(lines)
    }
}
