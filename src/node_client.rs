//! Worker node client
//!
//! ## Overview
//! - One client per worker node, owning the mTLS REST session
//! - Engine lifecycle calls: connect, ping, start, stop, restart
//! - Lazily-opened stats channel on the node's stats port
//! - Background log pump over a WebSocket with per-subscriber buffers
//!
//! All lifecycle calls are serialized by an internal mutex; the registry
//! additionally prevents overlapping connect attempts per node.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::engine_config::EngineConfig;
use crate::error::{PanelError, Result};

const LOG_BUFFER_LINES: usize = 100;

/// Response from `POST /connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: String,
    pub engine_version: Option<String>,
    #[serde(default)]
    pub started: bool,
    #[serde(flatten)]
    pub extra: Value,
}

/// Response from `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoResponse {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub started: bool,
    pub engine_version: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

/// One user's traffic counters as reported by the forwarding engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTrafficStat {
    pub name: String,
    #[serde(default)]
    pub uplink: i64,
    #[serde(default)]
    pub downlink: i64,
}

/// Engine process statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub uptime_s: u64,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    started: bool,
    engine_version: Option<String>,
}

/// Builder for [`NodeClient`]
#[derive(Debug, Clone, Default)]
pub struct NodeClientBuilder {
    node_id: i64,
    name: String,
    address: String,
    rpc_port: u16,
    stats_port: u16,
    usage_coefficient: f64,
    base_url: Option<String>,
    stats_url: Option<String>,
    client_cert_pem: Option<String>,
    client_key_pem: Option<String>,
    ca_pem: Option<String>,
    timeout: Option<Duration>,
    insecure: bool,
}

impl NodeClientBuilder {
    pub fn new() -> Self {
        Self {
            usage_coefficient: 1.0,
            ..Self::default()
        }
    }

    pub fn node_id(mut self, id: i64) -> Self {
        self.node_id = id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn stats_port(mut self, port: u16) -> Self {
        self.stats_port = port;
        self
    }

    pub fn usage_coefficient(mut self, coefficient: f64) -> Self {
        self.usage_coefficient = coefficient;
        self
    }

    /// Override the REST base URL (tests drive this against a mock server)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Override the stats base URL
    pub fn stats_url(mut self, url: impl Into<String>) -> Self {
        self.stats_url = Some(url.into());
        self
    }

    /// Panel client certificate and key presented to the node
    pub fn client_identity(
        mut self,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        self.client_cert_pem = Some(cert_pem.into());
        self.client_key_pem = Some(key_pem.into());
        self
    }

    /// CA bundle used to verify the node's server certificate
    pub fn ca_certificate(mut self, ca_pem: impl Into<String>) -> Self {
        self.ca_pem = Some(ca_pem.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skip server certificate verification (tests only)
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn build(self) -> Result<NodeClient> {
        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}:{}", self.address, self.rpc_port));
        let stats_url = self
            .stats_url
            .clone()
            .unwrap_or_else(|| format!("https://{}:{}", self.address, self.stats_port));

        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.insecure);

        if let Some(ca_pem) = &self.ca_pem {
            let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes())
                .map_err(|e| PanelError::Certificate(format!("invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        if let (Some(cert), Some(key)) = (&self.client_cert_pem, &self.client_key_pem) {
            let mut identity_pem = Vec::new();
            identity_pem.extend_from_slice(key.as_bytes());
            identity_pem.extend_from_slice(b"\n");
            identity_pem.extend_from_slice(cert.as_bytes());
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| PanelError::Certificate(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| PanelError::Internal(format!("HTTP client build failed: {}", e)))?;

        let ws_tls = match (&self.ca_pem, &self.client_cert_pem, &self.client_key_pem) {
            (Some(ca), Some(cert), Some(key)) => Some(Arc::new(build_ws_tls(ca, cert, key)?)),
            _ => None,
        };

        Ok(NodeClient {
            node_id: self.node_id,
            name: self.name,
            usage_coefficient: self.usage_coefficient,
            base_url,
            stats_url,
            http,
            timeout,
            state: Mutex::new(SessionState::default()),
            log_tx: broadcast::Sender::new(LOG_BUFFER_LINES),
            ws_tls,
        })
    }
}

/// mTLS client configuration for the log WebSocket, built from in-memory
/// PEMs so no key material touches the filesystem.
fn build_ws_tls(ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        let cert = cert.map_err(|e| PanelError::Certificate(format!("invalid CA PEM: {}", e)))?;
        roots
            .add(cert)
            .map_err(|e| PanelError::Certificate(format!("CA rejected: {}", e)))?;
    }
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PanelError::Certificate(format!("invalid client cert PEM: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| PanelError::Certificate(format!("invalid client key PEM: {}", e)))?
        .ok_or_else(|| PanelError::Certificate("no private key in PEM".to_string()))?;
    // Pin the provider: more than one rustls backend is linked in, so the
    // implicit process default is not reliable here.
    rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| PanelError::Certificate(format!("TLS protocol setup failed: {}", e)))?
    .with_root_certificates(roots)
    .with_client_auth_cert(certs, key)
    .map_err(|e| PanelError::Certificate(format!("TLS config build failed: {}", e)))
}

/// Client for one worker node
pub struct NodeClient {
    node_id: i64,
    name: String,
    usage_coefficient: f64,
    base_url: String,
    stats_url: String,
    http: Client,
    timeout: Duration,
    state: Mutex<SessionState>,
    log_tx: broadcast::Sender<String>,
    ws_tls: Option<Arc<rustls::ClientConfig>>,
}

impl NodeClient {
    pub fn builder() -> NodeClientBuilder {
        NodeClientBuilder::new()
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage_coefficient(&self) -> f64 {
        self.usage_coefficient
    }

    /// Whether a REST session is currently claimed
    pub async fn connected(&self) -> bool {
        self.state.lock().await.session_id.is_some()
    }

    pub async fn engine_version(&self) -> Option<String> {
        self.state.lock().await.engine_version.clone()
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| PanelError::Serialization(e.to_string()))
        } else {
            let detail = match response.json::<ErrorBody>().await {
                Ok(body) => body.detail,
                Err(_) => format!("HTTP {}", status),
            };
            Err(PanelError::NodeUnavailable {
                status_code: status.as_u16(),
                detail,
            })
        }
    }

    fn map_request_error(&self, err: reqwest::Error, url: &str) -> PanelError {
        let detail = if err.is_connect() {
            format!("connection to {} refused or unreachable", url)
        } else if err.is_timeout() {
            format!("request to {} timed out after {:?}", url, self.timeout)
        } else {
            err.to_string()
        };
        PanelError::NodeUnavailable {
            status_code: err.status().map(|s| s.as_u16()).unwrap_or(0),
            detail,
        }
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = self.url(path);
        debug!(node = %self.name, "POST {}", url);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_request_error(e, &url))?;
        self.handle_response(response).await
    }

    /// Claim a fresh session on the node. Any prior session is invalidated
    /// by the node on success.
    pub async fn connect(&self) -> Result<ConnectResponse> {
        let mut state = self.state.lock().await;
        let body = serde_json::json!({ "session_id": state.session_id });
        let response: ConnectResponse = self.post("/connect", body, Duration::from_secs(10)).await?;
        state.session_id = Some(response.session_id.clone());
        state.started = response.started;
        state.engine_version = response.engine_version.clone();
        info!(node = %self.name, version = ?response.engine_version, "node session established");
        Ok(response)
    }

    /// Release the session. Local state is cleared even when the node is
    /// unreachable.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(session_id) = state.session_id.take() {
            let body = serde_json::json!({ "session_id": session_id });
            if let Err(err) = self
                .post::<Value>("/disconnect", body, Duration::from_secs(5))
                .await
            {
                warn!(node = %self.name, error = %err, "disconnect failed, dropping session anyway");
            }
        }
        state.started = false;
    }

    /// Liveness probe. A failed ping drops the local session so the next
    /// lifecycle call reconnects.
    pub async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(session_id) = state.session_id.clone() else {
            return Err(PanelError::node_unavailable("no session"));
        };
        let body = serde_json::json!({ "session_id": session_id });
        match self.post::<Value>("/ping", body, Duration::from_secs(3)).await {
            Ok(_) => Ok(()),
            Err(err) => {
                state.session_id = None;
                state.started = false;
                Err(err)
            }
        }
    }

    /// Node status snapshot
    pub async fn info(&self) -> Result<NodeInfoResponse> {
        let session_id = self.state.lock().await.session_id.clone();
        let url = self.url("/");
        let mut request = self.http.get(&url).timeout(Duration::from_secs(3));
        if let Some(session_id) = session_id {
            request = request.query(&[("session_id", session_id)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.map_request_error(e, &url))?;
        self.handle_response(response).await
    }

    async fn ensure_session(&self) -> Result<String> {
        {
            let state = self.state.lock().await;
            if let Some(session_id) = &state.session_id {
                return Ok(session_id.clone());
            }
        }
        self.connect().await.map(|r| r.session_id)
    }

    /// Push a config and start the engine. A node already running treats
    /// this as a restart with the same payload.
    pub async fn start(&self, config: &EngineConfig) -> Result<()> {
        let session_id = self.ensure_session().await?;
        let config_json = config.to_json()?;
        let body = serde_json::json!({ "session_id": &session_id, "config": &config_json });
        match self.post::<Value>("/start", body, self.timeout).await {
            Ok(_) => {}
            Err(PanelError::NodeUnavailable { detail, .. })
                if detail.to_lowercase().contains("already") =>
            {
                debug!(node = %self.name, "engine already running, restarting instead");
                let body =
                    serde_json::json!({ "session_id": &session_id, "config": &config_json });
                self.post::<Value>("/restart", body, self.timeout).await?;
            }
            Err(err) => return Err(err),
        }
        self.state.lock().await.started = true;
        info!(node = %self.name, "engine started");
        Ok(())
    }

    /// Restart the engine with a new config
    pub async fn restart(&self, config: &EngineConfig) -> Result<()> {
        let session_id = self.ensure_session().await?;
        let config_json = config.to_json()?;
        let body = serde_json::json!({ "session_id": session_id, "config": config_json });
        self.post::<Value>("/restart", body, self.timeout).await?;
        self.state.lock().await.started = true;
        info!(node = %self.name, "engine restarted");
        Ok(())
    }

    /// Stop the engine; local started flag clears regardless of outcome
    pub async fn stop(&self) -> Result<()> {
        let session_id = self.ensure_session().await?;
        let body = serde_json::json!({ "session_id": session_id });
        let result = self.post::<Value>("/stop", body, Duration::from_secs(5)).await;
        self.state.lock().await.started = false;
        result.map(|_| ())
    }

    /// Fetch (and optionally reset) per-user traffic counters from the
    /// node's stats endpoint.
    pub async fn get_all_users_traffic(&self, reset: bool) -> Result<Vec<UserTrafficStat>> {
        let url = format!("{}/stats/users", self.stats_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "reset": reset }))
            .send()
            .await
            .map_err(|e| self.map_request_error(e, &url))?;
        self.handle_response(response).await
    }

    /// Engine process stats, used as a cheap health probe
    pub async fn get_system_stats(&self) -> Result<SystemStats> {
        let url = format!("{}/stats/system", self.stats_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| self.map_request_error(e, &url))?;
        self.handle_response(response).await
    }

    /// Subscribe to the node's log stream. The pump task starts with the
    /// first subscriber and exits when the last receiver is dropped; slow
    /// subscribers lose oldest lines first.
    pub async fn subscribe_logs(self: &Arc<Self>, interval: f32) -> Result<broadcast::Receiver<String>> {
        let receiver = self.log_tx.subscribe();
        if self.log_tx.receiver_count() == 1 {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                client.run_log_pump(interval).await;
            });
        }
        Ok(receiver)
    }

    async fn run_log_pump(self: Arc<Self>, interval: f32) {
        loop {
            if self.log_tx.receiver_count() == 0 {
                debug!(node = %self.name, "no log subscribers left, stopping pump");
                return;
            }
            let Some(session_id) = self.state.lock().await.session_id.clone() else {
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            };

            let ws_base = self
                .base_url
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1);
            let ws_url = format!(
                "{}/logs?session_id={}&interval={}",
                ws_base.trim_end_matches('/'),
                session_id,
                interval
            );

            let connector = self
                .ws_tls
                .as_ref()
                .map(|config| tokio_tungstenite::Connector::Rustls(Arc::clone(config)));
            match tokio_tungstenite::connect_async_tls_with_config(&ws_url, None, false, connector)
                .await
            {
                Ok((mut ws, _)) => {
                    debug!(node = %self.name, "log stream connected");
                    while let Some(message) = ws.next().await {
                        if self.log_tx.receiver_count() == 0 {
                            return;
                        }
                        match message {
                            Ok(tokio_tungstenite::tungstenite::Message::Text(line)) => {
                                let _ = self.log_tx.send(line.to_string());
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(node = %self.name, error = %err, "log stream read failed");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(node = %self.name, error = %err, "log stream connect failed");
                }
            }

            if self.log_tx.receiver_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    }
}
