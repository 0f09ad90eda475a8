//! Transport factory and client connector.
//!
//! Turns a `ServerConfig` into a live `ConnectedClient`: opens the transport
//! (child process, SSE, or streamable HTTP), performs the MCP handshake, and
//! captures stdio stderr into the log store. Connects are retried with a
//! fixed delay; every attempt builds a fresh transport and client, since a
//! transport that failed mid-handshake is not safe to reuse.

use std::{collections::HashMap, path::Path, process::Stdio, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rmcp::{
    model::ClientInfo,
    service::{NotificationContext, Peer, RunningService},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    ClientHandler, RoleClient, ServiceExt,
};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{OauthTokens, PoolSettings, ServerConfig, ServerTransport, StderrMode};
use crate::{
    error::{PoolError, PoolResult},
    logstore::{LogLevel, LogStore},
};

type PoolClient = RunningService<RoleClient, PoolClientHandler>;

/// Environment variables a stdio child inherits from this process.
#[cfg(unix)]
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

#[cfg(windows)]
const INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Client-side handler attached to every pooled connection. Forwards server
/// log notifications into tracing and the log store.
#[derive(Clone)]
pub struct PoolClientHandler {
    server_name: Arc<str>,
    logs: Arc<LogStore>,
    client_info: ClientInfo,
}

impl PoolClientHandler {
    fn new(server_name: &str, logs: Arc<LogStore>) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "metamcp-pool".to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            server_name: Arc::from(server_name),
            logs,
            client_info,
        }
    }
}

impl ClientHandler for PoolClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_logging_message(
        &self,
        params: rmcp::model::LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        use rmcp::model::LoggingLevel;

        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                self.logs.add(
                    &self.server_name,
                    LogLevel::Error,
                    params.data.to_string(),
                );
                tracing::error!(server = %self.server_name, "MCP: {}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(server = %self.server_name, "MCP: {}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(server = %self.server_name, "MCP: {}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(server = %self.server_name, "MCP: {}", params.data);
            }
        }
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server = %self.server_name, "MCP server tool list changed");
    }
}

/// A live MCP client bound to one transport.
///
/// Requests go through the cloned [`Peer`]; the running service itself is
/// held until [`cleanup`](Self::cleanup) takes it. Cleanup closes the client
/// and its transport exactly once and is a no-op afterwards.
pub struct ConnectedClient {
    pub server_uuid: String,
    pub server_name: String,
    pub fingerprint: String,
    /// Name the remote reported during the handshake, if any.
    pub remote_name: Option<String>,
    supports_tools: bool,
    peer: Peer<RoleClient>,
    service: Mutex<Option<PoolClient>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectedClient {
    pub fn peer(&self) -> &Peer<RoleClient> {
        &self.peer
    }

    /// Whether the remote declared the `tools` capability. Unknown counts as
    /// capable.
    pub fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    pub fn is_closed(&self) -> bool {
        self.service.lock().is_none()
    }

    /// Close the client and its transport. Idempotent.
    pub async fn cleanup(&self) {
        let service = self.service.lock().take();
        if let Some(task) = self.stderr_task.lock().take() {
            task.abort();
        }
        let Some(service) = service else {
            return;
        };

        if let Err(e) = service.cancel().await {
            warn!(server = %self.server_name, error = %e, "error closing MCP client");
        }
    }
}

impl std::fmt::Debug for ConnectedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedClient")
            .field("server_uuid", &self.server_uuid)
            .field("server_name", &self.server_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds `ConnectedClient`s from configs.
pub struct Connector {
    settings: Arc<PoolSettings>,
    logs: Arc<LogStore>,
}

impl Connector {
    pub fn new(settings: Arc<PoolSettings>, logs: Arc<LogStore>) -> Self {
        Self { settings, logs }
    }

    /// Connect with retries. Each failed attempt is logged; exhaustion is
    /// recorded in the log store with server context.
    pub async fn connect(
        &self,
        config: &ServerConfig,
        cancel: &CancellationToken,
    ) -> PoolResult<ConnectedClient> {
        self.validate(config)?;

        let attempts = self.settings.connect_retries.max(1);
        let mut last_error: Option<PoolError> = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled(config.name.clone()));
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(PoolError::Cancelled(config.name.clone())),
                res = self.connect_once(config) => res,
            };

            match result {
                Ok(client) => {
                    info!(
                        server = %config.name,
                        uuid = %config.uuid,
                        attempt,
                        "connected to MCP server"
                    );
                    return Ok(client);
                }
                Err(e @ PoolError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        server = %config.name,
                        attempt,
                        error = %e,
                        "MCP connect attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(PoolError::Cancelled(config.name.clone()));
                            }
                            _ = tokio::time::sleep(self.settings.connect_retry_delay()) => {}
                        }
                    }
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        self.logs.add_with_error(
            &config.name,
            LogLevel::Error,
            format!("failed to connect after {attempts} attempt(s)"),
            Some(&message),
        );
        Err(PoolError::ConnectFailed {
            server: config.name.clone(),
            attempts,
            message,
        })
    }

    fn validate(&self, config: &ServerConfig) -> PoolResult<()> {
        match &config.transport {
            ServerTransport::Stdio { command, .. } if command.trim().is_empty() => {
                Err(PoolError::InvalidConfig {
                    server: config.name.clone(),
                    message: "stdio command is empty".to_string(),
                })
            }
            ServerTransport::Sse { url, .. } | ServerTransport::StreamableHttp { url, .. }
                if url.trim().is_empty() =>
            {
                Err(PoolError::InvalidConfig {
                    server: config.name.clone(),
                    message: "url is empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// One attempt: fresh transport, fresh client.
    async fn connect_once(&self, config: &ServerConfig) -> PoolResult<ConnectedClient> {
        let handler = PoolClientHandler::new(&config.name, Arc::clone(&self.logs));

        let (service, stderr_task) = match &config.transport {
            ServerTransport::Stdio {
                command,
                args,
                env,
                cwd,
                stderr_mode,
            } => {
                self.connect_stdio(config, handler, command, args, env, cwd.as_deref(), *stderr_mode)
                    .await?
            }
            ServerTransport::Sse {
                url,
                bearer_token,
                oauth_tokens,
            } => {
                let service = self
                    .connect_sse(config, handler, url, auth_token(bearer_token, oauth_tokens))
                    .await?;
                (service, None)
            }
            ServerTransport::StreamableHttp {
                url,
                bearer_token,
                oauth_tokens,
            } => {
                let service = self
                    .connect_streamable(config, handler, url, auth_token(bearer_token, oauth_tokens))
                    .await?;
                (service, None)
            }
        };

        let peer = service.peer().clone();
        let peer_info = peer.peer_info();
        let remote_name = peer_info.as_ref().map(|i| i.server_info.name.clone());
        let supports_tools = peer_info
            .as_ref()
            .map(|i| i.capabilities.tools.is_some())
            .unwrap_or(true);

        Ok(ConnectedClient {
            server_uuid: config.uuid.clone(),
            server_name: config.name.clone(),
            fingerprint: config.fingerprint(),
            remote_name,
            supports_tools,
            peer,
            service: Mutex::new(Some(service)),
            stderr_task: Mutex::new(stderr_task),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn connect_stdio(
        &self,
        config: &ServerConfig,
        handler: PoolClientHandler,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        stderr_mode: StderrMode,
    ) -> PoolResult<(PoolClient, Option<tokio::task::JoinHandle<()>>)> {
        let merged_env = sanitized_env(env);
        let workdir = cwd.map(str::to_string).or_else(|| detect_cwd(args));

        let cmd = tokio::process::Command::new(command).configure(|cmd| {
            cmd.args(args).env_clear().envs(merged_env.iter());
            if let Some(dir) = &workdir {
                cmd.current_dir(dir);
            }
        });

        let stdio = match stderr_mode {
            StderrMode::Pipe => Stdio::piped(),
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Ignore => Stdio::null(),
        };

        let (transport, stderr) = TokioChildProcess::builder(cmd)
            .stderr(stdio)
            .spawn()
            .map_err(|e| PoolError::TransportOpen {
                server: config.name.clone(),
                message: format!("spawn stdio transport: {e}"),
            })?;

        let stderr_task = stderr.map(|stderr| {
            let logs = Arc::clone(&self.logs);
            let server_name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.add(&server_name, LogLevel::Error, line);
                }
            })
        });

        match handler.serve(transport).await {
            Ok(service) => Ok((service, stderr_task)),
            Err(e) => {
                if let Some(task) = stderr_task {
                    task.abort();
                }
                Err(PoolError::Handshake {
                    server: config.name.clone(),
                    message: format!("initialize stdio client: {e}"),
                })
            }
        }
    }

    async fn connect_sse(
        &self,
        config: &ServerConfig,
        handler: PoolClientHandler,
        url: &str,
        token: Option<String>,
    ) -> PoolResult<PoolClient> {
        let url = self.effective_url(url);

        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(token) = &token {
            builder = builder.default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {token}")
                        .parse()
                        .map_err(|e| PoolError::TransportOpen {
                            server: config.name.clone(),
                            message: format!("auth token: {e}"),
                        })?,
                );
                headers
            });
        }
        let http_client = builder.build().map_err(|e| PoolError::TransportOpen {
            server: config.name.clone(),
            message: format!("build HTTP client: {e}"),
        })?;

        let sse_config = SseClientConfig {
            sse_endpoint: url.into(),
            ..Default::default()
        };

        let transport = SseClientTransport::start_with_client(http_client, sse_config)
            .await
            .map_err(|e| PoolError::TransportOpen {
                server: config.name.clone(),
                message: format!("create SSE transport: {e}"),
            })?;

        handler
            .serve(transport)
            .await
            .map_err(|e| PoolError::Handshake {
                server: config.name.clone(),
                message: format!("initialize SSE client: {e}"),
            })
    }

    async fn connect_streamable(
        &self,
        config: &ServerConfig,
        handler: PoolClientHandler,
        url: &str,
        token: Option<String>,
    ) -> PoolResult<PoolClient> {
        let url = self.effective_url(url);

        let transport = if let Some(token) = token {
            let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
            cfg.auth_header = Some(token);
            StreamableHttpClientTransport::from_config(cfg)
        } else {
            StreamableHttpClientTransport::from_uri(url.as_str())
        };

        handler
            .serve(transport)
            .await
            .map_err(|e| PoolError::Handshake {
                server: config.name.clone(),
                message: format!("initialize streamable client: {e}"),
            })
    }

    fn effective_url(&self, url: &str) -> String {
        if self.settings.transform_localhost {
            rewrite_localhost(url)
        } else {
            url.to_string()
        }
    }
}

/// Prefer the OAuth access token over a plain bearer token.
fn auth_token(bearer: &Option<String>, oauth: &Option<OauthTokens>) -> Option<String> {
    oauth
        .as_ref()
        .map(|t| t.access_token.clone())
        .or_else(|| bearer.clone())
}

/// Allow-listed inherited environment merged with the config's own entries.
/// Inherited values that look like exported shell functions (start with
/// `()`) are dropped.
fn sanitized_env(config_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for key in INHERITED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            if value.starts_with("()") {
                continue;
            }
            merged.insert((*key).to_string(), value);
        }
    }
    for (key, value) in config_env {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// First positional argument that names an existing directory, if any.
fn detect_cwd(args: &[String]) -> Option<String> {
    args.iter()
        .find(|a| !a.starts_with('-') && Path::new(a.as_str()).is_dir())
        .cloned()
}

/// Replace loopback hosts with the docker bridge alias.
fn rewrite_localhost(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    match parsed.host_str() {
        Some("localhost") | Some("127.0.0.1") => {
            if parsed.set_host(Some("host.docker.internal")).is_ok() {
                parsed.to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}
