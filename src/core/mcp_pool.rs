//! Per-server idle/active connection pool.
//!
//! One durable MCP client per configured back-end server: a warm idle entry
//! ready to be promoted, plus any number of active bindings to user sessions.
//! All map transitions happen under one mutex; connects and closes happen
//! outside it. The `creating` set keeps at most one idle build in flight per
//! server.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use super::{
    config::{PoolSettings, ServerConfig},
    connector::{ConnectedClient, Connector},
};
use crate::{
    error::PoolResult,
    logstore::{LogLevel, LogStore},
};

#[derive(Debug, Clone)]
pub struct McpPoolStatus {
    pub idle: usize,
    pub active: usize,
    pub active_session_ids: Vec<String>,
    pub idle_server_uuids: Vec<String>,
}

#[derive(Default)]
struct PoolState {
    /// At most one warm entry per server.
    idle: HashMap<String, Arc<ConnectedClient>>,
    /// session id -> server uuid -> bound client.
    active: HashMap<String, HashMap<String, Arc<ConnectedClient>>>,
    /// Mirror of `active` key sets for O(1) session cleanup.
    session_servers: HashMap<String, HashSet<String>>,
    /// Most recent config seen per server; used for idle replenishment.
    configs: HashMap<String, ServerConfig>,
    /// Servers with an idle build in flight.
    creating: HashSet<String>,
}

pub struct McpPool {
    connector: Arc<Connector>,
    settings: Arc<PoolSettings>,
    logs: Arc<LogStore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    state: Mutex<PoolState>,
}

impl McpPool {
    pub fn new(connector: Arc<Connector>, settings: Arc<PoolSettings>, logs: Arc<LogStore>) -> Self {
        Self {
            connector,
            settings,
            logs,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Bind a client for `(session_id, server_uuid)`.
    ///
    /// Idempotent per binding: a session that already holds this server gets
    /// the same client back. An idle entry is promoted when present;
    /// otherwise a connection is built synchronously with the caller's
    /// config. Either way an async idle replenish is scheduled. The pool
    /// remembers the caller's config as the latest for this server.
    pub async fn get_session(
        self: &Arc<Self>,
        session_id: &str,
        server_uuid: &str,
        config: &ServerConfig,
    ) -> PoolResult<Arc<ConnectedClient>> {
        {
            let mut state = self.state.lock();
            state
                .configs
                .insert(server_uuid.to_string(), config.clone());

            if let Some(existing) = state
                .active
                .get(session_id)
                .and_then(|m| m.get(server_uuid))
            {
                return Ok(Arc::clone(existing));
            }

            if let Some(idle) = state.idle.remove(server_uuid) {
                debug!(session = %session_id, server = %server_uuid, "promoting idle MCP client");
                state
                    .active
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(server_uuid.to_string(), Arc::clone(&idle));
                state
                    .session_servers
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(server_uuid.to_string());
                drop(state);
                self.spawn_replenish(server_uuid);
                return Ok(idle);
            }
        }

        let client = Arc::new(self.connector.connect(config, &self.cancel).await?);

        let raced = {
            let mut state = self.state.lock();
            if let Some(existing) = state
                .active
                .get(session_id)
                .and_then(|m| m.get(server_uuid))
            {
                Some(Arc::clone(existing))
            } else {
                state
                    .active
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(server_uuid.to_string(), Arc::clone(&client));
                state
                    .session_servers
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(server_uuid.to_string());
                None
            }
        };

        if let Some(existing) = raced {
            // A concurrent call installed its own binding first.
            client.cleanup().await;
            return Ok(existing);
        }

        self.spawn_replenish(server_uuid);
        Ok(client)
    }

    /// Synchronously build an idle entry for every server that lacks one.
    /// Used at startup; failures are logged and skipped.
    pub async fn ensure_idle_sessions(self: &Arc<Self>, configs: &HashMap<String, ServerConfig>) {
        for (server_uuid, config) in configs {
            if !self.claim_creating(server_uuid, Some(config)) {
                continue;
            }
            self.build_idle(server_uuid, config).await;
        }
    }

    /// Idempotent idle creation for a newly registered server.
    pub async fn ensure_idle_for_new_server(self: &Arc<Self>, server_uuid: &str, config: &ServerConfig) {
        if !self.claim_creating(server_uuid, Some(config)) {
            return;
        }
        self.build_idle(server_uuid, config).await;
    }

    /// Replace the idle entry after a config change. The stored config is
    /// updated first, the stale idle client is closed, and a fresh entry is
    /// built with the new config.
    pub async fn invalidate_idle_session(self: &Arc<Self>, server_uuid: &str, new_config: &ServerConfig) {
        let stale = {
            let mut state = self.state.lock();
            state
                .configs
                .insert(server_uuid.to_string(), new_config.clone());
            state.creating.remove(server_uuid);
            state.idle.remove(server_uuid)
        };
        if let Some(stale) = stale {
            stale.cleanup().await;
        }

        if self.claim_creating(server_uuid, None) {
            self.build_idle(server_uuid, new_config).await;
        }
        info!(server = %server_uuid, "idle session invalidated");
    }

    /// Drop all pool knowledge of a deleted server.
    pub async fn cleanup_idle_session(&self, server_uuid: &str) {
        let stale = {
            let mut state = self.state.lock();
            state.configs.remove(server_uuid);
            state.creating.remove(server_uuid);
            state.idle.remove(server_uuid)
        };
        if let Some(stale) = stale {
            stale.cleanup().await;
        }
        info!(server = %server_uuid, "idle session cleaned up");
    }

    /// Close every client bound to `session_id` and replenish idle entries
    /// for the servers the session touched.
    pub async fn cleanup_session(self: &Arc<Self>, session_id: &str) {
        let (clients, servers) = {
            let mut state = self.state.lock();
            let clients = state.active.remove(session_id).unwrap_or_default();
            let servers = state.session_servers.remove(session_id).unwrap_or_default();
            (clients, servers)
        };

        futures::future::join_all(
            clients
                .into_values()
                .map(|client| async move { client.cleanup().await }),
        )
        .await;

        for server_uuid in servers {
            self.spawn_replenish(&server_uuid);
        }
        debug!(session = %session_id, "session cleaned up");
    }

    /// Shutdown primitive: closes everything and forgets all state.
    pub async fn cleanup_all(&self) {
        let clients: Vec<Arc<ConnectedClient>> = {
            let mut state = self.state.lock();
            let mut clients: Vec<Arc<ConnectedClient>> = state.idle.drain().map(|(_, c)| c).collect();
            for (_, session) in state.active.drain() {
                clients.extend(session.into_values());
            }
            state.session_servers.clear();
            state.configs.clear();
            state.creating.clear();
            clients
        };

        futures::future::join_all(clients.into_iter().map(|c| async move { c.cleanup().await }))
            .await;
    }

    /// Cancel in-flight builds, close all clients, and wait for background
    /// tasks (bounded by a watchdog).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.cleanup_all().await;
        self.tasks.close();
        if tokio::time::timeout(std::time::Duration::from_secs(30), self.tasks.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for MCP pool background tasks");
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_client(&self, server_uuid: &str) -> Option<Arc<ConnectedClient>> {
        self.state.lock().idle.get(server_uuid).cloned()
    }

    pub fn status(&self) -> McpPoolStatus {
        let state = self.state.lock();
        McpPoolStatus {
            idle: state.idle.len(),
            active: state.active.values().map(|m| m.len()).sum(),
            active_session_ids: state.active.keys().cloned().collect(),
            idle_server_uuids: state.idle.keys().cloned().collect(),
        }
    }

    /// Schedule an async idle rebuild using the latest stored config. A
    /// no-op when idle maintenance is disabled, an idle entry already
    /// exists, a build is already in flight, or the server is unknown.
    fn spawn_replenish(self: &Arc<Self>, server_uuid: &str) {
        if self.settings.idle_count_per_server == 0 {
            return;
        }

        let config = {
            let mut state = self.state.lock();
            if state.idle.contains_key(server_uuid) || state.creating.contains(server_uuid) {
                return;
            }
            let Some(config) = state.configs.get(server_uuid).cloned() else {
                return;
            };
            state.creating.insert(server_uuid.to_string());
            config
        };

        let pool = Arc::clone(self);
        let server_uuid = server_uuid.to_string();
        self.tasks.spawn(async move {
            pool.build_idle(&server_uuid, &config).await;
        });
    }

    /// Claim the `creating` flag for `server_uuid`, optionally recording the
    /// config as latest. Returns false when an idle entry exists or a build
    /// is already running.
    fn claim_creating(&self, server_uuid: &str, config: Option<&ServerConfig>) -> bool {
        let mut state = self.state.lock();
        if let Some(config) = config {
            state
                .configs
                .insert(server_uuid.to_string(), config.clone());
        }
        if state.idle.contains_key(server_uuid) || state.creating.contains(server_uuid) {
            return false;
        }
        state.creating.insert(server_uuid.to_string());
        true
    }

    /// Build one idle entry. Assumes the caller claimed `creating`. The
    /// finished client is installed only if no idle entry appeared in the
    /// meantime and the stored config still matches; otherwise it is closed
    /// and discarded.
    async fn build_idle(self: &Arc<Self>, server_uuid: &str, config: &ServerConfig) {
        let pool = Arc::clone(self);
        let uuid = server_uuid.to_string();
        let _clear_creating = scopeguard::guard((), move |_| {
            pool.state.lock().creating.remove(&uuid);
        });

        let client = match self.connector.connect(config, &self.cancel).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(server = %config.name, error = %e, "idle build failed");
                self.logs.add_with_error(
                    &config.name,
                    LogLevel::Error,
                    "idle session build failed",
                    Some(&e),
                );
                return;
            }
        };

        let discarded = {
            let mut state = self.state.lock();
            let stale = state
                .configs
                .get(server_uuid)
                .map(|current| current.fingerprint() != client.fingerprint)
                .unwrap_or(true);
            if stale || state.idle.contains_key(server_uuid) {
                Some(client)
            } else {
                state.idle.insert(server_uuid.to_string(), client);
                None
            }
        };

        if let Some(client) = discarded {
            debug!(server = %server_uuid, "discarding superseded idle build");
            client.cleanup().await;
        }
    }
}
