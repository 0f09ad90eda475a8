//! Per-namespace pool of composite MCP servers.
//!
//! Mirrors the structure of [`McpPool`](super::mcp_pool::McpPool) one level
//! up: a warm idle composite per namespace plus active instances bound to
//! wire sessions. Also owns the deterministic OpenAPI sessions, which live
//! in `active` under `openapi_<namespace>` ids and are only replaced through
//! explicit invalidation.

use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicU64, Arc},
};

use parking_lot::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{
    composite::CompositeServer,
    config::PoolSettings,
    filter::MiddlewareChain,
    mcp_pool::McpPool,
};
use crate::{
    error::PoolResult,
    logstore::{LogLevel, LogStore},
    store::ServerConfigStore,
};

/// Session id of the namespace's dedicated OpenAPI composite.
pub fn openapi_session_id(namespace_uuid: &str) -> String {
    format!("openapi_{namespace_uuid}")
}

#[derive(Debug, Clone)]
pub struct MetaPoolStatus {
    pub idle: usize,
    pub active: usize,
    pub active_session_ids: Vec<String>,
    pub idle_namespace_uuids: Vec<String>,
}

#[derive(Default)]
struct MetaState {
    idle: HashMap<String, Arc<CompositeServer>>,
    active: HashMap<String, Arc<CompositeServer>>,
    session_namespace: HashMap<String, String>,
    creating: HashSet<String>,
}

pub struct MetaPool {
    mcp_pool: Arc<McpPool>,
    server_store: Arc<dyn ServerConfigStore>,
    middleware: MiddlewareChain,
    logs: Arc<LogStore>,
    settings: Arc<PoolSettings>,
    tasks: TaskTracker,
    state: Mutex<MetaState>,
    idle_seq: AtomicU64,
}

impl MetaPool {
    pub fn new(
        mcp_pool: Arc<McpPool>,
        server_store: Arc<dyn ServerConfigStore>,
        middleware: MiddlewareChain,
        settings: Arc<PoolSettings>,
        logs: Arc<LogStore>,
    ) -> Self {
        Self {
            mcp_pool,
            server_store,
            middleware,
            logs,
            settings,
            tasks: TaskTracker::new(),
            state: Mutex::new(MetaState::default()),
            idle_seq: AtomicU64::new(0),
        }
    }

    pub fn mcp_pool(&self) -> &Arc<McpPool> {
        &self.mcp_pool
    }

    /// Composite server for `(session_id, namespace)`. Promotes a warm idle
    /// instance when one exists, rebinding it to the session; otherwise
    /// builds one. Schedules an async idle replenish either way.
    pub async fn get_server(
        self: &Arc<Self>,
        session_id: &str,
        namespace_uuid: &str,
        include_inactive: bool,
    ) -> PoolResult<Arc<CompositeServer>> {
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.active.get(session_id) {
                return Ok(Arc::clone(existing));
            }
            if let Some(idle) = state.idle.remove(namespace_uuid) {
                debug!(session = %session_id, namespace = %namespace_uuid, "promoting idle composite");
                idle.rebind_session(session_id);
                state
                    .active
                    .insert(session_id.to_string(), Arc::clone(&idle));
                state
                    .session_namespace
                    .insert(session_id.to_string(), namespace_uuid.to_string());
                drop(state);
                self.spawn_replenish(namespace_uuid);
                return Ok(idle);
            }
        }

        let built = self
            .build_composite(namespace_uuid, session_id, include_inactive)
            .await?;

        let raced = {
            let mut state = self.state.lock();
            if let Some(existing) = state.active.get(session_id) {
                Some(Arc::clone(existing))
            } else {
                state
                    .active
                    .insert(session_id.to_string(), Arc::clone(&built));
                state
                    .session_namespace
                    .insert(session_id.to_string(), namespace_uuid.to_string());
                None
            }
        };

        if let Some(existing) = raced {
            built.cleanup();
            return Ok(existing);
        }

        self.spawn_replenish(namespace_uuid);
        Ok(built)
    }

    /// Synchronously warm an idle composite for each listed namespace.
    pub async fn ensure_idle_servers(self: &Arc<Self>, namespace_uuids: &[String], include_inactive: bool) {
        for namespace_uuid in namespace_uuids {
            if !self.claim_creating(namespace_uuid) {
                continue;
            }
            self.build_idle(namespace_uuid, include_inactive).await;
        }
    }

    pub async fn ensure_idle_for_new_namespace(self: &Arc<Self>, namespace_uuid: &str) {
        if !self.claim_creating(namespace_uuid) {
            return;
        }
        self.build_idle(namespace_uuid, true).await;
    }

    /// Discard and rebuild the idle composite after the namespace changed.
    pub async fn invalidate_idle_server(self: &Arc<Self>, namespace_uuid: &str) {
        let stale = {
            let mut state = self.state.lock();
            state.creating.remove(namespace_uuid);
            state.idle.remove(namespace_uuid)
        };
        if let Some(stale) = stale {
            let stale_session = stale.session_id();
            stale.cleanup();
            self.mcp_pool.cleanup_session(&stale_session).await;
        }

        if self.claim_creating(namespace_uuid) {
            self.build_idle(namespace_uuid, true).await;
        }
        info!(namespace = %namespace_uuid, "idle composite invalidated");
    }

    pub async fn invalidate_idle_servers(self: &Arc<Self>, namespace_uuids: &[String]) {
        for namespace_uuid in namespace_uuids {
            self.invalidate_idle_server(namespace_uuid).await;
        }
    }

    /// Drop the idle composite of a deleted namespace without rebuilding.
    pub async fn cleanup_idle_server(&self, namespace_uuid: &str) {
        let stale = {
            let mut state = self.state.lock();
            state.creating.remove(namespace_uuid);
            state.idle.remove(namespace_uuid)
        };
        if let Some(stale) = stale {
            let stale_session = stale.session_id();
            stale.cleanup();
            self.mcp_pool.cleanup_session(&stale_session).await;
        }
        info!(namespace = %namespace_uuid, "idle composite cleaned up");
    }

    /// The namespace's OpenAPI composite under its deterministic session id.
    /// Created on first use and kept until explicitly invalidated.
    pub async fn get_openapi_server(
        self: &Arc<Self>,
        namespace_uuid: &str,
    ) -> PoolResult<Arc<CompositeServer>> {
        let session_id = openapi_session_id(namespace_uuid);

        if let Some(existing) = self.state.lock().active.get(&session_id) {
            return Ok(Arc::clone(existing));
        }

        let built = self
            .build_composite(namespace_uuid, &session_id, false)
            .await?;

        let raced = {
            let mut state = self.state.lock();
            if let Some(existing) = state.active.get(&session_id) {
                Some(Arc::clone(existing))
            } else {
                state.active.insert(session_id.clone(), Arc::clone(&built));
                state
                    .session_namespace
                    .insert(session_id, namespace_uuid.to_string());
                None
            }
        };

        if let Some(existing) = raced {
            built.cleanup();
            return Ok(existing);
        }
        Ok(built)
    }

    /// Close existing OpenAPI composites for the listed namespaces and build
    /// fresh replacements. Failures are logged, never surfaced.
    pub async fn invalidate_openapi_sessions(self: &Arc<Self>, namespace_uuids: &[String]) {
        for namespace_uuid in namespace_uuids {
            let session_id = openapi_session_id(namespace_uuid);
            let stale = {
                let mut state = self.state.lock();
                state.session_namespace.remove(&session_id);
                state.active.remove(&session_id)
            };
            let had_session = stale.is_some();
            if let Some(stale) = stale {
                stale.cleanup();
                self.mcp_pool.cleanup_session(&session_id).await;
            }

            if had_session {
                if let Err(e) = self.get_openapi_server(namespace_uuid).await {
                    warn!(namespace = %namespace_uuid, error = %e, "failed to rebuild OpenAPI session");
                    self.logs.add_with_error(
                        namespace_uuid,
                        LogLevel::Error,
                        "failed to rebuild OpenAPI session",
                        Some(&e),
                    );
                }
            }
        }
    }

    /// Release a wire session: close its composite, release its back-end
    /// clients in the MCP pool, and replenish the namespace's idle slot.
    pub async fn cleanup_session(self: &Arc<Self>, session_id: &str) {
        let (composite, namespace_uuid) = {
            let mut state = self.state.lock();
            (
                state.active.remove(session_id),
                state.session_namespace.remove(session_id),
            )
        };

        if let Some(composite) = composite {
            composite.cleanup();
        }
        self.mcp_pool.cleanup_session(session_id).await;

        if let Some(namespace_uuid) = namespace_uuid {
            self.spawn_replenish(&namespace_uuid);
        }
        debug!(session = %session_id, "meta session cleaned up");
    }

    /// Shutdown primitive: closes every composite, including OpenAPI
    /// sessions. Back-end clients are released by the MCP pool's own
    /// `cleanup_all`.
    pub async fn cleanup_all(&self) {
        let composites: Vec<Arc<CompositeServer>> = {
            let mut state = self.state.lock();
            let mut all: Vec<Arc<CompositeServer>> =
                state.idle.drain().map(|(_, c)| c).collect();
            all.extend(state.active.drain().map(|(_, c)| c));
            state.session_namespace.clear();
            state.creating.clear();
            all
        };
        for composite in composites {
            composite.cleanup();
        }
    }

    pub async fn shutdown(&self) {
        self.cleanup_all().await;
        self.tasks.close();
        if tokio::time::timeout(std::time::Duration::from_secs(30), self.tasks.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for meta pool background tasks");
        }
    }

    pub fn status(&self) -> MetaPoolStatus {
        let state = self.state.lock();
        MetaPoolStatus {
            idle: state.idle.len(),
            active: state.active.len(),
            active_session_ids: state.active.keys().cloned().collect(),
            idle_namespace_uuids: state.idle.keys().cloned().collect(),
        }
    }

    async fn build_composite(
        &self,
        namespace_uuid: &str,
        session_id: &str,
        include_inactive: bool,
    ) -> PoolResult<Arc<CompositeServer>> {
        let composite = CompositeServer::create(
            namespace_uuid,
            session_id,
            include_inactive,
            &self.server_store,
            Arc::clone(&self.mcp_pool),
            self.middleware.clone(),
            Arc::clone(&self.logs),
        )
        .await?;
        Ok(Arc::new(composite))
    }

    fn claim_creating(&self, namespace_uuid: &str) -> bool {
        let mut state = self.state.lock();
        if state.idle.contains_key(namespace_uuid) || state.creating.contains(namespace_uuid) {
            return false;
        }
        state.creating.insert(namespace_uuid.to_string());
        true
    }

    fn spawn_replenish(self: &Arc<Self>, namespace_uuid: &str) {
        if self.settings.idle_count_per_server == 0 {
            return;
        }
        if !self.claim_creating(namespace_uuid) {
            return;
        }

        let pool = Arc::clone(self);
        let namespace_uuid = namespace_uuid.to_string();
        self.tasks.spawn(async move {
            pool.build_idle(&namespace_uuid, true).await;
        });
    }

    /// Build one idle composite under an ephemeral session id. Assumes the
    /// caller claimed `creating`.
    async fn build_idle(self: &Arc<Self>, namespace_uuid: &str, include_inactive: bool) {
        let pool = Arc::clone(self);
        let guard_uuid = namespace_uuid.to_string();
        let _clear_creating = scopeguard::guard((), move |_| {
            pool.state.lock().creating.remove(&guard_uuid);
        });

        let seq = self
            .idle_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let session_id = format!("idle_{namespace_uuid}_{seq}");

        let composite = match self
            .build_composite(namespace_uuid, &session_id, include_inactive)
            .await
        {
            Ok(composite) => composite,
            Err(e) => {
                warn!(namespace = %namespace_uuid, error = %e, "idle composite build failed");
                self.logs.add_with_error(
                    namespace_uuid,
                    LogLevel::Error,
                    "idle composite build failed",
                    Some(&e),
                );
                return;
            }
        };

        let discarded = {
            let mut state = self.state.lock();
            if state.idle.contains_key(namespace_uuid) {
                Some(composite)
            } else {
                state
                    .idle
                    .insert(namespace_uuid.to_string(), composite);
                None
            }
        };

        if let Some(composite) = discarded {
            debug!(namespace = %namespace_uuid, "discarding superseded idle composite");
            composite.cleanup();
            self.mcp_pool.cleanup_session(&session_id).await;
        }
    }
}
