//! Store-mutation to pool-refresh routing.
//!
//! Callers dispatch these after the corresponding database mutation commits.
//! Every method is fire-and-forget: the refresh runs on a tracked background
//! task and failures are logged, never surfaced — the mutation has already
//! succeeded.

use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::warn;

use super::{config::ServerConfig, filter::FilterCache, mcp_pool::McpPool, meta_pool::MetaPool};
use crate::{
    logstore::{LogLevel, LogStore},
    store::NamespaceStore,
};

pub struct InvalidationRouter {
    mcp_pool: Arc<McpPool>,
    meta_pool: Arc<MetaPool>,
    filter_cache: Arc<FilterCache>,
    namespace_store: Arc<dyn NamespaceStore>,
    logs: Arc<LogStore>,
    tasks: TaskTracker,
}

impl InvalidationRouter {
    pub fn new(
        mcp_pool: Arc<McpPool>,
        meta_pool: Arc<MetaPool>,
        filter_cache: Arc<FilterCache>,
        namespace_store: Arc<dyn NamespaceStore>,
        logs: Arc<LogStore>,
    ) -> Self {
        Self {
            mcp_pool,
            meta_pool,
            filter_cache,
            namespace_store,
            logs,
            tasks: TaskTracker::new(),
        }
    }

    /// A server row was inserted: warm an idle connection for it.
    pub fn server_created(&self, config: ServerConfig) {
        let mcp_pool = Arc::clone(&self.mcp_pool);
        self.tasks.spawn(async move {
            let uuid = config.uuid.clone();
            mcp_pool.ensure_idle_for_new_server(&uuid, &config).await;
        });
    }

    /// A server's config changed: swap its idle connection and refresh every
    /// namespace that contains it.
    pub fn server_updated(&self, config: ServerConfig) {
        let mcp_pool = Arc::clone(&self.mcp_pool);
        let meta_pool = Arc::clone(&self.meta_pool);
        let namespace_store = Arc::clone(&self.namespace_store);
        let logs = Arc::clone(&self.logs);
        self.tasks.spawn(async move {
            let affected = match namespace_store
                .find_namespaces_containing_server(&config.uuid)
                .await
            {
                Ok(affected) => affected,
                Err(e) => {
                    warn!(server = %config.uuid, error = %e, "failed to resolve affected namespaces");
                    logs.add_with_error(
                        &config.name,
                        LogLevel::Error,
                        "invalidation: failed to resolve affected namespaces",
                        Some(&e),
                    );
                    Vec::new()
                }
            };

            let uuid = config.uuid.clone();
            mcp_pool.invalidate_idle_session(&uuid, &config).await;
            meta_pool.invalidate_idle_servers(&affected).await;
            meta_pool.invalidate_openapi_sessions(&affected).await;
        });
    }

    /// A server row is being removed. `affected_namespaces` must be captured
    /// before the delete commits, since the membership rows go with it.
    pub fn server_deleted(&self, server_uuid: String, affected_namespaces: Vec<String>) {
        let mcp_pool = Arc::clone(&self.mcp_pool);
        let meta_pool = Arc::clone(&self.meta_pool);
        self.tasks.spawn(async move {
            mcp_pool.cleanup_idle_session(&server_uuid).await;
            meta_pool.invalidate_idle_servers(&affected_namespaces).await;
            meta_pool
                .invalidate_openapi_sessions(&affected_namespaces)
                .await;
        });
    }

    pub fn namespace_created(&self, namespace_uuid: String) {
        let meta_pool = Arc::clone(&self.meta_pool);
        self.tasks.spawn(async move {
            meta_pool.ensure_idle_for_new_namespace(&namespace_uuid).await;
        });
    }

    /// Namespace server list or attributes changed.
    pub fn namespace_updated(&self, namespace_uuid: String) {
        let meta_pool = Arc::clone(&self.meta_pool);
        self.tasks.spawn(async move {
            meta_pool.invalidate_idle_server(&namespace_uuid).await;
            meta_pool
                .invalidate_openapi_sessions(std::slice::from_ref(&namespace_uuid))
                .await;
        });
    }

    pub fn namespace_deleted(&self, namespace_uuid: String) {
        let meta_pool = Arc::clone(&self.meta_pool);
        self.tasks.spawn(async move {
            meta_pool.cleanup_idle_server(&namespace_uuid).await;
            meta_pool
                .invalidate_openapi_sessions(std::slice::from_ref(&namespace_uuid))
                .await;
        });
    }

    /// A server inside a namespace was toggled ACTIVE/INACTIVE.
    pub fn server_status_toggled(&self, namespace_uuid: String) {
        self.namespace_updated(namespace_uuid);
    }

    /// A tool inside a namespace was toggled: the cached status is all that
    /// needs to go.
    pub fn tool_status_toggled(&self, namespace_uuid: &str) {
        self.filter_cache.clear_namespace(namespace_uuid);
    }

    /// The namespace's tool set was bulk-refreshed.
    pub fn tools_refreshed(&self, namespace_uuid: String) {
        self.filter_cache.clear_namespace(&namespace_uuid);
        self.namespace_updated(namespace_uuid);
    }

    /// Await outstanding refresh tasks (bounded).
    pub async fn shutdown(&self) {
        self.tasks.close();
        if tokio::time::timeout(std::time::Duration::from_secs(30), self.tasks.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for invalidation tasks");
        }
    }
}
