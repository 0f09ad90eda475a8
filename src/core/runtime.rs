//! One-stop wiring of the pool components.
//!
//! Everything is an explicitly constructed, dependency-injected value:
//! router → pools → stores, no globals and no back-references. Build one
//! `PoolRuntime` at startup, hand its pieces to the wire layer, and call
//! `shutdown` before exit.

use std::sync::Arc;

use super::{
    config::PoolSettings,
    connector::Connector,
    filter::{FilterCache, MiddlewareChain, StatusFilter},
    invalidation::InvalidationRouter,
    mcp_pool::McpPool,
    meta_pool::MetaPool,
    warmup::StartupWarmer,
};
use crate::{
    logstore::LogStore,
    store::{NamespaceStore, ServerConfigStore, ToolStatusStore},
};

pub struct PoolRuntime {
    pub settings: Arc<PoolSettings>,
    pub logs: Arc<LogStore>,
    pub filter_cache: Arc<FilterCache>,
    pub mcp_pool: Arc<McpPool>,
    pub meta_pool: Arc<MetaPool>,
    pub router: Arc<InvalidationRouter>,
    warmer: StartupWarmer,
}

impl PoolRuntime {
    pub fn build(
        settings: PoolSettings,
        server_store: Arc<dyn ServerConfigStore>,
        namespace_store: Arc<dyn NamespaceStore>,
        tool_status_store: Arc<dyn ToolStatusStore>,
    ) -> Self {
        let settings = Arc::new(settings);
        let logs = Arc::new(LogStore::with_capacity(settings.max_log_entries));
        let filter_cache = Arc::new(FilterCache::new(settings.filter_cache_ttl()));

        let connector = Arc::new(Connector::new(Arc::clone(&settings), Arc::clone(&logs)));
        let mcp_pool = Arc::new(McpPool::new(
            connector,
            Arc::clone(&settings),
            Arc::clone(&logs),
        ));

        let filter = StatusFilter::new(
            Arc::clone(&filter_cache),
            tool_status_store,
            Arc::clone(&settings),
            Arc::clone(&logs),
        );
        let middleware = MiddlewareChain::new().wrap(Arc::new(filter));

        let meta_pool = Arc::new(MetaPool::new(
            Arc::clone(&mcp_pool),
            Arc::clone(&server_store),
            middleware,
            Arc::clone(&settings),
            Arc::clone(&logs),
        ));

        let router = Arc::new(InvalidationRouter::new(
            Arc::clone(&mcp_pool),
            Arc::clone(&meta_pool),
            Arc::clone(&filter_cache),
            Arc::clone(&namespace_store),
            Arc::clone(&logs),
        ));

        let warmer = StartupWarmer::new(
            Arc::clone(&mcp_pool),
            Arc::clone(&meta_pool),
            server_store,
            namespace_store,
            Arc::clone(&logs),
        );

        Self {
            settings,
            logs,
            filter_cache,
            mcp_pool,
            meta_pool,
            router,
            warmer,
        }
    }

    /// Pre-populate idle entries for every known server and namespace.
    pub async fn warm_up(&self) {
        self.warmer.run().await;
    }

    /// Graceful teardown: stop refresh tasks, close every composite, then
    /// every back-end client.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.meta_pool.shutdown().await;
        self.mcp_pool.shutdown().await;
    }
}
