//! Startup warmer.
//!
//! Pre-populates both pools at boot: one idle connection per configured
//! server and one idle composite per namespace. Partial failures are logged
//! and never abort startup.

use std::{collections::HashMap, sync::Arc};

use tracing::{info, warn};

use super::{mcp_pool::McpPool, meta_pool::MetaPool};
use crate::{
    logstore::{LogLevel, LogStore},
    store::{NamespaceStore, ServerConfigStore},
};

pub struct StartupWarmer {
    mcp_pool: Arc<McpPool>,
    meta_pool: Arc<MetaPool>,
    server_store: Arc<dyn ServerConfigStore>,
    namespace_store: Arc<dyn NamespaceStore>,
    logs: Arc<LogStore>,
}

impl StartupWarmer {
    pub fn new(
        mcp_pool: Arc<McpPool>,
        meta_pool: Arc<MetaPool>,
        server_store: Arc<dyn ServerConfigStore>,
        namespace_store: Arc<dyn NamespaceStore>,
        logs: Arc<LogStore>,
    ) -> Self {
        Self {
            mcp_pool,
            meta_pool,
            server_store,
            namespace_store,
            logs,
        }
    }

    pub async fn run(&self) {
        match self.server_store.list_all().await {
            Ok(configs) => {
                let configs: HashMap<_, _> = configs
                    .into_iter()
                    .map(|c| (c.uuid.clone(), c))
                    .collect();
                info!(count = configs.len(), "warming idle MCP connections");
                self.mcp_pool.ensure_idle_sessions(&configs).await;
            }
            Err(e) => {
                warn!(error = %e, "startup: failed to list server configs");
                self.logs.add_with_error(
                    "startup",
                    LogLevel::Error,
                    "failed to list server configs",
                    Some(&e),
                );
            }
        }

        match self.namespace_store.list_all().await {
            Ok(namespaces) => {
                info!(count = namespaces.len(), "warming idle composites");
                self.meta_pool.ensure_idle_servers(&namespaces, true).await;
            }
            Err(e) => {
                warn!(error = %e, "startup: failed to list namespaces");
                self.logs.add_with_error(
                    "startup",
                    LogLevel::Error,
                    "failed to list namespaces",
                    Some(&e),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        core::{
            config::PoolSettings,
            connector::Connector,
            filter::MiddlewareChain,
        },
        store::{MemoryConfigStore, NamespaceServer},
        testutil::{mock_server_config, write_mock_server},
    };

    #[tokio::test]
    async fn warms_both_pools_and_survives_bad_servers() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = write_mock_server(dir.path(), "alpha.sh", &["x"], false);

        let store = Arc::new(MemoryConfigStore::new());
        store.upsert_server(mock_server_config("a", "alpha", &alpha));
        // A server whose command does not exist: warming logs and moves on.
        store.upsert_server(mock_server_config("b", "broken", "/nonexistent/mock.sh"));
        store.set_namespace(
            "ns",
            vec![NamespaceServer {
                server_uuid: "a".to_string(),
                active: true,
            }],
        );

        let settings = Arc::new(PoolSettings {
            connect_retries: 1,
            connect_retry_delay_ms: 10,
            ..PoolSettings::default()
        });
        let logs = Arc::new(LogStore::new());
        let connector = Arc::new(Connector::new(Arc::clone(&settings), Arc::clone(&logs)));
        let mcp = Arc::new(McpPool::new(connector, Arc::clone(&settings), Arc::clone(&logs)));
        let meta = Arc::new(MetaPool::new(
            Arc::clone(&mcp),
            Arc::clone(&store) as Arc<dyn ServerConfigStore>,
            MiddlewareChain::new(),
            Arc::clone(&settings),
            Arc::clone(&logs),
        ));

        let warmer = StartupWarmer::new(
            Arc::clone(&mcp),
            Arc::clone(&meta),
            Arc::clone(&store) as Arc<dyn ServerConfigStore>,
            Arc::clone(&store) as Arc<dyn NamespaceStore>,
            Arc::clone(&logs),
        );

        tokio::time::timeout(Duration::from_secs(10), warmer.run())
            .await
            .expect("warmup should not hang");

        assert_eq!(mcp.status().idle, 1, "only the healthy server gets an idle entry");
        assert_eq!(meta.status().idle, 1);
        assert!(logs
            .recent(50)
            .iter()
            .any(|e| e.server_name == "broken"), "the failed warm-up must be logged");

        meta.shutdown().await;
        mcp.shutdown().await;
    }
}
