//! Aggregating MCP server for one namespace.
//!
//! Serves `tools/list` by fanning out to every participating back-end server
//! and merging the results under sanitized server-name prefixes, and
//! `tools/call` by routing on that prefix. Back-end connections come from
//! [`McpPool`] keyed by this composite's session id; closing the composite
//! never closes them.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::RwLock;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    ErrorData, RoleServer, ServerHandler,
};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    config::{sanitize_name, ServerConfig},
    filter::{split_prefixed_name, MiddlewareChain, ToolFilterContext},
    mcp_pool::McpPool,
};
use crate::{
    error::{PoolError, PoolResult},
    logstore::{LogLevel, LogStore},
    store::ServerConfigStore,
};

struct ParticipatingServer {
    uuid: String,
    config: ServerConfig,
    /// Sanitized config name; empty when the config has no usable name.
    prefix: String,
}

pub struct CompositeServer {
    namespace_uuid: String,
    session_id: RwLock<String>,
    servers: Vec<ParticipatingServer>,
    ctx: ToolFilterContext,
    mcp_pool: Arc<McpPool>,
    middleware: MiddlewareChain,
    logs: Arc<LogStore>,
    closed: AtomicBool,
}

impl CompositeServer {
    /// Fetch the namespace's server set and assemble a composite bound to
    /// `session_id`.
    pub async fn create(
        namespace_uuid: &str,
        session_id: &str,
        include_inactive: bool,
        server_store: &Arc<dyn ServerConfigStore>,
        mcp_pool: Arc<McpPool>,
        middleware: MiddlewareChain,
        logs: Arc<LogStore>,
    ) -> PoolResult<Self> {
        let configs = server_store
            .list_by_namespace(namespace_uuid, include_inactive)
            .await?;

        let mut servers = Vec::with_capacity(configs.len());
        let mut server_by_prefix = std::collections::HashMap::new();
        for (uuid, config) in configs {
            let prefix = config.sanitized_name();
            if !prefix.is_empty() {
                server_by_prefix.insert(prefix.clone(), uuid.clone());
            }
            servers.push(ParticipatingServer {
                uuid,
                config,
                prefix,
            });
        }

        Ok(Self {
            namespace_uuid: namespace_uuid.to_string(),
            session_id: RwLock::new(session_id.to_string()),
            servers,
            ctx: ToolFilterContext {
                namespace_uuid: namespace_uuid.to_string(),
                server_by_prefix,
            },
            mcp_pool,
            middleware,
            logs,
            closed: AtomicBool::new(false),
        })
    }

    pub fn namespace_uuid(&self) -> &str {
        &self.namespace_uuid
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    /// Re-key the composite onto a different session id. Done when a warm
    /// idle instance is promoted to a real session.
    pub(crate) fn rebind_session(&self, session_id: &str) {
        *self.session_id.write() = session_id.to_string();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Close the composite itself. Delegated back-end clients are owned by
    /// the MCP pool and are released when the session is cleaned up.
    pub fn cleanup(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Merged `tools/list`. A back-end failure drops that server's tools
    /// from the merge and records a log entry; the aggregate never fails.
    pub async fn list_tools_merged(&self) -> Vec<Tool> {
        let session_id = self.session_id();
        let mut join_set = JoinSet::new();

        for server in &self.servers {
            let pool = Arc::clone(&self.mcp_pool);
            let config = server.config.clone();
            let uuid = server.uuid.clone();
            let session_id = session_id.clone();
            join_set.spawn(async move {
                let result = async {
                    let client = pool.get_session(&session_id, &uuid, &config).await?;
                    if !client.supports_tools() {
                        return Ok((Vec::new(), client.remote_name.clone()));
                    }
                    let tools = client.peer().list_all_tools().await.map_err(|e| {
                        PoolError::Downstream {
                            server: config.name.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    Ok::<_, PoolError>((tools, client.remote_name.clone()))
                }
                .await;
                (config.name.clone(), result)
            });
        }

        let mut merged = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((config_name, result)) = joined else {
                warn!(namespace = %self.namespace_uuid, "tools/list fan-out task panicked");
                continue;
            };
            match result {
                Ok((tools, remote_name)) => {
                    let server_name = if !config_name.is_empty() {
                        config_name
                    } else {
                        remote_name.unwrap_or_default()
                    };
                    let prefix = sanitize_name(&server_name);
                    for mut tool in tools {
                        tool.name = format!("{prefix}__{}", tool.name).into();
                        merged.push(tool);
                    }
                }
                Err(e) => {
                    warn!(
                        namespace = %self.namespace_uuid,
                        server = %config_name,
                        error = %e,
                        "tools/list forwarding failed; omitting server from merge"
                    );
                    self.logs.add_with_error(
                        &config_name,
                        LogLevel::Error,
                        "tools/list failed; server omitted from aggregate",
                        Some(&e),
                    );
                }
            }
        }

        self.middleware.apply_list(&self.ctx, merged).await
    }

    /// Route a `tools/call` to the back-end server whose sanitized name
    /// matches the prefix, forwarding the original tool name unchanged.
    pub async fn call_tool_routed(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> PoolResult<CallToolResult> {
        if let Some(result) = self.middleware.apply_call(&self.ctx, name).await {
            return Ok(result);
        }

        let Some((prefix, original)) = split_prefixed_name(name) else {
            return Err(PoolError::UnknownTool(name.to_string()));
        };

        if let Some(server) = self
            .servers
            .iter()
            .find(|s| !s.prefix.is_empty() && s.prefix == prefix)
        {
            return self.forward_call(server, original, arguments).await;
        }

        // Servers without a usable config name are matched on the name the
        // remote reported during its handshake.
        for server in self.servers.iter().filter(|s| s.prefix.is_empty()) {
            let client = self
                .mcp_pool
                .get_session(&self.session_id(), &server.uuid, &server.config)
                .await?;
            let remote_prefix = client
                .remote_name
                .as_deref()
                .map(sanitize_name)
                .unwrap_or_default();
            if remote_prefix == prefix {
                return forward(&client, &server.config, original, arguments).await;
            }
        }

        Err(PoolError::UnknownTool(name.to_string()))
    }

    async fn forward_call(
        &self,
        server: &ParticipatingServer,
        original: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> PoolResult<CallToolResult> {
        debug!(
            namespace = %self.namespace_uuid,
            server = %server.config.name,
            tool = %original,
            "routing tools/call"
        );
        let client = self
            .mcp_pool
            .get_session(&self.session_id(), &server.uuid, &server.config)
            .await?;
        forward(&client, &server.config, original, arguments).await
    }

    /// Handle to use with an MCP transport.
    pub fn service(self: &Arc<Self>) -> CompositeService {
        CompositeService(Arc::clone(self))
    }
}

async fn forward(
    client: &super::connector::ConnectedClient,
    config: &ServerConfig,
    tool_name: &str,
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
) -> PoolResult<CallToolResult> {
    client
        .peer()
        .call_tool(CallToolRequestParam {
            name: std::borrow::Cow::Owned(tool_name.to_string()),
            arguments,
        })
        .await
        .map_err(|e| PoolError::Downstream {
            server: config.name.clone(),
            message: e.to_string(),
        })
}

/// `ServerHandler` adapter over a shared [`CompositeServer`].
#[derive(Clone)]
pub struct CompositeService(pub Arc<CompositeServer>);

impl ServerHandler for CompositeService {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.0.list_tools_merged().await,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        match self.0.call_tool_routed(&request.name, request.arguments).await {
            Ok(result) => Ok(result),
            Err(PoolError::UnknownTool(name)) => Err(ErrorData::invalid_params(
                format!("Unknown tool: {name}"),
                None,
            )),
            Err(e) => Err(ErrorData::internal_error(e.to_string(), None)),
        }
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "metamcp-pool".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
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
            filter::{FilterCache, StatusFilter},
        },
        store::{MemoryConfigStore, MemoryToolStatusStore, NamespaceServer},
        testutil::{mock_server_config, write_mock_server},
    };

    struct Fixture {
        composite: Arc<CompositeServer>,
        pool: Arc<McpPool>,
        logs: Arc<LogStore>,
        _dir: tempfile::TempDir,
    }

    /// Namespace "ns" with servers alpha(tools x, y) and beta(tools z).
    async fn fixture(beta_fails_list: bool, inactive: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let alpha = write_mock_server(dir.path(), "alpha.sh", &["x", "y"], false);
        let beta = write_mock_server(dir.path(), "beta.sh", &["z"], beta_fails_list);

        let config_store = Arc::new(MemoryConfigStore::new());
        config_store.upsert_server(mock_server_config("a", "alpha", &alpha));
        config_store.upsert_server(mock_server_config("b", "beta", &beta));
        config_store.set_namespace(
            "ns",
            vec![
                NamespaceServer {
                    server_uuid: "a".to_string(),
                    active: true,
                },
                NamespaceServer {
                    server_uuid: "b".to_string(),
                    active: true,
                },
            ],
        );

        let status_store = Arc::new(MemoryToolStatusStore::new());
        for (server, tool) in inactive {
            status_store.set_inactive("ns", server, tool);
        }

        let settings = Arc::new(PoolSettings {
            connect_retries: 1,
            connect_retry_delay_ms: 10,
            ..PoolSettings::default()
        });
        let logs = Arc::new(LogStore::new());
        let connector = Arc::new(Connector::new(Arc::clone(&settings), Arc::clone(&logs)));
        let pool = Arc::new(McpPool::new(connector, Arc::clone(&settings), Arc::clone(&logs)));

        let filter = StatusFilter::new(
            Arc::new(FilterCache::new(Duration::from_millis(50))),
            status_store,
            Arc::clone(&settings),
            Arc::clone(&logs),
        );
        let middleware = MiddlewareChain::new().wrap(Arc::new(filter));

        let server_store: Arc<dyn ServerConfigStore> = config_store;
        let composite = Arc::new(
            CompositeServer::create(
                "ns",
                "sess-1",
                false,
                &server_store,
                Arc::clone(&pool),
                middleware,
                Arc::clone(&logs),
            )
            .await
            .unwrap(),
        );

        Fixture {
            composite,
            pool,
            logs,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn merges_tools_with_prefixes_and_applies_filter() {
        let fx = fixture(false, &[("a", "y")]).await;

        let mut names: Vec<String> = fx
            .composite
            .list_tools_merged()
            .await
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["alpha__x".to_string(), "beta__z".to_string()]);

        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn call_forwards_original_name_to_owning_server() {
        let fx = fixture(false, &[]).await;

        let result = fx.composite.call_tool_routed("alpha__x", None).await.unwrap();
        let text = result.content[0].as_text().map(|t| t.text.clone()).unwrap();
        assert_eq!(text, "called:x", "downstream must receive the unprefixed name");

        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn inactive_tool_call_returns_error_result_not_transport_error() {
        let fx = fixture(false, &[("a", "y")]).await;

        let result = fx.composite.call_tool_routed("alpha__y", None).await.unwrap();
        assert_eq!(result.is_error, Some(true));
        let text = result.content[0].as_text().map(|t| t.text.clone()).unwrap();
        assert!(text.to_lowercase().contains("inactive"));

        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_prefix_is_a_distinct_error() {
        let fx = fixture(false, &[]).await;

        let err = fx.composite.call_tool_routed("gamma__q", None).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownTool(_)));

        let err = fx.composite.call_tool_routed("noprefix", None).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownTool(_)));

        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn failing_server_is_omitted_and_logged() {
        let fx = fixture(true, &[]).await;

        let names: Vec<String> = fx
            .composite
            .list_tools_merged()
            .await
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert!(names.contains(&"alpha__x".to_string()));
        assert!(names.iter().all(|n| !n.starts_with("beta__")));

        let logged = fx
            .logs
            .recent(50)
            .iter()
            .any(|e| e.level == crate::logstore::LogLevel::Error && e.server_name == "beta");
        assert!(logged, "the failing server must leave an error log entry");

        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn composite_cleanup_leaves_pool_clients_open() {
        let fx = fixture(false, &[]).await;

        fx.composite.call_tool_routed("alpha__x", None).await.unwrap();
        let alpha_config = fx
            .composite
            .servers
            .iter()
            .find(|s| s.uuid == "a")
            .unwrap()
            .config
            .clone();
        let client = fx
            .pool
            .get_session("sess-1", "a", &alpha_config)
            .await
            .unwrap();

        fx.composite.cleanup();
        assert!(fx.composite.is_closed());
        assert!(!client.is_closed(), "pool owns the back-end clients");

        fx.pool.shutdown().await;
    }
}
