//! Tool status filtering.
//!
//! Resolves `(namespace, server, tool)` to ACTIVE/INACTIVE with a short TTL
//! cache, and wraps the composite server's `tools/list` and `tools/call`
//! handlers. Classification failures always fail open: a tool we cannot
//! classify stays visible and callable.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use rmcp::model::{CallToolResult, Content, Tool};
use tracing::warn;

use super::config::PoolSettings;
use crate::{
    logstore::{LogLevel, LogStore},
    store::{ToolStatus, ToolStatusStore},
};

/// Split a composite tool name on the first `"__"`. `None` means the name
/// carries no server prefix and is passed through unfiltered.
pub fn split_prefixed_name(name: &str) -> Option<(&str, &str)> {
    let (prefix, rest) = name.split_once("__")?;
    if prefix.is_empty() || rest.is_empty() {
        return None;
    }
    Some((prefix, rest))
}

struct CacheEntry {
    status: ToolStatus,
    expires_at: Instant,
}

/// TTL cache over tool status lookups, bulk-invalidatable per namespace.
pub struct FilterCache {
    ttl: Duration,
    entries: DashMap<(String, String, String), CacheEntry>,
}

impl FilterCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, namespace_uuid: &str, server_uuid: &str, tool_name: &str) -> Option<ToolStatus> {
        let key = (
            namespace_uuid.to_string(),
            server_uuid.to_string(),
            tool_name.to_string(),
        );
        let expired = match self.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.status),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(&key);
        }
        None
    }

    pub fn insert(&self, namespace_uuid: &str, server_uuid: &str, tool_name: &str, status: ToolStatus) {
        self.entries.insert(
            (
                namespace_uuid.to_string(),
                server_uuid.to_string(),
                tool_name.to_string(),
            ),
            CacheEntry {
                status,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every cached entry for one namespace.
    pub fn clear_namespace(&self, namespace_uuid: &str) {
        self.entries.retain(|key, _| key.0 != namespace_uuid);
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-composite context handed to middleware: which namespace this is and
/// how sanitized server names map back to server uuids.
#[derive(Debug, Clone, Default)]
pub struct ToolFilterContext {
    pub namespace_uuid: String,
    /// sanitized server name -> server uuid.
    pub server_by_prefix: std::collections::HashMap<String, String>,
}

/// Hook pair wrapped around the composite handlers.
///
/// `on_list` post-processes the merged tool list; `on_call` runs before
/// routing and may short-circuit with a finished result.
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    async fn on_list(&self, ctx: &ToolFilterContext, tools: Vec<Tool>) -> Vec<Tool> {
        let _ = ctx;
        tools
    }

    async fn on_call(&self, ctx: &ToolFilterContext, name: &str) -> Option<CallToolResult> {
        let _ = (ctx, name);
        None
    }
}

/// Right-to-left composition: the middleware added last is outermost. For
/// list responses the outermost hook sees the result last; for calls it runs
/// first.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn ToolMiddleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(mut self, middleware: Arc<dyn ToolMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub async fn apply_list(&self, ctx: &ToolFilterContext, mut tools: Vec<Tool>) -> Vec<Tool> {
        for middleware in &self.middlewares {
            tools = middleware.on_list(ctx, tools).await;
        }
        tools
    }

    pub async fn apply_call(&self, ctx: &ToolFilterContext, name: &str) -> Option<CallToolResult> {
        for middleware in self.middlewares.iter().rev() {
            if let Some(result) = middleware.on_call(ctx, name).await {
                return Some(result);
            }
        }
        None
    }
}

/// The ACTIVE/INACTIVE filter. Cache-first, store on miss.
pub struct StatusFilter {
    cache: Arc<FilterCache>,
    store: Arc<dyn ToolStatusStore>,
    settings: Arc<PoolSettings>,
    logs: Arc<LogStore>,
}

impl StatusFilter {
    pub fn new(
        cache: Arc<FilterCache>,
        store: Arc<dyn ToolStatusStore>,
        settings: Arc<PoolSettings>,
        logs: Arc<LogStore>,
    ) -> Self {
        Self {
            cache,
            store,
            settings,
            logs,
        }
    }

    async fn classify(&self, ctx: &ToolFilterContext, server_uuid: &str, tool_name: &str) -> ToolStatus {
        if let Some(status) = self.cache.get(&ctx.namespace_uuid, server_uuid, tool_name) {
            return status;
        }

        match self
            .store
            .status(&ctx.namespace_uuid, server_uuid, tool_name)
            .await
        {
            Ok(status) => {
                self.cache
                    .insert(&ctx.namespace_uuid, server_uuid, tool_name, status);
                status
            }
            Err(e) => {
                warn!(
                    namespace = %ctx.namespace_uuid,
                    server = %server_uuid,
                    tool = %tool_name,
                    error = %e,
                    "tool status lookup failed; allowing tool"
                );
                self.logs.add_with_error(
                    server_uuid,
                    LogLevel::Warn,
                    format!("status lookup failed for tool '{tool_name}'"),
                    Some(&e),
                );
                ToolStatus::Absent
            }
        }
    }
}

#[async_trait]
impl ToolMiddleware for StatusFilter {
    async fn on_list(&self, ctx: &ToolFilterContext, tools: Vec<Tool>) -> Vec<Tool> {
        let mut kept = Vec::with_capacity(tools.len());
        for tool in tools {
            let verdict = match split_prefixed_name(&tool.name) {
                Some((prefix, original)) => match ctx.server_by_prefix.get(prefix) {
                    Some(server_uuid) => self.classify(ctx, server_uuid, original).await,
                    None => ToolStatus::Absent,
                },
                None => ToolStatus::Absent,
            };
            if verdict != ToolStatus::Inactive {
                kept.push(tool);
            }
        }
        kept
    }

    async fn on_call(&self, ctx: &ToolFilterContext, name: &str) -> Option<CallToolResult> {
        let (prefix, original) = split_prefixed_name(name)?;
        let server_uuid = ctx.server_by_prefix.get(prefix)?;
        if self.classify(ctx, server_uuid, original).await != ToolStatus::Inactive {
            return None;
        }

        let message = self
            .settings
            .render_inactive_message(name, "marked INACTIVE in the namespace configuration");
        Some(CallToolResult::error(vec![Content::text(message)]))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::store::MemoryToolStatusStore;

    fn tool(name: &str) -> Tool {
        Tool {
            name: std::borrow::Cow::Owned(name.to_string()),
            title: None,
            description: None,
            input_schema: Arc::new(serde_json::Map::new()),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    fn test_ctx() -> ToolFilterContext {
        let mut server_by_prefix = HashMap::new();
        server_by_prefix.insert("alpha".to_string(), "a".to_string());
        ToolFilterContext {
            namespace_uuid: "ns".to_string(),
            server_by_prefix,
        }
    }

    fn test_filter(store: Arc<MemoryToolStatusStore>, ttl: Duration) -> StatusFilter {
        StatusFilter::new(
            Arc::new(FilterCache::new(ttl)),
            store,
            Arc::new(PoolSettings::default()),
            Arc::new(LogStore::new()),
        )
    }

    #[test]
    fn test_split_prefixed_name() {
        assert_eq!(split_prefixed_name("alpha__x"), Some(("alpha", "x")));
        assert_eq!(split_prefixed_name("alpha__x__y"), Some(("alpha", "x__y")));
        assert_eq!(split_prefixed_name("plain"), None);
        assert_eq!(split_prefixed_name("__x"), None);
        assert_eq!(split_prefixed_name("alpha__"), None);
    }

    #[test]
    fn test_cache_expiry_and_clear() {
        let cache = FilterCache::new(Duration::from_millis(30));
        cache.insert("ns", "a", "x", ToolStatus::Inactive);
        assert_eq!(cache.get("ns", "a", "x"), Some(ToolStatus::Inactive));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("ns", "a", "x"), None);
        assert!(cache.is_empty(), "expired entry must be purged on read");

        cache.insert("ns1", "a", "x", ToolStatus::Active);
        cache.insert("ns2", "a", "x", ToolStatus::Active);
        cache.clear_namespace("ns1");
        assert_eq!(cache.get("ns1", "a", "x"), None);
        assert_eq!(cache.get("ns2", "a", "x"), Some(ToolStatus::Active));
    }

    #[tokio::test]
    async fn test_list_drops_inactive_tools_only() {
        let store = Arc::new(MemoryToolStatusStore::new());
        store.set_inactive("ns", "a", "y");
        let filter = test_filter(store, Duration::from_secs(1));

        let tools = vec![
            tool("alpha__x"),
            tool("alpha__y"),
            tool("gamma__z"), // unmapped prefix: kept
            tool("noprefix"), // unparsable: kept
        ];
        let kept = filter.on_list(&test_ctx(), tools).await;
        let names: Vec<&str> = kept.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["alpha__x", "gamma__z", "noprefix"]);
    }

    #[tokio::test]
    async fn test_call_short_circuits_inactive() {
        let store = Arc::new(MemoryToolStatusStore::new());
        store.set_inactive("ns", "a", "y");
        let filter = test_filter(store, Duration::from_secs(1));

        let denied = filter.on_call(&test_ctx(), "alpha__y").await.expect("denied");
        assert_eq!(denied.is_error, Some(true));
        let text = denied.content[0].as_text().map(|t| t.text.clone()).unwrap();
        assert!(text.to_lowercase().contains("inactive"));

        assert!(filter.on_call(&test_ctx(), "alpha__x").await.is_none());
        assert!(filter.on_call(&test_ctx(), "noprefix").await.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let store = Arc::new(MemoryToolStatusStore::new());
        store.set_inactive("ns", "a", "y");
        store.set_failing(true);
        let filter = test_filter(store, Duration::from_secs(1));

        let kept = filter.on_list(&test_ctx(), vec![tool("alpha__y")]).await;
        assert_eq!(kept.len(), 1, "unclassifiable tools stay visible");
        assert!(filter.on_call(&test_ctx(), "alpha__y").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_serves_stale_within_ttl() {
        let store = Arc::new(MemoryToolStatusStore::new());
        store.set_inactive("ns", "a", "y");
        let filter = test_filter(Arc::clone(&store), Duration::from_secs(30));

        assert!(filter.on_call(&test_ctx(), "alpha__y").await.is_some());

        // Flipping the store does not show through until the TTL lapses.
        store.set_active("ns", "a", "y");
        assert!(filter.on_call(&test_ctx(), "alpha__y").await.is_some());
    }

    #[tokio::test]
    async fn test_chain_composition_order() {
        struct Tag(&'static str, Arc<parking_lot::Mutex<Vec<&'static str>>>);

        #[async_trait]
        impl ToolMiddleware for Tag {
            async fn on_list(&self, _ctx: &ToolFilterContext, tools: Vec<Tool>) -> Vec<Tool> {
                self.1.lock().push(self.0);
                tools
            }

            async fn on_call(&self, _ctx: &ToolFilterContext, _name: &str) -> Option<CallToolResult> {
                self.1.lock().push(self.0);
                None
            }
        }

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .wrap(Arc::new(Tag("inner", Arc::clone(&order))))
            .wrap(Arc::new(Tag("outer", Arc::clone(&order))));

        chain.apply_list(&test_ctx(), vec![]).await;
        assert_eq!(*order.lock(), vec!["inner", "outer"]);

        order.lock().clear();
        chain.apply_call(&test_ctx(), "alpha__x").await;
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }
}
