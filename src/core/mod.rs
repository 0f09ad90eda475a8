//! Core pool infrastructure.

pub mod composite;
pub mod config;
pub mod connector;
pub mod filter;
pub mod invalidation;
pub mod mcp_pool;
pub mod meta_pool;
pub mod runtime;
pub mod warmup;

pub use composite::{CompositeServer, CompositeService};
pub use config::{
    sanitize_name, OauthTokens, PoolSettings, ServerConfig, ServerTransport, StderrMode,
};
pub use connector::{ConnectedClient, Connector};
pub use filter::{FilterCache, MiddlewareChain, StatusFilter, ToolFilterContext, ToolMiddleware};
pub use invalidation::InvalidationRouter;
pub use mcp_pool::{McpPool, McpPoolStatus};
pub use meta_pool::{openapi_session_id, MetaPool, MetaPoolStatus};
pub use runtime::PoolRuntime;
pub use warmup::StartupWarmer;
