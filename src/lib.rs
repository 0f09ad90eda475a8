//! Session and connection pooling core for a MetaMCP tool-server aggregator.
//!
//! A MetaMCP deployment fronts many back-end MCP tool servers behind named
//! virtual endpoints. This crate provides the warm, invalidation-aware
//! resource layer underneath that aggregation:
//!
//! - [`core::McpPool`]: one durable MCP client per back-end server, with a
//!   warm idle entry plus active per-session bindings.
//! - [`core::MetaPool`]: one composite MCP server per namespace, pooled the
//!   same way, including the deterministic OpenAPI sessions.
//! - [`core::CompositeServer`]: the aggregating server — `tools/list` by
//!   fan-out and merge, `tools/call` by server-prefix routing.
//! - [`core::StatusFilter`]: per-namespace ACTIVE/INACTIVE tool filtering
//!   with a short TTL cache.
//! - [`core::InvalidationRouter`]: translates store mutations into precise
//!   pool refreshes.
//!
//! Persistence, authentication, and HTTP framing live outside this crate;
//! the pools consume the [`store`] traits and produce the [`logstore`].

pub mod error;
pub mod logstore;
pub mod openapi;
pub mod store;

pub mod core;

#[cfg(test)]
mod testutil;

pub use self::core::{
    openapi_session_id, CompositeServer, CompositeService, ConnectedClient, Connector,
    FilterCache, InvalidationRouter, McpPool, McpPoolStatus, MetaPool, MetaPoolStatus,
    MiddlewareChain, OauthTokens, PoolRuntime, PoolSettings, ServerConfig, ServerTransport,
    StartupWarmer, StatusFilter, StderrMode, ToolFilterContext, ToolMiddleware,
};
pub use error::{PoolError, PoolResult};
pub use logstore::{LogEntry, LogLevel, LogStore};
pub use store::{
    MemoryConfigStore, MemoryToolStatusStore, NamespaceServer, NamespaceStore, ServerConfigStore,
    ToolStatus, ToolStatusStore,
};
