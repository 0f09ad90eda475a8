//! Store interfaces consumed by the pools.
//!
//! Persistence lives outside this crate; the pools only see these traits.
//! The in-memory implementations back tests and small embedded deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{core::config::ServerConfig, error::PoolResult};

/// Per-namespace visibility of a server or tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Active,
    Inactive,
    /// No mapping row exists; callers treat this as active (fail-open).
    Absent,
}

#[async_trait]
pub trait ServerConfigStore: Send + Sync {
    async fn get_by_uuid(&self, uuid: &str) -> PoolResult<Option<ServerConfig>>;

    async fn list_all(&self) -> PoolResult<Vec<ServerConfig>>;

    /// Servers participating in a namespace, keyed by server uuid. When
    /// `include_inactive` is false, servers marked INACTIVE in the namespace
    /// are omitted.
    async fn list_by_namespace(
        &self,
        namespace_uuid: &str,
        include_inactive: bool,
    ) -> PoolResult<HashMap<String, ServerConfig>>;
}

#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn list_all(&self) -> PoolResult<Vec<String>>;

    async fn find_namespaces_containing_server(&self, server_uuid: &str)
        -> PoolResult<Vec<String>>;
}

#[async_trait]
pub trait ToolStatusStore: Send + Sync {
    async fn status(
        &self,
        namespace_uuid: &str,
        server_uuid: &str,
        tool_name: &str,
    ) -> PoolResult<ToolStatus>;
}

/// In-memory namespace membership row.
#[derive(Debug, Clone)]
pub struct NamespaceServer {
    pub server_uuid: String,
    pub active: bool,
}

/// In-memory `ServerConfigStore` + `NamespaceStore`.
#[derive(Default)]
pub struct MemoryConfigStore {
    servers: DashMap<String, ServerConfig>,
    namespaces: DashMap<String, Vec<NamespaceServer>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_server(&self, config: ServerConfig) {
        self.servers.insert(config.uuid.clone(), config);
    }

    pub fn remove_server(&self, uuid: &str) {
        self.servers.remove(uuid);
    }

    pub fn set_namespace(&self, namespace_uuid: &str, servers: Vec<NamespaceServer>) {
        self.namespaces.insert(namespace_uuid.to_string(), servers);
    }

    pub fn remove_namespace(&self, namespace_uuid: &str) {
        self.namespaces.remove(namespace_uuid);
    }
}

#[async_trait]
impl ServerConfigStore for MemoryConfigStore {
    async fn get_by_uuid(&self, uuid: &str) -> PoolResult<Option<ServerConfig>> {
        Ok(self.servers.get(uuid).map(|c| c.clone()))
    }

    async fn list_all(&self) -> PoolResult<Vec<ServerConfig>> {
        Ok(self.servers.iter().map(|e| e.value().clone()).collect())
    }

    async fn list_by_namespace(
        &self,
        namespace_uuid: &str,
        include_inactive: bool,
    ) -> PoolResult<HashMap<String, ServerConfig>> {
        let Some(members) = self.namespaces.get(namespace_uuid) else {
            return Ok(HashMap::new());
        };

        let mut out = HashMap::new();
        for member in members.iter() {
            if !member.active && !include_inactive {
                continue;
            }
            if let Some(config) = self.servers.get(&member.server_uuid) {
                out.insert(member.server_uuid.clone(), config.clone());
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl NamespaceStore for MemoryConfigStore {
    async fn list_all(&self) -> PoolResult<Vec<String>> {
        Ok(self.namespaces.iter().map(|e| e.key().clone()).collect())
    }

    async fn find_namespaces_containing_server(
        &self,
        server_uuid: &str,
    ) -> PoolResult<Vec<String>> {
        Ok(self
            .namespaces
            .iter()
            .filter(|e| e.value().iter().any(|m| m.server_uuid == server_uuid))
            .map(|e| e.key().clone())
            .collect())
    }
}

/// In-memory `ToolStatusStore`. Rows absent from the map report `Absent`.
#[derive(Default)]
pub struct MemoryToolStatusStore {
    inactive: DashMap<(String, String), HashSet<String>>,
    /// When set, every query fails; used to exercise fail-open paths.
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryToolStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_inactive(&self, namespace_uuid: &str, server_uuid: &str, tool_name: &str) {
        self.inactive
            .entry((namespace_uuid.to_string(), server_uuid.to_string()))
            .or_default()
            .insert(tool_name.to_string());
    }

    pub fn set_active(&self, namespace_uuid: &str, server_uuid: &str, tool_name: &str) {
        if let Some(mut set) = self
            .inactive
            .get_mut(&(namespace_uuid.to_string(), server_uuid.to_string()))
        {
            set.remove(tool_name);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl ToolStatusStore for MemoryToolStatusStore {
    async fn status(
        &self,
        namespace_uuid: &str,
        server_uuid: &str,
        tool_name: &str,
    ) -> PoolResult<ToolStatus> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(crate::error::PoolError::Store(
                "tool status store unavailable".to_string(),
            ));
        }

        let key = (namespace_uuid.to_string(), server_uuid.to_string());
        match self.inactive.get(&key) {
            Some(set) if set.contains(tool_name) => Ok(ToolStatus::Inactive),
            _ => Ok(ToolStatus::Absent),
        }
    }
}
