//! Server configuration types and pool settings.
//!
//! `ServerConfig` is the immutable description of one back-end tool server.
//! Its `fingerprint()` hashes only the fields that affect the wire connection
//! and is the identity key the pools cache on.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a stdio child's stderr stream is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Captured line-by-line into the log store.
    #[default]
    Pipe,
    /// Passed through to the parent process stderr.
    Inherit,
    /// Discarded.
    Ignore,
}

/// OAuth token pair for HTTP transports. The access token takes precedence
/// over a plain bearer token when both are configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OauthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default)]
        stderr_mode: StderrMode,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth_tokens: Option<OauthTokens>,
    },
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oauth_tokens: Option<OauthTokens>,
    },
}

impl fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTransport::Stdio { command, args, .. } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .finish(),
            ServerTransport::Sse {
                url, bearer_token, ..
            } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("bearer_token", &bearer_token.as_ref().map(|_| "****"))
                .finish(),
            ServerTransport::StreamableHttp {
                url, bearer_token, ..
            } => f
                .debug_struct("StreamableHttp")
                .field("url", url)
                .field("bearer_token", &bearer_token.as_ref().map(|_| "****"))
                .finish(),
        }
    }
}

impl ServerTransport {
    fn kind(&self) -> &'static str {
        match self {
            ServerTransport::Stdio { .. } => "STDIO",
            ServerTransport::Sse { .. } => "SSE",
            ServerTransport::StreamableHttp { .. } => "STREAMABLE_HTTP",
        }
    }
}

/// Immutable description of one back-end MCP tool server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub uuid: String,
    pub name: String,
    #[serde(flatten)]
    pub transport: ServerTransport,
}

impl ServerConfig {
    /// The server name reduced to `[A-Za-z0-9_-]+` for use as a tool prefix.
    pub fn sanitized_name(&self) -> String {
        sanitize_name(&self.name)
    }

    /// SHA-256 over the canonical JSON form of the connection-relevant fields.
    ///
    /// Only the `uuid`, the transport kind, and — for stdio — command, args,
    /// and sorted env, or — for HTTP kinds — the URL participate. Auth
    /// material, display name, cwd, and stderr handling never change the
    /// fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical = match &self.transport {
            ServerTransport::Stdio {
                command, args, env, ..
            } => {
                let mut sorted_env: Vec<(&String, &String)> = env.iter().collect();
                sorted_env.sort_by_key(|(k, _)| *k);
                serde_json::json!({
                    "uuid": self.uuid,
                    "kind": self.transport.kind(),
                    "command": command,
                    "args": args,
                    "env": sorted_env,
                })
            }
            ServerTransport::Sse { url, .. } | ServerTransport::StreamableHttp { url, .. } => {
                serde_json::json!({
                    "uuid": self.uuid,
                    "kind": self.transport.kind(),
                    "url": url,
                })
            }
        };

        // serde_json's default map is ordered by key, so the serialized form
        // is stable across runs and field insertion order.
        use std::fmt::Write;
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        let mut out = String::with_capacity(64);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// Strip every character outside `[A-Za-z0-9_-]`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Runtime options recognized by the pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Rewrite `localhost`/`127.0.0.1` in HTTP URLs to `host.docker.internal`.
    #[serde(default)]
    pub transform_localhost: bool,

    /// Idle entries maintained per server and per namespace. Zero disables
    /// idle maintenance entirely.
    #[serde(default = "default_idle_count")]
    pub idle_count_per_server: usize,

    /// Filter cache entry lifetime in milliseconds.
    #[serde(default = "default_filter_cache_ttl_ms")]
    pub filter_cache_ttl_ms: u64,

    /// Bound on the in-memory log ring.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Connect attempts before a build is declared failed.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between connect attempts in milliseconds.
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    /// Message template used when a call targets an INACTIVE tool.
    /// `{name}` and `{reason}` are substituted.
    #[serde(default = "default_inactive_tool_message")]
    pub inactive_tool_message: String,
}

fn default_idle_count() -> usize {
    1
}

fn default_filter_cache_ttl_ms() -> u64 {
    1000
}

fn default_max_log_entries() -> usize {
    1000
}

fn default_connect_retries() -> u32 {
    3
}

fn default_connect_retry_delay_ms() -> u64 {
    5000
}

fn default_inactive_tool_message() -> String {
    "Tool \"{name}\" is currently inactive and disallowed in this namespace: {reason}".to_string()
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            transform_localhost: false,
            idle_count_per_server: default_idle_count(),
            filter_cache_ttl_ms: default_filter_cache_ttl_ms(),
            max_log_entries: default_max_log_entries(),
            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            inactive_tool_message: default_inactive_tool_message(),
        }
    }
}

impl PoolSettings {
    /// Load settings from recognized environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(v) = std::env::var("TRANSFORM_LOCALHOST_TO_DOCKER_INTERNAL") {
            settings.transform_localhost = v == "true";
        }
        if let Some(v) = env_parse("IDLE_COUNT_PER_SERVER") {
            settings.idle_count_per_server = v;
        }
        if let Some(v) = env_parse("FILTER_CACHE_TTL_MS") {
            settings.filter_cache_ttl_ms = v;
        }
        if let Some(v) = env_parse("MAX_LOG_ENTRIES") {
            settings.max_log_entries = v;
        }
        if let Some(v) = env_parse("CONNECT_RETRIES") {
            settings.connect_retries = v;
        }
        if let Some(v) = env_parse("CONNECT_RETRY_DELAY_MS") {
            settings.connect_retry_delay_ms = v;
        }

        settings
    }

    /// Load settings from a YAML file.
    pub async fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = tokio::fs::read_to_string(path).await?;
        let settings: Self = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    pub fn filter_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.filter_cache_ttl_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn render_inactive_message(&self, name: &str, reason: &str) -> String {
        self.inactive_tool_message
            .replace("{name}", name)
            .replace("{reason}", reason)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(uuid: &str, name: &str, args: Vec<&str>) -> ServerConfig {
        ServerConfig {
            uuid: uuid.to_string(),
            name: name.to_string(),
            transport: ServerTransport::Stdio {
                command: "mcp-server".to_string(),
                args: args.into_iter().map(String::from).collect(),
                env: HashMap::new(),
                cwd: None,
                stderr_mode: StderrMode::default(),
            },
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("alpha"), "alpha");
        assert_eq!(sanitize_name("my server (dev)"), "myserverdev");
        assert_eq!(sanitize_name("a_b-C3"), "a_b-C3");
        assert_eq!(sanitize_name("日本語"), "");
    }

    #[test]
    fn test_fingerprint_ignores_cosmetic_fields() {
        let a = stdio_config("u1", "alpha", vec!["--port", "3000"]);
        let mut b = a.clone();
        b.name = "renamed".to_string();
        if let ServerTransport::Stdio {
            cwd, stderr_mode, ..
        } = &mut b.transport
        {
            *cwd = Some("/tmp".to_string());
            *stderr_mode = StderrMode::Ignore;
        }
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_wire_fields() {
        let a = stdio_config("u1", "alpha", vec!["--port", "3000"]);
        let b = stdio_config("u1", "alpha", vec!["--port", "3001"]);
        let c = stdio_config("u2", "alpha", vec!["--port", "3000"]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_env_order_independent() {
        let mut env1 = HashMap::new();
        env1.insert("B".to_string(), "2".to_string());
        env1.insert("A".to_string(), "1".to_string());
        let mut env2 = HashMap::new();
        env2.insert("A".to_string(), "1".to_string());
        env2.insert("B".to_string(), "2".to_string());

        let mut a = stdio_config("u1", "alpha", vec![]);
        let mut b = stdio_config("u1", "alpha", vec![]);
        if let ServerTransport::Stdio { env, .. } = &mut a.transport {
            *env = env1;
        }
        if let ServerTransport::Stdio { env, .. } = &mut b.transport {
            *env = env2;
        }
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_http_ignores_auth() {
        let a = ServerConfig {
            uuid: "u1".to_string(),
            name: "remote".to_string(),
            transport: ServerTransport::Sse {
                url: "http://localhost:3000/sse".to_string(),
                bearer_token: Some("secret".to_string()),
                oauth_tokens: None,
            },
        };
        let mut b = a.clone();
        if let ServerTransport::Sse { bearer_token, .. } = &mut b.transport {
            *bearer_token = None;
        }
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_transport_yaml_stdio() {
        let yaml = r#"
uuid: "u1"
name: "fs"
kind: STDIO
command: "npx"
args: ["-y", "server-filesystem"]
env:
  VAR1: "value1"
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).expect("parse stdio");
        match &config.transport {
            ServerTransport::Stdio {
                command,
                args,
                env,
                stderr_mode,
                ..
            } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert_eq!(env.get("VAR1").unwrap(), "value1");
                assert_eq!(*stderr_mode, StderrMode::Pipe);
            }
            _ => panic!("expected stdio transport"),
        }
    }

    #[test]
    fn test_transport_yaml_streamable() {
        let yaml = r#"
uuid: "u2"
name: "remote"
kind: STREAMABLE_HTTP
url: "http://localhost:3000/mcp"
oauth_tokens:
  access_token: "at"
  refresh_token: "rt"
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).expect("parse streamable");
        match &config.transport {
            ServerTransport::StreamableHttp {
                url, oauth_tokens, ..
            } => {
                assert_eq!(url, "http://localhost:3000/mcp");
                assert_eq!(oauth_tokens.as_ref().unwrap().access_token, "at");
            }
            _ => panic!("expected streamable transport"),
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.idle_count_per_server, 1);
        assert_eq!(settings.filter_cache_ttl_ms, 1000);
        assert_eq!(settings.max_log_entries, 1000);
        assert_eq!(settings.connect_retries, 3);
        assert_eq!(settings.connect_retry_delay_ms, 5000);
        assert!(!settings.transform_localhost);
    }

    #[test]
    fn test_render_inactive_message() {
        let settings = PoolSettings::default();
        let msg = settings.render_inactive_message("alpha__y", "disabled");
        assert!(msg.contains("alpha__y"));
        assert!(msg.contains("inactive"));
        assert!(msg.contains("disabled"));
    }

    #[test]
    #[serial_test::serial]
    fn test_settings_from_env() {
        std::env::set_var("TRANSFORM_LOCALHOST_TO_DOCKER_INTERNAL", "true");
        std::env::set_var("IDLE_COUNT_PER_SERVER", "0");
        std::env::set_var("CONNECT_RETRIES", "5");

        let settings = PoolSettings::from_env();
        assert!(settings.transform_localhost);
        assert_eq!(settings.idle_count_per_server, 0);
        assert_eq!(settings.connect_retries, 5);

        std::env::remove_var("TRANSFORM_LOCALHOST_TO_DOCKER_INTERNAL");
        std::env::remove_var("IDLE_COUNT_PER_SERVER");
        std::env::remove_var("CONNECT_RETRIES");
    }
}
