//! Shared fixtures for pool tests: a minimal `/bin/sh` MCP server speaking
//! newline-delimited JSON-RPC over stdio. Good enough for the handshake,
//! `tools/list`, and `tools/call`; `tools/call` answers with a text content
//! of `called:<tool>` so routing is observable.

use std::{collections::HashMap, fs, path::Path};

use crate::core::config::{ServerConfig, ServerTransport, StderrMode};

pub(crate) fn write_mock_server(
    dir: &Path,
    file_name: &str,
    tools: &[&str],
    fail_list: bool,
) -> String {
    let tools_json = tools
        .iter()
        .map(|name| {
            format!(
                r#"{{"name":"{name}","description":"{name} tool","inputSchema":{{"type":"object","properties":{{}}}}}}"#
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    let list_response = if fail_list {
        r#"printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32603,"message":"list exploded"}}\n' "$id""#
            .to_string()
    } else {
        format!(
            r#"printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{tools_json}]}}}}\n' "$id""#
        )
    };

    let script = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  name=$(printf '%s\n' "$line" | sed -n 's/.*"name"[ ]*:[ ]*"\([^"]*\)".*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"notifications/*)
      ;;
    *\"tools/list\"*)
      {list_response}
      ;;
    *\"tools/call\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"called:%s"}}]}}}}\n' "$id" "$name"
      ;;
  esac
done
"#
    );

    let path = dir.join(file_name);
    fs::write(&path, script).expect("write mock server script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).expect("stat mock script").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod mock script");
    }

    path.to_string_lossy().into_owned()
}

pub(crate) fn mock_server_config(uuid: &str, name: &str, script_path: &str) -> ServerConfig {
    ServerConfig {
        uuid: uuid.to_string(),
        name: name.to_string(),
        transport: ServerTransport::Stdio {
            command: "sh".to_string(),
            args: vec![script_path.to_string()],
            env: HashMap::new(),
            cwd: None,
            stderr_mode: StderrMode::Ignore,
        },
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub(crate) async fn wait_for(timeout: std::time::Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
