//! Environment-variable configuration of the RPC client.
//!
//! Two variables steer the agent, each a semicolon-separated map. An entry
//! is either a bare value (the unqualified default) or `<path>,<value>`.
//! Resolution tries the instrumented module's full path first, then its
//! basename, then the default. Path comparison ignores ASCII case, matching
//! the host filesystem.

use std::env;

pub const ENV_RPC_INSTANCE_ID: &str = "SYZYGY_RPC_INSTANCE_ID";
pub const ENV_RPC_SESSION_MANDATORY: &str = "SYZYGY_RPC_SESSION_MANDATORY";

/// Endpoint base; a resolved instance id is appended as `-<id>`.
pub const RPC_ENDPOINT_BASE: &str = "calltrace-rpc";

/// Resolved client configuration for one instrumented module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub endpoint: String,
    pub session_mandatory: bool,
}

impl RpcConfig {
    /// Reads both environment variables and resolves them against
    /// `module_path`.
    pub fn from_env(module_path: &str) -> RpcConfig {
        RpcConfig::from_values(
            module_path,
            env::var(ENV_RPC_INSTANCE_ID).ok().as_deref(),
            env::var(ENV_RPC_SESSION_MANDATORY).ok().as_deref(),
        )
    }

    pub fn from_values(
        module_path: &str,
        instance_map: Option<&str>,
        mandatory_map: Option<&str>,
    ) -> RpcConfig {
        let id = instance_map.and_then(|map| lookup(map, module_path));
        let mandatory = mandatory_map
            .and_then(|map| lookup(map, module_path))
            .map(|v| v.trim() != "0")
            .unwrap_or(false);
        RpcConfig {
            endpoint: endpoint(id.as_deref()),
            session_mandatory: mandatory,
        }
    }
}

pub fn endpoint(instance_id: Option<&str>) -> String {
    match instance_id {
        Some(id) if !id.is_empty() => format!("{RPC_ENDPOINT_BASE}-{id}"),
        _ => RPC_ENDPOINT_BASE.to_owned(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Resolves one semicolon map against a module path: exact path, then
/// basename, then the unqualified default.
fn lookup(map: &str, module_path: &str) -> Option<String> {
    let module_base = basename(module_path);
    let mut by_basename = None;
    let mut default = None;
    for entry in map.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once(',') {
            Some((path, value)) => {
                let path = path.trim();
                let value = value.trim();
                if path.eq_ignore_ascii_case(module_path) {
                    return Some(value.to_owned());
                }
                if basename(path).eq_ignore_ascii_case(module_base) && by_basename.is_none() {
                    by_basename = Some(value.to_owned());
                }
            }
            None => {
                if default.is_none() {
                    default = Some(entry.to_owned());
                }
            }
        }
    }
    by_basename.or(default)
}
