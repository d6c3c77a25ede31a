//! Layered configuration: env var override > `.aqua/config.yaml` > built-in
//! default, resolved field by field rather than as a whole-struct override.

use serde::Deserialize;
use std::path::Path;
use tracing::{error, warn};

const DEFAULT_LEADER_LEASE_SECONDS: u64 = 30;
const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 10;
const DEFAULT_AGENT_DEAD_THRESHOLD_SECONDS: u64 = 300;
const DEFAULT_TASK_CLAIM_TIMEOUT_SECONDS: u64 = 1800;
const DEFAULT_PRIORITY: i64 = 5;
const DEFAULT_MAX_RETRIES: i64 = 3;

/// `.aqua/config.yaml` — every field is an optional override.
#[derive(Debug, Deserialize, Default)]
struct YamlConfig {
    leader_lease_seconds: Option<u64>,
    heartbeat_interval_seconds: Option<u64>,
    agent_dead_threshold_seconds: Option<u64>,
    task_claim_timeout_seconds: Option<u64>,
    default_priority: Option<i64>,
    max_retries: Option<i64>,
}

fn load_yaml(project_root: &Path) -> Option<YamlConfig> {
    let path = project_root.join(".aqua").join("config.yaml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_yaml::from_str::<YamlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.yaml — using defaults for its fields");
            None
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| match v.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = %v, "ignoring non-numeric env override");
            None
        }
    })
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| match v.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = %v, "ignoring non-numeric env override");
            None
        }
    })
}

/// Resolved configuration for one invocation. Loaded once at startup — there
/// is no hot-reload, because each invocation is itself short-lived.
#[derive(Debug, Clone)]
pub struct AquaConfig {
    pub leader_lease_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub agent_dead_threshold_seconds: u64,
    pub task_claim_timeout_seconds: u64,
    pub default_priority: i64,
    pub max_retries: i64,
    /// `AQUA_JSON` — when set truthy, callers should render machine-readable output.
    pub json_output: bool,
    /// `AQUA_AGENT_ID` — overrides identity resolution entirely.
    pub agent_id_override: Option<String>,
    /// `AQUA_SESSION_ID` — overrides session-key derivation.
    pub session_id_override: Option<String>,
}

impl AquaConfig {
    /// Resolve configuration for `project_root`: env var > `config.yaml` > default,
    /// one field at a time.
    pub fn load(project_root: &Path) -> Self {
        let file = load_yaml(project_root).unwrap_or_default();

        Self {
            leader_lease_seconds: env_u64("AQUA_LEADER_LEASE_SECONDS")
                .or(file.leader_lease_seconds)
                .unwrap_or(DEFAULT_LEADER_LEASE_SECONDS),
            heartbeat_interval_seconds: env_u64("AQUA_HEARTBEAT_INTERVAL_SECONDS")
                .or(file.heartbeat_interval_seconds)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            agent_dead_threshold_seconds: env_u64("AQUA_AGENT_DEAD_THRESHOLD_SECONDS")
                .or(file.agent_dead_threshold_seconds)
                .unwrap_or(DEFAULT_AGENT_DEAD_THRESHOLD_SECONDS),
            task_claim_timeout_seconds: env_u64("AQUA_TASK_CLAIM_TIMEOUT_SECONDS")
                .or(file.task_claim_timeout_seconds)
                .unwrap_or(DEFAULT_TASK_CLAIM_TIMEOUT_SECONDS),
            default_priority: env_i64("AQUA_DEFAULT_PRIORITY")
                .or(file.default_priority)
                .unwrap_or(DEFAULT_PRIORITY),
            max_retries: env_i64("AQUA_MAX_RETRIES")
                .or(file.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            json_output: std::env::var("AQUA_JSON")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            agent_id_override: std::env::var("AQUA_AGENT_ID").ok(),
            session_id_override: std::env::var("AQUA_SESSION_ID").ok(),
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_no_file_and_no_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("AQUA_LEADER_LEASE_SECONDS");
        let dir = tempfile::tempdir().unwrap();
        let cfg = AquaConfig::load(dir.path());
        assert_eq!(cfg.leader_lease_seconds, 30);
        assert_eq!(cfg.agent_dead_threshold_seconds, 300);
        assert_eq!(cfg.max_retries, 3);
        assert!(!cfg.json_output);
    }

    #[test]
    fn yaml_file_overrides_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("AQUA_MAX_RETRIES");
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".aqua")).unwrap();
        std::fs::write(
            dir.path().join(".aqua").join("config.yaml"),
            "max_retries: 7\n",
        )
        .unwrap();
        let cfg = AquaConfig::load(dir.path());
        assert_eq!(cfg.max_retries, 7);
    }

    #[test]
    fn env_var_overrides_yaml_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".aqua")).unwrap();
        std::fs::write(
            dir.path().join(".aqua").join("config.yaml"),
            "max_retries: 7\n",
        )
        .unwrap();
        std::env::set_var("AQUA_MAX_RETRIES", "9");
        let cfg = AquaConfig::load(dir.path());
        assert_eq!(cfg.max_retries, 9);
        std::env::remove_var("AQUA_MAX_RETRIES");
    }

    #[test]
    fn json_output_env_var_is_truthy_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("AQUA_JSON", "true");
        assert!(AquaConfig::load(dir.path()).json_output);
        std::env::set_var("AQUA_JSON", "0");
        assert!(!AquaConfig::load(dir.path()).json_output);
        std::env::remove_var("AQUA_JSON");
    }
}
