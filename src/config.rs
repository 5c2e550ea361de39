//! navlink configuration.
//!
//! Loaded from a YAML file with `${VAR}` / `${VAR:-default}` interpolation.
//! Every section and field is optional; omitted values take the defaults
//! below.
//!
//! ```yaml
//! server:
//!   command: navsim-server
//!   args: []
//!   env: { NAVSIM_SPEED: "1.0" }
//! client:
//!   tool_call_timeout_ms: 30000
//!   heartbeat_interval_ms: 30000
//! retry:
//!   max_retries: 5
//! logging:
//!   level: info
//!   json: false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::mcp_client::{BackoffConfig, ClientConfig, McpClientService, ServerConfig};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "NAVLINK_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavlinkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub retry: BackoffConfig,
    pub logging: LogConfig,
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Also write to `<data dir>/navlink/navlink.log` (rotated, last 3 kept).
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "navlink=info,warn".to_string(),
            json: false,
            file: false,
        }
    }
}

impl NavlinkConfig {
    /// Reject values that would make the client misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };

        if self.server.command.trim().is_empty() {
            return invalid("server.command must not be empty");
        }
        if self.client.connection_timeout_ms == 0 || self.client.tool_call_timeout_ms == 0 {
            return invalid("client timeouts must be greater than zero");
        }
        if self.client.heartbeat_enabled
            && (self.client.heartbeat_interval_ms == 0 || self.client.heartbeat_timeout_ms == 0)
        {
            return invalid("heartbeat interval and timeout must be greater than zero");
        }
        if self.client.heartbeat_max_failures == 0 {
            return invalid("client.heartbeat_max_failures must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be between 0.0 and 1.0");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        Ok(())
    }

    /// Build a client service from this configuration.
    pub fn build_client(&self) -> McpClientService {
        McpClientService::new(self.server.clone(), self.client.clone())
            .with_retry(self.retry.clone())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// 1. `NAVLINK_CONFIG` if set (must exist)
/// 2. `<config dir>/navlink/config.yaml` if present
///
/// Returns `None` when no file is configured; callers use defaults.
pub fn find_config_path() -> Result<Option<PathBuf>, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(expand_tilde(&explicit));
        if !path.exists() {
            return Err(ConfigError::Invalid {
                reason: format!("{CONFIG_ENV_VAR} points to missing file {}", path.display()),
            });
        }
        return Ok(Some(path));
    }

    Ok(dirs::config_dir()
        .map(|dir| dir.join("navlink").join("config.yaml"))
        .filter(|candidate| candidate.exists()))
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<NavlinkConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config = parse_config(&raw).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;

    tracing::debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Parse config text. Empty input yields the defaults.
pub fn parse_config(raw: &str) -> Result<NavlinkConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(NavlinkConfig::default());
    }

    let config: NavlinkConfig =
        serde_yaml::from_str(&interpolated).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

/// Load the explicit path, else the discovered file, else defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<NavlinkConfig, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => find_config_path()?,
    };
    match path {
        Some(p) => load_config(&p),
        None => Ok(NavlinkConfig::default()),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset without a default is empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__NAVLINK_TEST_UNSET__");
        assert_eq!(
            interpolate_env_vars("command: ${__NAVLINK_TEST_UNSET__:-navsim-server}"),
            "command: navsim-server"
        );
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__NAVLINK_TEST_SPEED__", "2.5");
        assert_eq!(
            interpolate_env_vars("speed: ${__NAVLINK_TEST_SPEED__:-0.5}"),
            "speed: 2.5"
        );
        std::env::remove_var("__NAVLINK_TEST_SPEED__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain: text";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/bin/navsim"), format!("{}/bin/navsim", home.display()));
        }
        assert_eq!(expand_tilde("/usr/bin/navsim"), "/usr/bin/navsim");
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(parse_config("").unwrap(), NavlinkConfig::default());
    }

    #[test]
    fn test_partial_config_merges_with_defaults() {
        let config = parse_config(
            r#"
server:
  command: /opt/nav/navsim-server
  env:
    NAVSIM_SPEED: "1.5"
client:
  heartbeat_interval_ms: 1000
retry:
  max_retries: 2
logging:
  json: true
"#,
        )
        .unwrap();

        assert_eq!(config.server.command, "/opt/nav/navsim-server");
        assert_eq!(config.server.env["NAVSIM_SPEED"], "1.5");
        assert_eq!(config.client.heartbeat_interval_ms, 1000);
        assert_eq!(config.client.tool_call_timeout_ms, 30_000);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "navlink=info,warn");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = parse_config("client:\n  heartbeat_max_failures: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = parse_config("retry:\n  jitter: 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = parse_config("server:\n  command: \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "client:\n  tool_call_timeout_ms: 1234").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.client.tool_call_timeout_ms, 1234);
    }

    #[test]
    fn test_load_config_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "client: [not, a, map]").unwrap();

        let err = load_config(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_config(Path::new("/nonexistent/navlink.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
