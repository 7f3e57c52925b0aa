//! Configuration – reads/writes `~/.cubelink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cubelink_agent::AgentConfig;
use cubelink_controller::ControllerConfig;
use cubelink_types::CubeError;

/// Which side of the bus this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Host the bus and coordinate bridges.
    #[default]
    Broker,
    /// Join an existing broker and follow cube telemetry.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Broker => write!(f, "broker"),
            Role::Client => write!(f, "client"),
        }
    }
}

impl FromStr for Role {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broker" => Ok(Role::Broker),
            "client" => Ok(Role::Client),
            other => Err(CubeError::Config(format!("unknown role '{other}' (expected broker or client)"))),
        }
    }
}

/// Persisted configuration stored in `~/.cubelink/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub role: Role,

    /// WebSocket port the broker listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Broker URL used in the client role.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Client id presented to the broker in the client role.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Cubes each bridge may hold.
    #[serde(default = "default_bridge_capacity")]
    pub bridge_capacity: usize,

    /// Seconds a bridge may stay busy with an unacknowledged assignment.
    /// `0` disables the timeout.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Buffered presentation events per subscriber.
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
}

fn default_listen_port() -> u16 {
    1884
}
fn default_broker_url() -> String {
    "ws://localhost:1884".to_string()
}
fn default_client_id() -> String {
    "controller".to_string()
}
fn default_bridge_capacity() -> usize {
    4
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_reconnect_delay_secs() -> u64 {
    5
}
fn default_notify_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::default(),
            listen_port: default_listen_port(),
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            bridge_capacity: default_bridge_capacity(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            notify_capacity: default_notify_capacity(),
        }
    }
}

impl Config {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            bridge_capacity: self.bridge_capacity,
            handshake_timeout: (self.handshake_timeout_secs > 0)
                .then(|| Duration::from_secs(self.handshake_timeout_secs)),
            notify_capacity: self.notify_capacity,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            notify_capacity: self.notify_capacity,
        }
    }
}

/// Return the path to `~/.cubelink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cubelink").join("config.toml")
}

/// Load the config, writing the defaults first if the file does not exist.
/// Environment overrides are applied to the result.
pub fn load_or_create() -> Result<(Config, PathBuf), CubeError> {
    let path = config_path();
    let mut cfg = match load_from(&path)? {
        Some(cfg) => cfg,
        None => {
            let cfg = Config::default();
            save_to(&cfg, &path)?;
            cfg
        }
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, path))
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, CubeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| CubeError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| CubeError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `CUBELINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CUBELINK_ROLE` | `role` |
/// | `CUBELINK_LISTEN_PORT` | `listen_port` |
/// | `CUBELINK_BROKER_URL` | `broker_url` |
/// | `CUBELINK_CLIENT_ID` | `client_id` |
/// | `CUBELINK_BRIDGE_CAPACITY` | `bridge_capacity` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CUBELINK_ROLE")
        && let Ok(role) = v.parse::<Role>()
    {
        cfg.role = role;
    }
    if let Ok(v) = std::env::var("CUBELINK_LISTEN_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.listen_port = port;
    }
    if let Ok(v) = std::env::var("CUBELINK_BROKER_URL") {
        cfg.broker_url = v;
    }
    if let Ok(v) = std::env::var("CUBELINK_CLIENT_ID") {
        cfg.client_id = v;
    }
    if let Ok(v) = std::env::var("CUBELINK_BRIDGE_CAPACITY")
        && let Ok(capacity) = v.parse::<usize>()
    {
        cfg.bridge_capacity = capacity;
    }
}

/// Save the config to a specific path, creating the parent directory.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), CubeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CubeError::Config(format!("failed to create {}: {e}", parent.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| CubeError::Config(format!("failed to restrict {}: {e}", parent.display())))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| CubeError::Config(format!("failed to serialize config: {e}")))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| CubeError::Config(format!("failed to write {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| CubeError::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.role, Role::Broker);
        assert_eq!(cfg.listen_port, 1884);
        assert_eq!(cfg.broker_url, "ws://localhost:1884");
        assert_eq!(cfg.bridge_capacity, 4);
        assert_eq!(cfg.agent_config().reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.controller_config().handshake_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn zero_handshake_timeout_disables_it() {
        let cfg = Config {
            handshake_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(cfg.controller_config().handshake_timeout, None);
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Client".parse::<Role>().unwrap(), Role::Client);
        assert_eq!(" broker ".parse::<Role>().unwrap(), Role::Broker);
        assert!(matches!("bridge".parse::<Role>(), Err(CubeError::Config(_))));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "role = \"client\"\nbridge_capacity = 2\n").expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.role, Role::Client);
        assert_eq!(cfg.bridge_capacity, 2);
        assert_eq!(cfg.client_id, "controller");
        assert_eq!(cfg.notify_capacity, 256);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "listen_port = \"not a number\"").expect("write");
        assert!(matches!(load_from(&path), Err(CubeError::Config(_))));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = Config {
            role: Role::Client,
            broker_url: "ws://hub.local:9000".to_string(),
            handshake_timeout_secs: 0,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");
        assert_eq!(load_from(&path).expect("load ok"), Some(cfg));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_cubelink_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.cubelink/config.toml"));
    }

    #[test]
    fn env_override_changes_broker_url() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CUBELINK_BROKER_URL", "ws://robot-host:1884") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.broker_url, "ws://robot-host:1884");
        unsafe { std::env::remove_var("CUBELINK_BROKER_URL") };
    }

    #[test]
    fn env_override_changes_bridge_capacity() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CUBELINK_BRIDGE_CAPACITY", "8") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.bridge_capacity, 8);
        unsafe { std::env::remove_var("CUBELINK_BRIDGE_CAPACITY") };
    }

    #[test]
    fn env_override_ignores_invalid_port() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CUBELINK_LISTEN_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.listen_port, 1884);
        unsafe { std::env::remove_var("CUBELINK_LISTEN_PORT") };
    }
}
