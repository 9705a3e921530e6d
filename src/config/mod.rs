//! Configuration Management
//!
//! Provides functionality for:
//! - Loading/saving the node configuration (YAML)
//! - Configuration validation
//! - Default configuration matching the stock Pi deployment

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::types::{Node, Role};

const CONFIG_FILE_NAME: &str = "screensync.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node identity section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_role")]
    pub role: Role,
    /// Node id, defaults to `<role>-<hostname>`
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Whether a Brain also drives a screen
    #[serde(default = "default_true")]
    pub displays: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address; on a Client this is the Brain
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Capacity of the outgoing request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Media player executable
    #[serde(default = "default_player_program")]
    pub program: String,
    /// Arguments; `{path}` and `{offset}` are substituted per playback
    #[serde(default = "default_player_args")]
    pub args: Vec<String>,
    /// Extra arguments appended when looping the idle asset
    #[serde(default = "default_loop_args")]
    pub loop_args: Vec<String>,
}

/// Still images shown on a spare console while no video covers the screen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackdropConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Image viewer executable
    #[serde(default = "default_backdrop_program")]
    pub program: String,
    /// Arguments placed before the image paths
    #[serde(default = "default_backdrop_args")]
    pub args: Vec<String>,
    #[serde(default = "default_backdrop_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Mount point of the removable media
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
    /// Block device to mount when the mount point is not mounted yet
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Lowercase file extensions recognised as videos
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub player: PlayerConfig,
    /// Loop asset 0 while idle
    #[serde(default = "default_true")]
    pub idle_loop: bool,
    #[serde(default)]
    pub backdrop: BackdropConfig,
}

/// Timeout and poll interval of one readiness condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl ConditionConfig {
    pub const fn new(timeout_secs: u64, poll_interval_secs: u64) -> Self {
        Self {
            timeout_secs,
            poll_interval_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_mount_condition")]
    pub mount: ConditionConfig,
    #[serde(default = "default_display_condition")]
    pub display: ConditionConfig,
    #[serde(default = "default_network_condition")]
    pub network: ConditionConfig,
    #[serde(default = "default_broker_condition")]
    pub broker: ConditionConfig,
    #[serde(default = "default_internet_condition")]
    pub internet: ConditionConfig,
    /// Fail startup when the display never comes up
    #[serde(default = "default_true")]
    pub display_required: bool,
    /// Sockets whose presence means the display server is up
    #[serde(default = "default_display_sockets")]
    pub display_sockets: Vec<PathBuf>,
    /// Process names whose presence means the display server is up
    #[serde(default = "default_display_processes")]
    pub display_processes: Vec<String>,
    /// Interface that must hold a routable address before the network
    /// counts as up; any interface when unset
    #[serde(default)]
    pub network_interface: Option<String>,
    /// `host:port` probed to decide whether the internet is reachable
    #[serde(default = "default_internet_probe")]
    pub internet_probe: String,
    /// Mount table consulted by the mount watcher
    #[serde(default = "default_mounts_table")]
    pub mounts_table: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Working copy to keep in step with the remote
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Silence after which the Brain forgets a node
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_control_bind")]
    pub bind: String,
    /// Offset used when a play request does not name one
    #[serde(default = "default_offset")]
    pub default_offset_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory receiving the JSON log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// Number of log files to keep
    #[serde(default = "default_log_files")]
    pub files_to_keep: usize,
    #[serde(default = "default_true")]
    pub console: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            role: default_role(),
            id: None,
            hostname: None,
            displays: default_true(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive_secs: default_keep_alive(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            program: default_player_program(),
            args: default_player_args(),
            loop_args: default_loop_args(),
        }
    }
}

impl Default for BackdropConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_backdrop_program(),
            args: default_backdrop_args(),
            extensions: default_backdrop_extensions(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            device: None,
            extensions: default_extensions(),
            player: PlayerConfig::default(),
            idle_loop: default_true(),
            backdrop: BackdropConfig::default(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            mount: default_mount_condition(),
            display: default_display_condition(),
            network: default_network_condition(),
            broker: default_broker_condition(),
            internet: default_internet_condition(),
            display_required: default_true(),
            display_sockets: default_display_sockets(),
            display_processes: default_display_processes(),
            network_interface: None,
            internet_probe: default_internet_probe(),
            mounts_table: default_mounts_table(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            repo_dir: default_repo_dir(),
            remote: default_remote(),
            branch: default_branch(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_control_bind(),
            default_offset_secs: default_offset(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            files_to_keep: default_log_files(),
            console: default_true(),
        }
    }
}

// Default value functions
fn default_role() -> Role { Role::Client }
fn default_true() -> bool { true }
fn default_broker_host() -> String { "192.168.50.1".to_string() }
fn default_broker_port() -> u16 { 1883 }
fn default_keep_alive() -> u64 { 30 }
fn default_backoff_initial() -> u64 { 500 }
fn default_backoff_max() -> u64 { 30_000 }
fn default_request_capacity() -> usize { 64 }
fn default_player_program() -> String { "cvlc".to_string() }
fn default_player_args() -> Vec<String> {
    ["--no-audio", "--fullscreen", "--no-osd", "--play-and-exit", "--start-time={offset}", "{path}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_loop_args() -> Vec<String> { vec!["--loop".to_string()] }
fn default_backdrop_program() -> String { "fbi".to_string() }
fn default_backdrop_args() -> Vec<String> {
    ["-T", "2", "-a", "--noverbose"].iter().map(|s| s.to_string()).collect()
}
fn default_backdrop_extensions() -> Vec<String> { vec!["jpg".to_string()] }
fn default_mount_point() -> PathBuf { PathBuf::from("/media/usb") }
fn default_extensions() -> Vec<String> {
    ["mp4", "mov", "avi", "mkv", "flv", "wmv", "webm", "mpeg", "mpg", "ts"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_mount_condition() -> ConditionConfig { ConditionConfig::new(30, 1) }
fn default_display_condition() -> ConditionConfig { ConditionConfig::new(60, 1) }
fn default_network_condition() -> ConditionConfig { ConditionConfig::new(60, 2) }
fn default_broker_condition() -> ConditionConfig { ConditionConfig::new(120, 2) }
fn default_internet_condition() -> ConditionConfig { ConditionConfig::new(20, 2) }
fn default_display_sockets() -> Vec<PathBuf> { vec![PathBuf::from("/tmp/.X11-unix/X0")] }
fn default_display_processes() -> Vec<String> {
    ["Xorg", "Xwayland", "labwc", "wayfire"].iter().map(|s| s.to_string()).collect()
}
fn default_internet_probe() -> String { "github.com:443".to_string() }
fn default_mounts_table() -> PathBuf { PathBuf::from("/proc/mounts") }
fn default_repo_dir() -> PathBuf { PathBuf::from("/home/pi/screensync") }
fn default_remote() -> String { "origin".to_string() }
fn default_branch() -> String { "main".to_string() }
fn default_heartbeat_interval() -> u64 { 3 }
fn default_heartbeat_timeout() -> u64 { 10 }
fn default_control_bind() -> String { "0.0.0.0:5000".to_string() }
fn default_offset() -> f64 { 5.0 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> PathBuf { PathBuf::from("logs") }
fn default_log_files() -> usize { 7 }

impl NodeConfig {
    /// Load configuration, trying the explicit path first and then the
    /// usual locations. Falls back to defaults when nothing is found.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        for path in Self::search_paths() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("screensync").join("config.yml"));
        }
        paths.push(PathBuf::from("/etc/screensync/config.yml"));
        paths
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file, atomically via a temporary file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml).map_err(write_err)?;
        fs::rename(&temp_path, path).map_err(write_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.node.id {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("node.id must not be empty".into()));
            }
            if id.contains(['/', '+', '#']) {
                return Err(ConfigError::Invalid(format!(
                    "node.id '{}' must not contain topic separators or wildcards",
                    id
                )));
            }
        }

        let conditions = [
            ("mount", &self.readiness.mount),
            ("display", &self.readiness.display),
            ("network", &self.readiness.network),
            ("broker", &self.readiness.broker),
            ("internet", &self.readiness.internet),
        ];
        for (name, condition) in conditions {
            if condition.poll_interval_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "readiness.{}.poll_interval_secs must be positive",
                    name
                )));
            }
            if condition.poll_interval_secs > condition.timeout_secs {
                return Err(ConfigError::Invalid(format!(
                    "readiness.{}: poll interval exceeds timeout",
                    name
                )));
            }
        }

        if self.broker.backoff_initial_ms == 0 || self.broker.backoff_max_ms < self.broker.backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "broker backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.broker.request_capacity == 0 {
            return Err(ConfigError::Invalid("broker.request_capacity must be positive".into()));
        }

        if self.media.extensions.is_empty()
            || self.media.extensions.iter().any(|e| e.is_empty() || e.starts_with('.'))
        {
            return Err(ConfigError::Invalid(
                "media.extensions must be non-empty and listed without leading dots".into(),
            ));
        }
        if self.media.player.program.trim().is_empty() {
            return Err(ConfigError::Invalid("media.player.program must be set".into()));
        }

        if self.heartbeat.interval_secs == 0 || self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            return Err(ConfigError::Invalid(
                "heartbeat timeout must be longer than its interval".into(),
            ));
        }

        if !self.control.default_offset_secs.is_finite() || self.control.default_offset_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "control.default_offset_secs must be a non-negative number".into(),
            ));
        }

        Ok(())
    }

    /// Resolved identity of this node
    pub fn node(&self) -> Node {
        Node::resolve(
            self.node.role,
            self.node.id.as_deref(),
            self.node.hostname.as_deref(),
        )
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker.host, self.broker.port)
    }
}
