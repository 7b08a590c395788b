//! Configuration management for the jury replay recorder

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server for jury browsers and scoring-server callbacks
    #[serde(default)]
    pub server: ServerConfig,

    /// Event broker topics
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Recording and trimming
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Cameras, in declaration order (Camera1, Camera2, ...)
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Prefix of every topic the scoring server publishes
    #[serde(default = "default_topic_root")]
    pub topic_root: String,

    /// Platform (field of play) to follow; empty adopts the only announced one
    #[serde(default)]
    pub platform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Root of the published session directories
    #[serde(default = "default_video_dir")]
    pub video_dir: PathBuf,

    /// Where capture children write while an attempt is running
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Preparation kept before the clock stopped (ms)
    #[serde(default = "default_trim_lead_ms")]
    pub trim_lead_ms: u64,

    /// Delay between the referees' decision and finalize (ms)
    #[serde(default = "default_decision_delay_ms")]
    pub decision_delay_ms: u64,

    /// Grace given to a capture child after the stop token (ms)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Delay between the stop token and closing stdin (ms)
    #[serde(default = "default_stdin_close_delay_ms")]
    pub stdin_close_delay_ms: u64,

    /// Trim attempts before a camera is reported as failed
    #[serde(default = "default_trim_attempts")]
    pub trim_attempts: u32,

    /// Pause between trim attempts (ms)
    #[serde(default = "default_trim_retry_backoff_ms")]
    pub trim_retry_backoff_ms: u64,
}

/// One camera as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraEntry {
    /// ffmpeg input arguments, e.g. `["-f", "v4l2", "-i", "/dev/video0"]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<String>>,

    /// Pre-existing UDP multicast stream, e.g. `udp://239.255.0.1:9001`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast: Option<String>,

    /// Extra output arguments placed before the working file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_args: Vec<String>,

    /// Working container extension
    #[serde(default = "default_container")]
    pub container: String,

    /// Re-encode to H.264/yuv420p when trimming (stream copy otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recode_on_finalize: Option<bool>,
}

/// Where a camera's frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// Opaque ffmpeg input arguments
    Device(Vec<String>),
    /// A stream some other tool is already sending
    Multicast(String),
}

/// Container hints for the capture child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHints {
    pub container: String,
    pub output_args: Vec<String>,
}

/// A validated camera, immutable after startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    /// 1..=K in declaration order
    pub index: u32,
    pub input: InputSpec,
    pub hints: ContainerHints,
    pub recode_on_finalize: bool,
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8091
}

fn default_topic_root() -> String {
    "owlcms/fop".to_string()
}

fn default_video_dir() -> PathBuf {
    PathBuf::from("videos")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_trim_lead_ms() -> u64 {
    5000
}

fn default_decision_delay_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_stdin_close_delay_ms() -> u64 {
    100
}

fn default_trim_attempts() -> u32 {
    5
}

fn default_trim_retry_backoff_ms() -> u64 {
    1000
}

fn default_container() -> String {
    "mkv".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic_root: default_topic_root(),
            platform: String::new(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            video_dir: default_video_dir(),
            working_dir: None,
            ffmpeg_path: default_ffmpeg_path(),
            trim_lead_ms: default_trim_lead_ms(),
            decision_delay_ms: default_decision_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            stdin_close_delay_ms: default_stdin_close_delay_ms(),
            trim_attempts: default_trim_attempts(),
            trim_retry_backoff_ms: default_trim_retry_backoff_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            recording: RecordingConfig::default(),
            cameras: Vec::new(),
            config_path: None,
        }
    }
}

impl RecordingConfig {
    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .clone()
            .unwrap_or_else(|| self.video_dir.join(".capture"))
    }

    pub fn decision_delay(&self) -> Duration {
        Duration::from_millis(self.decision_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn stdin_close_delay(&self) -> Duration {
        Duration::from_millis(self.stdin_close_delay_ms)
    }

    pub fn trim_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.trim_retry_backoff_ms)
    }
}

impl CameraEntry {
    fn resolve(&self, index: u32) -> Result<CameraConfig> {
        let (input, default_recode) = match (&self.input, &self.multicast) {
            (Some(args), None) => {
                if args.is_empty() {
                    bail!("Camera{} has an empty input", index);
                }
                (InputSpec::Device(args.clone()), true)
            }
            (None, Some(url)) => {
                if url.trim().is_empty() {
                    bail!("Camera{} has an empty multicast address", index);
                }
                (InputSpec::Multicast(url.trim().to_string()), false)
            }
            (Some(_), Some(_)) => bail!("Camera{} sets both input and multicast", index),
            (None, None) => bail!("Camera{} needs either input or multicast", index),
        };

        let container = self.container.trim().trim_start_matches('.').to_string();
        if container.is_empty() {
            bail!("Camera{} has an empty container", index);
        }

        Ok(CameraConfig {
            index,
            input,
            hints: ContainerHints {
                container,
                output_args: self.output_args.clone(),
            },
            recode_on_finalize: self.recode_on_finalize.unwrap_or(default_recode),
        })
    }
}

impl Config {
    /// Load configuration from the given path, or from the default location.
    /// A missing default file is created with default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else if path.is_some() {
            bail!("Config file not found: {:?}", config_path)
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("org", "owlcms", "jury-replays")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Validate and number the cameras.
    ///
    /// Any error here is fatal at startup.
    pub fn cameras(&self) -> Result<Vec<CameraConfig>> {
        if self.cameras.is_empty() {
            bail!("No cameras configured");
        }
        self.cameras
            .iter()
            .enumerate()
            .map(|(i, entry)| entry.resolve(i as u32 + 1))
            .collect()
    }

    /// Check everything that must hold before the recorder can start
    pub fn validate(&self) -> Result<Vec<CameraConfig>> {
        if self.recording.video_dir.as_os_str().is_empty() {
            bail!("Video directory is not set");
        }
        if self.recording.ffmpeg_path.as_os_str().is_empty() {
            bail!("ffmpeg path is not set");
        }
        if self.recording.trim_attempts == 0 {
            bail!("trim_attempts must be at least 1");
        }
        self.cameras()
    }
}
