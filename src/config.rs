use std::{
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::{
    browser::LaunchOptions,
    recorder::RecorderSettings,
    router::{DEFAULT_LARGE_OBJECT_THRESHOLD_BYTES, RoutingPolicy},
};

pub const PROJECT_CONFIG_FILENAME: &str = "webreplay.toml";
pub const HOME_CONFIG_DIRNAME: &str = ".webreplay";
pub const HOME_CONFIG_FILENAME: &str = "config.toml";
const DEFAULT_STORAGE_PATH: &str = "./webreplay-data";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source: Option<ConfigSource>,
}

/// Where a loaded config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Project(PathBuf),
    Home(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::Explicit(path) | Self::Project(path) | Self::Home(path) => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(path) => write!(f, "--config {}", path.display()),
            Self::Project(path) => write!(f, "project ./{}", path.display()),
            Self::Home(path) => write!(f, "home {}", path.display()),
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads the explicit path when given, else the first of `./webreplay.toml` and
    /// `~/.webreplay/config.toml` that exists, else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let source = match explicit {
            Some(path) => Some(ConfigSource::Explicit(path.to_path_buf())),
            None => discover(),
        };
        let Some(source) = source else {
            return Ok(Self::default());
        };

        let mut config =
            Self::from_path(source.path()).with_context(|| format!("load config from {source}"))?;
        config.source = Some(source);
        Ok(config)
    }

    pub fn source(&self) -> Option<&ConfigSource> {
        self.source.as_ref()
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy {
            large_object_threshold_bytes: self.storage.large_object_threshold_bytes,
            max_inline_bytes_per_session: self
                .storage
                .max_inline_bytes_per_session
                .filter(|cap| *cap > 0),
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        let recorder = &self.recorder;
        RecorderSettings {
            navigation_timeout: Duration::from_millis(recorder.navigation_timeout_ms),
            settle_delay: Duration::from_millis(recorder.settle_delay_ms),
            stop_drain_timeout: Duration::from_millis(recorder.stop_drain_timeout_ms),
            launch: LaunchOptions {
                headless: recorder.headless,
                executable: recorder.browser_executable.clone(),
                event_buffer: recorder.event_buffer,
            },
            routing: self.routing_policy(),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.storage.large_object_threshold_bytes == 0 {
            bail!("`storage.large_object_threshold_bytes` must be greater than 0");
        }
        if self.storage.path.as_os_str().is_empty() {
            bail!("`storage.path` cannot be empty");
        }
        if self.recorder.navigation_timeout_ms == 0 {
            bail!("`recorder.navigation_timeout_ms` must be greater than 0");
        }
        if self.recorder.event_buffer == 0 {
            bail!("`recorder.event_buffer` must be greater than 0");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn discover() -> Option<ConfigSource> {
    let project = PathBuf::from(PROJECT_CONFIG_FILENAME);
    if project.is_file() {
        return Some(ConfigSource::Project(project));
    }
    let home = home_dir()?
        .join(HOME_CONFIG_DIRNAME)
        .join(HOME_CONFIG_FILENAME);
    home.is_file().then_some(ConfigSource::Home(home))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Holds `sessions.db` and the `blobs/` directory.
    pub path: PathBuf,
    pub large_object_threshold_bytes: u64,
    /// Off unless set; `0` also disables the cap.
    pub max_inline_bytes_per_session: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORAGE_PATH),
            large_object_threshold_bytes: DEFAULT_LARGE_OBJECT_THRESHOLD_BYTES,
            max_inline_bytes_per_session: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderConfig {
    pub navigation_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub stop_drain_timeout_ms: u64,
    pub event_buffer: usize,
    pub headless: bool,
    pub browser_executable: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let settings = RecorderSettings::default();
        Self {
            navigation_timeout_ms: settings.navigation_timeout.as_millis() as u64,
            settle_delay_ms: settings.settle_delay.as_millis() as u64,
            stop_drain_timeout_ms: settings.stop_drain_timeout.as_millis() as u64,
            event_buffer: settings.launch.event_buffer,
            headless: settings.launch.headless,
            browser_executable: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    use super::{Config, ConfigSource, LogFormat};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.storage.path, PathBuf::from("./webreplay-data"));
        assert_eq!(config.storage.large_object_threshold_bytes, 5 * 1024 * 1024);
        assert_eq!(config.routing_policy().max_inline_bytes_per_session, None);
        let settings = config.recorder_settings();
        assert_eq!(settings.navigation_timeout, Duration::from_secs(60));
        assert!(settings.launch.headless);
        assert!(config.logging.is_none());
        assert!(config.source().is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml_str(
            r#"
[server]
listen = "0.0.0.0:8080"

[storage]
path = "/var/lib/webreplay"
large_object_threshold_bytes = 1024
max_inline_bytes_per_session = 0

[recorder]
navigation_timeout_ms = 1500
settle_delay_ms = 250
stop_drain_timeout_ms = 100
event_buffer = 16
headless = false
browser_executable = "/usr/bin/chromium"

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen.port(), 8080);
        let policy = config.routing_policy();
        assert_eq!(policy.large_object_threshold_bytes, 1024);
        assert_eq!(policy.max_inline_bytes_per_session, None);

        let settings = config.recorder_settings();
        assert_eq!(settings.navigation_timeout, Duration::from_millis(1500));
        assert_eq!(settings.settle_delay, Duration::from_millis(250));
        assert_eq!(settings.launch.event_buffer, 16);
        assert!(!settings.launch.headless);
        assert_eq!(
            settings.launch.executable,
            Some(PathBuf::from("/usr/bin/chromium"))
        );
        assert_eq!(
            config.logging.as_ref().and_then(|logging| logging.format),
            Some(LogFormat::Pretty)
        );
    }

    #[test]
    fn unknown_keys_and_invalid_values_are_rejected() {
        let cases = [
            "[server]\nlisten = \"127.0.0.1:0\"\nextra = 1\n",
            "[storage]\nlarge_object_threshold_bytes = 0\n",
            "[recorder]\nevent_buffer = 0\n",
            "[server]\nlisten = \"not-an-address\"\n",
            "[proxy]\nlisten = \"127.0.0.1:0\"\n",
        ];
        for case in cases {
            assert!(Config::from_toml_str(case).is_err(), "case should fail:\n{case}");
        }
    }

    #[test]
    fn explicit_path_is_loaded_and_recorded_as_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[server]\nlisten = \"127.0.0.1:0\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.source(), Some(&ConfigSource::Explicit(path.clone())));
        assert_eq!(
            ConfigSource::Project(PathBuf::from("webreplay.toml")).to_string(),
            "project ./webreplay.toml"
        );

        std::fs::write(&path, "[server]\nlisten = 1\n").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(
            format!("{err:#}").contains("--config"),
            "unexpected error: {err:#}"
        );
    }
}
