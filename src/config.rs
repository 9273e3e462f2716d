use std::{
    env, fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

pub const PROJECT_CONFIG_FILE: &str = "reqbin.toml";
const HOME_CONFIG_DIR: &str = ".reqbin";
const HOME_CONFIG_FILE: &str = "config.toml";

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_DB_PATH: &str = "reqbin.db";
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_MAX_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source: Option<ConfigSource>,
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Override(PathBuf),
    Project(PathBuf),
    Home(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override(path) => write!(f, "override {}", path.display()),
            Self::Project(_) => write!(f, "project ./{PROJECT_CONFIG_FILE}"),
            Self::Home(path) => write!(f, "home {}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

impl Config {
    /// Loads the configuration, trying in order: `override_path`,
    /// `./reqbin.toml`, `$HOME/.reqbin/config.toml`, built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        let cwd = env::current_dir().context("resolve current directory")?;
        let home = env::var_os("HOME").map(PathBuf::from);
        Self::load_from(override_path, &cwd, home.as_deref())
    }

    fn load_from(
        override_path: Option<&Path>,
        cwd: &Path,
        home: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let source = discover_source(override_path, cwd, home);
        let mut config = match &source {
            ConfigSource::Override(path) | ConfigSource::Project(path) | ConfigSource::Home(path) => {
                Self::from_path(path).with_context(|| format!("load config from {source}"))?
            }
            ConfigSource::Defaults => Self::default(),
        };
        config
            .validate()
            .with_context(|| format!("invalid config from {source}"))?;
        config.source = Some(source);
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source(&self) -> Option<&ConfigSource> {
        self.source.as_ref()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.purge.interval_secs == 0 {
            bail!("`purge.interval_secs` must be greater than 0");
        }
        if self.server.max_body_bytes == 0 {
            bail!("`server.max_body_bytes` must be greater than 0");
        }
        if self.storage.path.as_os_str().is_empty() {
            bail!("`storage.path` cannot be empty");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

fn discover_source(override_path: Option<&Path>, cwd: &Path, home: Option<&Path>) -> ConfigSource {
    if let Some(path) = override_path {
        return ConfigSource::Override(path.to_path_buf());
    }

    let project = cwd.join(PROJECT_CONFIG_FILE);
    if project.is_file() {
        return ConfigSource::Project(project);
    }

    if let Some(home) = home {
        let home_config = home.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE);
        if home_config.is_file() {
            return ConfigSource::Home(home_config);
        }
    }

    ConfigSource::Defaults
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PurgeConfig {
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_PURGE_INTERVAL_SECS,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
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
