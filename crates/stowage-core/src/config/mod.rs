mod defaults;
mod types;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use stowage_types::error::{Result, StowageError};

pub use self::defaults::parse_size;
pub use self::types::*;

/// Where the configuration file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    CliArg(PathBuf),
    EnvVar(PathBuf),
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) | ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} (STOWAGE_CONFIG)", p.display()),
            ConfigSource::SearchOrder { path, level } => write!(f, "{} ({level})", path.display()),
        }
    }
}

/// Search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("stowage.yaml"), "project")];

    #[cfg(windows)]
    let user_config = dirs::config_dir().map(|base| base.join("stowage").join("config.yaml"));

    #[cfg(not(windows))]
    let user_config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|base| base.join("stowage").join("config.yaml"));

    if let Some(p) = user_config {
        paths.push((p, "user"));
    }

    #[cfg(windows)]
    paths.push((
        std::env::var_os("PROGRAMDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
            .join("stowage")
            .join("config.yaml"),
        "system",
    ));

    #[cfg(not(windows))]
    paths.push((PathBuf::from("/etc/stowage/config.yaml"), "system"));

    paths
}

/// Pick the configuration file: `--config`, then `STOWAGE_CONFIG`, then the
/// first existing search location.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }
    if let Ok(val) = std::env::var("STOWAGE_CONFIG") {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }
    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

/// Read, parse and validate a YAML configuration file.
pub fn load_config(path: &Path) -> Result<StowageConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        StowageError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let config = parse_config(&text).map_err(|e| match e {
        StowageError::Yaml(e) => {
            StowageError::Config(format!("invalid config '{}': {e}", path.display()))
        }
        other => other,
    })?;
    debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(text: &str) -> Result<StowageConfig> {
    let config: StowageConfig = serde_yaml::from_str(text)?;
    config.validate()?;
    Ok(config)
}
