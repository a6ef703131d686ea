//! Configuration file management for worldmind.
//!
//! Provides a TOML config file at `~/.config/worldmind/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use worldmind_core::config::OrchestratorConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub store: StoreSection,
    pub dispatch: DispatchSection,
    pub model: ModelSection,
    pub orchestrator: OrchestratorSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Directory holding mission records. Defaults to the XDG data dir.
    pub dir: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// `local` or `remote`.
    pub provider: String,
    /// Worker image for the local provider.
    pub image: String,
    /// Extra flags passed to the container runtime.
    pub extra_flags: Vec<String>,
    /// Runner command for the remote provider.
    pub runner_command: Option<String>,
    /// Argument template for the remote runner.
    pub runner_args: Vec<String>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            provider: "local".to_owned(),
            image: "worldmind-worker:latest".to_owned(),
            extra_flags: Vec::new(),
            runner_command: None,
            runner_args: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Command that answers structured calls with JSON on stdout.
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            command: "worldmind-model".to_owned(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_parallel: usize,
    pub wave_cooldown_seconds: u64,
    pub review_score_threshold: u8,
    pub max_iterations: u32,
    pub worktrees_enabled: bool,
    pub strict_determinism: bool,
    pub task_timeout_seconds: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            max_parallel: defaults.max_parallel,
            wave_cooldown_seconds: defaults.wave_cooldown.as_secs(),
            review_score_threshold: defaults.review_score_threshold,
            max_iterations: defaults.max_iterations,
            worktrees_enabled: defaults.worktrees_enabled,
            strict_determinism: defaults.strict_determinism,
            task_timeout_seconds: defaults.task_timeout.as_secs(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the worldmind config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/worldmind` or
/// `~/.config/worldmind`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("worldmind");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("worldmind")
}

/// Return the path to the worldmind config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default mission-store directory: `$XDG_DATA_HOME/worldmind/missions`
/// or `~/.local/share/worldmind/missions`.
pub fn default_store_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("worldmind").join("missions");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("worldmind")
        .join("missions")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for pipeline wiring.
#[derive(Debug)]
pub struct WorldmindConfig {
    pub store_dir: PathBuf,
    pub dispatch: DispatchSection,
    pub model: ModelSection,
    pub orchestrator: OrchestratorConfig,
}

impl WorldmindConfig {
    /// Resolve configuration: CLI flag > env var > config file > default.
    pub fn resolve(cli_store_dir: Option<&str>, cli_max_parallel: Option<usize>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let store_dir = if let Some(dir) = cli_store_dir {
            PathBuf::from(dir)
        } else if let Ok(dir) = std::env::var("WORLDMIND_STORE_DIR") {
            PathBuf::from(dir)
        } else if let Some(ref dir) = file.store.dir {
            PathBuf::from(dir)
        } else {
            default_store_dir()
        };

        let section = file.orchestrator;
        let orchestrator = OrchestratorConfig {
            max_parallel: cli_max_parallel.unwrap_or(section.max_parallel),
            wave_cooldown: Duration::from_secs(section.wave_cooldown_seconds),
            review_score_threshold: section.review_score_threshold,
            max_iterations: section.max_iterations,
            worktrees_enabled: section.worktrees_enabled,
            strict_determinism: section.strict_determinism,
            skip_adds_to_completed: true,
            task_timeout: Duration::from_secs(section.task_timeout_seconds),
        };
        orchestrator.validate()?;

        Ok(Self {
            store_dir,
            dispatch: file.dispatch,
            model: file.model,
            orchestrator,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let original = ConfigFile::default();
        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.dispatch.provider, "local");
        assert_eq!(loaded.orchestrator.max_parallel, 4);
        assert_eq!(loaded.orchestrator.review_score_threshold, 6);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let loaded: ConfigFile = toml::from_str(
            r#"
            [orchestrator]
            max_parallel = 8
            "#,
        )
        .unwrap();
        assert_eq!(loaded.orchestrator.max_parallel, 8);
        assert_eq!(loaded.orchestrator.max_iterations, 3);
        assert_eq!(loaded.dispatch.image, "worldmind-worker:latest");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("worldmind/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn cli_flag_overrides_everything() {
        let config = WorldmindConfig::resolve(Some("/tmp/worldmind-store"), Some(9)).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/tmp/worldmind-store"));
        assert_eq!(config.orchestrator.max_parallel, 9);
    }
}
