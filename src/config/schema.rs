use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub debounce: DebounceConfig,

    #[serde(default)]
    pub reminders: ReminderConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Debounce ──────────────────────────────────────────────────────

/// Per-conversation message coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Quiet period after the last message before a burst is considered final.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Margin subtracted from the window before a caller re-checks the buffer.
    /// Must stay below `window_ms`.
    #[serde(default = "default_safety_margin_ms")]
    pub safety_margin_ms: u64,
    /// Mailbox depth for each per-conversation coordinator.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_window_ms() -> u64 {
    5_000
}

fn default_safety_margin_ms() -> u64 {
    500
}

fn default_mailbox_capacity() -> usize {
    64
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            safety_margin_ms: default_safety_margin_ms(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

// ── Reminders ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Shortest accepted reminder delay, in seconds.
    #[serde(default = "default_min_delay_secs")]
    pub min_delay_secs: u64,
    /// Longest accepted reminder delay, in seconds (30 days).
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Maximum pending reminders a single agent may hold.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_min_delay_secs() -> u64 {
    60
}

fn default_max_delay_secs() -> u64 {
    2_592_000
}

fn default_max_pending() -> usize {
    100
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: default_min_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_pending: default_max_pending(),
        }
    }
}

// ── Reliability ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// First restart delay for a crashed daemon component, in seconds.
    #[serde(default = "default_component_initial_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Restart delay ceiling, in seconds.
    #[serde(default = "default_component_max_backoff_secs")]
    pub component_max_backoff_secs: u64,
}

fn default_component_initial_backoff_secs() -> u64 {
    2
}

fn default_component_max_backoff_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            component_initial_backoff_secs: default_component_initial_backoff_secs(),
            component_max_backoff_secs: default_component_max_backoff_secs(),
        }
    }
}

// ── Observability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Loading / saving ──────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let burrow_dir = home.join(".burrow");
        Self::load_from(&burrow_dir)
    }

    /// Load from an explicit base directory. Creates the directory tree and a
    /// default config file on first use.
    pub fn load_from(base_dir: &Path) -> Result<Self> {
        let config_path = base_dir.join("config.toml");
        let workspace_dir = base_dir.join("workspace");

        if !base_dir.exists() {
            fs::create_dir_all(base_dir)
                .with_context(|| format!("Failed to create {}", base_dir.display()))?;
        }
        if !workspace_dir.exists() {
            fs::create_dir_all(&workspace_dir).context("Failed to create workspace directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path;
            config.workspace_dir = workspace_dir;
            config.apply_env_overrides();
            Ok(config)
        } else {
            let mut config = Config {
                config_path,
                workspace_dir,
                ..Config::default()
            };
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Workspace directory: BURROW_WORKSPACE
        if let Ok(workspace) = std::env::var("BURROW_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(shellexpand::tilde(&workspace).into_owned());
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let serialized = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(&self.config_path, serialized).context("Failed to write config file")?;
        Ok(())
    }

    /// Path of the sqlite database backing agents, reminders, and debounce
    /// checkpoints.
    pub fn store_db_path(&self) -> PathBuf {
        self.workspace_dir.join("state").join("burrow.db")
    }
}
