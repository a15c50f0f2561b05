use serde::Deserialize;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: PathBuf,
    /// Owner id stamped on locally created entities
    pub owner: String,
    /// Sync settings
    pub sync: SyncConfig,
}

/// Remote synchronization settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the sync server; sync is disabled when unset
    pub server_url: Option<String>,
    /// Bearer token for the sync server
    pub api_key: Option<String>,
    /// Run the background sync loop
    pub auto_sync: bool,
    /// Seconds between background pull cycles
    pub pull_interval_secs: u64,
    /// Entries per push batch
    pub push_batch_size: usize,
    /// Transient failures tolerated before an entry dead-letters
    pub max_retries: i64,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: home.join(".taskbingo").join("taskbingo.db"),
            owner: "default".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            auto_sync: true,
            pull_interval_secs: 300,
            push_batch_size: 50,
            max_retries: 10,
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("TASKBINGO_DATABASE_PATH") {
            config.database_path = PathBuf::from(db_path);
        }
        if let Ok(owner) = std::env::var("TASKBINGO_OWNER") {
            config.owner = owner;
        }
        if let Ok(server_url) = std::env::var("TASKBINGO_SERVER_URL") {
            config.sync.server_url = Some(server_url);
        }
        if let Ok(api_key) = std::env::var("TASKBINGO_API_KEY") {
            config.sync.api_key = Some(api_key);
        }

        Ok(config)
    }

    /// Default config file path: ~/.config/taskbingo/config.yaml
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        base.join("taskbingo").join("config.yaml")
    }

    /// Whether enough is configured to reach a sync server.
    pub fn sync_enabled(&self) -> bool {
        self.sync.server_url.is_some() && self.sync.api_key.is_some()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}
