use crate::domain::{config::SerialdConfig, error::{SerialdError, SerialdResult}};
use std::path::{Path, PathBuf};
use std::fs;

pub const CONFIG_FILE_NAME: &str = ".seriald.toml";

/// Environment variable overriding `server.addr`
pub const ADDR_ENV: &str = "SERIALD_ADDR";

/// Configuration manager
pub struct ConfigManager {
    explicit_path: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
}

impl ConfigManager {
    /// Use `explicit_path` when given, otherwise search the working
    /// directory and then the home directory.
    pub fn new(explicit_path: Option<PathBuf>) -> Self {
        let mut search_paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            search_paths.push(cwd.join(CONFIG_FILE_NAME));
        }
        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(CONFIG_FILE_NAME));
        }
        Self::with_search_paths(explicit_path, search_paths)
    }

    pub fn with_search_paths(explicit_path: Option<PathBuf>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            explicit_path,
            search_paths,
        }
    }

    /// File the configuration is read from, if any.
    pub fn config_path(&self) -> SerialdResult<Option<PathBuf>> {
        if let Some(path) = &self.explicit_path {
            if !path.is_file() {
                return Err(SerialdError::Config {
                    message: format!("Config file {} does not exist", path.display()),
                });
            }
            return Ok(Some(path.clone()));
        }
        Ok(self.search_paths.iter().find(|p| p.is_file()).cloned())
    }

    /// Load the configuration file (or defaults) and apply environment
    /// overrides.
    pub fn load_config(&self) -> SerialdResult<SerialdConfig> {
        let mut config = match self.config_path()? {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                self.load_config_from_path(&path)?
            }
            None => SerialdConfig::default(),
        };
        Self::apply_env_overrides(&mut config, std::env::var(ADDR_ENV).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(config: &mut SerialdConfig, addr: Option<String>) {
        if let Some(addr) = addr.filter(|a| !a.trim().is_empty()) {
            config.server.addr = addr;
        }
    }

    /// Load configuration from specific path
    pub fn load_config_from_path(&self, path: &Path) -> SerialdResult<SerialdConfig> {
        let content = fs::read_to_string(path).map_err(|e| SerialdError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        toml::from_str(&content).map_err(|e| SerialdError::Config {
            message: format!("Failed to parse config file {}: {}", path.display(), e),
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_files() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::with_search_paths(None, vec![dir.path().join(CONFIG_FILE_NAME)]);
        assert!(manager.config_path().unwrap().is_none());

        let config = manager.load_config_from_path(&dir.path().join("missing.toml"));
        assert!(matches!(config, Err(SerialdError::Config { .. })));
    }

    #[test]
    fn test_first_existing_search_path_wins() {
        let local = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let local_file = local.path().join(CONFIG_FILE_NAME);
        let home_file = home.path().join(CONFIG_FILE_NAME);
        fs::write(&home_file, "[server]\naddr = \"unix:/tmp/home.sock\"\n").unwrap();

        let manager = ConfigManager::with_search_paths(
            None,
            vec![local_file.clone(), home_file.clone()],
        );
        assert_eq!(manager.config_path().unwrap(), Some(home_file));

        fs::write(&local_file, "[server]\naddr = \"0.0.0.0:6000\"\n").unwrap();
        assert_eq!(manager.config_path().unwrap(), Some(local_file.clone()));
        let config = manager.load_config_from_path(&local_file).unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:6000");
        assert_eq!(config.server.buffer_size, 4096);
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::with_search_paths(Some(dir.path().join("nope.toml")), Vec::new());
        assert!(manager.config_path().is_err());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[server\naddr=").unwrap();
        let manager = ConfigManager::with_search_paths(Some(path), Vec::new());
        assert!(matches!(manager.load_config(), Err(SerialdError::Config { .. })));
    }

    #[test]
    fn test_env_override() {
        let mut config = SerialdConfig::default();
        ConfigManager::apply_env_overrides(&mut config, Some("  ".to_string()));
        assert_eq!(config.server.addr, "localhost:5000");
        ConfigManager::apply_env_overrides(&mut config, Some("unix:/run/seriald.sock".to_string()));
        assert_eq!(config.server.addr, "unix:/run/seriald.sock");
    }
}
