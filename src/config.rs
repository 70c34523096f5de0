use std::{env, fs, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{error, info};

/// Key/value configuration source behind the orchestrator settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Environment-backed configuration, seeded from a `.env` file. Writes go to
/// the process environment and back into the file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("loaded .env from {}", env_file.display());
        } else {
            error!("could not load .env from {}", env_file.display());
        }
        Box::new(Self { env_file })
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = content
            .lines()
            .filter(|line| {
                line.split_once('=')
                    .is_none_or(|(k, _)| k.trim() != key)
            })
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        let _ = self.rewrite(key, None);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

/// Purely in-memory configuration, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Settings consumed by the engines themselves.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Package that short action names resolve against.
    pub default_package: String,
    /// Idle TTL for in-memory conversation contexts.
    pub session_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_package: "botflow".to_string(),
            session_ttl_secs: 3600,
        }
    }
}

impl OrchestratorConfig {
    pub async fn from_manager(manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        let default_package = manager
            .0
            .get("BOTFLOW_PACKAGE")
            .await
            .unwrap_or(defaults.default_package);
        let session_ttl_secs = manager
            .0
            .get("BOTFLOW_SESSION_TTL_SECS")
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.session_ttl_secs);
        Self {
            default_package,
            session_ttl_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));

        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_map_config_manager_as_vec() {
        let mgr = MapConfigManager::new();
        mgr.set("a", "1").await.unwrap();
        mgr.set("b", "2").await.unwrap();

        let mut config = mgr.as_vec().await;
        config.sort();
        assert_eq!(
            config,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_env_config_manager_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "BOTFLOW_TEST_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(
            mgr.get("BOTFLOW_TEST_KEY").await,
            Some("abc123".to_string())
        );

        mgr.del("BOTFLOW_TEST_KEY").await;
        assert_eq!(mgr.get("BOTFLOW_TEST_KEY").await, None);
    }

    #[tokio::test]
    async fn test_env_config_manager_set_writes_through() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        let mgr = EnvConfigManager::new(env_path.clone());

        mgr.set("BOTFLOW_WRITE_KEY", "v1").await.unwrap();
        let content = std::fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("BOTFLOW_WRITE_KEY=v1"));

        mgr.del("BOTFLOW_WRITE_KEY").await;
        let content = std::fs::read_to_string(&env_path).unwrap();
        assert!(!content.contains("BOTFLOW_WRITE_KEY"));
    }

    #[tokio::test]
    async fn test_orchestrator_config_defaults_and_overrides() {
        let mgr = ConfigManager(MapConfigManager::new());
        let config = OrchestratorConfig::from_manager(&mgr).await;
        assert_eq!(config.default_package, "botflow");
        assert_eq!(config.session_ttl_secs, 3600);

        mgr.0.set("BOTFLOW_PACKAGE", "mybot").await.unwrap();
        mgr.0.set("BOTFLOW_SESSION_TTL_SECS", "120").await.unwrap();
        let config = OrchestratorConfig::from_manager(&mgr).await;
        assert_eq!(config.default_package, "mybot");
        assert_eq!(config.session_ttl_secs, 120);
    }
}
