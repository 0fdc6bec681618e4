//! Configuration loader with tier-based merging.
//!
//! Tiers, lowest to highest priority:
//! 1. built-in defaults
//! 2. project file `./taskhub/config.yaml`
//! 3. user file `~/.taskhub/config.yaml`
//! 4. environment variables
//!
//! An explicit file (`--config` or `TASKHUB_CONFIG_PATH`) replaces tiers 2 and 3.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults = 0,
    Project = 1,
    User = 2,
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration directories from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var("TASKHUB_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".taskhub")));

        let project_dir = std::env::var("TASKHUB_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("taskhub")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Paths with no discovery, for tests.
    pub fn none() -> Self {
        Self {
            project_dir: None,
            user_dir: None,
        }
    }
}

/// Loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Config,
    /// Files merged into the configuration, in tier order.
    sources: Vec<(ConfigTier, PathBuf)>,
}

impl ConfigLoader {
    /// Load configuration from all tiers, honouring an explicit file if given.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("TASKHUB_CONFIG_PATH").ok().map(PathBuf::from));
        Self::load_with(explicit.as_deref(), &ConfigPaths::discover(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Load configuration with explicit paths and environment lookup.
    pub fn load_with<F>(explicit: Option<&Path>, paths: &ConfigPaths, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layers: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut sources = Vec::new();

        if let Some(path) = explicit {
            layers.push(read_yaml(path)?);
            sources.push((ConfigTier::Project, path.to_path_buf()));
        } else {
            let tiers = [
                (ConfigTier::Project, paths.project_dir.as_ref()),
                (ConfigTier::User, paths.user_dir.as_ref()),
            ];
            for (tier, dir) in tiers {
                let Some(dir) = dir else { continue };
                let file = dir.join("config.yaml");
                if !file.exists() {
                    continue;
                }
                match read_yaml(&file) {
                    Ok(value) => {
                        debug!(tier = %tier, path = %file.display(), "Loaded config tier");
                        layers.push(value);
                        sources.push((tier, file));
                    }
                    Err(e) => warn!(path = %file.display(), error = %e, "Ignoring unreadable config file"),
                }
            }
        }

        let merged = deep_merge_all(layers);
        let mut config: Config =
            serde_json::from_value(merged).context("invalid configuration")?;
        apply_env_overrides(&mut config, env)?;

        Ok(Self { config, sources })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn sources(&self) -> &[(ConfigTier, PathBuf)] {
        &self.sources
    }
}

fn read_yaml(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(value)
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))
}

/// Apply the environment tier on top of the merged file configuration.
pub fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("SERVER_HOST") {
        config.server.host = v;
    }
    if let Some(v) = get("SERVER_PORT") {
        config.server.port = parse_env("SERVER_PORT", &v)?;
    }

    if let Some(v) = get("DATABASE_TYPE") {
        config.database.database_type = parse_env("DATABASE_TYPE", &v)?;
    }
    if let Some(v) = get("DATABASE_PATH") {
        config.database.path = PathBuf::from(v);
    }
    if let Some(v) = get("DB_POOL_SIZE") {
        config.database.pool.pool_size = parse_env("DB_POOL_SIZE", &v)?;
    }
    if let Some(v) = get("DB_MAX_OVERFLOW") {
        config.database.pool.max_overflow = parse_env("DB_MAX_OVERFLOW", &v)?;
    }
    if let Some(v) = get("DB_POOL_RECYCLE") {
        config.database.pool.recycle_seconds = parse_env("DB_POOL_RECYCLE", &v)?;
    }

    if let Some(v) = get("AUTH_PROVIDER") {
        config.auth.provider = parse_env("AUTH_PROVIDER", &v)?;
    }
    if let Some(v) = get("JWT_SECRET_KEY") {
        config.auth.jwt_secret_key = Some(v);
    }
    if let Some(v) = get("JWT_ISSUER") {
        config.auth.jwt_issuer = v;
    }
    if let Some(v) = get("KEYCLOAK_URL") {
        config.auth.keycloak.url = Some(v);
    }
    if let Some(v) = get("KEYCLOAK_REALM") {
        config.auth.keycloak.realm = Some(v);
    }
    if let Some(v) = get("KEYCLOAK_CLIENT_ID") {
        config.auth.keycloak.client_id = Some(v);
    }
    if let Some(v) = get("KEYCLOAK_PUBLIC_KEY") {
        config.auth.keycloak.public_key = Some(v);
    }
    if let Some(v) = get("SUPABASE_URL") {
        config.auth.supabase.url = Some(v);
    }
    if let Some(v) = get("SUPABASE_JWT_SECRET") {
        config.auth.supabase.jwt_secret = Some(v);
    }

    if let Some(v) = get("CACHE_BACKEND") {
        config.cache.backend = parse_env("CACHE_BACKEND", &v)?;
    }
    if let Some(v) = get("REDIS_HOST") {
        config.cache.redis_host = v;
        // Setting a host without a backend implies redis
        if get("CACHE_BACKEND").is_none() {
            config.cache.backend = super::types::CacheBackendKind::Redis;
        }
    }
    if let Some(v) = get("REDIS_PORT") {
        config.cache.redis_port = parse_env("REDIS_PORT", &v)?;
    }
    if let Some(v) = get("REDIS_DB") {
        config.cache.redis_db = parse_env("REDIS_DB", &v)?;
    }
    if let Some(v) = get("REDIS_PASSWORD") {
        config.cache.redis_password = Some(v);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthProviderKind, CacheBackendKind};
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_files_or_env() {
        let loader = ConfigLoader::load_with(None, &ConfigPaths::none(), |_| None).unwrap();
        assert_eq!(loader.config().server.port, 8000);
        assert!(loader.sources().is_empty());
    }

    #[test]
    fn project_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "server:\n  port: 9100\ndatabase:\n  pool:\n    pool_size: 2\n",
        )
        .unwrap();
        let paths = ConfigPaths {
            project_dir: Some(dir.path().to_path_buf()),
            user_dir: None,
        };
        let loader = ConfigLoader::load_with(None, &paths, |_| None).unwrap();
        let config = loader.config();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.database.pool.pool_size, 2);
        // untouched siblings keep defaults
        assert_eq!(config.database.pool.max_overflow, 10);
        assert_eq!(loader.sources()[0].0, ConfigTier::Project);
    }

    #[test]
    fn user_tier_beats_project_tier() {
        let project = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("config.yaml"), "server:\n  port: 1\n").unwrap();
        std::fs::write(user.path().join("config.yaml"), "server:\n  port: 2\n").unwrap();
        let paths = ConfigPaths {
            project_dir: Some(project.path().to_path_buf()),
            user_dir: Some(user.path().to_path_buf()),
        };
        let loader = ConfigLoader::load_with(None, &paths, |_| None).unwrap();
        assert_eq!(loader.config().server.port, 2);
    }

    #[test]
    fn env_overrides_everything() {
        let env = env_from(&[
            ("AUTH_PROVIDER", "supabase"),
            ("SUPABASE_JWT_SECRET", "super-secret"),
            ("DB_POOL_SIZE", "3"),
            ("REDIS_HOST", "cache.internal"),
        ]);
        let loader = ConfigLoader::load_with(None, &ConfigPaths::none(), env).unwrap();
        let config = loader.config();
        assert_eq!(config.auth.provider, AuthProviderKind::Supabase);
        assert_eq!(config.auth.supabase.jwt_secret.as_deref(), Some("super-secret"));
        assert_eq!(config.database.pool.pool_size, 3);
        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.cache.redis_host, "cache.internal");
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let env = env_from(&[("SERVER_PORT", "eighty")]);
        let err = ConfigLoader::load_with(None, &ConfigPaths::none(), env).unwrap_err();
        assert!(err.to_string().contains("SERVER_PORT"));
    }

    #[test]
    fn explicit_file_must_exist() {
        let missing = PathBuf::from("/definitely/not/here.yaml");
        assert!(ConfigLoader::load_with(Some(&missing), &ConfigPaths::none(), |_| None).is_err());
    }
}
