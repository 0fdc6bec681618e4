//! Configuration types.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

/// Database backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

impl std::str::FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseType::Sqlite),
            "postgresql" | "postgres" => Ok(DatabaseType::Postgresql),
            other => Err(format!("unknown database type '{}'", other)),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub database_type: DatabaseType,

    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::default(),
            path: default_db_path(),
            pool: PoolConfig::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("taskhub").join("taskhub.db"))
        .unwrap_or_else(|| PathBuf::from("taskhub.db"))
}

/// Connection pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept open in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Extra connections allowed beyond `pool_size` under load.
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,

    /// Connections older than this are closed and replaced. 0 disables recycling.
    #[serde(default = "default_recycle_seconds")]
    pub recycle_seconds: u64,

    /// Idle connections beyond `pool_size` are closed after this long. 0 keeps them.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    /// How long a checkout waits for a free connection.
    #[serde(default = "default_pool_timeout_ms")]
    pub timeout_ms: u64,

    /// Test connections on checkout and replace dead ones.
    #[serde(default = "default_true")]
    pub pre_ping: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            recycle_seconds: default_recycle_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            timeout_ms: default_pool_timeout_ms(),
            pre_ping: true,
        }
    }
}

fn default_pool_size() -> usize {
    5
}

fn default_max_overflow() -> usize {
    10
}

fn default_recycle_seconds() -> u64 {
    1800
}

fn default_idle_timeout_seconds() -> u64 {
    60
}

fn default_pool_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// Which identity provider validates bearer tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProviderKind {
    #[default]
    Local,
    Keycloak,
    Supabase,
}

impl std::str::FromStr for AuthProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "jwt" => Ok(AuthProviderKind::Local),
            "keycloak" => Ok(AuthProviderKind::Keycloak),
            "supabase" => Ok(AuthProviderKind::Supabase),
            other => Err(format!("unknown auth provider '{}'", other)),
        }
    }
}

impl std::fmt::Display for AuthProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthProviderKind::Local => write!(f, "local"),
            AuthProviderKind::Keycloak => write!(f, "keycloak"),
            AuthProviderKind::Supabase => write!(f, "supabase"),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub provider: AuthProviderKind,

    /// HS256 signing secret for locally issued tokens.
    #[serde(default)]
    pub jwt_secret_key: Option<String>,

    #[serde(default = "default_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_audience")]
    pub jwt_audience: String,

    #[serde(default = "default_access_minutes")]
    pub access_token_minutes: i64,

    #[serde(default = "default_refresh_days")]
    pub refresh_token_days: i64,

    /// Clock skew tolerated when validating `exp`.
    #[serde(default = "default_leeway")]
    pub leeway_seconds: u64,

    #[serde(default)]
    pub keycloak: KeycloakConfig,

    #[serde(default)]
    pub supabase: SupabaseConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: AuthProviderKind::default(),
            jwt_secret_key: None,
            jwt_issuer: default_issuer(),
            jwt_audience: default_audience(),
            access_token_minutes: default_access_minutes(),
            refresh_token_days: default_refresh_days(),
            leeway_seconds: default_leeway(),
            keycloak: KeycloakConfig::default(),
            supabase: SupabaseConfig::default(),
        }
    }
}

fn default_issuer() -> String {
    "taskhub".to_string()
}

fn default_audience() -> String {
    "taskhub-api".to_string()
}

fn default_access_minutes() -> i64 {
    30
}

fn default_refresh_days() -> i64 {
    7
}

fn default_leeway() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeycloakConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    /// Realm RSA public key, PEM or the bare base64 body shown in the admin console.
    #[serde(default)]
    pub public_key: Option<String>,
}

impl KeycloakConfig {
    /// Expected `iss` claim for tokens from this realm.
    pub fn issuer(&self) -> Option<String> {
        match (&self.url, &self.realm) {
            (Some(url), Some(realm)) => {
                Some(format!("{}/realms/{}", url.trim_end_matches('/'), realm))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

/// Cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
}

impl std::str::FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in_memory" => Ok(CacheBackendKind::Memory),
            "redis" => Ok(CacheBackendKind::Redis),
            other => Err(format!("unknown cache backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default)]
    pub redis_db: u32,

    #[serde(default)]
    pub redis_password: Option<String>,

    #[serde(default = "default_cache_ttl")]
    pub default_ttl_seconds: u64,

    /// Upper bound on entries held by the in-memory backend.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            redis_password: None,
            default_ttl_seconds: default_cache_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_max_entries() -> usize {
    10_000
}

/// Context hierarchy behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Create missing parent contexts instead of only warning.
    #[serde(default = "default_true")]
    pub auto_create_parents: bool,

    /// Lifetime of rows in the resolved-inheritance cache table.
    #[serde(default = "default_inheritance_ttl")]
    pub inheritance_cache_ttl_seconds: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_create_parents: true,
            inheritance_cache_ttl_seconds: default_inheritance_ttl(),
        }
    }
}

fn default_inheritance_ttl() -> i64 {
    3600
}

/// Change notification behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Repeats of the same event inside this window are dropped.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_dedup_window() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    256
}

impl Config {
    /// Check cross-field requirements that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.database.database_type != DatabaseType::Sqlite {
            bail!(
                "DATABASE_TYPE={:?} is not supported by this build; use sqlite",
                self.database.database_type
            );
        }
        if self.database.pool.pool_size == 0 {
            bail!("database.pool.pool_size must be at least 1");
        }
        if self.auth.access_token_minutes <= 0 || self.auth.refresh_token_days <= 0 {
            bail!("token lifetimes must be positive");
        }
        match self.auth.provider {
            AuthProviderKind::Local => {
                if self.auth.jwt_secret_key.as_deref().unwrap_or("").len() < 16 {
                    bail!("JWT_SECRET_KEY must be set (at least 16 characters) for the local provider");
                }
            }
            AuthProviderKind::Supabase => {
                if self.auth.supabase.jwt_secret.as_deref().unwrap_or("").is_empty() {
                    bail!("SUPABASE_JWT_SECRET must be set for the supabase provider");
                }
            }
            AuthProviderKind::Keycloak => {
                if self.auth.keycloak.issuer().is_none() {
                    bail!("KEYCLOAK_URL and KEYCLOAK_REALM must be set for the keycloak provider");
                }
                if self.auth.keycloak.public_key.is_none() {
                    bail!("KEYCLOAK_PUBLIC_KEY must be set for the keycloak provider");
                }
            }
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.database.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret_key = Some("0123456789abcdef0123".to_string());
        config
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.database.pool.pool_size, 5);
        assert_eq!(config.database.pool.max_overflow, 10);
        assert_eq!(config.notifications.dedup_window_ms, 5000);
        assert!(config.context.auto_create_parents);
    }

    #[test]
    fn local_provider_requires_secret() {
        assert!(Config::default().validate().is_err());
        assert!(local_config().validate().is_ok());
    }

    #[test]
    fn postgres_is_rejected() {
        let mut config = local_config();
        config.database.database_type = DatabaseType::Postgresql;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn keycloak_needs_realm_and_key() {
        let mut config = local_config();
        config.auth.provider = AuthProviderKind::Keycloak;
        config.auth.keycloak.url = Some("https://sso.example.com/".to_string());
        assert!(config.validate().is_err());
        config.auth.keycloak.realm = Some("dev".to_string());
        config.auth.keycloak.public_key = Some("MIIB".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.auth.keycloak.issuer().unwrap(),
            "https://sso.example.com/realms/dev"
        );
    }

    #[test]
    fn redis_url_includes_password() {
        let mut cache = CacheConfig::default();
        assert_eq!(cache.redis_url(), "redis://localhost:6379/0");
        cache.redis_password = Some("pw".to_string());
        assert_eq!(cache.redis_url(), "redis://:pw@localhost:6379/0");
    }

    #[test]
    fn provider_kind_parses() {
        assert_eq!("Keycloak".parse::<AuthProviderKind>().unwrap(), AuthProviderKind::Keycloak);
        assert!("okta".parse::<AuthProviderKind>().is_err());
    }
}
