//! Configuration system.
//!
//! Layers built-in defaults, YAML files and environment variables with
//! field-by-field merging. See [`loader`] for tier order.
//!
//! ## Environment Variables
//! - `TASKHUB_CONFIG_PATH` - Explicit config file (overrides file tiers)
//! - `AUTH_PROVIDER` - `local`, `keycloak` or `supabase`
//! - `JWT_SECRET_KEY`, `JWT_ISSUER`
//! - `KEYCLOAK_URL`, `KEYCLOAK_REALM`, `KEYCLOAK_CLIENT_ID`, `KEYCLOAK_PUBLIC_KEY`
//! - `SUPABASE_URL`, `SUPABASE_JWT_SECRET`
//! - `DATABASE_TYPE`, `DATABASE_PATH`, `DB_POOL_SIZE`, `DB_MAX_OVERFLOW`, `DB_POOL_RECYCLE`
//! - `CACHE_BACKEND`, `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB`, `REDIS_PASSWORD`
//! - `SERVER_HOST`, `SERVER_PORT`

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier, apply_env_overrides};
pub use merge::{deep_merge, deep_merge_all, merge_patch};
pub use types::*;
