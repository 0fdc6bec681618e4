//! Account lifecycle: registration, login, refresh-token rotation, logout.

use super::domain::{Email, User, validate_username};
use super::jwt::{JwtService, TokenPair};
use super::password::{hash_password, validate_password, verify_password};
use super::providers::{AuthProvider, build_provider};
use crate::config::{AuthConfig, AuthProviderKind};
use crate::db::{Database, now_ms};
use crate::error::{ApiError, ApiResult, ErrorCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub user: User,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

pub struct AuthService {
    db: Database,
    jwt: Option<Arc<JwtService>>,
    provider: Arc<dyn AuthProvider>,
}

fn revoked() -> ApiError {
    ApiError::new(ErrorCode::TokenRevoked, "Refresh token has been revoked")
}

/// Run a CPU-heavy closure off the async runtime.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

impl AuthService {
    pub fn new(config: &AuthConfig, db: Database) -> anyhow::Result<Self> {
        let jwt = match (config.provider, config.jwt_secret_key.as_deref()) {
            (AuthProviderKind::Local, Some(secret)) => Some(Arc::new(JwtService::new(secret, config))),
            _ => None,
        };
        let provider = build_provider(config, jwt.clone(), db.clone())?;
        info!(provider = %provider.kind(), "Authentication provider ready");
        Ok(Self { db, jwt, provider })
    }

    pub fn provider_kind(&self) -> AuthProviderKind {
        self.provider.kind()
    }

    /// Resolve a bearer token to an active user.
    pub async fn authenticate(&self, token: &str) -> ApiResult<User> {
        self.provider.authenticate(token).await
    }

    fn local_jwt(&self) -> ApiResult<&JwtService> {
        self.jwt.as_deref().ok_or_else(|| {
            ApiError::new(
                ErrorCode::ProviderUnsupported,
                format!(
                    "Operation requires the local auth provider (current: {})",
                    self.provider.kind()
                ),
            )
        })
    }

    /// Register a local account.
    pub async fn register(&self, email: &str, username: &str, password: &str) -> ApiResult<User> {
        self.local_jwt()?;
        let email = Email::parse(email).map_err(|e| ApiError::invalid_value("email", e))?;
        let username = validate_username(username).map_err(|e| ApiError::invalid_value("username", e))?;
        validate_password(password).map_err(|e| ApiError::invalid_value("password", e))?;

        if self.db.find_user_by_login(email.as_str())?.is_some()
            || self.db.find_user_by_login(&username)?.is_some()
        {
            return Err(ApiError::already_exists("Email or username already registered"));
        }

        let password = password.to_string();
        let hash = blocking(move || hash_password(&password)).await?;
        let user = User::new_local(email, username, hash, now_ms());
        self.db
            .insert_user(&user)
            .map_err(|_| ApiError::already_exists("Email or username already registered"))?;

        info!(user_id = %user.id, username = %user.username, "User registered");
        Ok(user)
    }

    /// Log in with email or username. Starts a new refresh-token family.
    pub async fn login(&self, login: &str, password: &str) -> ApiResult<LoginResponse> {
        let jwt = self.local_jwt()?;
        let Some(mut user) = self.db.find_user_by_login(login)? else {
            return Err(ApiError::invalid_credentials());
        };
        let Some(hash) = user.password_hash.clone() else {
            return Err(ApiError::invalid_credentials());
        };

        let password = password.to_string();
        let valid = blocking(move || verify_password(&password, &hash)).await?;
        if !valid {
            warn!(user_id = %user.id, "Failed login attempt");
            return Err(ApiError::invalid_credentials());
        }
        if !user.can_login() {
            return Err(ApiError::forbidden(format!("Account is {}", user.status)));
        }

        let (family, version) = user.start_refresh_family();
        self.db.save_refresh_state(&user)?;
        user.last_login_at = Some(self.db.record_login(&user.id)?);
        let tokens = jwt.token_pair(&user, &family, version)?;

        info!(user_id = %user.id, "User logged in");
        Ok(LoginResponse { user, tokens })
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// The presented token must carry the current family and version. A token
    /// from the current family with an older version means it was replayed, so
    /// the whole family is revoked. The version bump is a compare-and-swap, so
    /// concurrent redemptions of one token count as a replay as well.
    pub async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        let jwt = self.local_jwt()?;
        let claims = jwt.validate_refresh(refresh_token)?;
        let mut user = self
            .db
            .get_user(&claims.sub)?
            .ok_or_else(|| ApiError::unauthorized("Token subject no longer exists"))?;
        if !user.can_login() {
            return Err(ApiError::forbidden(format!("Account is {}", user.status)));
        }

        let (Some(family), Some(version)) = (claims.family, claims.version) else {
            return Err(ApiError::unauthorized("Refresh token has no family"));
        };
        let next = version + 1;
        if !user.refresh_token_matches(&family, version)
            || !self.db.rotate_refresh_token(&user.id, &family, version, next)?
        {
            if self.db.revoke_refresh_family(&user.id, &family)? {
                warn!(user_id = %user.id, "Refresh token reuse detected, revoking family");
            }
            return Err(revoked());
        }

        let version = user.rotate_refresh_token();
        Ok(jwt.token_pair(&user, &family, version)?)
    }

    /// Revoke the caller's refresh tokens. Access tokens expire on their own.
    pub fn logout(&self, user: &User) -> ApiResult<()> {
        self.revoke_all(&user.id)?;
        info!(user_id = %user.id, "User logged out");
        Ok(())
    }

    /// Invalidate every outstanding refresh token of a user.
    pub fn revoke_all(&self, user_id: &str) -> ApiResult<()> {
        let mut user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| ApiError::user_not_found(user_id))?;
        user.revoke_refresh_tokens();
        self.db.save_refresh_state(&user)?;
        Ok(())
    }

    /// Change a local password. Revokes all refresh tokens.
    pub async fn change_password(&self, user: &User, current: &str, new: &str) -> ApiResult<()> {
        self.local_jwt()?;
        let Some(hash) = user.password_hash.clone() else {
            return Err(ApiError::invalid_state("Account has no local password"));
        };
        let current = current.to_string();
        if !blocking(move || verify_password(&current, &hash)).await? {
            return Err(ApiError::invalid_credentials());
        }
        validate_password(new).map_err(|e| ApiError::invalid_value("new_password", e))?;

        let new = new.to_string();
        let new_hash = blocking(move || hash_password(&new)).await?;
        self.db.update_password_hash(&user.id, &new_hash)?;
        self.revoke_all(&user.id)?;
        info!(user_id = %user.id, "Password changed");
        Ok(())
    }

    /// Current state of a user.
    pub fn me(&self, user_id: &str) -> ApiResult<User> {
        self.db
            .get_user(user_id)?
            .ok_or_else(|| ApiError::user_not_found(user_id))
    }
}
