//! Bearer-token authentication providers.
//!
//! `Local` validates tokens issued by [`JwtService`]. `Keycloak` and
//! `Supabase` validate tokens issued elsewhere with locally configured key
//! material and keep a shadow `users` row per external subject.

use super::domain::{User, UserRole};
use super::jwt::{JwtService, TokenError};
use crate::config::{AuthConfig, AuthProviderKind, KeycloakConfig, SupabaseConfig};
use crate::db::Database;
use crate::error::{ApiError, ErrorCode};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns a bearer token into the user it authenticates.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn kind(&self) -> AuthProviderKind;

    async fn authenticate(&self, token: &str) -> Result<User, ApiError>;
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => ApiError::new(ErrorCode::TokenExpired, "Token has expired"),
            TokenError::Encode(e) => ApiError::internal(e),
            other => ApiError::unauthorized(other.to_string()),
        }
    }
}

fn ensure_active(user: User) -> Result<User, ApiError> {
    if user.can_login() {
        Ok(user)
    } else {
        Err(ApiError::forbidden(format!("Account is {}", user.status)))
    }
}

/// Validates locally issued HS256 access tokens.
pub struct LocalAuthProvider {
    jwt: Arc<JwtService>,
    db: Database,
}

impl LocalAuthProvider {
    pub fn new(jwt: Arc<JwtService>, db: Database) -> Self {
        Self { jwt, db }
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    fn kind(&self) -> AuthProviderKind {
        AuthProviderKind::Local
    }

    async fn authenticate(&self, token: &str) -> Result<User, ApiError> {
        let claims = self.jwt.validate_access(token)?;
        let user = self
            .db
            .get_user(&claims.sub)?
            .ok_or_else(|| ApiError::unauthorized("Token subject no longer exists"))?;
        ensure_active(user)
    }
}

/// Username derived from an external identity, restricted to the local charset.
fn shadow_username(preferred: Option<&str>, email: Option<&str>, sub: &str) -> String {
    let raw = preferred
        .or_else(|| email.and_then(|e| e.split('@').next()))
        .unwrap_or(sub);
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .take(50)
        .collect();
    if cleaned.len() >= 3 {
        cleaned
    } else {
        format!("user-{}", &sub[..sub.len().min(12)])
    }
}

fn map_roles<'a>(names: impl IntoIterator<Item = &'a String>) -> Vec<UserRole> {
    let mut roles: Vec<UserRole> = Vec::new();
    for role in names.into_iter().filter_map(|name| name.parse::<UserRole>().ok()) {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    if roles.is_empty() {
        roles.push(UserRole::User);
    }
    roles
}

fn external_token_error(err: jsonwebtoken::errors::Error) -> ApiError {
    match err.kind() {
        ErrorKind::ExpiredSignature => ApiError::new(ErrorCode::TokenExpired, "Token has expired"),
        _ => ApiError::unauthorized(format!("invalid token: {}", err)),
    }
}

// =============================================================================
// Keycloak
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KeycloakClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
}

/// Wrap a bare base64 RSA key body in PEM armour.
fn to_pem(key: &str) -> String {
    let key = key.trim();
    if key.contains("BEGIN") {
        return key.to_string();
    }
    let body: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}

/// Validates RS256 tokens signed by a Keycloak realm.
pub struct KeycloakAuthProvider {
    decoding_key: DecodingKey,
    validation: Validation,
    db: Database,
}

impl KeycloakAuthProvider {
    pub fn new(config: &KeycloakConfig, leeway_seconds: u64, db: Database) -> Result<Self> {
        let issuer = config
            .issuer()
            .ok_or_else(|| anyhow!("keycloak requires KEYCLOAK_URL and KEYCLOAK_REALM"))?;
        let public_key = config
            .public_key
            .as_deref()
            .ok_or_else(|| anyhow!("keycloak requires KEYCLOAK_PUBLIC_KEY"))?;
        let decoding_key = DecodingKey::from_rsa_pem(to_pem(public_key).as_bytes())
            .map_err(|e| anyhow!("invalid Keycloak public key: {e}"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.leeway = leeway_seconds;
        match config.client_id {
            Some(ref client_id) => validation.set_audience(&[client_id]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key,
            validation,
            db,
        })
    }
}

#[async_trait]
impl AuthProvider for KeycloakAuthProvider {
    fn kind(&self) -> AuthProviderKind {
        AuthProviderKind::Keycloak
    }

    async fn authenticate(&self, token: &str) -> Result<User, ApiError> {
        let claims = decode::<KeycloakClaims>(token, &self.decoding_key, &self.validation)
            .map_err(external_token_error)?
            .claims;
        let roles = map_roles(claims.realm_access.iter().flat_map(|access| access.roles.iter()));
        let email = claims
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@keycloak.invalid", claims.sub));
        let username = shadow_username(
            claims.preferred_username.as_deref(),
            claims.email.as_deref(),
            &claims.sub,
        );
        debug!(sub = %claims.sub, "Keycloak token accepted");

        let user = self
            .db
            .upsert_external_user(&claims.sub, &email.to_lowercase(), &username, &roles, "keycloak")?;
        ensure_active(user)
    }
}

// =============================================================================
// Supabase
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct AppMetadata {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SupabaseClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    app_metadata: Option<AppMetadata>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

/// Validates HS256 tokens signed with a Supabase project's JWT secret.
pub struct SupabaseAuthProvider {
    decoding_key: DecodingKey,
    validation: Validation,
    db: Database,
}

impl SupabaseAuthProvider {
    pub const AUDIENCE: &'static str = "authenticated";

    pub fn new(config: &SupabaseConfig, leeway_seconds: u64, db: Database) -> Result<Self> {
        let secret = config
            .jwt_secret
            .as_deref()
            .ok_or_else(|| anyhow!("supabase requires SUPABASE_JWT_SECRET"))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[Self::AUDIENCE]);
        validation.leeway = leeway_seconds;
        if let Some(ref url) = config.url {
            validation.set_issuer(&[format!("{}/auth/v1", url.trim_end_matches('/'))]);
        }

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            db,
        })
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuthProvider {
    fn kind(&self) -> AuthProviderKind {
        AuthProviderKind::Supabase
    }

    async fn authenticate(&self, token: &str) -> Result<User, ApiError> {
        let claims = decode::<SupabaseClaims>(token, &self.decoding_key, &self.validation)
            .map_err(external_token_error)?
            .claims;
        let roles = map_roles(claims.app_metadata.iter().flat_map(|meta| meta.roles.iter()));
        let email = claims
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@supabase.invalid", claims.sub));
        let preferred = claims.user_metadata.as_ref().and_then(|m| m.username.as_deref());
        let username = shadow_username(preferred, claims.email.as_deref(), &claims.sub);

        let user = self
            .db
            .upsert_external_user(&claims.sub, &email.to_lowercase(), &username, &roles, "supabase")?;
        ensure_active(user)
    }
}

/// Build the provider selected by configuration.
///
/// `jwt` must be present for the local provider.
pub fn build_provider(
    config: &AuthConfig,
    jwt: Option<Arc<JwtService>>,
    db: Database,
) -> Result<Arc<dyn AuthProvider>> {
    let provider: Arc<dyn AuthProvider> = match config.provider {
        AuthProviderKind::Local => {
            let jwt = jwt.ok_or_else(|| anyhow!("local auth requires JWT_SECRET_KEY"))?;
            Arc::new(LocalAuthProvider::new(jwt, db))
        }
        AuthProviderKind::Keycloak => Arc::new(KeycloakAuthProvider::new(
            &config.keycloak,
            config.leeway_seconds,
            db,
        )?),
        AuthProviderKind::Supabase => Arc::new(SupabaseAuthProvider::new(
            &config.supabase,
            config.leeway_seconds,
            db,
        )?),
    };
    if config.provider != AuthProviderKind::Local && config.jwt_secret_key.is_some() {
        warn!(provider = %config.provider, "JWT_SECRET_KEY is ignored by external providers");
    }
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    #[test]
    fn usernames_are_sanitized() {
        assert_eq!(shadow_username(Some("jane doe!"), None, "abc"), "janedoe");
        assert_eq!(shadow_username(None, Some("kim@example.com"), "abc"), "kim");
        assert_eq!(shadow_username(Some("x"), None, "0123456789abcdef"), "user-0123456789ab");
    }

    #[test]
    fn unknown_roles_fall_back_to_user() {
        let names = vec!["offline_access".to_string(), "admin".to_string()];
        assert_eq!(map_roles(&names), vec![UserRole::Admin]);
        assert_eq!(map_roles(&Vec::<String>::new()), vec![UserRole::User]);
    }

    #[test]
    fn bare_key_is_wrapped() {
        let pem = to_pem("MIIBIjANBgkq");
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }

    #[tokio::test]
    async fn supabase_token_creates_shadow_user() {
        let db = Database::open_in_memory().unwrap();
        let config = SupabaseConfig {
            url: None,
            jwt_secret: Some("supabase-secret".into()),
        };
        let provider = SupabaseAuthProvider::new(&config, 0, db.clone()).unwrap();

        let claims = json!({
            "sub": "sb-123",
            "email": "Lee@Example.com",
            "aud": "authenticated",
            "exp": chrono::Utc::now().timestamp() + 600,
            "app_metadata": {"roles": ["developer"]},
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"supabase-secret"),
        )
        .unwrap();

        let user = provider.authenticate(&token).await.unwrap();
        assert_eq!(user.id, "sb-123");
        assert_eq!(user.email, "lee@example.com");
        assert_eq!(user.roles, vec![UserRole::Developer]);
        assert_eq!(user.auth_provider, "supabase");
        assert!(db.get_user("sb-123").unwrap().is_some());
    }

    #[tokio::test]
    async fn supabase_rejects_wrong_audience() {
        let db = Database::open_in_memory().unwrap();
        let config = SupabaseConfig {
            url: None,
            jwt_secret: Some("supabase-secret".into()),
        };
        let provider = SupabaseAuthProvider::new(&config, 0, db).unwrap();
        let claims = json!({
            "sub": "sb-1",
            "aud": "anon",
            "exp": chrono::Utc::now().timestamp() + 600,
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"supabase-secret"),
        )
        .unwrap();
        let err = provider.authenticate(&token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    const KEYCLOAK_PRIVATE_KEY: &str = include_str!("testdata/keycloak_rsa.pem");
    const KEYCLOAK_PUBLIC_KEY: &str = include_str!("testdata/keycloak_rsa.pub.pem");

    fn keycloak_config(public_key: &str) -> KeycloakConfig {
        KeycloakConfig {
            url: Some("https://sso.example.com/".into()),
            realm: Some("dev".into()),
            client_id: Some("taskhub".into()),
            public_key: Some(public_key.into()),
        }
    }

    fn keycloak_token(claims: &serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::RS256),
            claims,
            &EncodingKey::from_rsa_pem(KEYCLOAK_PRIVATE_KEY.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn keycloak_token_creates_shadow_user() {
        let db = Database::open_in_memory().unwrap();
        // Keycloak admin consoles show the bare key body without PEM armour
        let bare: String = KEYCLOAK_PUBLIC_KEY
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect();
        let provider = KeycloakAuthProvider::new(&keycloak_config(&bare), 0, db.clone()).unwrap();

        let token = keycloak_token(&json!({
            "sub": "kc-42",
            "iss": "https://sso.example.com/realms/dev",
            "aud": "taskhub",
            "exp": chrono::Utc::now().timestamp() + 600,
            "email": "Rio@Example.com",
            "preferred_username": "rio",
            "realm_access": {"roles": ["admin", "offline_access"]},
        }));

        let user = provider.authenticate(&token).await.unwrap();
        assert_eq!(user.id, "kc-42");
        assert_eq!(user.email, "rio@example.com");
        assert_eq!(user.username, "rio");
        assert_eq!(user.roles, vec![UserRole::Admin]);
        assert_eq!(user.auth_provider, "keycloak");
        assert!(db.get_user("kc-42").unwrap().is_some());
    }

    #[tokio::test]
    async fn keycloak_rejects_foreign_issuer_and_expired_tokens() {
        let db = Database::open_in_memory().unwrap();
        let provider = KeycloakAuthProvider::new(&keycloak_config(KEYCLOAK_PUBLIC_KEY), 0, db).unwrap();
        let now = chrono::Utc::now().timestamp();

        let token = keycloak_token(&json!({
            "sub": "kc-1",
            "iss": "https://sso.example.com/realms/other",
            "aud": "taskhub",
            "exp": now + 600,
        }));
        let err = provider.authenticate(&token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let token = keycloak_token(&json!({
            "sub": "kc-1",
            "iss": "https://sso.example.com/realms/dev",
            "aud": "taskhub",
            "exp": now - 600,
        }));
        let err = provider.authenticate(&token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenExpired);
    }

    #[tokio::test]
    async fn keycloak_rejects_hs256_tokens() {
        let db = Database::open_in_memory().unwrap();
        let provider = KeycloakAuthProvider::new(&keycloak_config(KEYCLOAK_PUBLIC_KEY), 0, db).unwrap();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({
                "sub": "kc-1",
                "iss": "https://sso.example.com/realms/dev",
                "aud": "taskhub",
                "exp": chrono::Utc::now().timestamp() + 600,
            }),
            &EncodingKey::from_secret(KEYCLOAK_PUBLIC_KEY.as_bytes()),
        )
        .unwrap();
        let err = provider.authenticate(&token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
    }

    #[test]
    fn keycloak_requires_key_material() {
        let db = Database::open_in_memory().unwrap();
        let config = KeycloakConfig {
            url: Some("https://sso.example.com".into()),
            realm: Some("dev".into()),
            client_id: None,
            public_key: None,
        };
        assert!(KeycloakAuthProvider::new(&config, 0, db).is_err());
    }
}
