//! HS256 access/refresh token issuing and validation for local accounts.

use super::domain::User;
use crate::config::AuthConfig;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token failures, mapped to `ApiError` codes by the auth service.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("expected a {expected} token")]
    WrongType { expected: TokenType },
    #[error("failed to encode token: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Access => f.write_str("access"),
            TokenType::Refresh => f.write_str("refresh"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub token_type: TokenType,
    /// Refresh-token family; only set on refresh tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Refresh-token version within the family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// An access/refresh pair as returned by login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access-token lifetime in seconds.
    pub expires_in: i64,
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    leeway_seconds: u64,
}

impl JwtService {
    pub fn new(secret: &str, config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            access_ttl: Duration::minutes(config.access_token_minutes),
            refresh_ttl: Duration::days(config.refresh_token_days),
            leeway_seconds: config.leeway_seconds,
        }
    }

    fn claims(&self, user: &User, token_type: TokenType, ttl: Duration) -> Claims {
        let now = Utc::now();
        Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            username: user.username.clone(),
            roles: user.role_names(),
            token_type,
            family: None,
            version: None,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Encode(e.to_string()))
    }

    pub fn access_token(&self, user: &User) -> Result<String, TokenError> {
        self.encode(&self.claims(user, TokenType::Access, self.access_ttl))
    }

    pub fn refresh_token(&self, user: &User, family: &str, version: i64) -> Result<String, TokenError> {
        let mut claims = self.claims(user, TokenType::Refresh, self.refresh_ttl);
        claims.family = Some(family.to_string());
        claims.version = Some(version);
        self.encode(&claims)
    }

    pub fn token_pair(&self, user: &User, family: &str, version: i64) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.access_token(user)?,
            refresh_token: self.refresh_token(user, family, version)?,
            token_type: "bearer",
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Validate signature, issuer, audience and expiry.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.leeway = self.leeway_seconds;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }

    pub fn validate_access(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.validate(token)?;
        if claims.token_type != TokenType::Access {
            return Err(TokenError::WrongType {
                expected: TokenType::Access,
            });
        }
        Ok(claims)
    }

    pub fn validate_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.validate(token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(TokenError::WrongType {
                expected: TokenType::Refresh,
            });
        }
        Ok(claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    let (scheme, token) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::domain::Email;

    fn service() -> JwtService {
        JwtService::new("test-secret-with-enough-length", &AuthConfig::default())
    }

    fn user() -> User {
        User::new_local(
            Email::parse("ivy@example.com").unwrap(),
            "ivy".into(),
            "hash".into(),
            0,
        )
    }

    #[test]
    fn access_token_round_trip() {
        let jwt = service();
        let user = user();
        let token = jwt.access_token(&user).unwrap();
        let claims = jwt.validate_access(&token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.roles, vec!["user".to_string()]);
        assert!(claims.family.is_none());
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let jwt = service();
        let token = jwt.refresh_token(&user(), "fam", 3).unwrap();
        assert!(matches!(
            jwt.validate_access(&token),
            Err(TokenError::WrongType { .. })
        ));
        let claims = jwt.validate_refresh(&token).unwrap();
        assert_eq!(claims.family.as_deref(), Some("fam"));
        assert_eq!(claims.version, Some(3));
    }

    #[test]
    fn other_secret_is_rejected() {
        let token = service().access_token(&user()).unwrap();
        let other = JwtService::new("another-secret-entirely", &AuthConfig::default());
        assert!(matches!(other.validate(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn expired_token_is_reported() {
        let jwt = service();
        let mut claims = jwt.claims(&user(), TokenType::Access, Duration::minutes(5));
        claims.exp = Utc::now().timestamp() - 3_600;
        let token = jwt.encode(&claims).unwrap();
        assert!(matches!(jwt.validate(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(extract_bearer_token("Basic abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
    }
}
