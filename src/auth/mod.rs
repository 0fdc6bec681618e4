//! Authentication: user domain, password hashing, JWTs, providers and the
//! request extractor.

pub mod domain;
pub mod jwt;
pub mod password;
pub mod providers;
pub mod service;

pub use domain::{Email, User, UserId, UserRole, UserStatus};
pub use jwt::{Claims, JwtService, TokenPair, TokenType, extract_bearer_token};
pub use providers::{AuthProvider, build_provider};
pub use service::{AuthService, LoginResponse};

use crate::error::ApiError;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header;
use axum::http::request::Parts;
use std::sync::Arc;

/// The user behind the request's `Authorization: Bearer` token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

impl AuthenticatedUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer_token)
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        let auth = Arc::<AuthService>::from_ref(state);
        let user = auth.authenticate(token).await?;
        Ok(AuthenticatedUser(user))
    }
}
