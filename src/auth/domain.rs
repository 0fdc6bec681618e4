//! Auth domain: the `User` entity and its value objects.

use crate::types::string_enum;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Identifier of a locally registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| format!("invalid user id '{}': {}", raw, e))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
            .expect("email pattern is valid")
    })
}

/// A syntactically valid, lower-cased e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    pub const MAX_LEN: usize = 254;

    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err("email is required".to_string());
        }
        if normalized.len() > Self::MAX_LEN {
            return Err(format!("email must be at most {} characters", Self::MAX_LEN));
        }
        if !email_regex().is_match(&normalized) {
            return Err(format!("'{}' is not a valid email address", raw.trim()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.rsplit('@').next().unwrap_or_default()
    }
}

impl TryFrom<String> for Email {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Email::parse(&value)
    }
}

impl From<Email> for String {
    fn from(email: Email) -> Self {
        email.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a username: 3-50 chars of letters, digits, `_`, `-` or `.`.
pub fn validate_username(raw: &str) -> Result<String, String> {
    let username = raw.trim();
    if username.len() < 3 || username.len() > 50 {
        return Err("username must be between 3 and 50 characters".to_string());
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("username may only contain letters, digits, '_', '-' and '.'".to_string());
    }
    Ok(username.to_string())
}

string_enum! {
    /// Account state.
    UserStatus {
        Active => "active",
        Inactive => "inactive",
        Suspended => "suspended",
        PendingVerification => "pending_verification",
    }
}

string_enum! {
    UserRole {
        Admin => "admin",
        Developer => "developer",
        User => "user",
        Viewer => "viewer",
    }
}

/// A user account, local or shadowed from an external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub status: UserStatus,
    pub roles: Vec<UserRole>,
    pub auth_provider: String,
    #[serde(skip_serializing)]
    pub refresh_token_family: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token_version: i64,
    pub last_login_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    /// A new local account with the default `user` role.
    pub fn new_local(email: Email, username: String, password_hash: String, now: i64) -> Self {
        Self {
            id: UserId::generate().to_string(),
            email: email.into(),
            username,
            password_hash: Some(password_hash),
            status: UserStatus::Active,
            roles: vec![UserRole::User],
            auth_provider: "local".to_string(),
            refresh_token_family: None,
            refresh_token_version: 0,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_login(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn has_role(&self, role: UserRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(UserRole::Admin)
    }

    /// Whether a refresh token carrying `family`/`version` is the current one.
    pub fn refresh_token_matches(&self, family: &str, version: i64) -> bool {
        self.refresh_token_family.as_deref() == Some(family) && self.refresh_token_version == version
    }

    /// Start a new refresh-token family (login). Returns `(family, version)`.
    pub fn start_refresh_family(&mut self) -> (String, i64) {
        let family = Uuid::new_v4().to_string();
        self.refresh_token_family = Some(family.clone());
        self.refresh_token_version += 1;
        (family, self.refresh_token_version)
    }

    /// Advance the version inside the current family (refresh). Returns the new version.
    pub fn rotate_refresh_token(&mut self) -> i64 {
        self.refresh_token_version += 1;
        self.refresh_token_version
    }

    /// Invalidate every outstanding refresh token.
    pub fn revoke_refresh_tokens(&mut self) {
        self.refresh_token_family = None;
        self.refresh_token_version += 1;
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.as_str().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_normalized() {
        let email = Email::parse("  Alice@Example.COM ").unwrap();
        assert_eq!(email.as_str(), "alice@example.com");
        assert_eq!(email.domain(), "example.com");
    }

    #[test]
    fn invalid_emails_are_rejected() {
        for raw in ["", "alice", "alice@", "@example.com", "alice@example", "a b@example.com"] {
            assert!(Email::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn email_deserialization_validates() {
        assert!(serde_json::from_str::<Email>("\"bob@example.org\"").is_ok());
        assert!(serde_json::from_str::<Email>("\"not-an-email\"").is_err());
    }

    #[test]
    fn username_rules() {
        assert_eq!(validate_username(" dev_01 ").unwrap(), "dev_01");
        assert!(validate_username("ab").is_err());
        assert!(validate_username("has space").is_err());
    }

    #[test]
    fn user_id_round_trips() {
        let id = UserId::generate();
        assert_eq!(UserId::parse(&id.to_string()).unwrap(), id);
        assert!(UserId::parse("nope").is_err());
    }

    #[test]
    fn refresh_family_rotation() {
        let email = Email::parse("carol@example.com").unwrap();
        let mut user = User::new_local(email, "carol".into(), "hash".into(), 1);
        let (family, v1) = user.start_refresh_family();
        assert!(user.refresh_token_matches(&family, v1));

        let v2 = user.rotate_refresh_token();
        assert!(!user.refresh_token_matches(&family, v1));
        assert!(user.refresh_token_matches(&family, v2));

        user.revoke_refresh_tokens();
        assert!(!user.refresh_token_matches(&family, v2));
        assert!(!user.refresh_token_matches(&family, user.refresh_token_version));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let email = Email::parse("dan@example.com").unwrap();
        let user = User::new_local(email, "dan".into(), "argon-hash".into(), 1);
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon-hash"));
        assert!(!json.contains("refresh_token"));
    }
}
