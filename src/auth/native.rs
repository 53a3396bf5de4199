use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::password::{generate_password, generate_secret, hash_password, verify_password};
use super::{AuthError, AuthScheme, Mail, Mailer, ManagedScheme};
use crate::config::AppConfig;
use crate::storage::models::{PasswordToken, Session, User};
use crate::storage::{Storage, StorageError};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").expect("email regex")
});

const MIN_PASSWORD: usize = 6;
const MAX_PASSWORD: usize = 50;
const RESET_TOKEN_HOURS: i64 = 24;

pub fn validate_email(email: &str) -> Result<(), AuthError> {
    if EMAIL_RE.is_match(email) {
        Ok(())
    } else {
        Err(AuthError::InvalidEmail)
    }
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    let len = password.chars().count();
    if (MIN_PASSWORD..=MAX_PASSWORD).contains(&len) {
        Ok(())
    } else {
        Err(AuthError::InvalidPassword)
    }
}

/// Claims carried by native session tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(email: &str, expire_days: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: email.to_string(),
            jti: Uuid::new_v4().to_string(),
            exp: (now + Duration::days(expire_days)).timestamp(),
            iat: now.timestamp(),
        }
    }
}

pub fn generate_jwt(claims: &Claims, secret: &str) -> Result<String, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::Signing("token secret not configured".into()));
    }
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Signing(e.to_string()))
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::InvalidToken)
}

/// Scheme that owns user passwords and issues signed session tokens.
pub struct NativeScheme {
    storage: Storage,
    mailer: Arc<dyn Mailer>,
    secret: String,
    hash_cost: u32,
    expire_days: i64,
    max_sessions: usize,
}

impl NativeScheme {
    pub fn new(storage: Storage, mailer: Arc<dyn Mailer>, config: &AppConfig) -> Self {
        Self {
            storage,
            mailer,
            secret: config.security.token_secret.clone(),
            hash_cost: config.auth.hash_cost,
            expire_days: config.auth.token_expire_days,
            max_sessions: config.auth.max_simultaneous_sessions,
        }
    }

    async fn find_user(&self, email: &str) -> Result<User, AuthError> {
        self.storage
            .users
            .find(email)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    async fn sessions_of(&self, email: &str) -> Result<Vec<Session>, StorageError> {
        let mut sessions: Vec<Session> = self
            .storage
            .sessions
            .list()
            .await?
            .into_iter()
            .filter(|s| s.user_email == email)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Drop the oldest sessions so that a new one fits under the cap.
    async fn trim_sessions(&self, email: &str) -> Result<(), StorageError> {
        if self.max_sessions == 0 {
            return Ok(());
        }
        let sessions = self.sessions_of(email).await?;
        let excess = (sessions.len() + 1).saturating_sub(self.max_sessions);
        for session in sessions.into_iter().take(excess) {
            tracing::debug!("removing old session of {}", email);
            self.storage.sessions.remove(&session.id).await?;
        }
        Ok(())
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> Result<(), AuthError> {
        self.mailer
            .send(Mail {
                to: to.to_string(),
                subject: subject.to_string(),
                body,
            })
            .await
    }
}

#[async_trait]
impl AuthScheme for NativeScheme {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn login(&self, email: &str, password: &str) -> Result<String, AuthError> {
        validate_email(email)?;
        let user = self.find_user(email).await?;
        if !verify_password(password, &user.password)? {
            return Err(AuthError::AuthenticationFailure(
                "Authentication failed, wrong password.".into(),
            ));
        }

        self.trim_sessions(email).await?;
        let claims = Claims::new(email, self.expire_days);
        let token = generate_jwt(&claims, &self.secret)?;
        self.storage
            .sessions
            .insert(Session {
                id: claims.jti.clone(),
                user_email: email.to_string(),
                created_at: Utc::now(),
                expires_at: Utc::now() + Duration::days(self.expire_days),
            })
            .await?;
        tracing::info!("user {} logged in", email);
        Ok(token)
    }

    async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let claims = validate_jwt(token, &self.secret)?;
        match self.storage.sessions.remove(&claims.jti).await {
            Ok(()) | Err(StorageError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn auth(&self, token: &str) -> Result<User, AuthError> {
        let claims = validate_jwt(token, &self.secret)?;
        let session = self
            .storage
            .sessions
            .find(&claims.jti)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if session.expires_at < Utc::now() || session.user_email != claims.sub {
            return Err(AuthError::InvalidToken);
        }
        self.find_user(&claims.sub).await
    }

    async fn create(&self, email: &str, password: &str) -> Result<User, AuthError> {
        validate_email(email)?;
        validate_password(password)?;
        let user = User {
            email: email.to_string(),
            password: hash_password(password, self.hash_cost)?,
            api_key: None,
            roles: Vec::new(),
        };
        match self.storage.users.insert(user.clone()).await {
            Ok(()) => Ok(user),
            Err(StorageError::AlreadyExists { .. }) => Err(AuthError::UserExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, user: &User) -> Result<(), AuthError> {
        for session in self.sessions_of(&user.email).await? {
            self.storage.sessions.remove(&session.id).await?;
        }
        match self.storage.users.remove(&user.email).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound { .. }) => Err(AuthError::UserNotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn managed(&self) -> Option<&dyn ManagedScheme> {
        Some(self)
    }
}

#[async_trait]
impl ManagedScheme for NativeScheme {
    async fn change_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let mut current = self.find_user(&user.email).await?;
        if !verify_password(old_password, &current.password)? {
            return Err(AuthError::AuthenticationFailure(
                "the given password didn't match the user's current password".into(),
            ));
        }
        validate_password(new_password)?;
        current.password = hash_password(new_password, self.hash_cost)?;
        self.storage.users.update(current).await?;
        Ok(())
    }

    async fn start_password_reset(&self, user: &User) -> Result<(), AuthError> {
        let token = PasswordToken {
            token: generate_secret(20),
            user_email: user.email.clone(),
            created_at: Utc::now(),
            used: false,
        };
        self.storage.password_tokens.insert(token.clone()).await?;
        self.send(
            &user.email,
            "[tsuru] Password reset process",
            format!(
                "Someone asked to reset the password of {}.\n\nUse the token {} to confirm it.\n",
                user.email, token.token
            ),
        )
        .await
    }

    async fn reset_password(&self, user: &User, reset_token: &str) -> Result<(), AuthError> {
        let mut token = self
            .storage
            .password_tokens
            .find(reset_token)
            .await?
            .ok_or(AuthError::InvalidResetToken)?;
        let expired = token.created_at + Duration::hours(RESET_TOKEN_HOURS) < Utc::now();
        if token.used || expired || token.user_email != user.email {
            return Err(AuthError::InvalidResetToken);
        }

        let new_password = generate_password(12);
        let mut current = self.find_user(&user.email).await?;
        current.password = hash_password(&new_password, self.hash_cost)?;
        self.storage.users.update(current).await?;

        token.used = true;
        self.storage.password_tokens.update(token).await?;
        self.send(
            &user.email,
            "[tsuru] Your new password",
            format!("Your new password is: {}\n", new_password),
        )
        .await
    }
}
