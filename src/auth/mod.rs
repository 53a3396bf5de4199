pub mod mailer;
pub mod native;
pub mod password;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::permission::scheme::{APP, ROOT};
use crate::permission::{Context, Permission};
use crate::storage::models::User;
use crate::storage::{Storage, StorageError};

pub use mailer::{LogMailer, Mail, Mailer, MemoryMailer};
pub use native::NativeScheme;

/// Pseudo-app whose tokens may act on any app.
pub const INTERNAL_APP: &str = "internal";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("{0}")]
    AuthenticationFailure(String),

    #[error("User registration is disabled for non-admin users.")]
    RegistrationDisabled,

    #[error("user not found")]
    UserNotFound,

    #[error("this email is already registered")]
    UserExists,

    #[error("invalid email")]
    InvalidEmail,

    #[error("password length should be least 6 characters and at most 50 characters")]
    InvalidPassword,

    #[error("Authentication scheme does not allow this operation.")]
    NotManaged,

    #[error("invalid password reset token")]
    InvalidResetToken,

    #[error("app token mismatch, token for {token:?}, request for {request:?}")]
    AppTokenMismatch { token: String, request: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unable to send mail: {0}")]
    Mail(String),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("unable to sign token: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Principal {
    User(User),
    App(String),
}

/// Resolved identity of a request. Immutable once built.
#[derive(Debug, Clone)]
pub struct Token {
    value: String,
    principal: Principal,
    permissions: Arc<Vec<Permission>>,
}

impl Token {
    pub fn for_user(value: impl Into<String>, user: User, permissions: Vec<Permission>) -> Self {
        Self {
            value: value.into(),
            principal: Principal::User(user),
            permissions: Arc::new(permissions),
        }
    }

    pub fn for_app(value: impl Into<String>, app: impl Into<String>) -> Self {
        let app = app.into();
        let permission = if app == INTERNAL_APP {
            Permission::new(ROOT, Context::Global)
        } else {
            Permission::new(APP, Context::app(app.clone()))
        };
        Self {
            value: value.into(),
            principal: Principal::App(app),
            permissions: Arc::new(vec![permission]),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn user(&self) -> Option<&User> {
        match &self.principal {
            Principal::User(user) => Some(user),
            Principal::App(_) => None,
        }
    }

    /// Email for user tokens, app name for app tokens.
    pub fn user_name(&self) -> &str {
        match &self.principal {
            Principal::User(user) => &user.email,
            Principal::App(app) => app,
        }
    }

    pub fn app_name(&self) -> Option<&str> {
        match &self.principal {
            Principal::App(app) => Some(app),
            Principal::User(_) => None,
        }
    }

    pub fn is_app_token(&self) -> bool {
        matches!(self.principal, Principal::App(_))
    }

    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    /// App tokens may only act on the app they were issued for.
    pub fn ensure_app(&self, requested: &str) -> Result<(), AuthError> {
        match self.app_name() {
            Some(app) if app != INTERNAL_APP && app != requested => {
                Err(AuthError::AppTokenMismatch {
                    token: app.to_string(),
                    request: requested.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Pluggable authentication back end.
#[async_trait]
pub trait AuthScheme: Send + Sync {
    fn name(&self) -> &'static str;

    fn info(&self) -> Value {
        Value::Object(Default::default())
    }

    /// Exchange credentials for an opaque token value.
    async fn login(&self, email: &str, password: &str) -> Result<String, AuthError>;

    async fn logout(&self, token: &str) -> Result<(), AuthError>;

    /// Resolve a raw token value to its user. Unknown tokens yield `InvalidToken`.
    async fn auth(&self, token: &str) -> Result<User, AuthError>;

    async fn create(&self, email: &str, password: &str) -> Result<User, AuthError>;

    async fn remove(&self, user: &User) -> Result<(), AuthError>;

    fn managed(&self) -> Option<&dyn ManagedScheme> {
        None
    }
}

/// Extension implemented by schemes that own user passwords.
#[async_trait]
pub trait ManagedScheme: Send + Sync {
    async fn change_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError>;

    async fn start_password_reset(&self, user: &User) -> Result<(), AuthError>;

    async fn reset_password(&self, user: &User, reset_token: &str) -> Result<(), AuthError>;
}

/// Turns an `Authorization` header into a [`Token`].
#[derive(Clone)]
pub struct Authenticator {
    scheme: Arc<dyn AuthScheme>,
    storage: Storage,
}

impl Authenticator {
    pub fn new(scheme: Arc<dyn AuthScheme>, storage: Storage) -> Self {
        Self { scheme, storage }
    }

    pub fn scheme(&self) -> &Arc<dyn AuthScheme> {
        &self.scheme
    }

    pub async fn resolve(&self, header: &str) -> Result<Token, AuthError> {
        let value = token_value(header).ok_or(AuthError::InvalidToken)?;

        match self.scheme.auth(value).await {
            Ok(user) => return self.token_for_user(value, user).await,
            Err(AuthError::InvalidToken) => {}
            Err(e) => return Err(e),
        }

        if let Some(user) = self.storage.find_user_by_api_key(value).await? {
            return self.token_for_user(value, user).await;
        }

        if let Some(app_token) = self.storage.app_tokens.find(value).await? {
            return Ok(Token::for_app(value, app_token.app_name));
        }

        Err(AuthError::InvalidToken)
    }

    pub async fn token_for_user(&self, value: &str, user: User) -> Result<Token, AuthError> {
        let permissions = user_permissions(&self.storage, &user).await?;
        Ok(Token::for_user(value, user, permissions))
    }
}

/// Expand every role assignment of `user` into concrete permissions.
pub async fn user_permissions(
    storage: &Storage,
    user: &User,
) -> Result<Vec<Permission>, StorageError> {
    let mut permissions = Vec::new();
    for assignment in &user.roles {
        match storage.roles.find(&assignment.name).await? {
            Some(role) => permissions.extend(role.permissions_for(&assignment.context_value)),
            None => tracing::debug!(
                "user {} references missing role {}",
                user.email,
                assignment.name
            ),
        }
    }
    Ok(permissions)
}

/// Strip the `bearer`/`b` prefix from an Authorization header value.
pub fn token_value(header: &str) -> Option<&str> {
    let header = header.trim_start();
    let (kind, rest) = header.split_once(' ').unwrap_or((header, ""));
    let rest = rest.trim();
    let prefixed = kind.eq_ignore_ascii_case("bearer") || kind.eq_ignore_ascii_case("b");
    match (prefixed, rest.is_empty()) {
        (true, false) => Some(rest),
        (false, true) if !kind.is_empty() => Some(kind),
        _ => None,
    }
}
