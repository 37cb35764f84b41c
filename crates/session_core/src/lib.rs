use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Identity, IdentityId, ProfilePatch, Role, Session, SignUpMetadata},
    error::AuthError,
    protocol::AuthChangeEvent,
};
use tracing::{info, warn};

mod controller;
pub mod hosted;
mod listeners;
pub mod persistence;
mod state;

pub use controller::{SessionController, DEFAULT_SIGN_OUT_PATH};
pub use listeners::{ListenerRegistry, Subscription};
pub use state::{RoleStatus, SessionPhase, SessionState};

/// Callback invoked by the identity provider on every session change.
pub type AuthListener = Arc<dyn Fn(AuthChangeEvent, Option<Session>) + Send + Sync>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Listeners may be invoked while the provider holds internal locks, so
    /// they must not call back into the provider before returning.
    fn subscribe(&self, listener: AuthListener) -> Subscription;
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: SignUpMetadata,
    ) -> Result<Identity, AuthError>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
}

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve(&self, identity_id: IdentityId) -> Result<Option<Role>>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn update(&self, identity_id: IdentityId, patch: &ProfilePatch) -> Result<(), AuthError>;
}

/// User-visible failure surface (toasts, status lines).
pub trait Notifier: Send + Sync {
    fn error(&self, message: &str);
}

pub trait Navigator: Send + Sync {
    fn redirect(&self, path: &str);
}

pub struct MissingIdentityProvider;

#[async_trait]
impl IdentityProvider for MissingIdentityProvider {
    fn subscribe(&self, _listener: AuthListener) -> Subscription {
        Subscription::detached()
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Err(AuthError::Unknown(
            "identity provider is unavailable".to_string(),
        ))
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _metadata: SignUpMetadata,
    ) -> Result<Identity, AuthError> {
        Err(AuthError::Unknown(
            "identity provider is unavailable".to_string(),
        ))
    }

    async fn sign_in(&self, _email: &str, _password: &str) -> Result<Identity, AuthError> {
        Err(AuthError::Unknown(
            "identity provider is unavailable".to_string(),
        ))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        Err(AuthError::Unknown(
            "identity provider is unavailable".to_string(),
        ))
    }
}

pub struct MissingRoleResolver;

#[async_trait]
impl RoleResolver for MissingRoleResolver {
    async fn resolve(&self, identity_id: IdentityId) -> Result<Option<Role>> {
        Err(anyhow!("role lookup unavailable for identity {identity_id}"))
    }
}

pub struct MissingProfileStore;

#[async_trait]
impl ProfileStore for MissingProfileStore {
    async fn update(
        &self,
        identity_id: IdentityId,
        _patch: &ProfilePatch,
    ) -> Result<(), AuthError> {
        Err(AuthError::Unknown(format!(
            "profile store unavailable for identity {identity_id}"
        )))
    }
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn error(&self, message: &str) {
        warn!(message, "user-visible error");
    }
}

pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect(&self, path: &str) {
        info!(path, "navigation requested");
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod controller_tests;

#[cfg(test)]
#[path = "tests/hosted_tests.rs"]
mod hosted_tests;
