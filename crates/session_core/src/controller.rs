use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use shared::{
    domain::{Identity, IdentityId, ProfilePatch, Role, Session, SignUpMetadata},
    error::AuthError,
    protocol::AuthChangeEvent,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, info, warn};

use crate::{
    state::SessionState, AuthListener, IdentityProvider, LogNavigator, LogNotifier, Navigator,
    Notifier, ProfileStore, RoleResolver, Subscription,
};

pub const DEFAULT_SIGN_OUT_PATH: &str = "/login";

#[derive(Default)]
struct Lifecycle {
    started: bool,
    runtime: Option<Handle>,
    subscription: Option<Subscription>,
}

/// Single owner of the signed-in identity, its role and the pending flag.
///
/// State is only written from provider notifications, explicit sign-out and
/// role lookups. Every identity/session write bumps a generation counter
/// while holding the state lock; role lookups and the startup fetch carry
/// the generation they started from and are dropped when it moved on.
pub struct SessionController {
    provider: Arc<dyn IdentityProvider>,
    roles: Arc<dyn RoleResolver>,
    profiles: Arc<dyn ProfileStore>,
    notifier: Arc<dyn Notifier>,
    navigator: Arc<dyn Navigator>,
    sign_out_path: String,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl SessionController {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        roles: Arc<dyn RoleResolver>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            provider,
            roles,
            profiles,
            Arc::new(LogNotifier),
            Arc::new(LogNavigator),
            DEFAULT_SIGN_OUT_PATH,
        )
    }

    pub fn new_with_dependencies(
        provider: Arc<dyn IdentityProvider>,
        roles: Arc<dyn RoleResolver>,
        profiles: Arc<dyn ProfileStore>,
        notifier: Arc<dyn Notifier>,
        navigator: Arc<dyn Navigator>,
        sign_out_path: impl Into<String>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::default());
        Arc::new(Self {
            provider,
            roles,
            profiles,
            notifier,
            navigator,
            sign_out_path: sign_out_path.into(),
            state,
            generation: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Subscribes to provider notifications, then reads the current session.
    /// Returns once the startup read (and its role lookup) has settled.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.started {
                warn!("session controller already started");
                return;
            }
            lifecycle.started = true;
            lifecycle.runtime = Handle::try_current().ok();
        }

        let controller = Arc::downgrade(self);
        let listener: AuthListener = Arc::new(move |event, session| {
            if let Some(controller) = controller.upgrade() {
                controller.handle_change(event, session);
            }
        });
        let subscription = self.provider.subscribe(listener);
        self.lifecycle.lock().subscription = Some(subscription);
        info!("subscribed to identity provider changes");

        self.bootstrap().await;
    }

    pub fn stop(&self) {
        let subscription = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.started = false;
            lifecycle.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            info!("unsubscribed from identity provider changes");
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Waits until no role lookup or bootstrap is outstanding.
    pub async fn wait_until_settled(&self) -> SessionState {
        let mut receiver = self.state.subscribe();
        let settled = receiver
            .wait_for(|state| !state.is_resolving)
            .await
            .map(|state| state.clone());
        match settled {
            Ok(state) => state,
            Err(_) => self.snapshot(),
        }
    }

    /// Registers a new account. State follows through the provider's
    /// change notification, not from here.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
        role: Role,
    ) -> Result<Identity, AuthError> {
        let metadata = SignUpMetadata {
            display_name: display_name.to_string(),
            role,
        };
        match self.provider.sign_up(email, password, metadata).await {
            Ok(identity) => {
                info!(identity_id = %identity.id, %role, "sign up accepted");
                Ok(identity)
            }
            Err(err) => Err(self.surface("sign up", err.user_message(), err)),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        match self.provider.sign_in(email, password).await {
            Ok(identity) => {
                info!(identity_id = %identity.id, "sign in accepted");
                Ok(identity)
            }
            Err(err) => Err(self.surface("sign in", err.user_message(), err)),
        }
    }

    /// Local state is cleared and the redirect issued whether or not the
    /// provider call succeeded; a provider failure is still reported.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let outcome = self.provider.sign_out().await;

        self.state.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::AcqRel);
            *state = SessionState::signed_out();
        });
        self.navigator.redirect(&self.sign_out_path);

        match outcome {
            Ok(()) => {
                info!("signed out");
                Ok(())
            }
            Err(err) => Err(self.surface("sign out", err.user_message(), err)),
        }
    }

    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<(), AuthError> {
        let identity_id = self
            .state
            .borrow()
            .identity
            .as_ref()
            .map(|identity| identity.id);
        let Some(identity_id) = identity_id else {
            let err = AuthError::NoActiveIdentity;
            let message = format!("Error updating profile: {}", err.user_message());
            return Err(self.surface("update profile", message, err));
        };

        match self.profiles.update(identity_id, &patch).await {
            Ok(()) => {
                info!(%identity_id, "profile updated");
                Ok(())
            }
            Err(err) => {
                let message = format!("Error updating profile: {}", err.user_message());
                Err(self.surface("update profile", message, err))
            }
        }
    }

    fn surface(&self, operation: &'static str, message: String, err: AuthError) -> AuthError {
        error!(operation, error = %err, "authentication action failed");
        self.notifier.error(&message);
        err
    }

    fn handle_change(self: &Arc<Self>, event: AuthChangeEvent, session: Option<Session>) {
        let identity_id = session.as_ref().map(|session| session.identity.id);
        info!(?event, identity_id = ?identity_id, "identity provider state changed");

        let Some(generation) = self.apply_session(session, None) else {
            return;
        };
        if let Some(identity_id) = identity_id {
            self.schedule_role_lookup(identity_id, generation);
        }
    }

    /// Role lookups are never issued from inside the provider callback: the
    /// work is posted to the runtime and yields once before it starts.
    fn schedule_role_lookup(self: &Arc<Self>, identity_id: IdentityId, generation: u64) {
        let runtime = self
            .lifecycle
            .lock()
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        let Some(runtime) = runtime else {
            warn!(%identity_id, "no runtime available for role lookup; continuing without a role");
            self.settle_role(generation, None);
            return;
        };

        let controller = Arc::clone(self);
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            controller.resolve_role(identity_id, generation).await;
        });
    }

    async fn bootstrap(&self) {
        let observed = self.generation.load(Ordering::Acquire);
        info!("initializing identity session");

        match self.provider.current_session().await {
            Ok(session) => {
                let identity_id = session.as_ref().map(|session| session.identity.id);
                let Some(generation) = self.apply_session(session, Some(observed)) else {
                    debug!("startup session superseded by a provider notification");
                    return;
                };
                match identity_id {
                    Some(identity_id) => self.resolve_role(identity_id, generation).await,
                    None => info!("no existing session"),
                }
            }
            Err(err) => {
                error!(error = %err, "failed to initialize identity session");
                let settled = self.state.send_if_modified(|state| {
                    if self.generation.load(Ordering::Acquire) != observed {
                        return false;
                    }
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    *state = SessionState::signed_out();
                    true
                });
                if !settled {
                    debug!("startup failure superseded by a provider notification");
                }
            }
        }
    }

    async fn resolve_role(&self, identity_id: IdentityId, generation: u64) {
        let role = match self.roles.resolve(identity_id).await {
            Ok(role) => {
                info!(%identity_id, role = ?role, "resolved identity role");
                role
            }
            Err(err) => {
                warn!(%identity_id, error = %format!("{err:#}"), "role lookup failed; continuing without a role");
                None
            }
        };
        if !self.settle_role(generation, role) {
            debug!(%identity_id, "discarding role lookup for superseded session");
        }
    }

    /// Writes identity and session. With `expected`, nothing is written if
    /// another write landed since that generation was observed. Returns the
    /// generation of the write.
    fn apply_session(&self, session: Option<Session>, expected: Option<u64>) -> Option<u64> {
        let mut applied = None;
        self.state.send_if_modified(|state| {
            let current = self.generation.load(Ordering::Acquire);
            if expected.is_some_and(|expected| expected != current) {
                return false;
            }
            let next = current + 1;
            self.generation.store(next, Ordering::Release);
            applied = Some(next);

            let identity = session.as_ref().map(|session| session.identity.clone());
            let same_identity = matches!(
                (&state.identity, &identity),
                (Some(previous), Some(next)) if previous.id == next.id
            );
            if !same_identity {
                state.role = None;
            }
            state.is_resolving = identity.is_some();
            state.identity = identity;
            state.session = session;
            true
        });
        applied
    }

    fn settle_role(&self, generation: u64, role: Option<Role>) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            state.role = role;
            state.is_resolving = false;
            true
        })
    }
}
