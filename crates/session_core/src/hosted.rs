//! Client for the hosted auth/database backend: token endpoints under
//! `auth/v1`, profile rows under `rest/v1`.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Identity, IdentityId, ProfilePatch, Role, Session, SignUpMetadata},
    error::AuthError,
    protocol::{
        AuthChangeEvent, PasswordGrantRequest, ProfileRoleRow, ProviderErrorBody,
        RefreshGrantRequest, SignUpRequest, SignUpResponse, TokenResponse,
    },
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::{
    persistence::SessionStore, AuthListener, IdentityProvider, ListenerRegistry, ProfileStore,
    RoleResolver, Subscription,
};

pub const DEFAULT_PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Clone)]
pub struct HostedAuthConfig {
    pub base_url: String,
    pub api_key: String,
    pub profiles_table: String,
}

impl HostedAuthConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            profiles_table: DEFAULT_PROFILES_TABLE.to_string(),
        }
    }
}

pub struct HostedAuthClient {
    http: Client,
    base: Url,
    api_key: String,
    profiles_table: String,
    store: Arc<dyn SessionStore>,
    session: Mutex<Option<Session>>,
    listeners: ListenerRegistry,
}

impl HostedAuthClient {
    pub fn new(config: HostedAuthConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .with_context(|| format!("invalid auth backend url '{}'", config.base_url))?;
        if config.profiles_table.trim().is_empty() {
            return Err(anyhow!("profiles table name must not be empty"));
        }
        Ok(Self {
            http: Client::new(),
            base,
            api_key: config.api_key,
            profiles_table: config.profiles_table,
            store,
            session: Mutex::new(None),
            listeners: ListenerRegistry::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base
            .join(path)
            .map_err(|err| AuthError::Unknown(format!("invalid endpoint '{path}': {err}")))
    }

    fn request(&self, builder: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(bearer.unwrap_or(&self.api_key))
    }

    /// Stores the session, persists it and notifies listeners while the slot
    /// is still locked.
    async fn install_session(
        &self,
        slot: &mut Option<Session>,
        session: Session,
        event: AuthChangeEvent,
    ) {
        *slot = Some(session.clone());
        if let Err(err) = self.store.save(&session).await {
            warn!(error = %format!("{err:#}"), "failed to persist session");
        }
        self.listeners.emit(event, Some(session));
    }

    async fn drop_session(&self, slot: &mut Option<Session>) {
        *slot = None;
        if let Err(err) = self.store.clear().await {
            warn!(error = %format!("{err:#}"), "failed to clear persisted session");
        }
        self.listeners.emit(AuthChangeEvent::SignedOut, None);
    }

    /// Fills an empty slot from the persisted store.
    async fn load_stored(&self, slot: &mut Option<Session>) {
        if slot.is_some() {
            return;
        }
        match self.store.load().await {
            Ok(stored) => *slot = stored,
            Err(err) => warn!(error = %format!("{err:#}"), "ignoring unreadable persisted session"),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");
        let response: TokenResponse = send_json(self.request(
            self.http.post(url).json(&RefreshGrantRequest {
                refresh_token: refresh_token.to_string(),
            }),
            None,
        ))
        .await?;
        Ok(response.into_session(Utc::now()))
    }

    async fn bearer_token(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    fn profile_url(&self, identity_id: IdentityId, select: Option<&str>) -> Result<Url, AuthError> {
        let mut url = self.endpoint(&format!("rest/v1/{}", self.profiles_table))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &format!("eq.{identity_id}"));
            if let Some(select) = select {
                query.append_pair("select", select);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl IdentityProvider for HostedAuthClient {
    fn subscribe(&self, listener: AuthListener) -> Subscription {
        self.listeners.register(listener)
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let mut slot = self.session.lock().await;
        self.load_stored(&mut slot).await;

        let Some(session) = slot.clone() else {
            return Ok(None);
        };
        if !session.is_expired(Utc::now()) {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.as_deref() else {
            info!(identity_id = %session.identity.id, "session expired without refresh token");
            self.drop_session(&mut slot).await;
            return Ok(None);
        };

        match self.refresh(refresh_token).await {
            Ok(refreshed) => {
                info!(identity_id = %refreshed.identity.id, "session refreshed");
                self.install_session(&mut slot, refreshed.clone(), AuthChangeEvent::TokenRefreshed)
                    .await;
                Ok(Some(refreshed))
            }
            Err(AuthError::NetworkFailure(message)) => Err(AuthError::NetworkFailure(message)),
            Err(err) => {
                warn!(error = %err, "session refresh rejected; dropping session");
                self.drop_session(&mut slot).await;
                Ok(None)
            }
        }
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: SignUpMetadata,
    ) -> Result<Identity, AuthError> {
        let url = self.endpoint("auth/v1/signup")?;
        let response: SignUpResponse = send_json(self.request(
            self.http.post(url).json(&SignUpRequest {
                email: email.to_string(),
                password: password.to_string(),
                data: metadata,
            }),
            None,
        ))
        .await?;

        match response {
            SignUpResponse::Session(tokens) => {
                let session = tokens.into_session(Utc::now());
                let identity = session.identity.clone();
                let mut slot = self.session.lock().await;
                self.install_session(&mut slot, session, AuthChangeEvent::SignedIn)
                    .await;
                Ok(identity)
            }
            SignUpResponse::User(user) => {
                info!(identity_id = %user.id, "account created; confirmation pending");
                Ok(user.into())
            }
        }
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let tokens: TokenResponse = send_json(self.request(
            self.http.post(url).json(&PasswordGrantRequest {
                email: email.to_string(),
                password: password.to_string(),
            }),
            None,
        ))
        .await?;

        let session = tokens.into_session(Utc::now());
        let identity = session.identity.clone();
        let mut slot = self.session.lock().await;
        self.install_session(&mut slot, session, AuthChangeEvent::SignedIn)
            .await;
        Ok(identity)
    }

    /// The local session is dropped even when the backend rejects the
    /// logout; the remote failure is still returned.
    async fn sign_out(&self) -> Result<(), AuthError> {
        let mut slot = self.session.lock().await;
        self.load_stored(&mut slot).await;
        let remote = match slot.as_ref() {
            Some(session) => match self.endpoint("auth/v1/logout") {
                Ok(url) => {
                    send_empty(self.request(self.http.post(url), Some(&session.access_token)))
                        .await
                }
                Err(err) => Err(err),
            },
            None => Ok(()),
        };
        self.drop_session(&mut slot).await;
        remote
    }
}

#[async_trait]
impl RoleResolver for HostedAuthClient {
    async fn resolve(&self, identity_id: IdentityId) -> Result<Option<Role>> {
        let bearer = self.bearer_token().await;
        let url = self.profile_url(identity_id, Some("role"))?;
        let rows: Vec<ProfileRoleRow> =
            send_json(self.request(self.http.get(url), bearer.as_deref()))
                .await
                .with_context(|| format!("failed to load role for identity {identity_id}"))?;

        match rows.into_iter().next().and_then(|row| row.role) {
            Some(raw) => Ok(Some(raw.parse::<Role>()?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProfileStore for HostedAuthClient {
    async fn update(&self, identity_id: IdentityId, patch: &ProfilePatch) -> Result<(), AuthError> {
        let Some(bearer) = self.bearer_token().await else {
            return Err(AuthError::NoActiveIdentity);
        };
        if patch.is_empty() {
            return Ok(());
        }
        let url = self.profile_url(identity_id, None)?;
        send_empty(
            self.request(self.http.patch(url), Some(&bearer))
                .header("Prefer", "return=minimal")
                .json(patch),
        )
        .await
    }
}

/// Anything that failed before a status line arrived is a transport problem,
/// including connections the server dropped mid-request.
fn transport_error(err: reqwest::Error) -> AuthError {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        return AuthError::NetworkFailure(err.to_string());
    }
    AuthError::classify(err.status().map(|status| status.as_u16()), err.to_string())
}

async fn checked(builder: RequestBuilder) -> Result<Response, AuthError> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ProviderErrorBody>(&raw)
        .map(|body| body.best_message())
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or(raw);
    Err(AuthError::classify(Some(status.as_u16()), message))
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, AuthError> {
    checked(builder)
        .await?
        .json::<T>()
        .await
        .map_err(|err| AuthError::Unknown(format!("unexpected response from auth backend: {err}")))
}

async fn send_empty(builder: RequestBuilder) -> Result<(), AuthError> {
    checked(builder).await.map(|_| ())
}
