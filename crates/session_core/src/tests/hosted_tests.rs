use super::*;
use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use shared::domain::IdentityMetadata;
use tokio::{net::TcpListener, sync::Mutex};

use crate::{
    hosted::{HostedAuthClient, HostedAuthConfig},
    persistence::{MemorySessionStore, SessionStore},
};

const STUDENT_ID: &str = "6f1e2d3c-0000-4000-8000-000000000001";
const ROLELESS_ID: &str = "6f1e2d3c-0000-4000-8000-000000000002";
const BAD_ROLE_ID: &str = "6f1e2d3c-0000-4000-8000-000000000003";

fn identity_id(raw: &str) -> IdentityId {
    IdentityId(raw.parse().expect("uuid"))
}

#[derive(Clone, Default)]
struct BackendState {
    refreshes: Arc<Mutex<u32>>,
    logouts: Arc<Mutex<Vec<Option<String>>>>,
    profile_patches: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
}

fn token_body(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": refresh_token,
        "user": {
            "id": STUDENT_ID,
            "email": "student@example.com",
            "user_metadata": { "name": "Stu", "role": "student" }
        }
    })
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn handle_token(
    State(state): State<BackendState>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    match query.get("grant_type").map(String::as_str) {
        Some("password") if body["password"] == "correct" => {
            (StatusCode::OK, Json(token_body("access-token", "refresh-ok")))
        }
        Some("password") => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })),
        ),
        Some("refresh_token") if body["refresh_token"] == "refresh-ok" => {
            *state.refreshes.lock().await += 1;
            (
                StatusCode::OK,
                Json(token_body("refreshed-access", "refresh-ok")),
            )
        }
        Some("refresh_token") => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid Refresh Token: Refresh Token Not Found"
            })),
        ),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "msg": "unsupported grant type" })),
        ),
    }
}

async fn handle_signup(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let email = body["email"].as_str().unwrap_or_default();
    if email == "taken@example.com" {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "code": 422, "msg": "User already registered" })),
        );
    }
    if email.starts_with("confirm") {
        return (
            StatusCode::OK,
            Json(json!({
                "id": STUDENT_ID,
                "email": email,
                "user_metadata": body["data"].clone()
            })),
        );
    }
    (StatusCode::OK, Json(token_body("access-token", "refresh-ok")))
}

async fn handle_logout(State(state): State<BackendState>, headers: HeaderMap) -> StatusCode {
    state.logouts.lock().await.push(authorization(&headers));
    StatusCode::NO_CONTENT
}

async fn handle_profile_role(
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let id = query.get("id").cloned().unwrap_or_default();
    if query.get("select").map(String::as_str) != Some("role") {
        return (StatusCode::BAD_REQUEST, Json(json!({ "message": "select" })));
    }
    let rows = if id == format!("eq.{STUDENT_ID}") {
        json!([{ "role": "student" }])
    } else if id == format!("eq.{BAD_ROLE_ID}") {
        json!([{ "role": "admin" }])
    } else {
        json!([])
    };
    (StatusCode::OK, Json(rows))
}

async fn handle_profile_patch(
    State(state): State<BackendState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    state.profile_patches.lock().await.push((
        query.get("id").cloned().unwrap_or_default(),
        authorization(&headers),
        body,
    ));
    StatusCode::NO_CONTENT
}

async fn spawn_backend() -> anyhow::Result<(String, BackendState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = BackendState::default();
    let app = Router::new()
        .route("/auth/v1/token", post(handle_token))
        .route("/auth/v1/signup", post(handle_signup))
        .route("/auth/v1/logout", post(handle_logout))
        .route(
            "/rest/v1/profiles",
            get(handle_profile_role).patch(handle_profile_patch),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

/// Accepts every connection and closes it before answering.
async fn spawn_hangup_backend() -> anyhow::Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });
    Ok(format!("http://{addr}"))
}

async fn unreachable_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}

type EventLog = Arc<SyncMutex<Vec<(AuthChangeEvent, Option<Session>)>>>;

fn record_events(client: &HostedAuthClient) -> (EventLog, Subscription) {
    let log: EventLog = Arc::new(SyncMutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = client.subscribe(Arc::new(move |event, session| {
        sink.lock().push((event, session));
    }));
    (log, subscription)
}

fn client_for(base_url: &str, store: Arc<dyn SessionStore>) -> HostedAuthClient {
    HostedAuthClient::new(HostedAuthConfig::new(base_url, "anon-key"), store).expect("client")
}

fn expired_session(refresh_token: &str) -> Session {
    Session {
        access_token: "old-access".into(),
        refresh_token: Some(refresh_token.into()),
        expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
        identity: Identity {
            id: identity_id(STUDENT_ID),
            email: "student@example.com".into(),
            metadata: IdentityMetadata::default(),
        },
    }
}

#[tokio::test]
async fn sign_in_stores_session_and_notifies_listeners() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let store = Arc::new(MemorySessionStore::new());
    let client = client_for(&base_url, Arc::clone(&store) as Arc<dyn SessionStore>);
    let (events, _subscription) = record_events(&client);

    let identity = client
        .sign_in("student@example.com", "correct")
        .await
        .expect("sign in");
    assert_eq!(identity.id, identity_id(STUDENT_ID));
    assert_eq!(identity.metadata.role, Some(Role::Student));

    let events = events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, AuthChangeEvent::SignedIn);
    let session = events[0].1.clone().expect("session in event");
    assert_eq!(session.access_token, "access-token");
    assert!(session.expires_at.is_some());

    assert_eq!(store.load().await.expect("load"), Some(session.clone()));
    assert_eq!(
        client.current_session().await.expect("current"),
        Some(session)
    );
}

#[tokio::test]
async fn rejected_credentials_map_to_invalid_credentials() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));
    let (events, _subscription) = record_events(&client);

    let err = client
        .sign_in("student@example.com", "wrong")
        .await
        .expect_err("rejected");
    assert_eq!(err, AuthError::InvalidCredentials);
    assert!(events.lock().is_empty());
    assert_eq!(client.current_session().await.expect("current"), None);
}

#[tokio::test]
async fn duplicate_sign_up_maps_to_already_exists() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));

    let err = client
        .sign_up(
            "taken@example.com",
            "secret",
            SignUpMetadata {
                display_name: "Taken".into(),
                role: Role::Student,
            },
        )
        .await
        .expect_err("duplicate");
    assert_eq!(err, AuthError::AlreadyExists);
}

#[tokio::test]
async fn sign_up_pending_confirmation_has_no_session() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));
    let (events, _subscription) = record_events(&client);

    let identity = client
        .sign_up(
            "confirm-me@example.com",
            "secret",
            SignUpMetadata {
                display_name: "Pending".into(),
                role: Role::Employer,
            },
        )
        .await
        .expect("sign up");
    assert_eq!(identity.email, "confirm-me@example.com");
    assert_eq!(identity.metadata.role, Some(Role::Employer));
    assert_eq!(identity.metadata.display_name.as_deref(), Some("Pending"));

    assert!(events.lock().is_empty());
    assert_eq!(client.current_session().await.expect("current"), None);
}

#[tokio::test]
async fn sign_up_with_auto_confirm_signs_in() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));
    let (events, _subscription) = record_events(&client);

    client
        .sign_up(
            "student@example.com",
            "secret",
            SignUpMetadata {
                display_name: "Stu".into(),
                role: Role::Student,
            },
        )
        .await
        .expect("sign up");

    assert_eq!(events.lock()[0].0, AuthChangeEvent::SignedIn);
    assert!(client.current_session().await.expect("current").is_some());
}

#[tokio::test]
async fn expired_session_is_refreshed_from_store() {
    let (base_url, state) = spawn_backend().await.expect("backend");
    let store = Arc::new(MemorySessionStore::with_session(expired_session(
        "refresh-ok",
    )));
    let client = client_for(&base_url, Arc::clone(&store) as Arc<dyn SessionStore>);
    let (events, _subscription) = record_events(&client);

    let session = client
        .current_session()
        .await
        .expect("current")
        .expect("refreshed session");
    assert_eq!(session.access_token, "refreshed-access");
    assert_eq!(*state.refreshes.lock().await, 1);
    assert_eq!(events.lock()[0].0, AuthChangeEvent::TokenRefreshed);
    assert_eq!(store.load().await.expect("load"), Some(session));
}

#[tokio::test]
async fn expired_session_with_rejected_refresh_is_dropped() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let store = Arc::new(MemorySessionStore::with_session(expired_session("revoked")));
    let client = client_for(&base_url, Arc::clone(&store) as Arc<dyn SessionStore>);
    let (events, _subscription) = record_events(&client);

    assert_eq!(client.current_session().await.expect("current"), None);
    assert_eq!(
        *events.lock(),
        vec![(AuthChangeEvent::SignedOut, None::<Session>)]
    );
    assert_eq!(store.load().await.expect("load"), None);
}

#[tokio::test]
async fn sign_out_revokes_remotely_and_clears_locally() {
    let (base_url, state) = spawn_backend().await.expect("backend");
    let store = Arc::new(MemorySessionStore::new());
    let client = client_for(&base_url, Arc::clone(&store) as Arc<dyn SessionStore>);
    client
        .sign_in("student@example.com", "correct")
        .await
        .expect("sign in");
    let (events, _subscription) = record_events(&client);

    client.sign_out().await.expect("sign out");

    assert_eq!(
        *state.logouts.lock().await,
        vec![Some("Bearer access-token".to_string())]
    );
    assert_eq!(store.load().await.expect("load"), None);
    assert_eq!(events.lock()[0].0, AuthChangeEvent::SignedOut);
    assert_eq!(client.current_session().await.expect("current"), None);
}

#[tokio::test]
async fn resolves_roles_from_profile_rows() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));

    assert_eq!(
        client
            .resolve(identity_id(STUDENT_ID))
            .await
            .expect("student"),
        Some(Role::Student)
    );
    assert_eq!(
        client
            .resolve(identity_id(ROLELESS_ID))
            .await
            .expect("no row"),
        None
    );
    let err = client
        .resolve(identity_id(BAD_ROLE_ID))
        .await
        .expect_err("unknown role");
    assert!(err.to_string().contains("unknown role"));
}

#[tokio::test]
async fn profile_update_requires_session_and_sends_bearer() {
    let (base_url, state) = spawn_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));
    let patch = ProfilePatch {
        display_name: Some("Renamed".into()),
    };

    let err = client
        .update(identity_id(STUDENT_ID), &patch)
        .await
        .expect_err("no session");
    assert_eq!(err, AuthError::NoActiveIdentity);
    assert!(state.profile_patches.lock().await.is_empty());

    client
        .sign_in("student@example.com", "correct")
        .await
        .expect("sign in");
    client
        .update(identity_id(STUDENT_ID), &patch)
        .await
        .expect("update");

    let patches = state.profile_patches.lock().await.clone();
    assert_eq!(
        patches,
        vec![(
            format!("eq.{STUDENT_ID}"),
            Some("Bearer access-token".to_string()),
            json!({ "name": "Renamed" })
        )]
    );
}

#[tokio::test]
async fn unreachable_backend_is_a_network_failure() {
    let base_url = unreachable_base_url().await;
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));
    let err = client
        .sign_in("student@example.com", "correct")
        .await
        .expect_err("unreachable");
    assert!(matches!(err, AuthError::NetworkFailure(_)), "{err:?}");
}

#[tokio::test]
async fn dropped_connection_is_a_network_failure() {
    let base_url = spawn_hangup_backend().await.expect("backend");
    let client = client_for(&base_url, Arc::new(MemorySessionStore::new()));

    let err = client
        .sign_in("student@example.com", "correct")
        .await
        .expect_err("connection closed");
    assert!(matches!(err, AuthError::NetworkFailure(_)), "{err:?}");
    assert!(!err.user_message().contains(&base_url));
}

#[tokio::test]
async fn sign_out_with_unreachable_backend_still_drops_session() {
    let base_url = unreachable_base_url().await;
    let mut persisted = expired_session("refresh-ok");
    persisted.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
    let store = Arc::new(MemorySessionStore::with_session(persisted));
    let client = client_for(&base_url, Arc::clone(&store) as Arc<dyn SessionStore>);
    let (events, _subscription) = record_events(&client);

    let err = client.sign_out().await.expect_err("logout unreachable");
    assert!(matches!(err, AuthError::NetworkFailure(_)), "{err:?}");

    assert_eq!(
        *events.lock(),
        vec![(AuthChangeEvent::SignedOut, None::<Session>)]
    );
    assert_eq!(store.load().await.expect("load"), None);
    assert_eq!(client.current_session().await.expect("current"), None);
}

#[test]
fn rejects_invalid_base_url() {
    let result = HostedAuthClient::new(
        HostedAuthConfig::new("not a url", "key"),
        Arc::new(MemorySessionStore::new()),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn controller_over_hosted_client_resolves_role_after_sign_in() {
    let (base_url, _state) = spawn_backend().await.expect("backend");
    let client = Arc::new(client_for(&base_url, Arc::new(MemorySessionStore::new())));
    let controller = SessionController::new(
        Arc::clone(&client) as Arc<dyn IdentityProvider>,
        Arc::clone(&client) as Arc<dyn RoleResolver>,
        Arc::clone(&client) as Arc<dyn ProfileStore>,
    );
    controller.start().await;
    assert_eq!(controller.snapshot().phase(), SessionPhase::Anonymous);

    controller
        .sign_in("student@example.com", "correct")
        .await
        .expect("sign in");
    let state = tokio::time::timeout(Duration::from_secs(5), controller.wait_until_settled())
        .await
        .expect("settled");
    assert_eq!(
        state.phase(),
        SessionPhase::Authenticated(RoleStatus::Resolved(Role::Student))
    );

    controller.sign_out().await.expect("sign out");
    assert_eq!(controller.snapshot(), SessionState::signed_out());
}
