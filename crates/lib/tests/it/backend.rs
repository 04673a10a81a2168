//! The HTTP backend against a local mock of the hosted API.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use portal::{
    Portal,
    backend::{AuthProvider, ChangeFeed, DataSource, EventFilter, RestBackend},
    config::{BackendConfig, SyncConfig},
    reconcile::Change,
    records::{Collection, RecordId},
    session::Session,
    sync::SyncState,
};
use serde_json::{Value, json};

use crate::helpers;

const ANON_KEY: &str = "anon-key";
const TOKEN: &str = "token-1";
const USER: &str = "user-1";
const PASSWORD: &str = "secret";

#[derive(Default)]
struct MockApi {
    tables: HashMap<String, Vec<Value>>,
    next_id: u64,
    /// `order` query of every GET, in arrival order
    orders: Vec<Option<String>>,
    revoked: bool,
}

type Shared = Arc<Mutex<MockApi>>;

fn check_auth(api: &MockApi, headers: &HeaderMap) -> Result<(), StatusCode> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if header("apikey") != Some(ANON_KEY) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let bearer = format!("Bearer {TOKEN}");
    if api.revoked || header("authorization") != Some(bearer.as_str()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn token(Json(body): Json<Value>) -> Response {
    if body["password"] != PASSWORD {
        let error = json!({"error_description": "Invalid login credentials"});
        return (StatusCode::BAD_REQUEST, Json(error)).into_response();
    }
    Json(json!({
        "access_token": TOKEN,
        "token_type": "bearer",
        "user": {"id": USER, "email": body["email"]},
    }))
    .into_response()
}

async fn signup(Json(body): Json<Value>) -> StatusCode {
    if body["email"] == "taken@b.com" {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::OK
    }
}

async fn logout() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn select_rows(
    State(api): State<Shared>,
    Path(table): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, StatusCode> {
    let mut api = api.lock().unwrap();
    check_auth(&api, &headers)?;
    let order = query.get("order").cloned();
    api.orders.push(order.clone());
    let mut rows = api.tables.get(&table).cloned().unwrap_or_default();
    if order.as_deref() == Some("created_at.desc") {
        rows.sort_by(|a, b| b["created_at"].as_str().cmp(&a["created_at"].as_str()));
    }
    Ok(Json(rows))
}

async fn insert_row(
    State(api): State<Shared>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(mut row): Json<Value>,
) -> StatusCode {
    let mut api = api.lock().unwrap();
    if let Err(status) = check_auth(&api, &headers) {
        return status;
    }
    api.next_id += 1;
    row["id"] = json!(api.next_id);
    api.tables.entry(table).or_default().push(row);
    StatusCode::CREATED
}

async fn delete_rows(
    State(api): State<Shared>,
    Path(table): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> StatusCode {
    let mut api = api.lock().unwrap();
    if let Err(status) = check_auth(&api, &headers) {
        return status;
    }
    let Some(id) = query.get("id").and_then(|f| f.strip_prefix("eq.")) else {
        return StatusCode::BAD_REQUEST;
    };
    if let Some(rows) = api.tables.get_mut(&table) {
        rows.retain(|row| RecordId::from_record(row).as_ref().map(RecordId::as_str) != Some(id));
    }
    StatusCode::NO_CONTENT
}

/// Serve the mock API on an ephemeral port and return its base URL.
async fn serve(api: Shared) -> String {
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/signup", post(signup))
        .route("/auth/v1/logout", post(logout))
        .route(
            "/rest/v1/{table}",
            get(select_rows).post(insert_row).delete(delete_rows),
        )
        .with_state(api);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn setup() -> (Shared, RestBackend) {
    let api = Shared::default();
    let url = serve(api.clone()).await;
    let backend =
        RestBackend::new(&BackendConfig::new(url, ANON_KEY), Duration::from_millis(20)).unwrap();
    (api, backend)
}

fn session() -> Session {
    Session::new(TOKEN, USER)
}

#[tokio::test]
async fn test_sign_in_broadcasts_session() {
    let (_api, backend) = setup().await;
    let mut changes = backend.on_session_change();

    let err = backend.sign_in("a@b.com", "wrong").await.unwrap_err();
    assert!(err.is_authentication_error());
    assert_eq!(backend.get_session().await.unwrap(), None);

    let session = backend.sign_in("a@b.com", PASSWORD).await.unwrap();
    assert_eq!(session.user_id, USER);
    assert_eq!(session.access_token, TOKEN);
    assert_eq!(session.email.as_deref(), Some("a@b.com"));
    assert_eq!(changes.recv().await.unwrap(), Some(session.clone()));

    backend.sign_out().await.unwrap();
    assert_eq!(changes.recv().await.unwrap(), None);
    assert_eq!(backend.get_session().await.unwrap(), None);
}

#[tokio::test]
async fn test_sign_up_existing_email() {
    let (_api, backend) = setup().await;
    backend.sign_up("new@b.com", PASSWORD).await.unwrap();
    let err = backend.sign_up("taken@b.com", PASSWORD).await.unwrap_err();
    assert!(err.is_authentication_error());
}

#[tokio::test]
async fn test_select_sends_order_and_credentials() {
    let (api, backend) = setup().await;
    api.lock().unwrap().tables.insert(
        "intelligence".to_string(),
        vec![
            json!({"id": 1, "text": "old", "created_at": "2024-01-01T00:00:00Z"}),
            json!({"id": 2, "text": "new", "created_at": "2024-02-01T00:00:00Z"}),
        ],
    );

    let rows = backend
        .select_all(&session(), Collection::Feedback, Collection::Feedback.load_order())
        .await
        .unwrap();
    assert_eq!(rows[0]["text"], "new");
    assert_eq!(
        api.lock().unwrap().orders,
        vec![Some("created_at.desc".to_string())]
    );

    backend
        .select_all(&session(), Collection::Projects, None)
        .await
        .unwrap();
    assert_eq!(api.lock().unwrap().orders[1], None);
}

#[tokio::test]
async fn test_insert_and_delete() {
    let (api, backend) = setup().await;

    backend
        .insert(
            &session(),
            Collection::Projects,
            json!({"name": "Vision", "user_id": USER, "status": "active"}),
        )
        .await
        .unwrap();
    assert_eq!(api.lock().unwrap().tables["projects"].len(), 1);

    backend
        .delete_by_id(&session(), Collection::Projects, &RecordId::from(1u64))
        .await
        .unwrap();
    assert!(api.lock().unwrap().tables["projects"].is_empty());
}

#[tokio::test]
async fn test_rejected_token_clears_session() {
    let (api, backend) = setup().await;
    let session = backend.sign_in("a@b.com", PASSWORD).await.unwrap();
    api.lock().unwrap().revoked = true;

    let err = backend
        .select_all(&session, Collection::Assets, None)
        .await
        .unwrap_err();
    assert!(err.is_authentication_error());
    assert_eq!(backend.get_session().await.unwrap(), None);
}

#[tokio::test]
async fn test_poll_feed_reports_changes() {
    let (api, backend) = setup().await;
    api.lock()
        .unwrap()
        .tables
        .insert("assets".to_string(), vec![json!({"id": 1, "type": "model"})]);

    let mut feed = backend
        .subscribe(&session(), Collection::Assets, EventFilter::All)
        .await
        .unwrap();

    {
        let mut api = api.lock().unwrap();
        let rows = api.tables.get_mut("assets").unwrap();
        rows.clear();
        rows.push(json!({"id": 2, "type": "dataset"}));
    }

    let first = helpers::within(feed.next()).await.unwrap().unwrap();
    assert_eq!(first.change, Change::Insert(json!({"id": 2, "type": "dataset"})));
    let second = helpers::within(feed.next()).await.unwrap().unwrap();
    assert_eq!(second.change, Change::Delete(RecordId::from(1u64)));

    backend.unsubscribe(feed.id()).await.unwrap();
    assert!(helpers::within(feed.next()).await.is_none());
}

#[tokio::test]
async fn test_subscribe_fails_when_baseline_fails() {
    let (api, backend) = setup().await;
    api.lock().unwrap().revoked = true;

    let err = backend
        .subscribe(&session(), Collection::Projects, EventFilter::All)
        .await
        .unwrap_err();
    assert!(err.is_subscription_error());
}

#[tokio::test]
async fn test_portal_over_http() {
    let (api, backend) = setup().await;
    api.lock().unwrap().tables.insert(
        "projects".to_string(),
        vec![json!({"id": 1, "name": "P1", "status": "active", "user_id": USER})],
    );
    let config = SyncConfig {
        poll_interval_ms: 20,
        ..helpers::fast_config()
    };
    let portal = Portal::new(Arc::new(backend), config);
    portal.start().await;

    portal.login("a@b.com", PASSWORD).await.unwrap();
    helpers::within(portal.engine().wait_for(SyncState::Live))
        .await
        .unwrap();
    assert_eq!(portal.mirrors().projects.len(), 1);

    // Another client adds a project; the poll picks it up
    api.lock().unwrap().tables.get_mut("projects").unwrap().push(
        json!({"id": 2, "name": "P2", "status": "active", "user_id": USER}),
    );
    helpers::wait_until("polled insert", || portal.mirrors().projects.len() == 2).await;

    portal.gateway().create_asset("model").await.unwrap();
    let assets = portal.mirrors().assets.snapshot();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].kind, "model");

    portal.logout().await.unwrap();
    helpers::within(portal.engine().wait_for(SyncState::Idle))
        .await
        .unwrap();
    assert!(portal.mirrors().is_empty());
}
