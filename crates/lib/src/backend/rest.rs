//! HTTP backend for a hosted auth + REST data API.
//!
//! Auth goes through `/auth/v1`, collection access through `/rest/v1/{table}`.
//! Every request carries the anonymous key in the `apikey` header; data requests
//! add the session's bearer token. The hosted API has no push channel reachable
//! from here, so change feeds poll `select_all` and diff consecutive snapshots.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use super::{
    AuthProvider, ChangeFeed, DataError, DataSource, EventFilter, Subscription, SubscriptionError,
    SubscriptionId, poll::diff_snapshots,
};
use crate::{
    Result,
    config::{BackendConfig, ConfigError},
    records::{Collection, OrderBy, RecordId},
    session::{AuthError, Session},
};

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

/// Error body returned by the auth API.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default, alias = "error_description", alias = "msg")]
    message: Option<String>,
}

/// Client for the hosted backend.
pub struct RestBackend {
    client: Client,
    base: Url,
    anon_key: String,
    poll_interval: Duration,
    current: Mutex<Option<Session>>,
    session_tx: broadcast::Sender<Option<Session>>,
    feeds: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_feed: Mutex<u64>,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base", &self.base.as_str())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl RestBackend {
    /// Create a client for `config`, polling change feeds every `poll_interval`.
    pub fn new(config: &BackendConfig, poll_interval: Duration) -> Result<Self> {
        let mut base = config.base_url()?;
        if config.anon_key.is_empty() {
            return Err(ConfigError::Missing {
                name: crate::config::ANON_KEY_VAR,
            }
            .into());
        }
        // Url::join drops the last segment unless the path ends with a slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let (session_tx, _) = broadcast::channel(16);
        Ok(Self {
            client: Client::new(),
            base,
            anon_key: config.anon_key.clone(),
            poll_interval,
            current: Mutex::new(None),
            session_tx,
            feeds: Mutex::new(HashMap::new()),
            next_feed: Mutex::new(0),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| {
            ConfigError::InvalidUrl {
                url: format!("{}{path}", self.base),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn table_url(&self, collection: Collection) -> Result<Url> {
        self.endpoint(&format!("rest/v1/{}", collection.name()))
    }

    fn authed(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
    }

    fn set_current(&self, session: Option<Session>) {
        *self.current.lock().unwrap() = session.clone();
        let _ = self.session_tx.send(session);
    }

    async fn error_message(response: Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiError>(&body) {
            Ok(ApiError {
                message: Some(message),
            }) => message,
            _ if body.is_empty() => status.to_string(),
            _ => body,
        }
    }

    /// Map a failed data response to the crate error.
    async fn data_failure(
        &self,
        response: Response,
        collection: Collection,
        write: bool,
    ) -> crate::Error {
        let status = response.status();
        let reason = Self::error_message(response).await;
        match status {
            StatusCode::UNAUTHORIZED => {
                // The token is no longer accepted; drop it like a revocation
                self.set_current(None);
                AuthError::SessionExpired.into()
            }
            StatusCode::FORBIDDEN => DataError::Unauthorized { reason }.into(),
            _ if write => DataError::WriteFailed {
                collection: collection.name().to_string(),
                reason,
            }
            .into(),
            _ => DataError::QueryFailed {
                collection: collection.name().to_string(),
                reason,
            }
            .into(),
        }
    }

    fn unavailable(e: reqwest::Error) -> crate::Error {
        DataError::Unavailable {
            reason: e.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl AuthProvider for RestBackend {
    async fn get_session(&self) -> Result<Option<Session>> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let response = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&json!({"email": email, "password": password}))
            .send()
            .await
            .map_err(|e| AuthError::SignInFailed {
                reason: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                return Err(AuthError::InvalidCredentials.into());
            }
            _ => {
                return Err(AuthError::SignInFailed {
                    reason: Self::error_message(response).await,
                }
                .into());
            }
        }

        let token: TokenResponse = response.json().await.map_err(|e| AuthError::SignInFailed {
            reason: e.to_string(),
        })?;
        let mut session = Session::new(token.access_token, token.user.id);
        session.email = token.user.email.or_else(|| Some(email.to_string()));
        self.set_current(Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("auth/v1/signup")?)
            .header("apikey", &self.anon_key)
            .json(&json!({"email": email, "password": password}))
            .send()
            .await
            .map_err(|e| AuthError::SignUpFailed {
                reason: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY => Err(AuthError::UserAlreadyExists {
                email: email.to_string(),
            }
            .into()),
            _ => Err(AuthError::SignUpFailed {
                reason: Self::error_message(response).await,
            }
            .into()),
        }
    }

    async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.current.lock().unwrap().clone() else {
            return Ok(());
        };
        let result = self
            .authed(self.client.post(self.endpoint("auth/v1/logout")?), &session)
            .send()
            .await;
        // The local session is gone whatever the server says
        self.set_current(None);

        let response = result.map_err(|e| AuthError::SignOutFailed {
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(AuthError::SignOutFailed {
                reason: Self::error_message(response).await,
            }
            .into());
        }
        Ok(())
    }

    fn on_session_change(&self) -> broadcast::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }
}

#[async_trait]
impl DataSource for RestBackend {
    async fn select_all(
        &self,
        session: &Session,
        collection: Collection,
        order: Option<OrderBy>,
    ) -> Result<Vec<Value>> {
        let mut url = self.table_url(collection)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            if let Some(order) = order {
                let direction = if order.descending { "desc" } else { "asc" };
                query.append_pair("order", &format!("{}.{direction}", order.column));
            }
        }
        let response = self
            .authed(self.client.get(url), session)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            return Err(self.data_failure(response, collection, false).await);
        }
        response.json().await.map_err(|e| {
            DataError::Malformed {
                collection: collection.name().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn insert(&self, session: &Session, collection: Collection, record: Value) -> Result<()> {
        let response = self
            .authed(self.client.post(self.table_url(collection)?), session)
            .json(&record)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            return Err(self.data_failure(response, collection, true).await);
        }
        Ok(())
    }

    async fn delete_by_id(&self, session: &Session, collection: Collection, id: &RecordId) -> Result<()> {
        let mut url = self.table_url(collection)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        let response = self
            .authed(self.client.delete(url), session)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            return Err(self.data_failure(response, collection, true).await);
        }
        Ok(())
    }
}

/// Everything a polling feed needs, detached from the backend's lifetime.
#[derive(Clone)]
struct PollClient {
    client: Client,
    url: Url,
    anon_key: String,
    token: String,
}

impl PollClient {
    async fn fetch(&self) -> std::result::Result<Vec<Value>, String> {
        let response = self
            .client
            .get(self.url.clone())
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("poll returned {}", response.status()));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn subscribe(
        &self,
        session: &Session,
        collection: Collection,
        filter: EventFilter,
    ) -> Result<Subscription> {
        let mut url = self.table_url(collection)?;
        url.query_pairs_mut().append_pair("select", "*");
        let poller = PollClient {
            client: self.client.clone(),
            url,
            anon_key: self.anon_key.clone(),
            token: session.access_token.clone(),
        };

        // The first poll is the baseline; failing it fails the subscribe
        let baseline = poller
            .fetch()
            .await
            .map_err(|reason| SubscriptionError::OpenFailed {
                collection: collection.name().to_string(),
                reason,
            })?;

        let id = {
            let mut next = self.next_feed.lock().unwrap();
            *next += 1;
            SubscriptionId(*next)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let period = self.poll_interval;

        let handle = tokio::spawn(
            async move {
                let mut previous = baseline;
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.is_closed() {
                        break;
                    }
                    match poller.fetch().await {
                        Ok(next) => {
                            for event in diff_snapshots(collection, &previous, &next, filter) {
                                if tx.send(Ok(event)).is_err() {
                                    return;
                                }
                            }
                            previous = next;
                        }
                        Err(reason) => {
                            warn!(%reason, "Polling feed failed");
                            let _ = tx.send(Err(SubscriptionError::Interrupted {
                                collection: collection.name().to_string(),
                                reason,
                            }));
                            break;
                        }
                    }
                }
                debug!("Polling feed stopped");
            }
            .instrument(info_span!("poll_feed", collection = %collection, subscription = %id)),
        );
        self.feeds.lock().unwrap().insert(id, handle);
        Ok(Subscription::new(id, collection, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some(handle) = self.feeds.lock().unwrap().remove(&id) {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for RestBackend {
    fn drop(&mut self) {
        if let Ok(feeds) = self.feeds.get_mut() {
            for (_, handle) in feeds.drain() {
                handle.abort();
            }
        }
    }
}
