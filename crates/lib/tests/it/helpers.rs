use std::{future::Future, sync::Arc, time::Duration};

use portal::{
    FixedClock, Portal,
    backend::InMemoryBackend,
    config::SyncConfig,
    records::Collection,
    sync::{RetryPolicy, SyncState, SyncStatus},
};
use serde_json::Value;

pub const EMAIL: &str = "a@b.com";
pub const PASSWORD: &str = "x";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Sync tuning with short backoff so retry paths finish quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        ..SyncConfig::default()
    }
}

/// A portal on top of an in-memory backend with one confirmed account.
pub struct TestPortal {
    pub backend: Arc<InMemoryBackend>,
    pub portal: Portal,
    pub user_id: String,
}

impl TestPortal {
    /// Store rows for the test user.
    pub fn seed(&self, collection: Collection, rows: Vec<Value>) {
        self.backend.seed(collection, &self.user_id, rows);
    }

    pub async fn wait_for(&self, state: SyncState) -> SyncStatus {
        tokio::time::timeout(WAIT, self.portal.engine().wait_for(state))
            .await
            .unwrap_or_else(|_| panic!("engine never reached {state}"))
            .expect("engine stopped")
    }

    pub async fn login(&self) -> SyncStatus {
        self.portal.login(EMAIL, PASSWORD).await.expect("login");
        self.wait_for(SyncState::Live).await
    }
}

/// Portal with default sync tuning (fast retries), started but logged out.
pub async fn setup() -> TestPortal {
    setup_with(fast_config()).await
}

pub async fn setup_with(config: SyncConfig) -> TestPortal {
    let backend = Arc::new(InMemoryBackend::with_clock(Arc::new(FixedClock::default())));
    let user_id = backend.add_user(EMAIL, PASSWORD);
    let portal = Portal::new(backend.clone(), config);
    portal.start().await;
    TestPortal {
        backend,
        portal,
        user_id,
    }
}

/// Portal that is logged in and live.
pub async fn setup_live() -> TestPortal {
    let ctx = setup().await;
    ctx.login().await;
    ctx
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Run `future` with the standard timeout.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}
