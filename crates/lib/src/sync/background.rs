//! Background task behind [`SyncEngine`](super::SyncEngine).
//!
//! All mirror mutation happens on this task. Everything asynchronous (bulk loads,
//! retry timers, subscription forwarding, resubscription) runs in spawned tasks
//! that report back over the command channel, so commands are handled one at a
//! time and in arrival order.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, debug_span, error, info, info_span, trace, warn};

use super::{SyncError, SyncState, SyncStatus, fence::MirrorFence};
use crate::{
    Result,
    backend::{Backend, EventFilter, FeedItem, Subscription, SubscriptionError, SubscriptionId},
    config::{RemoteChangePolicy, SyncConfig},
    mirror::Mirrors,
    notify::Notifier,
    reconcile::{ChangeEvent, ChangeReconciler},
    records::Collection,
    session::{Session, SessionChange, SessionState},
};

/// Commands handled by the engine task
#[derive(Debug)]
pub(super) enum EngineCommand {
    /// The session store transitioned
    SessionChanged(SessionChange),
    /// Reload everything and report back
    Refresh {
        response: oneshot::Sender<Result<()>>,
    },
    /// A bulk load task finished
    LoadFinished {
        generation: u64,
        epoch: u64,
        result: Result<Loaded>,
    },
    /// Backoff elapsed for a failed load
    RetryLoad { generation: u64, epoch: u64 },
    /// An item arrived on a subscription
    Event {
        generation: u64,
        subscription: SubscriptionId,
        collection: Collection,
        item: FeedItem,
    },
    /// A subscription stream ended
    FeedClosed {
        generation: u64,
        subscription: SubscriptionId,
        collection: Collection,
    },
    /// A resubscription attempt finished
    Resubscribed {
        generation: u64,
        collection: Collection,
        result: Result<Subscription>,
    },
    /// Stop the engine
    Shutdown,
}

/// Output of one bulk load.
#[derive(Debug)]
pub(super) struct Loaded {
    rows: Vec<(Collection, Vec<Value>)>,
    /// Subscriptions opened after the queries succeeded
    subscriptions: Vec<Subscription>,
}

/// An open subscription and the task forwarding its events.
#[derive(Debug)]
struct Feed {
    id: SubscriptionId,
    forwarder: JoinHandle<()>,
}

/// A caller waiting for a refresh to complete.
#[derive(Debug)]
struct Waiter {
    generation: u64,
    /// Load epoch current when the refresh arrived; only a later load answers it
    after: u64,
    response: oneshot::Sender<Result<()>>,
}

/// Engine state. Owned by the task running [`SyncWorker::run`].
pub(super) struct SyncWorker {
    backend: Arc<dyn Backend>,
    mirrors: Arc<Mirrors>,
    fence: Arc<MirrorFence>,
    notifier: Notifier,
    config: SyncConfig,
    reconciler: ChangeReconciler,

    // Session tracking
    session: Option<Session>,
    generation: u64,

    // Published status
    state: SyncState,
    last_error: Option<String>,
    status_tx: watch::Sender<SyncStatus>,

    // Loading
    load: Option<JoinHandle<()>>,
    load_epoch: u64,
    failures: u32,
    retry: Option<JoinHandle<()>>,
    reload_requested: bool,
    waiters: Vec<Waiter>,

    // Change feeds
    feeds: HashMap<Collection, Feed>,
    resubscribing: HashMap<Collection, JoinHandle<()>>,
    resubscribe_failures: HashMap<Collection, u32>,
    /// Events held back while a reload is in flight
    buffered: HashMap<Collection, Vec<ChangeEvent>>,

    // Communication
    commands: mpsc::UnboundedSender<EngineCommand>,
    command_rx: mpsc::UnboundedReceiver<EngineCommand>,
}

impl SyncWorker {
    /// Spawn the engine task and return its command sender and status receiver.
    pub(super) fn start(
        backend: Arc<dyn Backend>,
        mirrors: Arc<Mirrors>,
        fence: Arc<MirrorFence>,
        notifier: Notifier,
        config: SyncConfig,
    ) -> (
        mpsc::UnboundedSender<EngineCommand>,
        watch::Receiver<SyncStatus>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());

        let worker = Self {
            backend,
            reconciler: ChangeReconciler::new(mirrors.clone(), None),
            mirrors,
            fence,
            notifier,
            config,
            session: None,
            generation: 0,
            state: SyncState::Idle,
            last_error: None,
            status_tx,
            load: None,
            load_epoch: 0,
            failures: 0,
            retry: None,
            reload_requested: false,
            waiters: Vec::new(),
            feeds: HashMap::new(),
            resubscribing: HashMap::new(),
            resubscribe_failures: HashMap::new(),
            buffered: HashMap::new(),
            commands: tx.clone(),
            command_rx: rx,
        };

        // Try to spawn in current runtime, or create one if needed
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(worker.run());
        } else {
            std::thread::spawn(move || match tokio::runtime::Runtime::new() {
                Ok(rt) => rt.block_on(worker.run()),
                Err(e) => error!("Failed to create runtime for sync engine: {e}"),
            });
        }
        (tx, status_rx)
    }

    /// Main loop. Runs until a `Shutdown` command arrives.
    async fn run(mut self) {
        async move {
            info!("Starting sync engine");
            while let Some(command) = self.command_rx.recv().await {
                if self.handle_command(command).await.is_break() {
                    break;
                }
            }
            self.teardown().await;
            self.set_state(SyncState::Idle);
            info!("Sync engine stopped");
        }
        .instrument(info_span!("sync_engine"))
        .await
    }

    async fn handle_command(&mut self, command: EngineCommand) -> ControlFlow<()> {
        match command {
            EngineCommand::SessionChanged(change) => self.on_session_changed(change).await,
            EngineCommand::Refresh { response } => self.on_refresh(response),
            EngineCommand::LoadFinished {
                generation,
                epoch,
                result,
            } => self.on_load_finished(generation, epoch, result),
            EngineCommand::RetryLoad { generation, epoch } => {
                if generation == self.generation
                    && epoch == self.load_epoch
                    && self.load.is_none()
                    && self.state == SyncState::Loading
                {
                    self.retry = None;
                    self.begin_load();
                }
            }
            EngineCommand::Event {
                generation,
                subscription,
                collection,
                item,
            } => {
                if self.is_current_feed(generation, collection, subscription) {
                    match item {
                        Ok(event) => self.on_change(collection, event),
                        Err(e) => self.on_feed_lost(collection, Some(e)),
                    }
                } else {
                    trace!(%collection, %subscription, "Discarding event from a closed subscription");
                }
            }
            EngineCommand::FeedClosed {
                generation,
                subscription,
                collection,
            } => {
                if self.is_current_feed(generation, collection, subscription) {
                    self.on_feed_lost(collection, None);
                }
            }
            EngineCommand::Resubscribed {
                generation,
                collection,
                result,
            } => self.on_resubscribed(generation, collection, result),
            EngineCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    // === Session ===

    async fn on_session_changed(&mut self, change: SessionChange) {
        if change.generation < self.generation {
            debug!(generation = change.generation, "Ignoring stale session change");
            return;
        }
        if change.generation == self.generation {
            // Same identity: keep the refreshed token for future requests
            if self.session.is_some()
                && let SessionState::Active(session) = change.current
            {
                debug!("Session token refreshed");
                self.session = Some(session);
            }
            return;
        }

        info!(
            from = self.generation,
            to = change.generation,
            "Session changed, resetting mirrors"
        );
        self.generation = change.generation;
        self.teardown().await;

        match change.current {
            SessionState::Active(session) => {
                self.reconciler =
                    ChangeReconciler::new(self.mirrors.clone(), Some(session.user_id.clone()));
                self.session = Some(session);
                self.begin_load();
            }
            SessionState::Absent => {
                self.session = None;
                self.reconciler = ChangeReconciler::new(self.mirrors.clone(), None);
                self.set_state(SyncState::Idle);
            }
        }
    }

    /// Abort all in-flight work, close subscriptions and clear the mirrors.
    async fn teardown(&mut self) {
        if let Some(load) = self.load.take() {
            load.abort();
        }
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        for (_, task) in self.resubscribing.drain() {
            task.abort();
        }
        self.resubscribe_failures.clear();
        self.mirrors.clear_all();

        for (collection, feed) in std::mem::take(&mut self.feeds) {
            feed.forwarder.abort();
            if let Err(e) = self.backend.unsubscribe(feed.id).await {
                warn!(%collection, subscription = %feed.id, "Failed to unsubscribe: {e}");
            }
        }

        self.buffered.clear();
        self.failures = 0;
        self.reload_requested = false;
        self.last_error = None;

        let current = self.generation;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.response.send(Err(SyncError::RefreshAbandoned {
                started: waiter.generation,
                current,
            }
            .into()));
        }
    }

    // === Loading ===

    fn on_refresh(&mut self, response: oneshot::Sender<Result<()>>) {
        if self.session.is_none() {
            let _ = response.send(Err(SyncError::NoSession.into()));
            return;
        }
        self.waiters.push(Waiter {
            generation: self.generation,
            after: self.load_epoch,
            response,
        });
        if self.load.is_some() {
            // The running load may have queried before the caller's last write
            self.reload_requested = true;
            return;
        }
        self.failures = 0;
        self.begin_load();
    }

    /// Spawn a bulk load for the current session.
    fn begin_load(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(load) = self.load.take() {
            load.abort();
        }

        self.load_epoch += 1;
        let epoch = self.load_epoch;
        let generation = self.generation;
        let missing: Vec<Collection> = Collection::ALL
            .into_iter()
            .filter(|c| !self.feeds.contains_key(c) && !self.resubscribing.contains_key(c))
            .collect();
        debug!(epoch, attempt = self.failures + 1, subscribe = ?missing, "Starting bulk load");

        let backend = self.backend.clone();
        let commands = self.commands.clone();
        self.load = Some(tokio::spawn(
            async move {
                let result = load_collections(backend, session, missing).await;
                let _ = commands.send(EngineCommand::LoadFinished {
                    generation,
                    epoch,
                    result,
                });
            }
            .instrument(debug_span!("bulk_load", generation, epoch)),
        ));
        self.set_state(SyncState::Loading);
    }

    fn on_load_finished(&mut self, generation: u64, epoch: u64, result: Result<Loaded>) {
        if generation != self.generation || epoch != self.load_epoch || self.load.is_none() {
            debug!(generation, epoch, "Discarding superseded load result");
            if let Ok(loaded) = result {
                self.release(loaded.subscriptions);
            }
            return;
        }
        self.load = None;

        let outcome = result.and_then(|loaded| {
            let Loaded {
                rows,
                subscriptions,
            } = loaded;
            match self.fence.run(self.generation, || self.install(rows)) {
                Some(Ok(())) => Ok(Some(subscriptions)),
                Some(Err(e)) => {
                    self.release(subscriptions);
                    Err(e)
                }
                None => {
                    self.release(subscriptions);
                    Ok(None)
                }
            }
        });
        match outcome {
            Ok(Some(subscriptions)) => self.go_live(subscriptions),
            // The session change is already queued behind this result
            Ok(None) => debug!(generation, "Session moved on, discarding load"),
            Err(e) => self.on_load_failed(e),
        }
    }

    /// Answer the waiters that the load with the current epoch satisfies.
    fn answer_waiters(&mut self, result: impl Fn() -> Result<()>) {
        let epoch = self.load_epoch;
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|waiter| waiter.after < epoch);
        self.waiters = pending;
        for waiter in done {
            let _ = waiter.response.send(result());
        }
    }

    /// Replace every mirror with freshly loaded rows.
    fn install(&self, rows: Vec<(Collection, Vec<Value>)>) -> Result<()> {
        for (collection, rows) in rows {
            let count = self.reconciler.replace(collection, rows)?;
            debug!(%collection, count, "Replaced mirror");
        }
        Ok(())
    }

    fn go_live(&mut self, subscriptions: Vec<Subscription>) {
        for subscription in subscriptions {
            self.start_feed(subscription);
        }
        self.failures = 0;
        self.last_error = None;
        self.replay_buffered();
        self.set_state(SyncState::Live);
        self.answer_waiters(|| Ok(()));
        if std::mem::take(&mut self.reload_requested) || !self.waiters.is_empty() {
            debug!("Reload requested during load, reloading again");
            self.begin_load();
        }
    }

    fn on_load_failed(&mut self, err: crate::Error) {
        self.failures += 1;
        warn!(attempt = self.failures, "Bulk load failed: {err}");
        self.notifier.raise_error(&err);
        let reason = err.to_string();
        self.last_error = Some(reason.clone());

        // Collections with open feeds were loaded before; their events can apply now
        self.replay_buffered();
        let refresh_failed = || -> Result<()> {
            Err(SyncError::RefreshFailed {
                reason: reason.clone(),
            }
            .into())
        };

        if self.config.retry.exhausted(self.failures) {
            error!(attempts = self.failures, "Giving up on bulk load: {reason}");
            self.reload_requested = false;
            // Nothing will load again until the next refresh
            for waiter in self.waiters.drain(..) {
                let _ = waiter.response.send(refresh_failed());
            }
            self.set_state(SyncState::Suspended);
            return;
        }
        self.answer_waiters(refresh_failed);

        let delay = self.config.retry.delay_for(self.failures);
        let generation = self.generation;
        let epoch = self.load_epoch;
        let commands = self.commands.clone();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(EngineCommand::RetryLoad { generation, epoch });
        }));
        self.set_state(SyncState::Loading);
    }

    // === Change feeds ===

    fn is_current_feed(&self, generation: u64, collection: Collection, id: SubscriptionId) -> bool {
        generation == self.generation && self.feeds.get(&collection).map(|f| f.id) == Some(id)
    }

    fn start_feed(&mut self, mut subscription: Subscription) {
        let id = subscription.id();
        let collection = subscription.collection();
        let generation = self.generation;
        let commands = self.commands.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(item) = subscription.next().await {
                let failed = item.is_err();
                let sent = commands.send(EngineCommand::Event {
                    generation,
                    subscription: id,
                    collection,
                    item,
                });
                if sent.is_err() || failed {
                    return;
                }
            }
            let _ = commands.send(EngineCommand::FeedClosed {
                generation,
                subscription: id,
                collection,
            });
        });
        debug!(%collection, subscription = %id, "Subscription live");

        if let Some(old) = self.feeds.insert(collection, Feed { id, forwarder }) {
            old.forwarder.abort();
            self.release_id(old.id);
        }
    }

    fn on_change(&mut self, collection: Collection, event: ChangeEvent) {
        match self.config.remote_changes.for_collection(collection) {
            RemoteChangePolicy::Reload => {
                if self.load.is_some() {
                    self.reload_requested = true;
                } else {
                    debug!(%collection, "Remote change, reloading");
                    self.begin_load();
                }
            }
            RemoteChangePolicy::Reconcile => {
                if self.load.is_some() {
                    trace!(%collection, "Buffering change until the reload completes");
                    self.buffered.entry(collection).or_default().push(event);
                } else {
                    self.apply(&event);
                }
            }
        }
    }

    fn apply(&self, event: &ChangeEvent) {
        match self.fence.run(self.generation, || self.reconciler.apply(event)) {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(collection = %event.collection, "Failed to apply change: {e}");
                self.notifier.raise_error(&e);
            }
            None => trace!(collection = %event.collection, "Dropping change from a previous session"),
        }
    }

    fn replay_buffered(&mut self) {
        for collection in Collection::ALL {
            if let Some(events) = self.buffered.remove(&collection) {
                trace!(%collection, count = events.len(), "Replaying buffered changes");
                for event in &events {
                    self.apply(event);
                }
            }
        }
    }

    fn on_feed_lost(&mut self, collection: Collection, error: Option<SubscriptionError>) {
        let Some(feed) = self.feeds.remove(&collection) else {
            return;
        };
        match &error {
            Some(e) => warn!(%collection, subscription = %feed.id, "Subscription failed: {e}"),
            None => warn!(%collection, subscription = %feed.id, "Subscription closed by backend"),
        }
        feed.forwarder.abort();
        self.release_id(feed.id);
        self.schedule_resubscribe(collection);
    }

    fn schedule_resubscribe(&mut self, collection: Collection) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let failures = self.resubscribe_failures.get(&collection).copied().unwrap_or(0);
        let delay = self.config.retry.delay_for(failures + 1);
        let generation = self.generation;
        let backend = self.backend.clone();
        let commands = self.commands.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = backend
                .subscribe(&session, collection, EventFilter::for_collection(collection))
                .await;
            let _ = commands.send(EngineCommand::Resubscribed {
                generation,
                collection,
                result,
            });
        });
        if let Some(old) = self.resubscribing.insert(collection, task) {
            old.abort();
        }
    }

    fn on_resubscribed(&mut self, generation: u64, collection: Collection, result: Result<Subscription>) {
        if generation != self.generation || self.resubscribing.remove(&collection).is_none() {
            if let Ok(subscription) = result {
                self.release(vec![subscription]);
            }
            return;
        }

        match result {
            Ok(subscription) => {
                info!(%collection, "Resubscribed");
                self.resubscribe_failures.remove(&collection);
                self.start_feed(subscription);
                // Changes made while the feed was down were missed
                if self.load.is_some() {
                    self.reload_requested = true;
                } else if self.state == SyncState::Live {
                    self.begin_load();
                }
            }
            Err(e) => {
                let failures = {
                    let count = self.resubscribe_failures.entry(collection).or_insert(0);
                    *count += 1;
                    *count
                };
                if self.config.retry.exhausted(failures) {
                    self.resubscribe_failures.remove(&collection);
                    let err: crate::Error = SubscriptionError::Exhausted {
                        collection: collection.name().to_string(),
                        attempts: failures,
                    }
                    .into();
                    error!(%collection, "Giving up on subscription: {e}");
                    self.last_error = Some(err.to_string());
                    self.notifier.raise_error(&err);
                    self.publish();
                } else {
                    warn!(%collection, attempt = failures, "Resubscribe failed: {e}");
                    self.schedule_resubscribe(collection);
                }
            }
        }
    }

    /// Close subscriptions that will not be used.
    fn release(&self, subscriptions: Vec<Subscription>) {
        for subscription in subscriptions {
            self.release_id(subscription.id());
        }
    }

    fn release_id(&self, id: SubscriptionId) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.unsubscribe(id).await {
                debug!(subscription = %id, "Failed to unsubscribe: {e}");
            }
        });
    }

    // === Status ===

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            info!(from = %self.state, to = %state, generation = self.generation, "Sync state changed");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(SyncStatus {
            state: self.state,
            generation: self.generation,
            last_error: self.last_error.clone(),
        });
    }
}

/// Query every collection concurrently, then open the requested subscriptions.
///
/// One failed query fails the whole load. Subscriptions opened before a later one
/// fails are closed again.
async fn load_collections(
    backend: Arc<dyn Backend>,
    session: Session,
    subscribe: Vec<Collection>,
) -> Result<Loaded> {
    let select = |collection: Collection| backend.select_all(&session, collection, collection.load_order());
    let (projects, assets, feedback) = tokio::try_join!(
        select(Collection::Projects),
        select(Collection::Assets),
        select(Collection::Feedback),
    )?;
    let rows = vec![
        (Collection::Projects, projects),
        (Collection::Assets, assets),
        (Collection::Feedback, feedback),
    ];

    let mut subscriptions: Vec<Subscription> = Vec::with_capacity(subscribe.len());
    for collection in subscribe {
        match backend
            .subscribe(&session, collection, EventFilter::for_collection(collection))
            .await
        {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) => {
                for opened in &subscriptions {
                    let _ = backend.unsubscribe(opened.id()).await;
                }
                return Err(e);
            }
        }
    }

    Ok(Loaded {
        rows,
        subscriptions,
    })
}
