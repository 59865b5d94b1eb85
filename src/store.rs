//! Top-level entry point: the ordered message log plus its live feed and the
//! background tasks that bind dispatchers, outboxes, and aggregates to it.
//!
//! A [`MessageStore`] is built through [`MessageStoreBuilder`] over any
//! [`MessageStoreDb`] backend. Every successful [`log_message`] is published
//! on a replay-buffered live feed; bound dispatchers receive historical
//! backfill followed by that feed, deduplicated by message id.
//!
//! [`log_message`]: MessageStore::log_message

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};

use crate::aggregate::{Aggregate, AggregateHandle, Versioned};
use crate::component::Component;
use crate::db::{InMemoryMessageStoreDb, LogResult, MessageStoreDb};
use crate::dispatcher::Dispatcher;
use crate::error::{AggregateError, StoreError};
use crate::feed::{FeedStream, ReplayFeed};
use crate::message::{Channel, Envelope, StoredMessage, TraceId};

/// Default number of recently logged messages the live feed replays.
pub const DEFAULT_LIVE_BUFFER_SIZE: usize = 1000;

/// Store tuning knobs.
///
/// # Examples
///
/// ```
/// use eventfold_bus::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert_eq!(config.live_buffer_size, 1000);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How many recent messages a new live subscriber is replayed. This is a
    /// best-effort window; dispatchers rely on backfill for anything older.
    ///
    /// Default: [`DEFAULT_LIVE_BUFFER_SIZE`].
    pub live_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            live_buffer_size: DEFAULT_LIVE_BUFFER_SIZE,
        }
    }
}

/// State shared with binding tasks.
struct StoreCore {
    db: Arc<dyn MessageStoreDb>,
    live: ReplayFeed<StoredMessage>,
    // Serializes append + publish so live order equals log order.
    append: tokio::sync::Mutex<()>,
}

impl StoreCore {
    async fn log_message(&self, envelope: Envelope) -> Result<StoredMessage, StoreError> {
        let _append = self.append.lock().await;
        let stored = self.db.log_message(envelope).await?;
        self.live.publish(stored.clone());
        Ok(stored)
    }
}

/// A background task attached to the store.
struct Binding {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The message store: ordered log, live feed, and bindings.
///
/// `Clone` is cheap; all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct MessageStore {
    core: Arc<StoreCore>,
    bindings: Arc<Mutex<Vec<Binding>>>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("live", &self.core.live)
            .field("bindings", &self.lock_bindings().len())
            .finish()
    }
}

impl MessageStore {
    /// Start configuring a store.
    pub fn builder() -> MessageStoreBuilder {
        MessageStoreBuilder::new()
    }

    /// A store over a fresh [`InMemoryMessageStoreDb`] with default settings.
    pub fn in_memory() -> Self {
        Self::builder().build()
    }

    /// Append `envelope` to the log and publish the stored form on the live
    /// feed.
    ///
    /// # Arguments
    ///
    /// * `envelope` - The message with its destination stream and trace.
    ///
    /// # Returns
    ///
    /// The assigned id, stream `version`, `channel_version`, and trace
    /// `depth`.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StoreError`]; nothing is published on failure.
    pub async fn log_message(&self, envelope: Envelope) -> Result<LogResult, StoreError> {
        let stored = self.core.log_message(envelope).await?;
        Ok(LogResult::from(&stored))
    }

    /// All messages of one trace, in log order.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StoreError`].
    pub async fn get_trace(&self, trace_id: TraceId) -> Result<Vec<StoredMessage>, StoreError> {
        self.core.db.get_trace(trace_id).await
    }

    /// Historical messages `dispatcher` would currently admit, in log order.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StoreError`].
    pub async fn get_dispatcher_stream(
        &self,
        dispatcher: &Dispatcher,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.core
            .db
            .get_dispatcher_stream(&dispatcher.subscriptions())
            .await
    }

    /// All historical messages for instance `id` across `channels`, in log
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StoreError`].
    pub async fn get_aggregate_stream(
        &self,
        channels: &[Channel],
        id: &str,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.core.db.get_aggregate_stream(channels, id).await
    }

    /// Subscribe to the live feed: the replay window, then every message
    /// logged from now on.
    pub fn subscribe_live(&self) -> FeedStream<StoredMessage> {
        self.core.live.subscribe()
    }

    /// Feed `dispatcher` the historical backfill and then live traffic.
    ///
    /// Messages are delivered one at a time in log order, each filtered
    /// through [`Dispatcher::filter`]. A message seen in backfill is not
    /// redelivered from the live tail. Handler errors are logged and never
    /// stop the binding.
    ///
    /// # Arguments
    ///
    /// * `dispatcher` - The consumer to bind, owned or already shared.
    ///
    /// # Returns
    ///
    /// The shared dispatcher, for reading offsets or taking a checkpoint
    /// while it runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backfill query fails; nothing is bound.
    pub async fn bind_dispatcher(
        &self,
        dispatcher: impl Into<Arc<Dispatcher>>,
    ) -> Result<Arc<Dispatcher>, StoreError> {
        let dispatcher = dispatcher.into();
        // Subscribe before querying so nothing logged in between is lost.
        let live = self.core.live.subscribe();
        let backfill = self
            .core
            .db
            .get_dispatcher_stream(&dispatcher.subscriptions())
            .await?;

        tracing::info!(
            dispatcher = %dispatcher.name(),
            backfill = backfill.len(),
            "dispatcher bound"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_dispatcher(
            Arc::clone(&dispatcher),
            backfill,
            live,
            shutdown_rx,
        ));
        self.push_binding(dispatcher.name(), shutdown_tx, task);
        Ok(dispatcher)
    }

    /// Log every envelope `stream` yields, in order, until it ends or
    /// [`stop_dispatchers`](MessageStore::stop_dispatchers) is called.
    /// Write failures are logged and the binding continues.
    pub fn bind_output_stream<S>(&self, stream: S)
    where
        S: Stream<Item = Envelope> + Send + Unpin + 'static,
    {
        self.bind_output_stream_named("output", stream);
    }

    /// Bind `component` to the store: its inbox is fed from the log and its
    /// outbox is logged back.
    ///
    /// # Errors
    ///
    /// See [`bind_dispatcher`](MessageStore::bind_dispatcher).
    pub async fn bind_component(&self, component: &Component) -> Result<Arc<Dispatcher>, StoreError> {
        let dispatcher = self
            .bind_dispatcher(Dispatcher::from_component(component))
            .await?;
        // The outbox replays recent history, so binding it second loses nothing.
        self.bind_output_stream_named(component.name(), component.outbox());
        Ok(dispatcher)
    }

    /// Bind an aggregate's underlying component.
    ///
    /// # Errors
    ///
    /// See [`bind_dispatcher`](MessageStore::bind_dispatcher).
    pub async fn bind_aggregate<A: Aggregate>(
        &self,
        aggregate: &AggregateHandle<A>,
    ) -> Result<Arc<Dispatcher>, StoreError> {
        self.bind_component(aggregate.component()).await
    }

    /// Rebuild instance `id` of `aggregate` from its logged events.
    ///
    /// # Arguments
    ///
    /// * `aggregate` - Handle whose event channels and repository are used.
    /// * `id` - The instance to rebuild.
    ///
    /// # Returns
    ///
    /// The hydrated state and its version, written to the repository unless
    /// the instance has no history.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Store`] if the history query fails and
    /// [`AggregateError::Failure`] if hydration fails.
    pub async fn get_aggregate<A: Aggregate>(
        &self,
        aggregate: &AggregateHandle<A>,
        id: &str,
    ) -> Result<Versioned<A::State>, AggregateError> {
        let history = self
            .core
            .db
            .get_aggregate_stream(aggregate.event_channels(), id)
            .await?;
        let events = tokio_stream::iter(history.into_iter().map(|m| m.message));
        Ok(aggregate.hydrate(id, events).await?)
    }

    /// Stop every binding and wait for each to finish the message it is
    /// handling. Output bindings first log whatever their stream has ready.
    /// Idempotent.
    pub async fn stop_dispatchers(&self) {
        let bindings: Vec<Binding> = self.lock_bindings().drain(..).collect();
        for binding in &bindings {
            // The task may already have exited.
            let _ = binding.shutdown_tx.send(true);
        }
        for binding in bindings {
            if let Err(e) = binding.task.await {
                tracing::error!(
                    binding = %binding.name,
                    error = %e,
                    "binding task terminated abnormally"
                );
            }
        }
        tracing::info!("store bindings stopped");
    }

    fn bind_output_stream_named<S>(&self, name: &str, stream: S)
    where
        S: Stream<Item = Envelope> + Send + Unpin + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_output(
            Arc::clone(&self.core),
            name.to_owned(),
            stream,
            shutdown_rx,
        ));
        self.push_binding(name, shutdown_tx, task);
        tracing::debug!(output = name, "output stream bound");
    }

    fn push_binding(&self, name: &str, shutdown_tx: watch::Sender<bool>, task: JoinHandle<()>) {
        self.lock_bindings().push(Binding {
            name: name.to_owned(),
            shutdown_tx,
            task,
        });
    }

    fn lock_bindings(&self) -> MutexGuard<'_, Vec<Binding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Backfill, then live tail, until shutdown or the live feed closes.
async fn run_dispatcher(
    dispatcher: Arc<Dispatcher>,
    backfill: Vec<StoredMessage>,
    mut live: FeedStream<StoredMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut seen = HashSet::with_capacity(backfill.len());
    for message in backfill {
        if *shutdown_rx.borrow() {
            return;
        }
        seen.insert(message.id);
        dispatcher.deliver(&message).await;
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            next = live.next() => match next {
                Some(message) => {
                    if seen.remove(&message.id) {
                        continue;
                    }
                    dispatcher.deliver(&message).await;
                }
                None => break,
            },
        }
    }
    tracing::debug!(dispatcher = %dispatcher.name(), "dispatcher binding ended");
}

/// Log each envelope until the stream ends, draining ready items before
/// honouring shutdown.
async fn run_output<S>(
    core: Arc<StoreCore>,
    name: String,
    mut stream: S,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: Stream<Item = Envelope> + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            biased;
            next = stream.next() => match next {
                Some(envelope) => {
                    let trace_id = envelope.trace_id;
                    let stream_name = envelope.stream_name.to_string();
                    if let Err(e) = core.log_message(envelope).await {
                        tracing::error!(
                            output = %name,
                            stream = %stream_name,
                            trace_id = %trace_id,
                            error = %e,
                            "failed to log emitted message"
                        );
                    }
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!(output = %name, "output binding ended");
}

/// Builder for [`MessageStore`].
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), eventfold_bus::StoreError> {
/// use eventfold_bus::{JsonlMessageStoreDb, MessageStore};
///
/// let _store = MessageStore::builder()
///     .db(JsonlMessageStoreDb::open("/tmp/bus/log")?)
///     .live_buffer_size(256)
///     .build();
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MessageStoreBuilder {
    db: Option<Arc<dyn MessageStoreDb>>,
    config: StoreConfig,
}

impl MessageStoreBuilder {
    /// A builder with the in-memory backend and default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `db` as the storage backend.
    pub fn db(mut self, db: impl MessageStoreDb) -> Self {
        self.db = Some(Arc::new(db));
        self
    }

    /// Set the live feed's replay window.
    pub fn live_buffer_size(mut self, size: usize) -> Self {
        self.config.live_buffer_size = size;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the store.
    pub fn build(self) -> MessageStore {
        let db = self
            .db
            .unwrap_or_else(|| Arc::new(InMemoryMessageStoreDb::new()));
        MessageStore {
            core: Arc::new(StoreCore {
                db,
                live: ReplayFeed::new(self.config.live_buffer_size),
                append: tokio::sync::Mutex::new(()),
            }),
            bindings: Arc::new(Mutex::new(Vec::new())),
        }
    }
}
