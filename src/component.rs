//! Component bus: one addressable unit's inbox, outbox, and serialized handler.
//!
//! A [`Component`] owns a FIFO queue drained by a single background task.
//! Each queued [`IncomingMessage`] is handed to the user-supplied [`Handler`]
//! and processed to completion before the next one starts, so handlers never
//! observe interleaved state and outbox order follows inbox order.
//!
//! Everything received, emitted, and every handler result is also published
//! on replay-buffered [`ReplayFeed`]s so late subscribers (a freshly bound
//! store, a test assertion) still see recent history.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{ComponentError, Failure, catch_panic};
use crate::feed::{FeedStream, ReplayFeed};
use crate::message::{Channel, Envelope, IncomingMessage, InstanceId, Message, MessageId, TraceId};

/// Default number of recent items each component feed replays.
pub const DEFAULT_FEED_CAPACITY: usize = 1000;

/// Static description of a component: its name and declared channels.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{Channel, ComponentConfig};
///
/// let config = ComponentConfig::new("pinger")
///     .input(Channel::new("my-service", "ping"))
///     .output(Channel::new("my-service", "pong"))
///     .feed_capacity(64);
///
/// assert_eq!(config.input_channels.len(), 1);
/// assert_eq!(config.feed_capacity, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    /// Component name, used in logs and as the default dispatcher name.
    pub name: String,
    /// Channels the component consumes.
    pub input_channels: Vec<Channel>,
    /// Channels the component may emit on.
    pub output_channels: Vec<Channel>,
    /// Replay buffer size of the inbox, outbox, and outcome feeds.
    ///
    /// Default: [`DEFAULT_FEED_CAPACITY`].
    pub feed_capacity: usize,
}

impl ComponentConfig {
    /// A component with no channels and the default feed capacity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_channels: Vec::new(),
            output_channels: Vec::new(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }

    /// Declare an input channel.
    pub fn input(mut self, channel: Channel) -> Self {
        self.input_channels.push(channel);
        self
    }

    /// Declare an output channel.
    pub fn output(mut self, channel: Channel) -> Self {
        self.output_channels.push(channel);
        self
    }

    /// Set the replay buffer size of the component's feeds.
    pub fn feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }
}

fn find_channel<'a>(channels: &'a [Channel], name: &str) -> Option<&'a Channel> {
    channels.iter().find(|c| c.channel == name)
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// The message was handled.
    Success,
    /// The message was deliberately not acted upon.
    Ignore,
    /// The handler rejected the message or failed unexpectedly.
    Failure(Failure),
}

impl HandlerResult {
    /// Returns the failure, if this result is one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Published on a component's outcome feed after each inbox message.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// Id of the processed inbox message.
    pub message_id: MessageId,
    /// Trace of the processed inbox message.
    pub trace_id: TraceId,
    /// What the handler returned.
    pub result: HandlerResult,
}

/// User-supplied message handler for a [`Component`].
///
/// Any `Fn(HandlerApi, IncomingMessage) -> impl Future<Output = HandlerResult>`
/// closure or async fn implements this trait.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one inbox message.
    ///
    /// `api` exposes senders for the component's output channels and the
    /// result constructors. A panic is caught at the component boundary and
    /// reported as a [`Failure`] with the `"Unknown"` reason.
    async fn handle(&self, api: HandlerApi, message: IncomingMessage) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerApi, IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, api: HandlerApi, message: IncomingMessage) -> HandlerResult {
        (self)(api, message).await
    }
}

/// The emitting side of a component, shared with every handler invocation.
#[derive(Clone)]
struct Outbox {
    component: Arc<str>,
    channels: Arc<[Channel]>,
    feed: ReplayFeed<Envelope>,
}

/// Capabilities handed to a [`Handler`] for one message.
///
/// Sends made through this api inherit the trace id of the message being
/// handled.
#[derive(Clone)]
pub struct HandlerApi {
    trace_id: TraceId,
    outbox: Outbox,
}

impl std::fmt::Debug for HandlerApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerApi")
            .field("component", &self.outbox.component)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

impl HandlerApi {
    /// Trace of the message being handled.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Sender for the declared output channel named `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownChannel`] if no output channel has
    /// that name.
    pub fn send(&self, channel: &str) -> Result<ChannelSender, ComponentError> {
        let found = find_channel(&self.outbox.channels, channel).ok_or_else(|| {
            ComponentError::UnknownChannel {
                component: self.outbox.component.to_string(),
                direction: "output",
                channel: channel.to_owned(),
            }
        })?;
        Ok(ChannelSender {
            channel: found.clone(),
            trace_id: self.trace_id,
            route: Route::Outbox(self.outbox.clone()),
        })
    }

    /// The message was handled.
    pub fn success(&self) -> HandlerResult {
        HandlerResult::Success
    }

    /// The message was deliberately not acted upon.
    pub fn ignore(&self) -> HandlerResult {
        HandlerResult::Ignore
    }

    /// The message was rejected; the failure carries this message's trace.
    pub fn failure(&self, reason: impl Into<String>, message: impl Into<String>) -> HandlerResult {
        HandlerResult::Failure(Failure::new(reason, message).with_trace_id(self.trace_id))
    }
}

#[derive(Clone)]
enum Route {
    Inbox(Component),
    Outbox(Outbox),
}

/// Builds and transmits envelopes for one channel under one trace.
///
/// Construction ([`create`](ChannelSender::create)) is separate from
/// transmission ([`post`](ChannelSender::post)); [`send`](ChannelSender::send)
/// does both.
#[derive(Clone)]
pub struct ChannelSender {
    channel: Channel,
    trace_id: TraceId,
    route: Route,
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let route = match self.route {
            Route::Inbox(_) => "inbox",
            Route::Outbox(_) => "outbox",
        };
        f.debug_struct("ChannelSender")
            .field("channel", &self.channel)
            .field("trace_id", &self.trace_id)
            .field("route", &route)
            .finish()
    }
}

impl ChannelSender {
    /// The channel this sender addresses.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The trace every envelope from this sender belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Build an envelope for instance `id` without sending it.
    pub fn create_raw(&self, id: impl Into<InstanceId>, message: Message) -> Envelope {
        Envelope::new(self.trace_id, self.channel.stream(id), message)
    }

    /// Encode a typed message and build an envelope without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Encode`] if `message` is not an adjacently
    /// tagged serde value.
    pub fn create<M: Serialize>(
        &self,
        id: impl Into<InstanceId>,
        message: &M,
    ) -> Result<Envelope, ComponentError> {
        Ok(self.create_raw(id, Message::encode(message)?))
    }

    /// Transmit a previously created envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Stopped`] if the target component is stopped.
    pub fn post(&self, envelope: Envelope) -> Result<(), ComponentError> {
        match &self.route {
            Route::Inbox(component) => component.recv_raw(IncomingMessage::from_envelope(envelope)),
            Route::Outbox(outbox) => {
                if outbox.feed.publish(envelope) {
                    Ok(())
                } else {
                    Err(ComponentError::Stopped(outbox.component.to_string()))
                }
            }
        }
    }

    /// Build and transmit a raw message, returning the sent envelope.
    ///
    /// # Errors
    ///
    /// See [`post`](ChannelSender::post).
    pub fn send_raw(
        &self,
        id: impl Into<InstanceId>,
        message: Message,
    ) -> Result<Envelope, ComponentError> {
        let envelope = self.create_raw(id, message);
        self.post(envelope.clone())?;
        Ok(envelope)
    }

    /// Encode, build, and transmit a typed message, returning the sent envelope.
    ///
    /// # Errors
    ///
    /// See [`create`](ChannelSender::create) and [`post`](ChannelSender::post).
    pub fn send<M: Serialize>(
        &self,
        id: impl Into<InstanceId>,
        message: &M,
    ) -> Result<Envelope, ComponentError> {
        let envelope = self.create(id, message)?;
        self.post(envelope.clone())?;
        Ok(envelope)
    }
}

struct ComponentInner {
    config: ComponentConfig,
    queue: Mutex<Option<mpsc::UnboundedSender<IncomingMessage>>>,
    inbox: ReplayFeed<IncomingMessage>,
    outbox: Outbox,
    outcomes: ReplayFeed<HandlerOutcome>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running component.
///
/// `Clone` is cheap; all clones address the same queue and feeds. When every
/// clone is dropped the worker drains its queue and exits.
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.inner.config.name)
            .finish()
    }
}

impl Component {
    /// Start a component and its worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ComponentConfig, handler: impl Handler) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Outbox {
            component: Arc::from(config.name.as_str()),
            channels: Arc::from(config.output_channels.clone()),
            feed: ReplayFeed::new(config.feed_capacity),
        };
        let outcomes = ReplayFeed::new(config.feed_capacity);
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let worker = tokio::spawn(run_component(
            handler,
            rx,
            outbox.clone(),
            outcomes.clone(),
        ));

        tracing::debug!(component = %config.name, "component started");

        Self {
            inner: Arc::new(ComponentInner {
                inbox: ReplayFeed::new(config.feed_capacity),
                config,
                queue: Mutex::new(Some(tx)),
                outbox,
                outcomes,
                worker: tokio::sync::Mutex::new(Some(worker)),
            }),
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The configuration this component was spawned with.
    pub fn config(&self) -> &ComponentConfig {
        &self.inner.config
    }

    /// Inject a message into the inbox. This is the only way delivery
    /// happens; a component never polls.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Stopped`] once [`stop`](Component::stop)
    /// has begun.
    pub fn recv_raw(&self, message: IncomingMessage) -> Result<(), ComponentError> {
        let queue = self.lock_queue();
        let tx = queue
            .as_ref()
            .ok_or_else(|| ComponentError::Stopped(self.name().to_owned()))?;
        // Publishing under the queue lock keeps inbox feed order identical
        // to processing order.
        tx.send(message.clone())
            .map_err(|_| ComponentError::Stopped(self.name().to_owned()))?;
        self.inner.inbox.publish(message);
        Ok(())
    }

    /// Sender that injects messages on the declared input channel named
    /// `channel`, each wrapped with a fresh message id.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownChannel`] if no input channel has
    /// that name.
    pub fn recv(&self, channel: &str, trace_id: TraceId) -> Result<ChannelSender, ComponentError> {
        let found = find_channel(&self.inner.config.input_channels, channel).ok_or_else(|| {
            ComponentError::UnknownChannel {
                component: self.name().to_owned(),
                direction: "input",
                channel: channel.to_owned(),
            }
        })?;
        Ok(ChannelSender {
            channel: found.clone(),
            trace_id,
            route: Route::Inbox(self.clone()),
        })
    }

    /// Subscribe to everything received, recent history first.
    pub fn inbox(&self) -> FeedStream<IncomingMessage> {
        self.inner.inbox.subscribe()
    }

    /// Subscribe to everything emitted, recent history first.
    pub fn outbox(&self) -> FeedStream<Envelope> {
        self.inner.outbox.feed.subscribe()
    }

    /// Subscribe to handler results, recent history first.
    pub fn outcomes(&self) -> FeedStream<HandlerOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Stop admitting messages, finish everything already queued, then close
    /// all feeds. Idempotent.
    pub async fn stop(&self) {
        // Dropping the sender lets the worker drain and exit.
        drop(self.lock_queue().take());

        let worker = self.inner.worker.lock().await.take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::error!(
                component = %self.name(),
                error = %e,
                "component worker terminated abnormally"
            );
        }

        self.inner.inbox.close();
        self.inner.outbox.feed.close();
        self.inner.outcomes.close();
        tracing::debug!(component = %self.name(), "component stopped");
    }

    fn lock_queue(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<IncomingMessage>>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker loop: one message at a time, in arrival order.
///
/// Runs until every queue sender is dropped and the queue is empty.
async fn run_component(
    handler: Arc<dyn Handler>,
    mut rx: mpsc::UnboundedReceiver<IncomingMessage>,
    outbox: Outbox,
    outcomes: ReplayFeed<HandlerOutcome>,
) {
    while let Some(message) = rx.recv().await {
        let message_id = message.id;
        let trace_id = message.trace_id;
        let span = tracing::debug_span!(
            "handle",
            component = %outbox.component,
            tag = %message.message.tag,
            trace_id = %trace_id,
        );
        let api = HandlerApi {
            trace_id,
            outbox: outbox.clone(),
        };

        let handler = Arc::clone(&handler);
        let result = match catch_panic(async move { handler.handle(api, message).await })
            .instrument(span.clone())
            .await
        {
            Ok(HandlerResult::Failure(mut failure)) => {
                failure.trace_id.get_or_insert(trace_id);
                HandlerResult::Failure(failure)
            }
            Ok(result) => result,
            Err(panic) => HandlerResult::Failure(Failure::unknown(panic).with_trace_id(trace_id)),
        };

        if let HandlerResult::Failure(failure) = &result {
            tracing::warn!(
                parent: &span,
                reason = %failure.reason,
                error = %failure.message,
                "handler failed"
            );
        }

        outcomes.publish(HandlerOutcome {
            message_id,
            trace_id,
            result,
        });
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::*;

    pub(crate) const SERVICE: &str = "my-service";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum PingMessage {
        Ping,
        PingMultiple(u32),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum PongMessage {
        Pong,
        PongMultiple(u32),
    }

    pub(crate) fn ping_channel() -> Channel {
        Channel::new(SERVICE, "ping")
    }

    pub(crate) fn pong_channel() -> Channel {
        Channel::new(SERVICE, "pong")
    }

    pub(crate) fn ping_pong_config() -> ComponentConfig {
        ComponentConfig::new("my-component")
            .input(ping_channel())
            .output(pong_channel())
    }

    /// Answers every `Ping` with a `Pong` on the same instance id.
    pub(crate) async fn pong_handler(api: HandlerApi, msg: IncomingMessage) -> HandlerResult {
        let pong = match api.send("pong") {
            Ok(sender) => sender,
            Err(e) => return api.failure("NoChannel", e.to_string()),
        };
        let id = msg.stream_name.id.clone();
        let sent = match msg.message.decode::<PingMessage>() {
            Ok(PingMessage::Ping) => pong.send(id, &PongMessage::Pong),
            Ok(PingMessage::PingMultiple(n)) => pong.send(id, &PongMessage::PongMultiple(n)),
            Err(e) => return api.failure("InvalidMessage", e.to_string()),
        };
        match sent {
            Ok(_) => api.success(),
            Err(e) => api.failure("SendFailed", e.to_string()),
        }
    }
}
