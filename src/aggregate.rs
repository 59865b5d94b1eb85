//! Event-sourced aggregates built on a [`Component`].
//!
//! Commands arrive on the component's input channels and the aggregate's
//! command handler emits events to its output channels. The aggregate
//! listens to its own outbox: every emitted event is folded onto the cached
//! state with [`Aggregate::project`] and written back through a pluggable
//! [`StateRepository`] (the fast path). [`AggregateHandle::hydrate`] rebuilds
//! the same state from a full event history (the slow path).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};

use crate::component::{
    ChannelSender, Component, ComponentConfig, Handler, HandlerApi, HandlerResult,
};
use crate::error::{ComponentError, Failure, catch_panic};
use crate::feed::{FeedStream, ReplayFeed};
use crate::message::{Channel, Envelope, IncomingMessage, InstanceId, Message, TraceId};

/// Failure reason for a command whose tag or payload does not decode.
pub const INVALID_COMMAND: &str = "InvalidCommand";

/// Failure reason for an event whose tag or payload does not decode.
pub const INVALID_EVENT: &str = "InvalidEvent";

/// A domain aggregate: accepts commands, emits events, and folds events into
/// state.
///
/// `Command` and `DomainEvent` are adjacently tagged serde enums
/// (`#[serde(tag = "type", content = "data")]`).
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) decides. It may await, and emits events
///   through `api.send(..)`. It never touches state directly.
/// - [`project`](Aggregate::project) must be a pure, deterministic fold with
///   no I/O. A `Failure` leaves materialized state untouched.
#[async_trait]
pub trait Aggregate: Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. `"account"`). Used as the
    /// component name.
    const AGGREGATE_TYPE: &'static str;

    /// Materialized state.
    type State: Clone + Send + Sync + 'static;

    /// The set of commands this aggregate accepts.
    type Command: DeserializeOwned + Send + 'static;

    /// The set of events this aggregate emits and folds.
    type DomainEvent: DeserializeOwned + Send + Sync + 'static;

    /// Channels commands arrive on.
    fn command_channels(&self) -> Vec<Channel>;

    /// Channels events are emitted on.
    fn event_channels(&self) -> Vec<Channel>;

    /// State of an instance with no history.
    fn initial_state(&self) -> Self::State;

    /// Handle one command addressed to instance `id`.
    async fn handle(&self, api: HandlerApi, id: InstanceId, command: Self::Command)
    -> HandlerResult;

    /// Fold one event onto `state`.
    fn project(&self, state: &Self::State, event: &Self::DomainEvent)
    -> Result<Self::State, Failure>;
}

/// State paired with the aggregate's own optimistic-concurrency counter.
///
/// `version` counts successfully projected events and is unrelated to the
/// log's per-stream `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<S> {
    /// Materialized state.
    pub state: S,
    /// Number of events folded into `state`.
    pub version: u64,
}

impl<S> Versioned<S> {
    /// Pair a state with its version.
    pub fn new(state: S, version: u64) -> Self {
        Self { state, version }
    }
}

/// Pluggable persistence for materialized aggregate state.
///
/// `get` returning `Ok(None)` means the instance has never been committed;
/// absence is not an error.
#[async_trait]
pub trait StateRepository<S>: Send + Sync + 'static {
    /// Cached state of instance `id`, if any.
    async fn get(&self, id: &str) -> Result<Option<Versioned<S>>, Failure>;

    /// Replace the cached state of instance `id`.
    async fn update(&self, id: &str, state: S, version: u64) -> Result<(), Failure>;
}

/// [`StateRepository`] backed by a `HashMap`.
#[derive(Debug)]
pub struct InMemoryStateRepository<S> {
    states: RwLock<HashMap<InstanceId, Versioned<S>>>,
}

impl<S> Default for InMemoryStateRepository<S> {
    fn default() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }
}

impl<S> InMemoryStateRepository<S> {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> StateRepository<S> for InMemoryStateRepository<S> {
    async fn get(&self, id: &str) -> Result<Option<Versioned<S>>, Failure> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, state: S, version: u64) -> Result<(), Failure> {
        self.states
            .write()
            .await
            .insert(id.to_owned(), Versioned::new(state, version));
        Ok(())
    }
}

/// Result of one fast-path projection, published on
/// [`AggregateHandle::outcomes`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionOutcome {
    /// Trace of the projected event.
    pub trace_id: TraceId,
    /// Instance the event belongs to.
    pub instance_id: InstanceId,
    /// The new aggregate version, or why projection failed.
    pub result: Result<u64, Failure>,
}

/// Decodes commands and hands them to the aggregate.
struct CommandHandler<A> {
    aggregate: Arc<A>,
}

#[async_trait]
impl<A: Aggregate> Handler for CommandHandler<A> {
    async fn handle(&self, api: HandlerApi, message: IncomingMessage) -> HandlerResult {
        match message.message.decode::<A::Command>() {
            Ok(command) => {
                self.aggregate
                    .handle(api, message.stream_name.id, command)
                    .await
            }
            Err(e) => api.failure(INVALID_COMMAND, e.to_string()),
        }
    }
}

/// A running aggregate: its component plus the fast-path projector.
///
/// `Clone` is cheap; clones share the component, repository, and outcome
/// feed.
pub struct AggregateHandle<A: Aggregate> {
    aggregate: Arc<A>,
    repository: Arc<dyn StateRepository<A::State>>,
    component: Component,
    event_channels: Arc<[Channel]>,
    outcomes: ReplayFeed<ProjectionOutcome>,
    projector: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            aggregate: Arc::clone(&self.aggregate),
            repository: Arc::clone(&self.repository),
            component: self.component.clone(),
            event_channels: Arc::clone(&self.event_channels),
            outcomes: self.outcomes.clone(),
            projector: Arc::clone(&self.projector),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("event_channels", &self.event_channels)
            .finish()
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Start the aggregate's component and projector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(aggregate: A, repository: impl StateRepository<A::State>) -> Self {
        let aggregate = Arc::new(aggregate);
        let repository: Arc<dyn StateRepository<A::State>> = Arc::new(repository);
        let event_channels: Arc<[Channel]> = Arc::from(aggregate.event_channels());

        let mut config = ComponentConfig::new(A::AGGREGATE_TYPE);
        config.input_channels = aggregate.command_channels();
        config.output_channels = event_channels.to_vec();
        let outcomes = ReplayFeed::new(config.feed_capacity);

        let component = Component::spawn(
            config,
            CommandHandler {
                aggregate: Arc::clone(&aggregate),
            },
        );

        // Subscribing before any command can arrive means no event is missed.
        let events = component.outbox();
        let projector = tokio::spawn(run_projector(
            Arc::clone(&aggregate),
            Arc::clone(&repository),
            events,
            outcomes.clone(),
        ));

        Self {
            aggregate,
            repository,
            component,
            event_channels,
            outcomes,
            projector: Arc::new(tokio::sync::Mutex::new(Some(projector))),
        }
    }

    /// The underlying component.
    pub fn component(&self) -> &Component {
        &self.component
    }

    /// The aggregate definition.
    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    /// Channels this aggregate emits events on.
    pub fn event_channels(&self) -> &[Channel] {
        &self.event_channels
    }

    /// Sender for the command channel named `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownChannel`] if no command channel has
    /// that name.
    pub fn command(&self, channel: &str, trace_id: TraceId) -> Result<ChannelSender, ComponentError> {
        self.component.recv(channel, trace_id)
    }

    /// Fast-path read of the cached state of instance `id`.
    ///
    /// # Errors
    ///
    /// Returns the repository's failure.
    pub async fn get(&self, id: &str) -> Result<Option<Versioned<A::State>>, Failure> {
        self.repository.get(id).await
    }

    /// Rebuild instance `id` from its ordered event history.
    ///
    /// The i-th event (1-based) yields version `i`. The first decode or
    /// projection failure is returned as-is and later events are not applied.
    /// An empty history returns the initial state at version `0` without
    /// writing. Otherwise the result overwrites whatever is cached, so a
    /// rebuild racing fast-path projection for the same instance can regress
    /// the cached state.
    ///
    /// # Arguments
    ///
    /// * `id` - The instance to rebuild.
    /// * `events` - Its event messages in log order.
    ///
    /// # Returns
    ///
    /// The folded state, versioned by the number of events applied.
    ///
    /// # Errors
    ///
    /// Returns the first [`Failure`] from decoding, projection, or the
    /// repository's `update`.
    pub async fn hydrate<S>(&self, id: &str, mut events: S) -> Result<Versioned<A::State>, Failure>
    where
        S: Stream<Item = Message> + Send + Unpin,
    {
        let mut current = Versioned::new(self.aggregate.initial_state(), 0);
        while let Some(message) = events.next().await {
            let event = decode_event::<A>(&message)?;
            let state = self.aggregate.project(&current.state, &event)?;
            current = Versioned::new(state, current.version + 1);
        }

        if current.version > 0 {
            self.repository
                .update(id, current.state.clone(), current.version)
                .await?;
        }
        tracing::debug!(
            aggregate = A::AGGREGATE_TYPE,
            instance_id = id,
            version = current.version,
            "hydrated aggregate"
        );
        Ok(current)
    }

    /// Subscribe to fast-path projection results, recent history first.
    pub fn outcomes(&self) -> FeedStream<ProjectionOutcome> {
        self.outcomes.subscribe()
    }

    /// Stop the component, finish projecting every emitted event, then close
    /// the outcome feed. Idempotent.
    pub async fn stop(&self) {
        self.component.stop().await;
        let projector = self.projector.lock().await.take();
        if let Some(projector) = projector
            && let Err(e) = projector.await
        {
            tracing::error!(
                aggregate = A::AGGREGATE_TYPE,
                error = %e,
                "projector terminated abnormally"
            );
        }
        self.outcomes.close();
    }
}

fn decode_event<A: Aggregate>(message: &Message) -> Result<A::DomainEvent, Failure> {
    message
        .decode::<A::DomainEvent>()
        .map_err(|e| Failure::new(INVALID_EVENT, format!("{}: {e}", message.tag)))
}

/// Fold every emitted event onto the cached state, in outbox order.
async fn run_projector<A: Aggregate>(
    aggregate: Arc<A>,
    repository: Arc<dyn StateRepository<A::State>>,
    mut events: FeedStream<Envelope>,
    outcomes: ReplayFeed<ProjectionOutcome>,
) {
    while let Some(envelope) = events.next().await {
        let trace_id = envelope.trace_id;
        let instance_id = envelope.stream_name.id.clone();

        let projected = catch_panic(project_event(
            Arc::clone(&aggregate),
            Arc::clone(&repository),
            envelope,
        ))
        .await
        .unwrap_or_else(|panic| Err(Failure::unknown(panic)))
        .map_err(|failure| failure.with_trace_id(trace_id));

        if let Err(failure) = &projected {
            tracing::warn!(
                aggregate = A::AGGREGATE_TYPE,
                instance_id = %instance_id,
                trace_id = %trace_id,
                reason = %failure.reason,
                error = %failure.message,
                "projection failed"
            );
        }

        outcomes.publish(ProjectionOutcome {
            trace_id,
            instance_id,
            result: projected,
        });
    }
}

/// One fast-path step: get, project once, update at version + 1.
async fn project_event<A: Aggregate>(
    aggregate: Arc<A>,
    repository: Arc<dyn StateRepository<A::State>>,
    envelope: Envelope,
) -> Result<u64, Failure> {
    let event = decode_event::<A>(&envelope.message)?;
    let id = envelope.stream_name.id.as_str();
    let current = match repository.get(id).await? {
        Some(current) => current,
        None => Versioned::new(aggregate.initial_state(), 0),
    };
    let state = aggregate.project(&current.state, &event)?;
    let version = current.version + 1;
    repository.update(id, state, version).await?;
    Ok(version)
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    use super::*;

    pub(crate) const SERVICE: &str = "math";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum MathCommand {
        Add(i64),
        Subtract(i64),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum MathEvent {
        Added(i64),
        Subtracted(i64),
        Overflowed,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub(crate) struct Total {
        pub total: i64,
    }

    /// Running total; `Subtract` of a non-positive amount is rejected.
    pub(crate) struct MathAggregate;

    #[async_trait]
    impl Aggregate for MathAggregate {
        const AGGREGATE_TYPE: &'static str = "math";
        type State = Total;
        type Command = MathCommand;
        type DomainEvent = MathEvent;

        fn command_channels(&self) -> Vec<Channel> {
            vec![Channel::new(SERVICE, "math:command")]
        }

        fn event_channels(&self) -> Vec<Channel> {
            vec![Channel::new(SERVICE, "math:event")]
        }

        fn initial_state(&self) -> Total {
            Total::default()
        }

        async fn handle(&self, api: HandlerApi, id: InstanceId, command: MathCommand) -> HandlerResult {
            let events = match api.send("math:event") {
                Ok(sender) => sender,
                Err(e) => return api.failure("NoChannel", e.to_string()),
            };
            let event = match command {
                MathCommand::Add(n) => MathEvent::Added(n),
                MathCommand::Subtract(n) if n <= 0 => {
                    return api.failure("InvalidAmount", format!("cannot subtract {n}"));
                }
                MathCommand::Subtract(n) => MathEvent::Subtracted(n),
            };
            match events.send(id, &event) {
                Ok(_) => api.success(),
                Err(e) => api.failure("SendFailed", e.to_string()),
            }
        }

        fn project(&self, state: &Total, event: &MathEvent) -> Result<Total, Failure> {
            match event {
                MathEvent::Added(n) => Ok(Total {
                    total: state.total + n,
                }),
                MathEvent::Subtracted(n) => Ok(Total {
                    total: state.total - n,
                }),
                MathEvent::Overflowed => Err(Failure::new("Overflow", "total overflowed")),
            }
        }
    }

    pub(crate) fn event(e: &MathEvent) -> Message {
        Message::encode(e).expect("math events encode")
    }
}
