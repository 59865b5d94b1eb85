//! Embeddable event-sourcing engine: an ordered message log with replaying
//! dispatchers, serialized message-handling components, and aggregates that
//! fold their own events into materialized state.

mod aggregate;
pub use aggregate::{
    Aggregate, AggregateHandle, INVALID_COMMAND, INVALID_EVENT, InMemoryStateRepository,
    ProjectionOutcome, StateRepository, Versioned,
};
mod component;
pub use component::{
    ChannelSender, Component, ComponentConfig, DEFAULT_FEED_CAPACITY, Handler, HandlerApi,
    HandlerOutcome, HandlerResult,
};
mod db;
mod dispatcher;
mod error;
mod feed;
mod message;
mod store;

pub use db::{InMemoryMessageStoreDb, JsonlMessageStoreDb, LogResult, MessageStoreDb};
pub use dispatcher::{
    DispatchHandler, Dispatcher, DispatcherCheckpoint, DispatcherSubscription, OffsetPolicy,
    load_checkpoint, save_checkpoint,
};
pub use error::{
    AggregateError, ComponentError, DispatchError, Failure, StoreError, UNKNOWN_REASON,
};
pub use feed::{FeedStream, ReplayFeed};
pub use message::{
    Channel, Envelope, IncomingMessage, InstanceId, Message, MessageId, StoredMessage,
    StreamName, TraceId, new_message_id, new_trace_id,
};
pub use store::{DEFAULT_LIVE_BUFFER_SIZE, MessageStore, MessageStoreBuilder, StoreConfig};
