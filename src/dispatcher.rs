//! Dispatchers: log consumers with per-channel resume offsets.
//!
//! A [`Dispatcher`] holds one [`DispatcherSubscription`] per channel. Once
//! bound to a [`MessageStore`](crate::MessageStore) it is fed historical
//! backfill and then live traffic. [`Dispatcher::filter`] admits only
//! messages past the channel's offset, and [`Dispatcher::handle`] advances
//! that offset after invoking the handler.
//!
//! Offsets can be persisted with [`save_checkpoint`] and later resumed with
//! [`load_checkpoint`] plus [`Dispatcher::from_checkpoint`]. Checkpoints are
//! keyed by dispatcher name, so several dispatchers can share one directory.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::{DispatchError, catch_panic};
use crate::message::{Channel, StoredMessage};

const CHECKPOINT_EXT: &str = "checkpoint.json";
const DEFAULT_NAME: &str = "dispatcher";

/// One channel a dispatcher consumes, with the last handled `channel_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSubscription {
    /// The consumed channel.
    pub channel: Channel,
    /// `channel_version` of the last message handled on `channel`; `0` means
    /// nothing handled yet.
    pub offset: u64,
}

impl DispatcherSubscription {
    /// A subscription that has handled nothing yet.
    pub fn new(channel: Channel) -> Self {
        Self { channel, offset: 0 }
    }

    /// A subscription resuming after `offset`.
    pub fn at(channel: Channel, offset: u64) -> Self {
        Self { channel, offset }
    }
}

/// When [`Dispatcher::handle`] advances a channel's offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetPolicy {
    /// Advance whether or not the handler succeeded. A failed message is
    /// never redelivered (at-most-once).
    #[default]
    AdvanceAlways,
    /// Advance only when the handler succeeded, so a failed message stays
    /// eligible for redelivery on the next bind.
    AdvanceOnSuccess,
}

/// Handler invoked by a dispatcher for each admitted message.
///
/// Any `Fn(StoredMessage) -> impl Future<Output = Result<(), DispatchError>>`
/// closure implements this trait.
#[async_trait]
pub trait DispatchHandler: Send + Sync + 'static {
    /// Handle one stored message.
    async fn handle(&self, message: StoredMessage) -> Result<(), DispatchError>;
}

#[async_trait]
impl<F, Fut> DispatchHandler for F
where
    F: Fn(StoredMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    async fn handle(&self, message: StoredMessage) -> Result<(), DispatchError> {
        (self)(message).await
    }
}

/// Serializable snapshot of a dispatcher's resume point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherCheckpoint {
    /// Dispatcher name.
    pub name: String,
    /// Subscriptions with their offsets at snapshot time.
    pub subscriptions: Vec<DispatcherSubscription>,
}

/// A log consumer with per-channel offsets.
///
/// Offsets only ever increase. Deliveries through a store binding are
/// serialized: one message is filtered and handled to completion before the
/// next, even when the same dispatcher is bound more than once.
pub struct Dispatcher {
    name: String,
    subscriptions: Mutex<Vec<DispatcherSubscription>>,
    handler: Arc<dyn DispatchHandler>,
    policy: OffsetPolicy,
    delivery: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("subscriptions", &*self.lock_subscriptions())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Dispatcher {
    /// A dispatcher over `channels`, every offset at `0`, so binding it
    /// replays the full history.
    pub fn create(
        channels: impl IntoIterator<Item = Channel>,
        handler: impl DispatchHandler,
    ) -> Self {
        Self::restore(
            channels.into_iter().map(DispatcherSubscription::new),
            handler,
        )
    }

    /// A dispatcher resuming from previously recorded offsets.
    pub fn restore(
        subscriptions: impl IntoIterator<Item = DispatcherSubscription>,
        handler: impl DispatchHandler,
    ) -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            subscriptions: Mutex::new(subscriptions.into_iter().collect()),
            handler: Arc::new(handler),
            policy: OffsetPolicy::default(),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    /// A dispatcher resuming from a loaded checkpoint, keeping its name.
    pub fn from_checkpoint(
        checkpoint: DispatcherCheckpoint,
        handler: impl DispatchHandler,
    ) -> Self {
        Self::restore(checkpoint.subscriptions, handler).with_name(checkpoint.name)
    }

    /// A dispatcher feeding every input channel of `component` into its
    /// inbox via [`Component::recv_raw`].
    pub fn from_component(component: &Component) -> Self {
        let target = component.clone();
        let handler = move |message: StoredMessage| {
            let target = target.clone();
            async move { target.recv_raw(message.into()).map_err(DispatchError::from) }
        };
        Self::create(component.config().input_channels.iter().cloned(), handler)
            .with_name(component.name())
    }

    /// Set the name used in logs and checkpoints.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set when offsets advance. Default: [`OffsetPolicy::AdvanceAlways`].
    pub fn with_offset_policy(mut self, policy: OffsetPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Dispatcher name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active offset policy.
    pub fn offset_policy(&self) -> OffsetPolicy {
        self.policy
    }

    /// Copy of the current subscriptions.
    pub fn subscriptions(&self) -> Vec<DispatcherSubscription> {
        self.lock_subscriptions().clone()
    }

    /// Current offset for `channel`, or `None` if not subscribed.
    pub fn offset(&self, channel: &Channel) -> Option<u64> {
        self.lock_subscriptions()
            .iter()
            .find(|s| &s.channel == channel)
            .map(|s| s.offset)
    }

    /// Returns `true` if some subscription's channel matches the message and
    /// the message's `channel_version` is past that subscription's offset.
    pub fn filter(&self, message: &StoredMessage) -> bool {
        matches_subscriptions(message, &self.lock_subscriptions())
    }

    /// Invoke the handler for `message`, then advance the matching channel's
    /// offset to its `channel_version` as the [`OffsetPolicy`] dictates.
    ///
    /// A handler panic is caught and returned as
    /// [`DispatchError::Panicked`].
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returned.
    pub async fn handle(&self, message: &StoredMessage) -> Result<(), DispatchError> {
        let _delivery = self.delivery.lock().await;
        self.handle_locked(message).await
    }

    /// Filter and handle one message as a store binding does, logging a
    /// handler error instead of returning it. Returns `true` if the message
    /// was admitted.
    pub(crate) async fn deliver(&self, message: &StoredMessage) -> bool {
        let _delivery = self.delivery.lock().await;
        if !self.filter(message) {
            return false;
        }
        if let Err(e) = self.handle_locked(message).await {
            tracing::error!(
                dispatcher = %self.name,
                channel = %message.stream_name.channel(),
                channel_version = message.channel_version,
                trace_id = %message.trace_id,
                error = %e,
                "dispatcher handler failed"
            );
        }
        true
    }

    /// Snapshot the current resume point.
    pub fn checkpoint(&self) -> DispatcherCheckpoint {
        DispatcherCheckpoint {
            name: self.name.clone(),
            subscriptions: self.subscriptions(),
        }
    }

    async fn handle_locked(&self, message: &StoredMessage) -> Result<(), DispatchError> {
        let handler = Arc::clone(&self.handler);
        let owned = message.clone();
        let result = match catch_panic(async move { handler.handle(owned).await }).await {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Panicked(panic)),
        };

        let advance = match self.policy {
            OffsetPolicy::AdvanceAlways => true,
            OffsetPolicy::AdvanceOnSuccess => result.is_ok(),
        };
        if advance {
            for sub in self.lock_subscriptions().iter_mut() {
                if message.stream_name.in_channel(&sub.channel) {
                    sub.offset = sub.offset.max(message.channel_version);
                }
            }
        }
        result
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<DispatcherSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared by [`Dispatcher::filter`] and the backfill query in
/// [`MessageStoreDb`](crate::MessageStoreDb) backends.
pub(crate) fn matches_subscriptions(
    message: &StoredMessage,
    subscriptions: &[DispatcherSubscription],
) -> bool {
    subscriptions.iter().any(|sub| {
        message.stream_name.in_channel(&sub.channel) && message.channel_version > sub.offset
    })
}

fn checkpoint_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{CHECKPOINT_EXT}"))
}

/// Save a dispatcher checkpoint atomically.
///
/// Writes `<name>.checkpoint.json.tmp` in `dir`, then renames it over
/// `<name>.checkpoint.json`, where `<name>` is the checkpoint's dispatcher
/// name. `dir` is created if missing.
///
/// # Arguments
///
/// * `dir` - Directory holding checkpoints, shared by any number of
///   dispatchers.
/// * `checkpoint` - The snapshot from [`Dispatcher::checkpoint`].
///
/// # Errors
///
/// Returns `io::Error` if the directory cannot be created or the file cannot
/// be written or renamed.
pub fn save_checkpoint(dir: &Path, checkpoint: &DispatcherCheckpoint) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = checkpoint_path(dir, &checkpoint.name);
    let mut tmp_path = path.clone().into_os_string();
    tmp_path.push(".tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)
}

/// Load the checkpoint of dispatcher `name` from `dir`.
///
/// # Returns
///
/// `Ok(None)` if the file does not exist, is corrupt, or belongs to a
/// different dispatcher; the dispatcher then replays from scratch.
///
/// # Errors
///
/// Returns `io::Error` for I/O failures other than file-not-found.
pub fn load_checkpoint(dir: &Path, name: &str) -> io::Result<Option<DispatcherCheckpoint>> {
    let path = checkpoint_path(dir, name);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_str::<DispatcherCheckpoint>(&content) {
        Ok(checkpoint) if checkpoint.name == name => Ok(Some(checkpoint)),
        Ok(checkpoint) => {
            tracing::warn!(
                path = %path.display(),
                found = %checkpoint.name,
                "checkpoint belongs to another dispatcher, will replay"
            );
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "corrupt dispatcher checkpoint, will replay"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::component::test_fixtures::{ping_channel, ping_pong_config, pong_channel, pong_handler};
    use crate::message::{Message, new_message_id, new_trace_id};

    fn stored(channel: &Channel, channel_version: u64) -> StoredMessage {
        StoredMessage {
            id: new_message_id(),
            version: channel_version,
            channel_version,
            depth: 0,
            trace_id: new_trace_id(),
            stream_name: channel.stream("p-1"),
            message: Message::new("Ping"),
        }
    }

    fn counting() -> (Arc<AtomicUsize>, impl DispatchHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler = move |_msg: StoredMessage| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<(), DispatchError>(())
            }
        };
        (count, handler)
    }

    fn failing(_msg: StoredMessage) -> std::future::Ready<Result<(), DispatchError>> {
        std::future::ready(Err(DispatchError::handler("nope")))
    }

    #[test]
    fn filter_requires_channel_match_and_newer_version() {
        let (_, handler) = counting();
        let dispatcher = Dispatcher::restore(
            [DispatcherSubscription::at(ping_channel(), 2)],
            handler,
        );

        assert!(!dispatcher.filter(&stored(&ping_channel(), 1)));
        assert!(!dispatcher.filter(&stored(&ping_channel(), 2)));
        assert!(dispatcher.filter(&stored(&ping_channel(), 3)));
        assert!(!dispatcher.filter(&stored(&pong_channel(), 3)));
        assert!(!dispatcher.filter(&stored(&Channel::new("other", "ping"), 3)));
    }

    #[tokio::test]
    async fn handle_advances_offset_monotonically() {
        let (count, handler) = counting();
        let dispatcher = Dispatcher::create([ping_channel(), pong_channel()], handler);

        dispatcher
            .handle(&stored(&ping_channel(), 4))
            .await
            .expect("handler succeeds");
        assert_eq!(dispatcher.offset(&ping_channel()), Some(4));
        assert_eq!(dispatcher.offset(&pong_channel()), Some(0));

        // An older message never moves the offset backwards.
        dispatcher
            .handle(&stored(&ping_channel(), 2))
            .await
            .expect("handler succeeds");
        assert_eq!(dispatcher.offset(&ping_channel()), Some(4));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_handler_still_advances_by_default() {
        let dispatcher = Dispatcher::create([ping_channel()], failing);
        assert_eq!(dispatcher.offset_policy(), OffsetPolicy::AdvanceAlways);

        let err = dispatcher
            .handle(&stored(&ping_channel(), 1))
            .await
            .expect_err("handler fails");
        assert!(matches!(err, DispatchError::Handler(_)));
        assert_eq!(dispatcher.offset(&ping_channel()), Some(1));
    }

    #[tokio::test]
    async fn advance_on_success_keeps_failed_messages_eligible() {
        let dispatcher = Dispatcher::create([ping_channel()], failing)
            .with_offset_policy(OffsetPolicy::AdvanceOnSuccess);
        let msg = stored(&ping_channel(), 1);

        assert!(dispatcher.handle(&msg).await.is_err());
        assert_eq!(dispatcher.offset(&ping_channel()), Some(0));
        assert!(dispatcher.filter(&msg));
    }

    #[tokio::test]
    async fn panicking_handler_is_reported_and_offset_advances() {
        let dispatcher = Dispatcher::create([ping_channel()], |msg: StoredMessage| async move {
            if msg.channel_version > 0 {
                panic!("dispatcher handler exploded");
            }
            Ok::<(), DispatchError>(())
        });

        let err = dispatcher
            .handle(&stored(&ping_channel(), 3))
            .await
            .expect_err("panic becomes an error");
        assert!(
            matches!(&err, DispatchError::Panicked(text) if text.contains("exploded")),
            "unexpected error: {err:?}"
        );
        assert_eq!(dispatcher.offset(&ping_channel()), Some(3));
    }

    #[tokio::test]
    async fn deliver_skips_filtered_messages() {
        let (count, handler) = counting();
        let dispatcher = Dispatcher::create([ping_channel()], handler);

        assert!(dispatcher.deliver(&stored(&ping_channel(), 1)).await);
        assert!(!dispatcher.deliver(&stored(&ping_channel(), 1)).await);
        assert!(!dispatcher.deliver(&stored(&pong_channel(), 2)).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn from_component_forwards_into_inbox() {
        let component = Component::spawn(ping_pong_config(), pong_handler);
        let dispatcher = Dispatcher::from_component(&component);

        assert_eq!(dispatcher.name(), "my-component");
        assert_eq!(
            dispatcher.subscriptions(),
            vec![DispatcherSubscription::new(ping_channel())]
        );

        let msg = stored(&ping_channel(), 1);
        dispatcher.handle(&msg).await.expect("forwarding succeeds");
        component.stop().await;

        let inbox: Vec<_> = component.inbox().collect().await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, msg.id);
        assert_eq!(inbox[0].version, Some(1));
    }

    #[test]
    fn checkpoint_round_trip_restores_name_and_offsets() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let dir = tmp.path().join("dispatchers");
        let (_, handler) = counting();
        let dispatcher = Dispatcher::restore(
            [DispatcherSubscription::at(ping_channel(), 7)],
            handler,
        )
        .with_name("audit");

        save_checkpoint(&dir, &dispatcher.checkpoint()).expect("save should succeed");
        assert!(dir.join("audit.checkpoint.json").exists());
        assert!(!dir.join("audit.checkpoint.json.tmp").exists());

        let loaded = load_checkpoint(&dir, "audit")
            .expect("load should succeed")
            .expect("checkpoint should exist");
        let (_, handler) = counting();
        let resumed = Dispatcher::from_checkpoint(loaded, handler);
        assert_eq!(resumed.name(), "audit");
        assert_eq!(resumed.subscriptions(), dispatcher.subscriptions());
        assert_eq!(resumed.offset(&ping_channel()), Some(7));
    }

    #[test]
    fn checkpoints_in_one_dir_are_kept_apart_by_name() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let (_, audit) = counting();
        let (_, billing) = counting();
        let audit = Dispatcher::restore([DispatcherSubscription::at(ping_channel(), 3)], audit)
            .with_name("audit");
        let billing = Dispatcher::restore([DispatcherSubscription::at(pong_channel(), 9)], billing)
            .with_name("billing");

        save_checkpoint(tmp.path(), &audit.checkpoint()).expect("save audit");
        save_checkpoint(tmp.path(), &billing.checkpoint()).expect("save billing");

        let loaded = load_checkpoint(tmp.path(), "billing")
            .expect("load should succeed")
            .expect("checkpoint should exist");
        assert_eq!(loaded.subscriptions, billing.subscriptions());
        assert_eq!(load_checkpoint(tmp.path(), "shipping").expect("missing is ok"), None);
    }

    #[test]
    fn missing_corrupt_or_foreign_checkpoint_loads_as_none() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        assert_eq!(load_checkpoint(tmp.path(), "audit").expect("missing is ok"), None);

        std::fs::write(tmp.path().join("audit.checkpoint.json"), "{ not json")
            .expect("write should succeed");
        assert_eq!(load_checkpoint(tmp.path(), "audit").expect("corrupt is ok"), None);

        let foreign = DispatcherCheckpoint {
            name: "billing".to_owned(),
            subscriptions: vec![DispatcherSubscription::new(ping_channel())],
        };
        std::fs::write(
            tmp.path().join("audit.checkpoint.json"),
            serde_json::to_string(&foreign).expect("encode"),
        )
        .expect("write should succeed");
        assert_eq!(load_checkpoint(tmp.path(), "audit").expect("foreign is ok"), None);
    }
}
