//! Message, envelope, and stream-addressing value types.
//!
//! These are the plain data types every other module passes around. A
//! [`Message`] is a tag plus an optional JSON payload; an [`Envelope`]
//! addresses it to one instance stream and ties it to a causal trace;
//! [`IncomingMessage`] and [`StoredMessage`] add the identity and ordering
//! metadata assigned on the way into a component or the log.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Globally unique id of a logged or received message.
pub type MessageId = Uuid;

/// Correlates every message caused by one originating request.
pub type TraceId = Uuid;

/// Identifier of one aggregate/entity instance within a channel.
pub type InstanceId = String;

/// Generate a fresh random trace id.
pub fn new_trace_id() -> TraceId {
    Uuid::new_v4()
}

/// Generate a fresh random message id.
pub fn new_message_id() -> MessageId {
    Uuid::new_v4()
}

/// A named topic within a service.
///
/// The unit that dispatcher subscriptions and `channel_version` counters
/// operate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Owning service name (e.g. `"billing"`).
    pub service: String,
    /// Channel name within the service (e.g. `"invoice:command"`).
    pub channel: String,
}

impl Channel {
    /// Build a channel from its service and channel names.
    pub fn new(service: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            channel: channel.into(),
        }
    }

    /// Address one instance stream within this channel.
    pub fn stream(&self, id: impl Into<InstanceId>) -> StreamName {
        StreamName {
            service: self.service.clone(),
            channel: self.channel.clone(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.channel)
    }
}

/// One instance's message stream within one channel of one service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamName {
    /// Owning service name.
    pub service: String,
    /// Channel name within the service.
    pub channel: String,
    /// Instance identifier.
    pub id: InstanceId,
}

impl StreamName {
    /// Build a stream name from its three components.
    pub fn new(
        service: impl Into<String>,
        channel: impl Into<String>,
        id: impl Into<InstanceId>,
    ) -> Self {
        Self {
            service: service.into(),
            channel: channel.into(),
            id: id.into(),
        }
    }

    /// The id-less projection of this stream name.
    pub fn channel(&self) -> Channel {
        Channel::new(self.service.clone(), self.channel.clone())
    }

    /// Returns `true` if this stream lives in `channel`, ignoring the id.
    pub fn in_channel(&self, channel: &Channel) -> bool {
        self.service == channel.service && self.channel == channel.channel
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.channel, self.id)
    }
}

/// A tagged message with an optional JSON payload.
///
/// Typed channel messages are ordinary serde enums using adjacent tagging
/// (`#[serde(tag = "type", content = "data")]`). [`Message::encode`] maps the
/// `"type"` field onto [`tag`](Message::tag) and `"data"` onto
/// [`payload`](Message::payload); [`Message::decode`] reverses it.
///
/// # Examples
///
/// ```
/// use eventfold_bus::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum Ping {
///     Ping,
///     PingMultiple(u32),
/// }
///
/// let msg = Message::encode(&Ping::PingMultiple(3)).unwrap();
/// assert_eq!(msg.tag, "PingMultiple");
/// assert_eq!(msg.decode::<Ping>().unwrap(), Ping::PingMultiple(3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Variant tag, unique within the message's channel.
    pub tag: String,
    /// Payload; absent for fieldless variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    /// A payload-less message.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            payload: None,
        }
    }

    /// A message carrying `payload`.
    pub fn with_payload(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            tag: tag.into(),
            payload: Some(payload),
        }
    }

    /// Encode an adjacently tagged serde value into a raw message.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `value` fails to serialize or does not
    /// serialize to an object with a string `"type"` field.
    pub fn encode<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        let value = serde_json::to_value(value)?;
        let Value::Object(mut obj) = value else {
            return Err(<serde_json::Error as serde::ser::Error>::custom(
                "message must serialize to a JSON object",
            ));
        };
        let tag = match obj.remove("type") {
            Some(Value::String(tag)) => tag,
            _ => {
                return Err(<serde_json::Error as serde::ser::Error>::custom(
                    "message must have a string 'type' field",
                ));
            }
        };
        Ok(Self {
            tag,
            payload: obj.remove("data"),
        })
    }

    /// Decode this raw message into an adjacently tagged serde value.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the tag is unknown to `T` or the payload
    /// does not match the variant's shape.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let tagged = match &self.payload {
            None => serde_json::json!({ "type": self.tag }),
            Some(data) => serde_json::json!({ "type": self.tag, "data": data }),
        };
        serde_json::from_value(tagged)
    }
}

/// A message addressed to a stream and bound to a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Causal chain this message belongs to.
    pub trace_id: TraceId,
    /// Destination stream.
    pub stream_name: StreamName,
    /// The message itself.
    pub message: Message,
}

impl Envelope {
    /// Assemble an envelope.
    pub fn new(trace_id: TraceId, stream_name: StreamName, message: Message) -> Self {
        Self {
            trace_id,
            stream_name,
            message,
        }
    }
}

/// An envelope as delivered into a component inbox.
///
/// `version` is `None` for messages injected directly into a component that
/// never went through the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Message id; stable once assigned.
    pub id: MessageId,
    /// Per-instance stream version, once logged.
    pub version: Option<u64>,
    /// Causal chain this message belongs to.
    pub trace_id: TraceId,
    /// Stream the message was addressed to.
    pub stream_name: StreamName,
    /// The message itself.
    pub message: Message,
}

impl IncomingMessage {
    /// Wrap an unlogged envelope with a fresh id.
    pub fn from_envelope(envelope: Envelope) -> Self {
        Self {
            id: new_message_id(),
            version: None,
            trace_id: envelope.trace_id,
            stream_name: envelope.stream_name,
            message: envelope.message,
        }
    }
}

impl From<StoredMessage> for IncomingMessage {
    fn from(stored: StoredMessage) -> Self {
        Self {
            id: stored.id,
            version: Some(stored.version),
            trace_id: stored.trace_id,
            stream_name: stored.stream_name,
            message: stored.message,
        }
    }
}

/// A logged message with all ordering metadata.
///
/// Only the message store backends construct these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Globally unique message id.
    pub id: MessageId,
    /// 1-based position within the `(service, channel, id)` stream.
    pub version: u64,
    /// 1-based position within the `(service, channel)` topic.
    pub channel_version: u64,
    /// 0-based position within the trace.
    pub depth: u64,
    /// Causal chain this message belongs to.
    pub trace_id: TraceId,
    /// Stream the message was logged to.
    pub stream_name: StreamName,
    /// The message itself.
    pub message: Message,
}

impl StoredMessage {
    /// The envelope this message was logged from.
    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.trace_id, self.stream_name.clone(), self.message.clone())
    }
}
