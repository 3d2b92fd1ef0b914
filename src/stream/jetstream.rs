use std::time::Duration;

use async_nats::HeaderMap;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, pull};
use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, Context, Message};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{Commit, Delivery, Envelope, StreamLog, Subscription};
use crate::error::StreamError;

/// Header carrying the unsanitized partition key.
const PARTITION_KEY_HEADER: &str = "Transit-Partition-Key";
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(60);

/// Stream log on NATS JetStream.
///
/// A topic maps to one file-backed stream whose subjects are
/// `<topic>.<partition key>`, so that every route has its own subject and
/// JetStream keeps its messages in append order. The `Nats-Msg-Id` header
/// carries the record identity, letting the server drop repeated appends
/// inside its duplicate window.
pub struct JetStreamLog {
    jetstream: Context,
    retention: Duration,
    ack_wait: Duration,
}

impl JetStreamLog {
    pub async fn connect(url: &str, retention: Duration) -> Result<Self, StreamError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;
        info!(url, retention_secs = retention.as_secs(), "Connected to NATS");
        Ok(Self {
            jetstream: jetstream::new(client),
            retention,
            ack_wait: DEFAULT_ACK_WAIT,
        })
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Creates the backing stream for `topic` if it does not exist yet.
    pub async fn ensure_stream(&self, topic: &str) -> Result<jetstream::stream::Stream, StreamError> {
        let config = Config {
            name: stream_name(topic),
            subjects: vec![format!("{topic}.>")],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age: self.retention,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| StreamError::ConnectionFailed(format!("stream creation failed: {e}")))
    }
}

#[async_trait]
impl StreamLog for JetStreamLog {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        message_id: &str,
        payload: Bytes,
    ) -> Result<u64, StreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, message_id);
        headers.insert(PARTITION_KEY_HEADER, partition_key);

        let subject = format!("{topic}.{}", sanitize_token(partition_key));
        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, payload)
            .await
            .map_err(|e| StreamError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| StreamError::PublishFailed(e.to_string()))?;

        if ack.duplicate {
            debug!(message_id, "JetStream dropped duplicate append");
        }
        Ok(ack.sequence)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, StreamError> {
        let stream = self
            .ensure_stream(topic)
            .await
            .map_err(|e| StreamError::SubscribeFailed(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                group,
                pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: format!("{topic}.>"),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StreamError::SubscribeFailed(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| StreamError::SubscribeFailed(e.to_string()))?;

        info!(topic, group, "Subscribed to JetStream consumer");
        Ok(Box::new(JetStreamSubscription { messages }))
    }
}

struct JetStreamSubscription {
    messages: pull::Stream,
}

#[async_trait]
impl Subscription for JetStreamSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, StreamError> {
        loop {
            let Some(result) = self.messages.next().await else {
                return Ok(None);
            };
            let message = match result {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Error receiving JetStream message");
                    continue;
                }
            };

            let offset = message
                .info()
                .map(|info| info.stream_sequence)
                .map_err(|e| StreamError::SubscribeFailed(e.to_string()))?;
            let partition_key = partition_key_of(&message);
            let envelope = Envelope {
                partition_key,
                payload: message.payload.clone(),
                offset,
            };
            return Ok(Some(Delivery::new(envelope, JetStreamCommit { message })));
        }
    }
}

struct JetStreamCommit {
    message: Message,
}

#[async_trait]
impl Commit for JetStreamCommit {
    async fn commit(&self) -> Result<(), StreamError> {
        self.message
            .ack()
            .await
            .map_err(|e| StreamError::CommitFailed(e.to_string()))
    }
}

fn partition_key_of(message: &Message) -> String {
    message
        .headers
        .as_ref()
        .and_then(|h| h.get(PARTITION_KEY_HEADER))
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|| {
            message
                .subject
                .as_str()
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string()
        })
}

fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Makes a partition key usable as a single NATS subject token.
fn sanitize_token(key: &str) -> String {
    let token: String = key
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}
