//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use proven_pubsub::{AckMessage, AckSender, DeliveryOutcome, Message, PublishMetadata};
use proven_pubsub_memory::PartitionConfig;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};

/// Upper bound on any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// A batch as seen by a handler.
#[derive(Debug)]
pub struct Delivered {
    pub at: Instant,
    pub messages: Vec<Message>,
}

impl Delivered {
    pub fn ids(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|message| message.message_id.to_string())
            .collect()
    }
}

pub type Deliveries = mpsc::UnboundedReceiver<Delivered>;

/// How a handler acknowledges the messages it receives.
#[derive(Clone, Copy, Debug)]
pub enum Reply {
    Nothing,
    Success,
    Failure,
}

/// Handler that records every batch and replies on `acks`.
pub fn recorder(
    acks: Option<AckSender>,
    reply: Reply,
) -> (impl Fn(Vec<Message>) + Send + Sync + 'static, Deliveries) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handler = move |messages: Vec<Message>| {
        let at = Instant::now();

        if let Some(acks) = &acks {
            for message in &messages {
                let ack = match reply {
                    Reply::Nothing => continue,
                    Reply::Success => AckMessage::success(message.message_id.clone()),
                    Reply::Failure => {
                        AckMessage::failure(message.message_id.clone(), "handler failed")
                    }
                };
                acks.try_send(ack).expect("ack channel full");
            }
        }

        let _ = tx.send(Delivered { at, messages });
    };

    (handler, rx)
}

pub async fn next_delivery(deliveries: &mut Deliveries) -> Delivered {
    timeout(WAIT, deliveries.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("Handler dropped")
}

/// Collects deliveries until `count` messages have arrived.
pub async fn collect_messages(deliveries: &mut Deliveries, count: usize) -> Vec<Message> {
    let mut messages = Vec::new();
    while messages.len() < count {
        messages.extend(next_delivery(deliveries).await.messages);
    }
    messages
}

pub async fn assert_no_delivery(deliveries: &mut Deliveries, wait: Duration) {
    if let Ok(Some(delivered)) = timeout(wait, deliveries.recv()).await {
        panic!("Unexpected delivery: {:?}", delivered.ids());
    }
}

pub async fn next_outcome(outcomes: &mut broadcast::Receiver<DeliveryOutcome>) -> DeliveryOutcome {
    timeout(WAIT, outcomes.recv())
        .await
        .expect("Timeout waiting for outcome")
        .expect("Outcome channel closed")
}

pub async fn assert_no_outcome(
    outcomes: &mut broadcast::Receiver<DeliveryOutcome>,
    wait: Duration,
) {
    if let Ok(Ok(outcome)) = timeout(wait, outcomes.recv()).await {
        panic!("Unexpected outcome: {outcome:?}");
    }
}

pub fn with_id(id: &str) -> PublishMetadata {
    PublishMetadata::default().with_message_id(id)
}

pub fn payload(body: &'static str) -> Bytes {
    Bytes::from_static(body.as_bytes())
}

pub fn partition_config() -> PartitionConfig {
    PartitionConfig {
        drain_grace: Duration::from_millis(200),
        ..PartitionConfig::default()
    }
}
