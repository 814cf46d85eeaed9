//! Pub/sub message and consumer handle.

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Capacity of a subscription's outbound queue.
pub const SUBSCRIPTION_BUFFER: usize = 100;

/// A delivered message. Channel and pattern carry no namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    /// The matching pattern, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: String,
}

impl Message {
    /// Decodes a JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        crate::serialization::decode(&self.payload)
    }
}

/// Consumer side of a subscription.
///
/// Dropping or closing it ends the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub fn new(id: Uuid, rx: mpsc::Receiver<Message>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the next message; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery. Messages already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
