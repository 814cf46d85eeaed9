//! Redis pub/sub bus.
//!
//! Every subscription owns a dedicated upstream connection and one task that
//! forwards messages into a bounded queue. A full queue drops the message so
//! a slow consumer never blocks the connection or publishers.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use uuid::Uuid;

use gopro_core::{
    config::PubSubConfig, CacheError, KeySpace, Message, PubSub, Result, Subscription,
};

use crate::{client::RedisClient, error::map_redis_error};

/// How long `close` waits for each subscription task.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Channel,
    Pattern,
}

/// Instruction from the bus to a subscription task. Names are fully prefixed;
/// an empty list means all of them.
#[derive(Debug)]
enum Control {
    Unsubscribe(Vec<String>),
    Punsubscribe(Vec<String>),
    Stop,
}

struct SubscriptionHandle {
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

type Registry = Arc<RwLock<HashMap<Uuid, SubscriptionHandle>>>;

/// Redis pub/sub backend.
#[derive(Clone)]
pub struct RedisPubSub {
    client: RedisClient,
    keys: KeySpace,
    config: PubSubConfig,
    subscriptions: Registry,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl RedisPubSub {
    pub fn new(client: RedisClient, config: PubSubConfig) -> Self {
        let keys = client.key_space(&config.prefix);
        Self {
            client,
            keys,
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            dropped: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Subscribes to `channel` and runs `handler` for every message on a spawned task.
    ///
    /// Handler errors are logged. The task ends with the subscription.
    pub async fn subscribe_with_handler<F, Fut, E>(
        &self,
        channel: &str,
        handler: F,
    ) -> Result<JoinHandle<()>>
    where
        F: Fn(Message) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut subscription = self.subscribe(&[channel]).await?;
        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let channel = message.channel.clone();
                if let Err(e) = handler(message).await {
                    tracing::error!(channel = %channel, error = %e, "message handler failed");
                }
            }
        }))
    }

    async fn open(&self, names: &[&str], kind: Kind) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        if names.is_empty() {
            return Err(CacheError::InvalidArgument(
                "at least one channel or pattern is required".to_string(),
            ));
        }

        let full = self.keys.keys(names);
        let mut conn = self.client.pubsub_connection().await?;
        let subscribed = match kind {
            Kind::Channel => conn.subscribe(&full).await,
            Kind::Pattern => conn.psubscribe(&full).await,
        };
        subscribed.map_err(|e| map_redis_error("SUBSCRIBE", &full[0], e))?;

        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let (channels, patterns) = match kind {
            Kind::Channel => (full.into_iter().collect(), HashSet::new()),
            Kind::Pattern => (HashSet::new(), full.into_iter().collect()),
        };
        let worker = Worker {
            id,
            conn,
            keys: self.keys.clone(),
            channels,
            patterns,
            tx,
            control: control_rx,
            dropped: Arc::clone(&self.dropped),
        };

        // Hold the write lock so the task cannot deregister before it is registered.
        let mut subscriptions = self.subscriptions.write().await;
        let registry = Arc::clone(&self.subscriptions);
        let task = tokio::spawn(async move {
            worker.run().await;
            registry.write().await.remove(&id);
        });
        subscriptions.insert(
            id,
            SubscriptionHandle {
                control: control_tx,
                task,
            },
        );
        drop(subscriptions);

        tracing::debug!(%id, ?kind, names = ?names, "subscription started");
        Ok(Subscription::new(id, rx))
    }

    async fn broadcast(&self, make: impl Fn() -> Control) {
        let subscriptions = self.subscriptions.read().await;
        for handle in subscriptions.values() {
            // A send error means the task already ended.
            let _ = handle.control.send(make());
        }
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish_string(&self, channel: &str, payload: &str) -> Result<u64> {
        self.publish_bytes(channel, payload.as_bytes()).await
    }

    async fn publish_bytes(&self, channel: &str, payload: &[u8]) -> Result<u64> {
        self.client.publish(&self.keys.key(channel), payload).await
    }

    async fn bulk_publish(&self, messages: &[(&str, &str)]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (channel, payload) in messages {
            pipe.cmd("PUBLISH").arg(self.keys.key(channel)).arg(*payload);
        }
        let _: Vec<u64> = self
            .client
            .pipeline("PUBLISH", self.keys.base(), &pipe)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        self.open(channels, Kind::Channel).await
    }

    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription> {
        self.open(patterns, Kind::Pattern).await
    }

    async fn unsubscribe(&self, channels: &[&str]) -> Result<()> {
        let full = self.keys.keys(channels);
        self.broadcast(|| Control::Unsubscribe(full.clone())).await;
        Ok(())
    }

    async fn punsubscribe(&self, patterns: &[&str]) -> Result<()> {
        let full = self.keys.keys(patterns);
        self.broadcast(|| Control::Punsubscribe(full.clone())).await;
        Ok(())
    }

    async fn list_channels(&self, pattern: &str) -> Result<Vec<String>> {
        let channels = self
            .client
            .pubsub_channels(&self.keys.pattern(pattern))
            .await?;
        Ok(channels
            .iter()
            .map(|c| self.keys.strip(c).to_string())
            .collect())
    }

    async fn channel_subscribers(&self, channel: &str) -> Result<u64> {
        self.client.pubsub_numsub(&self.keys.key(channel)).await
    }

    fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let handles: Vec<(Uuid, SubscriptionHandle)> =
            self.subscriptions.write().await.drain().collect();
        for (_, handle) in &handles {
            let _ = handle.control.send(Control::Stop);
        }
        for (id, handle) in handles {
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, handle.task)
                .await
                .is_err()
            {
                tracing::warn!(%id, "subscription task did not stop in time, aborting");
                abort.abort();
            }
        }

        tracing::debug!("pub/sub closed");
        Ok(())
    }
}

/// Why the message loop paused.
enum Wake {
    Control(Control),
    ConsumerGone,
    StreamEnded,
}

/// State owned by one subscription task.
struct Worker {
    id: Uuid,
    conn: redis::aio::PubSub,
    keys: KeySpace,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    tx: mpsc::Sender<Message>,
    control: mpsc::UnboundedReceiver<Control>,
    dropped: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            match self.pump().await {
                Wake::Control(Control::Stop) | Wake::ConsumerGone => break,
                Wake::StreamEnded => {
                    tracing::warn!(id = %self.id, "subscription stream ended");
                    break;
                }
                Wake::Control(Control::Unsubscribe(names)) => {
                    let names = take_matching(&mut self.channels, names);
                    if !names.is_empty() {
                        if let Err(e) = self.conn.unsubscribe(&names).await {
                            tracing::warn!(id = %self.id, error = %e, "unsubscribe failed");
                        }
                    }
                }
                Wake::Control(Control::Punsubscribe(names)) => {
                    let names = take_matching(&mut self.patterns, names);
                    if !names.is_empty() {
                        if let Err(e) = self.conn.punsubscribe(&names).await {
                            tracing::warn!(id = %self.id, error = %e, "punsubscribe failed");
                        }
                    }
                }
            }
            if self.channels.is_empty() && self.patterns.is_empty() {
                break;
            }
        }
        tracing::debug!(id = %self.id, "subscription ended");
    }

    /// Forwards messages until a control instruction arrives or delivery must stop.
    async fn pump(&mut self) -> Wake {
        let mut stream = self.conn.on_message();
        loop {
            tokio::select! {
                _ = self.tx.closed() => return Wake::ConsumerGone,
                control = self.control.recv() => {
                    return Wake::Control(control.unwrap_or(Control::Stop));
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Wake::StreamEnded;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(id = %self.id, error = %e, "unreadable message payload");
                            continue;
                        }
                    };
                    let pattern = if msg.from_pattern() {
                        msg.get_pattern::<String>()
                            .ok()
                            .map(|p| self.keys.strip(&p).to_string())
                    } else {
                        None
                    };
                    let message = Message {
                        channel: self.keys.strip(msg.get_channel_name()).to_string(),
                        pattern,
                        payload,
                    };
                    match self.tx.try_send(message) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(message)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                id = %self.id,
                                channel = %message.channel,
                                "subscriber queue full, dropping message"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return Wake::ConsumerGone,
                    }
                }
            }
        }
    }
}

/// Removes and returns the requested names this subscription holds.
fn take_matching(held: &mut HashSet<String>, requested: Vec<String>) -> Vec<String> {
    if requested.is_empty() {
        return held.drain().collect();
    }
    requested
        .into_iter()
        .filter(|name| held.remove(name))
        .collect()
}
