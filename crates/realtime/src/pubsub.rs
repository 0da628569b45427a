//! Cross-instance fan-out over a publish/subscribe bus
//!
//! One channel per chat (`chat:{chatId}`). The bus is best effort: no backlog,
//! no redelivery. Clients that missed something catch up from the message store.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use teamhub_shared::{ChatError, ChatId, ChatResult};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::websocket::events::Frame;

const RESUBSCRIBE_BASE_DELAY_MS: u64 = 10;
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);
const MEMORY_CHANNEL_CAPACITY: usize = 1024;
const SUBSCRIPTION_BUFFER: usize = 1024;

pub fn chat_channel(chat_id: ChatId) -> String {
    format!("chat:{chat_id}")
}

/// What travels on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Instance that published the frame (and already delivered it locally)
    pub origin: Uuid,
    pub frame: Frame,
}

/// Raw publish/subscribe transport
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> ChatResult<()>;

    /// Subscribe to a channel. The stream ends when the underlying connection
    /// is lost, and dropping it releases the subscription.
    async fn subscribe(&self, channel: &str) -> ChatResult<BoxStream<'static, String>>;
}

/// Receives frames that arrived from other instances
pub trait EnvelopeSink: Send + Sync + 'static {
    fn deliver(&self, chat_id: ChatId, frame: Frame);
}

fn bus_error(e: redis::RedisError) -> ChatError {
    ChatError::BusUnavailable(e.to_string())
}

// =============================================================================
// Redis
// =============================================================================

enum SubscriberCommand {
    Subscribe {
        channel: String,
        id: u64,
        sender: mpsc::Sender<String>,
        ack: oneshot::Sender<ChatResult<()>>,
    },
    Unsubscribe {
        channel: String,
        id: u64,
    },
}

/// Per-channel subscriber lists for one shared pub/sub connection
#[derive(Default)]
struct ChannelRoutes {
    channels: HashMap<String, Vec<(u64, mpsc::Sender<String>)>>,
}

impl ChannelRoutes {
    /// Returns true when this is the first subscriber of the channel
    fn add(&mut self, channel: &str, id: u64, sender: mpsc::Sender<String>) -> bool {
        let subscribers = self.channels.entry(channel.to_string()).or_default();
        subscribers.push((id, sender));
        subscribers.len() == 1
    }

    /// Returns true when the channel has no subscribers left
    fn remove(&mut self, channel: &str, id: u64) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        subscribers.retain(|(existing, _)| *existing != id);
        if subscribers.is_empty() {
            self.channels.remove(channel);
            return true;
        }
        false
    }

    fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Hand a payload to every subscriber of `channel`. Returns true when the
    /// channel emptied because all its receivers were gone.
    fn route(&mut self, channel: &str, payload: &str) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        subscribers.retain(|(_, sender)| match sender.try_send(payload.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel, "Bus subscriber is full, dropping payload");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            self.channels.remove(channel);
            return true;
        }
        false
    }

    /// Ends every subscriber stream
    fn clear(&mut self) {
        self.channels.clear();
    }
}

/// Redis pub/sub. Publishing shares the connection manager. All subscriptions
/// share one pub/sub connection owned by a background task.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    commands: mpsc::UnboundedSender<SubscriberCommand>,
    next_id: Arc<AtomicU64>,
}

impl RedisBroker {
    /// Must be called inside a Tokio runtime
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber(client, receiver));
        Self {
            conn,
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> ChatResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(channel, payload)
            .await
            .map(|_| ())
            .map_err(bus_error)
    }

    async fn subscribe(&self, channel: &str) -> ChatResult<BoxStream<'static, String>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (ack, acked) = oneshot::channel();
        let stopped = || ChatError::BusUnavailable("subscriber task stopped".to_string());

        self.commands
            .send(SubscriberCommand::Subscribe {
                channel: channel.to_string(),
                id,
                sender,
                ack,
            })
            .map_err(|_| stopped())?;
        acked.await.map_err(|_| stopped())??;

        Ok(RedisSubscription {
            receiver,
            channel: channel.to_string(),
            id,
            commands: self.commands.clone(),
        }
        .boxed())
    }
}

/// One subscriber's view of the shared connection
struct RedisSubscription {
    receiver: mpsc::Receiver<String>,
    channel: String,
    id: u64,
    commands: mpsc::UnboundedSender<SubscriberCommand>,
}

impl Stream for RedisSubscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(SubscriberCommand::Unsubscribe {
            channel: std::mem::take(&mut self.channel),
            id: self.id,
        });
    }
}

/// Wait for the next message, or forever while disconnected
async fn next_message(stream: &mut Option<PubSubStream>) -> Option<redis::Msg> {
    match stream {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

/// Owns the shared pub/sub connection. Connects on demand; when the connection
/// drops, every subscriber stream ends and the bridge resubscribes.
async fn run_subscriber(
    client: redis::Client,
    mut commands: mpsc::UnboundedReceiver<SubscriberCommand>,
) {
    let mut routes = ChannelRoutes::default();
    let mut sink: Option<PubSubSink> = None;
    let mut stream: Option<PubSubStream> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::debug!("Redis broker dropped, stopping subscriber task");
                    return;
                };
                match command {
                    SubscriberCommand::Subscribe { channel, id, sender, ack } => {
                        let result = subscribe_channel(&client, &mut sink, &mut stream, &routes, &channel).await;
                        if result.is_ok() {
                            routes.add(&channel, id, sender);
                        }
                        let _ = ack.send(result);
                    }
                    SubscriberCommand::Unsubscribe { channel, id } => {
                        if routes.remove(&channel, id) {
                            unsubscribe_channel(&mut sink, &channel).await;
                        }
                    }
                }
            }
            message = next_message(&mut stream) => {
                match message {
                    Some(message) => {
                        let channel = message.get_channel_name().to_string();
                        match message.get_payload::<String>() {
                            Ok(payload) => {
                                if routes.route(&channel, &payload) {
                                    unsubscribe_channel(&mut sink, &channel).await;
                                }
                            }
                            Err(e) => tracing::warn!(channel = %channel, error = %e, "Dropping non-text bus payload"),
                        }
                    }
                    None => {
                        tracing::warn!("Redis pub/sub connection lost");
                        sink = None;
                        stream = None;
                        routes.clear();
                    }
                }
            }
        }
    }
}

async fn subscribe_channel(
    client: &redis::Client,
    sink: &mut Option<PubSubSink>,
    stream: &mut Option<PubSubStream>,
    routes: &ChannelRoutes,
    channel: &str,
) -> ChatResult<()> {
    if routes.contains(channel) && sink.is_some() {
        return Ok(());
    }

    if sink.is_none() {
        let (new_sink, new_stream) = client.get_async_pubsub().await.map_err(bus_error)?.split();
        *sink = Some(new_sink);
        *stream = Some(new_stream);
        tracing::info!("Opened Redis pub/sub connection");
    }

    if let Some(active) = sink.as_mut() {
        active.subscribe(channel).await.map_err(bus_error)?;
    }
    Ok(())
}

async fn unsubscribe_channel(sink: &mut Option<PubSubSink>, channel: &str) {
    if let Some(active) = sink {
        if let Err(e) = active.unsubscribe(channel).await {
            tracing::warn!(channel, error = %e, "Redis unsubscribe failed");
        }
    }
}

// =============================================================================
// In-memory
// =============================================================================

type MemoryChannels = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// Process-local broker. Managers sharing one instance behave like separate
/// processes sharing a Redis.
#[derive(Default)]
pub struct MemoryBroker {
    channels: MemoryChannels,
    #[cfg(test)]
    unavailable: std::sync::atomic::AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_available(&self) -> ChatResult<()> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ChatError::BusUnavailable("broker offline".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_available(&self) -> ChatResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> ChatResult<()> {
        self.check_available()?;
        let sender = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned();
        // No sender means nobody is subscribed
        if let Some(sender) = sender {
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ChatResult<BoxStream<'static, String>> {
        self.check_available()?;
        let receiver = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(|item| {
            futures::future::ready(match item {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "Memory bus subscriber lagged");
                    None
                }
            })
        });
        Ok(MemorySubscription {
            inner: Some(stream.boxed()),
            channel: channel.to_string(),
            channels: Arc::clone(&self.channels),
        }
        .boxed())
    }
}

/// Removes the channel once its last subscriber goes away
struct MemorySubscription {
    inner: Option<BoxStream<'static, String>>,
    channel: String,
    channels: MemoryChannels,
}

impl Stream for MemorySubscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        match self.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        // Release the receiver before counting
        self.inner = None;
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(&self.channel)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&self.channel);
        }
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Publishes local frames and relays remote ones, one listener task per chat
pub struct PubSubBridge {
    broker: Arc<dyn Broker>,
    instance_id: Uuid,
    listeners: Mutex<HashMap<ChatId, JoinHandle<()>>>,
}

impl PubSubBridge {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            instance_id: Uuid::new_v4(),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Publish a frame that was already delivered locally.
    ///
    /// Failures are returned for logging only; nothing is retried.
    pub async fn publish(&self, chat_id: ChatId, frame: &Frame) -> ChatResult<()> {
        let envelope = BusEnvelope {
            origin: self.instance_id,
            frame: frame.clone(),
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| ChatError::MalformedFrame(e.to_string()))?;

        self.broker.publish(&chat_channel(chat_id), payload).await
    }

    /// Start relaying the chat's channel into `sink`. No-op if already subscribed.
    pub fn subscribe(&self, chat_id: ChatId, sink: Arc<dyn EnvelopeSink>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.get(&chat_id).is_some_and(|task| !task.is_finished()) {
            return;
        }

        let task = tokio::spawn(listen(
            Arc::clone(&self.broker),
            chat_id,
            self.instance_id,
            sink,
        ));
        listeners.insert(chat_id, task);

        tracing::debug!(chat_id = %chat_id, "Subscribed to chat channel");
    }

    pub fn unsubscribe(&self, chat_id: ChatId) {
        let task = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chat_id);

        if let Some(task) = task {
            task.abort();
            tracing::debug!(chat_id = %chat_id, "Unsubscribed from chat channel");
        }
    }

    pub fn unsubscribe_all(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();

        for task in &tasks {
            task.abort();
        }
        tracing::info!(count = tasks.len(), "Dropped all chat channel subscriptions");
    }

    pub fn subscription_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Listener task: (re)subscribe with backoff and relay foreign envelopes
async fn listen(
    broker: Arc<dyn Broker>,
    chat_id: ChatId,
    instance_id: Uuid,
    sink: Arc<dyn EnvelopeSink>,
) {
    let channel = chat_channel(chat_id);

    loop {
        // Unbounded: keeps trying until the broker is back or the task is aborted
        let retry_strategy = ExponentialBackoff::from_millis(RESUBSCRIBE_BASE_DELAY_MS)
            .max_delay(RESUBSCRIBE_MAX_DELAY)
            .map(jitter);

        let subscription = Retry::spawn(retry_strategy, || async {
            broker.subscribe(&channel).await.map_err(|e| {
                tracing::warn!(chat_id = %chat_id, error = %e, "Chat channel subscribe failed");
                e
            })
        })
        .await;

        let mut stream = match subscription {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(chat_id = %chat_id, error = %e, "Giving up on chat channel");
                return;
            }
        };

        while let Some(payload) = stream.next().await {
            match serde_json::from_str::<BusEnvelope>(&payload) {
                Ok(envelope) if envelope.origin == instance_id => {}
                Ok(envelope) => sink.deliver(chat_id, envelope.frame),
                Err(e) => {
                    tracing::warn!(chat_id = %chat_id, error = %e, "Dropping malformed bus envelope");
                }
            }
        }

        tracing::warn!(chat_id = %chat_id, "Chat channel subscription dropped, resubscribing");
    }
}
