/// Broadcast transport between instances.
///
/// A [`BroadcastTransport`] opens named channels. Every message posted on a
/// channel is delivered to every other channel open under the same name, but
/// never back to the channel that posted it. Channels with different names
/// never see each other's traffic.
///
/// [`InProcessTransport`] connects channels inside one process through Tokio
/// broadcast queues. It is the transport used when several database
/// instances share one process, and the one the test suite uses.
///
/// # Example
///
/// ```ignore
/// let transport = InProcessTransport::new();
/// let a = transport.open("room").await?;
/// let b = transport.open("room").await?;
/// b.on_message(Arc::new(|payload| println!("got {}", payload)))?;
/// a.post("hello".to_string()).await?;
/// ```
use crate::error::{ReactiveError, ReactiveResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Callback invoked with each payload received from another channel.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// One endpoint of a named broadcast channel.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Send a payload to every other endpoint with the same name.
    async fn post(&self, payload: String) -> ReactiveResult<()>;

    /// Install the receive handler. Must be called at most once.
    fn on_message(&self, handler: MessageHandler) -> ReactiveResult<()>;

    /// Stop receiving and release the endpoint. Idempotent.
    async fn close(&self) -> ReactiveResult<()>;
}

/// Factory for broadcast channels.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Open an endpoint on the channel called `name`.
    async fn open(&self, name: &str) -> ReactiveResult<Arc<dyn BroadcastChannel>>;
}

/// Capacity of each in-process channel before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Envelope {
    sender_id: u64,
    payload: Arc<str>,
}

type Channels = DashMap<String, broadcast::Sender<Envelope>>;

static GLOBAL_TRANSPORT: LazyLock<InProcessTransport> = LazyLock::new(InProcessTransport::new);

/// Transport connecting channels within the current process.
///
/// Clones share the same set of channels.
#[derive(Clone, Default)]
pub struct InProcessTransport {
    channels: Arc<Channels>,
    next_endpoint: Arc<AtomicU64>,
}

impl InProcessTransport {
    /// Create an isolated transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide transport used when none is configured.
    pub fn global() -> Self {
        GLOBAL_TRANSPORT.clone()
    }

    /// Number of channel names with at least one open endpoint.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[async_trait]
impl BroadcastTransport for InProcessTransport {
    async fn open(&self, name: &str) -> ReactiveResult<Arc<dyn BroadcastChannel>> {
        let sender = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        // Subscribe now so nothing posted after open is missed, even before
        // a handler is installed.
        let receiver = sender.subscribe();
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(channel = %name, endpoint = id, "Opened in-process channel");
        Ok(Arc::new(InProcessChannel {
            name: name.to_string(),
            id,
            sender,
            receiver: Mutex::new(Some(receiver)),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            channels: Arc::clone(&self.channels),
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InProcessChannel {
    name: String,
    id: u64,
    sender: broadcast::Sender<Envelope>,
    receiver: Mutex<Option<broadcast::Receiver<Envelope>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    channels: Arc<Channels>,
}

#[async_trait]
impl BroadcastChannel for InProcessChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, payload: String) -> ReactiveResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReactiveError::Channel(format!(
                "channel '{}' is closed",
                self.name
            )));
        }
        // An error only means nobody is listening.
        let _ = self.sender.send(Envelope {
            sender_id: self.id,
            payload: payload.into(),
        });
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) -> ReactiveResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReactiveError::Channel(format!(
                "channel '{}' is closed",
                self.name
            )));
        }
        let Some(mut receiver) = lock(&self.receiver).take() else {
            return Err(ReactiveError::Channel(format!(
                "channel '{}' already has a message handler",
                self.name
            )));
        };

        let own_id = self.id;
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if envelope.sender_id != own_id {
                            handler(envelope.payload.to_string());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %name, skipped, "Broadcast receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *lock(&self.listener) = Some(task);
        Ok(())
    }

    async fn close(&self) -> ReactiveResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
        lock(&self.receiver).take();
        // The aborted listener drops its receiver asynchronously, so this
        // only catches names whose endpoints never installed a handler.
        self.channels
            .remove_if(&self.name, |_, sender| sender.receiver_count() == 0);
        tracing::trace!(channel = %self.name, endpoint = self.id, "Closed in-process channel");
        Ok(())
    }
}

impl Drop for InProcessChannel {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |payload| {
            let _ = tx.send(payload);
        });
        (handler, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_delivers_to_others_not_self() {
        let transport = InProcessTransport::new();
        let a = transport.open("room").await.unwrap();
        let b = transport.open("room").await.unwrap();

        let (handler_a, mut rx_a) = collector();
        let (handler_b, mut rx_b) = collector();
        a.on_message(handler_a).unwrap();
        b.on_message(handler_b).unwrap();

        a.post("hello".to_string()).await.unwrap();
        assert_eq!(next(&mut rx_b).await.as_deref(), Some("hello"));

        b.post("back".to_string()).await.unwrap();
        assert_eq!(next(&mut rx_a).await.as_deref(), Some("back"));
        // A never saw its own message.
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_names_are_isolated() {
        let transport = InProcessTransport::new();
        let a = transport.open("one").await.unwrap();
        let b = transport.open("two").await.unwrap();
        let (handler, mut rx) = collector();
        b.on_message(handler).unwrap();

        a.post("x".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_before_handler_are_kept() {
        let transport = InProcessTransport::new();
        let a = transport.open("room").await.unwrap();
        let b = transport.open("room").await.unwrap();

        a.post("early".to_string()).await.unwrap();
        let (handler, mut rx) = collector();
        b.on_message(handler).unwrap();
        assert_eq!(next(&mut rx).await.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_post_and_handler() {
        let transport = InProcessTransport::new();
        let a = transport.open("room").await.unwrap();
        a.close().await.unwrap();
        a.close().await.unwrap();

        assert!(a.post("x".to_string()).await.is_err());
        let (handler, _rx) = collector();
        assert!(a.on_message(handler).is_err());
    }

    #[tokio::test]
    async fn test_second_handler_rejected() {
        let transport = InProcessTransport::new();
        let a = transport.open("room").await.unwrap();
        let (first, _rx1) = collector();
        let (second, _rx2) = collector();
        a.on_message(first).unwrap();
        assert!(a.on_message(second).is_err());
    }
}
