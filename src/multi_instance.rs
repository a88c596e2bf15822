/// Cross-instance change coordination.
///
/// Several instances of one database (same name, same physical storage) stay
/// consistent by broadcasting every locally produced change event to each
/// other. Two identities decide whether a received event is applied:
///
/// - the **storage token**, persisted once in the internal store, names the
///   physical storage. Instances that share a name but not a storage must
///   ignore each other;
/// - the **instance token**, random per instance, names the sender. An
///   instance never applies its own events a second time.
///
/// Both checks are independent and both must pass. Rejected messages are
/// dropped silently.
use crate::change_event::ChangeEvent;
use crate::error::{ReactiveError, ReactiveResult};
use crate::event_bus::ChangeEventBus;
use crate::storage::{Document, StorageInstance};
use crate::transport::{BroadcastChannel, BroadcastTransport, MessageHandler};
use crate::types::random_token;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Internal-store key of the persisted storage token.
pub const STORAGE_TOKEN_KEY: &str = "_local/storageToken";

/// Name of the broadcast channel shared by all instances of a database.
pub fn socket_name(database: &str) -> String {
    format!("koru-reactive:{}:socket", database)
}

/// Wire format of one broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// The change event, origin token included.
    pub event: ChangeEvent,
    /// Storage token of the sending instance.
    pub storage_token: String,
}

impl BroadcastMessage {
    pub fn to_json(&self) -> ReactiveResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> ReactiveResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

fn token_of(document: &Document) -> ReactiveResult<String> {
    document
        .data
        .get("value")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ReactiveError::Storage("storage token document has no value".to_string()))
}

/// Read the storage token, creating it on first use.
///
/// When several instances bootstrap the same storage at once, exactly one
/// write wins; the losers see a conflict, which is expected. After a yield
/// the token is read back so every instance converges on the stored value.
pub async fn ensure_storage_token(internal: &Arc<dyn StorageInstance>) -> ReactiveResult<String> {
    if let Some(document) = internal.get(STORAGE_TOKEN_KEY).await? {
        return token_of(&document);
    }

    let candidate = Document::new(STORAGE_TOKEN_KEY, json!({ "value": random_token() }));
    match internal.put(candidate).await {
        Ok(_) => {}
        Err(ReactiveError::DocumentConflict { .. }) => {
            tracing::trace!("Storage token written concurrently by another instance");
        }
        Err(e) => return Err(e),
    }

    tokio::task::yield_now().await;

    let stored = internal.get(STORAGE_TOKEN_KEY).await?.ok_or_else(|| {
        ReactiveError::Storage("storage token missing after bootstrap".to_string())
    })?;
    token_of(&stored)
}

/// Decide whether a received payload is applied locally.
fn decode(payload: &str, token: &str, storage_token: &str) -> Option<ChangeEvent> {
    let message = match BroadcastMessage::from_json(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::trace!(error = %e, "Dropping undecodable broadcast message");
            return None;
        }
    };
    if message.storage_token != storage_token {
        tracing::trace!(
            storage_token = %message.storage_token,
            "Dropping broadcast message from a different storage"
        );
        return None;
    }
    if message.event.origin_token() == token {
        tracing::trace!("Dropping echo of a local broadcast message");
        return None;
    }
    Some(message.event)
}

/// Bridges a database's event bus and its broadcast channel.
pub struct BroadcastCoordinator {
    channel_name: String,
    token: String,
    storage_token: String,
    channel: Option<Arc<dyn BroadcastChannel>>,
    bus: Weak<ChangeEventBus>,
    outbound: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    close_grace: Duration,
}

impl BroadcastCoordinator {
    /// Open the database's channel and wire it to `bus` in both directions.
    ///
    /// If the channel cannot be opened the coordinator still starts, but it
    /// only skips sends; the instance keeps working locally.
    pub async fn start(
        database: &str,
        token: String,
        storage_token: String,
        transport: &dyn BroadcastTransport,
        bus: &Arc<ChangeEventBus>,
        close_grace: Duration,
    ) -> Arc<Self> {
        let channel_name = socket_name(database);
        let stopped = Arc::new(AtomicBool::new(false));

        let channel = match transport.open(&channel_name).await {
            Ok(channel) => {
                let inbound_bus = Arc::downgrade(bus);
                let inbound_token = token.clone();
                let inbound_storage_token = storage_token.clone();
                let inbound_stopped = Arc::clone(&stopped);
                let handler: MessageHandler = Arc::new(move |payload: String| {
                    if inbound_stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    let Some(event) = decode(&payload, &inbound_token, &inbound_storage_token)
                    else {
                        return;
                    };
                    if let Some(bus) = inbound_bus.upgrade() {
                        bus.emit(event);
                    }
                });
                match channel.on_message(handler) {
                    Ok(()) => Some(channel),
                    Err(e) => {
                        tracing::warn!(channel = %channel_name, error = %e, "Failed to listen on broadcast channel");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel_name, error = %e, "Failed to open broadcast channel");
                None
            }
        };

        let coordinator = Arc::new(Self {
            channel_name,
            token,
            storage_token,
            channel,
            bus: Arc::downgrade(bus),
            outbound: Mutex::new(None),
            stopped,
            close_grace,
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        bus.set_forwarder(tx);
        let sender = Arc::downgrade(&coordinator);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(coordinator) = sender.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.send_to_others(&event).await {
                    tracing::trace!(error = %e, "Broadcast send failed");
                }
            }
        });
        *coordinator
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        tracing::debug!(channel = %coordinator.channel_name, "Broadcast coordinator started");
        coordinator
    }

    /// Name of the underlying channel.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn storage_token(&self) -> &str {
        &self.storage_token
    }

    /// Whether the channel opened successfully.
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Post an event to the other instances.
    ///
    /// Returns `Ok(false)` without sending when the event is local-only, the
    /// channel is unavailable, or the coordinator has shut down.
    pub async fn send_to_others(&self, event: &ChangeEvent) -> ReactiveResult<bool> {
        if event.is_local() || self.stopped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(channel) = &self.channel else {
            return Ok(false);
        };
        let payload = BroadcastMessage {
            event: event.clone(),
            storage_token: self.storage_token.clone(),
        }
        .to_json()?;
        channel.post(payload).await?;
        Ok(true)
    }

    /// Apply the acceptance rules to a raw payload.
    pub fn accept(&self, payload: &str) -> Option<ChangeEvent> {
        decode(payload, &self.token, &self.storage_token)
    }

    /// Detach from the bus and close the channel after the grace delay.
    ///
    /// Events already queued for sending are still sent. Idempotent.
    pub fn shutdown(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.clear_forwarder();
        }
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(outbound) = outbound else {
            return;
        };

        let channel = self.channel.clone();
        let stopped = Arc::clone(&self.stopped);
        let grace = self.close_grace;
        let name = self.channel_name.clone();
        tokio::spawn(async move {
            let _ = outbound.await;
            tokio::time::sleep(grace).await;
            stopped.store(true, Ordering::SeqCst);
            if let Some(channel) = channel {
                if let Err(e) = channel.close().await {
                    tracing::warn!(channel = %name, error = %e, "Failed to close broadcast channel");
                }
            }
            tracing::debug!(channel = %name, "Broadcast channel closed");
        });
    }
}

impl std::fmt::Debug for BroadcastCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastCoordinator")
            .field("channel_name", &self.channel_name)
            .field("token", &self.token)
            .field("storage_token", &self.storage_token)
            .field("connected", &self.is_connected())
            .finish()
    }
}
