//! In-process publish/subscribe event bus.
//!
//! API consumers subscribe with filter options; device sessions publish.
//! Publishing is fire-and-forget: handlers run on a dispatcher task, never
//! synchronously inside `publish`, in subscription order per event.
//! Re-entrant publishes from inside a handler are queued and drained after
//! the current event finishes.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::EventsConfig;
use crate::error::{PubSubError, Result};
use crate::types::{ConnectionKey, DeviceId};

/// Prefix for request-variant event names.
const REQUEST_PREFIX: &str = "spark/device/req/";

/// Prefix for generated response event names.
const RESPONSE_PREFIX: &str = "spark/device/res/";

/// Canonical request-variant name for an event.
pub fn request_event_name(name: &str) -> String {
    format!("{REQUEST_PREFIX}{name}")
}

/// Fresh, unique response event name for an event.
fn response_event_name(name: &str) -> String {
    format!("{RESPONSE_PREFIX}{}/{name}", Uuid::new_v4())
}

/// Correlation payload carried by request/response events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    /// Caller-supplied data.
    pub data: Option<String>,
    /// Name the responder should publish its answer under.
    pub response_event_name: Option<String>,
}

/// An event flowing through the bus.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub user_id: Option<String>,
    pub device_id: Option<DeviceId>,
    pub connection_id: Option<ConnectionKey>,
    pub context: Option<EventContext>,
    pub ttl: Option<u32>,
    pub published_at: SystemTime,
    pub broadcasted: bool,
    pub payload: Option<Vec<u8>>,
}

impl PublishedEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_id: None,
            device_id: None,
            connection_id: None,
            context: None,
            ttl: None,
            published_at: SystemTime::now(),
            broadcasted: false,
            payload: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_connection_id(mut self, connection_id: ConnectionKey) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn broadcasted(mut self) -> Self {
        self.broadcasted = true;
        self
    }
}

/// Publish-time routing metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishMetadata {
    pub is_public: bool,
    pub is_internal: bool,
}

impl PublishMetadata {
    pub const PUBLIC: Self = Self {
        is_public: true,
        is_internal: false,
    };

    pub const PRIVATE: Self = Self {
        is_public: false,
        is_internal: false,
    };

    pub const INTERNAL: Self = Self {
        is_public: false,
        is_internal: true,
    };
}

/// Subscription filter options.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Deliver events owned by this user, plus all public events.
    pub user_id: Option<String>,
    /// Deliver only events carrying this device id.
    pub device_id: Option<DeviceId>,
    /// Suppress private events that originated on this connection.
    pub connection_id: Option<ConnectionKey>,
    /// With `user_id`: deliver only owner-matching events, public or not.
    pub mydevices: bool,
    /// Deliver events published with internal metadata. Default true.
    pub listen_to_internal_events: bool,
    /// Deliver events flagged as broadcasted. Default true.
    pub listen_to_broadcasted_events: bool,
    /// Tag enabling bulk unsubscribe.
    pub subscriber_id: Option<String>,
}

impl FilterOptions {
    pub fn new() -> Self {
        Self {
            listen_to_internal_events: true,
            listen_to_broadcasted_events: true,
            ..Default::default()
        }
    }

    fn accepts(&self, event: &PublishedEvent, metadata: &PublishMetadata) -> bool {
        if !self.listen_to_internal_events && metadata.is_internal {
            return false;
        }
        if !self.listen_to_broadcasted_events && event.broadcasted {
            return false;
        }
        if let Some(device_id) = &self.device_id {
            if event.device_id.as_ref() != Some(device_id) {
                return false;
            }
        }
        if let Some(connection_id) = &self.connection_id {
            // Same-connection suppression is scoped to private events.
            if !metadata.is_public && event.connection_id.as_ref() == Some(connection_id) {
                return false;
            }
        }
        if self.mydevices {
            return match (&self.user_id, &event.user_id) {
                (Some(mine), Some(owner)) => mine == owner,
                _ => false,
            };
        }
        if let Some(user_id) = &self.user_id {
            if metadata.is_public {
                return true;
            }
            return event.user_id.as_deref() == Some(user_id.as_str());
        }
        true
    }
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Event handler callback.
pub type Handler = Arc<dyn Fn(&PublishedEvent) + Send + Sync>;

#[derive(Clone)]
struct SubscriptionEntry {
    id: SubscriptionId,
    name: String,
    filter: FilterOptions,
    handler: Handler,
    once: bool,
}

impl SubscriptionEntry {
    fn name_matches(&self, event_name: &str) -> bool {
        if let Some(stem) = self.name.strip_suffix('*') {
            event_name.starts_with(stem)
        } else {
            self.name == event_name
        }
    }
}

enum Command {
    Publish(PublishedEvent, PublishMetadata),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    response_timeout: Duration,
}

/// The process-wide event bus.
///
/// Construct one at server start and pass it by clone; all clones share
/// state. Dropping the last clone stops the dispatcher.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    /// Construct the bus and spawn its dispatcher task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &EventsConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            subscriptions: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(1),
            response_timeout: config.response_timeout(),
        });

        tokio::spawn(dispatch_loop(rx, Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Subscribe a handler to an event name.
    ///
    /// A trailing `*` in `name` subscribes to the prefix before it;
    /// otherwise matching is exact.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        handler: Handler,
        filter: FilterOptions,
    ) -> SubscriptionId {
        self.subscribe_entry(name.into(), handler, filter, false)
    }

    /// Subscribe a handler that auto-removes after its first delivery.
    pub fn subscribe_once(
        &self,
        name: impl Into<String>,
        handler: Handler,
        filter: FilterOptions,
    ) -> SubscriptionId {
        self.subscribe_entry(name.into(), handler, filter, true)
    }

    fn subscribe_entry(
        &self,
        name: String,
        handler: Handler,
        filter: FilterOptions,
        once: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(SubscriptionEntry {
            id,
            name,
            filter,
            handler,
            once,
        });
        id
    }

    /// Remove a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Remove every subscription tagged with `subscriber_id`.
    ///
    /// Returns the number removed.
    pub fn unsubscribe_by_subscriber_id(&self, subscriber_id: &str) -> usize {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.filter.subscriber_id.as_deref() != Some(subscriber_id));
        before - subs.len()
    }

    /// Publish an event.
    ///
    /// Returns synchronously; handlers run later on the dispatcher task.
    pub fn publish(&self, mut event: PublishedEvent, metadata: PublishMetadata) {
        event.published_at = SystemTime::now();
        if self
            .inner
            .tx
            .send(Command::Publish(event, metadata))
            .is_err()
        {
            warn!("event bus dispatcher gone, dropping publish");
        }
    }

    /// Wait until every previously published event has been dispatched.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Publish a request event and await its correlated response.
    ///
    /// The request goes out under the canonical request-variant name with a
    /// freshly generated response event name in its context; whoever answers
    /// publishes under that name and this future resolves with the response
    /// context. Times out per `EventsConfig::response_timeout`.
    pub async fn publish_and_listen_for_response(
        &self,
        name: &str,
        context: EventContext,
    ) -> Result<EventContext> {
        let response_name = response_event_name(name);
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));

        let sub_id = self.subscribe_once(
            response_name.clone(),
            Arc::new(move |event: &PublishedEvent| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(event.context.clone().unwrap_or_default());
                }
            }),
            FilterOptions::new(),
        );

        let request = PublishedEvent::new(request_event_name(name)).with_context(EventContext {
            data: context.data,
            response_event_name: Some(response_name),
        });
        self.publish(request, PublishMetadata::PRIVATE);

        match tokio::time::timeout(self.inner.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.unsubscribe(sub_id);
                Err(PubSubError::ResponseTimeout(self.inner.response_timeout).into())
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }
}

/// Dispatcher: runs handlers in subscription order, isolates panics, and
/// retires one-shot subscriptions after first delivery.
async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    inner: std::sync::Weak<Inner>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Publish(event, metadata) => {
                let Some(inner) = inner.upgrade() else { break };

                let matching: Vec<SubscriptionEntry> = inner
                    .subscriptions
                    .read()
                    .iter()
                    .filter(|s| s.name_matches(&event.name) && s.filter.accepts(&event, &metadata))
                    .cloned()
                    .collect();

                let mut retired = Vec::new();
                for entry in &matching {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        (entry.handler)(&event);
                    }));
                    if result.is_err() {
                        error!(event = %event.name, "event handler panicked");
                    }
                    if entry.once {
                        retired.push(entry.id);
                    }
                }

                if !retired.is_empty() {
                    inner
                        .subscriptions
                        .write()
                        .retain(|s| !retired.contains(&s.id));
                }

                debug!(event = %event.name, handlers = matching.len(), "dispatched");
            }
            Command::Flush(tx) => {
                let _ = tx.send(());
            }
        }
    }
}
