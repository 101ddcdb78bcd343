use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use taskd_protocol::{Event, TaskId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::registry::TaskRegistry;
use crate::task::TaskRecord;

pub type SubscriptionId = u64;

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every task, starting with a snapshot of the registry.
    All,
    Task(TaskId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub scope: Scope,
}

/// Fans out task events to per-task and watch-all subscribers.
///
/// Per-task senders live in the task record, so the subscriber set is guarded
/// by the same registry lock that guards status changes. Publishing happens
/// inside that lock, which keeps per-task delivery order equal to the order in
/// which changes were applied. Delivery is at-most-once: a receiver that falls
/// more than `capacity` events behind skips ahead.
pub struct EventBroadcaster {
    global: broadcast::Sender<Event>,
    watchers: Mutex<HashSet<SubscriptionId>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _rx) = broadcast::channel(capacity);
        Self {
            global,
            watchers: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Sender to embed in a new task record.
    pub fn task_channel(&self) -> broadcast::Sender<Event> {
        let (tx, _rx) = broadcast::channel(self.capacity);
        tx
    }

    /// Deliver `event` to the record's subscribers and to every watcher.
    /// Call from inside a registry mutator. No receivers is not an error.
    pub fn publish(&self, record: &TaskRecord, event: Event) {
        let _ = record.events().send(event.clone());
        let _ = self.global.send(event);
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().map(|w| w.len()).unwrap_or_default()
    }

    fn allocate_id(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a listener. A watch-all subscription starts with a snapshot equal
    /// to `registry.list_all()` taken after the live receiver was registered.
    pub fn subscribe(
        &self,
        registry: &TaskRegistry,
        scope: Scope,
    ) -> Result<(SubscriptionHandle, BoxStream<'static, Event>), TaskError> {
        let id = self.allocate_id();
        let (rx, initial) = match &scope {
            Scope::All => {
                let rx = self.global.subscribe();
                if let Ok(mut watchers) = self.watchers.lock() {
                    watchers.insert(id);
                }
                let snapshot = Event::Snapshot {
                    tasks: registry.list_all(),
                };
                (rx, Some(snapshot))
            }
            Scope::Task(task_id) => {
                let rx = registry.update(task_id, |rec| rec.add_subscriber(id))?;
                (rx, None)
            }
        };

        debug!(subscription_id = id, scope = ?scope, "subscribed");
        let live = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(subscription_id = id, skipped, "subscriber lagged");
                    None
                }
            }
        });
        let events = stream::iter(initial).chain(live).boxed();
        Ok((SubscriptionHandle { id, scope }, events))
    }

    /// Detach a listener. Unknown handles and purged tasks are ignored.
    pub fn unsubscribe(&self, registry: &TaskRegistry, handle: &SubscriptionHandle) {
        let removed = match &handle.scope {
            Scope::All => self
                .watchers
                .lock()
                .map(|mut w| w.remove(&handle.id))
                .unwrap_or_default(),
            Scope::Task(task_id) => registry
                .update(task_id, |rec| rec.remove_subscriber(handle.id))
                .unwrap_or_default(),
        };
        if removed {
            debug!(subscription_id = handle.id, "unsubscribed");
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Live event sequence that detaches itself when dropped.
pub struct EventStream {
    handle: SubscriptionHandle,
    events: BoxStream<'static, Event>,
    broadcaster: Arc<EventBroadcaster>,
    registry: Arc<TaskRegistry>,
}

impl EventStream {
    pub fn open(
        broadcaster: Arc<EventBroadcaster>,
        registry: Arc<TaskRegistry>,
        scope: Scope,
    ) -> Result<Self, TaskError> {
        let (handle, events) = broadcaster.subscribe(&registry, scope)?;
        Ok(Self {
            handle,
            events,
            broadcaster,
            registry,
        })
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.registry, &self.handle);
    }
}
