use crate::{EntityEvent, EventFilter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tether_core::{SyncError, TetherResult};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Callback invoked synchronously for every matching event.
///
/// Errors and panics are logged and never reach the publisher.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EntityEvent) -> TetherResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&EntityEvent) -> TetherResult<()> + Send + Sync,
{
    fn handle(&self, event: &EntityEvent) -> TetherResult<()> {
        self(event)
    }
}

struct Registration {
    id: u64,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

struct ChannelInner {
    handlers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    tx: Mutex<Option<broadcast::Sender<EntityEvent>>>,
    closed: AtomicBool,
}

impl ChannelInner {
    fn unsubscribe(&self, id: u64) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.id != id);
    }
}

/// Publish/subscribe bus for entity lifecycle events.
///
/// Scoped to one synchronization environment. Cloning shares the channel.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    /// Create a channel whose broadcast stream buffers `capacity` events per
    /// receiver before slow receivers start lagging.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(ChannelInner {
                handlers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                tx: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a closure. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> TetherResult<Subscription>
    where
        F: Fn(&EntityEvent) -> TetherResult<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(filter, Arc::new(handler))
    }

    pub fn subscribe_handler(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> TetherResult<Subscription> {
        if self.is_closed() {
            return Err(SyncError::ChannelClosed.into());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                filter,
                handler,
            });

        Ok(Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        })
    }

    /// Receive every future event as an async stream.
    pub fn stream(&self) -> TetherResult<broadcast::Receiver<EntityEvent>> {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| SyncError::ChannelClosed.into())
    }

    /// Deliver an event to every matching handler, then to stream receivers.
    ///
    /// Returns the number of handlers invoked. A failing handler does not
    /// prevent the remaining handlers from running.
    pub fn publish(&self, event: EntityEvent) -> usize {
        if self.is_closed() {
            debug!(kind = %event.kind(), id = %event.id(), "Event channel closed, dropping event");
            return 0;
        }

        // Snapshot so handlers may subscribe or unsubscribe while running.
        let targets: Vec<(u64, Arc<dyn EventHandler>)> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.filter.matches(&event))
            .map(|r| (r.id, Arc::clone(&r.handler)))
            .collect();

        for (handler_id, handler) in &targets {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        handler_id = handler_id,
                        kind = %event.kind(),
                        id = %event.id(),
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        handler_id = handler_id,
                        kind = %event.kind(),
                        id = %event.id(),
                        "Event handler panicked"
                    );
                }
            }
        }

        let event_type = event.event_type();
        if let Some(tx) = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            match tx.send(event) {
                Ok(receivers) => {
                    debug!(event_type = ?event_type, receivers = receivers, "Broadcast event");
                }
                Err(_) => {
                    // No stream receivers - this is fine
                }
            }
        }

        targets.len()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Tear the channel down: drops every handler and ends every stream.
    /// Later publishes are ignored and later subscriptions fail.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!("Event channel closed");
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(tether_core::DEFAULT_EVENT_BUFFER)
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("handlers", &self.handler_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle for a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventType;
    use std::sync::atomic::AtomicUsize;
    use tether_core::{EntityId, EntityKind, TetherError, ValidationError};

    fn updated(kind: EntityKind, id: &str) -> EntityEvent {
        EntityEvent::updated(kind, EntityId::from(id), vec!["Name".to_string()])
    }

    #[test]
    fn test_handlers_receive_matching_events_only() {
        let channel = EventChannel::new(16);
        let cards = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&cards);
        let _s1 = channel
            .subscribe(EventFilter::for_kind(EntityKind::Card), move |_: &EntityEvent| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let a = Arc::clone(&all);
        let _s2 = channel
            .subscribe(EventFilter::any(), move |_: &EntityEvent| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(channel.publish(updated(EntityKind::Card, "c1")), 2);
        assert_eq!(channel.publish(updated(EntityKind::List, "l1")), 1);

        assert_eq!(cards.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let channel = EventChannel::new(16);
        let reached = Arc::new(AtomicUsize::new(0));

        let _s1 = channel
            .subscribe(EventFilter::any(), |_: &EntityEvent| {
                Err(TetherError::from(ValidationError::Unencodable {
                    field: "x".to_string(),
                    reason: "handler failure".to_string(),
                }))
            })
            .unwrap();
        let _s2 = channel
            .subscribe(EventFilter::any(), |_: &EntityEvent| -> TetherResult<()> {
                panic!("handler panic")
            })
            .unwrap();
        let r = Arc::clone(&reached);
        let _s3 = channel
            .subscribe(EventFilter::any(), move |_: &EntityEvent| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(channel.publish(updated(EntityKind::Card, "c1")), 3);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let channel = EventChannel::new(16);
        let sub = channel
            .subscribe(EventFilter::any(), |_: &EntityEvent| Ok(()))
            .unwrap();
        assert_eq!(channel.handler_count(), 1);
        drop(sub);
        assert_eq!(channel.handler_count(), 0);
        assert_eq!(channel.publish(updated(EntityKind::Card, "c1")), 0);
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let channel = EventChannel::new(16);
        let mut rx = channel.stream().unwrap();

        channel.publish(EntityEvent::deleted(EntityKind::Card, EntityId::from("c9")));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), EventType::Deleted);
        assert_eq!(event.id().as_str(), "c9");
    }

    #[tokio::test]
    async fn test_close_tears_down_deterministically() {
        let channel = EventChannel::new(16);
        let mut rx = channel.stream().unwrap();
        let _sub = channel
            .subscribe(EventFilter::any(), |_: &EntityEvent| Ok(()))
            .unwrap();

        channel.close();

        assert!(channel.is_closed());
        assert_eq!(channel.handler_count(), 0);
        assert_eq!(channel.publish(updated(EntityKind::Card, "c1")), 0);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(channel
            .subscribe(EventFilter::any(), |_: &EntityEvent| Ok(()))
            .is_err());
        assert!(channel.stream().is_err());
    }
}
