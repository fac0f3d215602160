//! The notifier — bridges store notifications to in-process subscribers.
//!
//! One background task runs the listen loop. With a push listener it
//! blocks on the stream and dispatches each notification synchronously to
//! subscribers in subscription order (handlers must be non-blocking; the
//! workers just nudge an mpsc trigger). Without one it degrades to a
//! periodic poll that fires empty-payload wakeups so the system stays
//! self-healing. Connection loss sleeps `reconnect_delay`, fires the
//! on-reconnect hooks, and reopens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use am_store::{channels, Notification, Store};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
struct SubscriberMap {
    /// channel → (subscriber id, handler), in subscription order.
    by_channel: HashMap<String, Vec<(u64, Handler)>>,
}

pub struct Notifier {
    store: Arc<dyn Store>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    on_reconnect: RwLock<Vec<Arc<dyn Fn() + Send + Sync>>>,
    next_id: AtomicU64,
    reconnect_delay: Duration,
    poll_interval: Duration,
}

/// Handle returned by [`Notifier::subscribe`]; dropping it (or calling
/// [`Subscription::unsubscribe`]) removes the handler.
pub struct Subscription {
    channel: String,
    id: u64,
    subscribers: Arc<RwLock<SubscriberMap>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut map = self.subscribers.write();
        if let Some(handlers) = map.by_channel.get_mut(&self.channel) {
            handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, reconnect_delay: Duration, poll_interval: Duration) -> Self {
        Self {
            store,
            subscribers: Arc::new(RwLock::new(SubscriberMap::default())),
            on_reconnect: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            reconnect_delay,
            poll_interval,
        }
    }

    /// Register a handler for one channel. Dispatch order across handlers
    /// of a channel is subscription order.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            channel: channel.to_string(),
            id,
            subscribers: self.subscribers.clone(),
        }
    }

    /// Run after each successful listener reopen.
    pub fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_reconnect.write().push(Arc::new(hook));
    }

    /// Publish on a channel (a plain store write; always supported).
    pub async fn publish(&self, channel: &str, payload: &str) -> am_domain::Result<()> {
        self.store.publish(channel, payload).await
    }

    fn dispatch(&self, notification: &Notification) {
        let handlers: Vec<Handler> = {
            let map = self.subscribers.read();
            map.by_channel
                .get(&notification.channel)
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(notification);
        }
    }

    /// Fire a synthetic empty-payload wakeup on every channel (polling
    /// fallback path).
    fn dispatch_poll_wakeups(&self) {
        for channel in channels::ALL {
            self.dispatch(&Notification {
                channel: channel.to_string(),
                payload: String::new(),
            });
        }
    }

    /// The listen loop. Runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut first_connect = true;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.store.listen(channels::ALL).await {
                Ok(Some(mut stream)) => {
                    if !first_connect {
                        tracing::info!("notification listener reconnected");
                        for hook in self.on_reconnect.read().iter() {
                            hook();
                        }
                    }
                    first_connect = false;
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            next = stream.next() => match next {
                                Some(Ok(notification)) => self.dispatch(&notification),
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "notification stream error");
                                    break;
                                }
                                None => {
                                    tracing::debug!("notification stream ended");
                                    break;
                                }
                            },
                        }
                    }
                }
                Ok(None) => {
                    // Polling fallback: no push support in this store.
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.poll_interval) => self.dispatch_poll_wakeups(),
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "notification listener failed to open");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn dispatch_in_subscription_order() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        ));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        let _s1 = notifier.subscribe(channels::RUN_CREATED, move |_| o1.lock().push(1));
        let o2 = order.clone();
        let _s2 = notifier.subscribe(channels::RUN_CREATED, move |_| o2.lock().push(2));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(notifier.clone().run(shutdown.clone()));
        // Give the listener a beat to open.
        tokio::time::sleep(Duration::from_millis(20)).await;

        notifier.publish(channels::RUN_CREATED, "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock(), vec![1, 2]);

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(Notifier::new(
            store,
            Duration::from_millis(10),
            Duration::from_millis(50),
        ));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = notifier.subscribe(channels::TOOL_PENDING, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        notifier.dispatch(&Notification {
            channel: channels::TOOL_PENDING.into(),
            payload: String::new(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        notifier.dispatch(&Notification {
            channel: channels::TOOL_PENDING.into(),
            payload: String::new(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
