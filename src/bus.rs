//! Event bus: one FIFO queue, one dispatcher loop, many listeners

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::event::Event;

/// Handle returned by [`EventBus::add_listener`], used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Consumer of dispatched events
#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Forwards every event into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("listener channel closed"))
    }
}

/// Adapts an async closure into a [`Listener`]
pub struct FnListener<F>(F);

impl<F, Fut> FnListener<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

enum BusItem {
    Event(Event),
    Flush(oneshot::Sender<()>),
}

type ListenerList = Arc<RwLock<Vec<(ListenerId, Arc<dyn Listener>)>>>;

/// Ordered multi-listener notification channel.
///
/// `dispatch` only enqueues. A single dispatcher task delivers each event to
/// every listener concurrently and waits for all of them before moving on to
/// the next event, so every listener sees events in dispatch order.
pub struct EventBus {
    tx: mpsc::UnboundedSender<BusItem>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BusItem>>>,
    listeners: ListenerList,
    next_id: AtomicU64,
    started: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Enqueue an event. Never blocks.
    pub fn dispatch(&self, event: Event) {
        if self.tx.send(BusItem::Event(event)).is_err() {
            debug!("Event dispatched after the bus shut down");
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if let Some(pos) = guard.iter().position(|(lid, _)| *lid == id) {
            guard.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start the dispatcher loop. Returns `None` if it was already started.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().take()?;
        self.started.store(true, Ordering::Release);
        let listeners = Arc::clone(&self.listeners);
        Some(tokio::spawn(dispatch_loop(rx, listeners)))
    }

    /// Wait until every event dispatched before this call has been delivered
    pub async fn flush(&self) {
        if !self.is_started() {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusItem::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<BusItem>, listeners: ListenerList) {
    while let Some(item) = rx.recv().await {
        let event = match item {
            BusItem::Event(event) => event,
            BusItem::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        // listeners may add or remove listeners while handling this event
        let current: Vec<_> = listeners.read().clone();
        let deliveries = current.into_iter().map(|(id, listener)| {
            let event = &event;
            async move {
                match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(listener = ?id, event_type = event.event_type(), error = %e, "Listener failed");
                    }
                    Err(_) => {
                        error!(listener = ?id, event_type = event.event_type(), "Listener panicked");
                    }
                }
            }
        });
        join_all(deliveries).await;
    }
    debug!("Event bus closed");
}
