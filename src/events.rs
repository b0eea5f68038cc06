use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::domain::Entry;

/// Events published when posts change. Every mutation of the post store
/// dispatches exactly one of these.
#[derive(Clone, Debug)]
pub enum Event {
    EntryCreated { new: Entry },
    EntryUpdated { new: Entry, old: Entry },
    EntryDeleted { old: Entry },
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A subscriber to entry events. Implementations clone whatever state they
/// need into the returned future; they must not borrow from `self` across
/// the await, since handlers run as detached tasks.
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn handle(&self, event: Event) -> HandlerFuture;
}

/// In-process dispatcher for entry events.
///
/// Handlers are registered once at startup; the bus is then sealed into an
/// `Arc` and shared with the request handlers, so late registration is
/// impossible by construction. Each `dispatch` spawns one detached task per
/// handler: ordering between handlers is unspecified, and a failing handler
/// never affects the originating request nor its siblings.
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: impl EventHandler) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn dispatch(&self, event: Event) {
        for handler in &self.handlers {
            let handler = Arc::clone(handler);
            let event = event.clone();
            tokio::spawn(async move {
                let name = handler.name();
                if let Err(e) = handler.handle(event).await {
                    tracing::error!(
                        error.cause_chain = ?e,
                        error.message = %e,
                        "event handler {name} failed"
                    );
                }
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}
