use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use super::types::Event;

/// Synchronous so the rate governor can report from `Drop`.
pub trait EventSink: Send + Sync {
    fn write(&self, event: &Event);
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn emit(&self, event: Event) {
        let sinks = self
            .inner
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks {
            sink.write(&event);
        }
        // No subscribers is fine.
        let _ = self.inner.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
