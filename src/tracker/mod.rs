use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receiving end handed to a log listener.
pub struct Listener {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

struct TrackerInner {
    next_id: AtomicU64,
    closed: AtomicBool,
    buffer: usize,
    listeners: Mutex<HashMap<u64, mpsc::Sender<String>>>,
}

/// Active log listeners. Shutdown closes every listener exactly once.
#[derive(Clone)]
pub struct LogTracker {
    inner: Arc<TrackerInner>,
}

impl LogTracker {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                buffer: buffer.max(1),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a listener. Returns `None` once the tracker is shut down.
    pub fn add(&self) -> Option<Listener> {
        let mut listeners = self.inner.listeners.lock();
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        listeners.insert(id, tx);
        debug!("log listener {} added", id);
        Some(Listener { id, rx })
    }

    pub fn remove(&self, id: u64) {
        if self.inner.listeners.lock().remove(&id).is_some() {
            debug!("log listener {} removed", id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan a log line out to every listener; slow listeners drop lines.
    pub fn publish(&self, line: &str) {
        let listeners = self.inner.listeners.lock();
        for (id, tx) in listeners.iter() {
            if tx.try_send(line.to_string()).is_err() {
                debug!("log listener {} is behind, dropping line", id);
            }
        }
    }

    /// Close every listener channel and refuse new ones.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<(u64, mpsc::Sender<String>)> = {
            let mut listeners = self.inner.listeners.lock();
            self.inner.closed.store(true, Ordering::SeqCst);
            listeners.drain().collect()
        };
        let count = drained.len();
        drop(drained);
        info!("log tracker closed {} listeners", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_listeners() {
        let tracker = LogTracker::new(8);
        let mut a = tracker.add().unwrap();
        let mut b = tracker.add().unwrap();
        tracker.publish("hello");
        assert_eq!(a.rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.rx.recv().await.as_deref(), Some("hello"));
        tracker.remove(a.id);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_each_listener_once() {
        let tracker = LogTracker::new(8);
        let mut a = tracker.add().unwrap();
        let mut b = tracker.add().unwrap();
        assert_eq!(tracker.shutdown(), 2);
        assert_eq!(tracker.shutdown(), 0);
        assert!(a.rx.recv().await.is_none());
        assert!(b.rx.recv().await.is_none());
        assert!(tracker.add().is_none());
        assert!(tracker.is_empty());
    }
}
