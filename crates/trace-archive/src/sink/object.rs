//! Append-only object sink with creation notifications.
//!
//! Every write is create-only: an existing path is reported as
//! [`PipelineError::ObjectExists`] and the stored object is left untouched.
//! Each successful write emits exactly one [`ObjectCreated`] to every
//! subscription whose prefix matches the path.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode};
use tokio::sync::mpsc;

use crate::PipelineError;

/// Notification for a newly created object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreated {
    /// Full object path.
    pub path: Path,
    /// Object size in bytes.
    pub size: usize,
    /// When the sink acknowledged the write.
    pub created_at: DateTime<Utc>,
}

struct Subscription {
    prefix: String,
    tx: mpsc::UnboundedSender<ObjectCreated>,
}

/// Receiving end of a prefix-filtered subscription.
pub struct ObjectNotifications {
    prefix: String,
    rx: mpsc::UnboundedReceiver<ObjectCreated>,
}

impl ObjectNotifications {
    /// The prefix this subscription was registered with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next creation; `None` once the sink is dropped.
    pub async fn recv(&mut self) -> Option<ObjectCreated> {
        self.rx.recv().await
    }

    /// Return a pending creation without waiting.
    pub fn try_recv(&mut self) -> Option<ObjectCreated> {
        self.rx.try_recv().ok()
    }
}

/// Durable, append-only object sink over an [`ObjectStore`].
pub struct ObjectSink {
    store: Arc<dyn ObjectStore>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ObjectSink {
    /// Wrap an object store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Register for creations under `prefix`.
    ///
    /// Only writes that happen after this call are delivered. Delivery is
    /// unbounded so a slow consumer never causes a notification to be lost.
    pub fn subscribe(&self, prefix: impl Into<String>) -> ObjectNotifications {
        let prefix = prefix.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscriptions().push(Subscription {
            prefix: prefix.clone(),
            tx,
        });
        ObjectNotifications { prefix, rx }
    }

    /// Write a new object.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ObjectExists`] if `path` is already taken; any other
    /// store failure as [`PipelineError::ObjectStore`]. No notification is
    /// emitted on error.
    pub async fn put(&self, path: &Path, data: Bytes) -> Result<ObjectCreated, PipelineError> {
        let size = data.len();
        self.store
            .put_opts(path, data.into(), PutMode::Create.into())
            .await?;

        let event = ObjectCreated {
            path: path.clone(),
            size,
            created_at: Utc::now(),
        };
        self.notify(&event);
        metrics::counter!("trace_archive.objects.created").increment(1);
        tracing::debug!(path = %path, size, "Object created");
        Ok(event)
    }

    /// Read an object back.
    pub async fn get(&self, path: &Path) -> Result<Bytes, PipelineError> {
        let result = self.store.get(path).await?;
        Ok(result.bytes().await?)
    }

    /// List objects under a prefix, sorted by path.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, PipelineError> {
        let prefix = Path::from(prefix);
        let mut objects: Vec<ObjectMeta> = self.store.list(Some(&prefix)).try_collect().await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }

    fn notify(&self, event: &ObjectCreated) {
        let path = event.path.as_ref();
        self.lock_subscriptions().retain(|sub| {
            if !path.starts_with(&sub.prefix) {
                return true;
            }
            // A closed receiver means the subscriber is gone.
            sub.tx.send(event.clone()).is_ok()
        });
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn sink() -> ObjectSink {
        ObjectSink::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn put_then_get() {
        let sink = sink();
        let path = Path::from("otel-traces/2024-01-01-00-00/a.json");

        let event = sink.put(&path, Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(event.path, path);
        assert_eq!(event.size, 2);
        assert_eq!(&sink.get(&path).await.unwrap()[..], b"{}");
    }

    #[tokio::test]
    async fn existing_object_is_never_overwritten() {
        let sink = sink();
        let path = Path::from("gtarchive/app1/x");

        sink.put(&path, Bytes::from_static(b"first")).await.unwrap();
        let result = sink.put(&path, Bytes::from_static(b"second")).await;

        assert!(matches!(result, Err(PipelineError::ObjectExists { .. })));
        assert_eq!(&sink.get(&path).await.unwrap()[..], b"first");
    }

    #[tokio::test]
    async fn notifications_respect_prefix() {
        let sink = sink();
        let mut raw = sink.subscribe("otel-traces/");

        sink.put(&Path::from("otel-trace-analysis/a"), Bytes::new())
            .await
            .unwrap();
        sink.put(&Path::from("otel-traces/2024-01-01-00-00/b.json"), Bytes::new())
            .await
            .unwrap();

        let event = raw.try_recv().expect("raw object should notify");
        assert_eq!(event.path.as_ref(), "otel-traces/2024-01-01-00-00/b.json");
        assert!(raw.try_recv().is_none(), "analysis prefix must not notify");
    }

    #[tokio::test]
    async fn failed_put_emits_no_notification() {
        let sink = sink();
        let path = Path::from("otel-traces/m/a.json");
        sink.put(&path, Bytes::new()).await.unwrap();

        let mut raw = sink.subscribe("otel-traces/");
        assert!(sink.put(&path, Bytes::new()).await.is_err());
        assert!(raw.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let sink = sink();
        drop(sink.subscribe("otel-traces/"));

        sink.put(&Path::from("otel-traces/m/a.json"), Bytes::new())
            .await
            .unwrap();
        assert!(sink.lock_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn list_is_scoped_and_sorted() {
        let sink = sink();
        for name in ["promptarchive/app1/b", "promptarchive/app1/a", "gtarchive/app1/c"] {
            sink.put(&Path::from(name), Bytes::new()).await.unwrap();
        }

        let listed: Vec<String> = sink
            .list("promptarchive/app1/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.location.to_string())
            .collect();
        assert_eq!(listed, vec!["promptarchive/app1/a", "promptarchive/app1/b"]);
    }
}
