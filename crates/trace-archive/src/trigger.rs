//! Extraction trigger: turns raw trace object creations into extraction work.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sink::{ObjectCreated, ObjectNotifications, ObjectSink};

/// Fires once for every object created under the trigger prefix.
pub struct ExtractionTrigger {
    notifications: ObjectNotifications,
}

impl ExtractionTrigger {
    /// Subscribe to creations under `prefix` (normally `otel-traces/`).
    pub fn subscribe(objects: &ObjectSink, prefix: &str) -> Self {
        Self {
            notifications: objects.subscribe(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        self.notifications.prefix()
    }

    /// Whether a creation falls under the trigger prefix.
    pub fn matches(&self, event: &ObjectCreated) -> bool {
        event.path.as_ref().starts_with(self.prefix())
    }

    /// Wait for the next matching creation; `None` once the sink is gone.
    pub async fn next(&mut self) -> Option<ObjectCreated> {
        loop {
            let event = self.notifications.recv().await?;
            if self.matches(&event) {
                return Some(event);
            }
        }
    }

    fn try_next(&mut self) -> Option<ObjectCreated> {
        while let Some(event) = self.notifications.try_recv() {
            if self.matches(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Forward matching creations to the extraction stage until cancelled.
    ///
    /// On cancellation, creations already delivered are still forwarded
    /// before the channel is closed.
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<ObjectCreated>,
        cancel: CancellationToken,
    ) {
        tracing::info!(prefix = %self.prefix(), "Extraction trigger listening");

        loop {
            let event = tokio::select! {
                event = self.next() => match event {
                    Some(event) => event,
                    None => break,
                },
                () = cancel.cancelled() => {
                    while let Some(event) = self.try_next() {
                        fire(&tx, event);
                    }
                    break;
                }
            };
            fire(&tx, event);
        }

        tracing::info!("Extraction trigger stopped");
    }
}

fn fire(tx: &mpsc::UnboundedSender<ObjectCreated>, event: ObjectCreated) {
    tracing::debug!(path = %event.path, size = event.size, "Extraction triggered");
    metrics::counter!("trace_archive.trigger.fired").increment(1);
    if tx.send(event).is_err() {
        tracing::warn!("Extraction stage is gone, dropping trigger");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::objects;
    use bytes::Bytes;
    use object_store::path::Path;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[tokio::test]
    async fn fires_once_per_raw_object_only(objects: Arc<ObjectSink>) {
        let trigger = ExtractionTrigger::subscribe(&objects, "otel-traces/");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(trigger.run(tx, cancel.clone()));

        for path in [
            "otel-trace-analysis/2024/01/01/00/trace-analysis-x",
            "otel-traces/2024-01-01-00-00/a.json",
            "promptarchive/app1/2024/01/01/00/prompts-y.gz",
            "otel-traces/2024-01-01-00-01/b.json",
        ] {
            objects.put(&Path::from(path), Bytes::new()).await.unwrap();
        }
        cancel.cancel();
        task.await.unwrap();

        let mut fired = Vec::new();
        while let Some(event) = rx.recv().await {
            fired.push(event.path.to_string());
        }
        assert_eq!(
            fired,
            vec![
                "otel-traces/2024-01-01-00-00/a.json",
                "otel-traces/2024-01-01-00-01/b.json"
            ]
        );
    }

    #[rstest]
    fn similar_prefix_does_not_match(objects: Arc<ObjectSink>) {
        let trigger = ExtractionTrigger::subscribe(&objects, "otel-traces/");
        let event = ObjectCreated {
            path: Path::from("otel-traces-archive/a.json"),
            size: 0,
            created_at: chrono::Utc::now(),
        };
        assert!(!trigger.matches(&event));
    }
}
