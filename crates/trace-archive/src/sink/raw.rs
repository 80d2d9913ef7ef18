//! Raw trace sink: one object per exported batch under `otel-traces/`.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ExportSink, ObjectSink};
use crate::receiver::TraceBatch;
use crate::storage::raw_trace_path;
use crate::PipelineError;

/// Persists each batch's OTLP/JSON payload to the object sink.
pub struct RawTraceSink {
    objects: Arc<ObjectSink>,
}

impl RawTraceSink {
    pub const fn new(objects: Arc<ObjectSink>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl ExportSink for RawTraceSink {
    fn name(&self) -> &str {
        "object-store"
    }

    async fn export(&self, batch: &TraceBatch) -> Result<(), PipelineError> {
        let path = raw_trace_path(batch.received_at(), batch.id());
        match self.objects.put(&path, batch.payload().clone()).await {
            Ok(_) => Ok(()),
            // A previous attempt landed after its timeout fired.
            Err(PipelineError::ObjectExists { .. }) => {
                tracing::debug!(path = %path, "Raw trace object already written");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{objects, sample_batch};
    use rstest::rstest;

    #[rstest]
    #[tokio::test]
    async fn writes_one_object_per_batch(objects: Arc<ObjectSink>) {
        let mut notifications = objects.subscribe("otel-traces/");
        let sink = RawTraceSink::new(objects.clone());
        let batch = sample_batch(2);

        sink.export(&batch).await.unwrap();
        sink.export(&batch).await.unwrap();

        let listed = objects.list("otel-traces/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].location.as_ref().ends_with(&format!("{}.json", batch.id())));
        assert!(notifications.try_recv().is_some());
        assert!(notifications.try_recv().is_none(), "re-export must not notify twice");

        let stored = objects.get(&listed[0].location).await.unwrap();
        assert_eq!(&stored, batch.payload());
    }
}
