//! Trace index sink: forwards batches to an OTLP/gRPC tracing backend.

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use tonic::transport::{Channel, Endpoint};

use super::ExportSink;
use crate::receiver::TraceBatch;
use crate::PipelineError;

/// OTLP/gRPC client for the trace index (Jaeger, Tempo, another collector).
pub struct OtlpIndexSink {
    endpoint: String,
    client: TraceServiceClient<Channel>,
}

impl OtlpIndexSink {
    /// Build a client that connects on first export.
    ///
    /// The backend does not need to be up at startup; an unreachable backend
    /// only fails this sink's exports.
    pub fn connect_lazy(endpoint: &str) -> Result<Self, PipelineError> {
        let channel = Endpoint::from_shared(endpoint.to_owned())?.connect_lazy();
        Ok(Self {
            endpoint: endpoint.to_owned(),
            client: TraceServiceClient::new(channel),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExportSink for OtlpIndexSink {
    fn name(&self) -> &str {
        "index"
    }

    async fn export(&self, batch: &TraceBatch) -> Result<(), PipelineError> {
        let mut client = self.client.clone();
        let response = client.export(batch.request().clone()).await?.into_inner();

        if let Some(partial) = response.partial_success {
            if partial.rejected_spans > 0 {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    batch_id = %batch.id(),
                    rejected_spans = partial.rejected_spans,
                    message = %partial.error_message,
                    "Trace index rejected spans"
                );
            }
        }
        Ok(())
    }
}
