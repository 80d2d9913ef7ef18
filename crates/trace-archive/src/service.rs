//! Wiring of the whole capture and archival pipeline.
//!
//! [`ArchiveService::start`] builds every component over one object store and
//! starts the background tasks; [`ArchiveService::shutdown`] drains them in
//! dependency order so nothing accepted is lost.

use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use object_store::ObjectStore;

use crate::config::ArchiveConfig;
use crate::pipeline::{start_pipeline, Analyzer, PipelineHandle, PipelineSnapshot};
use crate::receiver::{
    otlp_http_router_with_limit, start_batch_processor, BatchProcessorHandle, BatchSender,
    OtlpGrpcReceiver, TraceServiceServer,
};
use crate::sink::{ExportSink, Exporter, ObjectSink, OtlpIndexSink, RawTraceSink};
use crate::stream::api::stream_api_router;
use crate::stream::{StreamFlushHandles, StreamRegistry};
use crate::PipelineError;

/// A running archive pipeline.
pub struct ArchiveService {
    objects: Arc<ObjectSink>,
    streams: Arc<StreamRegistry>,
    batches: BatchSender,
    max_body_bytes: usize,
    batch_processor: BatchProcessorHandle,
    pipeline: PipelineHandle,
    flushers: StreamFlushHandles,
}

impl ArchiveService {
    /// Start with the configured sinks: the raw object sink, plus the trace
    /// index when `index.endpoint` is set.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: &ArchiveConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, PipelineError> {
        Self::start_with_sinks(config, store, Vec::new())
    }

    /// Start with `extra` sinks exported to alongside the configured ones.
    pub fn start_with_sinks(
        config: &ArchiveConfig,
        store: Arc<dyn ObjectStore>,
        extra: Vec<Arc<dyn ExportSink>>,
    ) -> Result<Self, PipelineError> {
        let objects = Arc::new(ObjectSink::new(store));
        let streams = Arc::new(StreamRegistry::new(&config.streams.streams, objects.clone()));
        let flushers = streams.start_background_flush();

        let pipeline = start_pipeline(
            &config.pipeline,
            objects.clone(),
            Analyzer::new(streams.clone()),
        );

        let mut sinks: Vec<Arc<dyn ExportSink>> =
            vec![Arc::new(RawTraceSink::new(objects.clone()))];
        if let Some(endpoint) = &config.index.endpoint {
            sinks.push(Arc::new(OtlpIndexSink::connect_lazy(endpoint)?));
        }
        sinks.extend(extra);

        let exporter = Arc::new(Exporter::new(sinks, &config.receiver));
        tracing::info!(sinks = ?exporter.sink_names(), "Exporter configured");
        let (batches, batch_processor) = start_batch_processor(&config.receiver, exporter);

        Ok(Self {
            objects,
            streams,
            batches,
            max_body_bytes: config.server.max_body_bytes,
            batch_processor,
            pipeline,
            flushers,
        })
    }

    pub fn objects(&self) -> &Arc<ObjectSink> {
        &self.objects
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Sender for submitting requests without going through a receiver.
    pub fn batches(&self) -> &BatchSender {
        &self.batches
    }

    pub fn grpc_service(&self) -> TraceServiceServer<OtlpGrpcReceiver> {
        TraceServiceServer::new(OtlpGrpcReceiver::new(self.batches.clone()))
    }

    pub fn http_router(&self) -> Router {
        otlp_http_router_with_limit(self.batches.clone(), self.max_body_bytes)
    }

    pub fn api_router(&self, metrics: Option<PrometheusHandle>) -> Router {
        stream_api_router(self.streams.clone(), metrics)
    }

    pub fn pipeline_stats(&self) -> PipelineSnapshot {
        self.pipeline.stats()
    }

    /// Drain the pipeline: export queued batches, finish extraction and
    /// analysis of every raw object written, then close and flush every
    /// stream.
    pub async fn shutdown(self) -> PipelineSnapshot {
        tracing::info!("Draining batch processor");
        self.batch_processor.shutdown().await;
        tracing::info!("Draining extraction and analysis");
        let snapshot = self.pipeline.shutdown().await;
        tracing::info!("Flushing delivery streams");
        self.flushers.shutdown().await;
        snapshot
    }
}
