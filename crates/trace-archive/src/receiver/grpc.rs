//! tonic gRPC OTLP trace receiver.

use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::TraceService, ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tonic::{Request, Response, Status};

use super::{build_partial_success, validate_request, BatchSender, WireProtocol};

/// gRPC receiver for OTLP traces.
#[derive(Clone)]
pub struct OtlpGrpcReceiver {
    batches: BatchSender,
}

impl OtlpGrpcReceiver {
    pub const fn new(batches: BatchSender) -> Self {
        Self { batches }
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpcReceiver {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let validated = validate_request(request.into_inner());
        let partial_success = build_partial_success(&validated);

        self.batches.submit(validated.request, WireProtocol::Grpc)?;

        Ok(Response::new(ExportTraceServiceResponse { partial_success }))
    }
}

pub use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceServiceServer;
