//! gRPC health service
//!
//! `Check` always reports SERVING: if the process is up, the filter can
//! answer. `Watch` is deliberately unsupported.

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::Health;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct HealthService;

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        debug!(service = %request.get_ref().service, "Received health check request");
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }

    type WatchStream = ReceiverStream<Result<HealthCheckResponse, Status>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        debug!(service = %request.get_ref().service, "Received watch request");
        Err(Status::unimplemented("Watch is not implemented"))
    }
}
