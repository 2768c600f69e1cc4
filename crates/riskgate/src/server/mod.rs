//! gRPC server exposing the ext_proc filter and a health probe
//!
//! Implements:
//! - `envoy.service.ext_proc.v3.ExternalProcessor/Process`, one spawned task per stream
//! - `grpc.health.v1.Health`
//! - Graceful shutdown with a bounded grace period for in-flight exchanges

mod health;

pub use health::HealthService;

use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::{
    ExternalProcessor, ExternalProcessorServer,
};
use envoy_types::pb::envoy::service::ext_proc::v3::{ProcessingRequest, ProcessingResponse};
use futures::Stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tonic_health::pb::health_server::HealthServer;
use tracing::Instrument;

use crate::classifier::RiskClassifier;
use crate::config::FilterConfig;
use crate::error::{GateError, Result};
use crate::exchange::{Exchange, ExchangeEnd, drive_exchange};

/// Replies queued per stream. The gateway waits for each reply before
/// sending the next frame, so a handful is plenty.
const OUTBOUND_BUFFER: usize = 4;

pub type DecisionStream = ReceiverStream<std::result::Result<ProcessingResponse, Status>>;

/// The ext_proc service. Cheap to clone; all state is shared read-only.
#[derive(Clone)]
pub struct ExtProcService {
    config: Arc<FilterConfig>,
    classifier: Arc<dyn RiskClassifier>,
}

impl ExtProcService {
    pub fn new(config: Arc<FilterConfig>, classifier: Arc<dyn RiskClassifier>) -> Self {
        Self { config, classifier }
    }

    /// Start a worker for one exchange and return its reply stream
    pub fn open_exchange<S>(&self, inbound: S) -> DecisionStream
    where
        S: Stream<Item = std::result::Result<ProcessingRequest, Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let exchange = Exchange::new(self.config.clone(), self.classifier.clone());
        let span = tracing::info_span!("exchange", exchange_id = %exchange.id());

        tokio::spawn(
            async move {
                match drive_exchange(exchange, inbound, tx).await {
                    ExchangeEnd::Completed => tracing::debug!("Exchange completed"),
                    ExchangeEnd::Cancelled => tracing::debug!("Exchange cancelled by peer"),
                    ExchangeEnd::Failed(code) => tracing::info!(?code, "Exchange failed"),
                }
            }
            .instrument(span),
        );

        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream = DecisionStream;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> std::result::Result<Response<Self::ProcessStream>, Status> {
        Ok(Response::new(self.open_exchange(request.into_inner())))
    }
}

/// The gRPC server
pub struct GuardServer {
    config: Arc<FilterConfig>,
    classifier: Arc<dyn RiskClassifier>,
}

impl GuardServer {
    pub fn new(config: Arc<FilterConfig>, classifier: Arc<dyn RiskClassifier>) -> Self {
        Self { config, classifier }
    }

    /// Bind the configured address and serve until SIGINT/SIGTERM
    pub async fn serve(self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GateError::Transport(format!("Failed to bind to {addr}: {e}")))?;

        tracing::info!("Starting gRPC server on {addr}");
        if self.config.checks.prompt_check_disabled {
            tracing::info!("Prompt risk check: disabled");
        }
        if self.config.checks.response_check_disabled {
            tracing::info!("Response risk check: disabled");
        }

        self.serve_with_listener(listener, shutdown_signal()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves, then
    /// give in-flight exchanges one grace period before returning.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let grace = Duration::from_secs(self.config.server.shutdown_grace_secs);
        let ext_proc = ExtProcService::new(self.config.clone(), self.classifier.clone());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let router = Server::builder()
            .add_service(ExternalProcessorServer::new(ext_proc))
            .add_service(HealthServer::new(HealthService));

        let mut server = tokio::spawn(router.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async move {
                let _ = stop_rx.await;
            },
        ));

        tokio::select! {
            result = &mut server => return join_result(result),
            _ = shutdown => {}
        }

        tracing::info!("Shutting down, allowing {grace:?} for in-flight exchanges");
        let _ = stop_tx.send(());

        match tokio::time::timeout(grace, &mut server).await {
            Ok(result) => join_result(result)?,
            Err(_) => {
                tracing::warn!("Grace period elapsed, dropping remaining exchanges");
                server.abort();
            }
        }

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}

fn join_result(
    result: std::result::Result<
        std::result::Result<(), tonic::transport::Error>,
        tokio::task::JoinError,
    >,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GateError::Transport(format!("Server error: {e}"))),
        Err(e) => Err(GateError::Transport(format!("Server task failed: {e}"))),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
