//! Stream driver: feeds inbound frames to an `Exchange` and writes decisions back
//!
//! The gateway blocks the HTTP exchange until it gets a reply, so frames are
//! handled strictly one after another. Every wait (next frame, classifier
//! call) is raced against the outbound channel closing: tonic drops the
//! receiver when the client disconnects or the deadline passes, and dropping
//! the pending `handle` future aborts the classifier request with it.

use envoy_types::pb::envoy::service::ext_proc::v3::{ProcessingRequest, ProcessingResponse};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::exchange::frame::Frame;
use crate::exchange::machine::Exchange;

pub type Outbound = mpsc::Sender<Result<ProcessingResponse, Status>>;

/// How a driven exchange ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEnd {
    /// Gateway closed its side of the stream
    Completed,
    /// Client went away or the stream was cancelled
    Cancelled,
    /// The exchange was terminated with this gRPC status
    Failed(Code),
}

pub async fn drive_exchange<S>(mut exchange: Exchange, inbound: S, outbound: Outbound) -> ExchangeEnd
where
    S: Stream<Item = Result<ProcessingRequest, Status>>,
{
    let mut inbound = std::pin::pin!(inbound);
    debug!("Starting processing loop");

    loop {
        let next = tokio::select! {
            _ = outbound.closed() => {
                debug!("Outbound stream closed, finishing up");
                return ExchangeEnd::Cancelled;
            }
            next = inbound.next() => next,
        };

        let request = match next {
            None => {
                debug!("Received EOF, terminating processing loop");
                return ExchangeEnd::Completed;
            }
            Some(Err(status)) if status.code() == Code::Cancelled => {
                debug!("Stream cancelled, finishing up");
                return ExchangeEnd::Cancelled;
            }
            Some(Err(status)) => {
                warn!(code = ?status.code(), "Error receiving frame: {}", status.message());
                let code = status.code();
                let _ = outbound.send(Err(status)).await;
                return ExchangeEnd::Failed(code);
            }
            Some(Ok(request)) => request,
        };

        let frame = Frame::from(request);
        debug!(frame = frame.kind(), state = ?exchange.state(), "Received frame");

        let outcome = tokio::select! {
            _ = outbound.closed() => {
                debug!("Outbound stream closed mid-frame, abandoning classifier call");
                return ExchangeEnd::Cancelled;
            }
            outcome = exchange.handle(frame) => outcome,
        };

        match outcome {
            Ok(Some(decision)) => {
                if outbound.send(Ok(decision.into())).await.is_err() {
                    debug!("Outbound stream closed before reply could be sent");
                    return ExchangeEnd::Cancelled;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Terminating exchange: {e}");
                let status = Status::from(e);
                let code = status.code();
                let _ = outbound.send(Err(status)).await;
                return ExchangeEnd::Failed(code);
            }
        }
    }
}
