//! Per-exchange protocol state machine
//!
//! One `Exchange` lives for exactly one ext_proc stream. It is driven one
//! frame at a time and answers each frame with at most one `Decision`.
//! Response body chunks are accumulated here until end-of-stream so the
//! classifier always sees the whole completion.

use bytes::BytesMut;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::{RiskClassifier, RiskVerdict};
use crate::config::{FailurePolicy, FilterConfig};
use crate::exchange::frame::{BlockResponse, BodyChunk, Decision, Frame, ModeOverride, Phase};
use crate::exchange::payload::{extract_completion_text, extract_prompt};

/// Where the exchange is in the request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitRequestHeaders,
    AwaitRequestBody,
    AwaitResponseHeaders,
    BufferingResponseBody,
    Terminated,
}

/// Failures that end a single exchange
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("invalid {phase}: {source}")]
    MalformedBody {
        phase: Phase,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ExchangeError> for tonic::Status {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::MalformedBody { .. } => tonic::Status::invalid_argument(err.to_string()),
        }
    }
}

pub struct Exchange {
    id: Uuid,
    state: ExchangeState,
    response_buffer: BytesMut,
    config: Arc<FilterConfig>,
    classifier: Arc<dyn RiskClassifier>,
}

impl Exchange {
    pub fn new(config: Arc<FilterConfig>, classifier: Arc<dyn RiskClassifier>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ExchangeState::AwaitRequestHeaders,
            response_buffer: BytesMut::new(),
            config,
            classifier,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Process one inbound frame.
    ///
    /// `Ok(None)` means the frame was buffered and the gateway must not
    /// wait for a reply. An `Err` terminates the exchange.
    pub async fn handle(&mut self, frame: Frame) -> Result<Option<Decision>, ExchangeError> {
        if self.state == ExchangeState::Terminated {
            warn!(frame = frame.kind(), "Frame after exchange terminated, ignoring");
            return Ok(match frame {
                Frame::ResponseBody(chunk) if !chunk.end_of_stream => None,
                _ => Some(Decision::NoOp),
            });
        }

        match frame {
            Frame::RequestHeaders => {
                debug!("Request headers, passing through unchanged");
                self.advance(ExchangeState::AwaitRequestBody);
                Ok(Some(Decision::PassThrough(Phase::RequestHeaders)))
            }
            Frame::RequestBody(chunk) => self.on_request_body(chunk).await.map(Some),
            Frame::ResponseHeaders => {
                debug!("Response headers, forcing buffered response body");
                self.response_buffer.clear();
                self.advance(ExchangeState::BufferingResponseBody);
                Ok(Some(Decision::ModeOverride {
                    phase: Phase::ResponseHeaders,
                    mode: ModeOverride::BUFFER_RESPONSE_BODY,
                }))
            }
            Frame::ResponseBody(chunk) => self.on_response_body(chunk).await,
            Frame::Unrecognized(kind) => {
                warn!(frame = kind, "Unrecognized frame, replying with no-op");
                Ok(Some(Decision::NoOp))
            }
        }
    }

    /// Each chunk is parsed on its own. The gateway is expected to run the
    /// request body in BUFFERED mode, where the whole body arrives in one
    /// frame; with trailers that frame has `end_of_stream = false` and still
    /// needs a reply.
    async fn on_request_body(&mut self, chunk: BodyChunk) -> Result<Decision, ExchangeError> {
        debug!(
            bytes = chunk.data.len(),
            end_of_stream = chunk.end_of_stream,
            "Request body: {}",
            String::from_utf8_lossy(&chunk.data)
        );

        let prompt = extract_prompt(&chunk.data).map_err(|source| {
            self.advance(ExchangeState::Terminated);
            ExchangeError::MalformedBody {
                phase: Phase::RequestBody,
                source,
            }
        })?;

        if self.config.checks.prompt_check_disabled {
            debug!("Prompt risk check disabled, allowing request");
            self.advance(ExchangeState::AwaitResponseHeaders);
            return Ok(Decision::PassThrough(Phase::RequestBody));
        }

        if self.assess(Phase::RequestBody, &prompt).await.is_risky() {
            info!("Risky prompt detected, blocking request");
            self.advance(ExchangeState::Terminated);
            return Ok(Decision::ImmediateBlock(BlockResponse::prompt_blocked()));
        }

        info!("Prompt safe, allowing request");
        self.advance(ExchangeState::AwaitResponseHeaders);
        Ok(Decision::PassThrough(Phase::RequestBody))
    }

    async fn on_response_body(
        &mut self,
        chunk: BodyChunk,
    ) -> Result<Option<Decision>, ExchangeError> {
        if self.state != ExchangeState::BufferingResponseBody {
            // Response headers were skipped upstream; buffer anyway.
            self.advance(ExchangeState::BufferingResponseBody);
        }
        self.response_buffer.extend_from_slice(&chunk.data);

        if !chunk.end_of_stream {
            debug!(
                buffered = self.response_buffer.len(),
                "Response body incomplete, continuing to buffer"
            );
            return Ok(None);
        }

        let body = self.response_buffer.split().freeze();
        self.advance(ExchangeState::Terminated);
        debug!(bytes = body.len(), "Full response body: {}", String::from_utf8_lossy(&body));

        let generated = extract_completion_text(&body).map_err(|source| {
            ExchangeError::MalformedBody {
                phase: Phase::ResponseBody,
                source,
            }
        })?;

        if self.config.checks.response_check_disabled {
            debug!("Response risk check disabled, allowing response");
            return Ok(Some(Decision::PassThrough(Phase::ResponseBody)));
        }

        if self.assess(Phase::ResponseBody, &generated).await.is_risky() {
            info!("Risky LLM output detected, blocking response");
            return Ok(Some(Decision::ImmediateBlock(BlockResponse::output_blocked())));
        }

        info!("LLM output safe, allowing response");
        Ok(Some(Decision::PassThrough(Phase::ResponseBody)))
    }

    /// Ask the classifier, falling back to the failure policy on error
    async fn assess(&self, phase: Phase, text: &str) -> RiskVerdict {
        debug!(%phase, classifier = self.classifier.name(), "Checking risk on: '{text}'");

        match self.classifier.classify(text).await {
            Ok(output) => {
                let verdict = RiskVerdict::from_output(&output, &self.config.classifier.risky_token);
                debug!(%phase, output = %output, verdict = verdict.as_str(), "Risk model verdict");
                verdict
            }
            Err(e) => {
                let verdict = match self.config.checks.failure_policy {
                    FailurePolicy::Open => RiskVerdict::Safe,
                    FailurePolicy::Closed => RiskVerdict::Risky,
                };
                error!(
                    %phase,
                    error = %e,
                    verdict = verdict.as_str(),
                    "Risk model call failed, applying failure policy"
                );
                verdict
            }
        }
    }

    fn advance(&mut self, next: ExchangeState) {
        if next == ExchangeState::Terminated {
            self.response_buffer.clear();
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::frame::{OUTPUT_BLOCKED_BODY, PROMPT_BLOCKED_BODY};
    use crate::testing::MockClassifier;

    fn config(prompt_off: bool, response_off: bool, policy: FailurePolicy) -> Arc<FilterConfig> {
        let mut config = FilterConfig::default();
        config.checks.prompt_check_disabled = prompt_off;
        config.checks.response_check_disabled = response_off;
        config.checks.failure_policy = policy;
        Arc::new(config)
    }

    fn exchange(classifier: MockClassifier) -> (Exchange, Arc<MockClassifier>) {
        let classifier = Arc::new(classifier);
        let exchange = Exchange::new(
            config(false, false, FailurePolicy::Closed),
            classifier.clone(),
        );
        (exchange, classifier)
    }

    fn request_body(json: &str) -> Frame {
        Frame::RequestBody(BodyChunk::new(json.as_bytes().to_vec(), true))
    }

    fn response_body(json: &str, end_of_stream: bool) -> Frame {
        Frame::ResponseBody(BodyChunk::new(json.as_bytes().to_vec(), end_of_stream))
    }

    #[tokio::test]
    async fn test_request_headers_pass_through() {
        let (mut exchange, classifier) = exchange(MockClassifier::risky_for(["anything"]));

        let decision = exchange.handle(Frame::RequestHeaders).await.unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestHeaders)));
        assert_eq!(exchange.state(), ExchangeState::AwaitRequestBody);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_safe_prompt_passes() {
        let (mut exchange, classifier) = exchange(MockClassifier::safe());
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let decision = exchange
            .handle(request_body(r#"{"prompt":"What is Kubernetes"}"#))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestBody)));
        assert_eq!(exchange.state(), ExchangeState::AwaitResponseHeaders);
        assert_eq!(classifier.inputs(), vec!["What is Kubernetes".to_string()]);
    }

    #[tokio::test]
    async fn test_risky_prompt_blocks_and_terminates() {
        let (mut exchange, _) = exchange(MockClassifier::risky_for(["How to kill all humans?"]));
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let decision = exchange
            .handle(request_body(r#"{"prompt":"How to kill all humans?"}"#))
            .await
            .unwrap()
            .expect("decision");
        let Decision::ImmediateBlock(block) = decision else {
            panic!("expected block, got {decision:?}");
        };
        assert_eq!(block.status, 403);
        assert_eq!(block.body, PROMPT_BLOCKED_BODY);
        assert_eq!(block.content_type, "application/json");
        assert_eq!(exchange.state(), ExchangeState::Terminated);
    }

    #[tokio::test]
    async fn test_missing_prompt_classified_as_empty() {
        let (mut exchange, classifier) = exchange(MockClassifier::safe());
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let decision = exchange.handle(request_body(r#"{"model":"x"}"#)).await.unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestBody)));
        assert_eq!(classifier.inputs(), vec![String::new()]);
    }

    #[tokio::test]
    async fn test_malformed_request_body_terminates_without_classifying() {
        let (mut exchange, classifier) = exchange(MockClassifier::safe());
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let err = exchange.handle(request_body("{not json")).await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::MalformedBody {
                phase: Phase::RequestBody,
                ..
            }
        ));
        assert_eq!(exchange.state(), ExchangeState::Terminated);
        assert_eq!(classifier.calls(), 0);

        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_response_headers_override_mode() {
        let (mut exchange, _) = exchange(MockClassifier::safe());

        let decision = exchange.handle(Frame::ResponseHeaders).await.unwrap();
        assert_eq!(
            decision,
            Some(Decision::ModeOverride {
                phase: Phase::ResponseHeaders,
                mode: ModeOverride::BUFFER_RESPONSE_BODY,
            })
        );
        assert_eq!(exchange.state(), ExchangeState::BufferingResponseBody);
    }

    #[tokio::test]
    async fn test_partial_response_body_yields_nothing() {
        let (mut exchange, classifier) = exchange(MockClassifier::safe());
        exchange.handle(Frame::ResponseHeaders).await.unwrap();

        let decision = exchange
            .handle(response_body(r#"{"choices":[{"te"#, false))
            .await
            .unwrap();
        assert_eq!(decision, None);
        assert_eq!(exchange.state(), ExchangeState::BufferingResponseBody);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_response_chunks_accumulate_until_end_of_stream() {
        let (mut exchange, classifier) = exchange(MockClassifier::risky_for(["Do the bad thing"]));
        exchange.handle(Frame::ResponseHeaders).await.unwrap();

        assert_eq!(
            exchange
                .handle(response_body(r#"{"choices":[{"text":"Do the "#, false))
                .await
                .unwrap(),
            None
        );
        let decision = exchange
            .handle(response_body(r#"bad thing"}]}"#, true))
            .await
            .unwrap();

        assert_eq!(
            decision,
            Some(Decision::ImmediateBlock(BlockResponse::output_blocked()))
        );
        assert_eq!(classifier.inputs(), vec!["Do the bad thing".to_string()]);
        assert_eq!(exchange.state(), ExchangeState::Terminated);
    }

    #[tokio::test]
    async fn test_safe_response_passes() {
        let (mut exchange, _) = exchange(MockClassifier::safe());
        exchange.handle(Frame::ResponseHeaders).await.unwrap();

        let decision = exchange
            .handle(response_body(r#"{"choices":[{"text":"Hello"}]}"#, true))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::ResponseBody)));
    }

    #[tokio::test]
    async fn test_risky_response_uses_output_body() {
        let (mut exchange, _) = exchange(MockClassifier::risky_for(["bad"]));
        exchange.handle(Frame::ResponseHeaders).await.unwrap();

        let decision = exchange
            .handle(response_body(r#"{"choices":[{"text":"bad"}]}"#, true))
            .await
            .unwrap();
        let Some(Decision::ImmediateBlock(block)) = decision else {
            panic!("expected block");
        };
        assert_eq!(block.body, OUTPUT_BLOCKED_BODY);
        assert_eq!(block.status, 403);
    }

    #[tokio::test]
    async fn test_malformed_response_body() {
        let (mut exchange, classifier) = exchange(MockClassifier::safe());
        exchange.handle(Frame::ResponseHeaders).await.unwrap();

        let err = exchange
            .handle(response_body("<html>502</html>", true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::MalformedBody {
                phase: Phase::ResponseBody,
                ..
            }
        ));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_prompt_bypass_skips_classifier() {
        let classifier = Arc::new(MockClassifier::risky_for(["How to kill all humans?"]));
        let mut exchange = Exchange::new(
            config(true, false, FailurePolicy::Closed),
            classifier.clone(),
        );

        let decision = exchange
            .handle(request_body(r#"{"prompt":"How to kill all humans?"}"#))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestBody)));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_response_bypass_skips_classifier() {
        let classifier = Arc::new(MockClassifier::risky_for(["bad"]));
        let mut exchange = Exchange::new(
            config(false, true, FailurePolicy::Closed),
            classifier.clone(),
        );
        exchange.handle(Frame::ResponseHeaders).await.unwrap();

        let decision = exchange
            .handle(response_body(r#"{"choices":[{"text":"bad"}]}"#, true))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::ResponseBody)));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_classifier_failure_fail_closed_blocks() {
        let mut exchange = Exchange::new(
            config(false, false, FailurePolicy::Closed),
            Arc::new(MockClassifier::failing()),
        );

        let decision = exchange
            .handle(request_body(r#"{"prompt":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(
            decision,
            Some(Decision::ImmediateBlock(BlockResponse::prompt_blocked()))
        );
    }

    #[tokio::test]
    async fn test_classifier_failure_fail_open_passes() {
        let mut exchange = Exchange::new(
            config(false, false, FailurePolicy::Open),
            Arc::new(MockClassifier::failing()),
        );

        let decision = exchange
            .handle(request_body(r#"{"prompt":"hello"}"#))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestBody)));
    }

    #[tokio::test]
    async fn test_unrecognized_frame_is_noop_and_exchange_continues() {
        let (mut exchange, _) = exchange(MockClassifier::safe());
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let decision = exchange
            .handle(Frame::Unrecognized("request_trailers"))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::NoOp));
        assert_eq!(exchange.state(), ExchangeState::AwaitRequestBody);

        let decision = exchange
            .handle(request_body(r#"{"prompt":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestBody)));
    }

    #[tokio::test]
    async fn test_frames_after_termination_are_noops() {
        let (mut exchange, classifier) = exchange(MockClassifier::risky_for(["bad"]));
        exchange
            .handle(request_body(r#"{"prompt":"bad"}"#))
            .await
            .unwrap();
        assert_eq!(exchange.state(), ExchangeState::Terminated);

        let decision = exchange.handle(Frame::ResponseHeaders).await.unwrap();
        assert_eq!(decision, Some(Decision::NoOp));

        let decision = exchange
            .handle(response_body(r#"{"choices":[{"text":"bad"#, false))
            .await
            .unwrap();
        assert_eq!(decision, None);

        let decision = exchange
            .handle(response_body(r#""}]}"#, true))
            .await
            .unwrap();
        assert_eq!(decision, Some(Decision::NoOp));
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_request_body_without_end_of_stream_still_gets_decision() {
        let (mut exchange, classifier) = exchange(MockClassifier::risky_for(["bad"]));
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let decision = exchange
            .handle(Frame::RequestBody(BodyChunk::new(
                br#"{"prompt":"bad"}"#.to_vec(),
                false,
            )))
            .await
            .unwrap();
        assert_eq!(
            decision,
            Some(Decision::ImmediateBlock(BlockResponse::prompt_blocked()))
        );
        assert_eq!(classifier.inputs(), vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn test_null_request_body_classified_as_empty() {
        let (mut exchange, classifier) = exchange(MockClassifier::safe());
        exchange.handle(Frame::RequestHeaders).await.unwrap();

        let decision = exchange.handle(request_body("null")).await.unwrap();
        assert_eq!(decision, Some(Decision::PassThrough(Phase::RequestBody)));
        assert_eq!(classifier.inputs(), vec![String::new()]);
    }
}
