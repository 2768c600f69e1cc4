//! Frames in, decisions out
//!
//! `Frame` and `Decision` are the filter's own view of the Envoy
//! `ext_proc.v3` messages. Conversions at the bottom of this file are the
//! only place that builds or reads protobuf messages.

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::ProcessingMode;
use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::processing_mode::{
    BodySendMode, HeaderSendMode,
};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode as HttpStatusCode};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    BodyResponse, HeaderMutation, HeadersResponse, HttpBody, ImmediateResponse, ProcessingRequest,
    ProcessingResponse, processing_request, processing_response,
};
use std::fmt;

pub const PROMPT_BLOCKED_BODY: &str = r#"{"error":"Prompt blocked by content policy"}"#;
pub const OUTPUT_BLOCKED_BODY: &str = r#"{"error":"LLM output blocked by safety filter"}"#;
pub const BLOCKED_CONTENT_TYPE: &str = "application/json";
pub const FORBIDDEN: u16 = 403;

/// Stage of the HTTP exchange a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestHeaders => "request_headers",
            Self::RequestBody => "request_body",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBody => "response_body",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One body chunk as delivered by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodyChunk {
    pub data: Bytes,
    pub end_of_stream: bool,
}

impl BodyChunk {
    pub fn new(data: impl Into<Bytes>, end_of_stream: bool) -> Self {
        Self {
            data: data.into(),
            end_of_stream,
        }
    }
}

/// Inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    RequestHeaders,
    RequestBody(BodyChunk),
    ResponseHeaders,
    ResponseBody(BodyChunk),
    /// Anything else the gateway may send (trailers, empty requests)
    Unrecognized(&'static str),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestHeaders => Phase::RequestHeaders.as_str(),
            Self::RequestBody(_) => Phase::RequestBody.as_str(),
            Self::ResponseHeaders => Phase::ResponseHeaders.as_str(),
            Self::ResponseBody(_) => Phase::ResponseBody.as_str(),
            Self::Unrecognized(kind) => kind,
        }
    }
}

/// Processing-mode change for the rest of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeOverride {
    pub response_header_mode: HeaderSendMode,
    pub response_body_mode: BodySendMode,
}

impl ModeOverride {
    /// Skip response headers, always buffer the full response body
    pub const BUFFER_RESPONSE_BODY: Self = Self {
        response_header_mode: HeaderSendMode::Skip,
        response_body_mode: BodySendMode::Buffered,
    };
}

/// Fixed reply that short-circuits the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: &'static str,
}

impl BlockResponse {
    pub fn prompt_blocked() -> Self {
        Self {
            status: FORBIDDEN,
            content_type: BLOCKED_CONTENT_TYPE,
            body: PROMPT_BLOCKED_BODY,
        }
    }

    pub fn output_blocked() -> Self {
        Self {
            status: FORBIDDEN,
            content_type: BLOCKED_CONTENT_TYPE,
            body: OUTPUT_BLOCKED_BODY,
        }
    }
}

/// Outbound reply to one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward unmodified
    PassThrough(Phase),
    /// Forward unmodified and change how the rest of the exchange is processed
    ModeOverride { phase: Phase, mode: ModeOverride },
    /// Answer the client directly, the backend never sees (the rest of) it
    ImmediateBlock(BlockResponse),
    /// Empty reply for frames the filter does not understand
    NoOp,
}

impl From<ProcessingRequest> for Frame {
    fn from(request: ProcessingRequest) -> Self {
        use processing_request::Request;

        match request.request {
            Some(Request::RequestHeaders(_)) => Self::RequestHeaders,
            Some(Request::RequestBody(body)) => Self::RequestBody(body.into()),
            Some(Request::ResponseHeaders(_)) => Self::ResponseHeaders,
            Some(Request::ResponseBody(body)) => Self::ResponseBody(body.into()),
            Some(Request::RequestTrailers(_)) => Self::Unrecognized("request_trailers"),
            Some(Request::ResponseTrailers(_)) => Self::Unrecognized("response_trailers"),
            None => Self::Unrecognized("empty"),
        }
    }
}

impl From<HttpBody> for BodyChunk {
    fn from(body: HttpBody) -> Self {
        Self::new(body.body, body.end_of_stream)
    }
}

impl From<ModeOverride> for ProcessingMode {
    fn from(mode: ModeOverride) -> Self {
        Self {
            response_header_mode: mode.response_header_mode as i32,
            response_body_mode: mode.response_body_mode as i32,
            ..Default::default()
        }
    }
}

impl From<BlockResponse> for ImmediateResponse {
    fn from(block: BlockResponse) -> Self {
        let status_code = match block.status {
            FORBIDDEN => HttpStatusCode::Forbidden as i32,
            other => i32::from(other),
        };

        Self {
            status: Some(HttpStatus { code: status_code }),
            headers: Some(HeaderMutation {
                set_headers: vec![HeaderValueOption {
                    header: Some(HeaderValue {
                        key: "Content-Type".to_string(),
                        value: block.content_type.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            body: block.body.into(),
            ..Default::default()
        }
    }
}

fn pass_through(phase: Phase) -> processing_response::Response {
    use processing_response::Response;

    match phase {
        Phase::RequestHeaders => Response::RequestHeaders(HeadersResponse::default()),
        Phase::RequestBody => Response::RequestBody(BodyResponse::default()),
        Phase::ResponseHeaders => Response::ResponseHeaders(HeadersResponse::default()),
        Phase::ResponseBody => Response::ResponseBody(BodyResponse::default()),
    }
}

impl From<Decision> for ProcessingResponse {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::PassThrough(phase) => Self {
                response: Some(pass_through(phase)),
                ..Default::default()
            },
            Decision::ModeOverride { phase, mode } => Self {
                response: Some(pass_through(phase)),
                mode_override: Some(mode.into()),
                ..Default::default()
            },
            Decision::ImmediateBlock(block) => Self {
                response: Some(processing_response::Response::ImmediateResponse(
                    block.into(),
                )),
                ..Default::default()
            },
            Decision::NoOp => Self::default(),
        }
    }
}
