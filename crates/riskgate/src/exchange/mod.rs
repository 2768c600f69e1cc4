//! Exchange module: the per-stream ext_proc state machine
//!
//! One intercepted HTTP exchange maps to one bidirectional gRPC stream.
//! `frame` translates the wire messages, `payload` pulls text out of bodies,
//! `machine` decides, and `driver` runs the loop for a single stream.

pub mod driver;
pub mod frame;
pub mod machine;
pub mod payload;

pub use driver::{ExchangeEnd, Outbound, drive_exchange};
pub use frame::{
    BlockResponse, BodyChunk, Decision, Frame, ModeOverride,
    OUTPUT_BLOCKED_BODY, PROMPT_BLOCKED_BODY, Phase,
};
pub use machine::{Exchange, ExchangeError, ExchangeState};
pub use payload::{extract_completion_text, extract_prompt};
