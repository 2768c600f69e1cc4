//! riskgate - risk screening for LLM traffic at the gateway
//!
//! This crate provides an Envoy external-processing (ext_proc) filter that
//! sends prompts and completions to a guard model and blocks the exchange
//! when the model flags the text as risky.

pub mod classifier;
pub mod config;
pub mod error;
pub mod exchange;
pub mod server;
pub mod testing;

pub use error::GateError;
