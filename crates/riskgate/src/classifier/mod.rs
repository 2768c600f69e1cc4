//! Risk classifier client
//!
//! The classifier is an external model endpoint. It receives a piece of
//! text and answers with a short token; one specific token means "risky".

pub mod remote;

use async_trait::async_trait;

pub use remote::GuardianClassifier;

/// Errors from talking to the classifier
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Classifier returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Classifier returned no choices")]
    EmptyResponse,
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Trait for risk classifier backends
#[async_trait]
pub trait RiskClassifier: Send + Sync {
    /// Classify `text`, returning the model's trimmed output
    async fn classify(&self, text: &str) -> Result<String, ClassifierError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Outcome of one risk check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Safe,
    Risky,
}

impl RiskVerdict {
    /// Anything other than the sentinel token is `Safe`
    pub fn from_output(output: &str, sentinel: &str) -> Self {
        if output.trim().eq_ignore_ascii_case(sentinel.trim()) {
            Self::Risky
        } else {
            Self::Safe
        }
    }

    pub fn is_risky(self) -> bool {
        matches!(self, Self::Risky)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Risky => "risky",
        }
    }
}
