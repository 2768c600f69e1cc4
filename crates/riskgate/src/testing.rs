//! Test utilities for riskgate - mock classifiers
//!
//! `MockClassifier` answers without any network I/O and records every
//! input it was asked about, so tests can assert on what was classified.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::classifier::{ClassifierError, RiskClassifier};

/// Output the mock returns for risky inputs; matches the default sentinel
pub const MOCK_RISKY_OUTPUT: &str = "Yes";
/// Output the mock returns for everything else
pub const MOCK_SAFE_OUTPUT: &str = "No";

#[derive(Debug)]
enum Behavior {
    RiskyFor(HashSet<String>),
    Fail,
}

/// Deterministic in-memory classifier
#[derive(Debug)]
pub struct MockClassifier {
    behavior: Behavior,
    delay: Option<Duration>,
    inputs: Mutex<Vec<String>>,
}

impl MockClassifier {
    /// Classifies every input as safe
    pub fn safe() -> Self {
        Self::risky_for(std::iter::empty::<&str>())
    }

    /// Classifies exactly the given inputs as risky
    pub fn risky_for<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            behavior: Behavior::RiskyFor(inputs.into_iter().map(Into::into).collect()),
            delay: None,
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails as if the endpoint were down
    pub fn failing() -> Self {
        Self {
            behavior: Behavior::Fail,
            delay: None,
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering, to simulate a slow model
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Inputs seen so far, in call order
    pub fn inputs(&self) -> Vec<String> {
        self.inputs
            .lock()
            .map(|inputs| inputs.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.inputs().len()
    }
}

#[async_trait]
impl RiskClassifier for MockClassifier {
    async fn classify(&self, text: &str) -> Result<String, ClassifierError> {
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(text.to_string());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            Behavior::Fail => Err(ClassifierError::Request("mock classifier is down".into())),
            Behavior::RiskyFor(risky) if risky.contains(text) => Ok(MOCK_RISKY_OUTPUT.to_string()),
            Behavior::RiskyFor(_) => Ok(MOCK_SAFE_OUTPUT.to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
