//! Tagged results reported by connectors.

use serde::{Deserialize, Serialize};

/// A transient failure with a suggested retry window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInterruption {
    pub message: String,
    /// Next attempt time (epoch ms).
    pub retry_at_ms: i64,
    /// Give up after this time (epoch ms).
    pub deadline_ms: Option<i64>,
    /// Give up after this many interruptions.
    pub max_retries: Option<u32>,
    /// Whether giving up aborts the job or only skips the document.
    pub abort_on_fail: bool,
}

impl ServiceInterruption {
    pub fn new(message: impl Into<String>, retry_at_ms: i64) -> Self {
        Self {
            message: message.into(),
            retry_at_ms,
            deadline_ms: None,
            max_retries: None,
            abort_on_fail: true,
        }
    }

    pub fn with_deadline(mut self, deadline_ms: i64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn skip_on_fail(mut self) -> Self {
        self.abort_on_fail = false;
        self
    }

    /// Whether the interruption has outlived its own deadline.
    pub fn deadline_passed(&self, now_ms: i64) -> bool {
        self.deadline_ms.is_some_and(|deadline| now_ms >= deadline)
    }
}

/// Result of a connector call that is not tied to one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Retryable(ServiceInterruption),
    Fatal(String),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Retryable(interruption) => Outcome::Retryable(interruption),
            Outcome::Fatal(message) => Outcome::Fatal(message),
        }
    }
}

/// Result of processing one document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOutcome {
    /// Fetched and handed on; `version` lets the next fetch skip unchanged content.
    Processed { version: Option<String> },
    /// The repository is temporarily unavailable.
    Retryable(ServiceInterruption),
    /// Transient failure counted against the job's failure budget.
    Failed { message: String },
    /// The document can never be processed; the job continues.
    Rejected { message: String },
    /// Further progress for the whole job is impossible.
    Fatal { message: String },
    /// The job stopped while the document was in flight.
    Abandoned,
}

impl DocumentOutcome {
    pub fn processed(version: impl Into<String>) -> Self {
        DocumentOutcome::Processed {
            version: Some(version.into()),
        }
    }

    /// Whether child references extracted during the fetch should be kept.
    pub fn keeps_references(&self) -> bool {
        matches!(
            self,
            DocumentOutcome::Processed { .. } | DocumentOutcome::Rejected { .. }
        )
    }
}
