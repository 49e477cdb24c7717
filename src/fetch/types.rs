//! Fetch request and failure types

use serde::{Deserialize, Serialize};

/// How a document is retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetrievalPath {
    /// Straight to the canonical URL
    Direct,
    /// Through the configured proxy, for origins that refuse direct access
    Alternate,
}

/// One retrieval attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Canonical URL of the document
    pub url: String,
    /// Attempt number within the session (1-indexed)
    pub attempt: u32,
    pub path: RetrievalPath,
}

impl FetchRequest {
    /// Describe one attempt against `url`
    pub fn new(url: impl Into<String>, attempt: u32, path: RetrievalPath) -> Self {
        Self {
            url: url.into(),
            attempt,
            path,
        }
    }
}

/// Classified retrieval failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchFailure {
    /// No response at all
    #[error("Network error: {0}")]
    Network(String),

    /// Response blocked by origin policy
    #[error("Cross-origin request blocked: {0}")]
    CrossOrigin(String),

    #[error("Server responded with status {0}")]
    Server(u16),

    #[error("Request timed out")]
    Timeout,
}

impl FetchFailure {
    /// 4xx responses: the document is not there, retrying won't help
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Server(status) if (400..500).contains(status))
    }

    /// Whether a user-initiated retry could plausibly succeed
    pub fn is_manually_retryable(&self) -> bool {
        !self.is_client_error()
    }
}
