//! Session types: states, events, snapshots and errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fetch::FetchFailure;
use crate::handle::ResourceHandle;
use crate::reference::{DocumentReference, ReferenceError};
use crate::viewer::{ViewerStrategy, ViewerTarget};

/// Identity of one load session
pub type SessionId = Uuid;

/// Receiving end of the loader's event stream
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<LoaderEvent>;

/// Load session state
///
/// ```text
/// Idle → Resolving → Fetching ─┬→ Ready
///                     ↺ retry  └→ Failed ──retry()──→ Resolving (new session)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    Idle,
    Resolving,
    Fetching,
    Ready,
    Failed,
}

impl LoadState {
    /// `Ready` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Failure classification reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FailureKind {
    Network,
    CrossOrigin,
    Server { status: u16 },
    Timeout,
    /// No viewer could be given or could display the document
    Render,
}

impl From<&FetchFailure> for FailureKind {
    fn from(failure: &FetchFailure) -> Self {
        match failure {
            FetchFailure::Network(_) => Self::Network,
            FetchFailure::CrossOrigin(_) => Self::CrossOrigin,
            FetchFailure::Server(status) => Self::Server { status: *status },
            FetchFailure::Timeout => Self::Timeout,
        }
    }
}

/// Events delivered to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LoaderEvent {
    StateChanged {
        session_id: SessionId,
        state: LoadState,
    },
    Progress {
        session_id: SessionId,
        percent: u8,
    },
    Ready {
        session_id: SessionId,
        target: ViewerTarget,
        /// Armed fallback the UI may preload without showing
        #[serde(skip_serializing_if = "Option::is_none")]
        standby: Option<ViewerTarget>,
    },
    Error {
        session_id: SessionId,
        kind: FailureKind,
        attempt: u32,
        retryable: bool,
        message: String,
    },
    ViewerFallback {
        session_id: SessionId,
        strategy: ViewerStrategy,
        target: ViewerTarget,
    },
}

impl LoaderEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::Ready { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::ViewerFallback { session_id, .. } => *session_id,
        }
    }

    /// Serialize for hosts that bridge events into a web view
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Point-in-time view of the current load session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub reference: DocumentReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    pub state: LoadState,
    pub progress: u8,
    pub attempt: u32,
    #[serde(skip)]
    pub handle: Option<ResourceHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_strategy: Option<ViewerStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
}

/// Direct link for opening the document outside the app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLink {
    pub url: String,
    /// arXiv abstract page, for arXiv references
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
}

/// Loader action errors
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("No load session")]
    NoSession,

    #[error("Retry is only available after a failure (current state: {0:?})")]
    NotRetryable(LoadState),

    #[error("Invalid document reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("No tokio runtime available")]
    NoRuntime,
}
