//! Paper Loader
//!
//! Loads remote PDF documents (arXiv papers or arbitrary URLs) for display,
//! surviving origin rejections, flaky servers and viewers that fail to render.
//!
//! # Modules
//!
//! - `reference`: Document references and canonical URL resolution
//! - `fetch`: Retrieval, failure classification and retry policy
//! - `progress`: Synthesized progress for downloads of unknown size
//! - `handle`: Locally addressable handles over fetched bytes
//! - `viewer`: Viewer strategy chain with standby promotion
//! - `session`: The per-document state machine driving all of the above
//!
//! # Usage
//!
//! ```rust,ignore
//! use paper_loader::{DocumentLoader, DocumentReference, HttpRetriever, LoaderConfig};
//!
//! let config = LoaderConfig::from_env()?;
//! let retriever = HttpRetriever::new(&config.fetch)?;
//! let (loader, mut events) = DocumentLoader::new(config, std::sync::Arc::new(retriever))?;
//!
//! loader.load(DocumentReference::arxiv("2101.00001")?);
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.to_json()?);
//! }
//! ```

pub mod config;
pub mod fetch;
pub mod handle;
pub mod progress;
pub mod reference;
pub mod session;
pub mod viewer;

pub use config::{ConfigError, FetchConfig, LoaderConfig, ProgressConfig, ResolverConfig, ViewerConfig};
pub use fetch::{
    FetchFailure, FetchRequest, HttpRetriever, RetrievalPath, RetryDecision, RetryPolicy, Retriever,
};
pub use handle::{HandleError, HandleManager, ResourceHandle};
pub use progress::{ProgressEstimator, ProgressTicker};
pub use reference::{DocumentReference, ReferenceError, Resolver};
pub use session::{
    DocumentLoader, EventReceiver, ExternalLink, FailureKind, LoadState, LoaderError, LoaderEvent,
    SessionId, SessionSnapshot,
};
pub use viewer::{ViewerFallbackController, ViewerPlan, ViewerStrategy, ViewerTarget};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `tracing` subscriber for hosts that don't configure their own.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns `false` when a
/// global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
