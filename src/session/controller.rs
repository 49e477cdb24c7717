//! Session controller
//!
//! Drives one [`DocumentReference`] at a time through
//! `Resolving → Fetching → Ready | Failed`.
//!
//! Only the current session may change state or emit events. Every write goes
//! through [`Shared::with_session`], which checks the session id under the
//! controller lock, so results from a superseded fetch are dropped instead of
//! being applied to its successor.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::types::{
    EventReceiver, ExternalLink, FailureKind, LoadState, LoaderError, LoaderEvent, SessionId,
    SessionSnapshot,
};
use crate::config::LoaderConfig;
use crate::fetch::{FetchFailure, FetchRequest, RetrievalPath, RetryDecision, RetryPolicy, Retriever};
use crate::handle::{HandleManager, ResourceHandle};
use crate::progress::{ProgressEstimator, ProgressTicker};
use crate::reference::{DocumentReference, Resolver};
use crate::viewer::{ViewerFallbackController, ViewerPlan, ViewerStrategy};

/// Loads documents for one view
///
/// Dropping the loader tears down the current session.
pub struct DocumentLoader {
    shared: Arc<Shared>,
}

struct Shared {
    config: LoaderConfig,
    resolver: Resolver,
    retriever: Arc<dyn Retriever>,
    policy: RetryPolicy,
    handles: HandleManager,
    events: mpsc::UnboundedSender<LoaderEvent>,
    runtime: Handle,
    current: Mutex<Option<Session>>,
}

struct Session {
    id: SessionId,
    reference: DocumentReference,
    canonical_url: Option<String>,
    state: LoadState,
    progress: ProgressEstimator,
    attempt: u32,
    handle: Option<ResourceHandle>,
    viewer: Option<ViewerFallbackController>,
    plan: Option<ViewerPlan>,
    last_failure: Option<FailureKind>,
    started_at: DateTime<Utc>,
    /// Resolve/fetch/retry task
    task: Option<JoinHandle<()>>,
    /// Viewer readiness deadline
    watchdog: Option<JoinHandle<()>>,
}

impl Session {
    fn new(id: SessionId, reference: DocumentReference, config: &LoaderConfig) -> Self {
        Self {
            id,
            reference,
            canonical_url: None,
            state: LoadState::Idle,
            progress: ProgressEstimator::new(&config.progress),
            attempt: 1,
            handle: None,
            viewer: None,
            plan: None,
            last_failure: None,
            started_at: Utc::now(),
            task: None,
            watchdog: None,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            reference: self.reference.clone(),
            canonical_url: self.canonical_url.clone(),
            state: self.state,
            progress: self.progress.value(),
            attempt: self.attempt,
            handle: self.handle.clone(),
            active_strategy: self.viewer.as_ref().map(|v| v.active()),
            last_failure: self.last_failure,
            started_at: self.started_at,
        }
    }

    fn disarm_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

impl DocumentLoader {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a loader on the current tokio runtime
    pub fn new(
        config: LoaderConfig,
        retriever: Arc<dyn Retriever>,
    ) -> Result<(Self, EventReceiver), LoaderError> {
        let runtime = Handle::try_current().map_err(|_| LoaderError::NoRuntime)?;
        Ok(Self::with_runtime(config, retriever, runtime))
    }

    /// Create a loader whose tasks run on `runtime`
    ///
    /// Its methods may then be called from threads outside the runtime,
    /// such as a UI thread.
    pub fn with_runtime(
        config: LoaderConfig,
        retriever: Arc<dyn Retriever>,
        runtime: Handle,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let policy = RetryPolicy::new(&config.fetch).with_alternate(retriever.has_alternate_path());

        let shared = Arc::new(Shared {
            resolver: Resolver::new(config.resolver.clone()),
            config,
            retriever,
            policy,
            handles: HandleManager::new(),
            events,
            runtime,
            current: Mutex::new(None),
        });

        (Self { shared }, receiver)
    }

    // =========================================================================
    // Session actions
    // =========================================================================

    /// Start loading `reference`, superseding any current session
    pub fn load(&self, reference: DocumentReference) -> SessionId {
        let mut current = self.shared.current.lock();
        Shared::start(&self.shared, &mut current, reference)
    }

    /// Parse `input` as an arXiv identifier or URL and load it
    pub fn load_input(&self, input: &str) -> Result<SessionId, LoaderError> {
        let reference = DocumentReference::parse(input)?;
        Ok(self.load(reference))
    }

    /// Start over after a failure with a fresh session
    pub fn retry(&self) -> Result<SessionId, LoaderError> {
        let mut current = self.shared.current.lock();
        let reference = match current.as_ref() {
            Some(session) if session.state == LoadState::Failed => session.reference.clone(),
            Some(session) => return Err(LoaderError::NotRetryable(session.state)),
            None => return Err(LoaderError::NoSession),
        };

        tracing::info!(reference = %reference.id, "Retrying document load");
        Ok(Shared::start(&self.shared, &mut current, reference))
    }

    /// Tear down the current session. Returns `false` if there was none.
    pub fn cancel(&self) -> bool {
        let session = self.shared.current.lock().take();
        match session {
            Some(session) => {
                let id = session.id;
                self.shared.teardown(session, "cancelled");
                self.shared.emit(LoaderEvent::StateChanged {
                    session_id: id,
                    state: LoadState::Idle,
                });
                true
            }
            None => false,
        }
    }

    /// Link for opening the document externally; offered in every state
    pub fn open_externally(&self) -> Option<ExternalLink> {
        let current = self.shared.current.lock();
        let session = current.as_ref()?;
        Some(ExternalLink {
            url: self.shared.resolver.resolve(&session.reference),
            landing_page: self.shared.resolver.landing_page_url(&session.reference),
        })
    }

    // =========================================================================
    // Viewer signals
    // =========================================================================

    /// The active viewer failed to render
    ///
    /// Returns the promoted strategy, or `None` if the session isn't ready or
    /// the chain is exhausted. The session stays `Ready` either way.
    pub fn report_render_failure(&self) -> Option<ViewerStrategy> {
        let mut current = self.shared.current.lock();
        let session = current.as_mut().filter(|s| s.state == LoadState::Ready)?;
        let viewer = session.viewer.as_mut()?;
        let failed = viewer.active();
        let promoted = viewer.report_failure();

        session.last_failure = Some(FailureKind::Render);
        if promoted.is_none() {
            tracing::warn!(
                session_id = %session.id,
                failed = ?failed,
                "Viewer failed to render with no fallback left"
            );
        }
        self.shared.fall_back(session, failed, promoted)
    }

    /// The active viewer displayed the document
    pub fn confirm_rendered(&self) {
        let mut current = self.shared.current.lock();
        if let Some(session) = current.as_mut() {
            if let Some(viewer) = session.viewer.as_mut() {
                viewer.confirm_ready();
                session.disarm_watchdog();
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current session, if any
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.shared.current.lock().as_ref().map(Session::snapshot)
    }

    /// State of the current session; `Idle` without one
    pub fn state(&self) -> LoadState {
        self.shared
            .current
            .lock()
            .as_ref()
            .map_or(LoadState::Idle, |s| s.state)
    }

    /// Registry for dereferencing handle addresses
    pub fn handles(&self) -> &HandleManager {
        &self.shared.handles
    }
}

impl Drop for DocumentLoader {
    fn drop(&mut self) {
        if let Some(session) = self.shared.current.lock().take() {
            self.shared.teardown(session, "loader dropped");
        }
    }
}

impl Shared {
    fn emit(&self, event: LoaderEvent) {
        // A closed receiver just means nobody is listening
        let _ = self.events.send(event);
    }

    /// Replace the current session with a new one for `reference`
    fn start(
        shared: &Arc<Self>,
        current: &mut Option<Session>,
        reference: DocumentReference,
    ) -> SessionId {
        if let Some(previous) = current.take() {
            shared.teardown(previous, "superseded");
        }

        let id = Uuid::new_v4();
        let mut session = Session::new(id, reference.clone(), &shared.config);
        session.state = LoadState::Resolving;

        tracing::info!(
            session_id = %id,
            reference = %reference.id,
            "Created load session"
        );
        shared.emit(LoaderEvent::StateChanged {
            session_id: id,
            state: LoadState::Resolving,
        });

        session.task = Some(shared.runtime.spawn(Self::run(Arc::clone(shared), id, reference)));
        *current = Some(session);
        id
    }

    /// Stop everything a session owns
    fn teardown(&self, mut session: Session, reason: &str) {
        if let Some(task) = session.task.take() {
            task.abort();
        }
        session.disarm_watchdog();
        if let Some(handle) = session.handle.take() {
            self.handles.release(&handle);
        }

        tracing::info!(
            session_id = %session.id,
            state = ?session.state,
            reason = reason,
            "Load session torn down"
        );
    }

    /// Apply `f` if `id` is still the current session
    fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut current = self.current.lock();
        match current.as_mut() {
            Some(session) if session.id == id => Some(f(session)),
            _ => None,
        }
    }

    async fn run(shared: Arc<Self>, id: SessionId, reference: DocumentReference) {
        let url = shared.resolver.resolve(&reference);

        let resolved = shared.with_session(id, |session| {
            session.canonical_url = Some(url.clone());
            session.state = LoadState::Fetching;
            shared.emit(LoaderEvent::StateChanged {
                session_id: id,
                state: LoadState::Fetching,
            });
        });
        if resolved.is_none() {
            return;
        }

        let mut attempt = 1;
        let mut path = RetrievalPath::Direct;

        loop {
            tracing::debug!(session_id = %id, attempt = attempt, path = ?path, "Starting fetch attempt");

            let ticker = Self::start_ticker(&shared, id, attempt);
            let result = shared
                .retriever
                .retrieve(&FetchRequest::new(url.clone(), attempt, path))
                .await;
            ticker.stop();

            let failure = match result {
                Ok(bytes) => {
                    shared.complete(id, &url, bytes);
                    return;
                }
                Err(failure) => failure,
            };

            match shared.policy.decide(&failure, attempt, path) {
                RetryDecision::Retry { path: next_path, delay } => {
                    tracing::warn!(
                        session_id = %id,
                        attempt = attempt,
                        error = %failure,
                        next_path = ?next_path,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch attempt failed, retrying"
                    );

                    let next_attempt = attempt + 1;
                    let still_current = shared.with_session(id, |session| {
                        session.progress.reset();
                        session.attempt = next_attempt;
                        shared.emit(LoaderEvent::Progress {
                            session_id: id,
                            percent: 0,
                        });
                    });
                    if still_current.is_none() {
                        return;
                    }

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt = next_attempt;
                    path = next_path;
                }
                RetryDecision::GiveUp => {
                    shared.fail(id, failure, attempt);
                    return;
                }
            }
        }
    }

    fn start_ticker(shared: &Arc<Self>, id: SessionId, attempt: u32) -> ProgressTicker {
        let ticker_shared = Arc::clone(shared);
        ProgressTicker::start(shared.config.progress.interval, move || {
            ticker_shared.tick_progress(id, attempt)
        })
    }

    /// One progress step; `false` stops the ticker
    fn tick_progress(&self, id: SessionId, attempt: u32) -> bool {
        self.with_session(id, |session| {
            // A tick from a finished attempt must not touch its successor
            if session.state != LoadState::Fetching || session.attempt != attempt {
                return false;
            }
            let before = session.progress.value();
            let after = session.progress.tick();
            if after != before {
                self.emit(LoaderEvent::Progress {
                    session_id: id,
                    percent: after,
                });
            }
            after != before
        })
        .unwrap_or(false)
    }

    fn complete(self: &Arc<Self>, id: SessionId, url: &str, bytes: Bytes) {
        let mut current = self.current.lock();
        let Some(session) = current.as_mut().filter(|s| s.id == id) else {
            tracing::debug!(session_id = %id, "Discarding fetch result for superseded session");
            return;
        };

        let size = bytes.len();
        let handle = match self.handles.acquire(id, bytes) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to acquire resource handle");
                // No handle means nothing a viewer can display
                let attempt = session.attempt;
                self.mark_failed(session, FailureKind::Render, attempt, true, e.to_string());
                return;
            }
        };

        let plan = ViewerPlan::new(&self.config.viewer, &handle, url);
        let viewer = ViewerFallbackController::new();
        let target = plan.target(viewer.active());
        let standby = viewer.standby().map(|strategy| plan.target(strategy));

        session.progress.complete();
        session.state = LoadState::Ready;
        session.handle = Some(handle);
        session.last_failure = None;

        self.emit(LoaderEvent::Progress {
            session_id: id,
            percent: 100,
        });
        self.emit(LoaderEvent::StateChanged {
            session_id: id,
            state: LoadState::Ready,
        });
        self.emit(LoaderEvent::Ready {
            session_id: id,
            target,
            standby,
        });

        let active = viewer.active();
        tracing::info!(
            session_id = %id,
            attempt = session.attempt,
            bytes = size,
            strategy = ?active,
            "Document ready"
        );

        session.viewer = Some(viewer);
        session.plan = Some(plan);
        self.arm_watchdog(session, active);
    }

    fn fail(&self, id: SessionId, failure: FetchFailure, attempt: u32) {
        let kind = FailureKind::from(&failure);
        let retryable = failure.is_manually_retryable();

        let applied = self.with_session(id, |session| {
            self.mark_failed(session, kind, attempt, retryable, failure.to_string());
        });

        if applied.is_some() {
            tracing::warn!(
                session_id = %id,
                attempt = attempt,
                error = %failure,
                retryable = retryable,
                "Document load failed"
            );
        }
    }

    /// Move `session` to `Failed` and announce it
    fn mark_failed(
        &self,
        session: &mut Session,
        kind: FailureKind,
        attempt: u32,
        retryable: bool,
        message: String,
    ) {
        let id = session.id;
        session.progress.reset();
        session.state = LoadState::Failed;
        session.last_failure = Some(kind);

        self.emit(LoaderEvent::Progress {
            session_id: id,
            percent: 0,
        });
        self.emit(LoaderEvent::StateChanged {
            session_id: id,
            state: LoadState::Failed,
        });
        self.emit(LoaderEvent::Error {
            session_id: id,
            kind,
            attempt,
            retryable,
            message,
        });
    }

    /// Switch the UI to `promoted` after `failed` gave up
    fn fall_back(
        self: &Arc<Self>,
        session: &mut Session,
        failed: ViewerStrategy,
        promoted: Option<ViewerStrategy>,
    ) -> Option<ViewerStrategy> {
        let promoted = promoted?;
        let target = session.plan.as_ref()?.target(promoted);

        session.disarm_watchdog();

        tracing::warn!(
            session_id = %session.id,
            failed = ?failed,
            promoted = ?promoted,
            "Viewer failed to render, falling back"
        );
        self.emit(LoaderEvent::ViewerFallback {
            session_id: session.id,
            strategy: promoted,
            target,
        });

        self.arm_watchdog(session, promoted);
        Some(promoted)
    }

    /// Start the readiness deadline for `strategy`, if there is a standby to promote
    fn arm_watchdog(self: &Arc<Self>, session: &mut Session, strategy: ViewerStrategy) {
        let Some(timeout) = self.config.viewer.readiness_timeout else {
            return;
        };
        let has_standby = session
            .viewer
            .as_ref()
            .is_some_and(|v| v.active() == strategy && v.standby().is_some());
        if !has_standby {
            return;
        }

        session.disarm_watchdog();
        let shared = Arc::clone(self);
        let id = session.id;
        session.watchdog = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.readiness_expired(id, strategy);
        }));
    }

    fn readiness_expired(self: &Arc<Self>, id: SessionId, strategy: ViewerStrategy) {
        let mut current = self.current.lock();
        let Some(session) = current.as_mut().filter(|s| s.id == id) else {
            return;
        };
        // This task is the watchdog; don't abort it from inside
        session.watchdog = None;

        let Some(promoted) = session
            .viewer
            .as_mut()
            .and_then(|v| v.readiness_timed_out(strategy))
        else {
            return;
        };

        tracing::info!(session_id = %id, strategy = ?strategy, "Viewer readiness timed out");
        session.last_failure = Some(FailureKind::Render);
        self.fall_back(session, strategy, Some(promoted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProgressConfig, ViewerConfig};
    use crate::fetch::ScriptedRetriever;
    use std::time::Duration;

    fn pdf() -> Bytes {
        Bytes::from_static(b"%PDF-1.4 test")
    }

    fn test_config() -> LoaderConfig {
        LoaderConfig {
            progress: ProgressConfig {
                interval: Duration::from_millis(250),
                step: 5,
                ceiling: 90,
            },
            viewer: ViewerConfig {
                readiness_timeout: None,
                ..ViewerConfig::default()
            },
            ..LoaderConfig::default()
        }
    }

    fn loader_with(retriever: Arc<ScriptedRetriever>, config: LoaderConfig) -> (DocumentLoader, EventReceiver) {
        DocumentLoader::new(config, retriever).unwrap()
    }

    /// Receive events until `done` matches one, returning everything seen
    async fn collect_until(
        events: &mut EventReceiver,
        done: impl Fn(&LoaderEvent) -> bool,
    ) -> Vec<LoaderEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    fn is_terminal(event: &LoaderEvent) -> bool {
        matches!(event, LoaderEvent::Ready { .. } | LoaderEvent::Error { .. })
    }

    fn progress_values(events: &[LoaderEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                LoaderEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_arxiv_happy_path() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(2000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever.clone(), test_config());

        let id = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let seen = collect_until(&mut events, is_terminal).await;

        let LoaderEvent::Ready { session_id, target, standby } = seen.last().unwrap() else {
            panic!("expected ready, got {:?}", seen.last());
        };
        assert_eq!(*session_id, id);
        assert_eq!(target.strategy, ViewerStrategy::PrimaryEmbedded);
        assert_eq!(
            standby.as_ref().map(|t| t.strategy),
            Some(ViewerStrategy::SecondaryHosted)
        );
        assert_eq!(loader.handles().resolve(&target.address), Some(pdf()));

        let requests = retriever.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://arxiv.org/pdf/2101.00001.pdf");
        assert_eq!(requests[0].path, RetrievalPath::Direct);

        let snapshot = loader.snapshot().unwrap();
        assert_eq!(snapshot.state, LoadState::Ready);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.active_strategy, Some(ViewerStrategy::PrimaryEmbedded));
        assert!(snapshot.handle.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic_then_exactly_100() {
        // 10s fetch: long enough for the estimator to hit its ceiling
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(10_000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let seen = collect_until(&mut events, is_terminal).await;
        let values = progress_values(&seen);

        let (last, during) = values.split_last().unwrap();
        assert_eq!(*last, 100);
        assert!(!during.is_empty());
        assert!(during.windows(2).all(|w| w[0] <= w[1]));
        assert!(during.iter().all(|v| *v <= 90));
        assert_eq!(*during.last().unwrap(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_origin_then_alternate_success() {
        let retriever = Arc::new(
            ScriptedRetriever::new(Ok(pdf()))
                .then(100, Err(FetchFailure::CrossOrigin("blocked".to_string())))
                .then(100, Ok(pdf())),
        );
        let (loader, mut events) = loader_with(retriever.clone(), test_config());

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        collect_until(&mut events, is_terminal).await;

        let snapshot = loader.snapshot().unwrap();
        assert_eq!(snapshot.state, LoadState::Ready);
        assert_eq!(snapshot.attempt, 2);

        let paths: Vec<_> = retriever.requests().iter().map(|r| (r.attempt, r.path)).collect();
        assert_eq!(
            paths,
            vec![(1, RetrievalPath::Direct), (2, RetrievalPath::Alternate)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_then_retry_resets() {
        let retriever = Arc::new(
            ScriptedRetriever::new(Ok(pdf()))
                .then(10, Err(FetchFailure::Server(500)))
                .then(10, Err(FetchFailure::Server(500)))
                .then(10, Err(FetchFailure::Server(500))),
        );
        let (loader, mut events) = loader_with(retriever.clone(), test_config());

        let first = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let seen = collect_until(&mut events, is_terminal).await;

        assert_eq!(
            seen.last(),
            Some(&LoaderEvent::Error {
                session_id: first,
                kind: FailureKind::Server { status: 500 },
                attempt: 3,
                retryable: true,
                message: FetchFailure::Server(500).to_string(),
            })
        );
        assert_eq!(retriever.requests().len(), 3);
        assert_eq!(loader.state(), LoadState::Failed);
        assert!(loader.open_externally().is_some());

        let second = loader.retry().unwrap();
        assert_ne!(first, second);
        let snapshot = loader.snapshot().unwrap();
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.progress, 0);

        collect_until(&mut events, is_terminal).await;
        let requests = retriever.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].attempt, 1);
        assert_eq!(loader.state(), LoadState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let retriever = Arc::new(ScriptedRetriever::new(Err(FetchFailure::Server(404))));
        let (loader, mut events) = loader_with(retriever.clone(), test_config());

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let seen = collect_until(&mut events, is_terminal).await;

        assert!(matches!(
            seen.last(),
            Some(LoaderEvent::Error { kind: FailureKind::Server { status: 404 }, attempt: 1, retryable: false, .. })
        ));
        assert_eq!(retriever.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_retries_up_to_cap() {
        let retriever = Arc::new(ScriptedRetriever::new(Err(FetchFailure::Server(503))));
        let (loader, mut events) = loader_with(retriever.clone(), test_config());

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let seen = collect_until(&mut events, is_terminal).await;

        assert!(matches!(
            seen.last(),
            Some(LoaderEvent::Error { attempt: 3, retryable: true, .. })
        ));
        let attempts: Vec<_> = retriever.requests().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        // progress resets only between attempts
        let values = progress_values(&seen);
        assert_eq!(values.iter().filter(|v| **v == 0).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_only_after_failure() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(1000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        assert!(matches!(loader.retry(), Err(LoaderError::NoSession)));

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        assert!(matches!(loader.retry(), Err(LoaderError::NotRetryable(LoadState::Resolving))));

        collect_until(&mut events, is_terminal).await;
        assert!(matches!(loader.retry(), Err(LoaderError::NotRetryable(LoadState::Ready))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_session_emits_nothing_after_cancel() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(5000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        let id = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(loader.cancel());
        assert_eq!(loader.state(), LoadState::Idle);
        assert!(loader.open_externally().is_none());

        // let the fetch's original deadline pass
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut after_cancel = Vec::new();
        let mut cancelled = false;
        while let Ok(event) = events.try_recv() {
            if cancelled {
                after_cancel.push(event);
            } else if event == (LoaderEvent::StateChanged { session_id: id, state: LoadState::Idle }) {
                cancelled = true;
            }
        }
        assert!(cancelled);
        assert!(after_cancel.is_empty(), "unexpected events: {:?}", after_cancel);
        assert_eq!(loader.handles().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_reference_supersedes_in_flight_fetch() {
        let retriever = Arc::new(
            ScriptedRetriever::new(Ok(pdf()))
                .then(5000, Ok(pdf()))
                .then(100, Ok(pdf())),
        );
        let (loader, mut events) = loader_with(retriever, test_config());

        let first = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = loader.load(DocumentReference::arxiv("2101.00002").unwrap());

        let seen = collect_until(&mut events, is_terminal).await;
        assert_eq!(seen.last().map(LoaderEvent::session_id), Some(second));

        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !(event.session_id() == first && is_terminal(&event)),
                "superseded session produced {:?}",
                event
            );
        }
        assert_eq!(loader.handles().live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_for_cancelled_session_are_dropped() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(5000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        let id = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(loader.cancel());
        while events.try_recv().is_ok() {}

        // results arriving after the cancel
        loader.shared.complete(id, "https://arxiv.org/pdf/2101.00001.pdf", pdf());
        loader.shared.fail(id, FetchFailure::Server(500), 1);
        assert!(!loader.shared.tick_progress(id, 1));

        assert!(events.try_recv().is_err());
        assert_eq!(loader.state(), LoadState::Idle);
        assert!(loader.snapshot().is_none());
        assert_eq!(loader.handles().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_for_superseded_session_are_dropped() {
        let retriever = Arc::new(
            ScriptedRetriever::new(Ok(pdf()))
                .then(5000, Ok(pdf()))
                .then(100, Ok(pdf())),
        );
        let (loader, mut events) = loader_with(retriever, test_config());

        let first = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = loader.load(DocumentReference::arxiv("2101.00002").unwrap());
        collect_until(&mut events, is_terminal).await;
        let handle = loader.snapshot().unwrap().handle.unwrap();

        loader.shared.complete(first, "https://arxiv.org/pdf/2101.00001.pdf", pdf());
        loader.shared.fail(first, FetchFailure::Timeout, 2);

        assert!(events.try_recv().is_err());
        let snapshot = loader.snapshot().unwrap();
        assert_eq!(snapshot.id, second);
        assert_eq!(snapshot.state, LoadState::Ready);
        assert_eq!(snapshot.handle.map(|h| h.id()), Some(handle.id()));
        assert_eq!(loader.handles().live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_conflict_fails_instead_of_stalling() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(1000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        let id = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let stray = loader.handles().acquire(id, pdf()).unwrap();

        let seen = collect_until(&mut events, is_terminal).await;
        assert!(matches!(
            seen.last(),
            Some(LoaderEvent::Error { kind: FailureKind::Render, attempt: 1, retryable: true, .. })
        ));
        assert_eq!(loader.state(), LoadState::Failed);
        assert!(loader.handles().is_live(&stray));
        assert_eq!(loader.handles().live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_progress_interval_still_reports_progress() {
        let config: LoaderConfig = serde_json::from_str(r#"{"progress":{"interval":0}}"#).unwrap();
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())).then(3000, Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, config);

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        let seen = collect_until(&mut events, is_terminal).await;
        let values = progress_values(&seen);

        assert_eq!(values.last(), Some(&100));
        assert!(values.contains(&90));
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_reference_releases_ready_handle() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        collect_until(&mut events, is_terminal).await;
        let old_handle = loader.snapshot().unwrap().handle.unwrap();

        loader.load(DocumentReference::url("example.com/other.pdf").unwrap());
        assert!(!loader.handles().is_live(&old_handle));
        assert!(loader.handles().resolve(&old_handle.address()).is_none());

        collect_until(&mut events, is_terminal).await;
        assert_eq!(loader.handles().live_count(), 1);
        assert_eq!(
            loader.snapshot().unwrap().canonical_url.as_deref(),
            Some("https://example.com/other.pdf")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failure_falls_back_and_stays_ready() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());

        let id = loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        collect_until(&mut events, is_terminal).await;

        assert_eq!(loader.report_render_failure(), Some(ViewerStrategy::SecondaryHosted));
        let event = events.recv().await.unwrap();
        let LoaderEvent::ViewerFallback { session_id, strategy, target } = event else {
            panic!("expected fallback, got {:?}", event);
        };
        assert_eq!(session_id, id);
        assert_eq!(strategy, ViewerStrategy::SecondaryHosted);
        assert!(target.address.starts_with("https://docs.google.com/viewer?url="));

        let snapshot = loader.snapshot().unwrap();
        assert_eq!(snapshot.state, LoadState::Ready);
        assert_eq!(snapshot.active_strategy, Some(ViewerStrategy::SecondaryHosted));
        assert_eq!(snapshot.last_failure, Some(FailureKind::Render));

        // chain exhausted; the external link is still offered
        assert_eq!(loader.report_render_failure(), None);
        let link = loader.open_externally().unwrap();
        assert_eq!(link.url, "https://arxiv.org/pdf/2101.00001.pdf");
        assert_eq!(link.landing_page.as_deref(), Some("https://arxiv.org/abs/2101.00001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_promotes_standby() {
        let mut config = test_config();
        config.viewer.readiness_timeout = Some(Duration::from_secs(5));
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, config);

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        collect_until(&mut events, is_terminal).await;

        let seen = collect_until(&mut events, |e| matches!(e, LoaderEvent::ViewerFallback { .. })).await;
        assert!(matches!(
            seen.last(),
            Some(LoaderEvent::ViewerFallback { strategy: ViewerStrategy::SecondaryHosted, .. })
        ));
        let snapshot = loader.snapshot().unwrap();
        assert_eq!(snapshot.state, LoadState::Ready);
        assert_eq!(snapshot.last_failure, Some(FailureKind::Render));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_viewer_is_not_replaced() {
        let mut config = test_config();
        config.viewer.readiness_timeout = Some(Duration::from_secs(5));
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, config);

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        collect_until(&mut events, is_terminal).await;
        loader.confirm_rendered();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(
            loader.snapshot().unwrap().active_strategy,
            Some(ViewerStrategy::PrimaryEmbedded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_handle() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())));
        let (loader, mut events) = loader_with(retriever, test_config());
        let handles = loader.handles().clone();

        loader.load(DocumentReference::arxiv("2101.00001").unwrap());
        collect_until(&mut events, is_terminal).await;
        assert_eq!(handles.live_count(), 1);

        drop(loader);
        assert_eq!(handles.live_count(), 0);
    }

    #[tokio::test]
    async fn test_event_json_shape() {
        let id = Uuid::nil();
        let json = LoaderEvent::Error {
            session_id: id,
            kind: FailureKind::Server { status: 503 },
            attempt: 3,
            retryable: true,
            message: "Server responded with status 503".to_string(),
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["event"], "error");
        assert_eq!(value["sessionId"], id.to_string());
        assert_eq!(value["kind"]["type"], "server");
        assert_eq!(value["kind"]["status"], 503);
        assert_eq!(value["retryable"], true);
    }

    #[tokio::test]
    async fn test_http_origin_rejection_recovers_through_proxy() {
        use crate::fetch::HttpRetriever;
        use axum::{routing::get, Router};

        let app = Router::new()
            .route("/paper.pdf", get(|| async { "%PDF-1.4 direct" }))
            .route("/proxy", get(|| async { "%PDF-1.4 proxied" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = test_config();
        config.fetch.origin = Some("http://viewer.local".to_string());
        config.fetch.proxy_template = Some(format!("http://{}/proxy?url={{url}}", addr));
        let retriever = Arc::new(HttpRetriever::new(&config.fetch).unwrap());
        let (loader, mut events) = DocumentLoader::new(config, retriever).unwrap();

        loader.load_input(&format!("http://{}/paper.pdf", addr)).unwrap();
        let seen = collect_until(&mut events, is_terminal).await;

        let Some(LoaderEvent::Ready { target, .. }) = seen.last() else {
            panic!("expected ready, got {:?}", seen.last());
        };
        assert_eq!(
            loader.handles().resolve(&target.address),
            Some(Bytes::from_static(b"%PDF-1.4 proxied"))
        );
        assert_eq!(loader.snapshot().unwrap().attempt, 2);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let retriever = Arc::new(ScriptedRetriever::new(Ok(pdf())));
        assert!(matches!(
            DocumentLoader::new(test_config(), retriever),
            Err(LoaderError::NoRuntime)
        ));
    }
}
