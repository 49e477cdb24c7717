//! Viewer strategy selection
//!
//! Rendering happens outside this crate; the controller only decides which
//! surface is active. The failure chain is `PrimaryEmbedded` then
//! `SecondaryHosted`. The next strategy in the chain is armed as a standby
//! so the UI can preload it, and is promoted when the active surface reports
//! a failure or never confirms readiness. `ManualExternal` is not part of the
//! chain: it is offered in every state.

use serde::{Deserialize, Serialize};

use crate::config::ViewerConfig;
use crate::handle::ResourceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewerStrategy {
    /// Fetched bytes rendered in an embedded native surface
    PrimaryEmbedded,
    /// External hosted renderer pointed at the canonical URL
    SecondaryHosted,
    /// A link the user opens themselves
    ManualExternal,
}

const FAILURE_CHAIN: [ViewerStrategy; 2] =
    [ViewerStrategy::PrimaryEmbedded, ViewerStrategy::SecondaryHosted];

/// What a viewer surface should display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerTarget {
    pub strategy: ViewerStrategy,
    /// Handle address or remote URL
    pub address: String,
}

/// Concrete targets for every strategy of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerPlan {
    pub primary: String,
    pub hosted: String,
    pub external: String,
}

impl ViewerPlan {
    pub fn new(config: &ViewerConfig, handle: &ResourceHandle, canonical_url: &str) -> Self {
        Self {
            primary: handle.address(),
            hosted: hosted_viewer_url(config, canonical_url),
            external: canonical_url.to_string(),
        }
    }

    pub fn target(&self, strategy: ViewerStrategy) -> ViewerTarget {
        let address = match strategy {
            ViewerStrategy::PrimaryEmbedded => self.primary.clone(),
            ViewerStrategy::SecondaryHosted => self.hosted.clone(),
            ViewerStrategy::ManualExternal => self.external.clone(),
        };
        ViewerTarget { strategy, address }
    }
}

/// Address of the hosted renderer for a canonical URL
pub fn hosted_viewer_url(config: &ViewerConfig, canonical_url: &str) -> String {
    config
        .hosted_viewer_template
        .replace("{url}", &urlencoding::encode(canonical_url))
}

/// Tracks the active strategy of one session
#[derive(Debug, Clone)]
pub struct ViewerFallbackController {
    position: usize,
    confirmed: bool,
}

impl ViewerFallbackController {
    pub fn new() -> Self {
        Self {
            position: 0,
            confirmed: false,
        }
    }

    pub fn active(&self) -> ViewerStrategy {
        FAILURE_CHAIN[self.position]
    }

    /// Strategy to promote on failure, if the chain isn't exhausted
    pub fn standby(&self) -> Option<ViewerStrategy> {
        FAILURE_CHAIN.get(self.position + 1).copied()
    }

    /// Always available, regardless of the active strategy
    pub fn escape_hatch(&self) -> ViewerStrategy {
        ViewerStrategy::ManualExternal
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// The active surface reported a render failure
    ///
    /// Returns the promoted strategy, or `None` when nothing is left to promote.
    pub fn report_failure(&mut self) -> Option<ViewerStrategy> {
        let next = self.standby()?;
        self.position += 1;
        self.confirmed = false;
        Some(next)
    }

    /// The active surface displayed content
    pub fn confirm_ready(&mut self) {
        self.confirmed = true;
    }

    /// Readiness deadline for `strategy` passed
    ///
    /// Promotes only if `strategy` is still active and never confirmed, so a
    /// stale deadline can't skip a strategy.
    pub fn readiness_timed_out(&mut self, strategy: ViewerStrategy) -> Option<ViewerStrategy> {
        if self.confirmed || self.active() != strategy {
            return None;
        }
        self.report_failure()
    }
}

impl Default for ViewerFallbackController {
    fn default() -> Self {
        Self::new()
    }
}
