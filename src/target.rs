//! Target tracking
//!
//! A target is one remote debuggable unit (page, worker). Page targets
//! start life as a blank placeholder with an empty url; they count as
//! ready only once a real document has committed and the url is known.

use parking_lot::Mutex;

use crate::cdp::types::TargetInfo;
use crate::sync::Gate;

/// What kind of remote unit a target is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    ServiceWorker,
    Other,
}

impl TargetKind {
    pub(crate) fn parse(raw: &str) -> Self {
        match raw {
            "page" => TargetKind::Page,
            "service_worker" => TargetKind::ServiceWorker,
            _ => TargetKind::Other,
        }
    }
}

#[derive(Debug, Clone)]
struct TargetState {
    kind: TargetKind,
    url: String,
    title: String,
}

/// Outcome of applying a target-info-changed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InfoChange {
    pub became_ready: bool,
    pub url_changed: bool,
}

/// A remote target known to the browser.
///
/// Readiness resolves at most once and never reverts: `true` when the
/// target commits (non-page targets immediately, page targets once their
/// url is non-empty), `false` if the target is destroyed before ever
/// becoming ready.
pub struct Target {
    target_id: String,
    state: Mutex<TargetState>,
    ready: Gate<bool>,
}

impl Target {
    pub(crate) fn new(info: &TargetInfo) -> Self {
        let kind = TargetKind::parse(&info.kind);
        let target = Self {
            target_id: info.target_id.clone(),
            state: Mutex::new(TargetState {
                kind,
                url: info.url.clone(),
                title: info.title.clone(),
            }),
            ready: Gate::new(),
        };
        if Self::qualifies(kind, &info.url) {
            target.ready.resolve(true);
        }
        target
    }

    fn qualifies(kind: TargetKind, url: &str) -> bool {
        kind != TargetKind::Page || !url.is_empty()
    }

    /// Apply an info-changed notification. Readiness is re-evaluated only
    /// while the target is not yet ready.
    pub(crate) fn info_changed(&self, info: &TargetInfo) -> InfoChange {
        let (kind, url_changed) = {
            let mut state = self.state.lock();
            let url_changed = state.url != info.url;
            state.kind = TargetKind::parse(&info.kind);
            state.url = info.url.clone();
            state.title = info.title.clone();
            (state.kind, url_changed)
        };

        let became_ready =
            !self.ready.is_resolved() && Self::qualifies(kind, &info.url) && self.ready.resolve(true);

        InfoChange {
            became_ready,
            url_changed,
        }
    }

    /// Mark the target destroyed; a never-ready target resolves `false`.
    pub(crate) fn destroyed(&self) {
        self.ready.resolve(false);
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn kind(&self) -> TargetKind {
        self.state.lock().kind
    }

    pub fn url(&self) -> String {
        self.state.lock().url.clone()
    }

    pub fn title(&self) -> String {
        self.state.lock().title.clone()
    }

    /// True once the target has committed and is visible to enumeration
    pub fn is_ready(&self) -> bool {
        self.ready.peek() == Some(true)
    }

    /// Wait for readiness: `true` once committed, `false` if the target
    /// was destroyed before ever becoming ready.
    pub async fn wait_ready(&self) -> bool {
        self.ready.wait().await
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Target")
            .field("target_id", &self.target_id)
            .field("kind", &state.kind)
            .field("url", &state.url)
            .field("ready", &self.ready.peek())
            .finish()
    }
}
