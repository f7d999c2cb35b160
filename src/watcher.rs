//! Navigation Watcher
//!
//! Decides when a requested navigation has reached the caller's
//! milestones. A navigation counts as complete only once it has
//! *committed* (the frame's loader id changed, or a same-document
//! navigation happened) and the watched frame plus every descendant has
//! accumulated all requested lifecycle milestones for the current
//! document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cdp::ListenerId;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameEvent, FrameManager};

/// Lifecycle milestone a navigation can be awaited on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// The `load` event fired
    Load,
    /// The `DOMContentLoaded` event fired
    DomContentLoaded,
    /// No network connections for at least 500ms
    NetworkIdle,
    /// No more than 2 network connections for at least 500ms
    NetworkAlmostIdle,
}

impl WaitUntil {
    fn protocol_name(self) -> &'static str {
        match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "DOMContentLoaded",
            WaitUntil::NetworkIdle => "networkIdle",
            WaitUntil::NetworkAlmostIdle => "networkAlmostIdle",
        }
    }
}

/// Normalize a configured navigation timeout.
///
/// `None` and `Some(Duration::ZERO)` both mean "no timeout": zero keeps
/// its conventional disabled meaning for callers porting numeric configs.
pub(crate) fn normalize_timeout(timeout: Option<Duration>) -> Option<Duration> {
    match timeout {
        Some(d) if d.is_zero() => None,
        other => other,
    }
}

struct WatcherShared {
    expected: Vec<&'static str>,
    initial_loader_id: String,
    same_document: AtomicBool,
    done: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl WatcherShared {
    /// Resolve exactly once; later outcomes lose.
    fn resolve(&self, outcome: Result<()>) {
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    fn check(&self, frames: &FrameManager, watched: &Frame) {
        // The navigation must have committed before milestones count:
        // otherwise stale milestones from the previous document would
        // satisfy the wait.
        if watched.loader_id() == self.initial_loader_id
            && !self.same_document.load(Ordering::SeqCst)
        {
            return;
        }
        if !frames.subtree_satisfies(watched.node_id(), &self.expected) {
            return;
        }
        self.resolve(Ok(()));
    }
}

/// Watches one frame's navigation until milestones, timeout, or
/// cancellation.
///
/// Created before the navigation is triggered so no event can be missed;
/// consumed by [`wait`](Self::wait). Whichever of match, timeout, or
/// cancel happens first determines the outcome. The watcher unsubscribes
/// from frame events on every exit path, so repeated navigations do not
/// leak listeners.
pub struct NavigationWatcher {
    frames: FrameManager,
    listener: Option<ListenerId>,
    rx: oneshot::Receiver<Result<()>>,
    timeout: Option<Duration>,
}

impl NavigationWatcher {
    /// Start watching `frame`. An empty milestone set defaults to
    /// [`WaitUntil::Load`]. A `timeout` of `None` or `Duration::ZERO`
    /// means the watcher never times out.
    pub fn new(
        frames: &FrameManager,
        frame: &Frame,
        wait_until: &[WaitUntil],
        timeout: Option<Duration>,
    ) -> Self {
        let expected: Vec<&'static str> = if wait_until.is_empty() {
            vec![WaitUntil::Load.protocol_name()]
        } else {
            wait_until.iter().map(|w| w.protocol_name()).collect()
        };

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(WatcherShared {
            expected,
            initial_loader_id: frame.loader_id(),
            same_document: AtomicBool::new(false),
            done: Mutex::new(Some(tx)),
        });

        let listener = {
            let shared = Arc::clone(&shared);
            let frames = frames.clone();
            let watched = frame.clone();
            frames.clone().subscribe(move |event| {
                Self::on_frame_event(&shared, &frames, &watched, event)
            })
        };

        Self {
            frames: frames.clone(),
            listener: Some(listener),
            rx,
            timeout: normalize_timeout(timeout),
        }
    }

    fn on_frame_event(
        shared: &WatcherShared,
        frames: &FrameManager,
        watched: &Frame,
        event: &FrameEvent,
    ) {
        match event {
            FrameEvent::Lifecycle { .. } => shared.check(frames, watched),
            FrameEvent::Detached { frame } => {
                if frame == watched {
                    shared.resolve(Err(Error::FrameDetached(frame.frame_id())));
                } else {
                    // A detached subframe no longer gates completion.
                    shared.check(frames, watched);
                }
            }
            FrameEvent::NavigatedWithinDocument { frame, .. } => {
                if frame == watched {
                    shared.same_document.store(true, Ordering::SeqCst);
                }
                shared.check(frames, watched);
            }
            FrameEvent::Attached { .. } | FrameEvent::Navigated { .. } => {}
        }
    }

    /// Suspend until the navigation completes, the deadline elapses, or
    /// the watched frame detaches. Timeouts fail with
    /// [`Error::NavigationTimeout`] carrying the configured deadline.
    pub async fn wait(mut self) -> Result<()> {
        let rx = &mut self.rx;
        match self.timeout {
            Some(timeout) => tokio::select! {
                outcome = rx => outcome.unwrap_or_else(|_| Err(Error::closed("watcher dropped"))),
                _ = tokio::time::sleep(timeout) => Err(Error::NavigationTimeout { timeout }),
            },
            None => rx
                .await
                .unwrap_or_else(|_| Err(Error::closed("watcher dropped"))),
        }
        // Dropping self unsubscribes from frame events.
    }

    /// Stop watching without resolving either way (the caller is already
    /// satisfied by other means).
    pub fn cancel(mut self) {
        self.remove_listener();
    }

    fn remove_listener(&mut self) {
        if let Some(id) = self.listener.take() {
            self.frames.unsubscribe(id);
        }
    }
}

impl Drop for NavigationWatcher {
    fn drop(&mut self) {
        self.remove_listener();
    }
}

impl std::fmt::Debug for NavigationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationWatcher")
            .field("timeout", &self.timeout)
            .field("subscribed", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_means_no_timeout() {
        assert_eq!(normalize_timeout(Some(Duration::ZERO)), None);
        assert_eq!(normalize_timeout(None), None);
        assert_eq!(
            normalize_timeout(Some(Duration::from_secs(30))),
            Some(Duration::from_secs(30))
        );
    }
}
