//! Page Abstraction
//!
//! High-level API for one page target: navigation, evaluation, and
//! screenshots composed over the session, frame tree, and navigation
//! watcher.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::cdp::types::{
    PageCaptureScreenshot, PageCaptureScreenshotResult, PageGetNavigationHistory,
    PageGetNavigationHistoryResult, PageNavigate, PageNavigateResult, PageNavigateToHistoryEntry,
    PageReload, TargetCloseTarget, TargetCloseTargetResult,
};
use crate::cdp::CdpSession;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameManager};
use crate::target::Target;
use crate::watcher::{NavigationWatcher, WaitUntil};

/// How a navigation wait is configured.
///
/// An empty `wait_until` defaults to [`WaitUntil::Load`]. A `timeout` of
/// `None` inherits the page's default; `Some(Duration::ZERO)` disables
/// the timeout entirely (zero conventionally means "no timeout").
#[derive(Debug, Clone, Default)]
pub struct NavigateOptions {
    pub wait_until: Vec<WaitUntil>,
    pub timeout: Option<Duration>,
}

impl NavigateOptions {
    pub fn wait_until(milestones: &[WaitUntil]) -> Self {
        Self {
            wait_until: milestones.to_vec(),
            timeout: None,
        }
    }
}

/// A browser page bound to one target
pub struct Page {
    session: CdpSession,
    frames: FrameManager,
    target: Arc<Target>,
    default_timeout: Option<Duration>,
}

impl Page {
    /// Build a page over an attached session: enables the page/runtime
    /// domains, seeds the frame tree, and starts tracking events.
    pub(crate) async fn attach(
        session: CdpSession,
        target: Arc<Target>,
        default_timeout: Option<Duration>,
    ) -> Result<Self> {
        let frames = FrameManager::attach(session.clone()).await?;
        Ok(Self {
            session,
            frames,
            target,
            default_timeout,
        })
    }

    /// Get the underlying CDP session
    pub fn session(&self) -> &CdpSession {
        &self.session
    }

    /// The target this page is attached to
    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// The page's frame tree
    pub fn frame_manager(&self) -> &FrameManager {
        &self.frames
    }

    /// The page's root frame
    pub fn main_frame(&self) -> Result<Frame> {
        self.frames
            .main_frame()
            .ok_or_else(|| Error::InternalConsistency("page has no main frame".to_string()))
    }

    /// Snapshot of all attached frames, main frame first
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.frames()
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Navigate to a URL and wait for the `load` milestone
    pub async fn goto(&self, url: &str) -> Result<()> {
        self.goto_with(url, NavigateOptions::default()).await
    }

    /// Navigate to a URL with explicit milestones and timeout.
    ///
    /// The watcher is armed before the command is issued, so milestones
    /// arriving between the reply and the wait cannot be missed.
    pub async fn goto_with(&self, url: &str, options: NavigateOptions) -> Result<()> {
        let watcher = self.watcher(&options)?;

        let result: PageNavigateResult = self
            .session
            .send(
                "Page.navigate",
                &PageNavigate {
                    url: url.to_string(),
                    referrer: None,
                },
            )
            .await?;
        if let Some(error) = result.error_text {
            watcher.cancel();
            return Err(Error::Navigation(error));
        }

        watcher.wait().await
    }

    /// Wait for the next navigation to complete without issuing one
    /// (e.g. a click or script triggered it)
    pub async fn wait_for_navigation(&self) -> Result<()> {
        self.wait_for_navigation_with(NavigateOptions::default())
            .await
    }

    /// Wait for the next navigation with explicit milestones and timeout
    pub async fn wait_for_navigation_with(&self, options: NavigateOptions) -> Result<()> {
        self.watcher(&options)?.wait().await
    }

    fn watcher(&self, options: &NavigateOptions) -> Result<NavigationWatcher> {
        let main = self.main_frame()?;
        let timeout = options.timeout.or(self.default_timeout);
        Ok(NavigationWatcher::new(
            &self.frames,
            &main,
            &options.wait_until,
            timeout,
        ))
    }

    /// Reload the page and wait for the `load` milestone
    pub async fn reload(&self) -> Result<()> {
        let watcher = self.watcher(&NavigateOptions::default())?;
        self.session
            .send::<_, serde_json::Value>(
                "Page.reload",
                &PageReload {
                    ignore_cache: Some(false),
                },
            )
            .await?;
        watcher.wait().await
    }

    /// Go back in history. No-op if there is no previous entry.
    pub async fn back(&self) -> Result<()> {
        self.history_step(-1).await
    }

    /// Go forward in history. No-op if there is no next entry.
    pub async fn forward(&self) -> Result<()> {
        self.history_step(1).await
    }

    async fn history_step(&self, delta: i32) -> Result<()> {
        let history: PageGetNavigationHistoryResult = self
            .session
            .send("Page.getNavigationHistory", &PageGetNavigationHistory {})
            .await?;
        let index = history.current_index + delta;
        if index < 0 || index as usize >= history.entries.len() {
            return Ok(());
        }
        let entry_id = history.entries[index as usize].id;
        self.session
            .send::<_, serde_json::Value>(
                "Page.navigateToHistoryEntry",
                &PageNavigateToHistoryEntry { entry_id },
            )
            .await?;
        Ok(())
    }

    // =========================================================================
    // Page Info
    // =========================================================================

    /// Get current URL, as tracked by the frame tree
    pub fn url(&self) -> Result<String> {
        Ok(self.main_frame()?.url())
    }

    /// Get page title
    pub async fn title(&self) -> Result<String> {
        self.evaluate("document.title").await
    }

    /// Get page HTML content
    pub async fn content(&self) -> Result<String> {
        self.evaluate(
            r#"(() => {
                let retVal = '';
                if (document.doctype)
                    retVal = new XMLSerializer().serializeToString(document.doctype);
                if (document.documentElement)
                    retVal += document.documentElement.outerHTML;
                return retVal;
            })()"#,
        )
        .await
    }

    /// Evaluate an expression in the main frame's current document.
    ///
    /// Suspends until the frame's execution context is known. Fails with
    /// [`Error::ContextDestroyed`] when a new document replaced the one
    /// the evaluation was bound to.
    pub async fn evaluate<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        self.main_frame()?.evaluate(expression).await
    }

    // =========================================================================
    // Screenshots
    // =========================================================================

    /// Capture a screenshot as PNG bytes
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        self.capture_screenshot(Some("png"), None).await
    }

    /// Capture a screenshot as JPEG with quality
    pub async fn screenshot_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        self.capture_screenshot(Some("jpeg"), Some(quality)).await
    }

    async fn capture_screenshot(
        &self,
        format: Option<&str>,
        quality: Option<u8>,
    ) -> Result<Vec<u8>> {
        let result: PageCaptureScreenshotResult = self
            .session
            .send(
                "Page.captureScreenshot",
                &PageCaptureScreenshot {
                    format: format.map(String::from),
                    quality,
                },
            )
            .await?;

        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&result.data)
            .map_err(|e| Error::Decode(e.to_string()))
    }

    /// Close the page's target
    pub async fn close(&self) -> Result<()> {
        let _: TargetCloseTargetResult = self
            .session
            .connection()
            .send(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: self.target.target_id().to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("target_id", &self.target.target_id())
            .field("session_id", &self.session.session_id())
            .finish()
    }
}
