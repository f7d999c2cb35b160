//! # Remora
//!
//! A Chrome DevTools Protocol client that tracks targets, frames, and
//! navigation.
//!
//! Remora attaches to a Chromium instance over the DevTools WebSocket,
//! multiplexes per-target sessions over the single connection, and
//! rebuilds a consistent model of the browser's target and frame
//! topology from the protocol's event stream. Navigation waits are
//! event-driven: a watcher observes lifecycle milestones across the
//! whole frame tree instead of polling.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use remora::Browser;
//!
//! #[tokio::main]
//! async fn main() -> remora::Result<()> {
//!     let browser = Browser::launch().await?;
//!
//!     let page = browser.new_page().await?;
//!     page.goto("https://example.com").await?;
//!
//!     let title: String = page.evaluate("document.title").await?;
//!     println!("{title}");
//!
//!     browser.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use remora::{Browser, BrowserConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> remora::Result<()> {
//! let config = BrowserConfig {
//!     headless: false,
//!     navigation_timeout: Some(Duration::from_secs(10)),
//!     ..Default::default()
//! };
//!
//! let browser = Browser::launch_with_config(config).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod browser;
pub mod cdp;
pub mod error;
pub mod frame;
pub mod page;
pub mod sync;
pub mod target;
pub mod watcher;

// Re-exports
pub use browser::{Browser, TargetEvent};
pub use cdp::{CdpSession, Connection, ListenerId, MessageSink, ProtocolEvent};
pub use error::{Error, Result};
pub use frame::{ExecutionContext, Frame, FrameEvent, FrameManager};
pub use page::{NavigateOptions, Page};
pub use target::{Target, TargetKind};
pub use watcher::{NavigationWatcher, WaitUntil};

/// Browser launch and session configuration
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Headless mode
    pub headless: bool,
    /// Path to Chrome/Chromium binary (None = search common locations)
    pub chrome_path: Option<String>,
    /// Extra Chrome arguments appended to the defaults
    pub args: Vec<String>,
    /// Viewport width
    pub viewport_width: u32,
    /// Viewport height
    pub viewport_height: u32,
    /// Default deadline for navigation waits. `None` or
    /// `Some(Duration::ZERO)` disables the timeout: zero conventionally
    /// means "wait forever."
    pub navigation_timeout: Option<Duration>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            args: Vec::new(),
            viewport_width: 1920,
            viewport_height: 1080,
            navigation_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl BrowserConfig {
    /// Create a visible (non-headless) config
    pub fn visible() -> Self {
        Self {
            headless: false,
            ..Default::default()
        }
    }
}
