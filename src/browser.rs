//! Browser Connection and Target Registry
//!
//! Launches (or connects to) a Chromium instance and keeps the set of
//! known targets in sync from discovery notifications. Page-kind targets
//! stay invisible to enumeration until their first real document commits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cdp::types::{
    BrowserGetVersion, BrowserGetVersionResult, TargetCreateTarget, TargetCreateTargetResult,
    TargetCreatedEvent, TargetDestroyedEvent, TargetInfo, TargetInfoChangedEvent,
    TargetSetDiscoverTargets,
};
use crate::cdp::{
    find_chrome, launch_chrome, Connection, ListenerId, MessageSink, ProtocolEvent,
    WebSocketTransport,
};
use crate::error::{Error, Result};
use crate::page::Page;
use crate::target::{Target, TargetKind};
use crate::BrowserConfig;

/// Global counter for unique user data directories
static BROWSER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Chrome arguments for unattended automation
fn browser_args(config: &BrowserConfig) -> Vec<String> {
    let mut args = vec![
        "--no-first-run".into(),
        "--no-default-browser-check".into(),
        "--disable-dev-shm-usage".into(),
        "--disable-background-timer-throttling".into(),
        "--disable-renderer-backgrounding".into(),
        "--disable-hang-monitor".into(),
        "--disable-sync".into(),
        "--metrics-recording-only".into(),
        "--password-store=basic".into(),
        "--use-mock-keychain".into(),
        format!(
            "--window-size={},{}",
            config.viewport_width, config.viewport_height
        ),
    ];

    if config.headless {
        args.push("--headless=new".into());
    }

    args.extend(config.args.iter().cloned());
    args
}

/// Registry change notifications.
///
/// `Created` fires once a target becomes ready, never for a blank
/// placeholder; `Changed` fires for url changes of an already-ready
/// target; `Destroyed` fires only for targets that had become ready.
#[derive(Debug, Clone)]
pub enum TargetEvent {
    Created(Arc<Target>),
    Destroyed(Arc<Target>),
    Changed(Arc<Target>),
}

type TargetCallback = Arc<dyn Fn(&TargetEvent) + Send + Sync>;

struct BrowserInner {
    connection: Connection,
    targets: Mutex<HashMap<String, Arc<Target>>>,
    listeners: Mutex<Vec<(ListenerId, TargetCallback)>>,
    next_listener: AtomicU64,
    config: BrowserConfig,
    /// User data directory (cleaned up on close), if we spawned Chrome
    user_data_dir: Mutex<Option<PathBuf>>,
}

/// A connected browser
#[derive(Clone)]
pub struct Browser {
    inner: Arc<BrowserInner>,
}

impl Browser {
    /// Launch a new browser with default config
    pub async fn launch() -> Result<Self> {
        Self::launch_with_config(BrowserConfig::default()).await
    }

    /// Launch with custom config
    pub async fn launch_with_config(config: BrowserConfig) -> Result<Self> {
        // Create unique user data directory
        let instance_id = BROWSER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let user_data_dir = std::env::temp_dir().join(format!(
            "remora-browser-{}-{}",
            std::process::id(),
            instance_id
        ));

        // Clean up any stale data
        let _ = std::fs::remove_dir_all(&user_data_dir);
        std::fs::create_dir_all(&user_data_dir)?;

        // Find Chrome path
        let chrome_path = match &config.chrome_path {
            Some(p) => PathBuf::from(p),
            None => find_chrome()?,
        };

        let mut args = browser_args(&config);
        args.push(format!("--user-data-dir={}", user_data_dir.display()));

        tracing::info!("Launching Chrome from {:?}", chrome_path);
        let (child, ws_url) = launch_chrome(&chrome_path, &args)?;

        let (transport, incoming) = WebSocketTransport::connect(&ws_url, Some(child))?;
        let browser = Self::connect(Arc::new(transport), incoming, config).await?;
        *browser.inner.user_data_dir.lock() = Some(user_data_dir);

        let version = browser.version().await?;
        tracing::info!("Connected to {}", version);

        Ok(browser)
    }

    /// Connect over an already-established message channel.
    ///
    /// Builds the connection, subscribes to target lifecycle
    /// notifications, and issues the one-time discover-targets command.
    pub async fn connect(
        sink: Arc<dyn MessageSink>,
        incoming: mpsc::UnboundedReceiver<String>,
        config: BrowserConfig,
    ) -> Result<Self> {
        let connection = Connection::new(sink, incoming);

        let inner = Arc::new(BrowserInner {
            connection: connection.clone(),
            targets: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            config,
            user_data_dir: Mutex::new(None),
        });

        let weak: Weak<BrowserInner> = Arc::downgrade(&inner);
        connection.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                Browser { inner }.on_connection_event(event);
            }
        });

        let browser = Self { inner };
        connection
            .send::<_, serde_json::Value>(
                "Target.setDiscoverTargets",
                &TargetSetDiscoverTargets { discover: true },
            )
            .await?;

        Ok(browser)
    }

    /// The underlying connection
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    // =========================================================================
    // Target registry
    // =========================================================================

    /// Route one connection-level event into the registry. Invariant
    /// violations are logged at error level, never thrown across the
    /// receive loop.
    fn on_connection_event(&self, event: &ProtocolEvent) {
        let outcome = match event.method.as_str() {
            "Target.targetCreated" => {
                serde_json::from_value::<TargetCreatedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .map(|ev| self.on_target_created(&ev.target_info))
            }
            "Target.targetDestroyed" => {
                serde_json::from_value::<TargetDestroyedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .and_then(|ev| self.on_target_destroyed(&ev.target_id))
            }
            "Target.targetInfoChanged" => {
                serde_json::from_value::<TargetInfoChangedEvent>(event.params.clone())
                    .map_err(Error::from)
                    .and_then(|ev| self.on_target_info_changed(&ev.target_info))
            }
            _ => Ok(()),
        };

        if let Err(e) = outcome {
            tracing::error!("Target registry desynchronized on {}: {}", event.method, e);
        }
    }

    fn on_target_created(&self, info: &TargetInfo) {
        let target = Arc::new(Target::new(info));
        let previous = self
            .inner
            .targets
            .lock()
            .insert(info.target_id.clone(), Arc::clone(&target));
        if previous.is_some() {
            // The protocol promises creation precedes re-creation; keep
            // the newer record but complain loudly.
            tracing::error!("Target {} created twice", info.target_id);
        }
        if target.is_ready() {
            self.emit(TargetEvent::Created(target));
        }
    }

    fn on_target_destroyed(&self, target_id: &str) -> Result<()> {
        let target = self.inner.targets.lock().remove(target_id).ok_or_else(|| {
            Error::InternalConsistency(format!("destroy for unknown target {}", target_id))
        })?;

        let was_ready = target.is_ready();
        target.destroyed();

        // The frame tree of any page attached to this target is torn down
        // through its session close gate.
        self.inner
            .connection
            .close_target_sessions(target_id, "target destroyed");

        if was_ready {
            self.emit(TargetEvent::Destroyed(target));
        }
        Ok(())
    }

    fn on_target_info_changed(&self, info: &TargetInfo) -> Result<()> {
        let target = self
            .inner
            .targets
            .lock()
            .get(&info.target_id)
            .cloned()
            .ok_or_else(|| {
                Error::InternalConsistency(format!(
                    "info change for unknown target {}",
                    info.target_id
                ))
            })?;

        let change = target.info_changed(info);
        if change.became_ready {
            self.emit(TargetEvent::Created(target));
        } else if change.url_changed && target.is_ready() {
            self.emit(TargetEvent::Changed(target));
        }
        Ok(())
    }

    fn emit(&self, event: TargetEvent) {
        let callbacks: Vec<TargetCallback> = {
            let listeners = self.inner.listeners.lock();
            listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Register a target-event listener
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&TargetEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a target-event listener. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// All currently ready targets. Blank placeholder pages are excluded
    /// until their first document commits, and a target once listed stays
    /// listed while it lives.
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.inner
            .targets
            .lock()
            .values()
            .filter(|t| t.is_ready())
            .cloned()
            .collect()
    }

    /// All ready page targets
    pub fn pages(&self) -> Vec<Arc<Target>> {
        self.targets()
            .into_iter()
            .filter(|t| t.kind() == TargetKind::Page)
            .collect()
    }

    /// Look up a known target by id, ready or not
    pub fn target(&self, target_id: &str) -> Option<Arc<Target>> {
        self.inner.targets.lock().get(target_id).cloned()
    }

    /// Wait for a target's readiness gate: `true` once it has committed,
    /// `false` if it was destroyed first.
    pub async fn wait_until_ready(&self, target_id: &str) -> Result<bool> {
        let target = self.target(target_id).ok_or_else(|| {
            Error::InternalConsistency(format!("waiting on unknown target {}", target_id))
        })?;
        Ok(target.wait_ready().await)
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Create a new page target, wait for it to commit, and attach
    pub async fn new_page(&self) -> Result<Page> {
        let result: TargetCreateTargetResult = self
            .inner
            .connection
            .send(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: "about:blank".to_string(),
                },
            )
            .await?;

        if !self.wait_until_ready(&result.target_id).await? {
            return Err(Error::closed("target destroyed before initializing"));
        }
        let target = self
            .target(&result.target_id)
            .ok_or_else(|| Error::closed("target destroyed before initializing"))?;
        self.attach_page(&target).await
    }

    /// Attach a page to an existing target
    pub async fn attach_page(&self, target: &Arc<Target>) -> Result<Page> {
        let session = self
            .inner
            .connection
            .create_session(target.target_id())
            .await?;
        Page::attach(
            session,
            Arc::clone(target),
            self.inner.config.navigation_timeout,
        )
        .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Get the browser version
    pub async fn version(&self) -> Result<String> {
        let v: BrowserGetVersionResult = self
            .inner
            .connection
            .send("Browser.getVersion", &BrowserGetVersion {})
            .await?;
        Ok(v.product)
    }

    /// Close the browser and the connection. Every pending command on
    /// every session fails with a closed error rather than hanging.
    pub async fn close(&self) -> Result<()> {
        let _ = self
            .inner
            .connection
            .send::<_, serde_json::Value>(
                "Browser.close",
                &crate::cdp::types::BrowserClose {},
            )
            .await;
        self.inner.connection.close("browser closed");

        if let Some(dir) = self.inner.user_data_dir.lock().take() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("targets", &self.inner.targets.lock().len())
            .field("closed", &self.inner.connection.is_closed())
            .finish()
    }
}

impl Drop for BrowserInner {
    fn drop(&mut self) {
        // Best-effort cleanup if close() wasn't called. The transport's
        // own Drop kills the Chrome process.
        if let Some(dir) = self.user_data_dir.lock().take() {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
