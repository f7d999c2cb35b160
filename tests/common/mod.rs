//! Loopback transport harness
//!
//! Plays the browser end of the channel: records every command sent and
//! answers it from a small rule table, so protocol flows can be driven
//! and observed without Chrome.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use remora::cdp::MessageSink;
use remora::{Browser, BrowserConfig, Page, Result};

pub const TARGET_ID: &str = "target-1";
pub const SESSION_ID: &str = "session-1";
pub const MAIN_FRAME: &str = "frame-main";
pub const LOADER_1: &str = "loader-1";
pub const LOADER_2: &str = "loader-2";

enum Reply {
    Result(Value),
    Error { code: i64, message: String },
}

/// The scripted browser end of a loopback channel
pub struct FakeBrowser {
    sent: Mutex<Vec<Value>>,
    stubs: Mutex<HashMap<String, Reply>>,
    incoming: mpsc::UnboundedSender<String>,
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl FakeBrowser {
    pub fn start() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                stubs: Mutex::new(HashMap::new()),
                incoming: tx,
            }),
            rx,
        )
    }

    /// Replace the default reply for a method
    pub fn stub_result(&self, method: &str, result: Value) {
        self.stubs
            .lock()
            .insert(method.to_string(), Reply::Result(result));
    }

    /// Make a method fail with a protocol error
    pub fn stub_error(&self, method: &str, code: i64, message: &str) {
        self.stubs.lock().insert(
            method.to_string(),
            Reply::Error {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Inject a connection-level event
    pub fn event(&self, method: &str, params: Value) {
        self.inject(json!({ "method": method, "params": params }));
    }

    /// Inject an event scoped to a session
    pub fn session_event(&self, session_id: &str, method: &str, params: Value) {
        self.inject(json!({
            "method": method,
            "params": params,
            "sessionId": session_id,
        }));
    }

    /// Inject a raw message
    pub fn inject(&self, msg: Value) {
        self.incoming
            .send(msg.to_string())
            .expect("receive loop gone");
    }

    /// Methods sent so far, in order
    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.get("method").and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    /// Last command sent for a method, if any
    pub fn sent_command(&self, method: &str) -> Option<Value> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|m| m["method"] == method)
            .cloned()
    }

    /// Wait until a command for `method` has hit the wire
    pub async fn command_sent(&self, method: &str) {
        while self.sent_command(method).is_none() {
            tokio::task::yield_now().await;
        }
    }

    fn default_reply(method: &str) -> Value {
        match method {
            "Target.createTarget" => json!({ "targetId": TARGET_ID }),
            "Target.attachToTarget" => json!({ "sessionId": SESSION_ID }),
            "Target.closeTarget" => json!({ "success": true }),
            "Browser.getVersion" => json!({ "product": "HeadlessChrome/126.0" }),
            "Page.getFrameTree" => json!({
                "frameTree": {
                    "frame": {
                        "id": MAIN_FRAME,
                        "loaderId": LOADER_1,
                        "url": "about:blank",
                    }
                }
            }),
            "Page.navigate" => json!({ "frameId": MAIN_FRAME, "loaderId": LOADER_2 }),
            _ => json!({}),
        }
    }
}

impl MessageSink for FakeBrowser {
    fn send(&self, raw: &str) -> Result<()> {
        let msg: Value = serde_json::from_str(raw).expect("sent message is json");
        let id = msg["id"].as_u64().expect("command carries an id");
        let method = msg["method"].as_str().unwrap_or_default().to_string();

        // Answer synchronously, before send() even returns; the
        // connection must already have the call recorded.
        let reply = match self.stubs.lock().get(&method) {
            Some(Reply::Result(result)) => json!({ "id": id, "result": result }),
            Some(Reply::Error { code, message }) => {
                json!({ "id": id, "error": { "code": code, "message": message } })
            }
            None => json!({ "id": id, "result": Self::default_reply(&method) }),
        };
        let _ = self.incoming.send(reply.to_string());

        self.sent.lock().push(msg);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connect a Browser over a fresh loopback channel
pub async fn boot() -> (Arc<FakeBrowser>, Browser) {
    let (fake, incoming) = FakeBrowser::start();
    let browser = Browser::connect(
        Arc::clone(&fake) as Arc<dyn MessageSink>,
        incoming,
        BrowserConfig::default(),
    )
    .await
    .expect("connect over loopback");
    (fake, browser)
}

/// Boot a browser and attach a page whose main frame is seeded at
/// `about:blank` under `LOADER_1`
pub async fn boot_with_page() -> (Arc<FakeBrowser>, Browser, Page) {
    let (fake, browser) = boot().await;

    fake.event(
        "Target.targetCreated",
        json!({ "targetInfo": {
            "targetId": TARGET_ID, "type": "page", "url": "", "title": ""
        }}),
    );
    fake.event(
        "Target.targetInfoChanged",
        json!({ "targetInfo": {
            "targetId": TARGET_ID, "type": "page", "url": "about:blank", "title": ""
        }}),
    );

    let page = browser.new_page().await.expect("attach page over loopback");
    (fake, browser, page)
}

/// Round-trip barrier: by the time the reply resolves, every event
/// injected before it has been dispatched by the receive loop.
pub async fn settle(browser: &Browser) {
    browser.version().await.expect("loopback version");
}

/// Shorthand for a target lifecycle payload
pub fn target_info(target_id: &str, kind: &str, url: &str) -> Value {
    json!({ "targetInfo": {
        "targetId": target_id, "type": kind, "url": url, "title": ""
    }})
}

/// Shorthand for a lifecycle event payload
pub fn lifecycle(frame_id: &str, loader_id: &str, name: &str) -> Value {
    json!({ "frameId": frame_id, "loaderId": loader_id, "name": name })
}
