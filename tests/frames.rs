//! Frame tree and execution context behavior over a loopback channel

mod common;

use std::sync::Arc;

use common::{boot_with_page, lifecycle, settle, LOADER_1, LOADER_2, MAIN_FRAME, SESSION_ID};
use parking_lot::Mutex;
use remora::{Error, Frame, FrameEvent};
use serde_json::json;

fn frame_payload(id: &str, parent: Option<&str>, loader: &str, url: &str) -> serde_json::Value {
    let mut frame = json!({ "id": id, "loaderId": loader, "url": url });
    if let Some(parent) = parent {
        frame["parentId"] = json!(parent);
    }
    json!({ "frame": frame })
}

fn context_payload(id: i64, frame_id: &str) -> serde_json::Value {
    json!({ "context": {
        "id": id,
        "origin": "https://example.com",
        "auxData": { "frameId": frame_id, "isDefault": true }
    }})
}

#[tokio::test]
async fn seed_builds_the_main_frame() {
    let (_fake, _browser, page) = boot_with_page().await;

    let main = page.main_frame().unwrap();
    assert_eq!(main.frame_id(), MAIN_FRAME);
    assert_eq!(main.url(), "about:blank");
    assert_eq!(main.loader_id(), LOADER_1);
    assert!(main.parent().is_none());
    assert!(main.child_frames().is_empty());
    assert!(!main.is_detached());
}

#[tokio::test]
async fn attached_frames_link_under_their_parent() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "child-1", "parentFrameId": MAIN_FRAME }),
    );
    fake.session_event(
        SESSION_ID,
        "Page.frameNavigated",
        frame_payload("child-1", Some(MAIN_FRAME), "loader-c1", "https://example.com/frame"),
    );
    settle(&browser).await;

    let main = page.main_frame().unwrap();
    let children = main.child_frames();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].frame_id(), "child-1");
    assert_eq!(children[0].url(), "https://example.com/frame");
    assert_eq!(children[0].parent().unwrap(), main);
    assert_eq!(page.frames().len(), 2);
}

#[tokio::test]
async fn attach_under_unknown_parent_is_rejected() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "orphan", "parentFrameId": "ghost" }),
    );
    settle(&browser).await;

    // Logged as an internal consistency error; the tree is unchanged.
    assert!(page.frame_manager().frame_by_id("orphan").is_none());
    assert_eq!(page.frames().len(), 1);
}

#[tokio::test]
async fn evaluation_suspends_until_a_context_is_announced() {
    let (fake, browser, page) = boot_with_page().await;

    let frame = page.main_frame().unwrap();
    let eval = tokio::spawn(async move { frame.evaluate::<i64>("1 + 2").await });
    tokio::task::yield_now().await;
    assert!(!eval.is_finished());

    fake.stub_result(
        "Runtime.evaluate",
        json!({ "result": { "type": "number", "value": 3 } }),
    );
    fake.session_event(
        SESSION_ID,
        "Runtime.executionContextCreated",
        context_payload(5, MAIN_FRAME),
    );

    assert_eq!(eval.await.unwrap().unwrap(), 3);

    // The evaluation was bound to the announced context.
    let cmd = fake.sent_command("Runtime.evaluate").unwrap();
    assert_eq!(cmd["params"]["contextId"], 5);
    assert_eq!(cmd["sessionId"], SESSION_ID);
    settle(&browser).await;
}

#[tokio::test]
async fn new_document_fails_suspended_evaluations_distinctly() {
    let (fake, _browser, page) = boot_with_page().await;

    let frame = page.main_frame().unwrap();
    let eval = tokio::spawn(async move { frame.evaluate::<i64>("1").await });
    tokio::task::yield_now().await;

    // "init" for a new loader starts a new document: the old document's
    // pending evaluation dies with the stale-context kind.
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );

    match eval.await.unwrap().unwrap_err() {
        Error::ContextDestroyed(frame_id) => assert_eq!(frame_id, MAIN_FRAME),
        other => panic!("expected ContextDestroyed, got {other:?}"),
    }
}

#[tokio::test]
async fn destroyed_context_suspends_new_evaluations_until_replacement() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Runtime.executionContextCreated",
        context_payload(5, MAIN_FRAME),
    );
    fake.session_event(
        SESSION_ID,
        "Runtime.executionContextDestroyed",
        json!({ "executionContextId": 5 }),
    );
    settle(&browser).await;

    let frame = page.main_frame().unwrap();
    let eval = tokio::spawn(async move { frame.evaluate::<String>("document.title").await });
    tokio::task::yield_now().await;
    assert!(!eval.is_finished());

    fake.stub_result(
        "Runtime.evaluate",
        json!({ "result": { "type": "string", "value": "after" } }),
    );
    fake.session_event(
        SESSION_ID,
        "Runtime.executionContextCreated",
        context_payload(6, MAIN_FRAME),
    );

    assert_eq!(eval.await.unwrap().unwrap(), "after");
    let cmd = fake.sent_command("Runtime.evaluate").unwrap();
    assert_eq!(cmd["params"]["contextId"], 6);
}

#[tokio::test]
async fn stale_context_replies_map_to_context_destroyed() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Runtime.executionContextCreated",
        context_payload(5, MAIN_FRAME),
    );
    settle(&browser).await;

    fake.stub_error(
        "Runtime.evaluate",
        -32000,
        "Cannot find context with specified id",
    );
    match page.evaluate::<i64>("1").await.unwrap_err() {
        Error::ContextDestroyed(frame_id) => assert_eq!(frame_id, MAIN_FRAME),
        other => panic!("expected ContextDestroyed, got {other:?}"),
    }
}

#[tokio::test]
async fn detach_takes_the_whole_subtree_down_children_first() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "child-1", "parentFrameId": MAIN_FRAME }),
    );
    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "grandchild-1", "parentFrameId": "child-1" }),
    );
    settle(&browser).await;

    let child = page.frame_manager().frame_by_id("child-1").unwrap();
    let grandchild = page.frame_manager().frame_by_id("grandchild-1").unwrap();

    // Suspended evaluations across the subtree.
    let child_eval = {
        let frame = child.clone();
        tokio::spawn(async move { frame.evaluate::<i64>("1").await })
    };
    let grandchild_eval = {
        let frame = grandchild.clone();
        tokio::spawn(async move { frame.evaluate::<i64>("1").await })
    };
    tokio::task::yield_now().await;

    let detach_order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&detach_order);
    page.frame_manager().subscribe(move |event| {
        if let FrameEvent::Detached { frame } = event {
            sink.lock().push(frame.frame_id());
        }
    });

    fake.session_event(
        SESSION_ID,
        "Page.frameDetached",
        json!({ "frameId": "child-1" }),
    );
    settle(&browser).await;

    // Children cannot outlive their parent in the tree.
    assert_eq!(
        detach_order.lock().clone(),
        vec!["grandchild-1".to_string(), "child-1".to_string()]
    );
    assert!(child.is_detached());
    assert!(grandchild.is_detached());
    assert!(page.main_frame().unwrap().child_frames().is_empty());

    // Every pending wait on the subtree failed.
    assert!(matches!(
        child_eval.await.unwrap().unwrap_err(),
        Error::FrameDetached(_)
    ));
    assert!(matches!(
        grandchild_eval.await.unwrap().unwrap_err(),
        Error::FrameDetached(_)
    ));
}

#[tokio::test]
async fn reattach_under_new_id_is_a_distinct_frame() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "iframe-a", "parentFrameId": MAIN_FRAME }),
    );
    settle(&browser).await;
    let original = page.frame_manager().frame_by_id("iframe-a").unwrap();

    fake.session_event(
        SESSION_ID,
        "Page.frameDetached",
        json!({ "frameId": "iframe-a" }),
    );
    // The same element reattached under a fresh protocol id.
    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "iframe-b", "parentFrameId": MAIN_FRAME }),
    );
    settle(&browser).await;

    let reattached = page.frame_manager().frame_by_id("iframe-b").unwrap();
    assert_ne!(original, reattached);
    assert!(original.is_detached(), "original stays detached forever");
    assert!(!reattached.is_detached());
    assert!(page.frame_manager().frame_by_id("iframe-a").is_none());
}

#[tokio::test]
async fn main_frame_keeps_identity_across_rekeying() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "child-1", "parentFrameId": MAIN_FRAME }),
    );
    settle(&browser).await;

    let main_before = page.main_frame().unwrap();

    // Cross-origin navigation: the protocol re-keys the main frame.
    fake.session_event(
        SESSION_ID,
        "Page.frameNavigated",
        frame_payload("frame-main-b", None, LOADER_2, "https://other.example"),
    );
    settle(&browser).await;

    let main_after = page.main_frame().unwrap();
    assert_eq!(main_before, main_after, "same frame object");
    assert_eq!(main_before.frame_id(), "frame-main-b");
    assert_eq!(main_before.url(), "https://other.example");
    assert!(!main_before.is_detached());

    // The previous document's subframes did not survive it.
    assert!(main_after.child_frames().is_empty());
    assert!(page.frame_manager().frame_by_id("child-1").is_none());
}

#[tokio::test]
async fn session_close_tears_the_tree_down() {
    let (fake, browser, page) = boot_with_page().await;

    let frame = page.main_frame().unwrap();
    let eval = {
        let frame = frame.clone();
        tokio::spawn(async move { frame.evaluate::<i64>("1").await })
    };
    tokio::task::yield_now().await;

    fake.event(
        "Target.detachedFromTarget",
        json!({ "sessionId": SESSION_ID, "targetId": common::TARGET_ID }),
    );
    settle(&browser).await;

    assert!(matches!(
        eval.await.unwrap().unwrap_err(),
        Error::TargetClosed(_)
    ));
    assert!(frame.is_detached());
    assert!(page.session().is_closed());
}

#[tokio::test]
async fn lifecycle_events_for_untracked_frames_are_ignored() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle("never-attached", "loader-x", "load"),
    );
    settle(&browser).await;

    assert_eq!(page.frames().len(), 1);
}

#[tokio::test]
async fn frame_handles_compare_by_identity() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "child-1", "parentFrameId": MAIN_FRAME }),
    );
    settle(&browser).await;

    let a: Frame = page.frame_manager().frame_by_id("child-1").unwrap();
    let b: Frame = page.main_frame().unwrap().child_frames()[0].clone();
    assert_eq!(a, b);
    assert_ne!(a, page.main_frame().unwrap());
}
