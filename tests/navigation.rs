//! Navigation watcher behavior over a loopback channel

mod common;

use std::time::Duration;

use common::{boot_with_page, lifecycle, settle, LOADER_1, LOADER_2, MAIN_FRAME, SESSION_ID};
use remora::{Error, NavigateOptions, NavigationWatcher, WaitUntil};
use serde_json::json;

#[tokio::test]
async fn goto_resolves_once_the_new_document_loads() {
    let (fake, _browser, page) = boot_with_page().await;

    let nav = tokio::spawn(async move {
        let result = page.goto("https://example.com").await;
        (page, result)
    });
    fake.command_sent("Page.navigate").await;

    // New document: init adopts the new loader, then the milestone lands.
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );

    let (page, result) = nav.await.unwrap();
    result.unwrap();
    assert_eq!(page.main_frame().unwrap().loader_id(), LOADER_2);
}

#[tokio::test]
async fn goto_fails_fast_on_navigation_errors() {
    let (fake, _browser, page) = boot_with_page().await;

    fake.stub_result(
        "Page.navigate",
        json!({ "frameId": MAIN_FRAME, "errorText": "net::ERR_NAME_NOT_RESOLVED" }),
    );

    match page.goto("https://nope.invalid").await.unwrap_err() {
        Error::Navigation(text) => assert!(text.contains("ERR_NAME_NOT_RESOLVED")),
        other => panic!("expected Navigation, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_milestones_from_the_previous_document_do_not_count() {
    let (fake, browser, page) = boot_with_page().await;

    // The previous document already saw "load".
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_1, "load"),
    );
    settle(&browser).await;
    assert!(page.main_frame().unwrap().lifecycle_contains("load"));

    let wait = tokio::spawn(async move {
        let result = page.wait_for_navigation().await;
        (page, result)
    });
    tokio::task::yield_now().await;

    // More events for the same document: the loader id is unchanged and
    // no same-document navigation happened, so nothing may resolve.
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_1, "DOMContentLoaded"),
    );
    settle(&browser).await;
    assert!(!wait.is_finished());

    // Only a committed new document with fresh milestones completes it.
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    settle(&browser).await;
    assert!(!wait.is_finished(), "init cleared the stale load milestone");

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );
    let (_page, result) = wait.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn completion_waits_for_every_descendant_frame() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "child-1", "parentFrameId": MAIN_FRAME }),
    );
    settle(&browser).await;

    let wait = tokio::spawn(async move {
        let result = page.wait_for_navigation().await;
        (page, result)
    });
    tokio::task::yield_now().await;

    // Root commits and reports load (and more); the child only reports
    // DOMContentLoaded, so the navigation is not complete.
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "DOMContentLoaded"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle("child-1", "loader-c1", "DOMContentLoaded"),
    );
    settle(&browser).await;
    assert!(!wait.is_finished(), "child has not reached load yet");

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle("child-1", "loader-c1", "load"),
    );
    let (_page, result) = wait.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn a_detached_subframe_no_longer_gates_completion() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameAttached",
        json!({ "frameId": "child-1", "parentFrameId": MAIN_FRAME }),
    );
    settle(&browser).await;

    let wait = tokio::spawn(async move {
        let result = page.wait_for_navigation().await;
        (page, result)
    });
    tokio::task::yield_now().await;

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );
    settle(&browser).await;
    assert!(!wait.is_finished(), "child still gates completion");

    // The blocking child goes away; the wait can now complete.
    fake.session_event(
        SESSION_ID,
        "Page.frameDetached",
        json!({ "frameId": "child-1" }),
    );
    let (_page, result) = wait.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn same_document_navigation_completes_without_a_new_loader() {
    let (fake, browser, page) = boot_with_page().await;

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_1, "load"),
    );
    settle(&browser).await;

    let wait = tokio::spawn(async move {
        let result = page.wait_for_navigation().await;
        (page, result)
    });
    tokio::task::yield_now().await;

    // Fragment navigation: no loader change, no lifecycle reset.
    fake.session_event(
        SESSION_ID,
        "Page.navigatedWithinDocument",
        json!({ "frameId": MAIN_FRAME, "url": "about:blank#anchor" }),
    );

    let (page, result) = wait.await.unwrap();
    result.unwrap();

    let main = page.main_frame().unwrap();
    assert_eq!(main.url(), "about:blank#anchor");
    assert_eq!(main.loader_id(), LOADER_1);
    assert!(
        main.lifecycle_contains("load"),
        "same-document navigation keeps accumulated milestones"
    );
}

#[tokio::test]
async fn zero_timeout_never_fires() {
    let (_fake, _browser, page) = boot_with_page().await;

    let wait = tokio::spawn(async move {
        page.wait_for_navigation_with(NavigateOptions {
            wait_until: Vec::new(),
            timeout: Some(Duration::ZERO),
        })
        .await
    });

    // No events arrive at all; within the bounded test window the wait
    // must not resolve, in particular not with a timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!wait.is_finished());
    wait.abort();
}

#[tokio::test]
async fn timeout_carries_the_configured_deadline() {
    let (_fake, _browser, page) = boot_with_page().await;

    let result = page
        .wait_for_navigation_with(NavigateOptions {
            wait_until: Vec::new(),
            timeout: Some(Duration::from_millis(50)),
        })
        .await;

    match result.unwrap_err() {
        Error::NavigationTimeout { timeout } => {
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected NavigationTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn watched_frame_detach_fails_the_wait() {
    let (fake, _browser, page) = boot_with_page().await;

    let wait = tokio::spawn(async move { page.wait_for_navigation().await });
    tokio::task::yield_now().await;

    fake.session_event(
        SESSION_ID,
        "Page.frameDetached",
        json!({ "frameId": MAIN_FRAME }),
    );

    match wait.await.unwrap().unwrap_err() {
        Error::FrameDetached(frame_id) => assert_eq!(frame_id, MAIN_FRAME),
        other => panic!("expected FrameDetached, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_watcher_ignores_later_events() {
    let (fake, browser, page) = boot_with_page().await;

    let main = page.main_frame().unwrap();
    let watcher = NavigationWatcher::new(
        page.frame_manager(),
        &main,
        &[WaitUntil::Load],
        Some(Duration::from_secs(30)),
    );
    watcher.cancel();

    // Events that would have completed the navigation are now nobody's
    // business; nothing panics and nothing leaks a resolution.
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );
    settle(&browser).await;
}

#[tokio::test]
async fn reload_waits_for_the_new_document() {
    let (fake, _browser, page) = boot_with_page().await;

    let nav = tokio::spawn(async move {
        let result = page.reload().await;
        (page, result)
    });
    fake.command_sent("Page.reload").await;

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );

    let (_page, result) = nav.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn explicit_milestones_all_have_to_land() {
    let (fake, browser, page) = boot_with_page().await;

    let wait = tokio::spawn(async move {
        let result = page
            .wait_for_navigation_with(NavigateOptions::wait_until(&[
                WaitUntil::Load,
                WaitUntil::NetworkIdle,
            ]))
            .await;
        (page, result)
    });
    tokio::task::yield_now().await;

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "init"),
    );
    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "load"),
    );
    settle(&browser).await;
    assert!(!wait.is_finished(), "networkIdle has not landed");

    fake.session_event(
        SESSION_ID,
        "Page.lifecycleEvent",
        lifecycle(MAIN_FRAME, LOADER_2, "networkIdle"),
    );
    let (_page, result) = wait.await.unwrap();
    result.unwrap();
}
