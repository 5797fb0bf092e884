//! Full-stack roundtrip: a real client connection driving a real worker
//! serve loop over in-memory pipes, with only the engine mocked out.
//!
//! Everything between the two ends is production code on both sides:
//! framing, envelope conventions, correlation, the dispatcher, the
//! resource table, and the callback coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use drover_runtime::transport::PipeTransport;
use drover_runtime::{Connection, RemoteEvent, RemoteHandle, RemoteRegistry};
use drover_worker::testing::{MockCall, MockEngine};
use drover_worker::{Engine, ServeOptions, serve};

/// Both halves of a running stack: the client connection on one side, the
/// worker serve task on the other, and the mock engine behind it.
struct Harness {
    connection: Arc<Connection>,
    registry: Arc<RemoteRegistry>,
    engine: MockEngine,
    worker: JoinHandle<std::io::Result<()>>,
}

async fn start() -> Harness {
    start_with_options(ServeOptions::default()).await
}

async fn start_with_options(options: ServeOptions) -> Harness {
    let engine = MockEngine::new();

    // Two pipes, crossed over: the client's stdin-write feeds the worker's
    // reader, the worker's writer feeds the client's stdout-read.
    let (worker_reader, stdin_write) = tokio::io::duplex(256 * 1024);
    let (stdout_read, worker_writer) = tokio::io::duplex(256 * 1024);

    let engine_handle: Arc<dyn Engine> = Arc::new(engine.clone());
    let worker = tokio::spawn(serve(engine_handle, worker_reader, worker_writer, options));

    let (transport, event_rx) = PipeTransport::new(stdin_write, stdout_read);
    let parts = transport.into_transport_parts(event_rx);
    let registry = Arc::new(RemoteRegistry::new());
    let connection = Arc::new(Connection::new(parts, Arc::clone(&registry)));

    let run = Arc::clone(&connection);
    tokio::spawn(async move { run.run().await });

    connection
        .wait_ready(Duration::from_secs(2))
        .await
        .expect("worker never reported ready");

    Harness {
        connection,
        registry,
        engine,
        worker,
    }
}

/// Launch a browser, open a context, open a page. Returns the page id.
async fn open_page(harness: &Harness) -> String {
    let browser = harness
        .connection
        .send("launch", json!({ "headless": true }))
        .await
        .unwrap();
    let browser_id = browser["browserId"].as_str().unwrap();

    let context = harness
        .connection
        .send("browser.newContext", json!({ "browserId": browser_id }))
        .await
        .unwrap();
    let context_id = context["contextId"].as_str().unwrap();

    let page = harness
        .connection
        .send("context.newPage", json!({ "contextId": context_id }))
        .await
        .unwrap();
    page["pageId"].as_str().unwrap().to_string()
}

/// Register a client-side handle for `page_id` and subscribe to its events.
fn watch_page(
    harness: &Harness,
    page_id: &str,
) -> (Arc<RemoteHandle>, mpsc::UnboundedReceiver<RemoteEvent>) {
    let page = RemoteHandle::new(page_id, "page");
    let events = page.subscribe();
    harness.registry.register(Arc::clone(&page));
    (page, events)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> RemoteEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within 2s")
        .expect("event channel closed")
}

/// Poll until the engine records `expected`, since notice handling and
/// continuations run on their own tasks.
async fn wait_for_call(engine: &MockEngine, expected: MockCall) {
    for _ in 0..200 {
        if engine.calls().contains(&expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "engine never recorded {expected:?}; saw {:?}",
        engine.calls()
    );
}

#[tokio::test]
async fn session_lifecycle_over_real_pipes() {
    let harness = start().await;

    let browser = harness
        .connection
        .send("launch", json!({ "headless": true }))
        .await
        .unwrap();
    let browser_id = browser["browserId"].as_str().unwrap();
    assert!(browser_id.starts_with("browser_"), "{browser_id}");

    let context = harness
        .connection
        .send("browser.newContext", json!({ "browserId": browser_id }))
        .await
        .unwrap();
    let context_id = context["contextId"].as_str().unwrap();
    assert!(context_id.starts_with("context_"), "{context_id}");

    let page = harness
        .connection
        .send("context.newPage", json!({ "contextId": context_id }))
        .await
        .unwrap();
    let page_id = page["pageId"].as_str().unwrap();
    assert!(page_id.starts_with("page_"), "{page_id}");

    let version = harness
        .connection
        .send("browser.version", json!({ "browserId": browser_id }))
        .await
        .unwrap();
    assert_eq!(version["version"], "mock-129.0");

    let calls = harness.engine.calls();
    assert_eq!(calls[0], MockCall::Launch);
    assert_eq!(calls[1], MockCall::NewContext);
    assert_eq!(
        calls[2],
        MockCall::NewPage {
            page_id: page_id.to_string()
        }
    );
}

#[tokio::test]
async fn jsonrpc_and_action_conventions_share_one_worker() {
    let harness = start().await;
    let page_id = open_page(&harness).await;

    harness.engine.set_eval_result("6*7", json!(42));

    // JSON-RPC convention on the same stream as the action convention.
    let body = harness
        .connection
        .send_jsonrpc(
            "page.evaluate",
            json!({ "pageId": page_id, "expression": "6*7" }),
        )
        .await
        .unwrap();
    assert_eq!(body["value"], 42);

    let body = harness
        .connection
        .send(
            "page.navigate",
            json!({ "pageId": page_id, "url": "https://example.com" }),
        )
        .await
        .unwrap();
    assert_eq!(body["url"], "https://example.com");
    assert_eq!(body["status"], 200);
}

#[tokio::test]
async fn navigation_response_body_roundtrips() {
    use base64::{Engine as _, engine::general_purpose};

    let harness = start().await;
    let page_id = open_page(&harness).await;

    let navigated = harness
        .connection
        .send(
            "page.navigate",
            json!({ "pageId": page_id, "url": "https://example.com" }),
        )
        .await
        .unwrap();
    let response_id = navigated["responseId"].as_str().unwrap();
    assert!(response_id.starts_with("response_"), "{response_id}");
    assert_eq!(navigated["headers"]["content-type"], "text/html");

    let body = harness
        .connection
        .send("response.body", json!({ "responseId": response_id }))
        .await
        .unwrap();
    let expected = general_purpose::STANDARD.encode(b"<html>mock</html>");
    assert_eq!(body["body"], Value::String(expected));
}

#[tokio::test]
async fn engine_failure_surfaces_with_its_classification() {
    let harness = start().await;
    let page_id = open_page(&harness).await;

    harness
        .engine
        .fail_next_navigate("net::ERR_CONNECTION_REFUSED at https://down.invalid");

    let error = harness
        .connection
        .send(
            "page.navigate",
            json!({ "pageId": page_id, "url": "https://down.invalid" }),
        )
        .await
        .unwrap_err();
    assert!(error.is_network(), "got {error:?}");
    assert_eq!(error.error_name(), Some("NetworkError"));
}

#[tokio::test]
async fn unknown_action_and_unknown_resource_classify_remotely() {
    let harness = start().await;

    let error = harness
        .connection
        .send("frobnicate", json!({}))
        .await
        .unwrap_err();
    assert_eq!(error.error_name(), Some("UnknownActionError"));

    let error = harness
        .connection
        .send(
            "page.navigate",
            json!({ "pageId": "page_404", "url": "https://example.com" }),
        )
        .await
        .unwrap_err();
    assert_eq!(error.error_name(), Some("UnknownResourceError"));
}

#[tokio::test]
async fn route_event_reaches_the_client_and_continuation_resolves_it() {
    let harness = start().await;
    let page_id = open_page(&harness).await;
    let (_page, mut events) = watch_page(&harness, &page_id);

    harness
        .connection
        .send(
            "page.setInterception",
            json!({ "pageId": page_id, "enabled": true, "patterns": ["**/*"] }),
        )
        .await
        .unwrap();

    assert!(harness.engine.fire_route(
        &page_id,
        json!({ "url": "https://example.com/api", "method": "GET" })
    ));

    let RemoteEvent::Route {
        correlation_id,
        route_id,
        request,
    } = next_event(&mut events).await
    else {
        panic!("expected route event");
    };
    assert!(route_id.starts_with("route_"), "{route_id}");
    assert_eq!(request["method"], "GET");

    harness
        .connection
        .continue_callback(correlation_id, json!({ "action": "fulfill", "status": 204 }))
        .unwrap();

    wait_for_call(&harness.engine, MockCall::RouteFulfill { status: 204 }).await;
}

#[tokio::test]
async fn direct_route_command_wins_over_the_waiter() {
    let harness = start().await;
    let page_id = open_page(&harness).await;
    let (_page, mut events) = watch_page(&harness, &page_id);

    assert!(harness.engine.fire_route(
        &page_id,
        json!({ "url": "https://ads.example.com/pixel", "method": "GET" })
    ));

    let RemoteEvent::Route { route_id, .. } = next_event(&mut events).await else {
        panic!("expected route event");
    };

    harness
        .connection
        .send(
            "route.abort",
            json!({ "routeId": route_id, "reason": "blocked" }),
        )
        .await
        .unwrap();

    wait_for_call(
        &harness.engine,
        MockCall::RouteAbort {
            reason: Some("blocked".to_string()),
        },
    )
    .await;
}

#[tokio::test]
async fn route_ceiling_passes_the_request_through() {
    let harness = start_with_options(ServeOptions {
        continuation_ceiling: Duration::from_millis(50),
    })
    .await;
    let page_id = open_page(&harness).await;
    let (_page, mut events) = watch_page(&harness, &page_id);

    assert!(
        harness
            .engine
            .fire_route(&page_id, json!({ "url": "https://example.com/slow" }))
    );

    // Receive the event but never continue it; the worker falls back to
    // letting the request through untouched.
    let RemoteEvent::Route { .. } = next_event(&mut events).await else {
        panic!("expected route event");
    };

    wait_for_call(&harness.engine, MockCall::RouteContinue).await;
}

#[tokio::test]
async fn dialog_event_registers_a_live_handle() {
    let harness = start().await;
    let page_id = open_page(&harness).await;
    let (_page, mut events) = watch_page(&harness, &page_id);

    assert!(harness.engine.fire_dialog(&page_id, "confirm", "Proceed?"));

    let RemoteEvent::Dialog {
        dialog_id,
        kind,
        message,
    } = next_event(&mut events).await
    else {
        panic!("expected dialog event");
    };
    assert_eq!(kind, "confirm");
    assert_eq!(message, "Proceed?");

    // The connection registered a handle for the worker-allocated id.
    let dialog = harness.registry.try_get(&dialog_id).unwrap();
    assert_eq!(dialog.kind(), "dialog");
    assert_eq!(dialog.parent().unwrap().id(), page_id);

    harness
        .connection
        .send_for(
            &dialog,
            "dialog.accept",
            json!({ "dialogId": dialog_id, "promptText": "yes" }),
        )
        .await
        .unwrap();

    wait_for_call(
        &harness.engine,
        MockCall::DialogAccept {
            prompt_text: Some("yes".to_string()),
        },
    )
    .await;
}

#[tokio::test]
async fn console_chatter_flows_as_events() {
    let harness = start().await;
    let page_id = open_page(&harness).await;
    let (_page, mut events) = watch_page(&harness, &page_id);

    assert!(harness.engine.fire_console(&page_id, "error", "boom"));

    let RemoteEvent::Console { kind, text, .. } = next_event(&mut events).await else {
        panic!("expected console event");
    };
    assert_eq!(kind, "error");
    assert_eq!(text, "boom");
}

#[tokio::test]
async fn engine_side_close_sweeps_the_page() {
    let harness = start().await;
    let page_id = open_page(&harness).await;
    let (_page, mut events) = watch_page(&harness, &page_id);

    assert!(harness.engine.fire_close(&page_id));

    let RemoteEvent::Closed = next_event(&mut events).await else {
        panic!("expected close event");
    };

    // The worker swept the page before announcing the close, so commands
    // against it now miss.
    let error = harness
        .connection
        .send(
            "page.navigate",
            json!({ "pageId": page_id, "url": "https://example.com" }),
        )
        .await
        .unwrap_err();
    assert_eq!(error.error_name(), Some("UnknownResourceError"));
}

#[tokio::test]
async fn exit_tears_the_whole_stack_down() {
    let harness = start().await;
    let _page_id = open_page(&harness).await;

    harness.connection.send("exit", json!({})).await.unwrap();

    timeout(Duration::from_secs(2), harness.worker)
        .await
        .expect("worker did not exit")
        .expect("worker task panicked")
        .expect("serve returned an error");

    wait_for_call(&harness.engine, MockCall::CloseBrowser).await;

    // The stream is gone; later sends fail as disconnects, not timeouts.
    let error = harness
        .connection
        .send("browser.version", json!({}))
        .await
        .unwrap_err();
    assert!(error.is_disconnect(), "got {error:?}");
}
