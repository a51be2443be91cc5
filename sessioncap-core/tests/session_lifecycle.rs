//! Integration tests for the session lifecycle
//!
//! A wiremock server stands in for the ingest service and a
//! `RecordingTransport` for the worker, so every test can inspect exactly
//! what crossed both boundaries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use sessioncap_core::app::{ActivityState, App, WeakApp};
use sessioncap_core::config::{StorageKeys, TrackerConfig};
use sessioncap_core::diagnostics::{DiagnosticSink, MemorySink};
use sessioncap_core::events::{Event, EventBus, EventTarget, Listener};
use sessioncap_core::host::{HostDocument, ManualClock};
use sessioncap_core::message::{Batch, Message};
use sessioncap_core::observer::Observer;
use sessioncap_core::safe::CallbackResult;
use sessioncap_core::session::{OnStartInfo, StartOptions};
use sessioncap_core::storage::{MemoryStorage, PersistedState};
use sessioncap_core::transport::{ControlMessage, RecordingTransport, Transport, WorkerSignal};
use sessioncap_core::Error;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Everything a test needs to drive and observe one tracker.
struct Harness {
    app: App,
    transport: Arc<RecordingTransport>,
    sink: Arc<MemorySink>,
    document: Arc<HostDocument>,
    server: MockServer,
}

fn ok_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "token": "t1",
        "userUUID": "u1",
        "sessionID": "s1",
        "beaconSizeLimit": 100000
    }))
}

async fn harness(response: ResponseTemplate) -> Harness {
    sessioncap_core::logging::init_test();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/web/start"))
        .respond_with(response)
        .mount(&server)
        .await;

    let transport = Arc::new(RecordingTransport::new());
    let sink = Arc::new(MemorySink::new());
    let document = Arc::new(HostDocument::with_location("https://shop.example.com/"));
    let config = TrackerConfig {
        ingest_point: server.uri(),
        // Commits in these tests are driven explicitly
        commit_interval_ms: 60_000,
        ..Default::default()
    };

    let app = App::builder("test-project", config)
        .transport(transport.clone())
        .diagnostics(sink.clone())
        .document(document.clone())
        .clock(Arc::new(ManualClock::new(42)))
        .build()
        .expect("build app");

    Harness {
        app,
        transport,
        sink,
        document,
        server,
    }
}

fn custom(name: &str) -> Message {
    Message::Custom {
        name: name.to_string(),
        payload: String::new(),
    }
}

async fn start_requests(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/v1/web/start")
        .map(|r| r.body_json::<Value>().expect("start body is JSON"))
        .collect()
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn counting_listener(counter: Arc<Mutex<u32>>) -> Listener {
    Arc::new(move |_event: &Event| -> CallbackResult {
        *counter.lock().unwrap() += 1;
        Ok(())
    })
}

// ============================================
// Start and stop
// ============================================

#[tokio::test]
async fn test_successful_start_persists_identity() {
    let h = harness(ok_response()).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=2 {
        let order = order.clone();
        h.app.attach_start_callback(move || {
            order.lock().unwrap().push(i);
            Ok(())
        });
    }

    let info = h.app.start(StartOptions::default()).await.expect("start");

    assert_eq!(info.session_token, "t1");
    assert_eq!(info.user_uuid, "u1");
    assert_eq!(info.session_id.as_deref(), Some("s1"));
    assert_eq!(h.app.activity_state(), ActivityState::Active);
    assert_eq!(h.app.session_token().as_deref(), Some("t1"));
    assert_eq!(h.app.session_id().as_deref(), Some("s1"));
    assert_eq!(h.app.persisted().user_uuid().unwrap().as_deref(), Some("u1"));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    let controls = h.transport.controls();
    assert!(matches!(controls[0], ControlMessage::Init(ref p) if p.page_no == 0));
    assert_eq!(
        controls[1],
        ControlMessage::Handshake {
            token: "t1".to_string(),
            beacon_size_limit: Some(100_000),
        }
    );
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn test_start_request_carries_identity() {
    let h = harness(ok_response()).await;

    h.app
        .start(StartOptions::default().with_user_id("alice"))
        .await
        .unwrap();

    let requests = start_requests(&h.server).await;
    assert_eq!(requests.len(), 1);
    let body = &requests[0];
    assert_eq!(body["projectKey"], "test-project");
    assert_eq!(body["userID"], "alice");
    assert_eq!(body["timestamp"], 42);
    assert_eq!(body["reset"], false);
    assert!(body["token"].is_null());
}

#[tokio::test]
async fn test_double_start_sends_one_request() {
    let h = harness(ok_response()).await;

    let (first, second) = tokio::join!(
        h.app.start(StartOptions::default()),
        h.app.start(StartOptions::default())
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(Error::AlreadyStarted)));
    assert_eq!(start_requests(&h.server).await.len(), 1);
    assert_eq!(h.sink.count(), 0);

    // Starting an active tracker is rejected too
    let third = h.app.start(StartOptions::default()).await;
    assert!(matches!(third, Err(Error::AlreadyStarted)));
    assert_eq!(h.app.activity_state(), ActivityState::Active);
}

#[tokio::test]
async fn test_stop_leaves_no_listeners_and_empty_buffer() {
    let h = harness(ok_response()).await;
    let bus = Arc::new(EventBus::new());
    let counter = Arc::new(Mutex::new(0));

    h.app
        .attach_event_listener(bus.clone(), "click", counting_listener(counter.clone()), true, false);
    h.app
        .attach_event_listener(bus.clone(), "scroll", counting_listener(counter.clone()), false, true);
    assert_eq!(bus.listener_count(), 0);

    h.app.start(StartOptions::default()).await.unwrap();
    assert_eq!(bus.listener_count(), 2);

    bus.dispatch(&Event::new("click"));
    assert_eq!(*counter.lock().unwrap(), 1);

    h.app.send(custom("a"), false);
    h.app.send(custom("b"), false);
    assert_eq!(h.app.pending_count(), 2);

    h.app.stop();

    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(bus.listener_count(), 0);
    assert_eq!(h.app.pending_count(), 0);

    // Buffered messages went out with the final flush, before Stop
    let batches = h.transport.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].messages()[1..], [custom("a"), custom("b")]);
    assert_eq!(h.transport.controls().last(), Some(&ControlMessage::Stop));

    bus.dispatch(&Event::new("click"));
    assert_eq!(*counter.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = harness(ok_response()).await;
    let stops = Arc::new(Mutex::new(0));
    let counter = stops.clone();
    h.app.attach_stop_callback(move || {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    h.app.start(StartOptions::default()).await.unwrap();
    h.app.stop();
    h.app.stop();

    assert_eq!(*stops.lock().unwrap(), 1);
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
}

#[tokio::test]
async fn test_restart_after_stop_advances_page_counter() {
    let h = harness(ok_response()).await;

    h.app.start(StartOptions::default()).await.unwrap();
    h.app.stop();
    h.app.start(StartOptions::default()).await.unwrap();

    let requests = start_requests(&h.server).await;
    assert_eq!(requests.len(), 2);
    // The second start continues the session it negotiated before
    assert_eq!(requests[1]["token"], "t1");
    assert_eq!(requests[1]["userUUID"], "u1");

    let pages: Vec<u32> = h
        .transport
        .controls()
        .into_iter()
        .filter_map(|c| match c {
            ControlMessage::Init(p) => Some(p.page_no),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec![0, 1]);
}

// ============================================
// Negotiation failures
// ============================================

#[tokio::test]
async fn test_canceled_start_is_not_reported() {
    let h = harness(ResponseTemplate::new(403).set_body_string("canceled")).await;
    h.app.persisted().set_token("stale").unwrap();

    let err = h.app.start(StartOptions::default()).await.unwrap_err();

    assert!(err.is_canceled());
    assert_eq!(h.sink.count(), 0);
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(h.app.session_token(), None);
}

#[tokio::test]
async fn test_server_error_is_reported_once() {
    let h = harness(ResponseTemplate::new(500).set_body_string("boom")).await;

    let err = h.app.start(StartOptions::default()).await.unwrap_err();

    assert!(matches!(err, Error::Server { status: 500, ref body } if body == "boom"));
    assert_eq!(err.to_string(), "server error: 500. boom");
    let reports = h.sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "session_start");
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(h.transport.controls().last(), Some(&ControlMessage::Stop));
}

#[tokio::test]
async fn test_invalid_body_is_reported_once() {
    let h = harness(ResponseTemplate::new(200).set_body_json(json!({ "token": 7 }))).await;

    let err = h.app.start(StartOptions::default()).await.unwrap_err();

    assert!(matches!(err, Error::IncorrectResponse(_)));
    assert_eq!(h.sink.count(), 1);
    assert_eq!(h.app.persisted().user_uuid().unwrap(), None);
}

#[tokio::test]
async fn test_stop_during_negotiation_interrupts_start() {
    let h = harness(ok_response().set_delay(Duration::from_millis(300))).await;

    let app = h.app.clone();
    let pending = tokio::spawn(async move { app.start(StartOptions::default()).await });

    assert!(eventually(|| h.app.activity_state() == ActivityState::Starting).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.app.stop();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(h.sink.count(), 0);
    assert_eq!(h.app.session_token(), None);

    // The tracker is usable again afterwards
    h.app.start(StartOptions::default()).await.unwrap();
    assert!(h.app.active());
}

// ============================================
// Commit pipeline
// ============================================

#[tokio::test]
async fn test_send_outside_session_is_dropped() {
    let h = harness(ok_response()).await;

    h.app.send(custom("early"), true);
    h.app.start(StartOptions::default()).await.unwrap();
    h.app.send(custom("during"), true);
    h.app.stop();
    h.app.send(custom("late"), true);

    let sent: Vec<Message> = h
        .transport
        .batches()
        .into_iter()
        .flat_map(Batch::into_messages)
        .collect();
    assert!(sent.contains(&custom("during")));
    assert!(!sent.contains(&custom("early")));
    assert!(!sent.contains(&custom("late")));
}

#[tokio::test]
async fn test_commit_prepends_timestamp_and_shares_batch() {
    let h = harness(ok_response()).await;
    let seen: Arc<Mutex<Vec<Batch>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let seen = seen.clone();
        h.app.attach_commit_callback(move |batch| {
            seen.lock().unwrap().push(batch.clone());
            Ok(())
        });
    }

    h.app.start(StartOptions::default()).await.unwrap();
    h.app.send(custom("a"), false);
    h.app.send(custom("b"), false);
    h.app.send(custom("c"), true);

    let expected = vec![
        Message::Timestamp { timestamp: 42 },
        custom("a"),
        custom("b"),
        custom("c"),
    ];
    let batches = h.transport.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].messages(), expected.as_slice());
    assert_eq!(h.app.pending_count(), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], batches[0]);
    assert_eq!(seen[1], batches[0]);
}

/// Worker that accepts control messages and refuses every batch.
struct RefusingTransport;

impl Transport for RefusingTransport {
    fn post_control(&self, _message: ControlMessage) -> sessioncap_core::Result<()> {
        Ok(())
    }

    fn post_batch(&self, _batch: Batch) -> sessioncap_core::Result<()> {
        Err(Error::Transport("queue full".to_string()))
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<WorkerSignal>> {
        None
    }
}

/// Sink that reads the tracker back while reporting.
#[derive(Default)]
struct ReentrantSink {
    app: Mutex<Option<WeakApp>>,
    reports: Mutex<Vec<(String, bool)>>,
}

impl DiagnosticSink for ReentrantSink {
    fn report(&self, context: &str, _error: &str) {
        let app = self.app.lock().unwrap().as_ref().and_then(WeakApp::upgrade);
        let active = app.map(|app| app.active()).unwrap_or(false);
        self.reports
            .lock()
            .unwrap()
            .push((context.to_string(), active));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commit_failure_reported_without_holding_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/web/start"))
        .respond_with(ok_response())
        .mount(&server)
        .await;

    let sink = Arc::new(ReentrantSink::default());
    let config = TrackerConfig {
        ingest_point: server.uri(),
        commit_interval_ms: 60_000,
        ..Default::default()
    };
    let app = App::builder("test-project", config)
        .transport(Arc::new(RefusingTransport))
        .diagnostics(sink.clone())
        .document(Arc::new(HostDocument::with_location("https://shop.example.com/")))
        .build()
        .unwrap();
    *sink.app.lock().unwrap() = Some(app.downgrade());

    app.start(StartOptions::default()).await.unwrap();

    let sender = app.clone();
    let sent = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::task::spawn_blocking(move || sender.send(custom("urgent"), true)),
    )
    .await;

    assert!(sent.is_ok(), "urgent send did not return");
    assert_eq!(
        *sink.reports.lock().unwrap(),
        vec![("commit".to_string(), true)]
    );
    assert_eq!(app.pending_count(), 0);
}

#[tokio::test]
async fn test_start_metadata_is_sent_on_start() {
    let h = harness(ok_response()).await;

    h.app
        .start(StartOptions::default().with_metadata("plan", "pro"))
        .await
        .unwrap();
    h.app.stop();

    let batches = h.transport.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0].messages()[1],
        Message::Metadata {
            key: "plan".to_string(),
            value: "pro".to_string(),
        }
    );
    assert_eq!(
        h.app.session_info().metadata.get("plan").map(String::as_str),
        Some("pro")
    );
}

#[tokio::test]
async fn test_ticker_commits_periodically() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/web/start"))
        .respond_with(ok_response())
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::new());
    let app = App::builder(
        "test-project",
        TrackerConfig {
            ingest_point: server.uri(),
            commit_interval_ms: 20,
            ..Default::default()
        },
    )
    .transport(transport.clone())
    .build()
    .unwrap();

    app.start(StartOptions::default()).await.unwrap();
    app.send(custom("a"), false);

    assert!(eventually(|| transport.batches().len() == 1).await);
    assert_eq!(app.pending_count(), 0);
}

// ============================================
// Fault isolation
// ============================================

#[tokio::test]
async fn test_failing_listener_does_not_block_others() {
    let h = harness(ok_response()).await;
    let bus = Arc::new(EventBus::new());
    let counter = Arc::new(Mutex::new(0));

    let failing: Listener = Arc::new(|_event: &Event| -> CallbackResult { Err("listener failed".into()) });
    let panicking: Listener = Arc::new(|_event: &Event| -> CallbackResult { panic!("listener exploded") });
    h.app.attach_event_listener(bus.clone(), "input", failing, true, false);
    h.app.attach_event_listener(bus.clone(), "input", panicking, true, false);
    h.app
        .attach_event_listener(bus.clone(), "input", counting_listener(counter.clone()), true, false);

    h.app.start(StartOptions::default()).await.unwrap();
    bus.dispatch(&Event::new("input"));

    assert_eq!(*counter.lock().unwrap(), 1);
    let reports = h.sink.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|(context, _)| context == "safe_fn_call"));
    assert!(reports.iter().any(|(_, error)| error == "listener exploded"));
}

#[tokio::test]
async fn test_failing_start_callback_does_not_block_start() {
    let h = harness(ok_response()).await;
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();

    h.app.attach_start_callback(|| Err("callback failed".into()));
    h.app.attach_start_callback(move || {
        *flag.lock().unwrap() = true;
        Ok(())
    });

    h.app.start(StartOptions::default()).await.unwrap();

    assert!(*ran.lock().unwrap());
    assert!(h.app.active());
    assert_eq!(h.sink.count(), 1);
}

#[tokio::test]
async fn test_stop_from_start_callback_is_deferred() {
    let h = harness(ok_response()).await;
    let weak = h.app.downgrade();
    h.app.attach_start_callback(move || {
        if let Some(app) = weak.upgrade() {
            app.stop();
        }
        Ok(())
    });

    let info = h.app.start(StartOptions::default()).await;

    assert!(info.is_ok());
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(h.transport.controls().last(), Some(&ControlMessage::Stop));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_from_another_thread_waits_for_arming() {
    let h = harness(ok_response()).await;
    let bus = Arc::new(EventBus::new());
    let armed = Arc::new(Mutex::new(false));

    let flag = armed.clone();
    h.app.attach_start_callback(move || {
        std::thread::sleep(Duration::from_millis(300));
        *flag.lock().unwrap() = true;
        Ok(())
    });
    h.app.attach_event_listener(
        bus.clone(),
        "click",
        counting_listener(Arc::new(Mutex::new(0))),
        true,
        false,
    );
    let stops = Arc::new(Mutex::new(0));
    let counter = stops.clone();
    h.app.attach_stop_callback(move || {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    let app = h.app.clone();
    let pending = tokio::spawn(async move { app.start(StartOptions::default()).await });
    assert!(eventually(|| h.app.activity_state() == ActivityState::Active).await);

    let app = h.app.clone();
    tokio::task::spawn_blocking(move || app.stop()).await.unwrap();

    // Teardown is complete by the time stop returns
    assert!(*armed.lock().unwrap());
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(bus.listener_count(), 0);
    assert_eq!(*stops.lock().unwrap(), 1);
    h.app.send(custom("after-stop"), false);
    assert_eq!(h.app.pending_count(), 0);

    assert!(pending.await.unwrap().is_ok());
    assert_eq!(h.transport.controls().last(), Some(&ControlMessage::Stop));
    assert_eq!(h.sink.count(), 0);
}

// ============================================
// Host integration
// ============================================

#[tokio::test]
async fn test_hidden_document_defers_start() {
    let h = harness(ok_response()).await;
    h.document.set_hidden(true);

    let app = h.app.clone();
    let pending = tokio::spawn(async move { app.start(StartOptions::default()).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(start_requests(&h.server).await.is_empty());
    assert_eq!(h.app.activity_state(), ActivityState::Starting);

    h.document.set_hidden(false);
    pending.await.unwrap().expect("start once visible");

    assert_eq!(start_requests(&h.server).await.len(), 1);
    assert!(h.app.active());
}

#[tokio::test]
async fn test_stop_while_hidden_interrupts_start() {
    let h = harness(ok_response()).await;
    h.document.set_hidden(true);

    let app = h.app.clone();
    let pending = tokio::spawn(async move { app.start(StartOptions::default()).await });
    assert!(eventually(|| h.app.activity_state() == ActivityState::Starting).await);

    h.app.stop();
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);

    h.document.set_hidden(false);
    let result = pending.await.unwrap();

    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(start_requests(&h.server).await.is_empty());
    assert_eq!(h.app.activity_state(), ActivityState::NotActive);
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn test_unload_events_send_heartbeat() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/web/start"))
        .respond_with(ok_response())
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::new());
    let window = Arc::new(EventBus::new());
    let document = Arc::new(EventBus::new());
    let app = App::builder(
        "test-project",
        TrackerConfig {
            ingest_point: server.uri(),
            ..Default::default()
        },
    )
    .transport(transport.clone())
    .host_events(window.clone(), document.clone())
    .build()
    .unwrap();

    app.start(StartOptions::default()).await.unwrap();
    assert_eq!(window.listener_count_for("beforeunload"), 1);
    assert_eq!(document.listener_count_for("mouseleave"), 1);
    assert_eq!(document.listener_count_for("visibilitychange"), 1);

    window.dispatch(&Event::new("beforeunload"));
    document.dispatch(&Event::new("visibilitychange"));

    let heartbeats = transport
        .controls()
        .into_iter()
        .filter(|c| *c == ControlMessage::Heartbeat)
        .count();
    assert_eq!(heartbeats, 2);

    app.stop();
    assert_eq!(window.listener_count(), 0);
    assert_eq!(document.listener_count(), 0);
}

#[tokio::test]
async fn test_reset_next_page_session_forces_new_session() {
    let h = harness(ok_response()).await;
    h.app.reset_next_page_session(true).unwrap();

    h.app.start(StartOptions::default()).await.unwrap();
    h.app.stop();
    h.app.start(StartOptions::default()).await.unwrap();

    let requests = start_requests(&h.server).await;
    assert_eq!(requests[0]["reset"], true);
    assert_eq!(requests[1]["reset"], false);
}

#[test]
fn test_instances_share_only_the_user_uuid() {
    let durable = Arc::new(MemoryStorage::new());
    let first = PersistedState::new(
        StorageKeys::default(),
        Arc::new(MemoryStorage::new()),
        durable.clone(),
    );
    let second = PersistedState::new(
        StorageKeys::default(),
        Arc::new(MemoryStorage::new()),
        durable,
    );
    first.set_token("tab-1").unwrap();
    first.set_user_uuid("u-shared").unwrap();

    assert_eq!(second.token().unwrap(), None);
    assert_eq!(second.user_uuid().unwrap().as_deref(), Some("u-shared"));
}

// ============================================
// Worker signals
// ============================================

#[tokio::test]
async fn test_restart_signal_negotiates_new_session() {
    let h = harness(ok_response()).await;
    h.app
        .start(
            StartOptions::default()
                .with_user_id("alice")
                .with_metadata("plan", "pro"),
        )
        .await
        .unwrap();

    h.transport.signal(WorkerSignal::Restart);

    let server = &h.server;
    let mut restarted = false;
    for _ in 0..200 {
        if start_requests(server).await.len() == 2 && h.app.active() {
            restarted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(restarted, "restart did not negotiate a second session");

    let requests = start_requests(&h.server).await;
    assert_eq!(requests[1]["reset"], true);
    assert_eq!(requests[1]["userID"], "alice");
    assert_eq!(
        h.app.session_info().metadata.get("plan").map(String::as_str),
        Some("pro")
    );
}

#[tokio::test]
async fn test_stop_signal_stops_tracking() {
    let h = harness(ok_response()).await;
    h.app.start(StartOptions::default()).await.unwrap();

    h.transport.signal(WorkerSignal::Stop);

    assert!(eventually(|| h.app.activity_state() == ActivityState::NotActive).await);
    assert_eq!(start_requests(&h.server).await.len(), 1);
}

#[test]
fn test_listener_registrations_are_by_handle() {
    let bus = EventBus::new();
    let counter = Arc::new(Mutex::new(0));
    let listener = counting_listener(counter.clone());

    bus.add_listener("click", listener.clone(), false);
    bus.add_listener("click", listener.clone(), false);
    bus.add_listener("click", counting_listener(counter.clone()), false);
    assert_eq!(bus.listener_count(), 2);

    bus.remove_listener("click", &listener, false);
    assert_eq!(bus.listener_count(), 1);
}

// ============================================
// Observer and start hook
// ============================================

#[derive(Default)]
struct RecordingObserver {
    calls: Mutex<Vec<&'static str>>,
}

impl Observer for RecordingObserver {
    fn observe(&self, app: WeakApp) {
        self.calls.lock().unwrap().push("observe");
        if let Some(app) = app.upgrade() {
            app.send(custom("first-paint"), false);
        }
    }

    fn disconnect(&self) {
        self.calls.lock().unwrap().push("disconnect");
    }

    fn clear_content(&self) {
        self.calls.lock().unwrap().push("clear_content");
    }

    fn clear_nodes(&self) {
        self.calls.lock().unwrap().push("clear_nodes");
    }
}

#[tokio::test]
async fn test_observer_is_armed_and_torn_down_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/web/start"))
        .respond_with(ok_response())
        .mount(&server)
        .await;
    let transport = Arc::new(RecordingTransport::new());
    let observer = Arc::new(RecordingObserver::default());
    let hook_seen: Arc<Mutex<Vec<OnStartInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let hook_log = hook_seen.clone();

    let app = App::builder(
        "test-project",
        TrackerConfig {
            ingest_point: server.uri(),
            commit_interval_ms: 60_000,
            ..Default::default()
        },
    )
    .transport(transport.clone())
    .observer(observer.clone())
    .on_start(Arc::new(move |info: &OnStartInfo| {
        hook_log.lock().unwrap().push(info.clone());
    }))
    .build()
    .unwrap();

    let info = app.start(StartOptions::default()).await.unwrap();
    assert_eq!(*observer.calls.lock().unwrap(), vec!["observe"]);
    assert_eq!(*hook_seen.lock().unwrap(), vec![info]);

    app.stop();
    assert_eq!(
        *observer.calls.lock().unwrap(),
        vec!["observe", "clear_content", "disconnect", "clear_nodes"]
    );

    let batches = transport.batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].messages().contains(&custom("first-paint")));
}
