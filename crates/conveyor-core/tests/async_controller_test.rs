#![allow(clippy::unwrap_used)]
// Integration tests for the cooperative `AsyncController`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use conveyor_client::{
    Backend, BoxError, Client, ClientRegistry, ConnectParams, ConnectState, Executable,
    FetchMode, ParamMap, QueryParams, Settings, SqliteClient,
};
use conveyor_core::{
    AsyncController, AsyncEventMap, ControllerConfig, CoreError, HandlerResult, ListenState,
    Message,
};

// ── Helpers ─────────────────────────────────────────────────────────

type Seen = Arc<Mutex<Vec<String>>>;

fn config(dir: &TempDir) -> ControllerConfig {
    let settings = Settings::new().with(
        "DB_PATH",
        dir.path().join("app.db").to_string_lossy().into_owned(),
    );
    ControllerConfig::default()
        .with_settings(settings)
        .with_idle_backoff(Duration::from_millis(20))
        .with_refresh_backoff(Duration::from_millis(5))
}

fn registry() -> ClientRegistry {
    let mut registry = ClientRegistry::new();
    registry.sqlite("db").unwrap();
    registry
}

fn recording_events(seen: &Seen) -> AsyncEventMap {
    let record = Arc::clone(seen);
    AsyncEventMap::builder()
        .on("record", move |_, message: Message| {
            let record = Arc::clone(&record);
            async move {
                let tag = message.field("tag").and_then(|v| v.as_str()).unwrap_or("?");
                record.lock().unwrap().push(tag.to_owned());
                HandlerResult::Ok(())
            }
        })
        .on("boom", |_, message: Message| async move {
            assert!(message.field("tag").is_some(), "handler exploded");
            HandlerResult::Ok(())
        })
        .build()
}

fn record(tag: &str) -> Message {
    Message::new("/jobs/record", json!({ "tag": tag }))
}

fn spawn_start(controller: &AsyncController) -> JoinHandle<Result<(), CoreError>> {
    let controller = controller.clone();
    tokio::spawn(async move { controller.start().await })
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polled)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn wait_listening(controller: &AsyncController) {
    let mut states = controller.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ListenState::Listening),
    )
    .await
    .unwrap()
    .unwrap();
}

/// Opens without trouble, but every release fails.
struct StickyBackend {
    opens: Arc<AtomicUsize>,
}

impl Backend for StickyBackend {
    type Connection = ();

    const KIND: &'static str = "sticky";

    fn param_map(&self, _prefix: &str) -> ParamMap {
        ParamMap::default()
    }

    fn open(&self, _params: &ConnectParams) -> Result<(), BoxError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, (): ()) -> Result<(), BoxError> {
        Err("socket refused to close".into())
    }
}

async fn stop_and_join(controller: &AsyncController, runner: JoinHandle<Result<(), CoreError>>) {
    controller.stop().await.unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(controller.state(), ListenState::Closed);
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_stream_follows_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let controller =
        AsyncController::new(config(&dir), &registry(), AsyncEventMap::default()).unwrap();
    let mut stream = controller.state_stream();
    assert_eq!(stream.next().await, Some(ListenState::Closed));

    let runner = spawn_start(&controller);
    wait_listening(&controller).await;
    assert_eq!(controller.clients().states(), vec![("db".to_owned(), ConnectState::Open)]);

    stop_and_join(&controller, runner).await;
    assert_eq!(stream.next().await, Some(ListenState::Closed));
    assert_eq!(controller.clients().states(), vec![("db".to_owned(), ConnectState::Closed)]);
}

#[tokio::test]
async fn test_refresh_on_closed_controller_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let controller =
        AsyncController::new(config(&dir), &registry(), AsyncEventMap::default()).unwrap();

    tokio_test::assert_ok!(controller.listen().await);
    let err = tokio_test::assert_err!(controller.refresh().await);
    assert!(matches!(err, CoreError::InvalidState { operation: "refresh", .. }));
}

#[tokio::test]
async fn test_start_failure_stays_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(&dir);
    cfg.settings.insert("DB_PATH", dir.path().join("absent.db").to_string_lossy().into_owned());
    cfg.settings.insert("DB_READ_ONLY", "true");
    let controller = AsyncController::new(cfg, &registry(), AsyncEventMap::default()).unwrap();

    let err = controller.start().await.unwrap_err();
    assert!(err.is_connection(), "expected connection error, got: {err:?}");
    assert_eq!(controller.state(), ListenState::Closed);
}

// ── Dispatch ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_priority_order_and_panic_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let controller =
        AsyncController::new(config(&dir), &registry(), recording_events(&seen)).unwrap();

    controller.enqueue(record("A"), 5).await;
    controller.enqueue(Message::new("/jobs/boom", json!({})), 3).await;
    controller.enqueue(record("B"), 1).await;
    controller.enqueue(record("C"), 5).await;
    controller.enqueue(Message::new("/x/unknown", json!({})), 0).await;

    let runner = spawn_start(&controller);
    wait_for("five messages", || controller.stats().settled() == 5).await;

    let stats = controller.stats();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.unroutable, 1);
    assert_eq!(*seen.lock().unwrap(), ["B", "A", "C"]);
    assert_eq!(controller.state(), ListenState::Listening);

    stop_and_join(&controller, runner).await;
}

#[tokio::test]
async fn test_wakes_on_enqueue_before_idle_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let cfg = config(&dir).with_idle_backoff(Duration::from_secs(30));
    let controller = AsyncController::new(cfg, &registry(), recording_events(&seen)).unwrap();
    let runner = spawn_start(&controller);
    wait_listening(&controller).await;

    controller.enqueue(record("prompt"), 1).await;
    wait_for("prompt dispatch", || controller.stats().settled() == 1).await;

    // stop interrupts the long backoff instead of waiting it out
    tokio::time::timeout(Duration::from_secs(5), stop_and_join(&controller, runner))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handlers_run_blocking_client_io() {
    let dir = tempfile::tempdir().unwrap();
    let events = AsyncEventMap::builder()
        .on("exec", |ctx, message: Message| async move {
            let sql = message
                .field("sql")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            ctx.blocking(move |clients| {
                let db = clients.typed::<SqliteClient>("db")?;
                db.execute(&sql, &QueryParams::none(), FetchMode::None)?;
                Ok(())
            })
            .await
        })
        .build();
    let controller = AsyncController::new(config(&dir), &registry(), events).unwrap();
    let runner = spawn_start(&controller);
    wait_listening(&controller).await;

    for sql in [
        "CREATE TABLE audit (note TEXT)",
        "INSERT INTO audit VALUES ('one')",
    ] {
        controller
            .enqueue(Message::new("/db/exec", json!({ "sql": sql })), 999)
            .await;
    }
    wait_for("two statements", || controller.stats().settled() == 2).await;
    assert_eq!(controller.stats().dispatched, 2);

    let db = controller.clients().typed::<SqliteClient>("db").unwrap();
    let rows = db
        .execute("SELECT note FROM audit", &QueryParams::none(), FetchMode::All)
        .unwrap();
    assert_eq!(rows.to_json(), json!([{ "note": "one" }]));

    stop_and_join(&controller, runner).await;
}

#[tokio::test]
async fn test_handler_can_stop_its_controller() {
    let dir = tempfile::tempdir().unwrap();
    let slot: Arc<OnceLock<AsyncController>> = Arc::default();
    let events = {
        let slot = Arc::clone(&slot);
        AsyncEventMap::builder()
            .on("shutdown", move |_, _| {
                let controller = slot.get().cloned();
                async move {
                    controller.ok_or("controller not set")?.stop().await?;
                    HandlerResult::Ok(())
                }
            })
            .build()
    };
    let controller = AsyncController::new(config(&dir), &registry(), events).unwrap();
    slot.set(controller.clone()).unwrap();

    controller.enqueue(Message::new("/ops/shutdown", json!({})), 1).await;
    tokio::time::timeout(Duration::from_secs(5), controller.start())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(controller.state(), ListenState::Closed);
    assert_eq!(controller.stats().dispatched, 1);
}

// ── Refresh & delayed enqueue ───────────────────────────────────────

#[tokio::test]
async fn test_refresh_pauses_dispatch_and_keeps_queued_messages() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let dispatch_states: Arc<Mutex<Vec<ListenState>>> = Arc::default();
    let slot: Arc<OnceLock<AsyncController>> = Arc::default();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let events = {
        let seen = Arc::clone(&seen);
        let dispatch_states = Arc::clone(&dispatch_states);
        let slot = Arc::clone(&slot);
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        AsyncEventMap::builder()
            .on("hold", move |_, _| {
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                async move {
                    entered.notify_one();
                    release.notified().await;
                    HandlerResult::Ok(())
                }
            })
            .on("record", move |_, message: Message| {
                let state = slot.get().map(AsyncController::state);
                let seen = Arc::clone(&seen);
                let dispatch_states = Arc::clone(&dispatch_states);
                async move {
                    dispatch_states.lock().unwrap().extend(state);
                    let tag = message.field("tag").and_then(|v| v.as_str()).unwrap_or("?");
                    seen.lock().unwrap().push(tag.to_owned());
                    HandlerResult::Ok(())
                }
            })
            .build()
    };
    let controller = AsyncController::new(config(&dir), &registry(), events).unwrap();
    slot.set(controller.clone()).unwrap();
    let runner = spawn_start(&controller);
    wait_listening(&controller).await;

    // keep one handler in flight while the rest queue up behind it
    controller.enqueue(Message::new("/jobs/hold", json!({})), 1).await;
    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();
    controller.enqueue(record("c"), 20).await;
    controller.enqueue(record("a"), 10).await;
    controller.enqueue(record("b"), 10).await;

    let refresher = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.refresh().await })
    };
    wait_for("REFRESH", || controller.state() == ListenState::Refresh).await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(controller.queue().len(), 3);

    release.notify_one();
    refresher.await.unwrap().unwrap();
    assert_eq!(controller.clients().states(), vec![("db".to_owned(), ConnectState::Open)]);

    wait_for("queued messages after refresh", || controller.stats().settled() == 4).await;
    assert_eq!(*seen.lock().unwrap(), ["a", "b", "c"]);
    let observed = dispatch_states.lock().unwrap().clone();
    assert_eq!(observed, vec![ListenState::Listening; 3]);

    stop_and_join(&controller, runner).await;
}

#[tokio::test]
async fn test_refresh_reports_close_failure() {
    let opens = Arc::new(AtomicUsize::new(0));
    let mut registry = ClientRegistry::new();
    {
        let opens = Arc::clone(&opens);
        registry
            .register("sticky", move |name, settings| {
                Client::from_settings(name, StickyBackend { opens: Arc::clone(&opens) }, settings)
            })
            .unwrap();
    }
    let cfg = ControllerConfig::default()
        .with_idle_backoff(Duration::from_millis(20))
        .with_refresh_backoff(Duration::from_millis(5));
    let controller = AsyncController::new(cfg, &registry, AsyncEventMap::default()).unwrap();
    let runner = spawn_start(&controller);
    wait_listening(&controller).await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    let err = tokio_test::assert_err!(controller.refresh().await);
    assert!(err.is_connection(), "expected connection error, got: {err:?}");
    assert!(err.to_string().contains("socket refused to close"));
    assert_eq!(controller.state(), ListenState::Refresh);
    assert_eq!(opens.load(Ordering::SeqCst), 1, "no reconnect after a failed close");

    stop_and_join(&controller, runner).await;
}

#[tokio::test]
async fn test_enqueue_after_delivers_later() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let controller =
        AsyncController::new(config(&dir), &registry(), recording_events(&seen)).unwrap();
    let runner = spawn_start(&controller);
    wait_listening(&controller).await;

    let pending = controller.enqueue_after(record("late"), 1, Duration::from_millis(30));
    assert!(controller.queue().is_empty());
    pending.await.unwrap();
    wait_for("delayed dispatch", || controller.stats().settled() == 1).await;
    assert_eq!(*seen.lock().unwrap(), ["late"]);

    stop_and_join(&controller, runner).await;
}

#[tokio::test]
async fn test_enqueue_after_is_dropped_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let controller =
        AsyncController::new(config(&dir), &registry(), recording_events(&seen)).unwrap();
    let runner = spawn_start(&controller);
    wait_listening(&controller).await;

    let pending = controller.enqueue_after(record("never"), 1, Duration::from_secs(30));
    stop_and_join(&controller, runner).await;

    tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(controller.queue().is_empty());
    assert!(seen.lock().unwrap().is_empty());
}
