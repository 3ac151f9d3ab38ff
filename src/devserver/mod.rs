use crate::api::{CreateDownloadRequest, DownloadTask};
use crate::channel::CLOSE_NORMAL;
use crate::config::DevBackendConfig;
use crate::model::DownloadStatus;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevServerOptions {
    pub progress_interval: Duration,
    pub server_ping_interval: Duration,
    pub drop_after_frames: Option<u32>,
}

impl Default for DevServerOptions {
    fn default() -> Self {
        Self::from_config(&DevBackendConfig::default())
    }
}

impl DevServerOptions {
    pub fn from_config(config: &DevBackendConfig) -> Self {
        Self {
            progress_interval: Duration::from_millis(config.progress_interval_ms.max(1)),
            server_ping_interval: Duration::from_millis(config.server_ping_interval_ms.max(1)),
            drop_after_frames: config.drop_after_frames.filter(|frames| *frames > 0),
        }
    }
}

#[derive(Clone)]
struct DevState {
    tasks: Arc<Mutex<HashMap<String, DownloadTask>>>,
    options: DevServerOptions,
}

impl DevState {
    fn tasks(&self) -> MutexGuard<'_, HashMap<String, DownloadTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self, task_id: &str) -> Option<DownloadTask> {
        self.tasks().get(task_id).cloned()
    }

    /// Moves a task one simulated step forward. `false` once it is finished.
    fn advance(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(task_id) else {
            return false;
        };
        match task.status {
            DownloadStatus::Pending => task.status = DownloadStatus::Downloading,
            DownloadStatus::Downloading => {
                let step: f64 = rand::thread_rng().gen_range(8.0..=25.0);
                task.progress = (task.progress + step).min(100.0);
                if task.progress >= 100.0 {
                    task.status = DownloadStatus::Processing;
                }
            }
            DownloadStatus::Processing => {
                task.status = DownloadStatus::Complete;
                task.output_path = Some(format!("downloads/{task_id}.zip"));
            }
            DownloadStatus::Complete
            | DownloadStatus::Error
            | DownloadStatus::Cancelled
            | DownloadStatus::Other => return false,
        }
        task.updated_at = Some(now_stamp());
        true
    }
}

pub fn router(options: DevServerOptions) -> Router {
    let state = DevState {
        tasks: Arc::new(Mutex::new(HashMap::new())),
        options,
    };
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/downloads/", post(create_download))
        .route(
            "/api/v1/downloads/:task_id",
            get(get_download).delete(cancel_download),
        )
        .route("/api/v1/downloads/:task_id/ws", get(task_channel))
        .with_state(state)
}

pub async fn serve<F>(
    listener: TcpListener,
    options: DevServerOptions,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "dev backend listening");
    }
    axum::serve(listener, router(options))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn create_download(
    State(state): State<DevState>,
    Json(request): Json<CreateDownloadRequest>,
) -> Response {
    let url = request.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("unsupported url: {url}") })),
        )
            .into_response();
    }

    let id = Uuid::new_v4().to_string();
    let stamp = now_stamp();
    let task = DownloadTask {
        id: id.clone(),
        url: url.to_string(),
        title: format!("Playlist {}", &id[..8]),
        author: "dev-backend".to_string(),
        status: DownloadStatus::Pending,
        progress: 0.0,
        error: None,
        created_at: Some(stamp.clone()),
        updated_at: Some(stamp),
        quality: request.quality,
        output_path: None,
    };
    state.tasks().insert(id.clone(), task.clone());
    tracing::info!(task_id = %id, url = %task.url, "created download task");

    tokio::spawn(simulate(state.clone(), id.clone()));

    let mut body = serde_json::to_value(&task).unwrap_or_else(|_| json!({}));
    body["task_id"] = Value::from(id);
    (StatusCode::OK, Json(body)).into_response()
}

async fn get_download(State(state): State<DevState>, Path(task_id): Path<String>) -> Response {
    match state.snapshot(&task_id) {
        Some(task) => Json(task).into_response(),
        None => not_found("Task not found"),
    }
}

async fn cancel_download(State(state): State<DevState>, Path(task_id): Path<String>) -> Response {
    let cancelled = {
        let mut tasks = state.tasks();
        match tasks.get_mut(&task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = DownloadStatus::Cancelled;
                task.updated_at = Some(now_stamp());
                true
            }
            _ => false,
        }
    };
    if cancelled {
        tracing::info!(task_id = %task_id, "cancelled download task");
        Json(json!({ "message": "Task cancelled successfully" })).into_response()
    } else {
        not_found("Task not found or already completed")
    }
}

fn not_found(detail: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
}

async fn simulate(state: DevState, task_id: String) {
    let mut ticker = interval(state.options.progress_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !state.advance(&task_id) {
            break;
        }
    }
}

async fn task_channel(
    State(state): State<DevState>,
    Path(task_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_channel(socket, state, task_id))
}

async fn run_channel(mut socket: WebSocket, state: DevState, task_id: String) {
    let Some(task) = state.snapshot(&task_id) else {
        let error = json!({ "error": format!("Task {task_id} not found") });
        let _ = socket.send(Message::Text(error.to_string())).await;
        let _ = close(&mut socket, "unknown task").await;
        return;
    };
    tracing::debug!(task_id = %task_id, "task channel accepted");

    let greeting = json!({ "type": "connection_status", "status": "connected", "task_id": task_id });
    if socket.send(Message::Text(greeting.to_string())).await.is_err()
        || socket
            .send(Message::Text(status_frame(&task).to_string()))
            .await
            .is_err()
    {
        return;
    }
    if task.status.is_terminal() {
        let _ = close(&mut socket, "task finished").await;
        return;
    }

    let mut last_sent = (task.status, task.progress);
    let mut progress = interval(state.options.progress_interval);
    progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
    progress.tick().await;
    let ping_period = state.options.server_ping_interval;
    let mut pings = interval_at(Instant::now() + ping_period, ping_period);
    let mut frames_sent = 0u32;

    loop {
        tokio::select! {
            _ = progress.tick() => {
                let Some(task) = state.snapshot(&task_id) else {
                    break;
                };
                let current = (task.status.clone(), task.progress);
                if current == last_sent {
                    continue;
                }
                last_sent = current;
                if socket.send(Message::Text(status_frame(&task).to_string())).await.is_err() {
                    break;
                }
                frames_sent += 1;
                if task.status.is_terminal() {
                    let _ = close(&mut socket, "task finished").await;
                    break;
                }
                if state.options.drop_after_frames == Some(frames_sent) {
                    tracing::info!(task_id = %task_id, frames_sent, "dropping channel without close frame");
                    return;
                }
            }
            _ = pings.tick() => {
                let ping = json!({ "type": "ping", "timestamp": unix_seconds() });
                if socket.send(Message::Text(ping.to_string())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = reply_to(&state, &task_id, &text) {
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(task_id = %task_id, "task channel finished");
}

async fn close(socket: &mut WebSocket, reason: &'static str) -> Result<(), axum::Error> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: reason.into(),
        })))
        .await
}

fn reply_to(state: &DevState, task_id: &str, text: &str) -> Option<Value> {
    let frame: Value = serde_json::from_str(text).ok()?;
    match frame.get("type").and_then(Value::as_str) {
        Some("hello") => Some(json!({
            "type": "hello_ack",
            "task_id": task_id,
            "timestamp": unix_seconds(),
        })),
        Some("ping") => Some(json!({
            "type": "pong",
            "timestamp": frame.get("timestamp").cloned().unwrap_or(Value::Null),
            "server_timestamp": unix_seconds(),
        })),
        Some("pong") => None,
        _ => state.snapshot(task_id).map(|task| status_frame(&task)),
    }
}

fn status_frame(task: &DownloadTask) -> Value {
    json!({
        "id": task.id,
        "status": task.status.as_str(),
        "progress": task.progress,
        "title": task.title,
        "author": task.author,
        "error": task.error,
    })
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

fn now_stamp() -> String {
    format!("{:.3}", unix_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, DownloadsClient};
    use crate::model::{ConnectionState, StatusEvent, TaskFrame};
    use crate::updates::{ChannelPolicy, TaskUpdateClient};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn fast_options(drop_after_frames: Option<u32>) -> DevServerOptions {
        DevServerOptions {
            progress_interval: Duration::from_millis(20),
            server_ping_interval: Duration::from_millis(50),
            drop_after_frames,
        }
    }

    async fn start(options: DevServerOptions) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, options, std::future::pending()));
        addr
    }

    fn api(addr: SocketAddr) -> DownloadsClient {
        DownloadsClient::new(format!("http://{addr}/api/v1")).unwrap()
    }

    fn updates(api: &DownloadsClient) -> TaskUpdateClient {
        TaskUpdateClient::builder(api.channel_base_url().unwrap())
            .policy(ChannelPolicy {
                hello_delay: Duration::from_millis(10),
                backoff_base: Duration::from_millis(20),
                backoff_max: Duration::from_millis(100),
                ..ChannelPolicy::default()
            })
            .spawn()
    }

    async fn until_terminal(frames: &mut mpsc::UnboundedReceiver<TaskFrame>) -> Vec<TaskFrame> {
        let mut seen = Vec::new();
        loop {
            let frame = timeout(Duration::from_secs(10), frames.recv())
                .await
                .expect("no terminal frame within 10s")
                .expect("update feed closed");
            let done = frame.is_terminal_status();
            seen.push(frame);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn replies_follow_the_channel_protocol() {
        let state = DevState {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            options: DevServerOptions::default(),
        };

        let ack = reply_to(&state, "t1", r#"{"type":"hello","task_id":"t1","timestamp":5}"#)
            .unwrap();
        assert_eq!(ack["type"], "hello_ack");
        assert_eq!(ack["task_id"], "t1");

        let pong = reply_to(&state, "t1", r#"{"type":"ping","timestamp":123,"task_id":"t1"}"#)
            .unwrap();
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 123);

        assert!(reply_to(&state, "t1", r#"{"type":"pong"}"#).is_none());
        assert!(reply_to(&state, "t1", "garbage").is_none());
        // Unknown task: nothing to report.
        assert!(reply_to(&state, "t1", r#"{"type":"status"}"#).is_none());
    }

    #[test]
    fn simulation_walks_through_every_status() {
        let state = DevState {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            options: DevServerOptions::default(),
        };
        state.tasks().insert(
            "t1".to_string(),
            DownloadTask {
                id: "t1".to_string(),
                url: "https://youtu.be/x".to_string(),
                title: String::new(),
                author: String::new(),
                status: DownloadStatus::Pending,
                progress: 0.0,
                error: None,
                created_at: None,
                updated_at: None,
                quality: None,
                output_path: None,
            },
        );

        let mut statuses = Vec::new();
        while state.advance("t1") {
            statuses.push(state.snapshot("t1").unwrap().status);
        }
        assert_eq!(statuses.first(), Some(&DownloadStatus::Downloading));
        assert!(statuses.contains(&DownloadStatus::Processing));
        assert_eq!(statuses.last(), Some(&DownloadStatus::Complete));
        let task = state.snapshot("t1").unwrap();
        assert_eq!(task.progress, 100.0);
        assert!(task.output_path.is_some());
        assert!(!state.advance("missing"));
    }

    #[tokio::test]
    async fn rest_endpoints_create_read_and_cancel() {
        let addr = start(fast_options(None)).await;
        let api = api(addr);

        let task = api
            .create_download("https://www.youtube.com/playlist?list=PL1", Some("192k"))
            .await
            .unwrap();
        assert_eq!(task.status, DownloadStatus::Pending);
        assert_eq!(task.quality.as_deref(), Some("192k"));

        let fetched = api.get_download(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);

        assert!(api.cancel_download(&task.id).await.unwrap());
        assert!(!api.cancel_download(&task.id).await.unwrap());
        assert_eq!(
            api.get_download(&task.id).await.unwrap().unwrap().status,
            DownloadStatus::Cancelled
        );

        assert!(api.get_download("missing").await.unwrap().is_none());
        match api.create_download("ftp://nope", None).await {
            Err(ApiError::Api { status, .. }) => assert_eq!(status.as_u16(), 400),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_streams_progress_until_complete() {
        let addr = start(fast_options(None)).await;
        let api = api(addr);
        let client = updates(&api);
        let task = api
            .create_download("https://open.spotify.com/playlist/abc", None)
            .await
            .unwrap();

        let (tx, mut frames) = mpsc::unbounded_channel();
        let (status_tx, mut statuses) = mpsc::unbounded_channel();
        client
            .subscribe_with_status(
                &task.id,
                move |frame| {
                    let _ = tx.send(frame);
                },
                move |event| {
                    let _ = status_tx.send(event);
                },
            )
            .await
            .unwrap();
        assert_eq!(client.connection_state(&task.id), ConnectionState::Connected);

        let seen = until_terminal(&mut frames).await;
        let last = seen.last().unwrap();
        assert_eq!(last.status(), Some("complete"));
        assert_eq!(last.progress(), Some(100.0));
        assert!(seen.iter().all(|frame| frame.kind().is_none()));

        let mut reported = Vec::new();
        while let Ok(event) = statuses.try_recv() {
            reported.push(event);
        }
        assert!(reported.contains(&StatusEvent::Reported("connected".to_string())));

        client.unsubscribe(&task.id);
        assert!(!client.is_subscribed(&task.id));
    }

    #[tokio::test]
    async fn abrupt_drops_are_recovered_by_reconnecting() {
        let addr = start(fast_options(Some(2))).await;
        let api = api(addr);
        let client = updates(&api);
        let task = api
            .create_download("https://www.youtube.com/watch?v=abc", None)
            .await
            .unwrap();

        let (tx, mut frames) = mpsc::unbounded_channel();
        let states = Arc::new(Mutex::new(Vec::new()));
        let log = states.clone();
        client
            .subscribe_with_status(
                &task.id,
                move |frame| {
                    let _ = tx.send(frame);
                },
                move |event| {
                    if let StatusEvent::State(state) = event {
                        log.lock().unwrap().push(state);
                    }
                },
            )
            .await
            .unwrap();

        let seen = until_terminal(&mut frames).await;
        assert_eq!(seen.last().unwrap().status(), Some("complete"));

        let states = states.lock().unwrap().clone();
        let connects = states
            .iter()
            .filter(|state| **state == ConnectionState::Connected)
            .count();
        assert!(connects > 1, "expected a reconnect, saw {states:?}");
        assert!(states.contains(&ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn unknown_task_channel_reports_error_and_closes_normally() {
        let addr = start(fast_options(None)).await;
        let api = api(addr);
        let client = updates(&api);

        let (tx, mut frames) = mpsc::unbounded_channel();
        client
            .subscribe("ghost", move |frame| {
                let _ = tx.send(frame);
            })
            .await
            .unwrap();

        let frame = timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.error(), Some("Task ghost not found"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.connection_state("ghost") != ConnectionState::Disconnected {
            assert!(Instant::now() < deadline, "channel never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_subscribed("ghost"));
    }
}
