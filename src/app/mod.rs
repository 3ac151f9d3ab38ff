use crate::api::DownloadsClient;
use crate::config::Config;
use crate::model::{ConnectionState, StatusEvent, TaskFrame};
use crate::updates::{EnvironmentSignal, TaskUpdateClient};
use std::time::Duration;
use tokio::sync::mpsc;

const USAGE: &str = "usage: playlist-task-client <command>
  watch <task_id>         follow a task until it finishes
  submit <url> [quality]  create a download and follow it
  status <task_id>        print the task as the backend reports it
  cancel <task_id>        cancel a running task
  config-init             write the default config file

While following a task, SIGUSR1 tells the client the network is back.";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "watch" {
            return handle_watch(&config).await;
        }
        if command == "submit" {
            return handle_submit(&config).await;
        }
        if command == "status" {
            return handle_status(&config).await;
        }
        if command == "cancel" {
            return handle_cancel(&config).await;
        }
        return Err(format!("unknown command {command:?}\n{USAGE}").into());
    }

    println!("{USAGE}");
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_watch(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let task_id = std::env::args()
        .nth(2)
        .ok_or("missing task_id (usage: watch <task_id>)")?;
    let api = build_downloads_client(config)?;
    let updates = build_update_client(config, &api)?;
    let result = follow_task(&updates, &task_id).await;
    updates.shutdown().await;
    result
}

async fn handle_submit(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let url = args
        .next()
        .ok_or("missing url (usage: submit <url> [quality])")?;
    let quality = args.next();

    let api = build_downloads_client(config)?;
    let task = api.create_download(&url, quality.as_deref()).await?;
    tracing::info!(task_id = %task.id, url = %task.url, "download submitted");
    println!("{}", task.id);

    let updates = build_update_client(config, &api)?;
    let result = follow_task(&updates, &task.id).await;
    updates.shutdown().await;
    if result.is_ok() {
        println!("archive: {}", api.file_url(&task.id)?);
    }
    result
}

async fn handle_status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let task_id = std::env::args()
        .nth(2)
        .ok_or("missing task_id (usage: status <task_id>)")?;
    let api = build_downloads_client(config)?;
    match api.get_download(&task_id).await? {
        Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
        None => return Err(format!("task {task_id} not found").into()),
    }
    Ok(())
}

async fn handle_cancel(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let task_id = std::env::args()
        .nth(2)
        .ok_or("missing task_id (usage: cancel <task_id>)")?;
    let api = build_downloads_client(config)?;
    if api.cancel_download(&task_id).await? {
        println!("cancelled {task_id}");
        Ok(())
    } else {
        Err(format!("task {task_id} not found or already finished").into())
    }
}

fn build_downloads_client(config: &Config) -> Result<DownloadsClient, Box<dyn std::error::Error>> {
    Ok(DownloadsClient::builder(config.backend.api_base_url.clone())
        .timeout(Duration::from_millis(config.backend.request_timeout_ms))
        .build()?)
}

/// The one update client a command uses; every subscription goes through it.
fn build_update_client(
    config: &Config,
    api: &DownloadsClient,
) -> Result<TaskUpdateClient, Box<dyn std::error::Error>> {
    let base_url = channel_base_url(config, api)?;
    tracing::debug!(base_url = %base_url, "task channel base");
    Ok(TaskUpdateClient::builder(base_url)
        .policy(config.channel.policy())
        .spawn())
}

fn channel_base_url(
    config: &Config,
    api: &DownloadsClient,
) -> Result<String, Box<dyn std::error::Error>> {
    match config.backend.ws_base_url.as_deref() {
        Some(url) => Ok(url.trim_end_matches('/').to_string()),
        None => Ok(api.channel_base_url()?),
    }
}

enum WatchEvent {
    Update(TaskFrame),
    Status(StatusEvent),
}

async fn follow_task(
    updates: &TaskUpdateClient,
    task_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let status_tx = tx.clone();
    updates
        .subscribe_with_status(
            task_id,
            move |frame| {
                let _ = tx.send(WatchEvent::Update(frame));
            },
            move |event| {
                let _ = status_tx.send(WatchEvent::Status(event));
            },
        )
        .await?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut online = OnlineHook::install();

    let outcome = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(WatchEvent::Update(frame)) => {
                    if frame.is_permanent_failure() {
                        break Err(format!(
                            "gave up on {task_id}: {}",
                            frame.error().unwrap_or("connection lost")
                        ));
                    }
                    println!("{}", describe_update(&frame));
                    if frame.is_terminal_status() {
                        break Ok(());
                    }
                    if frame.status().is_none() {
                        if let Some(error) = frame.error() {
                            break Err(format!("backend rejected {task_id}: {error}"));
                        }
                    }
                }
                Some(WatchEvent::Status(StatusEvent::State(state))) => {
                    tracing::info!(task_id = %task_id, state = %state, "task channel");
                    if state == ConnectionState::Disconnected && updates.is_parked(task_id) {
                        break Err(format!("backend closed the channel for {task_id}"));
                    }
                }
                Some(WatchEvent::Status(StatusEvent::Reported(status))) => {
                    tracing::info!(task_id = %task_id, status = %status, "backend connection status");
                }
                None => break Ok(()),
            },
            _ = online.recv() => {
                tracing::info!(task_id = %task_id, "network reported back online");
                updates.notify_environment(EnvironmentSignal::Online);
            }
            _ = &mut interrupted => {
                tracing::info!(task_id = %task_id, "interrupted");
                break Ok(());
            }
        }
    };

    updates.unsubscribe(task_id);
    outcome.map_err(Into::into)
}

/// A terminal has no network-change event, so SIGUSR1 stands in for one.
struct OnlineHook {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl OnlineHook {
    #[cfg(unix)]
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = signal(SignalKind::user_defined1())
            .map_err(|err| tracing::warn!(error = %err, "SIGUSR1 hook unavailable"))
            .ok();
        Self { signal }
    }

    #[cfg(not(unix))]
    fn install() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        if let Some(signal) = self.signal.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
            self.signal = None;
        }
        std::future::pending::<()>().await
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

fn describe_update(frame: &TaskFrame) -> String {
    let status = frame.status().unwrap_or("update");
    let mut line = match frame.progress() {
        Some(progress) => format!("{status:<12} {progress:>5.1}%"),
        None => status.to_string(),
    };
    if let Some(title) = frame.get("title").and_then(|title| title.as_str()) {
        if !title.is_empty() {
            line.push_str("  ");
            line.push_str(title);
        }
    }
    if let Some(error) = frame.error() {
        line.push_str("  error: ");
        line.push_str(error);
    }
    line
}
