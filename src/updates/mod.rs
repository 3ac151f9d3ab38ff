pub mod backoff;
pub mod liveness;
pub mod router;

use crate::channel::{
    self, Channel, ChannelError, ChannelEvent, ChannelSink, Connector, WsConnector, CLOSE_ABNORMAL,
    CLOSE_NORMAL,
};
use crate::model::{ConnectionState, OutboundFrame, StatusEvent, TaskFrame};
use backoff::{Backoff, RetryDecision};
use liveness::{Liveness, StaleVerdict};
use router::Routed;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub type UpdateCallback = Arc<dyn Fn(TaskFrame) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Wall clock used for the timestamps written into outbound frames.
///
/// Scheduling always runs on the tokio clock; this only feeds wire fields.
pub trait Clock: Send + Sync + 'static {
    fn now_unix_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub open_timeout: Duration,
    pub hello_delay: Duration,
    pub hello_ack_timeout: Duration,
    pub keepalive_interval: Duration,
    pub stale_check_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub probe_grace: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    /// Drop a task this long after it reports a terminal status. `None` keeps
    /// it subscribed until the caller unsubscribes.
    pub terminal_cleanup: Option<Duration>,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(15),
            hello_delay: Duration::from_millis(500),
            hello_ack_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            stale_check_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(25),
            probe_grace: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            terminal_cleanup: None,
        }
    }
}

impl ChannelPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.backoff_base,
            self.backoff_max,
            self.max_reconnect_attempts,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("task {0} is not subscribed")]
    NotSubscribed(String),
    #[error(transparent)]
    Open(#[from] ChannelError),
    #[error("subscription was cancelled before the channel opened")]
    Cancelled,
    #[error("task update client has shut down")]
    ClientClosed,
}

/// Host-level hints that replace browser online/visibility listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    Online,
    Offline,
    Visible,
    Hidden,
}

pub fn task_channel_url(base_url: &str, task_id: &str) -> String {
    format!("{}/{}/ws", base_url.trim_end_matches('/'), task_id)
}

type Reply = oneshot::Sender<Result<(), SubscribeError>>;
type StateBoard = Arc<Mutex<HashMap<String, BoardEntry>>>;

/// What the handle can read without a round trip through the registry.
#[derive(Debug, Clone, Copy)]
struct BoardEntry {
    state: ConnectionState,
    /// Closed normally by the server; nothing reopens it until asked.
    parked: bool,
}

fn lock_board(board: &StateBoard) -> MutexGuard<'_, HashMap<String, BoardEntry>> {
    board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Command {
    Subscribe {
        task_id: String,
        on_update: UpdateCallback,
        on_status: Option<StatusCallback>,
        reply: Reply,
    },
    Unsubscribe {
        task_id: String,
    },
    Reconnect {
        task_id: String,
        reply: Reply,
    },
    Environment(EnvironmentSignal),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the registry actor. Clones share one registry.
#[derive(Clone)]
pub struct TaskUpdateClient {
    commands: mpsc::UnboundedSender<Command>,
    board: StateBoard,
}

pub struct TaskUpdateClientBuilder {
    base_url: String,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    policy: ChannelPolicy,
}

impl TaskUpdateClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connector: Arc::new(WsConnector),
            clock: Arc::new(SystemClock),
            policy: ChannelPolicy::default(),
        }
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn policy(mut self, policy: ChannelPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Starts the registry actor. Must be called inside a tokio runtime.
    pub fn spawn(self) -> TaskUpdateClient {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let board = StateBoard::default();
        let registry = Registry {
            tasks: HashMap::new(),
            events: events_tx,
            connector: self.connector,
            clock: self.clock,
            backoff: self.policy.backoff(),
            policy: self.policy,
            base_url: self.base_url,
            board: board.clone(),
            tokens: Tokens::default(),
        };
        tokio::spawn(registry.run(commands_rx, events_rx));
        TaskUpdateClient {
            commands: commands_tx,
            board,
        }
    }
}

impl TaskUpdateClient {
    pub fn builder(base_url: impl Into<String>) -> TaskUpdateClientBuilder {
        TaskUpdateClientBuilder::new(base_url)
    }

    /// Resolves once the task's channel is connected. A second call for a live
    /// task only swaps the callback.
    pub async fn subscribe<F>(&self, task_id: &str, on_update: F) -> Result<(), SubscribeError>
    where
        F: Fn(TaskFrame) + Send + Sync + 'static,
    {
        self.request_subscribe(task_id, Arc::new(on_update), None)
            .await
    }

    pub async fn subscribe_with_status<F, S>(
        &self,
        task_id: &str,
        on_update: F,
        on_status: S,
    ) -> Result<(), SubscribeError>
    where
        F: Fn(TaskFrame) + Send + Sync + 'static,
        S: Fn(StatusEvent) + Send + Sync + 'static,
    {
        self.request_subscribe(task_id, Arc::new(on_update), Some(Arc::new(on_status)))
            .await
    }

    async fn request_subscribe(
        &self,
        task_id: &str,
        on_update: UpdateCallback,
        on_status: Option<StatusCallback>,
    ) -> Result<(), SubscribeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                task_id: task_id.to_string(),
                on_update,
                on_status,
                reply,
            })
            .map_err(|_| SubscribeError::ClientClosed)?;
        response.await.unwrap_or(Err(SubscribeError::ClientClosed))
    }

    /// Never blocks and never fails; safe to call from inside a callback.
    pub fn unsubscribe(&self, task_id: &str) {
        lock_board(&self.board).remove(task_id);
        let _ = self.commands.send(Command::Unsubscribe {
            task_id: task_id.to_string(),
        });
    }

    pub async fn reconnect(&self, task_id: &str) -> Result<(), SubscribeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Reconnect {
                task_id: task_id.to_string(),
                reply,
            })
            .map_err(|_| SubscribeError::ClientClosed)?;
        response.await.unwrap_or(Err(SubscribeError::ClientClosed))
    }

    pub fn connection_state(&self, task_id: &str) -> ConnectionState {
        lock_board(&self.board)
            .get(task_id)
            .map_or(ConnectionState::Disconnected, |entry| entry.state)
    }

    /// True while the task is registered but its channel was closed normally
    /// and no reconnect is scheduled. `reconnect` or an `Online`/`Visible`
    /// signal reopens it.
    pub fn is_parked(&self, task_id: &str) -> bool {
        lock_board(&self.board)
            .get(task_id)
            .is_some_and(|entry| entry.parked)
    }

    pub fn is_subscribed(&self, task_id: &str) -> bool {
        lock_board(&self.board).contains_key(task_id)
    }

    pub fn notify_environment(&self, signal: EnvironmentSignal) {
        let _ = self.commands.send(Command::Environment(signal));
    }

    /// Unsubscribes every task and stops the registry.
    pub async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = stopped.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Hello,
    HelloAckTimeout,
    Keepalive,
    StaleCheck,
    ProbeGrace,
    Retry,
    Cleanup,
}

impl TimerKind {
    fn task_scoped(self) -> bool {
        matches!(self, Self::Retry | Self::Cleanup)
    }
}

enum Event {
    Opened {
        task_id: String,
        epoch: u64,
        result: Result<Channel, ChannelError>,
    },
    Channel {
        task_id: String,
        epoch: u64,
        event: ChannelEvent,
    },
    Timer {
        task_id: String,
        token: u64,
        kind: TimerKind,
    },
}

#[derive(Debug, Default)]
struct Tokens {
    last: u64,
}

impl Tokens {
    fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

#[derive(Default)]
struct ChannelTimers {
    open: Option<AbortHandle>,
    pump: Option<AbortHandle>,
    hello: Option<AbortHandle>,
    hello_ack: Option<AbortHandle>,
    keepalive: Option<AbortHandle>,
    stale_check: Option<AbortHandle>,
    probe: Option<AbortHandle>,
}

impl ChannelTimers {
    fn cancel_all(&mut self) {
        let handles = [
            self.open.take(),
            self.pump.take(),
            self.hello.take(),
            self.hello_ack.take(),
            self.keepalive.take(),
            self.stale_check.take(),
            self.probe.take(),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
    }
}

struct TaskRecord {
    /// Identifies this subscription; task-scoped timers carry it.
    generation: u64,
    /// Identifies the current channel; channel events and timers carry it.
    epoch: u64,
    on_update: UpdateCallback,
    on_status: Option<StatusCallback>,
    state: ConnectionState,
    attempts: u32,
    connected_once: bool,
    sink: Option<ChannelSink>,
    liveness: Liveness,
    hello_acked: bool,
    waiters: Vec<Reply>,
    timers: ChannelTimers,
    retry: Option<AbortHandle>,
    cleanup: Option<AbortHandle>,
}

impl TaskRecord {
    fn channel_open(&self) -> bool {
        self.sink.as_ref().is_some_and(ChannelSink::is_open)
    }

    fn set_state(&mut self, task_id: &str, state: ConnectionState, board: &StateBoard) {
        if self.state == state {
            return;
        }
        debug!(task_id = %task_id, from = %self.state, to = %state, "connection state changed");
        self.state = state;
        if let Some(entry) = lock_board(board).get_mut(task_id) {
            entry.state = state;
            if state != ConnectionState::Disconnected {
                entry.parked = false;
            }
        }
        if let Some(on_status) = &self.on_status {
            deliver(task_id, on_status.as_ref(), StatusEvent::State(state));
        }
    }

    fn send(&self, task_id: &str, frame: &OutboundFrame) -> bool {
        let Some(sink) = self.sink.as_ref().filter(|sink| sink.is_open()) else {
            return false;
        };
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "failed to encode outbound frame");
                return false;
            }
        };
        match sink.send_text(text) {
            Ok(()) => true,
            Err(err) => {
                debug!(task_id = %task_id, error = %err, "outbound frame dropped");
                false
            }
        }
    }

    fn teardown_channel(&mut self, reason: &str) {
        self.timers.cancel_all();
        if let Some(sink) = self.sink.take() {
            if sink.is_open() {
                sink.close(CLOSE_NORMAL, reason);
            }
        }
    }

    fn release(&mut self, reason: &str) {
        self.teardown_channel(reason);
        for handle in [self.retry.take(), self.cleanup.take()].into_iter().flatten() {
            handle.abort();
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(SubscribeError::Cancelled));
        }
    }

    fn resolve_waiters(&mut self, result: Result<(), SubscribeError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

fn deliver<T>(task_id: &str, callback: &(dyn Fn(T) + Send + Sync), value: T) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!(task_id = %task_id, "task callback panicked");
    }
}

fn after(
    events: &mpsc::UnboundedSender<Event>,
    delay: Duration,
    task_id: &str,
    token: u64,
    kind: TimerKind,
) -> AbortHandle {
    let events = events.clone();
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(Event::Timer {
            task_id,
            token,
            kind,
        });
    })
    .abort_handle()
}

fn every(
    events: &mpsc::UnboundedSender<Event>,
    period: Duration,
    task_id: &str,
    token: u64,
    kind: TimerKind,
) -> AbortHandle {
    let events = events.clone();
    let task_id = task_id.to_string();
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let event = Event::Timer {
                task_id: task_id.clone(),
                token,
                kind,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

fn pump(
    events: &mpsc::UnboundedSender<Event>,
    task_id: &str,
    epoch: u64,
    mut feed: mpsc::UnboundedReceiver<ChannelEvent>,
) -> AbortHandle {
    let events = events.clone();
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        let mut closed = false;
        while let Some(event) = feed.recv().await {
            closed = matches!(event, ChannelEvent::Closed { .. });
            let forwarded = Event::Channel {
                task_id: task_id.clone(),
                epoch,
                event,
            };
            if events.send(forwarded).is_err() || closed {
                return;
            }
        }
        if !closed {
            let _ = events.send(Event::Channel {
                task_id,
                epoch,
                event: ChannelEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "event feed ended".to_string(),
                },
            });
        }
    })
    .abort_handle()
}

/// Owns every per-task record. Only the actor task touches it.
struct Registry {
    tasks: HashMap<String, TaskRecord>,
    events: mpsc::UnboundedSender<Event>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    policy: ChannelPolicy,
    backoff: Backoff,
    base_url: String,
    board: StateBoard,
    tokens: Tokens,
}

impl Registry {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
            }
        }
        debug!("task update registry stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                task_id,
                on_update,
                on_status,
                reply,
            } => self.subscribe(task_id, on_update, on_status, reply),
            Command::Unsubscribe { task_id } => self.remove_task(&task_id, "unsubscribed"),
            Command::Reconnect { task_id, reply } => self.reconnect(&task_id, reply),
            Command::Environment(signal) => self.on_environment(signal),
            Command::Shutdown { .. } => {}
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Opened {
                task_id,
                epoch,
                result,
            } => self.on_opened(&task_id, epoch, result),
            Event::Channel {
                task_id,
                epoch,
                event,
            } => self.on_channel_event(&task_id, epoch, event),
            Event::Timer {
                task_id,
                token,
                kind,
            } => self.on_timer(&task_id, token, kind),
        }
    }

    fn subscribe(
        &mut self,
        task_id: String,
        on_update: UpdateCallback,
        on_status: Option<StatusCallback>,
        reply: Reply,
    ) {
        if let Some(record) = self.tasks.get_mut(&task_id) {
            record.on_update = on_update;
            if on_status.is_some() {
                record.on_status = on_status;
            }
            if record.state == ConnectionState::Connected && record.channel_open() {
                debug!(task_id = %task_id, "already subscribed; callbacks replaced");
                let _ = reply.send(Ok(()));
                return;
            }
            record.waiters.push(reply);
            if record.state == ConnectionState::Connecting {
                return;
            }
            self.open_channel(&task_id);
            return;
        }

        let record = TaskRecord {
            generation: self.tokens.next(),
            epoch: 0,
            on_update,
            on_status,
            state: ConnectionState::Disconnected,
            attempts: 0,
            connected_once: false,
            sink: None,
            liveness: Liveness::new(Instant::now(), self.policy.heartbeat_timeout),
            hello_acked: false,
            waiters: vec![reply],
            timers: ChannelTimers::default(),
            retry: None,
            cleanup: None,
        };
        info!(task_id = %task_id, "subscribing to task updates");
        self.tasks.insert(task_id.clone(), record);
        lock_board(&self.board).insert(
            task_id.clone(),
            BoardEntry {
                state: ConnectionState::Disconnected,
                parked: false,
            },
        );
        self.open_channel(&task_id);
    }

    fn reconnect(&mut self, task_id: &str, reply: Reply) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            let _ = reply.send(Err(SubscribeError::NotSubscribed(task_id.to_string())));
            return;
        };
        info!(task_id = %task_id, "manual reconnect requested");
        record.attempts = 0;
        record.waiters.push(reply);
        self.open_channel(task_id);
    }

    /// Closes whatever channel the task has and starts a fresh open.
    fn open_channel(&mut self, task_id: &str) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        record.teardown_channel("reconnecting");
        if let Some(retry) = record.retry.take() {
            retry.abort();
        }
        if record.state == ConnectionState::Connected {
            record.set_state(task_id, ConnectionState::Disconnected, &self.board);
        }

        let epoch = self.tokens.next();
        record.epoch = epoch;
        record.hello_acked = false;

        let url = task_channel_url(&self.base_url, task_id);
        debug!(task_id = %task_id, url = %url, epoch, "opening task channel");
        let connector = self.connector.clone();
        let events = self.events.clone();
        let open_timeout = self.policy.open_timeout;
        let id = task_id.to_string();
        let opening = tokio::spawn(async move {
            let result = match tokio::time::timeout(open_timeout, connector.open(url)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Timeout(open_timeout)),
            };
            let _ = events.send(Event::Opened {
                task_id: id,
                epoch,
                result,
            });
        });
        record.timers.open = Some(opening.abort_handle());
        record.set_state(task_id, ConnectionState::Connecting, &self.board);
    }

    fn on_opened(&mut self, task_id: &str, epoch: u64, result: Result<Channel, ChannelError>) {
        let Some(record) = self
            .tasks
            .get_mut(task_id)
            .filter(|record| record.epoch == epoch)
        else {
            if let Ok(channel) = result {
                channel.sink.close(CLOSE_NORMAL, "superseded");
            }
            trace!(task_id = %task_id, epoch, "discarding stale open result");
            return;
        };
        record.timers.open = None;

        match result {
            Ok(Channel { sink, events }) => {
                record.timers.pump = Some(pump(&self.events, task_id, epoch, events));
                record.sink = Some(sink);
                record.attempts = 0;
                record.connected_once = true;
                record.liveness = Liveness::new(Instant::now(), self.policy.heartbeat_timeout);
                record.timers.hello = Some(after(
                    &self.events,
                    self.policy.hello_delay,
                    task_id,
                    epoch,
                    TimerKind::Hello,
                ));
                record.timers.keepalive = Some(every(
                    &self.events,
                    self.policy.keepalive_interval,
                    task_id,
                    epoch,
                    TimerKind::Keepalive,
                ));
                record.timers.stale_check = Some(every(
                    &self.events,
                    self.policy.stale_check_interval,
                    task_id,
                    epoch,
                    TimerKind::StaleCheck,
                ));
                info!(task_id = %task_id, "task channel open");
                record.set_state(task_id, ConnectionState::Connected, &self.board);
                record.resolve_waiters(Ok(()));
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "task channel failed to open");
                record.resolve_waiters(Err(SubscribeError::Open(err)));
                if record.connected_once {
                    self.channel_lost(task_id, "open failed");
                } else {
                    self.remove_task(task_id, "initial open failed");
                }
            }
        }
    }

    fn on_channel_event(&mut self, task_id: &str, epoch: u64, event: ChannelEvent) {
        let current = self
            .tasks
            .get(task_id)
            .is_some_and(|record| record.epoch == epoch);
        if !current {
            trace!(task_id = %task_id, epoch, "dropping event from retired channel");
            return;
        }

        match event {
            ChannelEvent::Message(text) => self.on_frame(task_id, &text),
            ChannelEvent::Error(err) => {
                warn!(task_id = %task_id, error = %err, "task channel error");
                self.channel_lost(task_id, "transport error");
            }
            ChannelEvent::Closed { code, reason } if channel::is_intentional_close(code) => {
                info!(task_id = %task_id, code, reason = %reason, "task channel closed");
                if let Some(record) = self.tasks.get_mut(task_id) {
                    record.teardown_channel("closed");
                    record.epoch = self.tokens.next();
                    if let Some(entry) = lock_board(&self.board).get_mut(task_id) {
                        entry.parked = true;
                    }
                    record.set_state(task_id, ConnectionState::Disconnected, &self.board);
                }
            }
            ChannelEvent::Closed { code, reason } => {
                warn!(task_id = %task_id, code, reason = %reason, "task channel closed abnormally");
                self.channel_lost(task_id, "abnormal close");
            }
        }
    }

    /// `unsubscribe` clears the board before its command reaches the registry.
    fn still_subscribed(&self, task_id: &str) -> bool {
        lock_board(&self.board).contains_key(task_id)
    }

    fn on_frame(&mut self, task_id: &str, text: &str) {
        let routed = match router::classify(text) {
            Ok(routed) => routed,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "dropping malformed frame");
                return;
            }
        };
        if !self.still_subscribed(task_id) {
            trace!(task_id = %task_id, "dropping frame for unsubscribed task");
            return;
        }
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        record.liveness.record(Instant::now());
        if record.state != ConnectionState::Connected {
            record.set_state(task_id, ConnectionState::Connected, &self.board);
        }

        match routed {
            Routed::Ping { timestamp } => {
                let pong = router::pong_for(timestamp, task_id, self.clock.now_unix_ms());
                record.send(task_id, &pong);
            }
            Routed::Pong => trace!(task_id = %task_id, "pong received"),
            Routed::HelloAck => {
                if let Some(timer) = record.timers.hello_ack.take() {
                    timer.abort();
                }
                record.hello_acked = true;
                debug!(task_id = %task_id, "hello acknowledged");
            }
            Routed::ConnectionStatus(status) => match &record.on_status {
                Some(on_status) => {
                    deliver(task_id, on_status.as_ref(), StatusEvent::Reported(status))
                }
                None => debug!(task_id = %task_id, status = %status, "server connection status"),
            },
            Routed::Update(frame) => {
                if frame.is_terminal_status() && record.cleanup.is_none() {
                    if let Some(grace) = self.policy.terminal_cleanup {
                        debug!(task_id = %task_id, "task finished; scheduling cleanup");
                        record.cleanup = Some(after(
                            &self.events,
                            grace,
                            task_id,
                            record.generation,
                            TimerKind::Cleanup,
                        ));
                    }
                }
                deliver(task_id, record.on_update.as_ref(), frame);
            }
        }
    }

    fn on_timer(&mut self, task_id: &str, token: u64, kind: TimerKind) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        let current = if kind.task_scoped() {
            record.generation
        } else {
            record.epoch
        };
        if token != current {
            trace!(task_id = %task_id, ?kind, "ignoring stale timer");
            return;
        }

        match kind {
            TimerKind::Hello => {
                record.timers.hello = None;
                let hello = OutboundFrame::Hello {
                    task_id: task_id.to_string(),
                    timestamp: self.clock.now_unix_ms(),
                };
                if record.send(task_id, &hello) {
                    record.timers.hello_ack = Some(after(
                        &self.events,
                        self.policy.hello_ack_timeout,
                        task_id,
                        token,
                        TimerKind::HelloAckTimeout,
                    ));
                }
            }
            TimerKind::HelloAckTimeout => {
                record.timers.hello_ack = None;
                if !record.hello_acked {
                    warn!(task_id = %task_id, "hello was not acknowledged");
                }
            }
            TimerKind::Keepalive => {
                let ping = OutboundFrame::Ping {
                    timestamp: self.clock.now_unix_ms(),
                    task_id: task_id.to_string(),
                };
                record.send(task_id, &ping);
            }
            TimerKind::StaleCheck => self.check_liveness(task_id),
            TimerKind::ProbeGrace => {
                record.timers.probe = None;
                if record.liveness.confirm_stale(Instant::now()) {
                    warn!(task_id = %task_id, "no traffic after probe; reconnecting");
                    self.channel_lost(task_id, "heartbeat timeout");
                }
            }
            TimerKind::Retry => {
                record.retry = None;
                if record.state == ConnectionState::Disconnected {
                    self.open_channel(task_id);
                } else {
                    debug!(task_id = %task_id, state = %record.state, "retry skipped");
                }
            }
            TimerKind::Cleanup => {
                record.cleanup = None;
                self.remove_task(task_id, "task finished");
            }
        }
    }

    fn check_liveness(&mut self, task_id: &str) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        if record.state != ConnectionState::Connected {
            return;
        }
        let open = record.channel_open();
        match record.liveness.check(Instant::now(), open) {
            StaleVerdict::Alive | StaleVerdict::AwaitingProbe => {}
            StaleVerdict::Reconnect => {
                warn!(task_id = %task_id, "stale channel is not open; reconnecting");
                self.channel_lost(task_id, "stale channel");
            }
            StaleVerdict::Probe => {
                debug!(task_id = %task_id, "channel quiet; probing");
                let ping = OutboundFrame::Ping {
                    timestamp: self.clock.now_unix_ms(),
                    task_id: task_id.to_string(),
                };
                record.send(task_id, &ping);
                record.timers.probe = Some(after(
                    &self.events,
                    self.policy.probe_grace,
                    task_id,
                    record.epoch,
                    TimerKind::ProbeGrace,
                ));
            }
        }
    }

    /// Transient loss: drop the channel and hand over to the retry schedule.
    fn channel_lost(&mut self, task_id: &str, cause: &str) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        if record.sink.is_none() && record.state == ConnectionState::Disconnected {
            return;
        }
        debug!(task_id = %task_id, cause, "task channel lost");
        record.teardown_channel("reconnecting");
        record.epoch = self.tokens.next();
        record.set_state(task_id, ConnectionState::Disconnected, &self.board);
        self.schedule_retry(task_id);
    }

    fn schedule_retry(&mut self, task_id: &str) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        match self.backoff.next(&mut record.attempts) {
            RetryDecision::Retry { attempt, delay } => {
                info!(
                    task_id = %task_id,
                    attempt,
                    max_attempts = self.backoff.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                if let Some(previous) = record.retry.take() {
                    previous.abort();
                }
                record.retry = Some(after(
                    &self.events,
                    delay,
                    task_id,
                    record.generation,
                    TimerKind::Retry,
                ));
            }
            RetryDecision::Exhausted { attempts } => {
                error!(task_id = %task_id, attempts, "reconnect attempts exhausted");
                let frame = TaskFrame::connection_error(
                    task_id,
                    format!("connection lost after {attempts} reconnect attempts"),
                    attempts,
                );
                if lock_board(&self.board).contains_key(task_id) {
                    deliver(task_id, record.on_update.as_ref(), frame);
                }
                self.remove_task(task_id, "reconnect attempts exhausted");
            }
        }
    }

    fn remove_task(&mut self, task_id: &str, reason: &str) {
        let Some(mut record) = self.tasks.remove(task_id) else {
            return;
        };
        record.release(reason);
        lock_board(&self.board).remove(task_id);
        if record.state != ConnectionState::Disconnected {
            record.state = ConnectionState::Disconnected;
            if let Some(on_status) = &record.on_status {
                deliver(
                    task_id,
                    on_status.as_ref(),
                    StatusEvent::State(ConnectionState::Disconnected),
                );
            }
        }
        info!(task_id = %task_id, reason, "task unsubscribed");
    }

    fn on_environment(&mut self, signal: EnvironmentSignal) {
        debug!(?signal, "environment signal");
        if matches!(signal, EnvironmentSignal::Offline | EnvironmentSignal::Hidden) {
            return;
        }
        let idle: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, record)| record.state == ConnectionState::Disconnected)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in idle {
            info!(task_id = %task_id, ?signal, "reconnecting idle task");
            self.open_channel(&task_id);
        }
        if signal == EnvironmentSignal::Visible {
            let live: Vec<String> = self
                .tasks
                .iter()
                .filter(|(_, record)| record.state == ConnectionState::Connected)
                .map(|(task_id, _)| task_id.clone())
                .collect();
            for task_id in live {
                self.check_liveness(&task_id);
            }
        }
    }

    fn shutdown(&mut self) {
        let task_ids: Vec<String> = self.tasks.keys().cloned().collect();
        for task_id in task_ids {
            self.remove_task(&task_id, "client shutdown");
        }
    }
}
