//! Driver supervisor.
//!
//! Owns at most one runtime-driver child process. The desired state
//! (running/stopped) is what clients ask for; the actual state tracks the
//! child through spawn, socket connect, mutual handshake, heartbeats and
//! exit. An unexpected exit while the VM should be running schedules a
//! restart with exponential backoff; after the attempt budget is exhausted
//! the supervisor flips desired to stopped and emits a permanent-failure
//! event, so only an explicit start tries again.
//!
//! Lifecycle operations are serialized: `start_in_progress` and
//! `stop_in_progress` guards reject overlapping invocations, and a late
//! caller just waits the in-flight operation out and returns the resulting
//! status.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use derive_builder::Builder;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, IdSpace, InboundRequest, RequestHandler, RpcChannel};
use crate::events::EventFn;
use crate::handshake::{
    self, HelloParams, HelloPolicy, DRIVER_REQUIRED, SUPERVISOR_CAPABILITIES,
};
use crate::logsink::LogSink;
use crate::persist::{read_json, write_json_atomic, PersistError};
use crate::proto::message::RpcError;
use crate::util::now_ts;

pub const DESIRED_STATE_FILE: &str = "desired_state.json";
pub const RUNTIME_STATE_FILE: &str = "daemon_state.json";
pub const DRIVER_SOCKET_FILE: &str = "driver.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActualState {
    Absent,
    Starting,
    Connected,
    Stopping,
    Exited,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("driver is not connected")]
    DriverUnavailable,

    #[error("driver call failed: {0}")]
    Channel(#[source] ChannelError),

    #[error(transparent)]
    Driver(RpcError),
}

/// Persisted whenever `desired` or terminal-failure status changes. This is
/// the authoritative record read back on daemon startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateRecord {
    pub desired: DesiredState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    pub max_restart_attempts: u32,
    pub updated_at: String,
}

/// Observational runtime state, persisted on every transition and never read
/// back. Also the reply shape of `vm.status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub desired: DesiredState,
    /// `running` once the driver handshake has completed, `stopped`
    /// otherwise.
    pub actual: String,
    pub restart_attempts: u32,
    pub restart_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_socket_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

/// Supervisor configuration. Timing fields default to the production values;
/// tests compress them.
#[derive(Debug, Clone, Builder)]
pub struct SupervisorSettings {
    pub driver_bin: PathBuf,
    pub state_dir: PathBuf,

    #[builder(default = "5")]
    pub max_restart_attempts: u32,

    /// Backoff delay is `backoff_unit * 2^(attempt-1)`, capped.
    #[builder(default = "Duration::from_secs(1)")]
    pub backoff_unit: Duration,
    #[builder(default = "Duration::from_secs(30)")]
    pub backoff_cap: Duration,

    #[builder(default = "Duration::from_secs(10)")]
    pub connect_deadline: Duration,
    #[builder(default = "Duration::from_millis(200)")]
    pub connect_retry: Duration,

    #[builder(default = "Duration::from_secs(5)")]
    pub heartbeat_interval: Duration,
    #[builder(default = "Duration::from_secs(5)")]
    pub heartbeat_timeout: Duration,
    /// Consecutive heartbeat failures that force a channel teardown. `None`
    /// never tears down from heartbeats alone; exits and EOF do.
    #[builder(default)]
    pub heartbeat_teardown_threshold: Option<u32>,

    #[builder(default = "Duration::from_secs(5)")]
    pub exec_timeout: Duration,
    #[builder(default = "Duration::from_secs(5)")]
    pub reconcile_interval: Duration,

    #[builder(default = "Duration::from_millis(500)")]
    pub stop_request_grace: Duration,
    #[builder(default = "Duration::from_secs(2)")]
    pub sigterm_grace: Duration,
    #[builder(default = "Duration::from_secs(2)")]
    pub sigkill_grace: Duration,
}

impl SupervisorSettings {
    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("run")
    }

    pub fn driver_socket_path(&self) -> PathBuf {
        self.run_dir().join(DRIVER_SOCKET_FILE)
    }

    pub fn driver_log_path(&self) -> PathBuf {
        self.state_dir.join("logs").join("driver.log")
    }

    pub fn desired_state_path(&self) -> PathBuf {
        self.state_dir.join(DESIRED_STATE_FILE)
    }

    pub fn runtime_state_path(&self) -> PathBuf {
        self.state_dir.join(RUNTIME_STATE_FILE)
    }
}

struct State {
    desired: DesiredState,
    actual: ActualState,
    restart_attempts: u32,
    restart_pending: bool,
    start_in_progress: bool,
    stop_in_progress: bool,
    quiescing: bool,
    last_failure: Option<String>,
    channel: Option<RpcChannel>,
    child_pid: Option<u32>,
    /// Bumped whenever the current child stops being ours; stale exit
    /// watchers compare against it and bow out.
    epoch: u64,
    restart_timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconcile: Option<JoinHandle<()>>,
}

struct Shared {
    settings: SupervisorSettings,
    state: Mutex<State>,
    emit: EventFn,
    driver_log: LogSink,
    busy_tx: watch::Sender<bool>,
    actual_tx: watch::Sender<ActualState>,
}

#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

fn generate_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Inbound handler installed on the driver channel after the handshake:
/// answers `ping` and `hello`, rejects everything else.
struct DriverFacingHandler {
    token: String,
}

#[async_trait::async_trait]
impl RequestHandler for DriverFacingHandler {
    async fn handle(&self, request: InboundRequest) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "ping" => Ok(json!({"ok": true, "ts": now_ts()})),
            "hello" => {
                let params = handshake::parse_hello(&request)?;
                let policy = HelloPolicy {
                    supported: SUPERVISOR_CAPABILITIES,
                    expected_token: Some(&self.token),
                };
                Ok(handshake::hello_result_value(&policy.validate(&params)?))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, emit: EventFn) -> Result<Supervisor, SupervisorError> {
        std::fs::create_dir_all(&settings.state_dir).map_err(|error| SupervisorError::Io {
            context: format!("could not create {}", settings.state_dir.display()),
            error,
        })?;
        let driver_log = LogSink::open(&settings.driver_log_path()).map_err(|error| {
            SupervisorError::Io {
                context: format!("could not open {}", settings.driver_log_path().display()),
                error,
            }
        })?;
        let (busy_tx, _) = watch::channel(false);
        let (actual_tx, _) = watch::channel(ActualState::Absent);
        Ok(Supervisor {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(State {
                    desired: DesiredState::Stopped,
                    actual: ActualState::Absent,
                    restart_attempts: 0,
                    restart_pending: false,
                    start_in_progress: false,
                    stop_in_progress: false,
                    quiescing: false,
                    last_failure: None,
                    channel: None,
                    child_pid: None,
                    epoch: 0,
                    restart_timer: None,
                    heartbeat: None,
                    reconcile: None,
                }),
                emit,
                driver_log,
                busy_tx,
                actual_tx,
            }),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Whether the driver child is currently alive for config-staging
    /// purposes.
    pub fn is_active(&self) -> bool {
        matches!(
            self.shared.state.lock().unwrap().actual,
            ActualState::Starting | ActualState::Connected | ActualState::Stopping
        )
    }

    pub fn status(&self) -> StatusRecord {
        let st = self.shared.state.lock().unwrap();
        StatusRecord {
            desired: st.desired,
            actual: if st.actual == ActualState::Connected {
                "running".to_owned()
            } else {
                "stopped".to_owned()
            },
            restart_attempts: st.restart_attempts,
            restart_pending: st.restart_pending,
            driver_pid: st.child_pid,
            driver_socket_path: st
                .channel
                .is_some()
                .then(|| self.shared.settings.driver_socket_path().display().to_string()),
            last_failure: st.last_failure.clone(),
        }
    }

    /// Diagnostics snapshot for the `doctor` method.
    pub async fn doctor(&self) -> Value {
        let settings = &self.shared.settings;
        let socket = settings.driver_socket_path();
        json!({
            "driverBin": {
                "path": settings.driver_bin.display().to_string(),
                "exists": settings.driver_bin.exists(),
            },
            "driverSocket": {
                "path": socket.display().to_string(),
                "exists": socket.exists(),
            },
            "stateDir": {
                "path": settings.state_dir.display().to_string(),
                "exists": settings.state_dir.exists(),
            },
            "status": serde_json::to_value(self.status()).expect("status serialize"),
        })
    }

    /// Re-read the persisted desired state at daemon startup. Returns what
    /// the daemon should converge to.
    pub async fn recover_desired(&self) -> Result<DesiredState, SupervisorError> {
        let record: Option<DesiredStateRecord> =
            read_json(&self.shared.settings.desired_state_path()).await?;
        let desired = match record {
            Some(record) => {
                let mut st = self.shared.state.lock().unwrap();
                st.desired = record.desired;
                st.last_failure = record.last_failure;
                record.desired
            }
            None => DesiredState::Stopped,
        };
        Ok(desired)
    }

    /// Start the periodic reconcile tick.
    pub fn spawn_reconcile(&self) {
        let sup = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sup.shared.settings.reconcile_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sup.reconcile_tick().await;
            }
        });
        self.shared.state.lock().unwrap().reconcile = Some(handle);
    }

    async fn reconcile_tick(&self) {
        let should_start = {
            let st = self.shared.state.lock().unwrap();
            st.desired == DesiredState::Running
                && st.actual == ActualState::Absent
                && !st.restart_pending
                && !st.start_in_progress
                && !st.stop_in_progress
                && !st.quiescing
        };
        if should_start && self.try_claim() {
            debug!("reconcile: driver absent while desired running, starting");
            self.run_start().await;
            self.release_claim();
        }
    }

    fn try_claim(&self) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        if st.start_in_progress || st.stop_in_progress {
            return false;
        }
        st.start_in_progress = true;
        self.shared.busy_tx.send_replace(true);
        true
    }

    fn release_claim(&self) {
        let mut st = self.shared.state.lock().unwrap();
        st.start_in_progress = false;
        st.stop_in_progress = false;
        self.shared.busy_tx.send_replace(false);
    }

    /// Wait for an in-flight lifecycle operation to finish.
    async fn wait_not_busy(&self) {
        let mut rx = self.shared.busy_tx.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    /// Set desired=running and bring the driver up. A concurrent lifecycle
    /// operation makes this a no-op that waits it out and reports status.
    pub async fn start(&self) -> Result<StatusRecord, SupervisorError> {
        if !self.try_claim() {
            self.wait_not_busy().await;
            return Ok(self.status());
        }
        {
            let mut st = self.shared.state.lock().unwrap();
            st.desired = DesiredState::Running;
            st.restart_attempts = 0;
            st.restart_pending = false;
            if let Some(timer) = st.restart_timer.take() {
                timer.abort();
            }
        }
        let persist = self.persist_desired().await;
        if persist.is_err() {
            self.release_claim();
            persist?;
        }
        self.run_start().await;
        self.release_claim();
        Ok(self.status())
    }

    /// Set desired=stopped and terminate the driver with escalation.
    pub async fn stop(&self) -> Result<StatusRecord, SupervisorError> {
        let busy = {
            let mut st = self.shared.state.lock().unwrap();
            if st.start_in_progress || st.stop_in_progress {
                true
            } else {
                st.stop_in_progress = true;
                self.shared.busy_tx.send_replace(true);
                st.desired = DesiredState::Stopped;
                st.restart_pending = false;
                if let Some(timer) = st.restart_timer.take() {
                    timer.abort();
                }
                false
            }
        };
        if busy {
            self.wait_not_busy().await;
            return Ok(self.status());
        }
        let persist = self.persist_desired().await;
        if persist.is_err() {
            self.release_claim();
            persist?;
        }
        self.terminate_child().await;
        self.release_claim();
        self.persist_runtime_logged().await;
        Ok(self.status())
    }

    /// Tear everything down for daemon shutdown without touching the
    /// persisted desired state, so the next daemon boot resumes it.
    pub async fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.quiescing = true;
            if let Some(timer) = st.restart_timer.take() {
                timer.abort();
            }
            if let Some(reconcile) = st.reconcile.take() {
                reconcile.abort();
            }
            st.restart_pending = false;
        }
        self.terminate_child().await;
    }

    /// Forward an arbitrary method to the driver channel.
    pub async fn driver_exec(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SupervisorError> {
        let channel = self
            .shared
            .state
            .lock()
            .unwrap()
            .channel
            .clone()
            .ok_or(SupervisorError::DriverUnavailable)?;
        match channel
            .request_with_timeout(method, params, self.shared.settings.exec_timeout)
            .await
        {
            Ok(value) => Ok(value),
            Err(ChannelError::Remote(error)) => {
                self.record_failure(format!("driver rejected {method}: {error}"));
                Err(SupervisorError::Driver(error))
            }
            Err(error) => {
                self.record_failure(format!("driver call {method} failed: {error}"));
                Err(SupervisorError::Channel(error))
            }
        }
    }

    fn record_failure(&self, failure: String) {
        warn!(%failure, "driver failure");
        self.shared.state.lock().unwrap().last_failure = Some(failure);
    }

    fn set_actual(&self, st: &mut State, actual: ActualState) {
        st.actual = actual;
        self.shared.actual_tx.send_replace(actual);
    }

    /// One start attempt plus failure bookkeeping. Caller holds the claim.
    async fn run_start(&self) {
        if self.shared.state.lock().unwrap().actual == ActualState::Connected {
            return;
        }
        match self.start_attempt().await {
            Ok(()) => {
                info!("driver started and handshake complete");
                self.persist_runtime_logged().await;
            }
            Err(failure) => {
                self.record_failure(failure);
                self.persist_runtime_logged().await;
                self.schedule_restart().await;
            }
        }
    }

    /// Spawn, connect and handshake one driver child. On any failure the
    /// child is killed and socket artifacts are cleaned up; the caller
    /// handles restart scheduling.
    fn start_attempt(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + '_>>
    {
        Box::pin(async move {
        let settings = &self.shared.settings;
        let socket_path = settings.driver_socket_path();

        tokio::fs::create_dir_all(settings.run_dir())
            .await
            .map_err(|e| format!("could not create {}: {e}", settings.run_dir().display()))?;
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!("removed stale driver socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(format!("could not remove stale driver socket: {e}")),
        }

        let token = generate_token();

        let mut command = Command::new(&settings.driver_bin);
        command
            .arg("--socket-path")
            .arg(&socket_path)
            .env("AUTH_TOKEN", &token)
            .env("DRIVER_LOG_PATH", settings.driver_log_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| format!("could not spawn {}: {e}", settings.driver_bin.display()))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            self.capture_output(stdout, "INFO");
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture_output(stderr, "WARN");
        }

        let epoch = {
            let mut st = self.shared.state.lock().unwrap();
            st.epoch += 1;
            st.child_pid = pid;
            self.set_actual(&mut st, ActualState::Starting);
            st.epoch
        };

        // The watcher owns the child from here through its whole life.
        {
            let sup = self.clone();
            let mut child = child;
            tokio::spawn(async move {
                let status = child.wait().await;
                sup.on_child_exit(epoch, status).await;
            });
        }

        match self.connect_and_handshake(&token, epoch).await {
            Ok(channel) => {
                channel.set_handler(Arc::new(DriverFacingHandler {
                    token: token.clone(),
                }));
                let stale = {
                    let mut st = self.shared.state.lock().unwrap();
                    if st.epoch != epoch {
                        true
                    } else {
                        st.channel = Some(channel.clone());
                        st.restart_attempts = 0;
                        st.last_failure = None;
                        self.set_actual(&mut st, ActualState::Connected);
                        false
                    }
                };
                if stale {
                    // The child died while we were connecting.
                    channel.close("driver exited during startup").await;
                    return Err("driver exited during startup".to_owned());
                }
                self.spawn_heartbeat(channel, epoch);
                Ok(())
            }
            Err(failure) => {
                self.abort_start(epoch, pid, &failure).await;
                Err(failure)
            }
        }
        })
    }

    /// Kill a half-started child and clean up after a failed attempt.
    async fn abort_start(&self, epoch: u64, pid: Option<u32>, failure: &str) {
        debug!(failure, "start attempt failed, cleaning up");
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.epoch == epoch {
                // Invalidate the exit watcher so it only reaps.
                st.epoch += 1;
                st.child_pid = None;
                st.channel = None;
                self.set_actual(&mut st, ActualState::Absent);
            }
        }
        if let Some(pid) = pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = tokio::fs::remove_file(self.shared.settings.driver_socket_path()).await;
    }

    fn capture_output(
        &self,
        stream: impl tokio::io::AsyncRead + Send + Unpin + 'static,
        level: &'static str,
    ) {
        let log = self.shared.driver_log.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if log.append(level, &line).is_err() {
                    break;
                }
            }
        });
    }

    async fn connect_and_handshake(&self, token: &str, epoch: u64) -> Result<RpcChannel, String> {
        let settings = &self.shared.settings;
        let socket_path = settings.driver_socket_path();

        let deadline = tokio::time::Instant::now() + settings.connect_deadline;
        let stream = loop {
            // Give up as soon as the exit watcher has seen the child die;
            // there is no point waiting out the connect deadline.
            if self.shared.state.lock().unwrap().epoch != epoch {
                return Err("driver exited during startup".to_owned());
            }
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => break stream,
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(format!(
                            "driver socket {} not reachable: {err}",
                            socket_path.display()
                        ));
                    }
                    tokio::time::sleep(settings.connect_retry).await;
                }
            }
        };

        let (reader, writer) = stream.into_split();
        let channel = RpcChannel::new(reader, writer, IdSpace::Negative, "driver");
        // The driver opens the moment we connect; register for its hello
        // before the reader starts so the frame cannot beat us.
        let opening_hello = channel.wait_for_request("hello");
        channel.start();

        let policy = HelloPolicy {
            supported: SUPERVISOR_CAPABILITIES,
            expected_token: Some(token),
        };
        if let Err(err) = handshake::answer_hello_from(&channel, opening_hello, &policy).await {
            channel.close("driver handshake failed").await;
            return Err(format!("driver hello rejected: {err}"));
        }

        // Then authenticate ourselves in the other direction.
        let hello = HelloParams::new(SUPERVISOR_CAPABILITIES, DRIVER_REQUIRED).with_token(token);
        if let Err(err) = handshake::send_hello(&channel, &hello).await {
            channel.close("driver handshake failed").await;
            return Err(format!("driver rejected daemon hello: {err}"));
        }

        Ok(channel)
    }

    fn spawn_heartbeat(&self, channel: RpcChannel, epoch: u64) {
        let sup = self.clone();
        let handle = tokio::spawn(async move {
            let settings = &sup.shared.settings;
            let mut interval = tokio::time::interval(settings.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            let mut consecutive = 0u32;
            loop {
                interval.tick().await;
                if channel.is_closed() {
                    return;
                }
                match channel
                    .request_with_timeout("ping", None, settings.heartbeat_timeout)
                    .await
                {
                    Ok(_) => consecutive = 0,
                    Err(err) => {
                        consecutive += 1;
                        {
                            let mut st = sup.shared.state.lock().unwrap();
                            if st.epoch != epoch {
                                return;
                            }
                            st.last_failure = Some(format!("heartbeat failed: {err}"));
                        }
                        warn!(%err, consecutive, "driver heartbeat failed");
                        // Failure alone does not tear down; EOF or the next
                        // exit surfaces the real problem, unless configured
                        // otherwise.
                        if let Some(threshold) = settings.heartbeat_teardown_threshold {
                            if consecutive >= threshold {
                                channel.close("heartbeat failure threshold reached").await;
                                return;
                            }
                        }
                    }
                }
            }
        });
        let mut st = self.shared.state.lock().unwrap();
        if let Some(old) = st.heartbeat.replace(handle) {
            old.abort();
        }
    }

    async fn on_child_exit(&self, epoch: u64, status: std::io::Result<std::process::ExitStatus>) {
        let (channel, desired, expected) = {
            let mut st = self.shared.state.lock().unwrap();
            if st.epoch != epoch {
                // Not our child anymore; it was already accounted for.
                return;
            }
            st.epoch += 1;
            st.child_pid = None;
            if let Some(heartbeat) = st.heartbeat.take() {
                heartbeat.abort();
            }
            let channel = st.channel.take();
            self.set_actual(&mut st, ActualState::Exited);
            // Exits during a stop, a daemon shutdown, or a still-running
            // start attempt are handled by those paths; only a free-standing
            // exit schedules a restart from here.
            (
                channel,
                st.desired,
                st.stop_in_progress || st.quiescing || st.start_in_progress,
            )
        };

        let code = match &status {
            Ok(status) => status.code(),
            Err(_) => None,
        };
        info!(?code, "driver exited");
        if let Some(channel) = channel {
            channel.close("driver exited").await;
        }
        let _ = tokio::fs::remove_file(self.shared.settings.driver_socket_path()).await;

        (self.shared.emit)("driver.exited", json!({ "code": code }));

        let unexpected = desired == DesiredState::Running && !expected;
        {
            let mut st = self.shared.state.lock().unwrap();
            if unexpected {
                st.last_failure = Some(match &status {
                    Ok(status) => format!("driver exited unexpectedly ({status})"),
                    Err(err) => format!("driver exit could not be observed: {err}"),
                });
            }
            self.set_actual(&mut st, ActualState::Absent);
        }
        self.persist_runtime_logged().await;

        if unexpected {
            self.schedule_restart().await;
        }
    }

    /// Apply the bounded-attempt restart policy after a failure.
    fn schedule_restart(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        enum Decision {
            Skip,
            Permanent { attempts: u32, failure: Option<String> },
            Retry { attempt: u32, delay: Duration },
        }

        let decision = {
            let mut st = self.shared.state.lock().unwrap();
            if st.desired != DesiredState::Running || st.quiescing {
                Decision::Skip
            } else if st.restart_attempts >= self.shared.settings.max_restart_attempts {
                st.desired = DesiredState::Stopped;
                st.restart_pending = false;
                Decision::Permanent {
                    attempts: st.restart_attempts,
                    failure: st.last_failure.clone(),
                }
            } else {
                st.restart_attempts += 1;
                st.restart_pending = true;
                let attempt = st.restart_attempts;
                let delay = std::cmp::min(
                    self.shared.settings.backoff_unit * (1u32 << (attempt - 1).min(31)),
                    self.shared.settings.backoff_cap,
                );
                Decision::Retry { attempt, delay }
            }
        };

        match decision {
            Decision::Skip => {}
            Decision::Permanent { attempts, failure } => {
                warn!(attempts, "driver restart budget exhausted, giving up");
                if let Err(err) = self.persist_desired().await {
                    warn!(%err, "could not persist desired state");
                }
                self.persist_runtime_logged().await;
                (self.shared.emit)(
                    "driver.permanent_failure",
                    json!({ "attempts": attempts, "lastFailure": failure }),
                );
            }
            Decision::Retry { attempt, delay } => {
                info!(attempt, ?delay, "scheduling driver restart");
                self.persist_runtime_logged().await;
                (self.shared.emit)(
                    "driver.restart_scheduled",
                    json!({ "attempt": attempt, "delayMs": delay.as_millis() as u64 }),
                );
                let sup = self.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut st = sup.shared.state.lock().unwrap();
                        if st.desired != DesiredState::Running || st.quiescing {
                            st.restart_pending = false;
                            return;
                        }
                        st.restart_pending = false;
                    }
                    if sup.try_claim() {
                        sup.run_start().await;
                        sup.release_claim();
                    }
                });
                let mut st = self.shared.state.lock().unwrap();
                if let Some(old) = st.restart_timer.replace(timer) {
                    old.abort();
                }
            }
        }
        })
    }

    /// Graceful termination: stop request, then SIGTERM, then SIGKILL, each
    /// with its grace period.
    async fn terminate_child(&self) {
        let (channel, pid) = {
            let mut st = self.shared.state.lock().unwrap();
            if st.child_pid.is_none() && st.channel.is_none() {
                self.set_actual(&mut st, ActualState::Absent);
                return;
            }
            self.set_actual(&mut st, ActualState::Stopping);
            (st.channel.clone(), st.child_pid)
        };
        let settings = &self.shared.settings;

        if let Some(channel) = channel {
            tokio::spawn(async move {
                let _ = channel
                    .request_with_timeout("shutdown", None, Duration::from_secs(2))
                    .await;
            });
        }
        if self.wait_gone(settings.stop_request_grace).await {
            return;
        }

        if let Some(pid) = pid {
            debug!(pid, "driver ignored stop request, sending SIGTERM");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        if self.wait_gone(settings.sigterm_grace).await {
            return;
        }

        if let Some(pid) = pid {
            warn!(pid, "driver ignored SIGTERM, sending SIGKILL");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        if !self.wait_gone(settings.sigkill_grace).await {
            self.record_failure("driver process survived SIGKILL".to_owned());
        }
    }

    async fn wait_gone(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.actual_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|a| *a == ActualState::Absent))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn persist_desired(&self) -> Result<(), SupervisorError> {
        let record = {
            let st = self.shared.state.lock().unwrap();
            DesiredStateRecord {
                desired: st.desired,
                last_failure: st.last_failure.clone(),
                max_restart_attempts: self.shared.settings.max_restart_attempts,
                updated_at: now_ts(),
            }
        };
        write_json_atomic(&self.shared.settings.desired_state_path(), &record).await?;
        Ok(())
    }

    /// Persist the observational runtime record. Background transitions have
    /// no caller to surface an error to, so failures are logged.
    async fn persist_runtime_logged(&self) {
        let record = self.status();
        if let Err(err) =
            write_json_atomic(&self.shared.settings.runtime_state_path(), &record).await
        {
            warn!(%err, "could not persist runtime state");
        }
    }
}
