#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use gaovm::client::DaemonClient;
use gaovm::config::ConfigStore;
use gaovm::daemon::Daemon;
use gaovm::events::{Event, EventHub};
use gaovm::supervisor::{Supervisor, SupervisorSettings, SupervisorSettingsBuilder};

/// The real driver binary, built alongside the tests.
pub fn driver_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gaovm-driver"))
}

/// Production timing compressed so failure scenarios play out in
/// milliseconds instead of half a minute.
pub fn fast_settings(state_dir: PathBuf, driver_bin: PathBuf) -> SupervisorSettings {
    SupervisorSettingsBuilder::default()
        .driver_bin(driver_bin)
        .state_dir(state_dir)
        .backoff_unit(Duration::from_millis(20))
        .backoff_cap(Duration::from_millis(500))
        .connect_deadline(Duration::from_secs(2))
        .connect_retry(Duration::from_millis(25))
        .heartbeat_interval(Duration::from_millis(200))
        .heartbeat_timeout(Duration::from_millis(500))
        .reconcile_interval(Duration::from_millis(150))
        .stop_request_grace(Duration::from_millis(400))
        .sigterm_grace(Duration::from_millis(500))
        .sigkill_grace(Duration::from_millis(500))
        .build()
        .expect("test supervisor settings")
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub hub: Arc<EventHub>,
    pub store: Arc<ConfigStore>,
    pub supervisor: Supervisor,
    pub socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    /// Bring up a full daemon (store + supervisor + dispatch) in a temp
    /// state dir, serving on a real unix socket.
    pub async fn start(driver: PathBuf) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let hub = EventHub::new();
        let store = Arc::new(ConfigStore::new(dir.path(), hub.emitter()));
        let supervisor = Supervisor::new(
            fast_settings(dir.path().to_path_buf(), driver),
            hub.emitter(),
        )
        .expect("supervisor");
        supervisor.spawn_reconcile();

        let socket_path = dir.path().join("run").join("daemon.sock");
        let daemon = Daemon::new(
            socket_path.clone(),
            store.clone(),
            supervisor.clone(),
            hub.clone(),
        );
        let listener = daemon.bind().expect("bind");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.serve(listener, shutdown_rx).await });
        }

        Harness {
            dir,
            hub,
            store,
            supervisor,
            socket_path,
            shutdown_tx,
        }
    }

    pub async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.socket_path)
            .await
            .expect("client connect")
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.hub.subscribe()
    }

    pub async fn teardown(self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.shutdown().await;
    }
}

/// Receive events until one of `kind` arrives, returning everything seen
/// (inclusive). Panics when `deadline` passes first.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<Event>,
    kind: &str,
    deadline: Duration,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = event.kind == kind;
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event hub closed"),
            }
        }
    })
    .await;
    if result.is_err() {
        panic!(
            "no {kind} event within {deadline:?}; saw {:?}",
            seen.iter().map(|e| e.kind.clone()).collect::<Vec<_>>()
        );
    }
    seen
}

/// Poll `predicate` until it holds or `deadline` passes.
pub async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
