//! Daemon session dispatch.
//!
//! Binds the client-facing unix socket, wraps each accepted connection in a
//! channel and a session, and routes RPC methods to the supervisor and the
//! config store. Every method except `hello` is gated on a completed
//! client handshake. Emitted events fan out to subscribed sessions as
//! `event` notifications; delivery is best-effort and a slow client only
//! lags its own bounded buffer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{IdSpace, InboundRequest, RequestHandler, RpcChannel};
use crate::config::{ConfigStore, StoreError};
use crate::events::EventHub;
use crate::handshake::{self, HelloParams, HelloPolicy, CLIENT_CAPABILITIES, CLIENT_REQUIRED};
use crate::proto::message::RpcError;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::util::now_ts;

pub const DAEMON_SOCKET_FILE: &str = "daemon.sock";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("could not bind {}: {error}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },
}

pub struct Daemon {
    socket_path: PathBuf,
    store: Arc<ConfigStore>,
    supervisor: Supervisor,
    hub: Arc<EventHub>,
}

impl Daemon {
    pub fn new(
        socket_path: PathBuf,
        store: Arc<ConfigStore>,
        supervisor: Supervisor,
        hub: Arc<EventHub>,
    ) -> Arc<Daemon> {
        Arc::new(Daemon {
            socket_path,
            store,
            supervisor,
            hub,
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Bind the client socket, removing any stale file first. The parent
    /// directory is created if missing.
    pub fn bind(&self) -> Result<UnixListener, DaemonError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| DaemonError::Io {
                context: format!("could not create {}", parent.display()),
                error,
            })?;
        }
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("removed stale daemon socket"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(DaemonError::Io {
                    context: format!("could not remove stale {}", self.socket_path.display()),
                    error,
                })
            }
        }
        UnixListener::bind(&self.socket_path).map_err(|error| DaemonError::Bind {
            path: self.socket_path.clone(),
            error,
        })
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn serve(
        self: &Arc<Daemon>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(socket = %self.socket_path.display(), "daemon listening");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.accept(stream),
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("daemon listener stopped");
    }

    fn accept(self: &Arc<Daemon>, stream: UnixStream) {
        static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let channel = RpcChannel::new(reader, writer, IdSpace::Negative, format!("session-{id}"));
        let session = Arc::new(Session {
            id,
            daemon: self.clone(),
            channel: channel.clone(),
            handshaken: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            forwarder: Mutex::new(None),
        });
        channel.set_handler(session);
        channel.start();
        debug!(session = id, "client connected");
    }
}

struct Session {
    id: u64,
    daemon: Arc<Daemon>,
    channel: RpcChannel,
    handshaken: AtomicBool,
    subscribed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().unwrap().take() {
            forwarder.abort();
        }
        debug!(session = self.id, "client session dropped");
    }
}

fn map_store_err(err: StoreError) -> RpcError {
    match err {
        StoreError::Invalid(error) => RpcError::invalid_params(error.0),
        other => RpcError::internal(other.to_string()),
    }
}

fn map_supervisor_err(err: SupervisorError) -> RpcError {
    match err {
        // Driver-originated errors pass through with their own code.
        SupervisorError::Driver(error) => error,
        other => RpcError::internal(other.to_string()),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| RpcError::internal(err.to_string()))
}

fn params_object(request: &InboundRequest) -> Result<Map<String, Value>, RpcError> {
    match &request.params {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(RpcError::invalid_params("params must be an object")),
        None => Err(RpcError::invalid_params("params are required")),
    }
}

fn required_param(params: &Map<String, Value>, key: &str) -> Result<Value, RpcError> {
    params
        .get(key)
        .cloned()
        .ok_or_else(|| RpcError::invalid_params(format!("missing param {key}")))
}

impl Session {
    fn handle_hello(&self, request: &InboundRequest) -> Result<Value, RpcError> {
        let params = handshake::parse_hello(request)?;
        let policy = HelloPolicy {
            supported: CLIENT_CAPABILITIES,
            expected_token: None,
        };
        let result = policy.validate(&params)?;
        let first = !self.handshaken.swap(true, Ordering::SeqCst);

        if first {
            // Reciprocate with the daemon's own hello, best-effort.
            let channel = self.channel.clone();
            let session = self.id;
            tokio::spawn(async move {
                let hello = HelloParams::new(CLIENT_CAPABILITIES, CLIENT_REQUIRED);
                if let Err(err) = handshake::send_hello(&channel, &hello).await {
                    debug!(session, %err, "client did not accept the daemon hello");
                }
            });
        }

        Ok(handshake::hello_result_value(&result))
    }

    fn handle_subscribe(&self) -> Result<Value, RpcError> {
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            let mut rx = self.daemon.hub.subscribe();
            let channel = self.channel.clone();
            let session = self.id;
            let forwarder = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let payload = match serde_json::to_value(&event) {
                                Ok(payload) => payload,
                                Err(_) => continue,
                            };
                            if channel.notify("event", Some(payload)).await.is_err() {
                                return;
                            }
                        }
                        // A lagging subscriber just misses events.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(session, missed, "event subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
            *self.forwarder.lock().unwrap() = Some(forwarder);
        }
        Ok(json!({"subscribed": true}))
    }

    async fn handle_vm_start(&self) -> Result<Value, RpcError> {
        // A staged configuration becomes current on the stopped→start edge.
        if !self.daemon.supervisor.is_active() {
            self.daemon
                .store
                .activate_pending_if_present()
                .await
                .map_err(map_store_err)?;
        }
        let status = self.daemon.supervisor.start().await.map_err(map_supervisor_err)?;
        to_value(&status)
    }

    async fn handle_config_set(&self, request: &InboundRequest) -> Result<Value, RpcError> {
        let params = params_object(request)?;
        let config = required_param(&params, "config")?;
        let outcome = self
            .daemon
            .store
            .set_config(&config, self.daemon.supervisor.is_active())
            .await
            .map_err(map_store_err)?;
        to_value(&outcome)
    }

    async fn handle_config_patch(&self, request: &InboundRequest) -> Result<Value, RpcError> {
        let params = params_object(request)?;
        let patch = required_param(&params, "patch")?;
        let outcome = self
            .daemon
            .store
            .patch_config(&patch, self.daemon.supervisor.is_active())
            .await
            .map_err(map_store_err)?;
        to_value(&outcome)
    }

    async fn handle_config_get(&self) -> Result<Value, RpcError> {
        let current = self.daemon.store.get_current().await.map_err(map_store_err)?;
        let pending = self.daemon.store.get_pending().await.map_err(map_store_err)?;
        let has_pending = pending.is_some();
        Ok(json!({
            "current": current,
            "pending": pending,
            "hasPending": has_pending,
        }))
    }

    async fn handle_driver_exec(&self, request: &InboundRequest) -> Result<Value, RpcError> {
        let params = params_object(request)?;
        let method = required_param(&params, "method")?;
        let method = method
            .as_str()
            .ok_or_else(|| RpcError::invalid_params("method must be a string"))?;
        let driver_params = params.get("params").cloned();
        let result = self
            .daemon
            .supervisor
            .driver_exec(method, driver_params)
            .await
            .map_err(map_supervisor_err)?;
        Ok(json!({"method": method, "driverResult": result}))
    }

    async fn handle_display(&self, method: &str) -> Result<Value, RpcError> {
        self.daemon
            .supervisor
            .driver_exec(method, None)
            .await
            .map_err(map_supervisor_err)
    }

    fn handle_list_vms(&self) -> Result<Value, RpcError> {
        let mut vm = to_value(&self.daemon.supervisor.status())?;
        vm["name"] = json!("default");
        Ok(json!([vm]))
    }
}

#[async_trait::async_trait]
impl RequestHandler for Session {
    async fn handle(&self, request: InboundRequest) -> Result<Value, RpcError> {
        if request.method == "hello" {
            return self.handle_hello(&request);
        }
        if !self.handshaken.load(Ordering::SeqCst) {
            return Err(RpcError::handshake_required());
        }

        match request.method.as_str() {
            "ping" => Ok(json!({"ok": true, "ts": now_ts()})),
            "subscribe_events" => self.handle_subscribe(),
            "list_vms" => self.handle_list_vms(),
            "vm.start" => self.handle_vm_start().await,
            "vm.stop" => {
                let status = self.daemon.supervisor.stop().await.map_err(map_supervisor_err)?;
                to_value(&status)
            }
            "vm.status" => to_value(&self.daemon.supervisor.status()),
            "vm.config.get" => self.handle_config_get().await,
            "vm.config.set" => self.handle_config_set(&request).await,
            "vm.config.patch" => self.handle_config_patch(&request).await,
            "doctor" => Ok(self.daemon.supervisor.doctor().await),
            "driver.exec" => self.handle_driver_exec(&request).await,
            "vm.open_display" | "vm.close_display" => {
                self.handle_display(request.method.as_str()).await
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}
