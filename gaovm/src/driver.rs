//! Runtime driver process.
//!
//! The driver owns the hypervisor side of one VM. Everything about building
//! the VM object itself lives behind the methods it serves; what is
//! contracted here is how it joins the fabric: listen on the socket the
//! supervisor names, accept exactly one connection, open with its own
//! `hello` carrying the `AUTH_TOKEN` secret, validate the daemon's
//! counter-hello against the same secret, then serve requests.
//!
//! Liveness contract: the driver exits non-zero when the control socket
//! reports EOF, or when no authenticated daemon RPC has arrived within the
//! idle limit after the handshake. The supervisor counts on this to clear
//! unreachable drivers without probing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{IdSpace, InboundRequest, RequestHandler, RpcChannel};
use crate::handshake::{
    self, HelloParams, HelloPolicy, DRIVER_CAPABILITIES, DRIVER_REQUIRED,
};
use crate::proto::message::RpcError;
use crate::util::now_ts;

/// How long the driver tolerates silence from the daemon after the
/// handshake before assuming it is orphaned.
pub const IDLE_LIMIT: Duration = Duration::from_secs(15);

/// How long to wait for the supervisor to connect at all.
pub const ACCEPT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub socket_path: PathBuf,
    pub auth_token: String,
    pub idle_limit: Duration,
    pub accept_deadline: Duration,
}

impl DriverSettings {
    pub fn new(socket_path: PathBuf, auth_token: String) -> DriverSettings {
        DriverSettings {
            socket_path,
            auth_token,
            idle_limit: IDLE_LIMIT,
            accept_deadline: ACCEPT_DEADLINE,
        }
    }
}

/// Serves the daemon's requests once the handshake has completed. Every
/// authenticated RPC feeds the liveness clock.
struct DriverService {
    token: String,
    last_rpc: Mutex<Instant>,
    display_open: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

#[async_trait]
impl RequestHandler for DriverService {
    async fn handle(&self, request: InboundRequest) -> Result<Value, RpcError> {
        *self.last_rpc.lock().unwrap() = Instant::now();
        match request.method.as_str() {
            "ping" => Ok(json!({"ok": true, "ts": now_ts()})),
            "hello" => {
                let params = handshake::parse_hello(&request)?;
                let policy = HelloPolicy {
                    supported: DRIVER_CAPABILITIES,
                    expected_token: Some(&self.token),
                };
                Ok(handshake::hello_result_value(&policy.validate(&params)?))
            }
            "shutdown" => {
                info!("daemon requested shutdown");
                let _ = self.stop_tx.send(true);
                Ok(json!({"ok": true}))
            }
            "vm.open_display" => {
                self.display_open.store(true, Ordering::SeqCst);
                Ok(json!({"ok": true, "display": "open"}))
            }
            "vm.close_display" => {
                self.display_open.store(false, Ordering::SeqCst);
                Ok(json!({"ok": true, "display": "closed"}))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// Run the driver to completion. The returned value is the process exit
/// code: 0 for a daemon-requested shutdown, non-zero when the liveness
/// contract fires.
pub async fn run(settings: DriverSettings) -> Result<i32, DriverError> {
    if let Some(parent) = settings.socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|error| DriverError::Io {
                context: format!("could not create {}", parent.display()),
                error,
            })?;
    }
    match tokio::fs::remove_file(&settings.socket_path).await {
        Ok(()) => debug!("removed stale driver socket"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(DriverError::Io {
                context: format!("could not remove stale {}", settings.socket_path.display()),
                error,
            })
        }
    }

    let listener = UnixListener::bind(&settings.socket_path).map_err(|error| DriverError::Io {
        context: format!("could not bind {}", settings.socket_path.display()),
        error,
    })?;
    info!(socket = %settings.socket_path.display(), "driver listening");

    let (stream, _) = match tokio::time::timeout(settings.accept_deadline, listener.accept()).await
    {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(error)) => {
            return Err(DriverError::Io {
                context: "accept failed".to_owned(),
                error,
            })
        }
        Err(_) => {
            warn!("no daemon connected before the accept deadline");
            return Ok(1);
        }
    };
    // One daemon per driver process; the listener is done.
    drop(listener);

    let (reader, writer) = stream.into_split();
    let channel = RpcChannel::new(reader, writer, IdSpace::Positive, "daemon");

    // The daemon's counter-hello can arrive while our own hello is still in
    // flight; register for it before the reader starts.
    let counter_hello = channel.wait_for_request("hello");
    channel.start();

    let hello = HelloParams::new(DRIVER_CAPABILITIES, DRIVER_REQUIRED)
        .with_token(settings.auth_token.clone());
    handshake::send_hello(&channel, &hello)
        .await
        .map_err(|err| DriverError::Handshake(format!("daemon rejected driver hello: {err}")))?;

    let policy = HelloPolicy {
        supported: DRIVER_CAPABILITIES,
        expected_token: Some(&settings.auth_token),
    };
    handshake::answer_hello_from(&channel, counter_hello, &policy)
        .await
        .map_err(|err| DriverError::Handshake(format!("daemon hello rejected: {err}")))?;
    info!("handshake complete");

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let service = Arc::new(DriverService {
        token: settings.auth_token.clone(),
        last_rpc: Mutex::new(Instant::now()),
        display_open: AtomicBool::new(false),
        stop_tx,
    });
    channel.set_handler(service.clone());

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop_rx.wait_for(|stop| *stop) => {
                // Give the shutdown response a moment to flush.
                tokio::time::sleep(Duration::from_millis(50)).await;
                channel.close("shutting down").await;
                return Ok(0);
            }
            _ = ticker.tick() => {
                if channel.is_closed() {
                    warn!("control socket closed, exiting");
                    return Ok(1);
                }
                let idle = service.last_rpc.lock().unwrap().elapsed();
                if idle > settings.idle_limit {
                    warn!(?idle, "no daemon rpc within the idle limit, exiting");
                    return Ok(1);
                }
            }
        }
    }
}
