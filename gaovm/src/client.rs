//! Client side of the daemon socket.
//!
//! [`DaemonClient`] wraps one connection: it performs the client half of the
//! handshake (including answering the daemon's reciprocal `hello`), exposes
//! one async method per daemon operation, and surfaces `event`
//! notifications as a stream once subscribed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::channel::{ChannelError, IdSpace, InboundRequest, RequestHandler, RpcChannel};
use crate::events::Event;
use crate::handshake::{self, HelloParams, HelloPolicy, CLIENT_REQUIRED};
use crate::proto::message::RpcError;

/// Methods this client is willing to serve to the daemon: the reciprocal
/// `hello` and nothing else that matters.
const CLIENT_SIDE_CAPABILITIES: &[&str] = &["hello", "ping"];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {}: {error}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

struct ClientHandler {
    events_tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl RequestHandler for ClientHandler {
    async fn handle(&self, request: InboundRequest) -> Result<Value, RpcError> {
        match request.method.as_str() {
            // The daemon reciprocates our hello over the same channel.
            "hello" => {
                let params = handshake::parse_hello(&request)?;
                let policy = HelloPolicy {
                    supported: CLIENT_SIDE_CAPABILITIES,
                    expected_token: None,
                };
                Ok(handshake::hello_result_value(&policy.validate(&params)?))
            }
            "ping" => Ok(json!({"ok": true, "ts": crate::util::now_ts()})),
            "event" => {
                if let Some(payload) = request.params {
                    match serde_json::from_value::<Event>(payload) {
                        Ok(event) => {
                            let _ = self.events_tx.send(event);
                        }
                        Err(err) => debug!(%err, "dropping malformed event"),
                    }
                }
                Ok(Value::Null)
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

pub struct DaemonClient {
    channel: RpcChannel,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl DaemonClient {
    /// Connect and complete the client handshake.
    pub async fn connect(socket_path: &Path) -> Result<DaemonClient, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|error| ClientError::Connect {
                path: socket_path.to_path_buf(),
                error,
            })?;
        let (reader, writer) = stream.into_split();
        let channel = RpcChannel::new(reader, writer, IdSpace::Positive, "client");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        channel.set_handler(Arc::new(ClientHandler { events_tx }));
        channel.start();

        let hello = HelloParams::new(CLIENT_SIDE_CAPABILITIES, CLIENT_REQUIRED);
        handshake::send_hello(&channel, &hello).await?;

        Ok(DaemonClient {
            channel,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub async fn close(&self) {
        self.channel.close("client going away").await;
    }

    /// Send an arbitrary method. The typed helpers below cover the daemon's
    /// surface; this is the escape hatch.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        Ok(self.channel.request(method, params).await?)
    }

    pub async fn ping(&self) -> Result<Value, ClientError> {
        self.call("ping", None).await
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call("vm.status", None).await
    }

    pub async fn list_vms(&self) -> Result<Value, ClientError> {
        self.call("list_vms", None).await
    }

    pub async fn start(&self) -> Result<Value, ClientError> {
        self.call("vm.start", None).await
    }

    pub async fn stop(&self) -> Result<Value, ClientError> {
        self.call("vm.stop", None).await
    }

    pub async fn doctor(&self) -> Result<Value, ClientError> {
        self.call("doctor", None).await
    }

    pub async fn config_get(&self) -> Result<Value, ClientError> {
        self.call("vm.config.get", None).await
    }

    pub async fn config_set(&self, config: Value) -> Result<Value, ClientError> {
        self.call("vm.config.set", Some(json!({ "config": config }))).await
    }

    pub async fn config_patch(&self, patch: Value) -> Result<Value, ClientError> {
        self.call("vm.config.patch", Some(json!({ "patch": patch }))).await
    }

    pub async fn driver_exec(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        let mut body = json!({ "method": method });
        if let Some(params) = params {
            body["params"] = params;
        }
        self.call("driver.exec", Some(body)).await
    }

    pub async fn open_display(&self) -> Result<Value, ClientError> {
        self.call("vm.open_display", None).await
    }

    pub async fn close_display(&self) -> Result<Value, ClientError> {
        self.call("vm.close_display", None).await
    }

    /// Subscribe to daemon events and take the receiving end of the stream.
    /// The stream ends when the connection closes.
    pub async fn subscribe_events(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Event>, ClientError> {
        self.call("subscribe_events", None).await?;
        let rx = self.events_rx.lock().await.take();
        rx.ok_or_else(|| {
            ClientError::Channel(ChannelError::Closed("event stream already taken".to_owned()))
        })
    }
}
