//! The bidirectional `hello` exchange.
//!
//! Every new channel performs a paired `hello` before any other method is
//! served: the initiator sends its protocol version, optional auth token and
//! capability sets; the responder checks the protocol string, the token (on
//! daemon↔driver channels) and that the capability intersection covers the
//! peer's requirements, then replies with the computed intersection. Each
//! side both initiates and responds, so a channel is only authenticated once
//! both `hello` responses have been accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::{ChannelError, InboundRequest, RpcChannel};
use crate::proto::message::{code, RpcError};
use crate::proto::PROTOCOL_VERSION;

/// Both sides abandon the exchange if the peer takes longer than this.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Methods the daemon serves to clients.
pub const CLIENT_CAPABILITIES: &[&str] = &[
    "hello",
    "ping",
    "subscribe_events",
    "doctor",
    "driver.exec",
    "list_vms",
    "vm.start",
    "vm.stop",
    "vm.status",
    "vm.open_display",
    "vm.close_display",
    "vm.config.get",
    "vm.config.set",
    "vm.config.patch",
];

/// Capabilities either side of a client↔daemon channel must end up with.
pub const CLIENT_REQUIRED: &[&str] = &["hello", "ping"];

/// Methods the driver serves to the daemon.
pub const DRIVER_CAPABILITIES: &[&str] = &[
    "hello",
    "ping",
    "shutdown",
    "vm.open_display",
    "vm.close_display",
];

/// Capabilities either side of a daemon↔driver channel must end up with.
pub const DRIVER_REQUIRED: &[&str] = &["hello", "ping"];

/// Methods the daemon serves to the driver. Anything else a driver asks for
/// is rejected.
pub const SUPERVISOR_CAPABILITIES: &[&str] = &["hello", "ping"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloParams {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub capabilities: Vec<String>,
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResult {
    pub protocol: String,
    pub capabilities: Vec<String>,
    pub accepted_capabilities: Vec<String>,
}

impl HelloParams {
    pub fn new(capabilities: &[&str], required: &[&str]) -> HelloParams {
        HelloParams {
            protocol: PROTOCOL_VERSION.to_owned(),
            auth_token: None,
            capabilities: capabilities.iter().map(|s| (*s).to_owned()).collect(),
            required_capabilities: required.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> HelloParams {
        self.auth_token = Some(token.into());
        self
    }
}

/// What the responder checks an inbound `hello` against.
pub struct HelloPolicy<'a> {
    /// Methods this side is willing to serve.
    pub supported: &'a [&'a str],
    /// Required on daemon↔driver channels, absent on client channels.
    pub expected_token: Option<&'a str>,
}

impl HelloPolicy<'_> {
    /// Validate `hello` params and compute the accepted capability set.
    pub fn validate(&self, params: &HelloParams) -> Result<HelloResult, RpcError> {
        if params.protocol != PROTOCOL_VERSION {
            return Err(RpcError::new(
                code::HANDSHAKE_FAILED,
                format!(
                    "protocol mismatch: peer speaks {}, this side speaks {}",
                    params.protocol, PROTOCOL_VERSION
                ),
            )
            .with_data(json!({
                "offered": params.protocol,
                "supported": PROTOCOL_VERSION,
            })));
        }

        if let Some(expected) = self.expected_token {
            if params.auth_token.as_deref() != Some(expected) {
                return Err(RpcError::new(code::AUTH_FAILED, "auth token mismatch"));
            }
        }

        let accepted: Vec<String> = params
            .capabilities
            .iter()
            .filter(|cap| self.supported.contains(&cap.as_str()))
            .cloned()
            .collect();
        let missing: Vec<&String> = params
            .required_capabilities
            .iter()
            .filter(|cap| !accepted.contains(*cap))
            .collect();
        if !missing.is_empty() {
            return Err(RpcError::new(
                code::CAPABILITY_MISMATCH,
                format!(
                    "required capabilities not supported: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .with_data(json!({ "missing": missing })));
        }

        Ok(HelloResult {
            protocol: PROTOCOL_VERSION.to_owned(),
            capabilities: self.supported.iter().map(|s| (*s).to_owned()).collect(),
            accepted_capabilities: accepted,
        })
    }
}

/// Send our `hello` and validate the reply's protocol string.
pub async fn send_hello(
    channel: &RpcChannel,
    params: &HelloParams,
) -> Result<HelloResult, ChannelError> {
    let value = channel
        .request_with_timeout(
            "hello",
            Some(serde_json::to_value(params).expect("hello params serialize")),
            HELLO_TIMEOUT,
        )
        .await?;
    let result: HelloResult = serde_json::from_value(value).map_err(|err| {
        ChannelError::Remote(RpcError::new(
            code::HANDSHAKE_FAILED,
            format!("malformed hello result: {err}"),
        ))
    })?;
    if result.protocol != PROTOCOL_VERSION {
        return Err(ChannelError::Remote(RpcError::new(
            code::HANDSHAKE_FAILED,
            format!("peer answered hello with protocol {}", result.protocol),
        )));
    }
    Ok(result)
}

/// Wait for the peer's opening `hello` request, validate it against
/// `policy`, and answer. On validation failure the specific error is sent
/// back before this returns `Err`.
pub async fn answer_hello(
    channel: &RpcChannel,
    policy: &HelloPolicy<'_>,
) -> Result<(HelloParams, HelloResult), ChannelError> {
    let waiter = channel.wait_for_request("hello");
    answer_hello_from(channel, waiter, policy).await
}

/// Like [`answer_hello`], but with a waiter registered earlier. Both sides
/// of a channel send `hello` concurrently, so a peer that initiates must
/// register for the counter-hello before sending its own to avoid losing
/// the race.
pub async fn answer_hello_from(
    channel: &RpcChannel,
    waiter: tokio::sync::oneshot::Receiver<InboundRequest>,
    policy: &HelloPolicy<'_>,
) -> Result<(HelloParams, HelloResult), ChannelError> {
    let inbound = tokio::time::timeout(HELLO_TIMEOUT, waiter)
        .await
        .map_err(|_| ChannelError::Timeout {
            method: "hello".to_owned(),
            timeout: HELLO_TIMEOUT,
        })?
        .map_err(|_| ChannelError::Closed("channel closed before hello".to_owned()))?;

    let id = inbound.id.ok_or_else(|| {
        ChannelError::Remote(RpcError::new(
            code::HANDSHAKE_FAILED,
            "hello must be a request, not a notification",
        ))
    })?;

    let params: HelloParams = match inbound
        .params
        .ok_or_else(|| RpcError::new(code::HANDSHAKE_FAILED, "hello without params"))
        .and_then(|value| {
            serde_json::from_value(value)
                .map_err(|err| RpcError::new(code::HANDSHAKE_FAILED, format!("malformed hello: {err}")))
        }) {
        Ok(params) => params,
        Err(error) => {
            let _ = channel.respond(id, Err(error.clone())).await;
            return Err(ChannelError::Remote(error));
        }
    };

    match policy.validate(&params) {
        Ok(result) => {
            channel
                .respond(
                    id,
                    Ok(serde_json::to_value(&result).expect("hello result serialize")),
                )
                .await?;
            Ok((params, result))
        }
        Err(error) => {
            let _ = channel.respond(id, Err(error.clone())).await;
            Err(ChannelError::Remote(error))
        }
    }
}

/// Parse an inbound `hello` handed to a regular request handler (the client
/// side of the daemon's reciprocal hello).
pub fn parse_hello(request: &InboundRequest) -> Result<HelloParams, RpcError> {
    let params = request
        .params
        .clone()
        .ok_or_else(|| RpcError::new(code::HANDSHAKE_FAILED, "hello without params"))?;
    serde_json::from_value(params)
        .map_err(|err| RpcError::new(code::HANDSHAKE_FAILED, format!("malformed hello: {err}")))
}

/// Serialize a [`HelloResult`] for a handler's return value.
pub fn hello_result_value(result: &HelloResult) -> Value {
    serde_json::to_value(result).expect("hello result serialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_policy() -> HelloPolicy<'static> {
        HelloPolicy {
            supported: CLIENT_CAPABILITIES,
            expected_token: None,
        }
    }

    #[test]
    fn accepts_matching_hello_and_intersects() {
        let params = HelloParams::new(&["hello", "ping", "made.up"], CLIENT_REQUIRED);
        let result = client_policy().validate(&params).unwrap();
        assert_eq!(result.protocol, PROTOCOL_VERSION);
        assert_eq!(result.accepted_capabilities, vec!["hello", "ping"]);
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let mut params = HelloParams::new(CLIENT_REQUIRED, CLIENT_REQUIRED);
        params.protocol = "gaovm.v0.9".to_owned();
        let err = client_policy().validate(&params).unwrap_err();
        assert_eq!(err.code, code::HANDSHAKE_FAILED);
        assert!(err.data.is_some());
    }

    #[test]
    fn rejects_bad_token() {
        let policy = HelloPolicy {
            supported: DRIVER_CAPABILITIES,
            expected_token: Some("right"),
        };
        let params = HelloParams::new(DRIVER_REQUIRED, DRIVER_REQUIRED).with_token("wrong");
        assert_eq!(policy.validate(&params).unwrap_err().code, code::AUTH_FAILED);

        let absent = HelloParams::new(DRIVER_REQUIRED, DRIVER_REQUIRED);
        assert_eq!(policy.validate(&absent).unwrap_err().code, code::AUTH_FAILED);
    }

    #[test]
    fn rejects_missing_required_capability() {
        let params = HelloParams::new(&["hello"], &["hello", "ping"]);
        let err = client_policy().validate(&params).unwrap_err();
        assert_eq!(err.code, code::CAPABILITY_MISMATCH);
        assert_eq!(err.data.unwrap()["missing"], serde_json::json!(["ping"]));
    }

    #[tokio::test]
    async fn full_exchange_over_a_stream() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let initiator =
            crate::channel::RpcChannel::spawn(ar, aw, crate::channel::IdSpace::Positive, "init");
        let responder =
            crate::channel::RpcChannel::new(br, bw, crate::channel::IdSpace::Negative, "resp");
        let opening = responder.wait_for_request("hello");
        responder.start();

        let responder_task = tokio::spawn(async move {
            let policy = HelloPolicy {
                supported: CLIENT_CAPABILITIES,
                expected_token: None,
            };
            answer_hello_from(&responder, opening, &policy).await
        });

        let params = HelloParams::new(CLIENT_REQUIRED, CLIENT_REQUIRED);
        let result = send_hello(&initiator, &params).await.unwrap();
        assert_eq!(result.accepted_capabilities, vec!["hello", "ping"]);

        let (seen, _) = responder_task.await.unwrap().unwrap();
        assert_eq!(seen.protocol, PROTOCOL_VERSION);
    }
}
