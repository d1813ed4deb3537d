//! End-to-end daemon tests over a real unix socket.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{collect_until, driver_bin, Harness};
use gaovm::channel::{ChannelError, IdSpace, RpcChannel};
use gaovm::client::ClientError;
use gaovm::proto::message::code;

#[tokio::test(flavor = "multi_thread")]
async fn hello_then_ping() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;

    let pong = client.ping().await.unwrap();
    assert_eq!(pong["ok"], json!(true));
    assert!(pong["ts"].is_string());

    client.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn methods_before_hello_get_handshake_error() {
    let h = Harness::start(driver_bin()).await;

    let stream = tokio::net::UnixStream::connect(&h.socket_path).await.unwrap();
    let (reader, writer) = stream.into_split();
    let rogue = RpcChannel::spawn(reader, writer, IdSpace::Positive, "rogue");

    let err = rogue.request("ping", None).await.unwrap_err();
    match err {
        ChannelError::Remote(error) => assert_eq!(error.code, code::HANDSHAKE_FAILED),
        other => panic!("expected handshake error, got {other:?}"),
    }

    rogue.close("done").await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_methods_are_rejected() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;

    let err = client.call("vm.teleport", None).await.unwrap_err();
    match err {
        ClientError::Channel(ChannelError::Remote(error)) => {
            assert_eq!(error.code, code::METHOD_NOT_FOUND);
        }
        other => panic!("expected method-not-found, got {other:?}"),
    }

    client.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_patch_names_the_offending_field() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;

    let err = client.config_patch(json!({"cpu": 0})).await.unwrap_err();
    match err {
        ClientError::Channel(ChannelError::Remote(error)) => {
            assert_eq!(error.code, code::INVALID_PARAMS);
            assert_eq!(error.message, "cpu must be an integer >= 1");
        }
        other => panic!("expected invalid-params, got {other:?}"),
    }

    client.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn config_changes_while_stopped_apply_directly() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;
    let mut events = client.subscribe_events().await.unwrap();

    let outcome = client
        .config_patch(json!({"graphics": {"enabled": false}}))
        .await
        .unwrap();
    assert_eq!(outcome["applied"], json!(true));
    assert_eq!(outcome["current"]["graphics"]["enabled"], json!(false));

    let view = client.config_get().await.unwrap();
    assert_eq!(view["current"]["graphics"]["enabled"], json!(false));
    assert_eq!(view["hasPending"], json!(false));

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("event stream open");
    assert_eq!(event.kind, "config.updated");

    client.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_required_change_stages_pending_until_next_start() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;
    let mut events = h.events();

    let status = client.start().await.unwrap();
    assert_eq!(status["actual"], json!("running"));

    // Restart-required while running: staged, current untouched.
    let outcome = client
        .config_patch(json!({"graphics": {"enabled": false}}))
        .await
        .unwrap();
    assert_eq!(outcome["applied"], json!(false));
    assert_eq!(outcome["restartRequired"], json!(true));
    assert_eq!(outcome["pendingReplaced"], json!(false));
    assert_eq!(outcome["current"]["graphics"]["enabled"], json!(true));
    assert_eq!(outcome["pending"]["graphics"]["enabled"], json!(false));
    assert!(h.dir.path().join("pending_config.json").exists());
    collect_until(&mut events, "pending_config_written", Duration::from_secs(2)).await;

    let view = client.config_get().await.unwrap();
    assert_eq!(view["hasPending"], json!(true));
    assert_eq!(view["current"]["graphics"]["enabled"], json!(true));

    // Stop, then start: pending is promoted atomically before the driver
    // comes back.
    let status = client.stop().await.unwrap();
    assert_eq!(status["actual"], json!("stopped"));
    let status = client.start().await.unwrap();
    assert_eq!(status["actual"], json!("running"));
    collect_until(&mut events, "config.pending_applied", Duration::from_secs(2)).await;

    assert!(!h.dir.path().join("pending_config.json").exists());
    let view = client.config_get().await.unwrap();
    assert_eq!(view["hasPending"], json!(false));
    assert_eq!(view["current"]["graphics"]["enabled"], json!(false));

    client.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_converge_on_one_driver() {
    let h = Harness::start(driver_bin()).await;
    let a = h.client().await;
    let b = h.client().await;

    let (ra, rb) = tokio::join!(a.start(), b.start());
    let sa = ra.unwrap();
    let sb = rb.unwrap();
    assert_eq!(sa["actual"], json!("running"));
    assert_eq!(sb["actual"], json!("running"));
    // One lifecycle operation was in flight: both callers saw the same
    // child.
    assert_eq!(sa["driverPid"], sb["driverPid"]);
    assert!(sa["driverPid"].is_u64());

    a.close().await;
    b.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn display_methods_forward_to_the_driver() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;

    client.start().await.unwrap();
    let opened = client.open_display().await.unwrap();
    assert_eq!(opened["display"], json!("open"));
    let closed = client.close_display().await.unwrap();
    assert_eq!(closed["display"], json!("closed"));

    let exec = client.driver_exec("ping", None).await.unwrap();
    assert_eq!(exec["method"], json!("ping"));
    assert_eq!(exec["driverResult"]["ok"], json!(true));

    client.close().await;
    h.teardown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn driver_exec_without_driver_is_an_internal_error() {
    let h = Harness::start(driver_bin()).await;
    let client = h.client().await;

    let err = client.driver_exec("ping", None).await.unwrap_err();
    match err {
        ClientError::Channel(ChannelError::Remote(error)) => {
            assert_eq!(error.code, code::INTERNAL_ERROR);
        }
        other => panic!("expected internal error, got {other:?}"),
    }

    client.close().await;
    h.teardown().await;
}
