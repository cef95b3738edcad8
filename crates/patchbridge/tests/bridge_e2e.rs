//! End-to-end: relay + in-memory patcher driven through the websocket client.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use patchbridge::config::{BridgeConfig, Routing};
use patchbridge::graph::Patcher;
use patchbridge::{BridgeHandle, BridgeServer};
use patchbridge_core::client::{BridgeClient, ClientError, ClientOptions};
use patchbridge_core::protocol::{codes, Action, Atom, ServerFrame};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

async fn start(config: BridgeConfig) -> BridgeHandle {
    let server = BridgeServer::bind(BridgeConfig { port: 0, ..config })
        .await
        .expect("bind relay");
    server.spawn(Patcher::new())
}

async fn connect(handle: &BridgeHandle) -> BridgeClient {
    let options = ClientOptions {
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    };
    BridgeClient::connect(&handle.url(), options)
        .await
        .expect("connect client")
}

async fn build_patch(client: &BridgeClient) {
    for action in [
        Action::AddObject {
            obj_type: "cycle~".into(),
            position: [20.0, 20.0],
            varname: "osc".into(),
            args: vec![Atom::Int(440)],
        },
        Action::AddObject {
            obj_type: "ezdac~".into(),
            position: [20.0, 120.0],
            varname: "dac".into(),
            args: vec![],
        },
        Action::ConnectObjects {
            src_varname: "osc".into(),
            dst_varname: "dac".into(),
            outlet_idx: 0,
            inlet_idx: 0,
        },
        Action::ConnectObjects {
            src_varname: "osc".into(),
            dst_varname: "dac".into(),
            outlet_idx: 0,
            inlet_idx: 1,
        },
    ] {
        client.notify(action).await.unwrap();
    }
}

#[tokio::test]
async fn test_build_and_read_back_patch() {
    let handle = start(BridgeConfig::default()).await;
    let client = connect(&handle).await;
    build_patch(&client).await;

    let snap = client.objects_in_patch().await.unwrap();
    assert_eq!(snap.boxes.len(), 2);
    assert_eq!(snap.lines.len(), 2);
    assert_eq!(snap.node("osc").unwrap().text.as_deref(), Some("cycle~ 440"));

    let bounds = client.avoid_rect().await.unwrap().unwrap();
    assert_eq!(bounds.left, 20.0);
    assert_eq!(bounds.top, 20.0);

    let attrs = client.object_attributes("dac").await.unwrap();
    assert!(attrs.contains_key("patching_rect"));

    client.close().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_small_chunks_reassemble() {
    let handle = start(BridgeConfig {
        max_chunk_len: 16,
        ..BridgeConfig::default()
    })
    .await;
    let client = connect(&handle).await;
    build_patch(&client).await;

    let snap = client.objects_in_patch().await.unwrap();
    assert_eq!(snap.boxes.len(), 2);
    assert!(snap.lines.iter().all(|l| l.patchline.source.0 == "osc"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_empty_patch_bounds_are_null() {
    let handle = start(BridgeConfig::default()).await;
    let client = connect(&handle).await;
    assert_eq!(client.avoid_rect().await.unwrap(), None);
    assert!(client.objects_in_selected().await.unwrap().is_empty());
    handle.shutdown().await;
}

#[tokio::test]
async fn test_server_side_rejection_reaches_caller() {
    let handle = start(BridgeConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();

    let frame = json!({"type": "command", "data": {"action": "teleport", "request_id": "r-1"}});
    ws.send(Message::Text(frame.to_string())).await.unwrap();

    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<ServerFrame>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(
        reply,
        ServerFrame::Error {
            request_id: Some("r-1".into()),
            code: codes::UNKNOWN_ACTION.into(),
            message: "Unknown action: teleport".into(),
        }
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn test_bare_command_string_is_accepted() {
    let handle = start(BridgeConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();

    let command = json!({"action": "get_avoid_rect_position", "request_id": "bare"});
    ws.send(Message::Text(command.to_string())).await.unwrap();

    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<Value>(&text).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["request_id"], "bare");
    assert_eq!(reply["last"], true);
    handle.shutdown().await;
}

/// Ping over a raw socket and collect every frame up to the pong.
async fn frames_until_pong<S>(ws: &mut S) -> Vec<ServerFrame>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    ws.send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    let mut frames = Vec::new();
    loop {
        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            let frame: ServerFrame = serde_json::from_str(&text).unwrap();
            if frame == ServerFrame::Pong {
                return frames;
            }
            frames.push(frame);
        }
    }
}

#[tokio::test]
async fn test_origin_routing_isolates_clients() {
    let handle = start(BridgeConfig::default()).await;
    let a = connect(&handle).await;
    let (mut watcher, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();
    frames_until_pong(&mut watcher).await;

    a.objects_in_patch().await.unwrap();

    assert!(frames_until_pong(&mut watcher).await.is_empty());
    handle.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_routing_reaches_all() {
    let handle = start(BridgeConfig {
        routing: Routing::Broadcast,
        ..BridgeConfig::default()
    })
    .await;
    let a = connect(&handle).await;
    let (mut watcher, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();
    frames_until_pong(&mut watcher).await;

    a.avoid_rect().await.unwrap();

    let seen = frames_until_pong(&mut watcher).await;
    assert!(matches!(seen.as_slice(), [ServerFrame::Response { last: true, .. }]));
    handle.shutdown().await;
}

#[tokio::test]
async fn test_bad_port_rejected_and_relay_stays_up() {
    let handle = start(BridgeConfig::default()).await;
    let client = connect(&handle).await;
    let port = handle.port();

    let err = client.set_port(70000).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { ref code, .. } if code == codes::INVALID_PORT));

    let status = client.status().await.unwrap();
    assert_eq!(status.port, port);
    assert_eq!(status.clients, 1);

    // New connections still work on the old port.
    let second = connect(&handle).await;
    assert!(second.ping().await.is_ok());
    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let handle = start(BridgeConfig::default()).await;
    let url = format!("ws://127.0.0.1:{}/elsewhere", handle.port());
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
    handle.shutdown().await;
}
