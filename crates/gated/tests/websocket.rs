//! WebSocket transport scenarios: the WS message boundary replaces the
//! length prefix, everything else behaves like TCP.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use gated::config::Protocol;
use gated_core::protocol::frame::{self, ContentType};
use gated_core::protocol::message::{
    decode_client, encode_client, ClientMessage, LoginReq, Ping, Pong, UserLogin, UserLogout,
};

use common::{recv_cluster, test_config, TestCluster};

fn ws_payload<M: ClientMessage>(m: &M) -> Vec<u8> {
    let body = encode_client(m, ContentType::Binary).unwrap();
    frame::encode_message(M::TYPE, &body).to_vec()
}

#[tokio::test]
async fn websocket_binary_login_and_ping() {
    let cluster = TestCluster::new();
    cluster.seed_routes().await;
    cluster.token("T", 42, None);
    let mut user_sub = cluster.subscribe("svc/user/1").await;

    let mut cfg = test_config(1);
    cfg.net.protocol = Protocol::Websocket;
    let gate = cluster.start_gate(cfg).await;

    let url = format!("ws://{}/", gate.local_addr().unwrap());
    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::binary(ws_payload(&LoginReq { token: "T".into() })))
        .await
        .unwrap();
    let login: UserLogin = recv_cluster(&mut user_sub).await;
    assert_eq!(login.uid, 42);
    assert!(!login.race);

    tx.send(Message::binary(ws_payload(&Ping { content: "ws".into() })))
        .await
        .unwrap();

    // Skip any control frames until the Pong arrives.
    let pong = loop {
        let msg = rx.next().await.unwrap().unwrap();
        if !msg.is_binary() {
            continue;
        }
        let (typ, body) = frame::split_message(msg.into_data()).unwrap();
        assert_eq!(typ, Pong::TYPE);
        break decode_client::<Pong>(body, ContentType::Binary).unwrap();
    };
    assert_eq!(pong.content, "ws");

    // Closing the socket releases the user like a TCP disconnect.
    tx.send(Message::Close(None)).await.unwrap();
    drop(tx);
    drop(rx);
    let logout: UserLogout = recv_cluster(&mut user_sub).await;
    assert_eq!(logout.uid, 42);
}

#[tokio::test]
async fn websocket_text_session_speaks_commands() {
    let cluster = TestCluster::new();
    cluster.seed_routes().await;

    let mut cfg = test_config(1);
    cfg.net.protocol = Protocol::Websocket;
    let gate = cluster.start_gate(cfg).await;

    let url = format!("ws://{}/", gate.local_addr().unwrap());
    let (ws, _) = connect_async(&url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::text(".ping")).await.unwrap();
    let reply = loop {
        let msg = rx.next().await.unwrap().unwrap();
        if msg.is_text() {
            break msg.into_text().unwrap();
        }
    };
    assert_eq!(reply.as_str().trim_end(), "+pong");

    // A binary frame on a text session is a framing violation; the server
    // closes.
    tx.send(Message::binary(ws_payload(&Ping { content: "no".into() })))
        .await
        .unwrap();
    loop {
        match rx.next().await {
            Some(Ok(msg)) if msg.is_close() => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
}
