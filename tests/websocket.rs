use futures_util::{SinkExt, StreamExt};
use operator_agent_lib::server::{router, AppState};
use operator_agent_lib::settings::Settings;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> String {
    spawn_server_with(Settings::default()).await
}

async fn spawn_server_with(settings: Settings) -> String {
    let app = router(AppState::new(settings));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("ws://{addr}/ws")
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, json: &str) {
    socket.send(Message::Text(json.to_string())).await.unwrap();
}

/// Read one turn and return the event types in order.
async fn read_turn(socket: &mut Socket) -> (Vec<String>, Vec<Value>) {
    let mut kinds = Vec::new();
    let mut events = Vec::new();
    loop {
        let event = next_json(socket).await;
        let kind = event["type"].as_str().unwrap().to_string();
        let done = kind == "stream_complete" || kind == "error";
        kinds.push(kind);
        events.push(event);
        if done {
            return (kinds, events);
        }
    }
}

#[tokio::test]
async fn test_event_order_for_a_task() {
    let (mut socket, _) = connect_async(spawn_server().await).await.unwrap();

    let info = next_json(&mut socket).await;
    assert_eq!(info["type"], "session_info");
    assert!(info["session_id"].as_str().is_some_and(|id| !id.is_empty()));

    send(&mut socket, r#"{"type":"task","task":"ping"}"#).await;
    let (kinds, events) = read_turn(&mut socket).await;

    assert_eq!(kinds.first().map(String::as_str), Some("stream_start"));
    assert_eq!(kinds.last().map(String::as_str), Some("stream_complete"));
    assert!(kinds[1..kinds.len() - 1].iter().all(|k| k == "text_delta"));

    let streamed: String = events
        .iter()
        .filter(|e| e["type"] == "text_delta")
        .map(|e| e["content"].as_str().unwrap())
        .collect();
    assert_eq!(events.last().unwrap()["final_text"], streamed.as_str());
}

#[tokio::test]
async fn test_control_messages_and_malformed_input() {
    let (mut socket, _) = connect_async(spawn_server().await).await.unwrap();
    next_json(&mut socket).await;

    send(&mut socket, "this is not json").await;
    send(&mut socket, r#"{"type":"ping"}"#).await;
    assert_eq!(next_json(&mut socket).await["type"], "pong");

    send(&mut socket, r#"{"type":"task","task":"hello"}"#).await;
    read_turn(&mut socket).await;

    send(&mut socket, r#"{"type":"get_history"}"#).await;
    let history = next_json(&mut socket).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["messages"].as_array().unwrap().len(), 2);
    assert_eq!(history["messages"][0]["role"], "user");

    send(&mut socket, r#"{"type":"clear_history"}"#).await;
    assert_eq!(next_json(&mut socket).await["type"], "history_cleared");
}

#[tokio::test]
async fn test_reconnect_with_session_id_restores_history() {
    let url = spawn_server().await;

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    let session_id = next_json(&mut first).await["session_id"].as_str().unwrap().to_string();
    send(&mut first, r#"{"type":"task","task":"remember this"}"#).await;
    read_turn(&mut first).await;
    first.close(None).await.unwrap();
    // the id is resumable once the server has let go of the first socket
    while let Ok(Some(Ok(_))) = tokio::time::timeout(Duration::from_secs(5), first.next()).await {}

    let (mut second, _) = connect_async(format!("{url}?session_id={session_id}")).await.unwrap();
    let info = next_json(&mut second).await;
    assert_eq!(info["session_id"], session_id.as_str());
    assert_eq!(info["history"][0]["content"], "remember this");
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_missed_pongs() {
    let url = spawn_server_with(Settings { keepalive_secs: 1, ..Settings::default() }).await;
    let (mut socket, _) = connect_async(url).await.unwrap();
    next_json(&mut socket).await;

    // not reading means the client never answers the server's pings
    tokio::time::sleep(Duration::from_secs(7)).await;

    let mut closed = false;
    while let Ok(frame) = tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
        match frame {
            Some(Ok(Message::Close(_)) | Err(_)) | None => {
                closed = true;
                break;
            }
            Some(Ok(Message::Text(text))) => panic!("unexpected message {text}"),
            Some(Ok(_)) => {}
        }
    }
    assert!(closed, "server kept a silent connection open");
}

#[tokio::test]
async fn test_ponging_client_stays_connected() {
    let url = spawn_server_with(Settings { keepalive_secs: 1, ..Settings::default() }).await;
    let (mut socket, _) = connect_async(url).await.unwrap();
    next_json(&mut socket).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(7);
    let mut pings = 0;
    while let Ok(frame) = tokio::time::timeout_at(deadline, socket.next()).await {
        match frame {
            Some(Ok(Message::Ping(_))) => {
                pings += 1;
                // the pong is queued while reading; push it out now
                socket.flush().await.unwrap();
            }
            Some(Ok(Message::Close(_)) | Err(_)) | None => panic!("connection closed despite pongs"),
            Some(Ok(_)) => {}
        }
    }
    assert!(pings >= 5, "expected regular keepalive pings, saw {pings}");

    send(&mut socket, r#"{"type":"ping"}"#).await;
    assert_eq!(next_json(&mut socket).await["type"], "pong");
}
