//! End-to-end tests against an in-process fake ttyd server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use ttypilot::{
    ChunkType, ClientPool, StreamChunk, TerminalClient, TerminalProfile, TerminalState, TtydConfig,
};

/// Output payload whose clean text carries the assistant's ready prompt.
const READY: &str = "\x1b[1m!>\x1b[0m \r";

#[derive(Clone)]
struct Scripted {
    delay: Duration,
    output: String,
}

type ReplyFn = dyn Fn(&str) -> Vec<Scripted> + Send + Sync;

#[derive(Clone)]
struct FakeTtyd {
    banner: Arc<Vec<String>>,
    replies: Arc<ReplyFn>,
    seen: mpsc::UnboundedSender<String>,
}

async fn spawn_fake_ttyd(
    banner: Vec<&str>,
    replies: Arc<ReplyFn>,
) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let state = FakeTtyd {
        banner: Arc::new(banner.into_iter().map(str::to_string).collect()),
        replies,
        seen: seen_tx,
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen_rx)
}

async fn ws_handler(State(state): State<FakeTtyd>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.protocols(["tty"])
        .on_upgrade(move |socket| drive_session(socket, state))
}

async fn drive_session(mut socket: WebSocket, state: FakeTtyd) {
    // first client frame is the JSON init message
    let Some(Ok(Message::Text(init))) = socket.recv().await else {
        return;
    };
    let _ = state.seen.send(format!("init:{init}"));

    for payload in state.banner.iter() {
        if socket
            .send(Message::Text(format!("0{payload}")))
            .await
            .is_err()
        {
            return;
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        let raw = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        let _ = state.seen.send(raw.clone());
        if let Some(input) = raw.strip_prefix('0') {
            for step in (state.replies)(input) {
                tokio::time::sleep(step.delay).await;
                if socket
                    .send(Message::Text(format!("0{}", step.output)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

fn scripted(entries: &[(&str, &[(u64, &str)])]) -> Arc<ReplyFn> {
    let map: HashMap<String, Vec<Scripted>> = entries
        .iter()
        .map(|(command, steps)| {
            (
                command.to_string(),
                steps
                    .iter()
                    .map(|(delay_ms, output)| Scripted {
                        delay: Duration::from_millis(*delay_ms),
                        output: output.to_string(),
                    })
                    .collect(),
            )
        })
        .collect();
    Arc::new(move |input| {
        let key = input.trim_end_matches(['\r', '\n']);
        map.get(key).cloned().unwrap_or_default()
    })
}

fn assistant_banner() -> Vec<&'static str> {
    vec![
        "Welcome to the assistant CLI\n",
        "loading mcp servers...\n",
        READY,
    ]
}

fn config_for(addr: SocketAddr, profile: TerminalProfile) -> TtydConfig {
    TtydConfig::new("127.0.0.1", addr.port(), "demo", "password123").with_profile(profile)
}

async fn collect(stream: &mut ttypilot::ChunkStream) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn initialize_drains_startup_noise_then_streams_content_and_complete() {
    let replies = scripted(&[(
        "echo hi",
        &[(0, "echo hi\r\n"), (0, "hi\n"), (0, READY)][..],
    )]);
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), replies).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Assistant));
    client.initialize().await.expect("initialize");
    assert!(client.is_connected());
    assert_eq!(client.terminal_state(), TerminalState::Idle);
    assert!(client.can_execute_command());

    let mut stream = client.execute_command_stream("echo hi", Duration::from_secs(5));
    let chunks = collect(&mut stream).await;

    // startup banner must never surface as content
    for chunk in &chunks {
        assert!(
            !chunk.content.contains("Welcome"),
            "banner leaked into command stream: {chunk:?}"
        );
    }

    let kinds: Vec<ChunkType> = chunks.iter().map(|chunk| chunk.kind).collect();
    assert_eq!(kinds, vec![ChunkType::Content, ChunkType::Complete]);
    assert_eq!(chunks[0].content, "hi");
    assert_eq!(chunks[1].metadata["command_success"], true);

    assert_eq!(client.terminal_state(), TerminalState::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn handshake_sends_exact_init_frame_and_resize_frame() {
    let (addr, mut seen) = spawn_fake_ttyd(assistant_banner(), scripted(&[])).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Assistant));
    client.initialize().await.expect("initialize");

    let init = seen.recv().await.expect("init frame");
    assert_eq!(
        init,
        "init:{\"columns\":240,\"rows\":60,\"AuthToken\":\"ZGVtbzpwYXNzd29yZDEyMw==\"}"
    );

    assert!(client.resize_terminal(60, 240));
    let resize = seen.recv().await.expect("resize frame");
    assert_eq!(resize, "1{\"columns\":240,\"rows\":60}");

    // exactly one resize frame went over the wire
    assert!(
        seen.try_recv().is_err(),
        "unexpected extra frame after resize"
    );
    client.shutdown().await;
}

#[tokio::test]
async fn silent_command_fails_with_measured_silence() {
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), scripted(&[])).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Assistant));
    client.initialize().await.expect("initialize");

    let budget = Duration::from_millis(400);
    let mut stream = client.execute_command_stream("hang forever", budget);
    let chunks = collect(&mut stream).await;

    assert_eq!(chunks.len(), 1);
    let chunk = &chunks[0];
    assert_eq!(chunk.kind, ChunkType::Error);
    assert_eq!(chunk.metadata["error_kind"], "silence_timeout");
    let silence = chunk.metadata["silence_seconds"].as_f64().unwrap();
    assert!(
        silence >= budget.as_secs_f64(),
        "reported silence {silence} below budget"
    );

    // the session stays usable after a timeout
    assert_eq!(client.terminal_state(), TerminalState::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn chatty_command_outlives_silence_budget() {
    let replies = scripted(&[(
        "work",
        &[
            (100, "tick 1\n"),
            (100, "tick 2\n"),
            (100, "tick 3\n"),
            (100, "tick 4\n"),
            (100, READY),
        ][..],
    )]);
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), replies).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Assistant));
    client.initialize().await.expect("initialize");

    let budget = Duration::from_millis(300);
    let started = Instant::now();
    let mut stream = client.execute_command_stream("work", budget);
    let chunks = collect(&mut stream).await;
    let elapsed = started.elapsed();

    // each gap was under the budget but the whole run was well over it
    assert!(elapsed > budget, "test ran too fast to prove anything");
    assert_eq!(chunks.last().unwrap().kind, ChunkType::Complete);
    let contents: Vec<&str> = chunks
        .iter()
        .filter(|chunk| chunk.kind == ChunkType::Content)
        .map(|chunk| chunk.content.as_str())
        .collect();
    assert_eq!(contents, vec!["tick 1", "tick 2", "tick 3", "tick 4"]);
    client.shutdown().await;
}

#[tokio::test]
async fn busy_session_refuses_second_command() {
    let replies = scripted(&[("slow", &[(250, READY)][..])]);
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), replies).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Assistant));
    client.initialize().await.expect("initialize");

    let mut first = client.execute_command_stream("slow", Duration::from_secs(5));
    assert_eq!(client.terminal_state(), TerminalState::Busy);
    assert!(!client.can_execute_command());

    let mut second = client.execute_command_stream("nope", Duration::from_secs(5));
    let refusal = second.next().await.expect("refusal chunk");
    assert_eq!(refusal.kind, ChunkType::Error);
    assert_eq!(refusal.metadata["error_kind"], "command_refused");
    assert!(second.next().await.is_none());

    let chunks = collect(&mut first).await;
    assert_eq!(chunks.last().unwrap().kind, ChunkType::Complete);
    assert_eq!(client.terminal_state(), TerminalState::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn dropping_the_stream_cancels_and_restores_idle() {
    let replies = scripted(&[("slow", &[(5_000, READY)][..])]);
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), replies).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Assistant));
    client.initialize().await.expect("initialize");

    let stream = client.execute_command_stream("slow", Duration::from_secs(30));
    assert_eq!(client.terminal_state(), TerminalState::Busy);
    drop(stream);
    assert_eq!(client.terminal_state(), TerminalState::Idle);
    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_command_wait_does_not_deadlock() {
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), scripted(&[])).await;

    let client = Arc::new(TerminalClient::new(config_for(
        addr,
        TerminalProfile::Assistant,
    )));
    client.initialize().await.expect("initialize");

    let mut stream = client.execute_command_stream("hang", Duration::from_millis(700));

    let for_shutdown = Arc::clone(&client);
    let shutdown = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        for_shutdown.shutdown().await;
    });

    let chunks = tokio::time::timeout(Duration::from_secs(3), collect(&mut stream))
        .await
        .expect("stream must terminate");
    assert_eq!(chunks.last().unwrap().kind, ChunkType::Error);
    shutdown.await.unwrap();
    assert_eq!(client.terminal_state(), TerminalState::Unavailable);
}

#[tokio::test]
async fn generic_profile_completes_via_prompt_hook_marker() {
    let replies = scripted(&[(
        "pwd",
        &[(0, "pwd\r\n/home/demo\r\n"), (0, "\x1b]697;ExitCode=0\x07")][..],
    )]);
    let (addr, _seen) = spawn_fake_ttyd(vec!["login banner\n"], replies).await;

    let client = TerminalClient::new(config_for(addr, TerminalProfile::Generic));
    client.initialize().await.expect("initialize");
    assert_eq!(client.terminal_state(), TerminalState::Idle);

    let mut stream = client.execute_command_stream("pwd", Duration::from_secs(5));
    let chunks = collect(&mut stream).await;

    let kinds: Vec<ChunkType> = chunks.iter().map(|chunk| chunk.kind).collect();
    assert_eq!(kinds, vec![ChunkType::Content, ChunkType::Complete]);
    assert_eq!(chunks[0].content, "/home/demo");
    client.shutdown().await;
}

#[tokio::test]
async fn pool_bounds_sessions_and_evicts_least_recently_used() {
    let (addr, _seen) = spawn_fake_ttyd(assistant_banner(), scripted(&[])).await;
    let config = config_for(addr, TerminalProfile::Assistant);

    let pool = ClientPool::new(1);
    let first = pool.acquire("alerts", config.clone()).await.expect("first");
    assert_eq!(pool.len().await, 1);

    // budget exhausted: the idle first session is evicted to make room
    let second = pool.acquire("reports", config.clone()).await.expect("second");
    assert_eq!(pool.len().await, 1);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!first.lock().await.is_connected());

    // re-acquiring an existing id returns the same session
    let again = pool.acquire("reports", config).await.expect("again");
    assert!(Arc::ptr_eq(&second, &again));

    pool.release("reports").await;
    assert_eq!(pool.len().await, 0);
}
