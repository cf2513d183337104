//! End-to-end tests against an in-process gotty server.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use gotty_client::{ClientConfig, ConnectionState, GottyClient};

/// `Basic base64("admin:admin")`.
const EXPECTED_AUTH: &str = "Basic YWRtaW46YWRtaW4=";

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Echoes commands like a shell, answering `echo X` with `X`.
    Shell,
    /// Accepts input and never answers.
    Silent,
    /// Drops the socket as soon as input arrives.
    DropOnInput,
}

struct MockServer {
    url: String,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, mode, Arc::clone(&log)));
            }
        });

        Self {
            url: format!("http://{}", addr),
            received,
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    fn config(&self, password: &str) -> ClientConfig {
        ClientConfig::new(self.url.as_str(), "admin", password)
            .with_preflight(false)
            .with_timeout(5)
            .with_quiet_period(Duration::from_millis(150))
    }

    fn client(&self) -> GottyClient {
        GottyClient::new(self.config("admin")).unwrap()
    }
}

fn output_frame(text: &str) -> Message {
    Message::Text(format!("1{}", BASE64.encode(text)))
}

async fn serve(stream: TcpStream, mode: Mode, log: Arc<Mutex<Vec<String>>>) {
    let check_auth = |req: &Request, mut resp: Response| {
        let authorized = req
            .headers()
            .get(AUTHORIZATION)
            .map(|v| v == EXPECTED_AUTH)
            .unwrap_or(false);
        if !authorized {
            let mut err = ErrorResponse::new(Some("unauthorized".to_string()));
            *err.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(err);
        }
        if let Some(protocol) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            resp.headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        Ok(resp)
    };

    let Ok(mut ws) = accept_hdr_async(stream, check_auth).await else {
        return;
    };

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(frame) = msg else {
            continue;
        };
        log.lock().unwrap().push(frame.clone());

        if frame.starts_with('{') {
            // Auth handshake
            let _ = ws.send(Message::Text("3bash@mock".to_string())).await;
            continue;
        }

        match (frame.chars().next(), mode) {
            (Some('1'), Mode::Shell) => {
                let command = frame[1..].trim_end();
                let mut chunks = vec![format!("{}\r\n", command)];
                if let Some(rest) = command.strip_prefix("echo ") {
                    chunks.push(format!("{}\r\n", rest));
                }
                chunks.push("$ ".to_string());
                for chunk in chunks {
                    if ws.send(output_frame(&chunk)).await.is_err() {
                        return;
                    }
                }
            }
            (Some('1'), Mode::DropOnInput) => return,
            (Some('2'), _) => {
                let _ = ws.send(Message::Text("2".to_string())).await;
            }
            _ => {}
        }
    }
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_execute_command_end_to_end() {
    let server = MockServer::start(Mode::Shell).await;
    let client = server.client();

    let outputs = Arc::new(Mutex::new(Vec::<String>::new()));
    let commands = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let outputs = Arc::clone(&outputs);
        client.add_output_callback(move |text| outputs.lock().unwrap().push(text.to_string()));
        let commands = Arc::clone(&commands);
        client.add_command_callback(move |cmd| commands.lock().unwrap().push(cmd.to_string()));
    }

    assert!(client.connect().await);
    assert!(client.is_connected());
    assert!(client.session_id().is_some());

    let response = client
        .execute_command("echo hi", true, Some(Duration::from_secs(3)))
        .await;

    assert!(response.success, "{}", response.message);
    assert_eq!(response.status_code, 0);
    assert!(response.data.as_deref().unwrap().contains("hi"));
    assert_eq!(client.get_command_history(), vec!["echo hi"]);

    let received = server.received();
    assert_eq!(received[0], r#"{"Arguments":"","AuthToken":"admin:admin"}"#);
    assert!(received.contains(&"1echo hi\n".to_string()));

    assert!(eventually(|| commands.lock().unwrap().as_slice() == ["echo hi"]).await);
    assert!(eventually(|| outputs.lock().unwrap().concat().contains("hi\r\n")).await);
    assert!(eventually(|| client.window_title().as_deref() == Some("bash@mock")).await);

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // History stays readable after close.
    let output = client.get_terminal_output(None).concat();
    assert!(output.contains("hi\r\n"));
    assert_eq!(client.get_terminal_output(Some(1)), vec!["$ "]);
}

#[tokio::test]
async fn test_invalid_credentials() {
    let server = MockServer::start(Mode::Shell).await;
    let client = GottyClient::new(server.config("wrong")).unwrap();

    assert!(!client.connect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let response = client.execute_command("ls", true, None).await;
    assert!(!response.success);
    assert_eq!(response.status_code, 4);
    assert!(client.get_command_history().is_empty());
}

#[tokio::test]
async fn test_preflight_against_non_http_endpoint_fails() {
    let server = MockServer::start(Mode::Shell).await;
    let config = server.config("admin").with_preflight(true);
    let client = GottyClient::new(config).unwrap();

    assert!(!client.connect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_timeout_keeps_connection() {
    let server = MockServer::start(Mode::Silent).await;
    let client = server.client();
    assert!(client.connect().await);

    let started = Instant::now();
    let response = client
        .execute_command("sleep 100", true, Some(Duration::from_millis(300)))
        .await;

    assert!(!response.success);
    assert_eq!(response.status_code, 2);
    assert!(response.data.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));

    // Not resent, and the session is still usable.
    assert!(client.is_connected());
    assert!(client.send_command("true").await);
    assert_eq!(client.get_command_history(), vec!["sleep 100", "true"]);

    client.close().await;
}

#[tokio::test]
async fn test_remote_drop_resolves_pending_command() {
    let server = MockServer::start(Mode::DropOnInput).await;
    let client = server.client();
    assert!(client.connect().await);

    let started = Instant::now();
    let response = client
        .execute_command("ls", true, Some(Duration::from_secs(10)))
        .await;

    assert!(!response.success);
    assert_eq!(response.status_code, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(eventually(|| client.state() == ConnectionState::Disconnected).await);

    let response = client.execute_command("ls", true, None).await;
    assert_eq!(response.status_code, 4);
}

#[tokio::test]
async fn test_close_unblocks_pending_command() {
    let server = MockServer::start(Mode::Silent).await;
    let client = Arc::new(server.client());
    assert!(client.connect().await);

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .execute_command("cat", true, Some(Duration::from_secs(10)))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    client.close().await;

    let response = pending.await.unwrap();
    assert!(!response.success);
    assert_eq!(response.status_code, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_double_close_and_reconnect() {
    let server = MockServer::start(Mode::Shell).await;
    let client = server.client();

    assert!(client.connect().await);
    let first = client.session_id().unwrap();

    client.close().await;
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert!(client.connect().await);
    let second = client.session_id().unwrap();
    assert_ne!(first, second);

    let response = client
        .execute_command("echo again", true, Some(Duration::from_secs(3)))
        .await;
    assert!(response.data.unwrap().contains("again"));

    client.close().await;
}

#[tokio::test]
async fn test_concurrent_commands_are_serialized() {
    let server = MockServer::start(Mode::Shell).await;
    let client = server.client();
    assert!(client.connect().await);

    let timeout = Some(Duration::from_secs(3));
    let (a, b) = tokio::join!(
        client.execute_command("echo first", true, timeout),
        client.execute_command("echo second", true, timeout),
    );

    assert!(a.success && b.success);
    let (a, b) = (a.data.unwrap(), b.data.unwrap());
    // Each response only holds output produced after its own submission.
    assert!(a.contains("first") ^ b.contains("first"));
    assert!(a.contains("second") ^ b.contains("second"));

    let mut history = client.get_command_history();
    history.sort();
    assert_eq!(history, vec!["echo first", "echo second"]);

    client.close().await;
}

#[tokio::test]
async fn test_readers_during_command() {
    let server = MockServer::start(Mode::Shell).await;
    let client = Arc::new(server.client());
    assert!(client.connect().await);

    let reader = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            for _ in 0..200 {
                let tail = client.get_terminal_output(Some(2));
                let all = client.get_terminal_output(None);
                assert!(tail.len() <= 2);
                // Later appends never reorder what was already visible.
                if !tail.is_empty() {
                    assert!(all.windows(tail.len()).any(|w| w == tail.as_slice()));
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for i in 0..3 {
        let response = client
            .execute_command(&format!("echo {}", i), true, Some(Duration::from_secs(3)))
            .await;
        assert!(response.success);
    }

    reader.await.unwrap();
    client.close().await;
}
