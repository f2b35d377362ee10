use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llmbench_rs::{
    detect_service, run_session, BenchmarkSession, CancellationToken, Endpoint, EventSource,
    JobStatus, ServiceKind, SessionConfig, StreamError, StreamEvent, WireAdapter,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Debug)]
struct Request {
    path: String,
    /// Request line and headers, lowercased.
    head: String,
    body: String,
}

type Seen = Arc<Mutex<Vec<Request>>>;

/// Serve every connection with `handler(path, body)` and close it.
async fn serve<F>(handler: F) -> (SocketAddr, Seen)
where
    F: Fn(&str, &str) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = handler.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let response = handler(&request.path, &request.body);
                log.lock().unwrap().push(request);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, seen)
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head.split_whitespace().nth(1)?.to_string();
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    Some(Request {
        path,
        head: head.to_ascii_lowercase(),
        body,
    })
}

fn respond(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

fn adapter(stream: bool) -> WireAdapter {
    let config = SessionConfig::default()
        .with_stream(stream)
        .with_request_timeout(Duration::from_secs(5));
    WireAdapter::new(&config).unwrap()
}

async fn collect(
    source: &dyn EventSource,
    endpoint: &Endpoint,
    prompt: &str,
) -> Vec<StreamEvent> {
    let mut stream = source.open(endpoint, "test-model", prompt, Duration::from_secs(5));
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn ollama_ndjson_session_end_to_end() {
    let (addr, seen) = serve(|_, _| {
        respond(
            "200 OK",
            "application/x-ndjson",
            concat!(
                "{\"model\":\"llama3\",\"response\":\"Hello\",\"done\":false}\n",
                "{\"model\":\"llama3\",\"response\":\" world\",\"done\":false}\n",
                "{\"model\":\"llama3\",\"response\":\"\",\"done\":true,\"eval_count\":2}\n",
            ),
        )
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::try_new(addr.to_string(), ServiceKind::Generate, None).unwrap();
    let config = SessionConfig::default()
        .with_results_dir(dir.path())
        .with_job_pause(Duration::ZERO)
        .with_live(false);
    let source = WireAdapter::new(&config).unwrap();
    let mut session = BenchmarkSession::new(
        endpoint,
        "llama3",
        vec![("Prompt 1".to_string(), "Say hello".to_string())],
    );

    let outcome = run_session(&mut session, &source, config, CancellationToken::new())
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.response_text, "Hello world");
    assert_eq!(record.total_tokens_generated, 2);
    assert!(outcome.artifact.exists());

    let requests = seen.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/api/generate");
    let body: Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["model"], "llama3");
    assert_eq!(body["prompt"], "Say hello");
    assert_eq!(body["stream"], true);
}

#[tokio::test]
async fn vllm_event_stream_is_decoded() {
    let (addr, _) = serve(|_, _| {
        respond(
            "200 OK",
            "text/event-stream",
            concat!(
                "data: {\"choices\":[{\"text\":\"Hi\",\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"text\":\" there\",\"finish_reason\":null}]}\n\n",
                "data: [DONE]\n\n",
            ),
        )
    })
    .await;

    let endpoint = Endpoint::try_new(format!("http://{}", addr), ServiceKind::Completion, None).unwrap();
    let events = collect(&adapter(true), &endpoint, "greet").await;

    assert_eq!(
        events,
        vec![
            StreamEvent::chunk("Hi"),
            StreamEvent::chunk(" there"),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn non_streaming_body_is_one_chunk() {
    let (addr, seen) = serve(|_, _| {
        respond(
            "200 OK",
            "application/json",
            "{\"content\":\"All at once\",\"stop\":true,\"timings\":{\"predicted_n\":3}}",
        )
    })
    .await;

    let endpoint = Endpoint::try_new(format!("http://{}", addr), ServiceKind::Chat, None).unwrap();
    let events = collect(&adapter(false), &endpoint, "p").await;

    assert_eq!(events, vec![StreamEvent::chunk("All at once"), StreamEvent::Done]);
    let requests = seen.lock().unwrap().clone();
    assert_eq!(requests[0].path, "/completion");
    let body: Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["stream"], false);
    assert!(body.get("model").is_none());
}

#[tokio::test]
async fn server_error_status_is_reported() {
    let (addr, _) = serve(|_, _| respond("503 Service Unavailable", "text/plain", "overloaded"))
        .await;

    let endpoint = Endpoint::try_new(format!("http://{}", addr), ServiceKind::Generate, None).unwrap();
    let events = collect(&adapter(true), &endpoint, "p").await;

    assert_eq!(
        events,
        vec![StreamEvent::Error(StreamError::Http {
            status: 503,
            body: "overloaded".into(),
        })]
    );
}

#[tokio::test]
async fn refused_connection_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let endpoint = Endpoint::try_new(format!("http://{}", addr), ServiceKind::Generate, None).unwrap();
    let events = collect(&adapter(true), &endpoint, "p").await;

    assert_eq!(events.len(), 1);
    assert!(
        matches!(events[0], StreamEvent::Error(StreamError::Connection(_))),
        "{:?}",
        events
    );
}

#[tokio::test]
async fn api_key_is_sent_in_both_headers() {
    let (addr, seen) = serve(|_, _| respond("401 Unauthorized", "text/plain", "no")).await;

    let endpoint = Endpoint::try_new(
        format!("http://{}", addr),
        ServiceKind::Completion,
        Some("sk-test".to_string()),
    )
    .unwrap();
    let events = collect(&adapter(true), &endpoint, "p").await;
    assert!(matches!(
        events[0],
        StreamEvent::Error(StreamError::Http { status: 401, .. })
    ));

    let head = seen.lock().unwrap()[0].head.clone();
    assert!(head.contains("authorization: bearer sk-test"));
    assert!(head.contains("x-api-key: sk-test"));
}

#[tokio::test]
async fn probe_picks_the_first_answering_path() {
    let (addr, seen) = serve(|path, _| match path {
        "/v1/models" => respond("200 OK", "application/json", "{\"data\":[]}"),
        _ => respond("404 Not Found", "text/plain", "missing"),
    })
    .await;

    let endpoint = Endpoint::try_new(addr.to_string(), ServiceKind::Generate, None).unwrap();
    let client = reqwest::Client::new();
    let detection = detect_service(&client, endpoint.base_url(), endpoint.headers())
        .await
        .unwrap();

    assert_eq!(detection.kind, ServiceKind::Completion);
    assert_eq!(detection.path, "/v1/models");
    assert!(!detection.requires_auth());
    let paths: Vec<String> = seen.lock().unwrap().iter().map(|r| r.path.clone()).collect();
    assert_eq!(paths, vec!["/api/tags", "/v1/models"]);
}

#[tokio::test]
async fn probe_treats_auth_rejection_as_an_answer() {
    let (addr, _) = serve(|path, _| match path {
        "/health" => respond("401 Unauthorized", "text/plain", "key please"),
        _ => respond("404 Not Found", "text/plain", "missing"),
    })
    .await;

    let endpoint = Endpoint::try_new(addr.to_string(), ServiceKind::Generate, None).unwrap();
    let detection = detect_service(&reqwest::Client::new(), endpoint.base_url(), endpoint.headers())
        .await
        .unwrap();

    assert_eq!(detection.kind, ServiceKind::Chat);
    assert!(detection.requires_auth());
}
