//! Service-specific request/response formats normalized into [`StreamEvent`]s.
//!
//! Every call to [`EventSource::open`] spawns one task that owns the HTTP
//! connection and pushes decoded events into a channel. The task always
//! ends with exactly one terminal event (`Done` or `Error`), and dropping
//! the returned [`EventStream`] aborts it, which releases the connection.
//!
//! Body handling is split in two:
//! - framed bodies (NDJSON lines for `Generate`, server-sent events for the
//!   other two kinds) are decoded fragment by fragment; a fragment that
//!   fails to parse is skipped;
//! - aggregate bodies (`stream = false`, or a server that answered with
//!   `application/json` anyway) are read whole and decoded once.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::config::{Endpoint, ServiceKind, SessionConfig};
use crate::error::StreamError;

const EVENT_BUFFER: usize = 256;
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text. `reasoning` marks "thinking" output that some
    /// models emit ahead of the answer.
    TokenChunk { text: String, reasoning: bool },
    Done,
    Error(StreamError),
}

impl StreamEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        StreamEvent::TokenChunk {
            text: text.into(),
            reasoning: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::TokenChunk { .. })
    }
}

/// Opens one generation request and yields its events.
pub trait EventSource: Send + Sync {
    fn open(&self, endpoint: &Endpoint, model: &str, prompt: &str, timeout: Duration)
        -> EventStream;
}

/// Receiving half of one in-flight request.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl EventStream {
    /// Run `producer` on its own task, feeding the returned stream.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<StreamEvent>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(producer(tx));
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Decode an already-open response body of the given kind.
    pub fn from_body<S, B, E>(
        kind: ServiceKind,
        body: S,
        idle_timeout: Duration,
        aggregate: bool,
    ) -> Self
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: Into<Bytes> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::spawn(move |tx| async move {
            if aggregate {
                pump_aggregate(kind, Box::pin(body), idle_timeout, &tx).await;
            } else {
                pump_fragments(kind, body, idle_timeout, &tx).await;
            }
        })
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Abort the producer and drop the connection it holds.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// HTTP implementation of [`EventSource`].
#[derive(Clone, Debug)]
pub struct WireAdapter {
    client: Client,
    stream: bool,
    max_tokens: u32,
}

impl WireAdapter {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .tcp_nodelay(true)
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self::with_client(client, config.stream, config.max_tokens))
    }

    pub fn with_client(client: Client, stream: bool, max_tokens: u32) -> Self {
        Self {
            client,
            stream,
            max_tokens,
        }
    }

    pub fn streaming(&self) -> bool {
        self.stream
    }
}

impl EventSource for WireAdapter {
    fn open(
        &self,
        endpoint: &Endpoint,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> EventStream {
        let kind = endpoint.kind();
        let body = request_body(kind, model, prompt, self.stream, self.max_tokens);
        let url = endpoint.generation_url();
        let client = self.client.clone();
        let headers = endpoint.headers().clone();
        let stream = self.stream;

        EventStream::spawn(move |tx| async move {
            let url = match url {
                Ok(url) => url,
                Err(err) => {
                    let _ = tx
                        .send(StreamEvent::Error(StreamError::Connection(err.to_string())))
                        .await;
                    return;
                }
            };
            debug!(kind = %kind, url = %url, stream, "opening generation request");
            let request = client.post(url).headers(headers).json(&body);
            drive_request(kind, request, stream, timeout, tx).await;
        })
    }
}

/// JSON body for one generation request.
pub fn request_body(
    kind: ServiceKind,
    model: &str,
    prompt: &str,
    stream: bool,
    max_tokens: u32,
) -> Value {
    match kind {
        ServiceKind::Generate => json!({
            "model": model,
            "prompt": prompt,
            "stream": stream,
        }),
        ServiceKind::Completion => json!({
            "model": model,
            "prompt": prompt,
            "max_tokens": max_tokens,
            "stream": stream,
        }),
        // llama.cpp serves whichever model it was started with.
        ServiceKind::Chat => json!({
            "prompt": prompt,
            "n_predict": max_tokens,
            "stream": stream,
        }),
    }
}

async fn drive_request(
    kind: ServiceKind,
    request: reqwest::RequestBuilder,
    stream: bool,
    idle_timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let response = match timeout(idle_timeout, request.send()).await {
        Err(_) => {
            let _ = tx
                .send(StreamEvent::Error(StreamError::Timeout(idle_timeout)))
                .await;
            return;
        }
        Ok(Err(err)) => {
            let error = if err.is_timeout() {
                StreamError::Timeout(idle_timeout)
            } else {
                StreamError::from_reqwest(&err)
            };
            warn!(error = %error, "generation request failed");
            let _ = tx.send(StreamEvent::Error(error)).await;
            return;
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if !status.is_success() {
        let body = match timeout(idle_timeout, response.text()).await {
            Ok(Ok(text)) => truncate(&text, ERROR_BODY_LIMIT),
            _ => String::new(),
        };
        let _ = tx
            .send(StreamEvent::Error(StreamError::Http {
                status: status.as_u16(),
                body,
            }))
            .await;
        return;
    }

    let aggregate = !stream || is_plain_json(&response);
    let body = response.bytes_stream();
    if aggregate {
        pump_aggregate(kind, Box::pin(body), idle_timeout, &tx).await;
    } else {
        pump_fragments(kind, body, idle_timeout, &tx).await;
    }
}

fn is_plain_json(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start().starts_with("application/json"))
        .unwrap_or(false)
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Decoded content of one fragment or one aggregate body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) reasoning: Option<String>,
    pub(crate) text: Option<String>,
    pub(crate) done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    Frame(Frame),
    /// Blank lines and keep-alive events.
    Ignored,
    /// The service reported an error in-band.
    Failed(String),
    Malformed(String),
}

/// Decode one NDJSON line or the data of one server-sent event.
pub(crate) fn decode_fragment(kind: ServiceKind, payload: &str) -> Decoded {
    let payload = payload.trim();
    if payload.is_empty() {
        return Decoded::Ignored;
    }
    if payload == "[DONE]" {
        return Decoded::Frame(Frame {
            done: true,
            ..Frame::default()
        });
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => decode_value(kind, &value),
        Err(err) => Decoded::Malformed(err.to_string()),
    }
}

fn decode_value(kind: ServiceKind, value: &Value) -> Decoded {
    if let Some(message) = in_band_error(value) {
        return Decoded::Failed(message);
    }

    let frame = match kind {
        ServiceKind::Generate => {
            let text = string_field(value, "response");
            let reasoning = string_field(value, "thinking");
            let done = value.get("done").and_then(Value::as_bool);
            if text.is_none() && reasoning.is_none() && done.is_none() {
                return Decoded::Malformed("object has no response/done fields".into());
            }
            Frame {
                reasoning,
                text,
                done: done.unwrap_or(false),
            }
        }
        ServiceKind::Completion => {
            let Some(choice) = value
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
            else {
                return Decoded::Malformed("object has no choices".into());
            };
            let text = string_field(choice, "text")
                .or_else(|| choice.get("delta").and_then(|d| string_field(d, "content")))
                .or_else(|| choice.get("message").and_then(|m| string_field(m, "content")));
            let reasoning = choice
                .get("delta")
                .and_then(|d| string_field(d, "reasoning_content"));
            let done = choice
                .get("finish_reason")
                .map(|reason| !reason.is_null())
                .unwrap_or(false);
            Frame {
                reasoning,
                text,
                done,
            }
        }
        ServiceKind::Chat => {
            let text = string_field(value, "content");
            let stop = value.get("stop").and_then(Value::as_bool);
            if text.is_none() && stop.is_none() {
                return Decoded::Malformed("object has no content/stop fields".into());
            }
            Frame {
                reasoning: None,
                text,
                done: stop.unwrap_or(false),
            }
        }
    };
    Decoded::Frame(frame)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn in_band_error(value: &Value) -> Option<String> {
    match value.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Decode a complete non-streamed response body.
pub(crate) fn decode_aggregate(kind: ServiceKind, body: &str) -> Decoded {
    match serde_json::from_str::<Value>(body.trim()) {
        Ok(value) => match decode_value(kind, &value) {
            Decoded::Frame(mut frame) => {
                frame.done = true;
                Decoded::Frame(frame)
            }
            other => other,
        },
        Err(err) => Decoded::Malformed(err.to_string()),
    }
}

/// One framed unit of a streamed body.
enum Fragment {
    Payload(String),
    /// The framing layer could not read this unit; later ones may be fine.
    Unreadable(String),
}

/// Split a streamed body into fragments: lines for NDJSON, events for SSE.
/// A transport failure surfaces as `Err`.
fn frame_body<S, B, E>(
    kind: ServiceKind,
    body: S,
) -> BoxStream<'static, std::result::Result<Fragment, String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Into<Bytes> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let bytes = body.map(|chunk| {
        chunk
            .map(Into::<Bytes>::into)
            .map_err(|err| err.to_string())
    });
    match kind {
        ServiceKind::Generate => {
            let reader = StreamReader::new(bytes.map(|chunk| chunk.map_err(io::Error::other)));
            FramedRead::new(reader, LinesCodec::new())
                .map(|line| line.map(Fragment::Payload).map_err(|err| err.to_string()))
                .boxed()
        }
        ServiceKind::Completion | ServiceKind::Chat => bytes
            .eventsource()
            .map(|event| match event {
                Ok(event) => Ok(Fragment::Payload(event.data)),
                Err(EventStreamError::Transport(err)) => Err(err),
                Err(err) => Ok(Fragment::Unreadable(err.to_string())),
            })
            .boxed(),
    }
}

/// Tracks what has been forwarded so the terminal event can be chosen.
#[derive(Debug, Default)]
struct PumpState {
    tokens_seen: bool,
    malformed: usize,
    last_malformed: Option<String>,
}

enum Flow {
    Continue,
    Finished,
}

async fn forward_frame(
    frame: Frame,
    state: &mut PumpState,
    tx: &mpsc::Sender<StreamEvent>,
) -> std::result::Result<Flow, ()> {
    if let Some(reasoning) = frame.reasoning.filter(|t| !t.is_empty()) {
        state.tokens_seen = true;
        tx.send(StreamEvent::TokenChunk {
            text: reasoning,
            reasoning: true,
        })
        .await
        .map_err(|_| ())?;
    }
    if let Some(text) = frame.text.filter(|t| !t.is_empty()) {
        state.tokens_seen = true;
        tx.send(StreamEvent::chunk(text)).await.map_err(|_| ())?;
    }
    if frame.done {
        tx.send(StreamEvent::Done).await.map_err(|_| ())?;
        return Ok(Flow::Finished);
    }
    Ok(Flow::Continue)
}

async fn handle_fragment(
    kind: ServiceKind,
    fragment: Fragment,
    state: &mut PumpState,
    tx: &mpsc::Sender<StreamEvent>,
) -> std::result::Result<Flow, ()> {
    let decoded = match &fragment {
        Fragment::Payload(payload) => decode_fragment(kind, payload),
        Fragment::Unreadable(reason) => Decoded::Malformed(reason.clone()),
    };
    match decoded {
        Decoded::Frame(frame) => forward_frame(frame, state, tx).await,
        Decoded::Ignored => Ok(Flow::Continue),
        Decoded::Failed(message) => {
            tx.send(StreamEvent::Error(StreamError::Protocol(format!(
                "service reported an error: {}",
                message
            ))))
            .await
            .map_err(|_| ())?;
            Ok(Flow::Finished)
        }
        Decoded::Malformed(reason) => {
            if let Fragment::Payload(payload) = &fragment {
                debug!(kind = %kind, reason = %reason, fragment = %truncate(payload, 120), "skipping malformed fragment");
            } else {
                debug!(kind = %kind, reason = %reason, "skipping unreadable fragment");
            }
            state.malformed += 1;
            state.last_malformed = Some(reason);
            Ok(Flow::Continue)
        }
    }
}

/// Terminal event for a body that ended without an explicit marker.
fn implicit_terminal(state: &PumpState) -> StreamEvent {
    if state.tokens_seen {
        StreamEvent::Done
    } else if state.malformed > 0 {
        StreamEvent::Error(StreamError::Protocol(format!(
            "no decodable fragments ({} malformed, last: {})",
            state.malformed,
            state.last_malformed.as_deref().unwrap_or("unknown")
        )))
    } else {
        StreamEvent::Error(StreamError::EmptyStream)
    }
}

pub(crate) async fn pump_fragments<S, B, E>(
    kind: ServiceKind,
    body: S,
    idle_timeout: Duration,
    tx: &mpsc::Sender<StreamEvent>,
) where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: Into<Bytes> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let mut fragments = frame_body(kind, body);
    let mut state = PumpState::default();

    loop {
        let next = match timeout(idle_timeout, fragments.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx
                    .send(StreamEvent::Error(StreamError::Timeout(idle_timeout)))
                    .await;
                return;
            }
        };

        match next {
            Some(Ok(fragment)) => match handle_fragment(kind, fragment, &mut state, tx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) | Err(()) => return,
            },
            Some(Err(err)) => {
                let _ = tx
                    .send(StreamEvent::Error(StreamError::Connection(err)))
                    .await;
                return;
            }
            None => {
                let _ = tx.send(implicit_terminal(&state)).await;
                return;
            }
        }
    }
}

pub(crate) async fn pump_aggregate<S, B, E>(
    kind: ServiceKind,
    mut body: S,
    idle_timeout: Duration,
    tx: &mpsc::Sender<StreamEvent>,
) where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: Into<Bytes>,
    E: fmt::Display,
{
    let mut buffer = Vec::new();
    loop {
        match timeout(idle_timeout, body.next()).await {
            Err(_) => {
                let _ = tx
                    .send(StreamEvent::Error(StreamError::Timeout(idle_timeout)))
                    .await;
                return;
            }
            Ok(Some(Ok(bytes))) => {
                let bytes: Bytes = bytes.into();
                buffer.extend_from_slice(&bytes);
            }
            Ok(Some(Err(err))) => {
                let _ = tx
                    .send(StreamEvent::Error(StreamError::Connection(err.to_string())))
                    .await;
                return;
            }
            Ok(None) => break,
        }
    }

    let text = String::from_utf8_lossy(&buffer);
    if text.trim().is_empty() {
        let _ = tx.send(StreamEvent::Error(StreamError::EmptyStream)).await;
        return;
    }

    let mut state = PumpState::default();
    let event = match decode_aggregate(kind, &text) {
        Decoded::Frame(frame) => {
            let _ = forward_frame(frame, &mut state, tx).await;
            return;
        }
        Decoded::Ignored => StreamError::EmptyStream,
        Decoded::Failed(message) => {
            StreamError::Protocol(format!("service reported an error: {}", message))
        }
        Decoded::Malformed(reason) => {
            StreamError::Protocol(format!("unreadable response body: {}", reason))
        }
    };
    let _ = tx.send(StreamEvent::Error(event)).await;
}
