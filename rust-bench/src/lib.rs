mod config;
mod display;
mod error;
mod metrics;
mod probe;
mod record;
mod report;
mod runner;
mod wire;
mod writer;

pub use config::{
    normalize_base_url, Endpoint, FileConfig, ServiceKind, SessionConfig, DEFAULT_MAX_TOKENS,
    DEFAULT_TIMEOUT,
};
pub use display::{render_lines, response_tail, DisplayFrame, FinishedJob, LiveDisplay, LiveJob};
pub use error::StreamError;
pub use metrics::{count_tokens, JobPhase, MetricSnapshot, MetricsEngine, WordCounter, RATE_EPSILON};
pub use probe::{detect_service, Detection, PROBE_PATHS, PROBE_TIMEOUT};
pub use record::{wall_clock_now, BenchmarkSession, JobStatus, PromptJob, ResultRecord, TIMESTAMP_FORMAT};
pub use report::{FailureRecord, SessionSummary};
pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use runner::{run_session, SessionController, SessionOutcome};
pub use tokio_util::sync::CancellationToken;
pub use wire::{request_body, EventSource, EventStream, StreamEvent, WireAdapter};
pub use writer::{
    format_header, format_record, format_summary, parse_artifact, read_artifact, ParsedArtifact,
    ParsedSummary, ResultWriter,
};
