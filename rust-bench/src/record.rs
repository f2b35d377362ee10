use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDateTime, SubsecRound};

use crate::config::Endpoint;

/// Timestamp layout used in result files and the live view.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wall-clock "now" at the resolution result files can represent.
pub fn wall_clock_now() -> NaiveDateTime {
    Local::now().trunc_subsecs(0).naive_local()
}

/// One prompt submitted to one model; read-only once the session starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptJob {
    /// 1-based position in the session.
    pub index: usize,
    pub name: String,
    pub prompt: String,
    pub model: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timed_out" => Ok(JobStatus::TimedOut),
            other => Err(anyhow!("unknown job status: {}", other)),
        }
    }
}

/// Finalized outcome of a job. Durations are fractional seconds kept at
/// full precision; rounding happens only when written or displayed.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRecord {
    pub name: String,
    pub prompt: String,
    pub model: String,
    pub host: String,
    pub started_at: NaiveDateTime,
    pub completed_at: NaiveDateTime,
    pub total_elapsed_time: f64,
    pub prompt_delay_time: f64,
    pub generation_time: f64,
    pub total_tokens_generated: u64,
    pub generation_speed_tokens_per_sec: f64,
    pub overall_request_speed_tokens_per_sec: f64,
    pub response_text: String,
    pub status: JobStatus,
    pub error: Option<String>,
}

impl ResultRecord {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// All state of one benchmark run. Nothing here outlives the process.
#[derive(Debug)]
pub struct BenchmarkSession {
    pub endpoint: Endpoint,
    pub model: String,
    pub jobs: Vec<PromptJob>,
    pub records: Vec<ResultRecord>,
    pub started_at: DateTime<Local>,
}

impl BenchmarkSession {
    /// `prompts` are `(name, text)` pairs in execution order.
    pub fn new(
        endpoint: Endpoint,
        model: impl Into<String>,
        prompts: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let model = model.into();
        let jobs = prompts
            .into_iter()
            .enumerate()
            .map(|(idx, (name, prompt))| PromptJob {
                index: idx + 1,
                name,
                prompt,
                model: model.clone(),
            })
            .collect();

        Self {
            endpoint,
            model,
            jobs,
            records: Vec::new(),
            started_at: Local::now(),
        }
    }

    pub fn completed_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_completed()).count()
    }
}
