//! Append-only text record of a session.
//!
//! Layout (key names and order are a compatibility surface):
//! a session header, one block per prompt with a `METRICS:` section of
//! `key: value` lines and a `RESPONSE:` section, then a summary block and a
//! footer. Durations are written with 3 decimals, speeds with 2.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::record::{BenchmarkSession, JobStatus, ResultRecord, TIMESTAMP_FORMAT};
use crate::report::SessionSummary;

const HEAVY_RULE_WIDTH: usize = 80;
const LIGHT_RULE_WIDTH: usize = 60;

fn heavy_rule() -> String {
    "=".repeat(HEAVY_RULE_WIDTH)
}

fn light_rule() -> String {
    "=".repeat(LIGHT_RULE_WIDTH)
}

pub struct ResultWriter {
    path: PathBuf,
    file: File,
}

impl ResultWriter {
    /// Create a new artifact under `dir`, named after the session start time,
    /// and write the session header. Never reuses an existing file.
    pub async fn create(dir: &Path, session: &BenchmarkSession) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create results directory at {}", dir.display()))?;

        let stamp = session.started_at.format("%Y%m%d_%H%M%S").to_string();
        let mut attempt = 0usize;
        let (path, file) = loop {
            let filename = if attempt == 0 {
                format!("benchmark_output_{}.txt", stamp)
            } else {
                format!("benchmark_output_{}_{}.txt", stamp, attempt)
            };
            let path = dir.join(filename);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create result file {}", path.display()))
                }
            }
        };

        let mut writer = Self { path, file };
        let header = format_header(
            session.endpoint.kind().display_name(),
            &session.model,
            session.endpoint.host(),
            session.started_at.naive_local(),
        );
        writer.append(&header).await?;
        info!(path = %writer.path.display(), "writing results");
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one finalized record; the bytes are on disk when this returns.
    pub async fn record(&mut self, record: &ResultRecord) -> Result<()> {
        let block = format_record(record);
        self.append(&block).await?;
        debug!(name = %record.name, status = %record.status, "result recorded");
        Ok(())
    }

    /// Append the summary and footer and close the file.
    pub async fn finalize(mut self, session: &BenchmarkSession) -> Result<PathBuf> {
        let summary = SessionSummary::from_records(&session.records);
        let ended = Local::now();
        let duration = (ended - session.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let block = format_summary(&summary, ended.naive_local(), duration);
        self.append(&block).await?;
        Ok(self.path)
    }

    async fn append(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        self.file
            .sync_data()
            .await
            .with_context(|| format!("failed to sync {}", self.path.display()))?;
        Ok(())
    }
}

pub fn format_header(service: &str, model: &str, host: &str, started: NaiveDateTime) -> String {
    let rule = heavy_rule();
    format!(
        "{rule}\nLLMBench Results - {started}\n{rule}\nService: {service}\nModel: {model}\nHost: {host}\n{rule}\n\n",
        rule = rule,
        started = started.format(TIMESTAMP_FORMAT),
        service = service,
        model = model,
        host = host,
    )
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

pub fn format_record(record: &ResultRecord) -> String {
    let rule = light_rule();
    let mut out = String::new();
    out.push_str(&format!(
        "\n{rule}\nPROMPT: {name}\n{rule}\nPrompt Text: {prompt}\nStarted: {started}\n\n",
        rule = rule,
        name = single_line(&record.name),
        prompt = record.prompt,
        started = record.started_at.format(TIMESTAMP_FORMAT),
    ));
    out.push_str("METRICS:\n");
    out.push_str(&format!("total_elapsed_time: {:.3}\n", record.total_elapsed_time));
    out.push_str(&format!("prompt_delay_time: {:.3}\n", record.prompt_delay_time));
    out.push_str(&format!("generation_time: {:.3}\n", record.generation_time));
    out.push_str(&format!(
        "total_tokens_generated: {}\n",
        record.total_tokens_generated
    ));
    out.push_str(&format!(
        "generation_speed_tokens_per_sec: {:.2}\n",
        record.generation_speed_tokens_per_sec
    ));
    out.push_str(&format!(
        "overall_request_speed_tokens_per_sec: {:.2}\n",
        record.overall_request_speed_tokens_per_sec
    ));
    out.push_str(&format!(
        "completed_at: {}\n",
        record.completed_at.format(TIMESTAMP_FORMAT)
    ));
    out.push_str(&format!("status: {}\n", record.status));
    if let Some(error) = &record.error {
        out.push_str(&format!("error: {}\n", single_line(error)));
    }
    out.push_str(&format!(
        "\nRESPONSE:\n{response}\n\n{rule}\n\n",
        response = record.response_text,
        rule = rule
    ));
    out
}

pub fn format_summary(summary: &SessionSummary, ended: NaiveDateTime, duration_secs: f64) -> String {
    let rule = heavy_rule();
    let mut out = format!("\n{rule}\nSESSION SUMMARY\n{rule}\n", rule = rule);
    out.push_str(&format!("completed: {}\n", summary.completed));
    out.push_str(&format!("failed: {}\n", summary.failed));
    out.push_str(&format!("timed_out: {}\n", summary.timed_out));
    out.push_str(&format!(
        "total_tokens_generated: {}\n",
        summary.total_tokens_generated
    ));
    out.push_str(&format!(
        "aggregate_generation_speed_tokens_per_sec: {:.2}\n",
        summary.aggregate_generation_speed
    ));
    out.push_str(&format!(
        "average_total_elapsed_time: {:.3}\n",
        summary.average_total_time
    ));
    out.push_str(&format!(
        "average_prompt_delay_time: {:.3}\n",
        summary.average_prompt_delay
    ));
    out.push_str(&format!(
        "average_generation_time: {:.3}\n",
        summary.average_generation_time
    ));
    out.push_str(&format!(
        "average_tokens_generated: {:.1}\n",
        summary.average_tokens
    ));
    out.push_str(&format!(
        "average_generation_speed_tokens_per_sec: {:.2}\n",
        summary.average_generation_speed
    ));
    out.push_str(&format!(
        "average_overall_request_speed_tokens_per_sec: {:.2}\n",
        summary.average_request_speed
    ));
    out.push_str(&format!(
        "\n{rule}\nSession completed: {ended}\nTotal session duration: {duration:.2} seconds\n{rule}\n",
        rule = rule,
        ended = ended.format(TIMESTAMP_FORMAT),
        duration = duration_secs,
    ));
    out
}

/// Counts read back from a summary block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSummary {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub total_tokens_generated: u64,
    pub ended_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArtifact {
    pub service: String,
    pub model: String,
    pub host: String,
    pub started_at: NaiveDateTime,
    pub records: Vec<ResultRecord>,
    /// Absent when the session did not finish.
    pub summary: Option<ParsedSummary>,
}

pub async fn read_artifact(path: &Path) -> Result<ParsedArtifact> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_artifact(&text).with_context(|| format!("failed to parse {}", path.display()))
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn expect(&mut self, literal: &str) -> Result<()> {
        self.rest = self
            .rest
            .strip_prefix(literal)
            .ok_or_else(|| anyhow!("expected {:?} near {:?}", literal, preview(self.rest)))?;
        Ok(())
    }

    fn take_until(&mut self, delimiter: &str) -> Result<&'a str> {
        let idx = self
            .rest
            .find(delimiter)
            .ok_or_else(|| anyhow!("missing {:?} near {:?}", delimiter, preview(self.rest)))?;
        let taken = &self.rest[..idx];
        self.rest = &self.rest[idx + delimiter.len()..];
        Ok(taken)
    }

    /// Take up to the first `delimiter` whose following text satisfies
    /// `accept`. Free text may contain the delimiter itself.
    fn take_until_followed_by(
        &mut self,
        delimiter: &str,
        accept: impl Fn(&str) -> bool,
    ) -> Result<&'a str> {
        let mut from = 0;
        while let Some(offset) = self.rest[from..].find(delimiter) {
            let idx = from + offset;
            let after = &self.rest[idx + delimiter.len()..];
            if accept(after) {
                let taken = &self.rest[..idx];
                self.rest = after;
                return Ok(taken);
            }
            from = idx + 1;
            while !self.rest.is_char_boundary(from) {
                from += 1;
            }
        }
        Err(anyhow!("missing {:?} near {:?}", delimiter, preview(self.rest)))
    }

    fn take_line(&mut self) -> Result<&'a str> {
        self.take_until("\n")
    }

    fn field(&mut self, key: &str) -> Result<&'a str> {
        self.expect(key)?;
        self.expect(": ")?;
        self.take_line()
    }

    fn starts_with(&self, literal: &str) -> bool {
        self.rest.starts_with(literal)
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}

fn preview(text: &str) -> String {
    text.chars().take(40).collect()
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .with_context(|| format!("invalid timestamp: {}", value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {}: {}", key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {}: {}", key, value))
}

pub fn parse_artifact(text: &str) -> Result<ParsedArtifact> {
    let heavy = heavy_rule();
    let light = light_rule();
    let mut cursor = Cursor { rest: text };

    cursor.expect(&heavy)?;
    cursor.expect("\nLLMBench Results - ")?;
    let started_at = parse_timestamp(cursor.take_line()?)?;
    cursor.expect(&heavy)?;
    cursor.expect("\n")?;
    let service = cursor.field("Service")?.to_string();
    let model = cursor.field("Model")?.to_string();
    let host = cursor.field("Host")?.to_string();
    cursor.expect(&heavy)?;
    cursor.expect("\n\n")?;

    let block_start = format!("\n{}\nPROMPT: ", light);
    let response_end = format!("\n\n{}\n\n", light);
    let summary_start = format!("\n{}\nSESSION SUMMARY\n{}\n", heavy, heavy);
    // Prompt and response text are written verbatim, so their delimiters
    // only count where the expected structure follows.
    let ends_prompt = |after: &str| match after.split_once('\n') {
        Some((stamp, rest)) => parse_timestamp(stamp).is_ok() && rest.starts_with("\nMETRICS:\n"),
        None => false,
    };
    let ends_response = |after: &str| {
        after.is_empty() || after.starts_with(&block_start) || after.starts_with(&summary_start)
    };
    let mut records = Vec::new();

    while cursor.starts_with(&block_start) {
        cursor.expect(&block_start)?;
        let name = cursor.take_line()?.to_string();
        cursor.expect(&light)?;
        cursor.expect("\nPrompt Text: ")?;
        let prompt = cursor
            .take_until_followed_by("\nStarted: ", &ends_prompt)?
            .to_string();
        let record_started = parse_timestamp(cursor.take_line()?)?;
        cursor.expect("\nMETRICS:\n")?;

        let total_elapsed_time = parse_f64("total_elapsed_time", cursor.field("total_elapsed_time")?)?;
        let prompt_delay_time = parse_f64("prompt_delay_time", cursor.field("prompt_delay_time")?)?;
        let generation_time = parse_f64("generation_time", cursor.field("generation_time")?)?;
        let total_tokens_generated =
            parse_u64("total_tokens_generated", cursor.field("total_tokens_generated")?)?;
        let generation_speed = parse_f64(
            "generation_speed_tokens_per_sec",
            cursor.field("generation_speed_tokens_per_sec")?,
        )?;
        let overall_speed = parse_f64(
            "overall_request_speed_tokens_per_sec",
            cursor.field("overall_request_speed_tokens_per_sec")?,
        )?;
        let completed_at = parse_timestamp(cursor.field("completed_at")?)?;
        let status: JobStatus = cursor.field("status")?.parse()?;
        let error = if cursor.starts_with("error: ") {
            Some(cursor.field("error")?.to_string())
        } else {
            None
        };
        cursor.expect("\nRESPONSE:\n")?;
        let response_text = cursor
            .take_until_followed_by(&response_end, &ends_response)?
            .to_string();

        records.push(ResultRecord {
            name,
            prompt,
            model: model.clone(),
            host: host.clone(),
            started_at: record_started,
            completed_at,
            total_elapsed_time,
            prompt_delay_time,
            generation_time,
            total_tokens_generated,
            generation_speed_tokens_per_sec: generation_speed,
            overall_request_speed_tokens_per_sec: overall_speed,
            response_text,
            status,
            error,
        });
    }

    let summary = if cursor.starts_with(&summary_start) {
        cursor.expect(&summary_start)?;
        let completed = parse_u64("completed", cursor.field("completed")?)? as usize;
        let failed = parse_u64("failed", cursor.field("failed")?)? as usize;
        let timed_out = parse_u64("timed_out", cursor.field("timed_out")?)? as usize;
        let total_tokens_generated =
            parse_u64("total_tokens_generated", cursor.field("total_tokens_generated")?)?;
        for key in [
            "aggregate_generation_speed_tokens_per_sec",
            "average_total_elapsed_time",
            "average_prompt_delay_time",
            "average_generation_time",
            "average_tokens_generated",
            "average_generation_speed_tokens_per_sec",
            "average_overall_request_speed_tokens_per_sec",
        ] {
            parse_f64(key, cursor.field(key)?)?;
        }
        cursor.expect("\n")?;
        cursor.expect(&heavy)?;
        cursor.expect("\n")?;
        let ended_at = parse_timestamp(cursor.field("Session completed")?)?;
        cursor.expect("Total session duration: ")?;
        let duration = cursor.take_until(" seconds\n")?;
        parse_f64("session duration", duration)?;
        cursor.expect(&heavy)?;
        cursor.expect("\n")?;
        Some(ParsedSummary {
            completed,
            failed,
            timed_out,
            total_tokens_generated,
            ended_at,
        })
    } else {
        None
    };

    if !cursor.is_empty() {
        bail!("unexpected content after the last block near {:?}", preview(cursor.rest));
    }

    Ok(ParsedArtifact {
        service,
        model,
        host,
        started_at,
        records,
        summary,
    })
}
