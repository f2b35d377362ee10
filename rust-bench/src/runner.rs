use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Endpoint, SessionConfig};
use crate::display::{DisplayFrame, LiveDisplay};
use crate::metrics::MetricsEngine;
use crate::record::{BenchmarkSession, PromptJob, ResultRecord};
use crate::report::SessionSummary;
use crate::wire::EventSource;
use crate::writer::ResultWriter;

/// What a finished session hands back to the caller.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub records: Vec<ResultRecord>,
    pub summary: SessionSummary,
    pub artifact: PathBuf,
    pub cancelled: bool,
}

/// Runs the jobs of a session one after another: each job's stream is
/// resolved to a terminal status before the next request is opened.
pub struct SessionController<'a> {
    source: &'a dyn EventSource,
    config: SessionConfig,
    cancel: CancellationToken,
    output: Option<Box<dyn Write + Send>>,
}

impl<'a> SessionController<'a> {
    pub fn new(source: &'a dyn EventSource, config: SessionConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
            output: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Send the live view somewhere other than stdout.
    pub fn with_output<W>(mut self, out: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.output = Some(Box::new(out));
        self
    }

    pub async fn run(mut self, session: &mut BenchmarkSession) -> Result<SessionOutcome> {
        let mut writer = ResultWriter::create(&self.config.results_dir, session).await?;

        let frame = DisplayFrame::new(
            session.endpoint.kind().display_name(),
            &session.model,
            session.endpoint.host(),
            session.jobs.len(),
        )
        .with_streaming(self.config.stream);
        let out: Box<dyn Write + Send> = match self.output.take() {
            Some(out) => out,
            None => Box::new(io::stdout()),
        };
        let display =
            LiveDisplay::spawn_with_writer(frame, self.config.refresh_interval, self.config.live, out);

        let jobs = session.jobs.clone();
        let total = jobs.len();
        for (position, job) in jobs.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let index = job.index;
            let record = self.run_job(&session.endpoint, job, &display).await;

            info!(
                job = index,
                name = %record.name,
                status = %record.status,
                tokens = record.total_tokens_generated,
                elapsed = record.total_elapsed_time,
                "job finished"
            );
            if let Err(err) = writer.record(&record).await {
                warn!(job = index, error = %format!("{:#}", err), "failed to persist result");
            }
            display.complete(index, &record);
            session.records.push(record);

            if position + 1 < total && !self.config.job_pause.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(self.config.job_pause) => {}
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            info!(
                finished = session.records.len(),
                skipped = total - session.records.len(),
                "session cancelled"
            );
        }

        let artifact = writer.path().to_path_buf();
        if let Err(err) = writer.finalize(session).await {
            warn!(error = %format!("{:#}", err), "failed to write session summary");
        }
        display.shutdown().await;

        Ok(SessionOutcome {
            summary: SessionSummary::from_records(&session.records),
            records: session.records.clone(),
            artifact,
            cancelled,
        })
    }

    async fn run_job(&self, endpoint: &Endpoint, job: PromptJob, display: &LiveDisplay) -> ResultRecord {
        let limit = self.config.request_timeout;
        display.begin_job(&job);

        let mut engine = MetricsEngine::new(job, endpoint.host());
        let submitted = Instant::now();
        engine.submit(submitted);
        let deadline = submitted + limit;

        let mut stream = {
            let job = engine.job();
            self.source.open(endpoint, &job.model, &job.prompt, limit)
        };

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    engine.cancel(Instant::now());
                    break;
                }
                _ = sleep_until(deadline) => {
                    engine.time_out(limit, Instant::now());
                    break;
                }
                event = stream.next_event() => match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        let snapshot = engine.observe(event, Instant::now());
                        display.update(snapshot, engine.response_text());
                        if terminal {
                            break;
                        }
                    }
                    None => {
                        engine.stream_closed(Instant::now());
                        break;
                    }
                },
            }
        }

        stream.close();
        engine.into_record(Instant::now())
    }
}

/// Run every job of `session` against `source`, writing results under
/// `config.results_dir`.
pub async fn run_session(
    session: &mut BenchmarkSession,
    source: &dyn EventSource,
    config: SessionConfig,
    cancel: CancellationToken,
) -> Result<SessionOutcome> {
    SessionController::new(source, config)
        .with_cancellation(cancel)
        .run(session)
        .await
}
