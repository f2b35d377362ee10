//! Per-job timing state machine.
//!
//! `Idle -> AwaitingFirstToken -> Streaming -> Completed | Failed | TimedOut`
//!
//! `submit` records the submission instant `t0` and moves straight to
//! awaiting the first token. Every later transition is driven by a
//! [`StreamEvent`] (or by the controller's deadline / interrupt) together
//! with the instant it was observed, so the engine itself never reads a clock
//! for durations.
//!
//! Token counting policy: a token is a maximal run of non-whitespace
//! characters in the generated text, counted over the concatenated stream
//! so that words split across chunks are counted once. Reasoning output is
//! counted with its own counter and added to the total. The same rule is
//! applied to every service kind; provider-reported counts are ignored.

use chrono::NaiveDateTime;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::record::{wall_clock_now, JobStatus, PromptJob, ResultRecord};
use crate::wire::StreamEvent;

/// Lower bound for any duration used as a divisor (1 ms).
pub const RATE_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    AwaitingFirstToken,
    Streaming,
    Finished(JobStatus),
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Finished(_))
    }
}

/// Latest live metrics for an in-flight job.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricSnapshot {
    pub elapsed_since_submit: f64,
    pub time_to_first_token: Option<f64>,
    pub tokens_so_far: u64,
    pub current_tokens_per_sec: f64,
}

/// Incremental whitespace-delimited word counter.
#[derive(Debug, Clone, Default)]
pub struct WordCounter {
    words: u64,
    in_word: bool,
}

impl WordCounter {
    pub fn feed(&mut self, text: &str) {
        for ch in text.chars() {
            if ch.is_whitespace() {
                self.in_word = false;
            } else if !self.in_word {
                self.in_word = true;
                self.words += 1;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.words
    }
}

/// Token count of a complete text under the counting policy.
pub fn count_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn rate(tokens: u64, seconds: f64) -> f64 {
    tokens as f64 / seconds.max(RATE_EPSILON)
}

#[derive(Debug)]
pub struct MetricsEngine {
    job: PromptJob,
    host: String,
    phase: JobPhase,
    submitted_at: Option<Instant>,
    first_token_at: Option<Instant>,
    finished_at: Option<Instant>,
    started_wall: Option<NaiveDateTime>,
    completed_wall: Option<NaiveDateTime>,
    response: String,
    reasoning: String,
    answer_words: WordCounter,
    reasoning_words: WordCounter,
    failure: Option<StreamError>,
}

impl MetricsEngine {
    pub fn new(job: PromptJob, host: impl Into<String>) -> Self {
        Self {
            job,
            host: host.into(),
            phase: JobPhase::Idle,
            submitted_at: None,
            first_token_at: None,
            finished_at: None,
            started_wall: None,
            completed_wall: None,
            response: String::new(),
            reasoning: String::new(),
            answer_words: WordCounter::default(),
            reasoning_words: WordCounter::default(),
            failure: None,
        }
    }

    pub fn job(&self) -> &PromptJob {
        &self.job
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn response_text(&self) -> &str {
        &self.response
    }

    pub fn reasoning_text(&self) -> &str {
        &self.reasoning
    }

    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.started_wall
    }

    pub fn tokens(&self) -> u64 {
        self.answer_words.count() + self.reasoning_words.count()
    }

    /// Record the submission instant. Only valid once, from `Idle`.
    pub fn submit(&mut self, now: Instant) {
        if self.phase != JobPhase::Idle {
            return;
        }
        self.submitted_at = Some(now);
        self.started_wall = Some(wall_clock_now());
        self.phase = JobPhase::AwaitingFirstToken;
    }

    /// Apply one event observed at `now`. Events after a terminal state are
    /// ignored.
    pub fn observe(&mut self, event: StreamEvent, now: Instant) -> MetricSnapshot {
        match (self.phase, event) {
            (JobPhase::Idle, _) | (JobPhase::Finished(_), _) => {}
            (_, StreamEvent::TokenChunk { text, reasoning }) => {
                if self.first_token_at.is_none() {
                    self.first_token_at = Some(now);
                    self.phase = JobPhase::Streaming;
                }
                if reasoning {
                    self.reasoning_words.feed(&text);
                    self.reasoning.push_str(&text);
                } else {
                    self.answer_words.feed(&text);
                    self.response.push_str(&text);
                }
            }
            (_, StreamEvent::Done) => self.finish(JobStatus::Completed, None, now),
            (_, StreamEvent::Error(err)) => {
                let status = if err.is_timeout() {
                    JobStatus::TimedOut
                } else {
                    JobStatus::Failed
                };
                self.finish(status, Some(err), now);
            }
        }
        self.snapshot(now)
    }

    /// The controller's overall deadline passed.
    pub fn time_out(&mut self, limit: std::time::Duration, now: Instant) {
        if !self.phase.is_terminal() {
            self.finish(JobStatus::TimedOut, Some(StreamError::Timeout(limit)), now);
        }
    }

    /// The event stream ended without a terminal event. Text already
    /// received makes it an implicit `Done`; otherwise nothing came back.
    pub fn stream_closed(&mut self, now: Instant) {
        if self.phase.is_terminal() {
            return;
        }
        if self.first_token_at.is_some() {
            self.finish(JobStatus::Completed, None, now);
        } else {
            self.finish(JobStatus::Failed, Some(StreamError::EmptyStream), now);
        }
    }

    pub fn cancel(&mut self, now: Instant) {
        if !self.phase.is_terminal() {
            self.finish(JobStatus::Failed, Some(StreamError::Cancelled), now);
        }
    }

    fn finish(&mut self, status: JobStatus, failure: Option<StreamError>, now: Instant) {
        self.phase = JobPhase::Finished(status);
        self.finished_at = Some(now);
        self.completed_wall = Some(wall_clock_now());
        self.failure = failure;
    }

    fn seconds_between(from: Option<Instant>, to: Instant) -> f64 {
        from.map(|from| to.saturating_duration_since(from).as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self, now: Instant) -> MetricSnapshot {
        let end = self.finished_at.unwrap_or(now);
        let elapsed = Self::seconds_between(self.submitted_at, end);
        let time_to_first_token = match (self.submitted_at, self.first_token_at) {
            (Some(t0), Some(first)) => Some(first.saturating_duration_since(t0).as_secs_f64()),
            _ => None,
        };
        let tokens = self.tokens();
        let current_tokens_per_sec = if self.first_token_at.is_some() {
            rate(tokens, Self::seconds_between(self.first_token_at, end))
        } else {
            0.0
        };

        MetricSnapshot {
            elapsed_since_submit: elapsed,
            time_to_first_token,
            tokens_so_far: tokens,
            current_tokens_per_sec,
        }
    }

    /// Finalize into a record. A job that never reached a terminal state is
    /// recorded as failed.
    pub fn into_record(mut self, now: Instant) -> ResultRecord {
        if !self.phase.is_terminal() {
            self.finish(
                JobStatus::Failed,
                Some(StreamError::Protocol(
                    "stream ended without a terminal event".into(),
                )),
                now,
            );
        }
        let status = match self.phase {
            JobPhase::Finished(status) => status,
            _ => JobStatus::Failed,
        };

        let snapshot = self.snapshot(now);
        let total_elapsed_time = snapshot.elapsed_since_submit;
        let prompt_delay_time = snapshot
            .time_to_first_token
            .unwrap_or(total_elapsed_time)
            .min(total_elapsed_time);
        let generation_time = total_elapsed_time - prompt_delay_time;
        let tokens = snapshot.tokens_so_far;

        let started_at = self.started_wall.unwrap_or_else(wall_clock_now);
        let completed_at = self.completed_wall.unwrap_or(started_at);

        ResultRecord {
            name: self.job.name,
            prompt: self.job.prompt,
            model: self.job.model,
            host: self.host,
            started_at,
            completed_at,
            total_elapsed_time,
            prompt_delay_time,
            generation_time,
            total_tokens_generated: tokens,
            generation_speed_tokens_per_sec: rate(tokens, generation_time),
            overall_request_speed_tokens_per_sec: rate(tokens, total_elapsed_time),
            response_text: self.response,
            status,
            error: self.failure.map(|err| err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job() -> PromptJob {
        PromptJob {
            index: 1,
            name: "Prompt 1".into(),
            prompt: "Say hello".into(),
            model: "llama3".into(),
        }
    }

    fn engine() -> (MetricsEngine, Instant) {
        let mut engine = MetricsEngine::new(job(), "http://localhost:11434");
        let t0 = Instant::now();
        engine.submit(t0);
        (engine, t0)
    }

    fn ms(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    #[test]
    fn word_counter_handles_words_split_across_chunks() {
        let mut counter = WordCounter::default();
        for part in ["Hel", "lo", " wor", "ld", "  ", "\nagain"] {
            counter.feed(part);
        }
        assert_eq!(counter.count(), 3);
        assert_eq!(count_tokens("Hello world\nagain"), 3);
        assert_eq!(count_tokens("   "), 0);
    }

    #[test]
    fn hello_world_timeline() {
        let (mut engine, t0) = engine();
        assert_eq!(engine.phase(), JobPhase::AwaitingFirstToken);

        let snap = engine.observe(StreamEvent::chunk("Hello"), ms(t0, 100));
        assert_eq!(engine.phase(), JobPhase::Streaming);
        assert_eq!(snap.tokens_so_far, 1);
        assert!((snap.time_to_first_token.unwrap() - 0.1).abs() < 1e-9);

        engine.observe(StreamEvent::chunk(" world"), ms(t0, 300));
        engine.observe(StreamEvent::Done, ms(t0, 300));
        assert_eq!(engine.phase(), JobPhase::Finished(JobStatus::Completed));

        let record = engine.into_record(ms(t0, 300));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.response_text, "Hello world");
        assert_eq!(record.total_tokens_generated, 2);
        assert!((record.total_elapsed_time - 0.3).abs() < 1e-9);
        assert!((record.prompt_delay_time - 0.1).abs() < 1e-9);
        assert!((record.generation_time - 0.2).abs() < 1e-9);
        assert!((record.generation_speed_tokens_per_sec - 10.0).abs() < 1e-6);
        assert!(
            (record.prompt_delay_time + record.generation_time - record.total_elapsed_time).abs()
                < 1e-3
        );
        assert!(record.error.is_none());
    }

    #[test]
    fn first_token_time_is_never_overwritten() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("a"), ms(t0, 50));
        let snap = engine.observe(StreamEvent::chunk(" b"), ms(t0, 400));
        assert!((snap.time_to_first_token.unwrap() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn live_rate_uses_time_since_first_token() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("one"), ms(t0, 1000));
        let snap = engine.observe(StreamEvent::chunk(" two three four"), ms(t0, 1500));
        assert_eq!(snap.tokens_so_far, 4);
        assert!((snap.current_tokens_per_sec - 8.0).abs() < 1e-6);
        assert!((snap.elapsed_since_submit - 1.5).abs() < 1e-9);
    }

    #[test]
    fn done_without_tokens_has_zero_speeds() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::Done, ms(t0, 250));
        let record = engine.into_record(ms(t0, 250));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.total_tokens_generated, 0);
        assert_eq!(record.generation_speed_tokens_per_sec, 0.0);
        assert_eq!(record.overall_request_speed_tokens_per_sec, 0.0);
        assert!((record.prompt_delay_time - 0.25).abs() < 1e-9);
        assert_eq!(record.generation_time, 0.0);
    }

    #[test]
    fn error_keeps_partial_response() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("partial answer"), ms(t0, 100));
        engine.observe(
            StreamEvent::Error(StreamError::Connection("reset".into())),
            ms(t0, 200),
        );
        let record = engine.into_record(ms(t0, 200));
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.response_text, "partial answer");
        assert_eq!(record.total_tokens_generated, 2);
        assert_eq!(record.error.as_deref(), Some("connection error: reset"));
    }

    #[test]
    fn timeout_error_maps_to_timed_out() {
        let (mut engine, t0) = engine();
        engine.observe(
            StreamEvent::Error(StreamError::Timeout(Duration::from_secs(2))),
            ms(t0, 2000),
        );
        let record = engine.into_record(ms(t0, 2000));
        assert_eq!(record.status, JobStatus::TimedOut);
        assert!((record.total_elapsed_time - 2.0).abs() < 1e-9);
        assert!(record.response_text.is_empty());
    }

    #[test]
    fn status_is_monotonic() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("x"), ms(t0, 10));
        engine.observe(StreamEvent::Done, ms(t0, 20));
        engine.observe(
            StreamEvent::Error(StreamError::Connection("late".into())),
            ms(t0, 30),
        );
        engine.observe(StreamEvent::chunk(" more"), ms(t0, 40));
        engine.cancel(ms(t0, 50));
        engine.time_out(Duration::from_secs(1), ms(t0, 60));

        let record = engine.into_record(ms(t0, 70));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.response_text, "x");
        assert!((record.total_elapsed_time - 0.02).abs() < 1e-9);
    }

    #[test]
    fn cancel_records_failed_with_reason() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("half"), ms(t0, 10));
        engine.cancel(ms(t0, 30));
        let record = engine.into_record(ms(t0, 30));
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("cancelled by user"));
        assert_eq!(record.response_text, "half");
    }

    #[test]
    fn reasoning_counts_but_stays_out_of_response() {
        let (mut engine, t0) = engine();
        engine.observe(
            StreamEvent::TokenChunk {
                text: "let me think".into(),
                reasoning: true,
            },
            ms(t0, 100),
        );
        engine.observe(StreamEvent::chunk("Answer"), ms(t0, 200));
        assert_eq!(engine.reasoning_text(), "let me think");
        engine.observe(StreamEvent::Done, ms(t0, 200));
        let record = engine.into_record(ms(t0, 200));
        assert_eq!(record.total_tokens_generated, 4);
        assert_eq!(record.response_text, "Answer");
        assert!((record.prompt_delay_time - 0.1).abs() < 1e-9);
    }

    #[test]
    fn unfinished_engine_becomes_failed_record() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("dangling"), ms(t0, 10));
        let record = engine.into_record(ms(t0, 20));
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("terminal"));
    }

    #[test]
    fn closed_stream_after_tokens_is_completed() {
        let (mut engine, t0) = engine();
        engine.observe(StreamEvent::chunk("all of it"), ms(t0, 50));
        engine.stream_closed(ms(t0, 80));
        let record = engine.into_record(ms(t0, 90));
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.error.is_none());
        assert!((record.total_elapsed_time - 0.08).abs() < 1e-9);
    }

    #[test]
    fn closed_stream_without_tokens_is_empty() {
        let (mut engine, t0) = engine();
        engine.stream_closed(ms(t0, 40));
        let record = engine.into_record(ms(t0, 40));
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("empty stream"));
    }

    #[test]
    fn events_before_submit_are_ignored() {
        let mut engine = MetricsEngine::new(job(), "h");
        let now = Instant::now();
        let snap = engine.observe(StreamEvent::chunk("early"), now);
        assert_eq!(snap.tokens_so_far, 0);
        assert_eq!(engine.phase(), JobPhase::Idle);
    }

    #[test]
    fn repeated_runs_count_identically() {
        let words = ["alpha", " beta", " gamma", " delta", " epsilon"];
        let run = || {
            let (mut engine, t0) = engine();
            for (i, w) in words.iter().enumerate() {
                engine.observe(StreamEvent::chunk(*w), ms(t0, 10 * (i as u64 + 1)));
            }
            engine.observe(StreamEvent::Done, ms(t0, 100));
            engine.into_record(ms(t0, 100)).total_tokens_generated
        };
        assert_eq!(run(), words.len() as u64);
        assert_eq!(run(), run());
    }
}
