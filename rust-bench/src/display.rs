use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::warn;

use crate::metrics::MetricSnapshot;
use crate::record::{JobStatus, PromptJob, ResultRecord};

const RULE_WIDTH: usize = 80;
const RESPONSE_PREVIEW_CHARS: usize = 100;

/// A finished job as shown above the in-flight one.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedJob {
    pub index: usize,
    pub name: String,
    pub status: JobStatus,
    pub total_elapsed_time: f64,
    pub prompt_delay_time: f64,
    pub generation_time: f64,
    pub tokens: u64,
    pub generation_speed: f64,
    pub overall_speed: f64,
    pub error: Option<String>,
}

impl FinishedJob {
    fn from_record(index: usize, record: &ResultRecord) -> Self {
        Self {
            index,
            name: record.name.clone(),
            status: record.status,
            total_elapsed_time: record.total_elapsed_time,
            prompt_delay_time: record.prompt_delay_time,
            generation_time: record.generation_time,
            tokens: record.total_tokens_generated,
            generation_speed: record.generation_speed_tokens_per_sec,
            overall_speed: record.overall_request_speed_tokens_per_sec,
            error: record.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveJob {
    pub index: usize,
    pub name: String,
    pub snapshot: MetricSnapshot,
    /// Last few characters of the response, flattened to one line.
    pub response_tail: String,
}

/// Everything the screen shows. Only the latest value is ever rendered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayFrame {
    pub service: String,
    pub model: String,
    pub host: String,
    pub total_jobs: usize,
    /// Whole-response mode makes per-token speeds meaningless.
    pub streaming: bool,
    pub finished: Vec<FinishedJob>,
    pub current: Option<LiveJob>,
}

impl DisplayFrame {
    pub fn new(
        service: impl Into<String>,
        model: impl Into<String>,
        host: impl Into<String>,
        total_jobs: usize,
    ) -> Self {
        Self {
            service: service.into(),
            model: model.into(),
            host: host.into(),
            total_jobs,
            streaming: true,
            finished: Vec::new(),
            current: None,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// Live terminal view fed through a single-slot channel: producers overwrite
/// the pending frame, and a render thread wakes at most once per refresh
/// interval to draw whatever is newest. Terminal writes never run on the
/// async runtime.
pub struct LiveDisplay {
    tx: Option<watch::Sender<DisplayFrame>>,
    finished: Option<oneshot::Receiver<()>>,
}

impl LiveDisplay {
    pub fn spawn(frame: DisplayFrame, refresh_interval: Duration, live: bool) -> Self {
        Self::spawn_with_writer(frame, refresh_interval, live, io::stdout())
    }

    pub fn spawn_with_writer<W>(
        frame: DisplayFrame,
        refresh_interval: Duration,
        live: bool,
        out: W,
    ) -> Self
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = watch::channel(frame);
        let (done_tx, done_rx) = oneshot::channel();
        let spawned = thread::Builder::new()
            .name("llmbench-display".into())
            .spawn(move || {
                render_loop(rx, out, refresh_interval, live);
                let _ = done_tx.send(());
            });
        let finished = match spawned {
            Ok(_) => Some(done_rx),
            Err(err) => {
                warn!(error = %err, "live display disabled");
                None
            }
        };
        Self {
            tx: Some(tx),
            finished,
        }
    }

    fn modify(&self, f: impl FnOnce(&mut DisplayFrame)) {
        if let Some(tx) = &self.tx {
            tx.send_modify(f);
        }
    }

    pub fn begin_job(&self, job: &PromptJob) {
        let live = LiveJob {
            index: job.index,
            name: job.name.clone(),
            snapshot: MetricSnapshot::default(),
            response_tail: String::new(),
        };
        self.modify(|frame| frame.current = Some(live));
    }

    pub fn update(&self, snapshot: MetricSnapshot, response: &str) {
        let tail = response_tail(response, RESPONSE_PREVIEW_CHARS);
        self.modify(|frame| {
            if let Some(current) = frame.current.as_mut() {
                current.snapshot = snapshot;
                current.response_tail = tail;
            }
        });
    }

    pub fn complete(&self, index: usize, record: &ResultRecord) {
        let finished = FinishedJob::from_record(index, record);
        self.modify(|frame| {
            frame.current = None;
            frame.finished.push(finished);
        });
    }

    /// Stop accepting frames, draw the last one and wait for the renderer.
    pub async fn shutdown(mut self) {
        self.tx.take();
        if let Some(finished) = self.finished.take() {
            let _ = finished.await;
        }
    }
}

fn render_loop<W: Write>(
    mut rx: watch::Receiver<DisplayFrame>,
    mut out: W,
    refresh_interval: Duration,
    live: bool,
) {
    let mut painter = Painter::new(live);
    while futures::executor::block_on(rx.changed()).is_ok() {
        let frame = rx.borrow_and_update().clone();
        painter.paint(&mut out, &frame, false);
        thread::sleep(refresh_interval);
    }
    let frame = rx.borrow().clone();
    painter.paint(&mut out, &frame, true);
}

/// Columns available for one line, falling back to a classic 80.
fn terminal_width() -> usize {
    match crossterm::terminal::size() {
        Ok((cols, _)) if cols > 0 => cols as usize,
        _ => RULE_WIDTH,
    }
}

/// Tracks what is already on screen.
struct Painter {
    live: bool,
    drawn_lines: usize,
    printed_finished: usize,
}

impl Painter {
    fn new(live: bool) -> Self {
        Self {
            live,
            drawn_lines: 0,
            printed_finished: 0,
        }
    }

    fn paint<W: Write>(&mut self, out: &mut W, frame: &DisplayFrame, last: bool) {
        let result = if self.live {
            self.paint_in_place(out, frame, last)
        } else {
            self.paint_appending(out, frame)
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "live display write failed");
        }
    }

    fn paint_in_place<W: Write>(
        &mut self,
        out: &mut W,
        frame: &DisplayFrame,
        last: bool,
    ) -> io::Result<()> {
        // The last column stays free so a full line never wraps the cursor.
        let lines = render_lines(frame, terminal_width().saturating_sub(1).max(1));
        let mut buf = String::new();
        if self.drawn_lines > 0 {
            buf.push_str(&format!("\x1b[{}A\r", self.drawn_lines));
        }
        for line in &lines {
            buf.push_str("\r\x1b[2K");
            buf.push_str(line);
            buf.push('\n');
        }
        buf.push_str("\x1b[J");
        out.write_all(buf.as_bytes())?;
        out.flush()?;
        self.drawn_lines = if last { 0 } else { lines.len() };
        Ok(())
    }

    fn paint_appending<W: Write>(&mut self, out: &mut W, frame: &DisplayFrame) -> io::Result<()> {
        if self.drawn_lines == 0 {
            writeln!(out, "{}", header_line(frame))?;
            self.drawn_lines = 1;
        }
        for job in frame.finished.iter().skip(self.printed_finished) {
            writeln!(out, "{}", finished_line(job, frame))?;
            if let Some(error) = &job.error {
                writeln!(out, "      error: {}", error)?;
            }
        }
        self.printed_finished = frame.finished.len();
        out.flush()
    }
}

fn header_line(frame: &DisplayFrame) -> String {
    format!(
        "LIVE BENCHMARK - {} | Model: {} | Host: {}",
        frame.service, frame.model, frame.host
    )
}

fn finished_line(job: &FinishedJob, frame: &DisplayFrame) -> String {
    let speeds = if frame.streaming {
        format!(
            "{:.2} tok/s ({:.2} overall)",
            job.generation_speed, job.overall_speed
        )
    } else {
        "speed n/a (non-streaming)".to_string()
    };
    format!(
        "[{}/{}] {} {} {:.2}s ttft {:.2}s {} tok {}",
        job.index,
        frame.total_jobs,
        job.name,
        job.status.as_str(),
        job.total_elapsed_time,
        job.prompt_delay_time,
        job.tokens,
        speeds
    )
}

/// Clip `line` to `width` characters.
fn fit(line: String, width: usize) -> String {
    match line.char_indices().nth(width) {
        Some((idx, _)) if width > 3 => {
            let cut = line[..idx]
                .char_indices()
                .nth_back(2)
                .map(|(i, _)| i)
                .unwrap_or(0);
            format!("{}...", &line[..cut])
        }
        Some((idx, _)) => line[..idx].to_string(),
        None => line,
    }
}

/// Screen content for one frame, top to bottom, each line at most `width`
/// characters wide.
pub fn render_lines(frame: &DisplayFrame, width: usize) -> Vec<String> {
    let rule = "=".repeat(RULE_WIDTH.min(width));
    let mut lines = vec![rule.clone(), header_line(frame), rule.clone()];

    for job in &frame.finished {
        lines.push(finished_line(job, frame));
        if let Some(error) = &job.error {
            lines.push(format!("      error: {}", error));
        }
    }

    if let Some(current) = &frame.current {
        let snap = &current.snapshot;
        lines.push(format!(
            "> [{}/{}] {}",
            current.index, frame.total_jobs, current.name
        ));
        lines.push(format!(
            "Total Elapsed Time:     {:.3} seconds",
            snap.elapsed_since_submit
        ));
        match snap.time_to_first_token {
            Some(ttft) => {
                lines.push(format!("Prompt Delay Time:      {:.3} seconds", ttft));
                lines.push(format!(
                    "Generation Time:        {:.3} seconds",
                    (snap.elapsed_since_submit - ttft).max(0.0)
                ));
            }
            None => {
                lines.push("Prompt Delay Time:      [Waiting for first token...]".to_string());
                lines.push("Generation Time:        [Waiting for first token...]".to_string());
            }
        }
        lines.push(format!("Total Tokens Generated: {}", snap.tokens_so_far));
        if !frame.streaming {
            lines.push("Generation Speed:       [n/a without streaming]".to_string());
        } else if snap.current_tokens_per_sec > 0.0 {
            lines.push(format!(
                "Generation Speed:       {:.2} tokens/sec",
                snap.current_tokens_per_sec
            ));
        } else {
            lines.push("Generation Speed:       [Calculating...]".to_string());
        }
        if current.response_tail.is_empty() {
            lines.push("Response: [Waiting for response...]".to_string());
        } else {
            lines.push(format!("Response: {}", current.response_tail));
        }
    } else if frame.finished.len() < frame.total_jobs {
        lines.push("Waiting for next prompt...".to_string());
    }

    lines.push(rule);
    lines.into_iter().map(|line| fit(line, width)).collect()
}

/// Last `limit` characters of `text` on a single line.
pub fn response_tail(text: &str, limit: usize) -> String {
    let tail = match text.char_indices().rev().nth(limit) {
        Some((idx, c)) => format!("...{}", &text[idx + c.len_utf8()..]),
        None => text.to_string(),
    };
    tail.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}
