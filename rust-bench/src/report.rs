use crate::record::{JobStatus, ResultRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub name: String,
    pub status: JobStatus,
    pub error: String,
}

/// Session totals. Averages and throughput cover completed jobs only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSummary {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub total_tokens_generated: u64,
    pub total_generation_time: f64,
    pub aggregate_generation_speed: f64,
    pub average_total_time: f64,
    pub average_prompt_delay: f64,
    pub average_generation_time: f64,
    pub average_tokens: f64,
    pub average_generation_speed: f64,
    pub average_request_speed: f64,
    pub failures: Vec<FailureRecord>,
}

impl SessionSummary {
    pub fn from_records(records: &[ResultRecord]) -> Self {
        let mut summary = SessionSummary::default();
        let mut sum_total = 0.0;
        let mut sum_delay = 0.0;
        let mut sum_gen_speed = 0.0;
        let mut sum_req_speed = 0.0;

        for record in records {
            match record.status {
                JobStatus::Completed => {
                    summary.completed += 1;
                    summary.total_tokens_generated += record.total_tokens_generated;
                    summary.total_generation_time += record.generation_time;
                    sum_total += record.total_elapsed_time;
                    sum_delay += record.prompt_delay_time;
                    sum_gen_speed += record.generation_speed_tokens_per_sec;
                    sum_req_speed += record.overall_request_speed_tokens_per_sec;
                }
                JobStatus::Failed | JobStatus::TimedOut => {
                    if record.status == JobStatus::Failed {
                        summary.failed += 1;
                    } else {
                        summary.timed_out += 1;
                    }
                    summary.failures.push(FailureRecord {
                        name: record.name.clone(),
                        status: record.status,
                        error: record.error.clone().unwrap_or_default(),
                    });
                }
            }
        }

        if summary.completed > 0 {
            let n = summary.completed as f64;
            summary.average_total_time = sum_total / n;
            summary.average_prompt_delay = sum_delay / n;
            summary.average_generation_time = summary.total_generation_time / n;
            summary.average_tokens = summary.total_tokens_generated as f64 / n;
            summary.average_generation_speed = sum_gen_speed / n;
            summary.average_request_speed = sum_req_speed / n;
        }
        summary.aggregate_generation_speed = if summary.total_generation_time > 0.0 {
            summary.total_tokens_generated as f64 / summary.total_generation_time
        } else {
            0.0
        };

        summary
    }

    pub fn total_jobs(&self) -> usize {
        self.completed + self.failed + self.timed_out
    }

    pub fn has_completed(&self) -> bool {
        self.completed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::wall_clock_now;

    fn record(status: JobStatus, tokens: u64, total: f64, delay: f64) -> ResultRecord {
        let generation = total - delay;
        let now = wall_clock_now();
        ResultRecord {
            name: format!("job-{}", tokens),
            prompt: "p".into(),
            model: "m".into(),
            host: "h".into(),
            started_at: now,
            completed_at: now,
            total_elapsed_time: total,
            prompt_delay_time: delay,
            generation_time: generation,
            total_tokens_generated: tokens,
            generation_speed_tokens_per_sec: tokens as f64 / generation,
            overall_request_speed_tokens_per_sec: tokens as f64 / total,
            response_text: String::new(),
            status,
            error: (status != JobStatus::Completed).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn averages_cover_completed_jobs_only() {
        let records = vec![
            record(JobStatus::Completed, 100, 5.0, 1.0),
            record(JobStatus::Completed, 50, 3.0, 0.5),
            record(JobStatus::Failed, 7, 1.0, 0.5),
            record(JobStatus::TimedOut, 0, 180.0, 180.0),
        ];
        let summary = SessionSummary::from_records(&records);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.total_jobs(), 4);
        assert_eq!(summary.total_tokens_generated, 150);
        assert!((summary.total_generation_time - 6.5).abs() < 1e-9);
        assert!((summary.aggregate_generation_speed - 150.0 / 6.5).abs() < 1e-9);
        assert!((summary.average_total_time - 4.0).abs() < 1e-9);
        assert!((summary.average_prompt_delay - 0.75).abs() < 1e-9);
        assert!((summary.average_tokens - 75.0).abs() < 1e-9);
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.failures[1].status, JobStatus::TimedOut);
    }

    #[test]
    fn empty_session_has_zero_rates() {
        let summary = SessionSummary::from_records(&[]);
        assert!(!summary.has_completed());
        assert_eq!(summary.aggregate_generation_speed, 0.0);
        assert_eq!(summary.average_generation_speed, 0.0);
    }
}
