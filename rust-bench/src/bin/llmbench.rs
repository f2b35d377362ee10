use std::fs::File;
use std::io::{self, BufRead, BufReader, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use llmbench_rs::{
    detect_service, run_session, BenchmarkSession, CancellationToken, Endpoint, FileConfig,
    ServiceKind, SessionConfig, SessionSummary, WireAdapter,
};
use serde_json::Value;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Services running on this machine (per-service *_HOST variables apply)
    Local,
    /// A server reachable over the network; requires --host
    Remote,
}

#[derive(Parser, Debug)]
#[command(
    name = "llmbench",
    about = "Measure latency and token throughput of LLM inference servers"
)]
struct Args {
    /// TOML file with defaults for any of the options below
    #[arg(long, env = "LLMBENCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Local)]
    mode: Mode,

    /// ollama, vllm, llamacpp, or auto to probe the host
    #[arg(long)]
    service: Option<String>,

    /// Server address, e.g. http://10.0.0.5:8000 or 10.0.0.5:8000
    #[arg(long)]
    host: Option<String>,

    /// Model identifier sent with each request
    #[arg(long)]
    model: Option<String>,

    /// Prompt text; may be given several times
    #[arg(long = "prompt")]
    prompts: Vec<String>,

    /// JSONL file whose objects contain a `text` field and optionally a `name`
    #[arg(long)]
    prompts_file: Option<PathBuf>,

    /// Prompts to run: `all` or 1-based indices such as `1,3,5` or `2-4`
    #[arg(long, default_value = "all")]
    select: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "TIMEOUT_SECONDS")]
    timeout_secs: Option<u64>,

    /// Ask for the whole response at once instead of a token stream
    #[arg(long)]
    no_stream: bool,

    /// Generation limit for services that take one
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Directory that receives benchmark_output_*.txt files
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Live view refresh interval in milliseconds
    #[arg(long)]
    refresh_ms: Option<u64>,

    /// Pause between prompts in milliseconds
    #[arg(long)]
    pause_ms: Option<u64>,

    /// Print one line per finished prompt instead of redrawing in place
    #[arg(long)]
    plain: bool,

    /// API key to use; if omitted an environment variable is read
    #[arg(long)]
    api_key: Option<String>,

    /// Environment variable name to read the API key from when --api-key is not supplied
    #[arg(long, default_value = "LLMBENCH_API_KEY")]
    api_key_env: String,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long)]
    debug: bool,

    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args)?;

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let prompts = load_prompts(&args)?;
    if prompts.is_empty() {
        bail!("no prompts given; use --prompt or --prompts-file");
    }
    let selected = parse_selection(&args.select, prompts.len())?;
    let prompts: Vec<(String, String)> = selected
        .into_iter()
        .map(|idx| prompts[idx].clone())
        .collect();

    let model = args
        .model
        .clone()
        .or_else(|| file.model.clone())
        .ok_or_else(|| anyhow!("--model is required (or `model` in the config file)"))?;

    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var(&args.api_key_env).ok());

    let config = session_config(&args, &file);
    let endpoint = resolve_target(&args, &file, api_key).await?;
    info!(
        service = %endpoint.kind(),
        host = endpoint.host(),
        authenticated = endpoint.is_authenticated(),
        prompts = prompts.len(),
        "starting session"
    );

    let adapter = WireAdapter::new(&config)?;
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let streaming = config.stream;
    let mut session = BenchmarkSession::new(endpoint, model, prompts);
    let outcome = run_session(&mut session, &adapter, config, cancel).await?;

    if outcome.cancelled {
        println!("Interrupted; remaining prompts were skipped.");
    }
    print_summary(&outcome.summary, streaming);
    println!("Results saved to {}", outcome.artifact.display());

    Ok(if outcome.summary.has_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.debug {
        Level::DEBUG
    } else if args.verbose {
        Level::INFO
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialise logging: {}", err))
}

fn session_config(args: &Args, file: &FileConfig) -> SessionConfig {
    let mut config = file.apply(SessionConfig::default());
    if let Some(secs) = args.timeout_secs {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    if args.no_stream {
        config = config.with_stream(false);
    }
    if let Some(max_tokens) = args.max_tokens {
        config = config.with_max_tokens(max_tokens);
    }
    if let Some(dir) = &args.results_dir {
        config = config.with_results_dir(dir.clone());
    }
    if let Some(ms) = args.refresh_ms {
        config = config.with_refresh_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = args.pause_ms {
        config = config.with_job_pause(Duration::from_millis(ms));
    }
    config.with_live(!args.plain && io::stdout().is_terminal())
}

async fn resolve_target(args: &Args, file: &FileConfig, api_key: Option<String>) -> Result<Endpoint> {
    let service = args
        .service
        .clone()
        .or_else(|| file.service.clone())
        .unwrap_or_else(|| "auto".to_string());
    let host = args.host.clone().or_else(|| file.host.clone());

    if args.mode == Mode::Remote && host.is_none() {
        bail!("--host is required in remote mode");
    }

    if !service.eq_ignore_ascii_case("auto") {
        let kind: ServiceKind = service.parse()?;
        let host = host.unwrap_or_else(|| kind.local_host());
        return Endpoint::try_new(host, kind, api_key);
    }

    let candidates: Vec<String> = match host {
        Some(host) => vec![host],
        None => ServiceKind::all().iter().map(|kind| kind.local_host()).collect(),
    };

    let client = reqwest::Client::builder()
        .build()
        .context("failed to construct HTTP client")?;
    for candidate in &candidates {
        // The kind is provisional until the probe answers.
        let endpoint = Endpoint::try_new(candidate, ServiceKind::Generate, api_key.clone())?;
        if let Some(detection) =
            detect_service(&client, endpoint.base_url(), endpoint.headers()).await
        {
            if detection.requires_auth() {
                warn!(
                    host = endpoint.host(),
                    status = %detection.status,
                    "server requires authentication; check the API key"
                );
            }
            return Ok(endpoint.with_kind(detection.kind));
        }
    }

    Err(anyhow!(
        "no LLM service answered at {}",
        candidates.join(", ")
    ))
}

fn load_prompts(args: &Args) -> Result<Vec<(String, String)>> {
    let mut prompts: Vec<(String, Option<String>)> = args
        .prompts
        .iter()
        .map(|text| (text.clone(), None))
        .collect();

    if let Some(path) = &args.prompts_file {
        let from_file = load_prompt_file(path)
            .with_context(|| format!("failed to load prompts from {}", path.display()))?;
        if from_file.is_empty() {
            bail!(
                "{} did not contain any JSON records with a `text` field",
                path.display()
            );
        }
        prompts.extend(from_file);
    }

    Ok(prompts
        .into_iter()
        .enumerate()
        .map(|(idx, (text, name))| {
            let name = name.unwrap_or_else(|| format!("Prompt {}", idx + 1));
            (name, text)
        })
        .collect())
}

fn load_prompt_file(path: &Path) -> Result<Vec<(String, Option<String>)>> {
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut prompts = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed)
            .with_context(|| format!("line {} is not valid JSON: {}", idx + 1, trimmed))?;
        let text = value
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("line {} missing string field `text`", idx + 1))?;
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        prompts.push((text.to_string(), name));
    }

    Ok(prompts)
}

/// 0-based indices for a selection such as `all`, `2`, `1,3` or `2-4`.
fn parse_selection(selection: &str, count: usize) -> Result<Vec<usize>> {
    let selection = selection.trim();
    if selection.eq_ignore_ascii_case("all") {
        return Ok((0..count).collect());
    }

    let mut indices = Vec::new();
    for part in selection.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (parse_index(start, count)?, parse_index(end, count)?),
            None => {
                let idx = parse_index(part, count)?;
                (idx, idx)
            }
        };
        if start > end {
            bail!("invalid range {}", part);
        }
        for idx in start..=end {
            if !indices.contains(&idx) {
                indices.push(idx);
            }
        }
    }

    if indices.is_empty() {
        bail!("--select did not name any prompts");
    }
    Ok(indices)
}

fn parse_index(text: &str, count: usize) -> Result<usize> {
    let number: usize = text
        .trim()
        .parse()
        .with_context(|| format!("invalid prompt number: {}", text))?;
    if number == 0 || number > count {
        bail!("prompt number {} is out of range (1-{})", number, count);
    }
    Ok(number - 1)
}

fn print_summary(summary: &SessionSummary, streaming: bool) {
    println!();
    println!(
        "Prompts: {} (completed {}, failed {}, timed out {})",
        summary.total_jobs(),
        summary.completed,
        summary.failed,
        summary.timed_out
    );
    if streaming {
        println!(
            "Tokens generated: {} ({:.2} tok/s aggregate)",
            summary.total_tokens_generated, summary.aggregate_generation_speed
        );
    } else {
        println!(
            "Tokens generated: {} (generation speed not measured without streaming)",
            summary.total_tokens_generated
        );
    }
    if summary.has_completed() {
        println!(
            "Average time: total {:.3}s, prompt delay {:.3}s, generation {:.3}s",
            summary.average_total_time, summary.average_prompt_delay, summary.average_generation_time
        );
        if streaming {
            println!(
                "Average speed: {:.2} tok/s generation, {:.2} tok/s overall ({:.1} tokens per prompt)",
                summary.average_generation_speed, summary.average_request_speed, summary.average_tokens
            );
        } else {
            println!(
                "Average speed: {:.2} tok/s overall ({:.1} tokens per prompt)",
                summary.average_request_speed, summary.average_tokens
            );
        }
    }

    if !summary.failures.is_empty() {
        println!("Failures: {}", summary.failures.len());
        for failure in &summary.failures {
            println!("  {} [{}]: {}", failure.name, failure.status, failure.error);
        }
    }
}
