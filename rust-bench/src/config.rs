use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// Wire-protocol family spoken by a target service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Ollama-style `/api/generate`, newline-delimited JSON.
    Generate,
    /// OpenAI-compatible `/v1/completions` (vLLM), server-sent events.
    Completion,
    /// llama.cpp server `/completion`, server-sent events keyed `content`/`stop`.
    Chat,
}

impl ServiceKind {
    pub fn all() -> &'static [ServiceKind] {
        &[ServiceKind::Generate, ServiceKind::Completion, ServiceKind::Chat]
    }

    /// Name written to the session header and shown in the live view.
    pub fn display_name(&self) -> &'static str {
        match self {
            ServiceKind::Generate => "Ollama",
            ServiceKind::Completion => "vLLM",
            ServiceKind::Chat => "Llama.cpp",
        }
    }

    pub fn generation_path(&self) -> &'static str {
        match self {
            ServiceKind::Generate => "/api/generate",
            ServiceKind::Completion => "/v1/completions",
            ServiceKind::Chat => "/completion",
        }
    }

    fn host_env(&self) -> (&'static str, &'static str) {
        match self {
            ServiceKind::Generate => ("OLLAMA_HOST", "http://localhost:11434"),
            ServiceKind::Completion => ("VLLM_HOST", "http://localhost:8000"),
            ServiceKind::Chat => ("LLAMACPP_HOST", "http://localhost:8080"),
        }
    }

    /// Host of a service running on this machine, honouring the per-service
    /// environment override.
    pub fn local_host(&self) -> String {
        let (var, default) = self.host_env();
        std::env::var(var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ServiceKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "generate" | "ollama" => Ok(ServiceKind::Generate),
            "completion" | "vllm" | "openai" => Ok(ServiceKind::Completion),
            "chat" | "llamacpp" | "llama.cpp" | "llama-cpp" => Ok(ServiceKind::Chat),
            other => Err(anyhow!("unknown service kind: {}", other)),
        }
    }
}

/// A resolved target. The credential lives only here, inside the request
/// headers, and is never handed to anything that persists results.
#[derive(Clone)]
pub struct Endpoint {
    base_url: Url,
    kind: ServiceKind,
    headers: HeaderMap,
    authenticated: bool,
}

impl Endpoint {
    pub fn try_new(
        base_url: impl AsRef<str>,
        kind: ServiceKind,
        api_key: Option<String>,
    ) -> Result<Self> {
        let normalized = normalize_base_url(base_url.as_ref());
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("invalid endpoint URL: {}", base_url.as_ref()))?;
        if base_url.host_str().is_none() {
            return Err(anyhow!("endpoint URL has no host: {}", normalized));
        }

        let mut headers = HeaderMap::new();
        let mut authenticated = false;
        if let Some(api_key) = api_key {
            if !api_key.is_empty() {
                let auth_value = format!("Bearer {}", api_key);
                let mut header_value = HeaderValue::from_str(&auth_value)
                    .context("failed to build Authorization header from api_key")?;
                header_value.set_sensitive(true);
                headers.insert(AUTHORIZATION, header_value);

                let mut key_value = HeaderValue::from_str(&api_key)
                    .context("failed to build X-API-Key header from api_key")?;
                key_value.set_sensitive(true);
                headers.insert(HeaderName::from_static("x-api-key"), key_value);
                authenticated = true;
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            base_url,
            kind,
            headers,
            authenticated,
        })
    }

    /// Same target and credentials, spoken to as `kind`.
    pub fn with_kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Base URL without a trailing slash, as recorded in result files.
    pub fn host(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// URL of `path` on this endpoint, keeping any prefix of the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let joined = format!("{}/{}", self.host(), path.trim_start_matches('/'));
        Url::parse(&joined).with_context(|| format!("invalid request URL: {}", joined))
    }

    pub fn generation_url(&self) -> Result<Url> {
        self.url_for(self.kind.generation_path())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.host())
            .field("kind", &self.kind)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

/// Add a scheme to a bare `host[:port]` and drop trailing slashes.
pub fn normalize_base_url(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub stream: bool,
    pub max_tokens: u32,
    pub results_dir: PathBuf,
    pub refresh_interval: Duration,
    pub job_pause: Duration,
    /// Redraw in place; when false, print one block per finished job.
    pub live: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_TIMEOUT,
            stream: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            results_dir: PathBuf::from("results"),
            refresh_interval: Duration::from_millis(100),
            job_pause: Duration::from_secs(2),
            live: true,
        }
    }
}

impl SessionConfig {
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = request_timeout;
        }
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        if max_tokens > 0 {
            self.max_tokens = max_tokens;
        }
        self
    }

    pub fn with_results_dir(mut self, results_dir: impl Into<PathBuf>) -> Self {
        self.results_dir = results_dir.into();
        self
    }

    /// Redraws are spaced at least this far apart.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        if !refresh_interval.is_zero() {
            self.refresh_interval = refresh_interval;
        }
        self
    }

    pub fn with_job_pause(mut self, job_pause: Duration) -> Self {
        self.job_pause = job_pause;
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }
}

/// Optional TOML file; every key may be omitted.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub service: Option<String>,
    pub host: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub stream: Option<bool>,
    pub max_tokens: Option<u32>,
    pub results_dir: Option<PathBuf>,
    pub refresh_ms: Option<u64>,
    pub pause_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Layer the file values over `base`.
    pub fn apply(&self, mut base: SessionConfig) -> SessionConfig {
        if let Some(secs) = self.timeout_secs {
            base = base.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(stream) = self.stream {
            base = base.with_stream(stream);
        }
        if let Some(max_tokens) = self.max_tokens {
            base = base.with_max_tokens(max_tokens);
        }
        if let Some(dir) = &self.results_dir {
            base = base.with_results_dir(dir.clone());
        }
        if let Some(ms) = self.refresh_ms {
            base = base.with_refresh_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.pause_ms {
            base = base.with_job_pause(Duration::from_millis(ms));
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_aliases() {
        assert_eq!("ollama".parse::<ServiceKind>().unwrap(), ServiceKind::Generate);
        assert_eq!("vLLM".parse::<ServiceKind>().unwrap(), ServiceKind::Completion);
        assert_eq!("llama.cpp".parse::<ServiceKind>().unwrap(), ServiceKind::Chat);
        assert!("gopher".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn bare_hosts_get_http_scheme() {
        assert_eq!(normalize_base_url("192.168.1.100"), "http://192.168.1.100");
        assert_eq!(
            normalize_base_url("https://api.example.com/"),
            "https://api.example.com"
        );
        assert_eq!(normalize_base_url(" 10.0.0.2:11434 "), "http://10.0.0.2:11434");
    }

    #[test]
    fn endpoint_builds_generation_url() {
        let endpoint =
            Endpoint::try_new("localhost:11434", ServiceKind::Generate, None).unwrap();
        assert_eq!(endpoint.host(), "http://localhost:11434");
        assert_eq!(
            endpoint.generation_url().unwrap().as_str(),
            "http://localhost:11434/api/generate"
        );
        assert!(!endpoint.is_authenticated());
        assert!(endpoint.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn endpoint_keeps_path_prefix() {
        let endpoint =
            Endpoint::try_new("https://proxy.local/llm/", ServiceKind::Completion, None).unwrap();
        assert_eq!(
            endpoint.generation_url().unwrap().as_str(),
            "https://proxy.local/llm/v1/completions"
        );
    }

    #[test]
    fn api_key_goes_to_headers_but_not_debug_output() {
        let endpoint = Endpoint::try_new(
            "http://gpu-box:8000",
            ServiceKind::Completion,
            Some("sk-secret".to_string()),
        )
        .unwrap();
        assert!(endpoint.is_authenticated());
        assert_eq!(
            endpoint.headers().get(AUTHORIZATION).unwrap(),
            "Bearer sk-secret"
        );
        assert_eq!(endpoint.headers().get("x-api-key").unwrap(), "sk-secret");
        assert!(!format!("{:?}", endpoint).contains("sk-secret"));
    }

    #[test]
    fn empty_api_key_is_ignored() {
        let endpoint =
            Endpoint::try_new("http://a:1", ServiceKind::Chat, Some(String::new())).unwrap();
        assert!(!endpoint.is_authenticated());
    }

    #[test]
    fn zero_timeout_keeps_default() {
        let config = SessionConfig::default().with_request_timeout(Duration::ZERO);
        assert_eq!(config.request_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn file_config_layers_over_defaults() {
        let file = FileConfig::parse(
            r#"
            service = "ollama"
            timeout_secs = 30
            stream = false
            results_dir = "out"
            pause_ms = 0
            "#,
        )
        .unwrap();
        let config = file.apply(SessionConfig::default());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.stream);
        assert_eq!(config.results_dir, PathBuf::from("out"));
        assert_eq!(config.job_pause, Duration::ZERO);
        assert_eq!(config.refresh_interval, Duration::from_millis(100));
    }

    #[test]
    fn file_config_rejects_unknown_keys() {
        assert!(FileConfig::parse("colour = \"blue\"").is_err());
    }
}
