//! Service classification for `--service auto`.
//!
//! The only place that sniffs a server's shape. Adapter selection happens
//! afterwards from the [`ServiceKind`] returned here.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use crate::config::ServiceKind;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Paths tried in order; the first one that answers decides the kind.
pub const PROBE_PATHS: &[(&str, ServiceKind)] = &[
    ("/api/tags", ServiceKind::Generate),
    ("/v1/models", ServiceKind::Completion),
    ("/health", ServiceKind::Chat),
    ("/completion", ServiceKind::Chat),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub kind: ServiceKind,
    pub path: &'static str,
    pub status: StatusCode,
}

impl Detection {
    /// The server answered but rejected the credentials (or their absence).
    pub fn requires_auth(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED || self.status == StatusCode::FORBIDDEN
    }
}

fn counts_as_answer(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

pub async fn detect_service(client: &Client, base_url: &Url, headers: &HeaderMap) -> Option<Detection> {
    let base = base_url.as_str().trim_end_matches('/');
    for (path, kind) in PROBE_PATHS {
        let url = format!("{}{}", base, path);
        let response = client
            .get(&url)
            .headers(headers.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match response {
            Ok(response) if counts_as_answer(response.status()) => {
                debug!(path, status = %response.status(), kind = %kind, "probe matched");
                return Some(Detection {
                    kind: *kind,
                    path,
                    status: response.status(),
                });
            }
            Ok(response) => {
                debug!(path, status = %response.status(), "probe did not match");
            }
            Err(err) => {
                debug!(path, error = %err, "probe request failed");
            }
        }
    }
    None
}
