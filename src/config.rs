//! Configuration management for the document loader

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderConfig {
    pub resolver: ResolverConfig,
    pub fetch: FetchConfig,
    pub progress: ProgressConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolverConfig {
    /// Base for arXiv PDF links, without trailing slash
    pub arxiv_pdf_base: String,
    /// Base for arXiv abstract (landing) pages
    pub arxiv_abs_base: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchConfig {
    /// Alternate retrieval path; `{url}` is replaced by the encoded canonical URL.
    /// `None` disables the alternate path.
    pub proxy_template: Option<String>,
    /// Origin of the embedding surface, used to emulate origin policy checks
    pub origin: Option<String>,
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Total attempts allowed for server errors and timeouts
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub backoff_base: Duration,
    #[serde(with = "millis")]
    pub backoff_max: Duration,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressConfig {
    #[serde(with = "millis")]
    pub interval: Duration,
    pub step: u8,
    pub ceiling: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewerConfig {
    /// Hosted rendering service; `{url}` is replaced by the encoded canonical URL
    pub hosted_viewer_template: String,
    /// Promote the standby viewer when the primary stays silent this long
    #[serde(with = "opt_millis")]
    pub readiness_timeout: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            arxiv_pdf_base: "https://arxiv.org/pdf".to_string(),
            arxiv_abs_base: "https://arxiv.org/abs".to_string(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            proxy_template: Some("https://corsproxy.io/?url={url}".to_string()),
            origin: None,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(4),
            user_agent: concat!("paper-loader/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            step: 5,
            ceiling: 90,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            hosted_viewer_template: "https://docs.google.com/viewer?url={url}&embedded=true"
                .to_string(),
            readiness_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl LoaderConfig {
    /// Build a configuration from `PAPER_LOADER_*` variables, reading `.env` first.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = LoaderConfig::default();

        if let Ok(base) = env::var("PAPER_LOADER_ARXIV_PDF_BASE") {
            config.resolver.arxiv_pdf_base = base.trim_end_matches('/').to_string();
        }
        // Set but empty turns these off
        if let Ok(template) = env::var("PAPER_LOADER_PROXY_TEMPLATE") {
            config.fetch.proxy_template = non_empty(template);
        }
        if let Ok(origin) = env::var("PAPER_LOADER_ORIGIN") {
            config.fetch.origin = non_empty(origin);
        }
        if let Some(ms) = parse_var::<u64>("PAPER_LOADER_FETCH_TIMEOUT_MS")? {
            config.fetch.timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>("PAPER_LOADER_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::Invalid {
                    name: "PAPER_LOADER_MAX_ATTEMPTS",
                    value: attempts.to_string(),
                });
            }
            config.fetch.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>("PAPER_LOADER_BACKOFF_BASE_MS")? {
            config.fetch.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("PAPER_LOADER_PROGRESS_INTERVAL_MS")? {
            config.progress.interval = Duration::from_millis(ms.max(1));
        }
        if let Some(step) = parse_var::<u8>("PAPER_LOADER_PROGRESS_STEP")? {
            config.progress.step = step;
        }
        if let Some(ceiling) = parse_var::<u8>("PAPER_LOADER_PROGRESS_CEILING")? {
            if ceiling >= 100 {
                return Err(ConfigError::Invalid {
                    name: "PAPER_LOADER_PROGRESS_CEILING",
                    value: ceiling.to_string(),
                });
            }
            config.progress.ceiling = ceiling;
        }
        if let Ok(template) = env::var("PAPER_LOADER_HOSTED_VIEWER_TEMPLATE") {
            config.viewer.hosted_viewer_template = template;
        }
        if let Some(ms) = parse_var::<u64>("PAPER_LOADER_READINESS_TIMEOUT_MS")? {
            config.viewer.readiness_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}
