//! Retrievers
//!
//! Defines the retriever trait and the HTTP implementation.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};

use super::types::{FetchFailure, FetchRequest, RetrievalPath};
use crate::config::FetchConfig;

/// Performs a single retrieval attempt
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Fetch the document bytes for one attempt
    async fn retrieve(&self, request: &FetchRequest) -> Result<Bytes, FetchFailure>;

    /// Whether [`RetrievalPath::Alternate`] can be served
    fn has_alternate_path(&self) -> bool;
}

/// reqwest-backed retriever
pub struct HttpRetriever {
    client: reqwest::Client,
    proxy_template: Option<String>,
    /// Origin of the embedding surface; direct responses must allow it
    origin: Option<String>,
}

impl HttpRetriever {
    /// Build the HTTP client with the configured timeout and user agent
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            proxy_template: config.proxy_template.clone(),
            origin: config.origin.clone(),
        })
    }

    /// Address of `url` through the alternate path
    pub fn alternate_url(&self, url: &str) -> Option<String> {
        self.proxy_template
            .as_ref()
            .map(|template| template.replace("{url}", &urlencoding::encode(url)))
    }

    fn origin_allowed(&self, response: &reqwest::Response) -> Result<(), FetchFailure> {
        let Some(origin) = &self.origin else {
            return Ok(());
        };

        let allowed = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok())
            .map(str::trim);

        match allowed {
            Some("*") => Ok(()),
            Some(value) if value == origin => Ok(()),
            Some(value) => Err(FetchFailure::CrossOrigin(format!(
                "origin {} not allowed (server allows {})",
                origin, value
            ))),
            None => Err(FetchFailure::CrossOrigin(format!(
                "no Access-Control-Allow-Origin header for origin {}",
                origin
            ))),
        }
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, request: &FetchRequest) -> Result<Bytes, FetchFailure> {
        let target = match request.path {
            RetrievalPath::Direct => request.url.clone(),
            RetrievalPath::Alternate => self.alternate_url(&request.url).ok_or_else(|| {
                FetchFailure::Network("no alternate retrieval path configured".to_string())
            })?,
        };

        tracing::debug!(
            url = %target,
            attempt = request.attempt,
            path = ?request.path,
            "Retrieving document"
        );

        let mut builder = self.client.get(&target);
        if request.path == RetrievalPath::Direct {
            if let Some(origin) = &self.origin {
                builder = builder.header(ORIGIN, origin.as_str());
            }
        }

        let response = builder.send().await.map_err(classify_error)?;

        // A blocked response is opaque: its status never reaches the caller
        if request.path == RetrievalPath::Direct {
            self.origin_allowed(&response)?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Server(status.as_u16()));
        }

        let body = response.bytes().await.map_err(classify_error)?;

        tracing::debug!(
            url = %target,
            attempt = request.attempt,
            bytes = body.len(),
            "Document retrieved"
        );

        Ok(body)
    }

    fn has_alternate_path(&self) -> bool {
        self.proxy_template.is_some()
    }
}

fn classify_error(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Timeout
    } else {
        FetchFailure::Network(err.to_string())
    }
}

/// Scripted retriever for testing
#[cfg(test)]
pub(crate) struct ScriptedRetriever {
    script: parking_lot::Mutex<std::collections::VecDeque<(std::time::Duration, Result<Bytes, FetchFailure>)>>,
    /// Returned once the script runs out
    fallback: Result<Bytes, FetchFailure>,
    requests: parking_lot::Mutex<Vec<FetchRequest>>,
    alternate: bool,
}

#[cfg(test)]
impl ScriptedRetriever {
    pub fn new(fallback: Result<Bytes, FetchFailure>) -> Self {
        Self {
            script: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            fallback,
            requests: parking_lot::Mutex::new(Vec::new()),
            alternate: true,
        }
    }

    pub fn then(self, delay_ms: u64, outcome: Result<Bytes, FetchFailure>) -> Self {
        self.script
            .lock()
            .push_back((std::time::Duration::from_millis(delay_ms), outcome));
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn retrieve(&self, request: &FetchRequest) -> Result<Bytes, FetchFailure> {
        self.requests.lock().push(request.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some((delay, outcome)) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            None => self.fallback.clone(),
        }
    }

    fn has_alternate_path(&self) -> bool {
        self.alternate
    }
}
