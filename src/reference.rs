//! Document references and canonical URL resolution
//!
//! A [`DocumentReference`] is validated when it is built, so resolving it
//! never fails.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::ResolverConfig;

/// Reference validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("Empty document reference")]
    Empty,

    #[error("Invalid arXiv identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid document URL: {0}")]
    InvalidUrl(String),
}

/// A request for one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    /// arXiv identifier, or the URL itself for URL references
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_url: Option<String>,
}

impl DocumentReference {
    /// Reference an arXiv paper by identifier (`2101.00001`, `hep-th/9901001v2`, `arXiv:...`)
    pub fn arxiv(id: &str) -> Result<Self, ReferenceError> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ReferenceError::Empty);
        }
        let bare = strip_prefix_ignore_case(trimmed, "arxiv:").unwrap_or(trimmed);

        if is_new_style_id(bare) || is_old_style_id(bare) {
            Ok(Self {
                id: bare.to_string(),
                explicit_url: None,
            })
        } else {
            Err(ReferenceError::InvalidIdentifier(trimmed.to_string()))
        }
    }

    /// Reference a document by URL. A missing scheme defaults to `https://`.
    pub fn url(url: &str) -> Result<Self, ReferenceError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let parsed =
            Url::parse(&with_scheme).map_err(|_| ReferenceError::InvalidUrl(trimmed.to_string()))?;
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ReferenceError::InvalidUrl(trimmed.to_string()));
        }

        let normalized = parsed.to_string();
        Ok(Self {
            id: normalized.clone(),
            explicit_url: Some(normalized),
        })
    }

    /// Accept either an arXiv identifier or a URL
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ReferenceError::Empty);
        }

        match Self::arxiv(trimmed) {
            Ok(reference) => Ok(reference),
            Err(_) if looks_like_url(trimmed) => Self::url(trimmed),
            Err(e) => Err(e),
        }
    }

    /// Whether this reference names an arXiv paper rather than a raw URL
    pub fn is_arxiv(&self) -> bool {
        self.explicit_url.is_none()
    }
}

/// Maps references to canonical, fetchable URLs
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    config: ResolverConfig,
}

impl Resolver {
    /// Resolver over the configured arXiv endpoints
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Canonical PDF URL for a reference
    pub fn resolve(&self, reference: &DocumentReference) -> String {
        match &reference.explicit_url {
            Some(url) => url.clone(),
            None => format!("{}/{}.pdf", self.config.arxiv_pdf_base, reference.id),
        }
    }

    /// The arXiv abstract page, for id references only
    pub fn landing_page_url(&self, reference: &DocumentReference) -> Option<String> {
        reference
            .is_arxiv()
            .then(|| format!("{}/{}", self.config.arxiv_abs_base, reference.id))
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Strip an optional `vN` version suffix
fn strip_version(s: &str) -> &str {
    match s.rfind('v') {
        Some(pos)
            if pos > 0
                && pos + 1 < s.len()
                && s[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &s[..pos]
        }
        _ => s,
    }
}

/// `YYMM.NNNN` or `YYMM.NNNNN`
fn is_new_style_id(s: &str) -> bool {
    let base = strip_version(s);
    let Some((yymm, number)) = base.split_once('.') else {
        return false;
    };
    yymm.len() == 4
        && yymm.bytes().all(|b| b.is_ascii_digit())
        && matches!(number.len(), 4 | 5)
        && number.bytes().all(|b| b.is_ascii_digit())
}

/// `archive[.SUB]/YYMMNNN`
fn is_old_style_id(s: &str) -> bool {
    let base = strip_version(s);
    let Some((archive, number)) = base.split_once('/') else {
        return false;
    };
    let archive_ok = !archive.is_empty()
        && archive
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-'));
    archive_ok && number.len() == 7 && number.bytes().all(|b| b.is_ascii_digit())
}

fn looks_like_url(s: &str) -> bool {
    if s.contains("://") {
        return true;
    }
    let host = s.split('/').next().unwrap_or_default();
    host.contains('.') && !host.starts_with('.') && !host.ends_with('.') && !host.contains(' ')
}
