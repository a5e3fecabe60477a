//! Source resolution: turn a BDNS code or a user URL into a canonical URL.
//!
//! A BDNS code maps deterministically onto the public announcement page. The
//! BDNS JSON API for the same code is kept as the alternate URL; the
//! orchestrator uses it when the canonical page cannot be fetched or yields no
//! text.

use crate::error::AnalysisError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Public announcement page for a BDNS code.
pub const ANNOUNCEMENT_URL_TEMPLATE: &str =
    "https://www.subvenciones.gob.es/bdnstrans/GE/es/convocatorias/{code}";

/// BDNS JSON API record for a code (metadata + attached documents).
pub const API_URL_TEMPLATE: &str =
    "https://www.subvenciones.gob.es/bdnstrans/api/convocatorias?numConv={code}&vpd=GE";

/// Host serving both the announcement pages and the JSON API.
pub const BDNS_HOST: &str = "www.subvenciones.gob.es";

/// Path prefix of every BDNS page and API route on [`BDNS_HOST`].
const BDNS_PATH_PREFIX: &str = "/bdnstrans/";

/// Longest BDNS code accepted.
const MAX_CODE_DIGITS: usize = 10;

/// What the caller asks to analyse.
///
/// Exactly one of the two fields must be set. Deserialises from
/// `{"bdns_code": "845133"}` or `{"source_url": "https://…"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bdns_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl AnalysisRequest {
    pub fn from_code(code: impl Into<String>) -> Self {
        Self {
            bdns_code: Some(code.into()),
            source_url: None,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            bdns_code: None,
            source_url: Some(url.into()),
        }
    }

    /// Validate the request into exactly one [`Source`].
    ///
    /// Blank strings count as absent.
    pub fn to_source(&self) -> Result<Source, AnalysisError> {
        let code = non_blank(self.bdns_code.as_deref());
        let url = non_blank(self.source_url.as_deref());

        match (code, url) {
            (Some(_), Some(_)) => Err(AnalysisError::AmbiguousSource),
            (None, None) => Err(AnalysisError::MissingSource),
            (Some(code), None) => Ok(Source::Code(BdnsCode::parse(code)?)),
            (None, Some(url)) => Ok(Source::Url(parse_source_url(url)?)),
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// A validated request source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Code(BdnsCode),
    Url(Url),
}

/// A numeric BDNS announcement identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BdnsCode(String);

impl BdnsCode {
    pub fn parse(input: &str) -> Result<Self, AnalysisError> {
        let code = input.trim();
        if code.is_empty()
            || code.len() > MAX_CODE_DIGITS
            || !code.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(AnalysisError::InvalidCode {
                code: input.to_string(),
            });
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical announcement page.
    pub fn announcement_url(&self) -> Result<Url, AnalysisError> {
        fill_template(ANNOUNCEMENT_URL_TEMPLATE, self)
    }

    /// BDNS JSON API record.
    pub fn api_url(&self) -> Result<Url, AnalysisError> {
        fill_template(API_URL_TEMPLATE, self)
    }

    /// Recover a code from a BDNS portal URL whose last path segment is
    /// numeric, e.g. `…/bdnstrans/GE/es/convocatorias/845133`.
    ///
    /// URLs on any other host never yield a code, whatever their path.
    pub fn from_url(url: &Url) -> Option<Self> {
        if !is_bdns_url(url) {
            return None;
        }
        let last = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
        Self::parse(last).ok()
    }
}

/// True for URLs on the BDNS portal under `/bdnstrans/`.
pub fn is_bdns_url(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(BDNS_HOST))
        && url.path().starts_with(BDNS_PATH_PREFIX)
}

fn fill_template(template: &str, code: &BdnsCode) -> Result<Url, AnalysisError> {
    let raw = template.replace("{code}", code.as_str());
    Url::parse(&raw).map_err(|e| AnalysisError::InvalidUrl {
        input: raw,
        reason: e.to_string(),
    })
}

impl fmt::Display for BdnsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of the resolving stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// BDNS code, given directly or recovered from the URL.
    pub bdns_code: Option<BdnsCode>,
    /// URL fetched first.
    pub url: Url,
    /// URL used for the single fallback attempt, if any.
    pub alternate: Option<Url>,
}

/// Resolve a request to the URL the fetcher should download.
pub fn resolve(request: &AnalysisRequest) -> Result<ResolvedSource, AnalysisError> {
    let resolved = match request.to_source()? {
        Source::Code(code) => ResolvedSource {
            url: code.announcement_url()?,
            alternate: Some(code.api_url()?),
            bdns_code: Some(code),
        },
        Source::Url(url) => {
            let bdns_code = BdnsCode::from_url(&url);
            let alternate = bdns_code
                .as_ref()
                .and_then(|code| code.api_url().ok())
                .filter(|alt| *alt != url);
            ResolvedSource {
                bdns_code,
                url,
                alternate,
            }
        }
    };
    debug!(
        "Resolved source: {} (code={:?}, alternate={:?})",
        resolved.url,
        resolved.bdns_code.as_ref().map(BdnsCode::as_str),
        resolved.alternate.as_ref().map(Url::as_str)
    );
    Ok(resolved)
}

fn parse_source_url(input: &str) -> Result<Url, AnalysisError> {
    let url = Url::parse(input).map_err(|e| AnalysisError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AnalysisError::InvalidUrl {
            input: input.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(AnalysisError::InvalidUrl {
            input: input.to_string(),
            reason: "missing host".into(),
        });
    }
    Ok(url)
}
