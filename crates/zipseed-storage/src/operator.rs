//! OpenDAL Operator factory for web-seed URLs

use opendal::Operator;
use percent_encoding::percent_decode_str;
use url::Url;
use zipseed_core::{ZipseedError, ZipseedResult};

/// A web-seed URL split into the operator endpoint and the blob path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedLocation {
    /// `scheme://host[:port]`
    pub endpoint: String,
    /// Blob path relative to the endpoint, without a leading '/'
    pub path: String,
}

impl SeedLocation {
    /// Split a web-seed URL. Only http(s) URLs naming a file are accepted;
    /// credentials, queries and fragments are rejected.
    pub fn parse(url: &str) -> ZipseedResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| ZipseedError::Config(format!("invalid web seed URL {url}: {e}")))?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(ZipseedError::Config(format!(
                "unsupported web seed scheme '{scheme}' in {url}"
            )));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ZipseedError::Config(format!("web seed URL has no host: {url}")))?;
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(ZipseedError::Config(format!(
                "web seed URL must not carry credentials: {scheme}://{host}/..."
            )));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(ZipseedError::Config(format!(
                "web seed URL must not carry a query or fragment: {url}"
            )));
        }

        let raw_path = parsed.path();
        if raw_path.ends_with('/') {
            return Err(ZipseedError::Config(format!(
                "web seed URL must name the blob file: {url}"
            )));
        }
        let path = percent_decode_str(raw_path.trim_start_matches('/'))
            .decode_utf8()
            .map_err(|e| ZipseedError::Config(format!("web seed path is not UTF-8 in {url}: {e}")))?;

        let endpoint = match parsed.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        Ok(Self {
            endpoint,
            path: path.into_owned(),
        })
    }

    pub fn is_plaintext(&self) -> bool {
        self.endpoint.starts_with("http://")
    }
}

/// Build an OpenDAL Operator for an HTTP(S) origin.
///
/// `max_retries` of 0 leaves out the retry layer entirely.
pub fn build_http_operator(endpoint: &str, max_retries: usize) -> ZipseedResult<Operator> {
    let builder = opendal::services::Http::default().endpoint(endpoint);

    let op = Operator::new(builder)
        .map_err(|e| ZipseedError::Config(format!("creating HTTP operator for {endpoint}: {e}")))?
        .layer(opendal::layers::LoggingLayer::default());

    let op = if max_retries > 0 {
        op.layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(max_retries)
                .with_jitter(),
        )
        .finish()
    } else {
        op.finish()
    };

    Ok(op)
}

/// Parse a web-seed URL and build its operator.
pub fn open_seed(url: &str, max_retries: usize) -> ZipseedResult<(Operator, SeedLocation)> {
    let location = SeedLocation::parse(url)?;
    if location.is_plaintext() {
        tracing::debug!(url, "web seed uses plaintext HTTP; pieces are verified by hash");
    }
    let op = build_http_operator(&location.endpoint, max_retries)?;
    Ok((op, location))
}

/// In-memory operator, used to stage blobs for local fetches and tests.
pub fn memory_operator() -> ZipseedResult<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .map_err(|e| ZipseedError::Config(format!("creating memory operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish())
}
