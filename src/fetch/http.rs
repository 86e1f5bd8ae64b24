use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::debug;

use super::{FetchError, Fetcher};
use crate::model::SourceDescriptor;

const TOKEN_HEADER: &str = "token";
const MAX_ERROR_BODY: usize = 512;

/// POSTs `skip`/`limit` query parameters to `<base_url><endpoint>` and expects a
/// JSON array back.
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(token).map_err(|_| {
                FetchError::Misconfigured("token is not a valid header value".to_string())
            })?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(TOKEN_HEADER), value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn url_for(&self, source: &SourceDescriptor) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            source.endpoint.trim_start_matches('/')
        )
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        source: &SourceDescriptor,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Value>, FetchError> {
        let url = self.url_for(source);
        debug!(source = %source.name, %url, skip, limit, "fetching page");
        let response = self
            .client
            .post(&url)
            .query(&[("skip", skip), ("limit", limit)])
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().map_err(|source| FetchError::Transport {
            url: url.clone(),
            source,
        })?;
        match payload {
            Value::Array(records) => Ok(records),
            _ => Err(FetchError::Malformed { location: url }),
        }
    }
}
