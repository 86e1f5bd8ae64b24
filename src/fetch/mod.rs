//! Paged retrieval of raw records from external inventory sources.

pub mod file;
pub mod http;

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::{FetcherConfig, FetcherKind, expand_tilde};
use crate::model::SourceDescriptor;

pub use file::FileFetcher;
pub use http::HttpFetcher;

/// One page of raw records: `limit` records starting at `skip`. An empty page
/// means the source has nothing more to give.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        source: &SourceDescriptor,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Value>, FetchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("{location} did not return a JSON array of records")]
    Malformed { location: String },
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("fetcher misconfigured: {0}")]
    Misconfigured(String),
}

/// Builds the configured fetcher. A relative `dir` resolves against `base_dir`.
pub fn build_fetcher(
    config: &FetcherConfig,
    base_dir: &Path,
    home: &Path,
) -> Result<Box<dyn Fetcher>, FetchError> {
    match config.kind {
        FetcherKind::Http => {
            let base_url = config
                .base_url
                .as_deref()
                .ok_or_else(|| FetchError::Misconfigured("http fetcher needs base_url".into()))?;
            let fetcher = HttpFetcher::new(base_url, config.token.as_deref(), config.timeout)?;
            Ok(Box::new(fetcher))
        }
        FetcherKind::File => {
            let dir = config
                .dir
                .as_deref()
                .ok_or_else(|| FetchError::Misconfigured("file fetcher needs dir".into()))?;
            Ok(Box::new(FileFetcher::new(base_dir.join(expand_tilde(dir, home)))))
        }
    }
}

pub(crate) fn page<T: Clone>(items: &[T], skip: u64, limit: u64) -> Vec<T> {
    let start = usize::try_from(skip).unwrap_or(usize::MAX).min(items.len());
    let len = usize::try_from(limit).unwrap_or(usize::MAX);
    items[start..].iter().take(len).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn page_slices_and_clamps() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(page(&items, 0, 2), vec![1, 2]);
        assert_eq!(page(&items, 4, 2), vec![5]);
        assert!(page(&items, 5, 2).is_empty());
        assert!(page(&items, 50, 2).is_empty());
        assert_eq!(page(&items, 1, u64::MAX), vec![2, 3, 4, 5]);
    }

    #[test]
    fn factory_requires_the_kind_specific_setting() {
        let mut config = FetcherConfig {
            kind: FetcherKind::File,
            base_url: None,
            token: None,
            timeout: Duration::from_secs(1),
            dir: None,
        };
        let home = Path::new("/home/tester");
        assert!(matches!(
            build_fetcher(&config, Path::new("/work"), home),
            Err(FetchError::Misconfigured(_))
        ));

        config.dir = Some(PathBuf::from("feeds"));
        assert!(build_fetcher(&config, Path::new("/work"), home).is_ok());

        config.kind = FetcherKind::Http;
        assert!(matches!(
            build_fetcher(&config, Path::new("/work"), home),
            Err(FetchError::Misconfigured(_))
        ));
    }
}
