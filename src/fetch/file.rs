use std::fs;
use std::path::PathBuf;

use serde_json::Value;

use super::{FetchError, Fetcher, page};
use crate::model::SourceDescriptor;

/// Serves pages out of `<dir>/<endpoint>`, a JSON array or a JSON-lines file.
/// Used for offline replays of captured feeds.
pub struct FileFetcher {
    dir: PathBuf,
}

impl FileFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source: &SourceDescriptor) -> PathBuf {
        self.dir.join(source.endpoint.trim_start_matches('/'))
    }

    fn load(&self, source: &SourceDescriptor) -> Result<Vec<Value>, FetchError> {
        let path = self.path_for(source);
        let content = fs::read_to_string(&path).map_err(|source| FetchError::Io {
            path: path.clone(),
            source,
        })?;

        let is_jsonl = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));
        if is_jsonl {
            let mut records = Vec::new();
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record = serde_json::from_str(line).map_err(|source| FetchError::Parse {
                    path: path.clone(),
                    source,
                })?;
                records.push(record);
            }
            return Ok(records);
        }

        match serde_json::from_str(&content) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(_) => Err(FetchError::Malformed {
                location: path.display().to_string(),
            }),
            Err(source) => Err(FetchError::Parse { path, source }),
        }
    }
}

impl Fetcher for FileFetcher {
    fn fetch(
        &self,
        source: &SourceDescriptor,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Value>, FetchError> {
        let records = self.load(source)?;
        Ok(page(&records, skip, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pages_through_json_array_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("alpha.json"),
            r#"[{"id":1},{"id":2},{"id":3}]"#,
        )
        .expect("write feed");
        let fetcher = FileFetcher::new(dir.path());
        let source = SourceDescriptor::new("alpha", "/alpha.json", "id");

        assert_eq!(
            fetcher.fetch(&source, 0, 2).expect("page 1"),
            vec![json!({"id": 1}), json!({"id": 2})]
        );
        assert_eq!(
            fetcher.fetch(&source, 2, 2).expect("page 2"),
            vec![json!({"id": 3})]
        );
        assert!(fetcher.fetch(&source, 4, 2).expect("past end").is_empty());
    }

    #[test]
    fn reads_json_lines_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("feeds")).expect("subdir");
        fs::write(
            dir.path().join("feeds/beta.jsonl"),
            "{\"id\":\"a\"}\n\n{\"id\":\"b\"}\n",
        )
        .expect("write feed");
        let fetcher = FileFetcher::new(dir.path());
        let source = SourceDescriptor::new("beta", "feeds/beta.jsonl", "id");
        assert_eq!(fetcher.fetch(&source, 1, 10).expect("page").len(), 1);
    }

    #[test]
    fn missing_or_malformed_feed_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = FileFetcher::new(dir.path());
        let missing = SourceDescriptor::new("gamma", "gamma.json", "id");
        assert!(matches!(
            fetcher.fetch(&missing, 0, 1),
            Err(FetchError::Io { .. })
        ));

        fs::write(dir.path().join("obj.json"), r#"{"id":1}"#).expect("write");
        let object = SourceDescriptor::new("obj", "obj.json", "id");
        assert!(matches!(
            fetcher.fetch(&object, 0, 1),
            Err(FetchError::Malformed { .. })
        ));
    }
}
