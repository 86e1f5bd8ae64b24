//! Per-source normalization of raw inventory payloads into canonical attributes.
//!
//! Every source name maps to exactly one [`Normalizer`] in a
//! [`NormalizerRegistry`]. The registry is built from configuration before any
//! fetching starts, so an unknown normalizer or an unmapped source fails the
//! run up front.

pub mod crowdstrike;
pub mod pointer;
pub mod qualys;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::{NormalizerChoice, SourceSpec};
use crate::model::{CanonicalAttributes, SourceDescriptor};

pub use crowdstrike::CrowdstrikeNormalizer;
pub use pointer::{PointerFields, PointerNormalizer};
pub use qualys::QualysNormalizer;

/// Why a single raw record could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("missing or non-string field `{0}`")]
    MissingField(String),
    #[error("{0}")]
    Unusable(String),
}

pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &Value) -> Result<CanonicalAttributes, Rejection>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no normalizer registered for source(s): {}", .0.join(", "))]
    Unregistered(Vec<String>),
    #[error("source `{0}` uses the pointer normalizer but has no `fields` mapping")]
    MissingPointerFields(String),
}

#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    by_source: HashMap<String, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the normalizer named by each configured source.
    pub fn from_sources(sources: &[SourceSpec]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for source in sources {
            let normalizer: Arc<dyn Normalizer> = match &source.normalizer {
                NormalizerChoice::Crowdstrike => Arc::new(CrowdstrikeNormalizer),
                NormalizerChoice::Qualys => Arc::new(QualysNormalizer),
                NormalizerChoice::Pointer => {
                    let fields = source
                        .fields
                        .clone()
                        .ok_or_else(|| RegistryError::MissingPointerFields(source.name.clone()))?;
                    Arc::new(PointerNormalizer::new(fields))
                }
            };
            registry.register(&source.name, normalizer);
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: &str, normalizer: Arc<dyn Normalizer>) {
        self.by_source.insert(source.to_string(), normalizer);
    }

    pub fn get(&self, source: &str) -> Option<&dyn Normalizer> {
        self.by_source.get(source).map(Arc::as_ref)
    }

    pub fn ensure_registered(&self, sources: &[SourceDescriptor]) -> Result<(), RegistryError> {
        let missing = sources
            .iter()
            .filter(|source| !self.by_source.contains_key(&source.name))
            .map(|source| source.name.clone())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Unregistered(missing))
        }
    }
}

pub(crate) fn required_str<'a>(raw: &'a Value, field: &str) -> Result<&'a str, Rejection> {
    raw.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| Rejection::MissingField(field.to_string()))
}
