//! Identity resolution: turns a normalized sighting into exactly one
//! canonical record per identity key.
//!
//! `merge` performs a single read-decide-write pass. Creation is guarded by the
//! unique identity_key constraint, updates by the stored version. A lost update
//! race is reported as [`MergeOutcome::Conflict`] without touching storage;
//! looping is left to [`retry::retry_on_conflict`].

pub mod retry;

use serde::Serialize;
use tracing::debug;

use crate::model::{AttributeError, CanonicalAttributes, CanonicalRecord, IdentityKey, SourceIds};
use crate::store::{InsertOutcome, NewRecord, Store, StoreError};

pub use retry::{RetryPolicy, retry_on_conflict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Created { canonical_id: i64 },
    Updated { canonical_id: i64, version: i64 },
    /// The sighting was already recorded; nothing was written.
    Unchanged { canonical_id: i64, version: i64 },
    /// The record moved past `observed_version` before the write landed.
    Conflict { observed_version: i64 },
}

impl MergeOutcome {
    pub fn canonical_id(&self) -> Option<i64> {
        match self {
            Self::Created { canonical_id }
            | Self::Updated { canonical_id, .. }
            | Self::Unchanged { canonical_id, .. } => Some(*canonical_id),
            Self::Conflict { .. } => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("invalid attributes: {0}")]
    InvalidAttributes(#[from] AttributeError),
    #[error("source name and source-local id must not be empty")]
    MissingProvenance,
    #[error("merge still conflicting after {attempts} attempts")]
    MergeFailed { attempts: u32 },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub struct MergeEngine<'a> {
    store: &'a Store,
}

impl<'a> MergeEngine<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn merge(
        &self,
        source: &str,
        local_id: &str,
        attrs: &CanonicalAttributes,
    ) -> Result<MergeOutcome, MergeError> {
        let attrs = attrs.canonical();
        let key = IdentityKey::from_attributes(&attrs)?;
        if source.trim().is_empty() || local_id.trim().is_empty() {
            return Err(MergeError::MissingProvenance);
        }

        if let Some(existing) = self.store.find_record(&key)? {
            return self.attach(&key, existing, source, local_id);
        }

        let canonical_id = self.store.next_canonical_id()?;
        let record = NewRecord {
            canonical_id,
            identity_key: key.clone(),
            attributes: attrs,
            source_ids: SourceIds::single(source, local_id),
        };
        match self.store.insert_record(&record)? {
            InsertOutcome::Created => {
                debug!(%source, %local_id, canonical_id, identity_key = %key, "created canonical record");
                Ok(MergeOutcome::Created { canonical_id })
            }
            InsertOutcome::AlreadyExists => {
                debug!(%source, %local_id, identity_key = %key, "lost create race, merging into existing record");
                match self.store.find_record(&key)? {
                    Some(existing) => self.attach(&key, existing, source, local_id),
                    // Removed again by a concurrent reset; the caller re-runs from lookup.
                    None => Ok(MergeOutcome::Conflict {
                        observed_version: 0,
                    }),
                }
            }
        }
    }

    /// Merges with the given bounded retry policy applied to conflicts.
    pub fn merge_with_retry(
        &self,
        policy: &RetryPolicy,
        source: &str,
        local_id: &str,
        attrs: &CanonicalAttributes,
    ) -> Result<MergeOutcome, MergeError> {
        retry_on_conflict(policy, || self.merge(source, local_id, attrs))
    }

    fn attach(
        &self,
        key: &IdentityKey,
        existing: CanonicalRecord,
        source: &str,
        local_id: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let mut source_ids = existing.source_ids;
        if !source_ids.insert(source, local_id) {
            return Ok(MergeOutcome::Unchanged {
                canonical_id: existing.canonical_id,
                version: existing.version,
            });
        }

        if self
            .store
            .update_record_if_version(key, existing.version, &source_ids)?
        {
            let version = existing.version + 1;
            debug!(%source, %local_id, canonical_id = existing.canonical_id, version, "attached source id");
            Ok(MergeOutcome::Updated {
                canonical_id: existing.canonical_id,
                version,
            })
        } else {
            debug!(%source, %local_id, observed_version = existing.version, "version moved underneath merge");
            Ok(MergeOutcome::Conflict {
                observed_version: existing.version,
            })
        }
    }
}
