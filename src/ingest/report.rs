use serde::Serialize;

use crate::merge::MergeOutcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl Tally {
    pub fn add(&mut self, other: &Tally) {
        self.fetched += other.fetched;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.rejected += other.rejected;
        self.failed += other.failed;
    }

    pub fn merged(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingLocalId,
    Rejected,
    InvalidAttributes,
    MergeFailed,
}

/// A record that was skipped. `offset` is its absolute position in the source
/// feed, so it can be refetched or looked up in the raw archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordIssue {
    pub local_id: Option<String>,
    pub offset: u64,
    pub kind: IssueKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub offset: u64,
    pub requested: u64,
    #[serde(flatten)]
    pub tally: Tally,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<RecordIssue>,
}

impl BatchReport {
    pub fn new(offset: u64, requested: u64, fetched: usize) -> Self {
        Self {
            offset,
            requested,
            tally: Tally {
                fetched,
                ..Tally::default()
            },
            issues: Vec::new(),
        }
    }

    pub fn record_outcome(&mut self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Created { .. } => self.tally.created += 1,
            MergeOutcome::Updated { .. } => self.tally.updated += 1,
            MergeOutcome::Unchanged { .. } => self.tally.unchanged += 1,
            MergeOutcome::Conflict { .. } => self.tally.failed += 1,
        }
    }

    pub fn record_issue(&mut self, issue: RecordIssue) {
        match issue.kind {
            IssueKind::MergeFailed => self.tally.failed += 1,
            IssueKind::MissingLocalId | IssueKind::Rejected | IssueKind::InvalidAttributes => {
                self.tally.rejected += 1
            }
        }
        self.issues.push(issue);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// The source returned an empty batch.
    Done,
    /// A fetch failed; the checkpoint stays at `end_offset`.
    FetchFailed,
    /// A stop was requested between batches.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub state: SourceState,
    pub start_offset: u64,
    pub end_offset: u64,
    #[serde(flatten)]
    pub totals: Tally,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    pub batches: Vec<BatchReport>,
}

impl SourceReport {
    pub(crate) fn start(source: &str, offset: u64) -> Self {
        Self {
            source: source.to_string(),
            state: SourceState::Done,
            start_offset: offset,
            end_offset: offset,
            totals: Tally::default(),
            fetch_error: None,
            batches: Vec::new(),
        }
    }

    pub(crate) fn push_batch(&mut self, batch: BatchReport, next_offset: u64) {
        self.totals.add(&batch.tally);
        self.end_offset = next_offset;
        self.batches.push(batch);
    }

    pub fn issues(&self) -> impl Iterator<Item = &RecordIssue> {
        self.batches.iter().flat_map(|batch| batch.issues.iter())
    }

    pub fn is_clean(&self) -> bool {
        self.state != SourceState::FetchFailed
            && self.totals.rejected == 0
            && self.totals.failed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn totals(&self) -> Tally {
        let mut totals = Tally::default();
        for source in &self.sources {
            totals.add(&source.totals);
        }
        totals
    }

    pub fn is_clean(&self) -> bool {
        self.sources.iter().all(SourceReport::is_clean)
    }

    pub fn source(&self, name: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|source| source.source == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_feed_source_totals() {
        let mut batch = BatchReport::new(10, 5, 3);
        batch.record_outcome(&MergeOutcome::Created { canonical_id: 1 });
        batch.record_outcome(&MergeOutcome::Unchanged {
            canonical_id: 1,
            version: 1,
        });
        batch.record_issue(RecordIssue {
            local_id: Some("9".to_string()),
            offset: 12,
            kind: IssueKind::Rejected,
            reason: "missing or non-string field `hostname`".to_string(),
        });

        let mut source = SourceReport::start("alpha", 10);
        source.push_batch(batch, 15);
        assert_eq!(source.end_offset, 15);
        assert_eq!(source.totals.fetched, 3);
        assert_eq!(source.totals.merged(), 2);
        assert_eq!(source.totals.rejected, 1);
        assert_eq!(source.issues().count(), 1);
        assert!(!source.is_clean());
    }

    #[test]
    fn report_serializes_flat_counts_and_snake_case_state() {
        let mut source = SourceReport::start("beta", 0);
        source.state = SourceState::FetchFailed;
        source.fetch_error = Some("timeout".to_string());
        let json = serde_json::to_value(&source).expect("serialize");
        assert_eq!(json["state"], "fetch_failed");
        assert_eq!(json["fetched"], 0);
        assert_eq!(json["fetch_error"], "timeout");
    }
}
