use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::evidence::{EvidenceIdentity, SourceTable};

/// Scored verdict for one evidence candidate. Matched ids are already
/// filtered against the audit context by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceAnalysis {
    pub score: f64,
    pub reason: String,
    #[serde(default)]
    pub matched_policy_ids: BTreeSet<i32>,
    #[serde(default)]
    pub matched_subpolicy_ids: BTreeSet<i32>,
    #[serde(default)]
    pub matched_compliance_ids: BTreeSet<i32>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentIndexEntry {
    pub content_key: String,
    /// Transient upload identifiers seen for this file, kept for backward
    /// lookup of entries written before content keys existed.
    #[serde(default)]
    pub legacy_ids: BTreeSet<String>,
    #[serde(flatten)]
    pub analysis: RelevanceAnalysis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIndexEntry {
    pub table: SourceTable,
    pub record_id: i64,
    #[serde(flatten)]
    pub analysis: RelevanceAnalysis,
}

/// Durable per-audit cache of verdicts, the unit of idempotency: anything
/// present here is never re-analyzed. Maps are ordered so reruns rewrite the
/// file byte-identically apart from timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisIndex {
    pub framework_id: i32,
    pub audit_id: i32,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub documents: BTreeMap<String, DocumentIndexEntry>,
    #[serde(default)]
    pub records: BTreeMap<String, RecordIndexEntry>,
}

impl AnalysisIndex {
    pub fn empty(framework_id: i32, audit_id: i32) -> Self {
        Self {
            framework_id,
            audit_id,
            last_updated: None,
            documents: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    pub fn record_key(table: SourceTable, record_id: i64) -> String {
        format!("{table}:{record_id}")
    }

    pub fn len(&self) -> usize {
        self.documents.len() + self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity resolution: documents match by content key first, and only
    /// fall back to scanning legacy ids when the key itself is unknown. This
    /// keeps a re-uploaded file from being analyzed twice.
    pub fn contains(&self, identity: &EvidenceIdentity) -> bool {
        match identity {
            EvidenceIdentity::Document { content_key } => {
                self.documents.contains_key(content_key)
                    || self
                        .documents
                        .values()
                        .any(|e| e.legacy_ids.contains(content_key))
            }
            EvidenceIdentity::Record { table, record_id } => self
                .records
                .contains_key(&Self::record_key(*table, *record_id)),
        }
    }

    /// Last-writer-wins at the key level. Legacy ids accumulate across
    /// uploads instead of being replaced.
    pub fn apply(
        &mut self,
        identity: &EvidenceIdentity,
        legacy_ids: &BTreeSet<String>,
        analysis: RelevanceAnalysis,
    ) {
        match identity {
            EvidenceIdentity::Document { content_key } => {
                let entry = self
                    .documents
                    .entry(content_key.clone())
                    .or_insert_with(|| DocumentIndexEntry {
                        content_key: content_key.clone(),
                        legacy_ids: BTreeSet::new(),
                        analysis: analysis.clone(),
                    });
                entry.legacy_ids.extend(legacy_ids.iter().cloned());
                entry.analysis = analysis;
            }
            EvidenceIdentity::Record { table, record_id } => {
                self.records.insert(
                    Self::record_key(*table, *record_id),
                    RecordIndexEntry {
                        table: *table,
                        record_id: *record_id,
                        analysis,
                    },
                );
            }
        }
    }

    pub fn analyses(&self) -> impl Iterator<Item = &RelevanceAnalysis> {
        self.documents
            .values()
            .map(|e| &e.analysis)
            .chain(self.records.values().map(|e| &e.analysis))
    }

    /// Aggregation rule: the audit's overall relevance is the maximum score
    /// across all analyzed evidence.
    pub fn overall_score(&self) -> f64 {
        self.analyses().fold(0.0_f64, |acc, a| acc.max(a.score))
    }
}

/// Owns the on-disk index files, one JSON document per (framework, audit).
/// Safe to delete a file to force full reanalysis of that audit.
pub struct AnalysisIndexStore {
    root: PathBuf,
    retries: u32,
    // Serializes read-modify-write cycles so an upsert is never interleaved.
    write_lock: Mutex<()>,
}

impl AnalysisIndexStore {
    pub fn new(root: impl Into<PathBuf>, retries: u32) -> Self {
        Self {
            root: root.into(),
            retries: retries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn index_path(&self, framework_id: i32, audit_id: i32) -> PathBuf {
        self.root
            .join(format!("framework_{framework_id}"))
            .join(format!("audit_{audit_id}"))
            .join("relevance_index.json")
    }

    /// Load the full index, or an empty one if the file does not exist. A
    /// corrupt file is logged and treated as empty; the cost is re-analysis,
    /// never data loss.
    pub async fn load(&self, framework_id: i32, audit_id: i32) -> AnalysisIndex {
        let path = self.index_path(framework_id, audit_id);
        match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<AnalysisIndex>(&raw) {
                Ok(index) => index,
                Err(e) => {
                    error!(
                        "audit {audit_id}: index file {} is unreadable ({e}); starting empty",
                        path.display()
                    );
                    AnalysisIndex::empty(framework_id, audit_id)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("audit {audit_id}: no index at {}; starting empty", path.display());
                AnalysisIndex::empty(framework_id, audit_id)
            }
            Err(e) => {
                error!(
                    "audit {audit_id}: failed reading index {} ({e}); starting empty",
                    path.display()
                );
                AnalysisIndex::empty(framework_id, audit_id)
            }
        }
    }

    pub async fn has(&self, framework_id: i32, audit_id: i32, identity: &EvidenceIdentity) -> bool {
        self.load(framework_id, audit_id).await.contains(identity)
    }

    /// Apply one verdict and persist the whole index, atomically with respect
    /// to concurrent readers (write to a temp file, then rename).
    pub async fn upsert(
        &self,
        index: &mut AnalysisIndex,
        identity: &EvidenceIdentity,
        legacy_ids: &BTreeSet<String>,
        analysis: RelevanceAnalysis,
    ) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        index.apply(identity, legacy_ids, analysis);
        index.last_updated = Some(Utc::now());
        self.write_file(index).await
    }

    /// Like `upsert` but with bounded retry/backoff on write failures.
    pub async fn upsert_with_retry(
        &self,
        index: &mut AnalysisIndex,
        identity: &EvidenceIdentity,
        legacy_ids: &BTreeSet<String>,
        analysis: RelevanceAnalysis,
    ) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        index.apply(identity, legacy_ids, analysis);
        index.last_updated = Some(Utc::now());

        let mut attempt = 0;
        let mut delay = Duration::from_millis(200);
        loop {
            match self.write_file(index).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.retries => {
                    attempt += 1;
                    warn!(
                        "audit {}: index persist failed (attempt {attempt}/{}): {e}; retrying",
                        index.audit_id, self.retries
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_file(&self, index: &AnalysisIndex) -> std::io::Result<()> {
        let path = self.index_path(index.framework_id, index.audit_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let payload = serde_json::to_vec_pretty(index)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await
    }
}
