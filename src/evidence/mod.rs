use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::store::{RelationalStore, StoreError};

/// Which operational table a record-evidence row came from. Projection into
/// `RecordEvidence.fields` happens at the store boundary, so nothing past this
/// enum branches on a table name beyond dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    Policies,
    Subpolicies,
    Compliances,
    AuditFindings,
    Incidents,
    Risks,
    Events,
}

impl SourceTable {
    pub const ALL: [SourceTable; 7] = [
        SourceTable::Policies,
        SourceTable::Subpolicies,
        SourceTable::Compliances,
        SourceTable::AuditFindings,
        SourceTable::Incidents,
        SourceTable::Risks,
        SourceTable::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTable::Policies => "policies",
            SourceTable::Subpolicies => "subpolicies",
            SourceTable::Compliances => "compliances",
            SourceTable::AuditFindings => "audit_findings",
            SourceTable::Incidents => "incidents",
            SourceTable::Risks => "risks",
            SourceTable::Events => "events",
        }
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Document,
    Record,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Document => "document",
            EvidenceKind::Record => "record",
        }
    }
}

/// Stable identity of one piece of evidence. Two candidates are the same
/// evidence iff their identities are equal; transient upload ids never count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceIdentity {
    Document { content_key: String },
    Record { table: SourceTable, record_id: i64 },
}

impl EvidenceIdentity {
    pub fn kind(&self) -> EvidenceKind {
        match self {
            EvidenceIdentity::Document { .. } => EvidenceKind::Document,
            EvidenceIdentity::Record { .. } => EvidenceKind::Record,
        }
    }

    /// Provenance string persisted on evidence records: the content key for
    /// documents, `table:record_id` for records.
    pub fn provenance(&self) -> String {
        match self {
            EvidenceIdentity::Document { content_key } => content_key.clone(),
            EvidenceIdentity::Record { table, record_id } => format!("{table}:{record_id}"),
        }
    }
}

impl fmt::Display for EvidenceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceIdentity::Document { content_key } => write!(f, "document {content_key}"),
            EvidenceIdentity::Record { table, record_id } => {
                write!(f, "record {table}:{record_id}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentEvidence {
    pub content_key: String,
    /// Earlier transient upload identifiers for the same physical file, kept
    /// only so old index entries stay reachable.
    pub legacy_ids: BTreeSet<String>,
    pub title: String,
    pub summary: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RecordEvidence {
    pub table: SourceTable,
    pub record_id: i64,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum EvidenceCandidate {
    Document(DocumentEvidence),
    Record(RecordEvidence),
}

impl EvidenceCandidate {
    pub fn identity(&self) -> EvidenceIdentity {
        match self {
            EvidenceCandidate::Document(d) => EvidenceIdentity::Document {
                content_key: d.content_key.clone(),
            },
            EvidenceCandidate::Record(r) => EvidenceIdentity::Record {
                table: r.table,
                record_id: r.record_id,
            },
        }
    }

    pub fn kind(&self) -> EvidenceKind {
        match self {
            EvidenceCandidate::Document(_) => EvidenceKind::Document,
            EvidenceCandidate::Record(_) => EvidenceKind::Record,
        }
    }

    pub fn legacy_ids(&self) -> BTreeSet<String> {
        match self {
            EvidenceCandidate::Document(d) => d.legacy_ids.clone(),
            EvidenceCandidate::Record(_) => BTreeSet::new(),
        }
    }
}

/// A document as reported by the object-storage collaborator. The engine never
/// touches raw file bytes; summary and metadata were extracted upstream.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub object_key: Option<String>,
    pub stored_name: Option<String>,
    /// Transient upload identifiers (one per upload session).
    pub upload_ids: Vec<String>,
    pub title: String,
    pub summary: String,
    pub metadata: BTreeMap<String, String>,
}

impl StoredDocument {
    /// The object key is the preferred stable identity; the stored name is the
    /// fallback. A document with neither cannot be tracked across uploads.
    pub fn into_evidence(self) -> Option<DocumentEvidence> {
        let content_key = self.object_key.or(self.stored_name)?;
        Some(DocumentEvidence {
            content_key,
            legacy_ids: self.upload_ids.into_iter().collect(),
            title: self.title,
            summary: self.summary,
            metadata: self.metadata,
        })
    }
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn documents(&self, framework_id: i32) -> Result<Vec<StoredDocument>, StoreError>;
}

/// Enumerate every evidence candidate for a framework: all completed document
/// uploads plus all projected rows from the operational tables.
pub async fn enumerate_candidates(
    store: &Arc<dyn RelationalStore>,
    documents: &Arc<dyn DocumentSource>,
    framework_id: i32,
) -> Result<Vec<EvidenceCandidate>, StoreError> {
    let mut candidates = Vec::new();

    for stored in documents.documents(framework_id).await? {
        let title = stored.title.clone();
        match stored.into_evidence() {
            Some(doc) => candidates.push(EvidenceCandidate::Document(doc)),
            None => warn!(
                "document '{title}' in framework {framework_id} has no content key; skipping"
            ),
        }
    }

    let records = store.record_evidence(framework_id).await?;
    debug!(
        "framework {framework_id}: enumerated {} documents, {} records",
        candidates.len(),
        records.len()
    );
    candidates.extend(records.into_iter().map(EvidenceCandidate::Record));
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_key_prefers_object_key() {
        let stored = StoredDocument {
            object_key: Some("uploads/a.pdf".into()),
            stored_name: Some("a.pdf".into()),
            upload_ids: vec!["17".into()],
            title: "A".into(),
            summary: String::new(),
            metadata: BTreeMap::new(),
        };
        let doc = stored.into_evidence().unwrap();
        assert_eq!(doc.content_key, "uploads/a.pdf");
        assert!(doc.legacy_ids.contains("17"));
    }

    #[test]
    fn content_key_falls_back_to_stored_name() {
        let stored = StoredDocument {
            object_key: None,
            stored_name: Some("a.pdf".into()),
            upload_ids: vec![],
            title: "A".into(),
            summary: String::new(),
            metadata: BTreeMap::new(),
        };
        assert_eq!(stored.into_evidence().unwrap().content_key, "a.pdf");
    }

    #[test]
    fn identity_provenance_forms() {
        let doc = EvidenceIdentity::Document {
            content_key: "uploads/a.pdf".into(),
        };
        assert_eq!(doc.provenance(), "uploads/a.pdf");
        let rec = EvidenceIdentity::Record {
            table: SourceTable::Incidents,
            record_id: 42,
        };
        assert_eq!(rec.provenance(), "incidents:42");
    }
}
