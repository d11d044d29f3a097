use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::context::{ComplianceRef, PolicyRef, SubpolicyRef};
use crate::evidence::{EvidenceKind, RecordEvidence};

pub mod postgres;
pub mod schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database pool error: {0}")]
    Pool(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("blocking task join error: {0}")]
    Join(String),
    #[error("row not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub audit_id: i32,
    pub framework_id: Option<i32>,
    pub policy_id: Option<i32>,
    pub subpolicy_id: Option<i32>,
    pub title: String,
    pub objective: Option<String>,
    pub scope: Option<String>,
    pub status: Option<String>,
}

/// The framework's full matchable universe, not just the audit's originally
/// assigned elements: an audit may be widened to any framework element.
#[derive(Debug, Clone)]
pub struct FrameworkElements {
    pub framework_id: i32,
    pub framework_name: String,
    pub policies: Vec<PolicyRef>,
    pub subpolicies: Vec<SubpolicyRef>,
    pub compliances: Vec<ComplianceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplianceMapping {
    pub compliance_id: i32,
    pub subpolicy_id: Option<i32>,
    pub policy_id: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct EvidenceRecordRow {
    pub id: i64,
    pub audit_id: i32,
    pub kind: EvidenceKind,
    pub provenance: String,
    pub policy_id: Option<i32>,
    pub subpolicy_id: Option<i32>,
    pub compliance_id: Option<i32>,
    pub status: String,
    pub analysis_snapshot: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewEvidenceRecord {
    pub audit_id: i32,
    pub kind: EvidenceKind,
    pub provenance: String,
    pub policy_id: Option<i32>,
    pub subpolicy_id: Option<i32>,
    pub compliance_id: Option<i32>,
    pub status: String,
    pub analysis_snapshot: Option<serde_json::Value>,
}

/// Backfill patch for an existing evidence record. `None` fields are left
/// untouched; a richer existing value is never downgraded.
#[derive(Debug, Clone, Default)]
pub struct EvidenceRecordPatch {
    pub policy_id: Option<i32>,
    pub subpolicy_id: Option<i32>,
    pub compliance_id: Option<i32>,
    pub analysis_snapshot: Option<serde_json::Value>,
}

impl EvidenceRecordPatch {
    pub fn is_empty(&self) -> bool {
        self.policy_id.is_none()
            && self.subpolicy_id.is_none()
            && self.compliance_id.is_none()
            && self.analysis_snapshot.is_none()
    }
}

/// Natural key of a checklist ledger row. Missing subpolicy/policy ids are
/// stored as zero so the key stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChecklistKey {
    pub compliance_id: i32,
    pub subpolicy_id: i32,
    pub policy_id: i32,
    pub framework_id: i32,
}

#[derive(Debug, Clone)]
pub struct ChecklistEntryRow {
    pub key: ChecklistKey,
    pub last_verified_at: DateTime<Utc>,
    pub complied: String,
    pub comment: Option<String>,
    pub observation_count: i32,
}

#[derive(Debug, Clone)]
pub struct NewChecklistEntry {
    pub key: ChecklistKey,
    pub last_verified_at: DateTime<Utc>,
    pub complied: String,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub struct ChecklistRefresh {
    pub last_verified_at: DateTime<Utc>,
    pub complied: String,
    pub comment: String,
}

/// Seam to the relational store. The engine reads audit/framework rows and the
/// operational tables, and writes evidence records and checklist entries;
/// everything else about the database belongs to the surrounding application.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn load_audit(&self, audit_id: i32) -> Result<Option<AuditRow>, StoreError>;

    /// All non-completed audits of a framework, newest first.
    async fn active_audits(&self, framework_id: i32) -> Result<Vec<AuditRow>, StoreError>;

    async fn framework_elements(&self, framework_id: i32)
        -> Result<FrameworkElements, StoreError>;

    /// Typed per-table projections of the operational rows, already flattened
    /// into `RecordEvidence`.
    async fn record_evidence(&self, framework_id: i32) -> Result<Vec<RecordEvidence>, StoreError>;

    async fn compliance_mapping(
        &self,
        compliance_id: i32,
    ) -> Result<Option<ComplianceMapping>, StoreError>;

    async fn subpolicy_policy(&self, subpolicy_id: i32) -> Result<Option<i32>, StoreError>;

    async fn find_evidence_record(
        &self,
        audit_id: i32,
        kind: EvidenceKind,
        provenance: &str,
    ) -> Result<Option<EvidenceRecordRow>, StoreError>;

    async fn insert_evidence_record(&self, record: NewEvidenceRecord) -> Result<i64, StoreError>;

    async fn update_evidence_record(
        &self,
        id: i64,
        patch: EvidenceRecordPatch,
    ) -> Result<(), StoreError>;

    async fn find_checklist_entry(
        &self,
        key: &ChecklistKey,
    ) -> Result<Option<ChecklistEntryRow>, StoreError>;

    async fn insert_checklist_entry(&self, entry: NewChecklistEntry) -> Result<(), StoreError>;

    /// Refresh an existing ledger row: new timestamp/comment and an
    /// incremented observation count.
    async fn refresh_checklist_entry(
        &self,
        key: &ChecklistKey,
        refresh: ChecklistRefresh,
    ) -> Result<(), StoreError>;
}
