use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use audit_correlator::analyzer::{ReasoningError, ReasoningProvider, ReasoningRequest};
use audit_correlator::config::CorrelatorConfig;
use audit_correlator::error::CorrelationError;
use audit_correlator::evidence::{
    DocumentSource, EvidenceKind, RecordEvidence, SourceTable, StoredDocument,
};
use audit_correlator::orchestrator::{
    CorrelationOrchestrator, EvidenceClassification, VerificationDispatcher, VerificationTask,
};
use audit_correlator::store::{
    AuditRow, ChecklistEntryRow, ChecklistKey, ChecklistRefresh, ComplianceMapping,
    EvidenceRecordPatch, EvidenceRecordRow, FrameworkElements, NewChecklistEntry,
    NewEvidenceRecord, RelationalStore, StoreError,
};
use audit_correlator::context::{ComplianceRef, PolicyRef, SubpolicyRef};

const AUDIT_ID: i32 = 426;
const FRAMEWORK_ID: i32 = 1;
const POLICY_ID: i32 = 10;
const SUBPOLICY_ID: i32 = 20;
const COMPLIANCE_ID: i32 = 30;

#[derive(Default)]
struct MockState {
    evidence_records: Vec<EvidenceRecordRow>,
    checklist: Vec<ChecklistEntryRow>,
}

struct MockStore {
    state: Mutex<MockState>,
    next_id: AtomicI64,
    records: Vec<RecordEvidence>,
}

impl MockStore {
    fn new(records: Vec<RecordEvidence>) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicI64::new(1),
            records,
        }
    }

    fn evidence_records(&self) -> Vec<EvidenceRecordRow> {
        self.state.lock().unwrap().evidence_records.clone()
    }

    fn checklist(&self) -> Vec<ChecklistEntryRow> {
        self.state.lock().unwrap().checklist.clone()
    }
}

#[async_trait]
impl RelationalStore for MockStore {
    async fn load_audit(&self, audit_id: i32) -> Result<Option<AuditRow>, StoreError> {
        if audit_id != AUDIT_ID {
            return Ok(None);
        }
        Ok(Some(AuditRow {
            audit_id: AUDIT_ID,
            framework_id: Some(FRAMEWORK_ID),
            policy_id: Some(POLICY_ID),
            subpolicy_id: None,
            title: "Access control review".into(),
            objective: Some("Verify access controls are enforced".into()),
            scope: Some("Production systems".into()),
            status: Some("In Progress".into()),
        }))
    }

    async fn active_audits(&self, _framework_id: i32) -> Result<Vec<AuditRow>, StoreError> {
        Ok(self.load_audit(AUDIT_ID).await?.into_iter().collect())
    }

    async fn framework_elements(
        &self,
        framework_id: i32,
    ) -> Result<FrameworkElements, StoreError> {
        Ok(FrameworkElements {
            framework_id,
            framework_name: "ISO 27001".into(),
            policies: vec![PolicyRef {
                id: POLICY_ID,
                name: "Access control".into(),
                description: "Controls over access".into(),
            }],
            subpolicies: vec![SubpolicyRef {
                id: SUBPOLICY_ID,
                policy_id: POLICY_ID,
                name: "Password management".into(),
                description: "Password rules".into(),
            }],
            compliances: vec![ComplianceRef {
                id: COMPLIANCE_ID,
                subpolicy_id: SUBPOLICY_ID,
                policy_id: Some(POLICY_ID),
                title: "Rotate credentials".into(),
                description: "Quarterly credential rotation".into(),
            }],
        })
    }

    async fn record_evidence(
        &self,
        _framework_id: i32,
    ) -> Result<Vec<RecordEvidence>, StoreError> {
        Ok(self.records.clone())
    }

    async fn compliance_mapping(
        &self,
        compliance_id: i32,
    ) -> Result<Option<ComplianceMapping>, StoreError> {
        if compliance_id != COMPLIANCE_ID {
            return Ok(None);
        }
        Ok(Some(ComplianceMapping {
            compliance_id: COMPLIANCE_ID,
            subpolicy_id: Some(SUBPOLICY_ID),
            policy_id: Some(POLICY_ID),
        }))
    }

    async fn subpolicy_policy(&self, subpolicy_id: i32) -> Result<Option<i32>, StoreError> {
        Ok((subpolicy_id == SUBPOLICY_ID).then_some(POLICY_ID))
    }

    async fn find_evidence_record(
        &self,
        audit_id: i32,
        kind: EvidenceKind,
        provenance: &str,
    ) -> Result<Option<EvidenceRecordRow>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .evidence_records
            .iter()
            .find(|r| r.audit_id == audit_id && r.kind == kind && r.provenance == provenance)
            .cloned())
    }

    async fn insert_evidence_record(
        &self,
        record: NewEvidenceRecord,
    ) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().evidence_records.push(EvidenceRecordRow {
            id,
            audit_id: record.audit_id,
            kind: record.kind,
            provenance: record.provenance,
            policy_id: record.policy_id,
            subpolicy_id: record.subpolicy_id,
            compliance_id: record.compliance_id,
            status: record.status,
            analysis_snapshot: record.analysis_snapshot,
        });
        Ok(id)
    }

    async fn update_evidence_record(
        &self,
        id: i64,
        patch: EvidenceRecordPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .evidence_records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("evidence record {id}")))?;
        if let Some(v) = patch.policy_id {
            row.policy_id = Some(v);
        }
        if let Some(v) = patch.subpolicy_id {
            row.subpolicy_id = Some(v);
        }
        if let Some(v) = patch.compliance_id {
            row.compliance_id = Some(v);
        }
        if let Some(v) = patch.analysis_snapshot {
            row.analysis_snapshot = Some(v);
        }
        Ok(())
    }

    async fn find_checklist_entry(
        &self,
        key: &ChecklistKey,
    ) -> Result<Option<ChecklistEntryRow>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checklist
            .iter()
            .find(|e| e.key == *key)
            .cloned())
    }

    async fn insert_checklist_entry(&self, entry: NewChecklistEntry) -> Result<(), StoreError> {
        self.state.lock().unwrap().checklist.push(ChecklistEntryRow {
            key: entry.key,
            last_verified_at: entry.last_verified_at,
            complied: entry.complied,
            comment: Some(entry.comment),
            observation_count: 1,
        });
        Ok(())
    }

    async fn refresh_checklist_entry(
        &self,
        key: &ChecklistKey,
        refresh: ChecklistRefresh,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .checklist
            .iter_mut()
            .find(|e| e.key == *key)
            .ok_or_else(|| StoreError::NotFound("checklist entry".into()))?;
        entry.last_verified_at = refresh.last_verified_at;
        entry.complied = refresh.complied;
        entry.comment = Some(refresh.comment);
        entry.observation_count += 1;
        Ok(())
    }
}

struct MockDocuments {
    documents: Vec<StoredDocument>,
}

#[async_trait]
impl DocumentSource for MockDocuments {
    async fn documents(&self, _framework_id: i32) -> Result<Vec<StoredDocument>, StoreError> {
        Ok(self.documents.clone())
    }
}

/// Replies selected by substring match against the rendered prompt, so each
/// candidate can get its own scripted verdict.
struct ScriptedReasoning {
    replies: Vec<(&'static str, String)>,
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoning {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ReasoningError> {
        for (needle, reply) in &self.replies {
            if request.prompt.contains(needle) {
                return Ok(reply.clone());
            }
        }
        Err(ReasoningError::EmptyReply)
    }
}

#[derive(Default)]
struct CollectingDispatcher {
    tasks: Mutex<Vec<VerificationTask>>,
}

#[async_trait]
impl VerificationDispatcher for CollectingDispatcher {
    async fn dispatch(&self, task: VerificationTask) -> Result<(), CorrelationError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

fn stored_document(title: &str, key: &str) -> StoredDocument {
    StoredDocument {
        object_key: Some(key.to_string()),
        stored_name: None,
        upload_ids: vec![],
        title: title.to_string(),
        summary: "Credential rotation procedures".to_string(),
        metadata: BTreeMap::new(),
    }
}

fn incident_record(id: i64, title: &str) -> RecordEvidence {
    RecordEvidence {
        table: SourceTable::Incidents,
        record_id: id,
        fields: [("title".to_string(), title.to_string())].into_iter().collect(),
    }
}

fn reply(score: f64) -> String {
    format!(
        r#"{{"relevance_score": {score}, "reason": "Matches rotation requirement.",
            "matched_compliances": [{COMPLIANCE_ID}]}}"#
    )
}

struct Harness {
    store: Arc<MockStore>,
    dispatcher: Arc<CollectingDispatcher>,
    orchestrator: CorrelationOrchestrator,
    _index_dir: tempfile::TempDir,
}

fn harness(
    documents: Vec<StoredDocument>,
    records: Vec<RecordEvidence>,
    replies: Vec<(&'static str, String)>,
) -> Harness {
    let index_dir = tempfile::tempdir().unwrap();
    let config = CorrelatorConfig {
        index_root: index_dir.path().to_path_buf(),
        ..CorrelatorConfig::default()
    };
    let store = Arc::new(MockStore::new(records));
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let orchestrator = CorrelationOrchestrator::new(
        store.clone(),
        Arc::new(MockDocuments { documents }),
        Arc::new(ScriptedReasoning { replies }),
        dispatcher.clone(),
        &config,
    );
    Harness {
        store,
        dispatcher,
        orchestrator,
        _index_dir: index_dir,
    }
}

#[tokio::test]
async fn combined_evidence_dispatches_best_record() {
    let h = harness(
        vec![stored_document("Password standard", "uploads/pw.pdf")],
        vec![incident_record(7, "Stale credentials incident")],
        vec![
            ("Password standard", reply(0.7)),
            ("Stale credentials incident", reply(0.75)),
        ],
    );

    let outcome = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.analyzed, 2);
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.overall_score, 0.75);
    assert_eq!(outcome.classification, EvidenceClassification::Combined);
    assert_eq!(outcome.records_created, 2);
    assert!(outcome.dispatched);

    let tasks = h.dispatcher.tasks.lock().unwrap().clone();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].relevance_score, 0.75);
    assert!(tasks[0].combined_evidence);
    assert_eq!(tasks[0].compliance_id, Some(COMPLIANCE_ID));
}

#[tokio::test]
async fn second_run_is_fully_cached() {
    let h = harness(
        vec![stored_document("Password standard", "uploads/pw.pdf")],
        vec![incident_record(7, "Stale credentials incident")],
        vec![
            ("Password standard", reply(0.7)),
            ("Stale credentials incident", reply(0.75)),
        ],
    );

    let first = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.analyzed, 2);

    let second = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.analyzed, 0);
    assert_eq!(second.cached, 2);
    // Re-synthesis finds the existing rows instead of duplicating them, and
    // rows that needed no backfill are not reported as updated.
    assert_eq!(h.store.evidence_records().len(), 2);
    assert_eq!(second.records_created, 0);
    assert_eq!(second.records_updated, 0);
}

#[tokio::test]
async fn unwritable_index_root_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    // A plain file where the index root should be makes every persist fail.
    let bogus_root = dir.path().join("not_a_directory");
    std::fs::write(&bogus_root, b"in the way").unwrap();

    let config = CorrelatorConfig {
        index_root: bogus_root,
        persistence_retries: 1,
        ..CorrelatorConfig::default()
    };
    let store = Arc::new(MockStore::new(vec![]));
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let orchestrator = CorrelationOrchestrator::new(
        store.clone(),
        Arc::new(MockDocuments {
            documents: vec![stored_document("Password standard", "uploads/pw.pdf")],
        }),
        Arc::new(ScriptedReasoning {
            replies: vec![("Password standard", reply(0.7))],
        }),
        dispatcher.clone(),
        &config,
    );

    let err = orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelationError::Persistence(_)));
    // A failed run leaves no evidence behind and dispatches nothing.
    assert!(store.evidence_records().is_empty());
    assert!(dispatcher.tasks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn score_below_evidence_threshold_creates_no_record() {
    let h = harness(
        vec![stored_document("Weak lead", "uploads/weak.pdf")],
        vec![],
        vec![("Weak lead", reply(0.59))],
    );

    let outcome = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.classification, EvidenceClassification::NoEvidence);
    assert!(h.store.evidence_records().is_empty());
    assert!(!outcome.dispatched);
}

#[tokio::test]
async fn score_at_evidence_threshold_creates_record() {
    let h = harness(
        vec![stored_document("Boundary doc", "uploads/b.pdf")],
        vec![],
        vec![("Boundary doc", reply(0.6))],
    );

    let outcome = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.records_created, 1);
    assert_eq!(outcome.classification, EvidenceClassification::DocumentOnly);
    let records = h.store.evidence_records();
    assert_eq!(records[0].status, "evidence_only");
    assert_eq!(records[0].compliance_id, Some(COMPLIANCE_ID));
    assert_eq!(records[0].policy_id, Some(POLICY_ID));
}

#[tokio::test]
async fn checklist_requires_strong_record_evidence() {
    let h = harness(
        vec![stored_document("Strong doc", "uploads/s.pdf")],
        vec![
            incident_record(7, "Strong incident"),
            incident_record(8, "Moderate incident"),
        ],
        vec![
            // Documents never touch the checklist, even at 0.95.
            ("Strong doc", reply(0.95)),
            ("Strong incident", reply(0.8)),
            ("Moderate incident", reply(0.79)),
        ],
    );

    let outcome = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.checklist_touched, 1);
    let checklist = h.store.checklist();
    assert_eq!(checklist.len(), 1);
    assert_eq!(checklist[0].key.compliance_id, COMPLIANCE_ID);
    assert_eq!(checklist[0].complied, "1");
    assert_eq!(checklist[0].observation_count, 1);
    let comment = checklist[0].comment.clone().unwrap();
    assert!(comment.starts_with("Auto evidence from incidents record 7:"));
}

#[tokio::test]
async fn repeated_strong_evidence_increments_observation_count() {
    let h = harness(
        vec![],
        vec![incident_record(7, "Strong incident")],
        vec![("Strong incident", reply(0.9))],
    );

    h.orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();
    // Second run re-applies the cached verdict to the checklist.
    h.orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    let checklist = h.store.checklist();
    assert_eq!(checklist.len(), 1);
    assert_eq!(checklist[0].observation_count, 2);
}

#[tokio::test]
async fn high_score_without_matched_compliances_is_ignored() {
    let h = harness(
        vec![stored_document("Vague doc", "uploads/v.pdf")],
        vec![],
        vec![(
            "Vague doc",
            r#"{"relevance_score": 0.9, "reason": "Looks relevant.",
                "matched_compliances": []}"#
                .to_string(),
        )],
    );

    let outcome = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert!(h.store.evidence_records().is_empty());
    assert!(!outcome.dispatched);
    // The verdict itself is still cached.
    assert_eq!(outcome.analyzed, 1);
}

#[tokio::test]
async fn hallucinated_ids_are_filtered_before_mapping() {
    let h = harness(
        vec![stored_document("Hallucinating doc", "uploads/h.pdf")],
        vec![],
        vec![(
            "Hallucinating doc",
            format!(
                r#"{{"relevance_score": 0.7, "reason": "ok",
                    "matched_compliances": [999, {COMPLIANCE_ID}]}}"#
            ),
        )],
    );

    h.orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();

    let records = h.store.evidence_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].compliance_id, Some(COMPLIANCE_ID));
}

#[tokio::test]
async fn failed_analysis_is_retried_next_run() {
    let h = harness(
        vec![stored_document("Unscripted doc", "uploads/u.pdf")],
        vec![],
        vec![],
    );

    let outcome = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.analyzed, 0);

    // Nothing was cached, so the candidate is still pending next run.
    let again = h
        .orchestrator
        .run_audit(AUDIT_ID, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.cached, 0);
    assert_eq!(again.failed, 1);
}

#[tokio::test]
async fn cancelled_run_starts_nothing_and_dispatches_nothing() {
    let h = harness(
        vec![stored_document("Password standard", "uploads/pw.pdf")],
        vec![],
        vec![("Password standard", reply(0.9))],
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = h.orchestrator.run_audit(AUDIT_ID, &cancel).await.unwrap();

    assert_eq!(outcome.analyzed, 0);
    assert!(!outcome.dispatched);
    assert!(h.dispatcher.tasks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_audit_is_a_context_error() {
    let h = harness(vec![], vec![], vec![]);
    let err = h
        .orchestrator
        .run_audit(999, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CorrelationError::ContextNotFound(999)));
}

#[tokio::test]
async fn framework_sweep_covers_active_audits() {
    let h = harness(
        vec![stored_document("Password standard", "uploads/pw.pdf")],
        vec![],
        vec![("Password standard", reply(0.7))],
    );

    let outcomes = h
        .orchestrator
        .run_framework(FRAMEWORK_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].audit_id, AUDIT_ID);
    assert_eq!(outcomes[0].records_created, 1);
}
