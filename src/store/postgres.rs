use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use log::info;
use std::collections::BTreeMap;

use super::schema::{
    audit_findings, audits, checklist_entries, compliances, events, evidence_records, frameworks,
    incidents, policies, risks, subpolicies, uploaded_documents,
};
use super::{
    AuditRow, ChecklistEntryRow, ChecklistKey, ChecklistRefresh, ComplianceMapping,
    EvidenceRecordPatch, EvidenceRecordRow, FrameworkElements, NewChecklistEntry,
    NewEvidenceRecord, RelationalStore, StoreError,
};
use crate::context::{ComplianceRef, PolicyRef, SubpolicyRef};
use crate::evidence::{
    DocumentSource, EvidenceKind, RecordEvidence, SourceTable, StoredDocument,
};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

const UPLOAD_COMPLETED: &str = "completed";

#[derive(Debug, Clone, Queryable)]
struct DbAudit {
    id: i32,
    framework_id: Option<i32>,
    policy_id: Option<i32>,
    subpolicy_id: Option<i32>,
    title: String,
    objective: Option<String>,
    scope: Option<String>,
    status: Option<String>,
}

impl From<DbAudit> for AuditRow {
    fn from(db: DbAudit) -> Self {
        AuditRow {
            audit_id: db.id,
            framework_id: db.framework_id,
            policy_id: db.policy_id,
            subpolicy_id: db.subpolicy_id,
            title: db.title,
            objective: db.objective,
            scope: db.scope,
            status: db.status,
        }
    }
}

#[derive(Debug, Clone, Queryable)]
struct DbEvidenceRecord {
    id: i64,
    audit_id: i32,
    kind: String,
    provenance: String,
    policy_id: Option<i32>,
    subpolicy_id: Option<i32>,
    compliance_id: Option<i32>,
    status: String,
    analysis_snapshot: Option<serde_json::Value>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    #[allow(dead_code)]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = evidence_records)]
struct NewDbEvidenceRecord {
    audit_id: i32,
    kind: String,
    provenance: String,
    policy_id: Option<i32>,
    subpolicy_id: Option<i32>,
    compliance_id: Option<i32>,
    status: String,
    analysis_snapshot: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = evidence_records)]
struct EvidenceRecordChangeset {
    policy_id: Option<i32>,
    subpolicy_id: Option<i32>,
    compliance_id: Option<i32>,
    analysis_snapshot: Option<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
struct DbChecklistEntry {
    #[allow(dead_code)]
    id: i64,
    compliance_id: i32,
    subpolicy_id: i32,
    policy_id: i32,
    framework_id: i32,
    last_verified_at: DateTime<Utc>,
    complied: String,
    comment: Option<String>,
    observation_count: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = checklist_entries)]
struct NewDbChecklistEntry {
    compliance_id: i32,
    subpolicy_id: i32,
    policy_id: i32,
    framework_id: i32,
    last_verified_at: DateTime<Utc>,
    complied: String,
    comment: String,
    observation_count: i32,
}

#[derive(Debug, Clone, Queryable)]
struct DbUploadedDocument {
    #[allow(dead_code)]
    id: i64,
    #[allow(dead_code)]
    framework_id: i32,
    object_key: Option<String>,
    stored_name: Option<String>,
    upload_ids: Vec<String>,
    title: String,
    summary: Option<String>,
    metadata: Option<serde_json::Value>,
    #[allow(dead_code)]
    upload_status: String,
}

fn kind_from_str(raw: &str) -> Option<EvidenceKind> {
    match raw {
        "document" => Some(EvidenceKind::Document),
        "record" => Some(EvidenceKind::Record),
        _ => None,
    }
}

fn json_to_fields(value: Option<serde_json::Value>) -> BTreeMap<String, String> {
    let Some(serde_json::Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.into_iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect()
}

fn field(map: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    if let Some(v) = value {
        if !v.is_empty() {
            map.insert(key.to_string(), v);
        }
    }
}

/// Diesel-backed store. Every call clones the pool and runs the query on the
/// blocking pool; connections are returned when the closure ends.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        info!("connected to relational store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn framework_policy_ids(conn: &mut PgConnection, framework_id: i32) -> QueryResult<Vec<i32>> {
    policies::table
        .filter(policies::framework_id.eq(framework_id))
        .select(policies::id)
        .load(conn)
}

fn framework_subpolicy_ids(conn: &mut PgConnection, policy_ids: &[i32]) -> QueryResult<Vec<i32>> {
    subpolicies::table
        .filter(subpolicies::policy_id.eq_any(policy_ids.to_vec()))
        .select(subpolicies::id)
        .load(conn)
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn load_audit(&self, audit_id: i32) -> Result<Option<AuditRow>, StoreError> {
        self.with_conn(move |conn| {
            let row = audits::table
                .find(audit_id)
                .first::<DbAudit>(conn)
                .optional()?;
            Ok(row.map(AuditRow::from))
        })
        .await
    }

    async fn active_audits(&self, framework_id: i32) -> Result<Vec<AuditRow>, StoreError> {
        self.with_conn(move |conn| {
            let rows = audits::table
                .filter(audits::framework_id.eq(framework_id))
                .filter(audits::status.is_null().or(audits::status.ne("Completed")))
                .order(audits::id.desc())
                .load::<DbAudit>(conn)?;
            Ok(rows.into_iter().map(AuditRow::from).collect())
        })
        .await
    }

    async fn framework_elements(
        &self,
        framework_id: i32,
    ) -> Result<FrameworkElements, StoreError> {
        self.with_conn(move |conn| {
            let framework_name = frameworks::table
                .find(framework_id)
                .select(frameworks::name)
                .first::<String>(conn)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("framework {framework_id}")))?;

            let policy_rows = policies::table
                .filter(policies::framework_id.eq(framework_id))
                .select((policies::id, policies::name, policies::description))
                .load::<(i32, String, String)>(conn)?;
            let policy_ids: Vec<i32> = policy_rows.iter().map(|(id, _, _)| *id).collect();

            let subpolicy_rows = subpolicies::table
                .filter(subpolicies::policy_id.eq_any(policy_ids.clone()))
                .select((
                    subpolicies::id,
                    subpolicies::policy_id,
                    subpolicies::name,
                    subpolicies::description,
                ))
                .load::<(i32, i32, String, String)>(conn)?;
            let subpolicy_ids: Vec<i32> = subpolicy_rows.iter().map(|(id, ..)| *id).collect();

            let compliance_rows = compliances::table
                .filter(compliances::subpolicy_id.eq_any(subpolicy_ids))
                .select((
                    compliances::id,
                    compliances::subpolicy_id,
                    compliances::policy_id,
                    compliances::title,
                    compliances::description,
                ))
                .load::<(i32, i32, Option<i32>, String, String)>(conn)?;

            Ok(FrameworkElements {
                framework_id,
                framework_name,
                policies: policy_rows
                    .into_iter()
                    .map(|(id, name, description)| PolicyRef {
                        id,
                        name,
                        description,
                    })
                    .collect(),
                subpolicies: subpolicy_rows
                    .into_iter()
                    .map(|(id, policy_id, name, description)| SubpolicyRef {
                        id,
                        policy_id,
                        name,
                        description,
                    })
                    .collect(),
                compliances: compliance_rows
                    .into_iter()
                    .map(|(id, subpolicy_id, policy_id, title, description)| ComplianceRef {
                        id,
                        subpolicy_id,
                        policy_id,
                        title,
                        description,
                    })
                    .collect(),
            })
        })
        .await
    }

    async fn record_evidence(
        &self,
        framework_id: i32,
    ) -> Result<Vec<RecordEvidence>, StoreError> {
        self.with_conn(move |conn| {
            let mut out = Vec::new();

            let policy_ids = framework_policy_ids(conn, framework_id)?;
            let subpolicy_ids = framework_subpolicy_ids(conn, &policy_ids)?;

            for (id, name, description, status) in policies::table
                .filter(policies::id.eq_any(policy_ids.clone()))
                .select((
                    policies::id,
                    policies::name,
                    policies::description,
                    policies::status,
                ))
                .load::<(i32, String, String, Option<String>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "name", Some(name));
                field(&mut fields, "description", Some(description));
                field(&mut fields, "status", status);
                out.push(RecordEvidence {
                    table: SourceTable::Policies,
                    record_id: i64::from(id),
                    fields,
                });
            }

            for (id, name, description, status) in subpolicies::table
                .filter(subpolicies::id.eq_any(subpolicy_ids.clone()))
                .select((
                    subpolicies::id,
                    subpolicies::name,
                    subpolicies::description,
                    subpolicies::status,
                ))
                .load::<(i32, String, String, Option<String>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "name", Some(name));
                field(&mut fields, "description", Some(description));
                field(&mut fields, "status", status);
                out.push(RecordEvidence {
                    table: SourceTable::Subpolicies,
                    record_id: i64::from(id),
                    fields,
                });
            }

            for (id, title, description, status) in compliances::table
                .filter(compliances::subpolicy_id.eq_any(subpolicy_ids))
                .select((
                    compliances::id,
                    compliances::title,
                    compliances::description,
                    compliances::status,
                ))
                .load::<(i32, String, String, Option<String>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "title", Some(title));
                field(&mut fields, "description", Some(description));
                field(&mut fields, "status", status);
                out.push(RecordEvidence {
                    table: SourceTable::Compliances,
                    record_id: i64::from(id),
                    fields,
                });
            }

            let audit_ids: Vec<i32> = audits::table
                .filter(audits::framework_id.eq(framework_id))
                .select(audits::id)
                .load(conn)?;
            for (id, audit_id, compliance_id, check_status, comment) in audit_findings::table
                .filter(audit_findings::audit_id.eq_any(audit_ids))
                .select((
                    audit_findings::id,
                    audit_findings::audit_id,
                    audit_findings::compliance_id,
                    audit_findings::check_status,
                    audit_findings::comment,
                ))
                .load::<(i64, i32, Option<i32>, Option<String>, Option<String>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "audit_id", Some(audit_id.to_string()));
                field(
                    &mut fields,
                    "compliance_id",
                    compliance_id.map(|v| v.to_string()),
                );
                field(&mut fields, "check_status", check_status);
                field(&mut fields, "comment", comment);
                out.push(RecordEvidence {
                    table: SourceTable::AuditFindings,
                    record_id: id,
                    fields,
                });
            }

            // Incidents, risks, and events are organization-wide, not
            // framework-scoped.
            for (id, title, description, status) in incidents::table
                .select((
                    incidents::id,
                    incidents::title,
                    incidents::description,
                    incidents::status,
                ))
                .load::<(i64, String, Option<String>, Option<String>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "title", Some(title));
                field(&mut fields, "description", description);
                field(&mut fields, "status", status);
                out.push(RecordEvidence {
                    table: SourceTable::Incidents,
                    record_id: id,
                    fields,
                });
            }

            for (id, title, description, category, status) in risks::table
                .select((
                    risks::id,
                    risks::title,
                    risks::description,
                    risks::category,
                    risks::status,
                ))
                .load::<(i64, String, Option<String>, Option<String>, Option<String>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "title", Some(title));
                field(&mut fields, "description", description);
                field(&mut fields, "category", category);
                field(&mut fields, "status", status);
                out.push(RecordEvidence {
                    table: SourceTable::Risks,
                    record_id: id,
                    fields,
                });
            }

            for (id, title, description, occurred_at) in events::table
                .select((
                    events::id,
                    events::title,
                    events::description,
                    events::occurred_at,
                ))
                .load::<(i64, String, Option<String>, DateTime<Utc>)>(conn)?
            {
                let mut fields = BTreeMap::new();
                field(&mut fields, "title", Some(title));
                field(&mut fields, "description", description);
                field(&mut fields, "occurred_at", Some(occurred_at.to_rfc3339()));
                out.push(RecordEvidence {
                    table: SourceTable::Events,
                    record_id: id,
                    fields,
                });
            }

            Ok(out)
        })
        .await
    }

    async fn compliance_mapping(
        &self,
        compliance_id: i32,
    ) -> Result<Option<ComplianceMapping>, StoreError> {
        self.with_conn(move |conn| {
            let row = compliances::table
                .find(compliance_id)
                .select((compliances::id, compliances::subpolicy_id, compliances::policy_id))
                .first::<(i32, i32, Option<i32>)>(conn)
                .optional()?;
            Ok(row.map(|(id, subpolicy_id, policy_id)| ComplianceMapping {
                compliance_id: id,
                subpolicy_id: Some(subpolicy_id),
                policy_id,
            }))
        })
        .await
    }

    async fn subpolicy_policy(&self, subpolicy_id: i32) -> Result<Option<i32>, StoreError> {
        self.with_conn(move |conn| {
            Ok(subpolicies::table
                .find(subpolicy_id)
                .select(subpolicies::policy_id)
                .first::<i32>(conn)
                .optional()?)
        })
        .await
    }

    async fn find_evidence_record(
        &self,
        audit_id: i32,
        kind: EvidenceKind,
        provenance: &str,
    ) -> Result<Option<EvidenceRecordRow>, StoreError> {
        let provenance = provenance.to_string();
        self.with_conn(move |conn| {
            let row = evidence_records::table
                .filter(evidence_records::audit_id.eq(audit_id))
                .filter(evidence_records::kind.eq(kind.as_str()))
                .filter(evidence_records::provenance.eq(&provenance))
                .first::<DbEvidenceRecord>(conn)
                .optional()?;
            Ok(row.and_then(|db| {
                let kind = kind_from_str(&db.kind)?;
                Some(EvidenceRecordRow {
                    id: db.id,
                    audit_id: db.audit_id,
                    kind,
                    provenance: db.provenance,
                    policy_id: db.policy_id,
                    subpolicy_id: db.subpolicy_id,
                    compliance_id: db.compliance_id,
                    status: db.status,
                    analysis_snapshot: db.analysis_snapshot,
                })
            }))
        })
        .await
    }

    async fn insert_evidence_record(
        &self,
        record: NewEvidenceRecord,
    ) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            let id = diesel::insert_into(evidence_records::table)
                .values(NewDbEvidenceRecord {
                    audit_id: record.audit_id,
                    kind: record.kind.as_str().to_string(),
                    provenance: record.provenance,
                    policy_id: record.policy_id,
                    subpolicy_id: record.subpolicy_id,
                    compliance_id: record.compliance_id,
                    status: record.status,
                    analysis_snapshot: record.analysis_snapshot,
                    created_at: now,
                    updated_at: now,
                })
                .returning(evidence_records::id)
                .get_result::<i64>(conn)?;
            Ok(id)
        })
        .await
    }

    async fn update_evidence_record(
        &self,
        id: i64,
        patch: EvidenceRecordPatch,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            diesel::update(evidence_records::table.find(id))
                .set(EvidenceRecordChangeset {
                    policy_id: patch.policy_id,
                    subpolicy_id: patch.subpolicy_id,
                    compliance_id: patch.compliance_id,
                    analysis_snapshot: patch.analysis_snapshot,
                    updated_at: Utc::now(),
                })
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn find_checklist_entry(
        &self,
        key: &ChecklistKey,
    ) -> Result<Option<ChecklistEntryRow>, StoreError> {
        let key = *key;
        self.with_conn(move |conn| {
            let row = checklist_entries::table
                .filter(checklist_entries::compliance_id.eq(key.compliance_id))
                .filter(checklist_entries::subpolicy_id.eq(key.subpolicy_id))
                .filter(checklist_entries::policy_id.eq(key.policy_id))
                .filter(checklist_entries::framework_id.eq(key.framework_id))
                .first::<DbChecklistEntry>(conn)
                .optional()?;
            Ok(row.map(|db| ChecklistEntryRow {
                key: ChecklistKey {
                    compliance_id: db.compliance_id,
                    subpolicy_id: db.subpolicy_id,
                    policy_id: db.policy_id,
                    framework_id: db.framework_id,
                },
                last_verified_at: db.last_verified_at,
                complied: db.complied,
                comment: db.comment,
                observation_count: db.observation_count,
            }))
        })
        .await
    }

    async fn insert_checklist_entry(&self, entry: NewChecklistEntry) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            diesel::insert_into(checklist_entries::table)
                .values(NewDbChecklistEntry {
                    compliance_id: entry.key.compliance_id,
                    subpolicy_id: entry.key.subpolicy_id,
                    policy_id: entry.key.policy_id,
                    framework_id: entry.key.framework_id,
                    last_verified_at: entry.last_verified_at,
                    complied: entry.complied,
                    comment: entry.comment,
                    observation_count: 1,
                })
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn refresh_checklist_entry(
        &self,
        key: &ChecklistKey,
        refresh: ChecklistRefresh,
    ) -> Result<(), StoreError> {
        let key = *key;
        self.with_conn(move |conn| {
            diesel::update(
                checklist_entries::table
                    .filter(checklist_entries::compliance_id.eq(key.compliance_id))
                    .filter(checklist_entries::subpolicy_id.eq(key.subpolicy_id))
                    .filter(checklist_entries::policy_id.eq(key.policy_id))
                    .filter(checklist_entries::framework_id.eq(key.framework_id)),
            )
            .set((
                checklist_entries::last_verified_at.eq(refresh.last_verified_at),
                checklist_entries::complied.eq(refresh.complied),
                checklist_entries::comment.eq(refresh.comment),
                checklist_entries::observation_count
                    .eq(checklist_entries::observation_count + 1),
            ))
            .execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DocumentSource for PgStore {
    async fn documents(&self, framework_id: i32) -> Result<Vec<StoredDocument>, StoreError> {
        self.with_conn(move |conn| {
            let rows = uploaded_documents::table
                .filter(uploaded_documents::framework_id.eq(framework_id))
                .filter(uploaded_documents::upload_status.eq(UPLOAD_COMPLETED))
                .load::<DbUploadedDocument>(conn)?;
            Ok(rows
                .into_iter()
                .map(|db| StoredDocument {
                    object_key: db.object_key,
                    stored_name: db.stored_name,
                    upload_ids: db.upload_ids,
                    title: db.title,
                    summary: db.summary.unwrap_or_default(),
                    metadata: json_to_fields(db.metadata),
                })
                .collect())
        })
        .await
    }
}
