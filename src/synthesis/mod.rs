use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;

use crate::context::AuditContext;
use crate::error::CorrelationError;
use crate::evidence::{EvidenceIdentity, SourceTable};
use crate::index::{AnalysisIndex, RelevanceAnalysis};
use crate::store::{
    ComplianceMapping, EvidenceRecordPatch, NewEvidenceRecord, RelationalStore,
};

pub mod checklist;

pub use checklist::ChecklistUpdater;

/// Framework mapping an evidence record is pinned to. Compliance-level when a
/// matched compliance resolved, coarser when only subpolicy/policy ids did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub compliance_id: Option<i32>,
    pub subpolicy_id: Option<i32>,
    pub policy_id: Option<i32>,
}

/// One evidence record produced (or refreshed) by a synthesis pass, with
/// enough context for checklist updates and verification dispatch.
#[derive(Debug, Clone)]
pub struct SynthesizedEvidence {
    pub record_id: i64,
    pub identity: EvidenceIdentity,
    pub mapping: ResolvedMapping,
    pub analysis: RelevanceAnalysis,
    pub created: bool,
    /// True when an existing row received a non-empty backfill patch. A
    /// fully-populated existing row passes through untouched.
    pub updated: bool,
}

pub const EVIDENCE_ONLY: &str = "evidence_only";

/// Turns qualifying index entries into persistent evidence records. Purely a
/// projection of the index: running it twice over the same index is a no-op
/// apart from backfilling fields that were missing on existing rows.
pub struct EvidenceSynthesizer {
    store: Arc<dyn RelationalStore>,
    evidence_threshold: f64,
}

impl EvidenceSynthesizer {
    pub fn new(store: Arc<dyn RelationalStore>, evidence_threshold: f64) -> Self {
        Self {
            store,
            evidence_threshold,
        }
    }

    pub async fn synthesize(
        &self,
        context: &AuditContext,
        index: &AnalysisIndex,
    ) -> Result<Vec<SynthesizedEvidence>, CorrelationError> {
        let mut out = Vec::new();

        for entry in index.documents.values() {
            let identity = EvidenceIdentity::Document {
                content_key: entry.content_key.clone(),
            };
            if let Some(synthesized) = self
                .synthesize_one(context, &identity, &entry.analysis, None)
                .await?
            {
                out.push(synthesized);
            }
        }

        for entry in index.records.values() {
            let identity = EvidenceIdentity::Record {
                table: entry.table,
                record_id: entry.record_id,
            };
            // A compliances row is evidence about itself; its own id leads.
            let preferred = (entry.table == SourceTable::Compliances)
                .then(|| i32::try_from(entry.record_id).ok())
                .flatten();
            if let Some(synthesized) = self
                .synthesize_one(context, &identity, &entry.analysis, preferred)
                .await?
            {
                out.push(synthesized);
            }
        }

        info!(
            "audit {}: synthesis produced {} evidence records ({} new)",
            context.audit_id,
            out.len(),
            out.iter().filter(|s| s.created).count()
        );
        Ok(out)
    }

    async fn synthesize_one(
        &self,
        context: &AuditContext,
        identity: &EvidenceIdentity,
        analysis: &RelevanceAnalysis,
        preferred_compliance: Option<i32>,
    ) -> Result<Option<SynthesizedEvidence>, CorrelationError> {
        if analysis.score < self.evidence_threshold {
            return Ok(None);
        }
        // High score with nothing matched is noise, not evidence.
        if analysis.matched_compliance_ids.is_empty() && preferred_compliance.is_none() {
            debug!(
                "audit {}: {identity} scored {:.2} but matched no compliance; skipping",
                context.audit_id, analysis.score
            );
            return Ok(None);
        }

        let Some(mapping) = self
            .resolve_mapping(context, analysis, preferred_compliance)
            .await?
        else {
            warn!(
                "audit {}: {}",
                context.audit_id,
                CorrelationError::MappingUnresolved {
                    compliance_id: analysis
                        .matched_compliance_ids
                        .iter()
                        .next()
                        .copied()
                        .or(preferred_compliance)
                        .unwrap_or_default(),
                }
            );
            return Ok(None);
        };

        let kind = identity.kind();
        let provenance = identity.provenance();
        let snapshot = self.snapshot(identity, &mapping, analysis);

        let existing = self
            .store
            .find_evidence_record(context.audit_id, kind, &provenance)
            .await?;

        match existing {
            Some(row) => {
                let patch = EvidenceRecordPatch {
                    policy_id: row.policy_id.is_none().then_some(mapping.policy_id).flatten(),
                    subpolicy_id: row
                        .subpolicy_id
                        .is_none()
                        .then_some(mapping.subpolicy_id)
                        .flatten(),
                    compliance_id: row
                        .compliance_id
                        .is_none()
                        .then_some(mapping.compliance_id)
                        .flatten(),
                    analysis_snapshot: row
                        .analysis_snapshot
                        .is_none()
                        .then_some(snapshot),
                };
                let backfilled = !patch.is_empty();
                if backfilled {
                    self.store.update_evidence_record(row.id, patch).await?;
                    debug!(
                        "audit {}: backfilled evidence record {} for {identity}",
                        context.audit_id, row.id
                    );
                }
                Ok(Some(SynthesizedEvidence {
                    record_id: row.id,
                    identity: identity.clone(),
                    mapping,
                    analysis: analysis.clone(),
                    created: false,
                    updated: backfilled,
                }))
            }
            None => {
                let id = self
                    .store
                    .insert_evidence_record(NewEvidenceRecord {
                        audit_id: context.audit_id,
                        kind,
                        provenance,
                        policy_id: mapping.policy_id,
                        subpolicy_id: mapping.subpolicy_id,
                        compliance_id: mapping.compliance_id,
                        status: EVIDENCE_ONLY.to_string(),
                        analysis_snapshot: Some(snapshot),
                    })
                    .await?;
                debug!(
                    "audit {}: created evidence record {id} for {identity} (score {:.2})",
                    context.audit_id, analysis.score
                );
                Ok(Some(SynthesizedEvidence {
                    record_id: id,
                    identity: identity.clone(),
                    mapping,
                    analysis: analysis.clone(),
                    created: true,
                    updated: false,
                }))
            }
        }
    }

    /// Resolve matched ids to a `(policy, subpolicy, compliance)` triple.
    /// Compliance ids are tried in ascending order (preferred id first);
    /// subpolicy-only and policy-only fallbacks apply only when no matched
    /// compliance id resolves to a live row.
    async fn resolve_mapping(
        &self,
        context: &AuditContext,
        analysis: &RelevanceAnalysis,
        preferred_compliance: Option<i32>,
    ) -> Result<Option<ResolvedMapping>, CorrelationError> {
        let candidates = preferred_compliance
            .into_iter()
            .chain(analysis.matched_compliance_ids.iter().copied());
        for compliance_id in candidates {
            if let Some(mapping) = self.store.compliance_mapping(compliance_id).await? {
                return Ok(Some(self.complete_mapping(mapping).await?));
            }
            warn!(
                "audit {}: matched compliance {compliance_id} has no row; trying next",
                context.audit_id
            );
        }

        if let Some(&subpolicy_id) = analysis.matched_subpolicy_ids.iter().next() {
            let policy_id = self.store.subpolicy_policy(subpolicy_id).await?;
            return Ok(Some(ResolvedMapping {
                compliance_id: None,
                subpolicy_id: Some(subpolicy_id),
                policy_id,
            }));
        }

        if let Some(&policy_id) = analysis.matched_policy_ids.iter().next() {
            return Ok(Some(ResolvedMapping {
                compliance_id: None,
                subpolicy_id: None,
                policy_id: Some(policy_id),
            }));
        }

        Ok(None)
    }

    async fn complete_mapping(
        &self,
        mapping: ComplianceMapping,
    ) -> Result<ResolvedMapping, CorrelationError> {
        let policy_id = match (mapping.policy_id, mapping.subpolicy_id) {
            (Some(pid), _) => Some(pid),
            (None, Some(sid)) => self.store.subpolicy_policy(sid).await?,
            (None, None) => None,
        };
        Ok(ResolvedMapping {
            compliance_id: Some(mapping.compliance_id),
            subpolicy_id: mapping.subpolicy_id,
            policy_id,
        })
    }

    fn snapshot(
        &self,
        identity: &EvidenceIdentity,
        mapping: &ResolvedMapping,
        analysis: &RelevanceAnalysis,
    ) -> serde_json::Value {
        let mut snapshot = json!({
            "source": identity.kind().as_str(),
            "compliance_id": mapping.compliance_id,
            "relevance_score": analysis.score,
            "relevance_reason": analysis.reason,
            "status": EVIDENCE_ONLY,
        });
        match identity {
            EvidenceIdentity::Document { content_key } => {
                snapshot["content_key"] = json!(content_key);
            }
            EvidenceIdentity::Record { table, record_id } => {
                snapshot["table"] = json!(table.as_str());
                snapshot["record_id"] = json!(record_id);
            }
        }
        snapshot
    }
}
