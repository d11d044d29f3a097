use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;

use crate::analyzer::prompt::truncate;
use crate::context::AuditContext;
use crate::error::CorrelationError;
use crate::evidence::EvidenceIdentity;
use crate::store::{ChecklistKey, ChecklistRefresh, NewChecklistEntry, RelationalStore};
use crate::synthesis::SynthesizedEvidence;

/// Conservative compliance value written by automation. Full compliance is a
/// human decision; automated evidence only ever asserts partial.
pub const PARTIAL_COMPLIANCE: &str = "1";

const REASON_CAP: usize = 500;

/// Reflects strong record evidence into the audit's compliance checklist
/// ledger. Documents never touch the checklist, whatever their score.
pub struct ChecklistUpdater {
    store: Arc<dyn RelationalStore>,
    checklist_threshold: f64,
}

impl ChecklistUpdater {
    pub fn new(store: Arc<dyn RelationalStore>, checklist_threshold: f64) -> Self {
        Self {
            store,
            checklist_threshold,
        }
    }

    /// Apply qualifying record evidence to the checklist. Returns the number
    /// of ledger rows touched.
    pub async fn apply(
        &self,
        context: &AuditContext,
        evidence: &[SynthesizedEvidence],
    ) -> Result<usize, CorrelationError> {
        let mut touched = 0;
        for item in evidence {
            let EvidenceIdentity::Record { table, record_id } = &item.identity else {
                continue;
            };
            if item.analysis.score < self.checklist_threshold {
                continue;
            }
            let Some(compliance_id) = item.mapping.compliance_id else {
                debug!(
                    "audit {}: record {table}:{record_id} cleared {:.2} but has no \
                     compliance mapping; checklist untouched",
                    context.audit_id, self.checklist_threshold
                );
                continue;
            };

            let key = ChecklistKey {
                compliance_id,
                subpolicy_id: item.mapping.subpolicy_id.unwrap_or(0),
                policy_id: item.mapping.policy_id.unwrap_or(0),
                framework_id: context.framework_id,
            };
            let comment = format!(
                "Auto evidence from {table} record {record_id}: {}",
                truncate(&item.analysis.reason, REASON_CAP)
            );
            let now = Utc::now();

            match self.store.find_checklist_entry(&key).await? {
                Some(_) => {
                    self.store
                        .refresh_checklist_entry(
                            &key,
                            ChecklistRefresh {
                                last_verified_at: now,
                                complied: PARTIAL_COMPLIANCE.to_string(),
                                comment,
                            },
                        )
                        .await?;
                }
                None => {
                    self.store
                        .insert_checklist_entry(NewChecklistEntry {
                            key,
                            last_verified_at: now,
                            complied: PARTIAL_COMPLIANCE.to_string(),
                            comment,
                        })
                        .await?;
                }
            }
            touched += 1;
        }

        if touched > 0 {
            info!(
                "audit {}: checklist updated for {touched} compliance(s)",
                context.audit_id
            );
        }
        Ok(touched)
    }
}
