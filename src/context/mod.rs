use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::CorrelationError;
use crate::store::{AuditRow, FrameworkElements, RelationalStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRef {
    pub id: i32,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubpolicyRef {
    pub id: i32,
    pub policy_id: i32,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRef {
    pub id: i32,
    pub subpolicy_id: i32,
    pub policy_id: Option<i32>,
    pub title: String,
    pub description: String,
}

/// Immutable snapshot of an audit's purpose plus the framework's full
/// matchable universe. Built once per correlation run; every id referenced
/// downstream must come from this context's sets.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub audit_id: i32,
    pub framework_id: i32,
    pub title: String,
    pub objective: Option<String>,
    pub scope: Option<String>,
    pub framework_name: String,
    pub assigned_policy: Option<String>,
    pub assigned_subpolicy: Option<String>,
    pub policies: Vec<PolicyRef>,
    pub subpolicies: Vec<SubpolicyRef>,
    pub compliances: Vec<ComplianceRef>,
    policy_ids: BTreeSet<i32>,
    subpolicy_ids: BTreeSet<i32>,
    compliance_ids: BTreeSet<i32>,
}

impl AuditContext {
    pub fn new(audit: AuditRow, framework: FrameworkElements) -> Self {
        let assigned_policy = audit.policy_id.and_then(|pid| {
            framework
                .policies
                .iter()
                .find(|p| p.id == pid)
                .map(|p| p.name.clone())
        });
        let assigned_subpolicy = audit.subpolicy_id.and_then(|sid| {
            framework
                .subpolicies
                .iter()
                .find(|sp| sp.id == sid)
                .map(|sp| sp.name.clone())
        });
        let policy_ids = framework.policies.iter().map(|p| p.id).collect();
        let subpolicy_ids = framework.subpolicies.iter().map(|sp| sp.id).collect();
        let compliance_ids = framework.compliances.iter().map(|c| c.id).collect();
        Self {
            audit_id: audit.audit_id,
            framework_id: framework.framework_id,
            title: audit.title,
            objective: audit.objective,
            scope: audit.scope,
            framework_name: framework.framework_name,
            assigned_policy,
            assigned_subpolicy,
            policies: framework.policies,
            subpolicies: framework.subpolicies,
            compliances: framework.compliances,
            policy_ids,
            subpolicy_ids,
            compliance_ids,
        }
    }

    pub fn policy_ids(&self) -> &BTreeSet<i32> {
        &self.policy_ids
    }

    pub fn subpolicy_ids(&self) -> &BTreeSet<i32> {
        &self.subpolicy_ids
    }

    pub fn compliance_ids(&self) -> &BTreeSet<i32> {
        &self.compliance_ids
    }
}

/// Loads the context snapshot for one audit. No side effects.
pub struct AuditContextLoader {
    store: Arc<dyn RelationalStore>,
}

impl AuditContextLoader {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, audit_id: i32) -> Result<AuditContext, CorrelationError> {
        let audit = self
            .store
            .load_audit(audit_id)
            .await?
            .ok_or(CorrelationError::ContextNotFound(audit_id))?;
        let framework_id = audit
            .framework_id
            .ok_or(CorrelationError::ContextNotFound(audit_id))?;
        let framework = self.store.framework_elements(framework_id).await?;
        info!(
            "audit {audit_id}: loaded context with {} policies, {} subpolicies, {} compliances",
            framework.policies.len(),
            framework.subpolicies.len(),
            framework.compliances.len()
        );
        Ok(AuditContext::new(audit, framework))
    }
}
