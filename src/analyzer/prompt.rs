use std::fmt::Write as _;

use crate::context::AuditContext;
use crate::evidence::{DocumentEvidence, RecordEvidence};

pub const SYSTEM_INSTRUCTION: &str = "You are an expert GRC auditor. Evaluate \
how relevant the given evidence is to the audit and its framework. Respond \
with only valid JSON, no prose outside the JSON object.";

const FIELD_CAP: usize = 800;
const LISTING_DESC_CAP: usize = 150;
const COMPLIANCE_DESC_CAP: usize = 200;
const DOC_POLICY_LIMIT: usize = 50;
const DOC_SUBPOLICY_LIMIT: usize = 50;
const DOC_COMPLIANCE_LIMIT: usize = 150;
const RECORD_COMPLIANCE_LIMIT: usize = 100;
const SUMMARY_CAP: usize = 1000;
const RECORD_VALUE_CAP: usize = 200;
const RECORD_BLOCK_CAP: usize = 2000;

/// Char-boundary-safe truncation. Byte slicing would panic on multibyte text.
pub fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn push_audit_header(out: &mut String, context: &AuditContext) {
    let _ = writeln!(out, "AUDIT: {}", truncate(&context.title, FIELD_CAP));
    if let Some(objective) = &context.objective {
        let _ = writeln!(out, "WHY (objective): {}", truncate(objective, FIELD_CAP));
    }
    if let Some(scope) = &context.scope {
        let _ = writeln!(out, "WHAT (scope): {}", truncate(scope, FIELD_CAP));
    }
    let _ = writeln!(out, "FRAMEWORK: {}", context.framework_name);
    if let Some(policy) = &context.assigned_policy {
        let _ = writeln!(out, "ASSIGNED POLICY: {policy}");
    }
    if let Some(subpolicy) = &context.assigned_subpolicy {
        let _ = writeln!(out, "ASSIGNED SUBPOLICY: {subpolicy}");
    }
}

fn push_compliances(out: &mut String, context: &AuditContext, limit: usize) {
    let _ = writeln!(out, "\nCOMPLIANCE REQUIREMENTS IN FRAMEWORK:");
    for compliance in context.compliances.iter().take(limit) {
        let _ = writeln!(
            out,
            "- [ComplianceId:{}] {}: {}",
            compliance.id,
            compliance.title,
            truncate(&compliance.description, COMPLIANCE_DESC_CAP)
        );
    }
    if context.compliances.len() > limit {
        let _ = writeln!(out, "... and {} more", context.compliances.len() - limit);
    }
}

/// Render the full analysis prompt for an uploaded document. The model only
/// ever sees the pre-extracted title/summary, never file bytes.
pub fn render_document_prompt(context: &AuditContext, document: &DocumentEvidence) -> String {
    let mut out = String::new();
    push_audit_header(&mut out, context);

    let _ = writeln!(out, "\nPOLICIES IN FRAMEWORK:");
    for policy in context.policies.iter().take(DOC_POLICY_LIMIT) {
        let _ = writeln!(
            out,
            "- [PolicyId:{}] {}: {}",
            policy.id,
            policy.name,
            truncate(&policy.description, LISTING_DESC_CAP)
        );
    }
    if context.policies.len() > DOC_POLICY_LIMIT {
        let _ = writeln!(out, "... and {} more", context.policies.len() - DOC_POLICY_LIMIT);
    }

    let _ = writeln!(out, "\nSUBPOLICIES IN FRAMEWORK:");
    for subpolicy in context.subpolicies.iter().take(DOC_SUBPOLICY_LIMIT) {
        let _ = writeln!(
            out,
            "- [SubPolicyId:{}] {}: {}",
            subpolicy.id,
            subpolicy.name,
            truncate(&subpolicy.description, LISTING_DESC_CAP)
        );
    }
    if context.subpolicies.len() > DOC_SUBPOLICY_LIMIT {
        let _ = writeln!(
            out,
            "... and {} more",
            context.subpolicies.len() - DOC_SUBPOLICY_LIMIT
        );
    }

    push_compliances(&mut out, context, DOC_COMPLIANCE_LIMIT);

    let _ = writeln!(out, "\nDOCUMENT UNDER REVIEW:");
    let _ = writeln!(out, "Title: {}", document.title);
    let _ = writeln!(out, "Summary: {}", truncate(&document.summary, SUMMARY_CAP));
    for (key, value) in &document.metadata {
        let _ = writeln!(out, "{key}: {}", truncate(value, RECORD_VALUE_CAP));
    }

    out.push_str(
        "\nAssess how relevant this document is to the audit above. Reply with \
only a JSON object of this exact shape:\n\
{\"relevance_score\": <0.0-1.0>, \"reason\": \"<one sentence>\", \
\"matched_policies\": [<PolicyId>...], \"matched_subpolicies\": \
[<SubPolicyId>...], \"matched_compliances\": [<ComplianceId>...]}\n\
Use only ids listed above. Empty arrays are valid.",
    );
    out
}

/// Render the analysis prompt for one operational-table row.
pub fn render_record_prompt(context: &AuditContext, record: &RecordEvidence) -> String {
    let mut out = String::new();
    push_audit_header(&mut out, context);
    push_compliances(&mut out, context, RECORD_COMPLIANCE_LIMIT);

    let _ = writeln!(
        out,
        "\nDATABASE RECORD UNDER REVIEW (table: {}, id: {}):",
        record.table, record.record_id
    );
    let mut block = String::new();
    for (key, value) in &record.fields {
        if block.chars().count() >= RECORD_BLOCK_CAP {
            block.push_str("...\n");
            break;
        }
        let _ = writeln!(block, "{key}: {}", truncate(value, RECORD_VALUE_CAP));
    }
    out.push_str(truncate(&block, RECORD_BLOCK_CAP + 4));

    out.push_str(
        "\nAssess how relevant this record is to the audit above. Reply with \
only a JSON object of this exact shape:\n\
{\"relevance_score\": <0.0-1.0>, \"reason\": \"<one sentence>\", \
\"matched_compliances\": [<ComplianceId>...]}\n\
Use only ComplianceId values listed above. An empty array is valid.",
    );
    out
}
