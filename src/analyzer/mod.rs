use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ReasoningConfig;
use crate::context::AuditContext;
use crate::evidence::EvidenceCandidate;
use crate::index::RelevanceAnalysis;

pub mod ollama;
pub mod parse;
pub mod prompt;

pub use ollama::OllamaClient;
pub use parse::{parse_reply, ParseOutcome, ParsedVerdict};

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("reasoning service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reasoning service returned an empty reply")]
    EmptyReply,
    #[error("reasoning reply could not be parsed: {0}")]
    Unparseable(String),
}

pub struct ReasoningRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Seam to the reasoning service. The engine never depends on which model sits
/// behind it; tests plug in a scripted implementation.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, ReasoningError>;
}

/// Scores one evidence candidate against an audit context and enforces the
/// filtering invariant: no id leaves this type unless the context contains it.
pub struct RelevanceAnalyzer {
    provider: Arc<dyn ReasoningProvider>,
    document_max_tokens: u32,
    record_max_tokens: u32,
}

impl RelevanceAnalyzer {
    pub fn new(provider: Arc<dyn ReasoningProvider>, config: &ReasoningConfig) -> Self {
        Self {
            provider,
            document_max_tokens: config.document_max_tokens,
            record_max_tokens: config.record_max_tokens,
        }
    }

    pub async fn analyze(
        &self,
        context: &AuditContext,
        candidate: &EvidenceCandidate,
    ) -> Result<RelevanceAnalysis, ReasoningError> {
        let (rendered, max_tokens) = match candidate {
            EvidenceCandidate::Document(doc) => (
                prompt::render_document_prompt(context, doc),
                self.document_max_tokens,
            ),
            EvidenceCandidate::Record(rec) => (
                prompt::render_record_prompt(context, rec),
                self.record_max_tokens,
            ),
        };

        let reply = self
            .provider
            .complete(&ReasoningRequest {
                system: prompt::SYSTEM_INSTRUCTION.to_string(),
                prompt: rendered,
                max_tokens,
            })
            .await?;

        let verdict = match parse_reply(&reply) {
            ParseOutcome::Parsed(v) => v,
            ParseOutcome::PartiallyParsed(v) => {
                warn!(
                    "audit {}: partially parsed reply for {}",
                    context.audit_id,
                    candidate.identity()
                );
                v
            }
            ParseOutcome::Unparseable => {
                return Err(ReasoningError::Unparseable(
                    prompt::truncate(&reply, 300).to_string(),
                ))
            }
        };

        let Some(raw_score) = verdict.score else {
            return Err(ReasoningError::Unparseable(
                "no relevance score in reply".to_string(),
            ));
        };

        Ok(RelevanceAnalysis {
            score: raw_score.clamp(0.0, 1.0),
            reason: verdict
                .reason
                .unwrap_or_else(|| "No reason given".to_string()),
            matched_policy_ids: self.filter_ids(
                context,
                candidate,
                "policy",
                verdict.policy_ids,
                context.policy_ids(),
            ),
            matched_subpolicy_ids: self.filter_ids(
                context,
                candidate,
                "subpolicy",
                verdict.subpolicy_ids,
                context.subpolicy_ids(),
            ),
            matched_compliance_ids: self.filter_ids(
                context,
                candidate,
                "compliance",
                verdict.compliance_ids,
                context.compliance_ids(),
            ),
            analyzed_at: Utc::now(),
        })
    }

    /// Drop every id the framework does not contain. Models hallucinate ids;
    /// a hallucinated id must never reach the mapping stage.
    fn filter_ids(
        &self,
        context: &AuditContext,
        candidate: &EvidenceCandidate,
        label: &str,
        raw: Vec<i32>,
        allowed: &BTreeSet<i32>,
    ) -> BTreeSet<i32> {
        let mut kept = BTreeSet::new();
        for id in raw {
            if allowed.contains(&id) {
                kept.insert(id);
            } else {
                warn!(
                    "audit {}: dropping {label} id {id} for {} (not in framework {})",
                    context.audit_id,
                    candidate.identity(),
                    context.framework_id
                );
            }
        }
        kept
    }
}
