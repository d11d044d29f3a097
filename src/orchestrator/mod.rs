use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::analyzer::{ReasoningProvider, RelevanceAnalyzer};
use crate::config::CorrelatorConfig;
use crate::context::{AuditContext, AuditContextLoader};
use crate::error::CorrelationError;
use crate::evidence::{enumerate_candidates, DocumentSource, EvidenceCandidate};
use crate::index::{AnalysisIndex, AnalysisIndexStore};
use crate::store::RelationalStore;
use crate::synthesis::{ChecklistUpdater, EvidenceSynthesizer, SynthesizedEvidence};

/// Which evidence kinds cleared the evidence threshold for an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceClassification {
    NoEvidence,
    DocumentOnly,
    DatabaseOnly,
    Combined,
}

/// Hand-off to the downstream verification executor. The engine decides that
/// verification is warranted; running it belongs to someone else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationTask {
    pub audit_id: i32,
    pub evidence_record_id: i64,
    pub compliance_id: Option<i32>,
    pub relevance_score: f64,
    pub combined_evidence: bool,
}

#[async_trait]
pub trait VerificationDispatcher: Send + Sync {
    async fn dispatch(&self, task: VerificationTask) -> Result<(), CorrelationError>;
}

/// Dispatcher that forwards tasks onto an in-process queue.
pub struct QueueDispatcher {
    tx: mpsc::Sender<VerificationTask>,
}

impl QueueDispatcher {
    pub fn new(tx: mpsc::Sender<VerificationTask>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl VerificationDispatcher for QueueDispatcher {
    async fn dispatch(&self, task: VerificationTask) -> Result<(), CorrelationError> {
        info!(
            "audit {}: dispatching verification for evidence record {} (score {:.2})",
            task.audit_id, task.evidence_record_id, task.relevance_score
        );
        self.tx
            .send(task)
            .await
            .map_err(|e| CorrelationError::Dispatch(e.to_string()))
    }
}

/// Per-run report, one per audit.
#[derive(Debug, Clone)]
pub struct CorrelationOutcome {
    pub audit_id: i32,
    pub candidates: usize,
    pub analyzed: usize,
    pub cached: usize,
    pub failed: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub checklist_touched: usize,
    pub overall_score: f64,
    pub classification: EvidenceClassification,
    pub dispatched: bool,
}

/// Drives the full correlation pipeline for one audit: load context, enumerate
/// evidence, analyze what the index has not seen, persist verdicts, project
/// them into records and checklist entries, then decide on dispatch.
pub struct CorrelationOrchestrator {
    store: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentSource>,
    loader: AuditContextLoader,
    analyzer: Arc<RelevanceAnalyzer>,
    index_store: Arc<AnalysisIndexStore>,
    synthesizer: EvidenceSynthesizer,
    checklist: ChecklistUpdater,
    dispatcher: Arc<dyn VerificationDispatcher>,
    evidence_threshold: f64,
    checklist_threshold: f64,
    workers: usize,
}

impl CorrelationOrchestrator {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        documents: Arc<dyn DocumentSource>,
        reasoning: Arc<dyn ReasoningProvider>,
        dispatcher: Arc<dyn VerificationDispatcher>,
        config: &CorrelatorConfig,
    ) -> Self {
        Self {
            loader: AuditContextLoader::new(Arc::clone(&store)),
            analyzer: Arc::new(RelevanceAnalyzer::new(reasoning, &config.reasoning)),
            index_store: Arc::new(AnalysisIndexStore::new(
                config.index_root.clone(),
                config.persistence_retries,
            )),
            synthesizer: EvidenceSynthesizer::new(Arc::clone(&store), config.evidence_threshold),
            checklist: ChecklistUpdater::new(Arc::clone(&store), config.checklist_threshold),
            documents,
            dispatcher,
            evidence_threshold: config.evidence_threshold,
            checklist_threshold: config.checklist_threshold,
            workers: config.analysis_workers.max(1),
            store,
        }
    }

    /// Run correlation for every active audit of a framework. One audit's
    /// failure is logged and does not abort its siblings.
    pub async fn run_framework(
        &self,
        framework_id: i32,
        cancel: &CancellationToken,
    ) -> Result<Vec<CorrelationOutcome>, CorrelationError> {
        let audits = self.store.active_audits(framework_id).await?;
        info!(
            "framework {framework_id}: correlating {} active audit(s)",
            audits.len()
        );
        let mut outcomes = Vec::new();
        for audit in audits {
            if cancel.is_cancelled() {
                warn!("framework {framework_id}: run cancelled; stopping sweep");
                break;
            }
            match self.run_audit(audit.audit_id, cancel).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("audit {}: correlation run failed: {e}", audit.audit_id),
            }
        }
        Ok(outcomes)
    }

    pub async fn run_audit(
        &self,
        audit_id: i32,
        cancel: &CancellationToken,
    ) -> Result<CorrelationOutcome, CorrelationError> {
        let context = self.loader.load(audit_id).await?;
        let candidates =
            enumerate_candidates(&self.store, &self.documents, context.framework_id).await?;
        let total = candidates.len();

        let index = self
            .index_store
            .load(context.framework_id, context.audit_id)
            .await;
        let pending: Vec<EvidenceCandidate> = candidates
            .into_iter()
            .filter(|c| {
                let seen = index.contains(&c.identity());
                if seen {
                    debug!("audit {audit_id}: {} already analyzed; skipping", c.identity());
                }
                !seen
            })
            .collect();
        let cached = total - pending.len();
        info!(
            "audit {audit_id}: {total} candidate(s), {cached} cached, {} to analyze",
            pending.len()
        );

        let (index, analyzed, failed) =
            self.analyze_pending(&context, index, pending, cancel).await?;

        let synthesized = self.synthesizer.synthesize(&context, &index).await?;
        let checklist_touched = self.checklist.apply(&context, &synthesized).await?;

        let overall_score = index.overall_score();
        let classification = self.classify(&index);
        let dispatched = self
            .maybe_dispatch(&context, &synthesized, overall_score, classification, cancel)
            .await?;

        let outcome = CorrelationOutcome {
            audit_id,
            candidates: total,
            analyzed,
            cached,
            failed,
            records_created: synthesized.iter().filter(|s| s.created).count(),
            records_updated: synthesized.iter().filter(|s| s.updated).count(),
            checklist_touched,
            overall_score,
            classification,
            dispatched,
        };
        self.log_summary(&index, &outcome);
        Ok(outcome)
    }

    /// Fan analysis out over a bounded worker pool. All index mutation happens
    /// in a single writer task fed over a channel, so the worker pool never
    /// contends on the index file.
    async fn analyze_pending(
        &self,
        context: &AuditContext,
        index: AnalysisIndex,
        pending: Vec<EvidenceCandidate>,
        cancel: &CancellationToken,
    ) -> Result<(AnalysisIndex, usize, usize), CorrelationError> {
        if pending.is_empty() {
            return Ok((index, 0, 0));
        }
        let analyzed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let (tx, mut rx) = mpsc::channel(self.workers * 2);
        let index_store = Arc::clone(&self.index_store);
        let writer = tokio::spawn(async move {
            let mut index = index;
            let mut failure: Option<std::io::Error> = None;
            while let Some((identity, legacy_ids, analysis)) = rx.recv().await {
                if let Err(e) = index_store
                    .upsert_with_retry(&mut index, &identity, &legacy_ids, analysis)
                    .await
                {
                    failure = Some(e);
                    rx.close();
                    break;
                }
            }
            (index, failure)
        });

        let audit_id = context.audit_id;
        let analyzed_ref = &analyzed;
        let failed_ref = &failed;
        futures::stream::iter(pending)
            .for_each_concurrent(self.workers, |candidate| {
                let tx = tx.clone();
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let identity = candidate.identity();
                    match self.analyzer.analyze(context, &candidate).await {
                        Ok(analysis) => {
                            debug!(
                                "audit {audit_id}: {identity} scored {:.2}",
                                analysis.score
                            );
                            analyzed_ref.fetch_add(1, Ordering::Relaxed);
                            // Send failure means the writer gave up; the
                            // verdict is simply retried on the next run.
                            let _ = tx
                                .send((identity, candidate.legacy_ids(), analysis))
                                .await;
                        }
                        Err(e) => {
                            failed_ref.fetch_add(1, Ordering::Relaxed);
                            error!("audit {audit_id}: analysis failed for {identity}: {e}");
                        }
                    }
                }
            })
            .await;
        drop(tx);

        let (index, failure) = writer
            .await
            .map_err(|e| CorrelationError::Persistence(e.to_string()))?;
        if let Some(e) = failure {
            return Err(CorrelationError::Persistence(e.to_string()));
        }
        Ok((
            index,
            analyzed.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
        ))
    }

    fn classify(&self, index: &AnalysisIndex) -> EvidenceClassification {
        let documents_cleared = index
            .documents
            .values()
            .any(|e| e.analysis.score >= self.evidence_threshold);
        let records_cleared = index
            .records
            .values()
            .any(|e| e.analysis.score >= self.evidence_threshold);
        match (documents_cleared, records_cleared) {
            (false, false) => EvidenceClassification::NoEvidence,
            (true, false) => EvidenceClassification::DocumentOnly,
            (false, true) => EvidenceClassification::DatabaseOnly,
            (true, true) => EvidenceClassification::Combined,
        }
    }

    /// Dispatch one verification task per run, for the highest-scoring piece
    /// of evidence that became a record. Nothing is dispatched after
    /// cancellation or when no evidence cleared the threshold.
    async fn maybe_dispatch(
        &self,
        context: &AuditContext,
        synthesized: &[SynthesizedEvidence],
        overall_score: f64,
        classification: EvidenceClassification,
        cancel: &CancellationToken,
    ) -> Result<bool, CorrelationError> {
        if cancel.is_cancelled() || overall_score < self.evidence_threshold {
            return Ok(false);
        }
        let Some(best) = synthesized.iter().max_by(|a, b| {
            a.analysis
                .score
                .partial_cmp(&b.analysis.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return Ok(false);
        };

        self.dispatcher
            .dispatch(VerificationTask {
                audit_id: context.audit_id,
                evidence_record_id: best.record_id,
                compliance_id: best.mapping.compliance_id,
                relevance_score: best.analysis.score,
                combined_evidence: classification == EvidenceClassification::Combined,
            })
            .await?;
        Ok(true)
    }

    fn log_summary(&self, index: &AnalysisIndex, outcome: &CorrelationOutcome) {
        let relevant = index
            .analyses()
            .filter(|a| a.score >= self.evidence_threshold)
            .count();
        let strong = index
            .analyses()
            .filter(|a| a.score >= self.checklist_threshold)
            .count();
        info!(
            "audit {}: analyzed {} (cached {}, failed {}), {relevant} relevant, \
             {strong} strong, overall {:.2}, classification {:?}, dispatched: {}",
            outcome.audit_id,
            outcome.analyzed,
            outcome.cached,
            outcome.failed,
            outcome.overall_score,
            outcome.classification,
            outcome.dispatched
        );
    }
}
