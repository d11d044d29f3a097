pub mod analyzer;
pub mod config;
pub mod context;
pub mod error;
pub mod evidence;
pub mod index;
pub mod orchestrator;
pub mod store;
pub mod synthesis;

pub use analyzer::{OllamaClient, ReasoningError, ReasoningProvider, RelevanceAnalyzer};
pub use config::{CorrelatorConfig, ReasoningConfig};
pub use context::{AuditContext, AuditContextLoader};
pub use error::CorrelationError;
pub use evidence::{DocumentSource, EvidenceCandidate, EvidenceIdentity, EvidenceKind};
pub use index::{AnalysisIndex, AnalysisIndexStore, RelevanceAnalysis};
pub use orchestrator::{
    CorrelationOrchestrator, CorrelationOutcome, EvidenceClassification, QueueDispatcher,
    VerificationDispatcher, VerificationTask,
};
pub use store::{RelationalStore, StoreError};
pub use synthesis::{ChecklistUpdater, EvidenceSynthesizer};
