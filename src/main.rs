use anyhow::Context as _;
use dotenvy::dotenv;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use audit_correlator::analyzer::OllamaClient;
use audit_correlator::config::CorrelatorConfig;
use audit_correlator::evidence::DocumentSource;
use audit_correlator::orchestrator::{CorrelationOrchestrator, QueueDispatcher, VerificationTask};
use audit_correlator::store::postgres::PgStore;
use audit_correlator::store::RelationalStore;

enum Target {
    Audit(i32),
    Framework(i32),
}

fn usage() -> ! {
    eprintln!("usage: audit-correlator --audit <audit_id> | --framework <framework_id>");
    std::process::exit(2);
}

fn parse_args() -> Target {
    let args: Vec<String> = std::env::args().collect();
    match (args.get(1).map(String::as_str), args.get(2)) {
        (Some("--audit"), Some(id)) => match id.parse() {
            Ok(id) => Target::Audit(id),
            Err(_) => usage(),
        },
        (Some("--framework"), Some(id)) => match id.parse() {
            Ok(id) => Target::Framework(id),
            Err(_) => usage(),
        },
        _ => usage(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let target = parse_args();

    let config = match std::env::var("CORRELATOR_CONFIG") {
        Ok(path) => CorrelatorConfig::from_toml_file(Path::new(&path))?,
        Err(_) => CorrelatorConfig::from_env(),
    };

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL is not set")?;
    let store = Arc::new(PgStore::connect(&database_url)?);
    let relational: Arc<dyn RelationalStore> = store.clone();
    let documents: Arc<dyn DocumentSource> = store;
    let reasoning = Arc::new(OllamaClient::new(&config.reasoning)?);

    // Downstream verification runs elsewhere; here the queue is drained into
    // the log so operators can see what would be executed.
    let (task_tx, mut task_rx) = tokio::sync::mpsc::channel::<VerificationTask>(64);
    let drain = tokio::spawn(async move {
        while let Some(task) = task_rx.recv().await {
            info!(
                "verification task queued: audit {} evidence record {} (compliance {:?}, \
                 score {:.2}, combined: {})",
                task.audit_id,
                task.evidence_record_id,
                task.compliance_id,
                task.relevance_score,
                task.combined_evidence
            );
        }
    });

    let orchestrator = CorrelationOrchestrator::new(
        relational,
        documents,
        reasoning,
        Arc::new(QueueDispatcher::new(task_tx)),
        &config,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight analyses");
            signal_cancel.cancel();
        }
    });

    match target {
        Target::Audit(audit_id) => {
            let outcome = orchestrator.run_audit(audit_id, &cancel).await?;
            info!(
                "audit {audit_id} complete: overall {:.2}, {:?}",
                outcome.overall_score, outcome.classification
            );
        }
        Target::Framework(framework_id) => {
            let outcomes = orchestrator.run_framework(framework_id, &cancel).await?;
            info!("framework {framework_id} complete: {} audit(s) processed", outcomes.len());
        }
    }

    drop(orchestrator);
    drain.await.ok();
    Ok(())
}
