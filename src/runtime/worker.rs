//! One fetch worker: process a claimed batch and record its outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::blocking;
use crate::connectors::{DocumentDescription, JobActivityProbe, ProcessActivity};
use crate::error::{SchedulerError, SchedulerResult};
use crate::jobs::{now_ms, CompletionSummary, DocumentBatch, QueueManager};
use crate::models::{DocumentOutcome, JobId};
use crate::store::QueueStore;

/// Process a batch, handing its documents back to the queue if it cannot be completed.
pub async fn run_batch<S: QueueStore>(
    manager: QueueManager<S>,
    batch: DocumentBatch,
) -> SchedulerResult<CompletionSummary> {
    let job_id = batch.job.id;
    let hashes: Vec<String> = batch.documents.iter().map(|d| d.doc_hash.clone()).collect();
    match process_batch(manager.clone(), batch).await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            error!("Job {}: batch of {} failed: {}", job_id, hashes.len(), err);
            if let Err(release_err) =
                blocking(&manager, move |m| m.release_documents(job_id, &hashes, now_ms())).await
            {
                error!("Job {}: could not release batch: {}", job_id, release_err);
            }
            Err(err)
        }
    }
}

/// Fetch a batch through its repository connector and complete every document.
///
/// The connector's references are stored for parents it kept; a parent
/// whose references cannot be stored is abandoned instead.
pub async fn process_batch<S: QueueStore>(
    manager: QueueManager<S>,
    batch: DocumentBatch,
) -> SchedulerResult<CompletionSummary> {
    let ctx = Arc::clone(manager.context());
    let job = batch.job;
    let documents = batch.documents;

    let mut outcomes = match ctx.repository_for(&job.connection_name) {
        Ok(connector) => {
            for document in &documents {
                ctx.queue_tracker.begin_processing(&document.bins);
            }
            let probe: Arc<dyn JobActivityProbe> = Arc::new(manager.clone());
            let activity = ProcessActivity::new(job.id, probe);
            let started = Instant::now();
            let mut outcomes = connector.process_documents(&job, &documents, &activity).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            ctx.performance
                .record_completion(&job.connection_name, documents.len(), elapsed_ms);
            for document in &documents {
                ctx.queue_tracker.end_processing(&document.bins);
            }
            store_references(&manager, job.id, &documents, &mut outcomes, activity).await;
            outcomes
        }
        Err(err) => {
            warn!("Job {}: cannot fetch: {}", job.id, err);
            let message = err.to_string();
            documents
                .iter()
                .map(|_| DocumentOutcome::Fatal {
                    message: message.clone(),
                })
                .collect()
        }
    };

    if outcomes.len() != documents.len() {
        warn!(
            "Job {}: connector returned {} outcomes for {} documents",
            job.id,
            outcomes.len(),
            documents.len()
        );
        outcomes.resize(documents.len(), DocumentOutcome::Abandoned);
    }

    let results: Vec<(String, DocumentOutcome)> = documents
        .iter()
        .map(|d| d.doc_hash.clone())
        .zip(outcomes)
        .collect();
    let job_id = job.id;
    let summary = blocking(&manager, move |m| m.complete_documents(job_id, &results, now_ms())).await?;
    debug!("Job {}: batch of {} done: {:?}", job_id, documents.len(), summary);
    Ok(summary)
}

async fn store_references<S: QueueStore>(
    manager: &QueueManager<S>,
    job_id: JobId,
    documents: &[DocumentDescription],
    outcomes: &mut [DocumentOutcome],
    activity: ProcessActivity,
) {
    let positions: HashMap<&str, usize> = documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.document_identifier.as_str(), i))
        .collect();

    for (parent, children) in activity.take_references() {
        let Some(&index) = positions.get(parent.as_str()) else {
            warn!("Job {}: dropping references from unclaimed document {}", job_id, parent);
            continue;
        };
        if !outcomes.get(index).is_some_and(DocumentOutcome::keeps_references) {
            continue;
        }
        let stored = blocking(manager, {
            let parent = parent.clone();
            move |m| m.add_document_references(job_id, &parent, &children, now_ms())
        })
        .await;
        match stored {
            Ok(_) => {}
            Err(SchedulerError::JobNotActive(_)) => {
                debug!("Job {} stopped while processing {}", job_id, parent);
                outcomes[index] = DocumentOutcome::Abandoned;
            }
            Err(err) => {
                warn!("Job {}: failed to store references of {}: {}", job_id, parent, err);
                outcomes[index] = DocumentOutcome::Abandoned;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::connectors::simulated::SimulatedConnector;
    use crate::connectors::{ChildReference, ConnectorRegistry};
    use crate::models::{document_hash, JobDescription, JobType, QueueStatus, RepositoryConnection};
    use crate::scheduler::SchedulerContext;
    use crate::store::MemoryStore;

    fn setup(connector: SimulatedConnector) -> QueueManager<MemoryStore> {
        let mut registry = ConnectorRegistry::new();
        registry.register_repository(Arc::new(connector));
        let ctx = SchedulerContext::new(Settings::default(), registry);
        ctx.add_connection(RepositoryConnection::new("web", "sim"));
        let manager = QueueManager::new(Arc::new(MemoryStore::new()), Arc::new(ctx));
        manager
            .create_job(JobDescription::new(1, "job", "web", JobType::Specified))
            .unwrap();
        manager.start_job(1, 0).unwrap();
        manager
    }

    #[tokio::test]
    async fn test_batch_stores_references_of_processed_parents() {
        let connector = SimulatedConnector::new("sim").with_batch_size(2);
        connector.add_link("http://a/1", ChildReference::new("http://a/3"));
        connector.add_link("http://a/2", ChildReference::new("http://a/4"));
        connector.script("http://a/2", DocumentOutcome::Failed { message: "reset".into() });
        let manager = setup(connector);
        manager
            .add_seeds(1, &["http://a/1".to_string(), "http://a/2".to_string()], 0)
            .unwrap();

        let mut batches = manager.get_next_documents(10, now_ms()).unwrap();
        assert_eq!(batches.len(), 1);
        let summary = process_batch(manager.clone(), batches.remove(0)).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.requeued, 1);

        let (kept, dropped) = manager
            .transact(|txn| {
                Ok((
                    txn.load_entry(1, &document_hash("http://a/3"))?,
                    txn.load_entry(1, &document_hash("http://a/4"))?,
                ))
            })
            .unwrap();
        assert_eq!(kept.unwrap().status, QueueStatus::Pending);
        assert!(dropped.is_none());
        assert_eq!(manager.context().queue_tracker.active_count("a"), 0);
    }

    #[tokio::test]
    async fn test_failed_completion_releases_batch() {
        let connector = SimulatedConnector::new("sim").with_batch_size(2);
        let manager = setup(connector);
        manager
            .add_seeds(1, &["http://a/1".to_string(), "http://a/2".to_string()], 0)
            .unwrap();
        let mut batches = manager.get_next_documents(10, now_ms()).unwrap();
        assert_eq!(batches[0].documents.len(), 2);

        // Another actor resets one entry, so completing the batch is refused.
        let reset = document_hash("http://a/2");
        manager
            .transact(|txn| {
                let mut entry = txn.load_entry(1, &reset)?.unwrap();
                entry.requeue(0);
                txn.save_entry(&entry)
            })
            .unwrap();

        let err = run_batch(manager.clone(), batches.remove(0)).await.unwrap_err();
        assert!(err.is_invariant_violation());
        let entry = manager
            .transact(|txn| txn.load_entry(1, &document_hash("http://a/1")))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.process_id, None);

        let reclaimed: Vec<String> = manager
            .get_next_documents(10, now_ms())
            .unwrap()
            .into_iter()
            .flat_map(|b| b.documents.into_iter().map(|d| d.document_identifier))
            .collect();
        assert!(reclaimed.contains(&"http://a/1".to_string()));
    }

    #[tokio::test]
    async fn test_aborted_job_abandons_documents() {
        let connector = SimulatedConnector::new("sim");
        connector.add_link("http://a/1", ChildReference::new("http://a/2"));
        let manager = setup(connector);
        manager.add_seeds(1, &["http://a/1".to_string()], 0).unwrap();

        let mut batches = manager.get_next_documents(10, now_ms()).unwrap();
        manager.abort_job(1).unwrap();
        let summary = process_batch(manager.clone(), batches.remove(0)).await.unwrap();
        assert_eq!(summary.requeued, 1);
        let entry = manager
            .transact(|txn| txn.load_entry(1, &document_hash("http://a/1")))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.fail_count, 0);
    }
}
