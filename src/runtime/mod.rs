//! Async crawl runtime.
//!
//! [`Crawler`] drives one process: it seeds jobs, keeps priorities current,
//! stuffs claimed batches into a bounded pool of fetch workers, removes
//! deleted and expired documents from the output and announces finished
//! jobs. Store calls are synchronous and run on the blocking pool.

mod worker;

pub use worker::{process_batch, run_batch};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::jobs::{now_ms, DeletionTask, QueueManager};
use crate::models::{JobRecord, JobType, Outcome};
use crate::store::QueueStore;

/// Run a synchronous queue operation on the blocking thread pool.
pub(crate) async fn blocking<S, T, F>(manager: &QueueManager<S>, f: F) -> SchedulerResult<T>
where
    S: QueueStore,
    T: Send + 'static,
    F: FnOnce(&QueueManager<S>) -> SchedulerResult<T> + Send + 'static,
{
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || f(&manager)).await?
}

/// Work done by one [`Crawler::cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub seeded: usize,
    pub prioritized: usize,
    pub dispatched: usize,
    pub removed: usize,
    pub finished_jobs: usize,
    pub reprioritized: bool,
}

/// Stops a running [`Crawler`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // Receivers may already be gone.
        let _ = self.0.send(true);
    }
}

pub struct Crawler<S: QueueStore> {
    manager: QueueManager<S>,
    workers: Arc<Semaphore>,
    worker_count: u32,
    shutdown: watch::Receiver<bool>,
}

impl<S: QueueStore> Crawler<S> {
    pub fn new(manager: QueueManager<S>) -> (Self, ShutdownHandle) {
        let worker_count = manager.context().settings.worker_count.max(1);
        let (tx, rx) = watch::channel(false);
        let crawler = Self {
            manager,
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count: u32::try_from(worker_count).unwrap_or(u32::MAX),
            shutdown: rx,
        };
        (crawler, ShutdownHandle(Arc::new(tx)))
    }

    pub fn manager(&self) -> &QueueManager<S> {
        &self.manager
    }

    /// Cycle every stuffer interval until shut down, then wait for workers.
    pub async fn run(mut self) -> SchedulerResult<()> {
        let interval_ms = self.manager.context().settings.stuffer_interval_ms.max(1);
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        info!(
            "Crawler {} started ({} workers, {}ms cycle)",
            self.manager.context().process_id(),
            self.worker_count,
            interval_ms
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *self.shutdown.borrow() {
                break;
            }
            match self.cycle().await {
                Ok(report) => debug!("Cycle: {:?}", report),
                Err(err) if err.is_invariant_violation() => return Err(err),
                Err(err) => warn!("Cycle failed: {}", err),
            }
        }

        info!("Crawler shutting down; waiting for workers");
        self.wait_for_workers().await?;
        Ok(())
    }

    /// One pass of every scheduling duty.
    pub async fn cycle(&self) -> SchedulerResult<CycleReport> {
        let settings = &self.manager.context().settings;
        let mut report = CycleReport {
            seeded: self.seed().await?,
            ..Default::default()
        };
        report.reprioritized = self.resweep().await?;
        report.prioritized = blocking(&self.manager, |m| m.prioritize_documents(now_ms())).await?;
        blocking(&self.manager, |m| m.reprioritize_blocked()).await?;
        report.dispatched = self.stuff(settings.stuffer_batch_size).await?;
        report.removed = self.remove_documents(settings.delete_batch_size).await?;
        report.finished_jobs = self.finish_jobs().await?;
        Ok(report)
    }

    /// Reassign waiting priorities after a connection's throttles changed.
    async fn resweep(&self) -> SchedulerResult<bool> {
        if !self.manager.context().take_throttles_changed() {
            return Ok(false);
        }
        let sweep_id = uuid::Uuid::new_v4().simple().to_string();
        let swept = blocking(&self.manager, move |m| m.reprioritize(&sweep_id, now_ms())).await?;
        if !swept {
            debug!("Reprioritization lease held elsewhere; retrying next cycle");
            self.manager.context().mark_throttles_changed();
        }
        Ok(swept)
    }

    /// Block until every dispatched batch has completed.
    pub async fn wait_for_workers(&self) -> SchedulerResult<()> {
        let permits = self
            .workers
            .acquire_many(self.worker_count)
            .await
            .map_err(|e| SchedulerError::Task(e.to_string()))?;
        drop(permits);
        Ok(())
    }

    async fn seed(&self) -> SchedulerResult<usize> {
        let now = now_ms();
        let jobs = blocking(&self.manager, move |m| m.claim_jobs_for_seeding(now)).await?;
        let mut seeded = 0usize;
        for job in jobs {
            let job_id = job.id();
            match self.seed_job(job, now).await {
                Ok(count) => seeded += count,
                Err(err) => {
                    warn!("Seeding of job {} failed: {}", job_id, err);
                    let message = err.to_string();
                    blocking(&self.manager, move |m| m.seeding_failed(job_id, &message, now_ms())).await?;
                }
            }
        }
        Ok(seeded)
    }

    async fn seed_job(&self, job: JobRecord, now: i64) -> SchedulerResult<usize> {
        let job_id = job.id();
        let connector = self
            .manager
            .context()
            .repository_for(&job.description.connection_name)?;
        let since = job.seeding.last_seeding_ms;
        // Specified runs rediscover every seed; continuous jobs only the new ones.
        let full = job.description.job_type == JobType::Specified || since.is_none();

        match connector.seed_documents(&job.description, since, now).await {
            Outcome::Success(identifiers) => {
                let added = blocking(&self.manager, move |m| {
                    let added = m.add_seeds(job_id, &identifiers, now)?;
                    m.finish_seeding(job_id, full, now)?;
                    Ok(added)
                })
                .await?;
                Ok(added)
            }
            Outcome::Retryable(interruption) => {
                blocking(&self.manager, move |m| m.seeding_interrupted(job_id, &interruption, now)).await?;
                Ok(0)
            }
            Outcome::Fatal(message) => {
                blocking(&self.manager, move |m| m.seeding_failed(job_id, &message, now)).await?;
                Ok(0)
            }
        }
    }

    /// Claim as many batches as there are idle workers and dispatch them.
    async fn stuff(&self, batch_size: usize) -> SchedulerResult<usize> {
        let idle = self.workers.available_permits();
        if idle == 0 {
            return Ok(0);
        }
        let batches = blocking(&self.manager, move |m| m.get_next_documents(batch_size, now_ms())).await?;
        let mut dispatched = 0usize;
        for batch in batches {
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .map_err(|e| SchedulerError::Task(e.to_string()))?;
            dispatched += batch.documents.len();
            let manager = self.manager.clone();
            let job_id = batch.job.id;
            tokio::spawn(async move {
                if run_batch(manager, batch).await.is_err() {
                    debug!("Job {}: worker finished with errors", job_id);
                }
                drop(permit);
            });
        }
        Ok(dispatched)
    }

    async fn remove_documents(&self, batch_size: usize) -> SchedulerResult<usize> {
        let deletable = blocking(&self.manager, move |m| m.get_next_deletable(batch_size, now_ms())).await?;
        let cleanable = blocking(&self.manager, move |m| m.get_next_cleanable(batch_size, now_ms())).await?;
        let mut removed = 0usize;
        for task in deletable.into_iter().chain(cleanable) {
            if self.remove_document(task).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_document(&self, task: DeletionTask) -> SchedulerResult<bool> {
        let job_id = task.job.id;
        let hashes = vec![task.doc_hash.clone()];
        let outcome = match &task.job.output_connector {
            Some(id) => match self.manager.context().connectors.output(id) {
                Ok(output) => output.remove_document(&task.job, &task.document_identifier).await,
                Err(err) => Outcome::Fatal(err.to_string()),
            },
            None => Outcome::Success(()),
        };

        match outcome {
            Outcome::Success(()) => {
                blocking(&self.manager, move |m| m.deletion_done(job_id, &hashes, now_ms())).await?;
                Ok(true)
            }
            Outcome::Retryable(interruption) => {
                let retry_at = interruption.retry_at_ms;
                blocking(&self.manager, move |m| m.deletion_interrupted(job_id, &hashes, retry_at)).await?;
                Ok(false)
            }
            Outcome::Fatal(message) => {
                warn!(
                    "Job {}: output refused to remove {}: {}",
                    job_id, task.document_identifier, message
                );
                let retry_at = now_ms() + self.manager.context().settings.retry_backoff_ms;
                blocking(&self.manager, move |m| m.deletion_interrupted(job_id, &hashes, retry_at)).await?;
                Ok(false)
            }
        }
    }

    async fn finish_jobs(&self) -> SchedulerResult<usize> {
        blocking(&self.manager, |m| m.mark_expired(now_ms())).await?;
        let finished = blocking(&self.manager, |m| m.finish_job_runs(now_ms())).await?;
        let ctx = self.manager.context();
        for job in &finished {
            for id in &job.notification_connectors {
                let notifier = match ctx.connectors.notification(id) {
                    Ok(notifier) => notifier,
                    Err(err) => {
                        warn!("Job {}: {}", job.id, err);
                        continue;
                    }
                };
                match notifier.job_finished(job).await {
                    Outcome::Success(()) => debug!("Job {}: notified {}", job.id, id),
                    Outcome::Retryable(interruption) => {
                        warn!("Job {}: notification {} deferred: {}", job.id, id, interruption.message)
                    }
                    Outcome::Fatal(message) => warn!("Job {}: notification {} failed: {}", job.id, id, message),
                }
            }
        }
        Ok(finished.len())
    }
}
