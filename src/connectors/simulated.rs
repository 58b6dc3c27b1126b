//! In-memory connectors driven by a static link graph.
//!
//! Used by `crawlq simulate` and by the test suites to exercise the whole
//! scheduler without touching a real repository.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    host_bin_names, ChildReference, DocumentDescription, NotificationConnector, OutputConnector,
    ProcessActivity, RepositoryConnector,
};
use crate::models::{DocumentOutcome, JobDescription, JobId, Outcome};
use crate::scheduler::lock;

/// Repository connector serving a fixed set of documents.
pub struct SimulatedConnector {
    id: String,
    batch_size: usize,
    seeds: Mutex<Vec<String>>,
    links: Mutex<HashMap<String, Vec<ChildReference>>>,
    scripted: Mutex<HashMap<String, VecDeque<DocumentOutcome>>>,
    seeding: Mutex<VecDeque<Outcome<Vec<String>>>>,
    fetched: Mutex<Vec<String>>,
}

impl SimulatedConnector {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            batch_size: 1,
            seeds: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            seeding: Mutex::new(VecDeque::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_seeds(self, seeds: &[&str]) -> Self {
        self.set_seeds(seeds);
        self
    }

    pub fn set_seeds(&self, seeds: &[&str]) {
        *lock(&self.seeds) = seeds.iter().map(|s| s.to_string()).collect();
    }

    /// Make `parent` produce `child` every time it is processed.
    pub fn add_link(&self, parent: &str, child: ChildReference) {
        lock(&self.links)
            .entry(parent.to_string())
            .or_default()
            .push(child);
    }

    /// Stop `parent` from producing links.
    pub fn clear_links(&self, parent: &str) {
        lock(&self.links).remove(parent);
    }

    /// Queue an outcome for the next processing of `document`.
    pub fn script(&self, document: &str, outcome: DocumentOutcome) {
        lock(&self.scripted)
            .entry(document.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Queue an outcome for the next seeding call.
    pub fn script_seeding(&self, outcome: Outcome<Vec<String>>) {
        lock(&self.seeding).push_back(outcome);
    }

    /// Every document processed so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        lock(&self.fetched).clone()
    }
}

#[async_trait]
impl RepositoryConnector for SimulatedConnector {
    fn connector_id(&self) -> &str {
        &self.id
    }

    fn bin_names(&self, document_identifier: &str) -> Vec<String> {
        host_bin_names(document_identifier)
    }

    fn max_documents_per_batch(&self) -> usize {
        self.batch_size
    }

    async fn seed_documents(
        &self,
        _job: &JobDescription,
        _since_ms: Option<i64>,
        _now_ms: i64,
    ) -> Outcome<Vec<String>> {
        if let Some(outcome) = lock(&self.seeding).pop_front() {
            return outcome;
        }
        Outcome::Success(lock(&self.seeds).clone())
    }

    async fn process_documents(
        &self,
        _job: &JobDescription,
        documents: &[DocumentDescription],
        activity: &ProcessActivity,
    ) -> Vec<DocumentOutcome> {
        let mut outcomes = Vec::with_capacity(documents.len());
        for document in documents {
            let identifier = &document.document_identifier;
            lock(&self.fetched).push(identifier.clone());

            let children = lock(&self.links).get(identifier).cloned().unwrap_or_default();
            for child in children {
                activity.add_document_reference(identifier, child);
            }

            let scripted = lock(&self.scripted)
                .get_mut(identifier)
                .and_then(|queue| queue.pop_front());
            outcomes.push(scripted.unwrap_or_else(|| DocumentOutcome::processed("v1")));
        }
        outcomes
    }
}

/// Output connector that remembers removals.
pub struct RecordingOutput {
    id: String,
    removed: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<Outcome<()>>>,
}

impl RecordingOutput {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            removed: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Fail the next removal with `outcome`.
    pub fn script(&self, outcome: Outcome<()>) {
        lock(&self.failures).push_back(outcome);
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }
}

#[async_trait]
impl OutputConnector for RecordingOutput {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn remove_document(&self, _job: &JobDescription, document_identifier: &str) -> Outcome<()> {
        if let Some(outcome) = lock(&self.failures).pop_front() {
            return outcome;
        }
        lock(&self.removed).push(document_identifier.to_string());
        Outcome::Success(())
    }
}

/// Notification connector that remembers finished jobs.
pub struct RecordingNotifier {
    id: String,
    finished: Mutex<Vec<JobId>>,
}

impl RecordingNotifier {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn finished(&self) -> Vec<JobId> {
        lock(&self.finished).clone()
    }
}

#[async_trait]
impl NotificationConnector for RecordingNotifier {
    fn connector_id(&self) -> &str {
        &self.id
    }

    async fn job_finished(&self, job: &JobDescription) -> Outcome<()> {
        lock(&self.finished).push(job.id);
        Outcome::Success(())
    }
}
