//! Connector capability traits and the registry that resolves them.
//!
//! The scheduler never depends on a concrete connector. Repository,
//! output and notification connectors register under a stable id and are
//! looked up through [`ConnectorRegistry`] when a connection or job names
//! them.

pub mod simulated;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{DocumentOutcome, JobDescription, JobId, Outcome};
use crate::scheduler::lock;

/// A document handed to a repository connector for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDescription {
    pub job_id: JobId,
    pub doc_hash: String,
    pub document_identifier: String,
    /// Version recorded by the previous successful fetch.
    pub last_version: Option<String>,
    /// Carry-down data from every current parent, by data name.
    pub carrydown: BTreeMap<String, Vec<String>>,
    pub bins: Vec<String>,
    pub fail_count: u32,
}

/// A child discovered while processing a document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChildReference {
    pub document_identifier: String,
    /// Relationship type; typed links count toward hop limits.
    pub link_type: Option<String>,
    /// Data carried from the parent, by data name.
    pub carrydown: BTreeMap<String, Vec<String>>,
    /// Earliest time the child should be fetched. Rediscovery may move a
    /// waiting child earlier, never later.
    pub check_time: Option<i64>,
}

impl ChildReference {
    pub fn new(document_identifier: &str) -> Self {
        Self {
            document_identifier: document_identifier.to_string(),
            ..Default::default()
        }
    }

    pub fn with_link_type(mut self, link_type: &str) -> Self {
        self.link_type = Some(link_type.to_string());
        self
    }

    pub fn with_check_time(mut self, check_time_ms: i64) -> Self {
        self.check_time = Some(check_time_ms);
        self
    }

    pub fn with_carrydown(mut self, name: &str, value: &str) -> Self {
        self.carrydown
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }
}

/// Answers whether a job may keep working.
pub trait JobActivityProbe: Send + Sync {
    fn check_job_still_active(&self, job_id: JobId) -> SchedulerResult<()>;
}

/// Handle a repository connector uses while processing one batch.
pub struct ProcessActivity {
    job_id: JobId,
    probe: Option<Arc<dyn JobActivityProbe>>,
    references: Mutex<BTreeMap<String, Vec<ChildReference>>>,
}

impl ProcessActivity {
    pub fn new(job_id: JobId, probe: Arc<dyn JobActivityProbe>) -> Self {
        Self {
            job_id,
            probe: Some(probe),
            references: Mutex::new(BTreeMap::new()),
        }
    }

    /// Activity that never reports the job as stopped.
    pub fn detached(job_id: JobId) -> Self {
        Self {
            job_id,
            probe: None,
            references: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record a child of `parent_identifier`. Kept only if the parent's processing completes.
    pub fn add_document_reference(&self, parent_identifier: &str, child: ChildReference) {
        lock(&self.references)
            .entry(parent_identifier.to_string())
            .or_default()
            .push(child);
    }

    /// Fails with [`SchedulerError::JobNotActive`] once the job was paused or aborted.
    pub async fn check_job_still_active(&self) -> SchedulerResult<()> {
        let Some(probe) = self.probe.clone() else {
            return Ok(());
        };
        let job_id = self.job_id;
        tokio::task::spawn_blocking(move || probe.check_job_still_active(job_id)).await?
    }

    /// Take every recorded reference, keyed by parent identifier.
    pub fn take_references(&self) -> BTreeMap<String, Vec<ChildReference>> {
        std::mem::take(&mut *lock(&self.references))
    }
}

/// Source of documents.
#[async_trait]
pub trait RepositoryConnector: Send + Sync {
    /// Stable id connections refer to.
    fn connector_id(&self) -> &str;

    /// Throttling bins of a document.
    fn bin_names(&self, document_identifier: &str) -> Vec<String>;

    fn max_documents_per_batch(&self) -> usize {
        1
    }

    /// Seed identifiers of a job. `since_ms` is the start of the last
    /// successful seeding pass, if any.
    async fn seed_documents(
        &self,
        job: &JobDescription,
        since_ms: Option<i64>,
        now_ms: i64,
    ) -> Outcome<Vec<String>>;

    /// Fetch and process a batch; one outcome per document, in order.
    async fn process_documents(
        &self,
        job: &JobDescription,
        documents: &[DocumentDescription],
        activity: &ProcessActivity,
    ) -> Vec<DocumentOutcome>;
}

/// Target that received processed documents.
#[async_trait]
pub trait OutputConnector: Send + Sync {
    fn connector_id(&self) -> &str;

    async fn remove_document(&self, job: &JobDescription, document_identifier: &str) -> Outcome<()>;
}

/// Receiver of job lifecycle notifications.
#[async_trait]
pub trait NotificationConnector: Send + Sync {
    fn connector_id(&self) -> &str;

    async fn job_finished(&self, job: &JobDescription) -> Outcome<()>;
}

/// Connectors by stable id.
#[derive(Default)]
pub struct ConnectorRegistry {
    repositories: HashMap<String, Arc<dyn RepositoryConnector>>,
    outputs: HashMap<String, Arc<dyn OutputConnector>>,
    notifications: HashMap<String, Arc<dyn NotificationConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_repository(&mut self, connector: Arc<dyn RepositoryConnector>) {
        self.repositories
            .insert(connector.connector_id().to_string(), connector);
    }

    pub fn register_output(&mut self, connector: Arc<dyn OutputConnector>) {
        self.outputs
            .insert(connector.connector_id().to_string(), connector);
    }

    pub fn register_notification(&mut self, connector: Arc<dyn NotificationConnector>) {
        self.notifications
            .insert(connector.connector_id().to_string(), connector);
    }

    pub fn repository(&self, id: &str) -> SchedulerResult<Arc<dyn RepositoryConnector>> {
        self.repositories
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownConnector(id.to_string()))
    }

    pub fn output(&self, id: &str) -> SchedulerResult<Arc<dyn OutputConnector>> {
        self.outputs
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownConnector(id.to_string()))
    }

    pub fn notification(&self, id: &str) -> SchedulerResult<Arc<dyn NotificationConnector>> {
        self.notifications
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownConnector(id.to_string()))
    }
}

/// Host-name bin of a URL identifier; identifiers that are not URLs have no bins.
pub fn host_bin_names(document_identifier: &str) -> Vec<String> {
    Url::parse(document_identifier)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_lowercase()))
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_bin_names() {
        assert_eq!(host_bin_names("https://Host-A.example/x?y=1"), vec!["host-a.example"]);
        assert_eq!(host_bin_names("http://host-b:8080/"), vec!["host-b"]);
        assert!(host_bin_names("not a url").is_empty());
    }

    #[test]
    fn test_child_reference_builder() {
        let child = ChildReference::new("http://a/1")
            .with_link_type("link")
            .with_carrydown("title", "x")
            .with_carrydown("title", "y");
        assert_eq!(child.link_type.as_deref(), Some("link"));
        assert_eq!(child.carrydown["title"], vec!["x", "y"]);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ConnectorRegistry::new();
        registry.register_repository(Arc::new(simulated::SimulatedConnector::new("sim")));
        assert!(registry.repository("sim").is_ok());
        assert!(matches!(
            registry.repository("nope"),
            Err(SchedulerError::UnknownConnector(_))
        ));
        assert!(registry.output("sim").is_err());
    }

    #[tokio::test]
    async fn test_activity_collects_references() {
        let activity = ProcessActivity::detached(7);
        activity.add_document_reference("http://a/", ChildReference::new("http://a/1"));
        activity.add_document_reference("http://a/", ChildReference::new("http://a/2"));
        assert!(activity.check_job_still_active().await.is_ok());

        let references = activity.take_references();
        assert_eq!(references["http://a/"].len(), 2);
        assert!(activity.take_references().is_empty());
    }

    struct Stopped;

    impl JobActivityProbe for Stopped {
        fn check_job_still_active(&self, job_id: JobId) -> SchedulerResult<()> {
            Err(SchedulerError::JobNotActive(job_id))
        }
    }

    #[tokio::test]
    async fn test_activity_reports_stopped_job() {
        let activity = ProcessActivity::new(3, Arc::new(Stopped));
        assert!(matches!(
            activity.check_job_still_active().await,
            Err(SchedulerError::JobNotActive(3))
        ));
    }
}
