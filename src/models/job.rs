//! Job definitions and persisted job state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::JobId;

/// How a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Crawls once from its seeds and then completes.
    Specified,
    /// Never completes; documents are refetched on a schedule.
    Continuous,
}

/// How hop counts react to link removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HopcountMode {
    /// Recompute distances whenever links are removed.
    #[default]
    Accurate,
    /// Keep stale links so distances never grow.
    NoDelete,
    /// Hop-count tracking disabled.
    NeverDelete,
}

/// Operator-supplied job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub id: JobId,
    pub name: String,
    /// Repository connection documents are fetched through.
    pub connection_name: String,
    /// Output connector id that ingests and removes documents.
    #[serde(default)]
    pub output_connector: Option<String>,
    /// Notification connector ids told when the job ends.
    #[serde(default)]
    pub notification_connectors: Vec<String>,
    pub job_type: JobType,
    #[serde(default)]
    pub hopcount_mode: HopcountMode,
    /// Maximum hops per link type.
    #[serde(default)]
    pub hop_limits: BTreeMap<String, u32>,
    /// Continuous jobs: time between refetches of a processed document.
    #[serde(default)]
    pub rescan_interval_ms: Option<i64>,
    /// Continuous jobs: documents older than this are expired.
    #[serde(default)]
    pub expiration_interval_ms: Option<i64>,
    /// Continuous jobs: time between seeding passes.
    #[serde(default)]
    pub reseed_interval_ms: Option<i64>,
}

impl JobDescription {
    pub fn new(id: JobId, name: &str, connection_name: &str, job_type: JobType) -> Self {
        Self {
            id,
            name: name.to_string(),
            connection_name: connection_name.to_string(),
            output_connector: None,
            notification_connectors: Vec::new(),
            job_type,
            hopcount_mode: HopcountMode::Accurate,
            hop_limits: BTreeMap::new(),
            rescan_interval_ms: None,
            expiration_interval_ms: None,
            reseed_interval_ms: None,
        }
    }

    /// Whether link and distance bookkeeping is required.
    pub fn tracks_hopcount(&self) -> bool {
        !self.hop_limits.is_empty() && self.hopcount_mode != HopcountMode::NeverDelete
    }
}

/// Job run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Inactive,
    Active,
    Paused,
    Error,
    Completed,
    Deleting,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Inactive => "inactive",
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Error => "error",
            JobStatus::Completed => "completed",
            JobStatus::Deleting => "deleting",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(JobStatus::Inactive),
            "active" => Some(JobStatus::Active),
            "paused" => Some(JobStatus::Paused),
            "error" => Some(JobStatus::Error),
            "completed" => Some(JobStatus::Completed),
            "deleting" => Some(JobStatus::Deleting),
            _ => None,
        }
    }
}

/// Category of a job-fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Document failures exhausted their retry budget.
    RetriesExhausted,
    /// A service interruption outlived its deadline.
    DeadlineExceeded,
    /// The connector reported an unrecoverable condition.
    ConnectorFatal,
    /// Seeding could not complete.
    SeedingFailed,
}

/// Operator-visible record of why a job stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    #[serde(default)]
    pub document: Option<String>,
    pub occurred_at_ms: i64,
}

/// Seeding pass bookkeeping for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedingState {
    /// Process running the current seeding pass.
    pub process_id: Option<String>,
    /// When the next seeding pass is due; `None` when none is scheduled.
    pub check_time: Option<i64>,
    pub fail_time: Option<i64>,
    pub fail_count: u32,
    /// Start time of the last successful pass.
    pub last_seeding_ms: Option<i64>,
}

/// Persisted job state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub description: JobDescription,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub seeding: SeedingState,
    pub run_started_ms: Option<i64>,
}

impl JobRecord {
    pub fn new(description: JobDescription) -> Self {
        Self {
            description,
            status: JobStatus::Inactive,
            error: None,
            seeding: SeedingState::default(),
            run_started_ms: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.description.id
    }

    /// Seeding is still owed for the current run.
    pub fn seeding_outstanding(&self) -> bool {
        self.seeding.process_id.is_some()
            || (self.description.job_type == JobType::Specified && self.seeding.check_time.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hopcount_tracking_requires_limits() {
        let mut job = JobDescription::new(1, "crawl", "web", JobType::Specified);
        assert!(!job.tracks_hopcount());
        job.hop_limits.insert("link".into(), 2);
        assert!(job.tracks_hopcount());
        job.hopcount_mode = HopcountMode::NeverDelete;
        assert!(!job.tracks_hopcount());
    }

    #[test]
    fn test_description_json_defaults() {
        let json = r#"{"id":7,"name":"n","connection_name":"web","job_type":"continuous"}"#;
        let job: JobDescription = serde_json::from_str(json).unwrap();
        assert_eq!(job.job_type, JobType::Continuous);
        assert_eq!(job.hopcount_mode, HopcountMode::Accurate);
        assert!(job.hop_limits.is_empty());
    }

    #[test]
    fn test_status_codes() {
        for status in [
            JobStatus::Inactive,
            JobStatus::Active,
            JobStatus::Paused,
            JobStatus::Error,
            JobStatus::Completed,
            JobStatus::Deleting,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
    }
}
