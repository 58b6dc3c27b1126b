//! Parent/child bookkeeping rows: carry-down data, intrinsic links and hop distances.

use serde::{Deserialize, Serialize};

use super::JobId;

/// State of a carry-down or link row relative to the processing pass that touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Committed by an earlier, finished pass.
    Base,
    /// Inserted by a pass that has not finished yet.
    New,
    /// Committed earlier and re-seen by the current pass.
    Existing,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Base => "B",
            LinkState::New => "N",
            LinkState::Existing => "E",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "B" => Some(LinkState::Base),
            "N" => Some(LinkState::New),
            "E" => Some(LinkState::Existing),
            _ => None,
        }
    }
}

/// Data propagated from a parent document to a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrydownRecord {
    pub job_id: JobId,
    pub parent_hash: String,
    pub child_hash: String,
    pub data_name: String,
    pub value_hash: String,
    pub value: String,
    pub state: LinkState,
    pub process_id: Option<String>,
}

impl CarrydownRecord {
    /// Uniqueness key within a job.
    pub fn key(&self) -> (String, String, String, String) {
        (
            self.parent_hash.clone(),
            self.child_hash.clone(),
            self.data_name.clone(),
            self.value_hash.clone(),
        )
    }
}

/// Typed parent to child link used for hop counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub job_id: JobId,
    pub link_type: String,
    pub parent_hash: String,
    pub child_hash: String,
    pub state: LinkState,
    pub process_id: Option<String>,
}

impl LinkRecord {
    pub fn key(&self) -> (String, String, String) {
        (
            self.link_type.clone(),
            self.parent_hash.clone(),
            self.child_hash.clone(),
        )
    }
}

/// Shortest distance from the job's seeds to a document, counted in links of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopcountRecord {
    pub job_id: JobId,
    pub link_type: String,
    pub doc_hash: String,
    pub distance: u32,
}
