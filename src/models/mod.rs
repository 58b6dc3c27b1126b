//! Domain types shared by the scheduler, the store and the runtime.

mod connection;
mod job;
mod links;
mod outcome;
mod queue_entry;

pub use connection::{RepositoryConnection, ThrottleSpec};
pub use job::{JobDescription, JobError, JobErrorKind, JobRecord, JobStatus, JobType, HopcountMode, SeedingState};
pub use links::{CarrydownRecord, HopcountRecord, LinkRecord, LinkState};
pub use outcome::{DocumentOutcome, Outcome, ServiceInterruption};
pub use queue_entry::{QueueEntry, QueueStatus, SeedStatus};

use sha2::{Digest, Sha256};

/// Job identifier.
pub type JobId = i64;

/// Hash a document identifier into the key used by every queue table.
pub fn document_hash(document_identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_identifier.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a carry-down value so rows can be de-duplicated on a fixed-width key.
pub fn value_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"carrydown:");
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
