//! Hop-count distances over intrinsic links.
//!
//! For every link type a job limits, each document carries its shortest
//! distance from the job's seeds. A link of type `t` costs one hop toward
//! the `t` distance and nothing toward the others, so every distance is a
//! 0-1 shortest path. Adding a link can only shorten distances and is
//! handled incrementally; removing links recomputes the whole job.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::debug;

use crate::error::SchedulerResult;
use crate::models::{
    HopcountMode, HopcountRecord, JobDescription, JobId, LinkRecord, LinkState, SeedStatus,
};
use crate::store::{EdgeQuery, EntryQuery, StoreTxn};

/// Link type recorded for references that carry none.
pub const UNTYPED_LINK: &str = "";

fn hop_cost(link_type: &str, counted_type: &str) -> u32 {
    u32::from(link_type == counted_type)
}

/// Count of links newly inserted; existing rows are marked re-seen.
pub fn record_link(
    txn: &mut dyn StoreTxn,
    job_id: JobId,
    link_type: &str,
    parent_hash: &str,
    child_hash: &str,
    process_id: &str,
) -> SchedulerResult<bool> {
    let query = EdgeQuery::for_job(job_id)
        .parents(&[parent_hash.to_string()])
        .children(&[child_hash.to_string()]);
    let existing = txn
        .query_links(&query)?
        .into_iter()
        .find(|link| link.link_type == link_type);

    match existing {
        Some(mut link) => {
            if link.state == LinkState::Base {
                link.state = LinkState::Existing;
                link.process_id = Some(process_id.to_string());
                txn.save_link(&link)?;
            }
            Ok(false)
        }
        None => {
            txn.save_link(&LinkRecord {
                job_id,
                link_type: link_type.to_string(),
                parent_hash: parent_hash.to_string(),
                child_hash: child_hash.to_string(),
                state: LinkState::New,
                process_id: Some(process_id.to_string()),
            })?;
            Ok(true)
        }
    }
}

fn distance(txn: &mut dyn StoreTxn, job_id: JobId, link_type: &str, doc_hash: &str) -> SchedulerResult<Option<u32>> {
    Ok(txn
        .load_hopcounts(job_id, doc_hash)?
        .into_iter()
        .find(|record| record.link_type == link_type)
        .map(|record| record.distance))
}

/// Lower `start`'s distance to `start_distance` and propagate along outgoing links.
fn lower_from(
    txn: &mut dyn StoreTxn,
    job_id: JobId,
    counted_type: &str,
    start: &str,
    start_distance: u32,
) -> SchedulerResult<()> {
    let mut queue = VecDeque::from([(start.to_string(), start_distance)]);
    while let Some((doc_hash, candidate)) = queue.pop_front() {
        if let Some(current) = distance(txn, job_id, counted_type, &doc_hash)? {
            if current <= candidate {
                continue;
            }
        }
        txn.save_hopcount(&HopcountRecord {
            job_id,
            link_type: counted_type.to_string(),
            doc_hash: doc_hash.clone(),
            distance: candidate,
        })?;
        let outgoing = txn.query_links(&EdgeQuery::for_job(job_id).parents(&[doc_hash]))?;
        for link in outgoing {
            let next = candidate + hop_cost(&link.link_type, counted_type);
            if next == candidate {
                queue.push_front((link.child_hash, next));
            } else {
                queue.push_back((link.child_hash, next));
            }
        }
    }
    Ok(())
}

/// A seed sits at distance zero for every limited link type.
pub fn add_seed(txn: &mut dyn StoreTxn, job: &JobDescription, doc_hash: &str) -> SchedulerResult<()> {
    for counted_type in job.hop_limits.keys() {
        lower_from(txn, job.id, counted_type, doc_hash, 0)?;
    }
    Ok(())
}

/// Shorten distances reachable through a newly recorded link.
pub fn add_link(
    txn: &mut dyn StoreTxn,
    job: &JobDescription,
    link_type: &str,
    parent_hash: &str,
    child_hash: &str,
) -> SchedulerResult<()> {
    for counted_type in job.hop_limits.keys() {
        if let Some(parent_distance) = distance(txn, job.id, counted_type, parent_hash)? {
            let candidate = parent_distance + hop_cost(link_type, counted_type);
            lower_from(txn, job.id, counted_type, child_hash, candidate)?;
        }
    }
    Ok(())
}

/// Recompute every distance of a job from its seeds and current links.
pub fn recompute_job(txn: &mut dyn StoreTxn, job: &JobDescription) -> SchedulerResult<()> {
    let links = txn.query_links(&EdgeQuery::for_job(job.id))?;
    let seeds: Vec<String> = txn
        .query_entries(&EntryQuery {
            seed_statuses: vec![SeedStatus::Seed, SeedStatus::NewSeed],
            ..EntryQuery::for_job(job.id)
        })?
        .into_iter()
        .map(|entry| entry.doc_hash)
        .collect();

    let mut adjacency: HashMap<&str, Vec<&LinkRecord>> = HashMap::new();
    for link in &links {
        adjacency.entry(link.parent_hash.as_str()).or_default().push(link);
    }

    txn.delete_job_hopcounts(job.id)?;
    let mut written = 0usize;
    for counted_type in job.hop_limits.keys() {
        let mut distances: HashMap<&str, u32> = HashMap::new();
        let mut queue: VecDeque<(&str, u32)> = seeds.iter().map(|s| (s.as_str(), 0)).collect();
        while let Some((doc_hash, candidate)) = queue.pop_front() {
            if distances.get(doc_hash).is_some_and(|&d| d <= candidate) {
                continue;
            }
            distances.insert(doc_hash, candidate);
            for link in adjacency.get(doc_hash).into_iter().flatten() {
                let next = candidate + hop_cost(&link.link_type, counted_type);
                if next == candidate {
                    queue.push_front((link.child_hash.as_str(), next));
                } else {
                    queue.push_back((link.child_hash.as_str(), next));
                }
            }
        }
        for (doc_hash, distance) in distances {
            txn.save_hopcount(&HopcountRecord {
                job_id: job.id,
                link_type: counted_type.clone(),
                doc_hash: doc_hash.to_string(),
                distance,
            })?;
            written += 1;
        }
    }
    debug!(
        "Recomputed hop counts for job {}: {} links, {} distances",
        job.id,
        links.len(),
        written
    );
    Ok(())
}

/// Commit the links of finished parents. Returns whether any link was removed.
pub fn finish_links(
    txn: &mut dyn StoreTxn,
    job: &JobDescription,
    parent_hashes: &[String],
) -> SchedulerResult<bool> {
    let query = EdgeQuery::for_job(job.id).parents(parent_hashes);
    let removed = if job.hopcount_mode == HopcountMode::Accurate {
        txn.delete_links(&query.clone().states(&[LinkState::Base]))?
    } else {
        0
    };
    for mut link in txn.query_links(&query.states(&[LinkState::New, LinkState::Existing]))? {
        link.state = LinkState::Base;
        link.process_id = None;
        txn.save_link(&link)?;
    }
    Ok(removed > 0)
}

/// Roll back the provisional links of parents. Returns whether any link was removed.
pub fn revert_links(
    txn: &mut dyn StoreTxn,
    job_id: JobId,
    parent_hashes: &[String],
) -> SchedulerResult<bool> {
    revert_matching(txn, EdgeQuery::for_job(job_id).parents(parent_hashes))
}

/// Roll back every provisional link a process wrote in a job.
pub fn revert_process_links(txn: &mut dyn StoreTxn, job_id: JobId, process_id: &str) -> SchedulerResult<bool> {
    revert_matching(txn, EdgeQuery::for_job(job_id).process(process_id))
}

/// Roll back all provisional links of a job.
pub fn revert_all_links(txn: &mut dyn StoreTxn, job_id: JobId) -> SchedulerResult<bool> {
    revert_matching(txn, EdgeQuery::for_job(job_id))
}

fn revert_matching(txn: &mut dyn StoreTxn, query: EdgeQuery) -> SchedulerResult<bool> {
    let removed = txn.delete_links(&query.clone().states(&[LinkState::New]))?;
    for mut link in txn.query_links(&query.states(&[LinkState::Existing]))? {
        link.state = LinkState::Base;
        link.process_id = None;
        txn.save_link(&link)?;
    }
    Ok(removed > 0)
}

/// Drop a document's outgoing links and its own distances. Returns whether any link was removed.
///
/// Only accurate counting forgets them; the other modes keep distances from shrinking back.
pub fn remove_document(txn: &mut dyn StoreTxn, job: &JobDescription, doc_hash: &str) -> SchedulerResult<bool> {
    if job.hopcount_mode != HopcountMode::Accurate {
        return Ok(false);
    }
    let removed = txn.delete_links(&EdgeQuery::for_job(job.id).parents(&[doc_hash.to_string()]))?;
    for counted_type in job.hop_limits.keys() {
        txn.delete_hopcount(job.id, counted_type, doc_hash)?;
    }
    Ok(removed > 0)
}

/// Current distances of a document, by limited link type.
pub fn distances(txn: &mut dyn StoreTxn, job_id: JobId, doc_hash: &str) -> SchedulerResult<BTreeMap<String, u32>> {
    Ok(txn
        .load_hopcounts(job_id, doc_hash)?
        .into_iter()
        .map(|record| (record.link_type, record.distance))
        .collect())
}

/// Whether a document is too far from the seeds, or not reachable at all.
pub fn exceeds_limits(txn: &mut dyn StoreTxn, job: &JobDescription, doc_hash: &str) -> SchedulerResult<bool> {
    if !job.tracks_hopcount() {
        return Ok(false);
    }
    let current = distances(txn, job.id, doc_hash)?;
    Ok(job
        .hop_limits
        .iter()
        .any(|(link_type, limit)| current.get(link_type).map_or(true, |d| d > limit)))
}
