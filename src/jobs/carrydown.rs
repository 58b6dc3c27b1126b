//! Carry-down data: values a parent hands to the children it references.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::SchedulerResult;
use crate::models::{value_hash, CarrydownRecord, JobId, LinkState};
use crate::store::{EdgeQuery, StoreTxn};

/// Record the values a parent passes to one child during the current pass.
///
/// Returns whether any value is new for this (parent, child) pair.
pub fn record(
    txn: &mut dyn StoreTxn,
    job_id: JobId,
    parent_hash: &str,
    child_hash: &str,
    data: &BTreeMap<String, Vec<String>>,
    process_id: &str,
) -> SchedulerResult<bool> {
    if data.is_empty() {
        return Ok(false);
    }
    let existing = txn.query_carrydown(
        &EdgeQuery::for_job(job_id)
            .parents(&[parent_hash.to_string()])
            .children(&[child_hash.to_string()]),
    )?;

    let mut changed = false;
    for (name, values) in data {
        for value in values {
            let hash = value_hash(value);
            let current = existing
                .iter()
                .find(|row| &row.data_name == name && row.value_hash == hash);
            match current {
                Some(row) if row.state == LinkState::Base => {
                    let mut row = row.clone();
                    row.state = LinkState::Existing;
                    row.process_id = Some(process_id.to_string());
                    txn.save_carrydown(&row)?;
                }
                Some(_) => {}
                None => {
                    txn.save_carrydown(&CarrydownRecord {
                        job_id,
                        parent_hash: parent_hash.to_string(),
                        child_hash: child_hash.to_string(),
                        data_name: name.clone(),
                        value_hash: hash,
                        value: value.clone(),
                        state: LinkState::New,
                        process_id: Some(process_id.to_string()),
                    })?;
                    changed = true;
                }
            }
        }
    }
    Ok(changed)
}

/// Commit the carry-down of finished parents.
///
/// Rows the pass did not re-see are dropped. Returns the children whose set
/// of inherited values changed.
pub fn finish(
    txn: &mut dyn StoreTxn,
    job_id: JobId,
    parent_hashes: &[String],
) -> SchedulerResult<BTreeSet<String>> {
    let query = EdgeQuery::for_job(job_id).parents(parent_hashes);
    let rows = txn.query_carrydown(&query)?;
    let changed: BTreeSet<String> = rows
        .iter()
        .filter(|row| matches!(row.state, LinkState::Base | LinkState::New))
        .map(|row| row.child_hash.clone())
        .collect();

    txn.delete_carrydown(&query.states(&[LinkState::Base]))?;
    for mut row in rows.into_iter().filter(|row| row.state != LinkState::Base) {
        row.state = LinkState::Base;
        row.process_id = None;
        txn.save_carrydown(&row)?;
    }
    Ok(changed)
}

/// Roll back the provisional carry-down of parents.
pub fn revert(txn: &mut dyn StoreTxn, job_id: JobId, parent_hashes: &[String]) -> SchedulerResult<()> {
    revert_matching(txn, EdgeQuery::for_job(job_id).parents(parent_hashes))
}

/// Roll back every provisional carry-down row a process wrote in a job.
pub fn revert_process(txn: &mut dyn StoreTxn, job_id: JobId, process_id: &str) -> SchedulerResult<()> {
    revert_matching(txn, EdgeQuery::for_job(job_id).process(process_id))
}

/// Roll back all provisional carry-down of a job, whoever wrote it.
pub fn revert_all(txn: &mut dyn StoreTxn, job_id: JobId) -> SchedulerResult<()> {
    revert_matching(txn, EdgeQuery::for_job(job_id))
}

fn revert_matching(txn: &mut dyn StoreTxn, query: EdgeQuery) -> SchedulerResult<()> {
    txn.delete_carrydown(&query.clone().states(&[LinkState::New]))?;
    for mut row in txn.query_carrydown(&query.states(&[LinkState::Existing]))? {
        row.state = LinkState::Base;
        row.process_id = None;
        txn.save_carrydown(&row)?;
    }
    Ok(())
}

/// Drop everything a removed parent handed down. Returns the affected children.
pub fn remove_parent(txn: &mut dyn StoreTxn, job_id: JobId, parent_hash: &str) -> SchedulerResult<BTreeSet<String>> {
    let query = EdgeQuery::for_job(job_id).parents(&[parent_hash.to_string()]);
    let children = txn
        .query_carrydown(&query)?
        .into_iter()
        .map(|row| row.child_hash)
        .collect();
    txn.delete_carrydown(&query)?;
    Ok(children)
}

/// Every value a document inherits, by data name, de-duplicated across parents.
pub fn values_for(
    txn: &mut dyn StoreTxn,
    job_id: JobId,
    child_hash: &str,
) -> SchedulerResult<BTreeMap<String, Vec<String>>> {
    let mut values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in txn.query_carrydown(&EdgeQuery::for_job(job_id).children(&[child_hash.to_string()]))? {
        values.entry(row.data_name).or_default().insert(row.value);
    }
    Ok(values
        .into_iter()
        .map(|(name, set)| (name, set.into_iter().collect()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, QueueStore};

    fn data(name: &str, values: &[&str]) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(name.to_string(), values.iter().map(|v| v.to_string()).collect())])
    }

    #[test]
    fn test_record_then_finish_is_idempotent() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                assert!(record(txn, 1, "p", "c", &data("acl", &["x"]), "p1")?);
                assert_eq!(finish(txn, 1, &["p".to_string()])?.len(), 1);
                let first = txn.query_carrydown(&EdgeQuery::for_job(1))?;

                // Same values again: nothing new, nothing changed.
                assert!(!record(txn, 1, "p", "c", &data("acl", &["x"]), "p1")?);
                assert!(finish(txn, 1, &["p".to_string()])?.is_empty());
                assert_eq!(txn.query_carrydown(&EdgeQuery::for_job(1))?, first);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_finish_drops_values_not_reseen() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                record(txn, 1, "p", "c", &data("acl", &["x", "y"]), "p1")?;
                finish(txn, 1, &["p".to_string()])?;

                record(txn, 1, "p", "c", &data("acl", &["x"]), "p1")?;
                let changed = finish(txn, 1, &["p".to_string()])?;
                assert!(changed.contains("c"));
                assert_eq!(values_for(txn, 1, "c")?, data("acl", &["x"]));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_revert_restores_committed_rows() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                record(txn, 1, "p", "c", &data("acl", &["x"]), "p1")?;
                finish(txn, 1, &["p".to_string()])?;
                let before = txn.query_carrydown(&EdgeQuery::for_job(1))?;

                record(txn, 1, "p", "c", &data("acl", &["x", "z"]), "p1")?;
                record(txn, 1, "p", "d", &data("acl", &["x"]), "p1")?;
                revert(txn, 1, &["p".to_string()])?;
                assert_eq!(txn.query_carrydown(&EdgeQuery::for_job(1))?, before);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_values_merge_across_parents() {
        let store = MemoryStore::new();
        store
            .transaction(&mut |txn| {
                record(txn, 1, "p", "c", &data("acl", &["x"]), "p1")?;
                record(txn, 1, "q", "c", &data("acl", &["x", "w"]), "p1")?;
                assert_eq!(values_for(txn, 1, "c")?, data("acl", &["w", "x"]));
                Ok(())
            })
            .unwrap();
    }
}
