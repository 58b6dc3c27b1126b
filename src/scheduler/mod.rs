//! In-process scheduling structures.
//!
//! Everything here is local to one process: the priority engine, fetch-rate
//! history, throttle tables and the scratch pools of a stuffing pass. The
//! cluster-shared parts (bin counters, the sweep lease and the cluster
//! watermark) are reached through the store by [`ReprioritizationTracker`].
//! A single [`SchedulerContext`] owns one instance of each and is handed to
//! every caller explicitly.

pub mod blocking;
pub mod performance;
pub mod queue_tracker;
pub mod reprioritization;
pub mod throttle;

pub use blocking::{BlockedDocument, BlockingDocuments, DepthStatistics};
pub use performance::PerformanceStatistics;
pub use queue_tracker::{BinCounter, LocalBinCounts, QueueTracker};
pub use reprioritization::{ReprioritizationTracker, SharedBinCounter};
pub use throttle::{BinBudget, BinThrottleLimits};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::info;

use crate::config::Settings;
use crate::connectors::{ConnectorRegistry, RepositoryConnector};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::RepositoryConnection;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A configured connection with its compiled throttle table.
#[derive(Debug)]
pub struct ConnectionLimits {
    pub connection: RepositoryConnection,
    pub limits: BinThrottleLimits,
}

impl ConnectionLimits {
    pub fn new(connection: RepositoryConnection) -> Self {
        let limits = BinThrottleLimits::new(&connection.throttles);
        Self { connection, limits }
    }

    /// Lowest throttle rate (fetches/ms) among a document's bins.
    pub fn min_rate(&self, bins: &[String]) -> f64 {
        bins.iter()
            .map(|bin| self.limits.max_fetch_rate(bin))
            .fold(f64::INFINITY, f64::min)
    }
}

/// Per-process scheduler state.
pub struct SchedulerContext {
    pub settings: Settings,
    pub queue_tracker: QueueTracker,
    pub performance: PerformanceStatistics,
    pub reprioritization: ReprioritizationTracker,
    pub blocking: BlockingDocuments,
    pub connectors: ConnectorRegistry,
    connections: RwLock<HashMap<String, Arc<ConnectionLimits>>>,
    budgets: Mutex<HashMap<String, BinBudget>>,
    throttles_changed: AtomicBool,
}

impl SchedulerContext {
    pub fn new(settings: Settings, connectors: ConnectorRegistry) -> Self {
        Self {
            queue_tracker: QueueTracker::with_min_ms_per_fetch(settings.min_ms_per_fetch),
            performance: PerformanceStatistics::with_weights(
                settings.performance_weights.clone(),
                settings.default_fetch_rate,
            ),
            reprioritization: ReprioritizationTracker::new(settings.reprioritization_lease_ms),
            blocking: BlockingDocuments::new(),
            connectors,
            connections: RwLock::new(HashMap::new()),
            budgets: Mutex::new(HashMap::new()),
            throttles_changed: AtomicBool::new(false),
            settings,
        }
    }

    pub fn process_id(&self) -> &str {
        &self.settings.process_id
    }

    /// Register or replace a repository connection.
    pub fn add_connection(&self, connection: RepositoryConnection) {
        let limits = Arc::new(ConnectionLimits::new(connection));
        info!(
            "Registered connection {} ({} throttle rules, {} max connections)",
            limits.connection.name,
            limits.limits.rule_count(),
            limits.connection.max_connections
        );
        let replaced = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(limits.connection.name.clone(), limits);
        // Budgets accrued under the old throttles no longer apply.
        lock(&self.budgets).clear();
        if replaced.is_some() {
            self.throttles_changed.store(true, Ordering::SeqCst);
        }
    }

    /// Whether a connection was replaced since the last call. Waiting
    /// documents carry priorities computed from the old throttles until a
    /// reprioritization sweep runs.
    pub fn take_throttles_changed(&self) -> bool {
        self.throttles_changed.swap(false, Ordering::SeqCst)
    }

    /// Ask for another sweep, e.g. when one could not take the lease.
    pub fn mark_throttles_changed(&self) {
        self.throttles_changed.store(true, Ordering::SeqCst);
    }

    pub fn connection(&self, name: &str) -> SchedulerResult<Arc<ConnectionLimits>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownConnection(name.to_string()))
    }

    /// Repository connector serving a connection.
    pub fn repository_for(&self, connection_name: &str) -> SchedulerResult<Arc<dyn RepositoryConnector>> {
        let connection = self.connection(connection_name)?;
        self.connectors.repository(&connection.connection.connector_id)
    }

    /// Bins a document of the connection belongs to.
    pub fn bins_for(&self, connection_name: &str, document_identifier: &str) -> SchedulerResult<Vec<String>> {
        Ok(self
            .repository_for(connection_name)?
            .bin_names(document_identifier))
    }

    /// Run `f` on the throttle budget of a connection.
    pub fn with_budget<T>(&self, connection_name: &str, f: impl FnOnce(&mut BinBudget) -> T) -> T {
        let mut budgets = lock(&self.budgets);
        f(budgets.entry(connection_name.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::simulated::SimulatedConnector;

    fn context() -> SchedulerContext {
        let mut registry = ConnectorRegistry::new();
        registry.register_repository(Arc::new(SimulatedConnector::new("static")));
        SchedulerContext::new(Settings::default(), registry)
    }

    #[test]
    fn test_unknown_connection() {
        let ctx = context();
        assert!(matches!(
            ctx.connection("missing"),
            Err(SchedulerError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_replacing_connection_flags_throttle_change() {
        let ctx = context();
        ctx.add_connection(RepositoryConnection::new("web", "static"));
        assert!(!ctx.take_throttles_changed());

        ctx.add_connection(RepositoryConnection::new("web", "static").with_throttle("^host-a$", 6.0));
        assert!(ctx.take_throttles_changed());
        assert!(!ctx.take_throttles_changed());
    }

    #[test]
    fn test_connection_bins_and_rates() {
        let ctx = context();
        ctx.add_connection(RepositoryConnection::new("web", "static").with_throttle("^host-a$", 60.0));

        let bins = ctx.bins_for("web", "http://host-a/page").unwrap();
        assert_eq!(bins, vec!["host-a".to_string()]);

        let limits = ctx.connection("web").unwrap();
        assert_eq!(limits.min_rate(&bins), 0.001);
        assert!(limits.min_rate(&["host-b".to_string()]).is_infinite());
    }

    #[test]
    fn test_budgets_are_per_connection() {
        let ctx = context();
        let granted = ctx.with_budget("web", |budget| budget.allowance("host-a", 0.001, 1000, 0));
        assert_eq!(granted, 1);
        ctx.with_budget("web", |budget| budget.spend("host-a"));
        assert_eq!(
            ctx.with_budget("web", |budget| budget.allowance("host-a", 0.001, 1000, 0)),
            0
        );
        assert_eq!(
            ctx.with_budget("other", |budget| budget.allowance("host-a", 0.001, 1000, 0)),
            1
        );
    }
}
