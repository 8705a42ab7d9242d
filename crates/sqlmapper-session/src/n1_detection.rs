//! N+1 query detection.
//!
//! Loading N owners and then resolving a lazy relationship on each of them
//! issues N+1 statements where two would do. The session records every
//! access-time load here and warns once per relationship when the count
//! crosses the configured threshold.

use std::collections::HashMap;
use std::panic::Location;

/// Where an access-time load was triggered.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub table: String,
    pub relationship: String,
    pub file: &'static str,
    pub line: u32,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct N1Stats {
    /// Total number of access-time loads recorded
    pub total_loads: usize,
    /// Number of distinct relationships loaded
    pub relationships_loaded: usize,
    /// Relationships at or above the threshold
    pub potential_n1: usize,
}

/// Counts access-time loads per `(table, relationship)`.
#[derive(Debug)]
pub struct N1QueryTracker {
    counts: HashMap<(String, String), usize>,
    threshold: usize,
    call_sites: Vec<CallSite>,
}

impl N1QueryTracker {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
            call_sites: Vec::new(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one load at the caller's location.
    #[track_caller]
    pub fn record_load(&mut self, table: &str, relationship: &str) {
        self.record_load_at(table, relationship, Location::caller());
    }

    /// Record one load triggered at `site`; warns when the count reaches the
    /// threshold.
    pub fn record_load_at(
        &mut self,
        table: &str,
        relationship: &str,
        site: &'static Location<'static>,
    ) {
        let count = self
            .counts
            .entry((table.to_string(), relationship.to_string()))
            .or_insert(0);
        *count += 1;
        let count = *count;

        self.call_sites.push(CallSite {
            table: table.to_string(),
            relationship: relationship.to_string(),
            file: site.file(),
            line: site.line(),
        });

        if count == self.threshold {
            self.emit_warning(table, relationship, count);
        }
    }

    fn emit_warning(&self, table: &str, relationship: &str, count: usize) {
        tracing::warn!(
            target: "sqlmapper::n1",
            table = table,
            relationship = relationship,
            queries = count,
            threshold = self.threshold,
            "N+1 query pattern detected; consider a join, subquery or batched-in strategy"
        );

        for (i, site) in self
            .call_sites
            .iter()
            .filter(|s| s.table == table && s.relationship == relationship)
            .take(5)
            .enumerate()
        {
            tracing::debug!(
                target: "sqlmapper::n1",
                index = i,
                file = site.file,
                line = site.line,
                "  [{}] {}:{}",
                i,
                site.file,
                site.line
            );
        }
    }

    /// Forget all counts. The session calls this when a transaction ends.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.call_sites.clear();
    }

    #[must_use]
    pub fn count_for(&self, table: &str, relationship: &str) -> usize {
        self.counts
            .get(&(table.to_string(), relationship.to_string()))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> N1Stats {
        N1Stats {
            total_loads: self.counts.values().sum(),
            relationships_loaded: self.counts.len(),
            potential_n1: self
                .counts
                .values()
                .filter(|&&c| c >= self.threshold)
                .count(),
        }
    }

    #[must_use]
    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_per_relationship() {
        let mut tracker = N1QueryTracker::new(10);
        tracker.record_load("heroes", "team");
        tracker.record_load("heroes", "team");
        tracker.record_load("heroes", "powers");
        tracker.record_load("teams", "heroes");

        assert_eq!(tracker.count_for("heroes", "team"), 2);
        assert_eq!(tracker.count_for("heroes", "powers"), 1);
        assert_eq!(tracker.count_for("teams", "heroes"), 1);
        assert_eq!(tracker.count_for("teams", "missing"), 0);
    }

    #[test]
    fn test_stats_potential_n1() {
        let mut tracker = N1QueryTracker::new(2);
        tracker.record_load("heroes", "team");
        tracker.record_load("heroes", "team");
        tracker.record_load("heroes", "powers");

        assert_eq!(
            tracker.stats(),
            N1Stats {
                total_loads: 3,
                relationships_loaded: 2,
                potential_n1: 1,
            }
        );
    }

    #[test]
    fn test_callsite_captures_location() {
        let mut tracker = N1QueryTracker::new(3);
        tracker.record_load("heroes", "team");

        let site = &tracker.call_sites()[0];
        assert_eq!(site.relationship, "team");
        assert!(site.file.contains("n1_detection.rs"));
        assert!(site.line > 0);
    }

    #[test]
    fn test_callsite_uses_given_location() {
        let mut tracker = N1QueryTracker::new(3);
        let here = Location::caller();
        tracker.record_load_at("heroes", "team", here);

        let site = &tracker.call_sites()[0];
        assert_eq!(site.file, here.file());
        assert_eq!(site.line, here.line());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = N1QueryTracker::new(3);
        tracker.record_load("heroes", "team");
        tracker.reset();
        assert_eq!(tracker.stats(), N1Stats::default());
        assert!(tracker.call_sites().is_empty());
    }
}
