//! Commit-log optimizer
//!
//! Rebuilds the scan acceleration of every commit reachable from the given
//! heads. History is cut into segments at heads and fork points; each segment
//! runs from its start commit down to (exclusive) the next fork point or the
//! root, so shared history is walked once no matter how many branches lead
//! through it.
//!
//! Segments run bases-first: a segment starts from the final key state of the
//! segment below its base. Each segment computes all of its new accelerations
//! before the first write, then writes them with one compare-and-swap per
//! commit. A failed segment fails every segment stacked on it and leaves all
//! other segments untouched.

use crate::error::{TransferError, TransferResult};
use lakeref_core::{
    AdapterConfig, CommitLogEntry, DatabaseAdapter, Hash, HeadsAndForks, ParentState,
    ScanAcceleration,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Optimizer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeOptions {
    /// Compute everything but write nothing
    pub dry_run: bool,
}

impl OptimizeOptions {
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Summary of an optimizer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeResult {
    pub segments: usize,
    pub commits_walked: u64,
    /// Commits whose acceleration changed (would change, for dry runs)
    pub commits_rewritten: u64,
}

/// A segment the optimizer could not process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub start: Hash,
    pub reason: String,
}

impl std::fmt::Display for SegmentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "segment at {}: {}", self.start.short(), self.reason)
    }
}

struct Segment {
    start: Hash,
    base: Hash,
    /// Newest first
    commits: Vec<CommitLogEntry>,
}

/// Rebuild scan acceleration for the segments given by `heads_and_forks`
pub fn optimize_commit_log<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    heads_and_forks: &HeadsAndForks,
    options: &OptimizeOptions,
) -> TransferResult<OptimizeResult> {
    let config = adapter.config().clone();
    let forks = &heads_and_forks.fork_points;
    let starts: BTreeSet<Hash> = heads_and_forks
        .heads
        .iter()
        .chain(forks.iter())
        .copied()
        .collect();

    let mut failures = Vec::new();
    let mut by_base: HashMap<Hash, Vec<Segment>> = HashMap::new();
    for start in &starts {
        match walk_segment(adapter, *start, forks) {
            Ok(segment) => by_base.entry(segment.base).or_default().push(segment),
            Err(reason) => failures.push(SegmentFailure {
                start: *start,
                reason,
            }),
        }
    }

    let mut result = OptimizeResult::default();
    let root = Hash::no_ancestor();
    let mut ready: VecDeque<(Hash, ParentState)> = VecDeque::from([(root, ParentState::root())]);

    while let Some((base, base_state)) = ready.pop_front() {
        let Some(segments) = by_base.remove(&base) else {
            continue;
        };
        for segment in segments {
            let start = segment.start;
            match optimize_segment(adapter, segment, base_state.clone(), &config, options) {
                Ok((state, walked, rewritten)) => {
                    result.segments += 1;
                    result.commits_walked += walked;
                    result.commits_rewritten += rewritten;
                    tracing::debug!(
                        "optimized segment {} ({} commits, {} rewritten)",
                        start.short(),
                        walked,
                        rewritten
                    );
                    if forks.contains(&start) {
                        ready.push_back((start, state));
                    }
                }
                Err(e) => {
                    tracing::warn!("segment {} failed: {}", start.short(), e);
                    failures.push(SegmentFailure {
                        start,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    // Whatever is left sits on a base that was never reached.
    for segment in by_base.into_values().flatten() {
        failures.push(SegmentFailure {
            start: segment.start,
            reason: format!("base {} was not optimized", segment.base.short()),
        });
    }

    if !failures.is_empty() {
        let listed: Vec<String> = failures.iter().map(ToString::to_string).collect();
        return Err(TransferError::graph_integrity(format!(
            "{} of {} segments failed: {}",
            failures.len(),
            starts.len(),
            listed.join("; ")
        )));
    }

    tracing::info!(
        "optimized {} segments, {} commits walked, {} rewritten{}",
        result.segments,
        result.commits_walked,
        result.commits_rewritten,
        if options.dry_run { " (dry run)" } else { "" }
    );
    Ok(result)
}

// Walk first parents from `start` until a fork point or the root.
fn walk_segment<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    start: Hash,
    forks: &BTreeSet<Hash>,
) -> Result<Segment, String> {
    let mut commits = Vec::new();
    let mut seen = HashSet::new();
    let mut current = start;
    loop {
        if !seen.insert(current) {
            return Err(format!("first-parent cycle at {}", current.short()));
        }
        let entry = adapter
            .fetch_commit(&current)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("commit {} not found", current.short()))?;
        let parent = entry.parent();
        commits.push(entry);
        if parent.is_no_ancestor() || forks.contains(&parent) {
            return Ok(Segment {
                start,
                base: parent,
                commits,
            });
        }
        current = parent;
    }
}

fn optimize_segment<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    segment: Segment,
    base_state: ParentState,
    config: &AdapterConfig,
    options: &OptimizeOptions,
) -> TransferResult<(ParentState, u64, u64)> {
    let walked = segment.commits.len() as u64;
    let mut state = base_state;
    let mut updates: Vec<(Hash, ScanAcceleration, ScanAcceleration)> = Vec::new();

    for entry in segment.commits.into_iter().rev() {
        let (acceleration, next) = state.advance(&entry, config);
        if acceleration != entry.acceleration {
            updates.push((entry.hash, entry.acceleration, acceleration));
        }
        state = next;
    }

    let mut rewritten = 0u64;
    if options.dry_run {
        rewritten = updates.len() as u64;
    } else {
        for (hash, expected, updated) in &updates {
            if adapter.update_acceleration(hash, expected, updated)? {
                rewritten += 1;
            }
        }
    }
    Ok((state, walked, rewritten))
}
