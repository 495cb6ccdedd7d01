//! Whole-graph views over a store: heads, fork points, ordering and checks

use crate::adapter::{DatabaseAdapter, StoreError, StoreResult};
use crate::commit_log::CommitLogEntry;
use crate::hash::Hash;
use crate::model::NamedRefsParams;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Commits without first-parent children, and commits with more than one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsAndForks {
    pub heads: BTreeSet<Hash>,
    pub fork_points: BTreeSet<Hash>,
}

impl HeadsAndForks {
    /// Compute from a scan of every commit
    pub fn compute<I>(entries: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = StoreResult<CommitLogEntry>>,
    {
        let mut all = Vec::new();
        let mut children: HashMap<Hash, u32> = HashMap::new();
        for entry in entries {
            let entry = entry?;
            let parent = entry.parent();
            if !parent.is_no_ancestor() {
                *children.entry(parent).or_default() += 1;
            }
            all.push(entry.hash);
        }

        let heads = all
            .iter()
            .filter(|h| !children.contains_key(*h))
            .copied()
            .collect();
        let fork_points = children
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(hash, _)| hash)
            .collect();
        Ok(Self { heads, fork_points })
    }

    /// Compute for everything stored in `adapter`
    pub fn of_adapter<A: DatabaseAdapter + ?Sized>(adapter: &A) -> StoreResult<Self> {
        Self::compute(adapter.scan_all_commit_log_entries()?)
    }
}

/// Walks first parents from a commit back to the root
pub struct CommitLogWalk<'a, A: DatabaseAdapter + ?Sized> {
    adapter: &'a A,
    next: Hash,
    failed: bool,
}

impl<A: DatabaseAdapter + ?Sized> Iterator for CommitLogWalk<'_, A> {
    type Item = StoreResult<CommitLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next.is_no_ancestor() {
            return None;
        }
        match self.adapter.fetch_commit(&self.next) {
            Ok(Some(entry)) => {
                self.next = entry.parent();
                Some(Ok(entry))
            }
            Ok(None) => {
                self.failed = true;
                Some(Err(StoreError::CommitNotFound(self.next)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// History of `start`, newest first
pub fn commit_log<A: DatabaseAdapter + ?Sized>(adapter: &A, start: Hash) -> CommitLogWalk<'_, A> {
    CommitLogWalk {
        adapter,
        next: start,
        failed: false,
    }
}

/// Order commits so every parent comes before its children
///
/// Ties are broken by hash, so the order only depends on the graph. Parents
/// outside the given set count as already placed.
pub fn topological_order(entries: Vec<CommitLogEntry>) -> StoreResult<Vec<CommitLogEntry>> {
    let present: HashSet<Hash> = entries.iter().map(|e| e.hash).collect();
    let mut pending: HashMap<Hash, usize> = HashMap::with_capacity(entries.len());
    let mut dependents: HashMap<Hash, Vec<Hash>> = HashMap::new();
    let mut by_hash: BTreeMap<Hash, CommitLogEntry> = BTreeMap::new();

    for entry in entries {
        let parents: BTreeSet<Hash> = entry
            .parents
            .iter()
            .filter(|p| present.contains(*p))
            .copied()
            .collect();
        pending.insert(entry.hash, parents.len());
        for parent in parents {
            dependents.entry(parent).or_default().push(entry.hash);
        }
        by_hash.insert(entry.hash, entry);
    }

    let mut ready: BTreeSet<Hash> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(hash, _)| *hash)
        .collect();
    let mut ordered = Vec::with_capacity(by_hash.len());

    while let Some(hash) = ready.pop_first() {
        if let Some(children) = dependents.get(&hash) {
            for child in children {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
        if let Some(entry) = by_hash.remove(&hash) {
            ordered.push(entry);
        }
    }

    if !by_hash.is_empty() {
        return Err(StoreError::Corrupted(format!(
            "commit graph contains a cycle through {} commits",
            by_hash.len()
        )));
    }
    Ok(ordered)
}

/// A structural problem found by [`check_graph`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphProblem {
    HashMismatch { commit: Hash },
    MissingParent { commit: Hash, parent: Hash },
    SequenceMismatch { commit: Hash, expected: u64, actual: u64 },
    DanglingReference { name: String, hash: Hash },
}

impl std::fmt::Display for GraphProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphProblem::HashMismatch { commit } => {
                write!(f, "commit {} does not match its content", commit)
            }
            GraphProblem::MissingParent { commit, parent } => {
                write!(f, "commit {} references missing parent {}", commit, parent)
            }
            GraphProblem::SequenceMismatch {
                commit,
                expected,
                actual,
            } => write!(
                f,
                "commit {} has sequence {}, expected {}",
                commit, actual, expected
            ),
            GraphProblem::DanglingReference { name, hash } => {
                write!(f, "reference {} points at missing commit {}", name, hash)
            }
        }
    }
}

/// Outcome of [`check_graph`]
#[derive(Debug, Clone, Default)]
pub struct GraphReport {
    pub commits: usize,
    pub references: usize,
    pub problems: Vec<GraphProblem>,
}

impl GraphReport {
    pub fn is_healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Verify hashes, parent links, sequence numbers and reference targets
pub fn check_graph<A: DatabaseAdapter + ?Sized>(adapter: &A) -> StoreResult<GraphReport> {
    let mut report = GraphReport::default();
    let mut seqs: HashMap<Hash, u64> = HashMap::new();
    let mut first_parents: Vec<(Hash, Hash, u64)> = Vec::new();

    for entry in adapter.scan_all_commit_log_entries()? {
        let entry = entry?;
        report.commits += 1;
        if !entry.verify_hash() {
            report
                .problems
                .push(GraphProblem::HashMismatch { commit: entry.hash });
        }
        seqs.insert(entry.hash, entry.commit_seq);
        first_parents.push((entry.hash, entry.parent(), entry.commit_seq));
        for parent in entry.additional_parents() {
            if adapter.fetch_commit(parent)?.is_none() && !parent.is_no_ancestor() {
                report.problems.push(GraphProblem::MissingParent {
                    commit: entry.hash,
                    parent: *parent,
                });
            }
        }
    }

    for (commit, parent, actual) in first_parents {
        let parent_seq = if parent.is_no_ancestor() {
            Some(0)
        } else {
            seqs.get(&parent).copied()
        };
        match parent_seq {
            None => report
                .problems
                .push(GraphProblem::MissingParent { commit, parent }),
            Some(seq) if seq + 1 != actual => report.problems.push(GraphProblem::SequenceMismatch {
                commit,
                expected: seq + 1,
                actual,
            }),
            Some(_) => {}
        }
    }

    for info in adapter.named_refs(&NamedRefsParams::default())? {
        let info = info?;
        report.references += 1;
        if !info.hash.is_no_ancestor() && !seqs.contains_key(&info.hash) {
            report.problems.push(GraphProblem::DanglingReference {
                name: info.named_ref.name().to_string(),
                hash: info.hash,
            });
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryAdapter;
    use crate::model::{CommitParams, ContentId, Key, KeyWithBytes, NamedRef};

    fn commit(adapter: &InMemoryAdapter, branch: &str, label: &str) -> Hash {
        adapter
            .commit(CommitParams::new(branch, label.as_bytes().to_vec()).with_put(KeyWithBytes::of(
                Key::of([branch, label]),
                ContentId::of(label),
                0,
                b"x".to_vec(),
            )))
            .unwrap()
    }

    #[test]
    fn test_heads_and_forks() {
        let adapter = InMemoryAdapter::default();
        adapter.initialize_repo("main").unwrap();
        let base = commit(&adapter, "main", "m1");
        adapter.create(&NamedRef::branch("b1"), base).unwrap();
        let main_head = commit(&adapter, "main", "m2");
        let b1_head = commit(&adapter, "b1", "b1");

        let hf = HeadsAndForks::of_adapter(&adapter).unwrap();
        assert_eq!(hf.heads, BTreeSet::from([main_head, b1_head]));
        assert_eq!(hf.fork_points, BTreeSet::from([base]));
    }

    #[test]
    fn test_commit_log_walks_to_root() {
        let adapter = InMemoryAdapter::default();
        adapter.initialize_repo("main").unwrap();
        let h1 = commit(&adapter, "main", "a");
        let h2 = commit(&adapter, "main", "b");

        let log: Vec<Hash> = commit_log(&adapter, h2).map(|e| e.unwrap().hash).collect();
        assert_eq!(log, vec![h2, h1]);
        assert_eq!(commit_log(&adapter, Hash::no_ancestor()).count(), 0);
    }

    #[test]
    fn test_topological_order_puts_parents_first() {
        let adapter = InMemoryAdapter::default();
        adapter.initialize_repo("main").unwrap();
        for label in ["a", "b", "c", "d"] {
            commit(&adapter, "main", label);
        }
        let scanned: Vec<CommitLogEntry> = adapter
            .scan_all_commit_log_entries()
            .unwrap()
            .map(|e| e.unwrap())
            .collect();

        let ordered = topological_order(scanned).unwrap();
        let seqs: Vec<u64> = ordered.iter().map(|e| e.commit_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_check_graph_flags_dangling_parent() {
        let adapter = InMemoryAdapter::default();
        adapter.initialize_repo("main").unwrap();
        commit(&adapter, "main", "a");

        let orphan_parent = Hash::from_data(b"nowhere");
        let mut orphan = adapter
            .scan_all_commit_log_entries()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        orphan.parents = vec![orphan_parent];
        orphan.hash = orphan.recompute_hash().unwrap();
        adapter.write_commits(&[orphan.clone()]).unwrap();

        let report = check_graph(&adapter).unwrap();
        assert_eq!(report.commits, 2);
        assert_eq!(
            report.problems,
            vec![GraphProblem::MissingParent {
                commit: orphan.hash,
                parent: orphan_parent,
            }]
        );
    }
}
