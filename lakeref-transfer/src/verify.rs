//! Repository comparison for round-trip checks
//!
//! A snapshot holds the references and every commit reachable from them,
//! without scan acceleration. Two repositories with equal snapshots are
//! observably identical.

use lakeref_core::{
    CommitLogEntry, DatabaseAdapter, Hash, NamedRef, NamedRefsParams, StoreError, StoreResult,
};
use std::collections::{BTreeMap, HashMap};

/// References and reachable commits of one repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositorySnapshot {
    pub references: BTreeMap<NamedRef, Hash>,
    pub commits: BTreeMap<Hash, CommitLogEntry>,
}

/// Differences between two snapshots, seen from the first one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub missing_references: Vec<NamedRef>,
    pub extra_references: Vec<NamedRef>,
    /// (reference, expected target, actual target)
    pub changed_references: Vec<(NamedRef, Hash, Hash)>,
    pub missing_commits: Vec<Hash>,
    pub extra_commits: Vec<Hash>,
    pub changed_commits: Vec<Hash>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_references.is_empty()
            && self.extra_references.is_empty()
            && self.changed_references.is_empty()
            && self.missing_commits.is_empty()
            && self.extra_commits.is_empty()
            && self.changed_commits.is_empty()
    }
}

impl RepositorySnapshot {
    /// Capture the current state of `adapter`
    pub fn capture<A: DatabaseAdapter + ?Sized>(adapter: &A) -> StoreResult<Self> {
        let mut references = BTreeMap::new();
        for info in adapter.named_refs(&NamedRefsParams::default())? {
            let info = info?;
            references.insert(info.named_ref, info.hash);
        }

        let mut stored: HashMap<Hash, CommitLogEntry> = HashMap::new();
        for entry in adapter.scan_all_commit_log_entries()? {
            let entry = entry?;
            stored.insert(entry.hash, entry.without_acceleration());
        }

        let mut commits = BTreeMap::new();
        let mut pending: Vec<Hash> = references.values().copied().collect();
        while let Some(hash) = pending.pop() {
            if hash.is_no_ancestor() || commits.contains_key(&hash) {
                continue;
            }
            let entry = stored.remove(&hash).ok_or(StoreError::CommitNotFound(hash))?;
            pending.extend(entry.parents.iter().copied());
            commits.insert(hash, entry);
        }

        Ok(Self {
            references,
            commits,
        })
    }

    /// What `other` lacks, adds or changes relative to `self`
    pub fn diff(&self, other: &RepositorySnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for (named_ref, hash) in &self.references {
            match other.references.get(named_ref) {
                None => diff.missing_references.push(named_ref.clone()),
                Some(actual) if actual != hash => {
                    diff.changed_references
                        .push((named_ref.clone(), *hash, *actual))
                }
                Some(_) => {}
            }
        }
        diff.extra_references = other
            .references
            .keys()
            .filter(|r| !self.references.contains_key(*r))
            .cloned()
            .collect();

        for (hash, entry) in &self.commits {
            match other.commits.get(hash) {
                None => diff.missing_commits.push(*hash),
                Some(actual) if actual != entry => diff.changed_commits.push(*hash),
                Some(_) => {}
            }
        }
        diff.extra_commits = other
            .commits
            .keys()
            .filter(|h| !self.commits.contains_key(*h))
            .copied()
            .collect();

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeref_core::{CommitParams, InMemoryAdapter};

    #[test]
    fn test_snapshot_ignores_unreachable_commits() {
        let adapter = InMemoryAdapter::default();
        adapter.initialize_repo("main").unwrap();
        let kept = adapter.commit(CommitParams::new("main", b"kept".to_vec())).unwrap();
        adapter.create(&NamedRef::branch("tmp"), kept).unwrap();
        let dropped = adapter.commit(CommitParams::new("tmp", b"dropped".to_vec())).unwrap();
        adapter.delete(&NamedRef::branch("tmp"), Some(dropped)).unwrap();

        let snapshot = RepositorySnapshot::capture(&adapter).unwrap();
        assert!(snapshot.commits.contains_key(&kept));
        assert!(!snapshot.commits.contains_key(&dropped));
    }

    #[test]
    fn test_diff_reports_moved_reference() {
        let adapter = InMemoryAdapter::default();
        adapter.initialize_repo("main").unwrap();
        let before = RepositorySnapshot::capture(&adapter).unwrap();
        let head = adapter.commit(CommitParams::new("main", b"one".to_vec())).unwrap();
        let after = RepositorySnapshot::capture(&adapter).unwrap();

        let diff = before.diff(&after);
        assert!(!diff.is_empty());
        assert_eq!(
            diff.changed_references,
            vec![(NamedRef::branch("main"), Hash::no_ancestor(), head)]
        );
        assert_eq!(diff.extra_commits, vec![head]);
        assert!(after.diff(&after).is_empty());
    }
}
