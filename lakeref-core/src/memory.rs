//! In-memory adapter
//!
//! Holds the whole repository behind one lock. Used by tests and as the
//! reference behavior the persistent backends are checked against.

use crate::adapter::{
    validate_ref_name, CommitIter, DatabaseAdapter, RefIter, StoreError, StoreResult,
};
use crate::commit_log::{build_commit, CommitLogEntry, ScanAcceleration};
use crate::config::AdapterConfig;
use crate::hash::Hash;
use crate::model::{CommitParams, NamedRef, NamedRefsParams, RefKind, ReferenceInfo};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct State {
    initialized: bool,
    /// Reference name -> (kind, head)
    refs: BTreeMap<String, (RefKind, Hash)>,
    commits: HashMap<Hash, CommitLogEntry>,
}

impl State {
    fn resolve(&self, named_ref: &NamedRef) -> StoreResult<Hash> {
        match self.refs.get(named_ref.name()) {
            Some((kind, hash)) if *kind == named_ref.kind() => Ok(*hash),
            _ => Err(StoreError::ReferenceNotFound(named_ref.name().to_string())),
        }
    }

    fn has_commit(&self, hash: &Hash) -> bool {
        hash.is_no_ancestor() || self.commits.contains_key(hash)
    }
}

/// Adapter keeping everything in process memory
pub struct InMemoryAdapter {
    config: AdapterConfig,
    state: RwLock<State>,
}

impl InMemoryAdapter {
    /// Create an empty, uninitialized store
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State::default()),
        }
    }

    /// Number of stored commits
    pub fn commit_count(&self) -> usize {
        self.state.read().commits.len()
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new(AdapterConfig::default())
    }
}

impl DatabaseAdapter for InMemoryAdapter {
    fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn initialize_repo(&self, default_branch: &str) -> StoreResult<()> {
        let branch = NamedRef::branch(default_branch);
        validate_ref_name(&branch)?;

        let mut state = self.state.write();
        if state.initialized || !state.refs.is_empty() {
            return Err(StoreError::RepositoryAlreadyInitialized);
        }
        state.initialized = true;
        state
            .refs
            .insert(default_branch.to_string(), (RefKind::Branch, Hash::no_ancestor()));
        tracing::debug!("initialized in-memory repository with branch {}", default_branch);
        Ok(())
    }

    fn erase_repo(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        *state = State::default();
        tracing::debug!("erased in-memory repository");
        Ok(())
    }

    fn create(&self, named_ref: &NamedRef, target: Hash) -> StoreResult<Hash> {
        validate_ref_name(named_ref)?;

        let mut state = self.state.write();
        if state.refs.contains_key(named_ref.name()) {
            return Err(StoreError::ReferenceAlreadyExists(named_ref.name().to_string()));
        }
        if !state.has_commit(&target) {
            return Err(StoreError::ReferenceNotFound(target.to_string()));
        }
        state
            .refs
            .insert(named_ref.name().to_string(), (named_ref.kind(), target));
        Ok(target)
    }

    fn delete(&self, named_ref: &NamedRef, expected: Option<Hash>) -> StoreResult<()> {
        let mut state = self.state.write();
        let actual = state.resolve(named_ref)?;
        if let Some(expected) = expected {
            if expected != actual {
                return Err(StoreError::ReferenceConflict {
                    reference: named_ref.name().to_string(),
                    expected,
                    actual,
                });
            }
        }
        state.refs.remove(named_ref.name());
        Ok(())
    }

    fn commit(&self, params: CommitParams) -> StoreResult<Hash> {
        let branch = NamedRef::branch(params.to_branch.as_str());
        let mut state = self.state.write();

        let head = state.resolve(&branch)?;
        if let Some(expected) = params.expected_head {
            if expected != head {
                return Err(StoreError::ReferenceConflict {
                    reference: params.to_branch.clone(),
                    expected,
                    actual: head,
                });
            }
        }

        let entry = {
            let commits = &state.commits;
            let lookup = |hash: &Hash| Ok(commits.get(hash).cloned());
            build_commit(&params, head, &lookup, &self.config)?
        };
        let hash = entry.hash;

        state.commits.entry(hash).or_insert(entry);
        state
            .refs
            .insert(params.to_branch.clone(), (RefKind::Branch, hash));
        Ok(hash)
    }

    // Scans copy their rows under the read lock and iterate the copy, so no
    // lock outlives the call. The copy is bounded by what this store already
    // holds in memory.
    fn named_refs(&self, params: &NamedRefsParams) -> StoreResult<RefIter<'_>> {
        let state = self.state.read();
        let refs: Vec<ReferenceInfo> = state
            .refs
            .iter()
            .map(|(name, (kind, hash))| ReferenceInfo::new(NamedRef::new(*kind, name.as_str()), *hash))
            .filter(|info| params.matches(&info.named_ref))
            .collect();
        Ok(Box::new(refs.into_iter().map(Ok)))
    }

    fn named_ref(&self, name: &str) -> StoreResult<ReferenceInfo> {
        let state = self.state.read();
        state
            .refs
            .get(name)
            .map(|(kind, hash)| ReferenceInfo::new(NamedRef::new(*kind, name), *hash))
            .ok_or_else(|| StoreError::ReferenceNotFound(name.to_string()))
    }

    fn scan_all_commit_log_entries(&self) -> StoreResult<CommitIter<'_>> {
        let state = self.state.read();
        let mut entries: Vec<CommitLogEntry> = state.commits.values().cloned().collect();
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn fetch_commit(&self, hash: &Hash) -> StoreResult<Option<CommitLogEntry>> {
        Ok(self.state.read().commits.get(hash).cloned())
    }

    fn write_commits(&self, entries: &[CommitLogEntry]) -> StoreResult<()> {
        let mut state = self.state.write();
        for entry in entries {
            state
                .commits
                .entry(entry.hash)
                .or_insert_with(|| entry.clone());
        }
        Ok(())
    }

    fn update_acceleration(
        &self,
        hash: &Hash,
        expected: &ScanAcceleration,
        updated: &ScanAcceleration,
    ) -> StoreResult<bool> {
        let mut state = self.state.write();
        let entry = state
            .commits
            .get_mut(hash)
            .ok_or(StoreError::CommitNotFound(*hash))?;
        if entry.acceleration == *updated {
            return Ok(false);
        }
        if entry.acceleration != *expected {
            return Err(StoreError::ConcurrentAccelerationUpdate(*hash));
        }
        entry.acceleration = updated.clone();
        Ok(true)
    }
}
