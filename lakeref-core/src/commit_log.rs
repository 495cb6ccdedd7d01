//! Commit log entries and their scan acceleration
//!
//! A commit's hash covers its parents, puts, deletes and metadata only. The
//! [`ScanAcceleration`] attached to every entry (ancestor list, key-list
//! checkpoint) is derived data: it can be rebuilt at any time from the graph
//! and rewriting it never changes a hash.
//!
//! [`ParentState::advance`] is the single derivation used both when a commit
//! is created and when the optimizer rebuilds acceleration after an import, so
//! both paths produce identical entries.

use crate::adapter::{StoreError, StoreResult};
use crate::config::AdapterConfig;
use crate::hash::Hash;
use crate::model::{CommitParams, ContentId, Key, KeyWithBytes};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One key of a full key-list checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyListEntry {
    pub key: Key,
    pub content_id: ContentId,
    pub payload: u8,
    /// Commit that last put this key
    pub commit_id: Hash,
}

/// Sorted list of every key visible at a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyList {
    pub entries: Vec<KeyListEntry>,
}

impl KeyList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derived per-commit metadata that speeds up log and key scans
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAcceleration {
    /// First-parent chain, nearest first
    pub ancestors: Vec<Hash>,
    /// Commits since the last key-list checkpoint
    pub key_list_distance: u32,
    /// Full key set, present on checkpoint commits
    pub key_list: Option<KeyList>,
}

impl ScanAcceleration {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One commit of the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLogEntry {
    pub hash: Hash,
    /// Direct parent first, merge parents after it
    pub parents: Vec<Hash>,
    /// Distance from the root along first parents
    pub commit_seq: u64,
    pub commit_meta: Bytes,
    /// Sorted by key
    pub puts: Vec<KeyWithBytes>,
    /// Sorted
    pub deletes: Vec<Key>,
    pub acceleration: ScanAcceleration,
}

#[derive(Serialize)]
struct HashInput<'a> {
    parents: &'a [Hash],
    puts: &'a [KeyWithBytes],
    deletes: &'a [Key],
    commit_meta: &'a [u8],
}

impl CommitLogEntry {
    /// Hash of a commit's logical content
    pub fn compute_hash(
        parents: &[Hash],
        puts: &[KeyWithBytes],
        deletes: &[Key],
        commit_meta: &[u8],
    ) -> StoreResult<Hash> {
        let input = HashInput {
            parents,
            puts,
            deletes,
            commit_meta,
        };
        Ok(Hash::from_data(&bincode::serialize(&input)?))
    }

    /// Recompute the hash from the stored content
    pub fn recompute_hash(&self) -> StoreResult<Hash> {
        Self::compute_hash(&self.parents, &self.puts, &self.deletes, &self.commit_meta)
    }

    /// Check the stored hash against the content
    pub fn verify_hash(&self) -> bool {
        matches!(self.recompute_hash(), Ok(hash) if hash == self.hash)
    }

    /// The direct parent, the root sentinel for malformed entries
    pub fn parent(&self) -> Hash {
        self.parents.first().copied().unwrap_or_else(Hash::no_ancestor)
    }

    /// Merge parents besides the direct parent
    pub fn additional_parents(&self) -> &[Hash] {
        self.parents.get(1..).unwrap_or(&[])
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Copy of this entry with its acceleration cleared
    pub fn without_acceleration(&self) -> Self {
        Self {
            acceleration: ScanAcceleration::default(),
            ..self.clone()
        }
    }
}

/// Key state at one commit, used while deriving acceleration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    entries: BTreeMap<Key, KeyListEntry>,
}

impl KeySet {
    pub fn from_key_list(list: &KeyList) -> Self {
        Self {
            entries: list
                .entries
                .iter()
                .map(|e| (e.key.clone(), e.clone()))
                .collect(),
        }
    }

    /// Apply one commit's deletes and puts
    pub fn apply(&mut self, commit_id: Hash, puts: &[KeyWithBytes], deletes: &[Key]) {
        for key in deletes {
            self.entries.remove(key);
        }
        for put in puts {
            self.entries.insert(
                put.key.clone(),
                KeyListEntry {
                    key: put.key.clone(),
                    content_id: put.content_id.clone(),
                    payload: put.payload,
                    commit_id,
                },
            );
        }
    }

    pub fn to_key_list(&self) -> KeyList {
        KeyList {
            entries: self.entries.values().cloned().collect(),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &Key) -> Option<&KeyListEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rebuild the key set visible at `hash`
///
/// Walks first parents back to the nearest key-list checkpoint (or the root)
/// and replays the commits in between.
pub fn reconstruct_keys<F>(lookup: &F, hash: Hash) -> StoreResult<KeySet>
where
    F: Fn(&Hash) -> StoreResult<Option<CommitLogEntry>>,
{
    replay_keys(lookup, hash).map(|(keys, _)| keys)
}

// Also returns the number of commits replayed on top of the checkpoint.
fn replay_keys<F>(lookup: &F, hash: Hash) -> StoreResult<(KeySet, usize)>
where
    F: Fn(&Hash) -> StoreResult<Option<CommitLogEntry>>,
{
    let mut pending = Vec::new();
    let mut seen = HashSet::new();
    let mut current = hash;

    let mut keys = loop {
        if current.is_no_ancestor() {
            break KeySet::default();
        }
        if !seen.insert(current) {
            return Err(StoreError::Corrupted(format!(
                "first-parent cycle through commit {}",
                current
            )));
        }
        let entry = lookup(&current)?.ok_or(StoreError::CommitNotFound(current))?;
        if let Some(list) = &entry.acceleration.key_list {
            break KeySet::from_key_list(list);
        }
        current = entry.parent();
        pending.push(entry);
    };

    for entry in pending.iter().rev() {
        keys.apply(entry.hash, &entry.puts, &entry.deletes);
    }
    Ok((keys, pending.len()))
}

/// First-parent chain of `hash`, nearest first, at most `depth` long
pub fn walk_ancestors<F>(lookup: &F, hash: Hash, depth: usize) -> StoreResult<Vec<Hash>>
where
    F: Fn(&Hash) -> StoreResult<Option<CommitLogEntry>>,
{
    let mut ancestors = Vec::with_capacity(depth);
    let mut current = hash;
    while ancestors.len() < depth && !current.is_no_ancestor() {
        let entry = lookup(&current)?.ok_or(StoreError::CommitNotFound(current))?;
        current = entry.parent();
        ancestors.push(current);
    }
    Ok(ancestors)
}

/// Everything a child commit needs from its first parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentState {
    pub hash: Hash,
    pub commit_seq: u64,
    pub ancestors: Vec<Hash>,
    pub key_list_distance: u32,
    pub keys: KeySet,
}

impl ParentState {
    /// State of the root sentinel
    pub fn root() -> Self {
        Self {
            hash: Hash::no_ancestor(),
            commit_seq: 0,
            ancestors: Vec::new(),
            key_list_distance: 0,
            keys: KeySet::default(),
        }
    }

    /// Load the state of an existing commit
    ///
    /// Commits whose acceleration has not been derived yet (imported and not
    /// optimized) get their ancestor chain walked instead.
    pub fn load<F>(lookup: &F, hash: Hash, config: &AdapterConfig) -> StoreResult<Self>
    where
        F: Fn(&Hash) -> StoreResult<Option<CommitLogEntry>>,
    {
        if hash.is_no_ancestor() {
            return Ok(Self::root());
        }
        let entry = lookup(&hash)?.ok_or(StoreError::CommitNotFound(hash))?;
        let (keys, replayed) = replay_keys(lookup, hash)?;
        let (ancestors, key_list_distance) = if entry.acceleration.ancestors.is_empty() {
            let depth = config.parents_per_commit.max(1);
            let distance = checkpoint_distance(replayed, config.key_list_distance)?;
            (walk_ancestors(lookup, hash, depth)?, distance)
        } else {
            (
                entry.acceleration.ancestors,
                entry.acceleration.key_list_distance,
            )
        };
        Ok(Self {
            hash,
            commit_seq: entry.commit_seq,
            ancestors,
            key_list_distance,
            keys,
        })
    }

    /// Derive the acceleration of a child and the state it hands on
    pub fn advance(
        self,
        child: &CommitLogEntry,
        config: &AdapterConfig,
    ) -> (ScanAcceleration, ParentState) {
        let depth = config.parents_per_commit.max(1);
        let mut ancestors = Vec::with_capacity(depth);
        ancestors.push(self.hash);
        ancestors.extend(self.ancestors.iter().copied().take(depth - 1));

        let mut keys = self.keys;
        keys.apply(child.hash, &child.puts, &child.deletes);

        let mut key_list_distance = self.key_list_distance + 1;
        let key_list = if key_list_distance >= config.key_list_distance.max(1) {
            key_list_distance = 0;
            Some(keys.to_key_list())
        } else {
            None
        };

        let acceleration = ScanAcceleration {
            ancestors: ancestors.clone(),
            key_list_distance,
            key_list,
        };
        let next = ParentState {
            hash: child.hash,
            commit_seq: child.commit_seq,
            ancestors,
            key_list_distance,
            keys,
        };
        (acceleration, next)
    }
}

// Position of a commit `replayed` commits past its last checkpoint.
fn checkpoint_distance(replayed: usize, key_list_distance: u32) -> StoreResult<u32> {
    let cadence = key_list_distance.max(1) as usize;
    u32::try_from(replayed % cadence).map_err(|_| {
        StoreError::Corrupted(format!("checkpoint distance of {} commits", replayed))
    })
}

/// Sort puts and deletes and reject conflicting keys
pub fn normalize_operations(
    mut puts: Vec<KeyWithBytes>,
    mut deletes: Vec<Key>,
) -> StoreResult<(Vec<KeyWithBytes>, Vec<Key>)> {
    for key in puts.iter().map(|p| &p.key).chain(deletes.iter()) {
        if !key.is_valid() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
    }

    puts.sort_by(|a, b| a.key.cmp(&b.key));
    let mut normalized: Vec<KeyWithBytes> = Vec::with_capacity(puts.len());
    for put in puts {
        match normalized.last() {
            Some(last) if last.key == put.key => {
                if *last != put {
                    return Err(StoreError::DuplicateKeyConflict { key: put.key });
                }
            }
            _ => normalized.push(put),
        }
    }

    deletes.sort();
    for pair in deletes.windows(2) {
        if pair[0] == pair[1] {
            return Err(StoreError::DuplicateKeyConflict {
                key: pair[0].clone(),
            });
        }
    }
    for key in &deletes {
        if normalized.binary_search_by(|p| p.key.cmp(key)).is_ok() {
            return Err(StoreError::DuplicateKeyConflict { key: key.clone() });
        }
    }

    Ok((normalized, deletes))
}

/// Build the entry a commit on `head` would append
///
/// Validates the operations, checks that every parent exists and derives the
/// scan acceleration. The caller still has to check the expected head and
/// persist the entry.
pub fn build_commit<F>(
    params: &CommitParams,
    head: Hash,
    lookup: &F,
    config: &AdapterConfig,
) -> StoreResult<CommitLogEntry>
where
    F: Fn(&Hash) -> StoreResult<Option<CommitLogEntry>>,
{
    let (puts, deletes) = normalize_operations(params.puts.clone(), params.deletes.clone())?;

    for parent in &params.additional_parents {
        if !parent.is_no_ancestor() && lookup(parent)?.is_none() {
            return Err(StoreError::CommitNotFound(*parent));
        }
    }

    let parent_state = ParentState::load(lookup, head, config)?;

    let mut parents = Vec::with_capacity(1 + params.additional_parents.len());
    parents.push(head);
    parents.extend(params.additional_parents.iter().copied());

    let hash = CommitLogEntry::compute_hash(&parents, &puts, &deletes, &params.commit_meta)?;
    let mut entry = CommitLogEntry {
        hash,
        parents,
        commit_seq: parent_state.commit_seq + 1,
        commit_meta: params.commit_meta.clone(),
        puts,
        deletes,
        acceleration: ScanAcceleration::default(),
    };
    let (acceleration, _) = parent_state.advance(&entry, config);
    entry.acceleration = acceleration;
    Ok(entry)
}
