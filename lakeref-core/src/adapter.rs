//! Backend contract for the commit graph
//!
//! Every physical store implements [`DatabaseAdapter`]. The store owns all
//! persisted commit and reference state; callers only ever hold derived,
//! transient views (scanned lists, walked chains).

use crate::commit_log::{CommitLogEntry, ScanAcceleration};
use crate::config::AdapterConfig;
use crate::hash::Hash;
use crate::model::{CommitParams, Key, NamedRef, NamedRefsParams, ReferenceInfo};

/// Result type for adapter operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by adapter operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("reference already exists: {0}")]
    ReferenceAlreadyExists(String),

    /// Optimistic-concurrency violation; retry with a freshly read head
    #[error("reference conflict on {reference}: expected head {expected}, found {actual}")]
    ReferenceConflict {
        reference: String,
        expected: Hash,
        actual: Hash,
    },

    #[error("duplicate key in commit: {key}")]
    DuplicateKeyConflict { key: Key },

    #[error("commit not found: {0}")]
    CommitNotFound(Hash),

    #[error("invalid reference name: {0:?}")]
    InvalidReferenceName(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("repository already initialized")]
    RepositoryAlreadyInitialized,

    #[error("concurrent scan-acceleration update on commit {0}")]
    ConcurrentAccelerationUpdate(Hash),

    #[error("permission denied: {principal} may not {operation} on {reference}")]
    PermissionDenied {
        principal: String,
        operation: String,
        reference: String,
    },

    #[error("corrupted stored data: {0}")]
    Corrupted(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ReferenceNotFound(_) | StoreError::CommitNotFound(_)
        )
    }

    /// Check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ReferenceAlreadyExists(_)
                | StoreError::ReferenceConflict { .. }
                | StoreError::DuplicateKeyConflict { .. }
                | StoreError::ConcurrentAccelerationUpdate(_)
        )
    }

    /// Check if the caller can retry with fresh state
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::ReferenceConflict { .. } | StoreError::ConcurrentAccelerationUpdate(_)
        )
    }
}

/// Lazy sequence of named references
pub type RefIter<'a> = Box<dyn Iterator<Item = StoreResult<ReferenceInfo>> + 'a>;

/// Lazy sequence of commit log entries
pub type CommitIter<'a> = Box<dyn Iterator<Item = StoreResult<CommitLogEntry>> + 'a>;

/// Operations a physical store must provide
///
/// `commit` and `delete` use optimistic concurrency through the expected
/// head; scans may be stale relative to concurrent writers but never expose a
/// partially written commit.
pub trait DatabaseAdapter: Send + Sync {
    /// Configuration the adapter was opened with
    fn config(&self) -> &AdapterConfig;

    /// The root sentinel
    fn no_ancestor_hash(&self) -> Hash {
        Hash::no_ancestor()
    }

    /// Create an empty repository with one branch at the root
    fn initialize_repo(&self, default_branch: &str) -> StoreResult<()>;

    /// Destroy all commits and references
    fn erase_repo(&self) -> StoreResult<()>;

    /// Create a branch or tag pointing at `target`
    ///
    /// An unknown target is reported as `ReferenceNotFound`.
    fn create(&self, named_ref: &NamedRef, target: Hash) -> StoreResult<Hash>;

    /// Remove a reference, optionally only if it still points at `expected`
    fn delete(&self, named_ref: &NamedRef, expected: Option<Hash>) -> StoreResult<()>;

    /// Append one commit to a branch and advance the branch to it
    fn commit(&self, params: CommitParams) -> StoreResult<Hash>;

    /// All references matching `params`, ordered by name
    fn named_refs(&self, params: &NamedRefsParams) -> StoreResult<RefIter<'_>>;

    /// Resolve a single reference by name
    fn named_ref(&self, name: &str) -> StoreResult<ReferenceInfo>;

    /// Every stored commit, in ascending hash order
    fn scan_all_commit_log_entries(&self) -> StoreResult<CommitIter<'_>>;

    /// Point lookup of a commit
    fn fetch_commit(&self, hash: &Hash) -> StoreResult<Option<CommitLogEntry>>;

    /// Insert already-hashed commits; existing hashes are left untouched
    fn write_commits(&self, entries: &[CommitLogEntry]) -> StoreResult<()>;

    /// Compare-and-swap the scan acceleration of one commit
    ///
    /// Returns `true` when rewritten and `false` when the stored value already
    /// equals `updated`.
    fn update_acceleration(
        &self,
        hash: &Hash,
        expected: &ScanAcceleration,
        updated: &ScanAcceleration,
    ) -> StoreResult<bool>;
}

/// Reject empty reference names
pub fn validate_ref_name(named_ref: &NamedRef) -> StoreResult<()> {
    let name = named_ref.name();
    if name.is_empty() || name.trim() != name {
        return Err(StoreError::InvalidReferenceName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StoreError::ReferenceNotFound("main".into());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StoreError::ReferenceConflict {
            reference: "main".into(),
            expected: Hash::no_ancestor(),
            actual: Hash::from_data(b"x"),
        };
        assert!(conflict.is_conflict());
        assert!(conflict.is_retriable());

        let duplicate = StoreError::DuplicateKeyConflict {
            key: Key::of(["a"]),
        };
        assert!(duplicate.is_conflict());
        assert!(!duplicate.is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::ReferenceAlreadyExists("b1".into());
        assert!(err.to_string().contains("b1"));

        let err = StoreError::CommitNotFound(Hash::no_ancestor());
        assert!(err.to_string().contains(&Hash::no_ancestor().to_hex()));
    }

    #[test]
    fn test_validate_ref_name() {
        assert!(validate_ref_name(&NamedRef::branch("main")).is_ok());
        assert!(validate_ref_name(&NamedRef::branch("")).is_err());
        assert!(validate_ref_name(&NamedRef::tag(" v1")).is_err());
    }
}
