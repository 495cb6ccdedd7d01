//! Lakeref Core Library
//!
//! Versioned reference store over a content-addressed commit graph:
//! - Data model (keys, named references, commit parameters)
//! - Commit log entries and their scan acceleration
//! - Backend contract with in-memory and SQLite (WAL mode) implementations
//! - Graph helpers (heads and fork points, log walk, integrity check)
//! - Authorization decorator
//! - Adapter configuration

pub mod adapter;
pub mod authz;
pub mod commit_log;
pub mod config;
pub mod graph;
pub mod hash;
pub mod memory;
pub mod model;
pub mod sqlite_adapter;

pub use adapter::{validate_ref_name, CommitIter, DatabaseAdapter, RefIter, StoreError, StoreResult};
pub use authz::{
    AccessLevel, AllowAllAuthorizer, Authorizer, AuthorizingAdapter, AuthzParseError, AuthzResult,
    DenyAllAuthorizer, RulesAuthorizer,
};
pub use commit_log::{
    build_commit, reconstruct_keys, CommitLogEntry, KeyList, KeyListEntry, KeySet, ParentState,
    ScanAcceleration,
};
pub use config::{AdapterConfig, CONFIG_FILE_NAME};
pub use graph::{check_graph, commit_log, topological_order, GraphProblem, GraphReport, HeadsAndForks};
pub use hash::Hash;
pub use memory::InMemoryAdapter;
pub use model::{
    CommitParams, ContentId, Key, KeyWithBytes, NamedRef, NamedRefsParams, RefKind, ReferenceInfo,
};
pub use sqlite_adapter::{SqliteAdapter, DATABASE_FILE_NAME};
