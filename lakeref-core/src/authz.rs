//! Authorization in front of the graph-mutating operations
//!
//! [`AuthorizingAdapter`] wraps any [`DatabaseAdapter`] and asks an
//! [`Authorizer`] before every mutation. It adds no state of its own: once
//! access is granted the call goes to the inner adapter unchanged.
//!
//! Rules files look like this:
//!
//! ```text
//! [groups]
//! engineers = alice, bob
//! release = carol
//!
//! [*]
//! * = r
//!
//! [main]
//! @engineers = rw
//!
//! [release/*]
//! @release = rw
//! bob = r
//! ```
//!
//! Sections name a reference, a prefix ending in `/*`, or `*` for every
//! reference. Repository-wide operations (initialize, erase, raw commit
//! writes) are checked against `*`.

use crate::adapter::{CommitIter, DatabaseAdapter, RefIter, StoreError, StoreResult};
use crate::commit_log::{CommitLogEntry, ScanAcceleration};
use crate::config::AdapterConfig;
use crate::hash::Hash;
use crate::model::{CommitParams, NamedRef, NamedRefsParams, ReferenceInfo};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Reference name used for repository-wide checks
pub const REPOSITORY_SCOPE: &str = "*";

/// Access level on a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    None,
    Read,
    Write,
}

impl AccessLevel {
    fn satisfies(self, required: AccessLevel) -> bool {
        match (self, required) {
            (_, AccessLevel::None) => true,
            (AccessLevel::Write, _) => true,
            (AccessLevel::Read, AccessLevel::Read) => true,
            _ => false,
        }
    }
}

/// Authorization result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthzResult {
    Granted,
    Denied,
    Error(String),
}

/// Decides whether a principal may access a reference
pub trait Authorizer: Send + Sync {
    fn check_access(
        &self,
        principal: Option<&str>,
        reference: &str,
        required_level: AccessLevel,
    ) -> AuthzResult;

    fn can_read(&self, principal: Option<&str>, reference: &str) -> bool {
        matches!(
            self.check_access(principal, reference, AccessLevel::Read),
            AuthzResult::Granted
        )
    }

    fn can_write(&self, principal: Option<&str>, reference: &str) -> bool {
        matches!(
            self.check_access(principal, reference, AccessLevel::Write),
            AuthzResult::Granted
        )
    }
}

/// Error while reading a rules file
#[derive(Debug, thiserror::Error)]
pub enum AuthzParseError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    User(String),
    Group(String),
    Everyone,
}

#[derive(Debug, Clone)]
struct AccessRule {
    subject: Subject,
    level: AccessLevel,
}

/// Authorizer driven by a rules file
#[derive(Debug, Clone)]
pub struct RulesAuthorizer {
    /// Section name -> rules in file order
    sections: HashMap<String, Vec<AccessRule>>,
    groups: HashMap<String, HashSet<String>>,
    default_access: AccessLevel,
}

impl RulesAuthorizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AuthzParseError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_content(&content)
    }

    pub fn from_content(content: &str) -> Result<Self, AuthzParseError> {
        let mut sections: HashMap<String, Vec<AccessRule>> = HashMap::new();
        let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
        let mut current_section: Option<String> = None;

        for (index, line) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim();
                if name.is_empty() {
                    return Err(syntax(line_no, "empty section name"));
                }
                current_section = Some(name.to_string());
                continue;
            }

            let Some(section) = &current_section else {
                return Err(syntax(line_no, "rule outside of a section"));
            };
            let (lhs, rhs) = line
                .split_once('=')
                .ok_or_else(|| syntax(line_no, format!("expected '=' in {:?}", line)))?;
            let (lhs, rhs) = (lhs.trim(), rhs.trim());

            if section == "groups" {
                if lhs.is_empty() {
                    return Err(syntax(line_no, "group name cannot be empty"));
                }
                let members: HashSet<String> = rhs
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if members.is_empty() {
                    return Err(syntax(line_no, format!("no members in group {}", lhs)));
                }
                groups.insert(lhs.to_string(), members);
                continue;
            }

            let subject = if let Some(group) = lhs.strip_prefix('@') {
                if !groups.contains_key(group) {
                    return Err(syntax(line_no, format!("group not found: {}", group)));
                }
                Subject::Group(group.to_string())
            } else if lhs == "*" {
                Subject::Everyone
            } else if lhs.is_empty() {
                return Err(syntax(line_no, "rule without subject"));
            } else {
                Subject::User(lhs.to_string())
            };

            let level = match rhs.to_lowercase().as_str() {
                "r" | "read" => AccessLevel::Read,
                "rw" | "w" | "write" | "read-write" => AccessLevel::Write,
                "" => AccessLevel::None,
                other => return Err(syntax(line_no, format!("invalid access level {:?}", other))),
            };

            sections
                .entry(section.clone())
                .or_default()
                .push(AccessRule { subject, level });
        }

        Ok(Self {
            sections,
            groups,
            default_access: AccessLevel::None,
        })
    }

    /// Access level for references no section matches
    pub fn with_default_access(mut self, default: AccessLevel) -> Self {
        self.default_access = default;
        self
    }

    // Exact name first, then `prefix/*` sections longest first, then `*`.
    fn applicable_sections(&self, reference: &str) -> Vec<&Vec<AccessRule>> {
        let mut applicable = Vec::new();
        if let Some(rules) = self.sections.get(reference) {
            applicable.push(rules);
        }

        let mut prefixed: Vec<(&str, &Vec<AccessRule>)> = self
            .sections
            .iter()
            .filter_map(|(name, rules)| {
                let prefix = name.strip_suffix('*')?;
                (name != REPOSITORY_SCOPE && prefix.ends_with('/') && reference.starts_with(prefix))
                    .then_some((prefix, rules))
            })
            .collect();
        prefixed.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        applicable.extend(prefixed.into_iter().map(|(_, rules)| rules));

        if reference != REPOSITORY_SCOPE {
            if let Some(rules) = self.sections.get(REPOSITORY_SCOPE) {
                applicable.push(rules);
            }
        }
        applicable
    }

    fn matches(&self, subject: &Subject, principal: Option<&str>) -> bool {
        match (subject, principal) {
            (Subject::Everyone, _) => true,
            (Subject::User(user), Some(principal)) => user == principal,
            (Subject::Group(group), Some(principal)) => self
                .groups
                .get(group)
                .is_some_and(|members| members.contains(principal)),
            _ => false,
        }
    }

    fn find_access_level(&self, principal: Option<&str>, reference: &str) -> AccessLevel {
        for rules in self.applicable_sections(reference) {
            if let Some(rule) = rules.iter().find(|r| self.matches(&r.subject, principal)) {
                return rule.level;
            }
        }
        self.default_access
    }
}

fn syntax(line: usize, message: impl Into<String>) -> AuthzParseError {
    AuthzParseError::Syntax {
        line,
        message: message.into(),
    }
}

impl Authorizer for RulesAuthorizer {
    fn check_access(
        &self,
        principal: Option<&str>,
        reference: &str,
        required_level: AccessLevel,
    ) -> AuthzResult {
        if self.find_access_level(principal, reference).satisfies(required_level) {
            AuthzResult::Granted
        } else {
            AuthzResult::Denied
        }
    }
}

/// Grants everything
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn check_access(&self, _: Option<&str>, _: &str, _: AccessLevel) -> AuthzResult {
        AuthzResult::Granted
    }
}

/// Denies everything
#[derive(Debug, Clone, Default)]
pub struct DenyAllAuthorizer;

impl Authorizer for DenyAllAuthorizer {
    fn check_access(&self, _: Option<&str>, _: &str, _: AccessLevel) -> AuthzResult {
        AuthzResult::Denied
    }
}

/// Adapter that checks the caller's access before delegating
pub struct AuthorizingAdapter<A> {
    inner: A,
    authorizer: Arc<dyn Authorizer>,
    principal: Option<String>,
}

impl<A: DatabaseAdapter> AuthorizingAdapter<A> {
    pub fn new(inner: A, authorizer: Arc<dyn Authorizer>, principal: Option<String>) -> Self {
        Self {
            inner,
            authorizer,
            principal,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }

    fn require_write(&self, reference: &str, operation: &str) -> StoreResult<()> {
        let principal = self.principal.as_deref();
        match self
            .authorizer
            .check_access(principal, reference, AccessLevel::Write)
        {
            AuthzResult::Granted => Ok(()),
            result => {
                if let AuthzResult::Error(e) = &result {
                    tracing::warn!("authorization check failed for {}: {}", reference, e);
                }
                Err(StoreError::PermissionDenied {
                    principal: principal.unwrap_or("anonymous").to_string(),
                    operation: operation.to_string(),
                    reference: reference.to_string(),
                })
            }
        }
    }
}

impl<A: DatabaseAdapter> DatabaseAdapter for AuthorizingAdapter<A> {
    fn config(&self) -> &AdapterConfig {
        self.inner.config()
    }

    fn initialize_repo(&self, default_branch: &str) -> StoreResult<()> {
        self.require_write(REPOSITORY_SCOPE, "initialize")?;
        self.inner.initialize_repo(default_branch)
    }

    fn erase_repo(&self) -> StoreResult<()> {
        self.require_write(REPOSITORY_SCOPE, "erase")?;
        self.inner.erase_repo()
    }

    fn create(&self, named_ref: &NamedRef, target: Hash) -> StoreResult<Hash> {
        self.require_write(named_ref.name(), "create")?;
        self.inner.create(named_ref, target)
    }

    fn delete(&self, named_ref: &NamedRef, expected: Option<Hash>) -> StoreResult<()> {
        self.require_write(named_ref.name(), "delete")?;
        self.inner.delete(named_ref, expected)
    }

    fn commit(&self, params: CommitParams) -> StoreResult<Hash> {
        self.require_write(&params.to_branch, "commit")?;
        self.inner.commit(params)
    }

    fn named_refs(&self, params: &NamedRefsParams) -> StoreResult<RefIter<'_>> {
        self.inner.named_refs(params)
    }

    fn named_ref(&self, name: &str) -> StoreResult<ReferenceInfo> {
        self.inner.named_ref(name)
    }

    fn scan_all_commit_log_entries(&self) -> StoreResult<CommitIter<'_>> {
        self.inner.scan_all_commit_log_entries()
    }

    fn fetch_commit(&self, hash: &Hash) -> StoreResult<Option<CommitLogEntry>> {
        self.inner.fetch_commit(hash)
    }

    fn write_commits(&self, entries: &[CommitLogEntry]) -> StoreResult<()> {
        self.require_write(REPOSITORY_SCOPE, "write commits")?;
        self.inner.write_commits(entries)
    }

    fn update_acceleration(
        &self,
        hash: &Hash,
        expected: &ScanAcceleration,
        updated: &ScanAcceleration,
    ) -> StoreResult<bool> {
        self.require_write(REPOSITORY_SCOPE, "optimize")?;
        self.inner.update_acceleration(hash, expected, updated)
    }
}
