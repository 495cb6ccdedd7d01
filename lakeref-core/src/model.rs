//! Keys, content identity, named references and commit parameters

use crate::hash::Hash;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured path under which content is addressed inside a commit
///
/// Keys are ordered element by element, so all keys of one namespace sort
/// next to each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    elements: Vec<String>,
}

impl Key {
    /// Build a key from its elements (namespace segments followed by the name)
    pub fn of<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// All elements but the last
    pub fn namespace(&self) -> &[String] {
        match self.elements.split_last() {
            Some((_, namespace)) => namespace,
            None => &[],
        }
    }

    /// The last element
    pub fn name(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    /// A key is valid when it has at least one element and no element is empty
    pub fn is_valid(&self) -> bool {
        !self.elements.is_empty() && self.elements.iter().all(|e| !e.is_empty())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.elements.join("."))
    }
}

/// Stable identity of a table or object across its whole history
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(String);

impl ContentId {
    pub fn of(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a commit's put-set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWithBytes {
    pub key: Key,
    pub content_id: ContentId,
    /// Payload type tag (opaque to the store)
    pub payload: u8,
    /// Serialized on-reference state (opaque to the store)
    pub value: Bytes,
}

impl KeyWithBytes {
    pub fn of(key: Key, content_id: ContentId, payload: u8, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            content_id,
            payload,
            value: value.into(),
        }
    }
}

/// Kind discriminator for named references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    pub fn as_i64(self) -> i64 {
        match self {
            RefKind::Branch => 0,
            RefKind::Tag => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(RefKind::Branch),
            1 => Some(RefKind::Tag),
            _ => None,
        }
    }
}

/// A branch (mutable) or tag (immutable) name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NamedRef {
    Branch(String),
    Tag(String),
}

impl NamedRef {
    pub fn branch(name: impl Into<String>) -> Self {
        NamedRef::Branch(name.into())
    }

    pub fn tag(name: impl Into<String>) -> Self {
        NamedRef::Tag(name.into())
    }

    pub fn new(kind: RefKind, name: impl Into<String>) -> Self {
        match kind {
            RefKind::Branch => NamedRef::Branch(name.into()),
            RefKind::Tag => NamedRef::Tag(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NamedRef::Branch(name) | NamedRef::Tag(name) => name,
        }
    }

    pub fn kind(&self) -> RefKind {
        match self {
            NamedRef::Branch(_) => RefKind::Branch,
            NamedRef::Tag(_) => RefKind::Tag,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, NamedRef::Branch(_))
    }
}

impl fmt::Display for NamedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamedRef::Branch(name) => write!(f, "branch '{}'", name),
            NamedRef::Tag(name) => write!(f, "tag '{}'", name),
        }
    }
}

/// A named reference together with the commit it currently designates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub named_ref: NamedRef,
    pub hash: Hash,
}

impl ReferenceInfo {
    pub fn new(named_ref: NamedRef, hash: Hash) -> Self {
        Self { named_ref, hash }
    }
}

/// Filter for [`crate::DatabaseAdapter::named_refs`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRefsParams {
    pub include_branches: bool,
    pub include_tags: bool,
    pub name_prefix: Option<String>,
}

impl Default for NamedRefsParams {
    fn default() -> Self {
        Self {
            include_branches: true,
            include_tags: true,
            name_prefix: None,
        }
    }
}

impl NamedRefsParams {
    pub fn branches_only() -> Self {
        Self {
            include_tags: false,
            ..Self::default()
        }
    }

    pub fn tags_only() -> Self {
        Self {
            include_branches: false,
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, named_ref: &NamedRef) -> bool {
        let kind_ok = match named_ref.kind() {
            RefKind::Branch => self.include_branches,
            RefKind::Tag => self.include_tags,
        };
        kind_ok
            && self
                .name_prefix
                .as_deref()
                .is_none_or(|prefix| named_ref.name().starts_with(prefix))
    }
}

/// Input of a commit operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitParams {
    pub to_branch: String,
    /// Required current head, `None` commits on whatever the head is
    pub expected_head: Option<Hash>,
    /// Merge parents besides the branch head
    pub additional_parents: Vec<Hash>,
    pub puts: Vec<KeyWithBytes>,
    pub deletes: Vec<Key>,
    /// Serialized commit metadata (author, message, ...), uninterpreted
    pub commit_meta: Bytes,
}

impl CommitParams {
    pub fn new(to_branch: impl Into<String>, commit_meta: impl Into<Bytes>) -> Self {
        Self {
            to_branch: to_branch.into(),
            expected_head: None,
            additional_parents: Vec::new(),
            puts: Vec::new(),
            deletes: Vec::new(),
            commit_meta: commit_meta.into(),
        }
    }

    pub fn with_expected_head(mut self, head: Hash) -> Self {
        self.expected_head = Some(head);
        self
    }

    pub fn with_additional_parent(mut self, parent: Hash) -> Self {
        self.additional_parents.push(parent);
        self
    }

    pub fn with_put(mut self, put: KeyWithBytes) -> Self {
        self.puts.push(put);
        self
    }

    pub fn with_delete(mut self, key: Key) -> Self {
        self.deletes.push(key);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parts() {
        let key = Key::of(["db", "schema", "table"]);
        assert_eq!(key.namespace(), &["db".to_string(), "schema".to_string()]);
        assert_eq!(key.name(), Some("table"));
        assert_eq!(key.to_string(), "db.schema.table");
        assert!(key.is_valid());
        assert!(!Key::of(Vec::<String>::new()).is_valid());
        assert!(!Key::of(["a", ""]).is_valid());
    }

    #[test]
    fn test_key_ordering_is_elementwise() {
        let a = Key::of(["a", "z"]);
        let b = Key::of(["a.b"]);
        let c = Key::of(["b"]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_named_ref_params_filter() {
        let branch = NamedRef::branch("release/1");
        let tag = NamedRef::tag("v1");

        assert!(NamedRefsParams::default().matches(&branch));
        assert!(NamedRefsParams::default().matches(&tag));
        assert!(!NamedRefsParams::branches_only().matches(&tag));
        assert!(!NamedRefsParams::tags_only().matches(&branch));
        assert!(NamedRefsParams::default().with_prefix("release/").matches(&branch));
        assert!(!NamedRefsParams::default().with_prefix("release/").matches(&tag));
    }

    #[test]
    fn test_ref_kind_codes() {
        for kind in [RefKind::Branch, RefKind::Tag] {
            assert_eq!(RefKind::from_i64(kind.as_i64()), Some(kind));
        }
        assert_eq!(RefKind::from_i64(7), None);
    }
}
