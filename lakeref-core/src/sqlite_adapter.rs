//! SQLite-backed adapter
//!
//! One database file holds references, commits and the initialization flag.
//! The connection runs in WAL mode; every mutating operation is a single
//! immediate transaction, so a commit's entry and its branch move become
//! visible together.
//!
//! Commit rows keep the scan acceleration in its own column. Rewriting it is
//! a conditional update on that column alone.

use crate::adapter::{
    validate_ref_name, CommitIter, DatabaseAdapter, RefIter, StoreError, StoreResult,
};
use crate::commit_log::{build_commit, CommitLogEntry, ScanAcceleration};
use crate::config::AdapterConfig;
use crate::hash::Hash;
use crate::model::{CommitParams, NamedRef, NamedRefsParams, RefKind, ReferenceInfo};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// File name of the database inside a repository directory
pub const DATABASE_FILE_NAME: &str = "lakeref.sqlite";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS repo_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
    CREATE TABLE IF NOT EXISTS named_refs (
        name TEXT PRIMARY KEY,
        kind INTEGER NOT NULL,
        hash BLOB NOT NULL
    ) WITHOUT ROWID;
    CREATE TABLE IF NOT EXISTS commit_log (
        hash BLOB PRIMARY KEY,
        seq INTEGER NOT NULL,
        entry BLOB NOT NULL,
        acceleration BLOB NOT NULL
    ) WITHOUT ROWID;
";

/// SQLite-backed commit graph store
pub struct SqliteAdapter {
    config: AdapterConfig,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteAdapter {
    /// Open (or create) a database file
    pub fn open(db_path: &Path, config: AdapterConfig) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", "-64000")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("opened SQLite repository at {:?}", db_path);
        Ok(Self {
            config,
            path: Some(db_path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Open the repository stored in `repo_dir`, reading its configuration file
    pub fn open_dir(repo_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(repo_dir)?;
        let config = AdapterConfig::load(repo_dir)?;
        Self::open(&repo_dir.join(DATABASE_FILE_NAME), config)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory(config: AdapterConfig) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            config,
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn fetch_ref_page(&self, after: Option<&str>, limit: usize) -> StoreResult<Vec<ReferenceInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT name, kind, hash FROM named_refs WHERE name > ?1 ORDER BY name LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after.unwrap_or(""), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut page = Vec::new();
        for row in rows {
            let (name, kind, hash) = row?;
            page.push(ReferenceInfo::new(
                NamedRef::new(decode_kind(kind)?, name),
                decode_hash(&hash)?,
            ));
        }
        Ok(page)
    }

    fn fetch_page(&self, after: Option<Hash>, limit: usize) -> StoreResult<Vec<CommitLogEntry>> {
        let conn = self.conn.lock();
        let lower: Vec<u8> = after.map(|h| h.as_bytes().to_vec()).unwrap_or_default();
        let mut stmt = conn.prepare_cached(
            "SELECT entry, acceleration FROM commit_log WHERE hash > ?1 ORDER BY hash LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![lower, limit as i64], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut page = Vec::new();
        for row in rows {
            let (entry, acceleration) = row?;
            page.push(decode_entry(&entry, &acceleration)?);
        }
        Ok(page)
    }
}

fn decode_entry(entry: &[u8], acceleration: &[u8]) -> StoreResult<CommitLogEntry> {
    let mut decoded: CommitLogEntry = bincode::deserialize(entry)?;
    decoded.acceleration = bincode::deserialize(acceleration)?;
    Ok(decoded)
}

fn is_initialized(conn: &Connection) -> StoreResult<bool> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM repo_state WHERE key = 'initialized'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.as_deref() == Some("1"))
}

fn ref_count(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM named_refs", [], |row| row.get(0))?)
}

fn read_ref(conn: &Connection, name: &str) -> StoreResult<Option<(RefKind, Hash)>> {
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(
            "SELECT kind, hash FROM named_refs WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((kind, hash)) => Ok(Some((decode_kind(kind)?, decode_hash(&hash)?))),
    }
}

fn resolve(conn: &Connection, named_ref: &NamedRef) -> StoreResult<Hash> {
    match read_ref(conn, named_ref.name())? {
        Some((kind, hash)) if kind == named_ref.kind() => Ok(hash),
        _ => Err(StoreError::ReferenceNotFound(named_ref.name().to_string())),
    }
}

fn write_ref(conn: &Connection, name: &str, kind: RefKind, hash: &Hash) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO named_refs (name, kind, hash) VALUES (?1, ?2, ?3) \
         ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, hash = excluded.hash",
        params![name, kind.as_i64(), hash.as_bytes().as_slice()],
    )?;
    Ok(())
}

fn fetch(conn: &Connection, hash: &Hash) -> StoreResult<Option<CommitLogEntry>> {
    let row: Option<(Vec<u8>, Vec<u8>)> = conn
        .query_row(
            "SELECT entry, acceleration FROM commit_log WHERE hash = ?1",
            params![hash.as_bytes().as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(entry, acceleration)| decode_entry(&entry, &acceleration))
        .transpose()
}

fn commit_exists(conn: &Connection, hash: &Hash) -> StoreResult<bool> {
    if hash.is_no_ancestor() {
        return Ok(true);
    }
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM commit_log WHERE hash = ?1",
            params![hash.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_entry(conn: &Connection, entry: &CommitLogEntry) -> StoreResult<()> {
    let body = bincode::serialize(&entry.without_acceleration())?;
    let acceleration = bincode::serialize(&entry.acceleration)?;
    conn.execute(
        "INSERT OR IGNORE INTO commit_log (hash, seq, entry, acceleration) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.hash.as_bytes().as_slice(),
            entry.commit_seq as i64,
            body,
            acceleration
        ],
    )?;
    Ok(())
}

fn decode_kind(kind: i64) -> StoreResult<RefKind> {
    RefKind::from_i64(kind)
        .ok_or_else(|| StoreError::Corrupted(format!("unknown reference kind {}", kind)))
}

fn decode_hash(bytes: &[u8]) -> StoreResult<Hash> {
    Hash::from_slice(bytes)
        .ok_or_else(|| StoreError::Corrupted(format!("hash of {} bytes", bytes.len())))
}

impl DatabaseAdapter for SqliteAdapter {
    fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn initialize_repo(&self, default_branch: &str) -> StoreResult<()> {
        validate_ref_name(&NamedRef::branch(default_branch))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if is_initialized(&tx)? || ref_count(&tx)? > 0 {
            return Err(StoreError::RepositoryAlreadyInitialized);
        }
        tx.execute(
            "INSERT OR REPLACE INTO repo_state (key, value) VALUES ('initialized', '1')",
            [],
        )?;
        write_ref(&tx, default_branch, RefKind::Branch, &Hash::no_ancestor())?;
        tx.commit()?;
        tracing::info!("initialized repository with branch {}", default_branch);
        Ok(())
    }

    fn erase_repo(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DELETE FROM commit_log; DELETE FROM named_refs; DELETE FROM repo_state;",
        )?;
        tx.commit()?;
        tracing::info!("erased repository");
        Ok(())
    }

    fn create(&self, named_ref: &NamedRef, target: Hash) -> StoreResult<Hash> {
        validate_ref_name(named_ref)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if read_ref(&tx, named_ref.name())?.is_some() {
            return Err(StoreError::ReferenceAlreadyExists(named_ref.name().to_string()));
        }
        if !commit_exists(&tx, &target)? {
            return Err(StoreError::ReferenceNotFound(target.to_string()));
        }
        write_ref(&tx, named_ref.name(), named_ref.kind(), &target)?;
        tx.commit()?;
        Ok(target)
    }

    fn delete(&self, named_ref: &NamedRef, expected: Option<Hash>) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let actual = resolve(&tx, named_ref)?;
        if let Some(expected) = expected {
            if expected != actual {
                return Err(StoreError::ReferenceConflict {
                    reference: named_ref.name().to_string(),
                    expected,
                    actual,
                });
            }
        }
        tx.execute(
            "DELETE FROM named_refs WHERE name = ?1",
            params![named_ref.name()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn commit(&self, params: CommitParams) -> StoreResult<Hash> {
        let branch = NamedRef::branch(params.to_branch.as_str());

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let head = resolve(&tx, &branch)?;
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
            let lookup = |hash: &Hash| fetch(&tx, hash);
            build_commit(&params, head, &lookup, &self.config)?
        };
        insert_entry(&tx, &entry)?;
        write_ref(&tx, &params.to_branch, RefKind::Branch, &entry.hash)?;
        tx.commit()?;

        tracing::debug!(
            "committed {} to {} (seq {})",
            entry.hash.short(),
            params.to_branch,
            entry.commit_seq
        );
        Ok(entry.hash)
    }

    fn named_refs(&self, params: &NamedRefsParams) -> StoreResult<RefIter<'_>> {
        Ok(Box::new(RefScan {
            adapter: self,
            params: params.clone(),
            last: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn named_ref(&self, name: &str) -> StoreResult<ReferenceInfo> {
        let conn = self.conn.lock();
        match read_ref(&conn, name)? {
            Some((kind, hash)) => Ok(ReferenceInfo::new(NamedRef::new(kind, name), hash)),
            None => Err(StoreError::ReferenceNotFound(name.to_string())),
        }
    }

    fn scan_all_commit_log_entries(&self) -> StoreResult<CommitIter<'_>> {
        Ok(Box::new(CommitScan {
            adapter: self,
            last: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn fetch_commit(&self, hash: &Hash) -> StoreResult<Option<CommitLogEntry>> {
        let conn = self.conn.lock();
        fetch(&conn, hash)
    }

    fn write_commits(&self, entries: &[CommitLogEntry]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for entry in entries {
            insert_entry(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_acceleration(
        &self,
        hash: &Hash,
        expected: &ScanAcceleration,
        updated: &ScanAcceleration,
    ) -> StoreResult<bool> {
        let expected_bytes = bincode::serialize(expected)?;
        let updated_bytes = bincode::serialize(updated)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT acceleration FROM commit_log WHERE hash = ?1",
                params![hash.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(StoreError::CommitNotFound(*hash))?;
        if current == updated_bytes {
            return Ok(false);
        }
        if current != expected_bytes {
            return Err(StoreError::ConcurrentAccelerationUpdate(*hash));
        }
        tx.execute(
            "UPDATE commit_log SET acceleration = ?1 WHERE hash = ?2",
            params![updated_bytes, hash.as_bytes().as_slice()],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

/// Paginated scan over the commit table in hash order
///
/// Each page takes the connection lock on its own, so a long scan never
/// blocks writers for longer than one page.
struct CommitScan<'a> {
    adapter: &'a SqliteAdapter,
    last: Option<Hash>,
    buffer: VecDeque<CommitLogEntry>,
    exhausted: bool,
}

impl Iterator for CommitScan<'_> {
    type Item = StoreResult<CommitLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            let page_size = self.adapter.config.scan_page_size.max(1);
            match self.adapter.fetch_page(self.last, page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let entry = self.buffer.pop_front()?;
        self.last = Some(entry.hash);
        Some(Ok(entry))
    }
}

/// Paginated scan over the reference table in name order
///
/// Filtering happens per page; paging itself follows the unfiltered names.
struct RefScan<'a> {
    adapter: &'a SqliteAdapter,
    params: NamedRefsParams,
    last: Option<String>,
    buffer: VecDeque<ReferenceInfo>,
    exhausted: bool,
}

impl Iterator for RefScan<'_> {
    type Item = StoreResult<ReferenceInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(info) = self.buffer.pop_front() {
                if self.params.matches(&info.named_ref) {
                    return Some(Ok(info));
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            let page_size = self.adapter.config.scan_page_size.max(1);
            match self.adapter.fetch_ref_page(self.last.as_deref(), page_size) {
                Ok(page) => {
                    self.exhausted = page.len() < page_size;
                    if let Some(info) = page.last() {
                        self.last = Some(info.named_ref.name().to_string());
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentId, Key, KeyWithBytes};
    use tempfile::TempDir;

    fn put(name: &str) -> KeyWithBytes {
        KeyWithBytes::of(Key::of(["t", name]), ContentId::of(name), 0, b"v".to_vec())
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let hash = {
            let adapter = SqliteAdapter::open_dir(dir.path()).unwrap();
            adapter.initialize_repo("main").unwrap();
            adapter
                .commit(CommitParams::new("main", b"first".to_vec()).with_put(put("a")))
                .unwrap()
        };

        let adapter = SqliteAdapter::open_dir(dir.path()).unwrap();
        assert_eq!(adapter.named_ref("main").unwrap().hash, hash);
        let entry = adapter.fetch_commit(&hash).unwrap().unwrap();
        assert!(entry.verify_hash());
        assert_eq!(entry.acceleration.ancestors, vec![Hash::no_ancestor()]);
    }

    #[test]
    fn test_scan_pages_through_all_commits() {
        let config = AdapterConfig::default().with_scan_page_size(2);
        let adapter = SqliteAdapter::open_in_memory(config).unwrap();
        adapter.initialize_repo("main").unwrap();
        for i in 0..5 {
            adapter
                .commit(
                    CommitParams::new("main", format!("c{}", i).into_bytes())
                        .with_put(put(&format!("k{}", i))),
                )
                .unwrap();
        }

        let hashes: Vec<Hash> = adapter
            .scan_all_commit_log_entries()
            .unwrap()
            .map(|e| e.unwrap().hash)
            .collect();
        assert_eq!(hashes.len(), 5);
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_failed_commit_leaves_no_trace() {
        let adapter = SqliteAdapter::open_in_memory(AdapterConfig::default()).unwrap();
        adapter.initialize_repo("main").unwrap();

        let result = adapter.commit(
            CommitParams::new("main", b"bad".to_vec())
                .with_put(put("a"))
                .with_delete(Key::of(["t", "a"])),
        );
        assert!(matches!(result, Err(StoreError::DuplicateKeyConflict { .. })));
        assert_eq!(adapter.scan_all_commit_log_entries().unwrap().count(), 0);
        assert_eq!(adapter.named_ref("main").unwrap().hash, Hash::no_ancestor());
    }

    #[test]
    fn test_erase_resets_initialization() {
        let adapter = SqliteAdapter::open_in_memory(AdapterConfig::default()).unwrap();
        adapter.initialize_repo("main").unwrap();
        adapter.erase_repo().unwrap();
        assert_eq!(adapter.named_refs(&NamedRefsParams::default()).unwrap().count(), 0);
        adapter.initialize_repo("other").unwrap();
    }

    #[test]
    fn test_named_refs_page_in_name_order() {
        let config = AdapterConfig::default().with_scan_page_size(2);
        let adapter = SqliteAdapter::open_in_memory(config).unwrap();
        adapter.initialize_repo("main").unwrap();
        for name in ["release/2", "dev", "release/1", "zeta"] {
            adapter.create(&NamedRef::branch(name), Hash::no_ancestor()).unwrap();
        }
        adapter.create(&NamedRef::tag("release/v1"), Hash::no_ancestor()).unwrap();

        let names: Vec<String> = adapter
            .named_refs(&NamedRefsParams::default())
            .unwrap()
            .map(|r| r.unwrap().named_ref.name().to_string())
            .collect();
        assert_eq!(names, vec!["dev", "main", "release/1", "release/2", "release/v1", "zeta"]);

        let release_branches: Vec<NamedRef> = adapter
            .named_refs(&NamedRefsParams::branches_only().with_prefix("release/"))
            .unwrap()
            .map(|r| r.unwrap().named_ref)
            .collect();
        assert_eq!(
            release_branches,
            vec![NamedRef::branch("release/1"), NamedRef::branch("release/2")]
        );
    }
}
