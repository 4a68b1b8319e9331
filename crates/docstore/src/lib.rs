//! Durable store for collaboration documents.
//!
//! Whole documents are the unit of synchronization: readers always see a
//! complete `(content, version)` pair and writers commit through a single
//! conditional UPDATE keyed by the expected version. That compare-and-set is
//! the only concurrency-control primitive in the system.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// User identifier, supplied by the identity provider and trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque reference to an external record (e.g. a task) to which a document
/// is attached 1:1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Document type. Affects rendering only, never sync behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    FreeText,
    Structured,
}

impl DocumentKind {
    fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::FreeText => "free_text",
            DocumentKind::Structured => "structured",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown document kind: {0}")]
pub struct UnknownKind(String);

impl FromStr for DocumentKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free_text" => Ok(DocumentKind::FreeText),
            "structured" => Ok(DocumentKind::Structured),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

impl ToSql for DocumentId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for DocumentId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for UserId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for UserId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for EntityId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.clone()))
    }
}

impl FromSql for EntityId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Self(value.as_str()?.to_string()))
    }
}

impl ToSql for DocumentKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DocumentKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A collaboration document as stored.
///
/// `version` increases by exactly one per successful write and is the sole
/// concurrency-control token. `participants` is ordered by first join so
/// colour assignment stays stable; it never shrinks on disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub kind: DocumentKind,
    pub content: String,
    pub version: u64,
    pub participants: Vec<UserId>,
    pub linked_entity_id: Option<EntityId>,
    pub created_by: UserId,
    pub updated_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub kind: DocumentKind,
    pub created_by: UserId,
    pub linked_entity_id: Option<EntityId>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested document (or linked entity) does not exist. Fatal to
    /// the calling operation; not retried.
    #[error("document not found")]
    NotFound,

    /// A document already exists for the given linked entity. Callers should
    /// re-fetch by entity id and proceed with the existing document.
    #[error("a document is already linked to entity {0}")]
    AlreadyLinked(EntityId),

    /// The expected version did not match the stored version. Nothing was
    /// mutated; the current state is carried so callers can converge.
    #[error("write conflict: store is at version {current_version}")]
    Conflict {
        current_version: u64,
        current_content: String,
    },

    /// Underlying storage failure. Retryable by the caller.
    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage unavailable: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DocumentStore {
    conn: Mutex<Connection>,
}

impl DocumentStore {
    /// Open (or create) the store at `path`, applying pragmas and migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and single-process setups.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: DocumentId) -> Result<Document, StoreError> {
        let conn = self.conn();
        get_document(&conn, id)
    }

    pub fn get_by_linked_entity(&self, entity: &EntityId) -> Result<Document, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id FROM documents WHERE linked_entity_id = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![entity])?;
        match rows.next()? {
            Some(row) => {
                let id: DocumentId = row.get(0)?;
                drop(rows);
                drop(stmt);
                get_document(&conn, id)
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Create a document at version 0 with empty content.
    ///
    /// The linked-entity invariant is enforced by the UNIQUE index, not by a
    /// read-then-write check, so racing creators cannot both succeed.
    pub fn create(&self, new: NewDocument) -> Result<Document, StoreError> {
        let conn = self.conn();
        let id = DocumentId::new();
        let now = Utc::now().timestamp();
        let result = conn.execute(
            "INSERT INTO documents(id, title, kind, content, version, linked_entity_id, created_by, updated_by, created_at, updated_at) \
             VALUES(?1, ?2, ?3, '', 0, ?4, ?5, ?5, ?6, ?6)",
            params![id, new.title, new.kind, new.linked_entity_id, new.created_by, now],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && new.linked_entity_id.is_some() =>
            {
                let entity = new
                    .linked_entity_id
                    .clone()
                    .unwrap_or_else(|| EntityId::new(""));
                return Err(StoreError::AlreadyLinked(entity));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(document = %id, linked_entity = ?new.linked_entity_id, "created document");
        get_document(&conn, id)
    }

    /// Compare-and-set write.
    ///
    /// Atomically, iff the stored version equals `expected_version`, replaces
    /// the content, bumps the version by one and stamps `updated_at` /
    /// `updated_by`. On a mismatch nothing changes and the current version
    /// and content come back in the `Conflict`. The conditional UPDATE is a
    /// single indivisible statement; there is no read-then-write gap visible
    /// to other writers.
    pub fn write(
        &self,
        id: DocumentId,
        new_content: &str,
        writer: UserId,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let conn = self.conn();
        let now = Utc::now().timestamp();
        let changed = conn.execute(
            "UPDATE documents SET content = ?3, version = version + 1, updated_by = ?4, updated_at = ?5 \
             WHERE id = ?1 AND version = ?2",
            params![id, expected_version as i64, new_content, writer, now],
        )?;
        if changed == 1 {
            let new_version = expected_version + 1;
            debug!(document = %id, version = new_version, writer = %writer, "document written");
            return Ok(new_version);
        }
        // Zero rows changed: either the document is gone or the version moved.
        let current = get_document(&conn, id)?;
        debug!(
            document = %id,
            expected = expected_version,
            actual = current.version,
            "write conflict"
        );
        Err(StoreError::Conflict {
            current_version: current.version,
            current_content: current.content,
        })
    }

    /// Idempotent set-insert; preserves the first-join ordinal.
    pub fn add_participant(&self, id: DocumentId, user: UserId) -> Result<(), StoreError> {
        let conn = self.conn();
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::NotFound);
        }
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT OR IGNORE INTO participants(document_id, user_id, ordinal, joined_at) \
             VALUES(?1, ?2, (SELECT COUNT(*) FROM participants WHERE document_id = ?1), ?3)",
            params![id, user, now],
        )?;
        Ok(())
    }

    /// Participants in first-join order.
    pub fn participants(&self, id: DocumentId) -> Result<Vec<UserId>, StoreError> {
        let conn = self.conn();
        load_participants(&conn, id)
    }
}

fn load_participants(conn: &Connection, id: DocumentId) -> Result<Vec<UserId>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM participants WHERE document_id = ?1 ORDER BY ordinal ASC")?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, UserId>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn get_document(conn: &Connection, id: DocumentId) -> Result<Document, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, kind, content, version, linked_entity_id, created_by, updated_by, created_at, updated_at \
         FROM documents WHERE id = ?1 LIMIT 1",
    )?;
    let mut rows = stmt.query(params![id])?;
    let Some(row) = rows.next()? else {
        return Err(StoreError::NotFound);
    };
    let version: i64 = row.get(4)?;
    let created_at: i64 = row.get(8)?;
    let updated_at: i64 = row.get(9)?;
    let mut doc = Document {
        id: row.get(0)?,
        title: row.get(1)?,
        kind: row.get(2)?,
        content: row.get(3)?,
        version: version as u64,
        participants: Vec::new(),
        linked_entity_id: row.get(5)?,
        created_by: row.get(6)?,
        updated_by: row.get(7)?,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
    };
    drop(rows);
    drop(stmt);
    doc.participants = load_participants(conn, id)?;
    Ok(doc)
}

fn apply_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    Ok(())
}
