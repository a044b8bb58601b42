//! SQLite-backed identity, attendance and audit storage.
//!
//! One `Mutex<Connection>` per store. Attendance transactions run as
//! `BEGIN IMMEDIATE` so two connections racing on the same database file
//! serialize on the write lock, and a partial unique index on
//! `(identity_id, date) WHERE check_out_time IS NULL` makes a second open span
//! impossible even if a caller skips the lookup.

use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::store::{AttendanceStore, AttendanceTx, AuditSink, GalleryProvider, StoreError};
use rollcall_core::{
    AttemptOutcome, AttendanceId, AttendanceRecord, AttendanceStatus, CheckMethod, Embedding,
    EmbeddingId, EmbeddingRecord, FaceBox, GalleryEntry, Identity, IdentityId, IdentityStatus,
    RecognitionAttempt,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    department   TEXT,
    status       TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id   INTEGER NOT NULL REFERENCES identities(id),
    vector        BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    is_primary    INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_embeddings_one_primary
    ON embeddings(identity_id) WHERE is_primary = 1;

CREATE TABLE IF NOT EXISTS attendance_records (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id      INTEGER NOT NULL REFERENCES identities(id),
    date             TEXT NOT NULL,
    check_in_time    TEXT,
    check_out_time   TEXT,
    status           TEXT NOT NULL CHECK (status IN ('present', 'late')),
    total_hours      REAL,
    check_in_method  TEXT NOT NULL,
    check_out_method TEXT,
    updated_at       TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_one_open_span
    ON attendance_records(identity_id, date) WHERE check_out_time IS NULL;

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance_records(date);

CREATE TABLE IF NOT EXISTS recognition_logs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id   INTEGER REFERENCES identities(id),
    recognized_at TEXT NOT NULL,
    similarity    REAL NOT NULL,
    outcome       TEXT NOT NULL CHECK (outcome IN ('recognized', 'unknown', 'validation_failed')),
    processing_ms INTEGER,
    face_box      TEXT
);

CREATE INDEX IF NOT EXISTS idx_recognition_logs_time ON recognition_logs(recognized_at);
";

const ATTENDANCE_COLUMNS: &str = "ar.id, ar.identity_id, ar.date, ar.check_in_time, \
     ar.check_out_time, ar.status, ar.total_hours, ar.check_in_method, ar.check_out_method";

/// Identity with enrollment counts, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityListing {
    #[serde(flatten)]
    pub identity: Identity,
    pub embedding_count: u32,
    pub has_primary: bool,
}

/// Attendance record joined with the identity's display name.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRow {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub display_name: String,
}

/// Audit entry joined with the identity's display name (when matched).
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRow {
    pub id: i64,
    #[serde(flatten)]
    pub attempt: RecognitionAttempt,
    pub display_name: Option<String>,
}

/// Optional filters for [`SqliteStore::list_attendance`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AttendanceFilter {
    pub date: Option<NaiveDate>,
    pub identity_id: Option<IdentityId>,
}

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// `busy_timeout` bounds how long a call waits for another writer before
    /// failing as [`StoreError::Unavailable`].
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(classify)?;
        conn.busy_timeout(busy_timeout).map_err(classify)?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(classify)?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "database opened");
        Self::init(conn, path.to_path_buf())
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(classify)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(classify)?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA_V1).map_err(classify)?;
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))
                .map_err(classify)?;
            tracing::info!(path = %path.display(), version = SCHEMA_VERSION, "schema applied");
        }

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {e}")))
    }

    // --- Enrollment ---

    /// Create an active identity whose first embedding is primary.
    pub fn create_identity(
        &self,
        display_name: &str,
        department: Option<&str>,
        embedding: &Embedding,
        now: NaiveDateTime,
    ) -> Result<IdentityId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(classify)?;
        tx.execute(
            "INSERT INTO identities (display_name, department, status, created_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?3)",
            params![display_name, department, now],
        )
        .map_err(classify)?;
        let identity_id = tx.last_insert_rowid();
        insert_embedding(&tx, identity_id, embedding, true, now)?;
        tx.commit().map_err(classify)?;

        tracing::info!(identity_id, display_name, dim = embedding.dim(), "identity enrolled");
        Ok(identity_id)
    }

    /// Attach another embedding. A primary embedding demotes the previous one.
    pub fn add_embedding(
        &self,
        identity_id: IdentityId,
        embedding: &Embedding,
        primary: bool,
        now: NaiveDateTime,
    ) -> Result<EmbeddingId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(classify)?;
        require_identity(&tx, identity_id)?;
        if primary {
            tx.execute(
                "UPDATE embeddings SET is_primary = 0 WHERE identity_id = ?1",
                params![identity_id],
            )
            .map_err(classify)?;
        }
        let embedding_id = insert_embedding(&tx, identity_id, embedding, primary, now)?;
        tx.commit().map_err(classify)?;

        tracing::info!(identity_id, embedding_id, primary, "embedding added");
        Ok(embedding_id)
    }

    /// Promote an existing embedding to primary for its identity.
    pub fn set_primary_embedding(
        &self,
        identity_id: IdentityId,
        embedding_id: EmbeddingId,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(classify)?;
        let owner: Option<IdentityId> = tx
            .query_row(
                "SELECT identity_id FROM embeddings WHERE id = ?1",
                params![embedding_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;
        if owner != Some(identity_id) {
            return Err(StoreError::NotFound(format!(
                "embedding {embedding_id} for identity {identity_id}"
            )));
        }
        tx.execute(
            "UPDATE embeddings SET is_primary = 0 WHERE identity_id = ?1",
            params![identity_id],
        )
        .map_err(classify)?;
        tx.execute(
            "UPDATE embeddings SET is_primary = 1 WHERE id = ?1",
            params![embedding_id],
        )
        .map_err(classify)?;
        tx.commit().map_err(classify)?;

        tracing::info!(identity_id, embedding_id, "primary embedding changed");
        Ok(())
    }

    /// Mark an identity inactive. Returns `false` if it already was.
    pub fn deactivate_identity(
        &self,
        identity_id: IdentityId,
        now: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE identities SET status = 'inactive', updated_at = ?2
                 WHERE id = ?1 AND status = 'active'",
                params![identity_id, now],
            )
            .map_err(classify)?;
        if changed == 0 {
            require_identity(&conn, identity_id)?;
            return Ok(false);
        }
        tracing::info!(identity_id, "identity deactivated");
        Ok(true)
    }

    // --- Queries ---

    pub fn list_identities(&self) -> Result<Vec<IdentityListing>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.display_name, i.department, i.status, i.created_at,
                        COUNT(e.id), COALESCE(MAX(e.is_primary), 0)
                 FROM identities i
                 LEFT JOIN embeddings e ON e.identity_id = i.id
                 GROUP BY i.id
                 ORDER BY i.created_at DESC, i.id DESC",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, IdentityId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, NaiveDateTime>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })
            .map_err(classify)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, display_name, department, status, created_at, embedding_count, has_primary) =
                row.map_err(classify)?;
            out.push(IdentityListing {
                identity: Identity {
                    id,
                    display_name,
                    department,
                    status: parse_identity_status(&status)?,
                    created_at,
                },
                embedding_count,
                has_primary,
            });
        }
        Ok(out)
    }

    pub fn list_embeddings(&self, identity_id: IdentityId) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, identity_id, vector, model_version, is_primary, created_at
                 FROM embeddings WHERE identity_id = ?1 ORDER BY id",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![identity_id], |row| {
                Ok((
                    row.get::<_, EmbeddingId>(0)?,
                    row.get::<_, IdentityId>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, NaiveDateTime>(5)?,
                ))
            })
            .map_err(classify)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, identity_id, blob, model_version, primary, created_at) =
                row.map_err(classify)?;
            out.push(EmbeddingRecord {
                id,
                identity_id,
                embedding: Embedding {
                    values: decode_vector(&blob)?,
                    model_version,
                },
                primary,
                created_at,
            });
        }
        Ok(out)
    }

    /// Attendance records, newest check-in first.
    pub fn list_attendance(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRow>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS}, i.display_name
             FROM attendance_records ar
             JOIN identities i ON i.id = ar.identity_id
             WHERE (?1 IS NULL OR ar.date = ?1)
               AND (?2 IS NULL OR ar.identity_id = ?2)
             ORDER BY ar.check_in_time DESC, ar.id DESC"
        );
        query_attendance_rows(&conn, &sql, params![filter.date, filter.identity_id])
    }

    /// Active identities present on `date`: still checked in, or checked out
    /// after an on-time arrival. Earliest arrival first.
    pub fn present_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRow>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS}, i.display_name
             FROM attendance_records ar
             JOIN identities i ON i.id = ar.identity_id
             WHERE ar.date = ?1
               AND ar.check_in_time IS NOT NULL
               AND (ar.check_out_time IS NULL OR ar.status = 'present')
               AND i.status = 'active'
             ORDER BY ar.check_in_time ASC"
        );
        query_attendance_rows(&conn, &sql, params![date])
    }

    /// Most recent recognition attempts, newest first.
    pub fn recent_attempts(&self, limit: u32) -> Result<Vec<AttemptRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT rl.id, rl.identity_id, rl.similarity, rl.outcome, rl.recognized_at,
                        rl.processing_ms, rl.face_box, i.display_name
                 FROM recognition_logs rl
                 LEFT JOIN identities i ON i.id = rl.identity_id
                 ORDER BY rl.recognized_at DESC, rl.id DESC
                 LIMIT ?1",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<IdentityId>>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, NaiveDateTime>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })
            .map_err(classify)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, identity_id, similarity, outcome, timestamp, processing_ms, face, name) =
                row.map_err(classify)?;
            let outcome = AttemptOutcome::parse(&outcome)
                .ok_or_else(|| StoreError::InvalidData(format!("attempt outcome {outcome:?}")))?;
            let face = match face {
                Some(json) => Some(
                    serde_json::from_str::<FaceBox>(&json)
                        .map_err(|e| StoreError::InvalidData(format!("face box: {e}")))?,
                ),
                None => None,
            };
            out.push(AttemptRow {
                id,
                attempt: RecognitionAttempt {
                    identity_id,
                    similarity: similarity as f32,
                    outcome,
                    timestamp,
                    processing_ms: processing_ms.map(|ms| ms.max(0) as u64),
                    face,
                },
                display_name: name,
            });
        }
        Ok(out)
    }

    pub fn active_identity_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM identities WHERE status = 'active'",
                [],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }
}

impl GalleryProvider for SqliteStore {
    fn fetch_active_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.display_name, e.vector, e.model_version
                 FROM embeddings e
                 JOIN identities i ON i.id = e.identity_id
                 WHERE e.is_primary = 1 AND i.status = 'active'
                 ORDER BY i.id",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, IdentityId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(classify)?;

        let mut gallery = Vec::new();
        for row in rows {
            let (identity_id, display_name, blob, model_version) = row.map_err(classify)?;
            match decode_vector(&blob) {
                Ok(values) => gallery.push(GalleryEntry {
                    identity_id,
                    display_name,
                    embedding: Embedding {
                        values,
                        model_version,
                    },
                }),
                Err(e) => {
                    tracing::warn!(identity_id, error = %e, "skipping unreadable primary embedding")
                }
            }
        }
        Ok(gallery)
    }
}

impl AttendanceStore for SqliteStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn AttendanceTx) -> Result<T, StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;
        // Dropping `tx` on an early return rolls back.
        let out = f(&mut SqliteTx { conn: &*tx })?;
        tx.commit().map_err(classify)?;
        Ok(out)
    }
}

impl AuditSink for SqliteStore {
    fn append(&self, attempt: &RecognitionAttempt) -> Result<(), StoreError> {
        let face = attempt
            .face
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("face box: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recognition_logs
                (identity_id, recognized_at, similarity, outcome, processing_ms, face_box)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attempt.identity_id,
                attempt.timestamp,
                f64::from(attempt.similarity),
                attempt.outcome.as_str(),
                attempt.processing_ms.map(|ms| ms as i64),
                face,
            ],
        )
        .map_err(classify)?;
        Ok(())
    }
}

struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl AttendanceTx for SqliteTx<'_> {
    fn find_open_span(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance_records ar
             WHERE ar.identity_id = ?1 AND ar.date = ?2 AND ar.check_out_time IS NULL"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(classify)?;
        let mut rows = stmt
            .query_map(params![identity_id, date], read_attendance)
            .map_err(classify)?;

        let first = rows.next().transpose().map_err(classify)?;
        if rows.next().is_some() {
            return Err(StoreError::InvalidData(format!(
                "identity {identity_id} has more than one open span on {date}"
            )));
        }
        first.map(RawAttendance::into_record).transpose()
    }

    fn find_latest_span(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance_records ar
             WHERE ar.identity_id = ?1 AND ar.date = ?2
             ORDER BY ar.check_in_time DESC, ar.id DESC
             LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![identity_id, date], read_attendance)
            .optional()
            .map_err(classify)?
            .map(RawAttendance::into_record)
            .transpose()
    }

    fn insert_check_in(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
        at: NaiveDateTime,
        status: AttendanceStatus,
        method: CheckMethod,
    ) -> Result<AttendanceId, StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO attendance_records
                (identity_id, date, check_in_time, status, check_in_method, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?3)",
            params![identity_id, date, at, status.as_str(), method.as_str()],
        );
        match inserted {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StoreError::OpenSpanConflict)
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn close_span(
        &mut self,
        attendance_id: AttendanceId,
        at: NaiveDateTime,
        total_hours: f64,
        method: CheckMethod,
    ) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE attendance_records
                 SET check_out_time = ?2, total_hours = ?3, check_out_method = ?4, updated_at = ?2
                 WHERE id = ?1 AND check_out_time IS NULL",
                params![attendance_id, at, total_hours, method.as_str()],
            )
            .map_err(classify)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("open attendance {attendance_id}")));
        }
        Ok(())
    }
}

/// Attendance row as read from SQLite, before enum parsing.
struct RawAttendance {
    id: AttendanceId,
    identity_id: IdentityId,
    date: NaiveDate,
    check_in: Option<NaiveDateTime>,
    check_out: Option<NaiveDateTime>,
    status: String,
    total_hours: Option<f64>,
    check_in_method: String,
    check_out_method: Option<String>,
}

impl RawAttendance {
    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let status = AttendanceStatus::parse(&self.status)
            .ok_or_else(|| StoreError::InvalidData(format!("attendance status {:?}", self.status)))?;
        let check_in_method = parse_method(&self.check_in_method)?;
        let check_out_method = self
            .check_out_method
            .as_deref()
            .map(parse_method)
            .transpose()?;
        Ok(AttendanceRecord {
            id: self.id,
            identity_id: self.identity_id,
            date: self.date,
            check_in: self.check_in,
            check_out: self.check_out,
            status,
            total_hours: self.total_hours,
            check_in_method,
            check_out_method,
        })
    }
}

fn read_attendance(row: &Row<'_>) -> rusqlite::Result<RawAttendance> {
    Ok(RawAttendance {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        date: row.get(2)?,
        check_in: row.get(3)?,
        check_out: row.get(4)?,
        status: row.get(5)?,
        total_hours: row.get(6)?,
        check_in_method: row.get(7)?,
        check_out_method: row.get(8)?,
    })
}

fn query_attendance_rows(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<AttendanceRow>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(classify)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((read_attendance(row)?, row.get::<_, String>(9)?))
        })
        .map_err(classify)?;

    let mut out = Vec::new();
    for row in rows {
        let (raw, display_name) = row.map_err(classify)?;
        out.push(AttendanceRow {
            record: raw.into_record()?,
            display_name,
        });
    }
    Ok(out)
}

fn insert_embedding(
    conn: &Connection,
    identity_id: IdentityId,
    embedding: &Embedding,
    primary: bool,
    now: NaiveDateTime,
) -> Result<EmbeddingId, StoreError> {
    conn.execute(
        "INSERT INTO embeddings (identity_id, vector, dim, model_version, is_primary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            identity_id,
            encode_vector(&embedding.values),
            embedding.dim() as i64,
            embedding.model_version,
            primary,
            now,
        ],
    )
    .map_err(classify)?;
    Ok(conn.last_insert_rowid())
}

fn require_identity(conn: &Connection, identity_id: IdentityId) -> Result<(), StoreError> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
            params![identity_id],
            |row| row.get(0),
        )
        .map_err(classify)?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("identity {identity_id}")))
    }
}

fn parse_identity_status(s: &str) -> Result<IdentityStatus, StoreError> {
    IdentityStatus::parse(s).ok_or_else(|| StoreError::InvalidData(format!("identity status {s:?}")))
}

fn parse_method(s: &str) -> Result<CheckMethod, StoreError> {
    CheckMethod::parse(s).ok_or_else(|| StoreError::InvalidData(format!("check method {s:?}")))
}

/// Little-endian f32 packing for embedding blobs.
fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::InvalidData(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Map SQLite failures onto the core's storage taxonomy.
fn classify(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::ReadOnly,
        ) => StoreError::Unavailable(err.to_string()),
        Some(ErrorCode::ConstraintViolation) => match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                StoreError::NotFound(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        },
        _ => StoreError::Backend(err.to_string()),
    }
}
