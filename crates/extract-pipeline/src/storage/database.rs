//! SQLite document store with a guarded status machine
//!
//! Every transition is a conditional update on the current status, so two
//! callers racing on the same record cannot both win.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DocumentRecord, DocumentStatus, NewDocument};

const SELECT_COLUMNS: &str = "SELECT id, status, institution, institution_code, year, \
     original_name, stored_path, uploaded_by, uploaded_at, processed_at, saved_at, \
     extracted_data, normalized_data, error FROM documents";

/// SQLite-backed document lifecycle store
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::persistence(format!("Failed to open database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        tracing::info!("Document store opened at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::persistence(format!("Failed to open in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run raw SQL against the store (for testing)
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
        "#,
        )
        .map_err(|e| Error::persistence(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                institution TEXT NOT NULL,
                institution_code TEXT NOT NULL,
                year INTEGER NOT NULL,
                original_name TEXT NOT NULL,
                stored_path TEXT NOT NULL,
                uploaded_by TEXT,
                uploaded_at TEXT NOT NULL,
                processed_at TEXT,
                saved_at TEXT,
                extracted_data TEXT,
                normalized_data TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
            CREATE INDEX IF NOT EXISTS idx_documents_uploaded_at ON documents(uploaded_at);

            -- At most one saved record per (institution, year)
            CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_saved_unique
                ON documents(institution_code, year) WHERE status = 'saved';
        "#,
        )
        .map_err(|e| Error::persistence(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    /// Insert a fresh record in `uploaded`
    pub fn create(&self, new: NewDocument) -> Result<DocumentRecord> {
        self.insert(DocumentRecord::uploaded(new))
    }

    /// Insert a fresh record directly in `processing`.
    ///
    /// Used by the streaming flow, whose run owns the record from the start.
    pub fn create_processing(&self, new: NewDocument) -> Result<DocumentRecord> {
        self.insert(DocumentRecord::processing(new))
    }

    fn insert(&self, record: DocumentRecord) -> Result<DocumentRecord> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO documents (id, status, institution, institution_code, year, original_name,
                stored_path, uploaded_by, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.status.as_str(),
                record.institution,
                record.institution_code,
                record.year,
                record.original_name,
                record.stored_path.to_string_lossy().to_string(),
                record.uploaded_by,
                record.uploaded_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::persistence(format!("Failed to insert document: {}", e)))?;

        tracing::debug!(
            "Document {} created in {} for {} / {}",
            record.id,
            record.status,
            record.institution,
            record.year
        );
        Ok(record)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock();
        fetch(&conn, id)
    }

    /// Like `get`, but a missing record is an error
    pub fn require(&self, id: Uuid) -> Result<DocumentRecord> {
        self.get(id)?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// List records, newest first, optionally filtered by status
    pub fn list(&self, status: Option<DocumentStatus>) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn.lock();

        let records = match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(&format!("{} WHERE status = ?1 ORDER BY uploaded_at DESC", SELECT_COLUMNS))?;
                let rows = stmt.query_map(params![status.as_str()], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY uploaded_at DESC", SELECT_COLUMNS))?;
                let rows = stmt.query_map([], row_to_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(records)
    }

    /// `uploaded -> processing` as a single compare-and-set
    pub fn begin_processing(&self, id: Uuid) -> Result<DocumentRecord> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                &format!(
                    "UPDATE documents SET status = 'processing', error = NULL
                     WHERE id = ?1 AND {}",
                    guard(DocumentStatus::Processing)
                ),
                params![id.to_string()],
            )
            .map_err(|e| Error::persistence(format!("Failed to begin processing: {}", e)))?;

        if changed == 0 {
            return Err(rejected(&conn, id, DocumentStatus::Processing)?);
        }
        fetch(&conn, id)?.ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// `processing -> processed` with the extraction results
    pub fn mark_processed(
        &self,
        id: Uuid,
        extracted: Option<&Value>,
        normalized: Option<&Value>,
    ) -> Result<DocumentRecord> {
        let extracted = extracted.map(serde_json::to_string).transpose()?;
        let normalized = normalized.map(serde_json::to_string).transpose()?;

        let conn = self.conn.lock();
        let changed = conn
            .execute(
                &format!(
                    "UPDATE documents
                     SET status = 'processed', processed_at = ?2, extracted_data = ?3,
                         normalized_data = ?4, error = NULL
                     WHERE id = ?1 AND {}",
                    guard(DocumentStatus::Processed)
                ),
                params![id.to_string(), Utc::now().to_rfc3339(), extracted, normalized],
            )
            .map_err(|e| Error::persistence(format!("Failed to mark processed: {}", e)))?;

        if changed == 0 {
            return Err(rejected(&conn, id, DocumentStatus::Processed)?);
        }
        fetch(&conn, id)?.ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// `processing -> error` with the final failure message
    pub fn mark_error(&self, id: Uuid, message: &str) -> Result<DocumentRecord> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                &format!(
                    "UPDATE documents SET status = 'error', processed_at = ?2, error = ?3
                     WHERE id = ?1 AND {}",
                    guard(DocumentStatus::Error)
                ),
                params![id.to_string(), Utc::now().to_rfc3339(), message],
            )
            .map_err(|e| Error::persistence(format!("Failed to mark error: {}", e)))?;

        if changed == 0 {
            return Err(rejected(&conn, id, DocumentStatus::Error)?);
        }
        fetch(&conn, id)?.ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// `processed -> saved` with the approved data.
    ///
    /// Fails with `Conflict` when a different record is already saved for the
    /// same institution and year.
    pub fn mark_saved(&self, id: Uuid, approved: &Value) -> Result<DocumentRecord> {
        let approved = serde_json::to_string(approved)?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::persistence(format!("Failed to begin transaction: {}", e)))?;

        let record = fetch(&tx, id)?.ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        if !record.status.can_transition_to(DocumentStatus::Saved) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: record.status,
                to: DocumentStatus::Saved,
            });
        }

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM documents
                 WHERE institution_code = ?1 AND year = ?2 AND status = 'saved' AND id != ?3
                 LIMIT 1",
                params![record.institution_code, record.year, id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(other) = existing {
            return Err(Error::Conflict(format!(
                "a saved record already exists for {} / {} ({})",
                record.institution, record.year, other
            )));
        }

        let changed = tx
            .execute(
                &format!(
                    "UPDATE documents SET status = 'saved', saved_at = ?2, normalized_data = ?3
                     WHERE id = ?1 AND {}",
                    guard(DocumentStatus::Saved)
                ),
                params![id.to_string(), Utc::now().to_rfc3339(), approved],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(code, _)
                    if code.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::Conflict(format!(
                        "a saved record already exists for {} / {}",
                        record.institution, record.year
                    ))
                }
                other => Error::persistence(format!("Failed to mark saved: {}", other)),
            })?;

        if changed == 0 {
            return Err(rejected(&tx, id, DocumentStatus::Saved)?);
        }

        let saved = fetch(&tx, id)?.ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        tx.commit()
            .map_err(|e| Error::persistence(format!("Failed to commit save: {}", e)))?;
        Ok(saved)
    }

    /// Delete a record, returning it so the caller can remove its file
    pub fn delete(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock();
        let Some(record) = fetch(&conn, id)? else {
            return Ok(None);
        };
        conn.execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
            .map_err(|e| Error::persistence(format!("Failed to delete document: {}", e)))?;
        Ok(Some(record))
    }
}

fn fetch(conn: &Connection, id: Uuid) -> Result<Option<DocumentRecord>> {
    let mut stmt = conn
        .prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
        .map_err(|e| Error::persistence(format!("Failed to prepare query: {}", e)))?;

    let record = stmt
        .query_row(params![id.to_string()], row_to_record)
        .optional()
        .map_err(|e| Error::persistence(format!("Failed to get document: {}", e)))?;

    Ok(record)
}

/// SQL predicate admitting exactly the statuses that may move to `to`
fn guard(to: DocumentStatus) -> String {
    let sources: Vec<String> = to.sources().map(|s| format!("'{}'", s.as_str())).collect();
    if sources.is_empty() {
        return "0".to_string();
    }
    format!("status IN ({})", sources.join(", "))
}

/// Explain why a guarded update touched no row
fn rejected(conn: &Connection, id: Uuid, to: DocumentStatus) -> Result<Error> {
    Ok(match fetch(conn, id)? {
        None => Error::DocumentNotFound(id.to_string()),
        Some(record) => Error::InvalidTransition {
            id: id.to_string(),
            from: record.status,
            to,
        },
    })
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc)))
}

fn parse_json(value: Option<String>) -> Option<Value> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DocumentRecord> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(1)?;
    let stored_path: String = row.get(6)?;
    let uploaded_at: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = DocumentStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(1, status_str.clone(), rusqlite::types::Type::Text)
    })?;

    Ok(DocumentRecord {
        id,
        status,
        institution: row.get(2)?,
        institution_code: row.get(3)?,
        year: row.get(4)?,
        original_name: row.get(5)?,
        stored_path: PathBuf::from(stored_path),
        uploaded_by: row.get(7)?,
        uploaded_at: parse_time(Some(uploaded_at)).unwrap_or_else(Utc::now),
        processed_at: parse_time(row.get(9)?),
        saved_at: parse_time(row.get(10)?),
        extracted_data: parse_json(row.get(11)?),
        normalized_data: parse_json(row.get(12)?),
        error: row.get(13)?,
    })
}
