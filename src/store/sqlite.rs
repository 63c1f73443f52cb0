//! SQLite-backed token store.
//!
//! Every public operation is a single durable transaction; the identity
//! merge in particular executes find-old → delete-new → rename-old →
//! apply-update atomically so no reader ever observes a half-merged state.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{AuthorizationRecord, IdentityBinding};
use crate::error::{BrokerError, BrokerResult};

/// Persists authorization flows in SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE authorizations (
///     code_verifier   TEXT NOT NULL,
///     state           TEXT NOT NULL UNIQUE,
///     created_at      TEXT NOT NULL,
///     code            TEXT,
///     access_token    TEXT,
///     refresh_token   TEXT,
///     expires_in      INTEGER,
///     token_issued_at INTEGER,
///     nickname        TEXT,
///     external_id     TEXT UNIQUE,
///     refresh_failures INTEGER NOT NULL DEFAULT 0,
///     usage_count     INTEGER NOT NULL DEFAULT 0
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - SQLite itself is thread-safe with serialized mode
pub struct TokenStore {
    conn: Mutex<Connection>,
}

impl TokenStore {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> BrokerResult<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    fn create_table(&self) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS authorizations (
                code_verifier    TEXT NOT NULL,
                state            TEXT NOT NULL UNIQUE,
                created_at       TEXT NOT NULL,
                code             TEXT,
                access_token     TEXT,
                refresh_token    TEXT,
                expires_in       INTEGER,
                token_issued_at  INTEGER,
                nickname         TEXT,
                external_id      TEXT UNIQUE,
                refresh_failures INTEGER NOT NULL DEFAULT 0,
                usage_count      INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    /// Inserts a new flow in the created state (verifier + state only).
    ///
    /// Fails with `Conflict` if the `state` is already taken; the caller
    /// must regenerate and retry.
    pub fn create_flow(&self, verifier: &str, state: &str) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        let created_at = chrono::Utc::now();
        let result = conn.execute(
            "INSERT INTO authorizations (code_verifier, state, created_at) VALUES (?1, ?2, ?3)",
            params![verifier, state, created_at],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(BrokerError::Conflict(state.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the PKCE verifier for a flow, or `NotFound`.
    pub fn get_verifier(&self, state: &str) -> BrokerResult<String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT code_verifier FROM authorizations WHERE state = ?1",
            params![state],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| BrokerError::NotFound(state.to_string()))
    }

    /// Records the provider-issued authorization code.
    ///
    /// Fails with `NotFound` if the row is gone (garbage-collected or
    /// already completed) — never a silent no-op.
    pub fn bind_code(&self, code: &str, state: &str) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE authorizations SET code = ?1 WHERE state = ?2",
            params![code, state],
        )?;
        if changed == 0 {
            return Err(BrokerError::NotFound(state.to_string()));
        }
        Ok(())
    }

    /// Overwrites the token fields and resets the refresh-failure counter.
    pub fn set_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_in: i64,
        issued_at: i64,
        state: &str,
    ) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE authorizations SET
                access_token = ?1,
                refresh_token = ?2,
                expires_in = ?3,
                token_issued_at = ?4,
                refresh_failures = 0
             WHERE state = ?5",
            params![access_token, refresh_token, expires_in, issued_at, state],
        )?;
        if changed == 0 {
            return Err(BrokerError::NotFound(state.to_string()));
        }
        Ok(())
    }

    /// Attaches display metadata. Never participates in identity
    /// uniqueness; rows are matched on `external_id` only.
    pub fn bind_nickname(&self, nickname: &str, state: &str) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE authorizations SET nickname = ?1 WHERE state = ?2",
            params![nickname, state],
        )?;
        if changed == 0 {
            return Err(BrokerError::NotFound(state.to_string()));
        }
        Ok(())
    }

    /// Binds the stable provider identity to a flow, merging if another row
    /// already owns it.
    ///
    /// Merge (single transaction): the new flow's freshly obtained token
    /// fields are read, the new row is deleted, the pre-existing row is
    /// renamed to the new `state`, and the fresh tokens plus the identity
    /// binding are applied onto it. The surviving row answers to the newest
    /// `state` but keeps the old row's creation time and usage count; the
    /// losing `state` stops resolving.
    pub fn bind_external_id(
        &self,
        external_id: &str,
        state: &str,
    ) -> BrokerResult<IdentityBinding> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                "SELECT access_token, refresh_token, expires_in, token_issued_at, nickname
                 FROM authorizations WHERE state = ?1",
                params![state],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((access_token, refresh_token, expires_in, token_issued_at, nickname)) = current
        else {
            return Err(BrokerError::NotFound(state.to_string()));
        };

        let owner: Option<String> = tx
            .query_row(
                "SELECT state FROM authorizations WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )
            .optional()?;

        let binding = match owner {
            Some(old_state) if old_state != state => {
                tx.execute(
                    "DELETE FROM authorizations WHERE state = ?1",
                    params![state],
                )?;
                tx.execute(
                    "UPDATE authorizations SET state = ?1 WHERE state = ?2",
                    params![state, old_state],
                )?;
                tx.execute(
                    "UPDATE authorizations SET
                        access_token = ?1,
                        refresh_token = ?2,
                        expires_in = ?3,
                        token_issued_at = ?4,
                        nickname = COALESCE(?5, nickname),
                        external_id = ?6,
                        refresh_failures = 0
                     WHERE state = ?7",
                    params![
                        access_token,
                        refresh_token,
                        expires_in,
                        token_issued_at,
                        nickname,
                        external_id,
                        state
                    ],
                )?;
                IdentityBinding::Merged
            }
            _ => {
                // Identity unclaimed, or already owned by this very row
                tx.execute(
                    "UPDATE authorizations SET external_id = ?1 WHERE state = ?2",
                    params![external_id, state],
                )?;
                IdentityBinding::Created
            }
        };

        tx.commit()?;
        Ok(binding)
    }

    /// Returns the `state` currently owning an external identity, if any.
    /// The authoritative handle to report back after a callback completes.
    pub fn find_state_by_external_id(&self, external_id: &str) -> BrokerResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM authorizations WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    /// Returns the full record for a flow, if present.
    pub fn get_row(&self, state: &str) -> BrokerResult<Option<AuthorizationRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE state = ?1"),
                params![state],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Like [`get_row`](Self::get_row), but counts the read: `usage_count`
    /// is incremented atomically with the lookup.
    pub fn get_row_for_serving(&self, state: &str) -> BrokerResult<Option<AuthorizationRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE authorizations SET usage_count = usage_count + 1 WHERE state = ?1",
            params![state],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let record = tx.query_row(
            &format!("{SELECT_RECORD} WHERE state = ?1"),
            params![state],
            row_to_record,
        )?;
        tx.commit()?;
        Ok(Some(record))
    }

    /// Returns every row that reached identity-bound state.
    pub fn list_identity_bound(&self) -> BrokerResult<Vec<AuthorizationRecord>> {
        self.list_where("WHERE external_id IS NOT NULL")
    }

    /// Returns every row, including flows that never completed.
    pub fn list_all(&self) -> BrokerResult<Vec<AuthorizationRecord>> {
        self.list_where("")
    }

    fn list_where(&self, filter: &str) -> BrokerResult<Vec<AuthorizationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} {filter} ORDER BY created_at ASC"))?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Increments the refresh-failure counter, returning the new value.
    pub fn increment_refresh_failures(&self, state: &str) -> BrokerResult<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE authorizations SET refresh_failures = refresh_failures + 1 WHERE state = ?1",
            params![state],
        )?;
        if changed == 0 {
            return Err(BrokerError::NotFound(state.to_string()));
        }
        let count: i64 = tx.query_row(
            "SELECT refresh_failures FROM authorizations WHERE state = ?1",
            params![state],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }

    /// Deletes a flow. Returns whether a row existed.
    pub fn delete_flow(&self, state: &str) -> BrokerResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM authorizations WHERE state = ?1",
            params![state],
        )?;
        Ok(changed > 0)
    }

    /// Deletes every row that never reached identity-bound state.
    ///
    /// Maintenance only, never part of the auth path. Any row with an
    /// `external_id` is preserved regardless of its other fields.
    pub fn purge_orphans(&self) -> BrokerResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM authorizations WHERE external_id IS NULL", [])?;
        Ok(removed)
    }
}

const SELECT_RECORD: &str = "SELECT
    code_verifier, state, created_at, code,
    access_token, refresh_token, expires_in, token_issued_at,
    nickname, external_id, refresh_failures, usage_count
FROM authorizations";

fn row_to_record(row: &Row) -> rusqlite::Result<AuthorizationRecord> {
    Ok(AuthorizationRecord {
        code_verifier: row.get(0)?,
        state: row.get(1)?,
        created_at: row.get(2)?,
        code: row.get(3)?,
        access_token: row.get(4)?,
        refresh_token: row.get(5)?,
        expires_in: row.get(6)?,
        token_issued_at: row.get(7)?,
        nickname: row.get(8)?,
        external_id: row.get(9)?,
        refresh_failures: row.get(10)?,
        usage_count: row.get(11)?,
    })
}
