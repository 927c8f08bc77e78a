//! SQLite-backed MFA store

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use super::{Change, MfaStore};
use crate::error::{MfaError, Result};
use crate::types::{
    ChallengePurpose, ChallengeState, MethodKind, MfaAuditEntry, MfaChallenge, MfaMethod,
};

type MethodRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i32,
    i32,
    String,
    Option<String>,
);

type ChallengeRow = (String, String, String, String, Option<String>, String, String, String);

const METHOD_COLUMNS: &str =
    "id, user_id, kind, secret, destination, is_primary, is_verified, enrolled_at, last_used_at";

const CHALLENGE_COLUMNS: &str =
    "id, user_id, method_id, purpose, code, created_at, expires_at, state";

/// MFA store persisting to SQLite through sqlx
///
/// Safe to share one database file between processes: each commit is a
/// single transaction whose `Require` checks run after its writes.
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`SqliteStore::init_db`] before use.
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Connect to `database_url`, creating the file if needed, and initialize tables
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self::new(db);
        store.init_db().await?;
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(db);
        store.init_db().await?;
        Ok(store)
    }

    /// Initialize database tables
    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mfa_methods (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                secret TEXT,
                destination TEXT,
                is_primary INTEGER NOT NULL DEFAULT 0,
                is_verified INTEGER NOT NULL DEFAULT 0,
                enrolled_at TEXT NOT NULL,
                last_used_at TEXT
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mfa_challenges (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                method_id TEXT NOT NULL,
                purpose TEXT NOT NULL,
                code TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                state TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mfa_audit_log (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                method_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mfa_methods_user ON mfa_methods(user_id)")
            .execute(&self.db)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mfa_challenges_method ON mfa_challenges(method_id)",
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mfa_audit_user ON mfa_audit_log(user_id)")
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Audit event names recorded for a user, oldest first
    pub async fn audit_events(&self, user_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT event_type FROM mfa_audit_log WHERE user_id = ? ORDER BY created_at, rowid",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|(e,)| e).collect())
    }
}

#[async_trait]
impl MfaStore for SqliteStore {
    async fn get_method(&self, id: Uuid) -> Result<Option<MfaMethod>> {
        let row = sqlx::query_as::<_, MethodRow>(&format!(
            "SELECT {} FROM mfa_methods WHERE id = ?",
            METHOD_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.map(method_from_row).transpose()
    }

    async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethod>> {
        let rows = sqlx::query_as::<_, MethodRow>(&format!(
            "SELECT {} FROM mfa_methods WHERE user_id = ? ORDER BY enrolled_at, id",
            METHOD_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(method_from_row).collect()
    }

    async fn get_challenge(&self, id: Uuid) -> Result<Option<MfaChallenge>> {
        let row = sqlx::query_as::<_, ChallengeRow>(&format!(
            "SELECT {} FROM mfa_challenges WHERE id = ?",
            CHALLENGE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await?;

        row.map(challenge_from_row).transpose()
    }

    async fn list_challenges(&self, method_id: Uuid) -> Result<Vec<MfaChallenge>> {
        let rows = sqlx::query_as::<_, ChallengeRow>(&format!(
            "SELECT {} FROM mfa_challenges WHERE method_id = ? ORDER BY created_at, id",
            CHALLENGE_COLUMNS
        ))
        .bind(method_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(challenge_from_row).collect()
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<()> {
        let mut tx = self.db.begin().await?;

        for change in &changes {
            match change {
                Change::PutMethod(m) => {
                    sqlx::query(&format!(
                        "INSERT OR REPLACE INTO mfa_methods ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        METHOD_COLUMNS
                    ))
                    .bind(m.id.to_string())
                    .bind(&m.user_id)
                    .bind(m.kind.as_str())
                    .bind(&m.secret)
                    .bind(&m.destination)
                    .bind(m.is_primary as i32)
                    .bind(m.is_verified as i32)
                    .bind(format_time(m.enrolled_at))
                    .bind(m.last_used_at.map(format_time))
                    .execute(&mut *tx)
                    .await?;
                }
                Change::UpdateMethod(m) => {
                    sqlx::query(
                        r#"
                        UPDATE mfa_methods
                        SET secret = ?, destination = ?, is_primary = ?, is_verified = ?, last_used_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&m.secret)
                    .bind(&m.destination)
                    .bind(m.is_primary as i32)
                    .bind(m.is_verified as i32)
                    .bind(m.last_used_at.map(format_time))
                    .bind(m.id.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                Change::DeleteMethod(id) => {
                    sqlx::query("DELETE FROM mfa_methods WHERE id = ?")
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
                Change::PutChallenge(c) => {
                    sqlx::query(&format!(
                        "INSERT OR REPLACE INTO mfa_challenges ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                        CHALLENGE_COLUMNS
                    ))
                    .bind(c.id.to_string())
                    .bind(&c.user_id)
                    .bind(c.method_id.to_string())
                    .bind(c.purpose.as_str())
                    .bind(&c.code)
                    .bind(format_time(c.created_at))
                    .bind(format_time(c.expires_at))
                    .bind(c.state.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                Change::DeleteChallenge(id) => {
                    sqlx::query("DELETE FROM mfa_challenges WHERE id = ?")
                        .bind(id.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
                Change::Require(_) => {}
            }
        }

        // Checked after the writes: the transaction already holds the write
        // lock, so another connection cannot slip a change in between
        for change in &changes {
            if let Change::Require(invariant) = change {
                let (verified, primaries) = sqlx::query_as::<_, (i64, i64)>(
                    r#"
                    SELECT COALESCE(SUM(is_verified), 0), COALESCE(SUM(is_primary), 0)
                    FROM mfa_methods WHERE user_id = ?
                    "#,
                )
                .bind(invariant.user_id())
                .fetch_one(&mut *tx)
                .await?;

                if let Err(e) = invariant.check(verified as usize, primaries as usize) {
                    tx.rollback().await?;
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        debug!(changes = changes.len(), "Committed MFA changes");
        Ok(())
    }

    async fn purge_challenges(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM mfa_challenges
            WHERE created_at < ?
              AND (state != 'outstanding' OR expires_at < ?)
            "#,
        )
        .bind(format_time(before))
        .bind(format_time(now))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn record_event(&self, entry: &MfaAuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO mfa_audit_log (id, user_id, event_type, method_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.user_id)
        .bind(entry.event_type.to_string())
        .bind(entry.method_id.map(|id| id.to_string()))
        .bind(format_time(entry.created_at))
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| MfaError::Storage(format!("invalid timestamp '{}': {}", s, e)))
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| MfaError::Storage(format!("invalid id '{}': {}", s, e)))
}

fn method_from_row(row: MethodRow) -> Result<MfaMethod> {
    let (id, user_id, kind, secret, destination, is_primary, is_verified, enrolled_at, last_used_at) =
        row;

    Ok(MfaMethod {
        id: parse_id(&id)?,
        user_id,
        kind: MethodKind::parse(&kind).map_err(|e| MfaError::Storage(e.to_string()))?,
        secret,
        destination,
        is_primary: is_primary != 0,
        is_verified: is_verified != 0,
        enrolled_at: parse_time(&enrolled_at)?,
        last_used_at: last_used_at.as_deref().map(parse_time).transpose()?,
    })
}

fn challenge_from_row(row: ChallengeRow) -> Result<MfaChallenge> {
    let (id, user_id, method_id, purpose, code, created_at, expires_at, state) = row;

    Ok(MfaChallenge {
        id: parse_id(&id)?,
        user_id,
        method_id: parse_id(&method_id)?,
        purpose: ChallengePurpose::parse(&purpose)?,
        code,
        created_at: parse_time(&created_at)?,
        expires_at: parse_time(&expires_at)?,
        state: ChallengeState::parse(&state)?,
    })
}
