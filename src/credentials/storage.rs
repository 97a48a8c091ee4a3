//! Credential storage using SQLite.
//!
//! Stores one access/refresh token pair per user, with the time the user was
//! first stored and the time the tokens last changed.

use super::{Token, TokenPair, UserId};
use crate::config::AuthDbConfig;
use crate::error::Error;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Timestamp layout written by SQLite (`strftime('%Y-%m-%d %H:%M:%f')`), always UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS twitch_tokens (
    user_id TEXT NOT NULL UNIQUE,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);

CREATE TRIGGER IF NOT EXISTS twitch_tokens_updated_at
AFTER UPDATE OF access_token, refresh_token ON twitch_tokens
FOR EACH ROW
WHEN OLD.updated_at = NEW.updated_at OR OLD.updated_at IS NULL
BEGIN
    UPDATE twitch_tokens
    SET updated_at = strftime(
        '%Y-%m-%d %H:%M:%f',
        max(julianday('now'), coalesce(julianday(OLD.updated_at), 0) + 1.0 / 86400000.0)
    )
    WHERE user_id = NEW.user_id;
END;
"#;

/// Credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE twitch_tokens (
///     user_id TEXT NOT NULL UNIQUE,
///     access_token TEXT NOT NULL,
///     refresh_token TEXT NOT NULL,
///     created_at TEXT NOT NULL,   -- UTC, no offset, set on insert only
///     updated_at TEXT NOT NULL    -- UTC, no offset, advanced by trigger
/// );
/// ```
///
/// `updated_at` is maintained by a trigger: every update of either token
/// column moves it to the current time, or one millisecond past its previous
/// value if the clock has not advanced, so it strictly increases per write.
///
/// # Thread Safety
/// - Every operation runs under one `Mutex` owned by this instance, so at
///   most one statement is in flight per store.
/// - Nothing synchronizes two stores opened on the same file (or two
///   processes). SQLite's own file locking applies, with a busy timeout;
///   callers needing more must coordinate externally.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Opens the store described by `config`.
    pub fn new(config: &AuthDbConfig) -> Result<Self> {
        Self::open(&config.db)
    }

    /// Creates or opens a credential store at `db_path` (`":memory:"` for a
    /// private in-memory database).
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        conn.execute_batch(SCHEMA)
            .context("Failed to create twitch_tokens schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential store lock poisoned"))
    }

    /// Creates the user's record, or replaces both tokens of an existing one.
    ///
    /// The statement is committed before this returns.
    pub fn upsert(&self, user_id: &str, access_token: &str, refresh_token: &str) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO twitch_tokens (user_id, access_token, refresh_token)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token
                "#,
                params![user_id, access_token, refresh_token],
            )
            .context("Failed to store tokens")?;

        debug!(user_id = %user_id, "Stored tokens");
        Ok(())
    }

    pub fn get_access_token(&self, user_id: &str) -> Result<Token> {
        self.lookup(user_id, "SELECT access_token FROM twitch_tokens WHERE user_id = ?1")
    }

    pub fn get_refresh_token(&self, user_id: &str) -> Result<Token> {
        self.lookup(user_id, "SELECT refresh_token FROM twitch_tokens WHERE user_id = ?1")
    }

    /// Reads both tokens in a single statement.
    pub fn get_token_pair(&self, user_id: &str) -> Result<TokenPair> {
        let pair = self
            .conn()?
            .query_row(
                "SELECT access_token, refresh_token FROM twitch_tokens WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(TokenPair {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to read tokens")?;

        pair.ok_or_else(|| Error::UserNotFound(user_id.to_string()).into())
    }

    /// Lists every stored user. Full table scan; not for hot paths.
    pub fn list_all_user_ids(&self) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT user_id FROM twitch_tokens")
            .context("Failed to prepare query")?;

        let user_ids = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<UserId>, _>>()
            .context("Failed to read results")?;

        Ok(user_ids)
    }

    /// When the user's record was first inserted.
    pub fn get_created_at(&self, user_id: &str) -> Result<DateTime<Utc>> {
        let raw: String =
            self.lookup(user_id, "SELECT created_at FROM twitch_tokens WHERE user_id = ?1")?;
        parse_timestamp(&raw)
    }

    /// When the user's tokens were last written.
    pub fn get_updated_at(&self, user_id: &str) -> Result<DateTime<Utc>> {
        let raw: String =
            self.lookup(user_id, "SELECT updated_at FROM twitch_tokens WHERE user_id = ?1")?;
        parse_timestamp(&raw)
    }

    /// Single-column point lookup keyed by `user_id`.
    fn lookup(&self, user_id: &str, sql: &str) -> Result<String> {
        let value = self
            .conn()?
            .query_row(sql, params![user_id], |row| row.get(0))
            .optional()
            .context("Failed to execute query")?;

        value.ok_or_else(|| Error::UserNotFound(user_id.to_string()).into())
    }
}

/// Stored timestamps carry no offset; they are written in UTC and read back as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .with_context(|| format!("Failed to parse stored timestamp '{}'", raw))?;
    Ok(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn create_test_store() -> CredentialStore {
        CredentialStore::open(":memory:").expect("Failed to create test store")
    }

    #[test]
    fn test_upsert_and_get() {
        let store = create_test_store();

        store.upsert("user1", "access-1", "refresh-1").unwrap();

        assert_eq!(store.get_access_token("user1").unwrap(), "access-1");
        assert_eq!(store.get_refresh_token("user1").unwrap(), "refresh-1");
    }

    #[test]
    fn test_upsert_replaces_both_tokens() {
        let store = create_test_store();

        store.upsert("user1", "access-1", "refresh-1").unwrap();
        let created = store.get_created_at("user1").unwrap();
        let updated = store.get_updated_at("user1").unwrap();

        store.upsert("user1", "access-2", "refresh-2").unwrap();

        let pair = store.get_token_pair("user1").unwrap();
        assert_eq!(pair.access_token, "access-2");
        assert_eq!(pair.refresh_token, "refresh-2");

        // created_at fixed at first insert, updated_at strictly advanced
        assert_eq!(store.get_created_at("user1").unwrap(), created);
        assert!(store.get_updated_at("user1").unwrap() > updated);

        assert_eq!(store.list_all_user_ids().unwrap(), vec!["user1".to_string()]);
    }

    #[test]
    fn test_updated_at_advances_on_every_write() {
        let store = create_test_store();
        store.upsert("user1", "a", "r").unwrap();

        let mut previous = store.get_updated_at("user1").unwrap();
        for i in 0..5 {
            // Same values on purpose: any write counts
            store.upsert("user1", "a", &format!("r{}", i % 2)).unwrap();
            let current = store.get_updated_at("user1").unwrap();
            assert!(current > previous, "{} not after {}", current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_first_insert_timestamps() {
        let store = create_test_store();
        let before = Utc::now() - chrono::Duration::seconds(1);

        store.upsert("user1", "a", "r").unwrap();

        let created = store.get_created_at("user1").unwrap();
        let updated = store.get_updated_at("user1").unwrap();
        assert_eq!(created, updated);
        // Read back as UTC, not reinterpreted as local time
        assert!(created >= before);
        assert!(created <= Utc::now() + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();

        for result in [
            store.get_access_token("ghost").map(|_| ()),
            store.get_refresh_token("ghost").map(|_| ()),
            store.get_token_pair("ghost").map(|_| ()),
            store.get_created_at("ghost").map(|_| ()),
            store.get_updated_at("ghost").map(|_| ()),
        ] {
            let err = result.unwrap_err();
            assert!(Error::is_user_not_found(&err), "unexpected error: {:?}", err);
        }
    }

    #[test]
    fn test_list_all_user_ids() {
        let store = create_test_store();
        assert!(store.list_all_user_ids().unwrap().is_empty());

        for i in 0..250 {
            store.upsert(&format!("user{}", i), "a", "r").unwrap();
        }
        store.upsert("user7", "a2", "r2").unwrap();

        let mut user_ids = store.list_all_user_ids().unwrap();
        user_ids.sort();
        assert_eq!(user_ids.len(), 250);
        assert!(user_ids.contains(&"user0".to_string()));
        assert!(user_ids.contains(&"user249".to_string()));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authdb.sqlite3");

        {
            let store = CredentialStore::open(&path).unwrap();
            store.upsert("user1", "access", "refresh").unwrap();
        }

        let store = CredentialStore::new(&AuthDbConfig { db: path }).unwrap();
        assert_eq!(store.get_access_token("user1").unwrap(), "access");
        assert_eq!(store.get_refresh_token("user1").unwrap(), "refresh");
    }

    #[test]
    fn test_concurrent_upsert_and_read() {
        let store = Arc::new(create_test_store());
        store.upsert("user1", "access-0", "refresh-0").unwrap();

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 1..200 {
                    store
                        .upsert("user1", &format!("access-{}", i), &format!("refresh-{}", i))
                        .unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let pair = store.get_token_pair("user1").unwrap();
                        // A pair is always from a single write
                        let a = pair.access_token.trim_start_matches("access-");
                        let r = pair.refresh_token.trim_start_matches("refresh-");
                        assert_eq!(a, r);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(store.get_access_token("user1").unwrap(), "access-199");
    }
}
