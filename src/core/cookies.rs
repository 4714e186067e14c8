//! Session-affinity cookie persistence.
//!
//! The platform routes requests by short-lived session cookies. They are
//! persisted to a local sqlite database between invocations so that a new
//! process lands on the same backend while the session is still warm.
//!
//! The schema is validated by comparing the literal DDL text stored in
//! `sqlite_master` against the expected statements. Any mismatch (missing
//! object, foreign table, altered DDL) drops and recreates everything; the
//! cache is disposable and self-healing beats migration here.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::warn;

/// Cookies older than this are discarded on load and purged on save.
pub const SESSION_COOKIE_MAX_AGE_SECS: f64 = 5.0 * 60.0;

const SCHEMA: [(&str, &str); 2] = [
    (
        "cookie_session",
        "CREATE TABLE cookie_session (name TEXT, domain TEXT, path TEXT, cookie TEXT, timestamp REAL)",
    ),
    (
        "cookie_session_index",
        "CREATE UNIQUE INDEX cookie_session_index ON cookie_session (name)",
    ),
];

const DROP: [&str; 2] = [
    "DROP INDEX IF EXISTS cookie_session_index",
    "DROP TABLE IF EXISTS cookie_session",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SessionCookie {
    pub name: String,
    pub domain: String,
    pub path: String,
    pub value: String,
    /// Unix time the cookie was persisted, seconds.
    pub timestamp: f64,
}

/// Validate the stored schema, recreating it on any mismatch.
///
/// Returns true when the schema was (re)created, meaning any previously
/// stored rows are gone.
fn ensure_schema(conn: &Connection) -> rusqlite::Result<bool> {
    let mut intact = true;
    let mut found: HashSet<String> = HashSet::new();
    {
        let mut stmt = conn.prepare("SELECT type, name, sql FROM sqlite_master")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            if kind != "table" && kind != "index" {
                continue;
            }
            let name: String = row.get(1)?;
            let sql: Option<String> = row.get(2)?;
            match SCHEMA.iter().find(|(n, _)| *n == name) {
                Some((_, expected)) if sql.as_deref() == Some(*expected) => {
                    found.insert(name);
                }
                Some(_) => {
                    intact = false;
                    break;
                }
                None => {}
            }
        }
    }
    if intact && found.len() == SCHEMA.len() {
        return Ok(false);
    }
    for sql in DROP {
        conn.execute(sql, [])?;
    }
    for (_, sql) in SCHEMA {
        conn.execute(sql, [])?;
    }
    Ok(true)
}

/// Load all cookies persisted within the max-age window, ordered by name.
pub fn load(conn: &Connection, now: f64) -> rusqlite::Result<Vec<SessionCookie>> {
    if ensure_schema(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT name, domain, path, cookie, timestamp FROM cookie_session \
         WHERE timestamp >= ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map([now - SESSION_COOKIE_MAX_AGE_SECS], |row| {
        Ok(SessionCookie {
            name: row.get(0)?,
            domain: row.get(1)?,
            path: row.get(2)?,
            value: row.get(3)?,
            timestamp: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Persist the given cookies, upserting by name, and purge expired rows.
///
/// Write failures of the "operational" class (read-only filesystem, locked
/// or unopenable database, disk full) are logged and swallowed: losing the
/// session cache only costs a backend re-route, never correctness.
pub fn save(conn: &Connection, cookies: &[SessionCookie], now: f64) -> rusqlite::Result<()> {
    match write_records(conn, cookies, now) {
        Err(err) if is_operational(&err) => {
            warn!("failed to persist session cookies: {err}");
            Ok(())
        }
        other => other,
    }
}

fn write_records(conn: &Connection, cookies: &[SessionCookie], now: f64) -> rusqlite::Result<()> {
    ensure_schema(conn)?;
    for cookie in cookies {
        conn.execute(
            "INSERT OR REPLACE INTO cookie_session (name, domain, path, cookie, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                cookie.name,
                cookie.domain,
                cookie.path,
                cookie.value,
                cookie.timestamp
            ],
        )?;
    }
    conn.execute(
        "DELETE FROM cookie_session WHERE timestamp < ?1",
        [now - SESSION_COOKIE_MAX_AGE_SECS],
    )?;
    Ok(())
}

fn is_operational(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            rusqlite::ErrorCode::ReadOnly
                | rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::DiskFull
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::DatabaseBusy
        ),
        _ => false,
    }
}
