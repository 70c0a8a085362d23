//! Command-usage counter.
//!
//! A small SQLite table tracking how often each command key was executed.
//! Updates are fire-and-forget: the runtime logs and swallows failures, and
//! the counter never affects execution.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub trait UsageCounter: Send + Sync {
    fn increment(&self, key: &str) -> Result<()>;
}

/// Counter that records nothing; used by tests and sub-agents that share
/// the parent's counter through the ports struct instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageCounter;

impl UsageCounter for NoopUsageCounter {
    fn increment(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

pub struct SqliteUsageCounter {
    conn: Mutex<Connection>,
}

impl SqliteUsageCounter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create usage db directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open usage db: {}", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS command_usage (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .context("failed to create command_usage table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    fn count(&self, key: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT count FROM command_usage WHERE key = ?1",
            [key],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl UsageCounter for SqliteUsageCounter {
    fn increment(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO command_usage (key, count) VALUES (?1, 1)
             ON CONFLICT(key) DO UPDATE SET count = count + 1",
            [key],
        )
        .context("failed to increment usage counter")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate_per_key() {
        let tmp = tempfile::tempdir().unwrap();
        let counter = SqliteUsageCounter::open(&tmp.path().join("usage.db")).unwrap();

        counter.increment("cargo").unwrap();
        counter.increment("cargo").unwrap();
        counter.increment("ls").unwrap();

        assert_eq!(counter.count("cargo").unwrap(), 2);
        assert_eq!(counter.count("ls").unwrap(), 1);
    }

    #[test]
    fn reopening_preserves_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.db");
        SqliteUsageCounter::open(&path).unwrap().increment("git").unwrap();

        let reopened = SqliteUsageCounter::open(&path).unwrap();
        reopened.increment("git").unwrap();
        assert_eq!(reopened.count("git").unwrap(), 2);
    }
}
