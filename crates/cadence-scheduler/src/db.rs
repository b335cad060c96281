use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs`, `job_executions` and `resource_usage` tables
/// (idempotent). The composite index on `(status, next_run_time)` serves the
/// ready-job query that runs every dispatch cycle.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            description         TEXT    NOT NULL DEFAULT '',
            job_type            TEXT    NOT NULL,
            priority            INTEGER NOT NULL,   -- 1 (low) … 5 (critical)
            schedule_kind       TEXT    NOT NULL,   -- one_time | recurring
            schedule_expression TEXT    NOT NULL,
            job_data            TEXT    NOT NULL,   -- JSON payload
            status              TEXT    NOT NULL DEFAULT 'scheduled',
            next_run_time       TEXT,               -- NULL only when terminal
            last_run_time       TEXT,
            run_count           INTEGER NOT NULL DEFAULT 0,
            max_runs            INTEGER,            -- NULL means unlimited
            retry_count         INTEGER NOT NULL DEFAULT 0,
            max_retries         INTEGER NOT NULL DEFAULT 3,
            timeout_minutes     INTEGER NOT NULL DEFAULT 60,
            dependencies        TEXT    NOT NULL DEFAULT '[]',
            metadata            TEXT    NOT NULL DEFAULT '{}',
            created_by          TEXT    NOT NULL DEFAULT 'system',
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_status_next_run
            ON jobs (status, next_run_time);

        CREATE TABLE IF NOT EXISTS job_executions (
            id            TEXT NOT NULL PRIMARY KEY,
            job_id        TEXT NOT NULL REFERENCES jobs (id),
            status        TEXT NOT NULL,
            start_time    TEXT NOT NULL,
            end_time      TEXT,               -- NULL while the attempt is open
            result        TEXT,               -- JSON
            error_message TEXT,
            logs          TEXT NOT NULL DEFAULT '[]'
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_job_start
            ON job_executions (job_id, start_time);
        CREATE INDEX IF NOT EXISTS idx_executions_start
            ON job_executions (start_time);

        CREATE TABLE IF NOT EXISTS resource_usage (
            id                       INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp                TEXT    NOT NULL,
            active_jobs              INTEGER NOT NULL,
            queue_size               INTEGER NOT NULL,
            throughput_jobs_per_hour REAL    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Format a timestamp for storage.
///
/// Fixed-width UTC (`2026-01-02T03:04:05.000000Z`) so that SQL string
/// comparison orders the same way as the instants themselves.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

/// Parse a stored timestamp. Used inside row mappers, hence the rusqlite error type.
pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn stored_timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(ts(a) < ts(b));
        assert_eq!(ts(a).len(), ts(b).len());
        assert_eq!(parse_ts(0, &ts(b)).unwrap(), b);
    }
}
