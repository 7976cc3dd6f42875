//! SQLite backed server log store

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, types::Value as SqlValue, Connection};
use tracing::info;

use crate::server_log::{format_timestamp, Level, Log, LogStore, LogStoreError, Topic};

pub struct DbLog {
    conn: Mutex<Connection>,
}

impl DbLog {
    pub fn open(path: &Path) -> Result<Self, LogStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LogStoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LogStoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS serverlog (
                timestamp TEXT NOT NULL,
                level INTEGER NOT NULL,
                topic TEXT NOT NULL,
                user TEXT NOT NULL DEFAULT '',
                session TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS serverlog_timestamp ON serverlog (timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete entries older than the given number of days. Returns the number removed.
    pub fn purge_logs(&self, older_than_days: u32) -> Result<usize, LogStoreError> {
        if older_than_days == 0 {
            return Ok(0);
        }
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(older_than_days)));
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM serverlog WHERE timestamp < ?1", params![cutoff])?;
        if removed > 0 {
            info!(
                component = "db_log",
                event = "db_log.purged",
                removed,
                older_than_days,
                "Purged old log entries"
            );
        }
        Ok(removed)
    }
}

impl LogStore for DbLog {
    fn store_message(&self, entry: &Log) -> Result<(), LogStoreError> {
        self.conn.lock().execute(
            "INSERT INTO serverlog (timestamp, level, topic, user, session, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format_timestamp(entry.timestamp()),
                entry.level() as i64,
                entry.topic().as_str(),
                entry.user_tag(),
                entry.session_id(),
                entry.text(),
            ],
        )?;
        Ok(())
    }

    fn get_log_entries(
        &self,
        session: Option<&str>,
        after: Option<DateTime<Utc>>,
        atleast: Level,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Log>, LogStoreError> {
        let mut sql = String::from(
            "SELECT timestamp, session, user, level, topic, message FROM serverlog WHERE 1=1",
        );
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(session) = session {
            sql.push_str(" AND session = ?");
            args.push(SqlValue::Text(session.to_string()));
        }
        if let Some(after) = after {
            sql.push_str(" AND timestamp >= ?");
            args.push(SqlValue::Text(format_timestamp(
                after + Duration::milliseconds(1000),
            )));
        }
        if atleast < Level::Debug {
            sql.push_str(" AND level <= ?");
            args.push(SqlValue::Integer(atleast as i64));
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
        // SQLite only accepts OFFSET after a LIMIT; -1 means no limit
        if limit > 0 || offset > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(SqlValue::Integer(if limit > 0 { limit as i64 } else { -1 }));
            args.push(SqlValue::Integer(offset as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (timestamp, session, user, level, topic, message) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc);
            entries.push(Log::with_fields(
                timestamp,
                session,
                user,
                Level::from_index(level).unwrap_or(Level::Debug),
                topic.parse::<Topic>()?,
                message,
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_log::ServerLog;

    fn entry(age: Duration, text: &str) -> Log {
        Log::with_fields(Utc::now() - age, "", "test", Level::Info, Topic::Status, text)
    }

    fn count(db: &DbLog) -> usize {
        db.get_log_entries(None, None, Level::Debug, 0, 0).unwrap().len()
    }

    #[test]
    fn purge_removes_entries_older_than_days() {
        let db = DbLog::open_in_memory().unwrap();
        db.store_message(&entry(Duration::hours(12), "day 1")).unwrap();
        db.store_message(&entry(Duration::hours(36), "day 2")).unwrap();
        db.store_message(&entry(Duration::hours(36), "day 2.2")).unwrap();
        db.store_message(&entry(Duration::hours(60), "day 3")).unwrap();
        assert_eq!(count(&db), 4);

        assert_eq!(db.purge_logs(3).unwrap(), 0);
        assert_eq!(count(&db), 4);
        assert_eq!(db.purge_logs(2).unwrap(), 1);
        assert_eq!(count(&db), 3);
        assert_eq!(db.purge_logs(1).unwrap(), 2);
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn query_filters_match_in_memory_semantics() {
        let log = ServerLog::new(DbLog::open_in_memory().unwrap());
        log.set_silent(true);
        let t = Utc::now() - Duration::minutes(5);

        log.log_message(Log::new().about(Level::Info, Topic::Join).session("s1").at(t).message("at"));
        log.log_message(
            Log::new()
                .about(Level::Debug, Topic::Status)
                .session("s1")
                .at(t + Duration::seconds(2))
                .message("debug"),
        );
        log.log_message(
            Log::new()
                .about(Level::Warn, Topic::Kick)
                .session("s2")
                .at(t + Duration::seconds(3))
                .message("other"),
        );
        log.log_message(
            Log::new()
                .about(Level::Error, Topic::Status)
                .session("s1")
                .at(t + Duration::seconds(4))
                .message("late"),
        );

        let all = log.query().get().unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].text(), "late");
        assert_eq!(all[3].topic(), Topic::Join);

        let after = log.query().session("s1").after(t).get().unwrap();
        let texts: Vec<_> = after.iter().map(|e| e.text()).collect();
        assert_eq!(texts, vec!["late", "debug"]);

        let severe = log.query().atleast(Level::Warn).get().unwrap();
        assert_eq!(severe.len(), 2);

        let page = log.query().page(1, 3).get().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text(), "at");
    }

    #[test]
    fn reopening_file_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        {
            let db = DbLog::open(&path).unwrap();
            db.store_message(&entry(Duration::seconds(1), "kept")).unwrap();
        }
        let db = DbLog::open(&path).unwrap();
        let entries = db.get_log_entries(None, None, Level::Debug, 0, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_tag(), "test");
    }
}
