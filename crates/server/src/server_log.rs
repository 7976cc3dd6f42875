//! Server log: leveled, topic tagged entries about users and sessions.
//!
//! Entries are forwarded to `tracing` (unless the log is silent) and kept in
//! a queryable store so the admin API can show recent activity.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

/// Default number of entries kept by [`InMemoryLog`]
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Entries this close to a query's `after` timestamp are excluded
const AFTER_GRACE_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warn => "Warn",
            Self::Info => "Info",
            Self::Debug => "Debug",
        }
    }

    pub fn from_index(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Error),
            1 => Some(Self::Warn),
            2 => Some(Self::Info),
            3 => Some(Self::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Join,
    Leave,
    Kick,
    Ban,
    Unban,
    Op,
    Deop,
    Mute,
    Unmute,
    Trust,
    Untrust,
    BadData,
    RuleBreak,
    PubList,
    Status,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "Join",
            Self::Leave => "Leave",
            Self::Kick => "Kick",
            Self::Ban => "Ban",
            Self::Unban => "Unban",
            Self::Op => "Op",
            Self::Deop => "Deop",
            Self::Mute => "Mute",
            Self::Unmute => "Unmute",
            Self::Trust => "Trust",
            Self::Untrust => "Untrust",
            Self::BadData => "BadData",
            Self::RuleBreak => "RuleBreak",
            Self::PubList => "PubList",
            Self::Status => "Status",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log {kind}: {value:?}")]
pub struct ParseLogFieldError {
    kind: &'static str,
    value: String,
}

impl FromStr for Level {
    type Err = ParseLogFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Error, Self::Warn, Self::Info, Self::Debug]
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseLogFieldError {
                kind: "level",
                value: s.to_string(),
            })
    }
}

impl FromStr for Topic {
    type Err = ParseLogFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Topic::*;
        [
            Join, Leave, Kick, Ban, Unban, Op, Deop, Mute, Unmute, Trust, Untrust, BadData,
            RuleBreak, PubList, Status,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| ParseLogFieldError {
            kind: "topic",
            value: s.to_string(),
        })
    }
}

/// Options for [`Log::to_json`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonOptions {
    /// Strip the IP address from the user tag
    pub no_private_data: bool,
    /// Leave out the session ID
    pub no_session: bool,
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    timestamp: DateTime<Utc>,
    level: Level,
    topic: Topic,
    user: String,
    session: String,
    message: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            level: Level::Warn,
            topic: Topic::Status,
            user: String::new(),
            session: String::new(),
            message: String::new(),
        }
    }
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(
        timestamp: DateTime<Utc>,
        session: impl Into<String>,
        user: impl Into<String>,
        level: Level,
        topic: Topic,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            level,
            topic,
            user: user.into(),
            session: session.into(),
            message: message.into(),
        }
    }

    pub fn about(mut self, level: Level, topic: Topic) -> Self {
        self.level = level;
        self.topic = topic;
        self
    }

    /// Tag the entry with a user: `ctx;ip;name`
    pub fn user(mut self, context_id: u8, ip: Option<IpAddr>, name: &str) -> Self {
        let ip = ip.map(|ip| ip.to_string()).unwrap_or_default();
        self.user = format!("{context_id};{ip};{name}");
        self
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session = id.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn user_tag(&self) -> &str {
        &self.user
    }

    pub fn session_id(&self) -> &str {
        &self.session
    }

    pub fn text(&self) -> &str {
        &self.message
    }

    /// Format the entry. The abridged form omits the timestamp and level.
    pub fn to_string(&self, abridged: bool) -> String {
        let mut msg = String::new();
        if !abridged {
            msg.push_str(&format_timestamp(self.timestamp));
            msg.push(' ');
            msg.push_str(self.level.as_str());
            msg.push('/');
        }
        msg.push_str(self.topic.as_str());
        msg.push(' ');
        msg.push_str(&self.user);
        if !self.user.is_empty() && !self.session.is_empty() {
            msg.push('@');
        }
        msg.push_str(&self.session);
        if !self.user.is_empty() || !self.session.is_empty() {
            msg.push_str(": ");
        }
        msg.push_str(&self.message);
        msg
    }

    pub fn to_json(&self, options: JsonOptions) -> Value {
        let mut o = Map::new();
        o.insert("timestamp".into(), json!(format_timestamp(self.timestamp)));
        o.insert("level".into(), json!(self.level.as_str()));
        o.insert("topic".into(), json!(self.topic.as_str()));
        if !options.no_session && !self.session.is_empty() {
            o.insert("session".into(), json!(self.session));
        }
        if !self.user.is_empty() {
            let user = if options.no_private_data {
                strip_ip(&self.user)
            } else {
                self.user.clone()
            };
            o.insert("user".into(), json!(user));
        }
        o.insert("message".into(), json!(self.message));
        Value::Object(o)
    }
}

/// Timestamps are stored and compared as fixed-width RFC 3339 strings
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn strip_ip(user: &str) -> String {
    let mut parts = user.splitn(3, ';');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(_ip), Some(name)) => format!("{id};{name}"),
        _ => user.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogStoreError {
    #[error("log database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored log entry: {0}")]
    Corrupt(#[from] ParseLogFieldError),
    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// Backing storage for a [`ServerLog`]
pub trait LogStore: Send + Sync {
    fn store_message(&self, entry: &Log) -> Result<(), LogStoreError>;

    /// Entries matching the filters, newest first.
    ///
    /// `after` excludes everything timestamped less than one second past it.
    /// `atleast` keeps entries at that level or more severe. `offset` and
    /// `limit` (0 = unlimited) apply after filtering.
    fn get_log_entries(
        &self,
        session: Option<&str>,
        after: Option<DateTime<Utc>>,
        atleast: Level,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Log>, LogStoreError>;
}

/// The server's log: a console sink in front of a [`LogStore`]
pub struct ServerLog {
    store: Box<dyn LogStore>,
    silent: AtomicBool,
}

impl ServerLog {
    pub fn new(store: impl LogStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            silent: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(InMemoryLog::new())
    }

    /// Stop forwarding entries to the tracing sink. Storage is unaffected.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    pub fn log_message(&self, entry: Log) {
        if !self.silent.load(Ordering::Relaxed) {
            let line = entry.to_string(true);
            match entry.level {
                Level::Error => error!(component = "server_log", topic = entry.topic.as_str(), "{line}"),
                Level::Warn => warn!(component = "server_log", topic = entry.topic.as_str(), "{line}"),
                Level::Info => info!(component = "server_log", topic = entry.topic.as_str(), "{line}"),
                Level::Debug => debug!(component = "server_log", topic = entry.topic.as_str(), "{line}"),
            }
        }
        if let Err(e) = self.store.store_message(&entry) {
            warn!(
                component = "server_log",
                event = "server_log.store_failed",
                error = %e,
                "Failed to store log entry"
            );
        }
    }

    pub fn get_log_entries(
        &self,
        session: Option<&str>,
        after: Option<DateTime<Utc>>,
        atleast: Level,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Log>, LogStoreError> {
        self.store
            .get_log_entries(session, after, atleast, offset, limit)
    }

    pub fn query(&self) -> LogQuery<'_> {
        LogQuery {
            log: self,
            session: None,
            after: None,
            atleast: Level::Debug,
            offset: 0,
            limit: 0,
        }
    }
}

/// Query builder for [`ServerLog::get_log_entries`]
pub struct LogQuery<'a> {
    log: &'a ServerLog,
    session: Option<String>,
    after: Option<DateTime<Utc>>,
    atleast: Level,
    offset: usize,
    limit: usize,
}

impl LogQuery<'_> {
    pub fn session(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.session = (!id.is_empty()).then_some(id);
        self
    }

    pub fn page(mut self, page: usize, per_page: usize) -> Self {
        self.offset = page * per_page;
        self.limit = per_page;
        self
    }

    pub fn after(mut self, ts: DateTime<Utc>) -> Self {
        self.after = Some(ts);
        self
    }

    pub fn atleast(mut self, level: Level) -> Self {
        self.atleast = level;
        self
    }

    pub fn get(self) -> Result<Vec<Log>, LogStoreError> {
        self.log.get_log_entries(
            self.session.as_deref(),
            self.after,
            self.atleast,
            self.offset,
            self.limit,
        )
    }
}

/// Keeps the latest entries in memory, newest first
pub struct InMemoryLog {
    inner: Mutex<InMemoryInner>,
}

struct InMemoryInner {
    history: VecDeque<Log>,
    limit: usize,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(InMemoryInner {
                history: VecDeque::new(),
                limit,
            }),
        }
    }

    /// Change the entry cap (0 = unlimited), dropping the oldest overflow
    pub fn set_history_limit(&self, limit: usize) {
        let mut inner = self.inner.lock();
        inner.limit = limit;
        if limit > 0 {
            inner.history.truncate(limit);
        }
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for InMemoryLog {
    fn store_message(&self, entry: &Log) -> Result<(), LogStoreError> {
        let mut inner = self.inner.lock();
        inner.history.push_front(entry.clone());
        if inner.limit > 0 && inner.history.len() > inner.limit {
            inner.history.pop_back();
        }
        Ok(())
    }

    fn get_log_entries(
        &self,
        session: Option<&str>,
        after: Option<DateTime<Utc>>,
        atleast: Level,
        mut offset: usize,
        limit: usize,
    ) -> Result<Vec<Log>, LogStoreError> {
        let inner = self.inner.lock();
        let mut filtered = Vec::new();
        for entry in &inner.history {
            if let Some(after) = after {
                if (entry.timestamp - after).num_milliseconds() < AFTER_GRACE_MS {
                    break;
                }
            }
            if session.is_some_and(|s| s != entry.session) {
                continue;
            }
            if entry.level > atleast {
                continue;
            }
            if offset > 0 {
                offset -= 1;
                continue;
            }
            if limit > 0 && filtered.len() >= limit {
                break;
            }
            filtered.push(entry.clone());
        }
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn silent_log() -> ServerLog {
        let log = ServerLog::in_memory();
        log.set_silent(true);
        log
    }

    #[test]
    fn abridged_user_session_entry() {
        let e = Log::new()
            .about(Level::Info, Topic::Join)
            .session("12345678-1234-1234-1234-123456789abc")
            .user(1, Some("192.168.1.1".parse().unwrap()), "My Test Username")
            .message("Test message!");
        assert_eq!(
            e.to_string(true),
            "Join 1;192.168.1.1;My Test Username@12345678-1234-1234-1234-123456789abc: Test message!"
        );
    }

    #[test]
    fn abridged_session_only_and_user_only_entries() {
        let e = Log::new()
            .about(Level::Info, Topic::Status)
            .session("abc")
            .message("Test message!");
        assert_eq!(e.to_string(true), "Status abc: Test message!");

        let e = Log::new()
            .about(Level::Info, Topic::Status)
            .user(1, Some("192.168.1.1".parse().unwrap()), "My Test Username")
            .message("Test message!");
        assert_eq!(
            e.to_string(true),
            "Status 1;192.168.1.1;My Test Username: Test message!"
        );
    }

    #[test]
    fn json_options_strip_private_data() {
        let e = Log::new()
            .about(Level::Warn, Topic::Kick)
            .session("abc")
            .user(3, Some("10.0.0.1".parse().unwrap()), "bob")
            .message("kicked");

        let full = e.to_json(JsonOptions::default());
        assert_eq!(full["user"], "3;10.0.0.1;bob");
        assert_eq!(full["session"], "abc");
        assert_eq!(full["level"], "Warn");

        let public = e.to_json(JsonOptions {
            no_private_data: true,
            no_session: true,
        });
        assert_eq!(public["user"], "3;bob");
        assert!(public.get("session").is_none());
    }

    #[test]
    fn in_memory_history_limit_and_session_filter() {
        let log = ServerLog::new(InMemoryLog::new());
        log.set_silent(true);
        log.log_message(Log::new().message("Hello 1"));
        log.log_message(Log::new().session("s1").message("Hello 2"));
        log.log_message(
            Log::new()
                .session("s1")
                .user(1, Some("192.168.1.1".parse().unwrap()), "test")
                .message("Hello 3"),
        );
        log.log_message(Log::new().message("Hello 4"));

        let entries = log.query().get().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].text(), "Hello 4");
        assert_eq!(log.query().session("s1").get().unwrap().len(), 2);
    }

    #[test]
    fn set_history_limit_truncates_oldest() {
        let store = InMemoryLog::new();
        for i in 0..4 {
            store
                .store_message(&Log::new().message(format!("Hello {i}")))
                .unwrap();
        }
        store.set_history_limit(3);
        let entries = store
            .get_log_entries(None, None, Level::Debug, 0, 0)
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].text(), "Hello 1");
    }

    #[test]
    fn entries_within_one_second_of_after_are_excluded() {
        let log = silent_log();
        let t = Utc::now() - Duration::seconds(60);
        for (offset_ms, text) in [(-500, "before"), (0, "at"), (999, "edge"), (1000, "one"), (5000, "five")] {
            log.log_message(
                Log::new()
                    .about(Level::Info, Topic::Status)
                    .at(t + Duration::milliseconds(offset_ms))
                    .message(text),
            );
        }

        let entries = log.query().after(t).get().unwrap();
        let texts: Vec<_> = entries.iter().map(|e| e.text().to_string()).collect();
        assert_eq!(texts, vec!["five", "one"]);
    }

    #[test]
    fn atleast_filters_by_severity_then_paginates() {
        let log = silent_log();
        log.log_message(Log::new().about(Level::Error, Topic::Status).message("e1"));
        log.log_message(Log::new().about(Level::Debug, Topic::Status).message("d1"));
        log.log_message(Log::new().about(Level::Warn, Topic::Status).message("w1"));
        log.log_message(Log::new().about(Level::Info, Topic::Status).message("i1"));
        log.log_message(Log::new().about(Level::Warn, Topic::Status).message("w2"));

        let warn_or_worse = log.query().atleast(Level::Warn).get().unwrap();
        let texts: Vec<_> = warn_or_worse.iter().map(|e| e.text()).collect();
        assert_eq!(texts, vec!["w2", "w1", "e1"]);

        let page = log.query().atleast(Level::Warn).page(1, 2).get().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text(), "e1");
    }

    #[test]
    fn level_and_topic_parse_from_names() {
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("RuleBreak".parse::<Topic>().unwrap(), Topic::RuleBreak);
        assert!("nope".parse::<Topic>().is_err());
        assert!(Level::Error < Level::Debug);
    }
}
