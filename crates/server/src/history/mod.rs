//! Session history: the ordered message log of one session.
//!
//! Bookkeeping shared by every backend (sizes, sequence numbers, metadata)
//! lives in [`HistoryCore`]; backends only store and fetch messages and, for
//! the durable one, persist metadata changes as journal entries.

mod bans;
mod filed;
mod in_memory;
mod journal;

pub use bans::{BanEntry, BanList};
pub use filed::FiledHistory;
pub use in_memory::InMemoryHistory;
pub use journal::JournalEntry;

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use scribble_protocol::{Message, ProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::id_queue::{IdQueue, MAX_ID, MIN_ID};
use crate::password::{self, PasswordError};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history size limit reached")]
    OutOfSpace,
    #[error("new history is {size} bytes, over the {limit} byte limit")]
    ResetTooLarge { size: u64, limit: u64 },
    #[error("session journal already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("invalid session file {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },
    #[error("incompatible protocol version {0}")]
    IncompatibleVersion(ProtocolVersion),
    #[error("session history is empty")]
    Empty,
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Password(#[from] PasswordError),
}

/// Session flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionFlags {
    /// Session survives its last user leaving
    pub persistent: bool,
    /// Chat messages are stored in history
    pub preserve_chat: bool,
    /// Not suitable for minors
    pub nsfm: bool,
    /// Trusted users may use some operator commands
    pub deputies: bool,
    /// Only authenticated users may join
    pub auth_only: bool,
}

/// State shared by all history backends
#[derive(Debug)]
pub struct HistoryCore {
    id: String,
    alias: Option<String>,
    version: ProtocolVersion,
    founder: String,
    title: String,
    max_users: u8,
    autoreset_threshold: u64,
    flags: SessionFlags,
    started_at: DateTime<Utc>,
    archive: bool,

    size: u64,
    size_limit: u64,
    autoreset_base: u64,
    first_seq: u64,
    last_seq: u64,
    soft_reset_seq: u64,

    id_queue: IdQueue,
    auth_ops: HashSet<String>,
    auth_trusted: HashSet<String>,

    password_hash: String,
    opword_hash: String,
    bans: BanList,
    announcements: Vec<StoredListing>,
}

/// A listing server the session asked to be announced at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredListing {
    pub url: String,
    pub private: bool,
}

impl HistoryCore {
    pub fn new(
        id: impl Into<String>,
        alias: Option<String>,
        version: ProtocolVersion,
        founder: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            alias: alias.filter(|a| !a.is_empty()),
            version,
            founder: founder.into(),
            title: String::new(),
            max_users: MAX_ID,
            autoreset_threshold: 0,
            flags: SessionFlags::default(),
            started_at: Utc::now(),
            archive: false,
            size: 0,
            size_limit: 0,
            autoreset_base: 0,
            first_seq: 1,
            last_seq: 0,
            soft_reset_seq: 0,
            id_queue: IdQueue::new(),
            auth_ops: HashSet::new(),
            auth_trusted: HashSet::new(),
            password_hash: String::new(),
            opword_hash: String::new(),
            bans: BanList::default(),
            announcements: Vec::new(),
        }
    }

    /// Apply a journal entry without persisting it (used while loading)
    pub(crate) fn apply(&mut self, entry: &JournalEntry) {
        match entry {
            JournalEntry::Alias(alias) => {
                if self.alias.is_none() && !alias.is_empty() {
                    self.alias = Some(alias.clone());
                }
            }
            JournalEntry::Founder(founder) => {
                if self.founder.is_empty() {
                    self.founder = founder.clone();
                }
            }
            JournalEntry::File(_) => {}
            JournalEntry::Title(title) => self.title = title.clone(),
            JournalEntry::MaxUsers(n) => self.max_users = (*n).clamp(MIN_ID, MAX_ID),
            JournalEntry::AutoReset(limit) => self.autoreset_threshold = *limit,
            JournalEntry::Flags(flags) => self.flags = *flags,
            JournalEntry::User(id, name) => self.id_queue.set_id_for_name(*id, name),
            JournalEntry::Op(auth_id) => {
                self.auth_ops.insert(auth_id.clone());
            }
            JournalEntry::Deop(auth_id) => {
                self.auth_ops.remove(auth_id);
            }
            JournalEntry::Trust(auth_id) => {
                self.auth_trusted.insert(auth_id.clone());
            }
            JournalEntry::Untrust(auth_id) => {
                self.auth_trusted.remove(auth_id);
            }
            JournalEntry::Password(hash) => self.password_hash = hash.clone(),
            JournalEntry::Opword(hash) => self.opword_hash = hash.clone(),
            JournalEntry::Ban(ban) => self.bans.restore(ban.clone()),
            JournalEntry::Unban(id) => {
                self.bans.remove(*id);
            }
            JournalEntry::Announce(url, private) => self.set_announcement(url, *private),
            JournalEntry::Unannounce(url) => {
                self.announcements.retain(|a| &a.url != url);
            }
        }
    }

    fn set_announcement(&mut self, url: &str, private: bool) {
        match self.announcements.iter_mut().find(|a| a.url == url) {
            Some(existing) => existing.private = private,
            None => self.announcements.push(StoredListing {
                url: url.to_string(),
                private,
            }),
        }
    }

    /// Set the size and message count of freshly loaded content
    pub(crate) fn history_loaded(&mut self, size: u64, count: u64) {
        self.size = size;
        self.last_seq = self.first_seq + count - 1;
        self.autoreset_base = size;
    }
}

/// The ordered message log of one session
pub trait SessionHistory: Send {
    fn core(&self) -> &HistoryCore;
    fn core_mut(&mut self) -> &mut HistoryCore;

    /// Store a message that has already been accounted for
    fn history_add(&mut self, msg: &Message) -> Result<(), HistoryError>;

    /// Replace the stored content. The first new message gets `first_seq`.
    fn history_reset(&mut self, messages: &[Message], first_seq: u64) -> Result<(), HistoryError>;

    /// Messages following sequence number `after`, in one batch, plus the
    /// sequence number of the batch's last message. The batch may end before
    /// the history does.
    fn get_batch(&self, after: u64) -> (Vec<Message>, u64);

    /// Hint that everything before `before` has been delivered to all clients
    fn cleanup_batches(&mut self, _before: u64) {}

    /// Persist a metadata change
    fn persist(&mut self, _entry: JournalEntry) -> Result<(), HistoryError> {
        Ok(())
    }

    /// The session has ended for good: remove (or archive) stored files
    fn terminate(&mut self) -> Result<(), HistoryError> {
        Ok(())
    }

    /// The server is shutting down: flush and keep stored files
    fn close(&mut self) -> Result<(), HistoryError> {
        Ok(())
    }

    // -- Provided --

    fn id(&self) -> &str {
        &self.core().id
    }

    fn alias(&self) -> Option<&str> {
        self.core().alias.as_deref()
    }

    fn protocol_version(&self) -> &ProtocolVersion {
        &self.core().version
    }

    fn founder(&self) -> &str {
        &self.core().founder
    }

    fn title(&self) -> &str {
        &self.core().title
    }

    fn max_users(&self) -> u8 {
        self.core().max_users
    }

    fn flags(&self) -> SessionFlags {
        self.core().flags
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.core().started_at
    }

    fn size(&self) -> u64 {
        self.core().size
    }

    fn size_limit(&self) -> u64 {
        self.core().size_limit
    }

    fn first_seq(&self) -> u64 {
        self.core().first_seq
    }

    fn last_seq(&self) -> u64 {
        self.core().last_seq
    }

    fn soft_reset_seq(&self) -> u64 {
        self.core().soft_reset_seq
    }

    /// Number of messages currently stored
    fn message_count(&self) -> u64 {
        self.core().last_seq + 1 - self.core().first_seq
    }

    fn autoreset_threshold(&self) -> u64 {
        self.core().autoreset_threshold
    }

    fn id_queue(&self) -> &IdQueue {
        &self.core().id_queue
    }

    fn id_queue_mut(&mut self) -> &mut IdQueue {
        &mut self.core_mut().id_queue
    }

    fn is_archive(&self) -> bool {
        self.core().archive
    }

    fn set_archive(&mut self, archive: bool) {
        self.core_mut().archive = archive;
    }

    /// Set the history size limit in bytes (0 = unlimited)
    fn set_size_limit(&mut self, limit: u64) {
        self.core_mut().size_limit = limit;
    }

    fn is_out_of_space(&self) -> bool {
        let core = self.core();
        core.size_limit > 0 && core.size >= core.size_limit
    }

    /// Size at which an autoreset should be requested (0 = never)
    fn effective_autoreset_threshold(&self) -> u64 {
        let core = self.core();
        let mut t = core.autoreset_threshold;
        if t > 0 {
            t += core.autoreset_base;
            if core.size_limit > 0 {
                t = t.min(core.size_limit * 9 / 10);
            }
        }
        t
    }

    fn is_authenticated_operator(&self, auth_id: &str) -> bool {
        self.core().auth_ops.contains(auth_id)
    }

    fn is_authenticated_trusted(&self, auth_id: &str) -> bool {
        self.core().auth_trusted.contains(auth_id)
    }

    fn has_authenticated_operators(&self) -> bool {
        !self.core().auth_ops.is_empty()
    }

    /// Append a message. Returns its sequence number.
    fn add_message(&mut self, msg: Message) -> Result<u64, HistoryError> {
        if self.is_out_of_space() {
            return Err(HistoryError::OutOfSpace);
        }
        self.history_add(&msg)?;
        let core = self.core_mut();
        core.size += msg.len() as u64;
        core.last_seq += 1;
        Ok(core.last_seq)
    }

    /// Hard reset: replace the content. Sequence numbers continue.
    fn reset(&mut self, messages: Vec<Message>) -> Result<(), HistoryError> {
        let new_size: u64 = messages.iter().map(|m| m.len() as u64).sum();
        let limit = self.size_limit();
        if limit > 0 && new_size > limit {
            return Err(HistoryError::ResetTooLarge {
                size: new_size,
                limit,
            });
        }
        let first_seq = self.last_seq() + 1;
        self.history_reset(&messages, first_seq)?;

        let core = self.core_mut();
        core.size = new_size;
        core.first_seq = first_seq;
        core.last_seq = first_seq + messages.len() as u64 - 1;
        core.autoreset_base = new_size;
        core.soft_reset_seq = 0;
        Ok(())
    }

    /// Append a soft reset point and make it the new baseline
    fn soft_reset(&mut self, context_id: u8) -> Result<u64, HistoryError> {
        let seq = self.add_message(Message::soft_reset(context_id))?;
        self.core_mut().soft_reset_seq = seq;
        Ok(seq)
    }

    fn set_title(&mut self, title: &str) -> Result<(), HistoryError> {
        if self.core().title == title {
            return Ok(());
        }
        self.core_mut().title = title.to_string();
        self.persist(JournalEntry::Title(title.to_string()))
    }

    fn set_max_users(&mut self, max: u8) -> Result<(), HistoryError> {
        let max = max.clamp(MIN_ID, MAX_ID);
        if self.core().max_users == max {
            return Ok(());
        }
        self.core_mut().max_users = max;
        self.persist(JournalEntry::MaxUsers(max))
    }

    /// Set the autoreset threshold, capped at 90% of the size limit
    fn set_autoreset_threshold(&mut self, limit: u64) -> Result<(), HistoryError> {
        let size_limit = self.size_limit();
        let limit = if size_limit == 0 {
            limit
        } else {
            limit.min(size_limit * 9 / 10)
        };
        if self.core().autoreset_threshold == limit {
            return Ok(());
        }
        self.core_mut().autoreset_threshold = limit;
        self.persist(JournalEntry::AutoReset(limit))
    }

    fn set_flags(&mut self, flags: SessionFlags) -> Result<(), HistoryError> {
        if self.core().flags == flags {
            return Ok(());
        }
        self.core_mut().flags = flags;
        self.persist(JournalEntry::Flags(flags))
    }

    /// Remember which context ID a user had
    fn join_user(&mut self, context_id: u8, name: &str) -> Result<(), HistoryError> {
        self.core_mut().id_queue.set_id_for_name(context_id, name);
        self.persist(JournalEntry::User(context_id, name.to_string()))
    }

    fn set_authenticated_operator(&mut self, auth_id: &str, op: bool) -> Result<(), HistoryError> {
        if auth_id.is_empty() {
            return Ok(());
        }
        let ops = &mut self.core_mut().auth_ops;
        if op {
            if !ops.insert(auth_id.to_string()) {
                return Ok(());
            }
            self.persist(JournalEntry::Op(auth_id.to_string()))
        } else {
            if !ops.remove(auth_id) {
                return Ok(());
            }
            self.persist(JournalEntry::Deop(auth_id.to_string()))
        }
    }

    fn set_authenticated_trust(&mut self, auth_id: &str, trusted: bool) -> Result<(), HistoryError> {
        if auth_id.is_empty() {
            return Ok(());
        }
        let set = &mut self.core_mut().auth_trusted;
        if trusted {
            if !set.insert(auth_id.to_string()) {
                return Ok(());
            }
            self.persist(JournalEntry::Trust(auth_id.to_string()))
        } else {
            if !set.remove(auth_id) {
                return Ok(());
            }
            self.persist(JournalEntry::Untrust(auth_id.to_string()))
        }
    }

    fn has_password(&self) -> bool {
        !self.core().password_hash.is_empty()
    }

    /// True when the session has no password
    fn check_password(&self, password: &str) -> bool {
        !self.has_password() || password::check(password, &self.core().password_hash)
    }

    /// Set or, with an empty string, clear the session password
    fn set_password(&mut self, password: &str) -> Result<(), HistoryError> {
        let hash = password::hash(password)?;
        self.core_mut().password_hash = hash.clone();
        self.persist(JournalEntry::Password(hash))
    }

    fn has_opword(&self) -> bool {
        !self.core().opword_hash.is_empty()
    }

    /// False when no operator password is set
    fn check_opword(&self, opword: &str) -> bool {
        password::check(opword, &self.core().opword_hash)
    }

    fn set_opword(&mut self, opword: &str) -> Result<(), HistoryError> {
        let hash = password::hash(opword)?;
        self.core_mut().opword_hash = hash.clone();
        self.persist(JournalEntry::Opword(hash))
    }

    fn bans(&self) -> &BanList {
        &self.core().bans
    }

    /// Returns the new ban's id, or `None` if the user was already banned
    fn add_ban(
        &mut self,
        username: &str,
        ip: Option<std::net::IpAddr>,
        auth_id: &str,
        banned_by: &str,
    ) -> Result<Option<u32>, HistoryError> {
        let Some(id) = self.core_mut().bans.add(username, ip, auth_id, banned_by) else {
            return Ok(None);
        };
        let entry = self.core().bans.entries().iter().find(|e| e.id == id).cloned();
        if let Some(entry) = entry {
            self.persist(JournalEntry::Ban(entry))?;
        }
        Ok(Some(id))
    }

    /// Returns the name of the user who was unbanned
    fn remove_ban(&mut self, id: u32) -> Result<Option<String>, HistoryError> {
        let Some(entry) = self.core_mut().bans.remove(id) else {
            return Ok(None);
        };
        self.persist(JournalEntry::Unban(id))?;
        Ok(Some(entry.username))
    }

    fn announcements(&self) -> &[StoredListing] {
        &self.core().announcements
    }

    fn add_announcement(&mut self, url: &str, private: bool) -> Result<(), HistoryError> {
        let current = self.core().announcements.iter().find(|a| a.url == url);
        if current.is_some_and(|a| a.private == private) {
            return Ok(());
        }
        self.core_mut().set_announcement(url, private);
        self.persist(JournalEntry::Announce(url.to_string(), private))
    }

    fn remove_announcement(&mut self, url: &str) -> Result<(), HistoryError> {
        let announcements = &mut self.core_mut().announcements;
        let before = announcements.len();
        announcements.retain(|a| a.url != url);
        if announcements.len() == before {
            return Ok(());
        }
        self.persist(JournalEntry::Unannounce(url.to_string()))
    }
}

impl dyn SessionHistory + '_ {
    /// Every stored message with a sequence number greater than `after`
    pub fn messages_since(&self, after: u64) -> MessagesSince<'_> {
        MessagesSince {
            history: self,
            position: after.max(self.first_seq() - 1),
            batch: Vec::new().into_iter(),
        }
    }
}

/// Lazy, batch-wise iterator over stored messages.
///
/// Dropping it is always safe; a new one can resume from [`position`](Self::position).
pub struct MessagesSince<'a> {
    history: &'a dyn SessionHistory,
    position: u64,
    batch: std::vec::IntoIter<Message>,
}

impl MessagesSince<'_> {
    /// Sequence number of the last message yielded
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for MessagesSince<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(msg) = self.batch.next() {
                self.position += 1;
                return Some(msg);
            }
            if self.position >= self.history.last_seq() {
                return None;
            }
            let (batch, last) = self.history.get_batch(self.position);
            if batch.is_empty() {
                return None;
            }
            self.position = last - batch.len() as u64;
            self.batch = batch.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribble_protocol::MessageType;

    fn pen(ctx: u8, n: u8) -> Message {
        Message::new(MessageType::PEN_UP, ctx, vec![n]).unwrap()
    }

    fn history() -> InMemoryHistory {
        InMemoryHistory::new("test", None, ProtocolVersion::current(), "alice")
    }

    #[test]
    fn messages_since_zero_reproduces_accepted_order() {
        let mut h = history();
        let sent: Vec<Message> = (0..50).map(|i| pen(i % 3 + 1, i)).collect();
        for (i, msg) in sent.iter().enumerate() {
            assert_eq!(h.add_message(msg.clone()).unwrap(), i as u64 + 1);
        }

        let h: &dyn SessionHistory = &h;
        let replayed: Vec<Message> = h.messages_since(0).collect();
        assert_eq!(replayed, sent);
    }

    #[test]
    fn messages_since_resumes_from_position() {
        let mut h = history();
        for i in 0..10 {
            h.add_message(pen(1, i)).unwrap();
        }
        let h: &dyn SessionHistory = &h;

        let mut it = h.messages_since(0);
        it.by_ref().take(4).for_each(drop);
        let pos = it.position();
        assert_eq!(pos, 4);
        drop(it);

        let rest: Vec<_> = h.messages_since(pos).collect();
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0], pen(1, 4));
    }

    #[test]
    fn out_of_space_rejects_append() {
        let mut h = history();
        h.set_size_limit(10);
        h.add_message(pen(1, 0)).unwrap();
        h.add_message(pen(1, 1)).unwrap();
        assert!(h.is_out_of_space());
        assert!(matches!(h.add_message(pen(1, 2)), Err(HistoryError::OutOfSpace)));
        assert_eq!(h.last_seq(), 2);
    }

    #[test]
    fn reset_continues_sequence_numbers() {
        let mut h = history();
        for i in 0..3 {
            h.add_message(pen(1, i)).unwrap();
        }
        h.reset(vec![pen(2, 10), pen(2, 11)]).unwrap();

        assert_eq!(h.first_seq(), 4);
        assert_eq!(h.last_seq(), 5);
        assert_eq!(h.size(), 10);
        assert_eq!(h.message_count(), 2);

        let h: &dyn SessionHistory = &h;
        let all: Vec<_> = h.messages_since(0).collect();
        assert_eq!(all, vec![pen(2, 10), pen(2, 11)]);
        assert_eq!(h.messages_since(4).count(), 1);
    }

    #[test]
    fn reset_over_limit_fails_without_change() {
        let mut h = history();
        h.set_size_limit(8);
        h.add_message(pen(1, 0)).unwrap();
        let err = h.reset(vec![pen(1, 1), pen(1, 2)]).unwrap_err();
        assert!(matches!(err, HistoryError::ResetTooLarge { size: 10, limit: 8 }));
        assert_eq!(h.last_seq(), 1);
    }

    #[test]
    fn soft_reset_marks_baseline_and_keeps_messages() {
        let mut h = history();
        h.add_message(pen(1, 0)).unwrap();
        let seq = h.soft_reset(1).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(h.soft_reset_seq(), 2);
        assert_eq!(h.message_count(), 2);
    }

    #[test]
    fn effective_autoreset_threshold_is_capped() {
        let mut h = history();
        assert_eq!(h.effective_autoreset_threshold(), 0);

        h.set_size_limit(1000);
        h.set_autoreset_threshold(500).unwrap();
        h.reset(vec![Message::new(MessageType::PUT_IMAGE, 1, vec![0u8; 296]).unwrap()])
            .unwrap();
        // 500 + 300 base
        assert_eq!(h.effective_autoreset_threshold(), 800);

        h.set_autoreset_threshold(2000).unwrap();
        assert_eq!(h.autoreset_threshold(), 900);
        assert_eq!(h.effective_autoreset_threshold(), 900);
    }

    #[test]
    fn max_users_is_clamped() {
        let mut h = history();
        h.set_max_users(0).unwrap();
        assert_eq!(h.max_users(), 1);
        h.set_max_users(255).unwrap();
        assert_eq!(h.max_users(), 254);
    }

    #[test]
    fn authenticated_operator_set() {
        let mut h = history();
        h.set_authenticated_operator("u1", true).unwrap();
        h.set_authenticated_operator("u2", true).unwrap();
        h.set_authenticated_operator("u1", false).unwrap();
        assert!(!h.is_authenticated_operator("u1"));
        assert!(h.is_authenticated_operator("u2"));
        assert!(h.has_authenticated_operators());
    }

    #[test]
    fn password_and_opword() {
        let mut h = history();
        assert!(!h.has_password());
        assert!(h.check_password("anything"));
        assert!(!h.check_opword(""));

        h.set_password("door").unwrap();
        h.set_opword("key").unwrap();
        assert!(h.has_password() && h.has_opword());
        assert!(h.check_password("door"));
        assert!(!h.check_password("key"));
        assert!(h.check_opword("key"));

        h.set_password("").unwrap();
        assert!(!h.has_password());
        assert!(h.check_password(""));
    }

    #[test]
    fn bans_and_unbans() {
        let mut h = history();
        let ip = Some("10.0.0.7".parse().unwrap());
        let id = h.add_ban("troll", ip, "", "alice").unwrap().unwrap();
        assert_eq!(h.add_ban("troll", ip, "", "alice").unwrap(), None);
        assert!(h.bans().is_banned(ip, ""));
        assert_eq!(h.remove_ban(id).unwrap().as_deref(), Some("troll"));
        assert_eq!(h.remove_ban(id).unwrap(), None);
        assert!(!h.bans().is_banned(ip, ""));
    }

    #[test]
    fn announcements_are_unique_per_url() {
        let mut h = history();
        h.add_announcement("https://a.example/", false).unwrap();
        h.add_announcement("https://a.example/", true).unwrap();
        h.add_announcement("https://b.example/", false).unwrap();
        assert_eq!(h.announcements().len(), 2);
        assert!(h.announcements()[0].private);
        h.remove_announcement("https://a.example/").unwrap();
        assert_eq!(h.announcements()[0].url, "https://b.example/");
    }
}
