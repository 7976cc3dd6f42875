//! Per-session ban list

use std::net::IpAddr;

use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub id: u32,
    pub username: String,
    /// Address the user was connected from
    pub ip: Option<IpAddr>,
    /// Account id of an authenticated user
    pub auth_id: String,
    pub banned_by: String,
}

impl BanEntry {
    fn matches(&self, ip: Option<IpAddr>, auth_id: &str) -> bool {
        let ip_match = match (self.ip, ip) {
            (Some(a), Some(b)) => a.to_canonical() == b.to_canonical(),
            _ => false,
        };
        ip_match || (!auth_id.is_empty() && self.auth_id == auth_id)
    }

    /// Addresses are only shown to people allowed to see them
    pub fn to_json(&self, show_ip: bool) -> Value {
        let mut entry = json!({
            "id": self.id,
            "username": self.username,
            "bannedBy": self.banned_by,
        });
        if show_ip {
            entry["ip"] = json!(self.ip.map(|ip| ip.to_string()).unwrap_or_default());
            entry["authId"] = json!(self.auth_id);
        }
        entry
    }
}

#[derive(Debug, Default)]
pub struct BanList {
    entries: Vec<BanEntry>,
    last_id: u32,
}

impl BanList {
    /// Ban a user. Returns the new entry's id, or `None` if an existing
    /// ban already covers them.
    pub fn add(
        &mut self,
        username: &str,
        ip: Option<IpAddr>,
        auth_id: &str,
        banned_by: &str,
    ) -> Option<u32> {
        if self.is_banned(ip, auth_id) || (ip.is_none() && auth_id.is_empty()) {
            return None;
        }
        self.last_id += 1;
        self.entries.push(BanEntry {
            id: self.last_id,
            username: username.to_string(),
            ip: ip.map(|ip| ip.to_canonical()),
            auth_id: auth_id.to_string(),
            banned_by: banned_by.to_string(),
        });
        Some(self.last_id)
    }

    /// Put back an entry read from storage, keeping its id
    pub(crate) fn restore(&mut self, entry: BanEntry) {
        self.last_id = self.last_id.max(entry.id);
        self.entries.retain(|e| e.id != entry.id);
        self.entries.push(entry);
    }

    /// Lift a ban. Returns the entry that was removed.
    pub fn remove(&mut self, id: u32) -> Option<BanEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn is_banned(&self, ip: Option<IpAddr>, auth_id: &str) -> bool {
        self.entries.iter().any(|e| e.matches(ip, auth_id))
    }

    pub fn entries(&self) -> &[BanEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self, show_ip: bool) -> Vec<Value> {
        self.entries.iter().map(|e| e.to_json(show_ip)).collect()
    }
}
