//! Session journal lines: one metadata change per line, `KEYWORD params`

use std::fmt;

use super::bans::BanEntry;
use super::SessionFlags;
use crate::password;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Alias(String),
    Founder(String),
    /// Name of the current recording file
    File(String),
    Title(String),
    MaxUsers(u8),
    AutoReset(u64),
    Flags(SessionFlags),
    User(u8, String),
    Op(String),
    Deop(String),
    Trust(String),
    Untrust(String),
    /// Session password hash, empty when cleared
    Password(String),
    Opword(String),
    Ban(BanEntry),
    Unban(u32),
    /// Listing server URL and whether the listing is private
    Announce(String, bool),
    Unannounce(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JournalParseError {
    #[error("unknown journal entry {0:?}")]
    Unknown(String),
    #[error("invalid {keyword} entry: {params:?}")]
    Invalid { keyword: &'static str, params: String },
}

impl JournalEntry {
    /// Parse one line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, JournalParseError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (cmd, params) = match line.split_once(' ') {
            Some((cmd, params)) => (cmd, params.trim()),
            None => (line, ""),
        };
        let invalid = |keyword| JournalParseError::Invalid {
            keyword,
            params: params.to_string(),
        };

        let entry = match cmd {
            "ALIAS" => Self::Alias(params.to_string()),
            "FOUNDER" => Self::Founder(params.to_string()),
            "FILE" => Self::File(params.to_string()),
            "TITLE" => Self::Title(params.to_string()),
            "MAXUSERS" => {
                let n: i64 = params.parse().map_err(|_| invalid("MAXUSERS"))?;
                Self::MaxUsers(n.clamp(1, 254) as u8)
            }
            "AUTORESET" => Self::AutoReset(params.parse().map_err(|_| invalid("AUTORESET"))?),
            "FLAGS" => Self::Flags(parse_flags(params)),
            "USER" => {
                let (id, name) = params.split_once(' ').ok_or_else(|| invalid("USER"))?;
                let id = id.parse().map_err(|_| invalid("USER"))?;
                Self::User(id, percent_decode(name))
            }
            "OP" => Self::Op(params.to_string()),
            "DEOP" => Self::Deop(params.to_string()),
            "TRUST" => Self::Trust(params.to_string()),
            "UNTRUST" => Self::Untrust(params.to_string()),
            "PASSWORD" => Self::Password(valid_hash(params).ok_or_else(|| invalid("PASSWORD"))?),
            "OPWORD" => Self::Opword(valid_hash(params).ok_or_else(|| invalid("OPWORD"))?),
            "BAN" => Self::Ban(parse_ban(params).ok_or_else(|| invalid("BAN"))?),
            "UNBAN" => Self::Unban(params.parse().map_err(|_| invalid("UNBAN"))?),
            "ANNOUNCE" => match params.split_whitespace().collect::<Vec<_>>()[..] {
                [url] => Self::Announce(url.to_string(), false),
                [url, "private"] => Self::Announce(url.to_string(), true),
                _ => return Err(invalid("ANNOUNCE")),
            },
            "UNANNOUNCE" if params.is_empty() => return Err(invalid("UNANNOUNCE")),
            "UNANNOUNCE" => Self::Unannounce(params.to_string()),
            other => return Err(JournalParseError::Unknown(other.to_string())),
        };
        Ok(Some(entry))
    }
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alias(alias) => write!(f, "ALIAS {alias}"),
            Self::Founder(founder) => write!(f, "FOUNDER {founder}"),
            Self::File(name) => write!(f, "FILE {name}"),
            Self::Title(title) => write!(f, "TITLE {}", single_line(title)),
            Self::MaxUsers(n) => write!(f, "MAXUSERS {n}"),
            Self::AutoReset(limit) => write!(f, "AUTORESET {limit}"),
            Self::Flags(flags) => write!(f, "FLAGS {}", format_flags(flags)),
            Self::User(id, name) => write!(f, "USER {id} {}", percent_encode(name)),
            Self::Op(auth_id) => write!(f, "OP {auth_id}"),
            Self::Deop(auth_id) => write!(f, "DEOP {auth_id}"),
            Self::Trust(auth_id) => write!(f, "TRUST {auth_id}"),
            Self::Untrust(auth_id) => write!(f, "UNTRUST {auth_id}"),
            Self::Password(hash) => write!(f, "PASSWORD {hash}"),
            Self::Opword(hash) => write!(f, "OPWORD {hash}"),
            Self::Ban(ban) => write!(
                f,
                "BAN {} {} {} {} {}",
                ban.id,
                ban_field(&ban.username),
                ban.ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
                ban_field(&ban.auth_id),
                ban_field(&ban.banned_by),
            ),
            Self::Unban(id) => write!(f, "UNBAN {id}"),
            Self::Announce(url, true) => write!(f, "ANNOUNCE {url} private"),
            Self::Announce(url, false) => write!(f, "ANNOUNCE {url}"),
            Self::Unannounce(url) => write!(f, "UNANNOUNCE {url}"),
        }
    }
}

fn parse_flags(params: &str) -> SessionFlags {
    let mut flags = SessionFlags::default();
    for flag in params.split_whitespace() {
        match flag {
            "persistent" => flags.persistent = true,
            "preserveChat" => flags.preserve_chat = true,
            "nsfm" => flags.nsfm = true,
            "deputies" => flags.deputies = true,
            "authonly" => flags.auth_only = true,
            other => tracing::warn!(
                component = "history",
                event = "journal.unknown_flag",
                flag = other,
                "Unknown session flag"
            ),
        }
    }
    flags
}

fn format_flags(flags: &SessionFlags) -> String {
    let mut names = Vec::new();
    if flags.persistent {
        names.push("persistent");
    }
    if flags.preserve_chat {
        names.push("preserveChat");
    }
    if flags.nsfm {
        names.push("nsfm");
    }
    if flags.deputies {
        names.push("deputies");
    }
    if flags.auth_only {
        names.push("authonly");
    }
    names.join(" ")
}

fn valid_hash(params: &str) -> Option<String> {
    password::is_valid_hash(params).then(|| params.to_string())
}

/// `BAN id name ip authId bannedBy`, with `-` standing for an empty field
fn parse_ban(params: &str) -> Option<BanEntry> {
    let fields: Vec<&str> = params.split(' ').collect();
    let [id, username, ip, auth_id, banned_by] = fields[..] else {
        return None;
    };
    Some(BanEntry {
        id: id.parse().ok()?,
        username: parse_ban_field(username),
        ip: match ip {
            "-" => None,
            ip => Some(ip.parse().ok()?),
        },
        auth_id: parse_ban_field(auth_id),
        banned_by: parse_ban_field(banned_by),
    })
}

fn ban_field(value: &str) -> String {
    match value {
        "" => "-".to_string(),
        "-" => "%2D".to_string(),
        value => percent_encode(value),
    }
}

fn parse_ban_field(value: &str) -> String {
    if value == "-" {
        String::new()
    } else {
        percent_decode(value)
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

/// Escape `%`, spaces and control characters so a name fits in one field
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '%' || c == ' ' || c.is_ascii_control() {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |b: u8| (b as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
