//! Session templates: canned sessions instantiated on first join.
//!
//! A template directory holds one `<alias>.json` per template:
//!
//! ```json
//! {
//!   "founder": "alice",
//!   "protocol": "dp:4.21",
//!   "title": "Warm-up canvas",
//!   "maxUserCount": 20,
//!   "flags": { "persistent": false, "nsfm": false },
//!   "messages": [{ "type": 129, "ctx": 1, "payload": "AAAE..." }]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scribble_protocol::{is_valid_session_id, Message, MessageType, ProtocolError, ProtocolVersion};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::history::{HistoryError, SessionFlags, SessionHistory};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid template {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("template alias {0:?} is not a valid session id")]
    BadAlias(String),
    #[error("message {index}: {reason}")]
    BadMessage { index: usize, reason: String },
    #[error("no such template: {0}")]
    NotFound(String),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Source of session templates
pub trait TemplateLoader: Send {
    fn exists(&self, alias: &str) -> bool;

    /// Session-list entry for a template, shaped like a live session's
    fn description(&self, alias: &str) -> Option<Value>;

    fn descriptions(&self) -> Vec<Value>;

    /// Protocol version and founder needed to create the history
    fn header(&self, alias: &str) -> Option<(ProtocolVersion, String)>;

    /// Fill a freshly created history with the template's content
    fn init(&self, alias: &str, history: &mut dyn SessionHistory) -> Result<(), TemplateError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateFile {
    founder: String,
    protocol: ProtocolVersion,
    #[serde(default)]
    title: String,
    #[serde(default = "default_max_users")]
    max_user_count: u8,
    #[serde(default)]
    flags: SessionFlags,
    #[serde(default)]
    messages: Vec<TemplateMessage>,
}

fn default_max_users() -> u8 {
    254
}

#[derive(Debug, Deserialize)]
struct TemplateMessage {
    #[serde(rename = "type")]
    kind: u8,
    ctx: u8,
    #[serde(default)]
    payload: String,
}

#[derive(Debug)]
struct SessionTemplate {
    founder: String,
    protocol: ProtocolVersion,
    title: String,
    max_users: u8,
    flags: SessionFlags,
    messages: Vec<Message>,
}

impl SessionTemplate {
    fn parse(file: TemplateFile) -> Result<Self, TemplateError> {
        let messages = file
            .messages
            .into_iter()
            .enumerate()
            .map(|(index, m)| {
                let bad = |reason: String| TemplateError::BadMessage { index, reason };
                let payload = STANDARD
                    .decode(&m.payload)
                    .map_err(|e| bad(format!("payload is not base64: {e}")))?;
                Message::new(MessageType(m.kind), m.ctx, payload)
                    .map_err(|e: ProtocolError| bad(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            founder: file.founder,
            protocol: file.protocol,
            title: file.title,
            max_users: file.max_user_count,
            flags: file.flags,
            messages,
        })
    }

    fn size(&self) -> u64 {
        self.messages.iter().map(|m| m.len() as u64).sum()
    }
}

/// Templates read from `<alias>.json` files in a directory
#[derive(Debug, Default)]
pub struct TemplateFiles {
    templates: BTreeMap<String, SessionTemplate>,
}

impl TemplateFiles {
    /// Read every template in `dir`. Invalid files are skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let io_err = |source| TemplateError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut templates = BTreeMap::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_file(&path) {
                Ok((alias, template)) => {
                    templates.insert(alias, template);
                }
                Err(e) => warn!(
                    component = "templates",
                    event = "templates.invalid",
                    path = %path.display(),
                    error = %e,
                    "Skipping invalid session template"
                ),
            }
        }

        info!(
            component = "templates",
            event = "templates.loaded",
            dir = %dir.display(),
            count = templates.len(),
            "Loaded session templates"
        );
        Ok(Self { templates })
    }

    fn load_file(path: &Path) -> Result<(String, SessionTemplate), TemplateError> {
        let alias = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if !is_valid_session_id(&alias) {
            return Err(TemplateError::BadAlias(alias));
        }
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TemplateFile = serde_json::from_str(&text).map_err(|source| TemplateError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok((alias, SessionTemplate::parse(file)?))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateLoader for TemplateFiles {
    fn exists(&self, alias: &str) -> bool {
        self.templates.contains_key(alias)
    }

    fn description(&self, alias: &str) -> Option<Value> {
        let t = self.templates.get(alias)?;
        Some(json!({
            "id": alias,
            "alias": alias,
            "protocol": t.protocol.to_string(),
            "userCount": 0,
            "maxUserCount": t.max_users,
            "founder": t.founder,
            "title": t.title,
            "persistent": t.flags.persistent,
            "nsfm": t.flags.nsfm,
            "authOnly": t.flags.auth_only,
            "closed": false,
            "size": t.size(),
            "template": true,
        }))
    }

    fn descriptions(&self) -> Vec<Value> {
        self.templates
            .keys()
            .filter_map(|alias| self.description(alias))
            .collect()
    }

    fn header(&self, alias: &str) -> Option<(ProtocolVersion, String)> {
        self.templates
            .get(alias)
            .map(|t| (t.protocol.clone(), t.founder.clone()))
    }

    fn init(&self, alias: &str, history: &mut dyn SessionHistory) -> Result<(), TemplateError> {
        let t = self
            .templates
            .get(alias)
            .ok_or_else(|| TemplateError::NotFound(alias.to_string()))?;
        history.set_title(&t.title)?;
        history.set_max_users(t.max_users)?;
        history.set_flags(t.flags)?;
        for msg in &t.messages {
            history.add_message(msg.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;

    const TEMPLATE: &str = r#"{
        "founder": "alice",
        "protocol": "dp:4.21",
        "title": "Warm-up canvas",
        "maxUserCount": 12,
        "flags": { "nsfm": true },
        "messages": [
            { "type": 136, "ctx": 1, "payload": "AQ==" },
            { "type": 136, "ctx": 1, "payload": "Ag==" }
        ]
    }"#;

    fn template_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("warmup.json"), TEMPLATE).unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        dir
    }

    #[test]
    fn loads_valid_templates_and_skips_broken_ones() {
        let dir = template_dir();
        let templates = TemplateFiles::load(dir.path()).unwrap();
        assert_eq!(templates.len(), 1);
        assert!(templates.exists("warmup"));
        assert!(!templates.exists("broken"));

        let desc = templates.description("warmup").unwrap();
        assert_eq!(desc["title"], "Warm-up canvas");
        assert_eq!(desc["maxUserCount"], 12);
        assert_eq!(desc["nsfm"], true);
        assert_eq!(desc["size"], 10);
        assert_eq!(templates.descriptions().len(), 1);
    }

    #[test]
    fn init_fills_history() {
        let dir = template_dir();
        let templates = TemplateFiles::load(dir.path()).unwrap();
        let (version, founder) = templates.header("warmup").unwrap();
        assert_eq!(founder, "alice");

        let mut history = InMemoryHistory::new("s1", Some("warmup".into()), version, founder);
        templates.init("warmup", &mut history).unwrap();

        assert_eq!(history.title(), "Warm-up canvas");
        assert_eq!(history.max_users(), 12);
        assert!(history.flags().nsfm);
        let h: &dyn SessionHistory = &history;
        let payloads: Vec<u8> = h.messages_since(0).map(|m| m.payload()[0]).collect();
        assert_eq!(payloads, vec![1, 2]);
    }

    #[test]
    fn bad_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("bad.json"),
            r#"{"founder":"x","protocol":"dp:4.21","messages":[{"type":136,"ctx":1,"payload":"%%%"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            TemplateFiles::load_file(&dir.path().join("bad.json")),
            Err(TemplateError::BadMessage { index: 0, .. })
        ));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TemplateFiles::load(&dir.path().join("nope")).is_err());
    }
}
