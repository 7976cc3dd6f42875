//! Server → Client control replies

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replies sent from server to client inside `Command` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerReply {
    // Login
    Greeting {
        version: String,
        features: Vec<String>,
    },
    StartTls,
    IdentOk {
        username: String,
    },
    /// Session list, sent whole after ident and as updates afterwards
    Sessions {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sessions: Vec<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Joined {
        session_id: String,
        user_id: u8,
        host: bool,
    },

    // Errors and notices
    Error {
        code: String,
        message: String,
    },
    Message {
        message: String,
    },
    Alert {
        message: String,
    },

    // Session
    Catchup {
        count: usize,
    },
    /// Ask an operator to reset the session
    ResetRequest {
        size: u64,
        limit: u64,
    },
    /// Hard reset is happening; new history follows
    Reset {
        state: String,
    },
    /// Session settings changed
    SessionConf {
        title: String,
        persistent: bool,
        #[serde(rename = "maxUserCount")]
        max_user_count: u8,
        #[serde(rename = "hasPassword", default)]
        has_password: bool,
    },
    /// Current ban list, sent to operators
    BanList {
        bans: Vec<Value>,
    },
}

impl ServerReply {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>, alert: bool) -> Self {
        if alert {
            Self::Alert {
                message: message.into(),
            }
        } else {
            Self::Message {
                message: message.into(),
            }
        }
    }
}
