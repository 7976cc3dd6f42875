//! Client → Server control commands
//!
//! These travel as JSON inside `Command` messages. Login commands are only
//! accepted before a client has joined a session; session commands only after.

use serde::{Deserialize, Serialize};

/// Control commands sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ClientCommand {
    // Login
    StartTls,
    Ident {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
    Host {
        protocol: String,
        #[serde(rename = "userId")]
        user_id: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        persistent: bool,
        /// Session password to set
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Join {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    // Session control
    InitBegin,
    InitComplete,
    InitCancel,
    KickUser {
        #[serde(rename = "userId")]
        user_id: u8,
        /// Also ban the user from rejoining
        #[serde(default)]
        ban: bool,
    },
    RemoveBan {
        id: u32,
    },
    /// Become an operator with the session's operator password
    GainOp {
        password: String,
    },
    /// List the session at a listing server
    AnnounceSession {
        url: String,
        #[serde(default)]
        private: bool,
    },
    UnlistSession {
        url: String,
    },
    #[serde(rename = "sessionconf")]
    SessionConf(SessionConfChanges),
}

impl ClientCommand {
    /// Is this command part of the login exchange?
    pub fn is_login(&self) -> bool {
        matches!(
            self,
            Self::StartTls | Self::Ident { .. } | Self::Host { .. } | Self::Join { .. }
        )
    }
}

/// Partial update of session settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_chat: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deputies: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_user_count: Option<u8>,
    /// New session password. An empty string clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// New operator password. An empty string clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opword: Option<String>,
}
