//! Login exchange for clients that have not joined a session yet

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scribble_protocol::{
    is_valid_session_id, new_id, ClientCommand, Message, ProtocolVersion, ServerReply,
};
use tracing::warn;

use crate::client::{ClientState, ConnId};
use crate::server_log::{Level, Log, Topic};
use crate::session::JoinError;
use crate::session_server::{ServerEvent, SessionServer};

const MAX_USERNAME_LEN: usize = 32;

/// Usernames are short, printable and have no surrounding whitespace
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.chars().count() <= MAX_USERNAME_LEN
        && name.trim() == name
        && !name.chars().any(|c| c.is_control() || c == '"')
}

struct HostRequest {
    protocol: String,
    user_id: u8,
    id: Option<String>,
    alias: Option<String>,
    title: Option<String>,
    persistent: bool,
    password: Option<String>,
}

impl SessionServer {
    pub(crate) fn greet(&self, conn_id: ConnId) {
        let Some(client) = self.clients.get(&conn_id) else {
            return;
        };
        let mut features = Vec::new();
        if self.config.tls_available {
            features.push("TLS".to_string());
        }
        if self.config.secure_only {
            features.push("SECURE".to_string());
        }
        client.send_reply(&ServerReply::Greeting {
            version: ProtocolVersion::current().to_string(),
            features,
        });
    }

    pub(crate) fn handle_login(&mut self, conn_id: ConnId, msg: Message) {
        let Some(client) = self.clients.get(&conn_id) else {
            return;
        };
        let cmd: ClientCommand = match msg.parse_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                client.send_error("badCommand", format!("Invalid command: {e}"));
                return;
            }
        };

        match cmd {
            ClientCommand::StartTls => self.start_tls(conn_id),
            ClientCommand::Ident { username, avatar } => {
                self.ident(conn_id, &username, avatar.as_deref())
            }
            ClientCommand::Host {
                protocol,
                user_id,
                id,
                alias,
                title,
                persistent,
                password,
            } => self.host(
                conn_id,
                HostRequest {
                    protocol,
                    user_id,
                    id,
                    alias,
                    title,
                    persistent,
                    password,
                },
            ),
            ClientCommand::Join { id, password } => {
                self.join(conn_id, &id, password.as_deref().unwrap_or_default())
            }
            _ => client.send_error("badCommand", "Join a session first"),
        }
    }

    fn start_tls(&mut self, conn_id: ConnId) {
        let Some(client) = self.clients.get(&conn_id) else {
            return;
        };
        if !self.config.tls_available {
            client.send_error("badCommand", "TLS is not available");
        } else if client.is_secure() {
            client.send_error("badCommand", "Connection is already secure");
        } else {
            client.send_reply(&ServerReply::StartTls);
            client.request_start_tls();
        }
    }

    fn ident(&mut self, conn_id: ConnId, username: &str, avatar: Option<&str>) {
        let secure_only = self.config.secure_only;
        let Some(client) = self.clients.get_mut(&conn_id) else {
            return;
        };
        if client.state() != ClientState::Lobby {
            client.send_error("badCommand", "Already identified");
            return;
        }
        if secure_only && !client.is_secure() {
            client.send_error("tlsRequired", "Start TLS before logging in");
            return;
        }
        if !is_valid_username(username) {
            client.send_error("badUsername", "Invalid username");
            return;
        }

        let avatar = avatar
            .and_then(|a| STANDARD.decode(a).ok())
            .unwrap_or_default();
        client.identify(username, avatar);
        client.log(
            Log::new()
                .about(Level::Info, Topic::Status)
                .message(format!("Identified as {username}")),
        );
        client.send_reply(&ServerReply::IdentOk {
            username: username.to_string(),
        });

        let sessions = self.session_descriptions();
        if let Some(client) = self.clients.get(&conn_id) {
            client.send_reply(&ServerReply::Sessions {
                sessions,
                removed: Vec::new(),
            });
        }
    }

    /// Whether the client may host or join. Replies `notIdentified` if not.
    fn require_identified(&self, conn_id: ConnId) -> bool {
        match self.clients.get(&conn_id) {
            Some(client) if client.state() == ClientState::LoggingIn => true,
            Some(client) => {
                client.send_error("notIdentified", "Identify first");
                false
            }
            None => false,
        }
    }

    fn host(&mut self, conn_id: ConnId, req: HostRequest) {
        if !self.require_identified(conn_id) {
            return;
        }
        let Some(client) = self.clients.get(&conn_id) else {
            return;
        };
        let version = match req.protocol.parse::<ProtocolVersion>() {
            Ok(v) => v,
            Err(e) => {
                client.send_error("badProtocol", e.to_string());
                return;
            }
        };
        if req.user_id == 0 || req.user_id == u8::MAX {
            client.send_error("badCommand", "Invalid user id");
            return;
        }
        let id = match req.id.filter(|id| !id.is_empty()) {
            Some(id) if is_valid_session_id(&id) => id,
            Some(_) => {
                client.send_error("badCommand", "Invalid session id");
                return;
            }
            None => new_id(),
        };
        let alias = req.alias.filter(|a| !a.is_empty());
        if alias.as_deref().is_some_and(|a| !is_valid_session_id(a)) {
            client.send_error("badCommand", "Invalid session alias");
            return;
        }
        let founder = client.username().to_string();

        if let Err(e) = self.create_session(&id, alias.as_deref(), &version, &founder) {
            if let Some(client) = self.clients.get(&conn_id) {
                client.send_error(e.code(), e.to_string());
            }
            return;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        let history = session.history_mut();
        let mut configured = Ok(());
        if let Some(title) = &req.title {
            configured = history.set_title(title);
        }
        if req.persistent && configured.is_ok() {
            let mut flags = history.flags();
            flags.persistent = true;
            configured = history.set_flags(flags);
        }
        if let Some(password) = req.password.as_deref().filter(|_| configured.is_ok()) {
            configured = history.set_password(password);
        }
        if let Err(e) = configured {
            warn!(
                component = "login",
                event = "session.configure_failed",
                session_id = %id,
                error = %e,
                "Could not apply host settings"
            );
        }

        if let Err(e) = session.join_client(&mut self.clients, conn_id, Some(req.user_id), "") {
            if let Some(client) = self.clients.get(&conn_id) {
                client.send_error(e.code(), e.to_string());
            }
        }
    }

    fn join(&mut self, conn_id: ConnId, id: &str, password: &str) {
        if !self.require_identified(conn_id) {
            return;
        }
        let Some(session_id) = self
            .get_session_by_id(id, true)
            .map(|s| s.id().to_string())
        else {
            if let Some(client) = self.clients.get(&conn_id) {
                client.send_error("notFound", format!("Session {id} not found"));
            }
            return;
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if let Err(e) = session.join_client(&mut self.clients, conn_id, None, password) {
            if let Some(client) = self.clients.get(&conn_id) {
                if e == JoinError::Banned {
                    client.log(
                        Log::new()
                            .about(Level::Info, Topic::Ban)
                            .session(session_id.as_str())
                            .message("Banned user tried to join"),
                    );
                }
                client.send_error(e.code(), e.to_string());
            }
        }
    }

    /// Keep clients that are choosing a session up to date
    pub(crate) fn announce(&self, event: &ServerEvent) {
        let reply = match event {
            ServerEvent::SessionCreated(desc) | ServerEvent::SessionChanged(desc) => {
                ServerReply::Sessions {
                    sessions: vec![desc.clone()],
                    removed: Vec::new(),
                }
            }
            ServerEvent::SessionEnded { id } => ServerReply::Sessions {
                sessions: Vec::new(),
                removed: vec![id.clone()],
            },
            _ => return,
        };
        for client in self
            .clients
            .values()
            .filter(|c| c.state() == ClientState::LoggingIn)
        {
            client.send_reply(&reply);
        }
    }
}
