//! One client connection, as seen by the server actor.
//!
//! The socket itself lives in a connection task; the actor talks to it
//! through an unbounded outbound queue so it never waits on a slow peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use scribble_protocol::{
    DisconnectReason, Message, MessageType, ProtocolError, ServerReply, JOIN_FLAG_AUTH,
    JOIN_FLAG_MOD,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::acl::SenderRole;
use crate::json_api::{str_field, JsonApiMethod, JsonApiResult};
use crate::server_log::{Level, Log, ServerLog, Topic};

pub type ConnId = u64;
pub type ClientMap = HashMap<ConnId, Client>;

/// Instructions for a connection task
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    /// Send a disconnect notice, flush and close
    Disconnect {
        reason: DisconnectReason,
        message: String,
    },
    /// Upgrade the transport to TLS before reading further
    StartTls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected, not yet identified
    Lobby,
    /// Identified, choosing a session
    LoggingIn,
    Joined,
    Disconnecting,
}

/// Where an inbound message should go
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Login(Message),
    Session(Message),
    /// Buffered by the hold lock
    Held,
    Ignored,
}

pub struct Client {
    conn_id: ConnId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    log: Arc<ServerLog>,

    state: ClientState,
    session: Option<String>,
    context_id: u8,
    username: String,
    auth_id: String,
    avatar: Vec<u8>,

    operator: bool,
    moderator: bool,
    trusted: bool,
    muted: bool,
    secure: bool,

    last_active: DateTime<Utc>,
    hold_locked: bool,
    hold_queue: Vec<Message>,
    awaiting_reset: bool,
    logoff_pending: bool,
}

impl Client {
    pub fn new(
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
        log: Arc<ServerLog>,
    ) -> Self {
        Self {
            conn_id,
            peer,
            outbound,
            log,
            state: ClientState::Lobby,
            session: None,
            context_id: 0,
            username: String::new(),
            auth_id: String::new(),
            avatar: Vec::new(),
            operator: false,
            moderator: false,
            trusted: false,
            muted: false,
            secure: false,
            last_active: Utc::now(),
            hold_locked: false,
            hold_queue: Vec::new(),
            awaiting_reset: false,
            logoff_pending: false,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn context_id(&self) -> u8 {
        self.context_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth_id(&self) -> &str {
        &self.auth_id
    }

    pub fn avatar(&self) -> &[u8] {
        &self.avatar
    }

    /// Operator status. Moderators are always operators.
    pub fn is_operator(&self) -> bool {
        self.operator || self.moderator
    }

    pub fn is_moderator(&self) -> bool {
        self.moderator
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Trusted non-operator in a session that allows deputies
    pub fn is_deputy(&self, deputies_enabled: bool) -> bool {
        deputies_enabled && !self.is_operator() && self.trusted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_authenticated(&self) -> bool {
        !self.auth_id.is_empty()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    pub fn is_hold_locked(&self) -> bool {
        self.hold_locked
    }

    pub fn is_awaiting_reset(&self) -> bool {
        self.awaiting_reset
    }

    pub fn role(&self, deputies_enabled: bool) -> SenderRole {
        SenderRole {
            operator: self.is_operator(),
            deputy: self.is_deputy(deputies_enabled),
            muted: self.muted,
        }
    }

    /// Record the identity from a successful `ident`
    pub fn identify(&mut self, username: &str, avatar: Vec<u8>) {
        self.username = username.to_string();
        self.avatar = avatar;
        if self.state == ClientState::Lobby {
            self.state = ClientState::LoggingIn;
        }
    }

    pub fn set_auth_id(&mut self, auth_id: impl Into<String>) {
        self.auth_id = auth_id.into();
    }

    pub fn set_operator(&mut self, op: bool) {
        self.operator = op;
    }

    pub fn set_moderator(&mut self, moderator: bool) {
        self.moderator = moderator;
    }

    pub fn set_trusted(&mut self, trusted: bool) {
        self.trusted = trusted;
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Attach to a session. From now on inbound messages go to the session.
    pub fn set_session(&mut self, session_id: &str, context_id: u8) {
        self.session = Some(session_id.to_string());
        self.context_id = context_id;
        if self.state != ClientState::Disconnecting {
            self.state = ClientState::Joined;
        }
    }

    pub fn clear_session(&mut self) {
        self.session = None;
        self.hold_locked = false;
        self.hold_queue.clear();
        self.awaiting_reset = false;
    }

    pub fn join_message(&self) -> Result<Message, ProtocolError> {
        let mut flags = 0;
        if self.is_authenticated() {
            flags |= JOIN_FLAG_AUTH;
        }
        if self.moderator {
            flags |= JOIN_FLAG_MOD;
        }
        Message::user_join(self.context_id, flags, &self.username, &self.avatar)
    }

    /// Queue a message. Non-control messages are dropped while awaiting a reset.
    pub fn send(&self, msg: Message) {
        if self.awaiting_reset && !msg.kind().is_control() {
            return;
        }
        self.push(Outbound::Message(msg));
    }

    pub fn send_reply(&self, reply: &ServerReply) {
        match Message::command(0, reply) {
            Ok(msg) => self.send(msg),
            Err(e) => warn!(
                component = "client",
                event = "client.reply_encode_failed",
                connection_id = self.conn_id,
                error = %e,
                "Could not encode server reply"
            ),
        }
    }

    pub fn send_error(&self, code: &str, message: impl Into<String>) {
        self.send_reply(&ServerReply::error(code, message));
    }

    pub fn send_system_chat(&self, text: &str) {
        self.send_reply(&ServerReply::message(text, false));
    }

    pub fn request_start_tls(&self) {
        self.push(Outbound::StartTls);
    }

    fn push(&self, out: Outbound) {
        if self.outbound.send(out).is_err() {
            debug!(
                component = "client",
                event = "client.outbound_closed",
                connection_id = self.conn_id,
                "Outbound queue closed, dropping"
            );
        }
    }

    /// Classify an inbound message and update activity
    pub fn receive(&mut self, msg: Message) -> Received {
        if msg.kind() == MessageType::PING {
            // Keepalives don't count as activity
            if msg.is_ping() {
                self.send(Message::ping(true));
            }
            return Received::Ignored;
        }
        self.last_active = Utc::now();

        match self.state {
            ClientState::Lobby | ClientState::LoggingIn => {
                if msg.kind() == MessageType::COMMAND {
                    Received::Login(msg)
                } else {
                    self.log(
                        Log::new()
                            .about(Level::Warn, Topic::RuleBreak)
                            .message(format!("Got non-login message (type={}) in login state", msg.kind())),
                    );
                    Received::Ignored
                }
            }
            ClientState::Joined => {
                let msg = msg.with_context_id(self.context_id);
                if self.hold_locked {
                    self.hold_queue.push(msg);
                    Received::Held
                } else {
                    Received::Session(msg)
                }
            }
            ClientState::Disconnecting => Received::Ignored,
        }
    }

    /// Ask the connection to close. Does nothing if already disconnecting.
    pub fn disconnect(&mut self, reason: DisconnectReason, message: &str) {
        if self.state == ClientState::Disconnecting {
            return;
        }
        let topic = match reason {
            DisconnectReason::Kick => Topic::Kick,
            _ => Topic::Leave,
        };
        self.log(Log::new().about(Level::Info, topic).message(message));

        self.state = ClientState::Disconnecting;
        self.logoff_pending = true;
        self.push(Outbound::Disconnect {
            reason,
            message: message.to_string(),
        });
    }

    /// Whether a disconnect was requested since the last call
    pub fn take_logoff(&mut self) -> bool {
        std::mem::take(&mut self.logoff_pending)
    }

    /// Lock or unlock. Unlocking returns the held messages in arrival order.
    pub fn set_hold_locked(&mut self, lock: bool) -> Vec<Message> {
        self.hold_locked = lock;
        if lock {
            Vec::new()
        } else {
            std::mem::take(&mut self.hold_queue)
        }
    }

    /// Return unprocessed messages to the front of the hold queue
    pub fn hold_back(&mut self, mut msgs: Vec<Message>) {
        msgs.append(&mut self.hold_queue);
        self.hold_queue = msgs;
    }

    pub fn set_awaiting_reset(&mut self, awaiting: bool) {
        self.awaiting_reset = awaiting;
    }

    pub fn description(&self, include_session: bool) -> Value {
        let mut desc = json!({
            "id": self.context_id,
            "name": self.username,
            "ip": self.peer.ip().to_string(),
            "lastActive": self.last_active.to_rfc3339_opts(SecondsFormat::Secs, true),
            "auth": self.is_authenticated(),
            "op": self.is_operator(),
            "muted": self.muted,
            "mod": self.moderator,
            "tls": self.secure,
        });
        if include_session {
            if let Some(session) = &self.session {
                desc["session"] = json!(session);
            }
        }
        desc
    }

    /// Admin API for this client. Operator and trust changes go through the
    /// session and must be applied by the caller first.
    pub fn call_json_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &Value,
    ) -> JsonApiResult {
        if !path.is_empty() {
            return JsonApiResult::not_found();
        }
        match method {
            JsonApiMethod::Get => JsonApiResult::ok(self.description(true)),
            JsonApiMethod::Delete => {
                self.disconnect(DisconnectReason::Kick, "server operator");
                JsonApiResult::ok(json!({ "status": "ok" }))
            }
            JsonApiMethod::Update => {
                if let Some(message) = str_field(request, "message") {
                    self.send_system_chat(message);
                }
                if let Some(muted) = request.get("muted").and_then(Value::as_bool) {
                    if muted != self.muted {
                        self.muted = muted;
                        let topic = if muted { Topic::Mute } else { Topic::Unmute };
                        self.log(Log::new().about(Level::Info, topic).message("changed by server operator"));
                    }
                }
                if let Some(moderator) = request.get("mod").and_then(Value::as_bool) {
                    self.moderator = moderator;
                }
                JsonApiResult::ok(self.description(true))
            }
        }
    }

    /// Log an entry tagged with this client and its session
    pub fn log(&self, entry: Log) {
        let mut entry = entry.user(self.context_id, Some(self.peer.ip()), &self.username);
        if let Some(session) = &self.session {
            entry = entry.session(session.clone());
        }
        self.log.log_message(entry);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_client(
        conn_id: ConnId,
        name: &str,
    ) -> (Client, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(ServerLog::in_memory());
        log.set_silent(true);
        let peer = SocketAddr::from(([127, 0, 0, conn_id as u8], 4000));
        let mut client = Client::new(conn_id, peer, tx, log);
        client.identify(name, Vec::new());
        (client, rx)
    }

    /// Drain the decoded server replies from an outbound queue
    pub(crate) fn replies(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerReply> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(msg) = item {
                if msg.kind() == MessageType::COMMAND {
                    out.push(msg.parse_command().unwrap());
                }
            }
        }
        out
    }

    fn pen(n: u8) -> Message {
        Message::new(MessageType::PEN_UP, 0, vec![n]).unwrap()
    }

    #[test]
    fn login_state_only_routes_commands() {
        let (mut client, _rx) = test_client(1, "bob");
        assert_eq!(client.state(), ClientState::LoggingIn);

        let cmd = Message::command(0, &serde_json::json!({"cmd": "join", "id": "x"})).unwrap();
        assert_eq!(client.receive(cmd.clone()), Received::Login(cmd));
        assert_eq!(client.receive(pen(1)), Received::Ignored);
    }

    #[test]
    fn joined_messages_are_retagged() {
        let (mut client, _rx) = test_client(1, "bob");
        client.set_session("abc", 7);
        match client.receive(pen(1)) {
            Received::Session(msg) => assert_eq!(msg.context_id(), 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hold_lock_releases_in_arrival_order() {
        let (mut client, _rx) = test_client(1, "bob");
        client.set_session("abc", 2);
        assert!(client.set_hold_locked(true).is_empty());

        for n in 1..=3 {
            assert_eq!(client.receive(pen(n)), Received::Held);
        }
        let held = client.set_hold_locked(false);
        let payloads: Vec<u8> = held.iter().map(|m| m.payload()[0]).collect();
        assert_eq!(payloads, vec![1, 2, 3]);
        assert!(held.iter().all(|m| m.context_id() == 2));
        assert!(matches!(client.receive(pen(4)), Received::Session(_)));
    }

    #[test]
    fn awaiting_reset_suppresses_non_control() {
        let (mut client, mut rx) = test_client(1, "bob");
        client.set_awaiting_reset(true);
        client.send(pen(1));
        client.send_system_chat("still delivered");
        assert_eq!(replies(&mut rx).len(), 1);

        client.set_awaiting_reset(false);
        client.send(pen(2));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Message(_))));
    }

    #[test]
    fn pings_are_answered_and_not_activity() {
        let (mut client, mut rx) = test_client(1, "bob");
        let before = client.last_active();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(client.receive(Message::ping(false)), Received::Ignored);
        assert_eq!(client.last_active(), before);
        match rx.try_recv() {
            Ok(Outbound::Message(msg)) => {
                assert_eq!(msg.kind(), MessageType::PING);
                assert!(!msg.is_ping());
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_is_queued_once() {
        let (mut client, mut rx) = test_client(1, "bob");
        client.disconnect(DisconnectReason::Kick, "bye");
        client.disconnect(DisconnectReason::Error, "again");
        assert!(client.take_logoff());
        assert!(!client.take_logoff());
        assert_eq!(client.state(), ClientState::Disconnecting);

        match rx.try_recv() {
            Ok(Outbound::Disconnect { reason, message }) => {
                assert_eq!(reason, DisconnectReason::Kick);
                assert_eq!(message, "bye");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn description_and_admin_update() {
        let (mut client, mut rx) = test_client(1, "bob");
        client.set_session("abc", 3);
        let desc = client.description(true);
        assert_eq!(desc["id"], 3);
        assert_eq!(desc["name"], "bob");
        assert_eq!(desc["ip"], "127.0.0.1");
        assert_eq!(desc["session"], "abc");
        assert!(client.description(false).get("session").is_none());

        let result = client.call_json_api(
            JsonApiMethod::Update,
            &[],
            &json!({ "muted": true, "mod": true, "message": "hello" }),
        );
        assert!(result.is_ok());
        assert_eq!(result.body["muted"], true);
        assert_eq!(result.body["op"], true);
        assert_eq!(replies(&mut rx), vec![ServerReply::message("hello", false)]);

        assert_eq!(
            client.call_json_api(JsonApiMethod::Get, &["x".into()], &Value::Null),
            JsonApiResult::not_found()
        );
    }

    #[test]
    fn join_message_carries_flags() {
        let (mut client, _rx) = test_client(1, "bob");
        client.set_auth_id("u1");
        client.set_moderator(true);
        client.set_session("abc", 5);
        let msg = client.join_message().unwrap();
        assert_eq!(msg.context_id(), 5);
        assert_eq!(
            msg.user_join_info(),
            Some((JOIN_FLAG_AUTH | JOIN_FLAG_MOD, "bob".to_string()))
        );
    }
}
