//! A drawing session: one history plus the clients attached to it.
//!
//! Sessions never own clients. They keep connection ids and borrow the
//! server's client map for every operation that needs to reach a client.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use scribble_protocol::{
    ClientCommand, DisconnectReason, Message, MessageType, ServerReply, SessionConfChanges,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{error, info};

use crate::acl::{CommandFilter, SessionAcl, Verdict};
use crate::announcements::ListingRequest;
use crate::client::{Client, ClientMap, ConnId};
use crate::history::{HistoryError, SessionHistory};
use crate::json_api::{pop_path, str_field, JsonApiMethod, JsonApiResult};
use crate::server_log::{Level, Log, ServerLog, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No one has joined yet
    Waiting,
    Running,
    /// An operator is uploading a new history
    Reset,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("session is full")]
    SessionFull,
    #[error("session only accepts authenticated users")]
    AuthOnly,
    #[error("session is closed")]
    Closed,
    #[error("you have been banned from this session")]
    Banned,
    #[error("incorrect password")]
    BadPassword,
    #[error("unknown client")]
    UnknownClient,
}

impl JoinError {
    pub fn code(self) -> &'static str {
        match self {
            Self::SessionFull => "sessionFull",
            Self::AuthOnly => "authOnly",
            Self::Closed => "closed",
            Self::Banned => "banned",
            Self::BadPassword => "badPassword",
            Self::UnknownClient => "internalError",
        }
    }
}

pub struct Session {
    history: Box<dyn SessionHistory>,
    log: Arc<ServerLog>,
    filter: Box<dyn CommandFilter>,
    state: SessionState,
    users: Vec<ConnId>,
    resetter: Option<ConnId>,
    reset_buffer: Vec<Message>,
    autoreset_requested: bool,
    out_of_space_notified: bool,
    last_event: Instant,
    terminate_on_reap: bool,
    changed: bool,
    listing_requests: Vec<ListingRequest>,
}

impl Session {
    pub fn new(history: Box<dyn SessionHistory>, log: Arc<ServerLog>) -> Self {
        Self {
            history,
            log,
            filter: Box::new(SessionAcl),
            state: SessionState::Waiting,
            users: Vec::new(),
            resetter: None,
            reset_buffer: Vec::new(),
            autoreset_requested: false,
            out_of_space_notified: false,
            last_event: Instant::now(),
            terminate_on_reap: false,
            changed: false,
            listing_requests: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.history.id()
    }

    pub fn alias(&self) -> Option<&str> {
        self.history.alias()
    }

    /// Does this session go by `id_or_alias`?
    pub fn matches(&self, id_or_alias: &str) -> bool {
        self.id() == id_or_alias || self.alias() == Some(id_or_alias)
    }

    pub fn history(&self) -> &dyn SessionHistory {
        self.history.as_ref()
    }

    pub fn history_mut(&mut self) -> &mut dyn SessionHistory {
        self.history.as_mut()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn users(&self) -> &[ConnId] {
        &self.users
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_persistent(&self) -> bool {
        self.history.flags().persistent
    }

    /// Time since the last message or membership change
    pub fn last_event_time(&self) -> Duration {
        self.last_event.elapsed()
    }

    /// Whether the history files go when the session is reaped
    pub fn should_terminate(&self) -> bool {
        self.terminate_on_reap
    }

    /// Whether attributes or membership changed since the last call
    pub fn take_changed(&mut self) -> bool {
        mem::take(&mut self.changed)
    }

    /// Listing changes operators asked for since the last call
    pub fn take_listing_requests(&mut self) -> Vec<ListingRequest> {
        mem::take(&mut self.listing_requests)
    }

    pub fn log(&self, entry: Log) {
        self.log.log_message(entry.session(self.id()));
    }

    fn touch(&mut self) {
        self.last_event = Instant::now();
    }

    fn find_user(&self, clients: &ClientMap, context_id: u8) -> Option<ConnId> {
        self.users
            .iter()
            .copied()
            .find(|id| clients.get(id).map(Client::context_id) == Some(context_id))
    }

    /// Attach a client. Hosts bring their own context id and skip the
    /// ban and password checks.
    pub fn join_client(
        &mut self,
        clients: &mut ClientMap,
        conn_id: ConnId,
        host_id: Option<u8>,
        password: &str,
    ) -> Result<u8, JoinError> {
        if self.state == SessionState::Shutdown {
            return Err(JoinError::Closed);
        }
        let in_use: HashSet<u8> = self
            .users
            .iter()
            .filter_map(|id| clients.get(id))
            .map(Client::context_id)
            .collect();
        let first = self.users.is_empty();

        let client = clients.get(&conn_id).ok_or(JoinError::UnknownClient)?;
        let moderator = client.is_moderator();
        if host_id.is_none() && !moderator {
            if self
                .history
                .bans()
                .is_banned(Some(client.peer().ip()), client.auth_id())
            {
                return Err(JoinError::Banned);
            }
            if !self.history.check_password(password) {
                return Err(JoinError::BadPassword);
            }
        }
        if !moderator && self.users.len() >= usize::from(self.history.max_users()) {
            return Err(JoinError::SessionFull);
        }
        if self.history.flags().auth_only && !client.is_authenticated() && !moderator {
            return Err(JoinError::AuthOnly);
        }
        let username = client.username().to_string();
        let auth_id = client.auth_id().to_string();

        let context_id = match host_id {
            Some(id) if id != 0 && !in_use.contains(&id) => id,
            _ => self
                .history
                .id_queue_mut()
                .next_id_for(&username, |id| in_use.contains(&id))
                .ok_or(JoinError::SessionFull)?,
        };
        let operator = first
            || moderator
            || (!auth_id.is_empty() && self.history.is_authenticated_operator(&auth_id));
        let trusted = !auth_id.is_empty() && self.history.is_authenticated_trusted(&auth_id);

        if let Err(e) = self.history.join_user(context_id, &username) {
            self.storage_failed(clients, &e);
            return Err(JoinError::Closed);
        }

        let session_id = self.id().to_string();
        let client = clients.get_mut(&conn_id).ok_or(JoinError::UnknownClient)?;
        client.set_session(&session_id, context_id);
        client.set_operator(operator);
        client.set_trusted(trusted);
        client.send_reply(&ServerReply::Joined {
            session_id,
            user_id: context_id,
            host: host_id.is_some(),
        });

        if host_id.is_none() {
            client.send_reply(&ServerReply::Catchup {
                count: self.history.message_count() as usize,
            });
            for msg in self.history().messages_since(0) {
                client.send(msg);
            }
            let delivered = self.history.last_seq();
            self.history.cleanup_batches(delivered);
        }
        if self.state == SessionState::Reset {
            client.set_hold_locked(true);
            client.set_awaiting_reset(true);
        }
        client.log(Log::new().about(Level::Info, Topic::Join).message("Joined session"));
        let join = client.join_message();

        self.users.push(conn_id);
        if self.state == SessionState::Waiting {
            self.state = SessionState::Running;
        }
        self.touch();
        self.changed = true;

        match join {
            Ok(msg) => {
                self.add_to_history(clients, msg);
            }
            Err(e) => self.log(
                Log::new()
                    .about(Level::Warn, Topic::Status)
                    .message(format!("Could not build join message: {e}")),
            ),
        }
        if operator {
            self.send_operator_list(clients);
            if let Some(client) = clients.get(&conn_id) {
                client.send_reply(&self.ban_list_reply(client));
            }
        }
        Ok(context_id)
    }

    /// Detach a client. Returns the number of users left.
    pub fn remove_client(&mut self, clients: &mut ClientMap, conn_id: ConnId) -> usize {
        let Some(pos) = self.users.iter().position(|&id| id == conn_id) else {
            return self.users.len();
        };
        self.users.remove(pos);

        let mut context_id = 0;
        if let Some(client) = clients.get_mut(&conn_id) {
            client.log(Log::new().about(Level::Info, Topic::Leave).message("Left session"));
            context_id = client.context_id();
            client.clear_session();
        }

        if self.resetter == Some(conn_id) {
            self.log(
                Log::new()
                    .about(Level::Info, Topic::Status)
                    .message("Resetting user left, reset cancelled"),
            );
            self.end_reset(clients);
        }
        if self.state != SessionState::Shutdown && context_id != 0 {
            self.add_to_history(clients, Message::user_leave(context_id));
        }

        self.touch();
        self.changed = true;
        self.users.len()
    }

    /// Process a message from a joined client
    pub fn handle_client_message(&mut self, clients: &mut ClientMap, conn_id: ConnId, msg: Message) {
        if self.state == SessionState::Shutdown || !self.users.contains(&conn_id) {
            return;
        }
        self.touch();

        let kind = msg.kind();
        if kind == MessageType::COMMAND {
            self.handle_command(clients, conn_id, &msg);
            return;
        }
        if kind.is_control() {
            return;
        }
        if self.state == SessionState::Reset && self.resetter == Some(conn_id) {
            self.reset_buffer.push(msg);
            return;
        }

        let Some(client) = clients.get(&conn_id) else {
            return;
        };
        let flags = self.history.flags();
        if let Verdict::Reject(reason) = self.filter.check(client.role(flags.deputies), &msg) {
            client.log(
                Log::new()
                    .about(Level::Debug, Topic::RuleBreak)
                    .message(format!("{kind} rejected: {reason}")),
            );
            client.send_error("rejected", format!("{kind} rejected: {reason}"));
            return;
        }

        match kind {
            MessageType::PRIVATE_CHAT => {
                // Recipient context id is the first payload byte
                let target = msg.payload().first().copied();
                let sender = client.context_id();
                for id in &self.users {
                    if let Some(c) = clients.get(id) {
                        if Some(c.context_id()) == target || c.context_id() == sender {
                            c.send(msg.clone());
                        }
                    }
                }
            }
            MessageType::CHAT if !flags.preserve_chat => self.broadcast(clients, &msg),
            MessageType::SESSION_OWNER => {
                if self.add_to_history(clients, msg.clone()) {
                    self.apply_operator_list(clients, msg.payload());
                }
            }
            MessageType::TRUSTED_USERS => {
                if self.add_to_history(clients, msg.clone()) {
                    self.apply_trusted_list(clients, msg.payload());
                }
            }
            _ => {
                self.add_to_history(clients, msg);
            }
        }
    }

    /// Append to history, then fan out. Returns whether the message was accepted.
    fn add_to_history(&mut self, clients: &mut ClientMap, msg: Message) -> bool {
        let result = if msg.kind() == MessageType::SOFT_RESET {
            self.history.soft_reset(msg.context_id())
        } else {
            self.history.add_message(msg.clone())
        };

        match result {
            Ok(_) => {
                self.broadcast(clients, &msg);
                self.check_autoreset(clients);
                true
            }
            Err(HistoryError::OutOfSpace) => {
                if !self.out_of_space_notified {
                    self.out_of_space_notified = true;
                    self.log(
                        Log::new()
                            .about(Level::Error, Topic::Status)
                            .message("History size limit reached"),
                    );
                    self.message_all(
                        clients,
                        "History limit reached! Session must be reset to continue.",
                        true,
                    );
                    self.request_reset(clients);
                }
                false
            }
            Err(e) => {
                self.storage_failed(clients, &e);
                false
            }
        }
    }

    fn broadcast(&self, clients: &ClientMap, msg: &Message) {
        for id in &self.users {
            if let Some(client) = clients.get(id) {
                client.send(msg.clone());
            }
        }
    }

    fn broadcast_reply(&self, clients: &ClientMap, reply: &ServerReply) {
        for id in &self.users {
            if let Some(client) = clients.get(id) {
                client.send_reply(reply);
            }
        }
    }

    fn check_autoreset(&mut self, clients: &ClientMap) {
        let threshold = self.history.effective_autoreset_threshold();
        if threshold == 0
            || self.autoreset_requested
            || self.state != SessionState::Running
            || self.history.size() < threshold
        {
            return;
        }
        if self.request_reset(clients) {
            self.autoreset_requested = true;
            self.log(
                Log::new()
                    .about(Level::Info, Topic::Status)
                    .message(format!("Autoreset requested at {} bytes", self.history.size())),
            );
        }
    }

    /// Ask one operator to reset the session. Returns false if there is none.
    fn request_reset(&self, clients: &ClientMap) -> bool {
        let operator = self
            .users
            .iter()
            .filter_map(|id| clients.get(id))
            .find(|c| c.is_operator() && !c.is_awaiting_reset());
        match operator {
            Some(client) => {
                client.send_reply(&ServerReply::ResetRequest {
                    size: self.history.size(),
                    limit: self.history.size_limit(),
                });
                true
            }
            None => false,
        }
    }

    pub(crate) fn storage_failed(&mut self, clients: &mut ClientMap, err: &HistoryError) {
        error!(
            component = "session",
            event = "session.storage_failed",
            session_id = %self.id(),
            error = %err,
            "History storage failed"
        );
        self.log(
            Log::new()
                .about(Level::Error, Topic::Status)
                .message(format!("History storage failed: {err}")),
        );
        self.shut_down(clients, DisconnectReason::Error, "Session storage error", false);
    }

    fn handle_command(&mut self, clients: &mut ClientMap, conn_id: ConnId, msg: &Message) {
        let Some(client) = clients.get(&conn_id) else {
            return;
        };
        let cmd: ClientCommand = match msg.parse_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                client.send_error("badCommand", format!("Invalid command: {e}"));
                return;
            }
        };
        let operator = client.is_operator();
        let deputy = client.is_deputy(self.history.flags().deputies);

        match cmd {
            ClientCommand::StartTls
            | ClientCommand::Ident { .. }
            | ClientCommand::Host { .. }
            | ClientCommand::Join { .. } => {
                client.send_error("badCommand", "Already logged in");
            }
            ClientCommand::KickUser { user_id, ban } => {
                if ban && !operator {
                    client.send_error("notOperator", "Only operators can ban users");
                } else if operator || deputy {
                    self.kick(clients, conn_id, user_id, ban);
                } else {
                    client.send_error("notOperator", "Only operators can kick users");
                }
            }
            ClientCommand::GainOp { password } => {
                if self.history.check_opword(&password) {
                    self.change_op_status(clients, conn_id, true, "operator password");
                } else {
                    client.send_error("badPassword", "Incorrect operator password");
                }
            }
            _ if !operator => {
                client.send_error("notOperator", "Only operators can do that");
            }
            ClientCommand::InitBegin => self.begin_reset(clients, conn_id),
            ClientCommand::InitComplete => self.complete_reset(clients, conn_id),
            ClientCommand::InitCancel => self.cancel_reset(clients, conn_id),
            ClientCommand::SessionConf(changes) => self.apply_conf(clients, &changes),
            ClientCommand::RemoveBan { id } => self.remove_ban(clients, conn_id, id),
            ClientCommand::AnnounceSession { url, private } => {
                self.listing_requests.push(ListingRequest::Announce {
                    url,
                    private,
                    requested_by: conn_id,
                });
            }
            ClientCommand::UnlistSession { url } => {
                self.listing_requests.push(ListingRequest::Unlist { url });
            }
        }
    }

    fn begin_reset(&mut self, clients: &mut ClientMap, conn_id: ConnId) {
        if self.state != SessionState::Running {
            if let Some(client) = clients.get(&conn_id) {
                client.send_error("badState", "Session cannot be reset right now");
            }
            return;
        }
        self.state = SessionState::Reset;
        self.resetter = Some(conn_id);
        self.reset_buffer.clear();

        for id in &self.users {
            if *id == conn_id {
                continue;
            }
            if let Some(client) = clients.get_mut(id) {
                client.set_hold_locked(true);
                client.set_awaiting_reset(true);
            }
        }
        if let Some(client) = clients.get(&conn_id) {
            client.send_reply(&ServerReply::Reset {
                state: "init".into(),
            });
            client.log(Log::new().about(Level::Info, Topic::Status).message("Began session reset"));
        }
    }

    fn complete_reset(&mut self, clients: &mut ClientMap, conn_id: ConnId) {
        if self.state != SessionState::Reset || self.resetter != Some(conn_id) {
            if let Some(client) = clients.get(&conn_id) {
                client.send_error("badState", "No reset in progress");
            }
            return;
        }

        let buffer = mem::take(&mut self.reset_buffer);
        match self.history.reset(buffer) {
            Ok(()) => {
                self.autoreset_requested = false;
                self.out_of_space_notified = false;
                let snapshot: Vec<Message> = self.history().messages_since(0).collect();
                for id in &self.users {
                    if let Some(client) = clients.get_mut(id) {
                        client.set_awaiting_reset(false);
                        client.send_reply(&ServerReply::Reset {
                            state: "reset".into(),
                        });
                        for msg in &snapshot {
                            client.send(msg.clone());
                        }
                    }
                }
                self.log(
                    Log::new()
                        .about(Level::Info, Topic::Status)
                        .message(format!("Session reset, new size {} bytes", self.history.size())),
                );
                self.changed = true;
                self.end_reset(clients);
            }
            Err(HistoryError::ResetTooLarge { size, limit }) => {
                if let Some(client) = clients.get(&conn_id) {
                    client.send_error(
                        "resetTooLarge",
                        format!("Reset image is {size} bytes, limit is {limit}"),
                    );
                }
                self.end_reset(clients);
            }
            Err(e) => self.storage_failed(clients, &e),
        }
    }

    fn cancel_reset(&mut self, clients: &mut ClientMap, conn_id: ConnId) {
        if self.state != SessionState::Reset || self.resetter != Some(conn_id) {
            return;
        }
        self.log(Log::new().about(Level::Info, Topic::Status).message("Session reset cancelled"));
        self.end_reset(clients);
    }

    /// Leave the reset state and replay everything held back meanwhile
    fn end_reset(&mut self, clients: &mut ClientMap) {
        if self.state == SessionState::Reset {
            self.state = SessionState::Running;
        }
        self.resetter = None;
        self.reset_buffer.clear();

        let mut held = Vec::new();
        for id in &self.users {
            if let Some(client) = clients.get_mut(id) {
                client.set_awaiting_reset(false);
                held.push((*id, client.set_hold_locked(false)));
            }
        }
        for (id, msgs) in held {
            let mut msgs = msgs.into_iter();
            while let Some(msg) = msgs.next() {
                // A replayed command may have started another reset
                if let Some(client) = clients.get_mut(&id).filter(|c| c.is_hold_locked()) {
                    client.hold_back(std::iter::once(msg).chain(msgs).collect());
                    break;
                }
                self.handle_client_message(clients, id, msg);
            }
        }
    }

    fn kick(&mut self, clients: &mut ClientMap, conn_id: ConnId, target_ctx: u8, ban: bool) {
        let Some(kicker) = clients.get(&conn_id) else {
            return;
        };
        let kicker_name = kicker.username().to_string();
        let kicker_is_op = kicker.is_operator();

        let Some(target) = self.find_user(clients, target_ctx) else {
            kicker.send_error("notFound", format!("No user #{target_ctx}"));
            return;
        };
        let refusal = clients.get(&target).and_then(|t| {
            if t.is_moderator() {
                Some("Moderators cannot be kicked")
            } else if !kicker_is_op && t.is_operator() {
                Some("Deputies cannot kick operators")
            } else {
                None
            }
        });
        if let Some(reason) = refusal {
            kicker.send_error("rejected", reason);
            return;
        }

        if ban {
            let Some(victim) = clients.get(&target) else {
                return;
            };
            let username = victim.username().to_string();
            let auth_id = victim.auth_id().to_string();
            match self
                .history
                .add_ban(&username, Some(victim.peer().ip()), &auth_id, &kicker_name)
            {
                Ok(Some(_)) => {
                    victim.log(
                        Log::new()
                            .about(Level::Info, Topic::Ban)
                            .message(format!("Banned by {kicker_name}")),
                    );
                    self.send_ban_list(clients);
                }
                Ok(None) => {}
                Err(e) => {
                    self.storage_failed(clients, &e);
                    return;
                }
            }
        }

        let verb = if ban { "banned" } else { "kicked" };
        if let Some(target) = clients.get_mut(&target) {
            target.log(
                Log::new()
                    .about(Level::Info, Topic::Kick)
                    .message(format!("{verb} by {kicker_name}")),
            );
            target.disconnect(DisconnectReason::Kick, &format!("{verb} by {kicker_name}"));
        }
    }

    fn remove_ban(&mut self, clients: &mut ClientMap, conn_id: ConnId, id: u32) {
        match self.history.remove_ban(id) {
            Ok(Some(username)) => {
                if let Some(client) = clients.get(&conn_id) {
                    client.log(
                        Log::new()
                            .about(Level::Info, Topic::Unban)
                            .message(format!("Lifted ban #{id} ({username})")),
                    );
                }
                self.send_ban_list(clients);
            }
            Ok(None) => {
                if let Some(client) = clients.get(&conn_id) {
                    client.send_error("notFound", format!("No ban #{id}"));
                }
            }
            Err(e) => self.storage_failed(clients, &e),
        }
    }

    fn ban_list_reply(&self, recipient: &Client) -> ServerReply {
        ServerReply::BanList {
            bans: self.history.bans().to_json(recipient.is_moderator()),
        }
    }

    /// Send the current ban list to every operator
    fn send_ban_list(&self, clients: &ClientMap) {
        for client in self.users.iter().filter_map(|id| clients.get(id)) {
            if client.is_operator() {
                client.send_reply(&self.ban_list_reply(client));
            }
        }
    }

    fn apply_conf(&mut self, clients: &mut ClientMap, changes: &SessionConfChanges) {
        if let Err(e) = apply_conf_changes(self.history.as_mut(), changes) {
            self.storage_failed(clients, &e);
            return;
        }
        self.changed = true;
        self.log(Log::new().about(Level::Info, Topic::Status).message("Session settings changed"));
        self.broadcast_reply(
            clients,
            &ServerReply::SessionConf {
                title: self.history.title().to_string(),
                persistent: self.is_persistent(),
                max_user_count: self.history.max_users(),
                has_password: self.history.has_password(),
            },
        );
    }

    /// Change a user's operator status on behalf of someone
    pub fn change_op_status(&mut self, clients: &mut ClientMap, conn_id: ConnId, op: bool, by: &str) {
        let Some(client) = clients.get_mut(&conn_id) else {
            return;
        };
        if client.is_operator() == op {
            return;
        }
        client.set_operator(op);
        let topic = if op { Topic::Op } else { Topic::Deop };
        client.log(Log::new().about(Level::Info, topic).message(format!("changed by {by}")));
        let auth_id = client.auth_id().to_string();
        if let Err(e) = self.history.set_authenticated_operator(&auth_id, op) {
            self.storage_failed(clients, &e);
            return;
        }
        self.send_operator_list(clients);
        if op {
            if let Some(client) = clients.get(&conn_id) {
                client.send_reply(&self.ban_list_reply(client));
            }
        }
    }

    pub fn change_trust_status(&mut self, clients: &mut ClientMap, conn_id: ConnId, trusted: bool, by: &str) {
        let Some(client) = clients.get_mut(&conn_id) else {
            return;
        };
        if client.is_trusted() == trusted {
            return;
        }
        client.set_trusted(trusted);
        let topic = if trusted { Topic::Trust } else { Topic::Untrust };
        client.log(Log::new().about(Level::Info, topic).message(format!("changed by {by}")));
        let auth_id = client.auth_id().to_string();
        if let Err(e) = self.history.set_authenticated_trust(&auth_id, trusted) {
            self.storage_failed(clients, &e);
            return;
        }
        let ids = self.user_ids_where(clients, Client::is_trusted);
        self.add_to_history(clients, Message::trusted_users(0, &ids));
    }

    fn send_operator_list(&mut self, clients: &mut ClientMap) {
        let ids = self.user_ids_where(clients, Client::is_operator);
        self.add_to_history(clients, Message::session_owner(0, &ids));
    }

    fn user_ids_where(&self, clients: &ClientMap, pred: impl Fn(&Client) -> bool) -> Vec<u8> {
        self.users
            .iter()
            .filter_map(|id| clients.get(id))
            .filter(|c| pred(c))
            .map(Client::context_id)
            .collect()
    }

    /// Apply an accepted SessionOwner message
    fn apply_operator_list(&mut self, clients: &mut ClientMap, ids: &[u8]) {
        for id in &self.users {
            let Some(client) = clients.get_mut(id) else {
                continue;
            };
            let op = ids.contains(&client.context_id());
            if client.is_operator() != op && !client.is_moderator() {
                client.set_operator(op);
                if client.is_authenticated() {
                    if let Err(e) = self.history.set_authenticated_operator(client.auth_id(), op) {
                        error!(
                            component = "session",
                            event = "session.journal_failed",
                            session_id = %self.history.id(),
                            error = %e,
                            "Could not record operator change"
                        );
                    }
                }
            }
        }
    }

    /// Apply an accepted TrustedUsers message
    fn apply_trusted_list(&mut self, clients: &mut ClientMap, ids: &[u8]) {
        for id in &self.users {
            let Some(client) = clients.get_mut(id) else {
                continue;
            };
            let trusted = ids.contains(&client.context_id());
            if client.is_trusted() != trusted {
                client.set_trusted(trusted);
                if client.is_authenticated() {
                    if let Err(e) = self.history.set_authenticated_trust(client.auth_id(), trusted) {
                        error!(
                            component = "session",
                            event = "session.journal_failed",
                            session_id = %self.history.id(),
                            error = %e,
                            "Could not record trust change"
                        );
                    }
                }
            }
        }
    }

    /// Direct message to every user. Not stored in history.
    pub fn message_all(&self, clients: &ClientMap, text: &str, alert: bool) {
        self.broadcast_reply(clients, &ServerReply::message(text, alert));
    }

    /// Disconnect everyone and mark the session for reaping
    pub fn kill_session(&mut self, clients: &mut ClientMap, graceful: bool, terminate: bool) {
        if self.state == SessionState::Shutdown {
            return;
        }
        if graceful {
            self.message_all(clients, "Session shutting down", true);
        }
        self.log(Log::new().about(Level::Info, Topic::Status).message("Session shut down"));
        self.shut_down(clients, DisconnectReason::Shutdown, "Session terminated", terminate);
    }

    fn shut_down(
        &mut self,
        clients: &mut ClientMap,
        reason: DisconnectReason,
        message: &str,
        terminate: bool,
    ) {
        if self.state == SessionState::Shutdown {
            return;
        }
        info!(
            component = "session",
            event = "session.shutdown",
            session_id = %self.id(),
            users = self.users.len(),
            terminate,
            "Shutting down session"
        );
        self.state = SessionState::Shutdown;
        self.terminate_on_reap = terminate;
        self.changed = true;
        self.resetter = None;
        self.reset_buffer.clear();

        for id in mem::take(&mut self.users) {
            if let Some(client) = clients.get_mut(&id) {
                client.disconnect(reason, message);
                client.clear_session();
            }
        }
    }

    pub fn description(&self, clients: &ClientMap, full: bool) -> Value {
        let h = self.history();
        let flags = h.flags();
        let mut desc = json!({
            "id": h.id(),
            "alias": h.alias().unwrap_or_default(),
            "protocol": h.protocol_version().to_string(),
            "userCount": self.users.len(),
            "maxUserCount": h.max_users(),
            "founder": h.founder(),
            "title": h.title(),
            "persistent": flags.persistent,
            "nsfm": flags.nsfm,
            "authOnly": flags.auth_only,
            "hasPassword": h.has_password(),
            "closed": self.state == SessionState::Shutdown
                || self.users.len() >= usize::from(h.max_users()),
            "size": h.size(),
            "startTime": h.started_at().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        if full {
            desc["maxSize"] = json!(h.size_limit());
            desc["resetThreshold"] = json!(h.effective_autoreset_threshold());
            desc["preserveChat"] = json!(flags.preserve_chat);
            desc["deputies"] = json!(flags.deputies);
            desc["archive"] = json!(h.is_archive());
            desc["hasOpword"] = json!(h.has_opword());
            desc["banlist"] = json!(h.bans().to_json(true));
            desc["users"] = self
                .users
                .iter()
                .filter_map(|id| clients.get(id))
                .map(|c| c.description(false))
                .collect();
        }
        desc
    }

    pub fn call_json_api(
        &mut self,
        clients: &mut ClientMap,
        method: JsonApiMethod,
        path: &[String],
        request: &Value,
    ) -> JsonApiResult {
        let (head, tail) = pop_path(path);
        if let Some(head) = head {
            let Some(conn_id) = head
                .parse::<u8>()
                .ok()
                .and_then(|ctx| self.find_user(clients, ctx))
            else {
                return JsonApiResult::not_found();
            };
            return self.call_user_api(clients, conn_id, method, tail, request);
        }

        match method {
            JsonApiMethod::Get => JsonApiResult::ok(self.description(clients, true)),
            JsonApiMethod::Update => {
                let changes = SessionConfChanges {
                    title: request.get("title").and_then(Value::as_str).map(str::to_string),
                    persistent: request.get("persistent").and_then(Value::as_bool),
                    max_user_count: request
                        .get("maxUserCount")
                        .and_then(Value::as_u64)
                        .map(|n| n.min(u64::from(u8::MAX)) as u8),
                    password: request.get("password").and_then(Value::as_str).map(str::to_string),
                    opword: request.get("opword").and_then(Value::as_str).map(str::to_string),
                    ..Default::default()
                };
                if let Err(e) = apply_conf_changes(self.history.as_mut(), &changes) {
                    self.storage_failed(clients, &e);
                    return JsonApiResult::internal_error("history storage failed");
                }
                self.changed = true;
                if let Some(message) = str_field(request, "message") {
                    self.message_all(clients, message, false);
                }
                if let Some(alert) = str_field(request, "alert") {
                    self.message_all(clients, alert, true);
                }
                JsonApiResult::ok(self.description(clients, true))
            }
            JsonApiMethod::Delete => {
                self.kill_session(clients, true, true);
                JsonApiResult::ok(json!({ "status": "ok" }))
            }
        }
    }

    /// Admin API for one of this session's users
    pub fn call_user_api(
        &mut self,
        clients: &mut ClientMap,
        conn_id: ConnId,
        method: JsonApiMethod,
        path: &[String],
        request: &Value,
    ) -> JsonApiResult {
        if method == JsonApiMethod::Update && path.is_empty() {
            if let Some(op) = request.get("op").and_then(Value::as_bool) {
                self.change_op_status(clients, conn_id, op, "the server administrator");
            }
            if let Some(trusted) = request.get("trusted").and_then(Value::as_bool) {
                self.change_trust_status(clients, conn_id, trusted, "the server administrator");
            }
        }
        match clients.get_mut(&conn_id) {
            Some(client) => client.call_json_api(method, path, request),
            None => JsonApiResult::not_found(),
        }
    }
}

fn apply_conf_changes(
    history: &mut dyn SessionHistory,
    changes: &SessionConfChanges,
) -> Result<(), HistoryError> {
    if let Some(title) = &changes.title {
        history.set_title(title)?;
    }
    let mut flags = history.flags();
    if let Some(v) = changes.persistent {
        flags.persistent = v;
    }
    if let Some(v) = changes.preserve_chat {
        flags.preserve_chat = v;
    }
    if let Some(v) = changes.nsfm {
        flags.nsfm = v;
    }
    if let Some(v) = changes.deputies {
        flags.deputies = v;
    }
    if let Some(v) = changes.auth_only {
        flags.auth_only = v;
    }
    history.set_flags(flags)?;
    if let Some(n) = changes.max_user_count {
        history.set_max_users(n)?;
    }
    if let Some(password) = &changes.password {
        history.set_password(password)?;
    }
    if let Some(opword) = &changes.opword {
        history.set_opword(opword)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use scribble_protocol::ProtocolVersion;
    use tokio::sync::mpsc;

    use crate::client::tests::test_client;
    use crate::client::{ClientState, Outbound, Received};
    use crate::history::InMemoryHistory;

    struct Harness {
        session: Session,
        clients: ClientMap,
        queues: HashMap<ConnId, mpsc::UnboundedReceiver<Outbound>>,
        /// Frames drained from `queues` but not yet claimed by `replies`/`messages`
        pending: HashMap<ConnId, Vec<Message>>,
    }

    impl Harness {
        fn new() -> Self {
            let log = Arc::new(ServerLog::in_memory());
            log.set_silent(true);
            let history = InMemoryHistory::new("abc123", None, ProtocolVersion::current(), "alice");
            Self {
                session: Session::new(Box::new(history), log),
                clients: ClientMap::new(),
                queues: HashMap::new(),
                pending: HashMap::new(),
            }
        }

        fn connect(&mut self, conn_id: ConnId, name: &str) {
            let (client, rx) = test_client(conn_id, name);
            self.clients.insert(conn_id, client);
            self.queues.insert(conn_id, rx);
        }

        fn join(&mut self, conn_id: ConnId, name: &str) -> u8 {
            self.connect(conn_id, name);
            let host = if self.session.user_count() == 0 { Some(1) } else { None };
            self.session.join_client(&mut self.clients, conn_id, host, "").unwrap()
        }

        /// Deliver a message the way the server does
        fn send(&mut self, conn_id: ConnId, msg: Message) {
            let client = self.clients.get_mut(&conn_id).unwrap();
            if let Received::Session(msg) = client.receive(msg) {
                self.session.handle_client_message(&mut self.clients, conn_id, msg);
            }
        }

        fn command(&mut self, conn_id: ConnId, cmd: &ClientCommand) {
            self.send(conn_id, Message::command(0, cmd).unwrap());
        }

        /// Move everything queued for a connection into its pending buffer
        fn drain(&mut self, conn_id: ConnId) -> &mut Vec<Message> {
            let rx = self.queues.get_mut(&conn_id).unwrap();
            let buf = self.pending.entry(conn_id).or_default();
            while let Ok(item) = rx.try_recv() {
                if let Outbound::Message(msg) = item {
                    buf.push(msg);
                }
            }
            buf
        }

        /// Take the server replies, leaving other messages for `messages`
        fn replies(&mut self, conn_id: ConnId) -> Vec<ServerReply> {
            let buf = self.drain(conn_id);
            let (cmds, rest): (Vec<Message>, Vec<Message>) = std::mem::take(buf)
                .into_iter()
                .partition(|m| m.kind() == MessageType::COMMAND);
            *buf = rest;
            cmds.iter().map(|m| m.parse_command().unwrap()).collect()
        }

        /// Take everything except server replies, leaving those for `replies`
        fn messages(&mut self, conn_id: ConnId) -> Vec<Message> {
            let buf = self.drain(conn_id);
            let (out, rest): (Vec<Message>, Vec<Message>) = std::mem::take(buf)
                .into_iter()
                .partition(|m| m.kind() != MessageType::COMMAND);
            *buf = rest;
            out
        }

        fn stored(&self) -> Vec<Message> {
            self.session.history().messages_since(0).collect()
        }
    }

    fn pen(n: u8) -> Message {
        Message::new(MessageType::PEN_UP, 0, vec![n]).unwrap()
    }

    fn kinds(msgs: &[Message]) -> Vec<MessageType> {
        msgs.iter().map(Message::kind).collect()
    }

    #[test]
    fn first_joiner_hosts_and_becomes_operator() {
        let mut h = Harness::new();
        assert_eq!(h.session.state(), SessionState::Waiting);
        let ctx = h.join(1, "alice");
        assert_eq!(ctx, 1);
        assert_eq!(h.session.state(), SessionState::Running);
        assert!(h.clients[&1].is_operator());
        assert_eq!(h.clients[&1].state(), ClientState::Joined);

        let replies = h.replies(1);
        assert_eq!(
            replies[0],
            ServerReply::Joined {
                session_id: "abc123".into(),
                user_id: 1,
                host: true
            }
        );
        assert!(!replies.iter().any(|r| matches!(r, ServerReply::Catchup { .. })));
        assert_eq!(
            kinds(&h.stored()),
            vec![MessageType::USER_JOIN, MessageType::SESSION_OWNER]
        );
    }

    #[test]
    fn joiner_gets_catchup_then_history() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.send(1, pen(1));
        h.send(1, pen(2));
        let stored_before = h.stored();

        let ctx = h.join(2, "bob");
        assert_eq!(ctx, 2);
        assert!(!h.clients[&2].is_operator());

        let replies = h.replies(2);
        assert!(matches!(replies[0], ServerReply::Joined { host: false, .. }));
        assert_eq!(
            replies[1],
            ServerReply::Catchup {
                count: stored_before.len()
            }
        );

        let received = h.messages(2);
        assert_eq!(received[..stored_before.len()], stored_before[..]);
        // Then bob's own join, broadcast like any accepted message
        assert_eq!(received[stored_before.len()].kind(), MessageType::USER_JOIN);
    }

    #[test]
    fn accepted_messages_reach_everyone_in_order() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.messages(1);
        h.messages(2);

        h.send(2, pen(1));
        h.send(1, pen(2));
        h.send(2, pen(3));

        for conn in [1, 2] {
            let got: Vec<(u8, u8)> = h
                .messages(conn)
                .iter()
                .map(|m| (m.context_id(), m.payload()[0]))
                .collect();
            assert_eq!(got, vec![(2, 1), (1, 2), (2, 3)]);
        }
    }

    #[test]
    fn rejected_messages_leave_history_alone() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.replies(2);
        let before = h.stored().len();

        h.send(2, Message::session_owner(0, &[2]));
        assert_eq!(h.stored().len(), before);
        assert!(h
            .replies(2)
            .iter()
            .any(|r| matches!(r, ServerReply::Error { code, .. } if code == "rejected")));
        assert!(!h.clients[&2].is_operator());
    }

    #[test]
    fn operator_list_grants_op() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.send(1, Message::session_owner(0, &[1, 2]));
        assert!(h.clients[&2].is_operator());
    }

    #[test]
    fn full_and_auth_only_sessions_refuse() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.session.history_mut().set_max_users(1).unwrap();
        h.connect(2, "bob");
        assert_eq!(
            h.session.join_client(&mut h.clients, 2, None, ""),
            Err(JoinError::SessionFull)
        );

        h.session.history_mut().set_max_users(10).unwrap();
        let mut flags = h.session.history().flags();
        flags.auth_only = true;
        h.session.history_mut().set_flags(flags).unwrap();
        assert_eq!(
            h.session.join_client(&mut h.clients, 2, None, ""),
            Err(JoinError::AuthOnly)
        );
        assert_eq!(JoinError::AuthOnly.code(), "authOnly");

        h.clients.get_mut(&2).unwrap().set_auth_id("bob-account");
        assert!(h.session.join_client(&mut h.clients, 2, None, "").is_ok());
    }

    #[test]
    fn remove_client_appends_leave() {
        let mut h = Harness::new();
        h.join(1, "alice");
        let bob = h.join(2, "bob");
        assert_eq!(h.session.remove_client(&mut h.clients, 2), 1);
        let stored = h.stored();
        let last = stored.last().unwrap();
        assert_eq!(last.kind(), MessageType::USER_LEAVE);
        assert_eq!(last.context_id(), bob);
        // Removing again is harmless
        assert_eq!(h.session.remove_client(&mut h.clients, 2), 1);
    }

    #[test]
    fn returning_user_gets_old_id() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.join(3, "carol");
        h.session.remove_client(&mut h.clients, 2);
        h.clients.remove(&2);
        let again = h.join(4, "bob");
        assert_eq!(again, 2);
    }

    #[test]
    fn hard_reset_holds_others_and_replays_held_messages() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.send(2, pen(100));

        h.command(1, &ClientCommand::InitBegin);
        assert_eq!(h.session.state(), SessionState::Reset);
        assert!(h.clients[&2].is_hold_locked());
        assert!(h.clients[&2].is_awaiting_reset());

        // Bob keeps drawing while the reset is in progress
        for n in 1..=3 {
            h.send(2, pen(n));
        }
        // Alice uploads the new canvas
        h.send(1, pen(50));
        h.send(1, pen(51));
        h.replies(2);
        h.messages(2);

        h.command(1, &ClientCommand::InitComplete);
        assert_eq!(h.session.state(), SessionState::Running);
        assert!(!h.clients[&2].is_hold_locked());

        let payloads: Vec<u8> = h.stored().iter().map(|m| m.payload()[0]).collect();
        assert_eq!(payloads, vec![50, 51, 1, 2, 3]);

        assert!(h
            .replies(2)
            .contains(&ServerReply::Reset { state: "reset".into() }));
        let seen: Vec<u8> = h.messages(2).iter().map(|m| m.payload()[0]).collect();
        assert_eq!(seen, vec![50, 51, 1, 2, 3]);
    }

    #[test]
    fn replay_stops_when_a_held_command_starts_another_reset() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.join(3, "carol");
        h.send(1, Message::session_owner(0, &[1, 2]));
        assert!(h.clients[&2].is_operator());

        h.command(1, &ClientCommand::InitBegin);
        h.send(2, pen(1));
        h.command(2, &ClientCommand::InitBegin);
        h.send(2, pen(2));
        h.send(3, pen(3));

        h.command(1, &ClientCommand::InitCancel);
        assert_eq!(h.session.state(), SessionState::Reset);
        assert!(h.clients[&3].is_hold_locked());
        assert!(h.clients[&1].is_hold_locked());
        let drawn = |h: &Harness| -> Vec<u8> {
            h.stored()
                .iter()
                .filter(|m| m.kind() == MessageType::PEN_UP)
                .map(|m| m.payload()[0])
                .collect()
        };
        // carol's stroke waits for the second reset to end
        assert_eq!(drawn(&h), vec![1]);

        h.command(2, &ClientCommand::InitCancel);
        assert_eq!(h.session.state(), SessionState::Running);
        assert!(!h.clients[&3].is_hold_locked());
        assert_eq!(drawn(&h), vec![1, 3]);
    }

    #[test]
    fn reset_cancelled_when_resetter_leaves() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.command(1, &ClientCommand::InitBegin);
        h.send(2, pen(7));
        let before = h.stored().len();

        h.session.remove_client(&mut h.clients, 1);
        assert_eq!(h.session.state(), SessionState::Running);
        assert!(!h.clients[&2].is_hold_locked());
        // Bob's held message, then alice's leave
        let stored = h.stored();
        assert_eq!(stored.len(), before + 2);
        assert_eq!(stored[before].payload()[0], 7);
        assert_eq!(stored[before + 1].kind(), MessageType::USER_LEAVE);
    }

    #[test]
    fn non_operators_cannot_reset() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.replies(2);
        h.command(2, &ClientCommand::InitBegin);
        assert_eq!(h.session.state(), SessionState::Running);
        assert!(h
            .replies(2)
            .iter()
            .any(|r| matches!(r, ServerReply::Error { code, .. } if code == "notOperator")));
    }

    #[test]
    fn out_of_space_alerts_and_requests_reset() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        let size = h.session.history().size();
        h.session.history_mut().set_size_limit(size);
        h.replies(1);
        h.replies(2);
        h.messages(2);

        h.send(2, pen(1));
        assert!(h.messages(2).is_empty());
        let alice = h.replies(1);
        assert!(alice.iter().any(|r| matches!(r, ServerReply::Alert { .. })));
        assert!(alice.iter().any(|r| matches!(r, ServerReply::ResetRequest { .. })));
        assert!(h
            .replies(2)
            .iter()
            .any(|r| matches!(r, ServerReply::Alert { .. })));
    }

    #[test]
    fn autoreset_is_requested_once() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.session.history_mut().set_autoreset_threshold(10).unwrap();
        h.replies(1);
        for n in 0..5 {
            h.send(1, pen(n));
        }
        let requests = h
            .replies(1)
            .into_iter()
            .filter(|r| matches!(r, ServerReply::ResetRequest { .. }))
            .count();
        assert_eq!(requests, 1);
    }

    #[test]
    fn soft_reset_from_operator_sets_baseline() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.send(1, Message::soft_reset(0));
        let seq = h.session.history().soft_reset_seq();
        assert_eq!(seq, h.session.history().last_seq());
        assert_eq!(h.stored().last().unwrap().kind(), MessageType::SOFT_RESET);
    }

    #[test]
    fn chat_is_not_stored_unless_preserved() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.messages(1);
        let before = h.stored().len();
        h.send(1, Message::chat(0, "hello").unwrap());
        assert_eq!(h.stored().len(), before);
        assert_eq!(kinds(&h.messages(1)), vec![MessageType::CHAT]);
    }

    #[test]
    fn kick_disconnects_target() {
        let mut h = Harness::new();
        h.join(1, "alice");
        let bob = h.join(2, "bob");
        h.command(
            1,
            &ClientCommand::KickUser {
                user_id: bob,
                ban: false,
            },
        );
        assert_eq!(h.clients[&2].state(), ClientState::Disconnecting);
        let rx = h.queues.get_mut(&2).unwrap();
        let mut kicked = false;
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Disconnect { reason, .. } = item {
                kicked = reason == DisconnectReason::Kick;
            }
        }
        assert!(kicked);
    }

    #[test]
    fn sessionconf_updates_and_announces() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.replies(1);
        h.command(
            1,
            &ClientCommand::SessionConf(SessionConfChanges {
                title: Some("Sketch night".into()),
                persistent: Some(true),
                max_user_count: Some(5),
                ..Default::default()
            }),
        );
        assert_eq!(h.session.history().title(), "Sketch night");
        assert!(h.session.is_persistent());
        assert_eq!(h.session.history().max_users(), 5);
        assert!(h.session.take_changed());
        assert!(h.replies(1).contains(&ServerReply::SessionConf {
            title: "Sketch night".into(),
            persistent: true,
            max_user_count: 5,
            has_password: false,
        }));
    }

    fn ban_lists(replies: &[ServerReply]) -> Vec<Vec<Value>> {
        replies
            .iter()
            .filter_map(|r| match r {
                ServerReply::BanList { bans } => Some(bans.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn banned_users_cannot_rejoin_until_unbanned() {
        let mut h = Harness::new();
        h.join(1, "alice");
        let bob = h.join(2, "bob");
        assert_eq!(ban_lists(&h.replies(1)), vec![Vec::<Value>::new()]);

        h.command(1, &ClientCommand::KickUser { user_id: bob, ban: true });
        assert_eq!(h.clients[&2].state(), ClientState::Disconnecting);
        let lists = ban_lists(&h.replies(1));
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0][0]["username"], "bob");
        assert_eq!(lists[0][0]["bannedBy"], "alice");
        assert!(lists[0][0].get("ip").is_none());

        // Same address, different name
        h.session.remove_client(&mut h.clients, 2);
        h.connect(2, "not bob");
        assert_eq!(
            h.session.join_client(&mut h.clients, 2, None, ""),
            Err(JoinError::Banned)
        );
        h.connect(3, "carol");
        assert!(h.session.join_client(&mut h.clients, 3, None, "").is_ok());

        let id = h.session.history().bans().entries()[0].id;
        h.command(1, &ClientCommand::RemoveBan { id });
        assert_eq!(ban_lists(&h.replies(1)), vec![Vec::<Value>::new()]);
        assert!(h.session.join_client(&mut h.clients, 2, None, "").is_ok());

        h.command(1, &ClientCommand::RemoveBan { id });
        assert!(h
            .replies(1)
            .iter()
            .any(|r| matches!(r, ServerReply::Error { code, .. } if code == "notFound")));
    }

    #[test]
    fn only_operators_can_ban() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.replies(2);
        h.command(2, &ClientCommand::KickUser { user_id: 1, ban: true });
        assert_eq!(h.clients[&1].state(), ClientState::Joined);
        assert!(h.session.history().bans().is_empty());
        assert!(h
            .replies(2)
            .iter()
            .any(|r| matches!(r, ServerReply::Error { code, .. } if code == "notOperator")));
    }

    #[test]
    fn moderators_cannot_be_banned() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.connect(2, "mod");
        h.clients.get_mut(&2).unwrap().set_moderator(true);
        let ctx = h.session.join_client(&mut h.clients, 2, None, "").unwrap();
        h.command(1, &ClientCommand::KickUser { user_id: ctx, ban: true });
        assert!(h.session.history().bans().is_empty());
        assert_eq!(h.clients[&2].state(), ClientState::Joined);
    }

    #[test]
    fn password_is_required_to_join() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.replies(1);
        h.command(
            1,
            &ClientCommand::SessionConf(SessionConfChanges {
                password: Some("door".into()),
                ..Default::default()
            }),
        );
        assert!(h.replies(1).iter().any(|r| matches!(
            r,
            ServerReply::SessionConf { has_password: true, .. }
        )));
        assert_eq!(
            h.session.description(&h.clients, false)["hasPassword"],
            true
        );

        h.connect(2, "bob");
        assert_eq!(
            h.session.join_client(&mut h.clients, 2, None, ""),
            Err(JoinError::BadPassword)
        );
        assert_eq!(
            h.session.join_client(&mut h.clients, 2, None, "window"),
            Err(JoinError::BadPassword)
        );
        assert_eq!(JoinError::BadPassword.code(), "badPassword");
        assert!(h.session.join_client(&mut h.clients, 2, None, "door").is_ok());

        h.connect(3, "mod");
        h.clients.get_mut(&3).unwrap().set_moderator(true);
        assert!(h.session.join_client(&mut h.clients, 3, None, "").is_ok());

        h.command(
            1,
            &ClientCommand::SessionConf(SessionConfChanges {
                password: Some(String::new()),
                ..Default::default()
            }),
        );
        assert!(!h.session.history().has_password());
    }

    #[test]
    fn operator_password_grants_op() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.replies(2);
        h.command(2, &ClientCommand::GainOp { password: "key".into() });
        assert!(!h.clients[&2].is_operator());
        assert!(h
            .replies(2)
            .iter()
            .any(|r| matches!(r, ServerReply::Error { code, .. } if code == "badPassword")));

        h.command(
            1,
            &ClientCommand::SessionConf(SessionConfChanges {
                opword: Some("key".into()),
                ..Default::default()
            }),
        );
        h.command(2, &ClientCommand::GainOp { password: "lock".into() });
        assert!(!h.clients[&2].is_operator());
        h.command(2, &ClientCommand::GainOp { password: "key".into() });
        assert!(h.clients[&2].is_operator());
        assert_eq!(ban_lists(&h.replies(2)).len(), 1);
    }

    #[test]
    fn listing_requests_are_queued_for_the_server() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.command(
            2,
            &ClientCommand::AnnounceSession {
                url: "https://list.example/".into(),
                private: false,
            },
        );
        assert!(h.session.take_listing_requests().is_empty());

        h.command(
            1,
            &ClientCommand::AnnounceSession {
                url: "https://list.example/".into(),
                private: true,
            },
        );
        h.command(
            1,
            &ClientCommand::UnlistSession {
                url: "https://list.example/".into(),
            },
        );
        assert_eq!(
            h.session.take_listing_requests(),
            vec![
                ListingRequest::Announce {
                    url: "https://list.example/".into(),
                    private: true,
                    requested_by: 1,
                },
                ListingRequest::Unlist {
                    url: "https://list.example/".into()
                },
            ]
        );
        assert!(h.session.take_listing_requests().is_empty());
    }

    #[test]
    fn kill_session_disconnects_everyone() {
        let mut h = Harness::new();
        h.join(1, "alice");
        h.join(2, "bob");
        h.replies(1);
        h.session.kill_session(&mut h.clients, true, true);

        assert_eq!(h.session.state(), SessionState::Shutdown);
        assert_eq!(h.session.user_count(), 0);
        assert!(h.session.should_terminate());
        for conn in [1, 2] {
            assert_eq!(h.clients[&conn].state(), ClientState::Disconnecting);
        }
        assert!(h
            .replies(1)
            .iter()
            .any(|r| matches!(r, ServerReply::Alert { .. })));

        h.connect(3, "carol");
        assert_eq!(
            h.session.join_client(&mut h.clients, 3, None, ""),
            Err(JoinError::Closed)
        );
    }

    #[test]
    fn json_api_routes_to_users() {
        let mut h = Harness::new();
        h.join(1, "alice");
        let bob = h.join(2, "bob");

        let desc = h
            .session
            .call_json_api(&mut h.clients, JsonApiMethod::Get, &[], &Value::Null);
        assert!(desc.is_ok());
        assert_eq!(desc.body["userCount"], 2);
        assert_eq!(desc.body["users"].as_array().unwrap().len(), 2);

        let path = vec![bob.to_string()];
        let result = h.session.call_json_api(
            &mut h.clients,
            JsonApiMethod::Update,
            &path,
            &json!({ "op": true }),
        );
        assert_eq!(result.body["op"], true);
        assert!(h.clients[&2].is_operator());

        let missing = h.session.call_json_api(
            &mut h.clients,
            JsonApiMethod::Get,
            &["99".into()],
            &Value::Null,
        );
        assert_eq!(missing, JsonApiResult::not_found());

        let updated = h.session.call_json_api(
            &mut h.clients,
            JsonApiMethod::Update,
            &[],
            &json!({ "title": "Renamed", "maxUserCount": 300 }),
        );
        assert_eq!(updated.body["title"], "Renamed");
        assert_eq!(updated.body["maxUserCount"], 254);
    }
}
