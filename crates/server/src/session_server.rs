//! Session server actor: owns every session and client.
//!
//! Connection tasks and the admin API talk to one task through
//! `ServerCommand`s. All state mutation happens on that task, so sessions
//! and clients need no locks. Observers subscribe to `ServerEvent`s and read
//! a lock-free `ServerStatus` snapshot.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use scribble_protocol::{new_id, DisconnectReason, Message, MessageType, ProtocolVersion};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::announcements::{
    Announcements, ListingApi, ListingOutcome, ListingRequest, SessionAnnouncement,
    REFRESH_CHECK_INTERVAL,
};
use crate::client::{Client, ClientMap, ClientState, ConnId, Outbound, Received};
use crate::config::ServerConfig;
use crate::history::{FiledHistory, HistoryError, InMemoryHistory, SessionHistory};
use crate::json_api::{pop_path, str_field, JsonApiMethod, JsonApiResult};
use crate::server_log::{Level, Log, ServerLog, Topic};
use crate::session::{Session, SessionState};
use crate::templates::TemplateLoader;
use crate::timers::TimerQueue;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(15);
const COMMAND_CHANNEL_SIZE: usize = 1024;
const EVENT_CHANNEL_SIZE: usize = 256;

/// Input to the server actor
#[derive(Debug)]
pub enum ServerCommand {
    ClientConnected {
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    ClientMessage {
        conn_id: ConnId,
        msg: Message,
    },
    /// The socket is gone
    ClientDisconnected {
        conn_id: ConnId,
    },
    /// The peer sent something that could not be decoded
    BadData {
        conn_id: ConnId,
        error: String,
    },
    TlsEstablished {
        conn_id: ConnId,
    },
    JsonApi {
        method: JsonApiMethod,
        path: Vec<String>,
        request: Value,
        reply: oneshot::Sender<JsonApiResult>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Notifications for observers of the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated(Value),
    /// Session attributes or membership changed; carries the new description
    SessionChanged(Value),
    SessionEnded { id: String },
    ClientLoggedOff { conn_id: ConnId },
    /// Total number of users joined to sessions
    UserCountChanged(usize),
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CreateSessionError {
    #[error("server is at its session limit")]
    Closed,
    #[error("session id or alias already in use")]
    IdInUse,
    #[error("incompatible protocol version")]
    BadProtocol,
    #[error("could not initialize session history")]
    InternalError,
}

impl CreateSessionError {
    pub fn code(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::IdInUse => "idInUse",
            Self::BadProtocol => "badProtocol",
            Self::InternalError => "internalError",
        }
    }
}

/// Lock-free view of the server for health checks
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStatus {
    pub sessions: usize,
    pub users: usize,
    pub clients: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum TimerKey {
    Cleanup,
    ClientIdle(ConnId),
    Reap,
    RefreshListings,
}

/// Handle to a running server actor (cheap to clone)
#[derive(Clone)]
pub struct ServerHandle {
    command_tx: mpsc::Sender<ServerCommand>,
    events: broadcast::Sender<ServerEvent>,
    status: Arc<ArcSwap<ServerStatus>>,
}

impl ServerHandle {
    /// Start the actor task
    pub fn spawn(server: SessionServer) -> (ServerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = ServerHandle {
            command_tx,
            events: server.events.clone(),
            status: server.status.clone(),
        };
        let task = tokio::spawn(server.run(command_rx));
        (handle, task)
    }

    pub async fn send(&self, cmd: ServerCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_server",
                event = "session_server.channel_closed",
                "Server actor gone, command dropped"
            );
        }
    }

    /// Whether the actor has stopped taking commands
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub async fn json_api(
        &self,
        method: JsonApiMethod,
        path: Vec<String>,
        request: Value,
    ) -> JsonApiResult {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::JsonApi {
            method,
            path,
            request,
            reply,
        })
        .await;
        rx.await
            .unwrap_or_else(|_| JsonApiResult::internal_error("server is shutting down"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Arc<ServerStatus> {
        self.status.load_full()
    }

    /// Stop every session and wait for the actor to finish
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Shutdown { reply }).await;
        let _ = rx.await;
    }
}

pub struct SessionServer {
    pub(crate) config: ServerConfig,
    pub(crate) log: Arc<ServerLog>,
    pub(crate) sessions: HashMap<String, Session>,
    pub(crate) clients: ClientMap,
    pub(crate) templates: Option<Box<dyn TemplateLoader>>,
    session_dir: Option<PathBuf>,
    timers: TimerQueue<TimerKey>,
    events: broadcast::Sender<ServerEvent>,
    status: Arc<ArcSwap<ServerStatus>>,
    user_count: usize,
    /// Present once a listing API is configured
    announcements: Option<Announcements>,
    listing_tx: mpsc::UnboundedSender<ListingOutcome>,
    listing_rx: mpsc::UnboundedReceiver<ListingOutcome>,
}

impl SessionServer {
    pub fn new(config: ServerConfig, log: Arc<ServerLog>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (listing_tx, listing_rx) = mpsc::unbounded_channel();
        Self {
            config,
            log,
            sessions: HashMap::new(),
            clients: ClientMap::new(),
            templates: None,
            session_dir: None,
            timers: TimerQueue::new(),
            events,
            status: Arc::new(ArcSwap::from_pointee(ServerStatus::default())),
            user_count: 0,
            announcements: None,
            listing_tx,
            listing_rx,
        }
    }

    pub fn set_templates(&mut self, templates: Box<dyn TemplateLoader>) {
        self.templates = Some(templates);
    }

    /// Enable listing sessions at listing servers
    pub fn set_listing_api(&mut self, api: Arc<dyn ListingApi>) {
        match &mut self.announcements {
            Some(announcements) => announcements.set_api(api),
            None => {
                self.announcements = Some(Announcements::new(
                    api,
                    self.config.listing_servers.clone(),
                    self.listing_tx.clone(),
                    self.log.clone(),
                ));
            }
        }
        self.timers.schedule(
            TimerKey::RefreshListings,
            Instant::now() + REFRESH_CHECK_INTERVAL,
        );
    }

    /// Store new sessions in `dir`
    pub fn set_session_dir(&mut self, dir: PathBuf) {
        self.session_dir = Some(dir);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        self.announce(&event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<ServerCommand>) {
        info!(
            component = "session_server",
            event = "session_server.started",
            sessions = self.sessions.len(),
            "Session server running"
        );
        self.timers
            .schedule(TimerKey::Cleanup, Instant::now() + CLEANUP_INTERVAL);
        self.publish_status();

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ServerCommand::Shutdown { reply }) => {
                            self.stop_all();
                            self.after_dispatch();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.dispatch(cmd),
                        None => {
                            self.stop_all();
                            self.after_dispatch();
                            break;
                        }
                    }
                }
                Some(outcome) = self.listing_rx.recv() => self.listing_finished(outcome),
                _ = sleep_until_deadline(deadline) => {
                    for key in self.timers.pop_due(Instant::now()) {
                        self.fire(key);
                    }
                }
            }
            self.after_dispatch();
        }

        info!(
            component = "session_server",
            event = "session_server.stopped",
            "Session server stopped"
        );
    }

    pub(crate) fn dispatch(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::ClientConnected {
                conn_id,
                peer,
                outbound,
            } => self.client_connected(conn_id, peer, outbound),
            ServerCommand::ClientMessage { conn_id, msg } => self.client_message(conn_id, msg),
            ServerCommand::ClientDisconnected { conn_id } => self.client_disconnected(conn_id),
            ServerCommand::BadData { conn_id, error } => {
                if let Some(client) = self.clients.get_mut(&conn_id) {
                    client.log(
                        Log::new()
                            .about(Level::Warn, Topic::BadData)
                            .message(format!("Received bad data: {error}")),
                    );
                    client.disconnect(DisconnectReason::Error, "Invalid message");
                }
            }
            ServerCommand::TlsEstablished { conn_id } => {
                if let Some(client) = self.clients.get_mut(&conn_id) {
                    client.set_secure(true);
                    debug!(
                        component = "session_server",
                        event = "client.tls_established",
                        connection_id = conn_id,
                        "TLS established"
                    );
                }
            }
            ServerCommand::JsonApi {
                method,
                path,
                request,
                reply,
            } => {
                let result = self.call_json_api(method, &path, &request);
                let _ = reply.send(result);
            }
            ServerCommand::Shutdown { reply } => {
                self.stop_all();
                let _ = reply.send(());
            }
        }
    }

    fn client_connected(
        &mut self,
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        let client = Client::new(conn_id, peer, outbound, self.log.clone());
        client.log(
            Log::new()
                .about(Level::Debug, Topic::Status)
                .message("New client connected"),
        );
        self.clients.insert(conn_id, client);
        self.touch_client(conn_id);
        self.greet(conn_id);
    }

    fn client_message(&mut self, conn_id: ConnId, msg: Message) {
        if msg.kind() != MessageType::PING {
            self.touch_client(conn_id);
        }
        let Some(client) = self.clients.get_mut(&conn_id) else {
            return;
        };
        match client.receive(msg) {
            Received::Login(msg) => self.handle_login(conn_id, msg),
            Received::Session(msg) => {
                let Some(session_id) = client.session_id().map(str::to_string) else {
                    return;
                };
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.handle_client_message(&mut self.clients, conn_id, msg);
                }
            }
            Received::Held | Received::Ignored => {}
        }
    }

    fn client_disconnected(&mut self, conn_id: ConnId) {
        self.timers.cancel(&TimerKey::ClientIdle(conn_id));
        self.detach_client(conn_id);
        if let Some(mut client) = self.clients.remove(&conn_id) {
            debug!(
                component = "session_server",
                event = "client.disconnected",
                connection_id = conn_id,
                peer = %client.peer(),
                "Client connection closed"
            );
            // A server-side disconnect was already reported by flush_logoffs
            let reported =
                client.state() == ClientState::Disconnecting && !client.take_logoff();
            if !reported {
                self.emit(ServerEvent::ClientLoggedOff { conn_id });
            }
        }
    }

    /// Remove a client from its session, if it has one
    fn detach_client(&mut self, conn_id: ConnId) {
        let Some(session_id) = self
            .clients
            .get(&conn_id)
            .and_then(Client::session_id)
            .map(str::to_string)
        else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.remove_client(&mut self.clients, conn_id);
        }
    }

    /// Restart a client's idle countdown
    fn touch_client(&mut self, conn_id: ConnId) {
        if !self.config.client_timeout.is_zero() {
            self.timers.schedule(
                TimerKey::ClientIdle(conn_id),
                Instant::now() + self.config.client_timeout,
            );
        }
    }

    fn fire(&mut self, key: TimerKey) {
        match key {
            TimerKey::Cleanup => {
                self.cleanup();
                self.timers
                    .schedule(TimerKey::Cleanup, Instant::now() + CLEANUP_INTERVAL);
            }
            TimerKey::ClientIdle(conn_id) => {
                if let Some(client) = self.clients.get_mut(&conn_id) {
                    client.disconnect(DisconnectReason::Error, "Idle timeout");
                }
            }
            TimerKey::Reap => self.reap(),
            TimerKey::RefreshListings => {
                self.refresh_listings();
                self.timers.schedule(
                    TimerKey::RefreshListings,
                    Instant::now() + REFRESH_CHECK_INTERVAL,
                );
            }
        }
    }

    /// Settle the consequences of the last command: logoffs, emptied
    /// sessions and change notifications.
    pub(crate) fn after_dispatch(&mut self) {
        self.flush_logoffs();

        let requests: Vec<(String, ListingRequest)> = self
            .sessions
            .iter_mut()
            .flat_map(|(id, s)| {
                s.take_listing_requests()
                    .into_iter()
                    .map(move |r| (id.clone(), r))
            })
            .collect();
        for (id, request) in requests {
            self.listing_request(&id, request);
        }

        let changed: Vec<String> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, s)| s.take_changed().then(|| id.clone()))
            .collect();
        for id in changed {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if session.user_count() == 0
                && session.state() != SessionState::Shutdown
                && !session.is_persistent()
            {
                session.log(
                    Log::new()
                        .about(Level::Info, Topic::Status)
                        .message("Last user left non-persistent session"),
                );
                session.kill_session(&mut self.clients, false, true);
                session.take_changed();
            }
            if session.state() == SessionState::Shutdown {
                self.timers.schedule(TimerKey::Reap, Instant::now());
            } else {
                let desc = session.description(&self.clients, false);
                self.emit(ServerEvent::SessionChanged(desc));
            }
        }

        // Killing sessions disconnects their users
        self.flush_logoffs();

        let users = self.sessions.values().map(Session::user_count).sum();
        if users != self.user_count {
            self.user_count = users;
            self.emit(ServerEvent::UserCountChanged(users));
        }
        self.publish_status();
    }

    fn flush_logoffs(&mut self) {
        let logged_off: Vec<ConnId> = self
            .clients
            .iter_mut()
            .filter_map(|(id, c)| c.take_logoff().then_some(*id))
            .collect();
        for conn_id in logged_off {
            self.timers.cancel(&TimerKey::ClientIdle(conn_id));
            self.detach_client(conn_id);
            self.emit(ServerEvent::ClientLoggedOff { conn_id });
        }
    }

    fn publish_status(&self) {
        self.status.store(Arc::new(ServerStatus {
            sessions: self.sessions.len(),
            users: self.user_count,
            clients: self.clients.len(),
        }));
    }

    /// Periodic housekeeping: expire idle sessions, drop empty ones, reap
    pub fn cleanup(&mut self) {
        let idle_limit = self.config.idle_time_limit;
        for session in self.sessions.values_mut() {
            if session.state() == SessionState::Shutdown {
                continue;
            }
            if !idle_limit.is_zero() && session.last_event_time() > idle_limit {
                session.log(
                    Log::new()
                        .about(Level::Info, Topic::Status)
                        .message("Idle session expired"),
                );
                session.kill_session(&mut self.clients, true, true);
            } else if session.user_count() == 0
                && !session.is_persistent()
                && session.state() == SessionState::Running
            {
                session.kill_session(&mut self.clients, false, true);
            }
        }
        self.reap();
    }

    /// Delete sessions that have been shut down
    fn reap(&mut self) {
        let ended: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Shutdown)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ended {
            let Some(mut session) = self.sessions.remove(&id) else {
                continue;
            };
            if let Some(announcements) = &mut self.announcements {
                announcements.unlist(Some(id.as_str()), None, true);
            }
            let terminate = session.should_terminate();
            let result = if terminate {
                session.history_mut().terminate()
            } else {
                session.history_mut().close()
            };
            if let Err(e) = result {
                warn!(
                    component = "session_server",
                    event = "session.close_failed",
                    session_id = %id,
                    error = %e,
                    "Could not close session history"
                );
            }
            info!(
                component = "session_server",
                event = "session.ended",
                session_id = %id,
                terminate,
                "Session ended"
            );
            self.emit(ServerEvent::SessionEnded { id });
        }
    }

    /// Disconnect every client, then stop every session keeping its files
    pub fn stop_all(&mut self) {
        info!(
            component = "session_server",
            event = "session_server.stop_all",
            sessions = self.sessions.len(),
            clients = self.clients.len(),
            "Stopping all sessions"
        );
        for client in self.clients.values_mut() {
            client.disconnect(DisconnectReason::Shutdown, "Server shutting down");
        }
        for session in self.sessions.values_mut() {
            session.kill_session(&mut self.clients, false, false);
        }
        self.reap();
    }

    fn listing_request(&mut self, session_id: &str, request: ListingRequest) {
        match request {
            ListingRequest::Announce {
                url,
                private,
                requested_by,
            } => {
                if !self.announce_session(session_id, &url, private) {
                    if let Some(client) = self.clients.get(&requested_by) {
                        client.send_error("rejected", format!("Cannot list session at {url}"));
                    }
                    return;
                }
                let Some(session) = self.sessions.get_mut(session_id) else {
                    return;
                };
                if let Err(e) = session.history_mut().add_announcement(&url, private) {
                    session.storage_failed(&mut self.clients, &e);
                }
            }
            ListingRequest::Unlist { url } => {
                if let Some(announcements) = &mut self.announcements {
                    announcements.unlist(Some(session_id), Some(url.as_str()), true);
                }
                let Some(session) = self.sessions.get_mut(session_id) else {
                    return;
                };
                if let Err(e) = session.history_mut().remove_announcement(&url) {
                    session.storage_failed(&mut self.clients, &e);
                }
            }
        }
    }

    /// Start listing a session at `url`. False if listing there is refused.
    fn announce_session(&mut self, session_id: &str, url: &str, private: bool) -> bool {
        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };
        let Some(announcements) = &mut self.announcements else {
            session.log(
                Log::new()
                    .about(Level::Warn, Topic::PubList)
                    .message("Session listing is not enabled on this server"),
            );
            return false;
        };
        let description = SessionAnnouncement::describe(
            session,
            &self.clients,
            &self.config.public_host,
            self.config.public_port,
            private,
        );
        announcements.announce(url, description)
    }

    fn listing_finished(&mut self, outcome: ListingOutcome) {
        let Some(announcements) = &mut self.announcements else {
            return;
        };
        for notice in announcements.finish(outcome) {
            if let Some(session) = self.sessions.get(&notice.session_id) {
                session.message_all(&self.clients, &notice.message, notice.alert);
            }
        }
    }

    fn refresh_listings(&mut self) {
        let Some(announcements) = &mut self.announcements else {
            return;
        };
        let (sessions, clients, config) = (&self.sessions, &self.clients, &self.config);
        announcements.refresh_due(|id, private| {
            sessions
                .get(id)
                .filter(|s| s.state() != SessionState::Shutdown)
                .map(|s| {
                    SessionAnnouncement::describe(
                        s,
                        clients,
                        &config.public_host,
                        config.public_port,
                        private,
                    )
                })
        });
    }

    /// Find a live session's id by its id or alias
    fn find_session_id(&self, id_or_alias: &str) -> Option<String> {
        if self.sessions.contains_key(id_or_alias) {
            return Some(id_or_alias.to_string());
        }
        self.sessions
            .values()
            .find(|s| s.matches(id_or_alias))
            .map(|s| s.id().to_string())
    }

    /// Look up a session. With `load`, a matching template is instantiated.
    pub fn get_session_by_id(&mut self, id: &str, load: bool) -> Option<&mut Session> {
        match self.find_session_id(id) {
            Some(id) => self.sessions.get_mut(&id),
            None if load => self.create_from_template(id),
            None => None,
        }
    }

    pub fn create_session(
        &mut self,
        id: &str,
        alias: Option<&str>,
        version: &ProtocolVersion,
        founder: &str,
    ) -> Result<&mut Session, CreateSessionError> {
        let shadowed = |name: &str| {
            self.templates
                .as_ref()
                .is_some_and(|t| t.exists(name))
        };
        if shadowed(id) || alias.is_some_and(shadowed) {
            return Err(CreateSessionError::IdInUse);
        }
        self.start_session(id, alias, version, founder)
    }

    fn start_session(
        &mut self,
        id: &str,
        alias: Option<&str>,
        version: &ProtocolVersion,
        founder: &str,
    ) -> Result<&mut Session, CreateSessionError> {
        let history = self.new_history(id, alias, version, founder)?;
        self.insert_session(history)
            .map_err(|_| CreateSessionError::InternalError)
    }

    /// Check the server's limits and create an empty history for a new session
    fn new_history(
        &self,
        id: &str,
        alias: Option<&str>,
        version: &ProtocolVersion,
        founder: &str,
    ) -> Result<Box<dyn SessionHistory>, CreateSessionError> {
        if self.sessions.len() >= self.config.session_count_limit {
            return Err(CreateSessionError::Closed);
        }
        let taken = |name: &str| self.find_session_id(name).is_some();
        if taken(id) || alias.is_some_and(taken) {
            return Err(CreateSessionError::IdInUse);
        }
        if !version.is_current() {
            return Err(CreateSessionError::BadProtocol);
        }

        let alias = alias.map(str::to_string);
        let history: Box<dyn SessionHistory> = match &self.session_dir {
            Some(dir) => {
                match FiledHistory::start_new(dir, id, alias, version.clone(), founder) {
                    Ok(h) => Box::new(h),
                    Err(e) => {
                        warn!(
                            component = "session_server",
                            event = "session.create_failed",
                            session_id = %id,
                            error = %e,
                            "Could not create session history"
                        );
                        return Err(CreateSessionError::InternalError);
                    }
                }
            }
            None => Box::new(InMemoryHistory::new(id, alias, version.clone(), founder)),
        };
        Ok(history)
    }

    /// Size limit, archive mode and autoreset threshold
    fn apply_server_settings(&self, history: &mut dyn SessionHistory) -> Result<(), HistoryError> {
        history.set_size_limit(self.config.history_limit);
        history.set_archive(self.config.archive_mode);
        if self.config.autoreset_threshold > 0 && history.autoreset_threshold() == 0 {
            history.set_autoreset_threshold(self.config.autoreset_threshold)?;
        }
        Ok(())
    }

    /// Apply server-wide settings and register the session
    fn insert_session(
        &mut self,
        mut history: Box<dyn SessionHistory>,
    ) -> Result<&mut Session, HistoryError> {
        self.apply_server_settings(history.as_mut())?;
        Ok(self.register_session(history))
    }

    /// Make a ready history live and tell observers about it
    fn register_session(&mut self, history: Box<dyn SessionHistory>) -> &mut Session {
        let session = Session::new(history, self.log.clone());
        let id = session.id().to_string();
        info!(
            component = "session_server",
            event = "session.created",
            session_id = %id,
            alias = session.alias().unwrap_or_default(),
            "Session created"
        );
        session.log(
            Log::new()
                .about(Level::Info, Topic::Status)
                .message("Session started"),
        );
        self.emit(ServerEvent::SessionCreated(
            session.description(&self.clients, false),
        ));
        self.sessions.entry(id).or_insert(session)
    }

    /// Instantiate a template under a fresh id. The session only becomes
    /// visible once the template content is in place.
    pub fn create_from_template(&mut self, alias: &str) -> Option<&mut Session> {
        let (version, founder) = self.templates.as_ref()?.header(alias)?;
        let id = new_id();
        let mut history = match self.new_history(&id, Some(alias), &version, &founder) {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    component = "session_server",
                    event = "template.instantiate_failed",
                    alias,
                    error = %e,
                    "Could not create session from template"
                );
                return None;
            }
        };

        let initialized = match self.apply_server_settings(history.as_mut()) {
            Ok(()) => self
                .templates
                .as_ref()?
                .init(alias, history.as_mut())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = initialized {
            warn!(
                component = "session_server",
                event = "template.init_failed",
                alias,
                error = %e,
                "Could not initialize session from template"
            );
            if let Err(e) = history.terminate() {
                warn!(
                    component = "session_server",
                    event = "session.close_failed",
                    session_id = %id,
                    error = %e,
                    "Could not remove history of failed template session"
                );
            }
            return None;
        }
        Some(self.register_session(history))
    }

    /// Load sessions from the session directory that are not live yet
    pub fn load_new_sessions(&mut self) {
        let Some(dir) = self.session_dir.clone() else {
            return;
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    component = "session_server",
                    event = "session.scan_failed",
                    dir = %dir.display(),
                    error = %e,
                    "Could not read session directory"
                );
                return;
            }
        };

        for path in entries.flatten().map(|e| e.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("session") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.sessions.contains_key(id) {
                continue;
            }
            if let Err(e) = OpenOptions::new().read(true).write(true).open(&path) {
                warn!(
                    component = "session_server",
                    event = "session.unreadable",
                    path = %path.display(),
                    error = %e,
                    "Skipping session file that is not readable and writable"
                );
                continue;
            }

            let loaded = FiledHistory::load(&path).and_then(|h| {
                self.insert_session(Box::new(h))
                    .map(|s| (s.id().to_string(), s.history().announcements().to_vec()))
            });
            match loaded {
                Ok((id, listings)) => {
                    for listing in listings {
                        self.announce_session(&id, &listing.url, listing.private);
                    }
                }
                Err(e) => warn!(
                    component = "session_server",
                    event = "session.load_failed",
                    path = %path.display(),
                    error = %e,
                    "Could not load session"
                ),
            }
        }
    }

    /// Live sessions plus templates not shadowed by a live alias
    pub fn session_descriptions(&self) -> Vec<Value> {
        let mut list: Vec<Value> = self
            .sessions
            .values()
            .filter(|s| s.state() != SessionState::Shutdown)
            .map(|s| s.description(&self.clients, false))
            .collect();
        if let Some(templates) = &self.templates {
            list.extend(templates.descriptions().into_iter().filter(|t| {
                t["alias"]
                    .as_str()
                    .map_or(true, |alias| self.find_session_id(alias).is_none())
            }));
        }
        list
    }

    pub fn message_all(&self, text: &str, alert: bool) {
        for session in self.sessions.values() {
            session.message_all(&self.clients, text, alert);
        }
    }

    pub fn call_json_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &Value,
    ) -> JsonApiResult {
        match pop_path(path) {
            (Some("sessions"), rest) => self.call_sessions_api(method, rest, request),
            (Some("users"), rest) => self.call_users_api(method, rest, request),
            _ => JsonApiResult::not_found(),
        }
    }

    fn call_sessions_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &Value,
    ) -> JsonApiResult {
        if let (Some(id), rest) = pop_path(path) {
            let Some(id) = self.find_session_id(id) else {
                return JsonApiResult::not_found();
            };
            let Some(session) = self.sessions.get_mut(&id) else {
                return JsonApiResult::not_found();
            };
            let mut result = session.call_json_api(&mut self.clients, method, rest, request);
            if rest.is_empty() && method != JsonApiMethod::Delete && result.is_ok() {
                result.body["listings"] = json!(self
                    .announcements
                    .as_ref()
                    .map(|a| a.listings_json(&id))
                    .unwrap_or_default());
            }
            return result;
        }

        match method {
            JsonApiMethod::Get => JsonApiResult::ok(json!(self.session_descriptions())),
            JsonApiMethod::Update => {
                if let Some(message) = str_field(request, "message") {
                    self.message_all(message, false);
                }
                if let Some(alert) = str_field(request, "alert") {
                    self.message_all(alert, true);
                }
                JsonApiResult::ok(json!(self.session_descriptions()))
            }
            JsonApiMethod::Delete => JsonApiResult::bad_method(),
        }
    }

    fn call_users_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &Value,
    ) -> JsonApiResult {
        if let (Some(id), rest) = pop_path(path) {
            let Some(conn_id) = id
                .parse::<ConnId>()
                .ok()
                .filter(|id| self.clients.contains_key(id))
            else {
                return JsonApiResult::not_found();
            };
            let session_id = self.clients[&conn_id].session_id().map(str::to_string);
            if let Some(session) = session_id.and_then(|id| self.sessions.get_mut(&id)) {
                return session.call_user_api(&mut self.clients, conn_id, method, rest, request);
            }
            return match self.clients.get_mut(&conn_id) {
                Some(client) => client.call_json_api(method, rest, request),
                None => JsonApiResult::not_found(),
            };
        }

        match method {
            JsonApiMethod::Get => {
                let mut users: Vec<(ConnId, Value)> = self
                    .clients
                    .iter()
                    .map(|(id, c)| {
                        let mut desc = c.description(true);
                        desc["connectionId"] = json!(id);
                        (*id, desc)
                    })
                    .collect();
                users.sort_by_key(|(id, _)| *id);
                JsonApiResult::ok(Value::Array(users.into_iter().map(|(_, d)| d).collect()))
            }
            _ => JsonApiResult::bad_method(),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
