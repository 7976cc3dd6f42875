//! Public session listings.
//!
//! Operators can ask for their session to be listed at a listing server.
//! HTTP calls run on spawned tasks; their results come back to the server
//! actor as [`ListingOutcome`]s, so listing state is only touched by the
//! actor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{ClientMap, ConnId};
use crate::server_log::{Level, Log, ServerLog, Topic};
use crate::session::Session;

/// How often listings are checked for a due refresh
pub const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A listing change asked for by a session operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingRequest {
    Announce {
        url: String,
        private: bool,
        requested_by: ConnId,
    },
    Unlist {
        url: String,
    },
}

/// What a listing server is told about a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionAnnouncement {
    pub host: String,
    pub port: u16,
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alias: String,
    pub protocol: String,
    pub title: String,
    pub users: usize,
    pub usernames: Vec<String>,
    pub password: bool,
    pub nsfm: bool,
    pub owner: String,
    pub started: String,
    pub private: bool,
}

impl SessionAnnouncement {
    pub fn describe(
        session: &Session,
        clients: &ClientMap,
        host: &str,
        port: u16,
        private: bool,
    ) -> Self {
        let history = session.history();
        Self {
            host: host.to_string(),
            port,
            id: history.id().to_string(),
            alias: history.alias().unwrap_or_default().to_string(),
            protocol: history.protocol_version().to_string(),
            title: history.title().to_string(),
            users: session.user_count(),
            usernames: session
                .users()
                .iter()
                .filter_map(|id| clients.get(id))
                .map(|c| c.username().to_string())
                .collect(),
            password: history.has_password(),
            nsfm: history.flags().nsfm,
            owner: history.founder().to_string(),
            started: history
                .started_at()
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            private,
        }
    }
}

/// A listing server's answer to an announcement
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnnounceResponse {
    pub id: u64,
    /// Secret needed to refresh or remove the listing
    pub key: String,
    /// Refresh interval in minutes
    #[serde(default = "default_expires")]
    pub expires: u64,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_expires() -> u64 {
    6
}

/// One entry of a bulk refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshRequest {
    pub id: u64,
    pub updatekey: String,
    #[serde(flatten)]
    pub session: SessionAnnouncement,
}

/// Listing server HTTP API
#[async_trait]
pub trait ListingApi: Send + Sync {
    async fn announce(
        &self,
        url: &str,
        session: &SessionAnnouncement,
    ) -> anyhow::Result<AnnounceResponse>;

    /// Refresh several listings at once. Returns a result per listing id,
    /// `"ok"` for success.
    async fn refresh(
        &self,
        url: &str,
        listings: &[RefreshRequest],
    ) -> anyhow::Result<HashMap<String, String>>;

    async fn unlist(&self, url: &str, listing_id: u64, key: &str) -> anyhow::Result<()>;
}

pub struct HttpListingApi {
    client: reqwest::Client,
}

impl HttpListingApi {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("scribble/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn endpoint(url: &str, path: &str) -> String {
    format!("{}/{}", url.trim_end_matches('/'), path)
}

async fn error_for_status(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["message"].as_str().map(str::to_string))
            .unwrap_or(text);
        anyhow::bail!("listing server error {status}: {message}");
    }
    Ok(resp)
}

#[async_trait]
impl ListingApi for HttpListingApi {
    async fn announce(
        &self,
        url: &str,
        session: &SessionAnnouncement,
    ) -> anyhow::Result<AnnounceResponse> {
        let resp = self
            .client
            .post(endpoint(url, "sessions/"))
            .json(session)
            .send()
            .await?;
        Ok(error_for_status(resp).await?.json().await?)
    }

    async fn refresh(
        &self,
        url: &str,
        listings: &[RefreshRequest],
    ) -> anyhow::Result<HashMap<String, String>> {
        #[derive(Deserialize)]
        struct BulkResponse {
            responses: HashMap<String, String>,
        }
        let resp = self
            .client
            .put(endpoint(url, "sessions/"))
            .json(listings)
            .send()
            .await?;
        let body: BulkResponse = error_for_status(resp).await?.json().await?;
        Ok(body.responses)
    }

    async fn unlist(&self, url: &str, listing_id: u64, key: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(endpoint(url, &format!("sessions/{listing_id}")))
            .header("X-Update-Key", key)
            .send()
            .await?;
        error_for_status(resp).await?;
        Ok(())
    }
}

/// Result of a listing call, delivered back to the server actor
#[derive(Debug)]
pub enum ListingOutcome {
    Announced {
        session_id: String,
        url: String,
        result: Result<AnnounceResponse, String>,
    },
    Refreshed {
        url: String,
        result: Result<HashMap<String, String>, String>,
    },
}

/// Text for a session's users produced by a listing result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingNotice {
    pub session_id: String,
    pub message: String,
    pub alert: bool,
}

#[derive(Debug)]
enum ListingState {
    /// Announcement sent, no answer yet
    Pending,
    Listed {
        id: u64,
        key: String,
        private: bool,
        refresh_every: Duration,
        refreshed_at: Instant,
    },
}

#[derive(Debug)]
struct Listing {
    session_id: String,
    url: String,
    state: ListingState,
}

pub struct Announcements {
    api: Arc<dyn ListingApi>,
    allowed: Vec<String>,
    listings: Vec<Listing>,
    results: mpsc::UnboundedSender<ListingOutcome>,
    log: Arc<ServerLog>,
}

impl Announcements {
    pub fn new(
        api: Arc<dyn ListingApi>,
        allowed: Vec<String>,
        results: mpsc::UnboundedSender<ListingOutcome>,
        log: Arc<ServerLog>,
    ) -> Self {
        Self {
            api,
            allowed,
            listings: Vec::new(),
            results,
            log,
        }
    }

    pub fn set_api(&mut self, api: Arc<dyn ListingApi>) {
        self.api = api;
    }

    /// Whether sessions may be announced at `url`
    pub fn is_allowed(&self, url: &str) -> bool {
        let scheme_ok = url.starts_with("http://") || url.starts_with("https://");
        scheme_ok && (self.allowed.is_empty() || self.allowed.iter().any(|a| url.starts_with(a)))
    }

    fn find(&self, session_id: &str, url: &str) -> Option<usize> {
        self.listings
            .iter()
            .position(|l| l.session_id == session_id && l.url == url)
    }

    /// Start announcing a session. Returns false if the URL is not allowed.
    pub fn announce(&mut self, url: &str, session: SessionAnnouncement) -> bool {
        if !self.is_allowed(url) {
            self.log.log_message(
                Log::new()
                    .about(Level::Warn, Topic::PubList)
                    .message(format!("Announcement API URL not allowed: {url}")),
            );
            return false;
        }
        if self.find(&session.id, url).is_some() {
            return true;
        }

        self.listings.push(Listing {
            session_id: session.id.clone(),
            url: url.to_string(),
            state: ListingState::Pending,
        });
        self.log.log_message(
            Log::new()
                .about(Level::Info, Topic::PubList)
                .session(session.id.clone())
                .message(format!("Announcing session at {url}")),
        );

        let api = self.api.clone();
        let results = self.results.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = api.announce(&url, &session).await.map_err(|e| e.to_string());
            let _ = results.send(ListingOutcome::Announced {
                session_id: session.id,
                url,
                result,
            });
        });
        true
    }

    /// Apply a finished call. Returns messages for the affected sessions.
    pub fn finish(&mut self, outcome: ListingOutcome) -> Vec<ListingNotice> {
        match outcome {
            ListingOutcome::Announced {
                session_id,
                url,
                result,
            } => self.announced(session_id, url, result),
            ListingOutcome::Refreshed { url, result } => {
                self.refreshed(&url, result);
                Vec::new()
            }
        }
    }

    fn announced(
        &mut self,
        session_id: String,
        url: String,
        result: Result<AnnounceResponse, String>,
    ) -> Vec<ListingNotice> {
        // The session may have ended meanwhile
        let Some(index) = self.find(&session_id, &url) else {
            return Vec::new();
        };
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                self.log.log_message(
                    Log::new()
                        .about(Level::Warn, Topic::PubList)
                        .session(session_id.clone())
                        .message(format!("{url}: announcement failed: {error}")),
                );
                self.listings.remove(index);
                return vec![ListingNotice {
                    session_id,
                    message: format!("Could not list session at {url}: {error}"),
                    alert: true,
                }];
            }
        };

        let mut notices = Vec::new();
        if let Some(message) = response.message.filter(|m| !m.is_empty()) {
            self.log.log_message(
                Log::new()
                    .about(Level::Info, Topic::PubList)
                    .session(session_id.clone())
                    .message(message.clone()),
            );
            notices.push(ListingNotice {
                session_id: session_id.clone(),
                message,
                alert: false,
            });
        }
        self.listings[index].state = ListingState::Listed {
            id: response.id,
            key: response.key,
            private: response.private,
            refresh_every: Duration::from_secs(response.expires.max(1) * 60),
            refreshed_at: Instant::now(),
        };
        self.log.log_message(
            Log::new()
                .about(Level::Info, Topic::PubList)
                .session(session_id)
                .message(format!("Announced at {url}")),
        );
        notices
    }

    fn refreshed(&mut self, url: &str, result: Result<HashMap<String, String>, String>) {
        let results = match result {
            Ok(results) => results,
            Err(error) => {
                self.log.log_message(
                    Log::new()
                        .about(Level::Warn, Topic::PubList)
                        .message(format!("{url}: bulk refresh error: {error}")),
                );
                self.unlist(None, Some(url), false);
                return;
            }
        };

        let failed: Vec<(String, String)> = self
            .listings
            .iter()
            .filter(|l| l.url == url)
            .filter_map(|l| match &l.state {
                ListingState::Listed { id, .. } => {
                    let status = results.get(&id.to_string())?;
                    (status != "ok").then(|| (l.session_id.clone(), status.clone()))
                }
                ListingState::Pending => None,
            })
            .collect();
        for (session_id, status) in failed {
            self.log.log_message(
                Log::new()
                    .about(Level::Warn, Topic::PubList)
                    .session(session_id.clone())
                    .message(format!("{url}: {status}")),
            );
            self.unlist(Some(session_id.as_str()), Some(url), false);
        }
    }

    /// Refresh listings whose interval has elapsed, one bulk request per
    /// listing server. Every listing at a server with a due listing is
    /// refreshed along with it.
    pub fn refresh_due(
        &mut self,
        describe: impl Fn(&str, bool) -> Option<SessionAnnouncement>,
    ) {
        let now = Instant::now();
        let mut due_urls: Vec<String> = Vec::new();
        for listing in &self.listings {
            if let ListingState::Listed {
                refresh_every,
                refreshed_at,
                ..
            } = &listing.state
            {
                if now.duration_since(*refreshed_at) >= *refresh_every
                    && !due_urls.contains(&listing.url)
                {
                    due_urls.push(listing.url.clone());
                }
            }
        }

        for url in due_urls {
            let mut requests = Vec::new();
            for listing in self.listings.iter_mut().filter(|l| l.url == url) {
                let ListingState::Listed {
                    id,
                    key,
                    private,
                    refreshed_at,
                    ..
                } = &mut listing.state
                else {
                    continue;
                };
                let Some(session) = describe(&listing.session_id, *private) else {
                    continue;
                };
                *refreshed_at = now;
                requests.push(RefreshRequest {
                    id: *id,
                    updatekey: key.clone(),
                    session,
                });
            }
            if requests.is_empty() {
                continue;
            }

            self.log.log_message(
                Log::new()
                    .about(Level::Info, Topic::PubList)
                    .message(format!("Refreshing {} announcements at {url}", requests.len())),
            );
            let api = self.api.clone();
            let results = self.results.clone();
            tokio::spawn(async move {
                let result = api.refresh(&url, &requests).await.map_err(|e| e.to_string());
                let _ = results.send(ListingOutcome::Refreshed { url, result });
            });
        }
    }

    /// Forget listings of `session_id` (any session when `None`) at `url`
    /// (any server when `None`). With `delist`, confirmed listings are also
    /// removed from their listing server.
    pub fn unlist(&mut self, session_id: Option<&str>, url: Option<&str>, delist: bool) {
        let (removed, kept): (Vec<Listing>, Vec<Listing>) =
            self.listings.drain(..).partition(|l| {
                session_id.map_or(true, |s| l.session_id == s) && url.map_or(true, |u| l.url == u)
            });
        self.listings = kept;

        for listing in removed {
            self.log.log_message(
                Log::new()
                    .about(Level::Info, Topic::PubList)
                    .session(listing.session_id.clone())
                    .message(format!("Unlisting from {}", listing.url)),
            );
            let ListingState::Listed { id, key, .. } = listing.state else {
                continue;
            };
            if !delist {
                continue;
            }
            let api = self.api.clone();
            let url = listing.url;
            tokio::spawn(async move {
                if let Err(e) = api.unlist(&url, id, &key).await {
                    debug!(
                        component = "announcements",
                        event = "listing.unlist_failed",
                        url = %url,
                        listing_id = id,
                        error = %e,
                        "Could not remove listing"
                    );
                }
            });
        }
    }

    /// Confirmed listings of a session
    pub fn listings_json(&self, session_id: &str) -> Vec<Value> {
        self.listings
            .iter()
            .filter(|l| l.session_id == session_id)
            .filter_map(|l| match &l.state {
                ListingState::Listed { id, private, .. } => Some(json!({
                    "url": l.url,
                    "id": id,
                    "private": private,
                })),
                ListingState::Pending => None,
            })
            .collect()
    }
}
