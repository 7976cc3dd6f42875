//! Scribble Server
//!
//! Hosts shared drawing sessions: clients log in, host or join a session and
//! every accepted drawing command is relayed to all participants.

mod acl;
mod admin_http;
mod announcements;
mod client;
mod config;
mod connection;
mod db_log;
mod history;
mod id_queue;
mod json_api;
mod logging;
mod login;
mod password;
mod paths;
mod server_log;
mod session;
mod session_server;
mod templates;
mod timers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admin_http::AdminState;
use crate::announcements::HttpListingApi;
use crate::config::Cli;
use crate::db_log::DbLog;
use crate::server_log::{InMemoryLog, ServerLog};
use crate::session_server::{ServerHandle, SessionServer};
use crate::templates::TemplateFiles;

/// How long open connections get to flush their disconnect notice
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs().context("create data directory")?;
    let log_dir = cli.log_file.then(paths::log_dir);
    let logging = logging::init_logging(log_dir.as_deref())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %paths::data_dir().display(),
        "Starting Scribble server"
    );

    let server_log = Arc::new(open_server_log(&cli)?);
    let mut server = SessionServer::new(cli.server_config(), server_log.clone());

    let listing_api = HttpListingApi::new().context("create listing server client")?;
    server.set_listing_api(Arc::new(listing_api));

    let template_dir = cli
        .template_dir
        .clone()
        .or_else(|| Some(paths::templates_dir()).filter(|d| d.is_dir()));
    if let Some(dir) = template_dir {
        let templates = TemplateFiles::load(&dir)
            .with_context(|| format!("load templates from {}", dir.display()))?;
        server.set_templates(Box::new(templates));
    }

    if let Some(dir) = &cli.session_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create session directory {}", dir.display()))?;
        server.set_session_dir(dir.clone());
        server.load_new_sessions();
    }

    let tls = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => Some(connection::load_tls(cert, key)?),
        _ => None,
    };

    let (handle, server_task) = ServerHandle::spawn(server);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind {}", cli.listen))?;
    let stop_accepting = CancellationToken::new();
    let listener_task = tokio::spawn(connection::serve(
        listener,
        handle.clone(),
        tls,
        stop_accepting.clone(),
        CONNECTION_DRAIN_TIMEOUT,
    ));

    if let Some(addr) = cli.admin_listen {
        let state = AdminState {
            server: handle.clone(),
            log: server_log.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = admin_http::serve(addr, state).await {
                error!(
                    component = "admin_http",
                    event = "admin_http.failed",
                    error = %e,
                    "Admin API stopped"
                );
            }
        });
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Could not listen for shutdown signal"
        );
    }

    info!(
        component = "server",
        event = "server.stopping",
        "Shutting down"
    );
    handle.shutdown().await;
    stop_accepting.cancel();
    if let Err(e) = listener_task.await {
        error!(
            component = "server",
            event = "server.listener_failed",
            error = %e,
            "Listener ended abnormally"
        );
    }
    if let Err(e) = server_task.await {
        error!(
            component = "server",
            event = "server.actor_failed",
            error = %e,
            "Server actor ended abnormally"
        );
    }

    Ok(())
}

fn open_server_log(cli: &Cli) -> anyhow::Result<ServerLog> {
    if !cli.db_log {
        return Ok(ServerLog::new(InMemoryLog::with_limit(cli.log_limit)));
    }
    let path = paths::log_db_path();
    let db = DbLog::open(&path).with_context(|| format!("open log database {}", path.display()))?;
    db.purge_logs(cli.log_purge_days)
        .context("purge old log entries")?;
    Ok(ServerLog::new(db))
}
