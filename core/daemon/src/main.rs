//! posture-daemon entrypoint.
//!
//! A small HTTP service that classifies webcam frames, keeps per-user
//! good/bad posture totals in memory, and periodically merges them into
//! per-day documents in a local SQLite document store.

use clap::Parser;
use std::env;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use posture_daemon_protocol::{
    normalize_user_id, ReportsResponse, ANALYZE_PATH, HEALTH_PATH, REPORTS_PATH,
    SESSION_SUMMARY_PATH, USER_ID_HEADER,
};

mod aggregator;
mod alarm;
mod clock;
mod config;
mod detector;
mod error;
mod http;
mod logging;
mod state;
mod store;

use clock::SystemClock;
use config::{DaemonConfig, CONFIG_PATH_ENV};
use detector::Detector;
use http::{HttpRequest, HttpResponse};
use state::SharedState;
use store::SqliteStore;

#[derive(Parser)]
#[command(name = "posture-daemon")]
#[command(about = "Posture tracking daemon")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file (defaults to ~/.posture/daemon.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:5000
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Path to the SQLite document store
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
    let loaded = config::load_config(config_path.as_deref());
    let log_dir = loaded
        .as_ref()
        .ok()
        .and_then(|config| config.logging.log_dir.clone());
    let _logging_guard = logging::init(log_dir.as_deref());

    let mut config = match loaded {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load daemon config");
            std::process::exit(1);
        }
    };
    config.apply_env(|key| env::var(key).ok());
    apply_cli(&mut config, &cli);

    let db_path = match config.resolved_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve document store path");
            std::process::exit(1);
        }
    };

    let store = match SqliteStore::new(db_path.clone()) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "Failed to initialize document store");
            std::process::exit(1);
        }
    };

    let shared_state = match SharedState::new(
        &config,
        Detector::from_config(&config.detector),
        Arc::new(store),
        Arc::new(SystemClock),
    ) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "Invalid daemon config");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.server.bind_addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %config.server.bind_addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(
        addr = %config.server.bind_addr,
        db = %db_path.display(),
        alarm_threshold_secs = config.tracking.alarm_threshold_secs,
        flush_interval_secs = config.tracking.flush_interval_secs,
        "Posture daemon started"
    );

    let read_timeout = Duration::from_secs(config.server.read_timeout_secs.max(1));
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(move || handle_connection(stream, state, read_timeout));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
            }
        }
    }
}

fn apply_cli(config: &mut DaemonConfig, cli: &Cli) {
    if let Some(bind) = &cli.bind {
        config.server.bind_addr = bind.clone();
    }
    if let Some(db) = &cli.db {
        config.store.db_path = Some(db.clone());
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<SharedState>, read_timeout: Duration) {
    let _ = stream.set_read_timeout(Some(read_timeout));

    let response = match http::read_request(&mut stream) {
        Ok(request) => {
            let response = handle_request(&request, &state);
            tracing::debug!(
                method = %request.method,
                path = %request.path,
                status = response.status,
                "Request handled"
            );
            response
        }
        Err(err) => {
            warn!(error = %err, "Failed to read request");
            HttpResponse::error(err.status_code(), err.to_string())
        }
    };

    if let Err(err) = response.write_to(&mut stream) {
        warn!(error = %err, "Failed to write response");
    }
}

fn handle_request(request: &HttpRequest, state: &SharedState) -> HttpResponse {
    if request.method == "OPTIONS" {
        return HttpResponse::no_content();
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", ANALYZE_PATH) => handle_analyze(request, state),
        ("GET", SESSION_SUMMARY_PATH) => handle_session_summary(request, state),
        ("GET", REPORTS_PATH) => handle_reports(request, state),
        ("GET", HEALTH_PATH) => HttpResponse::json(200, &state.health_snapshot()),
        (_, ANALYZE_PATH | SESSION_SUMMARY_PATH | REPORTS_PATH | HEALTH_PATH) => {
            HttpResponse::error(405, "Method not allowed")
        }
        _ => HttpResponse::error(404, "Not found"),
    }
}

fn request_user_id(request: &HttpRequest) -> Option<String> {
    normalize_user_id(request.header(USER_ID_HEADER))
}

fn handle_analyze(request: &HttpRequest, state: &SharedState) -> HttpResponse {
    let user_id = request_user_id(request);
    match state.analyze(user_id.as_deref(), &request.body) {
        Ok(analysis) => {
            tracing::debug!(
                user_id = ?user_id,
                status = %analysis.status,
                alarm = analysis.response.alarm,
                "Frame analyzed"
            );
            HttpResponse::json(200, &analysis.response)
        }
        Err(err) => {
            warn!(error = %err, user_id = ?user_id, "Frame analysis failed");
            HttpResponse::error(500, err.to_string())
        }
    }
}

fn handle_session_summary(request: &HttpRequest, state: &SharedState) -> HttpResponse {
    match request_user_id(request) {
        Some(user_id) => HttpResponse::json(200, &state.summary(&user_id)),
        None => HttpResponse::error(400, "Missing User-ID"),
    }
}

fn handle_reports(request: &HttpRequest, state: &SharedState) -> HttpResponse {
    let Some(user_id) = request_user_id(request) else {
        return HttpResponse::error(400, "Missing User-ID");
    };
    match state.daily_reports(&user_id) {
        Ok(reports) => HttpResponse::json(200, &ReportsResponse { reports }),
        Err(err) => {
            warn!(error = %err, user_id = %user_id, "Failed to load daily reports");
            HttpResponse::error(500, err.to_string())
        }
    }
}
