mod logging;

use std::{env, time::Duration};

use backend_core::{BackendCommand, BackendEvent};
use backend_rest::ClientConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

const DEFAULT_LISTEN_SECS: u64 = 30;

/// What the smoke run does after startup, read from `CHAT_SMOKE_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SmokePlan {
    login: Option<(String, String)>,
    listen: Duration,
}

impl SmokePlan {
    fn from_lookup<F>(mut lookup: F) -> Result<Self, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let login = match (value("CHAT_SMOKE_EMAIL"), value("CHAT_SMOKE_PASSWORD")) {
            (Some(email), Some(password)) => Some((email, password)),
            (None, None) => None,
            _ => return Err("set both CHAT_SMOKE_EMAIL and CHAT_SMOKE_PASSWORD".to_owned()),
        };
        let listen_secs = match value("CHAT_SMOKE_LISTEN_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|err| format!("invalid CHAT_SMOKE_LISTEN_SECS='{raw}': {err}"))?,
            None => DEFAULT_LISTEN_SECS,
        };
        Ok(Self {
            login,
            listen: Duration::from_secs(listen_secs),
        })
    }
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            eprintln!("Required: CHAT_API_BASE_URL (e.g. http://localhost:5000/api)");
            std::process::exit(2);
        }
    };
    let plan = match SmokePlan::from_lookup(|key| env::var(key).ok()) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let store = backend_rest::credential_store(&config);
    let handle = match backend_rest::start(&config, store) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to start backend: {err}");
            std::process::exit(1);
        }
    };
    let mut events = handle.subscribe();

    let command = match plan.login.clone() {
        Some((email, password)) => BackendCommand::Login { email, password },
        None => BackendCommand::RestoreSession,
    };
    info!(command = command.kind(), api = %config.api_base_url, "starting smoke run");
    if let Err(err) = handle.send(command).await {
        error!(error = %err, "runtime rejected the first command");
        std::process::exit(1);
    }

    let deadline = tokio::time::sleep(plan.listen);
    tokio::pin!(deadline);
    let mut exit_code = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(code) = report(&event) {
                        exit_code = code;
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    std::process::exit(exit_code);
}

/// Log one event. Returns an exit code when the run should stop.
fn report(event: &BackendEvent) -> Option<i32> {
    match event {
        BackendEvent::AuthResult {
            success: false,
            error_code,
        } => {
            error!(code = error_code.as_deref().unwrap_or("unknown"), "authentication failed");
            Some(1)
        }
        BackendEvent::SessionExpired => {
            error!("session expired");
            Some(1)
        }
        BackendEvent::ConversationsUpdated { active, archived } => {
            info!(active = active.len(), archived = archived.len(), "conversations updated");
            for summary in active.iter().take(5) {
                info!(
                    conversation_id = %summary.id,
                    name = %summary.display_name,
                    unread = summary.unread_count,
                    "conversation"
                );
            }
            None
        }
        BackendEvent::Error {
            code,
            message,
            recoverable,
        } => {
            warn!(%code, %message, recoverable, "backend error");
            None
        }
        other => {
            info!(event = other.kind(), ?other, "backend event");
            None
        }
    }
}
