//! HTTP surface: health check, Slack slash commands and a manual sync trigger.

use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::model::Recipient;
use crate::reports::{ReportKind, Reporter};
use crate::store::Database;
use crate::sync::{SyncMode, Syncer};
use crate::threshold::ThresholdMonitor;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub syncer: Arc<Syncer>,
    pub reporter: Arc<Reporter>,
    pub monitor: Arc<ThresholdMonitor>,
    pub verification_token: Option<SecretString>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/slack/commands", post(slash_command))
        .route("/api/sync", post(trigger_sync))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

const HELP: &str = "*TimeCamp Pulse*\n\
    • `daily` / `weekly` / `monthly` : post a time report here\n\
    • `sync` / `sync full` : pull the latest data from TimeCamp\n\
    • `subscribe` / `unsubscribe` : budget alerts by DM\n\
    • `projects` : list projects\n\
    • `project add <task_id> <name>` : register a project\n\
    • `follow <project>` / `unfollow <project>` : limit your alerts to projects\n\
    • `alerts on|off` : pause or resume budget alerts for everyone";

/// A parsed slash-command text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Report(ReportKind),
    Sync(SyncMode),
    Alerts(Option<bool>),
    Subscribe,
    Unsubscribe,
    Projects,
    AddProject { source_task_id: i64, name: String },
    Follow(String),
    Unfollow(String),
    Help,
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };

        match (head.to_ascii_lowercase().as_str(), rest) {
            ("" | "help", _) => Command::Help,
            ("sync", "") => Command::Sync(SyncMode::Incremental),
            ("sync", "full") => Command::Sync(SyncMode::Full),
            ("alerts", "") => Command::Alerts(None),
            ("alerts", "on") => Command::Alerts(Some(true)),
            ("alerts", "off") => Command::Alerts(Some(false)),
            ("subscribe", "") => Command::Subscribe,
            ("unsubscribe", "") => Command::Unsubscribe,
            ("projects", "") => Command::Projects,
            ("project", rest) => parse_project_add(rest).unwrap_or_else(|| Command::Unknown(text.into())),
            ("follow", name) if !name.is_empty() => Command::Follow(name.into()),
            ("unfollow", name) if !name.is_empty() => Command::Unfollow(name.into()),
            (kind, "") => kind
                .parse::<ReportKind>()
                .map(Command::Report)
                .unwrap_or_else(|_| Command::Unknown(text.into())),
            _ => Command::Unknown(text.into()),
        }
    }
}

fn parse_project_add(rest: &str) -> Option<Command> {
    let rest = rest.strip_prefix("add")?.trim_start();
    let (id, name) = rest.split_once(char::is_whitespace)?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(Command::AddProject {
        source_task_id: id.parse().ok()?,
        name: name.to_string(),
    })
}

/// Form body Slack sends for a slash command.
#[derive(Debug, Deserialize)]
pub struct SlashCommand {
    #[serde(default)]
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub channel_id: String,
    #[serde(default)]
    pub text: String,
}

fn ephemeral(text: impl Into<String>) -> Response {
    Json(serde_json::json!({
        "response_type": "ephemeral",
        "text": text.into(),
    }))
    .into_response()
}

fn token_matches(expected: &SecretString, given: &str) -> bool {
    expected
        .expose_secret()
        .as_bytes()
        .ct_eq(given.as_bytes())
        .into()
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable", "error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn slash_command(State(state): State<AppState>, Form(cmd): Form<SlashCommand>) -> Response {
    if let Some(expected) = &state.verification_token {
        if !token_matches(expected, &cmd.token) {
            warn!(user = %cmd.user_id, "Slash command with bad verification token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }

    let command = Command::parse(&cmd.text);
    info!(user = %cmd.user_id, channel = %cmd.channel_id, ?command, "Slash command");

    match command {
        Command::Help => ephemeral(HELP),
        Command::Unknown(text) => ephemeral(format!("Unknown command `{text}`.\n\n{HELP}")),
        Command::Report(kind) => {
            let reporter = Arc::clone(&state.reporter);
            let channel = cmd.channel_id.clone();
            tokio::spawn(async move {
                if let Err(e) = reporter.send(kind, &channel, Utc::now().date_naive()).await {
                    warn!(%kind, channel = %channel, error = %e, "Report from slash command failed");
                }
            });
            ephemeral(format!("Building the {kind} report…"))
        }
        Command::Sync(mode) => {
            let syncer = Arc::clone(&state.syncer);
            tokio::spawn(async move {
                if let Err(e) = syncer.run(mode).await {
                    warn!(mode = mode.as_str(), error = %e, "Sync from slash command failed");
                }
            });
            ephemeral(format!("Started a {} sync.", mode.as_str()))
        }
        Command::Alerts(None) => ephemeral(if state.monitor.is_enabled() {
            "Budget alerts are on."
        } else {
            "Budget alerts are off."
        }),
        Command::Alerts(Some(on)) => {
            state.monitor.set_enabled(on);
            info!(enabled = on, by = %cmd.user_id, "Budget alerts toggled");
            ephemeral(if on {
                "Budget alerts turned on."
            } else {
                "Budget alerts turned off."
            })
        }
        other => match routing_command(&state, &cmd, other).await {
            Ok(reply) => ephemeral(reply),
            Err(e) => {
                warn!(user = %cmd.user_id, error = %e, "Routing command failed");
                ephemeral("Something went wrong, please try again.")
            }
        },
    }
}

/// Recipient and project bookkeeping commands.
async fn routing_command(
    state: &AppState,
    cmd: &SlashCommand,
    command: Command,
) -> Result<String, crate::error::DatabaseError> {
    let store = &state.store;
    match command {
        Command::Subscribe => {
            subscribe(store, cmd).await?;
            Ok("You will receive budget alerts by DM.".into())
        }
        Command::Unsubscribe => Ok(if store.remove_recipient(&cmd.user_id).await? {
            "You will no longer receive budget alerts.".into()
        } else {
            "You were not subscribed.".into()
        }),
        Command::Projects => {
            let projects = store.list_projects().await?;
            if projects.is_empty() {
                return Ok("No projects yet. Add one with `project add <task_id> <name>`.".into());
            }
            let followed = store.user_project_assignments(&cmd.user_id).await?;
            let lines: Vec<String> = projects
                .iter()
                .map(|p| {
                    let mark = if followed.iter().any(|f| f.id == p.id) { " ✓" } else { "" };
                    format!("• {} (task {}){mark}", p.name, p.source_task_id)
                })
                .collect();
            Ok(lines.join("\n"))
        }
        Command::AddProject { source_task_id, name } => {
            let project = store.upsert_project(&name, source_task_id).await?;
            Ok(format!(
                "Project *{}* now tracks task {}.",
                project.name, project.source_task_id
            ))
        }
        Command::Follow(name) => {
            let Some(project) = store.find_project_by_name(&name).await? else {
                return Ok(format!("No project named `{name}`."));
            };
            subscribe(store, cmd).await?;
            store.assign_project(&cmd.user_id, project.id).await?;
            Ok(format!("You now get alerts for *{}*.", project.name))
        }
        Command::Unfollow(name) => {
            let Some(project) = store.find_project_by_name(&name).await? else {
                return Ok(format!("No project named `{name}`."));
            };
            Ok(if store.unassign_project(&cmd.user_id, project.id).await? {
                format!("You no longer follow *{}*.", project.name)
            } else {
                format!("You were not following *{}*.", project.name)
            })
        }
        _ => Ok(HELP.into()),
    }
}

async fn subscribe(
    store: &Arc<dyn Database>,
    cmd: &SlashCommand,
) -> Result<(), crate::error::DatabaseError> {
    let name = if cmd.user_name.is_empty() {
        cmd.user_id.clone()
    } else {
        cmd.user_name.clone()
    };
    store
        .upsert_recipient(&Recipient {
            slack_user_id: cmd.user_id.clone(),
            name,
        })
        .await
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

async fn trigger_sync(State(state): State<AppState>, Query(query): Query<SyncQuery>) -> Response {
    let mode = match query.mode.as_deref() {
        None | Some("incremental") => SyncMode::Incremental,
        Some("full") => SyncMode::Full,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("unknown sync mode: {other}")})),
            )
                .into_response();
        }
    };

    match state.syncer.run(mode).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
