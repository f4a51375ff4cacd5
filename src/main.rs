use std::sync::Arc;

use chrono::Utc;
use timecamp_pulse::config::AppConfig;
use timecamp_pulse::reports::{ReportKind, Reporter};
use timecamp_pulse::routes::{self, AppState};
use timecamp_pulse::scheduler::spawn_cron_job;
use timecamp_pulse::slack::{Messenger, SlackClient};
use timecamp_pulse::store::{Database, LibSqlBackend};
use timecamp_pulse::sync::{SyncMode, Syncer};
use timecamp_pulse::threshold::{NotificationFanout, ThresholdDetector, ThresholdMonitor};
use timecamp_pulse::timecamp::{TimeCampClient, TimeSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    eprintln!("⏱  TimeCamp Pulse v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   HTTP: http://0.0.0.0:{}", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.database_path).await?);

    // ── Clients ──────────────────────────────────────────────────────────
    let source: Arc<dyn TimeSource> = Arc::new(TimeCampClient::new(
        config.timecamp_api_url.clone(),
        config.timecamp_api_token.clone(),
    ));
    let messenger: Arc<dyn Messenger> = Arc::new(SlackClient::new(
        config.slack_api_url.clone(),
        config.slack_bot_token.clone(),
    ));

    // ── Threshold engine + sync ──────────────────────────────────────────
    let detector = ThresholdDetector::new(Arc::clone(&db), config.detector.clone());
    let fanout = NotificationFanout::new(Arc::clone(&db), Arc::clone(&messenger), config.notify_pacing);
    let monitor = Arc::new(ThresholdMonitor::new(detector, fanout, config.thresholds_enabled));
    let syncer = Arc::new(Syncer::new(
        source,
        Arc::clone(&db),
        Arc::clone(&monitor),
        config.sync.clone(),
    ));
    let reporter = Arc::new(Reporter::new(Arc::clone(&db), Arc::clone(&messenger)));

    // ── Cron jobs ────────────────────────────────────────────────────────
    for (name, schedule, mode) in [
        ("sync", config.schedules.sync.clone(), SyncMode::Incremental),
        ("full_sync", config.schedules.full_sync.clone(), SyncMode::Full),
    ] {
        let syncer = Arc::clone(&syncer);
        spawn_cron_job(name, schedule, move || {
            let syncer = Arc::clone(&syncer);
            async move {
                syncer.run(mode).await?;
                Ok::<(), anyhow::Error>(())
            }
        });
    }

    match &config.slack_report_channel {
        Some(channel) => {
            for (name, schedule, kind) in [
                ("daily_report", config.schedules.daily_report.clone(), ReportKind::Daily),
                ("weekly_report", config.schedules.weekly_report.clone(), ReportKind::Weekly),
                ("monthly_report", config.schedules.monthly_report.clone(), ReportKind::Monthly),
            ] {
                let reporter = Arc::clone(&reporter);
                let channel = channel.clone();
                spawn_cron_job(name, schedule, move || {
                    let reporter = Arc::clone(&reporter);
                    let channel = channel.clone();
                    async move {
                        reporter.send(kind, &channel, Utc::now().date_naive()).await?;
                        Ok::<(), anyhow::Error>(())
                    }
                });
            }
        }
        None => tracing::info!("SLACK_REPORT_CHANNEL not set, scheduled reports disabled"),
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    if config.slack_verification_token.is_none() {
        tracing::warn!("SLACK_VERIFICATION_TOKEN not set, slash commands are unauthenticated");
    }
    let app = routes::router(AppState {
        store: Arc::clone(&db),
        syncer,
        reporter,
        monitor,
        verification_token: config.slack_verification_token.clone(),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "HTTP server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
