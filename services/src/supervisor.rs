use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use clubprint_edge_db::connection;
use clubprint_edge_db::print_jobs::PrintJob;
use clubprint_settings::{ClubPrintSettings, ClubPrintSettingsError, PrintMode, Secrets};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::ResponseCache;
use crate::club_api::ApiService;
use crate::error::ServiceError;
use crate::health::HealthReporter;
use crate::memory::MemoryMonitor;
use crate::scheduler::Scheduler;
use crate::sink::{EmailPrintSink, LocalPrintSink, PrintSink};
use crate::webhook::{EventNotifier, WebhookEvent, WebhookNotifier};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const CACHE_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);
const CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

pub fn discovery_period(interval_hours: f64) -> Duration {
    Duration::from_secs_f64(interval_hours * 3600.0)
}

/// Log panics before the abort: the process manager restarts us, the
/// operator gets a reason in the journal.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Fatal internal error: {}", info);
        default_hook(info);
    }));
}

fn spawn_ticker<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> futures::future::BoxFuture<'static, ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => {
                    info!("{} loop stopped", name);
                    return;
                }
            }
        }
    })
}

async fn wait_for_signal() -> Result<(), ServiceError> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

/// Boot the engine, run until a termination signal, then drain and exit.
pub async fn run(settings: ClubPrintSettings, secrets: Secrets) -> Result<(), ServiceError> {
    std::fs::create_dir_all(&settings.paths.data_dir)?;
    std::fs::create_dir_all(&settings.paths.run_dir)?;
    let database_path = settings.paths.db().display().to_string();

    connection::run_migrations(&database_path)?;
    let repaired = PrintJob::reconcile(&database_path)?;
    if repaired > 0 {
        info!("Reconciled {} events against their terminal jobs", repaired);
    }

    let api_breaker = Arc::new(CircuitBreaker::new("api", CircuitBreakerConfig::default()));
    let printer_breaker = Arc::new(CircuitBreaker::new(
        "printer",
        CircuitBreakerConfig::default(),
    ));
    let email_breaker = Arc::new(CircuitBreaker::new("email", CircuitBreakerConfig::default()));
    let webhook_breaker = Arc::new(CircuitBreaker::new(
        "webhook",
        CircuitBreakerConfig::default(),
    ));

    let cache = Arc::new(ResponseCache::default());
    let api = Arc::new(ApiService::new(
        &settings.api,
        &secrets.api_token,
        api_breaker.clone(),
        cache.clone(),
    )?);
    let sink: Arc<dyn PrintSink> = match settings.print_mode {
        PrintMode::Local => Arc::new(LocalPrintSink::new(
            settings.printer.queue.clone(),
            printer_breaker.clone(),
        )),
        PrintMode::Email => {
            let smtp = secrets.smtp.clone().ok_or_else(|| {
                ServiceError::Settings(ClubPrintSettingsError::MissingSecret {
                    var: clubprint_settings::secrets::SMTP_HOST_VAR.to_string(),
                })
            })?;
            Arc::new(EmailPrintSink::new(smtp, email_breaker.clone()))
        }
    };
    info!("Print sink: {}", sink.name());

    let notifier = Arc::new(WebhookNotifier::new(
        settings.webhook.clone(),
        webhook_breaker.clone(),
    )?);
    let memory = Arc::new(MemoryMonitor::new(&settings.monitoring));
    let scheduler = Scheduler::new(settings.clone(), api, sink, notifier.clone());

    let recovered = scheduler.recover().await?;
    info!("Startup recovery re-armed {} jobs", recovered);
    notifier
        .notify(
            WebhookEvent::ServiceStarted,
            json!({"version": env!("CARGO_PKG_VERSION")}),
        )
        .await;

    let health = Arc::new(HealthReporter::new(
        &database_path,
        settings.paths.health_file(),
        vec![
            api_breaker,
            printer_breaker,
            email_breaker,
            webhook_breaker,
        ],
        cache.clone(),
        memory.clone(),
        scheduler.clone(),
        settings.monitoring.failed_job_threshold,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tickers = Vec::new();

    // The first interval tick fires immediately, which doubles as the
    // startup discovery pass.
    let discovery_scheduler = scheduler.clone();
    tickers.push(spawn_ticker(
        "discovery",
        discovery_period(settings.service_run_interval_hours),
        shutdown_rx.clone(),
        move || {
            let scheduler = discovery_scheduler.clone();
            Box::pin(async move {
                if let Err(err) = scheduler.run_discovery().await {
                    error!("Discovery pass failed: {}", err);
                }
            })
        },
    ));

    let health_reporter = health.clone();
    tickers.push(spawn_ticker(
        "health",
        Duration::from_secs(settings.monitoring.health_interval_seconds),
        shutdown_rx.clone(),
        move || {
            let health = health_reporter.clone();
            Box::pin(async move {
                if let Err(err) = health.write_snapshot() {
                    warn!("Failed to write health snapshot: {}", err);
                }
            })
        },
    ));

    let memory_monitor = memory.clone();
    tickers.push(spawn_ticker(
        "memory",
        Duration::from_secs(settings.monitoring.memory_sample_minutes * 60),
        shutdown_rx.clone(),
        move || {
            let memory = memory_monitor.clone();
            Box::pin(async move {
                memory.sample();
            })
        },
    ));

    let sweep_cache = cache.clone();
    tickers.push(spawn_ticker(
        "cache-sweep",
        CACHE_SWEEP_PERIOD,
        shutdown_rx.clone(),
        move || {
            let cache = sweep_cache.clone();
            Box::pin(async move {
                let dropped = cache.sweep();
                if dropped > 0 {
                    info!("Cache sweep dropped {} expired entries", dropped);
                }
            })
        },
    ));

    let cleanup_db = database_path.clone();
    let retention_days = settings.monitoring.retention_days;
    tickers.push(spawn_ticker(
        "cleanup",
        CLEANUP_PERIOD,
        shutdown_rx,
        move || {
            let db = cleanup_db.clone();
            Box::pin(async move {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                match PrintJob::cleanup_older_than(&db, cutoff) {
                    Ok(0) => {}
                    Ok(deleted) => info!("Cleanup pruned {} terminal rows", deleted),
                    Err(err) => warn!("Cleanup pass failed: {}", err),
                }
            })
        },
    ));

    wait_for_signal().await?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    scheduler.shutdown(SHUTDOWN_DRAIN).await;
    for ticker in tickers {
        ticker.abort();
    }
    if let Err(err) = connection::checkpoint(&database_path) {
        warn!("Final checkpoint failed: {}", err);
    }
    if let Err(err) = health.write_snapshot() {
        warn!("Final health snapshot failed: {}", err);
    }
    info!("ClubPrint stopped cleanly");
    Ok(())
}
