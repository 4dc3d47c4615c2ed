use cadence::config::{AppConfig, CliArgs};
use cadence::generation::WindowGenerator;
use cadence::http::{self, AppState, GenerationDefaults, HttpListener};
use cadence::jobs::{cleanup_task, generation_task, CLEANUP_JOB, GENERATION_JOB};
use cadence::shutdown::ShutdownCoordinator;
use cadence::storage::{MemoryStorage, SqliteStorage, Storage};
use cadence::JobScheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer())
    .with(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .try_init()
    .context("Failed to install tracing subscriber")?;

  let cli = CliArgs::parse();
  let config = AppConfig::resolve(&cli).context("Failed to load configuration")?;
  info!(listen_addr = %config.listen_addr, in_memory = config.in_memory, "Starting cadence server.");

  let shutdown = ShutdownCoordinator::with_timeout(config.shutdown.timeout());
  let signals = shutdown.listen_for_signals();

  // --- Storage ---
  let storage: Arc<dyn Storage> = if config.in_memory {
    Arc::new(MemoryStorage::new())
  } else {
    Arc::new(
      SqliteStorage::connect(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?,
    )
  };
  for template in &config.templates {
    storage
      .upsert_template(template)
      .await
      .with_context(|| format!("Failed to store template {}", template.id))?;
  }

  // --- Catch-up generation ---
  let generator = WindowGenerator::new(storage.clone());
  let draining = shutdown.draining_token();
  tokio::select! {
    result = generator.generate(config.generation.weeks_ahead, config.generation.skip_existing) => {
      if let Err(e) = result {
        warn!(created = e.created(), error = %e, "Catch-up generation failed, the scheduled job will retry.");
      }
    }
    _ = draining.cancelled() => {
      warn!("Shutdown requested during catch-up generation.");
    }
  }

  // --- Jobs ---
  let scheduler = JobScheduler::new();
  scheduler
    .register(
      GENERATION_JOB,
      &config.generation.schedule,
      &config.generation.timezone,
      generation_task(
        generator.clone(),
        config.generation.weeks_ahead,
        config.generation.skip_existing,
      ),
    )
    .await
    .context("Failed to register generation job")?;
  scheduler
    .register(
      CLEANUP_JOB,
      &config.cleanup.schedule,
      &config.cleanup.timezone,
      cleanup_task(storage.clone(), config.cleanup.retention_days),
    )
    .await
    .context("Failed to register cleanup job")?;
  if !shutdown.is_shutting_down() {
    scheduler.start(GENERATION_JOB).await?;
    scheduler.start(CLEANUP_JOB).await?;
  }

  // --- HTTP ---
  let state = AppState {
    scheduler: scheduler.clone(),
    generator,
    shutdown: shutdown.clone(),
    generation_defaults: GenerationDefaults {
      weeks_ahead: config.generation.weeks_ahead,
      skip_existing: config.generation.skip_existing,
    },
  };
  let listener = HttpListener::bind(config.listen_addr, http::router(state))
    .await
    .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
  info!(addr = %listener.local_addr(), "Listening.");

  let watched = listener.clone();
  let _http_supervisor = shutdown.supervise(
    "http-server",
    tokio::spawn(async move { watched.serve_until_closed().await }),
  );

  // --- Teardown, in order ---
  shutdown.add_step("http-listener", async move { listener.close().await });
  let jobs = scheduler.clone();
  shutdown.add_step("job-scheduler", async move {
    let in_flight = jobs.shutdown().await?;
    if in_flight > 0 {
      info!(in_flight, "Job scheduler stopped with executions still in flight.");
    }
    Ok(())
  });
  let store = storage.clone();
  shutdown.add_step("storage", async move {
    store.disconnect().await?;
    Ok(())
  });

  let report = shutdown.run().await;
  signals.abort();
  info!(cause = %report.cause, exit_code = report.exit_code(), "Exiting.");
  std::process::exit(report.exit_code());
}
