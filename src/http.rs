//! HTTP surface: job introspection, manual triggers and generation control.

use crate::error::{GenerationError, SchedulerError};
use crate::generation::{GenerationReport, GenerationStats, WindowGenerator};
use crate::job::{JobStatus, TriggerResult};
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::JobScheduler;

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// --- Listener ---

/// A running HTTP server that can be closed exactly once.
///
/// `close()` stops accepting connections and resolves after in-flight
/// requests have completed. Calling it again returns the first result.
#[derive(Debug, Clone)]
pub struct HttpListener {
  local_addr: SocketAddr,
  shutdown: CancellationToken,
  exit_rx: watch::Receiver<Option<Result<(), String>>>,
}

impl HttpListener {
  pub async fn bind(addr: SocketAddr, router: Router) -> std::io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);

    let signal = shutdown.clone();
    tokio::spawn(async move {
      let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
        .map_err(|e| e.to_string());
      if let Err(e) = &result {
        error!(error = %e, "HTTP server terminated with an error.");
      }
      exit_tx.send_replace(Some(result));
    });

    info!(addr = %local_addr, "HTTP listener bound.");
    Ok(Self {
      local_addr,
      shutdown,
      exit_rx,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn is_closing(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  /// Stops accepting connections and waits for in-flight requests to drain.
  pub async fn close(&self) -> anyhow::Result<()> {
    if !self.shutdown.is_cancelled() {
      info!(addr = %self.local_addr, "Closing HTTP listener.");
      self.shutdown.cancel();
    }
    self.wait_exit().await
  }

  /// Resolves when the server stops. Stopping without `close()` having been
  /// requested is reported as an error.
  pub async fn serve_until_closed(&self) -> anyhow::Result<()> {
    let result = self.wait_exit().await;
    if !self.shutdown.is_cancelled() {
      warn!(addr = %self.local_addr, "HTTP server stopped without being closed.");
      return Err(result.err().unwrap_or_else(|| anyhow::anyhow!("HTTP server exited unexpectedly")));
    }
    result
  }

  async fn wait_exit(&self) -> anyhow::Result<()> {
    let mut rx = self.exit_rx.clone();
    let exit = rx
      .wait_for(|exit| exit.is_some())
      .await
      .map_err(|_| anyhow::anyhow!("HTTP server task vanished"))?
      .clone();
    match exit {
      Some(Err(e)) => Err(anyhow::anyhow!(e)),
      _ => Ok(()),
    }
  }
}

// --- State ---

#[derive(Debug, Clone, Copy)]
pub struct GenerationDefaults {
  pub weeks_ahead: u32,
  pub skip_existing: bool,
}

#[derive(Debug, Clone)]
pub struct AppState {
  pub scheduler: JobScheduler,
  pub generator: WindowGenerator,
  pub shutdown: ShutdownCoordinator,
  pub generation_defaults: GenerationDefaults,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/jobs", get(list_jobs))
    .route("/jobs/{name}", get(job_status))
    .route("/jobs/{name}/trigger", post(trigger_job))
    .route("/generation/stats", get(generation_stats))
    .route("/generation", post(run_generation))
    .with_state(state)
}

// --- Errors ---

#[derive(Debug)]
pub enum ApiError {
  NotFound(String),
  BadRequest(String),
  Internal(String),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
      ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}

impl From<SchedulerError> for ApiError {
  fn from(e: SchedulerError) -> Self {
    match e {
      SchedulerError::UnknownJob(_) => ApiError::NotFound(e.to_string()),
      SchedulerError::DuplicateJob(_) | SchedulerError::InvalidSchedule { .. } => {
        ApiError::BadRequest(e.to_string())
      }
      SchedulerError::SchedulerShutdown | SchedulerError::ResponseFailed => {
        ApiError::Internal(e.to_string())
      }
    }
  }
}

impl From<GenerationError> for ApiError {
  fn from(e: GenerationError) -> Self {
    match e {
      GenerationError::InvalidWindow(_) => ApiError::BadRequest(e.to_string()),
      other => ApiError::Internal(other.to_string()),
    }
  }
}

// --- Handlers ---

#[derive(Debug, Serialize)]
struct HealthResponse {
  status: &'static str,
  running_executions: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
  let draining = state.shutdown.phase() != ShutdownPhase::Running;
  let body = HealthResponse {
    status: if draining { "draining" } else { "ok" },
    running_executions: state.scheduler.running_count(),
  };
  let status = if draining {
    StatusCode::SERVICE_UNAVAILABLE
  } else {
    StatusCode::OK
  };
  (status, Json(body))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobStatus>>, ApiError> {
  Ok(Json(state.scheduler.list_jobs().await?))
}

async fn job_status(
  State(state): State<AppState>,
  Path(name): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
  Ok(Json(state.scheduler.status(&name).await?))
}

async fn trigger_job(
  State(state): State<AppState>,
  Path(name): Path<String>,
) -> Result<Json<TriggerResult>, ApiError> {
  let result = state.scheduler.trigger_now(&name).await?;
  info!(job = %name, ?result, "Manual trigger requested over HTTP.");
  Ok(Json(result))
}

async fn generation_stats(State(state): State<AppState>) -> Result<Json<GenerationStats>, ApiError> {
  state
    .generator
    .stats()
    .await
    .map(Json)
    .ok_or_else(|| ApiError::Internal("generation stats unavailable".to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
  pub weeks_ahead: Option<u32>,
  pub skip_existing: Option<bool>,
}

async fn run_generation(
  State(state): State<AppState>,
  Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerationReport>, ApiError> {
  let weeks_ahead = request
    .weeks_ahead
    .unwrap_or(state.generation_defaults.weeks_ahead);
  let skip_existing = request
    .skip_existing
    .unwrap_or(state.generation_defaults.skip_existing);
  let report = state.generator.generate(weeks_ahead, skip_existing).await?;
  Ok(Json(report))
}
