//! tests/http.rs
//! HTTP routes and listener draining during an ordered shutdown.

mod common;

use common::{daily_template, job_blocking, job_counter, setup_tracing};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use axum::routing::get;
use axum::Router;
use cadence::http::{router, AppState, GenerationDefaults, HttpListener};
use cadence::storage::{MemoryStorage, Storage};
use cadence::{JobScheduler, ShutdownCause, ShutdownCoordinator, StepOutcome, WindowGenerator};
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};

const ANY_ADDR: &str = "127.0.0.1:0";

struct TestApp {
  scheduler: JobScheduler,
  storage: Arc<MemoryStorage>,
  shutdown: ShutdownCoordinator,
  state: AppState,
}

async fn test_app() -> TestApp {
  let scheduler = JobScheduler::new();
  scheduler
    .register(
      "cleanup",
      "0 0 3 * * *",
      "UTC",
      job_counter(Arc::new(AtomicUsize::new(0)), StdDuration::ZERO, true),
    )
    .await
    .unwrap();

  let storage = Arc::new(MemoryStorage::with_templates([daily_template(1, 9)]));
  let generator = WindowGenerator::new(storage.clone());
  let shutdown = ShutdownCoordinator::with_timeout(StdDuration::from_secs(5));
  let state = AppState {
    scheduler: scheduler.clone(),
    generator,
    shutdown: shutdown.clone(),
    generation_defaults: GenerationDefaults {
      weeks_ahead: 1,
      skip_existing: true,
    },
  };
  TestApp {
    scheduler,
    storage,
    shutdown,
    state,
  }
}

async fn serve(router: Router) -> HttpListener {
  let addr: SocketAddr = ANY_ADDR.parse().unwrap();
  HttpListener::bind(addr, router).await.unwrap()
}

fn url(listener: &HttpListener, path: &str) -> String {
  format!("http://{}{}", listener.local_addr(), path)
}

#[tokio::test]
async fn test_job_routes() {
  setup_tracing();
  let app = test_app().await;
  let listener = serve(router(app.state.clone())).await;
  let client = reqwest::Client::new();

  let health = client.get(url(&listener, "/health")).send().await.unwrap();
  assert_eq!(health.status(), 200);
  let body: Value = health.json().await.unwrap();
  assert_eq!(body["status"], "ok");

  let jobs: Value = client
    .get(url(&listener, "/jobs"))
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
  assert_eq!(jobs.as_array().map(Vec::len), Some(1));
  assert_eq!(jobs[0]["name"], "cleanup");
  assert_eq!(jobs[0]["active"], false);

  let missing = client.get(url(&listener, "/jobs/ghost")).send().await.unwrap();
  assert_eq!(missing.status(), 404);
  let body: Value = missing.json().await.unwrap();
  assert!(body["error"].as_str().unwrap().contains("ghost"));

  let triggered: Value = client
    .post(url(&listener, "/jobs/cleanup/trigger"))
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
  assert_eq!(triggered["result"], "started");
  assert!(app.scheduler.wait_idle(StdDuration::from_secs(5)).await);

  let status: Value = client
    .get(url(&listener, "/jobs/cleanup"))
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
  assert_eq!(status["running"], false);
  assert_eq!(status["last_run"]["outcome"]["status"], "succeeded");

  listener.close().await.unwrap();
}

#[tokio::test]
async fn test_generation_routes() {
  setup_tracing();
  let app = test_app().await;
  let listener = serve(router(app.state.clone())).await;
  let client = reqwest::Client::new();

  let invalid = client
    .post(url(&listener, "/generation"))
    .json(&json!({ "weeks_ahead": 0 }))
    .send()
    .await
    .unwrap();
  assert_eq!(invalid.status(), 400);
  assert_eq!(app.storage.session_count(), 0);

  // Defaults apply: one week for one daily template.
  let report = client
    .post(url(&listener, "/generation"))
    .json(&json!({}))
    .send()
    .await
    .unwrap();
  assert_eq!(report.status(), 200);
  let report: Value = report.json().await.unwrap();
  assert_eq!(report["candidates"], 7);
  assert_eq!(report["created"], 7);
  assert_eq!(report["window"]["skip_existing"], true);

  let stats: Value = client
    .get(url(&listener, "/generation/stats"))
    .send()
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
  assert_eq!(stats["total_sessions"], 7);
  assert_eq!(stats["active_template_count"], 1);

  listener.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
  setup_tracing();
  let app = test_app().await;
  let listener = serve(router(app.state)).await;
  let addr = listener.local_addr();

  assert!(!listener.is_closing());
  listener.close().await.unwrap();
  listener.close().await.unwrap();
  assert!(listener.is_closing());
  listener.serve_until_closed().await.unwrap();

  assert!(reqwest::get(format!("http://{addr}/health")).await.is_err());
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_requests_in_order() {
  setup_tracing();
  let app = test_app().await;

  // A route that holds requests open until the test releases them.
  let gate = Arc::new(Semaphore::new(0));
  let entered = Arc::new(AtomicUsize::new(0));
  let slow = {
    let gate = gate.clone();
    let entered = entered.clone();
    Router::new().route(
      "/slow",
      get(move || {
        let gate = gate.clone();
        let entered = entered.clone();
        async move {
          entered.fetch_add(1, Ordering::SeqCst);
          let _permit = gate.acquire().await.expect("gate closed");
          "done"
        }
      }),
    )
  };
  let listener = serve(router(app.state.clone()).merge(slow)).await;

  // A job execution that outlives shutdown.
  let started = Arc::new(Notify::new());
  let release = Arc::new(Notify::new());
  app
    .scheduler
    .register(
      "long",
      "0 0 * * * *",
      "UTC",
      job_blocking(Arc::new(AtomicUsize::new(0)), started.clone(), release.clone()),
    )
    .await
    .unwrap();
  app.scheduler.start("long").await.unwrap();
  app.scheduler.trigger_now("long").await.unwrap();
  started.notified().await;

  let requests = {
    let client = reqwest::Client::new();
    let slow_url = url(&listener, "/slow");
    tokio::spawn(async move {
      futures::future::join_all((0..2).map(|_| {
        let client = client.clone();
        let slow_url = slow_url.clone();
        async move { client.get(slow_url).send().await?.text().await }
      }))
      .await
    })
  };
  tokio::time::timeout(StdDuration::from_secs(5), async {
    while entered.load(Ordering::SeqCst) < 2 {
      tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
  })
  .await
  .expect("requests never reached the handler");

  let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
  {
    let (log, listener) = (log.clone(), listener.clone());
    app.shutdown.add_step("http-listener", async move {
      listener.close().await?;
      log.lock().unwrap().push("http-listener");
      Ok(())
    });
  }
  {
    let (log, scheduler) = (log.clone(), app.scheduler.clone());
    app.shutdown.add_step("job-scheduler", async move {
      scheduler.stop_all().await?;
      log.lock().unwrap().push("job-scheduler");
      Ok(())
    });
  }
  {
    let (log, storage) = (log.clone(), app.storage.clone());
    app.shutdown.add_step("storage", async move {
      storage.disconnect().await?;
      log.lock().unwrap().push("storage");
      Ok(())
    });
  }

  assert!(app.shutdown.trigger(ShutdownCause::Signal("SIGTERM".to_string())));
  let runner = {
    let shutdown = app.shutdown.clone();
    tokio::spawn(async move { shutdown.run().await })
  };

  // The listener step cannot finish while both requests are held.
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  assert!(!runner.is_finished());
  assert!(log.lock().unwrap().is_empty());
  assert!(listener.is_closing());

  gate.add_permits(2);
  let responses = requests.await.unwrap();
  assert_eq!(responses.len(), 2);
  for response in responses {
    assert_eq!(response.unwrap(), "done");
  }

  let report = tokio::time::timeout(StdDuration::from_secs(5), runner)
    .await
    .expect("shutdown should finish once requests drain")
    .unwrap();
  assert_eq!(report.exit_code(), 0);
  assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::Ok));
  assert_eq!(*log.lock().unwrap(), vec!["http-listener", "job-scheduler", "storage"]);
  assert!(app.storage.is_closed());

  // Timers are off but the running execution was left alone.
  let status = app.scheduler.status("long").await.unwrap();
  assert!(!status.active);
  assert!(status.running);
  release.notify_one();
  assert!(app.scheduler.wait_idle(StdDuration::from_secs(5)).await);
}
