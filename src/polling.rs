//! Recurring re-fetch of records, one job per cache key.
//!
//! Each job is a spawned task bound to a [`CancellationToken`]. Every tick
//! forces a network fetch of its record; a failed tick removes the job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resource::{FetchOptions, Resource};

struct PollingJob {
  /// Distinguishes a job from its replacement under the same key
  id: u64,
  frequency_ms: u64,
  token: CancellationToken,
}

type JobTable = Arc<Mutex<HashMap<String, PollingJob>>>;

#[derive(Default)]
pub(crate) struct PollingScheduler {
  jobs: JobTable,
  next_id: AtomicU64,
}

fn lock(jobs: &JobTable) -> MutexGuard<'_, HashMap<String, PollingJob>> {
  jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PollingScheduler {
  /// Poll `resource` every `frequency_ms`. Returns whether a job is running
  /// afterwards.
  ///
  /// The same frequency keeps the existing job; a different one replaces
  /// it; `0` stops polling.
  pub(crate) fn start(&self, resource: &Resource, frequency_ms: u64) -> bool {
    let key = resource.cache_key().to_string();

    if frequency_ms == 0 {
      self.stop(&key);
      return false;
    }

    let handle = match tokio::runtime::Handle::try_current() {
      Ok(handle) => handle,
      Err(_) => {
        warn!(cache_key = %key, "no async runtime, polling not started");
        return false;
      }
    };

    let mut jobs = lock(&self.jobs);
    if let Some(existing) = jobs.get(&key) {
      if existing.frequency_ms == frequency_ms {
        return true;
      }
      existing.token.cancel();
      debug!(cache_key = %key, from = existing.frequency_ms, to = frequency_ms, "replacing polling job");
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let token = CancellationToken::new();
    jobs.insert(
      key.clone(),
      PollingJob {
        id,
        frequency_ms,
        token: token.clone(),
      },
    );
    drop(jobs);

    info!(cache_key = %key, frequency_ms, "polling started");
    handle.spawn(run(
      Arc::clone(&self.jobs),
      resource.clone(),
      id,
      Duration::from_millis(frequency_ms),
      token,
    ));
    true
  }

  /// Cancel the job for `cache_key`. Returns whether one existed.
  pub(crate) fn stop(&self, cache_key: &str) -> bool {
    match lock(&self.jobs).remove(cache_key) {
      Some(job) => {
        job.token.cancel();
        info!(cache_key, "polling stopped");
        true
      }
      None => false,
    }
  }

  pub(crate) fn stop_all(&self) {
    let mut jobs = lock(&self.jobs);
    for (_, job) in jobs.drain() {
      job.token.cancel();
    }
  }

  pub(crate) fn is_polling(&self, cache_key: &str) -> bool {
    lock(&self.jobs).contains_key(cache_key)
  }

  pub(crate) fn frequency_ms(&self, cache_key: &str) -> Option<u64> {
    lock(&self.jobs).get(cache_key).map(|job| job.frequency_ms)
  }
}

async fn run(
  jobs: JobTable,
  resource: Resource,
  id: u64,
  period: Duration,
  token: CancellationToken,
) {
  loop {
    tokio::select! {
      biased;
      _ = token.cancelled() => break,
      _ = tokio::time::sleep(period) => {}
    }

    debug!(cache_key = %resource.cache_key(), "polling tick");
    if let Err(error) = resource.fetch(FetchOptions::force()).await {
      // A failure overtaken by a newer fetch left the record alone.
      if !resource.is_error() {
        debug!(cache_key = %resource.cache_key(), %error, "superseded polled fetch failed");
        continue;
      }
      warn!(cache_key = %resource.cache_key(), %error, "polled fetch failed, stopping");
      let mut table = lock(&jobs);
      // A replacement job may already own the key.
      if table.get(resource.cache_key()).is_some_and(|job| job.id == id) {
        table.remove(resource.cache_key());
      }
      break;
    }
  }
}

impl Resource {
  /// Re-fetch this record every `frequency_ms`, bypassing the cache.
  /// `0` stops polling. Returns whether a job is running afterwards.
  pub fn start_polling(&self, frequency_ms: u64) -> bool {
    match self.engine() {
      Some(engine) => engine.polling.start(self, frequency_ms),
      None => false,
    }
  }

  /// Stop polling this record. Returns whether a job existed.
  pub fn stop(&self) -> bool {
    match self.engine() {
      Some(engine) => engine.polling.stop(self.cache_key()),
      None => false,
    }
  }

  pub fn is_polling(&self) -> bool {
    self
      .engine()
      .is_some_and(|engine| engine.polling.is_polling(self.cache_key()))
  }
}

#[cfg(test)]
mod tests {
  use crate::cache::Variables;
  use crate::config::{EngineConfig, RequestOptions};
  use crate::engine::CacheEngine;
  use crate::resource::{FetchOptions, Status};
  use crate::transport::mock::MockTransport;
  use crate::transport::Method;
  use serde_json::json;
  use std::time::Duration;

  fn setup() -> (CacheEngine, MockTransport) {
    let transport = MockTransport::new();
    transport.respond(Method::Get, "/news", json!([{ "id": 1, "title": "a" }]));
    (CacheEngine::new(EngineConfig::default(), transport.clone()), transport)
  }

  async fn settle_tasks() {
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
  }

  async fn advance(ms: u64) {
    // Freshly spawned jobs must arm their timers before the clock moves.
    settle_tasks().await;
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle_tasks().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_refetches_each_period() {
    let (engine, transport) = setup();
    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();

    assert!(news.start_polling(1000));
    assert_eq!(transport.call_count(), 0);

    advance(1000).await;
    assert_eq!(transport.call_count(), 1);
    assert_eq!(news.status(), Status::Fetched);

    advance(1000).await;
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_frequency_keeps_one_job() {
    let (engine, transport) = setup();
    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();

    assert!(news.start_polling(1000));
    assert!(news.start_polling(1000));

    advance(1000).await;
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_new_frequency_replaces_job() {
    let (engine, transport) = setup();
    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();

    news.start_polling(1000);
    news.start_polling(5000);
    assert_eq!(engine.polling_frequency_ms(news.cache_key()), Some(5000));

    advance(1000).await;
    assert_eq!(transport.call_count(), 0);

    advance(4000).await;
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_and_stop_cancel() {
    let (engine, transport) = setup();
    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();

    news.start_polling(1000);
    assert!(!news.start_polling(0));
    assert!(!news.is_polling());
    assert!(!news.stop());

    news.start_polling(1000);
    assert!(news.stop());

    advance(3000).await;
    assert_eq!(transport.call_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_tick_stops_job() {
    let transport = MockTransport::new();
    transport
      .respond(Method::Get, "/news", json!([]))
      .fail(Method::Get, "/news", 503, json!("unavailable"));
    let engine = CacheEngine::new(EngineConfig::default(), transport.clone());

    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();
    news.start_polling(1000);

    advance(1000).await;
    assert!(news.is_polling());
    advance(1000).await;
    assert!(!news.is_polling());
    assert_eq!(news.status(), Status::Error);

    advance(5000).await;
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_interval_option_starts_job() {
    let (engine, _transport) = setup();
    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().polling_interval_ms(2000))
      .unwrap();

    assert!(news.is_polling());
    assert_eq!(news.settled().await, Status::Fetched);
  }

  #[tokio::test(start_paused = true)]
  async fn test_superseded_failure_keeps_job() {
    let transport = MockTransport::new();
    transport
      .fail_after(Method::Get, "/news", 503, json!("slow"), Duration::from_millis(500))
      .respond(Method::Get, "/news", json!([{ "id": 1 }]));
    let engine = CacheEngine::new(EngineConfig::default(), transport.clone());

    let news = engine
      .resource("/news", Variables::new())
      .all("news", RequestOptions::new().silent())
      .unwrap();
    news.start_polling(1000);

    // The tick's request hangs; a newer fetch completes first.
    advance(1000).await;
    assert_eq!(transport.call_count(), 1);
    news.fetch(FetchOptions::force()).await.unwrap();
    assert_eq!(news.status(), Status::Fetched);

    advance(500).await;
    assert_eq!(news.status(), Status::Fetched);
    assert!(news.is_polling());

    advance(1000).await;
    assert_eq!(transport.call_count(), 3);
  }
}
