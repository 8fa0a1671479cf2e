//! The composite record applications hold and observe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{DataDescriptor, ResourceId, ResourcePointer};
use crate::config::RequestOptions;
use crate::engine::EngineShared;
use crate::error::ResourceError;
use crate::transport::TransportRequest;

/// Fetch state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  /// Created, never fetched
  Initialized,
  /// A network request is in flight
  Loading,
  /// Data is composed and current
  Fetched,
  /// The latest fetch failed; previous data is kept
  Error,
}

impl Status {
  pub fn is_settled(self) -> bool {
    matches!(self, Status::Fetched | Status::Error)
  }
}

/// One composed entity: where it lives in the atomic store, and its value
/// at composition time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Composed {
  pub id: Option<ResourceId>,
  /// Atomic key; `None` when the fetch bypassed the atomic store
  pub key: Option<String>,
  pub value: Value,
}

#[derive(Debug)]
pub(crate) struct RecordState {
  pub status: Status,
  pub composed: Vec<Composed>,
  pub errors: Vec<ResourceError>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub last_requested_at: Option<DateTime<Utc>>,
  /// Generation of the latest fetch issued against this record
  pub generation: u64,
}

pub(crate) struct ResourceInner {
  pub pointer: ResourcePointer,
  pub resource_type: String,
  pub options: RequestOptions,
  /// Nominal request, before optimization
  pub request: TransportRequest,
  pub engine: Weak<EngineShared>,
  pub state: Mutex<RecordState>,
  pub version: watch::Sender<u64>,
}

/// Shared handle to a resource record.
///
/// Every lookup of the same cache key returns a handle to the same record.
/// Fields change in place; the record itself is never swapped out, so
/// observers can hold on to one handle for the lifetime of the engine.
#[derive(Clone)]
pub struct Resource {
  pub(crate) inner: Arc<ResourceInner>,
}

impl Resource {
  pub(crate) fn new(
    pointer: ResourcePointer,
    resource_type: String,
    options: RequestOptions,
    request: TransportRequest,
    engine: Weak<EngineShared>,
  ) -> Self {
    let now = Utc::now();
    let (version, _) = watch::channel(0);
    Self {
      inner: Arc::new(ResourceInner {
        pointer,
        resource_type,
        options,
        request,
        engine,
        state: Mutex::new(RecordState {
          status: Status::Initialized,
          composed: Vec::new(),
          errors: Vec::new(),
          created_at: now,
          updated_at: now,
          last_requested_at: None,
          generation: 0,
        }),
        version,
      }),
    }
  }

  /// Whether two handles point at the same record.
  pub fn ptr_eq(a: &Resource, b: &Resource) -> bool {
    Arc::ptr_eq(&a.inner, &b.inner)
  }

  pub(crate) fn state(&self) -> MutexGuard<'_, RecordState> {
    // A panic while holding the lock leaves plain data behind; keep serving it.
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub(crate) fn engine(&self) -> Option<Arc<EngineShared>> {
    self.inner.engine.upgrade()
  }

  pub fn pointer(&self) -> &ResourcePointer {
    &self.inner.pointer
  }

  pub fn cache_key(&self) -> &str {
    self.inner.pointer.cache_key()
  }

  pub fn resource_type(&self) -> &str {
    &self.inner.resource_type
  }

  pub fn options(&self) -> &RequestOptions {
    &self.inner.options
  }

  /// The request this record issues when nothing can be served from cache.
  pub fn request(&self) -> &TransportRequest {
    &self.inner.request
  }

  pub fn status(&self) -> Status {
    self.state().status
  }

  pub fn is_ready(&self) -> bool {
    self.status() == Status::Fetched
  }

  pub fn is_error(&self) -> bool {
    self.status() == Status::Error
  }

  pub fn is_loading(&self) -> bool {
    self.status() == Status::Loading
  }

  /// Fetched, and nothing came back.
  pub fn is_empty(&self) -> bool {
    if !self.is_ready() {
      return false;
    }
    match self.data() {
      Value::Array(items) => items.is_empty(),
      Value::Object(map) => map.is_empty(),
      Value::Null => true,
      _ => false,
    }
  }

  /// Most recent error, if any fetch ever failed.
  pub fn message(&self) -> Option<ResourceError> {
    self.state().errors.last().cloned()
  }

  /// Every recorded error, oldest first.
  pub fn messages(&self) -> Vec<ResourceError> {
    self.state().errors.clone()
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.state().created_at
  }

  pub fn updated_at(&self) -> DateTime<Utc> {
    self.state().updated_at
  }

  pub fn last_requested_at(&self) -> Option<DateTime<Utc>> {
    self.state().last_requested_at
  }

  /// Current data, joined from the atomic store at read time.
  ///
  /// A single resource yields an object (empty before the first fetch);
  /// collections and "all" resources yield an array. Entries reset from the
  /// atomic store after composition keep their last composed value.
  pub fn data(&self) -> Value {
    let composed = self.state().composed.clone();
    let engine = self.engine();

    let mut values = composed.into_iter().map(|c| {
      let live = match (&engine, &c.key) {
        (Some(engine), Some(key)) => match engine.atomic.get_by_key(key) {
          Ok(entry) => entry.map(|e| e.payload),
          Err(e) => {
            warn!(key = %key, error = %e, "atomic read failed, using composed value");
            None
          }
        },
        _ => None,
      };
      live.unwrap_or(c.value)
    });

    match self.inner.pointer.descriptor() {
      DataDescriptor::Single { .. } => values.next().unwrap_or(Value::Object(Map::new())),
      _ => Value::Array(values.collect()),
    }
  }

  /// Whether this record composes the given atomic entry.
  pub(crate) fn composes(&self, atomic_key: &str) -> bool {
    self
      .state()
      .composed
      .iter()
      .any(|c| c.key.as_deref() == Some(atomic_key))
  }

  /// Subscribe to changes. The value is a counter bumped on every mutation.
  pub fn watch(&self) -> watch::Receiver<u64> {
    self.inner.version.subscribe()
  }

  /// Number of in-place mutations so far.
  pub fn version(&self) -> u64 {
    *self.inner.version.borrow()
  }

  pub(crate) fn notify(&self) {
    self.inner.version.send_modify(|v| *v += 1);
  }

  /// Wait until the record is `Fetched` or `Error`.
  ///
  /// A silent record that is never fetched never settles.
  pub async fn settled(&self) -> Status {
    let mut rx = self.watch();
    loop {
      let status = self.status();
      if status.is_settled() {
        return status;
      }
      if rx.changed().await.is_err() {
        return self.status();
      }
    }
  }

  // ---------------------------------------------------------------------------
  // State transitions, driven by the fetch path
  // ---------------------------------------------------------------------------

  /// Start a fetch and return its generation.
  pub(crate) fn begin(&self) -> u64 {
    let mut state = self.state();
    state.generation += 1;
    state.generation
  }

  pub(crate) fn set_loading(&self, generation: u64) {
    {
      let mut state = self.state();
      if state.generation != generation {
        return;
      }
      state.status = Status::Loading;
    }
    self.notify();
  }

  /// Finish a fetch. Returns false when a newer fetch superseded this one.
  pub(crate) fn complete(&self, generation: u64, composed: Vec<Composed>, requested: bool) -> bool {
    {
      let mut state = self.state();
      if state.generation != generation {
        debug!(
          cache_key = %self.cache_key(),
          generation,
          latest = state.generation,
          "dropping stale response"
        );
        return false;
      }
      let now = Utc::now();
      state.composed = composed;
      state.status = Status::Fetched;
      state.updated_at = now;
      if requested {
        state.last_requested_at = Some(now);
      }
    }
    self.notify();
    true
  }

  /// Record failures. Returns false when a newer fetch superseded this one.
  pub(crate) fn fail(&self, generation: u64, errors: Vec<ResourceError>) -> bool {
    {
      let mut state = self.state();
      if state.generation != generation {
        for error in &errors {
          warn!(cache_key = %self.cache_key(), %error, "stale fetch failed");
        }
        return false;
      }
      state.errors.extend(errors);
      state.status = Status::Error;
      state.updated_at = Utc::now();
    }
    self.notify();
    true
  }

  /// Point-in-time copy of the record, for display and debugging.
  pub fn snapshot(&self) -> RecordSnapshot {
    let data = self.data();
    let state = self.state();
    RecordSnapshot {
      cache_key: self.cache_key().to_string(),
      resource_type: self.inner.resource_type.clone(),
      status: state.status,
      data,
      errors: state.errors.iter().map(ToString::to_string).collect(),
      created_at: state.created_at,
      updated_at: state.updated_at,
      last_requested_at: state.last_requested_at,
    }
  }
}

impl std::fmt::Debug for Resource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state();
    f.debug_struct("Resource")
      .field("cache_key", &self.cache_key())
      .field("resource_type", &self.inner.resource_type)
      .field("status", &state.status)
      .field("errors", &state.errors.len())
      .finish_non_exhaustive()
  }
}

/// Serializable copy of a record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
  pub cache_key: String,
  pub resource_type: String,
  pub status: Status,
  pub data: Value,
  pub errors: Vec<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub last_requested_at: Option<DateTime<Utc>>,
}
