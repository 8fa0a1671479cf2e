//! The cache engine: owner of the atomic store, the record table, the
//! transport and the polling scheduler.

use color_eyre::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{
  AtomicEntry, AtomicStore, DataDescriptor, KeyValueStore, MemoryStore, ResourceId,
  ResourcePointer, Variables,
};
use crate::config::{EngineConfig, RequestOptions};
use crate::error::ConfigurationError;
use crate::polling::PollingScheduler;
use crate::resource::{FetchOptions, Resource, Status};
use crate::transport::{HttpTransport, Transport};

pub(crate) struct EngineShared {
  pub config: EngineConfig,
  pub atomic: AtomicStore,
  pub records: Box<dyn KeyValueStore<Resource>>,
  /// Serializes record lookup-or-create
  pub creation: Mutex<()>,
  pub transport: Arc<dyn Transport>,
  pub polling: PollingScheduler,
}

impl Drop for EngineShared {
  fn drop(&mut self) {
    self.polling.stop_all();
  }
}

/// Normalized, deduplicating cache of remote REST entities.
///
/// Cloning is cheap; clones share all state. Records hold only a weak
/// reference back, so dropping the last engine handle stops every polling
/// job and leaves outstanding records readable but inert.
#[derive(Clone)]
pub struct CacheEngine {
  shared: Arc<EngineShared>,
}

impl CacheEngine {
  /// Engine over in-memory stores.
  pub fn new(config: EngineConfig, transport: impl Transport + 'static) -> Self {
    Self::with_stores(
      config,
      transport,
      AtomicStore::default(),
      MemoryStore::<Resource>::new(),
    )
  }

  pub fn with_stores(
    config: EngineConfig,
    transport: impl Transport + 'static,
    atomic: AtomicStore,
    records: impl KeyValueStore<Resource> + 'static,
  ) -> Self {
    Self {
      shared: Arc::new(EngineShared {
        config,
        atomic,
        records: Box::new(records),
        creation: Mutex::new(()),
        transport: Arc::new(transport),
        polling: PollingScheduler::default(),
      }),
    }
  }

  /// Engine talking HTTP through reqwest.
  pub fn http(config: EngineConfig) -> Result<Self> {
    let transport = HttpTransport::new(Duration::from_millis(config.request_timeout_ms))?;
    Ok(Self::new(config, transport))
  }

  pub(crate) fn from_shared(shared: Arc<EngineShared>) -> Self {
    Self { shared }
  }

  pub(crate) fn shared(&self) -> &Arc<EngineShared> {
    &self.shared
  }

  pub fn config(&self) -> &EngineConfig {
    &self.shared.config
  }

  pub fn atomic(&self) -> &AtomicStore {
    &self.shared.atomic
  }

  /// Entry point for records under `path`, a template with `:name`
  /// placeholders bound from `variables`.
  pub fn resource(&self, path: &str, variables: Variables) -> ResourceService {
    ResourceService {
      engine: self.clone(),
      path: path.to_string(),
      variables,
    }
  }

  /// Look up the record for a pointer, creating (and unless silent,
  /// fetching) it on first use.
  pub(crate) fn get_or_create(
    &self,
    path: &str,
    variables: Variables,
    descriptor: DataDescriptor,
    resource_type: &str,
    options: RequestOptions,
  ) -> Result<Resource, ConfigurationError> {
    options.validate()?;
    if resource_type.trim().is_empty() {
      return Err(ConfigurationError::MissingResourceType);
    }

    let config = &self.shared.config;
    let pointer = ResourcePointer::resolve(path, variables, descriptor)?;
    let options = options.merged_over(config);
    let url = pointer.url(config.base(), &options.params, None)?;

    let (resource, created) = {
      let _guard = self
        .shared
        .creation
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

      match self.lookup(pointer.cache_key()) {
        Some(existing) => (existing, false),
        None => {
          let request = options.request(url);
          let resource = Resource::new(
            pointer,
            resource_type.to_string(),
            options.clone(),
            request,
            Arc::downgrade(&self.shared),
          );
          if let Err(e) = self.shared.records.put(resource.cache_key(), resource.clone()) {
            warn!(cache_key = %resource.cache_key(), error = %e, "record table write failed");
          }
          debug!(cache_key = %resource.cache_key(), resource_type, "record created");
          (resource, true)
        }
      }
    };

    if options.polling_interval_ms > 0 {
      self
        .shared
        .polling
        .start(&resource, options.polling_interval_ms);
    }

    if created && !options.silent {
      match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
          handle.spawn(resource.fetch(FetchOptions::default()));
        }
        Err(_) => debug!(cache_key = %resource.cache_key(), "no async runtime, fetch deferred"),
      }
    }

    Ok(resource)
  }

  fn lookup(&self, cache_key: &str) -> Option<Resource> {
    match self.shared.records.get(cache_key) {
      Ok(record) => record,
      Err(e) => {
        warn!(cache_key, error = %e, "record table read failed");
        None
      }
    }
  }

  /// Every record in the table.
  pub fn records(&self) -> Vec<Resource> {
    let keys = match self.shared.records.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "record table scan failed");
        return Vec::new();
      }
    };
    keys.iter().filter_map(|key| self.lookup(key)).collect()
  }

  /// Bump the version of every record composing one of `keys`.
  pub(crate) fn notify_composers(&self, keys: &HashSet<String>, except: Option<&Resource>) {
    if keys.is_empty() {
      return;
    }
    for record in self.records() {
      if except.is_some_and(|e| Resource::ptr_eq(e, &record)) {
        continue;
      }
      if keys.iter().any(|key| record.composes(key)) {
        record.notify();
      }
    }
  }

  /// Drop every atomic entry. Composed records keep their last values.
  pub fn reset_all(&self) -> Result<()> {
    self.shared.atomic.reset_all()?;
    info!("atomic store reset");
    Ok(())
  }

  /// Drop every atomic entry of one type. Returns how many were removed.
  pub fn reset_type(&self, resource_type: &str) -> Result<usize> {
    let removed = self.shared.atomic.reset_type(resource_type)?;
    info!(resource_type, removed, "atomic type reset");
    Ok(removed)
  }

  /// Drop one atomic entry. Returns whether it existed.
  pub fn reset(&self, resource_type: &str, id: impl Into<ResourceId>) -> Result<bool> {
    let id = id.into();
    let removed = self.shared.atomic.reset(resource_type, &id)?;
    info!(resource_type, %id, removed, "atomic entry reset");
    Ok(removed)
  }

  /// Forget every record and stop all polling.
  pub fn reset_records(&self) -> Result<()> {
    self.shared.polling.stop_all();
    self.shared.records.remove_all()?;
    info!("record table reset");
    Ok(())
  }

  /// Forget one record and stop its polling. Returns whether it existed.
  pub fn reset_record(&self, cache_key: &str) -> Result<bool> {
    self.shared.polling.stop(cache_key);
    let removed = self.shared.records.remove(cache_key)?;
    debug!(cache_key, removed, "record reset");
    Ok(removed)
  }

  pub fn polling_frequency_ms(&self, cache_key: &str) -> Option<u64> {
    self.shared.polling.frequency_ms(cache_key)
  }

  /// Point-in-time dump of both tables.
  pub fn debug(&self) -> Result<DebugSnapshot> {
    let atomic = self.shared.atomic.entries()?.into_iter().collect();
    let records = self
      .records()
      .into_iter()
      .map(|record| (record.cache_key().to_string(), record.status()))
      .collect();
    Ok(DebugSnapshot { atomic, records })
  }
}

/// Contents of an engine, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
  pub atomic: BTreeMap<String, AtomicEntry>,
  pub records: BTreeMap<String, Status>,
}

/// Records under one path template.
pub struct ResourceService {
  engine: CacheEngine,
  path: String,
  variables: Variables,
}

impl ResourceService {
  /// Every entity the endpoint returns.
  pub fn all(&self, resource_type: &str, options: RequestOptions) -> Result<Resource, ConfigurationError> {
    self.engine.get_or_create(
      &self.path,
      self.variables.clone(),
      DataDescriptor::AllOfType,
      resource_type,
      options,
    )
  }

  /// One entity, identified by the variable named after the engine's id key.
  pub fn one(&self, resource_type: &str, options: RequestOptions) -> Result<Resource, ConfigurationError> {
    let id_key = &self.engine.config().id_key;
    let value = self
      .variables
      .get(id_key)
      .ok_or_else(|| ConfigurationError::MissingIdentifier(id_key.clone()))?;
    let id = ResourceId::from_value(value).ok_or_else(|| ConfigurationError::InvalidVariable {
      name: id_key.clone(),
      value: value.clone(),
    })?;

    self.engine.get_or_create(
      &self.path,
      self.variables.clone(),
      DataDescriptor::Single { id },
      resource_type,
      options,
    )
  }

  /// A set of entities by id, sent as `collection_key[]` (default: the id
  /// key). Input order and duplicates do not affect identity.
  pub fn collection<I, T>(
    &self,
    resource_type: &str,
    ids: I,
    collection_key: Option<&str>,
    options: RequestOptions,
  ) -> Result<Resource, ConfigurationError>
  where
    I: IntoIterator<Item = T>,
    T: Into<ResourceId>,
  {
    let collection_key = collection_key.unwrap_or(&self.engine.config().id_key);
    self.engine.get_or_create(
      &self.path,
      self.variables.clone(),
      DataDescriptor::collection(ids, collection_key),
      resource_type,
      options,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::mock::MockTransport;
  use crate::transport::Method;
  use serde_json::json;

  const API: &str = "https://api.myservice.de";

  fn setup() -> (CacheEngine, MockTransport) {
    let transport = MockTransport::new();
    transport
      .respond(Method::Get, &format!("{API}/users/712"), json!({ "id": 712, "name": "Paul" }))
      .respond(Method::Get, &format!("{API}/users/42"), json!({ "id": 42, "name": "Helmut" }))
      .respond(Method::Get, &format!("{API}/cats/124"), json!({ "id": 124, "name": "Tom" }));
    let engine = CacheEngine::new(EngineConfig::default().with_base_path(API), transport.clone());
    (engine, transport)
  }

  fn user(engine: &CacheEngine, id: i64) -> Resource {
    engine
      .resource("/users/:id", Variables::from([("id", id)]))
      .one("users", RequestOptions::default())
      .unwrap()
  }

  #[test]
  fn test_identity_without_runtime() {
    let (engine, transport) = setup();

    let a = user(&engine, 712);
    let b = user(&engine, 712);
    assert!(Resource::ptr_eq(&a, &b));
    assert_eq!(a.status(), Status::Initialized);
    assert_eq!(transport.call_count(), 0);
  }

  #[test]
  fn test_collection_identity_ignores_order() {
    let (engine, _transport) = setup();
    let users = engine.resource("/users", Variables::new());

    let a = users
      .collection("users", vec![42, 712, 12, 712], None, RequestOptions::new().silent())
      .unwrap();
    let b = users
      .collection("users", vec![12, 42, 712], None, RequestOptions::new().silent())
      .unwrap();
    assert!(Resource::ptr_eq(&a, &b));
    assert_eq!(
      a.request().url,
      format!("{API}/users?id[]=12&id[]=42&id[]=712")
    );
  }

  #[test]
  fn test_configuration_errors() {
    let (engine, _transport) = setup();

    let err = engine
      .resource("/users/:id", Variables::new())
      .one("users", RequestOptions::default())
      .unwrap_err();
    assert_eq!(err, ConfigurationError::MissingIdentifier("id".to_string()));

    let err = engine
      .resource("/users", Variables::new())
      .all("", RequestOptions::default())
      .unwrap_err();
    assert_eq!(err, ConfigurationError::MissingResourceType);

    let err = engine
      .resource("/users", Variables::new())
      .all("users", RequestOptions::new().sideload("a", "b").nested("c", "d"))
      .unwrap_err();
    assert_eq!(err, ConfigurationError::ConflictingDependents);

    let err = engine
      .resource("/users", Variables::new())
      .collection("users", vec![1, 2], None, RequestOptions::new().param("id", 3))
      .unwrap_err();
    assert_eq!(err, ConfigurationError::CollectionKeyConflict("id".to_string()));
  }

  #[test]
  fn test_defaults_merged_into_request() {
    let transport = MockTransport::new();
    let config = EngineConfig::default()
      .with_base_path(format!("{API}/"))
      .with_default_header("auth_token", "secret")
      .with_default_param("lang", "de");
    let engine = CacheEngine::new(config, transport);

    let posts = engine
      .resource("/posts", Variables::new())
      .all("posts", RequestOptions::new().silent().param("page", 2))
      .unwrap();

    assert_eq!(posts.request().url, format!("{API}/posts?lang=de&page=2"));
    assert_eq!(posts.request().headers["auth_token"], "secret");
    assert_eq!(posts.request().body, None);
  }

  #[tokio::test]
  async fn test_reset_scoping() {
    let (engine, transport) = setup();

    let paul = user(&engine, 712);
    let tom = engine
      .resource("/cats/:id", Variables::from([("id", 124)]))
      .one("cats", RequestOptions::default())
      .unwrap();
    paul.settled().await;
    tom.settled().await;
    assert_eq!(transport.call_count(), 2);

    assert!(engine.reset("users", 712).unwrap());
    assert!(!engine.atomic().exists("users", &ResourceId::Int(712)).unwrap());
    assert!(engine.atomic().exists("cats", &ResourceId::Int(124)).unwrap());

    // The record keeps its last composed value.
    assert_eq!(paul.data()["name"], "Paul");

    paul.fetch(FetchOptions::default()).await.unwrap();
    tom.fetch(FetchOptions::default()).await.unwrap();
    assert_eq!(
      transport.urls().last(),
      Some(&format!("{API}/users/712"))
    );
    assert_eq!(transport.call_count(), 3);
  }

  #[tokio::test]
  async fn test_reset_type_and_all() {
    let (engine, _transport) = setup();
    user(&engine, 712).settled().await;
    user(&engine, 42).settled().await;

    assert_eq!(engine.reset_type("users").unwrap(), 2);
    assert!(engine.debug().unwrap().atomic.is_empty());

    user(&engine, 712).fetch(FetchOptions::default()).await.unwrap();
    engine.reset_all().unwrap();
    assert!(engine.debug().unwrap().atomic.is_empty());
  }

  #[tokio::test]
  async fn test_reset_record_creates_fresh_record() {
    let (engine, _transport) = setup();
    let first = user(&engine, 712);
    first.settled().await;

    assert!(engine.reset_record(first.cache_key()).unwrap());
    assert!(!engine.reset_record(first.cache_key()).unwrap());

    let second = user(&engine, 712);
    assert!(!Resource::ptr_eq(&first, &second));

    engine.reset_records().unwrap();
    assert!(engine.records().is_empty());
  }

  #[tokio::test]
  async fn test_debug_snapshot() {
    let (engine, _transport) = setup();
    user(&engine, 42).settled().await;

    let snapshot = engine.debug().unwrap();
    assert_eq!(snapshot.atomic["/users/42"].payload["name"], "Helmut");
    assert_eq!(snapshot.records["/users/42"], Status::Fetched);

    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["records"]["/users/42"], "fetched");
  }

  #[tokio::test]
  async fn test_records_observe_shared_entity() {
    let transport = MockTransport::new();
    transport
      .respond(Method::Get, "/users", json!([{ "id": 1, "name": "Ann" }]))
      .respond(Method::Get, "/users/1", json!({ "id": 1, "name": "Anne" }));
    let engine = CacheEngine::new(EngineConfig::default(), transport);

    let all = engine
      .resource("/users", Variables::new())
      .all("users", RequestOptions::default())
      .unwrap();
    all.settled().await;
    let mut rx = all.watch();
    rx.borrow_and_update();

    let one = engine
      .resource("/users/:id", Variables::from([("id", 1)]))
      .one("users", RequestOptions::new().silent())
      .unwrap();
    one.fetch(FetchOptions::force()).await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(all.data(), json!([{ "id": 1, "name": "Anne" }]));
  }

  #[tokio::test]
  async fn test_dropping_engine_stops_polling() {
    let (engine, _transport) = setup();
    let paul = user(&engine, 712);
    paul.settled().await;
    assert!(paul.start_polling(1000));

    drop(engine);
    assert!(!paul.is_polling());
    assert_eq!(
      paul.fetch(FetchOptions::default()).await.unwrap_err(),
      crate::error::ResourceError::EngineDropped
    );
  }
}
