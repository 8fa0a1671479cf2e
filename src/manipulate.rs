//! Write path: optimistic local mutation followed by a write request.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{DataDescriptor, ResourceId, ResourcePointer, Variables};
use crate::config::RequestOptions;
use crate::engine::CacheEngine;
use crate::error::ConfigurationError;
use crate::resource::{FetchOptions, Resource};

type Mutation = Box<dyn FnOnce(&mut Value) + Send>;

/// The cached entity a write affects.
pub struct ManipulationTarget {
  resource_type: String,
  id: ResourceId,
  mutate: Option<Mutation>,
}

impl ManipulationTarget {
  pub fn new(resource_type: impl Into<String>, id: impl Into<ResourceId>) -> Self {
    Self {
      resource_type: resource_type.into(),
      id: id.into(),
      mutate: None,
    }
  }

  /// Edit applied to the cached payload before the request is sent.
  pub fn mutate(mut self, mutate: impl FnOnce(&mut Value) + Send + 'static) -> Self {
    self.mutate = Some(Box::new(mutate));
    self
  }
}

impl std::fmt::Debug for ManipulationTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ManipulationTarget")
      .field("resource_type", &self.resource_type)
      .field("id", &self.id)
      .field("mutate", &self.mutate.is_some())
      .finish()
  }
}

/// Outcome of a write: the write's own record, on success or failure.
pub type Manipulation = BoxFuture<'static, Result<Resource, Resource>>;

impl CacheEngine {
  /// Send a write request.
  ///
  /// When `target` names a cached entity, its mutation is applied to the
  /// atomic store right away, so every record composing it reflects the
  /// change before the request resolves. A failed write does not roll the
  /// mutation back. The response is normalized under the target type; with
  /// no target it stays on the returned record only.
  ///
  /// Inside a tokio runtime the request is sent even if the returned
  /// future is dropped. The returned record is not entered in the record
  /// table.
  pub fn manipulate(
    &self,
    path: &str,
    variables: Variables,
    options: RequestOptions,
    target: Option<ManipulationTarget>,
  ) -> Result<Manipulation, ConfigurationError> {
    if !options.method.is_write() {
      return Err(ConfigurationError::InvalidMethod(options.method));
    }
    options.validate()?;

    let config = self.config();
    let descriptor = match &target {
      Some(target) => DataDescriptor::Single {
        id: target.id.clone(),
      },
      None => DataDescriptor::AllOfType,
    };
    let pointer = ResourcePointer::resolve(path, variables, descriptor)?;
    let options = options.merged_over(config);
    let url = pointer.url(config.base(), &options.params, None)?;

    let resource_type = match &target {
      Some(target) if target.resource_type.trim().is_empty() => {
        return Err(ConfigurationError::MissingResourceType)
      }
      Some(target) => target.resource_type.clone(),
      None => pointer.resource_path().to_string(),
    };

    let skip_caching = target.is_none();
    if let Some(target) = target {
      self.apply_local(target);
    }

    let request = options.request(url);
    info!(method = %request.method, url = %request.url, "manipulating");
    let record = Resource::new(
      pointer,
      resource_type,
      options,
      request,
      Arc::downgrade(self.shared()),
    );

    let fetch = record.fetch(FetchOptions {
      skip_optimization: true,
      skip_caching,
    });

    // Under a runtime the write is in flight whether or not the caller
    // awaits it; otherwise it is sent on first poll.
    let outcome = match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let task = handle.spawn(fetch);
        async move {
          match task.await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Err(record),
            Err(e) => {
              warn!(error = %e, "write task did not complete");
              Err(record)
            }
          }
        }
        .boxed()
      }
      Err(_) => async move {
        match fetch.await {
          Ok(record) => Ok(record),
          Err(_) => Err(record),
        }
      }
      .boxed(),
    };
    Ok(outcome)
  }

  fn apply_local(&self, target: ManipulationTarget) {
    let ManipulationTarget {
      resource_type,
      id,
      mutate,
    } = target;
    let Some(mutate) = mutate else { return };

    let mut payload = match self.atomic().get(&resource_type, &id) {
      Ok(Some(entry)) => entry.payload,
      Ok(None) => {
        debug!(%resource_type, %id, "mutation target not cached, skipped");
        return;
      }
      Err(e) => {
        warn!(%resource_type, %id, error = %e, "mutation target unreadable, skipped");
        return;
      }
    };

    mutate(&mut payload);
    match self.atomic().upsert_local(&resource_type, &id, payload) {
      Ok(key) => {
        debug!(%key, "applied local mutation");
        self.notify_composers(&HashSet::from([key]), None);
      }
      Err(e) => warn!(%resource_type, %id, error = %e, "local mutation not stored"),
    }
  }
}
