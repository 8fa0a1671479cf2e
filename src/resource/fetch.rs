//! The fetch path of a resource record.
//!
//! 1. Optimize the nominal request against the atomic store
//! 2. If nothing is missing, compose from cache without touching the network
//! 3. Otherwise issue the (narrowed) request
//! 4. Normalize the response, run sideload or nested expansion
//! 5. Recompose the record and advance its status

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::dependent;
use super::optimize::{optimize, Plan};
use super::record::{Composed, Resource};
use crate::cache::DataDescriptor;
use crate::engine::CacheEngine;
use crate::error::ResourceError;

/// Knobs for a single fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  /// Always go to the network, even when the cache could answer
  pub skip_optimization: bool,
  /// Keep the response on this record only, without normalizing it
  pub skip_caching: bool,
}

impl FetchOptions {
  /// Force a network round trip.
  pub fn force() -> Self {
    Self {
      skip_optimization: true,
      skip_caching: false,
    }
  }
}

impl Resource {
  /// Fill the record from cache or network.
  ///
  /// Resolves with this record once it is `Fetched`, or with the error that
  /// moved it to `Error`. Stale data stays visible while loading. When a
  /// newer fetch was issued before this one finished, the response still
  /// refreshes the atomic store but leaves the record to the newer fetch.
  pub fn fetch(&self, options: FetchOptions) -> BoxFuture<'static, Result<Resource, ResourceError>> {
    let resource = self.clone();
    async move { resource.run_fetch(options).await }.boxed()
  }

  async fn run_fetch(self, options: FetchOptions) -> Result<Resource, ResourceError> {
    let engine = self
      .engine()
      .map(CacheEngine::from_shared)
      .ok_or(ResourceError::EngineDropped)?;
    let generation = self.begin();

    match self.resolve(&engine, generation, options).await {
      Ok((composed, requested)) => {
        let touched: HashSet<String> = composed.iter().filter_map(|c| c.key.clone()).collect();
        if self.complete(generation, composed, requested) {
          debug!(cache_key = %self.cache_key(), requested, "fetched");
        }
        engine.notify_composers(&touched, Some(&self));
        Ok(self)
      }
      Err(errors) => {
        let first = errors
          .first()
          .cloned()
          .unwrap_or(ResourceError::Malformed("fetch failed without an error".to_string()));
        for error in &errors {
          warn!(cache_key = %self.cache_key(), %error, "fetch failed");
        }
        self.fail(generation, errors);
        Err(first)
      }
    }
  }

  /// Produce the composed entities for this fetch, and whether the network
  /// was involved.
  async fn resolve(
    &self,
    engine: &CacheEngine,
    generation: u64,
    options: FetchOptions,
  ) -> Result<(Vec<Composed>, bool), Vec<ResourceError>> {
    let shared = engine.shared();
    let plan = if options.skip_optimization {
      Plan::network(self.request().clone())
    } else {
      optimize(self, &shared.atomic, shared.config.base())
        .map_err(|e| vec![ResourceError::storage(e)])?
    };

    let (composed, requested) = match plan.request {
      None => (plan.cached, false),
      Some(request) => {
        self.set_loading(generation);
        info!(method = %request.method, url = %request.url, "requesting");

        let response = shared
          .transport
          .execute(request)
          .await
          .map_err(|e| vec![ResourceError::from(e)])?;

        let fetched = self
          .absorb(engine, &response.body, options.skip_caching)
          .map_err(|e| vec![e])?;
        (self.assemble(plan.cached, fetched), true)
      }
    };

    let nested = &self.options().nested;
    if !nested.is_empty() {
      let primaries: Vec<Value> = composed.iter().map(|c| c.value.clone()).collect();
      dependent::fetch_nested(engine, nested, &primaries).await?;
    }

    Ok((composed, requested))
  }

  /// Normalize a response body into the atomic store and return the
  /// primary entities.
  pub(crate) fn absorb(
    &self,
    engine: &CacheEngine,
    body: &Value,
    skip_caching: bool,
  ) -> Result<Vec<Composed>, ResourceError> {
    let shared = engine.shared();
    let id_key = &shared.config.id_key;
    let data_key = self.options().data_key.as_deref();
    let primary = dependent::unwrap_envelope(body, data_key)?;

    if skip_caching {
      return dependent::uncached(id_key, &primary);
    }

    let composed = dependent::normalize(&shared.atomic, self.resource_type(), id_key, &primary)?;

    let sideload = &self.options().sideload;
    if !sideload.is_empty() {
      let touched = dependent::sideload(&shared.atomic, id_key, sideload, body, data_key)?;
      let touched: HashSet<String> = touched.into_iter().collect();
      engine.notify_composers(&touched, Some(self));
    }

    Ok(composed)
  }

  /// Merge cached and freshly fetched entities.
  ///
  /// Collections follow the canonical (sorted) id order; ids the server did
  /// not return are left out. Everything else keeps response order.
  ///
  /// Ids match by their rendered form, the same way atomic keys and request
  /// URLs see them, so `"712"` requested and `712` returned are one entity.
  fn assemble(&self, cached: Vec<Composed>, fetched: Vec<Composed>) -> Vec<Composed> {
    match self.pointer().descriptor() {
      DataDescriptor::Collection { ids, .. } => {
        let mut pool: Vec<Composed> = fetched.into_iter().chain(cached).collect();
        let mut ordered = Vec::with_capacity(ids.len());
        for id in ids {
          let wanted = id.to_string();
          let found = pool
            .iter()
            .position(|c| c.id.as_ref().is_some_and(|have| have.to_string() == wanted));
          if let Some(pos) = found {
            ordered.push(pool.swap_remove(pos));
          }
        }
        ordered
      }
      _ => {
        let mut composed = cached;
        composed.extend(fetched);
        composed
      }
    }
  }
}
