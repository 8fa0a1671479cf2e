//! Request optimization.
//!
//! Compares a record's nominal request with the atomic store and decides
//! whether the network is needed at all, and if so for which ids.

use color_eyre::Result;
use tracing::debug;

use super::record::{Composed, Resource, Status};
use crate::cache::{AtomicStore, DataDescriptor, ResourceId};
use crate::transport::TransportRequest;

/// Outcome of optimizing one fetch.
#[derive(Debug)]
pub(crate) struct Plan {
  /// Request to issue; `None` when the cache already holds everything
  pub request: Option<TransportRequest>,
  /// Entities served from cache, in canonical order
  pub cached: Vec<Composed>,
}

impl Plan {
  pub(crate) fn network(request: TransportRequest) -> Self {
    Self {
      request: Some(request),
      cached: Vec::new(),
    }
  }

  pub(crate) fn is_network(&self) -> bool {
    self.request.is_some()
  }
}

pub(crate) fn optimize(resource: &Resource, atomic: &AtomicStore, base_path: &str) -> Result<Plan> {
  let resource_type = resource.resource_type();
  let nominal = resource.request();

  let plan = match resource.pointer().descriptor() {
    DataDescriptor::Single { id } => match atomic.get(resource_type, id)? {
      Some(entry) => Plan {
        request: None,
        cached: vec![Composed {
          id: Some(id.clone()),
          key: Some(AtomicStore::key(resource_type, id)),
          value: entry.payload,
        }],
      },
      None => Plan::network(nominal.clone()),
    },

    DataDescriptor::Collection { ids, .. } => {
      let uncached = atomic.find_uncached(resource_type, ids)?;
      let cached = cached_entries(atomic, resource_type, ids, &uncached)?;

      if uncached.is_empty() {
        Plan {
          request: None,
          cached,
        }
      } else {
        let mut request = nominal.clone();
        request.url = resource.pointer().build_url(
          base_path,
          &resource.options().params,
          Some(&uncached),
        );
        Plan {
          request: Some(request),
          cached,
        }
      }
    }

    // "All" has no identity-level cache: only a previous successful fetch of
    // this very record counts.
    DataDescriptor::AllOfType => {
      let state = resource.state();
      if state.status == Status::Fetched {
        Plan {
          request: None,
          cached: state.composed.clone(),
        }
      } else {
        Plan::network(nominal.clone())
      }
    }
  };

  debug!(
    cache_key = %resource.cache_key(),
    network = plan.is_network(),
    cached = plan.cached.len(),
    url = plan.request.as_ref().map(|r| r.url.as_str()).unwrap_or(""),
    "optimized request"
  );

  Ok(plan)
}

fn cached_entries(
  atomic: &AtomicStore,
  resource_type: &str,
  ids: &[ResourceId],
  uncached: &[ResourceId],
) -> Result<Vec<Composed>> {
  let mut cached = Vec::new();
  for id in ids.iter().filter(|id| !uncached.contains(id)) {
    // An entry reset between the two lookups is simply not composed.
    if let Some(entry) = atomic.get(resource_type, id)? {
      cached.push(Composed {
        id: Some(id.clone()),
        key: Some(AtomicStore::key(resource_type, id)),
        value: entry.payload,
      });
    }
  }
  Ok(cached)
}
