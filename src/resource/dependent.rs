//! Normalization of responses and dependent fetches (sideload and nested).

use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::fetch::FetchOptions;
use super::record::Composed;
use crate::cache::{AtomicStore, ResourceId, Variables};
use crate::config::RequestOptions;
use crate::engine::CacheEngine;
use crate::error::ResourceError;

/// Unwrap the response envelope named by `data_key`.
pub(crate) fn unwrap_envelope(body: &Value, data_key: Option<&str>) -> Result<Value, ResourceError> {
  match data_key {
    None => Ok(body.clone()),
    Some(key) => body
      .get(key)
      .cloned()
      .ok_or_else(|| ResourceError::Malformed(format!("response has no '{}' envelope", key))),
  }
}

/// Split a payload into entity objects. `null` is an empty response.
pub(crate) fn entities(payload: &Value) -> Result<Vec<&serde_json::Map<String, Value>>, ResourceError> {
  match payload {
    Value::Null => Ok(Vec::new()),
    Value::Object(map) => Ok(vec![map]),
    Value::Array(items) => items
      .iter()
      .map(|item| {
        item
          .as_object()
          .ok_or_else(|| ResourceError::Malformed(format!("expected an entity object, got {}", item)))
      })
      .collect(),
    other => Err(ResourceError::Malformed(format!(
      "expected an entity or a list of entities, got {}",
      other
    ))),
  }
}

/// Store every entity of `payload` under `resource_type`, in response order.
pub(crate) fn normalize(
  atomic: &AtomicStore,
  resource_type: &str,
  id_key: &str,
  payload: &Value,
) -> Result<Vec<Composed>, ResourceError> {
  let mut composed = Vec::new();

  for entity in entities(payload)? {
    let id = entity
      .get(id_key)
      .and_then(ResourceId::from_value)
      .unwrap_or_else(|| atomic.synthetic_id());
    let value = Value::Object(entity.clone());
    let key = atomic
      .upsert(resource_type, &id, value.clone())
      .map_err(ResourceError::storage)?;
    composed.push(Composed {
      id: Some(id),
      key: Some(key),
      value,
    });
  }

  debug!(resource_type, count = composed.len(), "normalized entities");
  Ok(composed)
}

/// Wrap a payload's entities without touching the atomic store.
pub(crate) fn uncached(id_key: &str, payload: &Value) -> Result<Vec<Composed>, ResourceError> {
  Ok(
    entities(payload)?
      .into_iter()
      .map(|entity| Composed {
        id: entity.get(id_key).and_then(ResourceId::from_value),
        key: None,
        value: Value::Object(entity.clone()),
      })
      .collect(),
  )
}

/// Normalize collections embedded next to the primary payload.
///
/// Each `local_key` is looked up at the top of the response first, then one
/// level down inside the `data_key` envelope. Returns the atomic keys touched.
pub(crate) fn sideload(
  atomic: &AtomicStore,
  id_key: &str,
  sideload: &BTreeMap<String, String>,
  body: &Value,
  data_key: Option<&str>,
) -> Result<Vec<String>, ResourceError> {
  let envelope = data_key.and_then(|k| body.get(k)).filter(|v| v.is_object());
  let mut touched = Vec::new();

  for (local_key, resource_type) in sideload {
    let embedded = body
      .get(local_key)
      .or_else(|| envelope.and_then(|e| e.get(local_key)));

    match embedded {
      Some(payload) => {
        for composed in normalize(atomic, resource_type, id_key, payload)? {
          touched.extend(composed.key);
        }
      }
      None => debug!(local_key, resource_type, "sideload key absent from response"),
    }
  }

  Ok(touched)
}

/// Collect the canonical foreign-key ids per related type.
pub(crate) fn foreign_keys<'a>(
  nested: &BTreeMap<String, String>,
  primaries: impl IntoIterator<Item = &'a Value> + Clone,
) -> BTreeMap<String, BTreeSet<ResourceId>> {
  let mut related = BTreeMap::new();

  for (resource_type, field) in nested {
    let mut ids = BTreeSet::new();
    for primary in primaries.clone() {
      match primary.get(field) {
        Some(Value::Array(values)) => ids.extend(values.iter().filter_map(ResourceId::from_value)),
        Some(value) => ids.extend(ResourceId::from_value(value)),
        None => {}
      }
    }
    if !ids.is_empty() {
      related.insert(resource_type.clone(), ids);
    }
  }

  related
}

/// Fetch every related type referenced by the primary entities, in parallel.
///
/// One request per type: a single-entity request for one id, a collection
/// request otherwise. Each goes through the optimizer, so related entities
/// already cached cost nothing. All failures are returned.
pub(crate) async fn fetch_nested(
  engine: &CacheEngine,
  nested: &BTreeMap<String, String>,
  primaries: &[Value],
) -> Result<(), Vec<ResourceError>> {
  let related = foreign_keys(nested, primaries.iter());
  if related.is_empty() {
    return Ok(());
  }

  let id_key = engine.config().id_key.clone();
  let mut fetches = Vec::new();
  let mut errors = Vec::new();

  for (resource_type, ids) in related {
    let secondary = if ids.len() == 1 {
      let id = ids.into_iter().next().map(id_to_value).unwrap_or(Value::Null);
      engine
        .resource(
          &format!("/{}/:{}", resource_type, id_key),
          Variables::new().with(id_key.clone(), id),
        )
        .one(&resource_type, RequestOptions::new().silent())
    } else {
      engine
        .resource(&format!("/{}", resource_type), Variables::new())
        .collection(
          &resource_type,
          ids,
          Some(&id_key),
          RequestOptions::new().silent(),
        )
    };

    match secondary {
      Ok(record) => fetches.push(async move {
        record
          .fetch(FetchOptions::default())
          .await
          .map_err(|source| ResourceError::Dependent {
            resource_type,
            source: Box::new(source),
          })
      }),
      Err(e) => errors.push(ResourceError::Dependent {
        resource_type,
        source: Box::new(ResourceError::Malformed(e.to_string())),
      }),
    }
  }

  debug!(count = fetches.len(), "issuing nested fetches");

  for result in join_all(fetches).await {
    if let Err(e) = result {
      warn!(error = %e, "nested fetch failed");
      errors.push(e);
    }
  }

  if errors.is_empty() {
    Ok(())
  } else {
    Err(errors)
  }
}

fn id_to_value(id: ResourceId) -> Value {
  match id {
    ResourceId::Int(i) => Value::from(i),
    other => Value::String(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_unwrap_envelope() {
    let body = json!({ "data": [{ "id": 1 }], "meta": {} });
    assert_eq!(unwrap_envelope(&body, Some("data")).unwrap(), json!([{ "id": 1 }]));
    assert_eq!(unwrap_envelope(&body, None).unwrap(), body);
    assert!(matches!(
      unwrap_envelope(&body, Some("items")),
      Err(ResourceError::Malformed(_))
    ));
  }

  #[test]
  fn test_normalize_assigns_synthetic_ids() {
    let atomic = AtomicStore::default();
    let composed = normalize(
      &atomic,
      "notes",
      "id",
      &json!([{ "id": 3, "text": "a" }, { "text": "no id" }]),
    )
    .unwrap();

    assert_eq!(composed.len(), 2);
    assert_eq!(composed[0].id, Some(ResourceId::Int(3)));
    assert!(composed[1].id.as_ref().unwrap().is_synthetic());
    assert!(atomic.exists("notes", composed[1].id.as_ref().unwrap()).unwrap());
  }

  #[test]
  fn test_normalize_rejects_scalars() {
    let atomic = AtomicStore::default();
    assert!(matches!(
      normalize(&atomic, "notes", "id", &json!([1, 2])),
      Err(ResourceError::Malformed(_))
    ));
    assert!(matches!(
      normalize(&atomic, "notes", "id", &json!("text")),
      Err(ResourceError::Malformed(_))
    ));
    assert!(normalize(&atomic, "notes", "id", &Value::Null).unwrap().is_empty());
  }

  #[test]
  fn test_sideload_reads_top_level_and_envelope() {
    let atomic = AtomicStore::default();
    let body = json!({
      "continents": [{ "id": 1, "name": "Europe" }],
      "cities": [{ "id": 10, "name": "Berlin" }],
      "data": { "countries": [{ "id": 49, "name": "Germany" }] }
    });
    let map = BTreeMap::from([
      ("cities".to_string(), "city".to_string()),
      ("countries".to_string(), "country".to_string()),
    ]);

    let touched = sideload(&atomic, "id", &map, &body, Some("data")).unwrap();

    assert_eq!(touched.len(), 2);
    assert!(atomic.exists("city", &ResourceId::Int(10)).unwrap());
    assert!(atomic.exists("country", &ResourceId::Int(49)).unwrap());
  }

  #[test]
  fn test_foreign_keys_union_and_canonicalize() {
    let nested = BTreeMap::from([
      ("user".to_string(), "author_id".to_string()),
      ("tag".to_string(), "tag_ids".to_string()),
      ("city".to_string(), "city_id".to_string()),
    ]);
    let primaries = [
      json!({ "id": 1, "author_id": 7, "tag_ids": [3, 1] }),
      json!({ "id": 2, "author_id": 5, "tag_ids": [1, 2, 3] }),
      json!({ "id": 3, "author_id": 7 }),
    ];

    let related = foreign_keys(&nested, primaries.iter());

    assert_eq!(
      related["user"].iter().cloned().collect::<Vec<_>>(),
      vec![ResourceId::Int(5), ResourceId::Int(7)]
    );
    assert_eq!(related["tag"].len(), 3);
    assert!(!related.contains_key("city"));
  }
}
