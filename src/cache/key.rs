//! Cache key resolution.
//!
//! A [`ResourcePointer`] turns a path template, its variable bindings and a
//! [`DataDescriptor`] into the resolved resource path and the cache key that
//! identifies exactly one resource record.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;

/// Entity identifier.
///
/// Ordering is numeric for integers and lexicographic for strings; integers
/// sort before strings. Synthetic ids are assigned to payloads without one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceId {
  Int(i64),
  Str(String),
  Synthetic(u64),
}

impl ResourceId {
  /// Read an id from a payload value. Only integers and strings qualify.
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::Number(n) => n.as_i64().map(ResourceId::Int),
      Value::String(s) => Some(ResourceId::Str(s.clone())),
      _ => None,
    }
  }

  pub fn is_synthetic(&self) -> bool {
    matches!(self, ResourceId::Synthetic(_))
  }
}

// Plain ids serialize as the JSON scalar they came from; synthetic ids as
// `{"synthetic": n}` so they survive a round trip through storage.
impl Serialize for ResourceId {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      ResourceId::Int(i) => serializer.serialize_i64(*i),
      ResourceId::Str(s) => serializer.serialize_str(s),
      ResourceId::Synthetic(n) => {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("synthetic", n)?;
        map.end()
      }
    }
  }
}

impl<'de> Deserialize<'de> for ResourceId {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if let Some(n) = value.get("synthetic").and_then(Value::as_u64) {
      return Ok(ResourceId::Synthetic(n));
    }
    ResourceId::from_value(&value)
      .ok_or_else(|| serde::de::Error::custom(format!("invalid resource id: {}", value)))
  }
}

impl fmt::Display for ResourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResourceId::Int(i) => write!(f, "{}", i),
      ResourceId::Str(s) => f.write_str(s),
      ResourceId::Synthetic(n) => write!(f, "~{}", n),
    }
  }
}

impl From<i64> for ResourceId {
  fn from(id: i64) -> Self {
    ResourceId::Int(id)
  }
}

impl From<i32> for ResourceId {
  fn from(id: i32) -> Self {
    ResourceId::Int(id.into())
  }
}

impl From<u32> for ResourceId {
  fn from(id: u32) -> Self {
    ResourceId::Int(id.into())
  }
}

impl From<&str> for ResourceId {
  fn from(id: &str) -> Self {
    ResourceId::Str(id.to_string())
  }
}

impl From<String> for ResourceId {
  fn from(id: String) -> Self {
    ResourceId::Str(id)
  }
}

/// Bindings for `:name` tokens in a path template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variables(BTreeMap<String, Value>);

impl Variables {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(name.into(), value.into());
    self
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(name.into(), value.into());
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.0.get(name)
  }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Variables {
  fn from(pairs: [(K, V); N]) -> Self {
    Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }
}

/// What part of a resource type a pointer addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataDescriptor {
  /// Every entity the endpoint returns
  AllOfType,
  /// One entity by id
  Single { id: ResourceId },
  /// A set of ids, sent as the `collection_key` query parameter
  Collection {
    ids: Vec<ResourceId>,
    collection_key: String,
  },
}

impl DataDescriptor {
  /// Build a collection descriptor. Ids are deduplicated and sorted so that
  /// input order never affects identity.
  pub fn collection<I, T>(ids: I, collection_key: impl Into<String>) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<ResourceId>,
  {
    let mut ids: Vec<ResourceId> = ids.into_iter().map(Into::into).collect();
    ids.sort();
    ids.dedup();
    DataDescriptor::Collection {
      ids,
      collection_key: collection_key.into(),
    }
  }

  pub fn is_single(&self) -> bool {
    matches!(self, DataDescriptor::Single { .. })
  }
}

/// Resolved identity of a resource record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePointer {
  path_template: String,
  variables: Variables,
  descriptor: DataDescriptor,
  resource_path: String,
  cache_key: String,
}

impl ResourcePointer {
  pub fn resolve(
    path_template: &str,
    variables: Variables,
    descriptor: DataDescriptor,
  ) -> Result<Self, ConfigurationError> {
    let resource_path = substitute(path_template, &variables)?;

    let cache_key = match &descriptor {
      DataDescriptor::Collection {
        ids,
        collection_key,
      } => format!("{}?{}={}", resource_path, collection_key, hash_ids(ids)),
      _ => resource_path.clone(),
    };

    Ok(Self {
      path_template: path_template.to_string(),
      variables,
      descriptor,
      resource_path,
      cache_key,
    })
  }

  /// Pointer to one normalized entity: `/<type>/<id>`.
  pub fn atomic(resource_type: &str, id: &ResourceId) -> Self {
    let resource_path = format!("/{}/{}", resource_type.trim_matches('/'), id);
    Self {
      path_template: format!("{}/:id", resource_type),
      variables: Variables::new().with("id", id.to_string()),
      descriptor: DataDescriptor::Single { id: id.clone() },
      cache_key: resource_path.clone(),
      resource_path,
    }
  }

  pub fn path_template(&self) -> &str {
    &self.path_template
  }

  pub fn variables(&self) -> &Variables {
    &self.variables
  }

  pub fn descriptor(&self) -> &DataDescriptor {
    &self.descriptor
  }

  pub fn resource_path(&self) -> &str {
    &self.resource_path
  }

  pub fn cache_key(&self) -> &str {
    &self.cache_key
  }

  /// Canonical ids of a collection pointer.
  pub fn collection_ids(&self) -> Option<&[ResourceId]> {
    match &self.descriptor {
      DataDescriptor::Collection { ids, .. } => Some(ids),
      _ => None,
    }
  }

  /// Full request URL. `ids` narrows the collection parameter; `None` sends
  /// the whole canonical collection. Fails when a query parameter shadows
  /// the collection key.
  pub fn url(
    &self,
    base_path: &str,
    params: &BTreeMap<String, Value>,
    ids: Option<&[ResourceId]>,
  ) -> Result<String, ConfigurationError> {
    if let DataDescriptor::Collection { collection_key, .. } = &self.descriptor {
      if params.contains_key(collection_key) {
        return Err(ConfigurationError::CollectionKeyConflict(
          collection_key.clone(),
        ));
      }
    }
    Ok(self.build_url(base_path, params, ids))
  }

  /// URL without the collection-key check; callers validated it when the
  /// record was created.
  pub(crate) fn build_url(
    &self,
    base_path: &str,
    params: &BTreeMap<String, Value>,
    ids: Option<&[ResourceId]>,
  ) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();

    if let DataDescriptor::Collection {
      ids: all_ids,
      collection_key,
    } = &self.descriptor
    {
      let key = format!("{}[]", encode(collection_key));
      for id in ids.unwrap_or(all_ids) {
        pairs.push((key.clone(), encode(&id.to_string())));
      }
    }

    for (name, value) in params {
      match value {
        Value::Array(items) => {
          let key = format!("{}[]", encode(name));
          for item in items {
            pairs.push((key.clone(), encode(&scalar_to_string(item))));
          }
        }
        other => pairs.push((encode(name), encode(&scalar_to_string(other)))),
      }
    }

    let query = pairs
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");

    let base = base_path.strip_suffix('/').unwrap_or(base_path);
    if query.is_empty() {
      format!("{}{}", base, self.resource_path)
    } else {
      format!("{}{}?{}", base, self.resource_path, query)
    }
  }
}

/// Replace `:name` tokens with their bindings and make the path absolute.
/// `\:` produces a literal colon.
fn substitute(template: &str, variables: &Variables) -> Result<String, ConfigurationError> {
  if template.trim().is_empty() {
    return Err(ConfigurationError::EmptyPath);
  }

  let mut path = String::with_capacity(template.len());
  let mut chars = template.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '\\' if chars.peek() == Some(&':') => {
        chars.next();
        path.push(':');
      }
      ':' => {
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
          if next.is_ascii_alphanumeric() || next == '_' {
            name.push(next);
            chars.next();
          } else {
            break;
          }
        }
        if name.is_empty() {
          path.push(':');
          continue;
        }
        let value = variables
          .get(&name)
          .ok_or_else(|| ConfigurationError::MissingVariable(name.clone()))?;
        match value {
          Value::String(_) | Value::Number(_) | Value::Bool(_) => {
            path.push_str(&scalar_to_string(value))
          }
          other => {
            return Err(ConfigurationError::InvalidVariable {
              name,
              value: other.clone(),
            })
          }
        }
      }
      other => path.push(other),
    }
  }

  if !path.starts_with('/') {
    path.insert(0, '/');
  }

  Ok(path)
}

/// Fixed-length digest of a canonical id list.
fn hash_ids(ids: &[ResourceId]) -> String {
  let joined = ids
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join(".");

  let mut hasher = Sha256::new();
  hasher.update(joined.as_bytes());
  let digest = hasher.finalize();
  hex::encode(&digest[..8])
}

fn scalar_to_string(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

fn encode(s: &str) -> String {
  url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
