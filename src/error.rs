//! Error types for the resource cache.
//!
//! Two families exist. `ConfigurationError` is a caller bug and is returned
//! synchronously at call time. `ResourceError` is a request failure: it is
//! appended to the owning record's error log and surfaces through
//! `Status::Error` while the record keeps its previous data.

use serde_json::Value;

use crate::transport::Method;

/// Invalid usage of the cache API. Never recorded on a resource.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
  #[error("path template is empty")]
  EmptyPath,

  #[error("resource type is missing")]
  MissingResourceType,

  #[error("no binding for path variable ':{0}'")]
  MissingVariable(String),

  #[error("path variable ':{name}' must be a string, number or bool, got {value}")]
  InvalidVariable { name: String, value: Value },

  #[error("identifier variable '{0}' is missing or not a valid id")]
  MissingIdentifier(String),

  #[error("collection key '{0}' already exists as a query parameter")]
  CollectionKeyConflict(String),

  #[error("sideload and nested cannot both be configured on one resource")]
  ConflictingDependents,

  #[error("method {0} is not allowed here")]
  InvalidMethod(Method),

  #[error("invalid request options: {0}")]
  InvalidOptions(String),
}

/// A failed physical request as reported by the transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("request failed{}: {body}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
pub struct TransportError {
  /// Protocol status code, if the request reached a server
  pub status: Option<u16>,
  /// Response body, or a description of the network failure
  pub body: Value,
}

impl TransportError {
  pub fn new(status: Option<u16>, body: impl Into<Value>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  /// A failure that never produced a response.
  pub fn network(message: impl std::fmt::Display) -> Self {
    Self::new(None, Value::String(message.to_string()))
  }
}

/// A failure recorded in a resource's error log.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceError {
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// A nested fetch for a related type failed. Reported on the primary
  /// resource even though the primary request itself succeeded.
  #[error("dependent fetch for '{resource_type}' failed: {source}")]
  Dependent {
    resource_type: String,
    source: Box<ResourceError>,
  },

  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("cache storage failure: {0}")]
  Storage(String),

  #[error("cache engine was dropped")]
  EngineDropped,
}

impl ResourceError {
  pub(crate) fn storage(err: color_eyre::Report) -> Self {
    Self::Storage(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_transport_error_display_with_status() {
    let err = TransportError::new(Some(404), json!({"message": "not found"}));
    assert_eq!(
      err.to_string(),
      r#"request failed with status 404: {"message":"not found"}"#
    );
  }

  #[test]
  fn test_transport_error_display_without_status() {
    let err = TransportError::network("connection refused");
    assert_eq!(err.to_string(), r#"request failed: "connection refused""#);
  }

  #[test]
  fn test_dependent_error_wraps_source() {
    let err = ResourceError::Dependent {
      resource_type: "city".to_string(),
      source: Box::new(TransportError::new(Some(500), json!("boom")).into()),
    };
    assert!(err.to_string().starts_with("dependent fetch for 'city' failed"));
  }
}
