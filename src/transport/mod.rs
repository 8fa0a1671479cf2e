//! Boundary to the network.
//!
//! The cache never talks HTTP itself. It hands a fully built
//! [`TransportRequest`] to a [`Transport`] and only looks at whether the
//! returned future succeeded.

mod http;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;
use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

pub use http::HttpTransport;

/// Request method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  /// Methods that change server state.
  pub fn is_write(self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Delete)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How the transport should interpret the response body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
  #[default]
  Json,
  /// Body is handed back as a JSON string
  Text,
}

/// A fully resolved physical request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
  pub method: Method,
  pub url: String,
  pub body: Option<Value>,
  pub headers: BTreeMap<String, String>,
  pub with_credentials: bool,
  pub response_format: ResponseFormat,
}

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
  pub status: u16,
  pub body: Value,
}

impl TransportResponse {
  pub fn ok(body: Value) -> Self {
    Self { status: 200, body }
  }
}

/// Executes physical requests on behalf of the cache.
///
/// Implementations resolve with the parsed body on success and reject with
/// a [`TransportError`] on any network or protocol failure.
pub trait Transport: Send + Sync {
  fn execute(
    &self,
    request: TransportRequest,
  ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}
