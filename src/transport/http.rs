use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use super::{Method, ResponseFormat, Transport, TransportRequest, TransportResponse};
use crate::error::TransportError;

/// Transport backed by a shared `reqwest` client.
///
/// Native clients carry no ambient browser credentials, so
/// `with_credentials` has nothing to toggle here. Authentication travels in
/// the default headers instead.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(
    client: reqwest::Client,
    request: TransportRequest,
  ) -> Result<TransportResponse, TransportError> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    // GET bodies are dropped; servers are free to reject them.
    if request.method != Method::Get {
      if let Some(body) = &request.body {
        builder = builder.json(body);
      }
    }

    debug!(method = %request.method, url = %request.url, "sending request");

    let response = builder.send().await.map_err(TransportError::network)?;
    let status = response.status();
    let text = response.text().await.map_err(TransportError::network)?;

    let body = match request.response_format {
      ResponseFormat::Json if text.trim().is_empty() => Value::Null,
      ResponseFormat::Json => serde_json::from_str(&text).unwrap_or(Value::String(text)),
      ResponseFormat::Text => Value::String(text),
    };

    if status.is_success() {
      Ok(TransportResponse {
        status: status.as_u16(),
        body,
      })
    } else {
      Err(TransportError::new(Some(status.as_u16()), body))
    }
  }
}

impl Transport for HttpTransport {
  fn execute(
    &self,
    request: TransportRequest,
  ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
    Self::send(self.client.clone(), request).boxed()
  }
}
