//! In-process transport for tests: canned responses keyed by method and URL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::{Method, Transport, TransportRequest, TransportResponse};
use crate::error::TransportError;

#[derive(Clone)]
struct Route {
  result: Result<Value, TransportError>,
  delay: Duration,
}

#[derive(Default)]
struct MockState {
  routes: HashMap<(Method, String), Vec<Route>>,
  calls: Vec<TransportRequest>,
}

/// Transport that answers from a routing table and records every call.
///
/// A route registered several times answers in registration order; the last
/// registration keeps answering once the queue is drained.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
  state: Arc<Mutex<MockState>>,
}

impl MockTransport {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn respond(&self, method: Method, url: &str, body: Value) -> &Self {
    self.push(method, url, Ok(body), Duration::ZERO)
  }

  pub(crate) fn respond_after(
    &self,
    method: Method,
    url: &str,
    body: Value,
    delay: Duration,
  ) -> &Self {
    self.push(method, url, Ok(body), delay)
  }

  pub(crate) fn fail(&self, method: Method, url: &str, status: u16, body: Value) -> &Self {
    self.push(
      method,
      url,
      Err(TransportError::new(Some(status), body)),
      Duration::ZERO,
    )
  }

  pub(crate) fn fail_after(
    &self,
    method: Method,
    url: &str,
    status: u16,
    body: Value,
    delay: Duration,
  ) -> &Self {
    self.push(
      method,
      url,
      Err(TransportError::new(Some(status), body)),
      delay,
    )
  }

  fn push(
    &self,
    method: Method,
    url: &str,
    result: Result<Value, TransportError>,
    delay: Duration,
  ) -> &Self {
    let mut state = self.state.lock().unwrap();
    state
      .routes
      .entry((method, url.to_string()))
      .or_default()
      .push(Route { result, delay });
    self
  }

  pub(crate) fn calls(&self) -> Vec<TransportRequest> {
    self.state.lock().unwrap().calls.clone()
  }

  pub(crate) fn urls(&self) -> Vec<String> {
    self.calls().into_iter().map(|c| c.url).collect()
  }

  pub(crate) fn call_count(&self) -> usize {
    self.state.lock().unwrap().calls.len()
  }
}

impl Transport for MockTransport {
  fn execute(
    &self,
    request: TransportRequest,
  ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
    let route = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(request.clone());
      match state.routes.get_mut(&(request.method, request.url.clone())) {
        Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
        Some(queue) => queue.first().cloned(),
        None => None,
      }
    };

    async move {
      let route = route.ok_or_else(|| {
        TransportError::new(
          Some(404),
          Value::String(format!("no route for {} {}", request.method, request.url)),
        )
      })?;
      if !route.delay.is_zero() {
        tokio::time::sleep(route.delay).await;
      }
      route.result.map(TransportResponse::ok)
    }
    .boxed()
  }
}
