use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigurationError;
use crate::transport::{Method, ResponseFormat, TransportRequest};

/// Default identifier field on entity payloads
pub const DEFAULT_ID_KEY: &str = "id";

/// Process-wide defaults shared by every request of one engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
  /// Prefix for every resource path (e.g. "https://api.example.com")
  #[serde(default)]
  pub base_path: String,
  /// Payload field holding an entity's id
  #[serde(default = "default_id_key")]
  pub id_key: String,
  /// Request body merged under every request's `data`
  #[serde(default)]
  pub default_data: Map<String, Value>,
  /// Query parameters merged under every request's `params`
  #[serde(default)]
  pub default_params: BTreeMap<String, Value>,
  /// Headers merged under every request's `headers`
  #[serde(default)]
  pub default_headers: BTreeMap<String, String>,
  /// Timeout for the HTTP transport
  #[serde(default = "default_timeout_ms")]
  pub request_timeout_ms: u64,
}

fn default_id_key() -> String {
  DEFAULT_ID_KEY.to_string()
}

fn default_timeout_ms() -> u64 {
  30_000
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      base_path: String::new(),
      id_key: default_id_key(),
      default_data: Map::new(),
      default_params: BTreeMap::new(),
      default_headers: BTreeMap::new(),
      request_timeout_ms: default_timeout_ms(),
    }
  }
}

impl EngineConfig {
  pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
    self.base_path = base_path.into();
    self
  }

  pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.default_headers.insert(name.into(), value.into());
    self
  }

  pub fn with_default_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.default_params.insert(name.into(), value.into());
    self
  }

  /// Base path without a trailing slash.
  pub fn base(&self) -> &str {
    self.base_path.strip_suffix('/').unwrap_or(&self.base_path)
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./wres.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/wres/config.yaml
  ///
  /// Without any file the defaults are used. `WRES_AUTH_TOKEN`, when set,
  /// becomes a bearer `Authorization` default header.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(token) = Self::get_auth_token() {
      config
        .default_headers
        .insert("Authorization".to_string(), format!("Bearer {}", token));
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("wres.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("wres").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  fn get_auth_token() -> Option<String> {
    std::env::var("WRES_AUTH_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

/// Per-resource request options.
///
/// Every field is optional in serialized form and falls back to the
/// documented default. Unknown fields are rejected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOptions {
  /// Request method (GET)
  pub method: Method,
  /// Request body, merged over the engine's default data
  pub data: Map<String, Value>,
  /// Query parameters, merged over the engine's default params
  pub params: BTreeMap<String, Value>,
  /// Headers, merged over the engine's default headers
  pub headers: BTreeMap<String, String>,
  /// Forwarded to the transport (false)
  pub with_credentials: bool,
  /// Forwarded to the transport (json)
  pub response_format: ResponseFormat,
  /// Do not fetch automatically when the resource is created (false)
  pub silent: bool,
  /// Re-fetch interval in milliseconds; 0 disables polling
  pub polling_interval_ms: u64,
  /// Embedded collections: response key -> resource type
  pub sideload: BTreeMap<String, String>,
  /// Foreign keys to follow: resource type -> payload field
  pub nested: BTreeMap<String, String>,
  /// Response envelope key to unwrap before normalizing
  pub data_key: Option<String>,
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parse options from a JSON object, rejecting unknown fields.
  pub fn from_value(value: Value) -> Result<Self, ConfigurationError> {
    serde_json::from_value(value).map_err(|e| ConfigurationError::InvalidOptions(e.to_string()))
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn data(mut self, data: Map<String, Value>) -> Self {
    self.data = data;
    self
  }

  pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn silent(mut self) -> Self {
    self.silent = true;
    self
  }

  pub fn polling_interval_ms(mut self, interval: u64) -> Self {
    self.polling_interval_ms = interval;
    self
  }

  pub fn sideload(mut self, local_key: impl Into<String>, resource_type: impl Into<String>) -> Self {
    self.sideload.insert(local_key.into(), resource_type.into());
    self
  }

  pub fn nested(mut self, resource_type: impl Into<String>, foreign_key: impl Into<String>) -> Self {
    self.nested.insert(resource_type.into(), foreign_key.into());
    self
  }

  pub fn data_key(mut self, key: impl Into<String>) -> Self {
    self.data_key = Some(key.into());
    self
  }

  pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
    if !self.sideload.is_empty() && !self.nested.is_empty() {
      return Err(ConfigurationError::ConflictingDependents);
    }
    Ok(())
  }

  /// Physical request for these options against `url`. Only writes carry
  /// a body.
  pub(crate) fn request(&self, url: String) -> TransportRequest {
    TransportRequest {
      method: self.method,
      url,
      body: self
        .method
        .is_write()
        .then(|| Value::Object(self.data.clone())),
      headers: self.headers.clone(),
      with_credentials: self.with_credentials,
      response_format: self.response_format,
    }
  }

  /// Merge the engine defaults underneath these options.
  pub(crate) fn merged_over(mut self, engine: &EngineConfig) -> Self {
    let mut data = engine.default_data.clone();
    data.extend(self.data);
    self.data = data;

    let mut params = engine.default_params.clone();
    params.extend(self.params);
    self.params = params;

    let mut headers = engine.default_headers.clone();
    headers.extend(self.headers);
    self.headers = headers;

    self
  }
}
