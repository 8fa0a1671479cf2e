//! Normalized, deduplicating cache for remotely fetched REST resources.
//!
//! Applications ask a [`CacheEngine`] for a record by path template,
//! variables and data descriptor. Every distinct identity maps to exactly one
//! shared [`Resource`]; entities from every response are normalized into an
//! atomic store, so later requests can be narrowed or skipped entirely.
//!
//! ```ignore
//! let engine = CacheEngine::http(EngineConfig::load(None)?)?;
//! let users = engine
//!   .resource("/users", Variables::new())
//!   .collection("users", [42, 712, 12], None, RequestOptions::default())?;
//! users.settled().await;
//! println!("{}", users.data());
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod manipulate;
mod polling;
pub mod resource;
pub mod transport;

pub use cache::{DataDescriptor, ResourceId, ResourcePointer, Variables};
pub use config::{EngineConfig, RequestOptions};
pub use engine::{CacheEngine, DebugSnapshot, ResourceService};
pub use error::{ConfigurationError, ResourceError, TransportError};
pub use manipulate::{Manipulation, ManipulationTarget};
pub use resource::{FetchOptions, RecordSnapshot, Resource, Status};
pub use transport::{HttpTransport, Method, ResponseFormat, Transport};
