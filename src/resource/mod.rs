//! Resource records: the composite objects applications observe.

mod dependent;
mod fetch;
mod optimize;
mod record;

pub use fetch::FetchOptions;
pub use record::{RecordSnapshot, Resource, Status};
