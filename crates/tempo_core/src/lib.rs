//! Storage-agnostic building blocks for as-of queries: time dimensions,
//! instants and intervals, coordinate maps and entity declarations.

pub mod coords;
pub mod error;
pub mod model_manifest;
pub mod schema;
pub mod time;
pub mod value;

pub use coords::*;
pub use error::{TempoError, TempoResult};
pub use model_manifest::*;
pub use schema::*;
pub use time::*;
pub use value::*;
