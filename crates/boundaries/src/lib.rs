pub mod feature;
pub mod ingest;
pub mod iso;
pub mod loader;

pub use feature::*;
pub use loader::{BoundaryError, BoundarySource, BoundaryStore, HttpBoundarySource, InlineBoundarySource};
