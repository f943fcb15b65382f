pub mod bounds;
pub mod drawable2d;
pub mod drawable3d;
pub mod properties;
pub mod time_span;
pub mod transform;
pub mod vector_geometry;
pub mod visibility;

pub use bounds::*;
pub use drawable2d::*;
pub use drawable3d::*;
pub use properties::*;
pub use time_span::*;
pub use transform::*;
pub use vector_geometry::*;
pub use visibility::*;
