pub mod color;
pub mod math;
pub mod token;

// Foundation crate: small, well-tested primitives only.
pub use color::*;
pub use token::*;
