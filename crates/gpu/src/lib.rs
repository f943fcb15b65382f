pub mod context;
pub mod renderer;
pub mod render_graph;
pub mod pipeline;
pub mod buffers;
pub mod textures;

pub use context::*;
