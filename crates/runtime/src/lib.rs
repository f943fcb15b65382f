pub mod budget;
pub mod event_bus;
pub mod frame;
pub mod job;
pub mod metrics;
pub mod scheduler;
pub mod work_queue;

pub use event_bus::*;
pub use frame::*;
pub use job::*;
pub use scheduler::*;
