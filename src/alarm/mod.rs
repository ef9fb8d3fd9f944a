pub mod fade;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod store;
