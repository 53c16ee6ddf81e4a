pub mod executor;
pub mod resolver;
pub mod run_log;

pub use executor::FlowEngine;
pub use resolver::{resolve_order, unreachable_nodes};
pub use run_log::RunLogger;
