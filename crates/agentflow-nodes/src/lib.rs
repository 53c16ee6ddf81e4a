pub mod catalog;
pub mod handlers;
pub mod registry;
pub mod sandbox;

pub use catalog::builtin_catalog;
pub use registry::HandlerRegistry;
pub use sandbox::RhaiSandbox;
