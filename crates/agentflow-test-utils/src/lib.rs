pub mod fixtures;
pub mod handlers;
pub mod mock_llm;

pub use fixtures::*;
pub use handlers::{EchoHandler, FailingHandler, SlowHandler};
pub use mock_llm::MockLlmClient;
