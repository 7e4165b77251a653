mod types;

pub use types::{AgentConfig, RetryConfig};
