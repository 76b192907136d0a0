//! The agent execution pipeline: drives a model backend's stream and
//! turns it into the typed event sequence clients consume.

mod backend;
mod executor;
mod factory;
mod file_tracker;

pub use backend::AiMessageChunk;
pub use backend::ChunkStream;
pub use backend::ContentBlock;
pub use backend::InterruptDecisions;
pub use backend::InterruptRequest;
pub use backend::MessageChunk;
pub use backend::ModelBackend;
pub use backend::RunConfig;
pub use backend::StreamChunk;
pub use backend::StreamInput;
pub use backend::ToolMessage;
pub use backend::UpdateChunk;
pub use executor::AgentExecutor;
pub use factory::AgentConfig;
pub use factory::AgentFactory;
pub use file_tracker::FileOpRecord;
pub use file_tracker::FileOpTracker;
