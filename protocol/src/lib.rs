//! Wire types shared between the agent runtime and its clients.
//!
//! This crate has no side effects beyond reading the system clock when an
//! event is stamped; everything here is plain data with serde
//! round-trippable representations.

mod events;
mod message;

pub use events::ActionRequest;
pub use events::DoneEvent;
pub use events::ErrorEvent;
pub use events::Event;
pub use events::EventDecodeError;
pub use events::EventMsg;
pub use events::FileOpMetrics;
pub use events::FileOperationEvent;
pub use events::HitlRequestEvent;
pub use events::RuleConflict;
pub use events::RulesAppliedEvent;
pub use events::TextEvent;
pub use events::TodoItem;
pub use events::TodoStatus;
pub use events::TodoUpdateEvent;
pub use events::TokenUsage;
pub use events::ToolCallEvent;
pub use events::ToolResultEvent;
pub use events::ToolStatus;
pub use events::TriggeredRule;
pub use events::unix_timestamp;
pub use message::ChatPayload;
pub use message::ClientEnvelope;
pub use message::Decision;
pub use message::DecisionKind;
pub use message::ErrorCode;
pub use message::HitlDecisionPayload;
pub use message::ServerEvent;
