//! The connection/session runtime: a bounded pool of live client
//! connections, each bound to one session with at most one active
//! execution task. Transports (WebSocket, SSE) sit on top of
//! [`SessionRuntime`] and [`ChatHandler`]; this crate never does its own
//! wire framing.

mod factory;
mod handler;
mod health;
mod hitl;
mod runtime;

pub use factory::AgentExecutorFactory;
pub use handler::ChatHandler;
pub use handler::ExecutorFactory;
pub use health::HealthStatus;
pub use health::ServerHealth;
pub use hitl::SessionHitlHandler;
pub use runtime::CAPACITY_CLOSE_CODE;
pub use runtime::ClientConnection;
pub use runtime::SessionRuntime;
pub use runtime::WaitOutcome;
