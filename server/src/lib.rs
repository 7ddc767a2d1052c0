// FlowK server: HTTP + SSE adapter over the flow engine

pub mod errors;
pub mod server;
pub mod sse;
pub mod types;
pub mod upload;

pub use errors::{ServerError, ServerResult};
pub use server::{FlowServer, ServerState};
pub use types::{FlowSummary, RunRequest, StopAtRequest, TaskSummary};
