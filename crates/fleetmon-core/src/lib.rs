pub mod command;
pub mod job;

pub use command::{AgentCommand, CommandPayload, PayloadError};
pub use job::{JobRecord, JobStatus, QueueCounts, QueueState, RetryPolicy};
