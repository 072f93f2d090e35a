//! Allocator error taxonomy.
//!
//! Only conditions a well-behaved master can actually encounter are
//! represented here. Precondition violations (duplicate adds, unknown ids)
//! indicate a master bug and abort via panic instead, mirroring the
//! fail-fast contract of the engine's entry points.

use crate::ids::AgentId;

/// Result type for allocator operations.
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Errors surfaced to the master.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// Operations could not be applied to the agent's available resources,
    /// typically because an allocation cycle raced ahead of the request.
    /// No state was mutated.
    #[error("cannot update available resources on agent {agent}: {reason}")]
    OperationConflict { agent: AgentId, reason: String },

    /// The allocator task has shut down and the message was not delivered.
    #[error("allocator terminated")]
    Terminated,
}
