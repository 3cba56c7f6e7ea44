//! Workflow run state and definition documents.

mod definition;
mod types;

pub use definition::WorkflowDefinition;
pub use types::{
    condition_scope, deep_merge, StateChange, StateUpdate, WorkflowId, WorkflowState, WorkflowStatus,
};
