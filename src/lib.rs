//! Orchestration core for tickets that move through AI-assisted refinement,
//! planning and implementation, pausing for human input along the way.

pub mod config;
pub mod error;
pub mod graph;
pub mod message;
pub mod orchestrator;
pub mod ports;
pub mod state_machine;
pub mod telemetry;

pub use config::{TenantSettings, TicketflowConfig};
pub use error::{StepFailure, WorkflowError};
pub use graph::{AgentContext, Graph, GraphExecutionResult, GraphSettings, GraphStatus};
pub use message::{AwaitingInput, ExternalInput, WorkflowMessage};
pub use orchestrator::{
    Collaborators, OrchestrationOutcome, OrchestrationResult, OrchestratorSettings, TicketStatus,
    WorkflowOrchestrator,
};
pub use state_machine::{Phase, StateMachine, TenantId, Ticket, TicketId, WorkflowState};
