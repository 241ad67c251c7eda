mod state;
mod ticket;

pub use state::{StateMachine, StatePartition, WorkflowState};
pub use ticket::{FailureInfo, Phase, TenantId, Ticket, TicketId, TicketSummary, WorkflowEvent};
