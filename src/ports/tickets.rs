use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{path_component, write_atomic};
use crate::error::WorkflowError;
use crate::state_machine::{Ticket, TicketId};

/// Persistence boundary for tickets. `save` must be atomic per ticket.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn load(&self, ticket_id: &TicketId) -> Result<Option<Ticket>, WorkflowError>;
    async fn save(&self, ticket: &Ticket) -> Result<(), WorkflowError>;
}

#[derive(Default)]
pub struct MemoryTicketRepository {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
}

impl MemoryTicketRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketRepository for MemoryTicketRepository {
    async fn load(&self, ticket_id: &TicketId) -> Result<Option<Ticket>, WorkflowError> {
        Ok(self.tickets.read().await.get(ticket_id).cloned())
    }

    async fn save(&self, ticket: &Ticket) -> Result<(), WorkflowError> {
        self.tickets
            .write()
            .await
            .insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }
}

/// Stores each ticket as `<root>/<ticket>.json`.
pub struct FileTicketRepository {
    root: PathBuf,
}

impl FileTicketRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, ticket_id: &TicketId) -> Result<PathBuf, WorkflowError> {
        Ok(self
            .root
            .join(format!("{}.json", path_component(ticket_id.as_str())?)))
    }
}

#[async_trait]
impl TicketRepository for FileTicketRepository {
    async fn load(&self, ticket_id: &TicketId) -> Result<Option<Ticket>, WorkflowError> {
        let path = self.path_for(ticket_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read(&path).await?;
        let ticket: Ticket = serde_json::from_slice(&data)?;
        if ticket.id != *ticket_id {
            return Err(WorkflowError::Store(format!(
                "{} holds ticket {}, expected {ticket_id}",
                path.display(),
                ticket.id
            )));
        }
        Ok(Some(ticket))
    }

    async fn save(&self, ticket: &Ticket) -> Result<(), WorkflowError> {
        let data = serde_json::to_vec_pretty(ticket)?;
        write_atomic(&self.path_for(&ticket.id)?, &data).await
    }
}
