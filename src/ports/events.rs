use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::WorkflowError;
use crate::state_machine::TicketId;

pub type Metadata = BTreeMap<String, String>;

/// Lifecycle events emitted for audit and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GraphStarted,
    GraphResumed,
    StageStarted,
    GraphSuspended,
    GraphCompleted,
    GraphFailed,
    StateChanged,
    PhaseChained,
    DuplicateInput,
    TicketCompleted,
    TicketFailed,
    TicketCancelled,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::GraphStarted => "graph_started",
            EventType::GraphResumed => "graph_resumed",
            EventType::StageStarted => "stage_started",
            EventType::GraphSuspended => "graph_suspended",
            EventType::GraphCompleted => "graph_completed",
            EventType::GraphFailed => "graph_failed",
            EventType::StateChanged => "state_changed",
            EventType::PhaseChained => "phase_chained",
            EventType::DuplicateInput => "duplicate_input",
            EventType::TicketCompleted => "ticket_completed",
            EventType::TicketFailed => "ticket_failed",
            EventType::TicketCancelled => "ticket_cancelled",
        };
        f.write_str(name)
    }
}

/// Fire-and-forget sink for lifecycle events.
///
/// Errors are reported back but callers in the core only log them.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        ticket_id: &TicketId,
        event: EventType,
        metadata: Metadata,
    ) -> Result<(), WorkflowError>;
}

/// Publish and swallow failures, which must never fail a workflow.
pub(crate) async fn publish_quietly(
    publisher: &dyn EventPublisher,
    ticket_id: &TicketId,
    event: EventType,
    metadata: Metadata,
) {
    if let Err(e) = publisher.publish(ticket_id, event, metadata).await {
        tracing::warn!(ticket_id = %ticket_id, %event, error = %e, "failed to publish workflow event");
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

#[async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(
        &self,
        ticket_id: &TicketId,
        event: EventType,
        metadata: Metadata,
    ) -> Result<(), WorkflowError> {
        let metadata = serde_json::to_string(&metadata)?;
        tracing::info!(target: "ticketflow::events", ticket_id = %ticket_id, %event, %metadata, "workflow event");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub ticket_id: TicketId,
    pub event: EventType,
    pub metadata: Metadata,
    pub at: DateTime<Utc>,
}

/// Keeps events in memory, in publish order.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: RwLock<Vec<PublishedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PublishedEvent> {
        self.events.read().await.clone()
    }

    pub async fn of_type(&self, event: EventType) -> Vec<PublishedEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        ticket_id: &TicketId,
        event: EventType,
        metadata: Metadata,
    ) -> Result<(), WorkflowError> {
        self.events.write().await.push(PublishedEvent {
            ticket_id: ticket_id.clone(),
            event,
            metadata,
            at: Utc::now(),
        });
        Ok(())
    }
}
