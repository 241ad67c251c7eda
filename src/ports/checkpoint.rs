use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{path_component, write_atomic};
use crate::error::WorkflowError;
use crate::state_machine::TicketId;

/// A graph's suspended (or in-flight) position.
///
/// `payload` is opaque to everything except the graph that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ticket_id: TicketId,
    pub graph: String,
    pub stage: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Durable storage for checkpoints, keyed by `(ticket, graph)`.
///
/// Saving replaces any previous checkpoint for the same key.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(
        &self,
        ticket_id: &TicketId,
        graph: &str,
        stage: &str,
        payload: Vec<u8>,
    ) -> Result<(), WorkflowError>;

    /// `Ok(None)` when nothing is stored for the key.
    async fn load(
        &self,
        ticket_id: &TicketId,
        graph: &str,
    ) -> Result<Option<Checkpoint>, WorkflowError>;

    async fn delete(&self, ticket_id: &TicketId, graph: &str) -> Result<(), WorkflowError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<(TicketId, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        ticket_id: &TicketId,
        graph: &str,
        stage: &str,
        payload: Vec<u8>,
    ) -> Result<(), WorkflowError> {
        let checkpoint = Checkpoint {
            ticket_id: ticket_id.clone(),
            graph: graph.to_string(),
            stage: stage.to_string(),
            payload,
            created_at: Utc::now(),
        };
        self.checkpoints
            .write()
            .await
            .insert((ticket_id.clone(), graph.to_string()), checkpoint);
        Ok(())
    }

    async fn load(
        &self,
        ticket_id: &TicketId,
        graph: &str,
    ) -> Result<Option<Checkpoint>, WorkflowError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .get(&(ticket_id.clone(), graph.to_string()))
            .cloned())
    }

    async fn delete(&self, ticket_id: &TicketId, graph: &str) -> Result<(), WorkflowError> {
        self.checkpoints
            .write()
            .await
            .remove(&(ticket_id.clone(), graph.to_string()));
        Ok(())
    }
}

/// Stores each checkpoint as `<root>/<ticket>/<graph>.json`.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, ticket_id: &TicketId, graph: &str) -> Result<PathBuf, WorkflowError> {
        Ok(self
            .root
            .join(path_component(ticket_id.as_str())?)
            .join(format!("{}.json", path_component(graph)?)))
    }

    /// Delete checkpoints older than `ttl`. Returns how many were removed.
    ///
    /// Unreadable files are skipped and logged rather than deleted.
    pub async fn purge_expired(&self, ttl: Duration) -> Result<usize, WorkflowError> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(0);
        }

        let cutoff = Utc::now() - ttl;
        let mut removed = 0;
        let mut tickets = tokio::fs::read_dir(&self.root).await?;
        while let Some(ticket_dir) = tickets.next_entry().await? {
            if !ticket_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(ticket_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_checkpoint(&path).await {
                    Ok(checkpoint) if checkpoint.created_at < cutoff => {
                        tokio::fs::remove_file(&path).await?;
                        tracing::info!(
                            ticket_id = %checkpoint.ticket_id,
                            graph = %checkpoint.graph,
                            created_at = %checkpoint.created_at,
                            "purged expired checkpoint"
                        );
                        removed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                    }
                }
            }
        }
        Ok(removed)
    }
}

async fn read_checkpoint(path: &Path) -> Result<Checkpoint, WorkflowError> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(
        &self,
        ticket_id: &TicketId,
        graph: &str,
        stage: &str,
        payload: Vec<u8>,
    ) -> Result<(), WorkflowError> {
        let checkpoint = Checkpoint {
            ticket_id: ticket_id.clone(),
            graph: graph.to_string(),
            stage: stage.to_string(),
            payload,
            created_at: Utc::now(),
        };
        let data = serde_json::to_vec(&checkpoint)?;
        write_atomic(&self.path_for(ticket_id, graph)?, &data).await
    }

    async fn load(
        &self,
        ticket_id: &TicketId,
        graph: &str,
    ) -> Result<Option<Checkpoint>, WorkflowError> {
        let path = self.path_for(ticket_id, graph)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let checkpoint = read_checkpoint(&path).await?;
        if checkpoint.ticket_id != *ticket_id || checkpoint.graph != graph {
            return Err(WorkflowError::Store(format!(
                "{} holds the checkpoint of {}/{}, expected {ticket_id}/{graph}",
                path.display(),
                checkpoint.ticket_id,
                checkpoint.graph
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn delete(&self, ticket_id: &TicketId, graph: &str) -> Result<(), WorkflowError> {
        match tokio::fs::remove_file(self.path_for(ticket_id, graph)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
