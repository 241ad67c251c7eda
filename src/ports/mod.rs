//! Contracts the orchestration core calls through, plus reference adapters.
//!
//! Real deployments plug their own database, tracker and agent runtime in
//! behind these traits. The in-memory adapters back the tests; the file
//! adapters back the CLI.

pub mod checkpoint;
pub mod events;
pub mod executor;
pub mod tickets;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use events::{EventPublisher, EventType, Metadata, PublishedEvent, RecordingEventPublisher, TracingEventPublisher};
pub use executor::AgentExecutor;
pub use tickets::{FileTicketRepository, MemoryTicketRepository, TicketRepository};

use std::path::{Path, PathBuf};

use crate::error::WorkflowError;

/// Write `data` next to `path` and rename it into place.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let mut file_name = path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    file_name.push(".tmp");
    tmp.set_file_name(file_name);
    tmp
}

/// Encode an identifier as a single path component.
///
/// The encoding is reversible, so distinct identifiers never share a file.
pub(crate) fn path_component(raw: &str) -> Result<String, WorkflowError> {
    let encoded = urlencoding::encode(raw);
    if encoded.is_empty() || encoded == "." || encoded == ".." {
        return Err(WorkflowError::InvalidKey(raw.to_string()));
    }
    Ok(encoded.into_owned())
}
