use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::TenantSettings;
use crate::error::WorkflowError;
use crate::message::WorkflowMessage;
use crate::state_machine::{TenantId, TicketId};

/// Scratchpad shared by the steps of one graph run.
///
/// Owned by the graph executing it and never persisted directly: the
/// graph snapshots it into its checkpoint payload and rebuilds it on resume.
#[derive(Debug, Clone)]
pub struct AgentContext {
    ticket_id: TicketId,
    tenant_id: TenantId,
    settings: TenantSettings,
    cancellation: CancellationToken,
    values: BTreeMap<String, Value>,
    effects: BTreeMap<String, WorkflowMessage>,
    revisions: BTreeMap<String, u32>,
    generation: u32,
}

/// The persisted part of an [`AgentContext`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: BTreeMap<String, Value>,
    /// Completion markers of side-effecting steps and the output each produced.
    pub effects: BTreeMap<String, WorkflowMessage>,
    pub revisions: BTreeMap<String, u32>,
    pub generation: u32,
}

impl AgentContext {
    pub fn new(ticket_id: TicketId, tenant_id: TenantId) -> Self {
        Self {
            ticket_id,
            tenant_id,
            settings: TenantSettings::default(),
            cancellation: CancellationToken::new(),
            values: BTreeMap::new(),
            effects: BTreeMap::new(),
            revisions: BTreeMap::new(),
            generation: 0,
        }
    }

    pub fn with_settings(mut self, settings: TenantSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn ticket_id(&self) -> &TicketId {
        &self.ticket_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn settings(&self) -> &TenantSettings {
        &self.settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), WorkflowError> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// `None` when the key is missing or holds a different shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Append to a list stored under `key`, creating it if needed.
    pub fn push<T: Serialize + DeserializeOwned>(&mut self, key: &str, item: T) -> Result<Vec<T>, WorkflowError> {
        let mut items: Vec<T> = self.get(key).unwrap_or_default();
        items.push(item);
        self.insert(key, &items)?;
        Ok(items)
    }

    pub fn revisions(&self, key: &str) -> u32 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn bump_revision(&mut self, key: &str) -> u32 {
        let count = self.revisions.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Number of external inputs applied so far in this graph.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn advance_generation(&mut self) {
        self.generation += 1;
    }

    pub(crate) fn effect(&self, marker: &str) -> Option<&WorkflowMessage> {
        self.effects.get(marker)
    }

    pub(crate) fn record_effect(&mut self, marker: String, output: WorkflowMessage) {
        self.effects.insert(marker, output);
    }

    pub fn completed_effects(&self) -> impl Iterator<Item = &str> {
        self.effects.keys().map(String::as_str)
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            values: self.values.clone(),
            effects: self.effects.clone(),
            revisions: self.revisions.clone(),
            generation: self.generation,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: ContextSnapshot) {
        self.values = snapshot.values;
        self.effects = snapshot.effects;
        self.revisions = snapshot.revisions;
        self.generation = snapshot.generation;
    }
}

/// Completion marker for a side-effecting step in a given generation.
pub(crate) fn effect_marker(step: &str, generation: u32) -> String {
    format!("{step}@{generation}")
}
