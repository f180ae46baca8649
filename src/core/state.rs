//! Content lifecycle tracking.
//!
//! Every content item owns an append-only history of [`StateRecord`]s; its current
//! state is the last record. Transitions are validated against a fixed table and
//! ERROR requests are subject to a retry budget: once an item already holds
//! `max_retries` ERROR records, a further ERROR request is recorded as DELETED.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::config::{StateConfig, StateStoreKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentState {
    New,
    InProgress,
    Complete,
    Error,
    Deleted,
}

impl ContentState {
    pub fn allowed_transitions(self) -> &'static [ContentState] {
        use ContentState::*;
        match self {
            New => &[InProgress, Error, Deleted],
            InProgress => &[Complete, Error, Deleted],
            Error => &[InProgress, Deleted],
            Complete => &[Deleted],
            Deleted => &[],
        }
    }

    pub fn can_transition_to(self, next: ContentState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentState::New => "NEW",
            ContentState::InProgress => "IN_PROGRESS",
            ContentState::Complete => "COMPLETE",
            ContentState::Error => "ERROR",
            ContentState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: ContentState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StateRecord {
    fn now(state: ContentState, error_message: Option<&str>) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            error_message: error_message.map(str::to_string),
        }
    }
}

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("content {0} has not been initialized")]
    NotInitialized(String),
    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ContentState,
        to: ContentState,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What a successful `transition_state` call actually recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The requested state was appended as-is.
    Recorded(ContentState),
    /// An ERROR request hit the retry budget and DELETED was recorded instead.
    AutoTerminated { error_count: usize },
}

impl TransitionOutcome {
    pub fn state(self) -> ContentState {
        match self {
            TransitionOutcome::Recorded(state) => state,
            TransitionOutcome::AutoTerminated { .. } => ContentState::Deleted,
        }
    }

    pub fn is_auto_terminated(self) -> bool {
        matches!(self, TransitionOutcome::AutoTerminated { .. })
    }
}

/// Backing store for state histories. Only [`ContentStateMachine`] writes to it.
pub trait StateStore: Send {
    /// Full history of `content_id`; empty when the id is unknown.
    fn history(&self, content_id: &str) -> Result<Vec<StateRecord>>;
    fn append(&mut self, content_id: &str, record: StateRecord) -> Result<()>;
    fn content_ids(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    histories: HashMap<String, Vec<StateRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn history(&self, content_id: &str) -> Result<Vec<StateRecord>> {
        Ok(self.histories.get(content_id).cloned().unwrap_or_default())
    }

    fn append(&mut self, content_id: &str, record: StateRecord) -> Result<()> {
        self.histories
            .entry(content_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    fn content_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.histories.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Keeps every history in a single pretty-printed JSON file, rewritten on each append.
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    histories: BTreeMap<String, Vec<StateRecord>>,
}

impl JsonFileStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let histories = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, histories })
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&self.histories)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write state file {}", self.path.display()))?;
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn history(&self, content_id: &str) -> Result<Vec<StateRecord>> {
        Ok(self.histories.get(content_id).cloned().unwrap_or_default())
    }

    fn append(&mut self, content_id: &str, record: StateRecord) -> Result<()> {
        self.histories
            .entry(content_id.to_string())
            .or_default()
            .push(record);
        if let Err(e) = self.save() {
            if let Some(history) = self.histories.get_mut(content_id) {
                history.pop();
                if history.is_empty() {
                    self.histories.remove(content_id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn content_ids(&self) -> Result<Vec<String>> {
        Ok(self.histories.keys().cloned().collect())
    }
}

/// Validates and records lifecycle transitions.
///
/// The store sits behind one lock that is held for the whole read-check-append
/// sequence, so concurrent ERROR requests for the same id always observe each
/// other's records.
pub struct ContentStateMachine {
    store: Mutex<Box<dyn StateStore>>,
    max_retries: usize,
}

impl ContentStateMachine {
    pub fn new(store: Box<dyn StateStore>, max_retries: usize) -> Self {
        Self {
            store: Mutex::new(store),
            max_retries,
        }
    }

    pub fn in_memory(max_retries: usize) -> Self {
        Self::new(Box::new(InMemoryStateStore::new()), max_retries)
    }

    pub fn from_config(config: &StateConfig) -> Result<Self> {
        let store: Box<dyn StateStore> = match config.store {
            StateStoreKind::Memory => Box::new(InMemoryStateStore::new()),
            StateStoreKind::Json => Box::new(JsonFileStateStore::open(&config.path)?),
        };
        Ok(Self::new(store, config.max_retries))
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Records NEW for an unknown id. Initializing an existing id is a logged no-op.
    pub fn initialize_content(&self, content_id: &str) -> Result<(), StateTransitionError> {
        let mut store = self.store.lock();
        if !store.history(content_id)?.is_empty() {
            warn!("Content {} is already initialized", content_id);
            return Ok(());
        }

        store.append(content_id, StateRecord::now(ContentState::New, None))?;
        info!("Content {} initialized as {}", content_id, ContentState::New);
        Ok(())
    }

    /// Current state, or `None` when the id was never initialized.
    pub fn current_state(&self, content_id: &str) -> Result<Option<ContentState>> {
        let store = self.store.lock();
        Ok(store.history(content_id)?.last().map(|r| r.state))
    }

    pub fn state_history(&self, content_id: &str) -> Result<Vec<StateRecord>> {
        self.store.lock().history(content_id)
    }

    pub fn content_ids(&self) -> Result<Vec<String>> {
        self.store.lock().content_ids()
    }

    pub fn transition_state(
        &self,
        content_id: &str,
        new_state: ContentState,
        error_message: Option<&str>,
    ) -> Result<TransitionOutcome, StateTransitionError> {
        let mut store = self.store.lock();
        let history = store.history(content_id)?;
        let current = history
            .last()
            .map(|r| r.state)
            .ok_or_else(|| StateTransitionError::NotInitialized(content_id.to_string()))?;

        if !current.can_transition_to(new_state) {
            return Err(StateTransitionError::InvalidTransition {
                id: content_id.to_string(),
                from: current,
                to: new_state,
            });
        }

        let mut outcome = TransitionOutcome::Recorded(new_state);
        if new_state == ContentState::Error {
            let error_count = history
                .iter()
                .filter(|r| r.state == ContentState::Error)
                .count();
            if error_count >= self.max_retries {
                error!(
                    "Content {} exceeded the retry budget ({} errors), marking as {}",
                    content_id,
                    error_count,
                    ContentState::Deleted
                );
                outcome = TransitionOutcome::AutoTerminated { error_count };
            }
        }

        store.append(content_id, StateRecord::now(outcome.state(), error_message))?;
        info!("Content {} moved {} -> {}", content_id, current, outcome.state());
        Ok(outcome)
    }
}
