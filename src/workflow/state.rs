//! Run State Persistence
//!
//! Per-run record of every node's status and produced values, keyed by the
//! node's path id within the run (e.g. `scatter-L3C5/2/decl-y`).
//!
//! The record is owned by one run and mutated only through its methods.
//! After every terminal transition the engine writes it to
//! `<run dir>/state.json`, replacing the previous file atomically:
//!
//! ```json
//! {
//!   "run_id": "20240101_120000_hello",
//!   "target": "hello",
//!   "nodes": {
//!     "decl-x": { "status": "done", "outputs": [["x", {"type": "int", "value": 1}]] }
//!   }
//! }
//! ```
//!
//! The file exists for inspection; a fresh run never reads it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::env::Bindings;
use crate::error::Result;
use crate::value::Value;

/// File name of the persisted state inside a run directory.
pub const STATE_FILE: &str = "state.json";

/// Lifecycle of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub status: NodeStatus,
    /// Names bound by the node, as seen in its enclosing scope
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<(String, Value)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    fn new(status: NodeStatus) -> Self {
        Self {
            status,
            outputs: Vec::new(),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Status of every node instance of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, NodeRecord>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            target: target.into(),
            started_at: now,
            updated_at: now,
            nodes: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&NodeRecord> {
        self.nodes.get(path)
    }

    pub fn status(&self, path: &str) -> Option<NodeStatus> {
        self.nodes.get(path).map(|r| r.status)
    }

    /// Adds a node as `Pending` unless it is already recorded.
    ///
    /// Returns false if the node was already known.
    pub fn register(&mut self, path: &str) -> bool {
        if self.nodes.contains_key(path) {
            return false;
        }
        let record = NodeRecord::new(NodeStatus::Pending);
        self.updated_at = record.updated_at;
        self.nodes.insert(path.to_string(), record);
        true
    }

    /// Moves a node to a non-terminal status. Terminal records are kept.
    ///
    /// Returns false if the node had already finished.
    pub fn set_status(&mut self, path: &str, status: NodeStatus) -> bool {
        let record = self
            .nodes
            .entry(path.to_string())
            .or_insert_with(|| NodeRecord::new(NodeStatus::Pending));
        if record.status.is_terminal() {
            return false;
        }
        record.status = status;
        record.updated_at = Utc::now();
        self.updated_at = record.updated_at;
        true
    }

    /// Records a successful completion with the values the node bound.
    pub fn mark_done(&mut self, path: &str, outputs: &Bindings<Value>) -> bool {
        if !self.set_status(path, NodeStatus::Done) {
            return false;
        }
        if let Some(record) = self.nodes.get_mut(path) {
            record.outputs = outputs.to_pairs();
        }
        true
    }

    pub fn mark_failed(&mut self, path: &str, error: impl Into<String>) -> bool {
        if !self.set_status(path, NodeStatus::Failed) {
            return false;
        }
        if let Some(record) = self.nodes.get_mut(path) {
            record.error = Some(error.into());
        }
        true
    }

    /// Number of nodes per status.
    pub fn counts(&self) -> BTreeMap<NodeStatus, usize> {
        let mut counts = BTreeMap::new();
        for record in self.nodes.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn state_file(run_dir: &Path) -> PathBuf {
        run_dir.join(STATE_FILE)
    }

    /// Writes `state.json` via a temporary file and a rename, so readers
    /// never see a partially written record.
    pub fn save(&self, run_dir: &Path) -> Result<()> {
        let path = Self::state_file(run_dir);
        let tmp = run_dir.join(format!(".{}.tmp", STATE_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved run state to {}", path.display());
        Ok(())
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let content = fs::read_to_string(Self::state_file(run_dir))?;
        Ok(serde_json::from_str(&content)?)
    }
}
