//! Persisted state.
//!
//! A [`State`] maps instance addresses to their last-known attributes. Apply
//! mutates it one vertex at a time and hands every snapshot to a
//! [`StateStore`], so a crash loses at most the vertex in flight.
//!
//! `serial` increases with every mutation. [`FileStateStore`] uses it to
//! refuse writes when another writer advanced the file in the meantime.

use crate::error::{Result, ResultExt};
use crate::types::Attributes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Current state format version.
pub const STATE_VERSION: u32 = 1;

/// Snapshot of every managed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Format version
    pub version: u32,
    /// Revision counter, bumped on every mutation
    pub serial: u64,
    /// Identifies one state history across revisions
    pub lineage: String,
    /// Instance address to resource state
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Root output values
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// An empty state with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Look up an instance.
    #[must_use]
    pub fn resource(&self, address: &str) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    /// Whether no instances are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Parse a state from JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Whether two states record the same resources and outputs, ignoring
    /// the revision counter.
    #[must_use]
    pub fn same_contents(&self, other: &Self) -> bool {
        self.resources == other.resources && self.outputs == other.outputs
    }

    /// Move entries whose resource gained or lost `count`.
    ///
    /// `declared` maps each `TYPE.NAME` to whether it is counted. A counted
    /// resource adopts its bare entry as `TYPE.NAME[0]`; an uncounted one
    /// adopts a lone `TYPE.NAME[0]`. Recorded dependencies follow the move.
    /// Returns the `(from, to)` pairs moved.
    pub fn migrate_count_addresses(&mut self, declared: &BTreeMap<String, bool>) -> Vec<(String, String)> {
        let mut moves = Vec::new();
        for (address, &counted) in declared {
            let first = format!("{address}[0]");
            let (from, to) = if counted {
                (address.clone(), first)
            } else if !self.resources.contains_key(&format!("{address}[1]")) {
                (first, address.clone())
            } else {
                continue;
            };
            if self.resources.contains_key(&to) {
                continue;
            }
            if let Some(entry) = self.resources.remove(&from) {
                tracing::info!(from = %from, to = %to, "Moving state entry after count change");
                self.resources.insert(to.clone(), entry);
                moves.push((from, to));
            }
        }

        if !moves.is_empty() {
            let renamed: BTreeMap<&str, &str> = moves.iter().map(|(f, t)| (f.as_str(), t.as_str())).collect();
            for resource in self.resources.values_mut() {
                for dep in &mut resource.dependencies {
                    if let Some(to) = renamed.get(dep.as_str()) {
                        *dep = (*to).to_string();
                    }
                }
            }
        }
        moves
    }
}

/// Last-known state of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Provider vertex that manages it
    pub provider: String,
    /// Instances it depended on when last applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Provider-reported attributes
    pub primary: InstanceState,
    /// Set when a create failed part way; the next plan replaces it
    #[serde(default)]
    pub tainted: bool,
}

/// Identifier and attributes reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Provider-assigned identifier
    pub id: String,
    /// Attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl InstanceState {
    /// Create an instance state.
    #[must_use]
    pub fn new(id: impl Into<String>, attributes: Attributes) -> Self {
        Self { id: id.into(), attributes }
    }

    /// The value dependents see: the attributes plus `id`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map: serde_json::Map<String, Value> =
            self.attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(map)
    }
}

/// Destination for state snapshots.
pub trait StateStore: Send + Sync {
    /// Read the current snapshot.
    fn load(&self) -> Result<State>;

    /// Write a snapshot.
    fn persist(&self, state: &State) -> Result<()>;
}

/// Keeps snapshots in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<Vec<State>>,
}

impl MemoryStateStore {
    /// Create a store holding `initial` as its first snapshot.
    #[must_use]
    pub fn new(initial: State) -> Self {
        Self { snapshots: Mutex::new(vec![initial]) }
    }

    /// Every snapshot persisted so far, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<State> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<State> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.last().cloned().unwrap_or_default())
    }

    fn persist(&self, state: &State) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state.clone());
        Ok(())
    }
}

/// JSON state file.
///
/// Writes go to a temporary file that is renamed over the target. The
/// previous file is kept as `<path>.backup` when backups are enabled.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    backup: bool,
    /// Serial last read from or written to the file
    last_seen: Mutex<Option<u64>>,
}

#[derive(Deserialize)]
struct SerialOnly {
    serial: u64,
}

impl FileStateStore {
    /// Create a store for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), backup: true, last_seen: Mutex::new(None) }
    }

    /// Enable or disable the `.backup` copy.
    #[must_use]
    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// The state file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the backup copy.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn disk_serial(&self) -> Result<Option<u64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).with_path(&self.path)?;
        let parsed: SerialOnly = serde_json::from_str(&content)?;
        Ok(Some(parsed.serial))
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<State> {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "No state file, starting empty");
            *last_seen = None;
            return Ok(State::new());
        }
        let content = std::fs::read_to_string(&self.path).with_path(&self.path)?;
        let state = State::from_json(&content)?;
        *last_seen = Some(state.serial);
        tracing::debug!(
            path = %self.path.display(),
            serial = state.serial,
            resources = state.resources.len(),
            "Loaded state"
        );
        Ok(state)
    }

    fn persist(&self, state: &State) -> Result<()> {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(found) = self.disk_serial()? {
            if *last_seen != Some(found) {
                return Err(crate::err!(StaleState {
                    path: self.path.clone(),
                    expected: last_seen.unwrap_or(0),
                    found,
                }));
            }
            if self.backup {
                let backup = self.backup_path();
                std::fs::copy(&self.path, &backup).with_path(&backup)?;
            }
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        std::fs::write(&tmp, state.to_json()?).with_path(&tmp)?;
        std::fs::rename(&tmp, &self.path).with_path(&self.path)?;

        *last_seen = Some(state.serial);
        tracing::trace!(path = %self.path.display(), serial = state.serial, "Persisted state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state(serial: u64) -> State {
        let mut state = State::new();
        state.serial = serial;
        state.resources.insert(
            "null_resource.a".to_string(),
            ResourceState {
                resource_type: "null_resource".to_string(),
                provider: "provider.null".to_string(),
                dependencies: vec![],
                primary: InstanceState::new("a-1", Attributes::new()),
                tainted: false,
            },
        );
        state
    }

    fn entry(dependencies: &[&str]) -> ResourceState {
        ResourceState {
            resource_type: "null_resource".to_string(),
            provider: "provider.null".to_string(),
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
            primary: InstanceState::new("x", Attributes::new()),
            tainted: false,
        }
    }

    #[test]
    fn test_count_added_moves_entry_to_first_instance() {
        let mut state = State::new();
        state.resources.insert("null_resource.web".to_string(), entry(&[]));
        state.resources.insert("null_resource.app".to_string(), entry(&["null_resource.web"]));
        let declared = BTreeMap::from([
            ("null_resource.web".to_string(), true),
            ("null_resource.app".to_string(), false),
        ]);

        let moves = state.migrate_count_addresses(&declared);

        assert_eq!(moves, vec![("null_resource.web".to_string(), "null_resource.web[0]".to_string())]);
        assert!(state.resource("null_resource.web").is_none());
        assert!(state.resource("null_resource.web[0]").is_some());
        assert_eq!(state.resource("null_resource.app").unwrap().dependencies, vec!["null_resource.web[0]"]);
        // a second pass has nothing left to move
        assert!(state.migrate_count_addresses(&declared).is_empty());
    }

    #[test]
    fn test_count_removed_adopts_only_a_lone_instance() {
        let declared = BTreeMap::from([("null_resource.web".to_string(), false)]);

        let mut lone = State::new();
        lone.resources.insert("null_resource.web[0]".to_string(), entry(&[]));
        assert_eq!(lone.migrate_count_addresses(&declared).len(), 1);
        assert!(lone.resource("null_resource.web").is_some());

        let mut several = State::new();
        several.resources.insert("null_resource.web[0]".to_string(), entry(&[]));
        several.resources.insert("null_resource.web[1]".to_string(), entry(&[]));
        assert!(several.migrate_count_addresses(&declared).is_empty());
        assert_eq!(several.resources.len(), 2);
    }

    #[test]
    fn test_instance_value_includes_id() {
        let mut attributes = Attributes::new();
        attributes.insert("size".to_string(), json!(2));
        let value = InstanceState::new("i-123", attributes).to_value();
        assert_eq!(value, json!({"id": "i-123", "size": 2}));
    }

    #[test]
    fn test_json_round_trip() {
        let state = sample_state(4);
        let back = State::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_file_store_persist_and_backup() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        let empty = store.load().unwrap();
        assert!(empty.is_empty());

        store.persist(&sample_state(1)).unwrap();
        store.persist(&sample_state(2)).unwrap();

        assert_eq!(store.load().unwrap().serial, 2);
        let backup = State::from_json(&std::fs::read_to_string(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.serial, 1);
    }

    #[test]
    fn test_file_store_rejects_stale_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let first = FileStateStore::new(&path);
        let second = FileStateStore::new(&path);

        first.load().unwrap();
        first.persist(&sample_state(1)).unwrap();
        second.load().unwrap();

        first.persist(&sample_state(2)).unwrap();
        let err = second.persist(&sample_state(2)).unwrap_err();
        match err {
            EngineError::StaleState { expected, found, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_memory_store_records_snapshots() {
        let store = MemoryStateStore::new(State::new());
        store.persist(&sample_state(1)).unwrap();
        assert_eq!(store.snapshots().len(), 2);
        assert_eq!(store.load().unwrap().serial, 1);
    }
}
