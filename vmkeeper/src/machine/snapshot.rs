use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::aggregates::{HardwareProfile, MediumAttachment, StorageController};

/// A frozen copy of a machine's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub machine_id: Uuid,
    /// Parent snapshot ID (forms a tree).
    pub parent: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Saved-state file captured with the snapshot, if the machine was saved.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    pub hardware: HardwareProfile,
    #[serde(default)]
    pub controllers: Vec<StorageController>,
    /// Attachments as they were when the snapshot was taken.
    pub attachments: Vec<MediumAttachment>,
}

/// Snapshot tree of one machine.
///
/// Stored as a flat map keyed by snapshot ID, with parent pointers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SnapshotTree {
    snapshots: HashMap<Uuid, Snapshot>,
}

impl SnapshotTree {
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
        }
    }

    pub fn from_list(list: Vec<Snapshot>) -> Self {
        Self {
            snapshots: list.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn add(&mut self, snapshot: Snapshot) {
        self.snapshots.insert(snapshot.id, snapshot);
    }

    /// Remove a snapshot by ID. Children are not touched.
    pub fn remove(&mut self, id: &Uuid) -> Option<Snapshot> {
        self.snapshots.remove(id)
    }

    /// Move `id` below `parent`.
    pub fn set_parent(&mut self, id: &Uuid, parent: Option<Uuid>) {
        if let Some(s) = self.snapshots.get_mut(id) {
            s.parent = parent;
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&Snapshot> {
        self.snapshots.get(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.values().find(|s| s.name == name)
    }

    /// All snapshots, oldest first.
    pub fn list(&self) -> Vec<&Snapshot> {
        let mut snaps: Vec<&Snapshot> = self.snapshots.values().collect();
        snaps.sort_by_key(|s| s.created_at);
        snaps
    }

    pub fn children_of(&self, parent_id: &Uuid) -> Vec<Uuid> {
        self.snapshots
            .values()
            .filter(|s| s.parent.as_ref() == Some(parent_id))
            .map(|s| s.id)
            .collect()
    }

    /// The root of the tree, if any.
    pub fn first(&self) -> Option<&Snapshot> {
        self.list().into_iter().find(|s| s.parent.is_none())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Snapshot IDs from `id` up to the root: [id, parent, grandparent, ...].
    pub fn ancestor_chain(&self, id: &Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut current = Some(*id);
        while let Some(cid) = current {
            if chain.contains(&cid) || !self.snapshots.contains_key(&cid) {
                break;
            }
            chain.push(cid);
            current = self.snapshots.get(&cid).and_then(|s| s.parent);
        }
        chain
    }

    /// Number of ancestors above `id`.
    pub fn depth(&self, id: &Uuid) -> usize {
        self.ancestor_chain(id).len().saturating_sub(1)
    }

    /// Whether any snapshot still references `medium`.
    pub fn uses_medium(&self, medium: Uuid) -> bool {
        self.snapshots
            .values()
            .any(|s| s.attachments.iter().any(|a| a.medium == Some(medium)))
    }
}
