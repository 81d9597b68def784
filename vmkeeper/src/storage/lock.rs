//! Bulk medium locking for VM sessions.
//!
//! A [`MediumLockList`] covers one attachment: the attached medium plus its
//! ancestor chain. A [`MediumLockMap`] holds one list per attachment and is
//! locked and unlocked as a whole; a failure part way through releases
//! everything taken so far.

use std::collections::BTreeMap;

use uuid::Uuid;

use vmkeeper_protocol::DeviceType;

use super::medium::{MediaTree, MediumType};
use crate::error::{MachineError, Result};
use crate::machine::aggregates::{MediumAttachment, SlotKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediumLockList {
    entries: Vec<(Uuid, LockMode)>,
    locked: bool,
}

impl MediumLockList {
    /// Lock list for an attachment: the leaf is written unless the medium is
    /// read-only or shared, the ancestors are read.
    pub fn for_attachment(tree: &MediaTree, attachment: &MediumAttachment) -> Result<Option<Self>> {
        let Some(id) = attachment.medium else {
            return Ok(None);
        };
        let medium = tree.get(id)?;
        let leaf_mode = match (attachment.device_type, medium.medium_type) {
            (DeviceType::HardDisk, MediumType::Normal) => LockMode::Write,
            _ => LockMode::Read,
        };
        let mut entries = vec![(id, leaf_mode)];
        entries.extend(tree.ancestors(id)?.into_iter().map(|a| (a, LockMode::Read)));
        Ok(Some(Self {
            entries,
            locked: false,
        }))
    }

    pub fn entries(&self) -> &[(Uuid, LockMode)] {
        &self.entries
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn contains(&self, medium: Uuid) -> bool {
        self.entries.iter().any(|(id, _)| *id == medium)
    }

    /// Take every lock or none.
    pub fn lock(&mut self, tree: &mut MediaTree) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        for (taken, &(id, mode)) in self.entries.iter().enumerate() {
            if let Err(e) = acquire(tree, id, mode) {
                for &(prev, prev_mode) in &self.entries[..taken] {
                    release(tree, prev, prev_mode);
                }
                return Err(e);
            }
        }
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self, tree: &mut MediaTree) {
        if !self.locked {
            return;
        }
        for &(id, mode) in &self.entries {
            release(tree, id, mode);
        }
        self.locked = false;
    }
}

fn acquire(tree: &mut MediaTree, id: Uuid, mode: LockMode) -> Result<()> {
    let medium = tree.get_mut(id)?;
    match mode {
        LockMode::Read if medium.writer => Err(MachineError::ObjectInUse(format!(
            "medium '{}' is locked for writing by another session",
            medium.name()
        ))),
        LockMode::Write if medium.is_locked() => Err(MachineError::ObjectInUse(format!(
            "medium '{}' is locked by another session",
            medium.name()
        ))),
        LockMode::Read => {
            medium.readers += 1;
            Ok(())
        }
        LockMode::Write => {
            medium.writer = true;
            Ok(())
        }
    }
}

fn release(tree: &mut MediaTree, id: Uuid, mode: LockMode) {
    if let Ok(medium) = tree.get_mut(id) {
        match mode {
            LockMode::Read => medium.readers = medium.readers.saturating_sub(1),
            LockMode::Write => medium.writer = false,
        }
    }
}

/// Lock lists of every attachment of a VM session.
#[derive(Debug, Default)]
pub struct MediumLockMap {
    lists: BTreeMap<SlotKey, MediumLockList>,
    locked: bool,
}

impl MediumLockMap {
    pub fn build(tree: &MediaTree, attachments: &[MediumAttachment]) -> Result<Self> {
        let mut lists = BTreeMap::new();
        for att in attachments {
            if let Some(list) = MediumLockList::for_attachment(tree, att)? {
                lists.insert(att.slot(), list);
            }
        }
        Ok(Self {
            lists,
            locked: false,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn get(&self, slot: &SlotKey) -> Option<&MediumLockList> {
        self.lists.get(slot)
    }

    /// Lock all lists. Any failure unlocks what was taken.
    pub fn lock(&mut self, tree: &mut MediaTree) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        let keys: Vec<SlotKey> = self.lists.keys().cloned().collect();
        for (taken, key) in keys.iter().enumerate() {
            let result = match self.lists.get_mut(key) {
                Some(list) => list.lock(tree),
                None => Ok(()),
            };
            if let Err(e) = result {
                for prev in &keys[..taken] {
                    if let Some(list) = self.lists.get_mut(prev) {
                        list.unlock(tree);
                    }
                }
                return Err(e);
            }
        }
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self, tree: &mut MediaTree) {
        for list in self.lists.values_mut() {
            list.unlock(tree);
        }
        self.locked = false;
    }

    /// Add a list for a newly attached medium, locking it if the map is locked.
    pub fn insert(&mut self, tree: &mut MediaTree, slot: SlotKey, mut list: MediumLockList) -> Result<()> {
        if self.locked {
            list.lock(tree)?;
        }
        if let Some(mut old) = self.lists.insert(slot, list) {
            old.unlock(tree);
        }
        Ok(())
    }

    /// Remove and unlock the list of one attachment.
    pub fn remove(&mut self, tree: &mut MediaTree, slot: &SlotKey) -> Option<MediumLockList> {
        let mut list = self.lists.remove(slot)?;
        list.unlock(tree);
        Some(list)
    }

    /// Unlock everything and forget the lists.
    pub fn clear(&mut self, tree: &mut MediaTree) {
        self.unlock(tree);
        self.lists.clear();
    }
}
