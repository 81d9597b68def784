//! Versioned configuration cells.
//!
//! A [`ConfigCell`] holds one configuration aggregate together with an
//! optional pre-mutation backup. Cells of a session proxy start out sharing
//! the storage of their peer on the at-rest record; taking a backup is the
//! only way a shared cell diverges from its peer, and committing re-shares
//! the new value in both directions.
//!
//! ```text
//!   allocate ─► Exclusive ──backup──► Exclusive+backup ──commit──► Exclusive
//!                  ▲                         │
//!                  └──────── rollback ───────┘
//!
//!   share(peer) ─► Shared ──backup──► Shared+backup (forked)
//!                                        │ commit_to_peer: peer := value, re-share
//!                                        │ rollback: alias peer again
//! ```

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CellError {
    #[error("configuration cell is empty")]
    Empty,
    #[error("configuration cell has no backup to roll back to")]
    NoBackup,
    #[error("configuration cell has a pending backup")]
    BackupPending,
    #[error("configuration cell must be backed up before it is modified")]
    NotBackedUp,
}

/// Ownership mode of a cell's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Empty,
    Exclusive,
    Shared,
}

#[derive(Debug)]
enum Slot<T> {
    Empty,
    Exclusive(Arc<T>),
    Shared(Arc<T>),
}

impl<T> Slot<T> {
    fn arc(&self) -> Option<&Arc<T>> {
        match self {
            Slot::Empty => None,
            Slot::Exclusive(a) | Slot::Shared(a) => Some(a),
        }
    }

    fn retag(&self, value: Arc<T>) -> Slot<T> {
        match self {
            Slot::Shared(_) => Slot::Shared(value),
            _ => Slot::Exclusive(value),
        }
    }
}

/// Copy-on-write container with backup/commit/rollback.
#[derive(Debug)]
pub struct ConfigCell<T> {
    slot: Slot<T>,
    backup: Option<Arc<T>>,
}

impl<T> Default for ConfigCell<T> {
    fn default() -> Self {
        Self {
            slot: Slot::Empty,
            backup: None,
        }
    }
}

impl<T: Clone> ConfigCell<T> {
    pub fn new(value: T) -> Self {
        let mut cell = Self::default();
        cell.allocate(value);
        cell
    }

    /// Give the cell its own storage, discarding whatever it held.
    pub fn allocate(&mut self, value: T) {
        debug_assert!(self.backup.is_none(), "allocate over a pending backup");
        self.slot = Slot::Exclusive(Arc::new(value));
        self.backup = None;
    }

    /// Alias the current value of `other` without copying it.
    pub fn share(&mut self, other: &ConfigCell<T>) {
        self.slot = match other.slot.arc() {
            Some(a) => Slot::Shared(Arc::clone(a)),
            None => Slot::Empty,
        };
        self.backup = None;
    }

    pub fn ownership(&self) -> Ownership {
        match self.slot {
            Slot::Empty => Ownership::Empty,
            Slot::Exclusive(_) => Ownership::Exclusive,
            Slot::Shared(_) => Ownership::Shared,
        }
    }

    /// True when both cells point at the very same storage.
    pub fn is_shared_with(&self, other: &ConfigCell<T>) -> bool {
        match (self.slot.arc(), other.slot.arc()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn get(&self) -> Result<&T, CellError> {
        self.slot.arc().map(|a| a.as_ref()).ok_or(CellError::Empty)
    }

    /// Mutable access to the current value. Only valid inside a transaction,
    /// i.e. after [`backup`](Self::backup); the first call copies the value.
    pub fn get_mut(&mut self) -> Result<&mut T, CellError> {
        if self.backup.is_none() {
            return Err(CellError::NotBackedUp);
        }
        match &mut self.slot {
            Slot::Empty => Err(CellError::Empty),
            Slot::Exclusive(a) | Slot::Shared(a) => Ok(Arc::make_mut(a)),
        }
    }

    /// Remember the current value so it can be restored. Repeated calls
    /// before a commit or rollback keep the first backup.
    pub fn backup(&mut self) -> Result<(), CellError> {
        if self.backup.is_some() {
            return Ok(());
        }
        let current = self.slot.arc().ok_or(CellError::Empty)?;
        self.backup = Some(Arc::clone(current));
        Ok(())
    }

    pub fn is_backed_up(&self) -> bool {
        self.backup.is_some()
    }

    /// The value as it was when the backup was taken.
    pub fn backed_up(&self) -> Option<&T> {
        self.backup.as_deref()
    }

    /// Keep the current value as the new baseline. Returns whether a backup
    /// was discarded. A shared cell that committed on its own no longer
    /// aliases its peer.
    pub fn commit(&mut self) -> bool {
        if self.backup.take().is_none() {
            return false;
        }
        if let Slot::Shared(a) = &self.slot {
            self.slot = Slot::Exclusive(Arc::clone(a));
        }
        true
    }

    /// Commit and publish the value to `peer`, after which both cells share
    /// the same storage again. Returns whether anything was published.
    pub fn commit_to_peer(&mut self, peer: &mut ConfigCell<T>) -> bool {
        if self.backup.take().is_none() {
            return false;
        }
        debug_assert!(peer.backup.is_none(), "peer cell modified during a session");
        if let Some(a) = self.slot.arc().cloned() {
            peer.slot = Slot::Exclusive(Arc::clone(&a));
            peer.backup = None;
            self.slot = Slot::Shared(a);
        }
        true
    }

    /// Restore the backup verbatim and hand back the discarded value so the
    /// caller can tear down anything created after the backup.
    pub fn rollback(&mut self) -> Result<Arc<T>, CellError> {
        let restored = self.backup.take().ok_or(CellError::NoBackup)?;
        let discarded = self.slot.arc().cloned().ok_or(CellError::Empty)?;
        self.slot = self.slot.retag(restored);
        Ok(discarded)
    }

    /// Release the storage. Not allowed while a backup is pending.
    pub fn free(&mut self) -> Result<(), CellError> {
        if self.backup.is_some() {
            return Err(CellError::BackupPending);
        }
        self.slot = Slot::Empty;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// List reconciliation
// ---------------------------------------------------------------------------

/// Elements of list-valued aggregates are identified by a key.
pub trait Keyed {
    type Key: PartialEq + Clone + std::fmt::Debug;

    fn key(&self) -> Self::Key;
}

/// Element-level difference between two versions of a list aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ListDelta<E> {
    pub added: Vec<E>,
    pub removed: Vec<E>,
    /// (old, new) pairs with equal keys but different contents.
    pub changed: Vec<(E, E)>,
}

impl<E> ListDelta<E> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compare an old and a new list by key, preserving list order in each bucket.
pub fn list_delta<E: Keyed + Clone + PartialEq>(old: &[E], new: &[E]) -> ListDelta<E> {
    let mut delta = ListDelta {
        added: Vec::new(),
        removed: Vec::new(),
        changed: Vec::new(),
    };
    for n in new {
        match old.iter().find(|o| o.key() == n.key()) {
            None => delta.added.push(n.clone()),
            Some(o) if o != n => delta.changed.push((o.clone(), n.clone())),
            Some(_) => {}
        }
    }
    for o in old {
        if !new.iter().any(|n| n.key() == o.key()) {
            delta.removed.push(o.clone());
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Hw {
        cpus: u32,
        memory_mb: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        slot: u32,
        label: String,
    }

    impl Keyed for Item {
        type Key = u32;
        fn key(&self) -> u32 {
            self.slot
        }
    }

    fn item(slot: u32, label: &str) -> Item {
        Item {
            slot,
            label: label.to_string(),
        }
    }

    #[test]
    fn empty_cell_cannot_be_read() {
        let cell: ConfigCell<Hw> = ConfigCell::default();
        assert_eq!(cell.get().unwrap_err(), CellError::Empty);
        assert_eq!(cell.ownership(), Ownership::Empty);
    }

    #[test]
    fn get_mut_requires_backup() {
        let mut cell = ConfigCell::new(Hw { cpus: 1, memory_mb: 128 });
        assert_eq!(cell.get_mut().unwrap_err(), CellError::NotBackedUp);
        cell.backup().unwrap();
        cell.get_mut().unwrap().cpus = 2;
        assert_eq!(cell.get().unwrap().cpus, 2);
    }

    #[test]
    fn backup_is_idempotent() {
        let mut cell = ConfigCell::new(Hw { cpus: 1, memory_mb: 128 });
        cell.backup().unwrap();
        cell.get_mut().unwrap().memory_mb = 256;
        // A second backup must not capture the modified value.
        cell.backup().unwrap();
        assert_eq!(cell.backed_up().unwrap().memory_mb, 128);
        cell.rollback().unwrap();
        assert_eq!(cell.get().unwrap().memory_mb, 128);
    }

    #[test]
    fn rollback_restores_flat_value() {
        let original = Hw { cpus: 4, memory_mb: 1024 };
        let mut cell = ConfigCell::new(original.clone());
        cell.backup().unwrap();
        {
            let hw = cell.get_mut().unwrap();
            hw.cpus = 8;
            hw.memory_mb = 4096;
        }
        let discarded = cell.rollback().unwrap();
        assert_eq!(discarded.cpus, 8);
        assert_eq!(cell.get().unwrap(), &original);
        assert!(!cell.is_backed_up());
    }

    #[test]
    fn rollback_restores_list_with_added_and_removed() {
        let original = vec![item(0, "a"), item(1, "b"), item(2, "c")];
        let mut cell = ConfigCell::new(original.clone());
        cell.backup().unwrap();
        {
            let list = cell.get_mut().unwrap();
            list.retain(|i| i.slot != 1);
            list.push(item(7, "new"));
            list[0].label = "changed".into();
        }
        let discarded = cell.rollback().unwrap();
        let delta = list_delta(&original, &discarded);
        assert_eq!(delta.added, vec![item(7, "new")]);
        assert_eq!(delta.removed, vec![item(1, "b")]);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(cell.get().unwrap(), &original);
    }

    #[test]
    fn rollback_without_backup_fails() {
        let mut cell = ConfigCell::new(Hw { cpus: 1, memory_mb: 64 });
        assert_eq!(cell.rollback().unwrap_err(), CellError::NoBackup);
    }

    #[test]
    fn free_refused_while_backup_pending() {
        let mut cell = ConfigCell::new(Hw { cpus: 1, memory_mb: 64 });
        cell.backup().unwrap();
        assert_eq!(cell.free().unwrap_err(), CellError::BackupPending);
        cell.commit();
        cell.free().unwrap();
        assert_eq!(cell.ownership(), Ownership::Empty);
    }

    #[test]
    fn shared_cell_aliases_until_backup() {
        let mut peer = ConfigCell::new(Hw { cpus: 2, memory_mb: 512 });
        let mut proxy = ConfigCell::default();
        proxy.share(&peer);
        assert_eq!(proxy.ownership(), Ownership::Shared);
        assert!(proxy.is_shared_with(&peer));

        proxy.backup().unwrap();
        proxy.get_mut().unwrap().memory_mb = 256;
        assert!(!proxy.is_shared_with(&peer));
        assert_eq!(peer.get().unwrap().memory_mb, 512);

        assert!(proxy.commit_to_peer(&mut peer));
        assert!(proxy.is_shared_with(&peer));
        assert_eq!(peer.get().unwrap().memory_mb, 256);
        assert_eq!(proxy.ownership(), Ownership::Shared);
        assert_eq!(peer.ownership(), Ownership::Exclusive);
    }

    #[test]
    fn shared_rollback_aliases_peer_again() {
        let peer = ConfigCell::new(vec![item(0, "disk")]);
        let mut proxy = ConfigCell::default();
        proxy.share(&peer);
        proxy.backup().unwrap();
        proxy.get_mut().unwrap().push(item(1, "dvd"));
        proxy.rollback().unwrap();
        assert!(proxy.is_shared_with(&peer));
        assert_eq!(proxy.ownership(), Ownership::Shared);
    }

    #[test]
    fn commit_without_backup_is_noop() {
        let mut peer = ConfigCell::new(Hw { cpus: 1, memory_mb: 64 });
        let mut proxy = ConfigCell::default();
        proxy.share(&peer);
        assert!(!proxy.commit_to_peer(&mut peer));
        assert!(!proxy.commit());
        assert!(proxy.is_shared_with(&peer));
    }

    #[test]
    fn list_delta_unchanged_is_empty() {
        let list = vec![item(0, "a"), item(1, "b")];
        assert!(list_delta(&list, &list).is_empty());
    }
}
