use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use vmkeeper_protocol::DeviceType;

use super::image::ImageStore;
use crate::error::{MachineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumType {
    /// Writable by one machine at a time.
    Normal,
    /// Never written; every attachment goes through a differencing image.
    Immutable,
    /// Read-only media such as ISO images.
    Readonly,
    /// Writable by several machines at once.
    Shareable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumState {
    #[default]
    Created,
    Creating,
    Deleting,
    Inaccessible,
}

/// Which machine (current state and/or snapshots) uses a medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackRef {
    pub machine_id: Uuid,
    pub in_current_state: bool,
    pub snapshots: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Medium {
    pub id: Uuid,
    pub location: PathBuf,
    pub format: String,
    pub device_type: DeviceType,
    pub medium_type: MediumType,
    #[serde(default)]
    pub parent: Option<Uuid>,
    #[serde(default)]
    pub children: Vec<Uuid>,
    #[serde(default)]
    pub logical_size_mb: u64,

    // Runtime state, rebuilt from the machines on load.
    #[serde(skip)]
    pub state: MediumState,
    #[serde(skip)]
    pub backrefs: Vec<BackRef>,
    #[serde(skip)]
    pub readers: u32,
    #[serde(skip)]
    pub writer: bool,
}

impl Medium {
    pub fn new(
        id: Uuid,
        location: PathBuf,
        format: &str,
        device_type: DeviceType,
        medium_type: MediumType,
        logical_size_mb: u64,
    ) -> Self {
        Self {
            id,
            location,
            format: format.to_string(),
            device_type,
            medium_type,
            parent: None,
            children: Vec::new(),
            logical_size_mb,
            state: MediumState::Created,
            backrefs: Vec::new(),
            readers: 0,
            writer: false,
        }
    }

    /// A medium that must not be written through an attachment.
    pub fn is_read_only(&self) -> bool {
        match self.medium_type {
            MediumType::Immutable | MediumType::Readonly => true,
            MediumType::Normal => !self.children.is_empty(),
            MediumType::Shareable => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.writer || self.readers > 0
    }

    pub fn backref(&self, machine_id: Uuid) -> Option<&BackRef> {
        self.backrefs.iter().find(|b| b.machine_id == machine_id)
    }

    /// Whether some machine other than `machine_id` has this medium attached
    /// in its current state.
    pub fn in_current_state_of_other(&self, machine_id: Uuid) -> Option<Uuid> {
        self.backrefs
            .iter()
            .find(|b| b.machine_id != machine_id && b.in_current_state)
            .map(|b| b.machine_id)
    }

    pub fn name(&self) -> String {
        self.location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Every known medium, linked into parent/child chains.
#[derive(Debug, Default)]
pub struct MediaTree {
    media: HashMap<Uuid, Medium>,
}

impl MediaTree {
    pub fn get(&self, id: Uuid) -> Result<&Medium> {
        self.media
            .get(&id)
            .ok_or_else(|| MachineError::ObjectNotFound(format!("medium {} not found", id)))
    }

    pub fn get_mut(&mut self, id: Uuid) -> Result<&mut Medium> {
        self.media
            .get_mut(&id)
            .ok_or_else(|| MachineError::ObjectNotFound(format!("medium {} not found", id)))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.media.contains_key(&id)
    }

    pub fn find_by_location(&self, location: &Path) -> Option<&Medium> {
        self.media.values().find(|m| m.location == location)
    }

    pub fn list(&self) -> Vec<&Medium> {
        let mut list: Vec<&Medium> = self.media.values().collect();
        list.sort_by(|a, b| a.location.cmp(&b.location));
        list
    }

    pub fn insert(&mut self, medium: Medium) -> Result<()> {
        if self.media.contains_key(&medium.id) {
            return Err(MachineError::ObjectInUse(format!(
                "medium {} is already registered",
                medium.id
            )));
        }
        if let Some(existing) = self.find_by_location(&medium.location) {
            return Err(MachineError::ObjectInUse(format!(
                "{} is already registered as medium {}",
                medium.location.display(),
                existing.id
            )));
        }
        if let Some(parent) = medium.parent {
            let parent = self.get_mut(parent)?;
            if !parent.children.contains(&medium.id) {
                parent.children.push(medium.id);
            }
        }
        self.media.insert(medium.id, medium);
        Ok(())
    }

    /// Root of the chain `id` belongs to, and how many levels below it `id` is.
    pub fn base_of(&self, id: Uuid) -> Result<(Uuid, u32)> {
        let mut current = self.get(id)?;
        let mut level = 0;
        while let Some(parent) = current.parent {
            current = self.get(parent)?;
            level += 1;
        }
        Ok((current.id, level))
    }

    /// Parent chain of `id`, nearest first, not including `id`.
    pub fn ancestors(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let mut chain = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = self.get(parent)?;
        }
        Ok(chain)
    }

    pub fn add_backref(&mut self, id: Uuid, machine_id: Uuid, snapshot: Option<Uuid>) -> Result<()> {
        let medium = self.get_mut(id)?;
        if matches!(medium.state, MediumState::Deleting | MediumState::Inaccessible) {
            return Err(MachineError::InvalidState(format!(
                "medium '{}' cannot be used while it is {:?}",
                medium.name(),
                medium.state
            )));
        }
        let idx = match medium.backrefs.iter().position(|b| b.machine_id == machine_id) {
            Some(i) => i,
            None => {
                medium.backrefs.push(BackRef {
                    machine_id,
                    in_current_state: false,
                    snapshots: Vec::new(),
                });
                medium.backrefs.len() - 1
            }
        };
        let backref = &mut medium.backrefs[idx];
        match snapshot {
            None => backref.in_current_state = true,
            Some(snap) => {
                if !backref.snapshots.contains(&snap) {
                    backref.snapshots.push(snap);
                }
            }
        }
        Ok(())
    }

    /// Drop a back-reference. Missing references are ignored.
    pub fn remove_backref(&mut self, id: Uuid, machine_id: Uuid, snapshot: Option<Uuid>) {
        let Some(medium) = self.media.get_mut(&id) else {
            return;
        };
        if let Some(backref) = medium.backrefs.iter_mut().find(|b| b.machine_id == machine_id) {
            match snapshot {
                None => backref.in_current_state = false,
                Some(snap) => backref.snapshots.retain(|s| *s != snap),
            }
        }
        medium
            .backrefs
            .retain(|b| b.in_current_state || !b.snapshots.is_empty());
    }

    /// Drop every back-reference of a machine, returning the media touched.
    pub fn remove_machine_backrefs(&mut self, machine_id: Uuid) -> Vec<Uuid> {
        let mut touched = Vec::new();
        for medium in self.media.values_mut() {
            let before = medium.backrefs.len();
            medium.backrefs.retain(|b| b.machine_id != machine_id);
            if medium.backrefs.len() != before {
                touched.push(medium.id);
            }
        }
        touched
    }

    /// Register a differencing image below `parent` that does not exist on
    /// disk yet. Callers pick `id` so the location can be derived from it.
    pub fn create_diff_placeholder(
        &mut self,
        id: Uuid,
        parent: Uuid,
        location: PathBuf,
        format: &str,
    ) -> Result<Uuid> {
        let parent_medium = self.get(parent)?;
        if parent_medium.device_type != DeviceType::HardDisk {
            return Err(MachineError::InvalidArgument(format!(
                "cannot create a differencing image of '{}'",
                parent_medium.name()
            )));
        }
        if parent_medium.state != MediumState::Created {
            return Err(MachineError::InvalidState(format!(
                "medium '{}' is {:?}",
                parent_medium.name(),
                parent_medium.state
            )));
        }
        let mut diff = Medium::new(
            id,
            location,
            format,
            DeviceType::HardDisk,
            MediumType::Normal,
            parent_medium.logical_size_mb,
        );
        diff.parent = Some(parent);
        diff.state = MediumState::Creating;
        self.insert(diff)?;
        Ok(id)
    }

    pub fn mark_created(&mut self, id: Uuid) -> Result<()> {
        self.get_mut(id)?.state = MediumState::Created;
        Ok(())
    }

    /// Check that a medium can be deleted and move it to `Deleting`.
    pub fn begin_delete(&mut self, id: Uuid) -> Result<PathBuf> {
        let medium = self.get_mut(id)?;
        if !medium.children.is_empty() {
            return Err(MachineError::ObjectInUse(format!(
                "medium '{}' has differencing images",
                medium.name()
            )));
        }
        if !medium.backrefs.is_empty() {
            return Err(MachineError::ObjectInUse(format!(
                "medium '{}' is still attached to machine {}",
                medium.name(),
                medium.backrefs[0].machine_id
            )));
        }
        if medium.is_locked() {
            return Err(MachineError::ObjectInUse(format!(
                "medium '{}' is locked",
                medium.name()
            )));
        }
        medium.state = MediumState::Deleting;
        Ok(medium.location.clone())
    }

    /// Unlink a medium from the tree.
    pub fn remove(&mut self, id: Uuid) -> Result<Medium> {
        let medium = self
            .media
            .remove(&id)
            .ok_or_else(|| MachineError::ObjectNotFound(format!("medium {} not found", id)))?;
        if let Some(parent) = medium.parent.and_then(|p| self.media.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        Ok(medium)
    }
}

/// The global media registry: the media tree behind its lock plus the image
/// store that backs it.
pub struct MediaRegistry {
    tree: RwLock<MediaTree>,
    images: ImageStore,
}

impl MediaRegistry {
    pub fn new(images: ImageStore) -> Self {
        Self {
            tree: RwLock::new(MediaTree::default()),
            images,
        }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, MediaTree> {
        self.tree.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, MediaTree> {
        self.tree.write().await
    }

    /// Register an existing image.
    pub async fn register_base(
        &self,
        location: PathBuf,
        device_type: DeviceType,
        medium_type: MediumType,
        format: &str,
        size_mb: u64,
    ) -> Result<Uuid> {
        let medium = Medium::new(Uuid::new_v4(), location, format, device_type, medium_type, size_mb);
        let id = medium.id;
        info!(medium_id = %id, location = %medium.location.display(), ?medium_type, "medium registered");
        self.tree.write().await.insert(medium)?;
        Ok(id)
    }

    /// Create a new base hard disk image and register it.
    #[instrument(skip(self))]
    pub async fn create_base_image(
        &self,
        location: PathBuf,
        size_mb: u64,
        medium_type: MediumType,
    ) -> Result<Uuid> {
        if self.tree.read().await.find_by_location(&location).is_some() {
            return Err(MachineError::ObjectInUse(format!(
                "{} is already registered",
                location.display()
            )));
        }
        let id = Uuid::new_v4();
        let format = self.images.diff_format().to_string();
        self.images.create_base(&location, id, &format, size_mb).await?;

        let medium = Medium::new(id, location.clone(), &format, DeviceType::HardDisk, medium_type, size_mb);
        if let Err(e) = self.tree.write().await.insert(medium) {
            if let Err(del) = self.images.delete(&location).await {
                warn!(error = %del, "failed to remove image after registration failure");
            }
            return Err(e);
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Medium> {
        self.tree.read().await.get(id).cloned()
    }

    pub async fn find_by_location(&self, location: &Path) -> Option<Medium> {
        self.tree.read().await.find_by_location(location).cloned()
    }

    pub async fn media(&self) -> Vec<Medium> {
        self.tree.read().await.list().into_iter().cloned().collect()
    }

    /// Delete a medium's storage and unregister it. The media lock is not
    /// held while the file is removed.
    #[instrument(skip(self))]
    pub async fn delete_storage(&self, id: Uuid) -> Result<()> {
        let location = self.tree.write().await.begin_delete(id)?;
        match self.images.delete(&location).await {
            Ok(()) => {
                self.tree.write().await.remove(id)?;
                Ok(())
            }
            Err(e) => {
                if let Ok(m) = self.tree.write().await.get_mut(id) {
                    m.state = MediumState::Created;
                }
                Err(e)
            }
        }
    }

    /// Replace the registry contents with persisted media. Parents must
    /// precede their children; out-of-order entries are retried.
    pub async fn load(&self, media: Vec<Medium>) {
        let mut tree = self.tree.write().await;
        let mut pending = media;
        loop {
            let before = pending.len();
            let mut deferred = Vec::new();
            for mut m in pending {
                if m.parent.is_some_and(|p| !tree.contains(p)) {
                    deferred.push(m);
                    continue;
                }
                m.children.clear();
                if let Err(e) = tree.insert(m) {
                    warn!(error = %e, "skipping persisted medium");
                }
            }
            if deferred.is_empty() || deferred.len() == before {
                for m in deferred {
                    warn!(medium_id = %m.id, "skipping medium whose parent is unknown");
                }
                break;
            }
            pending = deferred;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdd(location: &str, medium_type: MediumType) -> Medium {
        Medium::new(
            Uuid::new_v4(),
            PathBuf::from(location),
            "vdi",
            DeviceType::HardDisk,
            medium_type,
            1024,
        )
    }

    #[test]
    fn chain_navigation() {
        let mut tree = MediaTree::default();
        let base = hdd("/img/base.vdi", MediumType::Normal);
        let base_id = base.id;
        tree.insert(base).unwrap();
        let d1 = tree
            .create_diff_placeholder(Uuid::new_v4(), base_id, PathBuf::from("/img/d1.vdi"), "vdi")
            .unwrap();
        tree.mark_created(d1).unwrap();
        let d2 = tree
            .create_diff_placeholder(Uuid::new_v4(), d1, PathBuf::from("/img/d2.vdi"), "vdi")
            .unwrap();

        assert_eq!(tree.base_of(d2).unwrap(), (base_id, 2));
        assert_eq!(tree.base_of(base_id).unwrap(), (base_id, 0));
        assert_eq!(tree.ancestors(d2).unwrap(), vec![d1, base_id]);
        assert_eq!(tree.get(d2).unwrap().state, MediumState::Creating);
        assert!(tree.get(base_id).unwrap().is_read_only());
    }

    #[test]
    fn read_only_classification() {
        assert!(hdd("/a", MediumType::Immutable).is_read_only());
        assert!(hdd("/b", MediumType::Readonly).is_read_only());
        assert!(!hdd("/c", MediumType::Normal).is_read_only());
        assert!(!hdd("/d", MediumType::Shareable).is_read_only());
    }

    #[test]
    fn duplicate_location_rejected() {
        let mut tree = MediaTree::default();
        tree.insert(hdd("/img/base.vdi", MediumType::Normal)).unwrap();
        let err = tree.insert(hdd("/img/base.vdi", MediumType::Normal)).unwrap_err();
        assert!(err.is_in_use());
    }

    #[test]
    fn backrefs_track_current_state_and_snapshots() {
        let mut tree = MediaTree::default();
        let disk = hdd("/img/disk.vdi", MediumType::Normal);
        let id = disk.id;
        tree.insert(disk).unwrap();
        let vm = Uuid::new_v4();
        let snap = Uuid::new_v4();

        tree.add_backref(id, vm, None).unwrap();
        tree.add_backref(id, vm, Some(snap)).unwrap();
        assert_eq!(tree.get(id).unwrap().backrefs.len(), 1);
        assert_eq!(tree.get(id).unwrap().in_current_state_of_other(Uuid::new_v4()), Some(vm));

        tree.remove_backref(id, vm, None);
        let b = tree.get(id).unwrap().backref(vm).unwrap();
        assert!(!b.in_current_state);
        assert_eq!(b.snapshots, vec![snap]);

        tree.remove_backref(id, vm, Some(snap));
        assert!(tree.get(id).unwrap().backrefs.is_empty());
    }

    #[test]
    fn begin_delete_requires_unused_medium() {
        let mut tree = MediaTree::default();
        let base = hdd("/img/base.vdi", MediumType::Normal);
        let base_id = base.id;
        tree.insert(base).unwrap();
        let diff = tree
            .create_diff_placeholder(Uuid::new_v4(), base_id, PathBuf::from("/img/diff.vdi"), "vdi")
            .unwrap();
        assert!(tree.begin_delete(base_id).unwrap_err().is_in_use());

        let vm = Uuid::new_v4();
        tree.add_backref(diff, vm, None).unwrap();
        assert!(tree.begin_delete(diff).unwrap_err().is_in_use());
        assert_eq!(tree.remove_machine_backrefs(vm), vec![diff]);

        assert_eq!(tree.begin_delete(diff).unwrap(), PathBuf::from("/img/diff.vdi"));
        tree.remove(diff).unwrap();
        assert!(tree.get(base_id).unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn registry_creates_and_deletes_images() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MediaRegistry::new(ImageStore::new("vdi"));
        let location = dir.path().join("disk.vdi");
        let id = registry
            .create_base_image(location.clone(), 512, MediumType::Normal)
            .await
            .unwrap();
        assert!(location.exists());
        assert_eq!(registry.find_by_location(&location).await.unwrap().id, id);

        registry.delete_storage(id).await.unwrap();
        assert!(!location.exists());
        assert!(registry.get(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn load_reorders_children_after_parents() {
        let registry = MediaRegistry::new(ImageStore::new("vdi"));
        let base = hdd("/img/base.vdi", MediumType::Normal);
        let mut child = hdd("/img/child.vdi", MediumType::Normal);
        child.parent = Some(base.id);
        let (base_id, child_id) = (base.id, child.id);

        registry.load(vec![child, base]).await;
        assert_eq!(registry.read().await.base_of(child_id).unwrap(), (base_id, 1));
        assert_eq!(registry.get(base_id).await.unwrap().children, vec![child_id]);
    }
}
