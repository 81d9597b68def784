//! Registered machines and the registry file.
//!
//! The registry file lists the settings file of every registered machine
//! together with the global media registry. Machines whose settings cannot
//! be read are kept as inaccessible records so they can be rechecked later.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use vmkeeper_protocol::{DeviceType, SessionState};

use crate::error::{MachineError, Result};
use crate::machine::snapshot::SnapshotTree;
use crate::machine::{Machine, Services};
use crate::settings;
use crate::storage::medium::Medium;

pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: Uuid,
    pub settings_file: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedRegistry {
    /// Version 0 = files written before the field existed.
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub machines: Vec<RegistryEntry>,
    #[serde(default)]
    pub media: Vec<Medium>,
}

/// What `unregister_machine` does with the media of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Refuse machines with snapshots; attachments stay in the settings file.
    UnregisterOnly,
    /// Detach everything, drop the snapshot tree and return the hard disks
    /// that were attached.
    DetachAllReturnHardDisksOnly,
}

pub struct Registry {
    services: Arc<Services>,
    machines: RwLock<Vec<Arc<Machine>>>,
}

impl Registry {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            machines: RwLock::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    fn registry_file(&self) -> &Path {
        &self.services.config.server.registry_file
    }

    /// Create an unregistered machine with default settings. Nothing is
    /// written until the machine is saved or registered.
    pub fn create_machine(&self, name: &str, os_type_id: &str, base_folder: Option<&Path>) -> Result<Arc<Machine>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MachineError::InvalidArgument("machine name must not be empty".into()));
        }
        if name.contains('/') {
            return Err(MachineError::InvalidArgument(format!(
                "machine name '{}' must not contain '/'",
                name
            )));
        }
        let base = base_folder.unwrap_or(&self.services.config.server.machines_dir);
        let settings_file = base.join(name).join(format!("{}.json", name));
        if settings_file.exists() {
            return Err(MachineError::ObjectInUse(format!(
                "settings file {} already exists",
                settings_file.display()
            )));
        }
        let machine = Machine::create(
            Arc::clone(&self.services),
            Uuid::new_v4(),
            name,
            os_type_id,
            settings_file,
        );
        info!(machine_id = %machine.id(), name, "machine created");
        Ok(machine)
    }

    /// Save the settings of `machine` and add it to the registry. The
    /// settings file is written before the machine list is locked.
    #[instrument(skip(self, machine), fields(machine_id = %machine.id()))]
    pub async fn register_machine(&self, machine: &Arc<Machine>) -> Result<()> {
        let name = machine.name().await?;
        if machine.is_registered().await {
            return Err(MachineError::InvalidState(format!(
                "machine '{}' is already registered",
                name
            )));
        }
        ensure_unique(&self.machines.read().await, machine.id(), &name).await?;
        machine.save_settings().await?;

        {
            let mut machines = self.machines.write().await;
            ensure_unique(&machines, machine.id(), &name).await?;
            machine.set_registered(true).await;
            machine.register_media_backrefs().await;
            machines.push(Arc::clone(machine));
        }
        self.save_state().await.map_err(internal)?;
        info!(name = %name, "machine registered");
        Ok(())
    }

    /// Load a settings file into an unregistered record. Settings that
    /// cannot be decoded yield an inaccessible record as long as the machine
    /// UUID can be read.
    #[instrument(skip(self))]
    pub async fn open_machine(&self, path: &Path) -> Result<Arc<Machine>> {
        let machine = match settings::load_config(path, self.services.keyring.as_deref()).await {
            Ok(loaded) => {
                self.ensure_unknown(loaded.settings.identity.id).await?;
                Machine::from_loaded(Arc::clone(&self.services), path.to_path_buf(), loaded, false)
            }
            Err(e) => {
                let id = settings::read_machine_id(path).await.map_err(MachineError::from)?;
                self.ensure_unknown(id).await?;
                warn!(machine_id = %id, error = %e, "machine opened as inaccessible");
                Machine::inaccessible(
                    Arc::clone(&self.services),
                    id,
                    path.to_path_buf(),
                    e.to_string(),
                    false,
                )
            }
        };
        Ok(machine)
    }

    async fn ensure_unknown(&self, id: Uuid) -> Result<()> {
        if self.machines.read().await.iter().any(|m| m.id() == id) {
            return Err(MachineError::ObjectInUse(format!(
                "machine {} is already registered",
                id
            )));
        }
        Ok(())
    }

    pub async fn machines(&self) -> Vec<Arc<Machine>> {
        self.machines.read().await.clone()
    }

    pub async fn find_machine(&self, id: Uuid) -> Result<Arc<Machine>> {
        self.machines
            .read()
            .await
            .iter()
            .find(|m| m.id() == id)
            .cloned()
            .ok_or_else(|| MachineError::ObjectNotFound(format!("no machine with id {}", id)))
    }

    pub async fn find_machine_by_name(&self, name: &str) -> Result<Arc<Machine>> {
        for machine in self.machines.read().await.iter() {
            if machine.name().await.is_ok_and(|n| n == name) {
                return Ok(Arc::clone(machine));
            }
        }
        Err(MachineError::ObjectNotFound(format!("no machine named '{}'", name)))
    }

    /// Accepts a UUID or a machine name.
    pub async fn lookup(&self, name_or_id: &str) -> Result<Arc<Machine>> {
        match Uuid::parse_str(name_or_id) {
            Ok(id) => self.find_machine(id).await,
            Err(_) => self.find_machine_by_name(name_or_id).await,
        }
    }

    /// Remove a machine from the registry. Returns the hard disks that were
    /// detached under [`CleanupMode::DetachAllReturnHardDisksOnly`].
    #[instrument(skip(self))]
    pub async fn unregister_machine(&self, id: Uuid, mode: CleanupMode) -> Result<Vec<Uuid>> {
        let mut machines = self.machines.write().await;
        let idx = machines
            .iter()
            .position(|m| m.id() == id)
            .ok_or_else(|| MachineError::ObjectNotFound(format!("no machine with id {}", id)))?;
        let machine = Arc::clone(&machines[idx]);

        let dependency = machine.add_state_dependency()?;
        {
            let mut data = machine.lock().await;
            let name = data.name();
            data.check_not_unregistering()?;
            if data.session.state != SessionState::Unlocked {
                return Err(MachineError::session_state(
                    &format!("machine '{}' is locked by a session", name),
                    data.session.state,
                ));
            }
            if data.state.is_online_or_transient() {
                return Err(MachineError::machine_state(
                    &format!("machine '{}' cannot be unregistered", name),
                    data.state,
                ));
            }
            if mode == CleanupMode::UnregisterOnly && !data.snapshots.is_empty() {
                return Err(MachineError::InvalidState(format!(
                    "machine '{}' has snapshots",
                    name
                )));
            }
            data.unregistering = true;
        }

        let detached = match mode {
            CleanupMode::UnregisterOnly => {
                let mut tree = self.services.media.write().await;
                tree.remove_machine_backrefs(id);
                drop(tree);
                drop(dependency);
                Vec::new()
            }
            CleanupMode::DetachAllReturnHardDisksOnly => {
                // Deleting implicit diffs drains state dependents.
                drop(dependency);
                machine.set_registered(false).await;
                match detach_all(&machine).await {
                    Ok(disks) => disks,
                    Err(e) => {
                        machine.set_registered(true).await;
                        machine.lock().await.unregistering = false;
                        return Err(e);
                    }
                }
            }
        };

        machine.set_registered(false).await;
        machine.lock().await.unregistering = false;
        machines.remove(idx);
        drop(machines);
        self.save_state().await.map_err(internal)?;
        info!(detached = detached.len(), "machine unregistered");
        Ok(detached)
    }

    /// Delete the settings and saved-state files of an unregistered machine.
    #[instrument(skip(self, machine), fields(machine_id = %machine.id()))]
    pub async fn delete_machine_config(&self, machine: &Arc<Machine>) -> Result<()> {
        let (settings_file, state_file) = {
            let data = machine.read().await;
            if data.registered {
                return Err(MachineError::InvalidState(format!(
                    "machine '{}' must be unregistered first",
                    data.name()
                )));
            }
            if data.session.state != SessionState::Unlocked {
                return Err(MachineError::session_state(
                    "the machine is locked by a session",
                    data.session.state,
                ));
            }
            (data.settings_file.clone(), data.state_file.clone())
        };
        for path in std::iter::once(settings_file).chain(state_file) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "file deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(MachineError::io(format!("deleting {}", path.display()), e));
                }
            }
        }
        Ok(())
    }

    // ---- persistence ----

    /// Load the registry file: media first, then every listed machine.
    pub async fn load_state(&self) -> anyhow::Result<()> {
        let path = self.registry_file();
        if !path.exists() {
            info!(path = %path.display(), "no registry file, starting empty");
            return Ok(());
        }

        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading registry file: {}", path.display()))?;
        let persisted: PersistedRegistry = serde_json::from_str(&data)
            .with_context(|| format!("parsing registry file: {}", path.display()))?;
        if persisted.schema_version > REGISTRY_SCHEMA_VERSION {
            warn!(
                version = persisted.schema_version,
                "registry file has newer schema version than supported (1), some fields may be lost"
            );
        }

        self.services.media.load(persisted.media).await;

        let mut loaded = Vec::with_capacity(persisted.machines.len());
        for entry in persisted.machines {
            let machine = self.load_entry(&entry).await;
            machine.register_media_backrefs().await;
            loaded.push(machine);
        }
        let accessible = {
            let mut count = 0;
            for m in &loaded {
                if m.is_accessible().await {
                    count += 1;
                }
            }
            count
        };
        info!(machines = loaded.len(), accessible, "registry loaded");
        *self.machines.write().await = loaded;
        Ok(())
    }

    async fn load_entry(&self, entry: &RegistryEntry) -> Arc<Machine> {
        let services = Arc::clone(&self.services);
        let path = entry.settings_file.clone();
        match settings::load_config(&path, self.services.keyring.as_deref()).await {
            Ok(loaded) if loaded.settings.identity.id == entry.id => {
                Machine::from_loaded(services, path, loaded, true)
            }
            Ok(loaded) => {
                let reason = format!("settings file belongs to machine {}", loaded.settings.identity.id);
                warn!(machine_id = %entry.id, path = %path.display(), %reason, "machine is inaccessible");
                Machine::inaccessible(services, entry.id, path, reason, true)
            }
            Err(e) => {
                warn!(machine_id = %entry.id, path = %path.display(), error = %e, "machine is inaccessible");
                Machine::inaccessible(services, entry.id, path, e.to_string(), true)
            }
        }
    }

    pub async fn save_state(&self) -> anyhow::Result<()> {
        let machines = self.machines.read().await;
        let mut entries = Vec::with_capacity(machines.len());
        for machine in machines.iter() {
            entries.push(RegistryEntry {
                id: machine.id(),
                settings_file: machine.settings_file().await,
            });
        }
        drop(machines);

        let persisted = PersistedRegistry {
            schema_version: REGISTRY_SCHEMA_VERSION,
            machines: entries,
            media: self.services.media.media().await,
        };
        let data = serde_json::to_string_pretty(&persisted).context("serializing registry")?;
        settings::write_atomic(self.registry_file(), data.as_bytes())
            .await
            .context("writing registry file")?;
        Ok(())
    }
}

/// Refuse a second machine with the same UUID or name.
async fn ensure_unique(machines: &[Arc<Machine>], id: Uuid, name: &str) -> Result<()> {
    for other in machines {
        if other.id() == id {
            return Err(MachineError::ObjectInUse(format!(
                "machine {} is already registered",
                id
            )));
        }
        if other.name().await.is_ok_and(|n| n == name) {
            return Err(MachineError::ObjectInUse(format!(
                "a machine named '{}' is already registered",
                name
            )));
        }
    }
    Ok(())
}

fn internal(e: anyhow::Error) -> MachineError {
    MachineError::Internal(format!("{:#}", e))
}

/// Detach every medium from an unregistered machine, forget its snapshots
/// and save. Returns the hard disks that were attached.
async fn detach_all(machine: &Arc<Machine>) -> Result<Vec<Uuid>> {
    let attachments = machine.attachments().await?;
    let mut disks: Vec<Uuid> = attachments
        .iter()
        .filter(|a| a.device_type == DeviceType::HardDisk)
        .filter_map(|a| a.medium)
        .collect();
    for att in &attachments {
        machine.detach_device(att.slot()).await?;
    }

    {
        let mut data = machine.lock().await;
        for snapshot in data.snapshots.list() {
            for medium in snapshot
                .attachments
                .iter()
                .filter(|a| a.device_type == DeviceType::HardDisk)
                .filter_map(|a| a.medium)
            {
                if !disks.contains(&medium) {
                    disks.push(medium);
                }
            }
        }
        let mut tree = machine.services().media.write().await;
        tree.remove_machine_backrefs(machine.id());
        drop(tree);
        data.snapshots = SnapshotTree::new();
        data.current_snapshot = None;
        data.current_state_modified = false;
    }
    machine.save_settings().await?;
    Ok(disks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::aggregates::{SlotKey, StorageBus};
    use crate::session::client::LocalClient;
    use crate::storage::image::ImageStore;
    use crate::storage::medium::{MediaRegistry, MediumType};
    use crate::testing::{FakeClient, TestEnv};
    use vmkeeper_protocol::LockType;

    fn registry(env: &TestEnv) -> Registry {
        Registry::new(env.services.clone())
    }

    /// A second process view of the same files with an empty media registry.
    fn reopened(env: &TestEnv) -> Registry {
        let services = Services::new(
            env.services.config.clone(),
            env.sink.clone(),
            Arc::new(MediaRegistry::new(ImageStore::new("vdi"))),
            env.launcher.clone(),
        );
        Registry::new(Arc::new(services))
    }

    async fn registered_with_disk(env: &TestEnv, reg: &Registry) -> (Arc<Machine>, Uuid) {
        let m = reg.create_machine("vm1", "Linux_64", None).unwrap();
        m.with_view(|v| v.add_storage_controller("SATA", StorageBus::Sata).map(|_| ()))
            .await
            .unwrap();
        let disk = env.disk("disk.vdi", MediumType::Normal).await;
        m.attach_device(SlotKey::new("SATA", 0, 0), DeviceType::HardDisk, Some(disk))
            .await
            .unwrap();
        reg.register_machine(&m).await.unwrap();
        (m, disk)
    }

    #[tokio::test]
    async fn register_and_find() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let m = reg.create_machine("vm1", "Linux_64", None).unwrap();
        assert!(m
            .settings_file()
            .await
            .ends_with("machines/vm1/vm1.json"));

        reg.register_machine(&m).await.unwrap();
        assert!(m.is_registered().await);
        assert!(m.settings_file().await.exists());
        assert_eq!(reg.find_machine(m.id()).await.unwrap().id(), m.id());
        assert_eq!(reg.find_machine_by_name("vm1").await.unwrap().id(), m.id());
        assert_eq!(reg.lookup(&m.id().to_string()).await.unwrap().id(), m.id());
        assert!(reg.find_machine(Uuid::new_v4()).await.unwrap_err().is_not_found());

        let twin = reg
            .create_machine("vm1", "Linux_64", Some(&env.path("elsewhere")))
            .unwrap();
        assert!(reg.register_machine(&twin).await.unwrap_err().is_in_use());
        assert!(reg.create_machine("vm1", "Linux_64", None).unwrap_err().is_in_use());
        assert!(reg.create_machine(" ", "Linux_64", None).unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn registry_survives_restart() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let (m, disk) = registered_with_disk(&env, &reg).await;

        let again = reopened(&env);
        again.load_state().await.unwrap();
        let loaded = again.find_machine(m.id()).await.unwrap();
        assert!(loaded.is_accessible().await);
        assert!(loaded.is_registered().await);
        assert_eq!(loaded.attachments().await.unwrap()[0].medium, Some(disk));

        let tree = again.services().media.read().await;
        assert!(tree.get(disk).unwrap().backref(m.id()).unwrap().in_current_state);
    }

    #[tokio::test]
    async fn unreadable_settings_become_inaccessible() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let m = reg.create_machine("vm1", "Linux_64", None).unwrap();
        reg.register_machine(&m).await.unwrap();
        tokio::fs::remove_file(m.settings_file().await).await.unwrap();

        let again = reopened(&env);
        again.load_state().await.unwrap();
        let loaded = again.find_machine(m.id()).await.unwrap();
        assert!(!loaded.is_accessible().await);
        assert!(loaded.name().await.is_err());
        assert!(again.find_machine_by_name("vm1").await.is_err());
    }

    #[tokio::test]
    async fn open_rejects_registered_uuid() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let m = reg.create_machine("vm1", "Linux_64", None).unwrap();
        reg.register_machine(&m).await.unwrap();

        let err = reg.open_machine(&m.settings_file().await).await.unwrap_err();
        assert!(err.is_in_use());

        let other = reopened(&env);
        let opened = other.open_machine(&m.settings_file().await).await.unwrap();
        assert_eq!(opened.id(), m.id());
        assert!(!opened.is_registered().await);
    }

    #[tokio::test]
    async fn unregister_needs_unlocked_session() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let (m, disk) = registered_with_disk(&env, &reg).await;

        let session = m
            .lock_machine(FakeClient::new(100).handle(), LockType::Write)
            .await
            .unwrap();
        let err = reg.unregister_machine(m.id(), CleanupMode::UnregisterOnly).await.unwrap_err();
        assert!(err.is_invalid_state());
        session.unlock().await.unwrap();

        let detached = reg.unregister_machine(m.id(), CleanupMode::UnregisterOnly).await.unwrap();
        assert!(detached.is_empty());
        assert!(!m.is_registered().await);
        assert!(reg.machines().await.is_empty());
        assert!(env.services.media.read().await.get(disk).unwrap().backrefs.is_empty());
        assert_eq!(m.attachments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_during_unregister_is_refused() {
        let env = TestEnv::new();
        let reg = Arc::new(registry(&env));
        let (m, _) = registered_with_disk(&env, &reg).await;

        // Keep unregister parked on the media tree after its checks.
        let media = env.services.media.write().await;
        let task = {
            let reg = Arc::clone(&reg);
            let id = m.id();
            tokio::spawn(async move { reg.unregister_machine(id, CleanupMode::UnregisterOnly).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = m
            .lock_machine(FakeClient::new(100).handle(), LockType::Write)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
        drop(media);

        task.await.unwrap().unwrap();
        assert!(!m.is_registered().await);
        assert_eq!(m.session_state().await, SessionState::Unlocked);

        let session = m
            .lock_machine(FakeClient::new(100).handle(), LockType::Write)
            .await
            .unwrap();
        session.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn failed_settings_write_leaves_registry_unchanged() {
        let env = TestEnv::new();
        let reg = registry(&env);
        std::fs::write(env.path("blocker"), b"").unwrap();
        let m = reg
            .create_machine("vm1", "Linux_64", Some(&env.path("blocker")))
            .unwrap();

        assert!(reg.register_machine(&m).await.is_err());
        assert!(!m.is_registered().await);
        assert!(reg.machines().await.is_empty());

        let ok = reg.create_machine("vm1", "Linux_64", None).unwrap();
        reg.register_machine(&ok).await.unwrap();
        assert_eq!(reg.machines().await.len(), 1);
    }

    #[tokio::test]
    async fn detach_all_returns_hard_disks() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let (m, disk) = registered_with_disk(&env, &reg).await;

        let session = m
            .lock_machine(Arc::new(LocalClient::new()), LockType::Write)
            .await
            .unwrap();
        let (_, progress) = session.take_snapshot("base", "").await.unwrap();
        progress.wait().await;
        session.unlock().await.unwrap();

        let err = reg.unregister_machine(m.id(), CleanupMode::UnregisterOnly).await.unwrap_err();
        assert!(err.is_invalid_state());

        let diff = m.attachments().await.unwrap()[0].medium.unwrap();
        let detached = reg
            .unregister_machine(m.id(), CleanupMode::DetachAllReturnHardDisksOnly)
            .await
            .unwrap();
        assert_eq!(detached, vec![diff, disk]);
        assert!(m.attachments().await.unwrap().is_empty());
        assert!(m.snapshots().await.is_empty());
        let tree = env.services.media.read().await;
        assert!(tree.get(disk).unwrap().backrefs.is_empty());
        assert!(tree.get(diff).unwrap().backrefs.is_empty());
    }

    #[tokio::test]
    async fn delete_config_requires_unregistered_machine() {
        let env = TestEnv::new();
        let reg = registry(&env);
        let m = reg.create_machine("vm1", "Linux_64", None).unwrap();
        reg.register_machine(&m).await.unwrap();
        assert!(reg.delete_machine_config(&m).await.unwrap_err().is_invalid_state());

        reg.unregister_machine(m.id(), CleanupMode::UnregisterOnly).await.unwrap();
        reg.delete_machine_config(&m).await.unwrap();
        assert!(!m.settings_file().await.exists());
    }

    #[test]
    fn legacy_registry_without_schema_version() {
        let persisted: PersistedRegistry = serde_json::from_str(r#"{"machines": []}"#).unwrap();
        assert_eq!(persisted.schema_version, 0);
        assert!(persisted.media.is_empty());
    }
}
