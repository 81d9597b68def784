//! The machine record.
//!
//! One [`Machine`] exists per known machine UUID. Its mutable data sits
//! behind a single async lock; events raised while the lock is held are
//! queued and published after it is released. State changes additionally
//! drain the [`StateBarrier`] so that operations depending on the current
//! state can finish first.

pub mod aggregates;
pub mod barrier;
pub mod snapshot;
pub mod state;
pub mod view;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use vmkeeper_protocol::{MachineState, SessionState};

use crate::config::{Config, Limits};
use crate::crypto::{CryptoContext, Keyring};
use crate::error::{MachineError, Result};
use crate::events::{EventSink, MachineEvent};
use crate::session::client::ProcessLauncher;
use crate::session::SessionDescriptor;
use crate::settings::{self, LoadedSettings, MachineSettings};
use crate::storage::medium::{MediaRegistry, MediaTree};
use crate::storage::{commit_media, rollback_media};

use self::aggregates::{
    AggregateValues, ConfigAggregates, HardwareProfile, Identity, MediumAttachment, Peripherals,
    StorageController,
};
use self::barrier::{DrainGuard, StateBarrier, StateDependencyGuard};
use self::snapshot::{Snapshot, SnapshotTree};
use self::state::{check_state_dependency, Role, StateDependency};
use self::view::MachineView;

/// Process-wide collaborators shared by every machine.
pub struct Services {
    pub config: Arc<Config>,
    pub events: Arc<dyn EventSink>,
    pub media: Arc<MediaRegistry>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub keyring: Option<Arc<Keyring>>,
}

impl Services {
    pub fn new(
        config: Arc<Config>,
        events: Arc<dyn EventSink>,
        media: Arc<MediaRegistry>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config,
            events,
            media,
            launcher,
            keyring: None,
        }
    }
}

/// Which aggregate set an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    AtRest,
    /// The proxy of the Write/VM session identified by its token.
    Session(Uuid),
}

/// Saved-state file being written by the VM process.
#[derive(Debug, Clone)]
pub(crate) struct SavingState {
    pub previous: MachineState,
    pub file: PathBuf,
}

/// Everything guarded by the machine lock.
pub struct MachineData {
    pub(crate) id: Uuid,
    pub(crate) registered: bool,
    /// Set while the registry removes the machine; new sessions are refused.
    pub(crate) unregistering: bool,
    pub(crate) accessible: bool,
    pub(crate) access_error: Option<String>,
    pub(crate) state: MachineState,
    pub(crate) last_state_change: DateTime<Utc>,
    pub(crate) current_snapshot: Option<Uuid>,
    pub(crate) snapshots: SnapshotTree,
    pub(crate) current_state_modified: bool,
    pub(crate) config: ConfigAggregates,
    pub(crate) session: SessionDescriptor,
    pub(crate) settings_file: PathBuf,
    pub(crate) state_file: Option<PathBuf>,
    pub(crate) snapshot_folder: PathBuf,
    pub(crate) saving: Option<SavingState>,
    pub(crate) crypto: Option<Arc<dyn CryptoContext>>,
    outbox: Vec<MachineEvent>,
}

/// What a settings write needs once the lock is gone.
pub(crate) struct SettingsPayload {
    settings: MachineSettings,
    path: PathBuf,
    crypto: Option<Arc<dyn CryptoContext>>,
}

impl MachineData {
    fn new(id: Uuid, settings_file: PathBuf, config: ConfigAggregates) -> Self {
        Self {
            id,
            registered: false,
            unregistering: false,
            accessible: true,
            access_error: None,
            state: MachineState::PoweredOff,
            last_state_change: Utc::now(),
            current_snapshot: None,
            snapshots: SnapshotTree::new(),
            current_state_modified: false,
            config,
            session: SessionDescriptor::default(),
            settings_file,
            state_file: None,
            snapshot_folder: PathBuf::from("Snapshots"),
            saving: None,
            crypto: None,
            outbox: Vec::new(),
        }
    }

    fn apply_loaded(&mut self, loaded: LoadedSettings) {
        let LoadedSettings { settings, crypto } = loaded;
        let state = settings.normalized_state();
        if state != settings.state {
            info!(machine_id = %self.id, from = %settings.state, to = %state, "normalized machine state on load");
        }
        self.state = state;
        self.state_file = if state.has_saved_state() {
            settings.state_file.clone()
        } else {
            None
        };
        self.last_state_change = settings.last_state_change;
        self.current_snapshot = settings.current_snapshot;
        self.snapshots = SnapshotTree::from_list(settings.snapshots);
        self.snapshot_folder = settings.snapshot_folder;
        self.current_state_modified = settings.current_state_modified;
        self.config = ConfigAggregates::new(AggregateValues {
            identity: settings.identity,
            hardware: settings.hardware,
            attachments: settings.attachments,
            controllers: settings.controllers,
            peripherals: settings.peripherals,
        });
        self.crypto = crypto.map(Arc::from);
        self.accessible = true;
        self.access_error = None;
    }

    pub(crate) fn queue(&mut self, event: MachineEvent) {
        self.outbox.push(event);
    }

    pub(crate) fn set_session_state(&mut self, state: SessionState) {
        if self.session.state == state {
            return;
        }
        debug!(machine_id = %self.id, from = %self.session.state, to = %state, "session state");
        self.session.state = state;
        self.queue(MachineEvent::SessionStateChanged {
            machine_id: self.id,
            state,
        });
    }

    fn apply_state(&mut self, state: MachineState) {
        debug_assert_ne!(self.state, state);
        if self.state == state {
            return;
        }
        info!(machine_id = %self.id, from = %self.state, to = %state, "machine state changed");
        self.state = state;
        self.last_state_change = Utc::now();
        self.queue(MachineEvent::MachineStateChanged {
            machine_id: self.id,
            state,
        });
    }

    pub(crate) fn check_accessible(&self) -> Result<()> {
        if self.accessible {
            return Ok(());
        }
        Err(MachineError::Inaccessible {
            id: self.id,
            reason: self
                .access_error
                .clone()
                .unwrap_or_else(|| "settings could not be loaded".into()),
        })
    }

    pub(crate) fn check_not_unregistering(&self) -> Result<()> {
        if self.unregistering {
            return Err(MachineError::InvalidState(format!(
                "machine '{}' is being unregistered",
                self.name()
            )));
        }
        Ok(())
    }

    pub(crate) fn name(&self) -> String {
        self.config
            .identity()
            .map(|i| i.name.clone())
            .unwrap_or_else(|_| self.id.to_string())
    }

    pub(crate) fn aggregates(&self, target: Target) -> Result<(&ConfigAggregates, Role)> {
        match target {
            Target::AtRest => {
                if self.session.state != SessionState::Unlocked {
                    return Err(MachineError::session_state(
                        "the machine configuration is locked by a session",
                        self.session.state,
                    ));
                }
                Ok((&self.config, Role::AtRest))
            }
            Target::Session(token) => match self.session.proxy.as_ref() {
                Some(proxy) if proxy.token == token => Ok((&proxy.config, Role::SessionProxy)),
                _ => Err(MachineError::InvalidState("the session is no longer open".into())),
            },
        }
    }

    pub(crate) fn aggregates_mut(&mut self, target: Target) -> Result<(&mut ConfigAggregates, Role)> {
        match target {
            Target::AtRest => {
                if self.session.state != SessionState::Unlocked {
                    return Err(MachineError::session_state(
                        "the machine configuration is locked by a session",
                        self.session.state,
                    ));
                }
                Ok((&mut self.config, Role::AtRest))
            }
            Target::Session(token) => match self.session.proxy.as_mut() {
                Some(proxy) if proxy.token == token => Ok((&mut proxy.config, Role::SessionProxy)),
                _ => Err(MachineError::InvalidState("the session is no longer open".into())),
            },
        }
    }

    /// Check a state dependency against the aggregate set of `target`.
    pub(crate) fn check_dependency(&self, target: Target, kind: StateDependency) -> Result<()> {
        let (_, role) = self.aggregates(target)?;
        check_state_dependency(kind, self.registered, role, self.state)
    }

    pub(crate) fn view<'a>(&'a mut self, target: Target, limits: &'a Limits) -> Result<MachineView<'a>> {
        let (id, state, registered) = (self.id, self.state, self.registered);
        let (config, role) = self.aggregates_mut(target)?;
        Ok(MachineView::new(id, config, state, registered, role, limits))
    }

    pub(crate) fn snapshot_folder_path(&self) -> PathBuf {
        if self.snapshot_folder.is_absolute() {
            return self.snapshot_folder.clone();
        }
        self.settings_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.snapshot_folder)
    }

    pub(crate) fn to_settings(&self) -> Result<MachineSettings> {
        let values = self.config.values()?;
        Ok(MachineSettings {
            identity: values.identity,
            hardware: values.hardware,
            controllers: values.controllers,
            attachments: values.attachments,
            peripherals: values.peripherals,
            state: self.state,
            state_file: self.state_file.clone(),
            last_state_change: self.last_state_change,
            current_snapshot: self.current_snapshot,
            snapshots: self.snapshots.list().into_iter().cloned().collect(),
            snapshot_folder: self.snapshot_folder.clone(),
            current_state_modified: self.current_state_modified,
        })
    }

    pub(crate) fn settings_payload(&self) -> Result<SettingsPayload> {
        Ok(SettingsPayload {
            settings: self.to_settings()?,
            path: self.settings_file.clone(),
            crypto: self.crypto.clone(),
        })
    }

    /// Register this machine with every medium it references.
    pub(crate) fn register_media_backrefs(&self, tree: &mut MediaTree) {
        let Ok(attachments) = self.config.attachments() else {
            return;
        };
        for medium in attachments.iter().filter_map(|a| a.medium) {
            if let Err(e) = tree.add_backref(medium, self.id, None) {
                warn!(machine_id = %self.id, medium_id = %medium, error = %e, "cannot reference medium");
            }
        }
        for snapshot in self.snapshots.list() {
            for medium in snapshot.attachments.iter().filter_map(|a| a.medium) {
                if let Err(e) = tree.add_backref(medium, self.id, Some(snapshot.id)) {
                    warn!(machine_id = %self.id, snapshot_id = %snapshot.id, medium_id = %medium, error = %e, "cannot reference medium");
                }
            }
        }
    }
}

// ---- guards ----

struct Publisher<'a> {
    sink: &'a dyn EventSink,
    pending: Vec<MachineEvent>,
}

impl Drop for Publisher<'_> {
    fn drop(&mut self) {
        for event in self.pending.drain(..) {
            self.sink.publish(event);
        }
    }
}

/// Write access to [`MachineData`]. Queued events are published after the
/// lock has been released.
pub(crate) struct DataGuard<'a> {
    // Field order matters: the lock is released before the publisher runs.
    guard: RwLockWriteGuard<'a, MachineData>,
    publisher: Publisher<'a>,
}

impl Drop for DataGuard<'_> {
    fn drop(&mut self) {
        self.publisher.pending = std::mem::take(&mut self.guard.outbox);
    }
}

impl Deref for DataGuard<'_> {
    type Target = MachineData;

    fn deref(&self) -> &MachineData {
        &self.guard
    }
}

impl DerefMut for DataGuard<'_> {
    fn deref_mut(&mut self) -> &mut MachineData {
        &mut self.guard
    }
}

/// Machine lock taken after draining state dependents. The only way to
/// change the machine state.
pub(crate) struct StateChangeLock<'a> {
    data: DataGuard<'a>,
    drain: DrainGuard,
}

impl<'a> StateChangeLock<'a> {
    pub fn set_state(&mut self, state: MachineState) {
        self.data.apply_state(state);
    }

    /// Drop the machine lock but keep dependents out.
    pub fn release(self) -> PendingStateChange {
        let StateChangeLock { data, drain } = self;
        drop(data);
        PendingStateChange { drain }
    }
}

impl Deref for StateChangeLock<'_> {
    type Target = MachineData;

    fn deref(&self) -> &MachineData {
        &self.data
    }
}

impl DerefMut for StateChangeLock<'_> {
    fn deref_mut(&mut self) -> &mut MachineData {
        &mut self.data
    }
}

pub(crate) struct PendingStateChange {
    drain: DrainGuard,
}

impl PendingStateChange {
    pub async fn relock(self, machine: &Machine) -> StateChangeLock<'_> {
        StateChangeLock {
            data: machine.lock().await,
            drain: self.drain,
        }
    }
}

// ---- machine ----

pub struct Machine {
    id: Uuid,
    data: RwLock<MachineData>,
    barrier: Arc<StateBarrier>,
    services: Arc<Services>,
    /// Serializes settings file writes.
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").field("id", &self.id).finish()
    }
}

impl Machine {
    fn with_data(services: Arc<Services>, data: MachineData) -> Arc<Self> {
        Arc::new(Self {
            id: data.id,
            data: RwLock::new(data),
            barrier: StateBarrier::new(),
            services,
            save_lock: Mutex::new(()),
        })
    }

    /// A new, unregistered machine with default settings.
    pub fn create(
        services: Arc<Services>,
        id: Uuid,
        name: &str,
        os_type_id: &str,
        settings_file: PathBuf,
    ) -> Arc<Self> {
        let config = ConfigAggregates::defaults(id, name, os_type_id);
        Self::with_data(services, MachineData::new(id, settings_file, config))
    }

    pub(crate) fn from_loaded(
        services: Arc<Services>,
        settings_file: PathBuf,
        loaded: LoadedSettings,
        registered: bool,
    ) -> Arc<Self> {
        let id = loaded.settings.identity.id;
        let mut data = MachineData::new(id, settings_file, ConfigAggregates::default());
        data.apply_loaded(loaded);
        data.registered = registered;
        Self::with_data(services, data)
    }

    /// A record for a settings file that could not be loaded.
    pub(crate) fn inaccessible(
        services: Arc<Services>,
        id: Uuid,
        settings_file: PathBuf,
        error: String,
        registered: bool,
    ) -> Arc<Self> {
        let mut data = MachineData::new(id, settings_file, ConfigAggregates::default());
        data.accessible = false;
        data.access_error = Some(error);
        data.registered = registered;
        Self::with_data(services, data)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub(crate) async fn lock(&self) -> DataGuard<'_> {
        DataGuard {
            guard: self.data.write().await,
            publisher: Publisher {
                sink: self.services.events.as_ref(),
                pending: Vec::new(),
            },
        }
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, MachineData> {
        self.data.read().await
    }

    pub(crate) async fn lock_for_state_change(&self) -> StateChangeLock<'_> {
        let drain = self.barrier.drain().await;
        StateChangeLock {
            data: self.lock().await,
            drain,
        }
    }

    /// Keep the machine state from changing while the guard lives.
    pub fn add_state_dependency(&self) -> Result<StateDependencyGuard> {
        self.barrier.add()
    }

    // ---- accessors ----

    pub async fn name(&self) -> Result<String> {
        let d = self.read().await;
        d.check_accessible()?;
        Ok(d.config.identity()?.name.clone())
    }

    pub async fn state(&self) -> MachineState {
        self.read().await.state
    }

    pub async fn last_state_change(&self) -> DateTime<Utc> {
        self.read().await.last_state_change
    }

    pub async fn session_state(&self) -> SessionState {
        self.read().await.session.state
    }

    pub async fn session_pid(&self) -> Option<u32> {
        self.read().await.session.owner_pid
    }

    pub async fn session_name(&self) -> String {
        self.read().await.session.name.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.read().await.registered
    }

    pub async fn is_accessible(&self) -> bool {
        self.read().await.accessible
    }

    pub async fn access_error(&self) -> Option<String> {
        self.read().await.access_error.clone()
    }

    pub async fn settings_file(&self) -> PathBuf {
        self.read().await.settings_file.clone()
    }

    pub async fn state_file(&self) -> Option<PathBuf> {
        self.read().await.state_file.clone()
    }

    pub async fn snapshot_folder(&self) -> PathBuf {
        self.read().await.snapshot_folder_path()
    }

    pub async fn current_snapshot(&self) -> Option<Uuid> {
        self.read().await.current_snapshot
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.read().await.snapshots.list().into_iter().cloned().collect()
    }

    pub async fn is_current_state_modified(&self) -> bool {
        self.read().await.current_state_modified
    }

    /// Whether the at-rest record has uncommitted changes.
    pub async fn is_modified(&self) -> bool {
        self.read().await.config.is_modified()
    }

    pub async fn identity(&self) -> Result<Identity> {
        let d = self.read().await;
        d.check_accessible()?;
        Ok(d.config.identity()?.clone())
    }

    pub async fn hardware(&self) -> Result<HardwareProfile> {
        let d = self.read().await;
        d.check_accessible()?;
        Ok(d.config.hardware()?.clone())
    }

    pub async fn controllers(&self) -> Result<Vec<StorageController>> {
        let d = self.read().await;
        d.check_accessible()?;
        Ok(d.config.controllers()?.clone())
    }

    pub async fn attachments(&self) -> Result<Vec<MediumAttachment>> {
        let d = self.read().await;
        d.check_accessible()?;
        Ok(d.config.attachments()?.clone())
    }

    pub async fn peripherals(&self) -> Result<Peripherals> {
        let d = self.read().await;
        d.check_accessible()?;
        Ok(d.config.peripherals()?.clone())
    }

    // ---- at-rest editing ----

    /// Run `f` against the at-rest record. Only unregistered machines accept
    /// changes this way; registered ones need a session lock.
    pub async fn with_view<R>(&self, f: impl FnOnce(&mut MachineView<'_>) -> Result<R>) -> Result<R> {
        self.with_view_for(Target::AtRest, f).await
    }

    pub(crate) async fn with_view_for<R>(
        &self,
        target: Target,
        f: impl FnOnce(&mut MachineView<'_>) -> Result<R>,
    ) -> Result<R> {
        let limits = self.services.config.limits.clone();
        let mut data = self.lock().await;
        data.check_accessible()?;
        let mut view = data.view(target, &limits)?;
        f(&mut view)
    }

    /// Commit pending at-rest changes and write the settings file.
    #[instrument(skip(self), fields(machine_id = %self.id))]
    pub async fn save_settings(&self) -> Result<()> {
        let payload = {
            let mut data = self.lock().await;
            data.check_accessible()?;
            data.check_dependency(Target::AtRest, StateDependency::MutableOrSaved)?;
            self.commit_at_rest(&mut data).await?;
            data.settings_payload()?
        };
        self.persist(payload).await
    }

    /// Commit the at-rest record in memory. The caller holds the lock.
    pub(crate) async fn commit_at_rest(&self, data: &mut MachineData) -> Result<()> {
        if !data.config.is_modified() {
            return Ok(());
        }
        {
            let mut tree = self.services.media.write().await;
            commit_media(data, Target::AtRest, &mut tree)?;
        }
        data.config.commit();
        debug!(machine_id = %self.id, "at-rest changes committed");
        Ok(())
    }

    /// Throw away pending at-rest changes, deleting implicit diffs.
    #[instrument(skip(self), fields(machine_id = %self.id))]
    pub async fn discard_settings(&self) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.check_dependency(Target::AtRest, StateDependency::MutableOrSaved)?;
        let diffs = {
            let data = &mut *lock;
            let mut tree = self.services.media.write().await;
            let diffs = rollback_media(data, Target::AtRest, &mut tree)?;
            data.config.rollback()?;
            diffs
        };
        let (_lock, result) = self.delete_implicit_diffs(lock, diffs).await;
        result
    }

    /// Write the current settings file. Takes the machine lock briefly.
    pub(crate) async fn write_settings(&self) -> Result<()> {
        let payload = self.read().await.settings_payload()?;
        self.persist(payload).await
    }

    pub(crate) async fn persist(&self, payload: SettingsPayload) -> Result<()> {
        let _serial = self.save_lock.lock().await;
        payload
            .settings
            .write(&payload.path, payload.crypto.as_deref())
            .await
    }

    // ---- registration ----

    pub(crate) async fn set_registered(&self, registered: bool) {
        let mut data = self.lock().await;
        if data.registered == registered {
            return;
        }
        data.registered = registered;
        let id = data.id;
        data.queue(MachineEvent::MachineRegistered {
            machine_id: id,
            registered,
        });
    }

    pub(crate) async fn register_media_backrefs(&self) {
        let data = self.read().await;
        let mut tree = self.services.media.write().await;
        data.register_media_backrefs(&mut tree);
    }

    /// Retry loading the settings of an inaccessible machine.
    #[instrument(skip(self), fields(machine_id = %self.id))]
    pub async fn recheck_accessibility(&self) -> Result<bool> {
        let _dependency = self.add_state_dependency()?;
        let path = {
            let data = self.read().await;
            if data.accessible {
                return Ok(true);
            }
            data.settings_file.clone()
        };

        let loaded = settings::load_config(&path, self.services.keyring.as_deref())
            .await
            .map_err(|e| e.to_string())
            .and_then(|loaded| {
                if loaded.settings.identity.id == self.id {
                    Ok(loaded)
                } else {
                    Err(format!(
                        "settings file belongs to machine {}",
                        loaded.settings.identity.id
                    ))
                }
            });

        let mut data = self.lock().await;
        match loaded {
            Ok(loaded) => {
                data.apply_loaded(loaded);
                let mut tree = self.services.media.write().await;
                data.register_media_backrefs(&mut tree);
                info!("machine became accessible");
                Ok(true)
            }
            Err(reason) => {
                warn!(error = %reason, "machine is still inaccessible");
                data.access_error = Some(reason);
                Ok(false)
            }
        }
    }

    /// Delete implicit diffs whose references are already gone. Offline
    /// machines are moved to `SettingUp` while the machine lock is released.
    pub(crate) async fn delete_implicit_diffs<'a>(
        &'a self,
        lock: StateChangeLock<'a>,
        diffs: Vec<Uuid>,
    ) -> (StateChangeLock<'a>, Result<()>) {
        self.delete_diffs(lock, diffs, true).await
    }

    /// Delete implicit diffs without touching the machine state. Only for
    /// callers whose session state already keeps new sessions out.
    pub(crate) async fn delete_implicit_diffs_quietly<'a>(
        &'a self,
        lock: StateChangeLock<'a>,
        diffs: Vec<Uuid>,
    ) -> (StateChangeLock<'a>, Result<()>) {
        self.delete_diffs(lock, diffs, false).await
    }

    async fn delete_diffs<'a>(
        &'a self,
        mut lock: StateChangeLock<'a>,
        diffs: Vec<Uuid>,
        guard_state: bool,
    ) -> (StateChangeLock<'a>, Result<()>) {
        if diffs.is_empty() {
            return (lock, Ok(()));
        }
        let previous = lock.state;
        let guarded = guard_state && !previous.is_online_or_transient();
        if guarded {
            lock.set_state(MachineState::SettingUp);
        }
        let pending = lock.release();

        let mut result = Ok(());
        for id in diffs {
            match self.services.media.delete_storage(id).await {
                Ok(()) => debug!(machine_id = %self.id, medium_id = %id, "implicit diff deleted"),
                Err(e) => {
                    warn!(machine_id = %self.id, medium_id = %id, error = %e, "failed to delete implicit diff");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        let mut lock = pending.relock(self).await;
        if guarded {
            lock.set_state(previous);
        }
        (lock, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{machine_in, RecordingSink, TestEnv};

    #[tokio::test]
    async fn new_machine_defaults() {
        let env = TestEnv::new();
        let m = machine_in(&env, "vm1");
        assert_eq!(m.state().await, MachineState::PoweredOff);
        assert_eq!(m.session_state().await, SessionState::Unlocked);
        assert!(!m.is_registered().await);
        assert_eq!(m.name().await.unwrap(), "vm1");
        assert!(m.controllers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregistered_machine_saves_and_reloads() {
        let env = TestEnv::new();
        let m = machine_in(&env, "vm1");
        m.with_view(|v| {
            v.set_cpu_count(2)?;
            v.set_description("build box")
        })
        .await
        .unwrap();
        assert!(m.is_modified().await);
        m.save_settings().await.unwrap();
        assert!(!m.is_modified().await);

        let loaded = settings::load_config(&m.settings_file().await, None).await.unwrap();
        assert_eq!(loaded.settings.hardware.cpu_count, 2);
        assert_eq!(loaded.settings.identity.description, "build box");
    }

    #[tokio::test]
    async fn discard_restores_previous_values() {
        let env = TestEnv::new();
        let m = machine_in(&env, "vm1");
        m.with_view(|v| v.set_memory_size(2048)).await.unwrap();
        m.discard_settings().await.unwrap();
        assert_eq!(m.hardware().await.unwrap().memory_mb, 128);
        assert!(!m.is_modified().await);
    }

    #[tokio::test]
    async fn registered_machine_rejects_at_rest_edits() {
        let env = TestEnv::new();
        let m = machine_in(&env, "vm1");
        m.set_registered(true).await;
        let err = m.with_view(|v| v.set_cpu_count(2)).await.unwrap_err();
        assert!(err.is_invalid_state());
        assert!(m.save_settings().await.unwrap_err().is_invalid_state());
    }

    #[tokio::test]
    async fn events_are_published_after_unlock() {
        let env = TestEnv::new();
        let m = machine_in(&env, "vm1");
        {
            let mut lock = m.lock_for_state_change().await;
            lock.set_state(MachineState::SettingUp);
            assert!(env.sink.events().is_empty());
            lock.set_state(MachineState::PoweredOff);
        }
        assert_eq!(
            env.sink.states(m.id()),
            vec![MachineState::SettingUp, MachineState::PoweredOff]
        );
        assert!(m.last_state_change().await <= Utc::now());
    }

    #[tokio::test]
    async fn state_change_waits_for_dependents() {
        let env = TestEnv::new();
        let m = machine_in(&env, "vm1");
        let dependency = m.add_state_dependency().unwrap();

        let waiter = {
            let m = Arc::clone(&m);
            tokio::spawn(async move {
                let mut lock = m.lock_for_state_change().await;
                lock.set_state(MachineState::Aborted);
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(m.state().await, MachineState::PoweredOff);
        assert!(m.add_state_dependency().is_err());

        drop(dependency);
        waiter.await.unwrap();
        assert_eq!(m.state().await, MachineState::Aborted);
    }

    #[tokio::test]
    async fn inaccessible_machine_recovers_on_recheck() {
        let env = TestEnv::new();
        let source = machine_in(&env, "vm1");
        let path = source.settings_file().await;

        let m = Machine::inaccessible(
            env.services.clone(),
            source.id(),
            path.clone(),
            "missing".into(),
            true,
        );
        assert!(matches!(m.name().await, Err(MachineError::Inaccessible { .. })));
        assert!(!m.recheck_accessibility().await.unwrap());
        assert!(m.access_error().await.unwrap().contains("reading"));

        source.save_settings().await.unwrap();
        assert!(m.recheck_accessibility().await.unwrap());
        assert_eq!(m.name().await.unwrap(), "vm1");
        assert!(m.access_error().await.is_none());
    }

    #[tokio::test]
    async fn recheck_rejects_foreign_settings_file() {
        let env = TestEnv::new();
        let other = machine_in(&env, "other");
        other.save_settings().await.unwrap();
        let m = Machine::inaccessible(
            env.services.clone(),
            Uuid::new_v4(),
            other.settings_file().await,
            "missing".into(),
            true,
        );
        assert!(!m.recheck_accessibility().await.unwrap());
        assert!(m.access_error().await.unwrap().contains("belongs to machine"));
    }

    #[test]
    fn recording_sink_is_an_event_sink() {
        let sink = RecordingSink::default();
        let id = Uuid::new_v4();
        sink.on_machine_state_changed(id, MachineState::Aborted);
        assert_eq!(sink.states(id), vec![MachineState::Aborted]);
    }
}
