//! Session locking.
//!
//! A machine has at most one exclusive (Write or VM) session. The exclusive
//! holder works on a proxy aggregate set that shares storage with the
//! at-rest record until it changes something; Shared sessions only get a
//! console reference from the exclusive holder. Front-ends launched through
//! [`Machine::launch_vm_process`] claim the pending spawn by locking the
//! machine from the launched PID.

pub mod client;
pub mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use vmkeeper_protocol::{DeviceType, LaunchEnvironment, LockType, MachineState, SessionState};

use crate::error::{MachineError, Result};
use crate::events::MachineEvent;
use crate::machine::aggregates::{find_attachment_by_medium, ConfigAggregates, MediumAttachment, SlotKey};
use crate::machine::snapshot::Snapshot;
use crate::machine::state::StateDependency;
use crate::machine::view::MachineView;
use crate::machine::{Machine, MachineData, SavingState, StateChangeLock, Target};
use crate::registry::Registry;
use crate::storage::image::ImageStore;
use crate::storage::lock::MediumLockMap;
use crate::storage::medium::{MediaTree, MediumType};
use crate::storage::{commit_media, rollback_media};

use self::client::{ChildProcess, DynClientHandle, ProcessExit};
use self::progress::Progress;

/// A client registered with the session of a machine.
#[derive(Clone)]
pub struct ControlEntry {
    pub token: Uuid,
    pub client: DynClientHandle,
}

/// Launch or direct lock that has not completed yet.
pub(crate) struct PendingSpawn {
    pid: u32,
    token: Uuid,
    /// Lock requested by the client itself rather than by a launched process.
    direct: bool,
    /// A client is between its lock request and the end of assignment.
    claiming: bool,
    /// Whoever asked for the launch; becomes a remote control on success.
    requester: Option<ControlEntry>,
    child: Option<Box<dyn ChildProcess>>,
    deadline: Option<Instant>,
}

/// Aggregate set handed to the exclusive session holder.
pub(crate) struct SessionProxy {
    pub config: ConfigAggregates,
    pub lock_type: LockType,
    pub token: Uuid,
}

/// Session bookkeeping of one machine.
pub struct SessionDescriptor {
    pub state: SessionState,
    pub lock_type: LockType,
    pub direct_control: Option<ControlEntry>,
    pub remote_controls: Vec<ControlEntry>,
    pub owner_pid: Option<u32>,
    /// Front-end name of a launched session.
    pub name: String,
    pub progress: Option<Progress>,
    /// Media locks held on behalf of a VM session.
    pub locked_media: Option<MediumLockMap>,
    pub(crate) spawn: Option<PendingSpawn>,
    pub(crate) proxy: Option<SessionProxy>,
}

impl Default for SessionDescriptor {
    fn default() -> Self {
        Self {
            state: SessionState::Unlocked,
            lock_type: LockType::Null,
            direct_control: None,
            remote_controls: Vec::new(),
            owner_pid: None,
            name: String::new(),
            progress: None,
            locked_media: None,
            spawn: None,
            proxy: None,
        }
    }
}

impl SessionDescriptor {
    pub fn direct_client(&self) -> Option<DynClientHandle> {
        self.direct_control.as_ref().map(|c| Arc::clone(&c.client))
    }

    /// Forget everything but the state, releasing media locks.
    fn clear(&mut self, tree: &mut MediaTree) {
        if let Some(mut map) = self.locked_media.take() {
            map.clear(tree);
        }
        self.lock_type = LockType::Null;
        self.direct_control = None;
        self.remote_controls.clear();
        self.owner_pid = None;
        self.name.clear();
        self.progress = None;
        self.spawn = None;
        self.proxy = None;
    }
}

/// Handle returned by [`Machine::lock_machine`].
pub struct SessionHandle {
    machine: Arc<Machine>,
    client: DynClientHandle,
    lock_type: LockType,
    token: Uuid,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("machine", &self.machine.id())
            .field("lock_type", &self.lock_type)
            .field("token", &self.token)
            .finish()
    }
}

impl SessionHandle {
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn client(&self) -> &DynClientHandle {
        &self.client
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    fn target(&self) -> Result<Target> {
        if !self.lock_type.is_exclusive() {
            return Err(MachineError::InvalidState(
                "a shared session cannot change the machine configuration".into(),
            ));
        }
        Ok(Target::Session(self.token))
    }

    fn vm_target(&self) -> Result<Target> {
        if self.lock_type != LockType::Vm {
            return Err(MachineError::AccessDenied(
                "only the VM session may drive the machine state".into(),
            ));
        }
        Ok(Target::Session(self.token))
    }

    pub async fn with_view<R>(&self, f: impl FnOnce(&mut MachineView<'_>) -> Result<R>) -> Result<R> {
        self.machine.with_view_for(self.target()?, f).await
    }

    pub async fn is_modified(&self) -> Result<bool> {
        let target = self.target()?;
        let data = self.machine.read().await;
        Ok(data.aggregates(target)?.0.is_modified())
    }

    pub async fn attach_device(&self, slot: SlotKey, device_type: DeviceType, medium: Option<Uuid>) -> Result<()> {
        self.machine
            .attach_device_for(self.target()?, slot, device_type, medium)
            .await
    }

    pub async fn detach_device(&self, slot: SlotKey) -> Result<()> {
        self.machine.detach_device_for(self.target()?, slot).await
    }

    pub async fn mount_medium(&self, slot: SlotKey, medium: Option<Uuid>, force: bool) -> Result<()> {
        self.machine
            .mount_medium_for(self.target()?, slot, medium, force)
            .await
    }

    pub async fn unmount_medium(&self, slot: SlotKey, force: bool) -> Result<()> {
        self.machine
            .mount_medium_for(self.target()?, slot, None, force)
            .await
    }

    pub async fn remove_storage_controller(&self, name: &str) -> Result<()> {
        self.machine
            .remove_storage_controller_for(self.target()?, name)
            .await
    }

    /// Commit the proxy into the at-rest record and write the settings file.
    pub async fn save_settings(&self) -> Result<()> {
        self.target()?;
        self.machine.save_session_settings(self.token).await
    }

    /// Drop every uncommitted proxy change.
    pub async fn discard_settings(&self) -> Result<()> {
        self.target()?;
        self.machine.discard_session_settings(self.token).await
    }

    pub async fn update_state(&self, state: MachineState) -> Result<()> {
        self.vm_target()?;
        self.machine.update_state_for(self.token, state).await
    }

    pub async fn begin_saving_state(&self) -> Result<PathBuf> {
        self.vm_target()?;
        self.machine.begin_saving_state_for(self.token).await
    }

    pub async fn end_saving_state(&self, success: bool) -> Result<()> {
        self.vm_target()?;
        self.machine.end_saving_state_for(self.token, success).await
    }

    pub async fn discard_saved_state(&self, delete_file: bool) -> Result<()> {
        self.target()?;
        self.machine
            .discard_saved_state_for(self.token, delete_file)
            .await
    }

    /// Take an offline snapshot. Differencing images are created in the
    /// background; the returned progress completes when they exist.
    pub async fn take_snapshot(&self, name: &str, description: &str) -> Result<(Uuid, Progress)> {
        self.target()?;
        self.machine
            .take_snapshot_for(self.token, name, description)
            .await
    }

    /// Restore an offline machine to `snapshot_id`.
    pub async fn restore_snapshot(&self, snapshot_id: Uuid) -> Result<()> {
        self.target()?;
        self.machine.restore_snapshot_for(self.token, snapshot_id).await
    }

    pub async fn delete_snapshot(&self, snapshot_id: Uuid) -> Result<()> {
        self.target()?;
        self.machine.delete_snapshot_for(self.token, snapshot_id).await
    }

    pub async fn unlock(self) -> Result<()> {
        self.machine.unlock_session(self.token, self.lock_type).await
    }
}

struct DiffJob {
    slot: SlotKey,
    parent: Uuid,
    diff: Uuid,
    location: PathBuf,
    size_mb: u64,
}

impl Machine {
    // ---- locking ----

    /// Lock the machine for `client`.
    #[instrument(skip(self, client), fields(machine_id = %self.id(), pid = client.pid()))]
    pub async fn lock_machine(self: &Arc<Self>, client: DynClientHandle, lock_type: LockType) -> Result<SessionHandle> {
        match lock_type {
            LockType::Null => Err(MachineError::InvalidArgument(
                "a session lock type must be given".into(),
            )),
            LockType::Shared => self.lock_shared(client).await,
            LockType::Write | LockType::Vm => self.lock_exclusive(client, lock_type).await,
        }
    }

    async fn lock_shared(self: &Arc<Self>, client: DynClientHandle) -> Result<SessionHandle> {
        let token = Uuid::new_v4();
        let direct = {
            let mut data = self.lock().await;
            data.check_accessible()?;
            if data.session.state != SessionState::Locked || !data.session.lock_type.is_exclusive() {
                return Err(MachineError::session_state(
                    "a shared lock needs the machine to be locked by a write or VM session",
                    data.session.state,
                ));
            }
            let direct = data
                .session
                .direct_client()
                .ok_or_else(|| MachineError::Internal("locked session without a direct client".into()))?;
            data.session.remote_controls.push(ControlEntry {
                token,
                client: Arc::clone(&client),
            });
            direct
        };

        let assigned = match direct.get_remote_console().await {
            Ok(console) => client.assign_remote_machine(self.id(), &console).await,
            Err(e) => Err(e),
        };
        if let Err(e) = assigned {
            warn!(error = %e, "shared session could not be assigned");
            self.lock().await.session.remote_controls.retain(|c| c.token != token);
            return Err(e);
        }
        info!("shared session opened");
        Ok(SessionHandle {
            machine: Arc::clone(self),
            client,
            lock_type: LockType::Shared,
            token,
        })
    }

    async fn lock_exclusive(self: &Arc<Self>, client: DynClientHandle, lock_type: LockType) -> Result<SessionHandle> {
        let pid = client.pid();
        let token = Uuid::new_v4();

        let launched = {
            let mut data = self.lock().await;
            data.check_accessible()?;
            data.check_not_unregistering()?;
            let name = data.name();
            let launched = match data.session.state {
                SessionState::Unlocked => {
                    self.commit_at_rest(&mut data).await?;
                    data.session.spawn = Some(PendingSpawn {
                        pid,
                        token,
                        direct: true,
                        claiming: true,
                        requester: None,
                        child: None,
                        deadline: None,
                    });
                    data.session.state = SessionState::Spawning;
                    false
                }
                SessionState::Spawning => {
                    let spawn = data.session.spawn.as_mut().ok_or_else(|| {
                        MachineError::Internal("spawning session without a spawn record".into())
                    })?;
                    if spawn.pid != pid {
                        return Err(MachineError::AccessDenied(format!(
                            "process {} may not claim the session of machine '{}' launched as process {}",
                            pid, name, spawn.pid
                        )));
                    }
                    if spawn.direct || spawn.claiming {
                        return Err(MachineError::session_state(
                            &format!("machine '{}' is already being locked", name),
                            SessionState::Spawning,
                        ));
                    }
                    spawn.claiming = true;
                    spawn.token = token;
                    true
                }
                state => {
                    return Err(MachineError::session_state(
                        &format!("machine '{}' is already locked by a session", name),
                        state,
                    ));
                }
            };

            if let Err(e) = self.begin_session(&mut data, token, lock_type).await {
                if launched {
                    if let Some(spawn) = data.session.spawn.as_mut() {
                        spawn.claiming = false;
                    }
                } else {
                    data.session.spawn = None;
                    data.session.state = SessionState::Unlocked;
                }
                return Err(e);
            }
            launched
        };

        let assigned = client.assign_machine(self.id(), lock_type, token).await;

        let mut data = self.lock().await;
        let ours = data.session.state == SessionState::Spawning
            && data.session.spawn.as_ref().is_some_and(|s| s.token == token);
        if !ours {
            return Err(MachineError::InvalidState(
                "the session was closed while it was being assigned".into(),
            ));
        }

        match assigned {
            Ok(()) => {
                let requester = data.session.spawn.take().and_then(|s| s.requester);
                data.session.lock_type = lock_type;
                data.session.owner_pid = Some(pid);
                data.session.direct_control = Some(ControlEntry {
                    token,
                    client: Arc::clone(&client),
                });
                if let Some(requester) = requester {
                    data.session.remote_controls.push(requester);
                }
                if let Some(progress) = &data.session.progress {
                    progress.complete();
                }
                data.set_session_state(SessionState::Locked);
                info!(lock_type = %lock_type, launched, "session locked");
                Ok(SessionHandle {
                    machine: Arc::clone(self),
                    client,
                    lock_type,
                    token,
                })
            }
            Err(e) => {
                warn!(error = %e, "client refused the session");
                let progress = data.session.progress.take();
                {
                    let mut tree = self.services().media.write().await;
                    data.session.clear(&mut tree);
                }
                if launched {
                    data.set_session_state(SessionState::Unlocked);
                } else {
                    data.session.state = SessionState::Unlocked;
                }
                drop(data);
                if let Some(progress) = progress {
                    progress.fail(format!("the session could not be assigned: {}", e));
                }
                Err(e)
            }
        }
    }

    /// Set up the proxy and, for VM sessions, lock the attached media.
    async fn begin_session(&self, data: &mut MachineData, token: Uuid, lock_type: LockType) -> Result<()> {
        if lock_type == LockType::Vm {
            let mut tree = self.services().media.write().await;
            let mut map = MediumLockMap::build(&tree, data.config.attachments()?)?;
            map.lock(&mut tree)?;
            debug!(media = map.len(), "session media locked");
            data.session.locked_media = Some(map);
        }
        data.session.proxy = Some(SessionProxy {
            config: ConfigAggregates::share_from(&data.config),
            lock_type,
            token,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn unlock_session(&self, token: Uuid, lock_type: LockType) -> Result<()> {
        if lock_type == LockType::Shared {
            let mut data = self.lock().await;
            let before = data.session.remote_controls.len();
            data.session.remote_controls.retain(|c| c.token != token);
            if data.session.remote_controls.len() == before {
                return Err(MachineError::InvalidState("the shared session is not open".into()));
            }
            info!("shared session closed");
            return Ok(());
        }

        let lock = self.lock_for_state_change().await;
        if lock.session.state == SessionState::Unlocking {
            debug!("session is already being unlocked");
            return Ok(());
        }
        let ours = lock.session.state == SessionState::Locked
            && lock.session.direct_control.as_ref().is_some_and(|c| c.token == token);
        if !ours {
            return Err(MachineError::session_state(
                "the session is not locked",
                lock.session.state,
            ));
        }
        if lock_type == LockType::Vm && lock.state.is_online() {
            return Err(MachineError::machine_state(
                "a VM session cannot be unlocked while the machine is running",
                lock.state,
            ));
        }
        if matches!(lock.state, MachineState::SettingUp | MachineState::Snapshotting) {
            return Err(MachineError::machine_state(
                "the session cannot be unlocked during a configuration change",
                lock.state,
            ));
        }
        self.close_session(lock).await;
        Ok(())
    }

    /// Tear down the exclusive session: uninitialize remote controls, roll
    /// back the proxy, release media locks and go back to Unlocked.
    async fn close_session<'a>(&'a self, mut lock: StateChangeLock<'a>) {
        lock.set_session_state(SessionState::Unlocking);
        let remotes = std::mem::take(&mut lock.session.remote_controls);
        let pending = lock.release();
        for remote in &remotes {
            if let Err(e) = remote.client.uninitialize().await {
                warn!(machine_id = %self.id(), pid = remote.client.pid(), error = %e, "remote session did not uninitialize");
            }
        }

        let mut lock = pending.relock(self).await;
        let diffs = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            let mut diffs = Vec::new();
            if let Some(token) = data.session.proxy.as_ref().map(|p| p.token) {
                match rollback_media(data, Target::Session(token), &mut tree) {
                    Ok(found) => diffs = found,
                    Err(e) => warn!(machine_id = %data.id, error = %e, "media rollback failed"),
                }
                if let Some(proxy) = data.session.proxy.as_mut() {
                    if let Err(e) = proxy.config.rollback() {
                        warn!(machine_id = %data.id, error = %e, "session rollback failed");
                    }
                }
            }
            data.session.clear(&mut tree);
            diffs
        };

        // Unlocking keeps new sessions out while the diffs go away.
        let (mut lock, result) = self.delete_implicit_diffs_quietly(lock, diffs).await;
        if let Err(e) = result {
            warn!(machine_id = %self.id(), error = %e, "implicit diffs left behind");
        }
        lock.set_session_state(SessionState::Unlocked);
        info!(machine_id = %self.id(), "session unlocked");
    }

    // ---- launching ----

    /// Start a front-end process for the machine. The returned progress
    /// completes once the process has claimed its session.
    #[instrument(skip(self, requester, env), fields(machine_id = %self.id()))]
    pub async fn launch_vm_process(
        self: &Arc<Self>,
        requester: DynClientHandle,
        frontend: &str,
        env: &LaunchEnvironment,
    ) -> Result<Progress> {
        let config = &self.services().config.session;
        let frontend = if frontend.is_empty() {
            config.default_frontend.as_str()
        } else {
            frontend
        };

        let mut data = self.lock().await;
        data.check_accessible()?;
        let name = data.name();
        if !data.registered {
            return Err(MachineError::InvalidState(format!(
                "machine '{}' must be registered before it can be launched",
                name
            )));
        }
        data.check_not_unregistering()?;
        if data.session.state != SessionState::Unlocked {
            return Err(MachineError::session_state(
                &format!("machine '{}' is already locked by a session", name),
                data.session.state,
            ));
        }
        if data.state.is_online_or_transient() {
            return Err(MachineError::machine_state(
                &format!("machine '{}' cannot be launched", name),
                data.state,
            ));
        }

        let child = self
            .services()
            .launcher
            .spawn(frontend, self.id(), env)
            .map_err(|e| MachineError::io(format!("launching a front-end for machine '{}'", name), e))?;
        let pid = child.pid();
        let progress = Progress::new(format!("Starting virtual machine '{}'", name), false);

        data.session.spawn = Some(PendingSpawn {
            pid,
            token: Uuid::nil(),
            direct: false,
            claiming: false,
            requester: Some(ControlEntry {
                token: Uuid::new_v4(),
                client: requester,
            }),
            child: Some(child),
            deadline: Some(Instant::now() + Duration::from_secs(config.spawn_timeout_secs)),
        });
        data.session.name = frontend.to_string();
        data.session.owner_pid = Some(pid);
        data.session.progress = Some(progress.clone());
        data.set_session_state(SessionState::Spawning);
        info!(pid, frontend, "front-end launched");
        Ok(progress)
    }

    /// Give up a launch whose process died or never claimed the session.
    /// Returns true when the spawn was abandoned.
    pub async fn check_for_spawn_failure(&self) -> bool {
        let mut data = self.lock().await;
        if data.session.state != SessionState::Spawning {
            return false;
        }
        let name = data.name();
        let timeout = self.services().config.session.spawn_timeout_secs;
        let Some(spawn) = data.session.spawn.as_mut() else {
            return false;
        };
        if spawn.direct || spawn.claiming {
            return false;
        }

        let exit = match spawn.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        };
        let reason = match exit {
            Ok(Some(ProcessExit::Code(code))) => format!(
                "the virtual machine '{}' has terminated unexpectedly during startup with exit code {}",
                name, code
            ),
            Ok(Some(ProcessExit::Signal(signal))) => format!(
                "the virtual machine '{}' has terminated unexpectedly during startup because of signal {}",
                name, signal
            ),
            Ok(Some(ProcessExit::Abend)) => format!(
                "the virtual machine '{}' has terminated abnormally during startup",
                name
            ),
            Err(e) => format!(
                "the exit status of the virtual machine '{}' could not be determined: {}",
                name, e
            ),
            Ok(None) if spawn.deadline.is_some_and(|d| Instant::now() >= d) => {
                if let Some(child) = spawn.child.as_mut() {
                    if let Err(e) = child.kill() {
                        warn!(machine_id = %self.id(), pid = spawn.pid, error = %e, "cannot kill front-end");
                    }
                }
                format!(
                    "the virtual machine '{}' has not claimed its session within {} seconds",
                    name, timeout
                )
            }
            Ok(None) => return false,
        };

        warn!(machine_id = %self.id(), pid = spawn.pid, reason = %reason, "launch failed");
        let progress = data.session.progress.take();
        {
            let mut tree = self.services().media.write().await;
            data.session.clear(&mut tree);
        }
        data.set_session_state(SessionState::Unlocked);
        drop(data);
        if let Some(progress) = progress {
            progress.fail(reason);
        }
        true
    }

    /// Detect an exclusive session whose client went away. An online machine
    /// becomes Aborted (AbortedSaved when it was restoring from a state
    /// file) and the session is closed. Returns true when a death was
    /// handled.
    pub async fn check_for_death(&self) -> bool {
        let (client, token) = {
            let data = self.read().await;
            if data.session.state != SessionState::Locked {
                return false;
            }
            match data.session.direct_control.as_ref() {
                Some(c) => (Arc::clone(&c.client), c.token),
                None => return false,
            }
        };
        if client.is_alive().await {
            return false;
        }

        let mut lock = self.lock_for_state_change().await;
        let same_session = lock.session.state == SessionState::Locked
            && lock.session.direct_control.as_ref().map(|c| c.token) == Some(token);
        // Manager-driven changes finish first; the next check retries.
        if !same_session || matches!(lock.state, MachineState::SettingUp | MachineState::Snapshotting) {
            return false;
        }
        warn!(machine_id = %self.id(), pid = client.pid(), "session client terminated abnormally");

        let state = lock.state;
        let aborted = state.is_online();
        let mut partial = None;
        if aborted {
            let next = if state == MachineState::Restoring && lock.state_file.is_some() {
                MachineState::AbortedSaved
            } else {
                lock.state_file = None;
                MachineState::Aborted
            };
            partial = lock.saving.take().map(|s| s.file);
            lock.set_state(next);
        }
        self.close_session(lock).await;
        if let Some(file) = partial {
            remove_state_file(&file).await;
        }
        if aborted {
            if let Err(e) = self.write_settings().await {
                warn!(machine_id = %self.id(), error = %e, "cannot persist aborted state");
            }
        }
        true
    }

    // ---- session commit / rollback ----

    /// Commit the proxy of session `token` into the at-rest record.
    fn commit_proxy(&self, data: &mut MachineData, tree: &mut MediaTree, token: Uuid) -> Result<()> {
        commit_media(data, Target::Session(token), tree)?;
        let machine_id = data.id;
        let proxy = data
            .session
            .proxy
            .as_mut()
            .ok_or_else(|| MachineError::InvalidState("the session is no longer open".into()))?;
        let changed = proxy.config.is_modified();
        let summary = proxy.config.commit_to_peer(&mut data.config)?;

        let controllers: Vec<String> = summary
            .controllers
            .added
            .iter()
            .chain(summary.controllers.removed.iter())
            .map(|c| c.name.clone())
            .chain(summary.controllers.changed.iter().map(|(_, c)| c.name.clone()))
            .collect();
        for controller in controllers {
            data.queue(MachineEvent::StorageControllerChanged {
                machine_id,
                controller,
            });
        }
        if changed && data.current_snapshot.is_some() {
            data.current_state_modified = true;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn save_session_settings(&self, token: Uuid) -> Result<()> {
        let payload = {
            let mut data = self.lock().await;
            data.check_accessible()?;
            let target = Target::Session(token);
            data.check_dependency(target, StateDependency::MutableOrSavedOrRunning)?;
            let modified = data.aggregates(target)?.0.is_modified();
            if modified {
                let d = &mut *data;
                let mut tree = self.services().media.write().await;
                self.commit_proxy(d, &mut tree, token)?;
            }
            data.settings_payload()?
        };
        self.persist(payload).await?;
        debug!("session settings saved");
        Ok(())
    }

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn discard_session_settings(&self, token: Uuid) -> Result<()> {
        let target = Target::Session(token);
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.aggregates(target)?;
        let diffs = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            let diffs = rollback_media(data, target, &mut tree)?;
            data.aggregates_mut(target)?.0.rollback()?;
            diffs
        };
        let (_lock, result) = self.delete_implicit_diffs(lock, diffs).await;
        result
    }

    // ---- machine state driven by the VM process ----

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn update_state_for(&self, token: Uuid, state: MachineState) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.aggregates(Target::Session(token))?;
        let current = lock.state;
        if current == state {
            return Ok(());
        }
        if !crate::machine::state::is_valid_transition(current, state) {
            return Err(MachineError::InvalidState(format!(
                "invalid machine state transition from {} to {}",
                current, state
            )));
        }

        let mut obsolete = None;
        match (current, state) {
            (MachineState::Restoring, MachineState::Running | MachineState::Paused) => {
                obsolete = lock.state_file.take();
            }
            (MachineState::Saving, MachineState::Saved) => {
                let saving = lock.saving.take().ok_or_else(|| {
                    MachineError::InvalidState("no saved-state file was prepared".into())
                })?;
                lock.state_file = Some(saving.file);
            }
            (MachineState::Saving, _) => lock.saving = None,
            (_, MachineState::PoweredOff | MachineState::Aborted) => {
                obsolete = lock.state_file.take();
            }
            _ => {}
        }
        lock.set_state(state);
        let payload = lock.settings_payload()?;
        drop(lock);

        if let Some(file) = obsolete {
            remove_state_file(&file).await;
        }
        self.persist(payload).await
    }

    pub(crate) async fn begin_saving_state_for(&self, token: Uuid) -> Result<PathBuf> {
        let mut lock = self.lock_for_state_change().await;
        lock.aggregates(Target::Session(token))?;
        let previous = lock.state;
        if !matches!(previous, MachineState::Running | MachineState::Paused) {
            return Err(MachineError::machine_state(
                "only a running or paused machine can save its state",
                previous,
            ));
        }
        let file = lock.snapshot_folder_path().join(format!(
            "{}.sav",
            Utc::now().format("%Y-%m-%dT%H-%M-%S-%6fZ")
        ));
        lock.saving = Some(SavingState {
            previous,
            file: file.clone(),
        });
        lock.set_state(MachineState::Saving);
        Ok(file)
    }

    pub(crate) async fn end_saving_state_for(&self, token: Uuid, success: bool) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.aggregates(Target::Session(token))?;
        if lock.state != MachineState::Saving {
            return Err(MachineError::machine_state("the machine is not saving its state", lock.state));
        }
        let saving = lock
            .saving
            .take()
            .ok_or_else(|| MachineError::InvalidState("no saved-state file was prepared".into()))?;
        let mut partial = None;
        if success {
            lock.state_file = Some(saving.file);
            lock.set_state(MachineState::Saved);
        } else {
            partial = Some(saving.file);
            lock.set_state(saving.previous);
        }
        let payload = lock.settings_payload()?;
        drop(lock);
        if let Some(file) = partial {
            remove_state_file(&file).await;
        }
        self.persist(payload).await
    }

    pub(crate) async fn discard_saved_state_for(&self, token: Uuid, delete_file: bool) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.aggregates(Target::Session(token))?;
        let next = match lock.state {
            MachineState::Saved => MachineState::PoweredOff,
            MachineState::AbortedSaved => MachineState::Aborted,
            other => {
                return Err(MachineError::machine_state("the machine has no saved state", other));
            }
        };
        let file = lock.state_file.take();
        lock.set_state(next);
        let payload = lock.settings_payload()?;
        drop(lock);

        if delete_file {
            if let Some(file) = file {
                remove_state_file(&file).await;
            }
        }
        self.persist(payload).await
    }

    // ---- snapshots ----

    pub(crate) async fn take_snapshot_for(
        self: &Arc<Self>,
        token: Uuid,
        name: &str,
        description: &str,
    ) -> Result<(Uuid, Progress)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MachineError::InvalidArgument("snapshot name must not be empty".into()));
        }
        let target = Target::Session(token);
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.aggregates(target)?;
        let previous = lock.state;
        if previous.is_online_or_transient() {
            return Err(MachineError::machine_state(
                "snapshots can only be taken of a machine that is not running",
                previous,
            ));
        }

        let machine_id = self.id();
        let snapshot_id = Uuid::new_v4();
        let folder = lock.snapshot_folder_path();
        let images = self.services().media.images();
        let (snapshot, jobs) = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            self.commit_proxy(data, &mut tree, token)?;

            let (config, _) = data.aggregates(target)?;
            let frozen = config.attachments()?.clone();
            let hardware = config.hardware()?.clone();
            let controllers = config.controllers()?.clone();
            let jobs = plan_diffs(&mut tree, images, &folder, &frozen)?;

            for medium in frozen.iter().filter_map(|a| a.medium) {
                if let Err(e) = tree.add_backref(medium, machine_id, Some(snapshot_id)) {
                    warn!(medium_id = %medium, error = %e, "cannot reference medium from snapshot");
                }
            }
            let (config, _) = data.aggregates_mut(target)?;
            let list = config.attachments_mut()?;
            for job in &jobs {
                if let Some(att) = list.iter_mut().find(|a| a.matches(&job.slot)) {
                    att.medium = Some(job.diff);
                    att.implicit = true;
                }
                tree.add_backref(job.diff, machine_id, None)?;
            }

            let snapshot = Snapshot {
                id: snapshot_id,
                name: name.to_string(),
                description: description.to_string(),
                machine_id,
                parent: data.current_snapshot,
                created_at: Utc::now(),
                state_file: None,
                hardware,
                controllers,
                attachments: frozen,
            };
            (snapshot, jobs)
        };
        let state_copy = lock
            .state_file
            .clone()
            .map(|source| (source, folder.join(format!("{{{}}}.sav", snapshot_id))));
        lock.set_state(MachineState::Snapshotting);
        let machine_name = lock.name();
        drop(lock);

        let progress = Progress::new(
            format!("Taking snapshot '{}' of virtual machine '{}'", name, machine_name),
            true,
        );
        let worker = progress.clone();
        let machine = Arc::clone(self);
        tokio::spawn(async move {
            let images = {
                let machine = Arc::clone(&machine);
                let worker = worker.clone();
                tokio::spawn(async move {
                    machine.write_images(&jobs, state_copy, Some(&worker)).await
                })
            };
            let written = images.await.map_err(MachineError::from).and_then(|r| r);
            machine
                .finish_snapshot(token, snapshot, previous, written, &worker)
                .await;
        });
        info!(machine_id = %machine_id, snapshot_id = %snapshot_id, name, "snapshot started");
        Ok((snapshot_id, progress))
    }

    /// Create the planned differencing images, then copy a saved-state file
    /// as `(source, copy)`. Returns the copy.
    async fn write_images(
        &self,
        jobs: &[DiffJob],
        state_copy: Option<(PathBuf, PathBuf)>,
        progress: Option<&Progress>,
    ) -> Result<Option<PathBuf>> {
        let media = &self.services().media;
        let steps = jobs.len() + usize::from(state_copy.is_some());
        for (done, job) in jobs.iter().enumerate() {
            if progress.is_some_and(|p| p.is_canceled()) {
                return Err(MachineError::InvalidState("the snapshot was canceled".into()));
            }
            media
                .images()
                .create_diff(&job.location, job.diff, job.parent, job.size_mb)
                .await?;
            media.write().await.mark_created(job.diff)?;
            if let Some(progress) = progress {
                progress.set_percent(((done + 1) * 100 / steps.max(1)) as u32);
            }
        }

        let Some((source, copy)) = state_copy else {
            return Ok(None);
        };
        tokio::fs::copy(&source, &copy)
            .await
            .map_err(|e| MachineError::io(format!("copying saved state {}", source.display()), e))?;
        Ok(Some(copy))
    }

    async fn finish_snapshot(
        &self,
        token: Uuid,
        mut snapshot: Snapshot,
        previous: MachineState,
        written: Result<Option<PathBuf>>,
        progress: &Progress,
    ) {
        let target = Target::Session(token);
        let snapshot_id = snapshot.id;
        let mut lock = self.lock_for_state_change().await;
        let session_open = lock.aggregates(target).is_ok();

        let outcome = match written {
            Ok(state_copy) if session_open && !progress.is_canceled() => {
                snapshot.state_file = state_copy;
                let data = &mut *lock;
                let mut tree = self.services().media.write().await;
                if let Err(e) = commit_media(data, target, &mut tree) {
                    warn!(machine_id = %data.id, error = %e, "snapshot media commit failed");
                }
                if let Some(proxy) = data.session.proxy.as_mut() {
                    proxy.config.commit_attachments_to_peer(&mut data.config);
                }
                relock_session_media(data, &mut tree);
                data.snapshots.add(snapshot);
                data.current_snapshot = Some(snapshot_id);
                data.current_state_modified = false;
                drop(tree);
                lock.set_state(previous);
                Ok(())
            }
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(copy) => {
                        if let Some(copy) = copy {
                            remove_state_file(&copy).await;
                        }
                        if session_open {
                            "the snapshot was canceled".to_string()
                        } else {
                            "the session was closed".to_string()
                        }
                    }
                };
                let diffs = {
                    let data = &mut *lock;
                    let mut tree = self.services().media.write().await;
                    for medium in snapshot.attachments.iter().filter_map(|a| a.medium) {
                        tree.remove_backref(medium, data.id, Some(snapshot_id));
                    }
                    if session_open {
                        let diffs = rollback_media(data, target, &mut tree).unwrap_or_default();
                        if let Ok((config, _)) = data.aggregates_mut(target) {
                            if let Err(e) = config.rollback() {
                                warn!(machine_id = %self.id(), error = %e, "snapshot rollback failed");
                            }
                        }
                        diffs
                    } else {
                        Vec::new()
                    }
                };
                lock.set_state(previous);
                let (relocked, result) = self.delete_implicit_diffs(lock, diffs).await;
                lock = relocked;
                if let Err(e) = result {
                    warn!(machine_id = %self.id(), error = %e, "snapshot diffs left behind");
                }
                Err(reason)
            }
        };

        let payload = lock.settings_payload();
        drop(lock);
        match outcome {
            Ok(()) => {
                match payload {
                    Ok(payload) => {
                        if let Err(e) = self.persist(payload).await {
                            warn!(machine_id = %self.id(), error = %e, "cannot persist snapshot");
                        }
                    }
                    Err(e) => warn!(machine_id = %self.id(), error = %e, "cannot persist snapshot"),
                }
                info!(machine_id = %self.id(), snapshot_id = %snapshot_id, "snapshot taken");
                progress.complete();
            }
            Err(reason) => {
                warn!(machine_id = %self.id(), snapshot_id = %snapshot_id, reason = %reason, "snapshot failed");
                progress.fail(reason);
            }
        }
    }

    /// Return the session's configuration to a snapshot. Hard disks get new
    /// differencing images on top of the snapshot's media and the
    /// snapshot's saved state, if any, becomes the machine's.
    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn restore_snapshot_for(self: &Arc<Self>, token: Uuid, snapshot_id: Uuid) -> Result<()> {
        let target = Target::Session(token);
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.aggregates(target)?;
        let previous = lock.state;
        if previous.is_online_or_transient() {
            return Err(MachineError::machine_state(
                "snapshots can only be restored while the machine is not running",
                previous,
            ));
        }
        let snapshot = lock
            .snapshots
            .get(&snapshot_id)
            .cloned()
            .ok_or_else(|| MachineError::ObjectNotFound(format!("snapshot {} not found", snapshot_id)))?;
        let chain = lock.snapshots.ancestor_chain(&snapshot_id);
        let rooted = chain
            .last()
            .and_then(|root| lock.snapshots.get(root))
            .is_some_and(|root| root.parent.is_none());
        if !rooted {
            return Err(MachineError::InvalidState(format!(
                "snapshot '{}' is not connected to the snapshot tree",
                snapshot.name
            )));
        }

        let folder = lock.snapshot_folder_path();
        let jobs = {
            let mut tree = self.services().media.write().await;
            plan_diffs(&mut tree, self.services().media.images(), &folder, &snapshot.attachments)?
        };
        let state_copy = snapshot.state_file.clone().map(|source| {
            let copy = folder.join(format!("{}.sav", Utc::now().format("%Y-%m-%dT%H-%M-%S-%6fZ")));
            (source, copy)
        });
        lock.set_state(MachineState::RestoringSnapshot);
        let pending = lock.release();

        let copy = match self.write_images(&jobs, state_copy, None).await {
            Ok(copy) => copy,
            Err(e) => {
                self.discard_restore(&jobs, None).await;
                let mut lock = pending.relock(self).await;
                lock.set_state(previous);
                return Err(e);
            }
        };

        let mut lock = pending.relock(self).await;
        let applied = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            self.apply_restored(data, &mut tree, token, &snapshot, &jobs)
        };
        let stale = match applied {
            Ok(stale) => stale,
            Err(e) => {
                let pending = lock.release();
                self.discard_restore(&jobs, copy.as_deref()).await;
                let mut lock = pending.relock(self).await;
                lock.set_state(previous);
                return Err(e);
            }
        };
        let (mut lock, deleted) = self.delete_implicit_diffs(lock, stale).await;
        if let Err(e) = deleted {
            warn!(error = %e, "differencing images of the discarded state left behind");
        }

        let old_state_file = std::mem::replace(&mut lock.state_file, copy);
        let next = if lock.state_file.is_some() {
            MachineState::Saved
        } else {
            MachineState::PoweredOff
        };
        lock.set_state(next);
        let payload = lock.settings_payload()?;
        drop(lock);

        if let Some(file) = old_state_file {
            remove_state_file(&file).await;
        }
        self.persist(payload).await?;
        info!(snapshot_id = %snapshot_id, name = %snapshot.name, "snapshot restored");
        Ok(())
    }

    /// Swap the session's configuration for the restored one and commit it.
    /// Returns the differencing images of the old state nothing uses anymore.
    fn apply_restored(
        &self,
        data: &mut MachineData,
        tree: &mut MediaTree,
        token: Uuid,
        snapshot: &Snapshot,
        jobs: &[DiffJob],
    ) -> Result<Vec<Uuid>> {
        let target = Target::Session(token);
        let machine_id = data.id;
        let mut stale = rollback_media(data, target, tree)?;
        data.aggregates_mut(target)?.0.rollback()?;
        let old = data.aggregates(target)?.0.attachments()?.clone();

        let mut restored = snapshot.attachments.clone();
        for att in restored.iter_mut() {
            att.implicit = false;
            if let Some(job) = jobs.iter().find(|j| att.matches(&j.slot)) {
                att.medium = Some(job.diff);
            }
        }
        for medium in restored.iter().filter_map(|a| a.medium) {
            tree.add_backref(medium, machine_id, None)?;
        }
        for att in &old {
            let Some(medium) = att.medium else { continue };
            if find_attachment_by_medium(&restored, medium).is_some() {
                continue;
            }
            tree.remove_backref(medium, machine_id, None);
            let unused = att.device_type == DeviceType::HardDisk
                && !data.snapshots.uses_medium(medium)
                && tree
                    .get(medium)
                    .is_ok_and(|m| m.parent.is_some() && m.children.is_empty() && m.backrefs.is_empty());
            if unused {
                stale.push(medium);
            }
        }

        let (config, _) = data.aggregates_mut(target)?;
        *config.hardware_mut()? = snapshot.hardware.clone();
        if !snapshot.controllers.is_empty() {
            *config.controllers_mut()? = snapshot.controllers.clone();
        }
        *config.attachments_mut()? = restored;
        self.commit_proxy(data, tree, token)?;
        relock_session_media(data, tree);
        data.current_snapshot = Some(snapshot.id);
        data.current_state_modified = false;
        Ok(stale)
    }

    async fn discard_restore(&self, jobs: &[DiffJob], copy: Option<&Path>) {
        let media = &self.services().media;
        for job in jobs {
            if let Err(e) = media.delete_storage(job.diff).await {
                warn!(medium_id = %job.diff, error = %e, "cannot delete differencing image of a failed restore");
            }
        }
        if let Some(copy) = copy {
            remove_state_file(copy).await;
        }
    }

    /// Delete a snapshot of an offline machine. Its children move up to its
    /// parent; differencing images only the snapshot used are deleted.
    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn delete_snapshot_for(self: &Arc<Self>, token: Uuid, snapshot_id: Uuid) -> Result<()> {
        let target = Target::Session(token);
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.aggregates(target)?;
        let previous = lock.state;
        if previous.is_online_or_transient() {
            return Err(MachineError::machine_state(
                "snapshots can only be deleted while the machine is not running",
                previous,
            ));
        }
        let snapshot = lock
            .snapshots
            .get(&snapshot_id)
            .cloned()
            .ok_or_else(|| MachineError::ObjectNotFound(format!("snapshot {} not found", snapshot_id)))?;
        let children = lock.snapshots.children_of(&snapshot_id);
        if children.len() > 1 {
            return Err(MachineError::InvalidState(format!(
                "snapshot '{}' has {} child snapshots",
                snapshot.name,
                children.len()
            )));
        }

        let machine_id = self.id();
        let orphans = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            for child in &children {
                data.snapshots.set_parent(child, snapshot.parent);
            }
            data.snapshots.remove(&snapshot_id);
            if data.current_snapshot == Some(snapshot_id) {
                data.current_snapshot = snapshot.parent;
            }
            let mut orphans = Vec::new();
            for medium in snapshot.attachments.iter().filter_map(|a| a.medium) {
                tree.remove_backref(medium, machine_id, Some(snapshot_id));
                let unused = tree.get(medium).is_ok_and(|m| {
                    m.parent.is_some() && m.children.is_empty() && m.backrefs.is_empty() && !m.is_locked()
                });
                if unused && !orphans.contains(&medium) {
                    orphans.push(medium);
                }
            }
            orphans
        };
        lock.set_state(MachineState::DeletingSnapshot);
        let (mut lock, deleted) = self.delete_implicit_diffs(lock, orphans).await;
        if let Err(e) = deleted {
            warn!(error = %e, "differencing images of the deleted snapshot left behind");
        }
        lock.set_state(previous);
        let payload = lock.settings_payload()?;
        drop(lock);

        if let Some(file) = &snapshot.state_file {
            remove_state_file(file).await;
        }
        self.persist(payload).await?;
        info!(snapshot_id = %snapshot_id, name = %snapshot.name, "snapshot deleted");
        Ok(())
    }
}

/// Register placeholder differencing images for every hard disk in
/// `attachments` that gets one. Placeholders are dropped again on failure.
fn plan_diffs(
    tree: &mut MediaTree,
    images: &ImageStore,
    folder: &Path,
    attachments: &[MediumAttachment],
) -> Result<Vec<DiffJob>> {
    let mut candidates = Vec::new();
    for att in attachments.iter().filter(|a| a.device_type == DeviceType::HardDisk) {
        let Some(parent) = att.medium else { continue };
        let medium = tree.get(parent)?;
        if matches!(medium.medium_type, MediumType::Shareable | MediumType::Readonly) {
            continue;
        }
        candidates.push((att.slot(), parent, medium.logical_size_mb));
    }

    let mut jobs: Vec<DiffJob> = Vec::new();
    for (slot, parent, size_mb) in candidates {
        let diff = Uuid::new_v4();
        let location = images.diff_location(folder, diff);
        if let Err(e) = tree.create_diff_placeholder(diff, parent, location.clone(), images.diff_format()) {
            for job in &jobs {
                if let Err(rm) = tree.remove(job.diff) {
                    warn!(medium_id = %job.diff, error = %rm, "cannot drop placeholder");
                }
            }
            return Err(e);
        }
        jobs.push(DiffJob {
            slot,
            parent,
            diff,
            location,
            size_mb,
        });
    }
    Ok(jobs)
}

/// Rebuild the media locks of the open session from its current attachments.
fn relock_session_media(data: &mut MachineData, tree: &mut MediaTree) {
    let machine_id = data.id;
    let Some(proxy) = data.session.proxy.as_ref() else {
        return;
    };
    let Some(map) = data.session.locked_media.as_mut() else {
        return;
    };
    map.clear(tree);
    let relocked = proxy
        .config
        .attachments()
        .and_then(|atts| MediumLockMap::build(tree, atts))
        .and_then(|mut rebuilt| rebuilt.lock(tree).map(|()| rebuilt));
    match relocked {
        Ok(rebuilt) => *map = rebuilt,
        Err(e) => warn!(machine_id = %machine_id, error = %e, "cannot re-lock session media"),
    }
}

async fn remove_state_file(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "saved-state file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove saved-state file"),
    }
}

/// Check every registered machine for dead session clients and failed
/// launches until the task is aborted.
pub fn spawn_watcher(registry: Arc<Registry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for machine in registry.machines().await {
                if machine.check_for_spawn_failure().await {
                    debug!(machine_id = %machine.id(), "pending launch abandoned");
                }
                if machine.check_for_death().await {
                    debug!(machine_id = %machine.id(), "dead session cleaned up");
                }
            }
        }
    })
}
