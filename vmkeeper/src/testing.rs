//! Shared fixtures for unit tests.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use vmkeeper_protocol::{DeviceType, LaunchEnvironment, LockType, MachineState, SessionState};

use crate::config::Config;
use crate::error::{MachineError, Result};
use crate::events::{EventSink, MachineEvent};
use crate::machine::aggregates::MediumAttachment;
use crate::machine::{Machine, Services};
use crate::session::client::{ChildProcess, ClientHandle, DynClientHandle, ProcessExit, ProcessLauncher};
use crate::storage::image::ImageStore;
use crate::storage::medium::{MediaRegistry, MediumType};

pub struct TestEnv {
    pub dir: TempDir,
    pub services: Arc<Services>,
    pub sink: Arc<RecordingSink>,
    pub launcher: Arc<FakeLauncher>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.registry_file = dir.path().join("registry.json");
        config.server.machines_dir = dir.path().join("machines");
        config.storage.images_dir = dir.path().join("images");
        tweak(&mut config);

        let sink = Arc::new(RecordingSink::default());
        let launcher = Arc::new(FakeLauncher::new(4242));
        let media = Arc::new(MediaRegistry::new(ImageStore::new(
            config.storage.default_diff_format.clone(),
        )));
        let services = Arc::new(Services::new(
            Arc::new(config),
            sink.clone(),
            media,
            launcher.clone(),
        ));
        Self {
            dir,
            services,
            sink,
            launcher,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Create a 64 MB base hard disk in the test directory.
    pub async fn disk(&self, name: &str, medium_type: MediumType) -> Uuid {
        self.services
            .media
            .create_base_image(self.path(name), 64, medium_type)
            .await
            .unwrap()
    }

    pub async fn iso(&self, name: &str) -> Uuid {
        self.services
            .media
            .register_base(self.path(name), DeviceType::Dvd, MediumType::Readonly, "iso", 0)
            .await
            .unwrap()
    }
}

/// Unregistered machine whose settings file lives in `<dir>/<name>/<name>.json`.
pub fn machine_in(env: &TestEnv, name: &str) -> Arc<Machine> {
    let file = env.dir.path().join(name).join(format!("{}.json", name));
    Machine::create(env.services.clone(), Uuid::new_v4(), name, "Linux_64", file)
}

// ---- events ----

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MachineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn states(&self, id: Uuid) -> Vec<MachineState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MachineEvent::MachineStateChanged { machine_id, state } if machine_id == id => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn session_states(&self, id: Uuid) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MachineEvent::SessionStateChanged { machine_id, state } if machine_id == id => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn medium_changes(&self, id: Uuid) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MachineEvent::MediumChanged { machine_id, .. } if *machine_id == id))
            .count()
    }

    pub fn controller_changes(&self, id: Uuid) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MachineEvent::StorageControllerChanged { machine_id, controller } if machine_id == id => {
                    Some(controller)
                }
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: MachineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---- clients ----

/// Scriptable session client.
pub struct FakeClient {
    pid: u32,
    alive: AtomicBool,
    refuse_assign: AtomicBool,
    refuse_devices: AtomicBool,
    hold_uninitialize: AtomicBool,
    released: Notify,
    calls: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            alive: AtomicBool::new(true),
            refuse_assign: AtomicBool::new(false),
            refuse_devices: AtomicBool::new(false),
            hold_uninitialize: AtomicBool::new(false),
            released: Notify::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> DynClientHandle {
        self.clone()
    }

    pub fn die(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn refuse_assignment(&self) {
        self.refuse_assign.store(true, Ordering::SeqCst);
    }

    /// Reject hot-plug notifications.
    pub fn refuse_devices(&self) {
        self.refuse_devices.store(true, Ordering::SeqCst);
    }

    /// Make `uninitialize` wait for [`release_uninitialize`](Self::release_uninitialize).
    pub fn hold_uninitialize(&self) {
        self.hold_uninitialize.store(true, Ordering::SeqCst);
    }

    pub fn release_uninitialize(&self) {
        self.released.notify_one();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClientHandle for FakeClient {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn assign_machine(&self, _machine_id: Uuid, lock_type: LockType, _token: Uuid) -> Result<()> {
        self.record(format!("assign:{}", lock_type));
        if self.refuse_assign.load(Ordering::SeqCst) {
            return Err(MachineError::AccessDenied("client refused the session".into()));
        }
        Ok(())
    }

    async fn assign_remote_machine(&self, _machine_id: Uuid, console: &str) -> Result<()> {
        self.record(format!("assign_remote:{}", console));
        Ok(())
    }

    async fn get_remote_console(&self) -> Result<String> {
        Ok(format!("console-{}", self.pid))
    }

    async fn on_storage_device_change(&self, attachment: &MediumAttachment, remove: bool, _silent: bool) -> Result<()> {
        self.record(format!("device:{}:{}", attachment.slot(), remove));
        if self.refuse_devices.load(Ordering::SeqCst) {
            return Err(MachineError::AccessDenied("the VM refused the device".into()));
        }
        Ok(())
    }

    async fn on_medium_change(&self, attachment: &MediumAttachment, _force: bool) -> Result<()> {
        self.record(format!("medium:{}", attachment.slot()));
        Ok(())
    }

    async fn uninitialize(&self) -> Result<()> {
        self.record("uninitialize".into());
        if self.hold_uninitialize.load(Ordering::SeqCst) {
            self.released.notified().await;
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ---- processes ----

#[derive(Default)]
struct ChildState {
    exit: Option<ProcessExit>,
    killed: bool,
}

/// Launcher that hands out [`FakeChild`]s sharing one scripted exit status.
pub struct FakeLauncher {
    pid: u32,
    state: Arc<Mutex<ChildState>>,
    launched: Mutex<Vec<(String, Uuid)>>,
}

impl FakeLauncher {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            state: Arc::new(Mutex::new(ChildState::default())),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_with(&self, exit: ProcessExit) {
        self.state.lock().unwrap().exit = Some(exit);
    }

    pub fn was_killed(&self) -> bool {
        self.state.lock().unwrap().killed
    }

    pub fn launched(&self) -> Vec<(String, Uuid)> {
        self.launched.lock().unwrap().clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(
        &self,
        frontend: &str,
        machine_id: Uuid,
        _env: &LaunchEnvironment,
    ) -> io::Result<Box<dyn ChildProcess>> {
        self.launched
            .lock()
            .unwrap()
            .push((frontend.to_string(), machine_id));
        Ok(Box::new(FakeChild {
            pid: self.pid,
            state: self.state.clone(),
        }))
    }
}

pub struct FakeChild {
    pid: u32,
    state: Arc<Mutex<ChildState>>,
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.state.lock().unwrap().exit)
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.killed = true;
        state.exit = Some(ProcessExit::Signal(9));
        Ok(())
    }
}
