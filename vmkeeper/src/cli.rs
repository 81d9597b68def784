//! Subcommand implementations.
//!
//! Every command works directly on the registry file; no daemon is needed.
//! Registered machines are changed through a Write session held by an
//! in-process client for the duration of the command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use tokio::net::UnixStream;
use vmkeeper_protocol::{DeviceType, LaunchEnvironment, LockType, SessionState};

use vmkeeper::config::Config;
use vmkeeper::events::EventHub;
use vmkeeper::machine::aggregates::{SlotKey, StorageBus};
use vmkeeper::machine::{Machine, Services};
use vmkeeper::registry::{CleanupMode, Registry};
use vmkeeper::session::client::{ClientHandle, CommandLauncher, LocalClient, SocketClient};
use vmkeeper::session::progress::ProgressState;
use vmkeeper::session::{spawn_watcher, SessionHandle};
use vmkeeper::storage::image::ImageStore;
use vmkeeper::storage::medium::{MediaRegistry, MediumType};

pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

/// Build the services and load the registry file.
pub async fn open_registry(config: Config, events: Arc<EventHub>) -> Result<Arc<Registry>> {
    let media = Arc::new(MediaRegistry::new(ImageStore::new(
        config.storage.default_diff_format.clone(),
    )));
    let launcher = Arc::new(CommandLauncher::new(config.session.frontend_binary.clone()));
    let services = Services::new(Arc::new(config), events, media, launcher);
    let registry = Arc::new(Registry::new(Arc::new(services)));
    registry.load_state().await?;
    Ok(registry)
}

// ---------------------------------------------------------------------------
// sessions
// ---------------------------------------------------------------------------

async fn lock_write(machine: &Arc<Machine>) -> Result<SessionHandle> {
    let session = machine
        .lock_machine(Arc::new(LocalClient::new()), LockType::Write)
        .await
        .with_context(|| format!("locking machine {}", machine.id()))?;
    Ok(session)
}

/// Unlock `session`, reporting the first failure.
async fn finish(session: SessionHandle, result: vmkeeper::error::Result<()>) -> Result<()> {
    let unlocked = session.unlock().await;
    result?;
    unlocked.context("unlocking the session")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// machines
// ---------------------------------------------------------------------------

pub async fn run_create(
    registry: &Registry,
    name: &str,
    os_type: &str,
    base_folder: Option<&Path>,
    register: bool,
) -> Result<()> {
    let machine = registry.create_machine(name, os_type, base_folder)?;
    if register {
        registry.register_machine(&machine).await?;
    } else {
        machine.save_settings().await?;
    }
    println!("Machine '{}' created{}.", name, if register { " and registered" } else { "" });
    println!("UUID: {}", machine.id());
    println!("Settings file: {}", machine.settings_file().await.display());
    Ok(())
}

pub async fn run_register(registry: &Registry, settings_file: &Path) -> Result<()> {
    let machine = registry.open_machine(settings_file).await?;
    if !machine.is_accessible().await {
        anyhow::bail!(
            "machine {} is inaccessible: {}",
            machine.id(),
            machine.access_error().await.unwrap_or_default()
        );
    }
    registry.register_machine(&machine).await?;
    println!("Machine {} registered.", machine.id());
    Ok(())
}

pub async fn run_list(registry: &Registry) -> Result<()> {
    let machines = registry.machines().await;
    if machines.is_empty() {
        println!("No registered machines.");
        return Ok(());
    }
    for machine in machines {
        let name = machine
            .name()
            .await
            .unwrap_or_else(|_| "<inaccessible>".to_string());
        println!(
            "{:<24} {{{}}}  {:<12} session: {}",
            format!("\"{}\"", name),
            machine.id(),
            machine.state().await.to_string(),
            machine.session_state().await
        );
    }
    Ok(())
}

pub async fn run_show(registry: &Registry, name_or_id: &str) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    println!("UUID:            {}", machine.id());
    println!("Settings file:   {}", machine.settings_file().await.display());
    if !machine.is_accessible().await {
        println!("Accessible:      no");
        println!(
            "Access error:    {}",
            machine.access_error().await.unwrap_or_default()
        );
        return Ok(());
    }

    let identity = machine.identity().await?;
    let hardware = machine.hardware().await?;
    println!("Name:            {}", identity.name);
    if !identity.description.is_empty() {
        println!("Description:     {}", identity.description);
    }
    println!("Guest OS:        {}", identity.os_type_id);
    println!("Groups:          {}", identity.groups.join(","));
    println!("State:           {} (since {})", machine.state().await, machine.last_state_change().await);
    println!("Session:         {}", machine.session_state().await);
    if let Some(file) = machine.state_file().await {
        println!("Saved state:     {}", file.display());
    }
    println!("CPUs:            {}", hardware.cpu_count);
    println!("Memory:          {} MB", hardware.memory_mb);
    println!("VRAM:            {} MB", hardware.vram_mb);
    println!("Hardware UUID:   {}", hardware.hardware_uuid);

    let media = registry.services().media.clone();
    let controllers = machine.controllers().await?;
    let attachments = machine.attachments().await?;
    for controller in &controllers {
        println!(
            "Storage:         {} ({:?}, {} ports)",
            controller.name, controller.bus, controller.port_count
        );
        for att in attachments.iter().filter(|a| a.controller == controller.name) {
            let medium = match att.medium {
                Some(id) => match media.get(id).await {
                    Ok(m) => format!("{} {{{}}}", m.location.display(), id),
                    Err(_) => format!("<unknown> {{{}}}", id),
                },
                None => "<empty>".to_string(),
            };
            println!("  {}:{} {:<6} {}", att.port, att.device, att.device_type.to_string(), medium);
        }
    }

    let snapshots = machine.snapshots().await;
    if !snapshots.is_empty() {
        let current = machine.current_snapshot().await;
        println!("Snapshots:");
        for snapshot in &snapshots {
            let marker = if Some(snapshot.id) == current { " *" } else { "" };
            println!("  {} {{{}}}{}", snapshot.name, snapshot.id, marker);
        }
    }
    Ok(())
}

/// Identity and hardware changes requested by `modify`.
#[derive(Default)]
pub struct Modify {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
}

pub async fn run_modify(registry: &Registry, name_or_id: &str, changes: Modify) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session
            .with_view(|v| {
                if let Some(name) = &changes.name {
                    v.set_name(name)?;
                }
                if let Some(description) = &changes.description {
                    v.set_description(description)?;
                }
                if let Some(cpus) = changes.cpus {
                    v.set_cpu_count(cpus)?;
                }
                if let Some(memory) = changes.memory_mb {
                    v.set_memory_size(memory)?;
                }
                Ok(())
            })
            .await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await
}

pub async fn run_storagectl_add(registry: &Registry, name_or_id: &str, name: &str, bus: StorageBus) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session
            .with_view(|v| v.add_storage_controller(name, bus).map(|_| ()))
            .await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await
}

pub async fn run_storagectl_remove(registry: &Registry, name_or_id: &str, name: &str) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session.remove_storage_controller(name).await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await?;
    registry.save_state().await
}

// ---------------------------------------------------------------------------
// media
// ---------------------------------------------------------------------------

pub async fn run_createmedium(registry: &Registry, filename: PathBuf, size_mb: u64, medium_type: MediumType) -> Result<()> {
    let id = registry
        .services()
        .media
        .create_base_image(filename.clone(), size_mb, medium_type)
        .await?;
    registry.save_state().await?;
    println!("Medium created: {} {{{}}}", filename.display(), id);
    Ok(())
}

/// Find a registered medium by UUID or location. Unknown DVD and floppy
/// images are registered on the fly.
async fn resolve_medium(registry: &Registry, device_type: DeviceType, medium: &str) -> Result<Option<Uuid>> {
    if medium == "none" || medium == "emptydrive" {
        return Ok(None);
    }
    let media = &registry.services().media;
    if let Ok(id) = Uuid::parse_str(medium) {
        media.get(id).await?;
        return Ok(Some(id));
    }
    let location = std::path::absolute(medium).with_context(|| format!("resolving {}", medium))?;
    if let Some(medium) = media.find_by_location(&location).await {
        return Ok(Some(medium.id));
    }
    match device_type {
        DeviceType::Dvd | DeviceType::Floppy => {
            anyhow::ensure!(location.exists(), "{} does not exist", location.display());
            let format = if device_type == DeviceType::Dvd { "iso" } else { "img" };
            let id = media
                .register_base(location, device_type, MediumType::Readonly, format, 0)
                .await?;
            Ok(Some(id))
        }
        _ => anyhow::bail!(
            "{} is not a registered medium; create it with createmedium first",
            location.display()
        ),
    }
}

pub async fn run_attach(
    registry: &Registry,
    name_or_id: &str,
    slot: SlotKey,
    device_type: DeviceType,
    medium: &str,
) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let medium = resolve_medium(registry, device_type, medium).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session.attach_device(slot, device_type, medium).await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await?;
    registry.save_state().await
}

pub async fn run_detach(registry: &Registry, name_or_id: &str, slot: SlotKey) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session.detach_device(slot).await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await?;
    registry.save_state().await
}

/// Put `medium` into the removable drive at `slot`.
pub async fn run_mount(registry: &Registry, name_or_id: &str, slot: SlotKey, medium: &str, force: bool) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let device_type = machine
        .attachments()
        .await?
        .iter()
        .find(|a| a.matches(&slot))
        .map(|a| a.device_type)
        .with_context(|| format!("no device at {}", slot))?;
    let medium = resolve_medium(registry, device_type, medium).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session.mount_medium(slot, medium, force).await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await?;
    registry.save_state().await
}

pub async fn run_unmount(registry: &Registry, name_or_id: &str, slot: SlotKey, force: bool) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let session = lock_write(&machine).await?;
    let result = async {
        session.unmount_medium(slot, force).await?;
        session.save_settings().await
    }
    .await;
    finish(session, result).await?;
    registry.save_state().await
}

// ---------------------------------------------------------------------------
// snapshots
// ---------------------------------------------------------------------------

async fn resolve_snapshot(machine: &Machine, snapshot: &str) -> Result<Uuid> {
    let snapshots = machine.snapshots().await;
    let id = Uuid::parse_str(snapshot).ok();
    snapshots
        .iter()
        .find(|s| Some(s.id) == id || s.name == snapshot)
        .map(|s| s.id)
        .with_context(|| format!("no snapshot '{}'", snapshot))
}

pub async fn run_snapshot_take(registry: &Registry, name_or_id: &str, name: &str, description: &str) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let session = lock_write(&machine).await?;
    let taken = session.take_snapshot(name, description).await;
    let result = match taken {
        Ok((id, progress)) => match progress.wait().await {
            ProgressState::Completed => {
                println!("Snapshot taken: {} {{{}}}", name, id);
                Ok(())
            }
            ProgressState::Failed(reason) => Err(anyhow::anyhow!("snapshot failed: {}", reason)),
            other => Err(anyhow::anyhow!("snapshot did not complete: {:?}", other)),
        },
        Err(e) => Err(e.into()),
    };
    let unlocked = session.unlock().await;
    result?;
    unlocked.context("unlocking the session")?;
    registry.save_state().await
}

pub async fn run_snapshot_restore(registry: &Registry, name_or_id: &str, snapshot: &str) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let id = resolve_snapshot(&machine, snapshot).await?;
    let session = lock_write(&machine).await?;
    let result = session.restore_snapshot(id).await;
    finish(session, result).await?;
    registry.save_state().await
}

pub async fn run_snapshot_delete(registry: &Registry, name_or_id: &str, snapshot: &str) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let id = resolve_snapshot(&machine, snapshot).await?;
    let session = lock_write(&machine).await?;
    let result = session.delete_snapshot(id).await;
    finish(session, result).await?;
    registry.save_state().await
}

pub async fn run_unregister(registry: &Registry, name_or_id: &str, delete: bool) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    if !delete {
        registry
            .unregister_machine(machine.id(), CleanupMode::UnregisterOnly)
            .await?;
        println!("Machine {} unregistered.", machine.id());
        return Ok(());
    }

    let disks = registry
        .unregister_machine(machine.id(), CleanupMode::DetachAllReturnHardDisksOnly)
        .await?;
    registry.delete_machine_config(&machine).await?;
    println!("Machine {} unregistered and its settings deleted.", machine.id());
    for disk in disks {
        println!("  detached hard disk {{{}}}", disk);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `vmkeeper check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking configuration...\n");

    let mut checks = vec![
        check_dir("Machines directory", &config.server.machines_dir),
        check_dir("Images directory", &config.storage.images_dir),
        check_frontend(config),
    ];
    if let Some(parent) = config.server.registry_file.parent() {
        checks.push(check_dir("Registry directory", parent));
    }
    checks.extend(check_machines(config).await);

    let all_pass = checks.iter().all(|c| c.ok);
    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = c.fix.as_ref().filter(|_| !c.ok) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    if all_pass {
        println!("All checks passed.");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_dir(label: &'static str, dir: &Path) -> Check {
    if dir.is_dir() {
        return Check::pass(label, dir.display().to_string());
    }
    match std::fs::create_dir_all(dir) {
        Ok(()) => Check::pass(label, format!("{} (created)", dir.display())),
        Err(e) => Check::fail(
            label,
            format!("{} does not exist and could not be created: {}", dir.display(), e),
            format!("mkdir -p {}", dir.display()),
        ),
    }
}

fn check_frontend(config: &Config) -> Check {
    use std::os::unix::fs::PermissionsExt;

    let path = &config.session.frontend_binary;
    match std::fs::metadata(path) {
        Ok(meta) if meta.permissions().mode() & 0o111 != 0 => {
            Check::pass("Front-end binary", path.display().to_string())
        }
        Ok(_) => Check::fail(
            "Front-end binary",
            format!("{} is not executable", path.display()),
            format!("chmod +x {}", path.display()),
        ),
        Err(e) => Check::fail(
            "Front-end binary",
            format!("{}: {}", path.display(), e),
            "Set session.frontend_binary in the config file",
        ),
    }
}

/// Load the registry and report every machine whose settings cannot be read.
async fn check_machines(config: &Config) -> Vec<Check> {
    let registry = match open_registry(config.clone(), Arc::new(EventHub::new())).await {
        Ok(r) => r,
        Err(e) => {
            return vec![Check::fail(
                "Registry file",
                format!("{:#}", e),
                format!("Inspect or move away {}", config.server.registry_file.display()),
            )]
        }
    };

    let mut checks = vec![Check::pass(
        "Registry file",
        config.server.registry_file.display().to_string(),
    )];
    for machine in registry.machines().await {
        if machine.is_accessible().await {
            continue;
        }
        let accessible = machine.recheck_accessibility().await.unwrap_or(false);
        if !accessible {
            checks.push(Check::fail(
                "Machine settings",
                format!(
                    "{}: {}",
                    machine.id(),
                    machine.access_error().await.unwrap_or_default()
                ),
                format!("vmkeeper unregister {}", machine.id()),
            ));
        }
    }
    checks
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

/// Watch sessions of registered machines and log events until SIGINT.
/// Environment variable telling a launched front-end where to listen for
/// the manager's control connection.
pub const CONTROL_SOCKET_VAR: &str = "VMKEEPER_CONTROL_SOCKET";

/// Per-request timeout on the control connection.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to a front-end's control socket, retrying until `timeout` while
/// the process is still starting.
async fn connect_control(socket: &Path, timeout: Duration) -> Result<SocketClient<UnixStream>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match SocketClient::connect_unix(socket, CONTROL_TIMEOUT).await {
            Ok(client) => return Ok(client),
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::debug!(socket = %socket.display(), error = %e, "control socket not ready");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("connecting to front-end at {}", socket.display()));
            }
        }
    }
}

/// Launch a front-end, hand it a VM session over its control socket and
/// keep watching the machine until the session ends or SIGINT arrives.
pub async fn run_startvm(registry: Arc<Registry>, name_or_id: &str, frontend: &str, socket: &Path) -> Result<()> {
    let machine = registry.lookup(name_or_id).await?;
    let config = Arc::clone(&registry.services().config);
    let mut env = LaunchEnvironment::default();
    env.vars
        .insert(CONTROL_SOCKET_VAR.to_string(), socket.display().to_string());

    let progress = machine
        .launch_vm_process(Arc::new(LocalClient::new()), frontend, &env)
        .await?;
    let interval = Duration::from_millis(config.server.death_check_interval_ms);
    let watcher = spawn_watcher(Arc::clone(&registry), interval);

    let result: Result<()> = async {
        let client = connect_control(socket, Duration::from_secs(config.session.spawn_timeout_secs)).await?;
        let pid = client.pid();
        let session = machine
            .lock_machine(Arc::new(client), LockType::Vm)
            .await
            .context("handing the session to the front-end")?;
        match progress.wait().await {
            ProgressState::Completed => {}
            ProgressState::Failed(reason) => anyhow::bail!("front-end failed to start: {}", reason),
            other => anyhow::bail!("front-end did not start: {:?}", other),
        }
        println!("Machine {} started by front-end pid {}.", machine.id(), pid);

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if machine.session_state().await == SessionState::Unlocked {
                        println!("Session of machine {} ended.", machine.id());
                        return Ok(());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, closing the session");
                    session.unlock().await?;
                    return Ok(());
                }
            }
        }
    }
    .await;

    watcher.abort();
    result?;
    registry.save_state().await
}

pub async fn run_serve(registry: Arc<Registry>, events: Arc<EventHub>) -> Result<()> {
    let config = Arc::clone(&registry.services().config);
    tracing::info!(
        machines = registry.machines().await.len(),
        registry = %config.server.registry_file.display(),
        "vmkeeper serving"
    );

    let mut rx = events.subscribe();
    let watcher = spawn_watcher(
        Arc::clone(&registry),
        Duration::from_millis(config.server.death_check_interval_ms),
    );

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    tracing::info!(machine_id = %event.machine_id(), ?event, "machine event");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    watcher.abort();
    registry.save_state().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.server.registry_file = dir.join("registry.json");
        config.server.machines_dir = dir.join("machines");
        config.storage.images_dir = dir.join("images");
        config.session.frontend_binary = dir.join("frontend");
        config
    }

    async fn open(dir: &Path) -> Arc<Registry> {
        open_registry(config_in(dir), Arc::new(EventHub::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn modify_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        let changes = Modify {
            name: None,
            description: Some("build box".into()),
            cpus: Some(2),
            memory_mb: Some(256),
        };
        run_modify(&registry, "vm1", changes).await.unwrap();

        let reopened = open(dir.path()).await;
        let machine = reopened.lookup("vm1").await.unwrap();
        let hardware = machine.hardware().await.unwrap();
        assert_eq!(hardware.memory_mb, 256);
        assert_eq!(hardware.cpu_count, 2);
        assert_eq!(machine.identity().await.unwrap().description, "build box");
        assert_eq!(machine.session_state().await, vmkeeper_protocol::SessionState::Unlocked);
    }

    #[tokio::test]
    async fn rejected_change_leaves_settings_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        let changes = Modify {
            name: None,
            description: None,
            cpus: Some(0),
            memory_mb: None,
        };
        assert!(run_modify(&registry, "vm1", changes).await.is_err());

        let machine = registry.lookup("vm1").await.unwrap();
        assert_eq!(machine.hardware().await.unwrap().cpu_count, 1);
        assert!(!machine.is_modified().await);
        assert_eq!(machine.session_state().await, vmkeeper_protocol::SessionState::Unlocked);
    }

    #[tokio::test]
    async fn attach_registers_iso_on_the_fly() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("install.iso");
        std::fs::write(&iso, b"iso").unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        run_storagectl_add(&registry, "vm1", "IDE", StorageBus::Ide).await.unwrap();

        let dvd = SlotKey::new("IDE".to_string(), 0, 0);
        run_attach(&registry, "vm1", dvd, DeviceType::Dvd, iso.to_str().unwrap())
            .await
            .unwrap();
        let empty = SlotKey::new("IDE".to_string(), 1, 0);
        run_attach(&registry, "vm1", empty, DeviceType::Dvd, "emptydrive")
            .await
            .unwrap();

        let reopened = open(dir.path()).await;
        let medium = reopened.services().media.find_by_location(&iso).await.unwrap();
        assert_eq!(medium.medium_type, MediumType::Readonly);
        let attachments = reopened.lookup("vm1").await.unwrap().attachments().await.unwrap();
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].medium, Some(medium.id));
        assert_eq!(attachments[1].medium, None);
    }

    #[tokio::test]
    async fn mount_swaps_dvd_images() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        run_storagectl_add(&registry, "vm1", "IDE", StorageBus::Ide).await.unwrap();
        let slot = SlotKey::new("IDE".to_string(), 1, 0);
        run_attach(&registry, "vm1", slot.clone(), DeviceType::Dvd, "emptydrive")
            .await
            .unwrap();

        let iso = dir.path().join("install.iso");
        std::fs::write(&iso, b"iso").unwrap();
        run_mount(&registry, "vm1", slot.clone(), iso.to_str().unwrap(), false)
            .await
            .unwrap();
        let machine = open(dir.path()).await.lookup("vm1").await.unwrap();
        let medium = machine.attachments().await.unwrap()[0].medium;
        assert!(medium.is_some());

        run_unmount(&registry, "vm1", slot.clone(), false).await.unwrap();
        let machine = open(dir.path()).await.lookup("vm1").await.unwrap();
        assert_eq!(machine.attachments().await.unwrap()[0].medium, None);

        let missing = SlotKey::new("IDE".to_string(), 0, 0);
        let err = run_mount(&registry, "vm1", missing, iso.to_str().unwrap(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no device"));
    }

    #[tokio::test]
    async fn attach_refuses_unknown_hard_disk() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        run_storagectl_add(&registry, "vm1", "SATA", StorageBus::Sata).await.unwrap();

        let slot = SlotKey::new("SATA".to_string(), 0, 0);
        let missing = dir.path().join("missing.vdi");
        let err = run_attach(&registry, "vm1", slot, DeviceType::HardDisk, missing.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("createmedium"));
    }

    #[tokio::test]
    async fn unregister_delete_removes_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        let settings = registry.lookup("vm1").await.unwrap().settings_file().await;
        assert!(settings.exists());

        run_unregister(&registry, "vm1", true).await.unwrap();
        assert!(!settings.exists());
        assert!(open(dir.path()).await.machines().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_restore_brings_back_settings() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        run_create(&registry, "vm1", "Linux_64", None, true).await.unwrap();
        run_storagectl_add(&registry, "vm1", "SATA", StorageBus::Sata).await.unwrap();
        let disk = dir.path().join("disk.vdi");
        run_createmedium(&registry, disk.clone(), 64, MediumType::Normal).await.unwrap();
        let slot = SlotKey::new("SATA".to_string(), 0, 0);
        run_attach(&registry, "vm1", slot, DeviceType::HardDisk, disk.to_str().unwrap())
            .await
            .unwrap();

        run_snapshot_take(&registry, "vm1", "clean", "").await.unwrap();
        let changes = Modify {
            cpus: Some(4),
            ..Default::default()
        };
        run_modify(&registry, "vm1", changes).await.unwrap();
        run_snapshot_restore(&registry, "vm1", "clean").await.unwrap();

        let registry = open(dir.path()).await;
        let machine = registry.lookup("vm1").await.unwrap();
        assert_eq!(machine.hardware().await.unwrap().cpu_count, 1);
        assert_eq!(machine.snapshots().await.len(), 1);

        run_snapshot_delete(&registry, "vm1", "clean").await.unwrap();
        assert!(machine.snapshots().await.is_empty());
        assert!(run_snapshot_delete(&registry, "vm1", "clean").await.is_err());
    }

    #[tokio::test]
    async fn control_connection_waits_for_the_frontend() {
        use vmkeeper::session::client::{read_message, write_message};
        use vmkeeper_protocol::{ControlRequest, ControlResponse, PongResponse};

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let path = socket.clone();
        let frontend = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = tokio::net::UnixListener::bind(&path).unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: ControlRequest = read_message(&mut stream).await.unwrap();
            assert!(matches!(req, ControlRequest::Ping));
            let pong = ControlResponse::Pong(PongResponse {
                pid: 4242,
                frontend: Some("headless".into()),
            });
            write_message(&mut stream, &pong).await.unwrap();
        });

        let client = connect_control(&socket, Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.pid(), 4242);
        frontend.await.unwrap();

        let missing = dir.path().join("missing.sock");
        let err = connect_control(&missing, Duration::from_millis(300)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("missing.sock"));
    }

    #[tokio::test]
    async fn startvm_needs_a_known_machine() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(dir.path()).await;
        let socket = dir.path().join("control.sock");
        assert!(run_startvm(registry, "vm1", "", &socket).await.is_err());
    }

    #[tokio::test]
    async fn check_fails_without_frontend() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(run_check(&config).await.is_err());

        std::fs::write(&config.session.frontend_binary, b"#!/bin/sh\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&config.session.frontend_binary, perms).unwrap();
        }
        run_check(&config).await.unwrap();
    }
}
