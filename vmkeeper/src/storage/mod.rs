//! Storage attachment engine.
//!
//! Attaching a read-only hard disk never writes to it: the engine either
//! re-uses a differencing image that the machine already owns for that base
//! or creates a new implicit one. Implicit diffs live only as long as the
//! transaction that created them; rollback deletes them, commit keeps them.

pub mod image;
pub mod lock;
pub mod medium;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use vmkeeper_protocol::DeviceType;

use crate::error::{MachineError, Result};
use crate::events::MachineEvent;
use crate::machine::aggregates::{
    find_attachment, find_attachment_by_medium, MediumAttachment, SlotKey, StorageController,
};
use crate::machine::snapshot::SnapshotTree;
use crate::machine::state::StateDependency;
use crate::machine::{Machine, MachineData, StateChangeLock, Target};

use self::lock::{MediumLockList, MediumLockMap};
use self::medium::{MediaTree, Medium, MediumState, MediumType};

/// How an attach request is satisfied.
#[derive(Debug, Clone, PartialEq)]
enum AttachPlan {
    /// Put back the attachment the transaction started with.
    Restore(MediumAttachment),
    /// Attach the medium itself. `associate` is false when the medium is
    /// still referenced from the transaction's starting point.
    Direct { medium: Option<Uuid>, associate: bool },
    /// Create a differencing image below `parent` and attach that.
    Diff { parent: Uuid },
}

fn find_controller<'a>(controllers: &'a [StorageController], name: &str) -> Result<&'a StorageController> {
    controllers
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| MachineError::ObjectNotFound(format!("no storage controller named '{}'", name)))
}

fn validate_slot(controller: &StorageController, slot: &SlotKey, device_type: DeviceType) -> Result<()> {
    let devices = controller.bus.devices_per_port();
    if slot.port >= controller.port_count || slot.device >= devices {
        return Err(MachineError::InvalidArgument(format!(
            "invalid slot {}: controller '{}' has ports 0-{} and devices 0-{}",
            slot,
            controller.name,
            controller.port_count.saturating_sub(1),
            devices - 1
        )));
    }
    if !matches!(device_type, DeviceType::HardDisk | DeviceType::Dvd | DeviceType::Floppy) {
        return Err(MachineError::InvalidArgument(format!(
            "cannot attach a {} device to a storage controller",
            device_type
        )));
    }
    if !controller.bus.accepts(device_type) {
        return Err(MachineError::InvalidArgument(format!(
            "controller '{}' ({}) cannot take a {} device",
            controller.name, controller.bus, device_type
        )));
    }
    Ok(())
}

fn check_hotplug(controller: &StorageController, device_type: DeviceType) -> Result<()> {
    if !controller.bus.supports_hotplug() || device_type == DeviceType::Floppy {
        return Err(MachineError::InvalidState(format!(
            "controller '{}' does not support hot-plugging {} devices",
            controller.name, device_type
        )));
    }
    Ok(())
}

fn check_medium_usable(medium: &Medium, device_type: DeviceType) -> Result<()> {
    if medium.device_type != device_type {
        return Err(MachineError::InvalidArgument(format!(
            "medium '{}' is a {} medium and cannot be used as {}",
            medium.name(),
            medium.device_type,
            device_type
        )));
    }
    if medium.state != MediumState::Created {
        return Err(MachineError::InvalidState(format!(
            "medium '{}' is {:?}",
            medium.name(),
            medium.state
        )));
    }
    Ok(())
}

/// Among `attachments`, the one whose medium descends from `base`. An entry
/// at `slot` wins outright; otherwise the deepest diff wins and ties go to
/// the first one found.
fn best_descendant(
    tree: &MediaTree,
    base: Uuid,
    slot: &SlotKey,
    attachments: &[MediumAttachment],
    skip: impl Fn(Uuid) -> bool,
) -> Option<Uuid> {
    let mut found: Option<(Uuid, u32)> = None;
    for att in attachments {
        let Some(medium) = att.medium else { continue };
        if skip(medium) {
            continue;
        }
        let Ok((root, level)) = tree.base_of(medium) else {
            continue;
        };
        if root != base {
            continue;
        }
        if att.matches(slot) {
            return Some(medium);
        }
        if found.map_or(true, |(_, best)| level > best) {
            found = Some((medium, level));
        }
    }
    found.map(|(medium, _)| medium)
}

#[allow(clippy::too_many_arguments)]
fn plan_hard_disk(
    tree: &MediaTree,
    machine_id: Uuid,
    medium: &Medium,
    slot: &SlotKey,
    current: &[MediumAttachment],
    backed_up: Option<&[MediumAttachment]>,
    snapshots: &SnapshotTree,
    current_snapshot: Option<Uuid>,
) -> Result<AttachPlan> {
    let id = medium.id;

    // Detached earlier in this transaction: put it back.
    if let Some(old) = backed_up.and_then(|b| find_attachment_by_medium(b, id)) {
        if old.matches(slot) {
            return Ok(AttachPlan::Restore(old.clone()));
        }
        return Ok(AttachPlan::Direct {
            medium: Some(id),
            associate: false,
        });
    }

    if !medium.is_read_only() {
        if let Some(other) = medium.in_current_state_of_other(machine_id) {
            if medium.medium_type != MediumType::Shareable {
                return Err(MachineError::ObjectInUse(format!(
                    "medium '{}' is already attached to machine {}",
                    medium.name(),
                    other
                )));
            }
        }
        return Ok(AttachPlan::Direct {
            medium: Some(id),
            associate: true,
        });
    }

    // A diff of this base detached in this transaction.
    if let Some(backed_up) = backed_up {
        let reuse = best_descendant(tree, id, slot, backed_up, |m| {
            find_attachment_by_medium(current, m).is_some()
        });
        if let Some(diff) = reuse {
            return Ok(AttachPlan::Direct {
                medium: Some(diff),
                associate: false,
            });
        }
    }

    // Chain the new diff below what the closest snapshot used.
    let mut parent = id;
    let mut cursor = current_snapshot;
    while let Some(snapshot_id) = cursor {
        let Some(snapshot) = snapshots.get(&snapshot_id) else {
            break;
        };
        if let Some(found) = best_descendant(tree, id, slot, &snapshot.attachments, |_| false) {
            parent = found;
            break;
        }
        cursor = snapshot.parent;
    }
    Ok(AttachPlan::Diff { parent })
}

/// Lock the media of a new attachment when the session holds media locks.
fn lock_attachment_media(
    data: &mut MachineData,
    tree: &mut MediaTree,
    target: Target,
    attachment: &MediumAttachment,
) -> Result<()> {
    if target == Target::AtRest {
        return Ok(());
    }
    let Some(map) = data.session.locked_media.as_mut() else {
        return Ok(());
    };
    match MediumLockList::for_attachment(tree, attachment)? {
        Some(list) => map.insert(tree, attachment.slot(), list),
        None => Ok(()),
    }
}

fn register_attachment(
    data: &mut MachineData,
    tree: &mut MediaTree,
    target: Target,
    attachment: &MediumAttachment,
    associate: bool,
) -> Result<()> {
    let machine_id = data.id;
    let associated = if associate { attachment.medium } else { None };
    if let Some(medium) = associated {
        tree.add_backref(medium, machine_id, None)?;
    }
    let added = lock_attachment_media(data, tree, target, attachment).and_then(|()| {
        let (config, _) = data.aggregates_mut(target)?;
        config.attachments_mut()?.push(attachment.clone());
        Ok(())
    });
    if let Err(e) = added {
        if let Some(medium) = associated {
            tree.remove_backref(medium, machine_id, None);
        }
        return Err(e);
    }
    Ok(())
}

/// Drop an attachment from the list of `target`. Returns implicit diffs that
/// must be deleted; their references are already gone.
fn remove_attachment(
    data: &mut MachineData,
    tree: &mut MediaTree,
    target: Target,
    attachment: &MediumAttachment,
) -> Result<Vec<Uuid>> {
    let machine_id = data.id;
    let slot = attachment.slot();
    if target != Target::AtRest {
        if let Some(map) = data.session.locked_media.as_mut() {
            map.remove(tree, &slot);
        }
    }
    let (config, _) = data.aggregates_mut(target)?;
    let list = config.attachments_mut()?;
    list.retain(|a| !a.matches(&slot));

    let mut diffs = Vec::new();
    if let Some(medium) = attachment.medium {
        if attachment.implicit {
            tree.remove_backref(medium, machine_id, None);
            diffs.push(medium);
        } else if attachment.device_type != DeviceType::HardDisk
            && find_attachment_by_medium(list, medium).is_none()
        {
            // Hard disk references stay until commit so a rollback can
            // restore them.
            tree.remove_backref(medium, machine_id, None);
        }
    }
    Ok(diffs)
}

/// Swap the medium of a DVD or floppy attachment in place.
fn swap_medium(
    data: &mut MachineData,
    tree: &mut MediaTree,
    target: Target,
    slot: &SlotKey,
    medium: Option<Uuid>,
) -> Result<MediumAttachment> {
    let machine_id = data.id;
    let (config, _) = data.aggregates(target)?;
    let old = find_attachment(config.attachments()?, slot)
        .cloned()
        .ok_or_else(|| MachineError::ObjectNotFound(format!("no device attached to slot {}", slot)))?;
    let mut updated = old.clone();
    updated.medium = medium;
    if let Some(id) = medium {
        check_medium_usable(tree.get(id)?, old.device_type)?;
        tree.add_backref(id, machine_id, None)?;
    }

    if target != Target::AtRest {
        if let Some(map) = data.session.locked_media.as_mut() {
            let previous = map.remove(tree, slot);
            let relocked = match MediumLockList::for_attachment(tree, &updated) {
                Ok(Some(list)) => map.insert(tree, slot.clone(), list),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = relocked {
                if let Some(previous) = previous {
                    if let Err(again) = map.insert(tree, slot.clone(), previous) {
                        warn!(machine_id = %machine_id, slot = %slot, error = %again, "cannot re-lock previous medium");
                    }
                }
                if let Some(id) = medium {
                    if old.medium != Some(id) {
                        tree.remove_backref(id, machine_id, None);
                    }
                }
                return Err(e);
            }
        }
    }

    let (config, _) = data.aggregates_mut(target)?;
    let list = config.attachments_mut()?;
    if let Some(att) = list.iter_mut().find(|a| a.matches(slot)) {
        att.medium = medium;
    }
    if let Some(previous) = old.medium {
        if find_attachment_by_medium(list, previous).is_none() {
            tree.remove_backref(previous, machine_id, None);
        }
    }
    Ok(updated)
}

/// Make the attachment changes of `target` permanent as far as media are
/// concerned. Runs just before the aggregate commit.
pub(crate) fn commit_media(data: &mut MachineData, target: Target, tree: &mut MediaTree) -> Result<()> {
    let machine_id = data.id;
    let (config, _) = data.aggregates_mut(target)?;
    let Some(old) = config.backed_up_attachments().cloned() else {
        return Ok(());
    };
    if config.attachments()?.iter().any(|a| a.implicit) {
        for att in config.attachments_mut()?.iter_mut() {
            att.implicit = false;
        }
    }
    let current = config.attachments()?;
    for att in old.iter().filter(|a| a.device_type == DeviceType::HardDisk) {
        let Some(medium) = att.medium else { continue };
        if find_attachment_by_medium(current, medium).is_none() {
            tree.remove_backref(medium, machine_id, None);
            debug!(machine_id = %machine_id, medium_id = %medium, "hard disk detached");
        }
    }
    Ok(())
}

/// Undo the media side of the attachment changes of `target`. Runs just
/// before the aggregate rollback and returns the implicit diffs to delete.
pub(crate) fn rollback_media(data: &mut MachineData, target: Target, tree: &mut MediaTree) -> Result<Vec<Uuid>> {
    let machine_id = data.id;
    let (config, _) = data.aggregates(target)?;
    let Some(baseline) = config.backed_up_attachments().cloned() else {
        return Ok(Vec::new());
    };
    let current = config.attachments()?.clone();

    let mut diffs = Vec::new();
    for att in &current {
        let Some(medium) = att.medium else { continue };
        if find_attachment_by_medium(&baseline, medium).is_some() {
            continue;
        }
        tree.remove_backref(medium, machine_id, None);
        if att.implicit {
            diffs.push(medium);
        }
    }
    for att in baseline.iter().filter(|a| a.device_type != DeviceType::HardDisk) {
        let Some(medium) = att.medium else { continue };
        if find_attachment_by_medium(&current, medium).is_none() {
            if let Err(e) = tree.add_backref(medium, machine_id, None) {
                warn!(machine_id = %machine_id, medium_id = %medium, error = %e, "cannot restore medium reference");
            }
        }
    }

    if target != Target::AtRest {
        if let Some(map) = data.session.locked_media.as_mut() {
            map.clear(tree);
            let mut rebuilt = MediumLockMap::build(tree, &baseline)?;
            rebuilt.lock(tree)?;
            *map = rebuilt;
        }
    }
    Ok(diffs)
}

impl Machine {
    /// Attach a device to the at-rest record of an unregistered machine.
    pub async fn attach_device(&self, slot: SlotKey, device_type: DeviceType, medium: Option<Uuid>) -> Result<()> {
        self.attach_device_for(Target::AtRest, slot, device_type, medium).await
    }

    pub async fn detach_device(&self, slot: SlotKey) -> Result<()> {
        self.detach_device_for(Target::AtRest, slot).await
    }

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn attach_device_for(
        &self,
        target: Target,
        slot: SlotKey,
        device_type: DeviceType,
        medium: Option<Uuid>,
    ) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.check_dependency(target, StateDependency::MutableOrRunning)?;
        let online = lock.state.is_online();
        let name = lock.name();

        let (config, _) = lock.aggregates(target)?;
        let controller = find_controller(config.controllers()?, &slot.controller)?;
        validate_slot(controller, &slot, device_type)?;
        if let Some(existing) = find_attachment(config.attachments()?, &slot) {
            return Err(MachineError::ObjectInUse(format!(
                "slot {} of machine '{}' already holds a {} device",
                slot, name, existing.device_type
            )));
        }
        if online {
            check_hotplug(controller, device_type)?;
        }
        let current = config.attachments()?.clone();
        let backed_up = config.backed_up_attachments().cloned();

        let plan = match medium {
            None if device_type == DeviceType::HardDisk => {
                return Err(MachineError::InvalidArgument(
                    "a hard disk attachment needs a medium".into(),
                ));
            }
            None => AttachPlan::Direct {
                medium: None,
                associate: false,
            },
            Some(id) => {
                let tree = self.services().media.read().await;
                let m = tree.get(id)?;
                check_medium_usable(m, device_type)?;
                if device_type == DeviceType::HardDisk {
                    if let Some(other) = find_attachment_by_medium(&current, id) {
                        return Err(MachineError::ObjectInUse(format!(
                            "medium '{}' is already attached to slot {} of machine '{}'",
                            m.name(),
                            other.slot(),
                            name
                        )));
                    }
                    plan_hard_disk(
                        &tree,
                        self.id(),
                        m,
                        &slot,
                        &current,
                        backed_up.as_deref(),
                        &lock.snapshots,
                        lock.current_snapshot,
                    )?
                } else {
                    AttachPlan::Direct {
                        medium: Some(id),
                        associate: true,
                    }
                }
            }
        };
        debug!(?plan, "attach plan");

        let (attachment, associate, created) = match plan {
            AttachPlan::Restore(old) => (old, false, None),
            AttachPlan::Direct { medium, associate } => {
                (MediumAttachment::new(&slot, device_type, medium), associate, None)
            }
            AttachPlan::Diff { parent } => {
                let (relocked, diff) = self.create_implicit_diff(lock, parent).await;
                lock = relocked;
                let diff = diff?;

                // The machine lock was released while the image was written.
                let still_valid = lock
                    .check_dependency(target, StateDependency::MutableOrRunning)
                    .and_then(|()| {
                        let (config, _) = lock.aggregates(target)?;
                        match find_attachment(config.attachments()?, &slot) {
                            Some(_) => Err(MachineError::ObjectInUse(format!(
                                "slot {} was taken while its differencing image was created",
                                slot
                            ))),
                            None => Ok(()),
                        }
                    });
                if let Err(e) = still_valid {
                    self.discard_diff(diff).await;
                    return Err(e);
                }
                let mut att = MediumAttachment::new(&slot, device_type, Some(diff));
                att.implicit = true;
                (att, true, Some(diff))
            }
        };

        let registered = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            register_attachment(data, &mut tree, target, &attachment, associate)
        };
        if let Err(e) = registered {
            if let Some(diff) = created {
                self.discard_diff(diff).await;
            }
            return Err(e);
        }

        if online {
            if let Some(client) = lock.session.direct_client() {
                let pending = lock.release();
                let notified = client.on_storage_device_change(&attachment, false, false).await;
                lock = pending.relock(self).await;
                if let Err(e) = notified {
                    warn!(slot = %slot, error = %e, "VM process refused the new device");
                    let diffs = {
                        let data = &mut *lock;
                        let mut tree = self.services().media.write().await;
                        remove_attachment(data, &mut tree, target, &attachment).unwrap_or_else(|rm| {
                            warn!(slot = %slot, error = %rm, "cannot remove the refused device");
                            Vec::new()
                        })
                    };
                    if associate && !attachment.implicit {
                        if let Some(m) = attachment.medium {
                            self.services().media.write().await.remove_backref(m, self.id(), None);
                        }
                    }
                    let (_lock, deleted) = self.delete_implicit_diffs(lock, diffs).await;
                    if let Err(del) = deleted {
                        warn!(slot = %slot, error = %del, "implicit diff of the refused device left behind");
                    }
                    return Err(e);
                }
            }
        }

        info!(
            slot = %slot,
            device = %device_type,
            medium_id = ?attachment.medium,
            implicit = attachment.implicit,
            "device attached"
        );
        Ok(())
    }

    /// Create a differencing image below `parent` for an implicit
    /// attachment. The machine lock is released while the file is written.
    async fn create_implicit_diff<'a>(
        &'a self,
        mut lock: StateChangeLock<'a>,
        parent: Uuid,
    ) -> (StateChangeLock<'a>, Result<Uuid>) {
        let images = self.services().media.images();
        let id = Uuid::new_v4();
        let location = images.diff_location(&lock.snapshot_folder_path(), id);
        let size_mb = {
            let mut tree = self.services().media.write().await;
            match tree.create_diff_placeholder(id, parent, location.clone(), images.diff_format()) {
                Ok(_) => tree.get(id).map(|m| m.logical_size_mb).unwrap_or(0),
                Err(e) => return (lock, Err(e)),
            }
        };

        let previous = lock.state;
        let guarded = !previous.is_online_or_transient();
        if guarded {
            lock.set_state(vmkeeper_protocol::MachineState::SettingUp);
        }
        let pending = lock.release();
        let written = images.create_diff(&location, id, parent, size_mb).await;
        let mut lock = pending.relock(self).await;
        if guarded {
            lock.set_state(previous);
        }

        let mut tree = self.services().media.write().await;
        let result = match written {
            Ok(()) => tree.mark_created(id).map(|()| id),
            Err(e) => {
                if let Err(rm) = tree.remove(id) {
                    warn!(medium_id = %id, error = %rm, "cannot drop differencing image placeholder");
                }
                Err(e)
            }
        };
        drop(tree);
        (lock, result)
    }

    async fn discard_diff(&self, id: Uuid) {
        if let Err(e) = self.services().media.delete_storage(id).await {
            warn!(machine_id = %self.id(), medium_id = %id, error = %e, "cannot delete unused differencing image");
        }
    }

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn detach_device_for(&self, target: Target, slot: SlotKey) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.check_dependency(target, StateDependency::MutableOrRunning)?;
        let online = lock.state.is_online();

        let find = |data: &MachineData| -> Result<MediumAttachment> {
            let (config, _) = data.aggregates(target)?;
            find_attachment(config.attachments()?, &slot)
                .cloned()
                .ok_or_else(|| {
                    MachineError::ObjectNotFound(format!(
                        "no device attached to slot {} of machine '{}'",
                        slot,
                        data.name()
                    ))
                })
        };
        let mut attachment = find(&*lock)?;

        if online {
            let (config, _) = lock.aggregates(target)?;
            check_hotplug(find_controller(config.controllers()?, &slot.controller)?, attachment.device_type)?;
            if let Some(client) = lock.session.direct_client() {
                let pending = lock.release();
                let notified = client.on_storage_device_change(&attachment, true, false).await;
                lock = pending.relock(self).await;
                notified?;
                attachment = find(&*lock)?;
            }
        }

        let diffs = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            remove_attachment(data, &mut tree, target, &attachment)?
        };
        let (_lock, result) = self.delete_implicit_diffs(lock, diffs).await;
        info!(slot = %slot, medium_id = ?attachment.medium, "device detached");
        result
    }

    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn mount_medium_for(
        &self,
        target: Target,
        slot: SlotKey,
        medium: Option<Uuid>,
        force: bool,
    ) -> Result<()> {
        let mut data = self.lock().await;
        data.check_accessible()?;
        data.check_dependency(target, StateDependency::MutableOrRunning)?;
        let online = data.state.is_online();

        let (config, _) = data.aggregates(target)?;
        let old = find_attachment(config.attachments()?, &slot)
            .cloned()
            .ok_or_else(|| MachineError::ObjectNotFound(format!("no device attached to slot {}", slot)))?;
        if !matches!(old.device_type, DeviceType::Dvd | DeviceType::Floppy) {
            return Err(MachineError::InvalidArgument(format!(
                "slot {} holds a {} device; only DVD and floppy media can be changed",
                slot, old.device_type
            )));
        }
        if old.medium == medium {
            return Ok(());
        }

        let updated = {
            let d = &mut *data;
            let mut tree = self.services().media.write().await;
            swap_medium(d, &mut tree, target, &slot, medium)?
        };
        let machine_id = self.id();
        data.queue(MachineEvent::MediumChanged {
            machine_id,
            attachment: updated.clone(),
        });

        if online {
            if let Some(client) = data.session.direct_client() {
                drop(data);
                if let Err(e) = client.on_medium_change(&updated, force).await {
                    if force {
                        warn!(slot = %slot, error = %e, "VM process failed to change the medium, forced");
                    } else {
                        let mut data = self.lock().await;
                        let d = &mut *data;
                        let mut tree = self.services().media.write().await;
                        match swap_medium(d, &mut tree, target, &slot, old.medium) {
                            Ok(restored) => d.queue(MachineEvent::MediumChanged {
                                machine_id,
                                attachment: restored,
                            }),
                            Err(undo) => warn!(slot = %slot, error = %undo, "cannot restore previous medium"),
                        }
                        return Err(e);
                    }
                }
            }
        }
        info!(slot = %slot, medium_id = ?medium, "medium changed");
        Ok(())
    }

    /// Remove a controller together with every device attached to it.
    #[instrument(skip(self), fields(machine_id = %self.id()))]
    pub(crate) async fn remove_storage_controller_for(&self, target: Target, name: &str) -> Result<()> {
        let mut lock = self.lock_for_state_change().await;
        lock.check_accessible()?;
        lock.check_dependency(target, StateDependency::Mutable)?;

        let attached: Vec<MediumAttachment> = {
            let (config, _) = lock.aggregates(target)?;
            find_controller(config.controllers()?, name)?;
            config
                .attachments()?
                .iter()
                .filter(|a| a.controller == name)
                .cloned()
                .collect()
        };

        let diffs = {
            let data = &mut *lock;
            let mut tree = self.services().media.write().await;
            let mut diffs = Vec::new();
            for att in &attached {
                diffs.extend(remove_attachment(data, &mut tree, target, att)?);
            }
            let (config, _) = data.aggregates_mut(target)?;
            config.controllers_mut()?.retain(|c| c.name != name);
            diffs
        };
        let (_lock, result) = self.delete_implicit_diffs(lock, diffs).await;
        info!(controller = name, detached = attached.len(), "storage controller removed");
        result
    }
}
