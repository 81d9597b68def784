//! Validated setters over one aggregate set.
//!
//! A [`MachineView`] is handed out for the at-rest record of an unregistered
//! machine or for the proxy of a Write/VM session. Every setter checks the
//! state dependency and validates its arguments before touching a cell, so a
//! rejected call leaves the set unmodified.

use uuid::Uuid;

use vmkeeper_protocol::{DeviceType, MachineState};

use super::aggregates::{
    find_attachment, is_valid_mac_address, AggregateKind, Chipset, ConfigAggregates, Firmware,
    HardwareProfile, Identity, MediumAttachment, NetworkAdapter, ParallelPort, ParavirtProvider,
    Peripherals, PortMode, SerialPort, SlotKey, StorageBus, StorageController, UsbController,
    UsbControllerType, BOOT_ORDER_SLOTS, PARALLEL_PORT_SLOTS, SERIAL_PORT_SLOTS,
};
use super::state::{check_state_dependency, Role, StateDependency};
use crate::config::Limits;
use crate::error::{MachineError, Result};

pub struct MachineView<'a> {
    machine_id: Uuid,
    config: &'a mut ConfigAggregates,
    state: MachineState,
    registered: bool,
    role: Role,
    limits: &'a Limits,
}

impl<'a> MachineView<'a> {
    pub(crate) fn new(
        machine_id: Uuid,
        config: &'a mut ConfigAggregates,
        state: MachineState,
        registered: bool,
        role: Role,
        limits: &'a Limits,
    ) -> Self {
        Self {
            machine_id,
            config,
            state,
            registered,
            role,
            limits,
        }
    }

    fn check(&self, kind: StateDependency) -> Result<()> {
        check_state_dependency(kind, self.registered, self.role, self.state)
    }

    pub fn machine_id(&self) -> Uuid {
        self.machine_id
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_modified(&self) -> bool {
        self.config.is_modified()
    }

    pub fn is_kind_modified(&self, kind: AggregateKind) -> bool {
        self.config.is_kind_modified(kind)
    }

    pub fn identity(&self) -> Result<&Identity> {
        self.config.identity()
    }

    pub fn hardware(&self) -> Result<&HardwareProfile> {
        self.config.hardware()
    }

    pub fn controllers(&self) -> Result<&Vec<StorageController>> {
        self.config.controllers()
    }

    pub fn attachments(&self) -> Result<&Vec<MediumAttachment>> {
        self.config.attachments()
    }

    pub fn peripherals(&self) -> Result<&Peripherals> {
        self.config.peripherals()
    }

    // ---- identity ----

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.check(StateDependency::MutableOrSaved)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(MachineError::InvalidArgument(
                "machine name must not be empty".into(),
            ));
        }
        if self.config.identity()?.name != name {
            self.config.identity_mut()?.name = name.to_string();
        }
        Ok(())
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        self.check(StateDependency::MutableOrSavedOrRunning)?;
        self.config.identity_mut()?.description = description.to_string();
        Ok(())
    }

    pub fn set_os_type_id(&mut self, os_type_id: &str) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        if os_type_id.is_empty() {
            return Err(MachineError::InvalidArgument(
                "OS type must not be empty".into(),
            ));
        }
        self.config.identity_mut()?.os_type_id = os_type_id.to_string();
        Ok(())
    }

    /// Replace the group list. An empty list means the root group.
    pub fn set_groups(&mut self, groups: &[String]) -> Result<()> {
        self.check(StateDependency::MutableOrSaved)?;
        let groups = normalize_groups(groups)?;
        self.config.identity_mut()?.groups = groups;
        Ok(())
    }

    // ---- hardware ----

    pub fn set_cpu_count(&mut self, count: u32) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        let (min, max) = (self.limits.min_cpus.max(1), self.limits.max_cpus);
        if count < min || count > max {
            return Err(MachineError::InvalidArgument(format!(
                "invalid virtual CPU count: {} (must be in range [{}, {}])",
                count, min, max
            )));
        }
        self.config.hardware_mut()?.cpu_count = count;
        Ok(())
    }

    pub fn set_cpu_execution_cap(&mut self, cap: u32) -> Result<()> {
        self.check(StateDependency::MutableOrRunning)?;
        if !(1..=100).contains(&cap) {
            return Err(MachineError::InvalidArgument(format!(
                "invalid CPU execution cap value: {} (must be in range [1, 100])",
                cap
            )));
        }
        self.config.hardware_mut()?.cpu_execution_cap = cap;
        Ok(())
    }

    pub fn set_cpu_hotplug_enabled(&mut self, enabled: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.config.hardware_mut()?.cpu_hotplug = enabled;
        Ok(())
    }

    pub fn set_memory_size(&mut self, memory_mb: u32) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        let (min, max) = (self.limits.min_memory_mb, self.limits.max_memory_mb);
        if memory_mb < min || memory_mb > max {
            return Err(MachineError::InvalidArgument(format!(
                "invalid RAM size: {} MB (must be in range [{}, {}] MB)",
                memory_mb, min, max
            )));
        }
        self.config.hardware_mut()?.memory_mb = memory_mb;
        Ok(())
    }

    pub fn set_vram_size(&mut self, vram_mb: u32) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        if vram_mb > self.limits.max_vram_mb {
            return Err(MachineError::InvalidArgument(format!(
                "invalid VRAM size: {} MB (must be in range [0, {}] MB)",
                vram_mb, self.limits.max_vram_mb
            )));
        }
        self.config.hardware_mut()?.vram_mb = vram_mb;
        Ok(())
    }

    pub fn set_firmware(&mut self, firmware: Firmware) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.config.hardware_mut()?.firmware = firmware;
        Ok(())
    }

    pub fn set_chipset(&mut self, chipset: Chipset) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.config.hardware_mut()?.chipset = chipset;
        Ok(())
    }

    pub fn set_hpet_enabled(&mut self, enabled: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.config.hardware_mut()?.hpet = enabled;
        Ok(())
    }

    pub fn set_paravirt_provider(&mut self, provider: ParavirtProvider) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.config.hardware_mut()?.paravirt = provider;
        Ok(())
    }

    /// Set the device booted from at `position` (0-based).
    pub fn set_boot_order(&mut self, position: usize, device: DeviceType) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        if position >= BOOT_ORDER_SLOTS {
            return Err(MachineError::InvalidArgument(format!(
                "invalid boot position: {} (must be in range [1, {}])",
                position + 1,
                BOOT_ORDER_SLOTS
            )));
        }
        if device == DeviceType::Network {
            // Network boot is configured per adapter.
            return Err(MachineError::InvalidArgument(
                "booting from a network adapter is not supported".into(),
            ));
        }
        let hw = self.config.hardware_mut()?;
        hw.boot_order.resize(BOOT_ORDER_SLOTS, DeviceType::Null);
        hw.boot_order[position] = device;
        Ok(())
    }

    // ---- storage controllers ----

    pub fn add_storage_controller(&mut self, name: &str, bus: StorageBus) -> Result<StorageController> {
        self.check(StateDependency::Mutable)?;
        if name.is_empty() {
            return Err(MachineError::InvalidArgument(
                "storage controller name must not be empty".into(),
            ));
        }
        let controllers = self.config.controllers()?;
        if controllers.iter().any(|c| c.name == name) {
            return Err(MachineError::ObjectInUse(format!(
                "storage controller named '{}' already exists",
                name
            )));
        }
        let used: Vec<u32> = controllers
            .iter()
            .filter(|c| c.bus == bus)
            .map(|c| c.instance)
            .collect();
        let Some(instance) = (0..bus.max_instances()).find(|i| !used.contains(i)) else {
            return Err(MachineError::InvalidArgument(format!(
                "too many storage controllers of bus type {} (maximum {})",
                bus,
                bus.max_instances()
            )));
        };
        let bootable = !controllers.iter().any(|c| c.bus == bus && c.bootable);
        let controller = StorageController {
            name: name.to_string(),
            bus,
            instance,
            port_count: bus.default_ports(),
            bootable,
            use_host_io_cache: !matches!(bus, StorageBus::Sata | StorageBus::Sas | StorageBus::VirtioScsi),
        };
        self.config.controllers_mut()?.push(controller.clone());
        Ok(controller)
    }

    fn controller(&self, name: &str) -> Result<&StorageController> {
        self.config
            .controllers()?
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                MachineError::ObjectNotFound(format!(
                    "could not find a storage controller named '{}'",
                    name
                ))
            })
    }

    fn controller_mut(&mut self, name: &str) -> Result<&mut StorageController> {
        self.controller(name)?;
        self.config
            .controllers_mut()?
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| MachineError::Internal(format!("controller '{}' vanished", name)))
    }

    pub fn set_controller_port_count(&mut self, name: &str, ports: u32) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        let controller = self.controller(name)?;
        let bus = controller.bus;
        if ports < bus.min_ports() || ports > bus.max_ports() {
            return Err(MachineError::InvalidArgument(format!(
                "invalid port count: {} (must be in range [{}, {}])",
                ports,
                bus.min_ports(),
                bus.max_ports()
            )));
        }
        if let Some(att) = self
            .config
            .attachments()?
            .iter()
            .find(|a| a.controller == name && a.port >= ports)
        {
            return Err(MachineError::ObjectInUse(format!(
                "port {} of controller '{}' is still in use",
                att.port, name
            )));
        }
        self.controller_mut(name)?.port_count = ports;
        Ok(())
    }

    /// Make `name` the bootable controller of its bus type.
    pub fn set_controller_bootable(&mut self, name: &str, bootable: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        let bus = self.controller(name)?.bus;
        let other_bootable = self
            .config
            .controllers()?
            .iter()
            .any(|c| c.name != name && c.bus == bus && c.bootable);
        if bootable && other_bootable {
            return Err(MachineError::ObjectInUse(format!(
                "another storage controller of bus type {} is already bootable",
                bus
            )));
        }
        self.controller_mut(name)?.bootable = bootable;
        Ok(())
    }

    pub fn set_controller_host_io_cache(&mut self, name: &str, enabled: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.controller_mut(name)?.use_host_io_cache = enabled;
        Ok(())
    }

    // ---- attachment flags ----

    fn attachment(&self, slot: &SlotKey) -> Result<&MediumAttachment> {
        find_attachment(self.config.attachments()?, slot).ok_or_else(|| {
            MachineError::ObjectNotFound(format!("no storage device attached to {}", slot))
        })
    }

    fn attachment_mut(&mut self, slot: &SlotKey) -> Result<&mut MediumAttachment> {
        self.attachment(slot)?;
        self.config
            .attachments_mut()?
            .iter_mut()
            .find(|a| a.matches(slot))
            .ok_or_else(|| MachineError::Internal(format!("attachment {} vanished", slot)))
    }

    fn expect_device(&self, slot: &SlotKey, device_type: DeviceType, what: &str) -> Result<()> {
        let att = self.attachment(slot)?;
        if att.device_type != device_type {
            return Err(MachineError::InvalidArgument(format!(
                "{}: the device attached to {} is not a {:?} drive",
                what, slot, device_type
            )));
        }
        Ok(())
    }

    pub fn set_passthrough(&mut self, slot: &SlotKey, passthrough: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.expect_device(slot, DeviceType::Dvd, "passthrough")?;
        self.attachment_mut(slot)?.passthrough = passthrough;
        Ok(())
    }

    pub fn temporary_eject_device(&mut self, slot: &SlotKey, temp_eject: bool) -> Result<()> {
        self.check(StateDependency::MutableOrRunning)?;
        self.expect_device(slot, DeviceType::Dvd, "temporary eject")?;
        self.attachment_mut(slot)?.temp_eject = temp_eject;
        Ok(())
    }

    pub fn non_rotational_device(&mut self, slot: &SlotKey, non_rotational: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.expect_device(slot, DeviceType::HardDisk, "non-rotational")?;
        self.attachment_mut(slot)?.non_rotational = non_rotational;
        Ok(())
    }

    pub fn set_auto_discard_for_device(&mut self, slot: &SlotKey, discard: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        self.expect_device(slot, DeviceType::HardDisk, "discard")?;
        self.attachment_mut(slot)?.discard = discard;
        Ok(())
    }

    pub fn set_hot_pluggable_for_device(&mut self, slot: &SlotKey, hot_pluggable: bool) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        let bus = self.controller(&slot.controller)?.bus;
        let att = self.attachment(slot)?;
        if hot_pluggable && (!bus.supports_hotplug() || att.device_type == DeviceType::Floppy) {
            return Err(MachineError::InvalidArgument(format!(
                "controller '{}' does not support hot plugging",
                slot.controller
            )));
        }
        self.attachment_mut(slot)?.hot_pluggable = hot_pluggable;
        Ok(())
    }

    pub fn set_bandwidth_group_for_device(&mut self, slot: &SlotKey, group: Option<&str>) -> Result<()> {
        self.check(StateDependency::MutableOrRunning)?;
        if group.is_some_and(str::is_empty) {
            return Err(MachineError::InvalidArgument(
                "bandwidth group name must not be empty".into(),
            ));
        }
        self.attachment(slot)?;
        self.attachment_mut(slot)?.bandwidth_group = group.map(str::to_string);
        Ok(())
    }

    // ---- peripherals ----

    pub fn add_usb_controller(&mut self, name: &str, kind: UsbControllerType) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        let existing = &self.config.peripherals()?.usb_controllers;
        if existing.iter().any(|c| c.name == name) {
            return Err(MachineError::ObjectInUse(format!(
                "USB controller named '{}' already exists",
                name
            )));
        }
        if existing.iter().any(|c| c.kind == kind) {
            return Err(MachineError::ObjectInUse(format!(
                "a USB controller of type {:?} already exists",
                kind
            )));
        }
        self.config.peripherals_mut()?.usb_controllers.push(UsbController {
            name: name.to_string(),
            kind,
        });
        Ok(())
    }

    pub fn remove_usb_controller(&mut self, name: &str) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        if !self
            .config
            .peripherals()?
            .usb_controllers
            .iter()
            .any(|c| c.name == name)
        {
            return Err(MachineError::ObjectNotFound(format!(
                "USB controller named '{}' not found",
                name
            )));
        }
        self.config
            .peripherals_mut()?
            .usb_controllers
            .retain(|c| c.name != name);
        Ok(())
    }

    /// Replace the adapter in `adapter.slot`. While the VM runs only the
    /// attachment and the cable state may change.
    pub fn set_network_adapter(&mut self, adapter: NetworkAdapter) -> Result<()> {
        self.check(StateDependency::MutableOrRunning)?;
        let slot = adapter.slot as usize;
        let current = self
            .config
            .peripherals()?
            .network_adapters
            .get(slot)
            .cloned();
        let Some(current) = current.filter(|_| adapter.slot < self.limits.max_network_adapters) else {
            return Err(MachineError::InvalidArgument(format!(
                "invalid network adapter slot: {} (must be in range [0, {}])",
                adapter.slot,
                self.limits.max_network_adapters.saturating_sub(1)
            )));
        };
        if !is_valid_mac_address(&adapter.mac_address) {
            return Err(MachineError::InvalidArgument(format!(
                "invalid MAC address: {}",
                adapter.mac_address
            )));
        }
        let offline_only = current.enabled != adapter.enabled
            || current.adapter_type != adapter.adapter_type
            || current.mac_address != adapter.mac_address;
        if offline_only {
            self.check(StateDependency::Mutable)?;
        }
        if current != adapter {
            self.config.peripherals_mut()?.network_adapters[slot] = adapter;
        }
        Ok(())
    }

    pub fn set_serial_port(&mut self, port: SerialPort) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        if port.slot as usize >= SERIAL_PORT_SLOTS {
            return Err(MachineError::InvalidArgument(format!(
                "invalid serial port slot: {}",
                port.slot
            )));
        }
        if port.io_base > 0xFFFF || port.irq > 255 {
            return Err(MachineError::InvalidArgument(format!(
                "invalid serial port resources: I/O base {:#x}, IRQ {}",
                port.io_base, port.irq
            )));
        }
        if port.enabled && port.mode != PortMode::Disconnected && port.path.is_empty() {
            return Err(MachineError::InvalidArgument(format!(
                "serial port {} needs a path in {:?} mode",
                port.slot, port.mode
            )));
        }
        let slot = port.slot as usize;
        self.config.peripherals_mut()?.serial_ports[slot] = port;
        Ok(())
    }

    pub fn set_parallel_port(&mut self, port: ParallelPort) -> Result<()> {
        self.check(StateDependency::Mutable)?;
        if port.slot as usize >= PARALLEL_PORT_SLOTS {
            return Err(MachineError::InvalidArgument(format!(
                "invalid parallel port slot: {}",
                port.slot
            )));
        }
        if port.io_base > 0xFFFF || port.irq > 255 {
            return Err(MachineError::InvalidArgument(format!(
                "invalid parallel port resources: I/O base {:#x}, IRQ {}",
                port.io_base, port.irq
            )));
        }
        if port.enabled && port.path.is_empty() {
            return Err(MachineError::InvalidArgument(format!(
                "parallel port {} needs a path",
                port.slot
            )));
        }
        let slot = port.slot as usize;
        self.config.peripherals_mut()?.parallel_ports[slot] = port;
        Ok(())
    }
}

/// Validate and deduplicate group paths, keeping first occurrences.
pub fn normalize_groups(groups: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for group in groups {
        let g = group.trim();
        if g.is_empty() || !g.starts_with('/') {
            return Err(MachineError::InvalidArgument(format!(
                "invalid machine group '{}': must start with '/'",
                group
            )));
        }
        if g.len() > 1 && g.ends_with('/') {
            return Err(MachineError::InvalidArgument(format!(
                "invalid machine group '{}': must not end with '/'",
                group
            )));
        }
        if g.contains("//") {
            return Err(MachineError::InvalidArgument(format!(
                "invalid machine group '{}': empty path component",
                group
            )));
        }
        if !out.iter().any(|o| o == g) {
            out.push(g.to_string());
        }
    }
    if out.is_empty() {
        out.push("/".to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::aggregates::{AdapterType, NetworkAttachment};

    fn fixture() -> (ConfigAggregates, Limits) {
        (
            ConfigAggregates::defaults(Uuid::new_v4(), "vm", "Linux_64"),
            Limits::default(),
        )
    }

    fn session_view<'a>(
        cfg: &'a mut ConfigAggregates,
        limits: &'a Limits,
        state: MachineState,
    ) -> MachineView<'a> {
        MachineView::new(Uuid::nil(), cfg, state, true, Role::SessionProxy, limits)
    }

    #[test]
    fn zero_cpus_rejected_without_modification() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        let err = view.set_cpu_count(0).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(!view.is_modified());
        assert_eq!(view.hardware().unwrap().cpu_count, 1);
    }

    #[test]
    fn memory_within_limits() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        view.set_memory_size(256).unwrap();
        assert!(view.is_kind_modified(AggregateKind::Hardware));
        assert!(view.set_memory_size(2).unwrap_err().is_invalid_argument());
        assert_eq!(view.hardware().unwrap().memory_mb, 256);
    }

    #[test]
    fn running_machine_accepts_only_running_setters() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::Running);
        assert!(view.set_memory_size(512).unwrap_err().is_invalid_state());
        view.set_cpu_execution_cap(50).unwrap();
        view.set_description("busy").unwrap();
        assert!(view.set_name("renamed").unwrap_err().is_invalid_state());
        assert_eq!(view.hardware().unwrap().cpu_execution_cap, 50);
    }

    #[test]
    fn saved_machine_can_be_renamed() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::Saved);
        view.set_name("archive").unwrap();
        assert!(view.set_os_type_id("Windows11_64").unwrap_err().is_invalid_state());
        assert_eq!(view.identity().unwrap().name, "archive");
    }

    #[test]
    fn registered_at_rest_is_read_only() {
        let (mut cfg, limits) = fixture();
        let mut view = MachineView::new(
            Uuid::nil(),
            &mut cfg,
            MachineState::PoweredOff,
            true,
            Role::AtRest,
            &limits,
        );
        assert!(view.set_cpu_count(2).unwrap_err().is_invalid_state());
        assert!(!view.is_modified());
    }

    #[test]
    fn controller_names_and_instances() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        let sata = view.add_storage_controller("SATA", StorageBus::Sata).unwrap();
        assert_eq!(sata.instance, 0);
        assert!(sata.bootable);
        assert_eq!(sata.port_count, 2);
        let second = view.add_storage_controller("SATA2", StorageBus::Sata).unwrap();
        assert_eq!(second.instance, 1);
        assert!(!second.bootable);
        assert!(view
            .add_storage_controller("SATA", StorageBus::Scsi)
            .unwrap_err()
            .is_in_use());

        view.add_storage_controller("IDE", StorageBus::Ide).unwrap();
        assert!(view
            .add_storage_controller("IDE2", StorageBus::Ide)
            .unwrap_err()
            .is_invalid_argument());

        assert!(view
            .set_controller_bootable("SATA2", true)
            .unwrap_err()
            .is_in_use());
        view.set_controller_port_count("SATA", 4).unwrap();
        assert!(view
            .set_controller_port_count("SATA", 31)
            .unwrap_err()
            .is_invalid_argument());
        assert!(view
            .set_controller_port_count("NVMe", 1)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn port_count_cannot_drop_below_used_port() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        view.add_storage_controller("SATA", StorageBus::Sata).unwrap();
        view.set_controller_port_count("SATA", 4).unwrap();
        view.config.attachments_mut().unwrap().push(MediumAttachment::new(
            &SlotKey::new("SATA", 3, 0),
            DeviceType::Dvd,
            None,
        ));
        assert!(view
            .set_controller_port_count("SATA", 2)
            .unwrap_err()
            .is_in_use());
    }

    #[test]
    fn attachment_flags_check_device_type() {
        let (mut cfg, limits) = fixture();
        let dvd = SlotKey::new("IDE", 1, 0);
        let disk = SlotKey::new("IDE", 0, 0);
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        view.add_storage_controller("IDE", StorageBus::Ide).unwrap();
        {
            let list = view.config.attachments_mut().unwrap();
            list.push(MediumAttachment::new(&dvd, DeviceType::Dvd, None));
            list.push(MediumAttachment::new(&disk, DeviceType::HardDisk, Some(Uuid::new_v4())));
        }
        view.set_passthrough(&dvd, true).unwrap();
        assert!(view.set_passthrough(&disk, true).unwrap_err().is_invalid_argument());
        view.non_rotational_device(&disk, true).unwrap();
        view.set_auto_discard_for_device(&disk, true).unwrap();
        assert!(view
            .set_hot_pluggable_for_device(&disk, true)
            .unwrap_err()
            .is_invalid_argument());
        view.set_bandwidth_group_for_device(&disk, Some("slow")).unwrap();
        assert!(view
            .non_rotational_device(&SlotKey::new("IDE", 0, 1), true)
            .unwrap_err()
            .is_not_found());

        let att = find_attachment(view.attachments().unwrap(), &disk).unwrap();
        assert!(att.non_rotational && att.discard);
        assert_eq!(att.bandwidth_group.as_deref(), Some("slow"));
    }

    #[test]
    fn network_adapter_changes_while_running() {
        let (mut cfg, limits) = fixture();
        let mut adapter = cfg.peripherals().unwrap().network_adapters[0].clone();
        let mut view = session_view(&mut cfg, &limits, MachineState::Running);

        adapter.attachment = NetworkAttachment::Bridged("eth0".into());
        view.set_network_adapter(adapter.clone()).unwrap();

        adapter.adapter_type = AdapterType::Virtio;
        assert!(view.set_network_adapter(adapter.clone()).unwrap_err().is_invalid_state());

        adapter.slot = 8;
        assert!(view.set_network_adapter(adapter).unwrap_err().is_invalid_argument());
        assert_eq!(
            view.peripherals().unwrap().network_adapters[0].attachment,
            NetworkAttachment::Bridged("eth0".into())
        );
    }

    #[test]
    fn platform_settings_only_while_powered_off() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        view.set_firmware(Firmware::Efi).unwrap();
        view.set_chipset(Chipset::Ich9).unwrap();
        view.set_hpet_enabled(true).unwrap();
        view.set_paravirt_provider(ParavirtProvider::Kvm).unwrap();
        view.set_cpu_hotplug_enabled(true).unwrap();
        view.set_vram_size(128).unwrap();
        assert!(view.set_vram_size(limits.max_vram_mb + 1).unwrap_err().is_invalid_argument());

        let hw = view.hardware().unwrap();
        assert_eq!((hw.firmware, hw.chipset), (Firmware::Efi, Chipset::Ich9));
        assert!(hw.hpet && hw.cpu_hotplug);
        assert_eq!(hw.paravirt, ParavirtProvider::Kvm);
        assert_eq!(hw.vram_mb, 128);

        let mut view = session_view(&mut cfg, &limits, MachineState::Running);
        assert!(view.set_chipset(Chipset::Piix3).unwrap_err().is_invalid_state());
        assert!(view.set_firmware(Firmware::Bios).unwrap_err().is_invalid_state());
    }

    #[test]
    fn groups_are_normalized_and_allowed_when_saved() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::Saved);
        view.set_groups(&["/lab".to_string(), "/lab".to_string()]).unwrap();
        assert_eq!(view.identity().unwrap().groups, vec!["/lab"]);
        assert!(view.set_groups(&["lab".to_string()]).unwrap_err().is_invalid_argument());
        assert_eq!(view.identity().unwrap().groups, vec!["/lab"]);
    }

    #[test]
    fn temporary_eject_allowed_while_running() {
        let (mut cfg, limits) = fixture();
        let dvd = SlotKey::new("IDE", 1, 0);
        {
            let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
            view.add_storage_controller("IDE", StorageBus::Ide).unwrap();
            view.set_controller_host_io_cache("IDE", true).unwrap();
            assert!(view
                .set_controller_host_io_cache("SCSI", true)
                .unwrap_err()
                .is_not_found());
            view.config
                .attachments_mut()
                .unwrap()
                .push(MediumAttachment::new(&dvd, DeviceType::Dvd, None));
        }
        let mut view = session_view(&mut cfg, &limits, MachineState::Running);
        view.temporary_eject_device(&dvd, true).unwrap();
        assert!(view
            .set_controller_host_io_cache("IDE", false)
            .unwrap_err()
            .is_invalid_state());
        assert!(find_attachment(view.attachments().unwrap(), &dvd).unwrap().temp_eject);
        assert!(view.controllers().unwrap()[0].use_host_io_cache);
    }

    #[test]
    fn parallel_port_resources_checked() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        let mut port = ParallelPort::new(1);
        port.enabled = true;
        assert!(view.set_parallel_port(port.clone()).unwrap_err().is_invalid_argument());
        port.path = "/dev/parport0".into();
        port.irq = 300;
        assert!(view.set_parallel_port(port.clone()).unwrap_err().is_invalid_argument());
        port.irq = 5;
        view.set_parallel_port(port).unwrap();
        assert!(view.peripherals().unwrap().parallel_ports[1].enabled);
        assert!(view
            .set_parallel_port(ParallelPort::new(PARALLEL_PORT_SLOTS as u32))
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn serial_port_needs_path_when_connected() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        let mut port = SerialPort::new(0);
        port.enabled = true;
        port.mode = PortMode::HostPipe;
        assert!(view.set_serial_port(port.clone()).unwrap_err().is_invalid_argument());
        port.path = "/tmp/com1".into();
        view.set_serial_port(port).unwrap();
        assert!(view.peripherals().unwrap().serial_ports[0].enabled);
    }

    #[test]
    fn usb_controllers_unique_by_name_and_type() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        view.add_usb_controller("OHCI", UsbControllerType::Ohci).unwrap();
        assert!(view.add_usb_controller("OHCI", UsbControllerType::Xhci).unwrap_err().is_in_use());
        assert!(view.add_usb_controller("Other", UsbControllerType::Ohci).unwrap_err().is_in_use());
        view.remove_usb_controller("OHCI").unwrap();
        assert!(view.remove_usb_controller("OHCI").unwrap_err().is_not_found());
    }

    #[test]
    fn boot_order_positions() {
        let (mut cfg, limits) = fixture();
        let mut view = session_view(&mut cfg, &limits, MachineState::PoweredOff);
        view.set_boot_order(0, DeviceType::HardDisk).unwrap();
        assert!(view.set_boot_order(4, DeviceType::Dvd).unwrap_err().is_invalid_argument());
        assert!(view.set_boot_order(1, DeviceType::Network).is_err());
        assert_eq!(view.hardware().unwrap().boot_order[0], DeviceType::HardDisk);
    }

    #[test]
    fn group_normalization() {
        let groups = vec!["/prod".to_string(), "/prod".to_string(), "/db/primary".to_string()];
        assert_eq!(normalize_groups(&groups).unwrap(), vec!["/prod", "/db/primary"]);
        assert_eq!(normalize_groups(&[]).unwrap(), vec!["/"]);
        assert!(normalize_groups(&["prod".to_string()]).is_err());
        assert!(normalize_groups(&["/prod/".to_string()]).is_err());
        assert!(normalize_groups(&["/a//b".to_string()]).is_err());
    }
}
