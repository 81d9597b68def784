//! Configuration aggregates of a machine.
//!
//! Every aggregate lives in its own [`ConfigCell`] so that, for example, a
//! storage rollback does not disturb a pending hardware change. Setters obtain
//! write access through the `*_mut` accessors, which take the backup and mark
//! the aggregate modified in one step.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vmkeeper_protocol::DeviceType;

use crate::cell::{list_delta, ConfigCell, Keyed, ListDelta};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Immutable after creation.
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub os_type_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Efi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chipset {
    Piix3,
    Ich9,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParavirtProvider {
    None,
    Default,
    Legacy,
    Minimal,
    HyperV,
    Kvm,
}

pub const BOOT_ORDER_SLOTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub cpu_count: u32,
    #[serde(default)]
    pub cpu_hotplug: bool,
    /// Percentage of host CPU time a virtual CPU may use.
    pub cpu_execution_cap: u32,
    pub memory_mb: u32,
    pub vram_mb: u32,
    pub firmware: Firmware,
    pub chipset: Chipset,
    pub boot_order: Vec<DeviceType>,
    #[serde(default)]
    pub hpet: bool,
    pub paravirt: ParavirtProvider,
    pub hardware_uuid: Uuid,
}

impl HardwareProfile {
    pub fn new(hardware_uuid: Uuid) -> Self {
        Self {
            cpu_count: 1,
            cpu_hotplug: false,
            cpu_execution_cap: 100,
            memory_mb: 128,
            vram_mb: 8,
            firmware: Firmware::Bios,
            chipset: Chipset::Piix3,
            boot_order: vec![
                DeviceType::Floppy,
                DeviceType::Dvd,
                DeviceType::HardDisk,
                DeviceType::Null,
            ],
            hpet: false,
            paravirt: ParavirtProvider::Default,
            hardware_uuid,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage controllers and attachments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBus {
    Ide,
    Sata,
    Scsi,
    Floppy,
    Sas,
    Usb,
    PciExpress,
    VirtioScsi,
}

impl StorageBus {
    pub fn max_ports(self) -> u32 {
        match self {
            Self::Ide => 2,
            Self::Sata => 30,
            Self::Scsi => 16,
            Self::Floppy => 1,
            Self::Sas => 255,
            Self::Usb => 8,
            Self::PciExpress => 255,
            Self::VirtioScsi => 256,
        }
    }

    pub fn min_ports(self) -> u32 {
        match self {
            Self::Ide | Self::Scsi | Self::Floppy => self.max_ports(),
            _ => 1,
        }
    }

    pub fn default_ports(self) -> u32 {
        match self {
            Self::Sata => 2,
            Self::Sas => 8,
            Self::Usb => 8,
            Self::PciExpress => 1,
            Self::VirtioScsi => 1,
            other => other.max_ports(),
        }
    }

    pub fn devices_per_port(self) -> u32 {
        match self {
            Self::Ide | Self::Floppy => 2,
            _ => 1,
        }
    }

    /// Buses whose devices can be plugged while the VM runs.
    pub fn supports_hotplug(self) -> bool {
        matches!(
            self,
            Self::Sata | Self::Usb | Self::PciExpress | Self::VirtioScsi
        )
    }

    pub fn max_instances(self) -> u32 {
        match self {
            Self::Ide | Self::Floppy => 1,
            _ => 8,
        }
    }

    pub fn accepts(self, device_type: DeviceType) -> bool {
        match self {
            Self::Floppy => device_type == DeviceType::Floppy,
            _ => matches!(device_type, DeviceType::HardDisk | DeviceType::Dvd),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ide => "ide",
            Self::Sata => "sata",
            Self::Scsi => "scsi",
            Self::Floppy => "floppy",
            Self::Sas => "sas",
            Self::Usb => "usb",
            Self::PciExpress => "pcie",
            Self::VirtioScsi => "virtio-scsi",
        }
    }
}

impl fmt::Display for StorageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorageBus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ide" => Ok(Self::Ide),
            "sata" => Ok(Self::Sata),
            "scsi" => Ok(Self::Scsi),
            "floppy" => Ok(Self::Floppy),
            "sas" => Ok(Self::Sas),
            "usb" => Ok(Self::Usb),
            "pcie" => Ok(Self::PciExpress),
            "virtio-scsi" | "virtio" => Ok(Self::VirtioScsi),
            other => Err(format!("unknown storage bus: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageController {
    pub name: String,
    pub bus: StorageBus,
    /// Index among controllers of the same bus type.
    pub instance: u32,
    pub port_count: u32,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub use_host_io_cache: bool,
}

impl Keyed for StorageController {
    type Key = String;

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// (controller, port, device) triple identifying an attachment slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub controller: String,
    pub port: u32,
    pub device: u32,
}

impl SlotKey {
    pub fn new(controller: impl Into<String>, port: u32, device: u32) -> Self {
        Self {
            controller: controller.into(),
            port,
            device,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.controller, self.port, self.device)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumAttachment {
    pub controller: String,
    pub port: u32,
    pub device: u32,
    pub device_type: DeviceType,
    #[serde(default)]
    pub medium: Option<Uuid>,
    #[serde(default)]
    pub passthrough: bool,
    #[serde(default)]
    pub temp_eject: bool,
    #[serde(default)]
    pub non_rotational: bool,
    #[serde(default)]
    pub discard: bool,
    #[serde(default)]
    pub hot_pluggable: bool,
    /// Created automatically on top of a read-only base; discarded on rollback.
    #[serde(default)]
    pub implicit: bool,
    #[serde(default)]
    pub bandwidth_group: Option<String>,
}

impl MediumAttachment {
    pub fn new(slot: &SlotKey, device_type: DeviceType, medium: Option<Uuid>) -> Self {
        Self {
            controller: slot.controller.clone(),
            port: slot.port,
            device: slot.device,
            device_type,
            medium,
            passthrough: false,
            temp_eject: false,
            non_rotational: false,
            discard: false,
            hot_pluggable: false,
            implicit: false,
            bandwidth_group: None,
        }
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.controller.clone(), self.port, self.device)
    }

    pub fn matches(&self, slot: &SlotKey) -> bool {
        self.controller == slot.controller && self.port == slot.port && self.device == slot.device
    }
}

impl Keyed for MediumAttachment {
    type Key = SlotKey;

    fn key(&self) -> SlotKey {
        self.slot()
    }
}

pub fn find_attachment<'a>(list: &'a [MediumAttachment], slot: &SlotKey) -> Option<&'a MediumAttachment> {
    list.iter().find(|a| a.matches(slot))
}

pub fn find_attachment_by_medium(list: &[MediumAttachment], medium: Uuid) -> Option<&MediumAttachment> {
    list.iter().find(|a| a.medium == Some(medium))
}

// ---------------------------------------------------------------------------
// Peripherals
// ---------------------------------------------------------------------------

pub const NETWORK_ADAPTER_SLOTS: usize = 8;
pub const SERIAL_PORT_SLOTS: usize = 4;
pub const PARALLEL_PORT_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbControllerType {
    Ohci,
    Ehci,
    Xhci,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbController {
    pub name: String,
    pub kind: UsbControllerType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    Am79c970a,
    Am79c973,
    I82540em,
    I82543gc,
    Virtio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum NetworkAttachment {
    None,
    Nat,
    Bridged(String),
    Internal(String),
    HostOnly(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub slot: u32,
    pub enabled: bool,
    pub adapter_type: AdapterType,
    pub mac_address: String,
    pub attachment: NetworkAttachment,
    #[serde(default = "default_true")]
    pub cable_connected: bool,
}

fn default_true() -> bool {
    true
}

impl NetworkAdapter {
    pub fn new(slot: u32) -> Self {
        Self {
            slot,
            enabled: slot == 0,
            adapter_type: AdapterType::I82540em,
            mac_address: generate_mac_address(),
            attachment: if slot == 0 {
                NetworkAttachment::Nat
            } else {
                NetworkAttachment::None
            },
            cable_connected: true,
        }
    }
}

/// Random MAC address under the hypervisor's OUI, as 12 upper-case hex digits.
pub fn generate_mac_address() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    format!("080027{:02X}{:02X}{:02X}", bytes[0], bytes[1], bytes[2])
}

pub fn is_valid_mac_address(mac: &str) -> bool {
    if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    // The first octet must be unicast.
    u8::from_str_radix(&mac[..2], 16).map(|b| b & 1 == 0).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMode {
    Disconnected,
    HostPipe,
    HostDevice,
    RawFile,
    TcpSocket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialPort {
    pub slot: u32,
    pub enabled: bool,
    pub io_base: u32,
    pub irq: u32,
    pub mode: PortMode,
    #[serde(default)]
    pub path: String,
}

impl SerialPort {
    pub fn new(slot: u32) -> Self {
        let (io_base, irq) = match slot {
            0 => (0x3F8, 4),
            1 => (0x2F8, 3),
            2 => (0x3E8, 4),
            _ => (0x2E8, 3),
        };
        Self {
            slot,
            enabled: false,
            io_base,
            irq,
            mode: PortMode::Disconnected,
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelPort {
    pub slot: u32,
    pub enabled: bool,
    pub io_base: u32,
    pub irq: u32,
    #[serde(default)]
    pub path: String,
}

impl ParallelPort {
    pub fn new(slot: u32) -> Self {
        let (io_base, irq) = if slot == 0 { (0x378, 7) } else { (0x278, 5) };
        Self {
            slot,
            enabled: false,
            io_base,
            irq,
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peripherals {
    #[serde(default)]
    pub usb_controllers: Vec<UsbController>,
    pub network_adapters: Vec<NetworkAdapter>,
    pub serial_ports: Vec<SerialPort>,
    pub parallel_ports: Vec<ParallelPort>,
}

impl Default for Peripherals {
    fn default() -> Self {
        Self {
            usb_controllers: Vec::new(),
            network_adapters: (0..NETWORK_ADAPTER_SLOTS as u32).map(NetworkAdapter::new).collect(),
            serial_ports: (0..SERIAL_PORT_SLOTS as u32).map(SerialPort::new).collect(),
            parallel_ports: (0..PARALLEL_PORT_SLOTS as u32).map(ParallelPort::new).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AggregateKind {
    Identity,
    Hardware,
    Attachments,
    Controllers,
    Peripherals,
}

/// Plain values of every aggregate, used for persistence and snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateValues {
    pub identity: Identity,
    pub hardware: HardwareProfile,
    pub attachments: Vec<MediumAttachment>,
    pub controllers: Vec<StorageController>,
    pub peripherals: Peripherals,
}

/// List-level changes published to the peer on a session commit.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub controllers: ListDelta<StorageController>,
    pub attachments: ListDelta<MediumAttachment>,
}

#[derive(Debug, Default)]
pub struct ConfigAggregates {
    identity: ConfigCell<Identity>,
    hardware: ConfigCell<HardwareProfile>,
    attachments: ConfigCell<Vec<MediumAttachment>>,
    controllers: ConfigCell<Vec<StorageController>>,
    peripherals: ConfigCell<Peripherals>,
    modified: BTreeSet<AggregateKind>,
}

impl ConfigAggregates {
    pub fn new(values: AggregateValues) -> Self {
        Self {
            identity: ConfigCell::new(values.identity),
            hardware: ConfigCell::new(values.hardware),
            attachments: ConfigCell::new(values.attachments),
            controllers: ConfigCell::new(values.controllers),
            peripherals: ConfigCell::new(values.peripherals),
            modified: BTreeSet::new(),
        }
    }

    /// Defaults for a freshly created machine.
    pub fn defaults(id: Uuid, name: &str, os_type_id: &str) -> Self {
        Self::new(AggregateValues {
            identity: Identity {
                id,
                name: name.to_string(),
                description: String::new(),
                os_type_id: os_type_id.to_string(),
                groups: vec!["/".to_string()],
            },
            hardware: HardwareProfile::new(Uuid::new_v4()),
            attachments: Vec::new(),
            controllers: Vec::new(),
            peripherals: Peripherals::default(),
        })
    }

    /// A set whose cells alias those of `peer` without copying.
    pub fn share_from(peer: &ConfigAggregates) -> Self {
        let mut this = Self::default();
        this.identity.share(&peer.identity);
        this.hardware.share(&peer.hardware);
        this.attachments.share(&peer.attachments);
        this.controllers.share(&peer.controllers);
        this.peripherals.share(&peer.peripherals);
        this
    }

    pub fn identity(&self) -> Result<&Identity> {
        Ok(self.identity.get()?)
    }

    pub fn hardware(&self) -> Result<&HardwareProfile> {
        Ok(self.hardware.get()?)
    }

    pub fn attachments(&self) -> Result<&Vec<MediumAttachment>> {
        Ok(self.attachments.get()?)
    }

    pub fn controllers(&self) -> Result<&Vec<StorageController>> {
        Ok(self.controllers.get()?)
    }

    pub fn peripherals(&self) -> Result<&Peripherals> {
        Ok(self.peripherals.get()?)
    }

    pub fn identity_mut(&mut self) -> Result<&mut Identity> {
        self.identity.backup()?;
        self.modified.insert(AggregateKind::Identity);
        Ok(self.identity.get_mut()?)
    }

    pub fn hardware_mut(&mut self) -> Result<&mut HardwareProfile> {
        self.hardware.backup()?;
        self.modified.insert(AggregateKind::Hardware);
        Ok(self.hardware.get_mut()?)
    }

    pub fn attachments_mut(&mut self) -> Result<&mut Vec<MediumAttachment>> {
        self.attachments.backup()?;
        self.modified.insert(AggregateKind::Attachments);
        Ok(self.attachments.get_mut()?)
    }

    pub fn controllers_mut(&mut self) -> Result<&mut Vec<StorageController>> {
        self.controllers.backup()?;
        self.modified.insert(AggregateKind::Controllers);
        Ok(self.controllers.get_mut()?)
    }

    pub fn peripherals_mut(&mut self) -> Result<&mut Peripherals> {
        self.peripherals.backup()?;
        self.modified.insert(AggregateKind::Peripherals);
        Ok(self.peripherals.get_mut()?)
    }

    /// Attachments as they were before the current transaction, if one is open.
    pub fn backed_up_attachments(&self) -> Option<&Vec<MediumAttachment>> {
        self.attachments.backed_up()
    }

    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }

    pub fn is_kind_modified(&self, kind: AggregateKind) -> bool {
        self.modified.contains(&kind)
    }

    pub fn values(&self) -> Result<AggregateValues> {
        Ok(AggregateValues {
            identity: self.identity()?.clone(),
            hardware: self.hardware()?.clone(),
            attachments: self.attachments()?.clone(),
            controllers: self.controllers()?.clone(),
            peripherals: self.peripherals()?.clone(),
        })
    }

    /// Keep every pending change as the new baseline.
    pub fn commit(&mut self) {
        self.identity.commit();
        self.hardware.commit();
        self.attachments.commit();
        self.controllers.commit();
        self.peripherals.commit();
        self.modified.clear();
    }

    /// Commit and publish every pending change to the at-rest peer.
    pub fn commit_to_peer(&mut self, peer: &mut ConfigAggregates) -> Result<CommitSummary> {
        let summary = CommitSummary {
            controllers: match self.controllers.backed_up() {
                Some(old) => list_delta(old, self.controllers()?),
                None => list_delta::<StorageController>(&[], &[]),
            },
            attachments: match self.attachments.backed_up() {
                Some(old) => list_delta(old, self.attachments()?),
                None => list_delta::<MediumAttachment>(&[], &[]),
            },
        };
        self.identity.commit_to_peer(&mut peer.identity);
        self.hardware.commit_to_peer(&mut peer.hardware);
        self.attachments.commit_to_peer(&mut peer.attachments);
        self.controllers.commit_to_peer(&mut peer.controllers);
        self.peripherals.commit_to_peer(&mut peer.peripherals);
        self.modified.clear();
        Ok(summary)
    }

    /// Publish only the attachment list to the peer.
    pub fn commit_attachments_to_peer(&mut self, peer: &mut ConfigAggregates) {
        self.attachments.commit_to_peer(&mut peer.attachments);
        self.modified.remove(&AggregateKind::Attachments);
    }

    /// Undo every pending change. Returns the discarded attachment list when
    /// attachments were part of the transaction.
    pub fn rollback(&mut self) -> Result<Option<Arc<Vec<MediumAttachment>>>> {
        if self.identity.is_backed_up() {
            self.identity.rollback()?;
        }
        if self.hardware.is_backed_up() {
            self.hardware.rollback()?;
        }
        let discarded = if self.attachments.is_backed_up() {
            Some(self.attachments.rollback()?)
        } else {
            None
        };
        if self.controllers.is_backed_up() {
            self.controllers.rollback()?;
        }
        if self.peripherals.is_backed_up() {
            self.peripherals.rollback()?;
        }
        self.modified.clear();
        Ok(discarded)
    }

    /// Release every cell. Fails while a transaction is open.
    pub fn free(&mut self) -> Result<()> {
        self.identity.free()?;
        self.hardware.free()?;
        self.attachments.free()?;
        self.controllers.free()?;
        self.peripherals.free()?;
        Ok(())
    }

    /// True when every cell aliases the matching cell of `peer`.
    pub fn is_shared_with(&self, peer: &ConfigAggregates) -> bool {
        self.identity.is_shared_with(&peer.identity)
            && self.hardware.is_shared_with(&peer.hardware)
            && self.attachments.is_shared_with(&peer.attachments)
            && self.controllers.is_shared_with(&peer.controllers)
            && self.peripherals.is_shared_with(&peer.peripherals)
    }
}
