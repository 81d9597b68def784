use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum message size (4 MiB) on the client control channel.
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

/// Framing: each message is a 4-byte big-endian length prefix followed by JSON bytes.
/// The length prefix encodes the size of the JSON payload only (not including itself).

// ---------------------------------------------------------------------------
// Shared state enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a virtual machine.
///
/// The declaration order matters: the online and transient groups are
/// contiguous ranges, exactly as `is_online` / `is_transient` assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MachineState {
    PoweredOff,
    Saved,
    Teleported,
    Aborted,
    AbortedSaved,
    Running,
    Paused,
    Stuck,
    Teleporting,
    LiveSnapshotting,
    Starting,
    Stopping,
    Saving,
    Restoring,
    TeleportingPausedVM,
    TeleportingIn,
    DeletingSnapshotOnline,
    DeletingSnapshotPaused,
    OnlineSnapshotting,
    RestoringSnapshot,
    DeletingSnapshot,
    SettingUp,
    Snapshotting,
}

impl MachineState {
    /// A VM process exists for the machine (Running ..= OnlineSnapshotting).
    pub fn is_online(self) -> bool {
        self >= MachineState::Running && self <= MachineState::OnlineSnapshotting
    }

    /// The machine is between two stable states (Teleporting ..= Snapshotting).
    pub fn is_transient(self) -> bool {
        self >= MachineState::Teleporting && self <= MachineState::Snapshotting
    }

    pub fn is_online_or_transient(self) -> bool {
        self.is_online() || self.is_transient()
    }

    /// PoweredOff, Saved, Teleported, Aborted, AbortedSaved.
    pub fn is_stable(self) -> bool {
        !self.is_online_or_transient()
    }

    /// A saved-state file belongs to this state.
    pub fn has_saved_state(self) -> bool {
        matches!(self, MachineState::Saved | MachineState::AbortedSaved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PoweredOff => "PoweredOff",
            Self::Saved => "Saved",
            Self::Teleported => "Teleported",
            Self::Aborted => "Aborted",
            Self::AbortedSaved => "AbortedSaved",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stuck => "Stuck",
            Self::Teleporting => "Teleporting",
            Self::LiveSnapshotting => "LiveSnapshotting",
            Self::Starting => "Starting",
            Self::Stopping => "Stopping",
            Self::Saving => "Saving",
            Self::Restoring => "Restoring",
            Self::TeleportingPausedVM => "TeleportingPausedVM",
            Self::TeleportingIn => "TeleportingIn",
            Self::DeletingSnapshotOnline => "DeletingSnapshotOnline",
            Self::DeletingSnapshotPaused => "DeletingSnapshotPaused",
            Self::OnlineSnapshotting => "OnlineSnapshotting",
            Self::RestoringSnapshot => "RestoringSnapshot",
            Self::DeletingSnapshot => "DeletingSnapshot",
            Self::SettingUp => "SettingUp",
            Self::Snapshotting => "Snapshotting",
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lock state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unlocked,
    Spawning,
    Locked,
    Unlocking,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlocked => write!(f, "unlocked"),
            Self::Spawning => write!(f, "spawning"),
            Self::Locked => write!(f, "locked"),
            Self::Unlocking => write!(f, "unlocking"),
        }
    }
}

/// Kind of lock a client session holds on a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Null,
    Shared,
    Write,
    #[serde(rename = "vm")]
    Vm,
}

impl LockType {
    /// Write and VM locks own the session proxy.
    pub fn is_exclusive(self) -> bool {
        matches!(self, LockType::Write | LockType::Vm)
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Shared => write!(f, "shared"),
            Self::Write => write!(f, "write"),
            Self::Vm => write!(f, "vm"),
        }
    }
}

/// Device type of a storage attachment or boot order slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Null,
    Floppy,
    Dvd,
    HardDisk,
    Network,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Floppy => write!(f, "floppy"),
            Self::Dvd => write!(f, "dvd"),
            Self::HardDisk => write!(f, "hdd"),
            Self::Network => write!(f, "net"),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager -> client requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Liveness check.
    Ping,

    /// Hand the session proxy of a machine to the client.
    AssignMachine(AssignMachineRequest),

    /// Attach the client as a remote (shared) session.
    AssignRemoteMachine(AssignRemoteMachineRequest),

    /// Ask the direct session for its console handle.
    GetRemoteConsole,

    /// Hot-plug or hot-unplug a storage device.
    StorageDeviceChange(StorageDeviceChangeRequest),

    /// Removable medium was changed on an existing attachment.
    MediumChange(MediumChangeRequest),

    /// The session is being closed by the manager.
    Uninitialize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignMachineRequest {
    pub machine_id: String,
    pub lock_type: LockType,
    /// Token the client presents back on unlock.
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRemoteMachineRequest {
    pub machine_id: String,
    pub console: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDeviceChangeRequest {
    pub controller: String,
    pub port: u32,
    pub device: u32,
    pub remove: bool,
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumChangeRequest {
    pub controller: String,
    pub port: u32,
    pub device: u32,
    #[serde(default)]
    pub medium: Option<String>,
    #[serde(default)]
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Client -> manager responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Reply to Ping.
    Pong(PongResponse),

    /// Acknowledgment of a request without payload.
    Ok,

    /// Console handle of the direct session.
    Console(ConsoleResponse),

    /// Error response.
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongResponse {
    pub pid: u32,
    #[serde(default)]
    pub frontend: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleResponse {
    pub console: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidState,
    NotSupported,
    Rejected,
    Internal,
}

/// Environment handed to a spawned front-end process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchEnvironment {
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl LaunchEnvironment {
    /// Parse `KEY=VALUE` lines; lines without `=` unset nothing and are skipped.
    pub fn parse(text: &str) -> Self {
        let vars = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self { vars }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Encode a message as length-prefixed JSON bytes.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode a length-prefixed JSON message from a byte buffer.
/// Returns the deserialized message and the number of bytes consumed.
pub fn decode_message<T: serde::de::DeserializeOwned>(
    buf: &[u8],
) -> Result<(T, usize), Box<dyn std::error::Error>> {
    if buf.len() < 4 {
        return Err("buffer too short for length prefix".into());
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(format!("message too large: {} bytes", len).into());
    }
    if buf.len() < 4 + len {
        return Err("buffer too short for payload".into());
    }
    let msg: T = serde_json::from_slice(&buf[4..4 + len])?;
    Ok((msg, 4 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_state_groups() {
        assert!(MachineState::PoweredOff.is_stable());
        assert!(MachineState::AbortedSaved.is_stable());
        assert!(MachineState::Running.is_online());
        assert!(!MachineState::Running.is_transient());
        assert!(MachineState::Teleporting.is_online());
        assert!(MachineState::Teleporting.is_transient());
        assert!(MachineState::OnlineSnapshotting.is_online());
        assert!(!MachineState::SettingUp.is_online());
        assert!(MachineState::SettingUp.is_transient());
        assert!(MachineState::Snapshotting.is_transient());
        assert!(!MachineState::Saved.is_online_or_transient());
    }

    #[test]
    fn machine_state_display_matches_name() {
        assert_eq!(MachineState::AbortedSaved.to_string(), "AbortedSaved");
        assert_eq!(MachineState::TeleportingPausedVM.to_string(), "TeleportingPausedVM");
    }

    #[test]
    fn lock_type_serde_values() {
        assert_eq!(serde_json::to_string(&LockType::Vm).unwrap(), "\"vm\"");
        assert_eq!(serde_json::to_string(&LockType::Write).unwrap(), "\"write\"");
        let lt: LockType = serde_json::from_str("\"shared\"").unwrap();
        assert_eq!(lt, LockType::Shared);
        assert!(LockType::Vm.is_exclusive());
        assert!(!LockType::Shared.is_exclusive());
    }

    #[test]
    fn session_state_rejects_unknown() {
        let result: Result<SessionState, _> = serde_json::from_str("\"closing\"");
        assert!(result.is_err());
    }

    #[test]
    fn request_tagged_by_type() {
        let req = ControlRequest::AssignMachine(AssignMachineRequest {
            machine_id: "m1".into(),
            lock_type: LockType::Write,
            token: "t".into(),
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "AssignMachine");
        assert_eq!(json["lock_type"], "write");
    }

    #[test]
    fn storage_change_defaults_silent() {
        let json = r#"{"type":"StorageDeviceChange","controller":"SATA","port":1,"device":0,"remove":true}"#;
        let req: ControlRequest = serde_json::from_str(json).unwrap();
        match req {
            ControlRequest::StorageDeviceChange(c) => {
                assert!(c.remove);
                assert!(!c.silent);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn framing_consumes_exact_length() {
        let mut buf = encode_message(&ControlResponse::Ok).unwrap();
        let second = encode_message(&ControlResponse::Console(ConsoleResponse {
            console: "console-1".into(),
        }))
        .unwrap();
        buf.extend_from_slice(&second);

        let (first, used): (ControlResponse, usize) = decode_message(&buf).unwrap();
        assert!(matches!(first, ControlResponse::Ok));
        let (next, _): (ControlResponse, usize) = decode_message(&buf[used..]).unwrap();
        match next {
            ControlResponse::Console(c) => assert_eq!(c.console, "console-1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn framing_rejects_short_buffer() {
        let buf = encode_message(&ControlRequest::Ping).unwrap();
        assert!(decode_message::<ControlRequest>(&buf[..2]).is_err());
        assert!(decode_message::<ControlRequest>(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn framing_rejects_oversized_prefix() {
        let mut buf = (MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(decode_message::<ControlRequest>(&buf).is_err());
    }

    #[test]
    fn launch_environment_parse() {
        let env = LaunchEnvironment::parse("DISPLAY=:0\nBROKEN\n=x\nA=b=c\n");
        assert_eq!(env.vars.len(), 2);
        assert_eq!(env.vars["DISPLAY"], ":0");
        assert_eq!(env.vars["A"], "b=c");
    }
}
