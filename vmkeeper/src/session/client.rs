//! Client and process control.
//!
//! A [`ClientHandle`] is the manager's view of a session holder: the process
//! that received the session proxy, or a remote console attached to it. Calls
//! into a client are made with the machine lock released.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

use vmkeeper_protocol::{
    self as protocol, AssignMachineRequest, AssignRemoteMachineRequest, ControlRequest,
    ControlResponse, ErrorCode, LaunchEnvironment, LockType, MediumChangeRequest,
    StorageDeviceChangeRequest,
};

use crate::error::{MachineError, Result};
use crate::machine::aggregates::MediumAttachment;

pub type DynClientHandle = Arc<dyn ClientHandle>;

/// Check a process with signal 0.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs error checking only and delivers nothing.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Process ID of the client, checked against a pending spawn.
    fn pid(&self) -> u32;

    async fn assign_machine(&self, machine_id: Uuid, lock_type: LockType, token: Uuid) -> Result<()>;

    async fn assign_remote_machine(&self, machine_id: Uuid, console: &str) -> Result<()>;

    async fn get_remote_console(&self) -> Result<String>;

    async fn on_storage_device_change(
        &self,
        attachment: &MediumAttachment,
        remove: bool,
        silent: bool,
    ) -> Result<()>;

    async fn on_medium_change(&self, attachment: &MediumAttachment, force: bool) -> Result<()>;

    async fn uninitialize(&self) -> Result<()>;

    async fn is_alive(&self) -> bool {
        pid_alive(self.pid())
    }
}

// ---------------------------------------------------------------------------
// In-process client
// ---------------------------------------------------------------------------

/// Client living in the manager's own process, used by the CLI.
#[derive(Debug, Clone)]
pub struct LocalClient {
    pid: u32,
}

impl LocalClient {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
        }
    }
}

impl Default for LocalClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientHandle for LocalClient {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn assign_machine(&self, machine_id: Uuid, lock_type: LockType, _token: Uuid) -> Result<()> {
        debug!(machine_id = %machine_id, lock_type = %lock_type, "local session assigned");
        Ok(())
    }

    async fn assign_remote_machine(&self, _machine_id: Uuid, _console: &str) -> Result<()> {
        Ok(())
    }

    async fn get_remote_console(&self) -> Result<String> {
        Err(MachineError::InvalidState(
            "a local session has no console".into(),
        ))
    }

    async fn on_storage_device_change(&self, _: &MediumAttachment, _: bool, _: bool) -> Result<()> {
        Ok(())
    }

    async fn on_medium_change(&self, _: &MediumAttachment, _: bool) -> Result<()> {
        Ok(())
    }

    async fn uninitialize(&self) -> Result<()> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Socket client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("client returned error: {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected response from client: {0}")]
    Unexpected(String),

    #[error("client did not answer within {0:?}")]
    Timeout(Duration),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<ControlChannelError> for MachineError {
    fn from(e: ControlChannelError) -> Self {
        match e {
            ControlChannelError::Remote { code, message } => match code {
                ErrorCode::InvalidState | ErrorCode::NotSupported => MachineError::InvalidState(message),
                ErrorCode::Rejected => MachineError::AccessDenied(message),
                ErrorCode::Internal => MachineError::Internal(message),
            },
            ControlChannelError::Io(e) => MachineError::io("client control channel", e),
            other => MachineError::Internal(other.to_string()),
        }
    }
}

/// Read a length-prefixed JSON message from an async reader.
pub async fn read_message<R: AsyncRead + Unpin, T: serde::de::DeserializeOwned>(
    reader: &mut R,
) -> std::result::Result<T, ControlChannelError> {
    let len = reader.read_u32().await?;
    if len > protocol::MAX_MESSAGE_SIZE {
        return Err(ControlChannelError::MessageTooLarge {
            size: len,
            max: protocol::MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write a length-prefixed JSON message to an async writer.
pub async fn write_message<W: AsyncWrite + Unpin, T: serde::Serialize>(
    writer: &mut W,
    msg: &T,
) -> std::result::Result<(), ControlChannelError> {
    let encoded = protocol::encode_message(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Client reached over a byte stream speaking the control protocol.
#[derive(Debug)]
pub struct SocketClient<S> {
    pid: u32,
    stream: tokio::sync::Mutex<S>,
    timeout: Duration,
}

impl<S> SocketClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Handshake with Ping to learn the client's PID.
    pub async fn connect(stream: S, timeout: Duration) -> Result<Self> {
        let mut client = Self {
            pid: 0,
            stream: tokio::sync::Mutex::new(stream),
            timeout,
        };
        match client.request(&ControlRequest::Ping).await? {
            ControlResponse::Pong(pong) => {
                info!(pid = pong.pid, frontend = ?pong.frontend, "session client connected");
                client.pid = pong.pid;
                Ok(client)
            }
            other => Err(ControlChannelError::Unexpected(format!("{:?}", other)).into()),
        }
    }

    async fn request(&self, req: &ControlRequest) -> std::result::Result<ControlResponse, ControlChannelError> {
        let mut stream = self.stream.lock().await;
        let exchange = async {
            write_message(&mut *stream, req).await?;
            read_message::<_, ControlResponse>(&mut *stream).await
        };
        let resp = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ControlChannelError::Timeout(self.timeout))??;
        match resp {
            ControlResponse::Error(e) => Err(ControlChannelError::Remote {
                code: e.code,
                message: e.message,
            }),
            other => Ok(other),
        }
    }

    async fn expect_ok(&self, req: ControlRequest) -> Result<()> {
        match self.request(&req).await? {
            ControlResponse::Ok => Ok(()),
            other => Err(ControlChannelError::Unexpected(format!("{:?}", other)).into()),
        }
    }
}

impl SocketClient<tokio::net::UnixStream> {
    pub async fn connect_unix(path: &std::path::Path, timeout: Duration) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| MachineError::io(format!("connecting to {}", path.display()), e))?;
        Self::connect(stream, timeout).await
    }
}

#[async_trait]
impl<S> ClientHandle for SocketClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn assign_machine(&self, machine_id: Uuid, lock_type: LockType, token: Uuid) -> Result<()> {
        self.expect_ok(ControlRequest::AssignMachine(AssignMachineRequest {
            machine_id: machine_id.to_string(),
            lock_type,
            token: token.to_string(),
        }))
        .await
    }

    async fn assign_remote_machine(&self, machine_id: Uuid, console: &str) -> Result<()> {
        self.expect_ok(ControlRequest::AssignRemoteMachine(AssignRemoteMachineRequest {
            machine_id: machine_id.to_string(),
            console: console.to_string(),
        }))
        .await
    }

    async fn get_remote_console(&self) -> Result<String> {
        match self.request(&ControlRequest::GetRemoteConsole).await? {
            ControlResponse::Console(c) => Ok(c.console),
            other => Err(ControlChannelError::Unexpected(format!("{:?}", other)).into()),
        }
    }

    async fn on_storage_device_change(
        &self,
        attachment: &MediumAttachment,
        remove: bool,
        silent: bool,
    ) -> Result<()> {
        self.expect_ok(ControlRequest::StorageDeviceChange(StorageDeviceChangeRequest {
            controller: attachment.controller.clone(),
            port: attachment.port,
            device: attachment.device,
            remove,
            silent,
        }))
        .await
    }

    async fn on_medium_change(&self, attachment: &MediumAttachment, force: bool) -> Result<()> {
        self.expect_ok(ControlRequest::MediumChange(MediumChangeRequest {
            controller: attachment.controller.clone(),
            port: attachment.port,
            device: attachment.device,
            medium: attachment.medium.map(|m| m.to_string()),
            force,
        }))
        .await
    }

    async fn uninitialize(&self) -> Result<()> {
        self.expect_ok(ControlRequest::Uninitialize).await
    }

    async fn is_alive(&self) -> bool {
        matches!(
            self.request(&ControlRequest::Ping).await,
            Ok(ControlResponse::Pong(_))
        )
    }
}

// ---------------------------------------------------------------------------
// Process launching
// ---------------------------------------------------------------------------

/// How a launched front-end process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
    /// Terminated without a usable status.
    Abend,
}

pub trait ChildProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    fn kill(&mut self) -> io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(
        &self,
        frontend: &str,
        machine_id: Uuid,
        env: &LaunchEnvironment,
    ) -> io::Result<Box<dyn ChildProcess>>;
}

/// Launches the configured front-end binary with tokio.
pub struct CommandLauncher {
    binary: PathBuf,
}

impl CommandLauncher {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn spawn(
        &self,
        frontend: &str,
        machine_id: Uuid,
        env: &LaunchEnvironment,
    ) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("--startvm")
            .arg(machine_id.to_string())
            .arg("--type")
            .arg(frontend)
            .envs(&env.vars)
            .stdin(std::process::Stdio::null());
        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned process has no pid"))?;
        info!(pid, binary = %self.binary.display(), frontend, "front-end process spawned");
        Ok(Box::new(CommandChild {
            pid,
            child: Mutex::new(child),
        }))
    }
}

struct CommandChild {
    pid: u32,
    child: Mutex<tokio::process::Child>,
}

impl ChildProcess for CommandChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        use std::os::unix::process::ExitStatusExt;

        let child = self.child.get_mut().unwrap_or_else(|e| e.into_inner());
        Ok(child.try_wait()?.map(|status| match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Code(code),
            (None, Some(sig)) => ProcessExit::Signal(sig),
            (None, None) => ProcessExit::Abend,
        }))
    }

    fn kill(&mut self) -> io::Result<()> {
        let child = self.child.get_mut().unwrap_or_else(|e| e.into_inner());
        child.start_kill()
    }
}
