use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use vmkeeper_protocol::{MachineState, SessionState};

use crate::machine::aggregates::MediumAttachment;

/// Notification emitted after a committed transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MachineEvent {
    MachineStateChanged {
        machine_id: Uuid,
        state: MachineState,
    },
    SessionStateChanged {
        machine_id: Uuid,
        state: SessionState,
    },
    MediumChanged {
        machine_id: Uuid,
        attachment: MediumAttachment,
    },
    StorageControllerChanged {
        machine_id: Uuid,
        controller: String,
    },
    MachineRegistered {
        machine_id: Uuid,
        registered: bool,
    },
}

impl MachineEvent {
    pub fn machine_id(&self) -> Uuid {
        match self {
            Self::MachineStateChanged { machine_id, .. }
            | Self::SessionStateChanged { machine_id, .. }
            | Self::MediumChanged { machine_id, .. }
            | Self::StorageControllerChanged { machine_id, .. }
            | Self::MachineRegistered { machine_id, .. } => *machine_id,
        }
    }
}

/// Receiver of machine notifications. Never called with a machine lock held.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: MachineEvent);

    fn on_machine_state_changed(&self, machine_id: Uuid, state: MachineState) {
        self.publish(MachineEvent::MachineStateChanged { machine_id, state });
    }

    fn on_session_state_changed(&self, machine_id: Uuid, state: SessionState) {
        self.publish(MachineEvent::SessionStateChanged { machine_id, state });
    }

    fn on_medium_changed(&self, machine_id: Uuid, attachment: MediumAttachment) {
        self.publish(MachineEvent::MediumChanged {
            machine_id,
            attachment,
        });
    }

    fn on_storage_controller_changed(&self, machine_id: Uuid, controller: String) {
        self.publish(MachineEvent::StorageControllerChanged {
            machine_id,
            controller,
        });
    }
}

/// Broadcast hub that fans events out to any number of subscribers.
pub struct EventHub {
    sender: broadcast::Sender<MachineEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: MachineEvent) {
        tracing::trace!(machine_id = %event.machine_id(), ?event, "machine event");
        // Ignore errors (no subscribers)
        let _ = self.sender.send(event);
    }
}
