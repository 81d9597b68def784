use vmkeeper_protocol::MachineState;

use crate::error::{MachineError, Result};

/// Which copy of the configuration an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The persisted record owned by the registry.
    AtRest,
    /// The live copy handed to a Write/VM session holder.
    SessionProxy,
    /// A frozen copy stored in the snapshot tree.
    Snapshot,
}

/// Mutability requirement of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateDependency {
    Any,
    Mutable,
    MutableOrSaved,
    MutableOrRunning,
    MutableOrSavedOrRunning,
}

fn is_mutable(registered: bool, role: Role, state: MachineState) -> bool {
    if role == Role::Snapshot {
        return false;
    }
    !registered
        || (role == Role::SessionProxy
            && matches!(
                state,
                MachineState::Aborted | MachineState::Teleported | MachineState::PoweredOff
            ))
}

/// Check whether an operation with dependency `kind` may run now.
pub fn check_state_dependency(
    kind: StateDependency,
    registered: bool,
    role: Role,
    state: MachineState,
) -> Result<()> {
    let mutable = is_mutable(registered, role, state);
    let saved = state.has_saved_state();
    let running = state.is_online();
    // Snapshot copies are frozen no matter what the dependency allows.
    let writable_role = role != Role::Snapshot;

    let allowed = match kind {
        StateDependency::Any => true,
        StateDependency::Mutable => mutable,
        StateDependency::MutableOrSaved => mutable || (writable_role && saved),
        StateDependency::MutableOrRunning => mutable || (writable_role && running),
        StateDependency::MutableOrSavedOrRunning => {
            mutable || (writable_role && (saved || running))
        }
    };
    if allowed {
        return Ok(());
    }

    if role == Role::Snapshot {
        return Err(MachineError::InvalidState(
            "the snapshot configuration cannot be changed".into(),
        ));
    }
    if role == Role::AtRest && registered {
        return Err(MachineError::machine_state(
            "the machine is not mutable without a session lock",
            state,
        ));
    }
    Err(MachineError::machine_state(
        "the operation is not allowed in the current machine state",
        state,
    ))
}

/// Transitions a VM-lock holder may request through `update_state`.
pub fn is_valid_transition(from: MachineState, to: MachineState) -> bool {
    use MachineState::*;

    if from == to {
        return false;
    }
    match from {
        PoweredOff | Aborted | Teleported => matches!(to, Starting | TeleportingIn),
        Saved | AbortedSaved => matches!(to, Restoring),
        Starting | TeleportingIn => matches!(to, Running | Paused | PoweredOff | Aborted),
        Restoring => matches!(to, Running | Paused | Saved | AbortedSaved),
        Running => matches!(
            to,
            Paused
                | Stuck
                | Stopping
                | Saving
                | Teleporting
                | LiveSnapshotting
                | OnlineSnapshotting
                | DeletingSnapshotOnline
                | PoweredOff
                | Aborted
        ),
        Paused => matches!(
            to,
            Running
                | Stuck
                | Stopping
                | Saving
                | TeleportingPausedVM
                | OnlineSnapshotting
                | DeletingSnapshotPaused
                | PoweredOff
                | Aborted
        ),
        Stuck => matches!(to, Running | Stopping | PoweredOff | Aborted),
        Stopping => matches!(to, PoweredOff | Aborted),
        Saving => matches!(to, Saved | Running | Paused | Aborted),
        Teleporting => matches!(to, Teleported | Running | Paused | Aborted),
        TeleportingPausedVM => matches!(to, Teleported | Paused | Aborted),
        LiveSnapshotting | OnlineSnapshotting => matches!(to, Running | Paused | Aborted),
        DeletingSnapshotOnline => matches!(to, Running | Aborted),
        DeletingSnapshotPaused => matches!(to, Paused | Aborted),
        // Entered and left by the manager itself.
        RestoringSnapshot | DeletingSnapshot | SettingUp | Snapshotting => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MachineState::*;

    #[test]
    fn any_always_allowed() {
        for state in [PoweredOff, Running, Snapshotting, SettingUp] {
            assert!(check_state_dependency(StateDependency::Any, true, Role::AtRest, state).is_ok());
        }
    }

    #[test]
    fn unregistered_records_are_mutable() {
        assert!(check_state_dependency(StateDependency::Mutable, false, Role::AtRest, PoweredOff).is_ok());
    }

    #[test]
    fn registered_at_rest_requires_session() {
        let err =
            check_state_dependency(StateDependency::Mutable, true, Role::AtRest, PoweredOff).unwrap_err();
        assert!(err.is_invalid_state());
        assert!(err.to_string().contains("PoweredOff"));
    }

    #[test]
    fn session_mutable_in_stable_off_states() {
        for state in [PoweredOff, Aborted, Teleported] {
            assert!(
                check_state_dependency(StateDependency::Mutable, true, Role::SessionProxy, state).is_ok(),
                "{state}"
            );
        }
        for state in [Saved, AbortedSaved, Running, SettingUp] {
            assert!(
                check_state_dependency(StateDependency::Mutable, true, Role::SessionProxy, state).is_err(),
                "{state}"
            );
        }
    }

    #[test]
    fn saved_and_running_unions() {
        let proxy = Role::SessionProxy;
        assert!(check_state_dependency(StateDependency::MutableOrSaved, true, proxy, Saved).is_ok());
        assert!(check_state_dependency(StateDependency::MutableOrSaved, true, proxy, AbortedSaved).is_ok());
        assert!(check_state_dependency(StateDependency::MutableOrSaved, true, proxy, Running).is_err());
        assert!(check_state_dependency(StateDependency::MutableOrRunning, true, proxy, Running).is_ok());
        assert!(check_state_dependency(StateDependency::MutableOrRunning, true, proxy, Paused).is_ok());
        assert!(check_state_dependency(StateDependency::MutableOrRunning, true, proxy, Saved).is_err());
        assert!(check_state_dependency(StateDependency::MutableOrSavedOrRunning, true, proxy, Saved).is_ok());
        assert!(check_state_dependency(StateDependency::MutableOrSavedOrRunning, true, proxy, Running).is_ok());
        assert!(
            check_state_dependency(StateDependency::MutableOrSavedOrRunning, true, proxy, SettingUp).is_err()
        );
    }

    #[test]
    fn snapshot_copies_are_frozen() {
        let err =
            check_state_dependency(StateDependency::MutableOrSaved, false, Role::Snapshot, PoweredOff).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn transition_table() {
        assert!(is_valid_transition(PoweredOff, Starting));
        assert!(is_valid_transition(Starting, Running));
        assert!(is_valid_transition(Running, Paused));
        assert!(is_valid_transition(Saving, Saved));
        assert!(is_valid_transition(Saved, Restoring));
        assert!(!is_valid_transition(PoweredOff, Running));
        assert!(!is_valid_transition(Running, Running));
        assert!(!is_valid_transition(Running, Snapshotting));
        assert!(!is_valid_transition(SettingUp, PoweredOff));
    }
}
