#![forbid(unsafe_code)]

//! Archiver lifecycle states and the transition table between them.

/// Lifecycle of the log archiver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ArchState {
    /// Never started.
    Init,
    /// A group is being archived.
    Active,
    /// The last client stopped or a copy failed; the group is being finalized.
    PrepareIdle,
    /// Finalized, waiting for the next client.
    Idle,
    /// Shut down.
    Abort,
    /// Archiving is disabled for good.
    ReadOnly,
}

/// Inputs of the archiver state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArchEvent {
    /// A client started archiving.
    ClientStart,
    /// The last attached client stopped.
    LastClientStopped,
    /// Copying log data failed.
    CopyFailed,
    /// The background task finished the group.
    Finalized,
    /// Server shutdown.
    Shutdown,
    /// The server switched to read-only.
    ForceReadOnly,
}

/// Returns the state `event` leads to from `from`, or `None` when the event
/// is not accepted there.
pub fn transition(from: ArchState, event: ArchEvent) -> Option<ArchState> {
    use ArchEvent as E;
    use ArchState as S;
    match (from, event) {
        (_, E::ForceReadOnly) => Some(S::ReadOnly),
        (S::Init | S::Idle, E::ClientStart) => Some(S::Active),
        (S::Active, E::LastClientStopped | E::CopyFailed) => Some(S::PrepareIdle),
        (S::PrepareIdle, E::Finalized) => Some(S::Idle),
        (S::Init | S::Active | S::Idle, E::Shutdown) => Some(S::Abort),
        _ => None,
    }
}
