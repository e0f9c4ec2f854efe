use common::PeerId;

/// What the room layer tells the execution core about the session.
///
/// The room layer owns the sending side of the watch channel; the core only
/// ever reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSession {
    /// The peer that aggregates results and assigns reduce keys.
    pub coordinator: PeerId,

    /// Local input files that have not been mapped yet.
    pub pending_files: usize,
}

impl RoomSession {
    pub fn new(coordinator: PeerId, pending_files: usize) -> Self {
        Self {
            coordinator,
            pending_files,
        }
    }

    pub fn has_files(&self) -> bool {
        self.pending_files > 0
    }
}
