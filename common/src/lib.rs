//! Shared types for peers that jointly run a user-authored Map/Combine/Reduce
//! job. One peer acts as the coordinator, the others as workers; every peer
//! executes the submitted code in its own sandbox and reports back over a
//! peer-to-peer channel.

use std::fmt;
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod job;
pub mod message;

pub use job::{Action, JobPhase, JobState, JobStore};
pub use message::{ChannelMessenger, Message, Messenger, PeerId};

/////////////////////////////////////////////////////////////////////////////
// User code
/////////////////////////////////////////////////////////////////////////////

/// The function bodies submitted by the user.
///
/// `combiner_code` may be empty, in which case the combine step is skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Code {
    pub map_code: String,
    pub combiner_code: String,
    pub reduce_code: String,
}

impl Code {
    pub fn new(
        map_code: impl Into<String>,
        combiner_code: impl Into<String>,
        reduce_code: impl Into<String>,
    ) -> Self {
        Self {
            map_code: map_code.into(),
            combiner_code: combiner_code.into(),
            reduce_code: reduce_code.into(),
        }
    }

    /// The source held in the given slot.
    pub fn slot(&self, slot: Slot) -> &str {
        match slot {
            Slot::Map => &self.map_code,
            Slot::Combiner => &self.combiner_code,
            Slot::Reduce => &self.reduce_code,
        }
    }
}

/// One of the three code slots of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Map,
    Combiner,
    Reduce,
}

impl Slot {
    /// All slots, in the order they are validated.
    pub const ALL: [Slot; 3] = [Slot::Map, Slot::Combiner, Slot::Reduce];
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::Map => "map",
            Slot::Combiner => "combiner",
            Slot::Reduce => "reduce",
        };
        f.write_str(name)
    }
}

/// Per-slot validation errors. An empty string means the slot is valid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationResult {
    pub map_code: String,
    pub combiner_code: String,
    pub reduce_code: String,
}

impl ValidationResult {
    /// The result is valid iff every slot's error string is empty.
    pub fn is_valid(&self) -> bool {
        Slot::ALL.iter().all(|slot| self.slot(*slot).is_empty())
    }

    pub fn slot(&self, slot: Slot) -> &str {
        match slot {
            Slot::Map => &self.map_code,
            Slot::Combiner => &self.combiner_code,
            Slot::Reduce => &self.reduce_code,
        }
    }

    pub fn set_slot(&mut self, slot: Slot, error: impl Into<String>) {
        let error = error.into();
        match slot {
            Slot::Map => self.map_code = error,
            Slot::Combiner => self.combiner_code = error,
            Slot::Reduce => self.reduce_code = error,
        }
    }

    /// Parse an error payload written by the sandbox.
    ///
    /// Missing fields default to empty. A payload that is not valid JSON
    /// yields an all-empty result instead of an error.
    pub fn from_json_lossy(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(result) => result,
            Err(e) => {
                debug!("discarding malformed error payload: {e}");
                Self::default()
            }
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Phase markers
/////////////////////////////////////////////////////////////////////////////

/// A job phase that reports completion through a marker line on stdout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Map,
    Combine,
    Reduce,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Map, Phase::Combine, Phase::Reduce];

    /// The fixed line printed by executed user code when the phase succeeds.
    pub const fn marker(self) -> &'static str {
        match self {
            Phase::Map => "MAP EJECUTADO SATISFACTORIAMENTE",
            Phase::Combine => "COMBINE EJECUTADO SATISFACTORIAMENTE",
            Phase::Reduce => "REDUCE EJECUTADO SATISFACTORIAMENTE",
        }
    }

    /// Count the occurrences of this phase's marker in `text`.
    pub fn count_in(self, text: &str) -> usize {
        text.matches(self.marker()).count()
    }
}

/// Completion of one phase as observed in a stdout increment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: Phase,

    /// How many times the marker occurred (batch execution over several records).
    pub count: usize,

    /// The matched marker occurrences, newline-joined.
    pub matched: String,
}

impl PhaseEvent {
    /// Build the event for `phase` from `text`, or `None` if the marker is absent.
    pub fn find(phase: Phase, text: &str) -> Option<Self> {
        let count = phase.count_in(text);
        if count == 0 {
            return None;
        }

        Some(Self {
            phase,
            count,
            matched: vec![phase.marker(); count].join("\n"),
        })
    }
}
