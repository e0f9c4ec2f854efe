use common::{Phase, PhaseEvent};

/// The parts of the job and session state the detector looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobView {
    /// Local input files not mapped yet.
    pub pending_files: usize,

    /// Whether the coordinator has assigned any reduce keys.
    pub has_reduce_keys: bool,
}

/// What to do with a stdout increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Map or combine output with no local input left: the map phase is
    /// over on this peer. Nothing is forwarded.
    MapExecuted,

    /// Reduce output before any reduce keys are known. The increment is not
    /// a job-level event yet.
    Suppressed,

    /// Forward `payload` (the matched markers, if any) to the coordinator
    /// and append `increment` to the local job output.
    Forward {
        payload: Option<String>,
        increment: String,
    },
}

/// Find every phase marker in `increment`, in map, combine, reduce order.
pub fn scan(increment: &str) -> Vec<PhaseEvent> {
    Phase::ALL
        .iter()
        .filter_map(|phase| PhaseEvent::find(*phase, increment))
        .collect()
}

/// Decide how an increment affects the job.
pub fn classify(increment: &str, view: &JobView) -> Detection {
    let events = scan(increment);
    let seen = |phase: Phase| events.iter().any(|event| event.phase == phase);

    if (seen(Phase::Map) || seen(Phase::Combine)) && view.pending_files == 0 {
        return Detection::MapExecuted;
    }

    if seen(Phase::Reduce) && !view.has_reduce_keys {
        return Detection::Suppressed;
    }

    let payload = (!events.is_empty()).then(|| {
        events
            .iter()
            .map(|event| event.matched.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    });

    Detection::Forward {
        payload,
        increment: increment.to_string(),
    }
}
