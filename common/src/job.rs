use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{Message, Phase, ValidationResult};

/// Where a job currently stands on this peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobPhase {
    /// Nothing submitted, or code edited after a failed validation.
    #[default]
    Idle,

    /// Code is being checked in the sandbox.
    Validating,

    /// All three slots passed validation.
    Valid,

    /// At least one slot failed validation.
    Invalid,

    /// Code is running against the local input.
    Executing,

    /// Map output observed.
    MapDone,

    /// Combine output observed.
    CombineDone,

    /// Reduce output observed with reduce keys already assigned.
    ReduceDone,

    /// Job completed.
    Done,
}

impl JobPhase {
    fn is_running(self) -> bool {
        matches!(
            self,
            JobPhase::Executing | JobPhase::MapDone | JobPhase::CombineDone
        )
    }
}

/// The declared set of state mutations.
///
/// Network messages convert into actions one-to-one, so applying a message
/// locally and applying it on the receiving peer go through the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    BeginValidation,
    EditCode,
    BeginExecution,
    MapExecuted,
    SetStdout(String),
    SetStderr(ValidationResult),
    SetReduceKeys(Vec<String>),
    Reset,
}

impl From<Message> for Action {
    fn from(message: Message) -> Self {
        match message {
            Message::SetStdout(stdout) => Action::SetStdout(stdout),
            Message::SetStderr(stderr) => Action::SetStderr(stderr),
            Message::MapExecuted => Action::MapExecuted,
            Message::SetReduceKeys(keys) => Action::SetReduceKeys(keys),
        }
    }
}

/// The job record shared by the execution core and the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobState {
    pub phase: JobPhase,

    /// Job output accumulated from forwarded stdout increments.
    pub stdout: String,

    /// Latest validation outcome.
    pub stderr: ValidationResult,

    /// Keys this peer has been asked to aggregate.
    pub reduce_keys: BTreeSet<String>,

    /// Whether this peer has reported map completion.
    pub map_executed: bool,
}

impl JobState {
    pub fn has_reduce_keys(&self) -> bool {
        !self.reduce_keys.is_empty()
    }

    /// Apply one action. This is the only way the state changes.
    ///
    /// Transitions that are illegal from the current phase are logged and
    /// ignored; payloads carried by the action are still recorded.
    pub fn apply(&mut self, action: &Action) {
        match action {
            Action::BeginValidation => self.transition(
                action,
                matches!(
                    self.phase,
                    JobPhase::Idle | JobPhase::Validating | JobPhase::Valid | JobPhase::Invalid
                ),
                JobPhase::Validating,
            ),
            Action::EditCode => self.transition(
                action,
                matches!(self.phase, JobPhase::Valid | JobPhase::Invalid),
                JobPhase::Idle,
            ),
            Action::BeginExecution => {
                self.transition(action, self.phase == JobPhase::Valid, JobPhase::Executing)
            }
            Action::MapExecuted => {
                self.map_executed = true;
                self.transition(action, self.phase.is_running(), JobPhase::MapDone);
            }
            Action::SetStderr(stderr) => {
                self.stderr = stderr.clone();
                let next = if stderr.is_valid() {
                    JobPhase::Valid
                } else {
                    JobPhase::Invalid
                };
                self.transition(action, self.phase == JobPhase::Validating, next);
            }
            Action::SetStdout(stdout) => {
                self.append_stdout(stdout);
                if let Some(next) = self.phase_from_output(stdout) {
                    self.transition(action, self.phase.is_running(), next);
                }
            }
            Action::SetReduceKeys(keys) => {
                self.reduce_keys.extend(keys.iter().cloned());
            }
            Action::Reset => *self = JobState::default(),
        }
    }

    fn append_stdout(&mut self, stdout: &str) {
        if stdout.is_empty() {
            return;
        }
        if !self.stdout.is_empty() {
            self.stdout.push('\n');
        }
        self.stdout.push_str(stdout);
    }

    /// Reduce completion only counts once reduce keys are known.
    fn phase_from_output(&self, stdout: &str) -> Option<JobPhase> {
        if Phase::Reduce.count_in(stdout) > 0 {
            return self.has_reduce_keys().then_some(JobPhase::ReduceDone);
        }
        if Phase::Combine.count_in(stdout) > 0 {
            return Some(JobPhase::CombineDone);
        }
        if Phase::Map.count_in(stdout) > 0 {
            return Some(JobPhase::MapDone);
        }
        None
    }

    fn transition(&mut self, action: &Action, allowed: bool, next: JobPhase) {
        if !allowed {
            warn!("ignoring {action:?} in phase {:?}", self.phase);
            return;
        }

        debug!("job phase {:?} -> {:?}", self.phase, next);
        self.phase = next;

        // Reduce output is the last thing a job produces.
        if self.phase == JobPhase::ReduceDone {
            self.phase = JobPhase::Done;
        }
    }
}

/// Process-wide container for [`JobState`].
///
/// Cloning the store yields another handle to the same state. Every change
/// goes through [`JobStore::dispatch`] and wakes all subscribers.
#[derive(Debug, Clone)]
pub struct JobStore {
    state: Arc<watch::Sender<JobState>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(JobState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Apply `action` to the state.
    pub fn dispatch(&self, action: impl Into<Action>) {
        let action = action.into();
        self.state.send_modify(|state| state.apply(&action));
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Read the state without copying it.
    pub fn read<R>(&self, f: impl FnOnce(&JobState) -> R) -> R {
        f(&self.state.borrow())
    }

    /// Receive a notification every time the state changes.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid() -> ValidationResult {
        ValidationResult {
            map_code: "name 'x' is not defined".into(),
            ..Default::default()
        }
    }

    fn executing() -> JobState {
        let mut state = JobState::default();
        state.apply(&Action::BeginValidation);
        state.apply(&Action::SetStderr(ValidationResult::default()));
        state.apply(&Action::BeginExecution);
        state
    }

    #[test]
    fn validation_outcomes() {
        let mut state = JobState::default();
        state.apply(&Action::BeginValidation);
        assert_eq!(state.phase, JobPhase::Validating);

        state.apply(&Action::SetStderr(invalid()));
        assert_eq!(state.phase, JobPhase::Invalid);
        assert_eq!(state.stderr, invalid());

        state.apply(&Action::EditCode);
        assert_eq!(state.phase, JobPhase::Idle);

        state.apply(&Action::BeginValidation);
        state.apply(&Action::SetStderr(ValidationResult::default()));
        assert_eq!(state.phase, JobPhase::Valid);
    }

    #[test]
    fn cannot_execute_invalid_code() {
        let mut state = JobState::default();
        state.apply(&Action::BeginValidation);
        state.apply(&Action::SetStderr(invalid()));
        state.apply(&Action::BeginExecution);
        assert_eq!(state.phase, JobPhase::Invalid);
    }

    #[test]
    fn stderr_outside_validation_is_recorded_without_transition() {
        let mut state = JobState::default();
        state.apply(&Action::SetStderr(invalid()));
        assert_eq!(state.phase, JobPhase::Idle);
        assert_eq!(state.stderr, invalid());
    }

    #[test]
    fn map_then_reduce_completes() {
        let mut state = executing();

        state.apply(&Action::MapExecuted);
        assert_eq!(state.phase, JobPhase::MapDone);
        assert!(state.map_executed);

        state.apply(&Action::SetReduceKeys(vec!["k".into()]));
        state.apply(&Action::SetStdout(Phase::Reduce.marker().into()));
        assert_eq!(state.phase, JobPhase::Done);
    }

    #[test]
    fn reduce_output_without_keys_does_not_finish() {
        let mut state = executing();
        state.apply(&Action::SetStdout(Phase::Reduce.marker().into()));
        assert_eq!(state.phase, JobPhase::Executing);
        assert_eq!(state.stdout, Phase::Reduce.marker());
    }

    #[test]
    fn stdout_accumulates_and_tracks_phase() {
        let mut state = executing();
        state.apply(&Action::SetStdout("a 1".into()));
        state.apply(&Action::SetStdout(Phase::Combine.marker().into()));
        assert_eq!(state.stdout, format!("a 1\n{}", Phase::Combine.marker()));
        assert_eq!(state.phase, JobPhase::CombineDone);
    }

    #[test]
    fn reset_clears_everything() {
        let mut state = executing();
        state.apply(&Action::SetReduceKeys(vec!["k".into()]));
        state.apply(&Action::SetStdout("x".into()));
        state.apply(&Action::Reset);
        assert_eq!(state, JobState::default());
    }

    #[test]
    fn messages_convert_to_actions() {
        assert_eq!(Action::from(Message::MapExecuted), Action::MapExecuted);
        assert_eq!(
            Action::from(Message::SetStdout("x".into())),
            Action::SetStdout("x".into())
        );
    }

    #[tokio::test]
    async fn store_notifies_subscribers() {
        let store = JobStore::new();
        let mut changes = store.subscribe();

        store.dispatch(Action::SetReduceKeys(vec!["a".into(), "b".into()]));
        changes.changed().await.unwrap();

        assert_eq!(changes.borrow().reduce_keys.len(), 2);
        assert!(store.read(JobState::has_reduce_keys));
        assert_eq!(store.snapshot().reduce_keys.len(), 2);
    }
}
