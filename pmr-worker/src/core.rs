use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use common::{Action, Code, JobPhase, JobState, JobStore, Message, Messenger, ValidationResult};

use crate::propagate::Propagator;
use crate::reconcile::StdoutHistory;
use crate::sandbox::{Sandbox, SandboxRunner};
use crate::session::RoomSession;
use crate::signal::{self, Detection, JobView};
use crate::validator::CodeValidator;

/// Notifications consumed by the [`ProcessingLoop`], in arrival order.
#[derive(Debug)]
pub enum Event {
    /// The sandbox's cumulative stdout changed.
    Stdout(String),

    /// The job was reset; forget the reconciled transcript.
    Reset,

    /// Answered once every event queued before it has been handled.
    Flush(oneshot::Sender<()>),

    /// Stop processing.
    Shutdown,
}

/// Where a sandbox publishes its cumulative stdout samples.
#[derive(Debug, Clone)]
pub struct StdoutSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl StdoutSink {
    /// Publish the whole stdout buffer as it currently stands.
    pub fn publish(&self, sample: impl Into<String>) {
        self.send(Event::Stdout(sample.into()));
    }

    pub(crate) fn send(&self, event: Event) -> bool {
        let delivered = self.sender.send(event).is_ok();
        if !delivered {
            debug!("processing loop is gone, dropping event");
        }
        delivered
    }
}

/// Create the event channel shared by a sandbox and the processing loop.
pub fn event_channel() -> (StdoutSink, mpsc::UnboundedReceiver<Event>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (StdoutSink { sender }, receiver)
}

/////////////////////////////////////////////////////////////////////////////
// Worker
/////////////////////////////////////////////////////////////////////////////

/// Handle to a worker peer's execution core.
pub struct Worker<S, M> {
    runner: Arc<SandboxRunner<S>>,
    validator: CodeValidator<S>,
    propagator: Arc<Propagator<M>>,
    store: JobStore,
    events: StdoutSink,
}

impl<S, M> Worker<S, M>
where
    S: Sandbox + 'static,
    M: Messenger + 'static,
{
    /// Wire a worker around `sandbox`.
    ///
    /// `events` must be the receiving side of the channel whose sink was
    /// handed to `sandbox`. The returned loop has to be driven (usually on
    /// its own task) for stdout to be reconciled.
    pub fn new(
        sandbox: S,
        messenger: M,
        store: JobStore,
        session: watch::Receiver<RoomSession>,
        sink: StdoutSink,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Result<(Self, ProcessingLoop<M>)> {
        let runner = Arc::new(SandboxRunner::new(sandbox));
        let propagator = Arc::new(Propagator::new(
            Arc::new(messenger),
            store.clone(),
            session.clone(),
        ));

        let worker = Self {
            validator: CodeValidator::new(runner.clone())?,
            runner,
            propagator: propagator.clone(),
            store: store.clone(),
            events: sink,
        };

        let processing = ProcessingLoop {
            events,
            history: StdoutHistory::default(),
            state: store.subscribe(),
            store,
            session,
            propagator,
        };

        Ok((worker, processing))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn runner(&self) -> &SandboxRunner<S> {
        &self.runner
    }

    /// Validate `code` and publish the outcome locally and to the coordinator.
    ///
    /// The outcome is published even when every slot is valid, so the
    /// coordinator drops any error it still shows for this peer.
    pub async fn validate(&self, code: &Code) -> Result<bool> {
        self.store.dispatch(Action::BeginValidation);

        let result = self.validator.validate(code).await?;
        let valid = result.is_valid();
        info!("code validation finished, valid = {valid}");

        self.propagator.publish(Message::SetStderr(result)).await?;
        Ok(valid)
    }

    /// Re-read the error payload a job script left in the sandbox and
    /// publish it. Returns the parsed payload.
    pub async fn read_errors(&self) -> Result<ValidationResult> {
        let errors = self.runner.read_errors().await?;
        self.propagator
            .publish(Message::SetStderr(errors.clone()))
            .await?;
        Ok(errors)
    }

    /// The user changed the code after a validation.
    pub fn edit_code(&self) {
        self.store.dispatch(Action::EditCode);
    }

    /// Write a file into the sandbox.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.runner.write_file(path, content).await
    }

    /// Run a job script. Its stdout reaches the processing loop as it is
    /// produced.
    ///
    /// Returns once the loop has handled all of the run's output, so
    /// changes made to the session afterwards never affect how that output
    /// is classified. The processing loop must be running.
    pub async fn execute(&self, script: &str) -> Result<()> {
        if self.store.read(|state| state.phase == JobPhase::Valid) {
            self.store.dispatch(Action::BeginExecution);
        }
        self.runner.run(script).await?;
        self.drained().await;
        Ok(())
    }

    /// Wait for the processing loop to catch up with every queued sample.
    pub async fn drained(&self) {
        let (done, wait) = oneshot::channel();
        if self.events.send(Event::Flush(done)) {
            // An error only means the loop stopped first.
            let _ = wait.await;
        }
    }

    /// Abort whatever the sandbox is running.
    pub async fn interrupt(&self) -> Result<()> {
        self.runner.interrupt().await
    }

    /// Clear the sandbox, the job state and the reconciled transcript.
    pub async fn reset(&self) -> Result<()> {
        self.runner.reset().await?;
        self.store.dispatch(Action::Reset);
        self.events.send(Event::Reset);
        Ok(())
    }

    /// Ask the processing loop to stop once it has handled every event
    /// queued so far.
    pub fn shutdown(&self) {
        self.events.send(Event::Shutdown);
    }
}

/////////////////////////////////////////////////////////////////////////////
// Processing loop
/////////////////////////////////////////////////////////////////////////////

/// Single-threaded consumer of stdout samples.
///
/// Samples are merged strictly in arrival order. An increment that cannot
/// be handled yet (reduce output before reduce keys are known, or a failed
/// send) stays pending and is looked at again whenever the session or the
/// job state changes.
pub struct ProcessingLoop<M> {
    events: mpsc::UnboundedReceiver<Event>,
    history: StdoutHistory,
    store: JobStore,
    state: watch::Receiver<JobState>,
    session: watch::Receiver<RoomSession>,
    propagator: Arc<Propagator<M>>,
}

impl<M: Messenger> ProcessingLoop<M> {
    pub fn history(&self) -> &StdoutHistory {
        &self.history
    }

    pub async fn run(mut self) {
        info!("stdout processing loop started");

        loop {
            tokio::select! {
                biased;

                event = self.events.recv() => match event {
                    Some(Event::Stdout(sample)) => self.on_stdout(&sample).await,
                    Some(Event::Reset) => {
                        debug!("forgetting reconciled stdout");
                        self.history.reset();
                    }
                    Some(Event::Flush(done)) => {
                        let _ = done.send(());
                    }
                    Some(Event::Shutdown) | None => break,
                },
                Ok(()) = self.session.changed() => self.process_increment().await,
                Ok(()) = self.state.changed() => self.process_increment().await,
            }
        }

        info!("stdout processing loop stopped");
    }

    async fn on_stdout(&mut self, sample: &str) {
        if self.history.observe(sample) {
            debug!(
                "reconciled {} new bytes of stdout",
                self.history.new_stdout.len()
            );
            self.process_increment().await;
        }
    }

    async fn process_increment(&mut self) {
        let Some(increment) = self.history.pending().map(str::to_owned) else {
            return;
        };

        let view = JobView {
            pending_files: self.session.borrow().pending_files,
            has_reduce_keys: self.store.read(JobState::has_reduce_keys),
        };

        match signal::classify(&increment, &view) {
            Detection::MapExecuted => {
                info!("local input exhausted, map executed");
                self.propagator.apply(Action::MapExecuted).await;
                self.history.mark_processed();
            }
            Detection::Suppressed => {
                debug!("holding reduce output until reduce keys are assigned");
            }
            Detection::Forward { payload, increment } => {
                if let Some(payload) = payload {
                    if let Err(e) = self.propagator.send(&Message::SetStdout(payload)).await {
                        error!("failed to forward phase markers: {e:#}");
                        return;
                    }
                }
                self.propagator.apply(Action::SetStdout(increment)).await;
                self.history.mark_processed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{ChannelMessenger, PeerId, Phase};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::sandbox::scripted::ScriptedSandbox;

    const FMAP: &str = "def fmap(value):\n    return [(value, 1)]";
    const FRED: &str = "def fred(key, values):\n    return sum(values)";

    struct Harness {
        worker: Worker<ScriptedSandbox, ChannelMessenger>,
        outbox: mpsc::UnboundedReceiver<(PeerId, Message)>,
        session: watch::Sender<RoomSession>,
        processing: JoinHandle<()>,
    }

    impl Harness {
        fn new(pending_files: usize, configure: impl FnOnce(&mut ScriptedSandbox)) -> Self {
            let (sink, events) = event_channel();
            let mut sandbox = ScriptedSandbox::new(sink.clone());
            configure(&mut sandbox);

            let (messenger, outbox) = ChannelMessenger::new();
            let (session, session_rx) =
                watch::channel(RoomSession::new(PeerId::new("owner"), pending_files));
            let (worker, processing) =
                Worker::new(sandbox, messenger, JobStore::new(), session_rx, sink, events).unwrap();

            Self {
                worker,
                outbox,
                session,
                processing: tokio::spawn(processing.run()),
            }
        }

        /// Stop the loop after it has drained every queued event.
        async fn settle(self) -> (Worker<ScriptedSandbox, ChannelMessenger>, Vec<Message>) {
            let Harness {
                worker,
                mut outbox,
                processing,
                ..
            } = self;
            worker.shutdown();
            processing.await.unwrap();

            let mut sent = Vec::new();
            while let Ok((peer, message)) = outbox.try_recv() {
                assert_eq!(peer, PeerId::new("owner"));
                sent.push(message);
            }
            (worker, sent)
        }
    }

    #[tokio::test]
    async fn validation_publishes_result_even_when_valid() {
        let mut harness = Harness::new(1, |_| {});
        let code = Code::new(FMAP, "", FRED);

        assert!(harness.worker.validate(&code).await.unwrap());
        assert_eq!(
            harness.outbox.recv().await.unwrap().1,
            Message::SetStderr(ValidationResult::default())
        );
        assert_eq!(harness.worker.store().snapshot().phase, JobPhase::Valid);
    }

    #[tokio::test]
    async fn execution_error_marks_job_invalid() {
        let mut harness = Harness::new(1, |sandbox| {
            sandbox.fail_on(FMAP, "name 'undefined_name' is not defined");
        });
        let code = Code::new(FMAP, "", FRED);

        assert!(!harness.worker.validate(&code).await.unwrap());
        let (_, message) = harness.outbox.recv().await.unwrap();
        let Message::SetStderr(result) = message else {
            panic!("unexpected message {message:?}");
        };
        assert_eq!(result.map_code, "name 'undefined_name' is not defined");
        assert_eq!(harness.worker.store().snapshot().phase, JobPhase::Invalid);
    }

    #[tokio::test]
    async fn map_marker_without_files_left_is_local_only() {
        let harness = Harness::new(0, |sandbox| {
            sandbox.emit_on_next_run(&[Phase::Map.marker()]);
        });
        harness.worker.execute("run map").await.unwrap();

        let (worker, sent) = harness.settle().await;
        assert!(sent.is_empty());
        assert!(worker.store().snapshot().map_executed);
    }

    #[tokio::test]
    async fn markers_are_forwarded_while_files_remain() {
        let sample = format!("a 1\n{}\n{}", Phase::Map.marker(), Phase::Combine.marker());
        let harness = Harness::new(2, |sandbox| {
            sandbox.emit_on_next_run(&["a 1", sample.as_str()]);
        });
        harness.worker.execute("run map").await.unwrap();

        let (worker, sent) = harness.settle().await;
        assert_eq!(
            sent,
            vec![Message::SetStdout(format!(
                "{}\n{}",
                Phase::Map.marker(),
                Phase::Combine.marker()
            ))]
        );
        assert_eq!(worker.store().snapshot().stdout, sample);
    }

    #[tokio::test]
    async fn reduce_output_waits_for_reduce_keys() {
        let sample = format!("{}\n{}", Phase::Reduce.marker(), Phase::Reduce.marker());
        let mut harness = Harness::new(0, |sandbox| {
            sandbox.emit_on_next_run(&[sample.as_str()]);
        });
        harness.worker.execute("run reduce").await.unwrap();

        // Nothing goes out while no keys are known.
        tokio::task::yield_now().await;
        assert!(harness.outbox.try_recv().is_err());

        harness
            .worker
            .store()
            .dispatch(Message::SetReduceKeys(vec!["a".into()]));
        let (_, message) = harness.outbox.recv().await.unwrap();
        assert_eq!(message, Message::SetStdout(sample.clone()));

        let (worker, sent) = harness.settle().await;
        assert!(sent.is_empty());
        assert_eq!(worker.store().snapshot().stdout, sample);
    }

    #[tokio::test]
    async fn repeated_samples_are_processed_once() {
        let harness = Harness::new(3, |sandbox| {
            let marker = Phase::Map.marker();
            sandbox.emit_on_next_run(&[marker, marker, marker]);
        });
        harness.worker.execute("run map").await.unwrap();
        harness.session.send_modify(|session| session.pending_files = 2);

        let (worker, sent) = harness.settle().await;
        assert_eq!(sent, vec![Message::SetStdout(Phase::Map.marker().into())]);
        assert_eq!(worker.store().snapshot().stdout, Phase::Map.marker());
    }

    #[tokio::test]
    async fn interrupted_validation_publishes_nothing() {
        let mut harness = Harness::new(1, |sandbox| sandbox.hang_until_interrupted());
        let code = Code::new(FMAP, "", FRED);

        let worker = &harness.worker;
        let (validated, interrupted) = tokio::join!(worker.validate(&code), async {
            worker.runner().sandbox().wait_for_run().await;
            worker.interrupt().await
        });

        interrupted.unwrap();
        assert!(validated.is_err());
        assert!(harness.outbox.try_recv().is_err());

        let state = harness.worker.store().snapshot();
        assert_eq!(state.phase, JobPhase::Validating);
        assert_eq!(state.stderr, ValidationResult::default());
    }

    #[tokio::test]
    async fn reduce_keys_survive_the_previous_transcript() {
        let harness = Harness::new(0, |sandbox| {
            sandbox.emit_on_next_run(&[&format!("map batch 0: 1 records\n{}", Phase::Map.marker())]);
            sandbox.emit_on_next_run(&[
                "reduce run",
                "reduce run\nElephant 3",
                &format!("reduce run\nElephant 3\n{}", Phase::Reduce.marker()),
            ]);
        });
        harness
            .worker
            .store()
            .dispatch(Message::SetReduceKeys(vec!["Elephant".into()]));

        harness.worker.execute("run map").await.unwrap();
        harness.worker.execute("run reduce").await.unwrap();

        let (worker, sent) = harness.settle().await;
        assert_eq!(sent, vec![Message::SetStdout(Phase::Reduce.marker().into())]);
        assert_eq!(
            worker.store().snapshot().stdout,
            format!("reduce run\nElephant 3\n{}", Phase::Reduce.marker())
        );
    }

    #[tokio::test]
    async fn reset_clears_sandbox_and_state() {
        let harness = Harness::new(1, |sandbox| {
            sandbox.emit_on_next_run(&["first run"]);
        });
        let mut state = harness.worker.store().subscribe();
        harness.worker.execute("run").await.unwrap();
        state
            .wait_for(|state| state.stdout == "first run")
            .await
            .unwrap();
        harness.worker.reset().await.unwrap();

        let (worker, _) = harness.settle().await;
        assert_eq!(worker.store().snapshot(), JobState::default());
        assert_eq!(worker.runner().sandbox().resets(), 1);
    }
}
