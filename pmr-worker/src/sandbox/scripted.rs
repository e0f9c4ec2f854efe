//! In-memory sandbox with scripted behaviour, for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Sandbox, CODE_FILE, RESULT_FILE, VALIDATION_WRAPPER};
use crate::core::StdoutSink;

pub struct ScriptedSandbox {
    sink: StdoutSink,
    ready: bool,
    files: Mutex<HashMap<String, String>>,

    /// Exception text raised when the validation wrapper executes this code.
    failures: HashMap<String, String>,

    /// Cumulative stdout samples published by upcoming runs, one entry per run.
    outputs: Mutex<VecDeque<Vec<String>>>,

    /// Every run blocks until the sandbox is interrupted.
    hang: bool,
    started: Notify,
    released: Notify,

    /// The next validation run leaves no result behind.
    skip_result: AtomicBool,

    runs: Mutex<Vec<String>>,
    interrupted: AtomicBool,
    resets: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new(sink: StdoutSink) -> Self {
        Self {
            sink,
            ready: true,
            files: Mutex::default(),
            failures: HashMap::new(),
            outputs: Mutex::default(),
            hang: false,
            started: Notify::new(),
            released: Notify::new(),
            skip_result: AtomicBool::new(false),
            runs: Mutex::default(),
            interrupted: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn fail_on(&mut self, code: &str, message: &str) {
        self.failures.insert(code.to_string(), message.to_string());
    }

    pub fn hang_until_interrupted(&mut self) {
        self.hang = true;
    }

    /// Wait until a hanging run has started.
    pub async fn wait_for_run(&self) {
        self.started.notified().await;
    }

    pub fn skip_result_on_next_run(&self) {
        self.skip_result.store(true, Ordering::SeqCst);
    }

    pub fn emit_on_next_run(&self, samples: &[&str]) {
        let samples = samples.iter().map(|s| s.to_string()).collect();
        self.outputs.lock().unwrap().push_back(samples);
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn run(&self, script: &str) -> Result<()> {
        self.runs.lock().unwrap().push(script.to_string());

        if self.hang {
            self.started.notify_one();
            self.released.notified().await;
            bail!("sandbox run interrupted");
        }

        let skip_result = self.skip_result.swap(false, Ordering::SeqCst);
        if script == VALIDATION_WRAPPER && !skip_result {
            let mut files = self.files.lock().unwrap();
            let code = files.get(CODE_FILE).cloned().unwrap_or_default();
            let message = self.failures.get(&code).cloned().unwrap_or_default();
            files.insert(RESULT_FILE.to_string(), message);
        }

        let samples = self.outputs.lock().unwrap().pop_front();
        for sample in samples.into_iter().flatten() {
            self.sink.publish(sample);
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self.file(path))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::SeqCst);
        self.released.notify_one();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().clear();
        Ok(())
    }
}
