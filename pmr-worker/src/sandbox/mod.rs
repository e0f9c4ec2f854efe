//! The sandboxed interpreter that executes user code, and the runner that
//! sequences every access to it.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use common::ValidationResult;

pub mod process;
#[cfg(test)]
pub mod scripted;

pub use process::PythonProcess;

/// Where code under validation is written.
pub const CODE_FILE: &str = "code.py";

/// Where the validation wrapper leaves the captured exception message.
pub const RESULT_FILE: &str = "is_valid";

/// Where job scripts leave a JSON error payload, one message per code slot.
pub const ERRORS_FILE: &str = "stderr.json";

/// Executes [`CODE_FILE`] and records `str(exception)`, or an empty string
/// when nothing was raised, in [`RESULT_FILE`].
pub const VALIDATION_WRAPPER: &str = r#"
message = ''
try:
    with open('code.py') as code:
        exec(code.read())
except Exception as e:
    message = str(e)
finally:
    with open('is_valid', 'w') as f:
        f.write(message)
"#;

/// An isolated interpreter with a private filesystem.
///
/// Paths are relative to the sandbox's own root. Stdout is not returned by
/// [`Sandbox::run`]; implementations publish their cumulative stdout buffer
/// to a [`crate::StdoutSink`] every time it grows, starting from an empty
/// buffer on every run.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Whether the interpreter can accept work.
    fn is_ready(&self) -> bool;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Run `script` to completion. An interrupted run is an error.
    async fn run(&self, script: &str) -> Result<()>;

    /// Read a file, or `None` if it does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<String>>;

    /// Remove a file. Removing a missing file is not an error.
    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Abort the script currently running, if any.
    async fn interrupt(&self) -> Result<()>;

    /// Remove every file from the sandbox's filesystem.
    async fn reset(&self) -> Result<()>;
}

/// Serialises access to a [`Sandbox`].
///
/// The sandbox's filesystem and stdout are shared mutable state, so at most
/// one write, run or read is in flight at any time. Multi-step operations
/// such as [`SandboxRunner::run_validation`] hold their turn for all steps.
pub struct SandboxRunner<S> {
    sandbox: S,
    turn: Mutex<()>,

    /// Set by an interrupt; the next caller resets the sandbox first.
    dirty: AtomicBool,
}

impl<S: Sandbox> SandboxRunner<S> {
    pub fn new(sandbox: S) -> Self {
        Self {
            sandbox,
            turn: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    pub fn is_ready(&self) -> bool {
        self.sandbox.is_ready()
    }

    /// Wait for our turn, cleaning up after an interrupt if needed.
    async fn begin(&self) -> Result<MutexGuard<'_, ()>> {
        if !self.sandbox.is_ready() {
            bail!("sandbox is not ready");
        }

        let turn = self.turn.lock().await;
        if self.dirty.swap(false, Ordering::SeqCst) {
            info!("resetting sandbox after an interrupted run");
            if let Err(e) = self.sandbox.reset().await {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(turn)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let _turn = self.begin().await?;
        debug!("writing {} bytes to {path}", content.len());
        self.sandbox.write_file(path, content).await
    }

    pub async fn run(&self, script: &str) -> Result<()> {
        let _turn = self.begin().await?;
        debug!("running script ({} bytes)", script.len());
        self.sandbox.run(script).await
    }

    /// Read a file, falling back to `default` when it does not exist yet.
    pub async fn read_file_or(&self, path: &str, default: &str) -> Result<String> {
        let _turn = self.begin().await?;
        let content = self.sandbox.read_file(path).await?;
        if content.is_none() {
            debug!("{path} does not exist yet");
        }
        Ok(content.unwrap_or_else(|| default.to_string()))
    }

    /// Read the error payload a job script left in [`ERRORS_FILE`].
    pub async fn read_errors(&self) -> Result<ValidationResult> {
        let raw = self.read_file_or(ERRORS_FILE, "{}").await?;
        Ok(ValidationResult::from_json_lossy(&raw))
    }

    /// Execute `code` once through [`VALIDATION_WRAPPER`] and return the
    /// message of the exception it raised, or an empty string.
    ///
    /// A run that ends without writing [`RESULT_FILE`] is an error, never a
    /// pass.
    pub async fn run_validation(&self, code: &str) -> Result<String> {
        let _turn = self.begin().await?;

        self.sandbox.remove_file(RESULT_FILE).await?;
        self.sandbox.write_file(CODE_FILE, code).await?;
        self.sandbox.run(VALIDATION_WRAPPER).await?;

        self.sandbox
            .read_file(RESULT_FILE)
            .await?
            .ok_or_else(|| anyhow!("validation run left no {RESULT_FILE}"))
    }

    /// Abort the run in flight without waiting for its turn.
    ///
    /// The sandbox is left in an unknown state and is reset before it is
    /// used again.
    pub async fn interrupt(&self) -> Result<()> {
        info!("interrupting sandbox");
        self.dirty.store(true, Ordering::SeqCst);
        self.sandbox.interrupt().await
    }

    pub async fn reset(&self) -> Result<()> {
        let _turn = self.turn.lock().await;
        self.dirty.store(false, Ordering::SeqCst);
        self.sandbox.reset().await
    }
}
