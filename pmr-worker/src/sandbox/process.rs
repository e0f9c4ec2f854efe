use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Sandbox;
use crate::core::StdoutSink;

/// A sandbox backed by a local Python interpreter.
///
/// Every run is a fresh `python -u -c <script>` child whose working
/// directory is a private temporary directory; that directory is the
/// sandbox's filesystem and is deleted when the sandbox is dropped.
pub struct PythonProcess {
    interpreter: PathBuf,
    root: TempDir,
    ready: bool,
    stdout: StdoutSink,

    /// Cancelled by [`Sandbox::interrupt`], then replaced with a fresh token.
    cancel: Mutex<CancellationToken>,
}

impl PythonProcess {
    /// Create the sandbox and check that the interpreter starts.
    ///
    /// A missing interpreter is not an error here: the sandbox simply
    /// reports that it is not ready.
    pub async fn start(interpreter: impl Into<PathBuf>, stdout: StdoutSink) -> Result<Self> {
        let interpreter = interpreter.into();
        let root = tempfile::Builder::new()
            .prefix("pmr-sandbox-")
            .tempdir()
            .context("failed to create sandbox directory")?;

        let ready = match Command::new(&interpreter).arg("--version").output().await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!(
                    "sandbox ready ({}) in {}",
                    version.trim(),
                    root.path().display()
                );
                true
            }
            Ok(output) => {
                warn!("{} exited with {}", interpreter.display(), output.status);
                false
            }
            Err(e) => {
                warn!("failed to start {}: {e}", interpreter.display());
                false
            }
        };

        Ok(Self {
            interpreter,
            root,
            ready,
            stdout,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Map a sandbox path onto the private directory.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid sandbox path `{path}`");
        }
        Ok(self.root.path().join(relative))
    }
}

#[async_trait]
impl Sandbox for PythonProcess {
    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("failed to write sandbox file `{path}`"))
    }

    async fn run(&self, script: &str) -> Result<()> {
        let token = self.cancel.lock().await.clone();

        let mut child = Command::new(&self.interpreter)
            .arg("-u")
            .arg("-c")
            .arg(script)
            .current_dir(self.root.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.interpreter.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout is not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("child stderr is not captured"))?;

        let sink = self.stdout.clone();
        let collect_stdout = async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut buffer = String::new();
            while let Some(line) = lines.next_line().await? {
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);
                sink.publish(buffer.clone());
            }
            Ok::<_, io::Error>(())
        };

        let log_stderr = async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                warn!("sandbox stderr: {line}");
            }
            Ok::<_, io::Error>(())
        };

        let interrupted = tokio::select! {
            result = async { tokio::try_join!(collect_stdout, log_stderr) } => {
                result?;
                false
            }
            _ = token.cancelled() => true,
        };

        if interrupted {
            child.kill().await?;
            bail!("sandbox run interrupted");
        }

        let status = child.wait().await?;
        if !status.success() {
            bail!("script exited with {status}");
        }
        debug!("script finished");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.resolve(path)?).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read sandbox file `{path}`")),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove sandbox file `{path}`")),
        }
    }

    async fn interrupt(&self) -> Result<()> {
        let mut token = self.cancel.lock().await;
        token.cancel();
        *token = CancellationToken::new();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut removed = 0;
        for entry in WalkDir::new(self.root.path())
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .flatten()
        {
            let result = if entry.file_type().is_dir() {
                std::fs::remove_dir(entry.path())
            } else {
                std::fs::remove_file(entry.path())
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) => debug!("could not remove {}: {e}", entry.path().display()),
            }
        }

        info!("sandbox reset, removed {removed} entries");
        Ok(())
    }
}
